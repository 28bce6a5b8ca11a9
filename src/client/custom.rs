//! Application-defined callbacks.
//!
//! The server can host up to [`CUSTOM_CB_COUNT`] callbacks, each identified
//! by a small integer carried in the action field. A client can ask whether
//! one is registered before invoking it; "not registered" is an ordinary
//! answer, not a failure.
use crate::protocol::{
    ErrorCode, Kind, Transport,
    header::{encode_body, group},
    message::{
        CUSTOM_CB_COUNT, CUSTOM_INVOKE, CUSTOM_QUERY, CUSTOM_REQUEST_SIZE, CustomRequest,
        CustomResponse,
    },
};

use super::{Client, ClientError, Operation, ensure_fits, parse, parse_plain, result_code};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackStatus {
    Registered,
    NoHandler,
}

/// What a callback handed back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomReply {
    /// The handler's own return code.
    pub err: i32,
    pub data: Vec<u8>,
}

fn check_id(id: u16) -> Result<(), ClientError> {
    if id >= CUSTOM_CB_COUNT {
        return Err(ClientError::InvalidArgument(format!(
            "callback id {id} is outside 0..{CUSTOM_CB_COUNT}"
        )));
    }
    Ok(())
}

pub struct CustomCheckRegistered(pub u16);

impl Operation for CustomCheckRegistered {
    type Output = CallbackStatus;

    fn kind(&self) -> Kind {
        Kind::new(group::CUSTOM, self.0)
    }

    fn encode(&self, _: usize) -> Result<Vec<u8>, ClientError> {
        check_id(self.0)?;
        Ok(encode_body(&CustomRequest { kind: CUSTOM_QUERY }, &[])?)
    }

    fn decode(self, payload: &[u8]) -> Result<Self::Output, ClientError> {
        match result_code(payload)? {
            ErrorCode::Ok => {
                let _: (CustomResponse, _) = parse_plain(payload)?;
                Ok(CallbackStatus::Registered)
            }
            ErrorCode::NoHandler => Ok(CallbackStatus::NoHandler),
            code => Err(ClientError::Server(code)),
        }
    }
}

pub struct CustomCall<'a> {
    pub id: u16,
    pub data: &'a [u8],
}

impl Operation for CustomCall<'_> {
    type Output = CustomReply;

    fn kind(&self) -> Kind {
        Kind::new(group::CUSTOM, self.id)
    }

    fn encode(&self, max_payload: usize) -> Result<Vec<u8>, ClientError> {
        check_id(self.id)?;
        ensure_fits(
            "callback input",
            self.data.len(),
            max_payload.saturating_sub(CUSTOM_REQUEST_SIZE),
        )?;
        Ok(encode_body(
            &CustomRequest {
                kind: CUSTOM_INVOKE,
            },
            self.data,
        )?)
    }

    fn decode(self, payload: &[u8]) -> Result<Self::Output, ClientError> {
        let (resp, data): (CustomResponse, _) = parse(payload)?;
        Ok(CustomReply {
            err: resp.err,
            data: data.to_vec(),
        })
    }
}

impl<T: Transport> Client<T> {
    pub fn custom_check_registered(&mut self, id: u16) -> Result<CallbackStatus, ClientError> {
        self.execute(CustomCheckRegistered(id))
    }

    pub fn custom_call(&mut self, id: u16, data: &[u8]) -> Result<CustomReply, ClientError> {
        self.execute(CustomCall { id, data })
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        ClientConfig, ServerConfig, client::testing::session, protocol::Loopback,
        server::HsmServer,
    };

    use super::*;

    #[test]
    fn check_before_open_reports_the_refusal() {
        let channel = Loopback::new(HsmServer::new(ServerConfig::default()));
        let mut client = Client::connect(channel, ClientConfig::default()).unwrap();

        let err = client.custom_check_registered(2).unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::Aborted));
        assert!(!err.is_fatal());
    }

    #[test]
    fn unregistered_id_reports_no_handler() {
        let mut client = session();
        assert_eq!(
            client.custom_check_registered(3).unwrap(),
            CallbackStatus::NoHandler
        );
    }

    #[test]
    fn registered_callback_runs() {
        let mut client = session();
        client
            .transport()
            .handler()
            .register_custom(2, |input: &[u8]| Ok(input.iter().rev().copied().collect()))
            .unwrap();

        assert_eq!(
            client.custom_check_registered(2).unwrap(),
            CallbackStatus::Registered
        );
        assert_eq!(
            client.custom_call(2, b"abc").unwrap(),
            CustomReply {
                err: 0,
                data: b"cba".to_vec()
            }
        );
    }

    #[test]
    fn handler_error_is_reported_not_raised() {
        let mut client = session();
        client
            .transport()
            .handler()
            .register_custom(1, |_: &[u8]| Err(-17))
            .unwrap();

        let reply = client.custom_call(1, b"").unwrap();
        assert_eq!(reply.err, -17);
    }

    #[test]
    fn invoking_missing_callback_fails() {
        let mut client = session();
        assert_eq!(
            client.custom_call(4, b"x").unwrap_err().code(),
            Some(ErrorCode::NoHandler)
        );
    }

    #[test]
    fn id_out_of_range() {
        let mut client = session();
        assert!(matches!(
            client.custom_check_registered(CUSTOM_CB_COUNT),
            Err(ClientError::InvalidArgument(_))
        ));
    }
}
