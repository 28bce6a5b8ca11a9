//! Session handshake and liveness.
//!
//! [`Client::open`] must be the first exchange on a fresh channel; the server
//! refuses the other protocol families until it has seen it. [`Client::close`]
//! is the symmetric teardown. Neither touches the channel itself, so a caller
//! disconnects after closing.
use log::info;

use crate::protocol::{
    Kind, Transport,
    header::{action, group},
    message::CommInitResponse,
};

use super::{Client, ClientError, Operation, ensure_fits, parse_plain};

/// Identities exchanged by the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionIds {
    pub client_id: u32,
    pub server_id: u32,
}

pub struct CommInit;

impl Operation for CommInit {
    type Output = SessionIds;

    fn kind(&self) -> Kind {
        Kind::new(group::COMM, action::comm::INIT)
    }

    fn encode(&self, _: usize) -> Result<Vec<u8>, ClientError> {
        Ok(Vec::new())
    }

    fn decode(self, payload: &[u8]) -> Result<Self::Output, ClientError> {
        let (resp, _): (CommInitResponse, _) = parse_plain(payload)?;
        Ok(SessionIds {
            client_id: resp.client_id,
            server_id: resp.server_id,
        })
    }
}

pub struct CommClose;

impl Operation for CommClose {
    type Output = ();

    fn kind(&self) -> Kind {
        Kind::new(group::COMM, action::comm::CLOSE)
    }

    fn encode(&self, _: usize) -> Result<Vec<u8>, ClientError> {
        Ok(Vec::new())
    }

    fn decode(self, _: &[u8]) -> Result<Self::Output, ClientError> {
        Ok(())
    }
}

/// The server sends the payload straight back.
pub struct Echo<'a>(pub &'a [u8]);

impl Operation for Echo<'_> {
    type Output = Vec<u8>;

    fn kind(&self) -> Kind {
        Kind::new(group::COMM, action::comm::ECHO)
    }

    fn encode(&self, max_payload: usize) -> Result<Vec<u8>, ClientError> {
        ensure_fits("echo payload", self.0.len(), max_payload)?;
        Ok(self.0.to_vec())
    }

    fn decode(self, payload: &[u8]) -> Result<Self::Output, ClientError> {
        Ok(payload.to_vec())
    }
}

impl<T: Transport> Client<T> {
    pub fn open(&mut self) -> Result<SessionIds, ClientError> {
        let ids = self.execute(CommInit)?;
        info!(
            "session open: client {:#x}, server {:#x}",
            ids.client_id, ids.server_id
        );
        Ok(ids)
    }

    pub fn close(&mut self) -> Result<(), ClientError> {
        self.execute(CommClose)?;
        info!("session closed");
        Ok(())
    }

    pub fn echo(&mut self, data: &[u8]) -> Result<Vec<u8>, ClientError> {
        self.execute(Echo(data))
    }
}
