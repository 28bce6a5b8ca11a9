//! Request/response client.
//!
//! The [`Client`] owns a [`Transport`] and enforces the channel's one rule: a
//! single request outstanding at a time. Each request gets a fresh sequence
//! number and its response must come back with the same sequence, group and
//! action; anything else is a correlation failure and ends the session.
//!
//! # Overview
//!
//! Higher level protocols are expressed as [`Operation`]s, a request encoder
//! paired with a response decoder. An operation can be driven two ways:
//!
//! - [`Client::execute`] sends it and blocks until the response is decoded.
//! - [`Client::start`] sends it and returns a [`Pending`] handle whose
//!   [`Pending::poll`] reports "not ready" until the response arrives.
//!
//! The protocol families live in submodules and add convenience methods on
//! [`Client`]: session handshake and echo ([`comm`]), key lifecycle ([`key`]),
//! object storage ([`nvm`]), custom callbacks ([`custom`]) and the algorithm
//! pass-through ([`crypto`]). Direct-memory storage access sits behind
//! [`Client::dma`] in [`dma`], away from the default surface.
//!
//! # Session State
//!
//! `Idle -> AwaitingResponse -> Idle` for every successful exchange. Receive
//! failures, correlation mismatches and undecodable envelopes move the
//! session to `Failed`; server result codes and local validation errors do not.
//!
//! # Example
//! ```rust
//! use hsmlink::{Client, ClientConfig, ServerConfig, protocol::Loopback, server::HsmServer};
//!
//! let channel = Loopback::new(HsmServer::new(ServerConfig::default()));
//! let mut client = Client::connect(channel, ClientConfig::default()).unwrap();
//!
//! let ids = client.open().unwrap();
//! assert_eq!(client.echo(b"ping").unwrap(), b"ping");
//! client.close().unwrap();
//! # let _ = ids;
//! ```
use std::{hint, thread};

use bincode::Decode;
use log::{debug, trace, warn};

use crate::{
    config::{ClientConfig, PollStrategy},
    protocol::{
        ErrorCode, Header, Issued, Kind, Transport,
        header::{HEADER_SIZE, decode_body},
        message::RC_SIZE,
    },
};

pub mod comm;
pub mod crypto;
pub mod custom;
pub mod dma;
pub mod key;
pub mod nvm;

mod error;

pub use error::ClientError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    AwaitingResponse(Issued),
    Failed,
    Closed,
}

/// A request builder paired with its response parser.
pub trait Operation {
    type Output;

    fn kind(&self) -> Kind;

    /// Request payload. Inputs that cannot fit `max_payload` are rejected here,
    /// before anything is sent.
    fn encode(&self, max_payload: usize) -> Result<Vec<u8>, ClientError>;

    fn decode(self, payload: &[u8]) -> Result<Self::Output, ClientError>;
}

pub struct Client<T: Transport> {
    transport: T,
    config: ClientConfig,
    last_issued: Option<Issued>,
    state: SessionState,
}

impl<T: Transport> Client<T> {
    /// Wraps an already connected transport.
    pub fn new(transport: T, config: ClientConfig) -> Self {
        Self {
            transport,
            config,
            last_issued: None,
            state: SessionState::Idle,
        }
    }

    pub fn connect(mut transport: T, config: ClientConfig) -> Result<Self, ClientError> {
        transport.connect()?;
        Ok(Self::new(transport, config))
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn last_issued(&self) -> Option<Issued> {
        self.last_issued
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Largest request or response payload this session will carry.
    pub fn max_payload(&self) -> usize {
        let channel = self.transport.max_frame().saturating_sub(HEADER_SIZE);
        self.config
            .max_payload
            .map_or(channel, |limit| limit.min(channel))
    }

    fn next_seq(&self) -> u16 {
        self.last_issued
            .map_or(1, |issued| issued.seq.wrapping_add(1))
    }

    fn ready(&self) -> Result<(), ClientError> {
        match self.state {
            SessionState::Idle => Ok(()),
            SessionState::AwaitingResponse(issued) => Err(ClientError::Busy(issued)),
            SessionState::Failed => Err(ClientError::SessionFailed),
            SessionState::Closed => Err(ClientError::Closed),
        }
    }

    /// Transmits one request. The last issued identity only moves once the
    /// channel has accepted the frame.
    pub fn send_request(&mut self, kind: Kind, payload: &[u8]) -> Result<Issued, ClientError> {
        self.ready()?;

        let limit = self.max_payload();
        if payload.len() > limit {
            return Err(ClientError::TooLarge {
                what: "request payload",
                len: payload.len(),
                limit,
            });
        }

        let issued = Issued {
            seq: self.next_seq(),
            kind,
        };
        let frame = Header::frame(issued, payload)?;
        self.transport.send(&frame)?;
        debug!("sent request {issued} ({} payload bytes)", payload.len());

        self.last_issued = Some(issued);
        self.state = SessionState::AwaitingResponse(issued);
        Ok(issued)
    }

    /// Checks once for the response to the outstanding request.
    pub fn poll_response(&mut self) -> Result<Option<Vec<u8>>, ClientError> {
        let expected = match self.state {
            SessionState::AwaitingResponse(issued) => issued,
            SessionState::Idle => return Err(ClientError::Idle),
            SessionState::Failed => return Err(ClientError::SessionFailed),
            SessionState::Closed => return Err(ClientError::Closed),
        };

        let frame = match self.transport.try_recv() {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(None),
            Err(e) => {
                warn!("receive for {expected} failed: {e}");
                self.state = SessionState::Failed;
                return Err(e.into());
            }
        };

        let (header, payload) = match Header::parse(&frame) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("undecodable response to {expected}: {e}");
                self.state = SessionState::Failed;
                return Err(e.into());
            }
        };

        let received = header.issued();
        if received != expected {
            warn!("correlation mismatch: sent {expected}, received {received}");
            self.state = SessionState::Failed;
            return Err(ClientError::Correlation { expected, received });
        }

        trace!("response {received} ({} payload bytes)", payload.len());
        self.state = SessionState::Idle;
        Ok(Some(payload.to_vec()))
    }

    /// Blocks until the outstanding request is answered or the channel fails.
    pub fn wait_response(&mut self) -> Result<Vec<u8>, ClientError> {
        loop {
            if let Some(payload) = self.poll_response()? {
                return Ok(payload);
            }
            match self.config.poll {
                PollStrategy::Spin => hint::spin_loop(),
                PollStrategy::Yield => thread::yield_now(),
                PollStrategy::Sleep(interval) => thread::sleep(interval),
            }
        }
    }

    /// One complete round trip with an opaque payload.
    pub fn call(&mut self, kind: Kind, payload: &[u8]) -> Result<Vec<u8>, ClientError> {
        self.send_request(kind, payload)?;
        self.wait_response()
    }

    pub fn start<O: Operation>(&mut self, op: O) -> Result<Pending<'_, T, O>, ClientError> {
        self.ready()?;
        let payload = op.encode(self.max_payload())?;
        let issued = self.send_request(op.kind(), &payload)?;
        Ok(Pending {
            client: self,
            op: Some(op),
            issued,
        })
    }

    pub fn execute<O: Operation>(&mut self, op: O) -> Result<O::Output, ClientError> {
        self.start(op)?.wait()
    }

    /// Gives up on an in-flight request. The server may still answer it, so
    /// the session cannot be trusted afterwards.
    pub fn abandon(&mut self) {
        if let SessionState::AwaitingResponse(issued) = self.state {
            warn!("abandoning in-flight request {issued}");
            self.state = SessionState::Failed;
        }
    }

    pub fn disconnect(&mut self) -> Result<(), ClientError> {
        self.transport.disconnect()?;
        self.state = SessionState::Closed;
        Ok(())
    }

    pub fn into_transport(self) -> T {
        self.transport
    }
}

/// An operation whose request is on the wire.
pub struct Pending<'c, T: Transport, O: Operation> {
    client: &'c mut Client<T>,
    op: Option<O>,
    issued: Issued,
}

impl<T: Transport, O: Operation> Pending<'_, T, O> {
    pub fn issued(&self) -> Issued {
        self.issued
    }

    /// `Ok(None)` until the response has arrived.
    pub fn poll(&mut self) -> Result<Option<O::Output>, ClientError> {
        let Some(payload) = self.client.poll_response()? else {
            return Ok(None);
        };
        let op = self.op.take().ok_or(ClientError::Idle)?;
        op.decode(&payload).map(Some)
    }

    pub fn wait(mut self) -> Result<O::Output, ClientError> {
        let payload = self.client.wait_response()?;
        let op = self.op.take().ok_or(ClientError::Idle)?;
        op.decode(&payload)
    }
}

/// Leading result code of a response body.
pub(crate) fn result_code(payload: &[u8]) -> Result<ErrorCode, ClientError> {
    let rc = payload
        .get(..RC_SIZE)
        .ok_or(ClientError::Malformed(
            crate::protocol::FrameError::Short { len: payload.len() },
        ))?;
    Ok(ErrorCode::from(i32::from_be_bytes([rc[0], rc[1], rc[2], rc[3]])))
}

/// Fails with the server's code unless the leading result code is zero.
pub(crate) fn check_rc(payload: &[u8]) -> Result<(), ClientError> {
    match result_code(payload)? {
        ErrorCode::Ok => Ok(()),
        code => Err(ClientError::Server(code)),
    }
}

/// Decodes a body that carries no result code. A refusal still arrives as a
/// bare code, which is reported as the server's error.
pub(crate) fn parse_plain<D: Decode<()>>(payload: &[u8]) -> Result<(D, &[u8]), ClientError> {
    if payload.len() == RC_SIZE {
        check_rc(payload)?;
    }
    decode_body(payload).map_err(ClientError::Malformed)
}

/// Decodes a result-code-prefixed body, surfacing a non-zero code as an error.
pub(crate) fn parse<D: Decode<()>>(payload: &[u8]) -> Result<(D, &[u8]), ClientError> {
    check_rc(payload)?;
    decode_body(payload).map_err(ClientError::Malformed)
}

pub(crate) fn ensure_fits(what: &'static str, len: usize, limit: usize) -> Result<(), ClientError> {
    if len > limit {
        return Err(ClientError::TooLarge { what, len, limit });
    }
    Ok(())
}

/// Length as carried in a 16-bit wire field.
pub(crate) fn wire_len(what: &'static str, len: usize) -> Result<u16, ClientError> {
    u16::try_from(len).map_err(|_| ClientError::TooLarge {
        what,
        len,
        limit: usize::from(u16::MAX),
    })
}

#[cfg(test)]
pub(crate) mod testing {
    use crate::{config::ServerConfig, protocol::Loopback, server::HsmServer};

    use super::*;

    pub type TestClient = Client<Loopback<HsmServer>>;

    pub fn session_with(config: ServerConfig) -> TestClient {
        let channel = Loopback::new(HsmServer::new(config));
        let mut client = Client::connect(channel, ClientConfig::default()).unwrap();
        client.open().unwrap();
        client
    }

    pub fn session() -> TestClient {
        session_with(ServerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use crate::{
        config::ServerConfig,
        protocol::{
            ErrorCode, Loopback, TransportError,
            header::{action, group},
        },
        server::HsmServer,
    };

    use super::{testing::session, *};

    const ECHO: Kind = Kind::new(group::COMM, action::comm::ECHO);

    /// Answers each request with a frame produced by `reply`.
    struct Scripted<F: FnMut(Header, &[u8]) -> Vec<u8>> {
        reply: F,
        queue: VecDeque<Vec<u8>>,
        sent: usize,
    }

    impl<F: FnMut(Header, &[u8]) -> Vec<u8>> Transport for Scripted<F> {
        fn connect(&mut self) -> Result<(), TransportError> {
            Ok(())
        }

        fn send(&mut self, frame: &[u8]) -> Result<(), TransportError> {
            let (header, payload) = Header::parse(frame).unwrap();
            let response = (self.reply)(header, payload);
            self.queue.push_back(response);
            self.sent += 1;
            Ok(())
        }

        fn try_recv(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
            Ok(self.queue.pop_front())
        }

        fn disconnect(&mut self) -> Result<(), TransportError> {
            Ok(())
        }

        fn max_frame(&self) -> usize {
            crate::protocol::header::MAX_FRAME
        }
    }

    fn scripted<F: FnMut(Header, &[u8]) -> Vec<u8>>(reply: F) -> Client<Scripted<F>> {
        Client::new(
            Scripted {
                reply,
                queue: VecDeque::new(),
                sent: 0,
            },
            ClientConfig::default(),
        )
    }

    #[test]
    fn call_returns_correlated_response() {
        let mut client = session();
        let payload = client.call(ECHO, b"hello").unwrap();

        assert_eq!(payload, b"hello");
        assert_eq!(client.state(), SessionState::Idle);
        assert_eq!(client.last_issued().unwrap().kind, ECHO);
    }

    #[test]
    fn request_identities_are_distinct() {
        let mut client = session();
        let first = client.send_request(ECHO, b"a").unwrap();
        client.wait_response().unwrap();
        let second = client.send_request(ECHO, b"b").unwrap();
        client.wait_response().unwrap();

        assert_ne!(first.seq, second.seq);
    }

    #[test]
    fn sequence_wraps_around() {
        let mut client = session();
        client.last_issued = Some(Issued {
            seq: u16::MAX,
            kind: ECHO,
        });

        let issued = client.send_request(ECHO, b"").unwrap();
        assert_eq!(issued.seq, 0);
        client.wait_response().unwrap();
    }

    #[test]
    fn stale_sequence_is_a_correlation_error() {
        let mut client = scripted(|header, payload| {
            let stale = Issued {
                seq: header.seq.wrapping_sub(1),
                kind: header.kind(),
            };
            Header::frame(stale, payload).unwrap()
        });

        let err = client.call(ECHO, b"x").unwrap_err();
        assert!(matches!(err, ClientError::Correlation { .. }));
        assert!(err.is_fatal());
        assert_eq!(client.state(), SessionState::Failed);

        assert!(matches!(
            client.call(ECHO, b"x"),
            Err(ClientError::SessionFailed)
        ));
        assert_eq!(client.transport().sent, 1);
    }

    #[test]
    fn mismatched_action_is_a_correlation_error() {
        let mut client = scripted(|header, payload| {
            let other = Issued {
                seq: header.seq,
                kind: Kind::new(header.group, header.action + 1),
            };
            Header::frame(other, payload).unwrap()
        });

        assert!(matches!(
            client.call(ECHO, b"x"),
            Err(ClientError::Correlation { expected, received })
                if expected.seq == received.seq && expected.kind != received.kind
        ));
    }

    #[test]
    fn truncated_response_fails_the_session() {
        let mut client = scripted(|header, _| {
            let mut frame = Header::frame(header.issued(), b"four").unwrap();
            frame.pop();
            frame
        });

        let err = client.call(ECHO, b"four").unwrap_err();
        assert!(matches!(err, ClientError::Frame(_)));
        assert_eq!(client.state(), SessionState::Failed);
    }

    #[test]
    fn waits_through_not_ready() {
        let channel = Loopback::new(HsmServer::new(ServerConfig::default())).with_latency(5);
        let mut client = Client::connect(channel, ClientConfig::default()).unwrap();

        assert_eq!(client.call(ECHO, b"slow").unwrap(), b"slow");
    }

    #[test]
    fn pending_polls_until_ready() {
        let channel = Loopback::new(HsmServer::new(ServerConfig::default())).with_latency(2);
        let mut client = Client::connect(channel, ClientConfig::default()).unwrap();

        let mut pending = client.start(comm::Echo(b"later")).unwrap();
        assert_eq!(pending.poll().unwrap(), None);
        assert_eq!(pending.poll().unwrap(), None);
        assert_eq!(pending.poll().unwrap(), Some(b"later".to_vec()));
    }

    #[test]
    fn one_request_outstanding() {
        let mut client = session();
        let issued = client.send_request(ECHO, b"first").unwrap();

        assert!(matches!(
            client.send_request(ECHO, b"second"),
            Err(ClientError::Busy(busy)) if busy == issued
        ));
        assert_eq!(client.wait_response().unwrap(), b"first");
    }

    #[test]
    fn abandoned_request_fails_the_session() {
        let mut client = session();
        client.send_request(ECHO, b"x").unwrap();
        client.abandon();

        assert_eq!(client.state(), SessionState::Failed);
        assert!(matches!(
            client.call(ECHO, b"y"),
            Err(ClientError::SessionFailed)
        ));
    }

    #[test]
    fn failed_send_keeps_last_issued() {
        let mut client = Client::new(
            Loopback::new(HsmServer::new(ServerConfig::default())),
            ClientConfig::default(),
        );

        let err = client.call(ECHO, b"x").unwrap_err();
        assert!(matches!(
            err,
            ClientError::Transport(TransportError::NotConnected)
        ));
        assert_eq!(client.last_issued(), None);
        assert_eq!(client.state(), SessionState::Idle);
    }

    #[test]
    fn oversize_payload_fails_locally() {
        let mut client = session();
        let issued = client.last_issued();
        let big = vec![0; client.max_payload() + 1];

        let err = client.call(ECHO, &big).unwrap_err();
        assert!(matches!(err, ClientError::TooLarge { .. }));
        assert!(!err.is_fatal());
        assert_eq!(client.last_issued(), issued);
        assert_eq!(client.echo(b"still usable").unwrap(), b"still usable");
    }

    #[test]
    fn configured_payload_limit() {
        let channel = Loopback::new(HsmServer::new(ServerConfig::default()));
        let mut client =
            Client::connect(channel, ClientConfig::default().with_max_payload(16)).unwrap();

        assert_eq!(client.max_payload(), 16);
        assert!(matches!(
            client.echo(&[0; 17]),
            Err(ClientError::TooLarge { limit: 16, .. })
        ));
    }

    #[test]
    fn server_code_is_recoverable() {
        let mut client = session();
        let err = client.key_evict(0x1234).unwrap_err();

        assert_eq!(err.code(), Some(ErrorCode::NotFound));
        assert!(!err.is_fatal());
        assert_eq!(client.state(), SessionState::Idle);
    }

    #[test]
    fn disconnect_closes_the_session() {
        let mut client = session();
        client.close().unwrap();
        client.disconnect().unwrap();

        assert_eq!(client.state(), SessionState::Closed);
        assert!(matches!(client.echo(b"x"), Err(ClientError::Closed)));
    }

    #[test]
    fn check_rc_reads_leading_code() {
        assert!(check_rc(&0i32.to_be_bytes()).is_ok());
        assert!(matches!(
            check_rc(&(-405i32).to_be_bytes()),
            Err(ClientError::Server(ErrorCode::NoSpace))
        ));
        assert!(matches!(check_rc(&[0, 0]), Err(ClientError::Malformed(_))));
    }
}
