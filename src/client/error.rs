use thiserror::Error;

use crate::protocol::{
    ErrorCode, FrameError, Issued, LabelTooLong, TransportError, message::LABEL_LEN,
};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),
    #[error("bad frame: {0}")]
    Frame(#[from] FrameError),
    #[error("response {received} does not answer request {expected}")]
    Correlation { expected: Issued, received: Issued },
    #[error("malformed response body: {0}")]
    Malformed(FrameError),
    #[error("server rejected request: {0}")]
    Server(ErrorCode),
    #[error("{what} is {len} bytes, limit is {limit}")]
    TooLarge {
        what: &'static str,
        len: usize,
        limit: usize,
    },
    #[error("response carries {len} bytes but buffer holds {capacity}")]
    BufferTooSmall { len: usize, capacity: usize },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("request {0} is still awaiting its response")]
    Busy(Issued),
    #[error("no request is awaiting a response")]
    Idle,
    #[error("session failed, reconnect required")]
    SessionFailed,
    #[error("session is closed")]
    Closed,
}

impl ClientError {
    /// Whether the session is unusable after this error. Server result codes
    /// and local validation failures leave the session intact.
    pub fn is_fatal(&self) -> bool {
        match self {
            ClientError::Transport(_)
            | ClientError::Correlation { .. }
            | ClientError::SessionFailed
            | ClientError::Closed => true,
            ClientError::Frame(e) => !matches!(
                e,
                FrameError::Encode(_) | FrameError::TooLarge { .. }
            ),
            _ => false,
        }
    }

    /// Result code reported by the server, if that is what failed.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            ClientError::Server(code) => Some(*code),
            _ => None,
        }
    }
}

impl From<LabelTooLong> for ClientError {
    fn from(value: LabelTooLong) -> Self {
        ClientError::TooLarge {
            what: "label",
            len: value.0,
            limit: LABEL_LEN,
        }
    }
}
