//! Message bodies carried inside an envelope.
//!
//! Bodies are fixed-layout structs; operations that move opaque bytes (key
//! material, object data, callback payloads) append them after the body. Most
//! responses start with a signed 32-bit result code, see [`ErrorCode`].
use std::fmt;

use bincode::{Decode, Encode};
use thiserror::Error;

pub const LABEL_LEN: usize = 32;
pub const NVM_MAX_DESTROY: usize = 10;
pub const CUSTOM_CB_COUNT: u16 = 8;

pub const RC_SIZE: usize = size_of::<i32>();
pub const LABEL_SIZE: usize = size_of::<u16>() + LABEL_LEN;
pub const METADATA_SIZE: usize = 4 * size_of::<u16>() + LABEL_SIZE;
pub const KEY_CACHE_REQUEST_SIZE: usize = 2 * size_of::<u32>() + size_of::<u16>() + LABEL_SIZE;
pub const KEY_EXPORT_RESPONSE_SIZE: usize = RC_SIZE + size_of::<u32>() + LABEL_SIZE;
pub const NVM_READ_RESPONSE_SIZE: usize = RC_SIZE + size_of::<u16>();
pub const CUSTOM_REQUEST_SIZE: usize = size_of::<u32>();
pub const CUSTOM_RESPONSE_SIZE: usize = 2 * RC_SIZE;
pub const CRYPTO_REQUEST_SIZE: usize = 2 * size_of::<u16>();
pub const CRYPTO_RESPONSE_SIZE: usize = RC_SIZE + size_of::<u16>();

/// Result codes reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Ok,
    BadArgs,
    Aborted,
    Access,
    NotFound,
    NoSpace,
    NoHandler,
    Unsupported,
    Other(i32),
}

impl From<i32> for ErrorCode {
    fn from(value: i32) -> Self {
        match value {
            0 => ErrorCode::Ok,
            -400 => ErrorCode::BadArgs,
            -402 => ErrorCode::Aborted,
            -403 => ErrorCode::Access,
            -404 => ErrorCode::NotFound,
            -405 => ErrorCode::NoSpace,
            -406 => ErrorCode::NoHandler,
            -407 => ErrorCode::Unsupported,
            rc => ErrorCode::Other(rc),
        }
    }
}

impl From<ErrorCode> for i32 {
    fn from(value: ErrorCode) -> Self {
        match value {
            ErrorCode::Ok => 0,
            ErrorCode::BadArgs => -400,
            ErrorCode::Aborted => -402,
            ErrorCode::Access => -403,
            ErrorCode::NotFound => -404,
            ErrorCode::NoSpace => -405,
            ErrorCode::NoHandler => -406,
            ErrorCode::Unsupported => -407,
            ErrorCode::Other(rc) => rc,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::Ok => "ok",
            ErrorCode::BadArgs => "bad arguments",
            ErrorCode::Aborted => "aborted",
            ErrorCode::Access => "access denied",
            ErrorCode::NotFound => "not found",
            ErrorCode::NoSpace => "no space",
            ErrorCode::NoHandler => "no handler",
            ErrorCode::Unsupported => "unsupported",
            ErrorCode::Other(_) => "error",
        };
        write!(f, "{name} ({})", i32::from(*self))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("label is {0} bytes, limit is {LABEL_LEN}")]
pub struct LabelTooLong(pub usize);

/// Bounded opaque tag attached to keys and objects.
#[derive(Clone, Copy, Default, Encode, Decode, PartialEq, Eq)]
pub struct Label {
    len: u16,
    bytes: [u8; LABEL_LEN],
}

impl Label {
    pub fn new(label: &[u8]) -> Result<Self, LabelTooLong> {
        if label.len() > LABEL_LEN {
            return Err(LabelTooLong(label.len()));
        }
        let mut bytes = [0; LABEL_LEN];
        bytes[..label.len()].copy_from_slice(label);
        Ok(Self {
            len: label.len() as u16,
            bytes,
        })
    }

    /// Label bytes. A length field beyond [`LABEL_LEN`] is clamped.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..usize::from(self.len).min(LABEL_LEN)]
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TryFrom<&[u8]> for Label {
    type Error = LabelTooLong;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        Label::new(value)
    }
}

impl TryFrom<&str> for Label {
    type Error = LabelTooLong;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Label::new(value.as_bytes())
    }
}

impl fmt::Debug for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Label({:?})", String::from_utf8_lossy(self.as_bytes()))
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(self.as_bytes()))
    }
}

/// Response carrying nothing but a result code.
#[derive(Debug, Clone, Copy, Default, Encode, Decode, PartialEq, Eq)]
pub struct RcResponse {
    pub rc: i32,
}

/// Request addressing a single key or object.
#[derive(Debug, Clone, Copy, Default, Encode, Decode, PartialEq, Eq)]
pub struct IdRequest {
    pub id: u16,
}

#[derive(Debug, Clone, Copy, Default, Encode, Decode, PartialEq, Eq)]
pub struct CommInitResponse {
    pub client_id: u32,
    pub server_id: u32,
}

/// Followed by `len` bytes of key material.
#[derive(Debug, Clone, Copy, Default, Encode, Decode, PartialEq, Eq)]
pub struct KeyCacheRequest {
    pub flags: u32,
    pub len: u32,
    pub id: u16,
    pub label: Label,
}

#[derive(Debug, Clone, Copy, Default, Encode, Decode, PartialEq, Eq)]
pub struct KeyCacheResponse {
    pub rc: i32,
    pub id: u16,
}

/// Followed by `len` bytes of key material.
#[derive(Debug, Clone, Copy, Default, Encode, Decode, PartialEq, Eq)]
pub struct KeyExportResponse {
    pub rc: i32,
    pub len: u32,
    pub label: Label,
}

#[derive(Debug, Clone, Copy, Default, Encode, Decode, PartialEq, Eq)]
pub struct NvmInitResponse {
    pub rc: i32,
    pub client_nvm_id: u32,
    pub server_nvm_id: u32,
}

#[derive(Debug, Clone, Copy, Default, Encode, Decode, PartialEq, Eq)]
pub struct NvmAvailableResponse {
    pub rc: i32,
    pub avail_size: u32,
    pub avail_objects: u16,
    pub reclaim_size: u32,
    pub reclaim_objects: u16,
}

/// Object description. Sent ahead of the data in an add request, and read
/// by the server from host memory in the direct-memory add.
#[derive(Debug, Clone, Copy, Default, Encode, Decode, PartialEq, Eq)]
pub struct NvmMetadata {
    pub id: u16,
    pub access: u16,
    pub flags: u16,
    pub len: u16,
    pub label: Label,
}

#[derive(Debug, Clone, Copy, Default, Encode, Decode, PartialEq, Eq)]
pub struct NvmListRequest {
    pub access: u16,
    pub flags: u16,
    pub start_id: u16,
}

#[derive(Debug, Clone, Copy, Default, Encode, Decode, PartialEq, Eq)]
pub struct NvmListResponse {
    pub rc: i32,
    pub count: u16,
    pub id: u16,
}

#[derive(Debug, Clone, Copy, Default, Encode, Decode, PartialEq, Eq)]
pub struct NvmMetadataResponse {
    pub rc: i32,
    pub metadata: NvmMetadata,
}

/// Followed by `count` big-endian 16-bit ids.
#[derive(Debug, Clone, Copy, Default, Encode, Decode, PartialEq, Eq)]
pub struct NvmDestroyRequest {
    pub count: u16,
}

#[derive(Debug, Clone, Copy, Default, Encode, Decode, PartialEq, Eq)]
pub struct NvmReadRequest {
    pub id: u16,
    pub offset: u16,
    pub len: u16,
}

/// Followed by `len` bytes of object data.
#[derive(Debug, Clone, Copy, Default, Encode, Decode, PartialEq, Eq)]
pub struct NvmReadResponse {
    pub rc: i32,
    pub len: u16,
}

/// Direct-memory add. `A` is the host address width, `u32` or `u64`.
#[derive(Debug, Clone, Copy, Default, Encode, Decode, PartialEq, Eq)]
pub struct NvmAddObjectDmaRequest<A> {
    pub metadata_hostaddr: A,
    pub data_hostaddr: A,
    pub data_len: u16,
}

/// Direct-memory read. `A` is the host address width, `u32` or `u64`.
#[derive(Debug, Clone, Copy, Default, Encode, Decode, PartialEq, Eq)]
pub struct NvmReadDmaRequest<A> {
    pub id: u16,
    pub offset: u16,
    pub len: u16,
    pub data_hostaddr: A,
}

pub const CUSTOM_INVOKE: u32 = 0;
pub const CUSTOM_QUERY: u32 = 1;

/// Followed by the opaque callback input. The action carries the callback id.
#[derive(Debug, Clone, Copy, Default, Encode, Decode, PartialEq, Eq)]
pub struct CustomRequest {
    pub kind: u32,
}

/// `rc` is the server's verdict on dispatch, `err` the handler's own return
/// code. Followed by the opaque callback output.
#[derive(Debug, Clone, Copy, Default, Encode, Decode, PartialEq, Eq)]
pub struct CustomResponse {
    pub rc: i32,
    pub err: i32,
}

/// Followed by `len` bytes of algorithm input. The action carries the
/// algorithm id.
#[derive(Debug, Clone, Copy, Default, Encode, Decode, PartialEq, Eq)]
pub struct CryptoRequest {
    pub key_id: u16,
    pub len: u16,
}

#[derive(Debug, Clone, Copy, Default, Encode, Decode, PartialEq, Eq)]
pub struct CryptoResponse {
    pub rc: i32,
    pub len: u16,
}
