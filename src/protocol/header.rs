//! Envelope header and wire constants.
//!
//! Every frame exchanged with the co-processor starts with a fixed 8 byte
//! [`Header`] followed by `size` bytes of payload. Request and response use the
//! same header shape; a response must echo the `group`, `action` and `seq` of
//! the request it answers.
use std::fmt;

use bincode::{
    Decode, Encode,
    config::{BigEndian, Configuration, Fixint},
};
use thiserror::Error;

pub const HEADER_SIZE: usize = 8;
pub const COMM_DATA_LEN: usize = 1280;
pub const MAX_FRAME: usize = HEADER_SIZE + COMM_DATA_LEN;

pub const HEADER_SIZE_OFFSET: usize = 6;

/// Operation families.
pub mod group {
    pub const COMM: u16 = 0x0001;
    pub const NVM: u16 = 0x0002;
    pub const KEY: u16 = 0x0003;
    pub const CRYPTO: u16 = 0x0004;
    pub const CUSTOM: u16 = 0x0010;
}

/// Operations within each family. The CUSTOM group uses the callback id as
/// its action and the CRYPTO group uses the algorithm id.
pub mod action {
    pub mod comm {
        pub const INIT: u16 = 0x0001;
        pub const CLOSE: u16 = 0x0002;
        pub const ECHO: u16 = 0x0003;
    }

    pub mod nvm {
        pub const INIT: u16 = 0x0001;
        pub const CLEANUP: u16 = 0x0002;
        pub const GET_AVAILABLE: u16 = 0x0003;
        pub const ADD_OBJECT: u16 = 0x0004;
        pub const LIST: u16 = 0x0005;
        pub const GET_METADATA: u16 = 0x0006;
        pub const DESTROY_OBJECTS: u16 = 0x0007;
        pub const READ: u16 = 0x0008;
        pub const ADD_OBJECT_DMA32: u16 = 0x0009;
        pub const READ_DMA32: u16 = 0x000A;
        pub const ADD_OBJECT_DMA64: u16 = 0x000B;
        pub const READ_DMA64: u16 = 0x000C;
    }

    pub mod key {
        pub const CACHE: u16 = 0x0001;
        pub const EVICT: u16 = 0x0002;
        pub const COMMIT: u16 = 0x0003;
        pub const EXPORT: u16 = 0x0004;
        pub const ERASE: u16 = 0x0005;
    }
}

pub type WireConfig = Configuration<BigEndian, Fixint>;

/// Encoding used for headers and message bodies on both sides of the channel.
pub fn wire_config() -> WireConfig {
    bincode::config::standard()
        .with_big_endian()
        .with_fixed_int_encoding()
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame of {len} bytes is shorter than the {HEADER_SIZE} byte header")]
    Short { len: usize },
    #[error("header declares {declared} payload bytes but frame carries {actual}")]
    SizeMismatch { declared: usize, actual: usize },
    #[error("payload of {len} bytes does not fit a {limit} byte frame")]
    TooLarge { len: usize, limit: usize },
    #[error("failed to encode message: {0}")]
    Encode(#[from] bincode::error::EncodeError),
    #[error("failed to decode message: {0}")]
    Decode(#[from] bincode::error::DecodeError),
}

/// Operation kind; the (group, action) pair a request was issued for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Kind {
    pub group: u16,
    pub action: u16,
}

impl Kind {
    pub const fn new(group: u16, action: u16) -> Self {
        Self { group, action }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}/{:#06x}", self.group, self.action)
    }
}

/// Identity of a request that went out on the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Issued {
    pub seq: u16,
    pub kind: Kind,
}

impl fmt::Display for Issued {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {}", self.seq, self.kind)
    }
}

#[derive(Debug, Clone, Copy, Default, Encode, Decode, PartialEq, Eq)]
pub struct Header {
    pub group: u16,
    pub action: u16,
    pub seq: u16,
    pub size: u16,
}

impl Header {
    pub fn kind(&self) -> Kind {
        Kind::new(self.group, self.action)
    }

    pub fn issued(&self) -> Issued {
        Issued {
            seq: self.seq,
            kind: self.kind(),
        }
    }

    /// Builds a full frame for `payload`, filling in the size field.
    pub fn frame(issued: Issued, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
        let size = u16::try_from(payload.len()).map_err(|_| FrameError::TooLarge {
            len: payload.len(),
            limit: usize::from(u16::MAX),
        })?;
        let header = Header {
            group: issued.kind.group,
            action: issued.kind.action,
            seq: issued.seq,
            size,
        };

        let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
        bincode::encode_into_std_write(header, &mut frame, wire_config())?;
        frame.extend_from_slice(payload);
        Ok(frame)
    }

    /// Splits a frame into its header and payload, checking the declared size.
    pub fn parse(frame: &[u8]) -> Result<(Header, &[u8]), FrameError> {
        if frame.len() < HEADER_SIZE {
            return Err(FrameError::Short { len: frame.len() });
        }

        let (header, read): (Header, usize) =
            bincode::decode_from_slice(&frame[..HEADER_SIZE], wire_config())?;
        let payload = &frame[read..];
        if payload.len() != usize::from(header.size) {
            return Err(FrameError::SizeMismatch {
                declared: usize::from(header.size),
                actual: payload.len(),
            });
        }

        Ok((header, payload))
    }
}

/// Payload length declared by a (possibly incomplete) buffered frame.
pub fn declared_size(buf: &[u8]) -> Option<usize> {
    let bytes = buf.get(HEADER_SIZE_OFFSET..HEADER_SIZE)?;
    Some(usize::from(u16::from_be_bytes([bytes[0], bytes[1]])))
}

/// Encodes a fixed-layout body followed by trailing opaque bytes.
pub fn encode_body<E: Encode>(body: &E, trailing: &[u8]) -> Result<Vec<u8>, FrameError> {
    let mut out = bincode::encode_to_vec(body, wire_config())?;
    out.extend_from_slice(trailing);
    Ok(out)
}

/// Decodes a fixed-layout body, returning whatever bytes follow it.
pub fn decode_body<D: Decode<()>>(payload: &[u8]) -> Result<(D, &[u8]), FrameError> {
    let (body, read): (D, usize) = bincode::decode_from_slice(payload, wire_config())?;
    Ok((body, &payload[read..]))
}
