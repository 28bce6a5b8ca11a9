//! Client-server communication protocol.
//!
//! This module defines the wire format spoken between the host and the security
//! co-processor, and the channels that carry it.
//!
//! # Overview
//!
//! Every exchange is one request frame followed by exactly one response frame.
//! A frame is a fixed [`Header`] of four 16-bit fields (group, action, request
//! sequence, payload size) followed by the payload. The response echoes the
//! group, action and sequence of the request it answers, which is what lets the
//! client correlate the two.
//!
//! # Binary Format
//!
//! - All integers are big-endian and fixed width.
//! - Bodies are fixed-layout structs (see [`message`]); opaque bytes such as key
//!   material or object data follow the body.
//! - Most response bodies begin with a signed 32-bit result code.
//!
//! # Key Components
//!
//! - [`Header`]: envelope header, plus the group/action tables.
//! - [`Transport`]: point-to-point channel with a non-blocking receive.
//! - [`TcpTransport`], [`ProtocolTransport`] and [`Loopback`]: channels over TCP,
//!   any blocking byte stream, and an in-process handler.
//!
//! # See Also
//!
//! - [`client`](crate::client): Correlates requests and responses over a transport.
//! - [`server`](crate::server): Reference co-processor answering these messages.
pub mod header;
pub mod message;

mod loopback;
mod transport;

pub use header::{FrameError, Header, Issued, Kind};
pub use loopback::{FrameHandler, Loopback};
pub use message::{ErrorCode, Label, LabelTooLong, NvmMetadata};
pub use transport::{ProtocolTransport, TcpTransport, Transport, TransportError};
