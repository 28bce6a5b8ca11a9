use std::{
    io::{self, ErrorKind, Read, Write},
    net::{SocketAddr, TcpStream},
    thread,
};

use log::{debug, trace};
use thiserror::Error;

use super::header::{HEADER_SIZE, MAX_FRAME, declared_size};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("channel is not connected")]
    NotConnected,
    #[error("channel closed by peer")]
    Closed,
    #[error("channel already holds an undelivered frame")]
    Occupied,
    #[error("frame of {len} bytes exceeds channel maximum of {max}")]
    FrameTooLarge { len: usize, max: usize },
    #[error("Transport IO Error: {0}")]
    Io(#[from] io::Error),
}

/// Point-to-point channel carrying one frame at a time.
///
/// `try_recv` returns `Ok(None)` while the peer has not produced a complete
/// frame yet; that is the normal waiting state, not an error.
pub trait Transport {
    fn connect(&mut self) -> Result<(), TransportError>;

    fn send(&mut self, frame: &[u8]) -> Result<(), TransportError>;

    fn try_recv(&mut self) -> Result<Option<Vec<u8>>, TransportError>;

    fn disconnect(&mut self) -> Result<(), TransportError>;

    /// Largest frame, header included, the channel will carry.
    fn max_frame(&self) -> usize;
}

/// Blocking framed reader/writer over any byte stream. Used on the serving
/// side of a TCP connection, where a thread per connection can simply block.
pub struct ProtocolTransport<T: Read + Write> {
    stream: T,
    max_frame: usize,
}

impl<T: Read + Write> ProtocolTransport<T> {
    pub fn new(stream: T) -> Self {
        Self {
            stream,
            max_frame: MAX_FRAME,
        }
    }

    pub fn read_frame(&mut self) -> Result<Vec<u8>, TransportError> {
        let mut frame = vec![0; HEADER_SIZE];
        match self.stream.read_exact(&mut frame) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Err(TransportError::Closed),
            Err(e) => return Err(e.into()),
        }

        let size = declared_size(&frame).unwrap_or_default();
        if HEADER_SIZE + size > self.max_frame {
            return Err(TransportError::FrameTooLarge {
                len: HEADER_SIZE + size,
                max: self.max_frame,
            });
        }

        frame.resize(HEADER_SIZE + size, 0);
        self.stream.read_exact(&mut frame[HEADER_SIZE..])?;
        trace!("read frame of {} bytes", frame.len());
        Ok(frame)
    }

    pub fn write_frame(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        if frame.len() > self.max_frame {
            return Err(TransportError::FrameTooLarge {
                len: frame.len(),
                max: self.max_frame,
            });
        }
        self.stream.write_all(frame)?;
        self.stream.flush()?;
        trace!("wrote frame of {} bytes", frame.len());
        Ok(())
    }
}

/// Client side of a TCP channel. Receives are polled from a non-blocking
/// socket and reassembled into whole frames.
#[derive(Debug)]
pub struct TcpTransport {
    address: SocketAddr,
    stream: Option<TcpStream>,
    rx: Vec<u8>,
    max_frame: usize,
}

impl TcpTransport {
    pub fn new(address: SocketAddr) -> Self {
        Self {
            address,
            stream: None,
            rx: Vec::with_capacity(MAX_FRAME),
            max_frame: MAX_FRAME,
        }
    }

    pub fn with_max_frame(mut self, max_frame: usize) -> Self {
        self.max_frame = max_frame.clamp(HEADER_SIZE, MAX_FRAME);
        self
    }

    fn stream(&mut self) -> Result<&mut TcpStream, TransportError> {
        self.stream.as_mut().ok_or(TransportError::NotConnected)
    }

    fn take_frame(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        let Some(size) = declared_size(&self.rx) else {
            return Ok(None);
        };
        let total = HEADER_SIZE + size;
        if total > self.max_frame {
            return Err(TransportError::FrameTooLarge {
                len: total,
                max: self.max_frame,
            });
        }
        if self.rx.len() < total {
            return Ok(None);
        }
        Ok(Some(self.rx.drain(..total).collect()))
    }
}

impl Transport for TcpTransport {
    fn connect(&mut self) -> Result<(), TransportError> {
        let stream = TcpStream::connect(self.address)?;
        stream.set_nodelay(true)?;
        stream.set_nonblocking(true)?;
        debug!("connected to {}", self.address);

        self.rx.clear();
        self.stream = Some(stream);
        Ok(())
    }

    fn send(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        if frame.len() > self.max_frame {
            return Err(TransportError::FrameTooLarge {
                len: frame.len(),
                max: self.max_frame,
            });
        }

        let stream = self.stream()?;
        let mut written = 0;
        while written < frame.len() {
            match stream.write(&frame[written..]) {
                Ok(0) => return Err(TransportError::Closed),
                Ok(n) => written += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => thread::yield_now(),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn try_recv(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        if let Some(frame) = self.take_frame()? {
            return Ok(Some(frame));
        }

        let mut chunk = [0; 512];
        loop {
            let stream = self.stream()?;
            match stream.read(&mut chunk) {
                Ok(0) => {
                    return self
                        .take_frame()?
                        .map(Some)
                        .ok_or(TransportError::Closed);
                }
                Ok(n) => self.rx.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }

        self.take_frame()
    }

    fn disconnect(&mut self) -> Result<(), TransportError> {
        if let Some(stream) = self.stream.take() {
            match stream.shutdown(std::net::Shutdown::Both) {
                Err(e) if e.kind() != ErrorKind::NotConnected => return Err(e.into()),
                _ => {}
            }
            debug!("disconnected from {}", self.address);
        }
        self.rx.clear();
        Ok(())
    }

    fn max_frame(&self) -> usize {
        self.max_frame
    }
}
