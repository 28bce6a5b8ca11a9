//! In-process channel.
//!
//! [`Loopback`] hands each request frame straight to a [`FrameHandler`] and
//! parks the answer in a single response slot, the way a shared-memory
//! mailbox between host and co-processor behaves. The slot can be configured
//! to report "not ready" for a number of polls before delivering.
use log::trace;

use super::{
    header::MAX_FRAME,
    transport::{Transport, TransportError},
};

/// Something that answers one request frame with one response frame.
pub trait FrameHandler {
    fn handle_frame(&mut self, frame: &[u8]) -> Vec<u8>;
}

#[derive(Debug)]
pub struct Loopback<H: FrameHandler> {
    handler: H,
    connected: bool,
    latency: u32,
    max_frame: usize,
    slot: Option<(Vec<u8>, u32)>,
}

impl<H: FrameHandler> Loopback<H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            connected: false,
            latency: 0,
            max_frame: MAX_FRAME,
            slot: None,
        }
    }

    /// Number of `try_recv` polls that report "not ready" before a response
    /// becomes visible.
    pub fn with_latency(mut self, polls: u32) -> Self {
        self.latency = polls;
        self
    }

    pub fn with_max_frame(mut self, max_frame: usize) -> Self {
        self.max_frame = max_frame;
        self
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }
}

impl<H: FrameHandler> Transport for Loopback<H> {
    fn connect(&mut self) -> Result<(), TransportError> {
        self.connected = true;
        self.slot = None;
        Ok(())
    }

    fn send(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        if frame.len() > self.max_frame {
            return Err(TransportError::FrameTooLarge {
                len: frame.len(),
                max: self.max_frame,
            });
        }
        if self.slot.is_some() {
            return Err(TransportError::Occupied);
        }

        let response = self.handler.handle_frame(frame);
        trace!(
            "loopback answered {} byte frame with {} bytes",
            frame.len(),
            response.len()
        );
        self.slot = Some((response, self.latency));
        Ok(())
    }

    fn try_recv(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        match self.slot.as_mut() {
            Some((_, polls)) if *polls > 0 => {
                *polls -= 1;
                Ok(None)
            }
            Some(_) => Ok(self.slot.take().map(|(frame, _)| frame)),
            None => Ok(None),
        }
    }

    fn disconnect(&mut self) -> Result<(), TransportError> {
        self.connected = false;
        self.slot = None;
        Ok(())
    }

    fn max_frame(&self) -> usize {
        self.max_frame
    }
}
