//! Client and server settings.
//!
//! Both structs have working defaults; the binaries override fields from their
//! command line arguments.
use std::time::Duration;

use crate::server::DmaPolicy;

/// How the client waits while the channel reports "not ready".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PollStrategy {
    Spin,
    #[default]
    Yield,
    Sleep(Duration),
}

#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub poll: PollStrategy,
    /// Payload limit below the channel's own. `None` uses the channel's
    /// maximum frame minus the header.
    pub max_payload: Option<usize>,
}

impl ClientConfig {
    pub fn with_poll(mut self, poll: PollStrategy) -> Self {
        self.poll = poll;
        self
    }

    pub fn with_max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = Some(max_payload);
        self
    }
}

/// What the server answers when asked to erase a key it has never seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EraseMissing {
    #[default]
    NotFound,
    Ignore,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub server_id: u32,
    pub first_client_id: u32,
    pub server_nvm_id: u32,
    /// Transient key cache slots.
    pub key_slots: usize,
    /// Bytes of object storage.
    pub nvm_capacity: u32,
    pub nvm_max_objects: u16,
    pub dma: DmaPolicy,
    pub erase_missing: EraseMissing,
    /// Connection workers for the network listener.
    pub workers: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_id: 0x5653_4D01,
            first_client_id: 1,
            server_nvm_id: 1,
            key_slots: 8,
            nvm_capacity: 16 * 1024,
            nvm_max_objects: 32,
            dma: DmaPolicy::Disabled,
            erase_missing: EraseMissing::NotFound,
            workers: 4,
        }
    }
}

impl ServerConfig {
    pub fn with_dma(mut self, dma: DmaPolicy) -> Self {
        self.dma = dma;
        self
    }

    pub fn with_erase_missing(mut self, erase_missing: EraseMissing) -> Self {
        self.erase_missing = erase_missing;
        self
    }

    pub fn with_key_slots(mut self, key_slots: usize) -> Self {
        self.key_slots = key_slots;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_nvm_capacity(mut self, capacity: u32, max_objects: u16) -> Self {
        self.nvm_capacity = capacity;
        self.nvm_max_objects = max_objects;
        self
    }
}
