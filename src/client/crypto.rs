//! Algorithm offload.
//!
//! Algorithm implementations on the host never see key bytes once a key has
//! been cached on the server. They hold a key id (see [`DeviceKey`]) and send
//! opaque, algorithm-specific buffers through [`Client::crypto_call`].
use crate::protocol::{
    Kind, Label, Transport,
    header::{encode_body, group},
    message::{CRYPTO_REQUEST_SIZE, CryptoRequest, CryptoResponse},
};

use super::{Client, ClientError, Operation, ensure_fits, key::KeyId, parse, wire_len};

/// A key as the host knows it: an id and a label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyHandle {
    pub id: KeyId,
    pub label: Label,
}

/// Algorithm state that refers to an offloaded key by id.
pub trait DeviceKey {
    fn bind_key(&mut self, id: KeyId);

    fn unbind_key(&mut self);

    fn bound_key(&self) -> Option<KeyId>;
}

pub struct CryptoCall<'a> {
    pub algorithm: u16,
    pub key: KeyId,
    pub input: &'a [u8],
}

impl Operation for CryptoCall<'_> {
    type Output = Vec<u8>;

    fn kind(&self) -> Kind {
        Kind::new(group::CRYPTO, self.algorithm)
    }

    fn encode(&self, max_payload: usize) -> Result<Vec<u8>, ClientError> {
        ensure_fits(
            "algorithm input",
            self.input.len(),
            max_payload.saturating_sub(CRYPTO_REQUEST_SIZE),
        )?;
        let req = CryptoRequest {
            key_id: self.key,
            len: wire_len("algorithm input", self.input.len())?,
        };
        Ok(encode_body(&req, self.input)?)
    }

    fn decode(self, payload: &[u8]) -> Result<Self::Output, ClientError> {
        let (resp, output): (CryptoResponse, _) = parse(payload)?;
        if usize::from(resp.len) != output.len() {
            return Err(ClientError::Malformed(
                crate::protocol::FrameError::SizeMismatch {
                    declared: usize::from(resp.len),
                    actual: output.len(),
                },
            ));
        }
        Ok(output.to_vec())
    }
}

/// Generic offload context: an algorithm id plus the key it is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffloadContext {
    pub algorithm: u16,
    key: Option<KeyId>,
}

impl OffloadContext {
    pub fn new(algorithm: u16) -> Self {
        Self {
            algorithm,
            key: None,
        }
    }

    pub fn process<T: Transport>(
        &self,
        client: &mut Client<T>,
        input: &[u8],
    ) -> Result<Vec<u8>, ClientError> {
        let key = self.key.ok_or_else(|| {
            ClientError::InvalidArgument(format!(
                "algorithm {:#x} has no key bound",
                self.algorithm
            ))
        })?;
        client.crypto_call(self.algorithm, key, input)
    }
}

impl DeviceKey for OffloadContext {
    fn bind_key(&mut self, id: KeyId) {
        self.key = Some(id);
    }

    fn unbind_key(&mut self) {
        self.key = None;
    }

    fn bound_key(&self) -> Option<KeyId> {
        self.key
    }
}

impl<T: Transport> Client<T> {
    pub fn crypto_call(
        &mut self,
        algorithm: u16,
        key: KeyId,
        input: &[u8],
    ) -> Result<Vec<u8>, ClientError> {
        self.execute(CryptoCall {
            algorithm,
            key,
            input,
        })
    }

    /// Caches `key` and returns the handle algorithm contexts bind to.
    pub fn key_handle(
        &mut self,
        flags: u32,
        label: &[u8],
        key: &[u8],
    ) -> Result<KeyHandle, ClientError> {
        let id = self.key_cache(flags, label, key, None)?;
        Ok(KeyHandle {
            id,
            label: Label::new(label)?,
        })
    }
}
