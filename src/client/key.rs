//! Key lifecycle.
//!
//! Keys live in a transient cache on the server, distinct from its object
//! storage. A key is *cached*, may be *committed* (persisted as a storage
//! object under the same id), *evicted* from the cache, or *erased* from
//! storage. The client keeps only the id and label; once [`Client::key_cache`]
//! returns, the caller's key buffer is no longer referenced.
use crate::protocol::{
    Kind, Label, Transport,
    header::{action, encode_body, group},
    message::{
        IdRequest, KEY_CACHE_REQUEST_SIZE, KEY_EXPORT_RESPONSE_SIZE, KeyCacheRequest,
        KeyCacheResponse, KeyExportResponse, RcResponse,
    },
};

use super::{Client, ClientError, Operation, ensure_fits, nvm::NvmId, parse};

/// Keys share the storage id namespace once committed.
pub type KeyId = NvmId;

/// Places key material in the server cache. `id` is a preference; the
/// server may assign a different one.
pub struct KeyCache<'a> {
    pub flags: u32,
    pub label: Label,
    pub key: &'a [u8],
    pub id: Option<KeyId>,
}

impl Operation for KeyCache<'_> {
    type Output = KeyId;

    fn kind(&self) -> Kind {
        Kind::new(group::KEY, action::key::CACHE)
    }

    fn encode(&self, max_payload: usize) -> Result<Vec<u8>, ClientError> {
        ensure_fits(
            "key",
            self.key.len(),
            max_payload.saturating_sub(KEY_CACHE_REQUEST_SIZE),
        )?;
        if self.id == Some(0) {
            return Err(ClientError::InvalidArgument(
                "key id 0 is reserved".to_string(),
            ));
        }

        let req = KeyCacheRequest {
            flags: self.flags,
            len: self.key.len() as u32,
            id: self.id.unwrap_or(0),
            label: self.label,
        };
        Ok(encode_body(&req, self.key)?)
    }

    fn decode(self, payload: &[u8]) -> Result<Self::Output, ClientError> {
        let (resp, _): (KeyCacheResponse, _) = parse(payload)?;
        Ok(resp.id)
    }
}

/// Copies a cached key and its label back into `out`.
pub struct KeyExport<'a> {
    pub id: KeyId,
    pub out: &'a mut [u8],
}

impl Operation for KeyExport<'_> {
    type Output = (Label, usize);

    fn kind(&self) -> Kind {
        Kind::new(group::KEY, action::key::EXPORT)
    }

    fn encode(&self, _: usize) -> Result<Vec<u8>, ClientError> {
        Ok(encode_body(&IdRequest { id: self.id }, &[])?)
    }

    fn decode(self, payload: &[u8]) -> Result<Self::Output, ClientError> {
        let (resp, key): (KeyExportResponse, _) = parse(payload)?;
        if resp.len as usize != key.len() {
            return Err(ClientError::Malformed(
                crate::protocol::FrameError::SizeMismatch {
                    declared: resp.len as usize,
                    actual: key.len(),
                },
            ));
        }
        if key.len() > self.out.len() {
            return Err(ClientError::BufferTooSmall {
                len: key.len(),
                capacity: self.out.len(),
            });
        }

        self.out[..key.len()].copy_from_slice(key);
        Ok((resp.label, key.len()))
    }
}

/// Evict, commit and erase share one shape: an id in, a result code out.
pub struct KeyAction {
    pub action: u16,
    pub id: KeyId,
}

impl KeyAction {
    pub fn evict(id: KeyId) -> Self {
        Self {
            action: action::key::EVICT,
            id,
        }
    }

    pub fn commit(id: KeyId) -> Self {
        Self {
            action: action::key::COMMIT,
            id,
        }
    }

    pub fn erase(id: KeyId) -> Self {
        Self {
            action: action::key::ERASE,
            id,
        }
    }
}

impl Operation for KeyAction {
    type Output = ();

    fn kind(&self) -> Kind {
        Kind::new(group::KEY, self.action)
    }

    fn encode(&self, _: usize) -> Result<Vec<u8>, ClientError> {
        Ok(encode_body(&IdRequest { id: self.id }, &[])?)
    }

    fn decode(self, payload: &[u8]) -> Result<Self::Output, ClientError> {
        let _: (RcResponse, _) = parse(payload)?;
        Ok(())
    }
}

impl<T: Transport> Client<T> {
    pub fn key_cache(
        &mut self,
        flags: u32,
        label: &[u8],
        key: &[u8],
        id: Option<KeyId>,
    ) -> Result<KeyId, ClientError> {
        let label = Label::new(label)?;
        self.execute(KeyCache {
            flags,
            label,
            key,
            id,
        })
    }

    /// Exports into `out`, failing rather than truncating when the key does
    /// not fit. Returns the label and the key length.
    pub fn key_export_into(
        &mut self,
        id: KeyId,
        out: &mut [u8],
    ) -> Result<(Label, usize), ClientError> {
        self.execute(KeyExport { id, out })
    }

    pub fn key_export(&mut self, id: KeyId) -> Result<(Label, Vec<u8>), ClientError> {
        let mut out = vec![0; self.max_payload().saturating_sub(KEY_EXPORT_RESPONSE_SIZE)];
        let (label, len) = self.key_export_into(id, &mut out)?;
        out.truncate(len);
        Ok((label, out))
    }

    pub fn key_commit(&mut self, id: KeyId) -> Result<(), ClientError> {
        self.execute(KeyAction::commit(id))
    }

    pub fn key_evict(&mut self, id: KeyId) -> Result<(), ClientError> {
        self.execute(KeyAction::evict(id))
    }

    pub fn key_erase(&mut self, id: KeyId) -> Result<(), ClientError> {
        self.execute(KeyAction::erase(id))
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        ServerConfig,
        client::testing::{session, session_with},
        config::EraseMissing,
        protocol::ErrorCode,
    };

    use super::*;

    #[test]
    fn cache_export_commit_evict_scenario() {
        let mut client = session();

        let id = client.key_cache(0, b"k1", &[0; 16], Some(5)).unwrap();
        assert_eq!(id, 5);

        let (label, key) = client.key_export(5).unwrap();
        assert_eq!(label.as_bytes(), b"k1");
        assert_eq!(key, vec![0; 16]);

        client.key_commit(5).unwrap();
        client.key_evict(5).unwrap();

        let err = client.key_export(5).unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::NotFound));
    }

    #[test]
    fn export_round_trips_every_size() {
        let mut client = session();
        let limit = client.max_payload() - KEY_CACHE_REQUEST_SIZE;

        for len in [0, 1, 31, 32, 257, limit] {
            let key: Vec<u8> = (0..len).map(|i| i as u8).collect();
            let id = client.key_cache(7, b"sized", &key, None).unwrap();
            let (label, exported) = client.key_export(id).unwrap();

            assert_eq!(label.as_bytes(), b"sized");
            assert_eq!(exported, key);
            client.key_evict(id).unwrap();
        }
    }

    #[test]
    fn server_assigns_ids() {
        let mut client = session();
        let a = client.key_cache(0, b"a", &[1], None).unwrap();
        let b = client.key_cache(0, b"b", &[2], None).unwrap();

        assert_ne!(a, 0);
        assert_ne!(a, b);
    }

    #[test]
    fn oversize_key_fails_locally() {
        let mut client = session();
        let issued = client.last_issued();
        let key = vec![0; client.max_payload()];

        assert!(matches!(
            client.key_cache(0, b"big", &key, None),
            Err(ClientError::TooLarge { what: "key", .. })
        ));
        assert!(matches!(
            client.key_cache(0, &[b'x'; 33], b"k", None),
            Err(ClientError::TooLarge { what: "label", .. })
        ));
        assert_eq!(client.last_issued(), issued);
    }

    #[test]
    fn export_checks_capacity() {
        let mut client = session();
        let id = client.key_cache(0, b"k", &[9; 32], None).unwrap();
        let mut small = [0; 16];

        assert!(matches!(
            client.key_export_into(id, &mut small),
            Err(ClientError::BufferTooSmall {
                len: 32,
                capacity: 16
            })
        ));

        let mut exact = [0; 32];
        let (_, len) = client.key_export_into(id, &mut exact).unwrap();
        assert_eq!(len, 32);
        assert_eq!(exact, [9; 32]);
    }

    #[test]
    fn commit_requires_cached_key() {
        let mut client = session();
        assert_eq!(
            client.key_commit(42).unwrap_err().code(),
            Some(ErrorCode::NotFound)
        );

        let id = client.key_cache(0, b"k", &[1; 8], Some(42)).unwrap();
        client.key_commit(id).unwrap();
    }

    #[test]
    fn evict_keeps_committed_copy() {
        let mut client = session();
        let id = client.key_cache(0, b"persist", &[3; 24], None).unwrap();
        client.key_commit(id).unwrap();
        client.key_evict(id).unwrap();

        assert!(client.key_export(id).is_err());
        assert_eq!(client.nvm_read(id, 0, 24).unwrap(), vec![3; 24]);
        assert_eq!(client.nvm_metadata(id).unwrap().label.as_bytes(), b"persist");
    }

    #[test]
    fn erase_removes_committed_copy() {
        let mut client = session();
        let id = client.key_cache(0, b"gone", &[4; 8], None).unwrap();
        client.key_commit(id).unwrap();
        client.key_erase(id).unwrap();

        assert_eq!(
            client.nvm_metadata(id).unwrap_err().code(),
            Some(ErrorCode::NotFound)
        );
    }

    #[test]
    fn erase_of_unknown_key_follows_server_policy() {
        let mut strict = session();
        assert_eq!(
            strict.key_erase(77).unwrap_err().code(),
            Some(ErrorCode::NotFound)
        );

        let mut lenient =
            session_with(ServerConfig::default().with_erase_missing(EraseMissing::Ignore));
        assert!(lenient.key_erase(77).is_ok());
    }

    #[test]
    fn cache_full() {
        let mut client = session_with(ServerConfig::default().with_key_slots(2));
        client.key_cache(0, b"a", &[1], None).unwrap();
        client.key_cache(0, b"b", &[2], None).unwrap();

        assert_eq!(
            client.key_cache(0, b"c", &[3], None).unwrap_err().code(),
            Some(ErrorCode::NoSpace)
        );
    }

    #[test]
    fn reserved_id() {
        let mut client = session();
        assert!(matches!(
            client.key_cache(0, b"a", &[1], Some(0)),
            Err(ClientError::InvalidArgument(_))
        ));
    }
}
