//! Transient key cache.
//!
//! Cached keys share the id space of the object store: a fresh id is never
//! one that a committed key or an object already holds.
use std::collections::BTreeMap;

use log::debug;

use crate::{
    config::EraseMissing,
    protocol::{ErrorCode, Label, NvmMetadata},
};

use super::nvm::ObjectStore;

#[derive(Debug, Clone)]
pub(crate) struct CachedKey {
    pub flags: u32,
    pub label: Label,
    pub data: Vec<u8>,
}

#[derive(Debug)]
pub(crate) struct KeyStore {
    slots: usize,
    keys: BTreeMap<u16, CachedKey>,
}

impl KeyStore {
    pub fn new(slots: usize) -> Self {
        Self {
            slots,
            keys: BTreeMap::new(),
        }
    }

    /// Caches `key` under `requested`, or under a free id when that is 0.
    /// An id already in the cache is overwritten.
    pub fn cache(
        &mut self,
        requested: u16,
        key: CachedKey,
        nvm: &ObjectStore,
    ) -> Result<u16, ErrorCode> {
        let id = match requested {
            0 => (1..=u16::MAX)
                .find(|id| !self.keys.contains_key(id) && !nvm.contains(*id))
                .ok_or(ErrorCode::NoSpace)?,
            id => id,
        };

        if !self.keys.contains_key(&id) && self.keys.len() >= self.slots {
            debug!("key cache full ({} slots)", self.slots);
            return Err(ErrorCode::NoSpace);
        }

        debug!("caching {} byte key {id} (flags {:#x})", key.data.len(), key.flags);
        self.keys.insert(id, key);
        Ok(id)
    }

    pub fn get(&self, id: u16) -> Option<&CachedKey> {
        self.keys.get(&id)
    }

    pub fn evict(&mut self, id: u16) -> Result<(), ErrorCode> {
        self.keys
            .remove(&id)
            .map(|_| ())
            .ok_or(ErrorCode::NotFound)
    }

    /// Persists a cached key as an object with the same id and label.
    pub fn commit(&self, id: u16, nvm: &mut ObjectStore) -> Result<(), ErrorCode> {
        let key = self.keys.get(&id).ok_or(ErrorCode::NotFound)?;
        let len = u16::try_from(key.data.len()).map_err(|_| ErrorCode::NoSpace)?;
        let metadata = NvmMetadata {
            id,
            access: 0,
            flags: 0,
            len,
            label: key.label,
        };
        nvm.add(metadata, key.data.clone())
    }

    /// Drops both the cached and the committed copy.
    pub fn erase(
        &mut self,
        id: u16,
        nvm: &mut ObjectStore,
        missing: EraseMissing,
    ) -> Result<(), ErrorCode> {
        let cached = self.keys.remove(&id).is_some();
        let stored = nvm.contains(id);
        if stored {
            nvm.destroy(&[id])?;
        }

        match missing {
            EraseMissing::NotFound if !cached && !stored => Err(ErrorCode::NotFound),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(byte: u8) -> CachedKey {
        CachedKey {
            flags: 0,
            label: Label::try_from("k").unwrap(),
            data: vec![byte; 4],
        }
    }

    #[test]
    fn fresh_ids_skip_stored_objects() {
        let mut nvm = ObjectStore::new(1024, 8);
        let mut keys = KeyStore::new(4);
        keys.cache(1, key(1), &nvm).unwrap();
        keys.commit(1, &mut nvm).unwrap();
        keys.evict(1).unwrap();

        assert_eq!(keys.cache(0, key(2), &nvm), Ok(2));
    }

    #[test]
    fn recache_overwrites_in_place() {
        let nvm = ObjectStore::new(1024, 8);
        let mut keys = KeyStore::new(1);
        keys.cache(3, key(1), &nvm).unwrap();
        keys.cache(3, key(2), &nvm).unwrap();

        assert_eq!(keys.get(3).unwrap().data, vec![2; 4]);
    }

    #[test]
    fn committed_key_is_an_object() {
        let mut nvm = ObjectStore::new(1024, 8);
        let mut keys = KeyStore::new(1);
        keys.cache(9, key(7), &nvm).unwrap();
        keys.commit(9, &mut nvm).unwrap();

        let metadata = nvm.metadata(9).unwrap();
        assert_eq!(metadata.len, 4);
        assert_eq!(metadata.label.as_bytes(), b"k");
    }

    #[test]
    fn erase_clears_both_copies() {
        let mut nvm = ObjectStore::new(1024, 8);
        let mut keys = KeyStore::new(1);
        keys.cache(9, key(7), &nvm).unwrap();
        keys.commit(9, &mut nvm).unwrap();
        keys.erase(9, &mut nvm, EraseMissing::NotFound).unwrap();

        assert!(keys.get(9).is_none());
        assert!(!nvm.contains(9));
        assert_eq!(
            keys.erase(9, &mut nvm, EraseMissing::NotFound),
            Err(ErrorCode::NotFound)
        );
        assert_eq!(keys.erase(9, &mut nvm, EraseMissing::Ignore), Ok(()));
    }
}
