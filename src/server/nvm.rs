//! In-memory object store with flash-like space accounting.
//!
//! Destroying or replacing an object does not free its space immediately; the
//! bytes become *reclaimable* until a compaction, which happens on cleanup or
//! when an add would otherwise not fit.
use std::collections::BTreeMap;

use log::debug;

use crate::protocol::{ErrorCode, NvmMetadata, message::NvmAvailableResponse};

#[derive(Debug, Clone)]
pub(crate) struct StoredObject {
    pub metadata: NvmMetadata,
    pub data: Vec<u8>,
}

#[derive(Debug)]
pub(crate) struct ObjectStore {
    capacity: u32,
    max_objects: u16,
    objects: BTreeMap<u16, StoredObject>,
    used: u32,
    reclaim_size: u32,
    reclaim_objects: u16,
}

impl ObjectStore {
    pub fn new(capacity: u32, max_objects: u16) -> Self {
        Self {
            capacity,
            max_objects,
            objects: BTreeMap::new(),
            used: 0,
            reclaim_size: 0,
            reclaim_objects: 0,
        }
    }

    fn free_size(&self) -> u32 {
        self.capacity
            .saturating_sub(self.used)
            .saturating_sub(self.reclaim_size)
    }

    fn free_objects(&self) -> u16 {
        self.max_objects
            .saturating_sub(self.objects.len() as u16)
            .saturating_sub(self.reclaim_objects)
    }

    pub fn available(&self) -> NvmAvailableResponse {
        NvmAvailableResponse {
            rc: 0,
            avail_size: self.free_size(),
            avail_objects: self.free_objects(),
            reclaim_size: self.reclaim_size,
            reclaim_objects: self.reclaim_objects,
        }
    }

    pub fn contains(&self, id: u16) -> bool {
        self.objects.contains_key(&id)
    }

    /// Stores an object, replacing any with the same id.
    pub fn add(&mut self, metadata: NvmMetadata, data: Vec<u8>) -> Result<(), ErrorCode> {
        if metadata.id == 0 || usize::from(metadata.len) != data.len() {
            return Err(ErrorCode::BadArgs);
        }

        let size = data.len() as u32;
        if self.free_size() < size || self.free_objects() < 1 {
            self.reclaim();
            if self.free_size() < size || self.free_objects() < 1 {
                return Err(ErrorCode::NoSpace);
            }
        }

        if let Some(old) = self.objects.remove(&metadata.id) {
            self.retire(&old);
        }
        self.used += size;
        self.objects
            .insert(metadata.id, StoredObject { metadata, data });
        Ok(())
    }

    /// Number of objects at or above `start_id` whose access and flags carry
    /// every bit of the filters, and the first of them.
    pub fn list(&self, access: u16, flags: u16, start_id: u16) -> (u16, u16) {
        let mut matching = self.objects.range(start_id..).filter(|(_, object)| {
            object.metadata.access & access == access && object.metadata.flags & flags == flags
        });

        let Some((&first, _)) = matching.next() else {
            return (0, 0);
        };
        (1 + matching.count() as u16, first)
    }

    pub fn metadata(&self, id: u16) -> Result<NvmMetadata, ErrorCode> {
        self.objects
            .get(&id)
            .map(|object| object.metadata)
            .ok_or(ErrorCode::NotFound)
    }

    /// Bytes from `offset`, cut short where the object ends.
    pub fn read(&self, id: u16, offset: u16, len: u16) -> Result<&[u8], ErrorCode> {
        let object = self.objects.get(&id).ok_or(ErrorCode::NotFound)?;
        let offset = usize::from(offset);
        if offset > object.data.len() {
            return Err(ErrorCode::BadArgs);
        }
        let end = (offset + usize::from(len)).min(object.data.len());
        Ok(&object.data[offset..end])
    }

    /// Removes every listed object, or none of them if any is unknown.
    pub fn destroy(&mut self, ids: &[u16]) -> Result<(), ErrorCode> {
        if let Some(missing) = ids.iter().find(|id| !self.contains(**id)) {
            debug!("destroy refused, object {missing} does not exist");
            return Err(ErrorCode::NotFound);
        }

        for id in ids {
            if let Some(old) = self.objects.remove(id) {
                self.retire(&old);
            }
        }
        Ok(())
    }

    fn retire(&mut self, object: &StoredObject) {
        let size = object.data.len() as u32;
        self.used -= size;
        self.reclaim_size += size;
        self.reclaim_objects += 1;
    }

    /// Compacts, returning reclaimable space to the free pool.
    pub fn reclaim(&mut self) {
        if self.reclaim_objects > 0 {
            debug!(
                "reclaiming {} bytes from {} objects",
                self.reclaim_size, self.reclaim_objects
            );
        }
        self.reclaim_size = 0;
        self.reclaim_objects = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object(id: u16, len: usize) -> (NvmMetadata, Vec<u8>) {
        (
            NvmMetadata {
                id,
                len: len as u16,
                ..Default::default()
            },
            vec![id as u8; len],
        )
    }

    #[test]
    fn replace_retires_old_copy() {
        let mut store = ObjectStore::new(100, 4);
        let (metadata, data) = object(1, 30);
        store.add(metadata, data).unwrap();
        let (metadata, data) = object(1, 20);
        store.add(metadata, data).unwrap();

        let available = store.available();
        assert_eq!(available.avail_size, 50);
        assert_eq!(available.reclaim_size, 30);
        assert_eq!(store.metadata(1).unwrap().len, 20);
    }

    #[test]
    fn add_compacts_when_needed() {
        let mut store = ObjectStore::new(100, 4);
        let (metadata, data) = object(1, 80);
        store.add(metadata, data).unwrap();
        store.destroy(&[1]).unwrap();

        let (metadata, data) = object(2, 90);
        store.add(metadata, data).unwrap();
        assert_eq!(store.available().reclaim_size, 0);
        assert_eq!(store.available().avail_size, 10);
    }

    #[test]
    fn object_slots_are_limited() {
        let mut store = ObjectStore::new(100, 1);
        let (metadata, data) = object(1, 1);
        store.add(metadata, data).unwrap();

        let (metadata, data) = object(2, 1);
        assert_eq!(store.add(metadata, data), Err(ErrorCode::NoSpace));
    }

    #[test]
    fn id_zero_and_length_mismatch() {
        let mut store = ObjectStore::new(100, 4);
        let (metadata, data) = object(0, 1);
        assert_eq!(store.add(metadata, data), Err(ErrorCode::BadArgs));

        let (metadata, _) = object(3, 4);
        assert_eq!(store.add(metadata, vec![0; 2]), Err(ErrorCode::BadArgs));
    }

    #[test]
    fn destroy_is_all_or_nothing() {
        let mut store = ObjectStore::new(100, 4);
        let (metadata, data) = object(1, 1);
        store.add(metadata, data).unwrap();

        assert_eq!(store.destroy(&[1, 2]), Err(ErrorCode::NotFound));
        assert!(store.contains(1));
    }

    #[test]
    fn list_counts_from_start() {
        let mut store = ObjectStore::new(100, 8);
        for id in [3, 1, 7] {
            let (metadata, data) = object(id, 1);
            store.add(metadata, data).unwrap();
        }

        assert_eq!(store.list(0, 0, 0), (3, 1));
        assert_eq!(store.list(0, 0, 2), (2, 3));
        assert_eq!(store.list(0, 0, 8), (0, 0));
    }
}
