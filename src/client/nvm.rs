//! Non-volatile object storage.
//!
//! Objects are labeled byte strings addressed by a 16-bit id. This module
//! moves object data inside the message payload; see [`dma`](super::dma) for
//! the variants where the server reads and writes host memory directly.
use crate::protocol::{
    Kind, Label, NvmMetadata, Transport,
    header::{action, encode_body, group},
    message::{
        IdRequest, METADATA_SIZE, NVM_MAX_DESTROY, NVM_READ_RESPONSE_SIZE, NvmAvailableResponse,
        NvmDestroyRequest, NvmInitResponse, NvmListRequest, NvmListResponse,
        NvmMetadataResponse, NvmReadRequest, NvmReadResponse, RcResponse,
    },
};

use super::{Client, ClientError, Operation, ensure_fits, parse, wire_len};

pub type NvmId = u16;
pub type NvmAccess = u16;
pub type NvmFlags = u16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NvmIds {
    pub client_nvm_id: u32,
    pub server_nvm_id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NvmAvailable {
    pub avail_size: u32,
    pub avail_objects: u16,
    pub reclaim_size: u32,
    pub reclaim_objects: u16,
}

/// One step of an id enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NvmListing {
    /// Matching objects with an id at or above the start id.
    pub count: u16,
    /// Smallest of them; meaningless when `count` is zero.
    pub id: NvmId,
}

fn id_payload(id: NvmId) -> Result<Vec<u8>, ClientError> {
    Ok(encode_body(&IdRequest { id }, &[])?)
}

/// Body-less request in the NVM group answered by a bare result code.
pub struct NvmCleanup;

impl Operation for NvmCleanup {
    type Output = ();

    fn kind(&self) -> Kind {
        Kind::new(group::NVM, action::nvm::CLEANUP)
    }

    fn encode(&self, _: usize) -> Result<Vec<u8>, ClientError> {
        Ok(Vec::new())
    }

    fn decode(self, payload: &[u8]) -> Result<Self::Output, ClientError> {
        let _: (RcResponse, _) = parse(payload)?;
        Ok(())
    }
}

pub struct NvmInit;

impl Operation for NvmInit {
    type Output = NvmIds;

    fn kind(&self) -> Kind {
        Kind::new(group::NVM, action::nvm::INIT)
    }

    fn encode(&self, _: usize) -> Result<Vec<u8>, ClientError> {
        Ok(Vec::new())
    }

    fn decode(self, payload: &[u8]) -> Result<Self::Output, ClientError> {
        let (resp, _): (NvmInitResponse, _) = parse(payload)?;
        Ok(NvmIds {
            client_nvm_id: resp.client_nvm_id,
            server_nvm_id: resp.server_nvm_id,
        })
    }
}

pub struct NvmGetAvailable;

impl Operation for NvmGetAvailable {
    type Output = NvmAvailable;

    fn kind(&self) -> Kind {
        Kind::new(group::NVM, action::nvm::GET_AVAILABLE)
    }

    fn encode(&self, _: usize) -> Result<Vec<u8>, ClientError> {
        Ok(Vec::new())
    }

    fn decode(self, payload: &[u8]) -> Result<Self::Output, ClientError> {
        let (resp, _): (NvmAvailableResponse, _) = parse(payload)?;
        Ok(NvmAvailable {
            avail_size: resp.avail_size,
            avail_objects: resp.avail_objects,
            reclaim_size: resp.reclaim_size,
            reclaim_objects: resp.reclaim_objects,
        })
    }
}

/// Stores `data` under `metadata.id`, replacing any existing object. The
/// metadata length is taken from `data`.
pub struct NvmAddObject<'a> {
    pub metadata: NvmMetadata,
    pub data: &'a [u8],
}

impl Operation for NvmAddObject<'_> {
    type Output = ();

    fn kind(&self) -> Kind {
        Kind::new(group::NVM, action::nvm::ADD_OBJECT)
    }

    fn encode(&self, max_payload: usize) -> Result<Vec<u8>, ClientError> {
        ensure_fits(
            "object data",
            self.data.len(),
            max_payload.saturating_sub(METADATA_SIZE),
        )?;
        let metadata = NvmMetadata {
            len: wire_len("object data", self.data.len())?,
            ..self.metadata
        };
        Ok(encode_body(&metadata, self.data)?)
    }

    fn decode(self, payload: &[u8]) -> Result<Self::Output, ClientError> {
        let _: (RcResponse, _) = parse(payload)?;
        Ok(())
    }
}

pub struct NvmList {
    pub access: NvmAccess,
    pub flags: NvmFlags,
    pub start_id: NvmId,
}

impl Operation for NvmList {
    type Output = NvmListing;

    fn kind(&self) -> Kind {
        Kind::new(group::NVM, action::nvm::LIST)
    }

    fn encode(&self, _: usize) -> Result<Vec<u8>, ClientError> {
        let req = NvmListRequest {
            access: self.access,
            flags: self.flags,
            start_id: self.start_id,
        };
        Ok(encode_body(&req, &[])?)
    }

    fn decode(self, payload: &[u8]) -> Result<Self::Output, ClientError> {
        let (resp, _): (NvmListResponse, _) = parse(payload)?;
        Ok(NvmListing {
            count: resp.count,
            id: resp.id,
        })
    }
}

pub struct NvmGetMetadata(pub NvmId);

impl Operation for NvmGetMetadata {
    type Output = NvmMetadata;

    fn kind(&self) -> Kind {
        Kind::new(group::NVM, action::nvm::GET_METADATA)
    }

    fn encode(&self, _: usize) -> Result<Vec<u8>, ClientError> {
        id_payload(self.0)
    }

    fn decode(self, payload: &[u8]) -> Result<Self::Output, ClientError> {
        let (resp, _): (NvmMetadataResponse, _) = parse(payload)?;
        Ok(resp.metadata)
    }
}

/// Bulk delete. Whether a partly unknown list deletes anything is the
/// server's decision; only the aggregate result comes back.
pub struct NvmDestroyObjects<'a>(pub &'a [NvmId]);

impl Operation for NvmDestroyObjects<'_> {
    type Output = ();

    fn kind(&self) -> Kind {
        Kind::new(group::NVM, action::nvm::DESTROY_OBJECTS)
    }

    fn encode(&self, _: usize) -> Result<Vec<u8>, ClientError> {
        ensure_fits("destroy list", self.0.len(), NVM_MAX_DESTROY)?;
        let ids: Vec<u8> = self.0.iter().flat_map(|id| id.to_be_bytes()).collect();
        let req = NvmDestroyRequest {
            count: self.0.len() as u16,
        };
        Ok(encode_body(&req, &ids)?)
    }

    fn decode(self, payload: &[u8]) -> Result<Self::Output, ClientError> {
        let _: (RcResponse, _) = parse(payload)?;
        Ok(())
    }
}

/// Reads up to `out.len()` bytes starting at `offset`. Fewer bytes come back
/// when the object ends first.
pub struct NvmRead<'a> {
    pub id: NvmId,
    pub offset: u16,
    pub out: &'a mut [u8],
}

impl Operation for NvmRead<'_> {
    type Output = usize;

    fn kind(&self) -> Kind {
        Kind::new(group::NVM, action::nvm::READ)
    }

    fn encode(&self, max_payload: usize) -> Result<Vec<u8>, ClientError> {
        ensure_fits(
            "read length",
            self.out.len(),
            max_payload.saturating_sub(NVM_READ_RESPONSE_SIZE),
        )?;
        let req = NvmReadRequest {
            id: self.id,
            offset: self.offset,
            len: wire_len("read length", self.out.len())?,
        };
        Ok(encode_body(&req, &[])?)
    }

    fn decode(self, payload: &[u8]) -> Result<Self::Output, ClientError> {
        let (resp, data): (NvmReadResponse, _) = parse(payload)?;
        if usize::from(resp.len) != data.len() {
            return Err(ClientError::Malformed(
                crate::protocol::FrameError::SizeMismatch {
                    declared: usize::from(resp.len),
                    actual: data.len(),
                },
            ));
        }
        if data.len() > self.out.len() {
            return Err(ClientError::BufferTooSmall {
                len: data.len(),
                capacity: self.out.len(),
            });
        }

        self.out[..data.len()].copy_from_slice(data);
        Ok(data.len())
    }
}

/// Walks every matching object id in ascending order, one list round trip
/// per id.
pub struct NvmIdIter<'c, T: Transport> {
    client: &'c mut Client<T>,
    access: NvmAccess,
    flags: NvmFlags,
    next: Option<NvmId>,
}

impl<T: Transport> Iterator for NvmIdIter<'_, T> {
    type Item = Result<NvmId, ClientError>;

    fn next(&mut self) -> Option<Self::Item> {
        let start_id = self.next?;
        let listing = self.client.nvm_list(self.access, self.flags, start_id);
        match listing {
            Ok(NvmListing { count: 0, .. }) => {
                self.next = None;
                None
            }
            Ok(NvmListing { id, .. }) => {
                self.next = id.checked_add(1);
                Some(Ok(id))
            }
            Err(e) => {
                self.next = None;
                Some(Err(e))
            }
        }
    }
}

impl<T: Transport> Client<T> {
    pub fn nvm_init(&mut self) -> Result<NvmIds, ClientError> {
        self.execute(NvmInit)
    }

    pub fn nvm_cleanup(&mut self) -> Result<(), ClientError> {
        self.execute(NvmCleanup)
    }

    pub fn nvm_available(&mut self) -> Result<NvmAvailable, ClientError> {
        self.execute(NvmGetAvailable)
    }

    pub fn nvm_add_object(
        &mut self,
        id: NvmId,
        access: NvmAccess,
        flags: NvmFlags,
        label: &[u8],
        data: &[u8],
    ) -> Result<(), ClientError> {
        let metadata = NvmMetadata {
            id,
            access,
            flags,
            len: 0,
            label: Label::new(label)?,
        };
        self.execute(NvmAddObject { metadata, data })
    }

    pub fn nvm_list(
        &mut self,
        access: NvmAccess,
        flags: NvmFlags,
        start_id: NvmId,
    ) -> Result<NvmListing, ClientError> {
        self.execute(NvmList {
            access,
            flags,
            start_id,
        })
    }

    pub fn nvm_ids(&mut self, access: NvmAccess, flags: NvmFlags) -> NvmIdIter<'_, T> {
        NvmIdIter {
            client: self,
            access,
            flags,
            next: Some(0),
        }
    }

    pub fn nvm_metadata(&mut self, id: NvmId) -> Result<NvmMetadata, ClientError> {
        self.execute(NvmGetMetadata(id))
    }

    pub fn nvm_read_into(
        &mut self,
        id: NvmId,
        offset: u16,
        out: &mut [u8],
    ) -> Result<usize, ClientError> {
        self.execute(NvmRead { id, offset, out })
    }

    pub fn nvm_read(&mut self, id: NvmId, offset: u16, len: u16) -> Result<Vec<u8>, ClientError> {
        let mut out = vec![0; usize::from(len)];
        let read = self.nvm_read_into(id, offset, &mut out)?;
        out.truncate(read);
        Ok(out)
    }

    pub fn nvm_destroy(&mut self, ids: &[NvmId]) -> Result<(), ClientError> {
        self.execute(NvmDestroyObjects(ids))
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        ClientConfig, ServerConfig,
        client::{
            SessionState,
            testing::{session, session_with},
        },
        protocol::{ErrorCode, Loopback},
        server::HsmServer,
    };

    use super::*;

    #[test]
    fn add_then_read_full_object() {
        let mut client = session();
        let data: Vec<u8> = (0..200).map(|i| i as u8).collect();
        client.nvm_add_object(3, 0, 0, b"blob", &data).unwrap();

        assert_eq!(client.nvm_read(3, 0, 200).unwrap(), data);
    }

    #[test]
    fn read_past_end_truncates() {
        let mut client = session();
        client.nvm_add_object(3, 0, 0, b"blob", b"0123456789").unwrap();

        assert_eq!(client.nvm_read(3, 6, 100).unwrap(), b"6789");
        assert_eq!(client.nvm_read(3, 10, 4).unwrap(), b"");
        assert_eq!(
            client.nvm_read(3, 11, 1).unwrap_err().code(),
            Some(ErrorCode::BadArgs)
        );
    }

    #[test]
    fn read_length_is_bounded_locally() {
        let mut client = session();
        let len = (client.max_payload() - NVM_READ_RESPONSE_SIZE + 1) as u16;

        assert!(matches!(
            client.nvm_read(1, 0, len),
            Err(ClientError::TooLarge {
                what: "read length",
                ..
            })
        ));
    }

    #[test]
    fn lengths_beyond_16_bits_are_refused_on_wide_channels() {
        let channel = Loopback::new(HsmServer::new(ServerConfig::default())).with_max_frame(70_000);
        let mut client = Client::connect(channel, ClientConfig::default()).unwrap();
        client.open().unwrap();
        let mut out = vec![0; 65_536];

        assert!(matches!(
            client.nvm_read_into(1, 0, &mut out),
            Err(ClientError::TooLarge {
                what: "read length",
                len: 65_536,
                ..
            })
        ));
        assert!(matches!(
            client.nvm_add_object(1, 0, 0, b"big", &out),
            Err(ClientError::TooLarge {
                what: "object data",
                len: 65_536,
                ..
            })
        ));
        assert_eq!(client.state(), SessionState::Idle);
    }

    #[test]
    fn metadata_reflects_object() {
        let mut client = session();
        client.nvm_add_object(9, 0x11, 0x22, b"meta", &[7; 33]).unwrap();
        let metadata = client.nvm_metadata(9).unwrap();

        assert_eq!(metadata.id, 9);
        assert_eq!(metadata.access, 0x11);
        assert_eq!(metadata.flags, 0x22);
        assert_eq!(metadata.len, 33);
        assert_eq!(metadata.label.as_bytes(), b"meta");
    }

    #[test]
    fn list_enumerates_in_ascending_order() {
        let mut client = session();
        for id in [40, 2, 17, 5] {
            client.nvm_add_object(id, 0, 0, b"", &[id as u8]).unwrap();
        }

        let listing = client.nvm_list(0, 0, 0).unwrap();
        assert_eq!(listing, NvmListing { count: 4, id: 2 });

        let ids: Vec<NvmId> = client.nvm_ids(0, 0).collect::<Result<_, _>>().unwrap();
        assert_eq!(ids, vec![2, 5, 17, 40]);

        assert_eq!(client.nvm_list(0, 0, 41).unwrap().count, 0);
    }

    #[test]
    fn list_filters_on_access_and_flags() {
        let mut client = session();
        client.nvm_add_object(1, 0x1, 0x0, b"", b"a").unwrap();
        client.nvm_add_object(2, 0x3, 0x4, b"", b"b").unwrap();
        client.nvm_add_object(3, 0x0, 0x4, b"", b"c").unwrap();

        let ids: Vec<NvmId> = client.nvm_ids(0x1, 0).collect::<Result<_, _>>().unwrap();
        assert_eq!(ids, vec![1, 2]);

        let ids: Vec<NvmId> = client.nvm_ids(0, 0x4).collect::<Result<_, _>>().unwrap();
        assert_eq!(ids, vec![2, 3]);
    }

    #[test]
    fn destroy_objects() {
        let mut client = session();
        client.nvm_add_object(1, 0, 0, b"", b"a").unwrap();
        client.nvm_add_object(2, 0, 0, b"", b"b").unwrap();
        client.nvm_destroy(&[1, 2]).unwrap();

        assert_eq!(client.nvm_list(0, 0, 0).unwrap().count, 0);
        assert!(matches!(
            client.nvm_destroy(&[1; NVM_MAX_DESTROY + 1]),
            Err(ClientError::TooLarge { .. })
        ));
    }

    #[test]
    fn destroy_reports_aggregate_result() {
        let mut client = session();
        client.nvm_add_object(1, 0, 0, b"", b"a").unwrap();

        let err = client.nvm_destroy(&[1, 99]).unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::NotFound));
    }

    #[test]
    fn available_tracks_usage_and_reclaim() {
        let mut client = session_with(ServerConfig::default().with_nvm_capacity(1024, 4));
        let empty = client.nvm_available().unwrap();
        assert_eq!(empty.avail_size, 1024);
        assert_eq!(empty.avail_objects, 4);

        client.nvm_add_object(1, 0, 0, b"", &[0; 100]).unwrap();
        client.nvm_destroy(&[1]).unwrap();
        let after = client.nvm_available().unwrap();
        assert_eq!(after.avail_size, 924);
        assert_eq!(after.reclaim_size, 100);
        assert_eq!(after.reclaim_objects, 1);

        client.nvm_cleanup().unwrap();
        assert_eq!(client.nvm_available().unwrap(), empty);
    }

    #[test]
    fn storage_full() {
        let mut client = session_with(ServerConfig::default().with_nvm_capacity(64, 8));

        assert_eq!(
            client
                .nvm_add_object(1, 0, 0, b"", &[0; 65])
                .unwrap_err()
                .code(),
            Some(ErrorCode::NoSpace)
        );
    }

    #[test]
    fn nvm_init_reports_ids() {
        let mut client = session();
        let ids = client.nvm_init().unwrap();

        assert_eq!(ids.server_nvm_id, ServerConfig::default().server_nvm_id);
    }
}
