//! Direct-memory object storage.
//!
//! Instead of carrying object bytes in the payload, these requests hand the
//! server a host address and a length, and the server reads or writes the
//! client's memory itself. That only works when both sides share an address
//! space through a trusted mapping, so this lives behind [`Client::dma`]
//! rather than on the client directly.
//!
//! The slice-taking methods derive addresses from buffers the borrow checker
//! keeps alive and unaliased for the whole blocking call. The `_raw` methods
//! take bare addresses and are `unsafe`: the caller promises the region stays
//! valid and untouched until the response arrives.
//!
//! Address width is a type parameter, `u32` or `u64`, picked at the call
//! site; [`NativeAddr`] matches the host pointer width.
use std::fmt;

use bincode::{Decode, Encode};

use crate::protocol::{
    Kind, NvmMetadata, Transport,
    header::{action, encode_body, group},
    message::{NvmAddObjectDmaRequest, NvmReadDmaRequest, RcResponse},
};

use super::{Client, ClientError, Operation, nvm::NvmId, parse};

mod sealed {
    pub trait Sealed {}

    impl Sealed for u32 {}
    impl Sealed for u64 {}
}

/// A host address as carried on the wire.
pub trait HostAddr:
    sealed::Sealed + Copy + fmt::Debug + fmt::LowerHex + Encode + Decode<()>
{
    const ADD_OBJECT: u16;
    const READ: u16;

    /// Fails when the pointer does not fit this width.
    fn from_ptr(ptr: *const u8) -> Result<Self, ClientError>;
}

impl HostAddr for u32 {
    const ADD_OBJECT: u16 = action::nvm::ADD_OBJECT_DMA32;
    const READ: u16 = action::nvm::READ_DMA32;

    fn from_ptr(ptr: *const u8) -> Result<Self, ClientError> {
        let addr = ptr.expose_provenance();
        u32::try_from(addr).map_err(|_| {
            ClientError::InvalidArgument(format!("address {addr:#x} does not fit 32 bits"))
        })
    }
}

impl HostAddr for u64 {
    const ADD_OBJECT: u16 = action::nvm::ADD_OBJECT_DMA64;
    const READ: u16 = action::nvm::READ_DMA64;

    fn from_ptr(ptr: *const u8) -> Result<Self, ClientError> {
        Ok(ptr.expose_provenance() as u64)
    }
}

#[cfg(target_pointer_width = "64")]
pub type NativeAddr = u64;
#[cfg(not(target_pointer_width = "64"))]
pub type NativeAddr = u32;

pub struct NvmAddObjectDma<A: HostAddr> {
    pub metadata_hostaddr: A,
    pub data_hostaddr: A,
    pub data_len: u16,
}

impl<A: HostAddr> Operation for NvmAddObjectDma<A> {
    type Output = ();

    fn kind(&self) -> Kind {
        Kind::new(group::NVM, A::ADD_OBJECT)
    }

    fn encode(&self, _: usize) -> Result<Vec<u8>, ClientError> {
        let req = NvmAddObjectDmaRequest {
            metadata_hostaddr: self.metadata_hostaddr,
            data_hostaddr: self.data_hostaddr,
            data_len: self.data_len,
        };
        Ok(encode_body(&req, &[])?)
    }

    fn decode(self, payload: &[u8]) -> Result<Self::Output, ClientError> {
        let _: (RcResponse, _) = parse(payload)?;
        Ok(())
    }
}

pub struct NvmReadDma<A: HostAddr> {
    pub id: NvmId,
    pub offset: u16,
    pub len: u16,
    pub data_hostaddr: A,
}

impl<A: HostAddr> Operation for NvmReadDma<A> {
    type Output = ();

    fn kind(&self) -> Kind {
        Kind::new(group::NVM, A::READ)
    }

    fn encode(&self, _: usize) -> Result<Vec<u8>, ClientError> {
        let req = NvmReadDmaRequest {
            id: self.id,
            offset: self.offset,
            len: self.len,
            data_hostaddr: self.data_hostaddr,
        };
        Ok(encode_body(&req, &[])?)
    }

    fn decode(self, payload: &[u8]) -> Result<Self::Output, ClientError> {
        let _: (RcResponse, _) = parse(payload)?;
        Ok(())
    }
}

/// Direct-memory access to object storage, borrowed from a [`Client`].
pub struct Dma<'c, T: Transport> {
    client: &'c mut Client<T>,
}

impl<T: Transport> Client<T> {
    pub fn dma(&mut self) -> Dma<'_, T> {
        Dma { client: self }
    }
}

fn data_len(len: usize) -> Result<u16, ClientError> {
    u16::try_from(len).map_err(|_| ClientError::TooLarge {
        what: "direct-memory region",
        len,
        limit: usize::from(u16::MAX),
    })
}

impl<T: Transport> Dma<'_, T> {
    /// Stores `data` under `metadata.id` without copying it into the request.
    pub fn add_object<A: HostAddr>(
        &mut self,
        metadata: &NvmMetadata,
        data: &[u8],
    ) -> Result<(), ClientError> {
        let len = data_len(data.len())?;
        let metadata = encode_body(&NvmMetadata { len, ..*metadata }, &[])?;
        let metadata_hostaddr = A::from_ptr(metadata.as_ptr())?;
        let data_hostaddr = A::from_ptr(data.as_ptr())?;

        // SAFETY: both regions are borrowed (`metadata` owned here, `data` by
        // the caller) until `execute` returns, which is after the response.
        unsafe { self.add_object_raw(metadata_hostaddr, len, data_hostaddr) }
    }

    /// Fills `out` from the object starting at `offset`. Bytes past the end
    /// of the object are left as they were.
    pub fn read<A: HostAddr>(
        &mut self,
        id: NvmId,
        offset: u16,
        out: &mut [u8],
    ) -> Result<(), ClientError> {
        let len = data_len(out.len())?;
        let data_hostaddr = A::from_ptr(out.as_mut_ptr())?;

        // SAFETY: `out` is exclusively borrowed until the response arrives.
        unsafe { self.read_raw(id, offset, len, data_hostaddr) }
    }

    /// # Safety
    ///
    /// `metadata_hostaddr` must point at an encoded [`NvmMetadata`] and
    /// `data_hostaddr` at `data_len` readable bytes, both valid and unmodified
    /// until this call returns.
    pub unsafe fn add_object_raw<A: HostAddr>(
        &mut self,
        metadata_hostaddr: A,
        data_len: u16,
        data_hostaddr: A,
    ) -> Result<(), ClientError> {
        self.client.execute(NvmAddObjectDma {
            metadata_hostaddr,
            data_hostaddr,
            data_len,
        })
    }

    /// # Safety
    ///
    /// `data_hostaddr` must point at `len` writable bytes that nothing else
    /// reads or writes until this call returns.
    pub unsafe fn read_raw<A: HostAddr>(
        &mut self,
        id: NvmId,
        offset: u16,
        len: u16,
        data_hostaddr: A,
    ) -> Result<(), ClientError> {
        self.client.execute(NvmReadDma {
            id,
            offset,
            len,
            data_hostaddr,
        })
    }
}
