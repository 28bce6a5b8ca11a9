//! Host memory access for the direct-memory object requests.
use std::ops::Range;

use log::warn;

use crate::protocol::ErrorCode;

/// Which host addresses the server may touch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum DmaPolicy {
    /// Every direct-memory request fails with [`ErrorCode::Access`].
    #[default]
    Disabled,
    /// Regions must lie entirely inside one of these ranges.
    AllowList(Vec<Range<u64>>),
    /// Client and server share one address space; any well-formed region goes.
    SharedAddressSpace,
}

impl DmaPolicy {
    pub fn check(&self, addr: u64, len: usize) -> Result<(), ErrorCode> {
        if *self == Self::Disabled {
            return Err(ErrorCode::Access);
        }
        if addr == 0 {
            return Err(ErrorCode::BadArgs);
        }
        let end = addr
            .checked_add(len as u64)
            .filter(|end| usize::try_from(*end).is_ok())
            .ok_or(ErrorCode::BadArgs)?;

        match self {
            Self::AllowList(regions)
                if !regions
                    .iter()
                    .any(|region| region.start <= addr && end <= region.end) =>
            {
                warn!("refusing region {addr:#x}..{end:#x} outside the allow list");
                Err(ErrorCode::Access)
            }
            _ => Ok(()),
        }
    }
}

/// # Safety
///
/// The region must have passed [`DmaPolicy::check`] and be readable host
/// memory for the duration of the call.
pub(crate) unsafe fn read_host(addr: u64, len: usize) -> Vec<u8> {
    if len == 0 {
        return Vec::new();
    }
    let ptr = std::ptr::with_exposed_provenance::<u8>(addr as usize);
    // SAFETY: upheld by the caller.
    unsafe { std::slice::from_raw_parts(ptr, len) }.to_vec()
}

/// # Safety
///
/// The region must have passed [`DmaPolicy::check`] for at least
/// `data.len()` bytes and be writable host memory nothing else is using.
pub(crate) unsafe fn write_host(addr: u64, data: &[u8]) {
    if data.is_empty() {
        return;
    }
    let ptr = std::ptr::with_exposed_provenance_mut::<u8>(addr as usize);
    // SAFETY: upheld by the caller.
    unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), ptr, data.len()) }
}
