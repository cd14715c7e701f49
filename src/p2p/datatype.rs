//! Buffer layout descriptions and the pack/unpack adaptor.
//!
//! A `Datatype` describes the memory a message occupies: a single contiguous
//! block, or a scatter of regions. Contiguous data bypasses packing and rides
//! the transport's native contiguous datatype, whose handle is memoized on
//! the `Datatype` the first time it is needed. Scattered data goes through
//! `IovStream`, which implements the transport's generic pack/unpack
//! contract with one cursor per operation.

use std::sync::OnceLock;

use crate::error::{MeshError, Result};
use crate::transport::{PackStream, Transport, UnpackStream};
use crate::types::IoVec;

/// Description of one message's buffer layout.
#[derive(Debug)]
pub struct Datatype {
    regions: Vec<IoVec>,
    /// Native contiguous-datatype handle, computed once on first use and
    /// reused for the lifetime of this object. Not invalidated if the
    /// transport context is swapped out underneath; accepted trade-off.
    contig: OnceLock<u64>,
}

impl Datatype {
    /// A single contiguous block.
    pub fn contiguous(ptr: u64, len: usize) -> Self {
        Self {
            regions: vec![IoVec::new(ptr, len)],
            contig: OnceLock::new(),
        }
    }

    /// A scatter of regions, packed in order.
    pub fn vector(regions: Vec<IoVec>) -> Result<Self> {
        if regions.is_empty() {
            return Err(MeshError::invalid("datatype with no regions"));
        }
        Ok(Self {
            regions,
            contig: OnceLock::new(),
        })
    }

    /// Total payload bytes.
    pub fn packed_size(&self) -> usize {
        self.regions.iter().map(|r| r.len).sum()
    }

    /// Contiguous layouts skip the pack path entirely.
    pub fn is_contiguous(&self) -> bool {
        self.regions.len() == 1
    }

    pub(crate) fn regions(&self) -> &[IoVec] {
        &self.regions
    }

    /// The memoized native contiguous handle for this layout.
    pub(crate) fn contig_handle<T: Transport + ?Sized>(&self, transport: &mut T) -> u64 {
        *self
            .contig
            .get_or_init(|| transport.contig_datatype(self.packed_size()))
    }
}

/// Cursor over a scatter of regions; one per in-flight operation. Dropping
/// the cursor releases it.
pub(crate) struct IovStream {
    regions: Vec<IoVec>,
    total: usize,
}

impl IovStream {
    /// # Safety
    /// Every region must point to memory valid for its full length, readable
    /// for sends and writable for receives, and must stay valid until the
    /// operation using this cursor completes.
    pub(crate) unsafe fn new(regions: &[IoVec]) -> Self {
        Self {
            regions: regions.to_vec(),
            total: regions.iter().map(|r| r.len).sum(),
        }
    }

    /// Walk regions overlapping `[offset, offset + len)`, handing each
    /// overlap to `visit` as `(region address, bytes)`.
    fn walk(&self, offset: usize, len: usize, mut visit: impl FnMut(u64, usize)) {
        let mut skip = offset;
        let mut remaining = len;
        for region in &self.regions {
            if remaining == 0 {
                break;
            }
            if skip >= region.len {
                skip -= region.len;
                continue;
            }
            let take = (region.len - skip).min(remaining);
            visit(region.ptr + skip as u64, take);
            skip = 0;
            remaining -= take;
        }
    }
}

impl PackStream for IovStream {
    fn packed_size(&self) -> usize {
        self.total
    }

    fn pack(&mut self, offset: usize, dest: &mut [u8]) -> usize {
        if offset > self.total {
            return 0;
        }
        let len = dest.len().min(self.total - offset);
        let mut written = 0;
        self.walk(offset, len, |src, take| {
            // SAFETY: region validity is guaranteed by `IovStream::new`'s
            // contract; `walk` never exceeds region bounds.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    src as *const u8,
                    dest.as_mut_ptr().add(written),
                    take,
                );
            }
            written += take;
        });
        written
    }
}

impl UnpackStream for IovStream {
    fn packed_size(&self) -> usize {
        self.total
    }

    fn unpack(&mut self, offset: usize, src: &[u8]) -> Result<()> {
        if offset + src.len() > self.total {
            return Err(MeshError::LengthMismatch {
                expected: self.total.saturating_sub(offset),
                actual: src.len(),
            });
        }
        let mut consumed = 0;
        self.walk(offset, src.len(), |dst, take| {
            // SAFETY: region validity per `IovStream::new`; `walk` stays in
            // bounds and `src` is at least `offset + len` long (checked above).
            unsafe {
                std::ptr::copy_nonoverlapping(src.as_ptr().add(consumed), dst as *mut u8, take);
            }
            consumed += take;
        });
        Ok(())
    }
}
