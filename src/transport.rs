//! The physical transport contract.
//!
//! rankmesh does not implement a network: endpoint creation, non-blocking
//! tagged send/recv, and progress are provided by an external transport
//! (an RDMA library, shared memory, a loopback test double). This module
//! pins down the seam the point-to-point engine drives.
//!
//! Progress is synchronous and cooperative: `progress()` never blocks, may
//! invoke queued completion callbacks inline, and must only ever be driven
//! from one thread per transport context.

use crate::error::Result;
use crate::types::Rank;

/// The 64-bit tag carried on every message, used for receiver-side matching.
pub type WireTag = u64;

/// Opaque transport endpoint handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint(pub u64);

/// Opaque handle to one in-flight operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransportRequest(pub u64);

/// Completion state of a request, as reported by `Transport::status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestStatus {
    Pending,
    Complete,
    Failed(String),
}

/// Who releases the request handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMode {
    /// The transport frees the request right after the completion callback.
    AutoFree,
    /// The issuer retains the handle and frees it explicitly after observing
    /// terminal completion.
    Retained,
}

/// Invoked inline from `progress()` when an operation reaches a terminal
/// state.
pub type Completion = Box<dyn FnOnce(Result<()>) + Send>;

/// Pack side of the generic-datatype callback table: a cursor over a
/// possibly non-contiguous source buffer. Releasing the cursor is `Drop`.
pub trait PackStream: Send {
    /// Total bytes the stream will produce.
    fn packed_size(&self) -> usize;

    /// Copy up to `dest.len()` bytes starting at `offset` into `dest`,
    /// returning the byte count written. A return of 0 for a non-empty
    /// request signals an internal failure and the transport treats it as a
    /// hard error.
    fn pack(&mut self, offset: usize, dest: &mut [u8]) -> usize;
}

/// Unpack side of the generic-datatype callback table.
pub trait UnpackStream: Send {
    /// Total bytes the stream expects to consume.
    fn packed_size(&self) -> usize;

    /// Copy `src` into the destination buffer at `offset`. Fails with
    /// `LengthMismatch` when the delivered bytes overrun the expected total.
    fn unpack(&mut self, offset: usize, src: &[u8]) -> Result<()>;
}

/// Outbound payload: contiguous buffers bypass packing entirely.
pub enum SendData {
    Contiguous {
        ptr: u64,
        len: usize,
        /// Native contiguous-datatype handle (see `Transport::contig_datatype`).
        dtype: u64,
    },
    Generic(Box<dyn PackStream>),
}

/// Inbound payload destination.
pub enum RecvData {
    Contiguous {
        ptr: u64,
        len: usize,
        dtype: u64,
    },
    Generic(Box<dyn UnpackStream>),
}

/// Non-blocking tagged transport, assumed provided by the embedding runtime.
pub trait Transport {
    /// Create an endpoint from an opaque address blob (address-exchange
    /// interface).
    fn endpoint(&mut self, address: &[u8]) -> Result<Endpoint>;

    /// The opaque address blob for a global rank.
    fn rank_address(&mut self, rank: Rank) -> Result<Vec<u8>>;

    /// Native handle describing a contiguous block of `len` bytes.
    fn contig_datatype(&mut self, len: usize) -> u64;

    /// Issue a non-blocking tagged send. The callback fires from a later
    /// `progress()` call (or inline, if the operation completes immediately).
    fn isend(
        &mut self,
        ep: Endpoint,
        data: SendData,
        tag: WireTag,
        mode: RequestMode,
        on_complete: Completion,
    ) -> Result<TransportRequest>;

    /// Issue a non-blocking tagged receive matching `tag` under `tag_mask`.
    fn irecv(
        &mut self,
        data: RecvData,
        tag: WireTag,
        tag_mask: WireTag,
        mode: RequestMode,
        on_complete: Completion,
    ) -> Result<TransportRequest>;

    /// Advance outstanding operations; returns the number of completions
    /// fired. Synchronous and non-blocking.
    fn progress(&mut self) -> usize;

    /// Completion state of a retained request.
    fn status(&self, req: TransportRequest) -> RequestStatus;

    /// Release a retained request handle.
    fn free(&mut self, req: TransportRequest);
}

/// Out-of-band endpoint directory: when configured, endpoint resolution
/// delegates here instead of the transport's address exchange.
pub trait EndpointDirectory {
    fn endpoint(&mut self, rank: Rank) -> Result<Endpoint>;
}
