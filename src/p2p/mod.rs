//! Asynchronous tagged point-to-point over virtual groups.
//!
//! The engine turns `(virtual rank, user tag)` into `(endpoint, wire tag)`
//! and issues non-blocking transport operations. Completion is cooperative:
//! nothing progresses unless the caller drives `test`/`testall`, which poll
//! the transport a bounded number of iterations per call.
//!
//! Completion accounting for a batch of operations lives in a shared
//! `TransferState`: per-direction in-flight counters and one fail-sticky
//! status (the first failure wins and is never overwritten).

pub mod tag;

mod datatype;

pub use datatype::Datatype;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::MeshConfig;
use crate::error::{MeshError, Result};
use crate::group::VirtualGroup;
use crate::transport::{
    Completion, Endpoint, EndpointDirectory, RecvData, RequestMode, RequestStatus, SendData,
    Transport, TransportRequest,
};
use crate::types::Rank;

use datatype::IovStream;

#[derive(Debug, Clone, Copy)]
enum Direction {
    Send,
    Recv,
}

/// Shared completion-tracking record for one logical step's operations.
#[derive(Debug, Default)]
pub struct TransferState {
    sends: AtomicU32,
    recvs: AtomicU32,
    status: Mutex<Option<MeshError>>,
}

impl TransferState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn pending_sends(&self) -> u32 {
        self.sends.load(Ordering::Acquire)
    }

    pub fn pending_recvs(&self) -> u32 {
        self.recvs.load(Ordering::Acquire)
    }

    /// True when no issued operation is still in flight.
    pub fn is_idle(&self) -> bool {
        self.pending_sends() == 0 && self.pending_recvs() == 0
    }

    /// The aggregated terminal status: the first recorded failure, if any.
    pub fn status(&self) -> Result<()> {
        match &*self.status.lock().expect("transfer status lock poisoned") {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    fn counter(&self, dir: Direction) -> &AtomicU32 {
        match dir {
            Direction::Send => &self.sends,
            Direction::Recv => &self.recvs,
        }
    }

    fn begin(&self, dir: Direction) {
        self.counter(dir).fetch_add(1, Ordering::AcqRel);
    }

    /// Roll back `begin` when the transport rejects the operation outright.
    fn abort(&self, dir: Direction) {
        self.counter(dir).fetch_sub(1, Ordering::AcqRel);
    }

    fn complete(&self, dir: Direction, result: Result<()>) {
        if let Err(e) = result {
            let mut status = self.status.lock().expect("transfer status lock poisoned");
            // First failure sticks; later outcomes never overwrite it.
            if status.is_none() {
                *status = Some(e);
            }
        }
        self.counter(dir).fetch_sub(1, Ordering::AcqRel);
    }
}

/// A caller-owned in-flight operation. Obtained from the `*_with_handle`
/// issue flavors; resolve it with `P2pEngine::test`.
#[derive(Debug)]
pub struct RequestHandle {
    req: TransportRequest,
}

/// Outcome of `test`: terminal status, or the handle back for another round.
#[derive(Debug)]
pub enum RequestPoll {
    Complete(Result<()>),
    Pending(RequestHandle),
}

/// Outcome of `testall`.
#[derive(Debug)]
pub enum TransferPoll {
    Complete(Result<()>),
    Pending,
}

/// The point-to-point engine for one transport context.
///
/// Owns the endpoint cache; all operations and progress for a context go
/// through one `&mut` engine, so driving it from multiple threads is ruled
/// out at the type level.
pub struct P2pEngine<T: Transport> {
    transport: T,
    config: MeshConfig,
    endpoints: HashMap<Rank, Endpoint>,
    oob: Option<Box<dyn EndpointDirectory>>,
}

impl<T: Transport> P2pEngine<T> {
    pub fn new(transport: T, config: MeshConfig) -> Self {
        Self {
            transport,
            config,
            endpoints: HashMap::new(),
            oob: None,
        }
    }

    /// Attach the out-of-band endpoint directory used when
    /// `MeshConfig::oob_endpoints` is set.
    pub fn with_oob_directory(mut self, dir: Box<dyn EndpointDirectory>) -> Self {
        self.oob = Some(dir);
        self
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Issue a non-blocking send to `dst` (a virtual rank of `group`),
    /// detached: the engine frees the request when it completes and the only
    /// record of the outcome is `state`.
    ///
    /// # Safety
    /// The buffer regions behind `data` must stay valid (and unread by other
    /// writers) until the operation's completion is observed via `state`.
    pub unsafe fn isend(
        &mut self,
        group: &VirtualGroup,
        dst: Rank,
        user_tag: u32,
        data: &Datatype,
        state: &Arc<TransferState>,
    ) -> Result<()> {
        unsafe { self.issue_send(group, dst, user_tag, data, state, RequestMode::AutoFree) }?;
        Ok(())
    }

    /// Like `isend`, but ownership of the request transfers to the caller,
    /// who must resolve it with `test`.
    ///
    /// # Safety
    /// As for `isend`, with completion observed via `test` or `state`.
    pub unsafe fn isend_with_handle(
        &mut self,
        group: &VirtualGroup,
        dst: Rank,
        user_tag: u32,
        data: &Datatype,
        state: &Arc<TransferState>,
    ) -> Result<RequestHandle> {
        let req =
            unsafe { self.issue_send(group, dst, user_tag, data, state, RequestMode::Retained) }?;
        Ok(RequestHandle { req })
    }

    /// Issue a non-blocking receive matching a send from `src` (a virtual
    /// rank of `group`) with the same user tag, detached.
    ///
    /// # Safety
    /// The buffer regions behind `data` must stay valid and exclusively
    /// writable by the transport until completion is observed via `state`.
    pub unsafe fn irecv(
        &mut self,
        group: &VirtualGroup,
        src: Rank,
        user_tag: u32,
        data: &Datatype,
        state: &Arc<TransferState>,
    ) -> Result<()> {
        unsafe { self.issue_recv(group, src, user_tag, data, state, RequestMode::AutoFree) }?;
        Ok(())
    }

    /// Like `irecv`, but ownership of the request transfers to the caller.
    ///
    /// # Safety
    /// As for `irecv`, with completion observed via `test` or `state`.
    pub unsafe fn irecv_with_handle(
        &mut self,
        group: &VirtualGroup,
        src: Rank,
        user_tag: u32,
        data: &Datatype,
        state: &Arc<TransferState>,
    ) -> Result<RequestHandle> {
        let req =
            unsafe { self.issue_recv(group, src, user_tag, data, state, RequestMode::Retained) }?;
        Ok(RequestHandle { req })
    }

    /// Resolve one caller-owned request, driving progress up to the
    /// configured poll bound. On terminal completion the request is freed;
    /// otherwise the handle comes back for a later round.
    pub fn test(&mut self, handle: RequestHandle) -> RequestPoll {
        if let Some(done) = self.check(handle.req) {
            return done;
        }
        for _ in 0..self.config.poll_iters {
            self.transport.progress();
            if let Some(done) = self.check(handle.req) {
                return done;
            }
        }
        RequestPoll::Pending(handle)
    }

    /// Resolve a whole transfer state. A state with nothing in flight
    /// returns its aggregated status immediately, without touching the
    /// transport.
    pub fn testall(&mut self, state: &TransferState) -> TransferPoll {
        if state.is_idle() {
            return TransferPoll::Complete(state.status());
        }
        for _ in 0..self.config.poll_iters {
            self.transport.progress();
            if state.is_idle() {
                return TransferPoll::Complete(state.status());
            }
        }
        TransferPoll::Pending
    }

    fn check(&mut self, req: TransportRequest) -> Option<RequestPoll> {
        match self.transport.status(req) {
            RequestStatus::Pending => None,
            RequestStatus::Complete => {
                self.transport.free(req);
                Some(RequestPoll::Complete(Ok(())))
            }
            RequestStatus::Failed(reason) => {
                self.transport.free(req);
                Some(RequestPoll::Complete(Err(MeshError::resource(reason))))
            }
        }
    }

    unsafe fn issue_send(
        &mut self,
        group: &VirtualGroup,
        dst: Rank,
        user_tag: u32,
        data: &Datatype,
        state: &Arc<TransferState>,
        mode: RequestMode,
    ) -> Result<TransportRequest> {
        let (wire, _) = self.match_fields(group, group.myrank(), user_tag)?;
        let dst_global = group
            .global(dst)
            .ok_or_else(|| MeshError::invalid(format!("virtual rank {dst} unresolved")))?;
        let ep = self.endpoint_for(dst_global)?;

        let payload = if data.is_contiguous() {
            let r = data.regions()[0];
            SendData::Contiguous {
                ptr: r.ptr,
                len: r.len,
                dtype: data.contig_handle(&mut self.transport),
            }
        } else {
            SendData::Generic(Box::new(unsafe { IovStream::new(data.regions()) }))
        };

        state.begin(Direction::Send);
        let shared = Arc::clone(state);
        let cb: Completion = Box::new(move |res| shared.complete(Direction::Send, res));
        match self.transport.isend(ep, payload, wire, mode, cb) {
            Ok(req) => Ok(req),
            Err(e) => {
                state.abort(Direction::Send);
                Err(e)
            }
        }
    }

    unsafe fn issue_recv(
        &mut self,
        group: &VirtualGroup,
        src: Rank,
        user_tag: u32,
        data: &Datatype,
        state: &Arc<TransferState>,
        mode: RequestMode,
    ) -> Result<TransportRequest> {
        let (wire, _) = self.match_fields(group, src, user_tag)?;

        let payload = if data.is_contiguous() {
            let r = data.regions()[0];
            RecvData::Contiguous {
                ptr: r.ptr,
                len: r.len,
                dtype: data.contig_handle(&mut self.transport),
            }
        } else {
            RecvData::Generic(Box::new(unsafe { IovStream::new(data.regions()) }))
        };

        state.begin(Direction::Recv);
        let shared = Arc::clone(state);
        let cb: Completion = Box::new(move |res| shared.complete(Direction::Recv, res));
        match self
            .transport
            .irecv(payload, wire, tag::FULL_MASK, mode, cb)
        {
            Ok(req) => Ok(req),
            Err(e) => {
                state.abort(Direction::Recv);
                Err(e)
            }
        }
    }

    /// Validate the matching fields and build the wire tag for a message
    /// whose sender sits at `sender_vrank` of `group`.
    fn match_fields(
        &self,
        group: &VirtualGroup,
        sender_vrank: Rank,
        user_tag: u32,
    ) -> Result<(u64, Rank)> {
        if user_tag > tag::MAX_USER_TAG {
            return Err(MeshError::invalid(format!(
                "user tag {user_tag} exceeds {} bits",
                tag::USER_TAG_BITS
            )));
        }
        let sender = group
            .global(sender_vrank)
            .ok_or_else(|| MeshError::invalid(format!("virtual rank {sender_vrank} unresolved")))?;
        if sender > tag::MAX_SENDER {
            return Err(MeshError::invalid(format!(
                "sender rank {sender} exceeds {} bits",
                tag::SENDER_BITS
            )));
        }
        Ok((tag::encode(user_tag, sender, group.id()), sender))
    }

    /// Resolve the endpoint for a global rank: the out-of-band directory if
    /// configured, otherwise the lazily filled per-context cache.
    fn endpoint_for(&mut self, global: Rank) -> Result<Endpoint> {
        if self.config.oob_endpoints {
            let dir = self
                .oob
                .as_mut()
                .ok_or_else(|| MeshError::invalid("out-of-band endpoint mode with no directory"))?;
            return dir.endpoint(global);
        }
        if let Some(ep) = self.endpoints.get(&global) {
            return Ok(*ep);
        }
        let addr = self.transport.rank_address(global)?;
        match self.transport.endpoint(&addr) {
            Ok(ep) => {
                self.endpoints.insert(global, ep);
                Ok(ep)
            }
            Err(e) => {
                tracing::warn!(rank = global, error = %e, "endpoint creation failed");
                Err(MeshError::resource(format!(
                    "endpoint for rank {global}: {e}"
                )))
            }
        }
    }
}
