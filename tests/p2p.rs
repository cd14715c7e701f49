//! End-to-end engine behavior over a loopback mock transport.
//!
//! The mock implements the full transport contract: deferred completion via
//! `progress()`, tag+mask matching, pack/unpack delivery, request lifecycle
//! with auto-free vs retained handles, and scripted failures.

use std::collections::HashMap;

use rankmesh::{
    Datatype, Endpoint, EndpointDirectory, IoVec, MeshConfig, MeshError, P2pEngine, Rank,
    RankMap, RecvData, RequestMode, RequestPoll, RequestStatus, SendData, TransferPoll,
    TransferState, Transport, TransportRequest, VirtualGroup, WireTag,
};

struct PendingSend {
    tag: WireTag,
    bytes: Vec<u8>,
    cb: Option<rankmesh::Completion>,
    req: u64,
}

struct PendingRecv {
    tag: WireTag,
    mask: WireTag,
    data: RecvData,
    cb: Option<rankmesh::Completion>,
    req: u64,
}

#[derive(Clone, Copy, PartialEq, Debug)]
enum ReqState {
    Pending,
    Complete,
    Failed,
    Freed,
}

/// Loopback transport: sends and receives issued on the same context match
/// each other by wire tag once `progress()` runs.
struct MockTransport {
    world: u32,
    next_req: u64,
    sends: Vec<PendingSend>,
    recvs: Vec<PendingRecv>,
    requests: HashMap<u64, (ReqState, RequestMode)>,
    /// Number of progress calls to swallow before matching anything.
    delay: u32,
    /// Fail the next N sends at completion time.
    fail_next_sends: u32,
    /// Reject issue calls outright.
    reject_issue: bool,
    /// Ranks for which endpoint creation fails.
    broken_ranks: Vec<Rank>,
    endpoint_creations: u32,
    progress_calls: u32,
}

impl MockTransport {
    fn new(world: u32) -> Self {
        Self {
            world,
            next_req: 1,
            sends: Vec::new(),
            recvs: Vec::new(),
            requests: HashMap::new(),
            delay: 0,
            fail_next_sends: 0,
            reject_issue: false,
            broken_ranks: Vec::new(),
            endpoint_creations: 0,
            progress_calls: 0,
        }
    }

    fn alloc_req(&mut self, mode: RequestMode) -> u64 {
        let id = self.next_req;
        self.next_req += 1;
        self.requests.insert(id, (ReqState::Pending, mode));
        id
    }

    fn finish(&mut self, req: u64, cb: rankmesh::Completion, result: Result<(), MeshError>) {
        let (state, mode) = self.requests[&req];
        assert_eq!(state, ReqState::Pending, "request completed twice");
        let new_state = if result.is_ok() {
            ReqState::Complete
        } else {
            ReqState::Failed
        };
        self.requests.insert(req, (new_state, mode));
        cb(result);
        if mode == RequestMode::AutoFree {
            self.requests.insert(req, (ReqState::Freed, mode));
        }
    }

    fn all_freed(&self) -> bool {
        self.requests.values().all(|(s, _)| *s == ReqState::Freed)
    }
}

impl Transport for MockTransport {
    fn endpoint(&mut self, address: &[u8]) -> Result<Endpoint, MeshError> {
        let rank = u32::from_le_bytes(address.try_into().unwrap());
        if self.broken_ranks.contains(&rank) {
            return Err(MeshError::resource("address unreachable"));
        }
        self.endpoint_creations += 1;
        Ok(Endpoint(0x100 + rank as u64))
    }

    fn rank_address(&mut self, rank: Rank) -> Result<Vec<u8>, MeshError> {
        if rank >= self.world {
            return Err(MeshError::resource(format!("no address for rank {rank}")));
        }
        Ok(rank.to_le_bytes().to_vec())
    }

    fn contig_datatype(&mut self, len: usize) -> u64 {
        len as u64
    }

    fn isend(
        &mut self,
        _ep: Endpoint,
        data: SendData,
        tag: WireTag,
        mode: RequestMode,
        on_complete: rankmesh::Completion,
    ) -> Result<TransportRequest, MeshError> {
        if self.reject_issue {
            return Err(MeshError::resource("send queue full"));
        }
        let bytes = match data {
            SendData::Contiguous { ptr, len, .. } => {
                let mut buf = vec![0u8; len];
                unsafe {
                    std::ptr::copy_nonoverlapping(ptr as *const u8, buf.as_mut_ptr(), len);
                }
                buf
            }
            SendData::Generic(mut stream) => {
                let total = stream.packed_size();
                let mut buf = vec![0u8; total];
                assert_eq!(stream.pack(0, &mut buf), total, "pack reported failure");
                buf
            }
        };
        let req = self.alloc_req(mode);
        self.sends.push(PendingSend {
            tag,
            bytes,
            cb: Some(on_complete),
            req,
        });
        Ok(TransportRequest(req))
    }

    fn irecv(
        &mut self,
        data: RecvData,
        tag: WireTag,
        tag_mask: WireTag,
        mode: RequestMode,
        on_complete: rankmesh::Completion,
    ) -> Result<TransportRequest, MeshError> {
        if self.reject_issue {
            return Err(MeshError::resource("recv queue full"));
        }
        let req = self.alloc_req(mode);
        self.recvs.push(PendingRecv {
            tag,
            mask: tag_mask,
            data,
            cb: Some(on_complete),
            req,
        });
        Ok(TransportRequest(req))
    }

    fn progress(&mut self) -> usize {
        self.progress_calls += 1;
        if self.delay > 0 {
            self.delay -= 1;
            return 0;
        }

        let mut fired = 0;
        while let Some(recv_idx) = self.recvs.iter().position(|r| {
            self.sends
                .iter()
                .any(|s| (s.tag & r.mask) == (r.tag & r.mask))
        }) {
            let mut recv = self.recvs.remove(recv_idx);
            let send_idx = self
                .sends
                .iter()
                .position(|s| (s.tag & recv.mask) == (recv.tag & recv.mask))
                .unwrap();
            let mut send = self.sends.remove(send_idx);

            let send_result = if self.fail_next_sends > 0 {
                self.fail_next_sends -= 1;
                Err(MeshError::resource("send aborted"))
            } else {
                Ok(())
            };

            let recv_result = if send_result.is_ok() {
                match &mut recv.data {
                    RecvData::Contiguous { ptr, len, .. } => {
                        if send.bytes.len() > *len {
                            Err(MeshError::LengthMismatch {
                                expected: *len,
                                actual: send.bytes.len(),
                            })
                        } else {
                            unsafe {
                                std::ptr::copy_nonoverlapping(
                                    send.bytes.as_ptr(),
                                    *ptr as *mut u8,
                                    send.bytes.len(),
                                );
                            }
                            Ok(())
                        }
                    }
                    RecvData::Generic(stream) => stream.unpack(0, &send.bytes),
                }
            } else {
                Err(MeshError::resource("peer send aborted"))
            };

            let send_cb = send.cb.take().unwrap();
            let send_req = send.req;
            self.finish(send_req, send_cb, send_result);
            let recv_cb = recv.cb.take().unwrap();
            let recv_req = recv.req;
            self.finish(recv_req, recv_cb, recv_result);
            fired += 2;
        }
        fired
    }

    fn status(&self, req: TransportRequest) -> RequestStatus {
        match self.requests[&req.0].0 {
            ReqState::Pending => RequestStatus::Pending,
            ReqState::Complete => RequestStatus::Complete,
            ReqState::Failed => RequestStatus::Failed("send aborted".into()),
            ReqState::Freed => panic!("status queried on freed request"),
        }
    }

    fn free(&mut self, req: TransportRequest) {
        let entry = self.requests.get_mut(&req.0).unwrap();
        assert_ne!(entry.0, ReqState::Freed, "double free");
        entry.0 = ReqState::Freed;
    }
}

fn engine(world: u32) -> P2pEngine<MockTransport> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    P2pEngine::new(MockTransport::new(world), MeshConfig::default())
}

/// Both sides of a pair on one loopback context: the sender's view and the
/// receiver's view of the same two-member group.
fn pair(id: u16) -> (VirtualGroup, VirtualGroup) {
    let sender = VirtualGroup::new(0, RankMap::identity(2)).unwrap().with_id(id);
    let receiver = VirtualGroup::new(1, RankMap::identity(2)).unwrap().with_id(id);
    (sender, receiver)
}

fn drive(engine: &mut P2pEngine<MockTransport>, state: &TransferState) -> Result<(), MeshError> {
    for _ in 0..100 {
        match engine.testall(state) {
            TransferPoll::Complete(r) => return r,
            TransferPoll::Pending => {}
        }
    }
    panic!("transfer never completed");
}

#[test]
fn test_contiguous_roundtrip() {
    let mut engine = engine(2);
    let (sender, receiver) = pair(1);
    let state = TransferState::new();

    let src = [1u8, 2, 3, 4];
    let mut dst = [0u8; 4];
    let send_dt = Datatype::contiguous(src.as_ptr() as u64, 4);
    let recv_dt = Datatype::contiguous(dst.as_mut_ptr() as u64, 4);

    unsafe {
        engine.isend(&sender, 1, 7, &send_dt, &state).unwrap();
        engine.irecv(&receiver, 0, 7, &recv_dt, &state).unwrap();
    }
    drive(&mut engine, &state).unwrap();
    assert_eq!(dst, [1, 2, 3, 4]);
    assert!(state.is_idle());
    assert!(engine.transport().all_freed());
}

#[test]
fn test_scattered_roundtrip() {
    let mut engine = engine(2);
    let (sender, receiver) = pair(1);
    let state = TransferState::new();

    let a = [1u8, 2, 3];
    let b = [4u8, 5];
    let mut c = [0u8; 2];
    let mut d = [0u8; 3];
    let send_dt = Datatype::vector(vec![
        IoVec::new(a.as_ptr() as u64, 3),
        IoVec::new(b.as_ptr() as u64, 2),
    ])
    .unwrap();
    let recv_dt = Datatype::vector(vec![
        IoVec::new(c.as_mut_ptr() as u64, 2),
        IoVec::new(d.as_mut_ptr() as u64, 3),
    ])
    .unwrap();

    unsafe {
        engine.isend(&sender, 1, 3, &send_dt, &state).unwrap();
        engine.irecv(&receiver, 0, 3, &recv_dt, &state).unwrap();
    }
    drive(&mut engine, &state).unwrap();
    assert_eq!(c, [1, 2]);
    assert_eq!(d, [3, 4, 5]);
}

#[test]
fn test_testall_fast_path_skips_progress() {
    let mut engine = engine(2);
    let state = TransferState::new();
    match engine.testall(&state) {
        TransferPoll::Complete(r) => r.unwrap(),
        TransferPoll::Pending => panic!("idle state reported pending"),
    }
    assert_eq!(engine.transport().progress_calls, 0);
}

#[test]
fn test_testall_reports_pending_until_bound_allows() {
    let mut engine = P2pEngine::new(
        {
            let mut t = MockTransport::new(2);
            // More progress calls than one testall round can spend.
            t.delay = MeshConfig::default().poll_iters + 5;
            t
        },
        MeshConfig::default(),
    );
    let (sender, receiver) = pair(1);
    let state = TransferState::new();

    let src = [9u8];
    let mut dst = [0u8];
    let send_dt = Datatype::contiguous(src.as_ptr() as u64, 1);
    let recv_dt = Datatype::contiguous(dst.as_mut_ptr() as u64, 1);
    unsafe {
        engine.isend(&sender, 1, 0, &send_dt, &state).unwrap();
        engine.irecv(&receiver, 0, 0, &recv_dt, &state).unwrap();
    }

    assert!(matches!(engine.testall(&state), TransferPoll::Pending));
    match engine.testall(&state) {
        TransferPoll::Complete(r) => r.unwrap(),
        TransferPoll::Pending => panic!("second round should complete"),
    }
    assert_eq!(dst, [9]);
}

#[test]
fn test_handle_lifecycle() {
    let mut engine = engine(2);
    let (sender, receiver) = pair(1);
    let state = TransferState::new();

    let src = [5u8, 6];
    let mut dst = [0u8; 2];
    let send_dt = Datatype::contiguous(src.as_ptr() as u64, 2);
    let recv_dt = Datatype::contiguous(dst.as_mut_ptr() as u64, 2);

    let send_h = unsafe {
        engine
            .isend_with_handle(&sender, 1, 11, &send_dt, &state)
            .unwrap()
    };
    let recv_h = unsafe {
        engine
            .irecv_with_handle(&receiver, 0, 11, &recv_dt, &state)
            .unwrap()
    };

    match engine.test(send_h) {
        RequestPoll::Complete(r) => r.unwrap(),
        RequestPoll::Pending(_) => panic!("send did not resolve within bound"),
    }
    match engine.test(recv_h) {
        RequestPoll::Complete(r) => r.unwrap(),
        RequestPoll::Pending(_) => panic!("recv did not resolve within bound"),
    }
    assert_eq!(dst, [5, 6]);
    assert!(engine.transport().all_freed());
}

#[test]
fn test_handle_pending_comes_back() {
    let mut engine = P2pEngine::new(
        {
            let mut t = MockTransport::new(2);
            t.delay = MeshConfig::default().poll_iters + 1;
            t
        },
        MeshConfig::default(),
    );
    let (sender, receiver) = pair(1);
    let state = TransferState::new();

    let src = [1u8];
    let mut dst = [0u8];
    let send_dt = Datatype::contiguous(src.as_ptr() as u64, 1);
    let recv_dt = Datatype::contiguous(dst.as_mut_ptr() as u64, 1);
    let h = unsafe {
        engine
            .isend_with_handle(&sender, 1, 0, &send_dt, &state)
            .unwrap()
    };
    unsafe { engine.irecv(&receiver, 0, 0, &recv_dt, &state).unwrap() };

    let h = match engine.test(h) {
        RequestPoll::Pending(h) => h,
        RequestPoll::Complete(_) => panic!("should exhaust the bound first"),
    };
    match engine.test(h) {
        RequestPoll::Complete(r) => r.unwrap(),
        RequestPoll::Pending(_) => panic!("second round should resolve"),
    }
}

#[test]
fn test_failure_sticks_in_transfer_state() {
    let mut engine = P2pEngine::new(
        {
            let mut t = MockTransport::new(2);
            t.fail_next_sends = 1;
            t
        },
        MeshConfig::default(),
    );
    let (sender, receiver) = pair(1);
    let state = TransferState::new();

    let src = [1u8];
    let mut dst = [0u8];
    let send_dt = Datatype::contiguous(src.as_ptr() as u64, 1);
    let recv_dt = Datatype::contiguous(dst.as_mut_ptr() as u64, 1);
    unsafe {
        engine.isend(&sender, 1, 0, &send_dt, &state).unwrap();
        engine.irecv(&receiver, 0, 0, &recv_dt, &state).unwrap();
    }

    let err = drive(&mut engine, &state).unwrap_err();
    assert!(matches!(err, MeshError::Resource { .. }));
    // The status stays failed on later queries.
    assert!(state.status().is_err());
}

#[test]
fn test_unresolved_virtual_rank_is_invalid_argument() {
    let mut engine = engine(2);
    let (sender, _) = pair(1);
    let state = TransferState::new();
    let src = [0u8];
    let dt = Datatype::contiguous(src.as_ptr() as u64, 1);

    let err = unsafe { engine.isend(&sender, 5, 0, &dt, &state) }.unwrap_err();
    assert!(matches!(err, MeshError::InvalidArgument { .. }));
    assert!(state.is_idle());
}

#[test]
fn test_oversized_user_tag_rejected() {
    let mut engine = engine(2);
    let (sender, _) = pair(1);
    let state = TransferState::new();
    let src = [0u8];
    let dt = Datatype::contiguous(src.as_ptr() as u64, 1);

    let err = unsafe { engine.isend(&sender, 1, 1 << 24, &dt, &state) }.unwrap_err();
    assert!(matches!(err, MeshError::InvalidArgument { .. }));
}

#[test]
fn test_issue_rejection_rolls_back_counters() {
    let mut engine = P2pEngine::new(
        {
            let mut t = MockTransport::new(2);
            t.reject_issue = true;
            t
        },
        MeshConfig::default(),
    );
    let (sender, receiver) = pair(1);
    let state = TransferState::new();
    let src = [0u8];
    let mut dst = [0u8];
    let send_dt = Datatype::contiguous(src.as_ptr() as u64, 1);
    let recv_dt = Datatype::contiguous(dst.as_mut_ptr() as u64, 1);

    assert!(unsafe { engine.isend(&sender, 1, 0, &send_dt, &state) }.is_err());
    assert!(unsafe { engine.irecv(&receiver, 0, 0, &recv_dt, &state) }.is_err());
    assert!(state.is_idle());
    assert!(state.status().is_ok());
}

#[test]
fn test_endpoint_cache_creates_once_per_rank() {
    let mut engine = engine(4);
    let group = VirtualGroup::new(0, RankMap::identity(4)).unwrap();
    let state = TransferState::new();
    let src = [0u8];
    let dt = Datatype::contiguous(src.as_ptr() as u64, 1);

    unsafe {
        engine.isend(&group, 1, 0, &dt, &state).unwrap();
        engine.isend(&group, 1, 1, &dt, &state).unwrap();
        engine.isend(&group, 2, 2, &dt, &state).unwrap();
    }
    assert_eq!(engine.transport().endpoint_creations, 2);
}

#[test]
fn test_endpoint_creation_failure_is_resource_error() {
    let mut engine = P2pEngine::new(
        {
            let mut t = MockTransport::new(2);
            t.broken_ranks = vec![1];
            t
        },
        MeshConfig::default(),
    );
    let (sender, _) = pair(1);
    let state = TransferState::new();
    let src = [0u8];
    let dt = Datatype::contiguous(src.as_ptr() as u64, 1);

    let err = unsafe { engine.isend(&sender, 1, 0, &dt, &state) }.unwrap_err();
    assert!(matches!(err, MeshError::Resource { .. }));
    assert!(state.is_idle());
}

struct StaticDirectory;

impl EndpointDirectory for StaticDirectory {
    fn endpoint(&mut self, rank: Rank) -> Result<Endpoint, MeshError> {
        Ok(Endpoint(0x9000 + rank as u64))
    }
}

#[test]
fn test_oob_directory_bypasses_address_exchange() {
    let config = MeshConfig {
        oob_endpoints: true,
        ..MeshConfig::default()
    };
    let mut engine = P2pEngine::new(MockTransport::new(2), config)
        .with_oob_directory(Box::new(StaticDirectory));
    let (sender, receiver) = pair(1);
    let state = TransferState::new();

    let src = [3u8];
    let mut dst = [0u8];
    let send_dt = Datatype::contiguous(src.as_ptr() as u64, 1);
    let recv_dt = Datatype::contiguous(dst.as_mut_ptr() as u64, 1);
    unsafe {
        engine.isend(&sender, 1, 0, &send_dt, &state).unwrap();
        engine.irecv(&receiver, 0, 0, &recv_dt, &state).unwrap();
    }
    drive(&mut engine, &state).unwrap();
    assert_eq!(dst, [3]);
    assert_eq!(engine.transport().endpoint_creations, 0);
}

#[test]
fn test_oob_mode_without_directory_is_invalid() {
    let config = MeshConfig {
        oob_endpoints: true,
        ..MeshConfig::default()
    };
    let mut engine = P2pEngine::new(MockTransport::new(2), config);
    let (sender, _) = pair(1);
    let state = TransferState::new();
    let src = [0u8];
    let dt = Datatype::contiguous(src.as_ptr() as u64, 1);

    let err = unsafe { engine.isend(&sender, 1, 0, &dt, &state) }.unwrap_err();
    assert!(matches!(err, MeshError::InvalidArgument { .. }));
}

#[test]
fn test_group_ids_do_not_cross_match() {
    let mut engine = engine(2);
    let (sender_a, receiver_a) = pair(1);
    let (_, receiver_b) = pair(2);
    let state_a = TransferState::new();
    let state_b = TransferState::new();

    let src = [7u8];
    let mut dst_a = [0u8];
    let mut dst_b = [0u8];
    let send_dt = Datatype::contiguous(src.as_ptr() as u64, 1);
    let recv_a = Datatype::contiguous(dst_a.as_mut_ptr() as u64, 1);
    let recv_b = Datatype::contiguous(dst_b.as_mut_ptr() as u64, 1);

    unsafe {
        // Same user tag and same peer, different group ids.
        engine.irecv(&receiver_b, 0, 4, &recv_b, &state_b).unwrap();
        engine.irecv(&receiver_a, 0, 4, &recv_a, &state_a).unwrap();
        engine.isend(&sender_a, 1, 4, &send_dt, &state_a).unwrap();
    }
    drive(&mut engine, &state_a).unwrap();
    assert_eq!(dst_a, [7]);
    assert_eq!(dst_b, [0]);
    assert_eq!(state_b.pending_recvs(), 1);
}
