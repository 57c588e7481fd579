//! In-process loopback fabric.
//!
//! Generalizes `rpc_protocol::pipe`'s socketpair test harness: instead of two
//! parties joined by one OS pipe, any number of simulated nodes share one
//! [`Fabric`] and address each other by queue-pair number, the same way real
//! verbs code addresses a peer's QP after the bootstrap address exchange.
//! Every node in the simulated job runs in the same address space, so a put
//! or get is implemented as a direct `memcpy` against the peer's raw pointer
//! — there is no real network to cross — while Active Message sends still
//! go through a receive-queue matching discipline so the engine can't tell
//! the difference from real hardware: a message delivered before the
//! receiver has posted a buffer waits in an inbox until one shows up.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use super::{CompKind, Completion, MrKeys, PeerAddr, Transport};

/// A pending Active Message that arrived before its destination queue pair
/// had a receive buffer posted.
struct PendingRecv {
    payload: Vec<u8>,
    header: u32,
}

/// A posted-but-unmatched receive buffer, identified by the raw pointer the
/// engine handed us (mirrors real hardware landing a DMA straight into the
/// buffer the caller posted).
struct PostedRecv {
    wr_id: u64,
    buf: *mut u8,
    len: usize,
}

// SAFETY: `PostedRecv::buf` points into a `BufferPool` region owned by the
// engine for the lifetime of the posted work request; the fabric only
// dereferences it once, synchronously, while delivering a matching message.
unsafe impl Send for PostedRecv {}

/// Local bookkeeping only — the real state machine invariants live in
/// [`crate::connection::ConnectionManager`]; the fabric just needs to know
/// whether a QP has been told who its peer is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SimQpState {
    Reset,
    Init,
    Rtr,
    Rts,
}

struct QpRecord {
    state: SimQpState,
    remote_qpn: Option<u32>,
}

/// Shared routing table every node's [`LoopbackTransport`] registers its
/// queue pairs into, so one node's post can find another's inbox.
struct FabricInner {
    next_qpn: AtomicU32,
    routes: Mutex<HashMap<u32, Arc<NodeState>>>,
}

/// Per-node state: this node's own queue pairs, completion queues, and
/// inboxes, reachable from other nodes via the shared [`FabricInner`].
struct NodeState {
    qps: Mutex<HashMap<u32, QpRecord>>,
    send_cq: Mutex<VecDeque<Completion>>,
    recv_cq: Mutex<VecDeque<Completion>>,
    inboxes: Mutex<HashMap<u32, VecDeque<PendingRecv>>>,
    posted: Mutex<HashMap<u32, VecDeque<PostedRecv>>>,
}

impl NodeState {
    fn new() -> Self {
        NodeState {
            qps: Mutex::new(HashMap::new()),
            send_cq: Mutex::new(VecDeque::new()),
            recv_cq: Mutex::new(VecDeque::new()),
            inboxes: Mutex::new(HashMap::new()),
            posted: Mutex::new(HashMap::new()),
        }
    }

    /// Deliver an AM payload addressed to local QP `qpn`: match it against a
    /// waiting posted buffer if one exists, else queue it in the inbox.
    fn deliver(&self, qpn: u32, payload: Vec<u8>, header: u32) {
        let mut posted = self.posted.lock().unwrap();
        if let Some(queue) = posted.get_mut(&qpn) {
            if let Some(slot) = queue.pop_front() {
                let n = payload.len().min(slot.len);
                unsafe {
                    std::ptr::copy_nonoverlapping(payload.as_ptr(), slot.buf, n);
                }
                self.recv_cq.lock().unwrap().push_back(Completion {
                    wr_id: slot.wr_id,
                    success: true,
                    kind: CompKind::Recv,
                    bytes: n as u32,
                    imm: Some(header),
                });
                return;
            }
        }
        drop(posted);
        self.inboxes
            .lock()
            .unwrap()
            .entry(qpn)
            .or_default()
            .push_back(PendingRecv { payload, header });
    }
}

/// A shared fabric: create one per simulated job, then one
/// [`LoopbackTransport`] per simulated node off of it.
pub struct Fabric(Arc<FabricInner>);

impl Fabric {
    pub fn new() -> Self {
        Fabric(Arc::new(FabricInner {
            next_qpn: AtomicU32::new(1),
            routes: Mutex::new(HashMap::new()),
        }))
    }

    /// Spawn a new simulated node sharing this fabric.
    pub fn node(&self) -> LoopbackTransport {
        LoopbackTransport {
            fabric: self.0.clone(),
            node: Arc::new(NodeState::new()),
        }
    }
}

impl Default for Fabric {
    fn default() -> Self {
        Self::new()
    }
}

/// One simulated node's view of the [`Fabric`]. Implements [`Transport`] so
/// the engine, connection manager, and AM dispatcher can run unmodified over
/// it in tests.
#[derive(Clone)]
pub struct LoopbackTransport {
    fabric: Arc<FabricInner>,
    node: Arc<NodeState>,
}

impl std::fmt::Debug for SimQp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SimQp({})", self.qpn)
    }
}

#[derive(Clone)]
pub struct SimQp {
    qpn: u32,
}

impl LoopbackTransport {
    fn route(&self, qpn: u32) -> Option<Arc<NodeState>> {
        self.fabric.routes.lock().unwrap().get(&qpn).cloned()
    }
}

impl Transport for LoopbackTransport {
    type Qp = SimQp;

    fn create_qp(&self) -> SimQp {
        let qpn = self.fabric.next_qpn.fetch_add(1, Ordering::Relaxed);
        self.fabric
            .routes
            .lock()
            .unwrap()
            .insert(qpn, self.node.clone());
        self.node.qps.lock().unwrap().insert(
            qpn,
            QpRecord {
                state: SimQpState::Reset,
                remote_qpn: None,
            },
        );
        SimQp { qpn }
    }

    fn modify_to_init(&self, qp: &SimQp, _port_num: u8) {
        let mut qps = self.node.qps.lock().unwrap();
        let rec = qps.get_mut(&qp.qpn).expect("unknown qp");
        rec.state = SimQpState::Init;
    }

    fn modify_to_rtr(&self, qp: &SimQp, peer: PeerAddr) {
        let mut qps = self.node.qps.lock().unwrap();
        let rec = qps.get_mut(&qp.qpn).expect("unknown qp");
        rec.remote_qpn = Some(peer.qpn);
        rec.state = SimQpState::Rtr;
    }

    fn modify_to_rts(&self, qp: &SimQp, _local_psn: u32) {
        let mut qps = self.node.qps.lock().unwrap();
        let rec = qps.get_mut(&qp.qpn).expect("unknown qp");
        rec.state = SimQpState::Rts;
    }

    fn local_addr(&self, qp: &SimQp) -> PeerAddr {
        PeerAddr {
            lid: 0,
            qpn: qp.qpn,
            psn: 0,
            port_num: 1,
        }
    }

    unsafe fn register(&self, addr: *mut u8, len: usize) -> MrKeys {
        // Loopback memory is always directly addressable within this
        // process; lkey/rkey don't gate anything here, but callers still
        // expect to carry the raw address as the "remote addr", so the key
        // values themselves are unused placeholders.
        let _ = (addr, len);
        MrKeys { lkey: 0, rkey: 0 }
    }

    fn post_send_am(&self, qp: &SimQp, wr_id: u64, payload: &[u8], header: u32, _inline: bool) {
        let remote_qpn = {
            let qps = self.node.qps.lock().unwrap();
            qps.get(&qp.qpn).and_then(|r| r.remote_qpn)
        };
        if let Some(remote_qpn) = remote_qpn {
            if let Some(peer) = self.route(remote_qpn) {
                peer.deliver(remote_qpn, payload.to_vec(), header);
            }
        }
        self.node.send_cq.lock().unwrap().push_back(Completion {
            wr_id,
            success: true,
            kind: CompKind::Send,
            bytes: payload.len() as u32,
            imm: None,
        });
    }

    fn post_write(
        &self,
        qp: &SimQp,
        wr_id: u64,
        local: &[u8],
        _lkey: u32,
        remote_addr: u64,
        _rkey: u32,
        _inline: bool,
    ) {
        let _ = qp;
        unsafe {
            std::ptr::copy_nonoverlapping(local.as_ptr(), remote_addr as *mut u8, local.len());
        }
        self.node.send_cq.lock().unwrap().push_back(Completion {
            wr_id,
            success: true,
            kind: CompKind::Send,
            bytes: local.len() as u32,
            imm: None,
        });
    }

    fn post_read(
        &self,
        qp: &SimQp,
        wr_id: u64,
        local: &mut [u8],
        _lkey: u32,
        remote_addr: u64,
        _rkey: u32,
    ) {
        let _ = qp;
        unsafe {
            std::ptr::copy_nonoverlapping(remote_addr as *const u8, local.as_mut_ptr(), local.len());
        }
        self.node.send_cq.lock().unwrap().push_back(Completion {
            wr_id,
            success: true,
            kind: CompKind::Send,
            bytes: local.len() as u32,
            imm: None,
        });
    }

    fn post_recv(&self, qp: &SimQp, wr_id: u64, buf: &mut [u8], _lkey: u32) {
        let mut inboxes = self.node.inboxes.lock().unwrap();
        if let Some(queue) = inboxes.get_mut(&qp.qpn) {
            if let Some(pending) = queue.pop_front() {
                let n = pending.payload.len().min(buf.len());
                buf[..n].copy_from_slice(&pending.payload[..n]);
                self.node.recv_cq.lock().unwrap().push_back(Completion {
                    wr_id,
                    success: true,
                    kind: CompKind::Recv,
                    bytes: n as u32,
                    imm: Some(pending.header),
                });
                return;
            }
        }
        drop(inboxes);
        self.node
            .posted
            .lock()
            .unwrap()
            .entry(qp.qpn)
            .or_default()
            .push_back(PostedRecv {
                wr_id,
                buf: buf.as_mut_ptr(),
                len: buf.len(),
            });
    }

    fn poll_send(&self, max: usize) -> Vec<Completion> {
        let mut cq = self.node.send_cq.lock().unwrap();
        let n = max.min(cq.len());
        cq.drain(..n).collect()
    }

    fn poll_recv(&self, max: usize) -> Vec<Completion> {
        let mut cq = self.node.recv_cq.lock().unwrap();
        let n = max.min(cq.len());
        cq.drain(..n).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn am_send_before_recv_posted_waits_in_inbox() {
        let fabric = Fabric::new();
        let a = fabric.node();
        let b = fabric.node();

        let qa = a.create_qp();
        let qb = b.create_qp();
        a.modify_to_init(&qa, 1);
        b.modify_to_init(&qb, 1);
        a.modify_to_rtr(&qa, b.local_addr(&qb));
        b.modify_to_rtr(&qb, a.local_addr(&qa));
        a.modify_to_rts(&qa, 0);
        b.modify_to_rts(&qb, 0);

        a.post_send_am(&qa, 1, b"hello", 0xABCD, false);
        assert_eq!(a.poll_send(8).len(), 1);
        assert!(b.poll_recv(8).is_empty());

        let mut buf = [0u8; 16];
        b.post_recv(&qb, 2, &mut buf, 0);
        let recv = b.poll_recv(8);
        assert_eq!(recv.len(), 1);
        assert_eq!(recv[0].bytes as usize, 5);
        assert_eq!(recv[0].imm, Some(0xABCD));
        assert_eq!(&buf[..5], b"hello");
    }

    #[test]
    fn recv_posted_before_send_is_matched_immediately() {
        let fabric = Fabric::new();
        let a = fabric.node();
        let b = fabric.node();

        let qa = a.create_qp();
        let qb = b.create_qp();
        a.modify_to_rtr(&qa, b.local_addr(&qb));
        b.modify_to_rtr(&qb, a.local_addr(&qa));

        let mut buf = [0u8; 16];
        b.post_recv(&qb, 9, &mut buf, 0);
        a.post_send_am(&qa, 1, b"hi", 7, false);

        let recv = b.poll_recv(8);
        assert_eq!(recv.len(), 1);
        assert_eq!(recv[0].wr_id, 9);
        assert_eq!(&buf[..2], b"hi");
    }

    #[test]
    fn write_and_read_move_bytes_directly() {
        let fabric = Fabric::new();
        let a = fabric.node();
        let b = fabric.node();
        let qa = a.create_qp();
        let _qb = b.create_qp();

        let mut remote = [0u8; 8];
        let local = [1u8, 2, 3, 4];
        a.post_write(
            &qa,
            1,
            &local,
            0,
            remote.as_mut_ptr() as u64,
            0,
            false,
        );
        assert_eq!(a.poll_send(8).len(), 1);
        assert_eq!(&remote[..4], &local);

        let mut dst = [0u8; 4];
        a.post_read(&qa, 2, &mut dst, 0, remote.as_ptr() as u64, 0);
        assert_eq!(a.poll_send(8).len(), 1);
        assert_eq!(dst, [1, 2, 3, 4]);
    }
}
