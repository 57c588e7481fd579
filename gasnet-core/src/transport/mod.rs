//! The `Transport` trait abstracts the reliable-connected RDMA fabric that
//! [`crate::engine::Engine`] and [`crate::connection::ConnectionManager`]
//! drive. Two implementations exist:
//!
//! - [`verbs`] (behind the `verbs` feature): real InfiniBand verbs, via
//!   `gasnet-verbs`.
//! - [`sim`]: an in-process loopback fabric used by every test in this
//!   workspace, generalizing `rpc_protocol::pipe`'s socketpair-backed test
//!   harness from two parties talking one protocol to N simulated nodes
//!   exchanging RDMA work requests and Active Messages.
//!
//! Both satisfy spec §4.3's ordering guarantee (FIFO completion within one
//! QP) and completion-queue reaping model.

pub mod sim;
#[cfg(feature = "verbs")]
pub mod verbs;

/// Remote queue-pair address data exchanged during the bootstrap
/// all-to-all of spec §4.2.
#[derive(Debug, Clone, Copy, Default)]
pub struct PeerAddr {
    pub lid: u16,
    pub qpn: u32,
    pub psn: u32,
    pub port_num: u8,
}

/// What kind of verbs operation a reaped completion corresponds to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompKind {
    Send,
    Recv,
}

/// One reaped completion. `wr_id` round-trips whatever tag was passed to the
/// originating post call, letting the engine recover the owning work-request
/// record (spec §4.3: "identify the owning work-request record").
#[derive(Debug, Clone, Copy)]
pub struct Completion {
    pub wr_id: u64,
    pub success: bool,
    pub kind: CompKind,
    pub bytes: u32,
    /// Set on `CompKind::Recv` completions: the 32-bit AM header carried in
    /// the immediate-data field (spec §6).
    pub imm: Option<u32>,
}

/// A registered memory region's keys. Matches `ibv_mr`'s `lkey`/`rkey` pair.
#[derive(Debug, Clone, Copy, Default)]
pub struct MrKeys {
    pub lkey: u32,
    pub rkey: u32,
}

/// The fabric abstraction. One `Transport` instance is shared by every
/// per-peer queue pair in the process; `Qp` identifies one queue pair
/// within it.
pub trait Transport: Send + Sync {
    type Qp: Clone + Send + Sync + std::fmt::Debug;

    /// Create a new queue pair in the RESET state.
    fn create_qp(&self) -> Self::Qp;

    /// RESET -> INIT (spec §4.2).
    fn modify_to_init(&self, qp: &Self::Qp, port_num: u8);

    /// INIT -> RTR, binding to the peer's address data (spec §4.2).
    fn modify_to_rtr(&self, qp: &Self::Qp, peer: PeerAddr);

    /// RTR -> RTS (spec §4.2).
    fn modify_to_rts(&self, qp: &Self::Qp, local_psn: u32);

    /// This process's address data for `qp`, to be carried in the
    /// bootstrap address-exchange record.
    fn local_addr(&self, qp: &Self::Qp) -> PeerAddr;

    /// Register `[addr, addr+len)` for local and remote access.
    ///
    /// # Safety
    /// `addr` must reference `len` valid bytes that outlive the
    /// registration (until a matching `deregister`, or process exit).
    unsafe fn register(&self, addr: *mut u8, len: usize) -> MrKeys;

    /// Post an Active Message send: `header` goes in the immediate-data
    /// field, `payload` is the marshalled body (spec §4.5, §6).
    fn post_send_am(&self, qp: &Self::Qp, wr_id: u64, payload: &[u8], header: u32, inline: bool);

    /// Post an RDMA write (put).
    fn post_write(
        &self,
        qp: &Self::Qp,
        wr_id: u64,
        local: &[u8],
        lkey: u32,
        remote_addr: u64,
        rkey: u32,
        inline: bool,
    );

    /// Post an RDMA read (get). `local` is the destination.
    fn post_read(
        &self,
        qp: &Self::Qp,
        wr_id: u64,
        local: &mut [u8],
        lkey: u32,
        remote_addr: u64,
        rkey: u32,
    );

    /// Post a receive buffer.
    fn post_recv(&self, qp: &Self::Qp, wr_id: u64, buf: &mut [u8], lkey: u32);

    /// Reap up to `max` completions from the send CQ. Never blocks.
    fn poll_send(&self, max: usize) -> Vec<Completion>;

    /// Reap up to `max` completions from the receive CQ. Never blocks.
    ///
    /// Payload bytes for a reaped receive completion land directly in the
    /// buffer that was `post_recv`'d with the matching `wr_id` — the same
    /// contract real RDMA hardware gives (DMA writes land in the posted
    /// buffer before the completion is visible), so there is no separate
    /// "fetch payload" call.
    fn poll_recv(&self, max: usize) -> Vec<Completion>;
}
