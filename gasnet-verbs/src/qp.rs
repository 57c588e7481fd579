use std::io;
use std::ptr::NonNull;
use std::sync::Arc;

use rdma_sys::*;

use crate::cq::Cq;
use crate::error::{check, Error, Result};
use crate::mr::Mr;
use crate::pd::Pd;

/// Queue pair type. GASNet only ever uses reliable-connected QPs (spec §1:
/// "a reliable-connected RDMA fabric"); `Ud` is kept only because the
/// underlying verbs API is typed over it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QpType {
    Rc,
}

impl From<QpType> for u32 {
    fn from(t: QpType) -> Self {
        match t {
            QpType::Rc => ibv_qp_type::IBV_QPT_RC,
        }
    }
}

/// Queue pair state, mirroring spec §4.2's RESET→INIT→RTR→RTS machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QpState {
    Reset,
    Init,
    Rtr,
    Rts,
    Error,
}

impl From<u32> for QpState {
    fn from(state: u32) -> Self {
        match state {
            ibv_qp_state::IBV_QPS_RESET => QpState::Reset,
            ibv_qp_state::IBV_QPS_INIT => QpState::Init,
            ibv_qp_state::IBV_QPS_RTR => QpState::Rtr,
            ibv_qp_state::IBV_QPS_RTS => QpState::Rts,
            _ => QpState::Error,
        }
    }
}

/// Queue pair capability attributes (spec §4.2's "network depth" and send
/// queue sizing feed into this).
#[derive(Debug, Clone, Copy)]
pub struct QpCaps {
    pub max_send_wr: u32,
    pub max_recv_wr: u32,
    pub max_send_sge: u32,
    pub max_recv_sge: u32,
    pub max_inline_data: u32,
}

impl QpCaps {
    pub fn new(depth: u32, inline_limit: u32) -> Self {
        QpCaps {
            max_send_wr: depth,
            max_recv_wr: depth,
            max_send_sge: 1,
            max_recv_sge: 1,
            max_inline_data: inline_limit,
        }
    }
}

/// Remote endpoint address data exchanged during bootstrap's initial
/// all-to-all (spec §4.2: "fixed-size records containing `{qpn, lid,
/// port_index, ...}`").
#[derive(Debug, Clone, Copy, Default)]
pub struct QpEndpoint {
    pub lid: u16,
    pub qpn: u32,
    pub psn: u32,
    pub port_num: u8,
}

struct QpInner {
    pd: Pd,
    qp: NonNull<ibv_qp>,
    caps: QpCaps,
}

unsafe impl Send for QpInner {}
unsafe impl Sync for QpInner {}

impl Drop for QpInner {
    fn drop(&mut self) {
        unsafe {
            ibv_destroy_qp(self.qp.as_ptr());
        }
    }
}

/// A reliable-connected queue pair to one peer (or one of several, when
/// striping is enabled; see spec §4.2's port tie-break).
#[derive(Clone)]
pub struct Qp {
    inner: Arc<QpInner>,
}

impl Qp {
    pub fn create(pd: Pd, send_cq: &Cq, recv_cq: &Cq, caps: QpCaps) -> Result<Self> {
        let mut init_attr = ibv_qp_init_attr {
            qp_context: std::ptr::null_mut(),
            send_cq: send_cq.as_raw(),
            recv_cq: recv_cq.as_raw(),
            srq: std::ptr::null_mut(),
            cap: ibv_qp_cap {
                max_send_wr: caps.max_send_wr,
                max_recv_wr: caps.max_recv_wr,
                max_send_sge: caps.max_send_sge,
                max_recv_sge: caps.max_recv_sge,
                max_inline_data: caps.max_inline_data,
            },
            qp_type: u32::from(QpType::Rc),
            sq_sig_all: 0,
        };

        let qp = NonNull::new(unsafe { ibv_create_qp(pd.as_raw(), &mut init_attr) })
            .ok_or_else(|| Error::CreateQp(io::Error::last_os_error()))?;

        Ok(Qp {
            inner: Arc::new(QpInner { pd, qp, caps }),
        })
    }

    #[inline]
    pub fn as_raw(&self) -> *mut ibv_qp {
        self.inner.qp.as_ptr()
    }

    #[inline]
    pub fn caps(&self) -> QpCaps {
        self.inner.caps
    }

    #[inline]
    pub fn qp_num(&self) -> u32 {
        unsafe { (*self.inner.qp.as_ptr()).qp_num }
    }

    #[inline]
    pub fn state(&self) -> QpState {
        QpState::from(unsafe { (*self.inner.qp.as_ptr()).state })
    }

    /// RESET -> INIT: bind the port, partition key, and remote read/write
    /// access flags (spec §4.2).
    pub fn modify_to_init(&self, port_num: u8) -> Result<()> {
        let mut attr = unsafe { std::mem::zeroed::<ibv_qp_attr>() };
        attr.qp_state = ibv_qp_state::IBV_QPS_INIT;
        attr.pkey_index = 0;
        attr.port_num = port_num;
        attr.qp_access_flags = (ibv_access_flags::IBV_ACCESS_REMOTE_WRITE
            | ibv_access_flags::IBV_ACCESS_REMOTE_READ)
            .0;

        let mask = ibv_qp_attr_mask::IBV_QP_STATE
            | ibv_qp_attr_mask::IBV_QP_PKEY_INDEX
            | ibv_qp_attr_mask::IBV_QP_PORT
            | ibv_qp_attr_mask::IBV_QP_ACCESS_FLAGS;

        let ret = unsafe { ibv_modify_qp(self.inner.qp.as_ptr(), &mut attr, mask.0 as i32) };
        check(ret, |e| Error::ModifyQp(e, QpState::Init))
    }

    /// INIT -> RTR: bind to the peer's QPN, initial PSN, path MTU, and
    /// inbound-atomic/responder limits (spec §4.2).
    pub fn modify_to_rtr(&self, peer: &QpEndpoint, path_mtu: u32) -> Result<()> {
        let mut attr = unsafe { std::mem::zeroed::<ibv_qp_attr>() };
        attr.qp_state = ibv_qp_state::IBV_QPS_RTR;
        attr.path_mtu = path_mtu;
        attr.dest_qp_num = peer.qpn;
        attr.rq_psn = peer.psn;
        attr.max_dest_rd_atomic = 16;
        attr.min_rnr_timer = 12;
        attr.ah_attr.dlid = peer.lid;
        attr.ah_attr.sl = 0;
        attr.ah_attr.src_path_bits = 0;
        attr.ah_attr.port_num = peer.port_num;
        attr.ah_attr.is_global = 0;

        let mask = ibv_qp_attr_mask::IBV_QP_STATE
            | ibv_qp_attr_mask::IBV_QP_AV
            | ibv_qp_attr_mask::IBV_QP_PATH_MTU
            | ibv_qp_attr_mask::IBV_QP_DEST_QPN
            | ibv_qp_attr_mask::IBV_QP_RQ_PSN
            | ibv_qp_attr_mask::IBV_QP_MAX_DEST_RD_ATOMIC
            | ibv_qp_attr_mask::IBV_QP_MIN_RNR_TIMER;

        let ret = unsafe { ibv_modify_qp(self.inner.qp.as_ptr(), &mut attr, mask.0 as i32) };
        check(ret, |e| Error::ModifyQp(e, QpState::Rtr))
    }

    /// RTR -> RTS: the outbound PSN, timeout, retry count, and an infinite
    /// RNR-retry policy (spec §4.3: "RNR flow control is configured to
    /// retry indefinitely because the receiver guarantees eventual buffer
    /// reposting").
    pub fn modify_to_rts(&self, local_psn: u32) -> Result<()> {
        let mut attr = unsafe { std::mem::zeroed::<ibv_qp_attr>() };
        attr.qp_state = ibv_qp_state::IBV_QPS_RTS;
        attr.sq_psn = local_psn;
        attr.max_rd_atomic = 16;
        attr.timeout = 14;
        attr.retry_cnt = 7;
        attr.rnr_retry = 7; // 7 = infinite retry, per the IB spec's RNR retry encoding

        let mask = ibv_qp_attr_mask::IBV_QP_STATE
            | ibv_qp_attr_mask::IBV_QP_SQ_PSN
            | ibv_qp_attr_mask::IBV_QP_MAX_QP_RD_ATOMIC
            | ibv_qp_attr_mask::IBV_QP_TIMEOUT
            | ibv_qp_attr_mask::IBV_QP_RETRY_CNT
            | ibv_qp_attr_mask::IBV_QP_RNR_RETRY;

        let ret = unsafe { ibv_modify_qp(self.inner.qp.as_ptr(), &mut attr, mask.0 as i32) };
        check(ret, |e| Error::ModifyQp(e, QpState::Rts))
    }

    /// Post an RDMA write (put) work request.
    pub fn post_write(
        &self,
        wr_id: u64,
        local_addr: *const u8,
        len: u32,
        lkey: u32,
        remote_addr: u64,
        rkey: u32,
        inline: bool,
        signaled: bool,
        imm: Option<u32>,
    ) -> Result<()> {
        let mut sge = ibv_sge {
            addr: local_addr as u64,
            length: len,
            lkey,
        };

        let opcode = if imm.is_some() {
            ibv_wr_opcode::IBV_WR_RDMA_WRITE_WITH_IMM
        } else {
            ibv_wr_opcode::IBV_WR_RDMA_WRITE
        };

        let mut flags = 0i32;
        if inline {
            flags |= ibv_send_flags::IBV_SEND_INLINE.0 as i32;
        }
        if signaled {
            flags |= ibv_send_flags::IBV_SEND_SIGNALED.0 as i32;
        }

        let mut wr: ibv_send_wr = unsafe { std::mem::zeroed() };
        wr.wr_id = wr_id;
        wr.next = std::ptr::null_mut();
        wr.sg_list = &mut sge;
        wr.num_sge = 1;
        wr.opcode = opcode;
        wr.send_flags = flags as u32;
        wr.wr.rdma.remote_addr = remote_addr;
        wr.wr.rdma.rkey = rkey;
        if let Some(imm) = imm {
            wr.imm_data = imm;
        }

        let mut bad_wr = std::ptr::null_mut();
        let ret = unsafe { ibv_post_send(self.inner.qp.as_ptr(), &mut wr, &mut bad_wr) };
        check(ret, Error::PostSend)
    }

    /// Post an RDMA read (get) work request.
    pub fn post_read(
        &self,
        wr_id: u64,
        local_addr: *mut u8,
        len: u32,
        lkey: u32,
        remote_addr: u64,
        rkey: u32,
        signaled: bool,
    ) -> Result<()> {
        let mut sge = ibv_sge {
            addr: local_addr as u64,
            length: len,
            lkey,
        };

        let mut flags = 0i32;
        if signaled {
            flags |= ibv_send_flags::IBV_SEND_SIGNALED.0 as i32;
        }

        let mut wr: ibv_send_wr = unsafe { std::mem::zeroed() };
        wr.wr_id = wr_id;
        wr.next = std::ptr::null_mut();
        wr.sg_list = &mut sge;
        wr.num_sge = 1;
        wr.opcode = ibv_wr_opcode::IBV_WR_RDMA_READ;
        wr.send_flags = flags as u32;
        wr.wr.rdma.remote_addr = remote_addr;
        wr.wr.rdma.rkey = rkey;

        let mut bad_wr = std::ptr::null_mut();
        let ret = unsafe { ibv_post_send(self.inner.qp.as_ptr(), &mut wr, &mut bad_wr) };
        check(ret, Error::PostSend)
    }

    /// Post a two-sided send carrying an Active Message (header in the
    /// immediate-data field, per spec §6's "32-bit header is carried in the
    /// transport's immediate-data field on every AM").
    pub fn post_send_am(
        &self,
        wr_id: u64,
        local_addr: *const u8,
        len: u32,
        lkey: u32,
        header: u32,
        inline: bool,
    ) -> Result<()> {
        let mut sge = ibv_sge {
            addr: local_addr as u64,
            length: len,
            lkey,
        };

        let mut flags = ibv_send_flags::IBV_SEND_SIGNALED.0 as i32;
        if inline {
            flags |= ibv_send_flags::IBV_SEND_INLINE.0 as i32;
        }

        let mut wr: ibv_send_wr = unsafe { std::mem::zeroed() };
        wr.wr_id = wr_id;
        wr.next = std::ptr::null_mut();
        wr.sg_list = &mut sge;
        wr.num_sge = if len == 0 { 0 } else { 1 };
        wr.opcode = ibv_wr_opcode::IBV_WR_SEND_WITH_IMM;
        wr.send_flags = flags as u32;
        wr.imm_data = header;

        let mut bad_wr = std::ptr::null_mut();
        let ret = unsafe { ibv_post_send(self.inner.qp.as_ptr(), &mut wr, &mut bad_wr) };
        check(ret, Error::PostSend)
    }

    /// Post a receive buffer (spec §3, "Receive buffer": "posted at attach
    /// and after each consuming completion").
    pub fn post_recv(&self, wr_id: u64, addr: *mut u8, len: u32, lkey: u32) -> Result<()> {
        let mut sge = ibv_sge {
            addr: addr as u64,
            length: len,
            lkey,
        };

        let mut wr: ibv_recv_wr = unsafe { std::mem::zeroed() };
        wr.wr_id = wr_id;
        wr.next = std::ptr::null_mut();
        wr.sg_list = &mut sge;
        wr.num_sge = 1;

        let mut bad_wr = std::ptr::null_mut();
        let ret = unsafe { ibv_post_recv(self.inner.qp.as_ptr(), &mut wr, &mut bad_wr) };
        check(ret, Error::PostRecv)
    }
}

/// Convenience for registering the segment/buffer pool memory this QP's
/// peer will target; kept here rather than on `Mr` because callers
/// typically need both together when wiring up a connection.
pub fn register_segment(pd: &Pd, addr: *mut u8, len: usize) -> Result<Mr> {
    unsafe { Mr::register(pd, addr, len) }
}
