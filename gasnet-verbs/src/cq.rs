use std::io;
use std::ptr::NonNull;
use std::sync::Arc;

use rdma_sys::*;
use thiserror::Error;

use crate::context::Context;
use crate::error::{Error, Result};

/// Opcode of a completion queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcOpcode {
    Send,
    RdmaWrite,
    RdmaRead,
    Recv,
    RecvRdmaWithImm,
}

impl From<u32> for WcOpcode {
    fn from(opcode: u32) -> Self {
        match opcode {
            ibv_wc_opcode::IBV_WC_SEND => WcOpcode::Send,
            ibv_wc_opcode::IBV_WC_RDMA_WRITE => WcOpcode::RdmaWrite,
            ibv_wc_opcode::IBV_WC_RDMA_READ => WcOpcode::RdmaRead,
            ibv_wc_opcode::IBV_WC_RECV => WcOpcode::Recv,
            ibv_wc_opcode::IBV_WC_RECV_RDMA_WITH_IMM => WcOpcode::RecvRdmaWithImm,
            other => panic!("unexpected wc opcode {other}"),
        }
    }
}

/// Completion status. Anything other than `Success` is fatal per spec §4.3
/// ("Non-success verbs completions are fatal").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WcStatus {
    #[error("success")]
    Success,
    #[error("local length error")]
    LocLenErr,
    #[error("local QP operation error")]
    LocQpOpErr,
    #[error("local protection error")]
    LocProtErr,
    #[error("work request flushed")]
    WrFlushErr,
    #[error("retry exceeded")]
    RetryExcErr,
    #[error("RNR retry exceeded")]
    RnrRetryExcErr,
    #[error("remote invalid request")]
    RemInvReqErr,
    #[error("remote access error")]
    RemAccessErr,
    #[error("remote operation error")]
    RemOpErr,
    #[error("other verbs error ({0})")]
    Other(u32),
}

impl From<u32> for WcStatus {
    fn from(status: u32) -> Self {
        match status {
            ibv_wc_status::IBV_WC_SUCCESS => WcStatus::Success,
            ibv_wc_status::IBV_WC_LOC_LEN_ERR => WcStatus::LocLenErr,
            ibv_wc_status::IBV_WC_LOC_QP_OP_ERR => WcStatus::LocQpOpErr,
            ibv_wc_status::IBV_WC_LOC_PROT_ERR => WcStatus::LocProtErr,
            ibv_wc_status::IBV_WC_WR_FLUSH_ERR => WcStatus::WrFlushErr,
            ibv_wc_status::IBV_WC_RETRY_EXC_ERR => WcStatus::RetryExcErr,
            ibv_wc_status::IBV_WC_RNR_RETRY_EXC_ERR => WcStatus::RnrRetryExcErr,
            ibv_wc_status::IBV_WC_REM_INV_REQ_ERR => WcStatus::RemInvReqErr,
            ibv_wc_status::IBV_WC_REM_ACCESS_ERR => WcStatus::RemAccessErr,
            ibv_wc_status::IBV_WC_REM_OP_ERR => WcStatus::RemOpErr,
            other => WcStatus::Other(other),
        }
    }
}

/// One reaped work completion.
#[derive(Debug, Clone, Copy)]
pub struct Wc {
    pub wr_id: u64,
    pub status: WcStatus,
    pub opcode: WcOpcode,
    pub byte_len: u32,
    pub imm_data: u32,
}

struct CqInner {
    ctx: Context,
    cq: NonNull<ibv_cq>,
}

unsafe impl Send for CqInner {}
unsafe impl Sync for CqInner {}

impl Drop for CqInner {
    fn drop(&mut self) {
        unsafe {
            ibv_destroy_cq(self.cq.as_ptr());
        }
    }
}

/// Completion queue. The send/receive engine (`gasnet-core::engine`) holds
/// one send CQ and one receive CQ per HCA port and reaps both every
/// `poll()`, per spec §4.3.
#[derive(Clone)]
pub struct Cq {
    inner: Arc<CqInner>,
}

impl Cq {
    pub fn new(ctx: Context, capacity: i32) -> Result<Self> {
        let cq = NonNull::new(unsafe {
            ibv_create_cq(
                ctx.as_raw(),
                capacity,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                0,
            )
        })
        .ok_or_else(|| Error::CreateCq(io::Error::last_os_error()))?;

        Ok(Cq {
            inner: Arc::new(CqInner { ctx, cq }),
        })
    }

    #[inline]
    pub fn as_raw(&self) -> *mut ibv_cq {
        self.inner.cq.as_ptr()
    }

    /// Reap up to `wc.len()` completions without blocking. Returns the
    /// number reaped.
    pub fn poll(&self, wc: &mut [Wc]) -> Result<usize> {
        let mut raw: Vec<ibv_wc> = vec![unsafe { std::mem::zeroed() }; wc.len()];
        let n = unsafe { ibv_poll_cq(self.inner.cq.as_ptr(), raw.len() as i32, raw.as_mut_ptr()) };
        if n < 0 {
            return Err(Error::PollCq(io::Error::last_os_error()));
        }
        for i in 0..(n as usize) {
            wc[i] = Wc {
                wr_id: raw[i].wr_id,
                status: WcStatus::from(raw[i].status),
                opcode: WcOpcode::from(raw[i].opcode),
                byte_len: raw[i].byte_len,
                imm_data: unsafe { raw[i].imm_data_invalidated_rkey_union.imm_data },
            };
        }
        Ok(n as usize)
    }
}
