use std::io;
use std::ptr::NonNull;

use rdma_sys::*;

use crate::error::{Error, Result};
use crate::pd::Pd;

/// A registered memory region. Owns the registration, not the underlying
/// buffer: the caller (buffer pool or firehose bucket owner) must keep the
/// backing memory alive at least as long as the `Mr`.
pub struct Mr {
    mr: NonNull<ibv_mr>,
    addr: *mut u8,
    len: usize,
}

unsafe impl Send for Mr {}
unsafe impl Sync for Mr {}

impl Mr {
    /// Register `[addr, addr+len)` for local read/write and remote
    /// read/write/atomic access, as required for a segment or firehose
    /// bucket that can be targeted by a peer's RDMA put/get (spec §3).
    ///
    /// # Safety
    /// `addr` must point to `len` bytes of valid, pinnable memory that
    /// outlives the returned `Mr`.
    pub unsafe fn register(pd: &Pd, addr: *mut u8, len: usize) -> Result<Self> {
        let access = (ibv_access_flags::IBV_ACCESS_LOCAL_WRITE
            | ibv_access_flags::IBV_ACCESS_REMOTE_WRITE
            | ibv_access_flags::IBV_ACCESS_REMOTE_READ
            | ibv_access_flags::IBV_ACCESS_REMOTE_ATOMIC)
            .0;

        let mr = NonNull::new(ibv_reg_mr(pd.as_raw(), addr as *mut _, len, access as i32))
            .ok_or_else(|| Error::RegMr(io::Error::last_os_error()))?;

        Ok(Mr { mr, addr, len })
    }

    #[inline]
    pub fn lkey(&self) -> u32 {
        unsafe { (*self.mr.as_ptr()).lkey }
    }

    #[inline]
    pub fn rkey(&self) -> u32 {
        unsafe { (*self.mr.as_ptr()).rkey }
    }

    #[inline]
    pub fn addr(&self) -> *mut u8 {
        self.addr
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for Mr {
    fn drop(&mut self) {
        unsafe {
            ibv_dereg_mr(self.mr.as_ptr());
        }
    }
}
