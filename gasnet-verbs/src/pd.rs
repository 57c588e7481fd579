use std::io;
use std::ptr::NonNull;
use std::sync::Arc;

use rdma_sys::*;

use crate::context::Context;
use crate::error::{Error, Result};

struct PdInner {
    ctx: Context,
    pd: NonNull<ibv_pd>,
}

unsafe impl Send for PdInner {}
unsafe impl Sync for PdInner {}

impl Drop for PdInner {
    fn drop(&mut self) {
        unsafe {
            ibv_dealloc_pd(self.pd.as_ptr());
        }
    }
}

/// Protection domain. One is allocated per endpoint and shared by every
/// queue pair and memory region (the buffer pool's regions, and every
/// Firehose-pinned bucket).
#[derive(Clone)]
pub struct Pd {
    inner: Arc<PdInner>,
}

impl Pd {
    pub fn new(ctx: Context) -> Result<Self> {
        let pd = NonNull::new(unsafe { ibv_alloc_pd(ctx.as_raw()) })
            .ok_or_else(|| Error::AllocPd(io::Error::last_os_error()))?;
        Ok(Pd {
            inner: Arc::new(PdInner { ctx, pd }),
        })
    }

    #[inline]
    pub fn as_raw(&self) -> *mut ibv_pd {
        self.inner.pd.as_ptr()
    }

    #[inline]
    pub fn context(&self) -> Context {
        self.inner.ctx.clone()
    }
}
