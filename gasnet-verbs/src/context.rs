use std::io;
use std::ptr::NonNull;
use std::sync::Arc;

use rdma_sys::*;

use crate::error::{Error, Result};

/// A 16-byte InfiniBand GID, as exchanged during the bootstrap address
/// exchange that builds the segment table (spec §3, "Segment").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Gid(pub [u8; 16]);

impl From<ibv_gid> for Gid {
    fn from(gid: ibv_gid) -> Self {
        Gid(unsafe { gid.raw })
    }
}

struct ContextInner {
    ctx: NonNull<ibv_context>,
    port_num: u8,
    lid: u16,
    gid: Gid,
    gid_index: u8,
    mtu: u32,
}

unsafe impl Send for ContextInner {}
unsafe impl Sync for ContextInner {}

impl Drop for ContextInner {
    fn drop(&mut self) {
        unsafe {
            ibv_close_device(self.ctx.as_ptr());
        }
    }
}

/// An opened HCA device context bound to one active port.
///
/// Exactly one `Context` is opened per process in the reference
/// implementation: it backs the single process-global `Endpoint` described in
/// spec §3.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    /// Open the first RDMA device reported by the driver and bring up
    /// `port_num` (1-based, matching libibverbs convention).
    pub fn open(port_num: u8) -> Result<Self> {
        let devices = unsafe {
            let mut num_devices = 0;
            let list = ibv_get_device_list(&mut num_devices);
            if list.is_null() || num_devices == 0 {
                return Err(Error::NoDevices);
            }
            std::slice::from_raw_parts(list, num_devices as usize)
        };

        let ctx = NonNull::new(unsafe { ibv_open_device(devices[0]) })
            .ok_or_else(|| Error::OpenDevice(io::Error::last_os_error()))?;

        unsafe { ibv_free_device_list(devices.as_ptr() as *mut _) };

        let mut port_attr = unsafe { std::mem::zeroed::<ibv_port_attr>() };
        let ret = unsafe { ibv_query_port(ctx.as_ptr(), port_num, &mut port_attr) };
        if ret != 0 {
            return Err(Error::QueryPort(io::Error::from_raw_os_error(ret), port_num));
        }

        let mut gid = unsafe { std::mem::zeroed::<ibv_gid>() };
        let gid_index: u8 = 0;
        let ret = unsafe { ibv_query_gid(ctx.as_ptr(), port_num, gid_index as i32, &mut gid) };
        if ret != 0 {
            return Err(Error::QueryGid(io::Error::from_raw_os_error(ret)));
        }

        Ok(Context {
            inner: Arc::new(ContextInner {
                ctx,
                port_num,
                lid: port_attr.lid,
                gid: Gid::from(gid),
                gid_index,
                mtu: port_attr.active_mtu,
            }),
        })
    }

    #[inline]
    pub fn as_raw(&self) -> *mut ibv_context {
        self.inner.ctx.as_ptr()
    }

    #[inline]
    pub fn port_num(&self) -> u8 {
        self.inner.port_num
    }

    #[inline]
    pub fn lid(&self) -> u16 {
        self.inner.lid
    }

    #[inline]
    pub fn gid(&self) -> Gid {
        self.inner.gid
    }

    #[inline]
    pub fn gid_index(&self) -> u8 {
        self.inner.gid_index
    }

    #[inline]
    pub fn mtu_raw(&self) -> u32 {
        self.inner.mtu
    }
}
