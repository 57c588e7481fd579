//! Implicit-handle non-blocking ops and access regions (spec §4.6, §6):
//! `get_nbi`/`put_nbi`/`put_nbi_bulk`/`memset_nbi` bump the current thread's
//! access region counters instead of minting a fresh handle per call, and
//! `try_syncnbi_*`/`wait_syncnbi_*` drain those counters directly.
//! `begin_nbi_accessregion`/`end_nbi_accessregion` bracket a region.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use gasnet_core::engine::Engine;
use gasnet_core::error::fatal;
use gasnet_core::segment::NodeId;
use gasnet_core::transport::Transport;

use crate::eop::{self, Eop};
use crate::memset;

/// `get_nbi`: issue a get tracked by the current access region's gets
/// counter rather than a fresh handle.
///
/// # Safety
/// Same as [`crate::explicit::get_nb`].
pub unsafe fn get_nbi<T: Transport>(
    engine: &Engine<T>,
    dst: *mut u8,
    peer: NodeId,
    src_addr: u64,
    len: usize,
    pinned: bool,
    lkey: Option<u32>,
) -> gasnet_core::error::Result<()> {
    let counter = eop::current_gets_counter();
    engine.rdma_get(peer, dst, len, src_addr, pinned, lkey, Some(counter))
}

/// `put_nbi`: issue a put tracked by the current access region's puts
/// counter, additionally waiting synchronously for source-safety (C5's
/// `mem_done` counter) before returning — see
/// [`crate::explicit::put_nb`]'s doc comment.
///
/// # Safety
/// Same as [`crate::explicit::put_nb`].
pub unsafe fn put_nbi<T: Transport>(
    engine: &Engine<T>,
    peer: NodeId,
    dst_addr: u64,
    src: *const u8,
    len: usize,
    lkey: Option<u32>,
) -> gasnet_core::error::Result<()> {
    let counter = eop::current_puts_counter();
    let mem_done = Arc::new(AtomicUsize::new(0));
    engine.rdma_put(peer, dst_addr, src, len, lkey, Some(mem_done.clone()), Some(counter))?;
    while mem_done.load(Ordering::Acquire) != 0 {
        engine.poll();
    }
    Ok(())
}

/// `put_nbi_bulk`: like [`put_nbi`] but doesn't wait for source-safety — see
/// [`crate::explicit::put_nb_bulk`]'s doc comment.
///
/// # Safety
/// Same as [`put_nbi`].
pub unsafe fn put_nbi_bulk<T: Transport>(
    engine: &Engine<T>,
    peer: NodeId,
    dst_addr: u64,
    src: *const u8,
    len: usize,
    lkey: Option<u32>,
) -> gasnet_core::error::Result<()> {
    let counter = eop::current_puts_counter();
    engine.rdma_put(peer, dst_addr, src, len, lkey, None, Some(counter))
}

/// `memset_nbi`: fill `len` bytes at `dst_addr` on `peer` with `byte`,
/// tracked by the current region's puts counter (a memset is a one-sided
/// write, same accounting bucket a put uses).
///
/// # Safety
/// `dst_addr` must be valid on `peer` for `len` bytes.
pub unsafe fn memset_nbi<T: Transport>(engine: &Engine<T>, peer: NodeId, dst_addr: u64, byte: u8, len: usize) {
    let counter = eop::current_puts_counter();
    memset::memset_into(engine, peer, dst_addr, byte, len, counter)
        .unwrap_or_else(|e| fatal("memset_nbi", e));
}

// ---- sync ----

pub fn try_syncnbi_gets() -> bool {
    eop::gets_done()
}

pub fn try_syncnbi_puts() -> bool {
    eop::puts_done()
}

pub fn try_syncnbi_all() -> bool {
    eop::gets_done() && eop::puts_done()
}

pub fn wait_syncnbi_gets<T: Transport>(engine: &Engine<T>) {
    while !eop::gets_done() {
        engine.poll();
    }
}

pub fn wait_syncnbi_puts<T: Transport>(engine: &Engine<T>) {
    while !eop::puts_done() {
        engine.poll();
    }
}

pub fn wait_syncnbi_all<T: Transport>(engine: &Engine<T>) {
    while !try_syncnbi_all() {
        engine.poll();
    }
}

/// `begin_nbi_accessregion`: open a fresh region on the calling thread.
/// Fatal if one is already open (spec §4.6: regions don't nest).
pub fn begin_nbi_accessregion() {
    eop::begin_region();
}

/// `end_nbi_accessregion`: close the region and return one combined handle
/// covering every `*_nbi` call issued inside it, usable with the explicit
/// `try_syncnb`/`wait_syncnb` family.
pub fn end_nbi_accessregion() -> Eop {
    let (gets, puts) = eop::end_region();
    eop::alloc_many(vec![gets, puts])
}

#[cfg(test)]
mod tests {
    use super::*;
    use gasnet_bootstrap::loopback::LoopbackJob;
    use gasnet_core::config::Config;
    use gasnet_core::connection::ConnectionManager;
    use gasnet_core::transport::sim::Fabric;

    fn solo_engine() -> Engine<gasnet_core::transport::sim::LoopbackTransport> {
        let fabric = Fabric::new();
        let node = fabric.node();
        let mgr = ConnectionManager::new(node, 1, 16, 1);
        let bootstrap = LoopbackJob::new(1).node(0);
        mgr.connect_all(&bootstrap, 1, 0).unwrap();
        Engine::new(mgr, Config::default(), 0)
    }

    #[test]
    fn access_region_combined_handle_waits_for_every_nbi_put() {
        let engine = solo_engine();
        let mut remote = [0u8; 32];
        let local = [3u8; 8];

        begin_nbi_accessregion();
        unsafe {
            for i in 0..4u64 {
                put_nbi(&engine, 0, remote.as_mut_ptr() as u64 + i * 8, local.as_ptr(), 8, None).unwrap();
            }
        }
        let handle = end_nbi_accessregion();
        crate::explicit::wait_syncnb(&engine, handle);

        assert_eq!(&remote[..8], &local);
        assert_eq!(&remote[24..32], &local);
    }

    #[test]
    fn default_region_tracks_puts_independently_of_gets() {
        let engine = solo_engine();
        let mut remote = [0u8; 8];
        let local = [5u8; 4];
        let mut dst = [0u8; 4];
        unsafe {
            put_nbi(&engine, 0, remote.as_mut_ptr() as u64, local.as_ptr(), 4, None).unwrap();
            get_nbi(&engine, dst.as_mut_ptr(), 0, remote.as_ptr() as u64, 4, true, None).unwrap();
        }
        wait_syncnbi_all(&engine);
        assert!(try_syncnbi_gets());
        assert!(try_syncnbi_puts());
        assert_eq!(dst, local);
    }
}
