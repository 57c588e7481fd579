//! Explicit-handle non-blocking ops (spec §4.6, §6): `get_nb`/`put_nb`/
//! `put_nb_bulk`/`memset_nb`, and the `try_syncnb*`/`wait_syncnb*` family
//! that drains the handles they return.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use gasnet_core::engine::Engine;
use gasnet_core::error::fatal;
use gasnet_core::segment::NodeId;
use gasnet_core::transport::Transport;

use crate::eop::{self, Eop};
use crate::memset;

/// `get_nb`: issue a get, return a handle covering the whole transfer.
///
/// # Safety
/// `dst` must point to `len` writable bytes valid until the handle
/// completes (via [`try_syncnb`]/[`wait_syncnb`]).
pub unsafe fn get_nb<T: Transport>(
    engine: &Engine<T>,
    dst: *mut u8,
    peer: NodeId,
    src_addr: u64,
    len: usize,
    pinned: bool,
    lkey: Option<u32>,
) -> Eop {
    let (eop, counter) = eop::alloc_one();
    engine
        .rdma_get(peer, dst, len, src_addr, pinned, lkey, Some(counter))
        .unwrap_or_else(|e| fatal("get_nb", e));
    eop
}

/// `put_nb`: issue a put, additionally waiting synchronously for
/// source-safety (C5's `mem_done` counter) before returning, so `src` is
/// reusable the instant this call returns — unlike [`put_nb_bulk`], whose
/// zero-copy path may still be reading `src` after it returns.
///
/// # Safety
/// `src` must point to `len` readable bytes, valid until this call returns.
pub unsafe fn put_nb<T: Transport>(
    engine: &Engine<T>,
    peer: NodeId,
    dst_addr: u64,
    src: *const u8,
    len: usize,
    lkey: Option<u32>,
) -> Eop {
    let (eop, req_done) = eop::alloc_one();
    let mem_done = Arc::new(AtomicUsize::new(0));
    engine
        .rdma_put(peer, dst_addr, src, len, lkey, Some(mem_done.clone()), Some(req_done))
        .unwrap_or_else(|e| fatal("put_nb", e));
    while mem_done.load(Ordering::Acquire) != 0 {
        engine.poll();
    }
    eop
}

/// `put_nb_bulk`: like [`put_nb`] but returns as soon as the operation is
/// issued, without waiting for `src` to become safely reusable — the caller
/// takes on that responsibility itself (spec §4.6: bulk variants license
/// this in exchange for not blocking the issuing thread on source-safety).
///
/// # Safety
/// `src` must point to `len` readable bytes, valid until the handle
/// completes.
pub unsafe fn put_nb_bulk<T: Transport>(
    engine: &Engine<T>,
    peer: NodeId,
    dst_addr: u64,
    src: *const u8,
    len: usize,
    lkey: Option<u32>,
) -> Eop {
    let (eop, counter) = eop::alloc_one();
    engine
        .rdma_put(peer, dst_addr, src, len, lkey, None, Some(counter))
        .unwrap_or_else(|e| fatal("put_nb", e));
    eop
}

/// `memset_nb`: fill `len` bytes at `dst_addr` on `peer` with `byte`,
/// choosing the put-based or AM-driven path per spec §4.6's size split.
///
/// # Safety
/// `dst_addr` must be valid on `peer` for `len` bytes.
pub unsafe fn memset_nb<T: Transport>(engine: &Engine<T>, peer: NodeId, dst_addr: u64, byte: u8, len: usize) -> Eop {
    memset::memset_nb(engine, peer, dst_addr, byte, len)
}

// ---- sync ----

/// `try_syncnb`: non-blocking completion check. `true` means the handle is
/// done and has been freed; `false` means it's still outstanding.
pub fn try_syncnb(eop: Eop) -> bool {
    eop::try_free(eop)
}

/// `try_syncnb_some`: drains every already-completed handle out of `eops` in
/// place, returning `true` iff at least one was removed.
pub fn try_syncnb_some(eops: &mut Vec<Eop>) -> bool {
    let before = eops.len();
    eops.retain(|&e| !eop::try_free(e));
    eops.len() != before
}

/// `try_syncnb_all`: only succeeds — and only then drains the list — once
/// every handle is done.
pub fn try_syncnb_all(eops: &mut Vec<Eop>) -> bool {
    if eops.iter().all(|&e| eop::is_done(e)) {
        for &e in eops.iter() {
            eop::try_free(e);
        }
        eops.clear();
        true
    } else {
        false
    }
}

/// `wait_syncnb`: poll until `eop` completes, then free it.
pub fn wait_syncnb<T: Transport>(engine: &Engine<T>, eop: Eop) {
    eop::wait_and_free(engine, eop);
}

/// `wait_syncnb_some`: poll until at least one handle in `eops` completes,
/// draining whichever ones did.
pub fn wait_syncnb_some<T: Transport>(engine: &Engine<T>, eops: &mut Vec<Eop>) {
    while !try_syncnb_some(eops) {
        engine.poll();
    }
}

/// `wait_syncnb_all`: poll until every handle in `eops` has completed.
pub fn wait_syncnb_all<T: Transport>(engine: &Engine<T>, eops: &mut Vec<Eop>) {
    while !eops.is_empty() {
        try_syncnb_some(eops);
        if !eops.is_empty() {
            engine.poll();
        }
    }
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
    fn put_then_get_round_trip_via_explicit_handles() {
        let engine = solo_engine();
        let mut remote = [0u8; 8];
        let local = [7u8, 1, 2, 3];
        unsafe {
            let h = put_nb(&engine, 0, remote.as_mut_ptr() as u64, local.as_ptr(), 4, None);
            wait_syncnb(&engine, h);
        }
        assert_eq!(&remote[..4], &local);

        let mut dst = [0u8; 4];
        unsafe {
            let h = get_nb(&engine, dst.as_mut_ptr(), 0, remote.as_ptr() as u64, 4, true, None);
            wait_syncnb(&engine, h);
        }
        assert_eq!(dst, local);
    }

    #[test]
    fn wait_syncnb_all_drains_every_handle() {
        let engine = solo_engine();
        let mut remote = [0u8; 64];
        let local = [9u8; 8];
        let mut handles = Vec::new();
        unsafe {
            for i in 0..4u64 {
                handles.push(put_nb(&engine, 0, remote.as_mut_ptr() as u64 + i * 8, local.as_ptr(), 8, None));
            }
        }
        wait_syncnb_all(&engine, &mut handles);
        assert!(handles.is_empty());
        assert_eq!(&remote[..8], &local);
        assert_eq!(&remote[24..32], &local);
    }

    #[test]
    fn try_syncnb_some_only_drains_completed_handles() {
        let engine = solo_engine();
        let mut remote = [0u8; 16];
        let local = [1u8; 8];
        let mut handles = Vec::new();
        unsafe {
            handles.push(put_nb(&engine, 0, remote.as_mut_ptr() as u64, local.as_ptr(), 8, None));
        }
        // Loopback puts complete as soon as the engine is polled once; give
        // it that chance before asserting the drain actually did something.
        engine.poll();
        engine.poll();
        assert!(try_syncnb_some(&mut handles));
        assert!(handles.is_empty());
    }
}
