//! Large-memset path (spec §4.6's small/large split). At or below
//! [`gasnet_core::config::MEMSET_PUT_LIMIT`], a memset is just a chunked
//! RDMA put of a bounce-filled buffer — `gasnet_core::engine::Engine::rdma_memset`
//! already does that. Above it, shipping the whole fill pattern as put
//! payload wastes network traffic the peer's own `memset` could do in
//! microseconds, so this module instead sends one small AM asking the peer
//! to fill the range itself and ack when done.
//!
//! A [`gasnet_core::am::HandlerFn`] is a bare function pointer with no
//! captured state, so matching an ack back to the right completion counter
//! needs a process-wide tag table — the same `id -> state` pattern
//! `gasnet-core::engine` uses for in-flight work requests, keyed here by a
//! tag carried in the AM's own args instead of a wr_id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};

use gasnet_core::am::{AmToken, HandlerFn, HandlerRange};
use gasnet_core::engine::{Counter, Engine};
use gasnet_core::error::fatal;
use gasnet_core::segment::NodeId;
use gasnet_core::transport::Transport;

/// Runs a remote memset and acks. Registered once, in the Extended handler
/// range; the same index serves both directions — `token.is_request()`
/// tells a request (run the fill) from the reply to one we sent (drop the
/// tag's counter).
pub const MEMSET_RUN_HANDLER: u8 = 64;

fn pending() -> &'static Mutex<HashMap<u64, Counter>> {
    static PENDING: OnceLock<Mutex<HashMap<u64, Counter>>> = OnceLock::new();
    PENDING.get_or_init(|| Mutex::new(HashMap::new()))
}

static NEXT_TAG: AtomicU64 = AtomicU64::new(1);

/// `(handler_index, range, function)` this crate needs registered at attach
/// time — fold into the client's own handler list passed to
/// `Endpoint::attach`.
pub fn handlers() -> Vec<(u8, HandlerRange, HandlerFn)> {
    vec![(MEMSET_RUN_HANDLER, HandlerRange::Extended, memset_handler)]
}

fn memset_handler(token: &AmToken<'_>, args: &[u32]) {
    let tag = (args[0] as u64) | ((args[1] as u64) << 32);
    if token.is_request() {
        let dst_addr = (args[2] as u64) | ((args[3] as u64) << 32);
        let len = (args[4] as u64) | ((args[5] as u64) << 32);
        let byte = args[6] as u8;
        // SAFETY: the requester already validated `dst_addr..+len` lies in
        // this node's segment before sending (same invariant an AM Long's
        // destination carries).
        unsafe {
            std::ptr::write_bytes(dst_addr as *mut u8, byte, len as usize);
        }
        token.reply(&[args[0], args[1]], &[]);
    } else {
        let counter = pending().lock().unwrap().remove(&tag);
        match counter {
            Some(c) => {
                let prev = c.fetch_sub(1, Ordering::AcqRel);
                debug_assert!(prev > 0, "remote memset ack for a tag with no outstanding count");
            }
            None => debug_assert!(false, "remote memset ack for an unknown tag {tag}"),
        }
    }
}

/// Issue a memset, choosing the put-based or AM-driven path per spec §4.6's
/// size split, bumping `counter` once for the caller to track completion.
///
/// # Safety
/// `dst_addr` must be valid on `peer` for `len` bytes.
pub(crate) unsafe fn memset_nb<T: Transport>(
    engine: &Engine<T>,
    peer: NodeId,
    dst_addr: u64,
    byte: u8,
    len: usize,
) -> crate::eop::Eop {
    let (eop, counter) = crate::eop::alloc_one();
    memset_into(engine, peer, dst_addr, byte, len, counter).unwrap_or_else(|e| fatal("memset_nb", e));
    eop
}

/// Same size-split logic as [`memset_nb`], but against a caller-supplied
/// counter instead of a freshly allocated one — what `memset_nbi` bumps the
/// current access region's puts counter through.
///
/// # Safety
/// `dst_addr` must be valid on `peer` for `len` bytes.
pub(crate) unsafe fn memset_into<T: Transport>(
    engine: &Engine<T>,
    peer: NodeId,
    dst_addr: u64,
    byte: u8,
    len: usize,
    counter: Counter,
) -> gasnet_core::error::Result<()> {
    if len <= gasnet_core::config::MEMSET_PUT_LIMIT {
        engine.rdma_memset(peer, dst_addr, byte, len, Some(counter))
    } else {
        send_large(engine, peer, dst_addr, byte, len, counter);
        Ok(())
    }
}

fn send_large<T: Transport>(engine: &Engine<T>, peer: NodeId, dst_addr: u64, byte: u8, len: usize, counter: Counter) {
    counter.fetch_add(1, Ordering::AcqRel);
    let tag = NEXT_TAG.fetch_add(1, Ordering::Relaxed);
    pending().lock().unwrap().insert(tag, counter);
    let args = [
        tag as u32,
        (tag >> 32) as u32,
        dst_addr as u32,
        (dst_addr >> 32) as u32,
        len as u32,
        (len >> 32) as u32,
        byte as u32,
    ];
    engine
        .am_request_medium(peer, MEMSET_RUN_HANDLER, &args, &[])
        .unwrap_or_else(|e| fatal("memset_nb large path", e));
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
        let engine = Engine::new(mgr, Config::default(), 0);
        engine.dispatcher.lock().unwrap().register(MEMSET_RUN_HANDLER, HandlerRange::Extended, memset_handler).unwrap();
        engine
    }

    #[test]
    fn small_memset_goes_through_the_put_path() {
        let engine = solo_engine();
        let mut buf = [0xFFu8; 64];
        unsafe {
            let eop = memset_nb(&engine, 0, buf.as_mut_ptr() as u64, 0xAB, 64);
            crate::eop::wait_and_free(&engine, eop);
        }
        assert!(buf.iter().all(|&b| b == 0xAB));
    }

    #[test]
    fn large_memset_round_trips_through_the_ack_handler() {
        let engine = solo_engine();
        let mut buf = vec![0u8; gasnet_core::config::MEMSET_PUT_LIMIT + 4096];
        let len = buf.len();
        unsafe {
            let eop = memset_nb(&engine, 0, buf.as_mut_ptr() as u64, 0x5A, len);
            crate::eop::wait_and_free(&engine, eop);
        }
        assert!(buf.iter().all(|&b| b == 0x5A));
        assert!(pending().lock().unwrap().is_empty());
    }
}
