//! The process-wide endpoint context (spec §3 "Endpoint", §9's design note:
//! "encapsulate global mutable state in one process-wide context object
//! constructed at init and destroyed at finalize").
//!
//! [`init`] and [`Endpoint::attach`] are the two-phase setup spec §6
//! describes; everything else here is a thin, mostly-delegating surface over
//! [`Engine`], [`SegmentTable`], and [`FirehoseTable`] — the point of this
//! module is to be the one place a client touches, not to hold logic of its
//! own.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::am::{AmToken, HandlerFn, HandlerRange};
use crate::bootstrap::Bootstrap;
use crate::config::Config;
use crate::connection::ConnectionManager;
use crate::engine::Engine;
use crate::error::{fatal, Error, Result};
use crate::firehose::FirehoseTable;
use crate::segment::{NodeId, SegmentDescriptor, SegmentKind, SegmentTable};
use crate::trace::{TraceMask, TraceSink};
use crate::transport::Transport;

/// Handler index reserved for orderly shutdown (spec §6's "unilateral exit
/// causes orderly shutdown of peers via a system AM", supplemented from
/// `original_source`'s system-category AM convention — see SPEC_FULL.md).
const SHUTDOWN_HANDLER: u8 = 1;

fn shutdown_handler(_token: &AmToken<'_>, _args: &[u32]) {
    std::process::exit(0);
}

/// Phase one of spec §6's two-phase setup: establishes job membership via
/// the bootstrap conduit and reports `(num_nodes, my_node)`. Does not touch
/// the fabric — that's [`Endpoint::attach`].
pub fn init(bootstrap: &dyn Bootstrap) -> (u32, NodeId) {
    (bootstrap.num_nodes(), bootstrap.my_node())
}

/// The process-global context: one per process, created by [`Endpoint::attach`]
/// and torn down by [`Endpoint::finalize`].
pub struct Endpoint<T: Transport> {
    engine: Engine<T>,
    segments: SegmentTable,
    firehose: FirehoseTable,
    bootstrap: Box<dyn Bootstrap>,
    segment_region: SegmentRegion,
    trace: TraceSink,
    stats: TraceSink,
    finalized: AtomicBool,
}

struct SegmentRegion {
    ptr: *mut u8,
    len: usize,
}

// SAFETY: the region is exposed to remote RDMA only through the registered
// `base`/`rkey` carried in `SegmentDescriptor`; local access is the client's
// own responsibility, same as any other pinned segment.
unsafe impl Send for SegmentRegion {}
unsafe impl Sync for SegmentRegion {}

impl Drop for SegmentRegion {
    fn drop(&mut self) {
        if self.len > 0 {
            unsafe {
                libc::munmap(self.ptr as *mut libc::c_void, self.len);
            }
        }
    }
}

impl<T: Transport> Endpoint<T> {
    /// Phase two of spec §6's setup. Drives the connection manager through
    /// `connect_all`, allocates and registers this node's segment, exchanges
    /// segment descriptors via one bootstrap collective, builds the firehose
    /// table over the resulting segment, and registers the client's handler
    /// table (core handlers, including shutdown, are registered first and
    /// are never visible to `handlers`).
    pub fn attach(
        bootstrap: Box<dyn Bootstrap>,
        transport: T,
        config: Config,
        segment_len: u64,
        num_ports: u8,
        handlers: Vec<(u8, HandlerRange, HandlerFn)>,
    ) -> Result<Self> {
        let num_nodes = bootstrap.num_nodes();
        let my_node = bootstrap.my_node();

        let connections = ConnectionManager::new(transport, num_nodes, config.network_depth, num_ports);
        connections.connect_all(bootstrap.as_ref(), 1, 0)?;

        let (region, local_desc) = alloc_segment(&connections, segment_len);

        let encoded = encode_descriptor(&local_desc);
        let all = bootstrap.exchange(&encoded)?;
        let descriptors: Vec<SegmentDescriptor> = all.iter().map(|b| decode_descriptor(b)).collect();
        let segments = SegmentTable::new(descriptors);

        let firehose = FirehoseTable::new(
            local_desc.base,
            local_desc.len,
            config.bucket_size,
            config.firehose_quota(num_nodes as usize),
            config.firehose_maxvictim_m,
            config.firehose_maxvictim_r,
        );

        let trace = TraceSink::new(config.trace_mask, config.trace_file.as_deref());
        let stats = TraceSink::new(config.stats_mask, config.stats_file.as_deref());

        let engine = Engine::new(connections, config, my_node);

        engine
            .dispatcher
            .lock()
            .unwrap()
            .register(SHUTDOWN_HANDLER, HandlerRange::Core, shutdown_handler)?;
        for (index, range, handler) in handlers {
            engine.dispatcher.lock().unwrap().register(index, range, handler)?;
        }

        for peer in 0..num_nodes {
            if peer != my_node {
                engine.post_recv_buffer(peer)?;
            }
        }
        bootstrap.barrier();

        Ok(Endpoint {
            engine,
            segments,
            firehose,
            bootstrap,
            segment_region: region,
            trace,
            stats,
            finalized: AtomicBool::new(false),
        })
    }

    /// Trace sink (C9), gated by `TRACEMASK`/`TRACEFILE`.
    pub fn trace(&self) -> &TraceSink {
        &self.trace
    }

    /// Stats sink (C9), gated by `STATSMASK`/`STATSFILE`.
    pub fn stats(&self) -> &TraceSink {
        &self.stats
    }

    pub fn my_node(&self) -> NodeId {
        self.engine.my_node()
    }

    pub fn num_nodes(&self) -> u32 {
        self.bootstrap.num_nodes()
    }

    pub fn engine(&self) -> &Engine<T> {
        &self.engine
    }

    pub fn firehose(&self) -> &FirehoseTable {
        &self.firehose
    }

    /// `getSegmentInfo` (spec §6): the full replicated segment table.
    pub fn segment_table(&self) -> &SegmentTable {
        &self.segments
    }

    /// `getMaxLocalSegmentSize`.
    pub fn max_local_segment_size(&self) -> u64 {
        self.segments.max_local_size(self.my_node())
    }

    /// `getMaxGlobalSegmentSize`.
    pub fn max_global_segment_size(&self) -> u64 {
        self.segments.max_global_size()
    }

    // ---- AM send wrappers (spec §6's `AMRequest*M`/`AMReply*M` family) ----

    pub fn am_request_short(&self, dest: NodeId, handler: u8, args: &[u32]) -> Result<()> {
        self.check_client_handler(handler)?;
        self.trace.emit(TraceMask::AM, format_args!("AMRequestShort dest={dest} handler={handler}"));
        self.engine.am_request_short(dest, handler, args)
    }

    pub fn am_reply_short(&self, dest: NodeId, handler: u8, args: &[u32]) -> Result<()> {
        self.check_client_handler(handler)?;
        self.trace.emit(TraceMask::AM, format_args!("AMReplyShort dest={dest} handler={handler}"));
        self.engine.am_reply_short(dest, handler, args)
    }

    pub fn am_request_medium(&self, dest: NodeId, handler: u8, args: &[u32], payload: &[u8]) -> Result<()> {
        self.check_client_handler(handler)?;
        self.trace.emit(
            TraceMask::AM,
            format_args!("AMRequestMedium dest={dest} handler={handler} nbytes={}", payload.len()),
        );
        self.engine.am_request_medium(dest, handler, args, payload)
    }

    pub fn am_reply_medium(&self, dest: NodeId, handler: u8, args: &[u32], payload: &[u8]) -> Result<()> {
        self.check_client_handler(handler)?;
        self.trace.emit(
            TraceMask::AM,
            format_args!("AMReplyMedium dest={dest} handler={handler} nbytes={}", payload.len()),
        );
        self.engine.am_reply_medium(dest, handler, args, payload)
    }

    /// # Safety
    /// `src_addr` must reference `nbytes` valid bytes for the duration of the
    /// call; `dst_addr` must lie within `dest`'s segment (or a region
    /// currently firehose-pinned there) per spec §3's segment invariant.
    pub unsafe fn am_request_long(
        &self,
        dest: NodeId,
        handler: u8,
        args: &[u32],
        src_addr: *const u8,
        nbytes: usize,
        dst_addr: u64,
    ) -> Result<()> {
        self.check_client_handler(handler)?;
        if dest != self.my_node() && !self.segments.in_segment(dest, dst_addr, nbytes as u64) {
            return Err(Error::BadArg("long AM destination address outside peer segment".into()));
        }
        self.engine.am_request_long(dest, handler, args, src_addr, nbytes, dst_addr)
    }

    /// # Safety
    /// Same as [`Self::am_request_long`]. Per spec §9's open question, an
    /// `AMReplyLongM` whose destination lies outside the replying peer's
    /// segment is transport-dependent; this implementation requires it lie
    /// in-segment, same as a request-long.
    pub unsafe fn am_reply_long(
        &self,
        dest: NodeId,
        handler: u8,
        args: &[u32],
        src_addr: *const u8,
        nbytes: usize,
        dst_addr: u64,
    ) -> Result<()> {
        self.check_client_handler(handler)?;
        if dest != self.my_node() && !self.segments.in_segment(dest, dst_addr, nbytes as u64) {
            return Err(Error::BadArg("reply-long destination address outside peer segment".into()));
        }
        self.engine.am_reply_long(dest, handler, args, src_addr, nbytes, dst_addr)
    }

    fn check_client_handler(&self, handler: u8) -> Result<()> {
        match crate::am::range_of(handler) {
            Some(HandlerRange::Client) => Ok(()),
            _ => Err(Error::BadArg(format!("handler {handler} is not a client handler index"))),
        }
    }

    /// `AMPoll`: drive progress once. Never blocks.
    pub fn am_poll(&self) {
        self.engine.poll();
    }

    /// `AMGetMsgSource`.
    pub fn am_get_msg_source(token: &AmToken<'_>) -> NodeId {
        token.source()
    }

    // ---- lifecycle ----

    /// Collective-preferred exit (spec §6). `code == 0` is treated as a
    /// cooperative shutdown: every other node's shutdown handler is invoked,
    /// then a closing barrier. A unilateral exit (all peers already gone, or
    /// `code != 0`) still sends the shutdown AM best-effort but does not wait
    /// on the barrier, since a barrier forbids progress for peers that never
    /// see it.
    pub fn exit(&self, code: i32) {
        for peer in 0..self.num_nodes() {
            if peer != self.my_node() {
                let _ = self.engine.am_request_short(peer, SHUTDOWN_HANDLER, &[code as u32]);
            }
        }
        if code == 0 {
            self.trace.emit(TraceMask::BARRIER, format_args!("exit barrier"));
            self.bootstrap.barrier();
        }
    }

    /// Tear down the endpoint context. Idempotent.
    pub fn finalize(&self) {
        self.finalized.store(true, Ordering::Release);
    }
}

impl<T: Transport> Drop for Endpoint<T> {
    fn drop(&mut self) {
        if !self.finalized.load(Ordering::Acquire) {
            log::warn!("Endpoint dropped without a call to finalize()");
        }
    }
}

fn alloc_segment<T: Transport>(connections: &ConnectionManager<T>, len: u64) -> (SegmentRegion, SegmentDescriptor) {
    let len = len.max(1);
    let ptr = unsafe {
        let addr = libc::mmap(
            std::ptr::null_mut(),
            len as usize,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
            -1,
            0,
        );
        if addr == libc::MAP_FAILED {
            fatal("segment allocation", std::io::Error::last_os_error());
        }
        addr as *mut u8
    };
    let keys = unsafe { connections.transport().register(ptr, len as usize) };
    let desc = SegmentDescriptor {
        base: ptr as u64,
        len,
        kind: SegmentKind::Everything,
        rkey: keys.rkey,
    };
    (SegmentRegion { ptr, len: len as usize }, desc)
}

fn encode_descriptor(d: &SegmentDescriptor) -> Vec<u8> {
    let mut out = Vec::with_capacity(21);
    out.extend_from_slice(&d.base.to_le_bytes());
    out.extend_from_slice(&d.len.to_le_bytes());
    out.extend_from_slice(&d.rkey.to_le_bytes());
    out.push(d.kind as u8);
    out
}

fn decode_descriptor(bytes: &[u8]) -> SegmentDescriptor {
    SegmentDescriptor {
        base: u64::from_le_bytes(bytes[0..8].try_into().unwrap()),
        len: u64::from_le_bytes(bytes[8..16].try_into().unwrap()),
        rkey: u32::from_le_bytes(bytes[16..20].try_into().unwrap()),
        kind: match bytes[20] {
            0 => SegmentKind::Fast,
            1 => SegmentKind::Large,
            _ => SegmentKind::Everything,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::test_support::SoloBootstrap;
    use crate::transport::sim::Fabric;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn attach_over_loopback_reaches_a_usable_endpoint() {
        static SEEN: AtomicU32 = AtomicU32::new(0);
        fn echo(_t: &AmToken<'_>, args: &[u32]) {
            SEEN.store(args[0], Ordering::SeqCst);
        }

        let fabric = Fabric::new();
        let node = fabric.node();
        let endpoint = Endpoint::attach(
            Box::new(SoloBootstrap),
            node,
            Config::default(),
            4096,
            1,
            vec![(200, HandlerRange::Client, echo)],
        )
        .unwrap();

        assert_eq!(endpoint.my_node(), 0);
        assert_eq!(endpoint.num_nodes(), 1);
        endpoint.am_request_short(0, 200, &[0x77]).unwrap();
        assert_eq!(SEEN.load(Ordering::SeqCst), 0x77);

        endpoint.exit(0);
        endpoint.finalize();
    }
}
