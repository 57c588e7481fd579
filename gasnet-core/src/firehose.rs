//! Firehose pinning cache (C3, spec §4.4).
//!
//! Two tables, each index-based rather than pointer-based per §9's design
//! note ("cyclic FIFO/hash references are represented as indices into a
//! fixed array, not owning pointers, so the structure is trivially
//! relocatable and `Send`"):
//!
//! - [`LocalTable`]: one [`BucketDescriptor`] per bucket in the local
//!   segment, addressed by bucket number. Tracks how many remote peers hold
//!   a firehose to each bucket, and a victim FIFO of refcount-zero buckets.
//! - [`PeerFirehoseHash`]: per-peer, keyed by bucket address. An entry is
//!   this node's promise that a remote bucket is pinned and RDMA-able.
//!
//! Deciding which buckets to move is this module's job; actually sending the
//! firehose-move AM and waiting for the reply is the caller's (ultimately
//! `gasnet-core::am`'s) — see [`FirehoseTable::plan_remote_pin`] and
//! [`FirehoseTable::complete_remote_pin`].

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::segment::NodeId;

/// One descriptor per bucket in the local segment (spec §4.4 "Local bucket
/// table" / §3 "Firehose bucket descriptor"). `refcount` is the number of
/// remote peers currently holding a firehose to this bucket.
#[derive(Debug, Clone, Copy)]
struct BucketDescriptor {
    refcount: u32,
    prev: Option<u32>,
    next: Option<u32>,
    on_fifo: bool,
}

impl BucketDescriptor {
    fn unpinned() -> Self {
        BucketDescriptor {
            refcount: 0,
            prev: None,
            next: None,
            on_fifo: true,
        }
    }
}

/// A handle naming the local buckets a `local_pin`/`partial_local_pin` call
/// covered. Must be passed to [`LocalTable::release`] exactly once.
#[derive(Debug, Clone)]
pub struct LocalPinHandle {
    buckets: Vec<u32>,
}

impl LocalPinHandle {
    pub fn covers_bytes(&self, bucket_size: usize) -> usize {
        self.buckets.len() * bucket_size
    }
}

/// Local bucket table: one descriptor per bucket, plus a bounded victim FIFO
/// of refcount-zero buckets (spec §4.4's "Eviction policy").
pub struct LocalTable {
    bucket_size: usize,
    segment_base: u64,
    buckets: Vec<BucketDescriptor>,
    fifo_head: Option<u32>,
    fifo_tail: Option<u32>,
    fifo_len: usize,
    maxvictim: usize,
}

impl LocalTable {
    pub fn new(segment_base: u64, segment_len: u64, bucket_size: usize, maxvictim: usize) -> Self {
        let count = (segment_len as usize).div_ceil(bucket_size).max(1);
        LocalTable {
            bucket_size,
            segment_base,
            buckets: vec![BucketDescriptor::unpinned(); count],
            fifo_head: None,
            fifo_tail: None,
            fifo_len: 0,
            maxvictim,
        }
    }

    fn bucket_range(&self, addr: u64, len: u64) -> Result<std::ops::Range<u32>> {
        if addr < self.segment_base {
            return Err(Error::BadArg("address precedes segment base".into()));
        }
        let off = addr - self.segment_base;
        let first = (off / self.bucket_size as u64) as u32;
        let last = ((off + len.max(1) - 1) / self.bucket_size as u64) as u32;
        if last as usize >= self.buckets.len() {
            return Err(Error::BadArg("range exceeds segment".into()));
        }
        Ok(first..last + 1)
    }

    /// Remove `b` from the victim FIFO, wherever it sits. No-op if absent.
    fn fifo_unlink(&mut self, b: u32) {
        let (prev, next) = {
            let d = &self.buckets[b as usize];
            if !d.on_fifo {
                return;
            }
            (d.prev, d.next)
        };
        match prev {
            Some(p) => self.buckets[p as usize].next = next,
            None => self.fifo_head = next,
        }
        match next {
            Some(n) => self.buckets[n as usize].prev = prev,
            None => self.fifo_tail = prev,
        }
        let d = &mut self.buckets[b as usize];
        d.prev = None;
        d.next = None;
        d.on_fifo = false;
        self.fifo_len -= 1;
    }

    /// Push `b` at the FIFO head (most-recently-idled).
    fn fifo_push_front(&mut self, b: u32) {
        let old_head = self.fifo_head;
        {
            let d = &mut self.buckets[b as usize];
            d.prev = None;
            d.next = old_head;
            d.on_fifo = true;
        }
        if let Some(h) = old_head {
            self.buckets[h as usize].prev = Some(b);
        } else {
            self.fifo_tail = Some(b);
        }
        self.fifo_head = Some(b);
        self.fifo_len += 1;
    }

    /// Pop the tail (least-recently-idled) victim, if any.
    fn fifo_pop_back(&mut self) -> Option<u32> {
        let b = self.fifo_tail?;
        self.fifo_unlink(b);
        Some(b)
    }

    /// Ensure `[addr, addr+len)` is pinned, bumping refcounts by one per
    /// covered bucket. Always succeeds for an in-segment range (buckets in
    /// the local segment are never actually HCA-unregistered while
    /// referenced; unpinning only evicts refcount-zero victims).
    pub fn local_pin(&mut self, addr: u64, len: u64) -> Result<LocalPinHandle> {
        let range = self.bucket_range(addr, len)?;
        let mut covered = Vec::with_capacity(range.len());
        for b in range {
            if self.buckets[b as usize].refcount == 0 {
                self.fifo_unlink(b);
            }
            self.buckets[b as usize].refcount += 1;
            covered.push(b);
        }
        Ok(LocalPinHandle { buckets: covered })
    }

    /// Non-blocking form: spec doesn't distinguish local pin availability
    /// (the local segment is always locally poll-able), so this always
    /// succeeds when the range is in-bounds.
    pub fn try_local_pin(&mut self, addr: u64, len: u64) -> Option<LocalPinHandle> {
        self.local_pin(addr, len).ok()
    }

    /// Pin whatever prefix of `[addr, addr+len)` lies in the segment.
    /// `None` only if not even the first byte is covered.
    pub fn partial_local_pin(&mut self, addr: u64, len: u64) -> Option<LocalPinHandle> {
        if addr < self.segment_base {
            return None;
        }
        let max_len = (self.buckets.len() as u64 * self.bucket_size as u64)
            .saturating_sub(addr - self.segment_base);
        if max_len == 0 {
            return None;
        }
        self.local_pin(addr, len.min(max_len)).ok()
    }

    /// Drop one reference from each bucket in `handle`; buckets that reach
    /// zero join the victim FIFO, then the FIFO is trimmed to `maxvictim` by
    /// unpinning the oldest contiguous run at the tail (spec §4.4's
    /// "Eviction policy": "contiguity permits a single unregister call" —
    /// this implementation doesn't issue the HCA call itself, that's the
    /// caller's job once it sees the returned unpin list).
    pub fn release(&mut self, handle: LocalPinHandle) -> Vec<u32> {
        for b in &handle.buckets {
            let d = &mut self.buckets[*b as usize];
            debug_assert!(d.refcount > 0, "release of unpinned bucket {b}");
            d.refcount -= 1;
            if d.refcount == 0 {
                self.fifo_push_front(*b);
            }
        }
        let mut unpinned = Vec::new();
        while self.fifo_len > self.maxvictim {
            match self.fifo_pop_back() {
                Some(b) => unpinned.push(b),
                None => break,
            }
        }
        unpinned
    }

    pub fn victim_count(&self) -> usize {
        self.fifo_len
    }

    pub fn bucket_refcount(&self, bucket: u32) -> u32 {
        self.buckets[bucket as usize].refcount
    }
}

/// One entry in a peer's firehose hash: this node's promise that a remote
/// bucket is pinned and targetable by RDMA (spec §4.4 "Remote firehose
/// hash").
#[derive(Debug, Clone, Copy)]
struct FirehoseEntry {
    bucket_addr: u64,
    rkey: u32,
    refcount: u32,
    prev: Option<u32>,
    next: Option<u32>,
}

/// A handle naming the remote buckets a `remote_pin` covered. Must be
/// passed to [`PeerFirehoseHash::release`] exactly once.
#[derive(Debug, Clone)]
pub struct RemotePinHandle {
    pub peer: NodeId,
    buckets: Vec<u64>,
}

/// A pin request broken into buckets already owned (usable immediately) and
/// buckets that must be moved in, possibly evicting victims first (spec
/// §4.4's move algorithm, steps 1–2).
#[derive(Debug, Default)]
pub struct RemotePinPlan {
    pub already_owned: Vec<u64>,
    pub to_pin: Vec<u64>,
    pub evicted: Vec<u64>,
}

impl RemotePinPlan {
    pub fn is_complete(&self) -> bool {
        self.to_pin.is_empty()
    }
}

/// The per-peer firehose hash and its victim FIFO, `F`-bounded (spec §3's
/// invariant (c)).
pub struct PeerFirehoseHash {
    quota: usize,
    maxvictim: usize,
    entries: Vec<FirehoseEntry>,
    free_slots: Vec<u32>,
    index: HashMap<u64, u32>,
    fifo_head: Option<u32>,
    fifo_tail: Option<u32>,
    fifo_len: usize,
}

impl PeerFirehoseHash {
    fn new(quota: usize, maxvictim: usize) -> Self {
        PeerFirehoseHash {
            quota,
            maxvictim,
            entries: Vec::new(),
            free_slots: Vec::new(),
            index: HashMap::new(),
            fifo_head: None,
            fifo_tail: None,
            fifo_len: 0,
        }
    }

    fn fifo_unlink(&mut self, slot: u32) {
        let (prev, next) = {
            let e = &self.entries[slot as usize];
            (e.prev, e.next)
        };
        match prev {
            Some(p) => self.entries[p as usize].next = next,
            None => self.fifo_head = next,
        }
        match next {
            Some(n) => self.entries[n as usize].prev = prev,
            None => self.fifo_tail = prev,
        }
        let e = &mut self.entries[slot as usize];
        e.prev = None;
        e.next = None;
        self.fifo_len -= 1;
    }

    fn fifo_push_front(&mut self, slot: u32) {
        let old_head = self.fifo_head;
        {
            let e = &mut self.entries[slot as usize];
            e.prev = None;
            e.next = old_head;
        }
        if let Some(h) = old_head {
            self.entries[h as usize].prev = Some(slot);
        } else {
            self.fifo_tail = Some(slot);
        }
        self.fifo_head = Some(slot);
        self.fifo_len += 1;
    }

    fn owned_count(&self) -> usize {
        self.index.len()
    }

    /// Split `addrs` into those already owned and those needing a move,
    /// picking eviction victims for however many of the latter don't fit
    /// under quota (spec §4.4 steps 1–2).
    fn plan(&mut self, addrs: &[u64]) -> RemotePinPlan {
        let mut plan = RemotePinPlan::default();
        let mut needed = 0usize;
        for &addr in addrs {
            if self.index.contains_key(&addr) {
                plan.already_owned.push(addr);
            } else {
                plan.to_pin.push(addr);
                needed += 1;
            }
        }
        let room = self.quota.saturating_sub(self.owned_count());
        let to_evict = needed.saturating_sub(room);
        for _ in 0..to_evict {
            if let Some(victim) = self.evict_one() {
                plan.evicted.push(victim);
            } else {
                break;
            }
        }
        plan
    }

    /// Remove the LRU refcount-zero entry from the FIFO and the hash,
    /// skipping (and dropping, per spec's "removed without eviction") any
    /// entry whose refcount rose above zero while parked.
    fn evict_one(&mut self) -> Option<u64> {
        loop {
            let slot = self.fifo_tail?;
            self.fifo_unlink(slot);
            let entry = self.entries[slot as usize];
            if entry.refcount > 0 {
                // Raced back to life while parked; just drop the FIFO link,
                // the entry stays live in `index`.
                continue;
            }
            self.index.remove(&entry.bucket_addr);
            self.free_slots.push(slot);
            return Some(entry.bucket_addr);
        }
    }

    /// After a successful move (or an address that was already owned),
    /// record/refresh an entry and bump its refcount.
    fn bind_and_hold(&mut self, addr: u64, rkey: u32) {
        if let Some(&slot) = self.index.get(&addr) {
            let e = &mut self.entries[slot as usize];
            if e.refcount == 0 {
                self.fifo_unlink(slot);
            }
            e.refcount += 1;
            return;
        }
        let slot = match self.free_slots.pop() {
            Some(s) => {
                self.entries[s as usize] = FirehoseEntry {
                    bucket_addr: addr,
                    rkey,
                    refcount: 1,
                    prev: None,
                    next: None,
                };
                s
            }
            None => {
                self.entries.push(FirehoseEntry {
                    bucket_addr: addr,
                    rkey,
                    refcount: 1,
                    prev: None,
                    next: None,
                });
                (self.entries.len() - 1) as u32
            }
        };
        self.index.insert(addr, slot);
    }

    fn release(&mut self, addrs: &[u64]) {
        for &addr in addrs {
            let Some(&slot) = self.index.get(&addr) else {
                debug_assert!(false, "release of unknown firehose {addr:#x}");
                continue;
            };
            let e = &mut self.entries[slot as usize];
            debug_assert!(e.refcount > 0);
            e.refcount -= 1;
            if e.refcount == 0 {
                self.fifo_push_front(slot);
            }
        }
        while self.fifo_len > self.maxvictim {
            if self.evict_one().is_none() {
                break;
            }
        }
    }

    pub fn owned(&self) -> usize {
        self.index.len()
    }

    pub fn victim_count(&self) -> usize {
        self.fifo_len
    }
}

/// The combined local + remote firehose cache (spec §4.4), one per attached
/// endpoint. Local and per-peer remote state are independently locked
/// (spec §5's resource table: "per-hca mutex + per-peer victim-fifo
/// mutex").
pub struct FirehoseTable {
    local: Mutex<LocalTable>,
    remote: Mutex<HashMap<NodeId, Mutex<PeerFirehoseHash>>>,
    quota: usize,
    maxvictim_r: usize,
}

impl FirehoseTable {
    pub fn new(
        segment_base: u64,
        segment_len: u64,
        bucket_size: usize,
        quota: usize,
        maxvictim_m: usize,
        maxvictim_r: usize,
    ) -> Self {
        FirehoseTable {
            local: Mutex::new(LocalTable::new(segment_base, segment_len, bucket_size, maxvictim_m)),
            remote: Mutex::new(HashMap::new()),
            quota,
            maxvictim_r,
        }
    }

    pub fn local_pin(&self, addr: u64, len: u64) -> Result<LocalPinHandle> {
        self.local.lock().unwrap().local_pin(addr, len)
    }

    pub fn try_local_pin(&self, addr: u64, len: u64) -> Option<LocalPinHandle> {
        self.local.lock().unwrap().try_local_pin(addr, len)
    }

    pub fn partial_local_pin(&self, addr: u64, len: u64) -> Option<LocalPinHandle> {
        self.local.lock().unwrap().partial_local_pin(addr, len)
    }

    pub fn release_local(&self, handle: LocalPinHandle) -> Vec<u32> {
        self.local.lock().unwrap().release(handle)
    }

    fn with_peer<R>(&self, peer: NodeId, f: impl FnOnce(&mut PeerFirehoseHash) -> R) -> R {
        let mut table = self.remote.lock().unwrap();
        let slot = table
            .entry(peer)
            .or_insert_with(|| Mutex::new(PeerFirehoseHash::new(self.quota, self.maxvictim_r)));
        let mut hash = slot.lock().unwrap();
        f(&mut hash)
    }

    /// Step 1/2 of the move algorithm (spec §4.4): decide which of the
    /// bucket-aligned addresses in `[addr, addr+len)` need a firehose move,
    /// and which currently-owned buckets must be evicted to make room.
    /// Addresses already owned are bound immediately; the caller must still
    /// drive a move AM for `to_pin` and call [`Self::complete_remote_pin`]
    /// on reply.
    pub fn plan_remote_pin(&self, peer: NodeId, addr: u64, len: u64, bucket_size: u64) -> RemotePinPlan {
        let addrs = bucket_addrs(addr, len, bucket_size);
        self.with_peer(peer, |hash| {
            let plan = hash.plan(&addrs);
            for &a in &plan.already_owned {
                hash.bind_and_hold(a, 0);
            }
            plan
        })
    }

    /// Non-blocking variant: succeeds only if the whole range is already
    /// owned (spec §4.4's `try_remote_pin`).
    pub fn try_remote_pin(&self, peer: NodeId, addr: u64, len: u64, bucket_size: u64) -> Option<RemotePinHandle> {
        let addrs = bucket_addrs(addr, len, bucket_size);
        self.with_peer(peer, |hash| {
            if addrs.iter().all(|a| hash.index.contains_key(a)) {
                for &a in &addrs {
                    hash.bind_and_hold(a, 0);
                }
                Some(RemotePinHandle { peer, buckets: addrs.clone() })
            } else {
                None
            }
        })
    }

    /// Finish a move after the peer's reply: bind the newly-pinned buckets
    /// (with their returned rkeys) and produce the handle covering the
    /// whole original request.
    pub fn complete_remote_pin(
        &self,
        peer: NodeId,
        plan: &RemotePinPlan,
        mut already_owned: Vec<u64>,
        rkeys: &[(u64, u32)],
    ) -> RemotePinHandle {
        self.with_peer(peer, |hash| {
            for &(addr, rkey) in rkeys {
                hash.bind_and_hold(addr, rkey);
            }
        });
        already_owned.extend(plan.to_pin.iter().copied());
        RemotePinHandle {
            peer,
            buckets: already_owned,
        }
    }

    pub fn release_remote(&self, handle: RemotePinHandle) {
        self.with_peer(handle.peer, |hash| hash.release(&handle.buckets));
    }

    pub fn peer_owned(&self, peer: NodeId) -> usize {
        self.remote
            .lock()
            .unwrap()
            .get(&peer)
            .map(|h| h.lock().unwrap().owned())
            .unwrap_or(0)
    }
}

fn bucket_addrs(addr: u64, len: u64, bucket_size: u64) -> Vec<u64> {
    let first = (addr / bucket_size) * bucket_size;
    let last = ((addr + len.max(1) - 1) / bucket_size) * bucket_size;
    let mut v = Vec::new();
    let mut a = first;
    loop {
        v.push(a);
        if a >= last {
            break;
        }
        a += bucket_size;
    }
    v
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_pin_release_tracks_refcount() {
        let mut table = LocalTable::new(0, 4096 * 8, 4096, 2);
        let h1 = table.local_pin(0, 4096).unwrap();
        assert_eq!(table.bucket_refcount(0), 1);
        let h2 = table.local_pin(0, 4096).unwrap();
        assert_eq!(table.bucket_refcount(0), 2);
        table.release(h1);
        assert_eq!(table.bucket_refcount(0), 1);
        table.release(h2);
        assert_eq!(table.bucket_refcount(0), 0);
        assert_eq!(table.victim_count(), 1);
    }

    #[test]
    fn local_victim_fifo_bounded_by_maxvictim() {
        let mut table = LocalTable::new(0, 4096 * 8, 4096, 2);
        for i in 0..4u64 {
            let h = table.local_pin(i * 4096, 4096).unwrap();
            table.release(h);
        }
        assert!(table.victim_count() <= 2);
    }

    #[test]
    fn partial_local_pin_clamps_to_segment() {
        let mut table = LocalTable::new(0, 4096 * 2, 4096, 8);
        let h = table.partial_local_pin(4096, 4096 * 10).unwrap();
        assert_eq!(h.covers_bytes(4096), 4096);
    }

    #[test]
    fn firehose_eviction_picks_lru_at_quota() {
        // Scenario 4 of the testable properties: F=4 firehoses to peer 1,
        // pin {0,B,2B,3B} then {4B} — the fifth pin must evict exactly one
        // of the first four.
        let table = FirehoseTable::new(0, 1 << 30, 4096, 4, 64, 64);
        for i in 0..4u64 {
            let plan = table.plan_remote_pin(1, i * 4096, 4096, 4096);
            assert!(plan.evicted.is_empty());
            let h = table.complete_remote_pin(1, &plan, plan.already_owned.clone(), &[(i * 4096, 0)]);
            table.release_remote(h);
        }
        assert_eq!(table.peer_owned(1), 4);
        let plan = table.plan_remote_pin(1, 4 * 4096, 4096, 4096);
        assert_eq!(plan.evicted.len(), 1);
        assert!(plan.evicted[0] < 4 * 4096);
    }

    #[test]
    fn firehose_hash_never_exceeds_quota() {
        let table = FirehoseTable::new(0, 1 << 30, 4096, 2, 64, 64);
        for i in 0..10u64 {
            let plan = table.plan_remote_pin(7, i * 4096, 4096, 4096);
            let h = table.complete_remote_pin(7, &plan, plan.already_owned.clone(), &[(i * 4096, 0)]);
            assert!(table.peer_owned(7) <= 2);
            table.release_remote(h);
        }
    }
}
