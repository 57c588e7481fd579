//! Buffer pool (C1).
//!
//! Fixed-size pinned send/receive buffers backed by one large
//! `mmap`-allocated region (mirroring
//! `rpc_protocol::server::ring::BufferMap`'s single mmap'd buffer-ring
//! allocation, generalized from a kernel-shared `io_uring` buffer ring to a
//! plain mutex-protected LIFO free list, since GASNet buffers are owned
//! entirely by userspace between posts).

use std::sync::Mutex;

use crate::config::BUF_SIZE;

/// Opaque handle to one pooled buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(pub u32);

struct Region {
    ptr: *mut u8,
    len: usize,
}

// SAFETY: the region is only ever accessed through `Buf`s checked out one at
// a time from the free list; see the invariant documented on `BufferPool`.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Drop for Region {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.len);
        }
    }
}

/// A pool of `count` fixed-size buffers of `buf_size` bytes each,
/// mutex-protected LIFO free list per spec §4.1 ("Implementation is a LIFO
/// (stack) over a mutex-protected singly-linked list").
///
/// Invariant (spec §3): a buffer is either on the free list, or referenced
/// by exactly one outstanding work request (tracked by the engine, not this
/// pool — the pool only knows whether an id has been handed out).
pub struct BufferPool {
    region: Region,
    buf_size: usize,
    count: usize,
    free: Mutex<Vec<u32>>,
}

impl BufferPool {
    /// Allocate `count` buffers of `buf_size` bytes (rounded up to at least
    /// [`BUF_SIZE`], the size needed to hold the largest AM).
    pub fn new(count: usize, buf_size: usize) -> Self {
        let buf_size = buf_size.max(BUF_SIZE);
        let total = buf_size * count;

        let ptr = unsafe {
            let addr = libc::mmap(
                std::ptr::null_mut(),
                total,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
                -1,
                0,
            );
            if addr == libc::MAP_FAILED {
                panic!(
                    "mmap failed allocating buffer pool: {}",
                    std::io::Error::last_os_error()
                );
            }
            // Pin: best-effort, matches the "pinned, fixed-size region"
            // requirement of spec §3. A failure to lock pages is not fatal
            // on its own (the OS may still honor the region); it only means
            // this process doesn't hold a hard guarantee against swapping.
            if libc::mlock(addr, total) != 0 {
                log::warn!(
                    "mlock failed for buffer pool ({} bytes): {}",
                    total,
                    std::io::Error::last_os_error()
                );
            }
            addr as *mut u8
        };

        BufferPool {
            region: Region { ptr, len: total },
            buf_size,
            count,
            free: Mutex::new((0..count as u32).rev().collect()),
        }
    }

    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    pub fn capacity(&self) -> usize {
        self.count
    }

    /// Number of buffers currently on the free list (for the "buffer
    /// conservation" testable property of spec §8).
    pub fn free_count(&self) -> usize {
        self.free.lock().unwrap().len()
    }

    /// Non-blocking acquire. Returns `None` when the pool is exhausted; the
    /// caller must reap completions to replenish (spec §4.1).
    pub fn acquire(&self) -> Option<BufferId> {
        self.free.lock().unwrap().pop().map(BufferId)
    }

    pub fn release(&self, id: BufferId) {
        let mut free = self.free.lock().unwrap();
        debug_assert!(
            !free.contains(&id.0),
            "buffer {} released twice",
            id.0
        );
        free.push(id.0);
    }

    /// Raw pointer and length of one buffer's storage. The caller must hold
    /// the buffer (via a prior `acquire`) for the duration of any access.
    ///
    /// # Safety
    /// `id` must have been returned by `acquire` and not yet `release`d.
    pub unsafe fn slice_mut(&self, id: BufferId) -> &mut [u8] {
        let off = id.0 as usize * self.buf_size;
        std::slice::from_raw_parts_mut(self.region.ptr.add(off), self.buf_size)
    }

    /// # Safety
    /// Same requirement as [`Self::slice_mut`].
    pub unsafe fn slice(&self, id: BufferId) -> &[u8] {
        let off = id.0 as usize * self.buf_size;
        std::slice::from_raw_parts(self.region.ptr.add(off), self.buf_size)
    }

    pub fn base_ptr(&self) -> *mut u8 {
        self.region.ptr
    }

    pub fn total_len(&self) -> usize {
        self.region.len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_release_round_trips() {
        let pool = BufferPool::new(4, 256);
        assert_eq!(pool.free_count(), 4);

        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_eq!(pool.free_count(), 2);

        pool.release(a);
        pool.release(b);
        assert_eq!(pool.free_count(), 4);
    }

    #[test]
    fn exhaustion_returns_none() {
        let pool = BufferPool::new(2, 256);
        let _a = pool.acquire().unwrap();
        let _b = pool.acquire().unwrap();
        assert!(pool.acquire().is_none());
    }

    #[test]
    fn buffer_memory_is_writable_and_isolated() {
        let pool = BufferPool::new(2, 256);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        unsafe {
            pool.slice_mut(a).fill(0xAA);
            pool.slice_mut(b).fill(0xBB);
            assert_eq!(pool.slice(a)[0], 0xAA);
            assert_eq!(pool.slice(b)[0], 0xBB);
        }
    }
}
