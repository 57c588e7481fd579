//! Concurrency-safety primitives (C2).
//!
//! All three types here are CAS loops over a single atomic word, not OS
//! mutexes or condvars: spec §5 requires that "suspension is realized by a
//! polling loop; no OS-level blocking", so nothing in this module may park a
//! thread. This generalizes the one-shot `atomic::compiler_fence` barrier
//! `metta-systems-vesper::boot` uses at start-of-day into a steady-state CAS
//! discipline usable from any thread at any time.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

/// A bounded counting semaphore with non-blocking try-down.
///
/// Used for the per-peer send-credit and AM-request-credit counters (spec
/// §4.3, §4.5): "Every posted work request tries-down one credit;
/// completion up's one credit."
pub struct Semaphore {
    count: AtomicU32,
    initial: u32,
}

impl Semaphore {
    pub fn new(initial: u32) -> Self {
        Semaphore {
            count: AtomicU32::new(initial),
            initial,
        }
    }

    /// Non-blocking acquire: `CAS(old, old-1)`, failing when the counter is
    /// zero (spec §4.7).
    pub fn try_down(&self) -> bool {
        let mut cur = self.count.load(Ordering::Acquire);
        loop {
            if cur == 0 {
                return false;
            }
            match self.count.compare_exchange_weak(
                cur,
                cur - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => cur = observed,
            }
        }
    }

    /// Release one credit back. Never exceeds the initial allocation (spec
    /// §3's connection-record invariant).
    pub fn up(&self) {
        let prev = self.count.fetch_add(1, Ordering::AcqRel);
        debug_assert!(
            prev < self.initial,
            "credit semaphore exceeded its initial allocation"
        );
    }

    pub fn value(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }

    pub fn initial(&self) -> u32 {
        self.initial
    }

    /// True when the semaphore has returned to its starting value, the
    /// "credit conservation" testable property of spec §8.
    pub fn is_conserved(&self) -> bool {
        self.value() == self.initial
    }
}

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;

/// A CAS-based spinlock over a 32-bit word (spec §4.7).
pub struct Spinlock {
    state: AtomicU32,
}

impl Default for Spinlock {
    fn default() -> Self {
        Self::new()
    }
}

impl Spinlock {
    pub const fn new() -> Self {
        Spinlock {
            state: AtomicU32::new(UNLOCKED),
        }
    }

    pub fn try_lock(&self) -> bool {
        self.state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Spin (no OS blocking) until acquired.
    pub fn lock(&self) {
        while !self.try_lock() {
            std::hint::spin_loop();
        }
    }

    pub fn unlock(&self) {
        self.state.store(UNLOCKED, Ordering::Release);
    }
}

/// A handler-safe lock (HSL): a mutex that is safe to acquire from within an
/// Active Message handler's execution context.
///
/// On transports without asynchronous interrupt-driven completion delivery
/// (the only kind this implementation targets — progress is always
/// poll-driven), an HSL degenerates to a plain, non-reentrant mutex, per
/// spec §4.7. Recursive acquisition is a forbidden cross-thread/cross-call
/// operation (spec §5), and is caught here as a poisoning panic rather than
/// a silent deadlock, since a single-threaded recursive `lock()` on a
/// `std::sync::Mutex` deadlocks without any diagnostic.
pub struct HandlerSafeLock<T> {
    inner: Mutex<T>,
}

impl<T> HandlerSafeLock<T> {
    pub fn new(value: T) -> Self {
        HandlerSafeLock {
            inner: Mutex::new(value),
        }
    }

    pub fn lock(&self) -> std::sync::MutexGuard<'_, T> {
        self.inner
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn semaphore_try_down_exhausts_then_blocks() {
        let sem = Semaphore::new(2);
        assert!(sem.try_down());
        assert!(sem.try_down());
        assert!(!sem.try_down());
        sem.up();
        assert!(sem.try_down());
    }

    #[test]
    fn semaphore_conservation() {
        let sem = Semaphore::new(4);
        for _ in 0..4 {
            assert!(sem.try_down());
        }
        for _ in 0..4 {
            sem.up();
        }
        assert!(sem.is_conserved());
    }

    #[test]
    fn spinlock_mutual_exclusion() {
        let lock = Spinlock::new();
        assert!(lock.try_lock());
        assert!(!lock.try_lock());
        lock.unlock();
        assert!(lock.try_lock());
    }

    #[test]
    fn hsl_basic_use() {
        let hsl = HandlerSafeLock::new(0u32);
        *hsl.lock() += 1;
        assert_eq!(*hsl.lock(), 1);
    }
}
