//! Synchronization primitives for the paging subsystem
//!
//! Mutual exclusion comes from `spin::Mutex`; this module adds the
//! condition variable used by the flush protocol, plus the backoff hook
//! the eviction loop uses when it cannot make progress.
//!
//! The condition variable is a broadcast-only generation counter. A waiter
//! records the generation while still holding the associated lock, drops
//! the lock, and spins until a broadcast bumps the counter. Because
//! `broadcast` is only called with the same lock held, a waiter can never
//! miss a wakeup between recording the generation and releasing the lock.

use core::sync::atomic::{AtomicU64, Ordering};

use spin::{Mutex, MutexGuard};

/// Condition variable paired with a `spin::Mutex`.
///
/// Broadcast-only: there is no `signal`, every waiter wakes and re-checks
/// its predicate. Waiters must loop:
///
/// ```ignore
/// let mut guard = gate.lock.lock();
/// while !predicate() {
///     guard = gate.cond.wait(&gate.lock, guard);
/// }
/// ```
pub struct CondVar {
    generation: AtomicU64,
}

impl CondVar {
    pub const fn new() -> Self {
        Self {
            generation: AtomicU64::new(0),
        }
    }

    /// Release `guard` and wait for the next broadcast, then re-acquire
    /// the lock. Spurious wakeups are possible; callers re-check their
    /// predicate.
    pub fn wait<'a, T>(&self, lock: &'a Mutex<T>, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        let observed = self.generation.load(Ordering::Acquire);
        drop(guard);
        while self.generation.load(Ordering::Acquire) == observed {
            relinquish();
        }
        lock.lock()
    }

    /// Wake every waiter. Must be called with the associated lock held so
    /// that waiters cannot race past their predicate check.
    pub fn broadcast(&self) {
        self.generation.fetch_add(1, Ordering::Release);
    }
}

impl Default for CondVar {
    fn default() -> Self {
        Self::new()
    }
}

/// Give other threads a chance to run.
///
/// On hosted targets this yields the OS thread, so waiters cannot starve
/// the thread they are waiting on even on a single hardware thread. On
/// bare metal it lowers to a short pause loop; the scheduler preempts.
pub(crate) fn relinquish() {
    #[cfg(not(target_os = "none"))]
    std::thread::yield_now();

    #[cfg(target_os = "none")]
    for _ in 0..64 {
        core::hint::spin_loop();
    }
}
