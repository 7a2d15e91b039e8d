// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::loom::{AtomicBool, Ordering};

/// Bounded busy-wait for the adapter's short critical regions.
///
/// Tool callbacks run on runtime-owned threads that must never park, so
/// every wait in the adapter is a spin. The regions guarded here are a few
/// stores long (a task-slot exchange, an overdue drain writing two exits, a
/// refcount publication), so the wait starts with a handful of pause
/// instructions and doubles per round, capped well below anything that
/// would deserve a syscall.
#[derive(Debug)]
pub struct SpinWait {
    spins: u32,
}

// === impl SpinWait ===

impl SpinWait {
    /// Pause instructions issued by the longest round.
    const MAX_SPINS: u32 = 1 << 8;

    #[must_use]
    pub const fn new() -> Self {
        Self { spins: 1 }
    }

    /// Burns one round of pause instructions; each round is twice as long
    /// as the previous one, up to [`Self::MAX_SPINS`].
    #[inline]
    pub fn spin(&mut self) {
        for _ in 0..self.spins {
            // loom (and the test scheduler) only make progress while the
            // spinning thread yields control back to them.
            #[cfg(any(test, loom))]
            crate::loom::thread::yield_now();

            core::hint::spin_loop();
        }
        if self.spins < Self::MAX_SPINS {
            self.spins *= 2;
        }
    }
}

impl Default for SpinWait {
    fn default() -> Self {
        Self::new()
    }
}

/// A bare spin lock without a guard.
///
/// Unlike [`Mutex`], ownership of the lock is a protocol property rather than
/// a lexical one: `lock` and `unlock` are separate calls and may happen on
/// different threads. The adapter uses this for critical regions that span
/// several runtime callbacks (a lock acquired in `mutex-acquired` is released
/// in `mutex-released`, possibly after the task migrated) and for the
/// per-location order lock of the overdue-event protocol.
///
/// `unlock` is consequently `unsafe`: the caller asserts that the lock is
/// held by the protocol step it is completing.
///
/// [`Mutex`]: crate::Mutex
#[derive(Debug)]
pub struct RawMutex {
    locked: AtomicBool,
}

// === impl RawMutex ===

impl RawMutex {
    crate::loom_const_fn! {
        /// Returns a new, unlocked mutex.
        #[must_use]
        pub const fn new() -> RawMutex {
            RawMutex {
                locked: AtomicBool::new(false),
            }
        }
    }

    /// Acquires the lock, spinning until it becomes available.
    #[inline]
    pub fn lock(&self) {
        let mut wait = SpinWait::new();
        while self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.is_locked() {
                wait.spin();
            }
        }
    }

    /// Attempts to acquire the lock without spinning.
    ///
    /// Returns `true` if the lock was acquired.
    #[inline]
    #[must_use]
    pub fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Checks whether the mutex is currently locked.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    /// Spins until the lock is observed unlocked, without acquiring it.
    ///
    /// Pairs with a holder that publishes its writes before `unlock`; the
    /// acquire load here makes those writes visible to the waiter.
    #[inline]
    pub fn wait(&self) {
        let mut wait = SpinWait::new();
        while self.locked.load(Ordering::Acquire) {
            wait.spin();
        }
    }

    /// Releases the lock.
    ///
    /// # Safety
    ///
    /// The lock must be held, by this thread or by a protocol step this
    /// thread is completing on another thread's behalf. Unlocking a mutex
    /// that is not locked breaks mutual exclusion for all other users.
    #[inline]
    pub unsafe fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }
}

impl Default for RawMutex {
    #[inline]
    fn default() -> RawMutex {
        RawMutex::new()
    }
}

// Safety: the lock state is a single atomic; all data protection is the
// caller's protocol.
unsafe impl Send for RawMutex {}
// Safety: see above.
unsafe impl Sync for RawMutex {}

// Safety: `RawMutex::lock`/`unlock` provide the acquire/release pairing
// `lock_api` requires; INIT is the unlocked state.
#[cfg(not(loom))]
unsafe impl lock_api::RawMutex for RawMutex {
    #[allow(clippy::declare_interior_mutable_const, reason = "lock_api API")]
    const INIT: RawMutex = RawMutex {
        locked: AtomicBool::new(false),
    };

    type GuardMarker = lock_api::GuardSend;

    #[inline]
    fn lock(&self) {
        RawMutex::lock(self);
    }

    #[inline]
    fn try_lock(&self) -> bool {
        RawMutex::try_lock(self)
    }

    #[inline]
    unsafe fn unlock(&self) {
        // Safety: lock_api guarantees the guard held the lock.
        unsafe { RawMutex::unlock(self) }
    }

    #[inline]
    fn is_locked(&self) -> bool {
        RawMutex::is_locked(self)
    }
}
