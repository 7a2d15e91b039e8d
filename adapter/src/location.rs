// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Per-location adapter state.
//!
//! Each CPU location carries one [`CpuLocationData`] block. Its `task` slot
//! holds the implicit task that last wrote events to the location and whose
//! implicit-barrier-end / implicit-task-end have not been delivered yet; the
//! overdue-event protocol in [`callbacks::parallel`] exchanges and drains
//! this slot from foreign threads, so every access goes through the
//! `protect_task_exchange` lock. `preserve_order` spans the entire "write
//! the remaining exits" critical region and is the lock a drain spins on
//! when another thread is already writing them.
//!
//! [`callbacks::parallel`]: crate::callbacks::parallel

use crate::task::Task;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use omptrace_spin::{CachePadded, RawMutex};

/// The `task` slot and its exchange lock; always manipulated together.
pub(crate) struct TaskExchange {
    lock: RawMutex,
    task: AtomicPtr<Task>,
}

// === impl TaskExchange ===

impl TaskExchange {
    /// Runs `f` with the slot locked. `f` receives the current task pointer
    /// and returns the pointer to store (returning its argument leaves the
    /// slot unchanged).
    pub(crate) fn exchange_with(&self, f: impl FnOnce(*mut Task) -> *mut Task) -> *mut Task {
        self.lock.lock();
        let old = self.task.load(Ordering::Relaxed);
        let new = f(old);
        self.task.store(new, Ordering::Relaxed);
        // Safety: locked right above.
        unsafe { self.lock.unlock() };
        old
    }

    /// Replaces the slot, returning the previous task pointer.
    pub(crate) fn swap(&self, new: *mut Task) -> *mut Task {
        self.exchange_with(|_| new)
    }

    /// Unsynchronized read, for logging only.
    pub(crate) fn peek(&self) -> *mut Task {
        self.task.load(Ordering::Relaxed)
    }
}

/// Adapter state attached to every CPU location.
///
/// The two locks live on separate cache lines: the exchange lock is taken
/// for a handful of instructions by many parties, while `preserve_order` is
/// held for the duration of a whole drain and mostly spun on.
pub(crate) struct CpuLocationData {
    exchange: CachePadded<TaskExchange>,
    preserve_order: CachePadded<RawMutex>,
    is_ompt_location: AtomicBool,
}

static_assertions::const_assert!(
    size_of::<CpuLocationData>() >= 2 * align_of::<CachePadded<()>>()
);

// === impl CpuLocationData ===

impl CpuLocationData {
    pub(crate) fn new_boxed() -> Box<CpuLocationData> {
        Box::new(CpuLocationData {
            exchange: CachePadded::new(TaskExchange {
                lock: RawMutex::new(),
                task: AtomicPtr::new(ptr::null_mut()),
            }),
            preserve_order: CachePadded::new(RawMutex::new()),
            is_ompt_location: AtomicBool::new(false),
        })
    }

    pub(crate) fn task_exchange(&self) -> &TaskExchange {
        &self.exchange
    }

    /// The order lock for this location's overdue critical region.
    pub(crate) fn preserve_order(&self) -> &RawMutex {
        &self.preserve_order
    }

    /// True once an implicit-task-begin completed on this location. Only
    /// such locations take part in overdue processing.
    pub(crate) fn is_ompt_location(&self) -> bool {
        self.is_ompt_location.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_ompt_location(&self) {
        self.is_ompt_location.store(true, Ordering::SeqCst);
    }
}
