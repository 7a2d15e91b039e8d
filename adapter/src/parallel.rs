// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Parallel-region objects and their global pool.
//!
//! A [`Parallel`] travels through the runtime's `parallel_data` slot from
//! parallel-begin to parallel-end and is referenced by every team member's
//! task. It outlives parallel-end: implicit-barrier-end and
//! implicit-task-end of team members may arrive afterwards (overdue events),
//! so the object is refcounted and only returns to the pool when the
//! encountering task and all `team_size` members have released it.
//!
//! The refcount starts at the −1 sentinel ("not yet published"); the
//! primary thread's implicit-task-begin stores `team_size + 1`. Releasers
//! spin while the count is negative, so a single atomic read doubles as the
//! published-yet check.

use crate::encoding::{TaskWordPacking, WordLayout};
use crate::macros::bug_on;
use crate::substrate::{RegionHandle, Tpd};
use crate::task::Task;
use core::num::NonZeroUsize;
use core::ptr;
use core::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};
use omptrace_spin::{CachePadded, Mutex, SpinWait};
use std::alloc::{Layout, alloc_zeroed, dealloc, handle_alloc_error};

/// The object passed around via the runtime's `parallel_data` slot.
pub(crate) struct Parallel {
    /// Thread-private data of the encountering thread; parent of every team
    /// member's tpd.
    pub parent: Option<Tpd>,
    pub region: RegionHandle,
    /// Requested parallelism, corrected downward at the primary's
    /// implicit-task-begin if the actual team is smaller.
    pub team_size: AtomicU32,
    /// Return address from parallel-begin. Reused for the team's implicit
    /// barrier, whose own callback may carry no address.
    pub codeptr: Option<NonZeroUsize>,

    /// End timestamps published by the primary thread; team members that
    /// finish later reuse them so the whole team reports one end time.
    pub timestamp_ibarrier_end: AtomicU64,
    pub timestamp_itask_end: AtomicU64,

    /// −1 until published, then `team_size + 1`; see module docs.
    pub ref_count: AtomicI32,

    pub belongs_to_league: bool,

    /// Field layout of the explicit-task word for this team size.
    pub packing: TaskWordPacking,
    /// Per-team-member explicit-task generation counters, indexed by
    /// thread-num. Each slot is written only by its owning thread.
    pub task_generation_numbers: Vec<AtomicU32>,

    /// Shared stand-in task for all undeferred explicit tasks of this
    /// region.
    pub undeferred_task: Task,

    /// Free-list link.
    pub next: *mut Parallel,
}

// === impl Parallel ===

impl Parallel {
    const fn new() -> Self {
        Self {
            parent: None,
            region: RegionHandle::INVALID,
            team_size: AtomicU32::new(0),
            codeptr: None,
            timestamp_ibarrier_end: AtomicU64::new(0),
            timestamp_itask_end: AtomicU64::new(0),
            ref_count: AtomicI32::new(0),
            belongs_to_league: false,
            packing: TaskWordPacking {
                shift_thread_num: 0,
                mask_thread_num: 0,
                shift_generation: 0,
                mask_generation: 0,
                max_explicit_tasks: 0,
            },
            task_generation_numbers: Vec::new(),
            undeferred_task: Task::new(),
            next: ptr::null_mut(),
        }
    }

    /// Resets protocol fields, keeping the generation-counter allocation and
    /// the undeferred task's stack buffers.
    fn reset(&mut self) {
        self.parent = None;
        self.region = RegionHandle::INVALID;
        *self.team_size.get_mut() = 0;
        self.codeptr = None;
        *self.timestamp_ibarrier_end.get_mut() = 0;
        *self.timestamp_itask_end.get_mut() = 0;
        *self.ref_count.get_mut() = 0;
        self.belongs_to_league = false;
        self.next = ptr::null_mut();
    }

    /// Initializes a freshly pooled object for a new parallel region.
    ///
    /// `self_ptr` must be the object's own address; the embedded undeferred
    /// task points back at its region.
    pub(crate) fn init(
        &mut self,
        self_ptr: *mut Parallel,
        parent: Option<Tpd>,
        requested_parallelism: u32,
        codeptr: Option<NonZeroUsize>,
        region: RegionHandle,
        ref_count: i32,
        layout: &WordLayout,
    ) {
        bug_on!(requested_parallelism == 0);

        self.parent = parent;
        self.region = region;
        *self.team_size.get_mut() = requested_parallelism;
        self.codeptr = codeptr;
        *self.ref_count.get_mut() = ref_count;
        self.packing = TaskWordPacking::for_team(layout, requested_parallelism);

        self.task_generation_numbers.clear();
        self.task_generation_numbers
            .resize_with(requested_parallelism as usize, || AtomicU32::new(0));

        self.undeferred_task.is_undeferred = true;
        self.undeferred_task.parallel_region = self_ptr;
    }

    pub(crate) fn team_size(&self) -> u32 {
        self.team_size.load(Ordering::Relaxed)
    }

    /// Publishes the refcount, releasing waiters of the −1 sentinel.
    pub(crate) fn publish_ref_count(&self, count: i32) {
        self.ref_count.store(count, Ordering::SeqCst);
    }
}

struct FreeList(*mut Parallel);

// Safety: the list owns the objects it links; the mutex around it provides
// the exclusion.
unsafe impl Send for FreeList {}

/// Global free list of parallel-region objects.
pub(crate) struct ParallelPool {
    free_list: Mutex<FreeList>,
}

// === impl ParallelPool ===

impl ParallelPool {
    pub(crate) const fn new() -> Self {
        Self {
            free_list: Mutex::new(FreeList(ptr::null_mut())),
        }
    }

    fn layout() -> Layout {
        Layout::new::<Parallel>()
            .align_to(align_of::<CachePadded<()>>())
            .expect("parallel layout")
            .pad_to_align()
    }

    /// Pops a recycled object or allocates a fresh aligned one; either way
    /// the result is reset.
    pub(crate) fn get(&self) -> *mut Parallel {
        let mut list = self.free_list.lock();
        let head = list.0;
        if !head.is_null() {
            // Safety: pooled objects are exclusively owned by the list.
            unsafe {
                list.0 = (*head).next;
                (*head).reset();
            }
            return head;
        }
        drop(list);

        let layout = Self::layout();
        // Safety: non-zero size.
        let raw = unsafe { alloc_zeroed(layout) }.cast::<Parallel>();
        if raw.is_null() {
            handle_alloc_error(layout);
        }
        // Safety: valid for writes of `Parallel`.
        unsafe { raw.write(Parallel::new()) };
        raw
    }

    /// Drops one reference; at zero the object goes back on the free list.
    ///
    /// Spins while the refcount still holds the −1 sentinel (the primary's
    /// implicit-task-begin has not published it yet).
    ///
    /// # Safety
    ///
    /// `parallel` must originate from [`ParallelPool::get`] and the caller
    /// must actually hold one of the region's references.
    pub(crate) unsafe fn release(&self, parallel: *mut Parallel) {
        // Safety: the object stays valid until the count reaches zero, which
        // cannot happen before this holder releases.
        let region = unsafe { &*parallel };

        let mut wait = SpinWait::new();
        while region.ref_count.load(Ordering::Relaxed) < 0 {
            wait.spin();
        }
        if region.ref_count.fetch_sub(1, Ordering::SeqCst) - 1 == 0 {
            let mut list = self.free_list.lock();
            // Safety: the last reference is gone; the pool reclaims sole
            // ownership.
            unsafe { (*parallel).next = list.0 };
            list.0 = parallel;
        }
    }
}

#[cfg(test)]
impl ParallelPool {
    /// Number of pooled (fully released) region objects.
    pub(crate) fn free_len(&self) -> usize {
        let list = self.free_list.lock();
        let mut len = 0;
        let mut head = list.0;
        while !head.is_null() {
            len += 1;
            // Safety: pooled objects are exclusively owned by the locked
            // list.
            head = unsafe { (*head).next };
        }
        len
    }
}

impl Drop for ParallelPool {
    fn drop(&mut self) {
        let mut head = self.free_list.get_mut().0;
        while !head.is_null() {
            // Safety: pooled objects are exclusively owned by the list and
            // were allocated with `Self::layout`.
            unsafe {
                let next = (*head).next;
                ptr::drop_in_place(head);
                dealloc(head.cast(), Self::layout());
                head = next;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_recycles_and_keeps_generation_array() {
        let pool = ParallelPool::new();
        let layout = WordLayout::new(32);

        let p = pool.get();
        // Safety: fresh object, exclusively owned by this test.
        unsafe {
            (*p).init(p, Some(Tpd(1)), 4, None, RegionHandle(9), -1, &layout);
            assert_eq!((*p).task_generation_numbers.len(), 4);
            assert_eq!((*p).undeferred_task.parallel_region, p);
            (*p).publish_ref_count(1);
            pool.release(p);
        }

        let q = pool.get();
        assert_eq!(p, q, "free list should hand back the recycled object");
        // Safety: exclusively owned again.
        unsafe {
            assert_eq!((*q).region, RegionHandle::INVALID);
            (*q).publish_ref_count(1);
            pool.release(q);
        }
    }

    #[test]
    fn release_returns_only_at_zero() {
        let pool = ParallelPool::new();
        let layout = WordLayout::new(32);
        let p = pool.get();
        // Safety: exclusively owned by this test.
        unsafe {
            (*p).init(p, None, 2, None, RegionHandle(1), -1, &layout);
            (*p).publish_ref_count(3);
            pool.release(p);
            pool.release(p);
            // Two of three references gone; the object must not be pooled.
            assert!(pool.free_list.lock().0.is_null());
            pool.release(p);
            assert_eq!(pool.free_list.lock().0, p);
        }
    }
}
