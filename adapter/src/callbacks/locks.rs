// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Mutex events: locks, nest locks, critical and ordered constructs.
//!
//! The runtime reports mutual exclusion as acquire → acquired → released
//! triples identified by a wait-id. Lock and nest-lock events reuse one
//! wrapper region per entry point; critical and ordered get their own
//! outer + structured-block regions from the acquire-site return address.
//! Atomic mutex events are intentionally ignored.
//!
//! The per-mutex `in_release_operation` lock is held from acquired to
//! released: the acquisition order reported at the release must be the one
//! from this acquire even when the application lock was immediately
//! re-acquired by another thread.

use crate::macros::{bug, bug_on, warn_once};
use crate::mgmt::Adapter;
use crate::mutex::MutexObj;
use crate::regions::{LockEvent, ToolEvent};
use crate::substrate::RegionHandle;
use crate::sys::{MutexKind, ScopeEndpoint, WaitId};
use crate::task::Task;
use crate::thread::{self, InMeasurement};
use core::num::NonZeroUsize;

impl Adapter {
    /// `ompt_callback_mutex_acquire`.
    ///
    /// # Safety
    ///
    /// Must be called from a runtime callback context: the runtime's
    /// `get_task_info` must resolve to a task this adapter installed.
    pub unsafe fn mutex_acquire(
        &self,
        kind: MutexKind,
        _hint: u32,
        _impl_: u32,
        wait_id: WaitId,
        codeptr: Option<NonZeroUsize>,
    ) {
        let _guard = InMeasurement::enter();
        let atid = thread::adapter_tid();
        tracing::trace!(atid, ?kind, wait_id, "mutex acquire");
        if !self.record_events() {
            tracing::trace!("event ignored (either PRE, or POST after finalize_tool)");
            return;
        }

        let task = self.current_task();
        // Safety: the current task is owned by the calling thread.
        if unsafe { (*task).belongs_to_league } {
            warn_once!("OpenMP league mutex-acquire event detected; not handled yet");
            return;
        }

        match kind {
            MutexKind::Lock => self.enter(self.lock_region(LockEvent::Set)),
            // nest-lock-acquire; followed by either nest-lock-acquired in
            // `mutex_acquired` or nest-lock-owned in `nest_lock`.
            MutexKind::NestLock => self.enter(self.lock_region(LockEvent::SetNest)),
            MutexKind::TestLock | MutexKind::TestNestLock => {
                // Only record the timestamp; test locks might never reach
                // acquired.
                // Safety: see above.
                unsafe { (*task).mutex_acquire_timestamp = self.now() };
            }
            MutexKind::Critical | MutexKind::Ordered => {
                // Consumed at acquired. No event happens in between, and
                // the return addresses of acquired/released are not
                // guaranteed to match this one, so the acquire site names
                // the regions.
                // Safety: see above.
                unsafe {
                    (*task).mutex_acquire_timestamp = self.now();
                    (*task).mutex_acquire_codeptr = codeptr;
                }
            }
            // Intentionally ignore atomic events.
            MutexKind::Atomic => {}
        }
    }

    /// `ompt_callback_mutex_acquired`.
    ///
    /// # Safety
    ///
    /// As [`Adapter::mutex_acquire`]; for locks and nest locks the wait-id
    /// must have been introduced by a lock-init callback.
    pub unsafe fn mutex_acquired(&self, kind: MutexKind, wait_id: WaitId, codeptr: Option<NonZeroUsize>) {
        let _guard = InMeasurement::enter();
        let atid = thread::adapter_tid();
        tracing::trace!(atid, ?kind, wait_id, codeptr = codeptr.map_or(0, NonZeroUsize::get), "mutex acquired");
        if !self.record_events() {
            tracing::trace!("event ignored (either PRE, or POST after finalize_tool)");
            return;
        }

        let task = self.current_task();
        // Safety: the current task is owned by the calling thread.
        if unsafe { (*task).belongs_to_league } {
            warn_once!("OpenMP league mutex-acquired event detected; not handled yet");
            return;
        }

        match kind {
            MutexKind::TestLock => {
                // The successful test enters the wrapper region at the
                // acquire timestamp, then behaves like a plain lock.
                let region = self.lock_region(LockEvent::Test);
                let location = self.current_location();
                // Safety: see above.
                unsafe {
                    self.enter_at(&location, (*task).mutex_acquire_timestamp, region);
                    (*task).mutex_acquire_timestamp = 0;
                }
                self.lock_acquired(wait_id, region);
            }
            MutexKind::Lock => self.lock_acquired(wait_id, self.lock_region(LockEvent::Set)),
            MutexKind::TestNestLock => {
                let region = self.lock_region(LockEvent::TestNest);
                let location = self.current_location();
                // Safety: see above.
                unsafe {
                    self.enter_at(&location, (*task).mutex_acquire_timestamp, region);
                    (*task).mutex_acquire_timestamp = 0;
                }
                self.nest_lock_acquired(wait_id, region);
            }
            // nest-lock-acquired; followed by nest-lock-acquire (nesting)
            // or nest-lock-release.
            MutexKind::NestLock => {
                self.nest_lock_acquired(wait_id, self.lock_region(LockEvent::SetNest));
            }
            MutexKind::Critical => {
                // Safety: forwarded contract.
                unsafe {
                    self.construct_mutex_acquired(
                        task,
                        ToolEvent::Critical,
                        ToolEvent::CriticalSblock,
                        kind,
                        wait_id,
                    );
                }
            }
            MutexKind::Ordered => {
                // Safety: forwarded contract.
                unsafe {
                    self.construct_mutex_acquired(
                        task,
                        ToolEvent::Ordered,
                        ToolEvent::OrderedSblock,
                        kind,
                        wait_id,
                    );
                }
            }
            MutexKind::Atomic => {}
        }
    }

    /// Common acquired path for plain (and successfully tested) locks.
    fn lock_acquired(&self, wait_id: WaitId, exit_region: RegionHandle) {
        let mutex = self.mutexes.get(wait_id, MutexKind::Lock);
        mutex.in_release_operation.lock();
        let location = self.current_location();
        self.substrate()
            .acquire_lock(&location, mutex.id, mutex.next_acquisition());
        self.exit(exit_region);
    }

    /// Common acquired path for (possibly tested) nest locks: the
    /// acquisition order only advances when the nest level was zero.
    fn nest_lock_acquired(&self, wait_id: WaitId, exit_region: RegionHandle) {
        let mutex = self.mutexes.get(wait_id, MutexKind::NestLock);
        mutex.in_release_operation.lock();
        if mutex.nest_level() == 0 {
            mutex.next_acquisition();
        }
        mutex.set_nest_level(mutex.nest_level() + 1);
        let location = self.current_location();
        self.substrate()
            .acquire_lock(&location, mutex.id, mutex.acquisition_order());
        self.exit(exit_region);
    }

    /// Acquired path for critical/ordered: resolve the regions from the
    /// acquire site, enter the outer region back at the acquire timestamp,
    /// report the lock, enter the structured block.
    ///
    /// # Safety
    ///
    /// `task` must be the calling thread's current task.
    unsafe fn construct_mutex_acquired(
        &self,
        task: *mut Task,
        outer_event: ToolEvent,
        sblock_event: ToolEvent,
        kind: MutexKind,
        wait_id: WaitId,
    ) {
        // We are inside the application's mutual exclusion; nobody else
        // accesses this mutex object right now.
        let mutex = self.mutexes.get_or_insert(wait_id, kind);

        // Resolving the regions here instead of at acquire causes less
        // contention.
        // Safety: task ownership per the function contract.
        let (codeptr, acquire_timestamp) = unsafe {
            ((*task).mutex_acquire_codeptr, (*task).mutex_acquire_timestamp)
        };
        let outer = self.get_region(codeptr, outer_event);
        let sblock = self.get_region(codeptr, sblock_event);
        // The released callback needs both regions. The task object cannot
        // carry them (it may enter nested synchronization in between), so
        // they ride on the mutex object; `in_release_operation` keeps the
        // next holder from overwriting them before our release used them.
        mutex.set_regions(outer, sblock);

        let location = self.current_location();
        self.enter_at(&location, acquire_timestamp, outer);

        mutex.in_release_operation.lock();
        self.substrate()
            .acquire_lock(&location, mutex.id, mutex.next_acquisition());
        self.enter(sblock);

        // Safety: see above.
        unsafe {
            (*task).mutex_acquire_codeptr = None;
            (*task).mutex_acquire_timestamp = 0;
        }
    }

    /// `ompt_callback_mutex_released`.
    ///
    /// # Safety
    ///
    /// As [`Adapter::mutex_acquired`].
    pub unsafe fn mutex_released(&self, kind: MutexKind, wait_id: WaitId, _codeptr: Option<NonZeroUsize>) {
        let _guard = InMeasurement::enter();
        let atid = thread::adapter_tid();
        tracing::trace!(atid, ?kind, wait_id, "mutex released");
        if !self.record_events() {
            tracing::trace!("event ignored (either PRE, or POST after finalize_tool)");
            return;
        }

        let task = self.current_task();
        // Safety: the current task is owned by the calling thread.
        if unsafe { (*task).belongs_to_league } {
            warn_once!("OpenMP league mutex-released event detected; not handled yet");
            return;
        }

        match kind {
            MutexKind::Lock => {
                let mutex = self.mutexes.get(wait_id, kind);
                let region = self.lock_region(LockEvent::Unset);
                self.enter(region);
                let location = self.current_location();
                self.substrate()
                    .release_lock(&location, mutex.id, mutex.acquisition_order());
                // Safety: locked in the matching acquired callback.
                unsafe { mutex.in_release_operation.unlock() };
                self.exit(region);
            }
            // nest-lock-release; see also nest-lock-held in `nest_lock`.
            MutexKind::NestLock => {
                let mutex = self.mutexes.get(wait_id, kind);
                let region = self.lock_region(LockEvent::UnsetNest);
                self.enter(region);
                let location = self.current_location();
                self.substrate()
                    .release_lock(&location, mutex.id, mutex.acquisition_order());
                let level = mutex.nest_level();
                bug_on!(level == 0, "nest lock released below nest level zero");
                mutex.set_nest_level(level - 1);
                bug_on!(level - 1 != 0, "nest lock released with non-zero nest level");
                // Safety: locked in the matching acquired callback.
                unsafe { mutex.in_release_operation.unlock() };
                self.exit(region);
            }
            MutexKind::Critical | MutexKind::Ordered => self.construct_mutex_released(kind, wait_id),
            MutexKind::Atomic => {}
            MutexKind::TestLock | MutexKind::TestNestLock => {
                tracing::warn!(?kind, "unexpected mutex kind in released callback");
            }
        }
    }

    /// Released path for critical/ordered.
    fn construct_mutex_released(&self, kind: MutexKind, wait_id: WaitId) {
        let mutex = self.mutexes.get(wait_id, kind);
        // Copy the outer region out before the unlock allows the next
        // holder to overwrite it.
        let outer = mutex.outer_region();
        self.exit(mutex.sblock_region());
        let location = self.current_location();
        self.substrate()
            .release_lock(&location, mutex.id, mutex.acquisition_order());
        // Safety: locked in the matching acquired callback.
        unsafe { mutex.in_release_operation.unlock() };
        self.exit(outer);
    }

    /// `ompt_callback_lock_init`. There is no duration; a zero-length
    /// wrapper region marks the call site in time.
    ///
    /// # Safety
    ///
    /// As [`Adapter::mutex_acquire`].
    pub unsafe fn lock_init(
        &self,
        kind: MutexKind,
        hint: u32,
        _impl_: u32,
        wait_id: WaitId,
        _codeptr: Option<NonZeroUsize>,
    ) {
        let _guard = InMeasurement::enter();
        let atid = thread::adapter_tid();
        tracing::trace!(atid, ?kind, wait_id, hint, "lock init");
        if !self.record_events() {
            tracing::trace!("event ignored (either PRE, or POST after finalize_tool)");
            return;
        }

        let task = self.current_task();
        // Safety: the current task is owned by the calling thread.
        if unsafe { (*task).belongs_to_league } {
            warn_once!("OpenMP league lock-init event detected; not handled yet");
            return;
        }

        let event = match kind {
            // 0 is omp_sync_hint_none.
            MutexKind::Lock if hint != 0 => LockEvent::InitWithHint,
            MutexKind::Lock => LockEvent::Init,
            MutexKind::NestLock if hint != 0 => LockEvent::InitNestWithHint,
            MutexKind::NestLock => LockEvent::InitNest,
            _ => {
                tracing::warn!(?kind, "unexpected mutex kind in lock-init callback");
                return;
            }
        };
        let _ = self.mutexes.get_or_insert(wait_id, kind);

        let region = self.lock_region(event);
        let location = self.current_location();
        let timestamp = self.now();
        self.enter_at(&location, timestamp, region);
        self.exit_at(&location, timestamp, region);
    }

    /// `ompt_callback_lock_destroy`.
    ///
    /// # Safety
    ///
    /// As [`Adapter::mutex_acquire`].
    pub unsafe fn lock_destroy(&self, kind: MutexKind, wait_id: WaitId, _codeptr: Option<NonZeroUsize>) {
        let _guard = InMeasurement::enter();
        let atid = thread::adapter_tid();
        tracing::trace!(atid, ?kind, wait_id, "lock destroy");
        if !self.record_events() {
            tracing::trace!("event ignored (either PRE, or POST after finalize_tool)");
            return;
        }

        let task = self.current_task();
        // Safety: the current task is owned by the calling thread.
        if unsafe { (*task).belongs_to_league } {
            warn_once!("OpenMP league lock-destroy event detected; not handled yet");
            return;
        }

        let event = match kind {
            MutexKind::Lock => LockEvent::Destroy,
            MutexKind::NestLock => LockEvent::DestroyNest,
            _ => {
                tracing::warn!(?kind, "unexpected mutex kind in lock-destroy callback");
                return;
            }
        };
        // The mutex object stays in the monotonic registry; wait-ids of
        // destroyed locks may be reused and will find it again.
        let region = self.lock_region(event);
        let location = self.current_location();
        let timestamp = self.now();
        self.enter_at(&location, timestamp, region);
        self.exit_at(&location, timestamp, region);
    }

    /// `ompt_callback_nest_lock`: scope events of an already-held nest lock
    /// (owned at begin, held at end). Only the nest level changes; the
    /// acquisition order belongs to the outermost acquire.
    ///
    /// # Safety
    ///
    /// As [`Adapter::mutex_acquired`].
    pub unsafe fn nest_lock(&self, endpoint: ScopeEndpoint, wait_id: WaitId, _codeptr: Option<NonZeroUsize>) {
        let _guard = InMeasurement::enter();
        let atid = thread::adapter_tid();
        tracing::trace!(atid, ?endpoint, wait_id, "nest lock");
        if !self.record_events() {
            tracing::trace!("event ignored (either PRE, or POST after finalize_tool)");
            return;
        }

        let task = self.current_task();
        // Safety: the current task is owned by the calling thread.
        if unsafe { (*task).belongs_to_league } {
            warn_once!("OpenMP league nest-lock event detected; not handled yet");
            return;
        }

        let mutex: &MutexObj = self.mutexes.get(wait_id, MutexKind::NestLock);
        let location = self.current_location();
        match endpoint {
            ScopeEndpoint::Begin => {
                // nest-lock-owned; the wrapper region was entered by the
                // corresponding nest-lock-acquire.
                mutex.set_nest_level(mutex.nest_level() + 1);
                self.substrate()
                    .acquire_lock(&location, mutex.id, mutex.acquisition_order());
                self.exit(self.lock_region(LockEvent::SetNest));
            }
            ScopeEndpoint::End => {
                // nest-lock-held; the final release arrives via
                // `mutex_released`.
                let region = self.lock_region(LockEvent::UnsetNest);
                self.enter(region);
                self.substrate()
                    .release_lock(&location, mutex.id, mutex.acquisition_order());
                let level = mutex.nest_level();
                bug_on!(level == 0, "nest lock held event below nest level zero");
                mutex.set_nest_level(level - 1);
                self.exit(region);
            }
            ScopeEndpoint::BeginEnd => {
                bug!("scope beginend not allowed in nest_lock callback");
            }
        }
    }
}
