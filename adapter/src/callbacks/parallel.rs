// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Parallel regions, implicit tasks and the overdue-event protocol.
//!
//! The runtime may deliver a team member's implicit-barrier-end and
//! implicit-task-end long after the member stopped running — possibly after
//! a different team already reuses the member's location. Two actors then
//! compete to write events onto that location:
//!
//! 1. the runtime's late `sync-region-end` / `implicit-task-end` callbacks
//!    ([`barrier_implicit_parallel_end`]), and
//! 2. a new team's `implicit-task-begin`, which must write the previous
//!    region's exits *before* its own team-begin or the location's
//!    timestamp order breaks ([`trigger_overdue_events`]).
//!
//! The location's exchange slot decides who does the work: whoever nulls the
//! slot while it still points at the old task owns its end events. The
//! loser either emits nothing (late runtime callback) or spins on the
//! location's order lock until the winner is done (new team begin).
//!
//! [`barrier_implicit_parallel_end`]: Adapter::barrier_implicit_parallel_end
//! [`trigger_overdue_events`]: Adapter::trigger_overdue_events

use crate::macros::{bug, bug_on, warn_once};
use crate::mgmt::{Adapter, SubsystemError};
use crate::regions::ToolEvent;
use crate::substrate::Location;
use crate::sys::{OmptData, ParallelFlags, ScopeEndpoint, TaskFlags};
use crate::task::{Task, release_task_to_pool, task_from_pool};
use crate::thread::{self, InMeasurement};
use core::num::NonZeroUsize;
use core::ptr;
use core::sync::atomic::Ordering;

impl Adapter {
    /// `ompt_callback_parallel_begin`.
    ///
    /// # Safety
    ///
    /// `encountering_task_data` and `parallel_data` must be the runtime's
    /// slots for the encountering task and the new parallel region; the
    /// encountering slot must carry a task pointer this adapter installed.
    pub unsafe fn parallel_begin(
        &self,
        encountering_task_data: *mut OmptData,
        parallel_data: *mut OmptData,
        requested_parallelism: u32,
        flags: ParallelFlags,
        codeptr: Option<NonZeroUsize>,
    ) {
        let _guard = InMeasurement::enter();
        let atid = thread::adapter_tid();
        tracing::trace!(
            atid,
            requested_parallelism,
            ?flags,
            codeptr = codeptr.map_or(0, NonZeroUsize::get),
            "parallel begin"
        );
        if !self.record_events() {
            tracing::trace!("event ignored (either PRE, or POST after finalize_tool)");
            return;
        }

        bug_on!(requested_parallelism == 0);
        // Safety: slot validity per the function contract.
        bug_on!(
            !unsafe { (*parallel_data).ptr() }.is_null(),
            "expected no data object for a new parallel region"
        );

        // Runtimes without target-callback support have been seen creating
        // helper threads that lack thread-begin and implicit-task-begin but
        // dispatch parallel-begin.
        // Safety: slot validity per the function contract.
        let encountering_task = unsafe { (*encountering_task_data).ptr() }.cast::<Task>();
        bug_on!(
            encountering_task.is_null(),
            "expected thread (atid {atid}) to provide a valid encountering task object; \
             this might be an OpenMP runtime issue"
        );
        bug_on!(
            atid == 0,
            "thread (atid = 0) lacks thread-begin event; this might be an OpenMP runtime issue"
        );

        // Safety: the encountering task stays valid while its thread is
        // inside a parallel construct.
        let encountering_league = unsafe { (*encountering_task).belongs_to_league };
        let league = flags.contains(ParallelFlags::LEAGUE) || encountering_league;

        // First parallel region runs in serial context, no synchronization
        // needed.
        if !league && !self.first_parallel_encountered.load(Ordering::Relaxed) {
            self.first_parallel_encountered
                .store(true, Ordering::Relaxed);
            // Safety: checked non-null above.
            unsafe { self.on_first_parallel_begin(encountering_task) };
        }

        let parallel = self.parallel_pool.get();

        if league {
            // Allocate the object anyway so the runtime's opaque pointer
            // stays meaningful for the child events we are going to skip.
            // Safety: freshly pooled object, not yet shared.
            unsafe { (*parallel).belongs_to_league = true };
            warn_once!(
                "OpenMP league parallel-begin event detected; not handled yet, \
                 league child events will be skipped"
            );
            // Safety: slot validity per the function contract.
            unsafe { (*parallel_data).ptr = parallel.cast() };
            tracing::trace!(atid, "parallel begin: belongs_to_league");
            return;
        }

        let region = self.get_region(codeptr, ToolEvent::Parallel);
        // Safety: freshly pooled object, not yet shared.
        unsafe {
            (*parallel).init(
                parallel,
                thread::tpd(),
                requested_parallelism,
                codeptr,
                region,
                -1,
                self.word_layout(),
            );
        }
        // Safety: slot validity per the function contract.
        unsafe { (*parallel_data).ptr = parallel.cast() };

        bug_on!(!flags.contains(ParallelFlags::TEAM));

        // codeptr is also used for the (contended) implicit-barrier begin
        // later on; create the barrier region uncontended already here.
        let _ = self.get_region(codeptr, ToolEvent::ImplicitBarrier);

        let location = self.current_location();
        self.substrate()
            .fork(&location, self.now(), requested_parallelism);

        // This location becomes worker 0 of the new team; clear its task
        // slot and restore it at parallel-end.
        let stored = location.subsystem_data().task_exchange().swap(ptr::null_mut());
        bug_on!(stored.is_null());

        tracing::trace!(atid, region = region.id(), "parallel begin done");
    }

    /// First non-league parallel-begin ever: the initial task never went
    /// through implicit-task-begin's slot store, so register it (the
    /// encountering task) on its location now.
    ///
    /// # Safety
    ///
    /// `encountering_task` must be valid.
    unsafe fn on_first_parallel_begin(&self, encountering_task: *mut Task) {
        bug_on!(encountering_task.is_null());
        bug_on!(thread::tpd().is_none());

        let initial_task = self.initial_task.load(Ordering::SeqCst);
        bug_on!(initial_task.is_null());
        // Safety: the initial task lives for the whole measurement.
        let location = unsafe { (*initial_task).location.clone() };
        let Some(location) = location else {
            bug!("initial task has no location");
        };

        let stored = location
            .subsystem_data()
            .task_exchange()
            .swap(encountering_task);
        tracing::debug!(
            atid = thread::adapter_tid(),
            location = location.id(),
            stored = ?stored,
            "first parallel begin"
        );
    }

    /// `ompt_callback_parallel_end`.
    ///
    /// # Safety
    ///
    /// Slots as in [`Adapter::parallel_begin`]; `parallel_data` must carry
    /// the pointer installed by the matching begin.
    pub unsafe fn parallel_end(
        &self,
        parallel_data: *mut OmptData,
        encountering_task_data: *mut OmptData,
        _flags: ParallelFlags,
        _codeptr: Option<NonZeroUsize>,
    ) {
        let _guard = InMeasurement::enter();
        let atid = thread::adapter_tid();
        tracing::trace!(atid, "parallel end");
        if !self.record_events() {
            tracing::trace!("event ignored (either PRE, or POST after finalize_tool)");
            return;
        }

        // Safety: slot carries the pointer installed by parallel-begin.
        let parallel = unsafe { (*parallel_data).ptr() }.cast::<crate::parallel::Parallel>();
        bug_on!(parallel.is_null());

        // Safety: the region object is kept alive by its refcount.
        if unsafe { (*parallel).belongs_to_league } {
            tracing::trace!(atid, "parallel end: belongs_to_league");
            return;
        }

        let location = self.current_location();
        let tpd_from_now_on = self.substrate().join(&location, self.now());

        // Restore the slot that parallel-begin cleared.
        // Safety: slot validity per the function contract.
        let encountering_task = unsafe { (*encountering_task_data).ptr() }.cast::<Task>();
        let stored = location
            .subsystem_data()
            .task_exchange()
            .swap(encountering_task);

        // For a team of one there are no implicit-barrier events, so the
        // slot was never cleared by the barrier-end path.
        // Safety: see above.
        bug_on!(unsafe { (*parallel).team_size() } > 1 && !stored.is_null());

        tracing::debug!(
            atid,
            location = location.id(),
            last_timestamp = location.last_timestamp(),
            stored = ?stored,
            "parallel end"
        );

        thread::set_tpd(Some(tpd_from_now_on));
        // Safety: this thread holds the encountering task's reference.
        unsafe { self.parallel_pool.release(parallel) };
    }

    /// `ompt_callback_implicit_task`.
    ///
    /// # Safety
    ///
    /// `parallel_data`/`task_data` must be the runtime's slots for the
    /// team's region and this member's task, valid for the call.
    pub unsafe fn implicit_task(
        &self,
        endpoint: ScopeEndpoint,
        parallel_data: *mut OmptData,
        task_data: *mut OmptData,
        actual_parallelism: u32,
        index: u32,
        flags: TaskFlags,
    ) {
        let _guard = InMeasurement::enter();
        let atid = thread::adapter_tid();
        tracing::trace!(atid, ?endpoint, actual_parallelism, index, ?flags, "implicit task");

        // Initial tasks (the initial thread's, and league roots) are
        // handled before the gate: they define the singletons the rest of
        // the measurement relies on.
        if flags.contains(TaskFlags::INITIAL) {
            // Safety: forwarded contract.
            unsafe {
                self.initial_implicit_task(endpoint, parallel_data, task_data, actual_parallelism, index, flags);
            }
            return;
        }

        if !self.record_events() {
            tracing::trace!("event ignored (either PRE, or POST after finalize_tool)");
            return;
        }

        match endpoint {
            ScopeEndpoint::Begin => {
                // Safety: slot validity per the function contract.
                let parallel = unsafe { (*parallel_data).ptr() }.cast::<crate::parallel::Parallel>();
                bug_on!(parallel.is_null());

                // Safety: region objects outlive their team.
                if unsafe { (*parallel).belongs_to_league } {
                    // Safety: forwarded contract.
                    let task = unsafe {
                        self.new_league_task(parallel_data, actual_parallelism, index, false)
                    };
                    // Safety: slot validity per the function contract.
                    unsafe { (*task_data).ptr = task.cast() };
                    tracing::trace!(atid, index, "implicit task begin: belongs_to_league");
                    return;
                }

                // Safety: see above.
                let parent = unsafe { (*parallel).parent };
                let Some(parent) = parent else {
                    bug!("valid parent required");
                };

                if index == 0 {
                    // Safety: see above.
                    let team_size = unsafe { (*parallel).team_size() };
                    if team_size != actual_parallelism {
                        tracing::warn!(
                            "requested team size larger than actual size ({team_size} > {actual_parallelism})"
                        );
                        // Safety: see above.
                        unsafe {
                            (*parallel).team_size.store(actual_parallelism, Ordering::Relaxed);
                        }
                    }
                    // Publish the refcount, releasing the −1 sentinel.
                    // Safety: see above.
                    unsafe {
                        (*parallel).publish_ref_count(actual_parallelism as i32 + 1);
                    }
                }

                let location = self.current_location();
                // Write any overdue exits of the location's previous region
                // before this team activates it.
                let _ = self.trigger_overdue_events(&location);

                let team = self.substrate().team_begin(
                    &location,
                    self.now(),
                    index,
                    actual_parallelism,
                    parent,
                );
                // Safety: see above.
                self.enter(unsafe { (*parallel).region });

                let task = task_from_pool();
                // Safety: freshly pooled, not yet shared.
                unsafe {
                    (*task).kind = TaskFlags::IMPLICIT;
                    (*task).team_size = actual_parallelism;
                    (*task).index = index;
                    (*task).parallel_region = parallel;
                    (*task).tpd = Some(team.tpd);
                    (*task).location = Some(location.clone());
                    (*task).substrate_task = Some(team.task);
                    // Some runtimes reuse task_data for single-thread teams;
                    // stash the previous task and restore it at team end.
                    let prior = (*task_data).ptr();
                    if !prior.is_null() {
                        (*task).next = prior.cast();
                    }
                    (*task_data).ptr = task.cast();
                }

                // Store the task so a later team on this location can
                // trigger our end events if the runtime leaves them overdue.
                let data = location.subsystem_data();
                data.mark_ompt_location();
                let stored = data.task_exchange().swap(task);
                bug_on!(!stored.is_null());

                tracing::debug!(
                    atid,
                    index,
                    location = location.id(),
                    parent = parent.0,
                    tpd = team.tpd.0,
                    "implicit task begin"
                );
                thread::set_tpd(Some(team.tpd));
            }
            ScopeEndpoint::End => {
                // Safety: slot validity per the function contract.
                let task = unsafe { (*task_data).ptr() }.cast::<Task>();
                if !task.is_null() {
                    // Safety: the slot still carries our task, so this
                    // thread owns its end protocol.
                    if unsafe { (*task).belongs_to_league } {
                        // Safety: task claimed by this path.
                        unsafe { self.release_at_team_end(task, task_data) };
                        tracing::trace!(atid, index, "implicit task end: belongs_to_league");
                    } else {
                        // Safety: task claimed by this path.
                        unsafe {
                            self.implicit_task_end_impl(task, "itask_exit");

                            // Release the location: this thread won't write
                            // any more events to it.
                            let location = (*task).location.clone();
                            let Some(location) = location else {
                                bug!("implicit task without location at end");
                            };
                            location.subsystem_data().preserve_order().unlock();

                            self.release_at_team_end(task, task_data);
                        }
                        tracing::trace!(atid, index, "implicit task end");
                    }
                } else {
                    // Already handled via overdue drain, sync-region-end, or
                    // finalize_tool.
                    tracing::trace!(atid, index, "implicit task end (noop)");
                }

                if index != 0 {
                    thread::set_tpd(None);
                }
            }
            ScopeEndpoint::BeginEnd => {
                bug!("scope beginend not allowed in implicit_task callback");
            }
        }
    }

    /// The `TaskFlags::INITIAL` paths of the implicit-task callback.
    ///
    /// # Safety
    ///
    /// Forwarded from [`Adapter::implicit_task`].
    unsafe fn initial_implicit_task(
        &self,
        endpoint: ScopeEndpoint,
        parallel_data: *mut OmptData,
        task_data: *mut OmptData,
        actual_parallelism: u32,
        index: u32,
        flags: TaskFlags,
    ) {
        let atid = thread::adapter_tid();
        match endpoint {
            ScopeEndpoint::Begin => {
                // The initial thread's initial task.
                if self.initial_task.load(Ordering::SeqCst).is_null() {
                    self.on_initial_task(flags);
                    // Safety: slot validity per the function contract.
                    unsafe {
                        (*task_data).ptr = self.initial_task.load(Ordering::SeqCst).cast();
                        (*parallel_data).ptr = self.implicit_parallel.load(Ordering::SeqCst).cast();
                    }
                    tracing::trace!(atid, "initial task begin");
                    return;
                }

                // Initial task of a league. Some runtimes provide no
                // parallel data here although the binding is the current
                // teams region.
                // Safety: slot validity per the function contract.
                bug_on!(!unsafe { (*parallel_data).ptr() }.is_null());
                // Safety: forwarded contract.
                let task =
                    unsafe { self.new_league_task(parallel_data, actual_parallelism, index, true) };
                // Safety: slot validity per the function contract.
                unsafe { (*task_data).ptr = task.cast() };
                tracing::trace!(atid, index, "league initial task begin");
            }
            ScopeEndpoint::End => {
                // Safety: slot validity per the function contract.
                let task = unsafe { (*task_data).ptr() }.cast::<Task>();
                if task == self.initial_task.load(Ordering::SeqCst) {
                    tracing::trace!(atid, "initial task end");
                    return;
                }
                // League initial task. Releasing would rely on valid
                // parallel data, which league suppression never set up.
                // Safety: league tasks stay valid; see `new_league_task`.
                unsafe {
                    bug_on!(!(*task).belongs_to_league);
                    bug_on!(!(*task).parallel_region.is_null());
                }
                tracing::trace!(atid, index, "league initial task end");
            }
            ScopeEndpoint::BeginEnd => {
                bug!("scope beginend not allowed in implicit_task callback");
            }
        }
    }

    /// Sets up the initial-task and implicit-parallel singletons.
    fn on_initial_task(&self, flags: TaskFlags) {
        let layout = self.word_layout();
        let region = self.get_region(None, ToolEvent::Parallel);

        let implicit_parallel = self.parallel_pool.get();
        // Safety: freshly pooled, not yet shared.
        unsafe {
            (*implicit_parallel).init(implicit_parallel, None, 1, None, region, 0, layout);
        }

        let task = task_from_pool();
        // Safety: freshly pooled, not yet shared.
        unsafe {
            (*task).kind = flags;
            (*task).location = Some(self.current_location());
            (*task).tpd = thread::tpd();
            bug_on!((*task).tpd.is_none());
            // The initial task has no substrate task-begin/end events;
            // prevent task-switch events by marking it undeferred.
            (*task).is_undeferred = true;
            (*task).parallel_region = implicit_parallel;
        }

        self.implicit_parallel
            .store(implicit_parallel, Ordering::SeqCst);
        self.initial_task.store(task, Ordering::SeqCst);
    }

    /// Allocates a tagged task object for a league member so the runtime's
    /// pointer stays meaningful while its events are skipped.
    ///
    /// # Safety
    ///
    /// `parallel_data` must be the runtime's slot for the binding region.
    unsafe fn new_league_task(
        &self,
        parallel_data: *mut OmptData,
        actual_parallelism: u32,
        index: u32,
        initial: bool,
    ) -> *mut Task {
        let task = task_from_pool();
        if initial {
            // Safety: slot validity per the function contract.
            bug_on!(!unsafe { (*parallel_data).ptr() }.is_null());
            // Safety: freshly pooled, not yet shared.
            unsafe {
                (*task).parallel_region = ptr::null_mut();
                (*task).index = index;
                (*task).belongs_to_league = true;
            }
        } else {
            // Safety: slot validity per the function contract.
            let parallel = unsafe { (*parallel_data).ptr() }.cast::<crate::parallel::Parallel>();
            bug_on!(parallel.is_null());
            // Safety: freshly pooled task; the region object outlives it.
            unsafe {
                (*task).parallel_region = parallel;
                (*task).index = index;
                (*task).belongs_to_league = true;
                if index == 0 {
                    (*parallel).publish_ref_count(actual_parallelism as i32 + 1);
                }
            }
        }
        warn_once!(
            "OpenMP league implicit-task-begin event detected; not handled yet, \
             league child events will be skipped"
        );
        task
    }

    /// The subsystem hook invoked before a new implicit task activates
    /// `location`: drains the previous region's overdue end events, or
    /// waits for the thread that is already draining them.
    pub fn trigger_overdue_events(&self, location: &Location) -> Result<(), SubsystemError> {
        if !self.record_events() {
            return Ok(());
        }

        let data = location.subsystem_data();
        // A location created by this very implicit-task-begin is not yet an
        // OMPT location and has no overdue events.
        if !data.is_ompt_location() {
            tracing::trace!(
                atid = thread::adapter_tid(),
                location = location.id(),
                "not an OMPT location (yet)"
            );
            return Ok(());
        }

        // The slot holds either null or the task that previously wrote to
        // this location and whose ibarrier-end/itask-end are still overdue.
        // Claim it; also keep the task from returning to its pool while we
        // work on it.
        let stored = data.task_exchange().exchange_with(|stored| {
            if stored.is_null() {
                stored
            } else {
                // Safety: a non-null slot entry is a live task; setting the
                // flag under the exchange lock wins against pool release.
                unsafe { (*stored).in_overdue_use.store(true, Ordering::SeqCst) };
                ptr::null_mut()
            }
        });

        if !stored.is_null() {
            tracing::debug!(
                atid = thread::adapter_tid(),
                location = location.id(),
                "processing overdue events"
            );
            // Write the postponed implicit-barrier-end and
            // implicit-task-end onto the original location.
            // Safety: the exchange above made this thread the exclusive
            // owner of the task's end protocol.
            unsafe {
                self.barrier_implicit_parallel_end_impl(stored, "overdue_exit");
                self.implicit_task_end_impl(stored, "overdue_exit");
                (*stored).in_overdue_use.store(false, Ordering::SeqCst);
            }
        } else {
            tracing::debug!(
                atid = thread::adapter_tid(),
                location = location.id(),
                "overdue events processed by another thread"
            );
            // Another thread writes/wrote the exits on this location; let it
            // finish before implicit-task-begin writes the next event.
            data.preserve_order().wait();
        }

        Ok(())
    }

    /// The runtime-delivered mirror of the overdue drain: implicit-barrier
    /// end inside a parallel region.
    ///
    /// Emits the barrier exit only if the location slot still carries this
    /// task; pulls the implicit-task-end forward when the primary already
    /// published its timestamp, and otherwise leaves it to the runtime's
    /// later callback, cued by `preserve_order` staying locked.
    ///
    /// # Safety
    ///
    /// `task_data` must carry a task pointer this adapter installed at
    /// implicit-task-begin.
    pub(crate) unsafe fn barrier_implicit_parallel_end(&self, task_data: *mut OmptData) {
        // Safety: slot validity per the function contract.
        let task = unsafe { (*task_data).ptr() }.cast::<Task>();
        bug_on!(task.is_null());
        // Safety: the task is ours until release_at_team_end below.
        let parallel = unsafe { (*task).parallel_region };
        let location = {
            // Safety: see above.
            let location = unsafe { (*task).location.clone() };
            let Some(location) = location else {
                bug!("implicit task without location at barrier end");
            };
            location
        };
        let data = location.subsystem_data();

        data.preserve_order().lock();
        let claimed = data.task_exchange().exchange_with(|stored| {
            if stored == task { ptr::null_mut() } else { stored }
        });

        if claimed == task {
            // This callback handles ibarrier-end, and possibly itask-end.
            tracing::debug!(
                atid = thread::adapter_tid(),
                location = location.id(),
                "implicit barrier end (trigger)"
            );
            // Safety: the exchange claimed the end protocol for this thread.
            unsafe { self.barrier_implicit_parallel_end_impl(task, "sync_region_exit") };

            // Safety: region objects outlive their tasks.
            let timestamp = unsafe { (*parallel).timestamp_itask_end.load(Ordering::Relaxed) };
            if timestamp != 0 {
                // Safety: claimed above.
                unsafe {
                    self.implicit_task_end_impl(task, "sync_region_exit");
                    // Release the location: this thread won't write any
                    // additional events to it.
                    data.preserve_order().unlock();
                    self.release_at_team_end(task, task_data);
                }
            }
            // Otherwise the runtime's implicit-task-end callback unlocks
            // preserve_order and releases the task.
        } else {
            // ibarrier-end and itask-end were handled via the overdue
            // drain.
            // Safety: preserve_order was locked above.
            unsafe { data.preserve_order().unlock() };
            // Safety: the drain is done with the task once in_overdue_use
            // clears; release_at_team_end waits for that.
            unsafe { self.release_at_team_end(task, task_data) };
            tracing::debug!(
                atid = thread::adapter_tid(),
                location = location.id(),
                "implicit barrier end (ignore)"
            );
        }
    }

    /// Implicit-barrier end delivered from `finalize_tool`: runtime threads
    /// (and locations) may have changed between barrier begin and end, so
    /// per-team cleanup is serialized under one mutex and the primary's
    /// timestamps are authoritative.
    ///
    /// # Safety
    ///
    /// As [`Adapter::barrier_implicit_parallel_end`].
    pub(crate) unsafe fn barrier_implicit_parallel_end_finalize_tool(
        &self,
        task_data: *mut OmptData,
    ) {
        self.finalize_team_cleanup.lock();

        // Safety: slot validity per the function contract.
        let task = unsafe { (*task_data).ptr() }.cast::<Task>();
        bug_on!(task.is_null());
        // Safety: serialized by finalize_team_cleanup.
        let parallel = unsafe { (*task).parallel_region };
        let location = {
            // Safety: see above.
            let location = unsafe { (*task).location.clone() };
            let Some(location) = location else {
                bug!("implicit task without location at finalize");
            };
            location
        };
        let data = location.subsystem_data();

        let claimed = data.task_exchange().exchange_with(|stored| {
            if stored == task { ptr::null_mut() } else { stored }
        });
        if claimed == task {
            tracing::debug!(
                atid = thread::adapter_tid(),
                location = location.id(),
                "implicit barrier end (finalizing_tool)"
            );
            // Safety: claimed; serialized by finalize_team_cleanup.
            unsafe {
                self.barrier_implicit_parallel_end_impl(task, "finalizing_tool");
                // The primary ran synchronously, so its end timestamp must
                // be known by now.
                let timestamp = (*parallel).timestamp_itask_end.load(Ordering::Relaxed);
                bug_on!(timestamp == 0);
                self.implicit_task_end_impl(task, "finalizing_tool");
            }
        }

        // Safety: claimed or already drained; either way the task is done.
        unsafe { self.release_at_team_end(task, task_data) };

        // Safety: locked at function entry.
        unsafe { self.finalize_team_cleanup.unlock() };
    }

    /// Emits the implicit-barrier exit on the task's own location, using the
    /// primary's published end timestamp when available.
    ///
    /// # Safety
    ///
    /// The caller must own the task's end protocol (normal end on the
    /// owning thread, a claimed overdue drain, or finalize-tool cleanup).
    pub(crate) unsafe fn barrier_implicit_parallel_end_impl(&self, task: *mut Task, caller: &str) {
        // Safety: ownership per the function contract.
        let task = unsafe { &mut *task };
        // Safety: region objects outlive their tasks.
        let parallel = unsafe { &*task.parallel_region };

        let timestamp = if task.index == 0 {
            let now = self.now();
            parallel
                .timestamp_ibarrier_end
                .store(now, Ordering::SeqCst);
            now
        } else {
            let published = parallel.timestamp_ibarrier_end.load(Ordering::SeqCst);
            if published == 0 { self.now() } else { published }
        };

        let Some(task_location) = task.location.clone() else {
            bug!("implicit task without location (ibarrier_end {caller})");
        };
        let current = self.current_location();
        if current.id() != task_location.id() {
            tracing::warn!(
                "ibarrier_end triggered from location {} but corresponding ibarrier_begin \
                 triggered from location {} (finalizing_tool = {})",
                current.id(),
                task_location.id(),
                self.finalizing_tool()
            );
        }

        tracing::debug!(
            atid = thread::adapter_tid(),
            caller,
            location = task_location.id(),
            index = task.index,
            barrier = task.sync_regions.top().map_or(0, crate::substrate::RegionHandle::id),
            timestamp,
            "implicit barrier end"
        );

        let region = task.sync_regions.pop();
        self.exit_at(&task_location, timestamp, region);
    }

    /// Emits the parallel-region exit and team-end on the task's own
    /// location; counterpart of [`Adapter::barrier_implicit_parallel_end_impl`]
    /// for the implicit-task end.
    ///
    /// # Safety
    ///
    /// As [`Adapter::barrier_implicit_parallel_end_impl`].
    pub(crate) unsafe fn implicit_task_end_impl(&self, task: *mut Task, caller: &str) {
        bug_on!(task.is_null());
        // Safety: ownership per the function contract.
        let task = unsafe { &mut *task };
        // Safety: region objects outlive their tasks.
        let parallel = unsafe { &*task.parallel_region };

        // Non-primary barrier/task ends can be delayed; use the primary's
        // timestamp if it is already published so the whole team reports
        // one end time.
        let timestamp = if task.index == 0 {
            let now = self.now();
            parallel.timestamp_itask_end.store(now, Ordering::SeqCst);
            now
        } else {
            let published = parallel.timestamp_itask_end.load(Ordering::SeqCst);
            if published == 0 { self.now() } else { published }
        };

        let Some(task_location) = task.location.clone() else {
            bug!("implicit task without location (itask_end {caller})");
        };
        let current = self.current_location();
        if current.id() != task_location.id() {
            tracing::warn!(
                "itask_end triggered from location {} but corresponding itask_begin \
                 triggered from location {} (finalizing_tool = {})",
                current.id(),
                task_location.id(),
                self.finalizing_tool()
            );
        }

        tracing::debug!(
            atid = thread::adapter_tid(),
            caller,
            location = task_location.id(),
            index = task.index,
            timestamp,
            "implicit task end"
        );

        self.exit_at(&task_location, timestamp, parallel.region);
        let Some(tpd) = task.tpd else {
            bug!("implicit task without tpd (itask_end {caller})");
        };
        self.substrate()
            .team_end(&task_location, timestamp, tpd, task.index, task.team_size);
    }

    /// Common release path at team end: waits out any overdue drain,
    /// restores a displaced prior `task_data` pointer, and drops the task's
    /// references.
    ///
    /// # Safety
    ///
    /// The task's end events must be fully written; no party may touch the
    /// task afterwards except through the pool.
    pub(crate) unsafe fn release_at_team_end(&self, task: *mut Task, task_data: *mut OmptData) {
        // Safety: the task stays valid until released below.
        unsafe {
            (*task).wait_not_in_overdue_use();
            (*task_data).ptr = (*task).next.cast();
            if !(*task).parallel_region.is_null() {
                self.parallel_pool.release((*task).parallel_region);
            }
            release_task_to_pool(task);
        }
    }
}
