// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Explicit tasks: create and schedule.
//!
//! Task-create packs everything the first schedule needs into the 64-bit
//! word (see [`encoding`]); a real task object is only allocated — on the
//! executing thread — when the task first runs. Undeferred tasks share the
//! parallel region's stand-in object and stay invisible to the substrate.
//!
//! [`encoding`]: crate::encoding

use crate::macros::{bug, bug_on, warn_once};
use crate::mgmt::Adapter;
use crate::regions::ToolEvent;
use crate::substrate::RegionHandle;
use crate::sys::{OmptData, TaskFlags, TaskStatus};
use crate::task::{Task, release_task_to_pool, task_from_pool};
use crate::thread::{self, InMeasurement};
use core::num::NonZeroUsize;
use core::ptr;
use core::sync::atomic::Ordering;

impl Adapter {
    /// `ompt_callback_task_create`.
    ///
    /// # Safety
    ///
    /// `encountering_task_data` must carry a task pointer this adapter
    /// installed; `new_task_data` must be the runtime's slot for the new
    /// task, writable for the duration of the call.
    pub unsafe fn task_create(
        &self,
        encountering_task_data: *mut OmptData,
        new_task_data: *mut OmptData,
        flags: TaskFlags,
        _has_dependences: bool,
        codeptr: Option<NonZeroUsize>,
    ) {
        let _guard = InMeasurement::enter();
        let atid = thread::adapter_tid();
        tracing::trace!(atid, ?flags, "task create");
        if !self.record_events() {
            tracing::trace!("event ignored (either PRE, or POST after finalize_tool)");
            return;
        }

        // Safety: slot validity per the function contract.
        let encountering_task = unsafe { (*encountering_task_data).ptr() }.cast::<Task>();
        bug_on!(encountering_task.is_null());
        // Safety: the encountering task is owned by the calling thread.
        if unsafe { (*encountering_task).belongs_to_league } {
            warn_once!("OpenMP league task-create event detected; not handled yet");
            // Safety: slot validity per the function contract.
            unsafe { (*new_task_data).value = 0 };
            return;
        }

        bug_on!(!flags.contains(TaskFlags::EXPLICIT), "expected explicit task only");
        bug_on!(flags.contains(TaskFlags::TASKWAIT), "taskwait-init not supported yet");

        // No scheduling events occur when switching to or from a merged
        // task; the others are assumed to trigger task-schedule events.
        if flags.contains(TaskFlags::MERGED) {
            // Safety: slot validity per the function contract.
            unsafe { (*new_task_data).ptr = encountering_task.cast() };
            tracing::trace!(atid, "task create: merged");
            return;
        }

        let layout = self.word_layout();

        // Undeferred tasks execute immediately and generate no substrate
        // task events; an invalid region in the word communicates that to
        // task-schedule.
        if flags.contains(TaskFlags::UNDEFERRED) {
            // Safety: slot validity per the function contract.
            unsafe { (*new_task_data).value = layout.encode_undeferred() };
            tracing::trace!(atid, "task create: undeferred");
            return;
        }

        let event = if flags.contains(TaskFlags::UNTIED) {
            ToolEvent::TaskUntied
        } else {
            ToolEvent::Task
        };
        let task_region = self.get_region(codeptr, event);
        bug_on!(task_region == RegionHandle::INVALID);

        let thread_num = self.current_thread_num();
        // Safety: see above; the region object outlives its tasks.
        let parallel = unsafe { &*(*encountering_task).parallel_region };

        // The counter slot is owned by this thread (indexed by its
        // thread-num within the team).
        let generation_slot = &parallel.task_generation_numbers[thread_num as usize];
        let generation = generation_slot.load(Ordering::Relaxed);
        bug_on!(
            parallel.packing.max_explicit_tasks == generation,
            "cannot handle more than {} task creations per thread",
            parallel.packing.max_explicit_tasks
        );
        let generation = generation + 1;
        generation_slot.store(generation, Ordering::Relaxed);

        let word = parallel
            .packing
            .encode(layout, task_region, thread_num, generation);
        // Safety: slot validity per the function contract.
        unsafe { (*new_task_data).value = word };

        // The duration of task-create is pure tool time; enter and exit at
        // one timestamp.
        let create_region = self.get_region(codeptr, ToolEvent::TaskCreate);
        let location = self.current_location();
        let timestamp = self.now();
        self.enter_at(&location, timestamp, create_region);
        self.substrate()
            .task_create(&location, thread_num, generation);
        self.exit_at(&location, timestamp, create_region);

        tracing::trace!(atid, thread_num, generation, word, "task created");
    }

    /// `ompt_callback_task_schedule`.
    ///
    /// # Safety
    ///
    /// `prior_task_data` must carry a task pointer this adapter installed;
    /// `next_task_data` must carry either such a pointer or a task-create
    /// word written by [`Adapter::task_create`].
    pub unsafe fn task_schedule(
        &self,
        prior_task_data: *mut OmptData,
        prior_task_status: TaskStatus,
        next_task_data: *mut OmptData,
    ) {
        let _guard = InMeasurement::enter();
        let atid = thread::adapter_tid();
        tracing::trace!(atid, ?prior_task_status, "task schedule");
        if !self.record_events() {
            tracing::trace!("event ignored (either PRE, or POST after finalize_tool)");
            return;
        }

        bug_on!(
            prior_task_status != TaskStatus::Switch && prior_task_status != TaskStatus::Complete,
            "only prior_task_status complete and switch supported"
        );

        // Safety: slot validity per the function contract.
        let prior_task = unsafe { (*prior_task_data).ptr() }.cast::<Task>();
        bug_on!(prior_task.is_null());

        // League scheduling would need prior and next taken into account;
        // skip it entirely.
        // Safety: the prior task is owned by the calling thread.
        if unsafe { (*prior_task).belongs_to_league } || unsafe { (*next_task_data).value() } == 0 {
            warn_once!("OpenMP league task-schedule event detected; not handled yet");
            return;
        }

        // The next-task branch below still reads through `prior_task` after
        // a completed task went back to the pool; take what it needs first.
        // Safety: see above.
        let prior_parallel = unsafe { (*prior_task).parallel_region };

        if prior_task_status == TaskStatus::Complete {
            // Safety: the completing task is owned by the calling thread.
            let undeferred = unsafe { (*prior_task).is_undeferred };
            if undeferred {
                tracing::trace!(atid, "completing undeferred task");
            } else {
                // Safety: see above.
                unsafe {
                    bug_on!(
                        !(*prior_task).kind.contains(TaskFlags::EXPLICIT),
                        "expected only explicit tasks to show up with status complete"
                    );
                    let Some(substrate_task) = (*prior_task).substrate_task else {
                        bug!("explicit task completed before its first schedule");
                    };
                    let location = self.current_location();
                    self.substrate()
                        .task_end(&location, (*prior_task).region, substrate_task);
                    release_task_to_pool(prior_task);
                }
                tracing::trace!(atid, "completing task");
            }
            // Safety: slot validity per the function contract.
            unsafe { (*prior_task_data).ptr = ptr::null_mut() };
        } else {
            tracing::trace!(atid, "suspending task");
        }

        // Handle the next task.
        // Safety: slot validity per the function contract.
        bug_on!(
            unsafe { (*next_task_data).ptr() }.is_null(),
            "task_data not initialized, should not happen"
        );

        let layout = self.word_layout();
        // Safety: slot validity per the function contract.
        let word = unsafe { (*next_task_data).value() };
        if layout.is_new_task(word) {
            // First schedule for this task: unpack the task-create data and
            // build the real task object.
            let region = layout.decode_region(word);
            // Safety: the region object is kept alive by its team.
            let parallel = unsafe { &*prior_parallel };

            if region == RegionHandle::INVALID {
                // Undeferred: pass the region's shared stand-in around and
                // emit nothing.
                // Safety: embedded in the region object, same lifetime.
                unsafe {
                    (*next_task_data).ptr =
                        ptr::addr_of!(parallel.undeferred_task).cast_mut().cast();
                }
                tracing::trace!(atid, "starting undeferred task");
            } else {
                let thread_num = parallel.packing.decode_thread_num(word);
                let generation = parallel.packing.decode_generation(word);

                let next_task = task_from_pool();
                let location = self.current_location();
                let substrate_task =
                    self.substrate()
                        .task_begin(&location, region, thread_num, generation);
                // Safety: freshly pooled, not yet shared.
                unsafe {
                    (*next_task).kind = TaskFlags::EXPLICIT;
                    (*next_task).parallel_region = prior_parallel;
                    (*next_task).region = region;
                    (*next_task).substrate_task = Some(substrate_task);
                }
                // The word's new-task bit is odd; the pointer replacing it
                // is even, so later schedules take the other branch.
                // Safety: slot validity per the function contract.
                unsafe { (*next_task_data).ptr = next_task.cast() };
                tracing::trace!(atid, thread_num, generation, "starting task");
            }
        } else {
            // Safety: a cleared slot carries a task pointer we installed.
            let next_task = unsafe { (*next_task_data).ptr() }.cast::<Task>();
            // Safety: the resuming task is owned by the calling thread.
            let undeferred = unsafe { (*next_task).is_undeferred };
            if undeferred {
                tracing::trace!(atid, "resuming undeferred task");
            } else {
                // Safety: see above.
                let Some(substrate_task) = (unsafe { (*next_task).substrate_task }) else {
                    bug!("scheduled task without substrate task");
                };
                let location = self.current_location();
                self.substrate().task_switch(&location, substrate_task);
                tracing::trace!(atid, "resuming task");
            }
        }

        // A task may have executed a parallel region, in which case
        // parallel-end stored it (the encountering task) in the location
        // slot. When switching to a different task, the slot must follow,
        // or a later overdue drain would miss the right task.
        // Safety: slot validity per the function contract.
        let next_task = unsafe { (*next_task_data).ptr() }.cast::<Task>();
        if next_task != prior_task {
            let location = self.current_location();
            location.subsystem_data().task_exchange().swap(next_task);
        }
    }
}
