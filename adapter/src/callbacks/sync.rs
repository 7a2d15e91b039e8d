// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Sync regions, workshares, masked, dispatch and flush.
//!
//! These constructs nest, so a begin pushes its resolved region onto the
//! task's stack and the matching end pops it. The one exception is the
//! implicit barrier ending a parallel region: its end feeds the overdue
//! protocol in [`callbacks::parallel`] instead of a plain pop.
//!
//! [`callbacks::parallel`]: crate::callbacks::parallel

use crate::macros::{bug, bug_on, warn_once};
use crate::mgmt::Adapter;
use crate::regions::ToolEvent;
use crate::substrate::RegionHandle;
use crate::sys::{DispatchKind, OmptData, ScopeEndpoint, SyncRegionKind, WorkKind};
use crate::task::Task;
use crate::thread::{self, InMeasurement};
use core::num::NonZeroUsize;

impl Adapter {
    /// `ompt_callback_sync_region`.
    ///
    /// # Safety
    ///
    /// `task_data` must carry a task pointer this adapter installed;
    /// `parallel_data` is only inspected for nullness.
    pub unsafe fn sync_region(
        &self,
        kind: SyncRegionKind,
        endpoint: ScopeEndpoint,
        parallel_data: *mut OmptData,
        task_data: *mut OmptData,
        codeptr: Option<NonZeroUsize>,
    ) {
        let _guard = InMeasurement::enter();
        let atid = thread::adapter_tid();
        tracing::trace!(atid, ?kind, ?endpoint, "sync region");
        if !self.record_events() {
            tracing::trace!("event ignored (either PRE, or POST after finalize_tool)");
            return;
        }

        // Safety: slot validity per the function contract.
        let task = unsafe { (*task_data).ptr() }.cast::<Task>();
        bug_on!(task.is_null());
        // Safety: the task is owned by the calling thread while it runs.
        if unsafe { (*task).belongs_to_league } {
            tracing::trace!(atid, ?kind, ?endpoint, "sync region: belongs_to_league");
            return;
        }

        match endpoint {
            ScopeEndpoint::Begin => match kind {
                SyncRegionKind::Barrier => {
                    bug!("deprecated enum ompt_sync_region_barrier encountered");
                }
                SyncRegionKind::BarrierImplicit | SyncRegionKind::BarrierImplicitParallel => {
                    // Deprecated kind: some runtimes declare both values but
                    // still deliver the old one, sometimes without a
                    // codeptr. The parallel region's codeptr is the
                    // documented stand-in either way.
                    if kind == SyncRegionKind::BarrierImplicit {
                        warn_once!(
                            "deprecated enum ompt_sync_region_barrier_implicit encountered"
                        );
                    }
                    // Safety: see above; region objects outlive the team.
                    let ibarrier_codeptr =
                        codeptr.or_else(|| unsafe { (*(*task).parallel_region).codeptr });
                    // Safety: task owned by the calling thread.
                    let region = unsafe {
                        self.sync_region_begin(task, ibarrier_codeptr, ToolEvent::ImplicitBarrier)
                    };
                    self.enter(region);
                }
                SyncRegionKind::BarrierExplicit => {
                    // Safety: see above.
                    let region =
                        unsafe { self.sync_region_begin(task, codeptr, ToolEvent::Barrier) };
                    self.enter(region);
                }
                SyncRegionKind::Taskwait => {
                    // Safety: see above.
                    let region =
                        unsafe { self.sync_region_begin(task, codeptr, ToolEvent::Taskwait) };
                    self.enter(region);
                }
                SyncRegionKind::Taskgroup => {
                    // Safety: see above.
                    let region =
                        unsafe { self.sync_region_begin(task, codeptr, ToolEvent::Taskgroup) };
                    self.enter(region);
                }
                SyncRegionKind::BarrierImplicitWorkshare => {
                    // Safety: see above.
                    let region = unsafe {
                        self.sync_region_begin(task, codeptr, ToolEvent::ImplicitBarrier)
                    };
                    self.enter(region);
                }
                SyncRegionKind::BarrierImplementation
                | SyncRegionKind::Reduction
                | SyncRegionKind::BarrierTeams => {
                    warn_once!("sync region kind {kind:?} not implemented yet");
                }
            },
            ScopeEndpoint::End => match kind {
                SyncRegionKind::Barrier => {
                    bug!("deprecated enum ompt_sync_region_barrier encountered");
                }
                SyncRegionKind::BarrierImplicit if !parallel_data.is_null() => {
                    // Deprecated kind with a binding region: implicit
                    // barrier of a workshare, a plain pop.
                    warn_once!("deprecated enum ompt_sync_region_barrier_implicit encountered");
                    // Safety: see above.
                    let region = unsafe { self.sync_region_end(task) };
                    self.exit(region);
                }
                SyncRegionKind::BarrierImplicit | SyncRegionKind::BarrierImplicitParallel => {
                    if kind == SyncRegionKind::BarrierImplicit {
                        warn_once!("deprecated enum ompt_sync_region_barrier_implicit encountered");
                    } else {
                        // OpenMP 5.2 requires no binding region for the
                        // implicit-parallel barrier end.
                        bug_on!(!parallel_data.is_null());
                    }
                    if self.finalizing_tool() {
                        // Safety: forwarded contract.
                        unsafe { self.barrier_implicit_parallel_end_finalize_tool(task_data) };
                    } else {
                        // Safety: forwarded contract.
                        unsafe { self.barrier_implicit_parallel_end(task_data) };
                    }
                }
                SyncRegionKind::BarrierExplicit
                | SyncRegionKind::Taskwait
                | SyncRegionKind::Taskgroup
                | SyncRegionKind::BarrierImplicitWorkshare => {
                    // Safety: see above.
                    let region = unsafe { self.sync_region_end(task) };
                    self.exit(region);
                }
                SyncRegionKind::BarrierImplementation
                | SyncRegionKind::Reduction
                | SyncRegionKind::BarrierTeams => {
                    warn_once!("sync region kind {kind:?} not implemented yet");
                }
            },
            ScopeEndpoint::BeginEnd => {
                bug!("scope beginend not allowed in sync_region callback");
            }
        }
    }

    /// Resolves and pushes the region for a sync construct.
    ///
    /// # Safety
    ///
    /// `task` must be owned by the calling thread.
    pub(crate) unsafe fn sync_region_begin(
        &self,
        task: *mut Task,
        codeptr: Option<NonZeroUsize>,
        event: ToolEvent,
    ) -> RegionHandle {
        let region = self.get_region(codeptr, event);
        // Safety: ownership per the function contract.
        unsafe { (*task).sync_regions.push(region) };
        region
    }

    /// Pops the region pushed by the matching sync begin.
    ///
    /// # Safety
    ///
    /// As [`Adapter::sync_region_begin`].
    pub(crate) unsafe fn sync_region_end(&self, task: *mut Task) -> RegionHandle {
        // Safety: ownership per the function contract.
        unsafe { (*task).sync_regions.pop() }
    }

    /// `ompt_callback_work`.
    ///
    /// # Safety
    ///
    /// `task_data` must carry a task pointer this adapter installed.
    pub unsafe fn work(
        &self,
        work_kind: WorkKind,
        endpoint: ScopeEndpoint,
        _parallel_data: *mut OmptData,
        task_data: *mut OmptData,
        count: u64,
        codeptr: Option<NonZeroUsize>,
    ) {
        let _guard = InMeasurement::enter();
        let atid = thread::adapter_tid();
        tracing::trace!(atid, ?work_kind, ?endpoint, count, "work");
        if !self.record_events() {
            tracing::trace!("event ignored (either PRE, or POST after finalize_tool)");
            return;
        }

        // Safety: slot validity per the function contract.
        let task = unsafe { (*task_data).ptr() }.cast::<Task>();
        bug_on!(task.is_null());
        // Safety: the task is owned by the calling thread while it runs.
        if unsafe { (*task).belongs_to_league } {
            warn_once!("OpenMP league workshare event detected; not handled yet");
            return;
        }

        match endpoint {
            ScopeEndpoint::Begin => match work_kind {
                kind if kind.is_loop() => {
                    // Safety: see above.
                    let region = unsafe { self.work_begin(task, codeptr, ToolEvent::Loop) };
                    self.enter(region);
                    if let Some(parameter) = self.loop_schedule_parameter() {
                        let location = self.current_location();
                        self.substrate().string_parameter(
                            &location,
                            parameter,
                            kind.schedule_name(),
                        );
                    }
                }
                WorkKind::Sections => {
                    // Safety: see above.
                    let region = unsafe { self.work_begin(task, codeptr, ToolEvent::Sections) };
                    self.enter(region);
                    // Safety: see above.
                    unsafe { (*task).dispatch_section = RegionHandle::INVALID };
                }
                WorkKind::SingleExecutor => {
                    // Two frames: the single construct and its structured
                    // block.
                    // Safety: see above.
                    unsafe {
                        let outer = self.work_begin(task, codeptr, ToolEvent::Single);
                        self.enter(outer);
                        let sblock = self.work_begin(task, codeptr, ToolEvent::SingleSblock);
                        self.enter(sblock);
                    }
                }
                WorkKind::SingleOther => {
                    // Safety: see above.
                    let region = unsafe { self.work_begin(task, codeptr, ToolEvent::Single) };
                    self.enter(region);
                }
                WorkKind::Workshare => {
                    // Safety: see above.
                    let region = unsafe { self.work_begin(task, codeptr, ToolEvent::Workshare) };
                    self.enter(region);
                }
                WorkKind::Distribute | WorkKind::Taskloop | WorkKind::Scope => {
                    warn_once!("work kind {work_kind:?} not implemented yet");
                }
                _ => unreachable!("loop kinds are matched by the guard above"),
            },
            ScopeEndpoint::End => match work_kind {
                kind if kind.is_loop() => {
                    // Safety: see above.
                    let region = unsafe { self.work_end(task) };
                    self.exit(region);
                }
                WorkKind::Sections => {
                    // Exit the last section; it was entered in the dispatch
                    // callback.
                    // Safety: see above.
                    unsafe {
                        if (*task).dispatch_section != RegionHandle::INVALID {
                            self.exit((*task).dispatch_section);
                            (*task).dispatch_section = RegionHandle::INVALID;
                        }
                        let region = self.work_end(task);
                        self.exit(region);
                    }
                }
                WorkKind::SingleExecutor => {
                    // Safety: see above.
                    unsafe {
                        let sblock = self.work_end(task);
                        self.exit(sblock);
                        let outer = self.work_end(task);
                        self.exit(outer);
                    }
                }
                WorkKind::SingleOther | WorkKind::Workshare => {
                    // Safety: see above.
                    let region = unsafe { self.work_end(task) };
                    self.exit(region);
                }
                WorkKind::Distribute | WorkKind::Taskloop | WorkKind::Scope => {
                    warn_once!("work kind {work_kind:?} not implemented yet");
                }
                _ => unreachable!("loop kinds are matched by the guard above"),
            },
            ScopeEndpoint::BeginEnd => {
                bug!("scope beginend not allowed in work callback");
            }
        }
    }

    /// Resolves and pushes the region for a workshare construct.
    ///
    /// # Safety
    ///
    /// `task` must be owned by the calling thread.
    pub(crate) unsafe fn work_begin(
        &self,
        task: *mut Task,
        codeptr: Option<NonZeroUsize>,
        event: ToolEvent,
    ) -> RegionHandle {
        let region = self.get_region(codeptr, event);
        // Safety: ownership per the function contract.
        unsafe { (*task).workshare_regions.push(region) };
        region
    }

    /// Pops the region pushed by the matching workshare begin.
    ///
    /// # Safety
    ///
    /// As [`Adapter::work_begin`].
    pub(crate) unsafe fn work_end(&self, task: *mut Task) -> RegionHandle {
        // Safety: ownership per the function contract.
        unsafe { (*task).workshare_regions.pop() }
    }

    /// `ompt_callback_masked`.
    ///
    /// # Safety
    ///
    /// `task_data` must carry a task pointer this adapter installed.
    pub unsafe fn masked(
        &self,
        endpoint: ScopeEndpoint,
        _parallel_data: *mut OmptData,
        task_data: *mut OmptData,
        codeptr: Option<NonZeroUsize>,
    ) {
        let _guard = InMeasurement::enter();
        let atid = thread::adapter_tid();
        tracing::trace!(atid, ?endpoint, "masked");
        if !self.record_events() {
            tracing::trace!("event ignored (either PRE, or POST after finalize_tool)");
            return;
        }

        // Safety: slot validity per the function contract.
        let task = unsafe { (*task_data).ptr() }.cast::<Task>();
        bug_on!(task.is_null());
        // Safety: the task is owned by the calling thread while it runs.
        if unsafe { (*task).belongs_to_league } {
            warn_once!("OpenMP league masked event detected; not handled yet");
            return;
        }

        match endpoint {
            ScopeEndpoint::Begin => {
                // Safety: see above.
                let region = unsafe { self.work_begin(task, codeptr, ToolEvent::Masked) };
                self.enter(region);
            }
            ScopeEndpoint::End => {
                // Safety: see above.
                let region = unsafe { self.work_end(task) };
                self.exit(region);
            }
            ScopeEndpoint::BeginEnd => {
                bug!("scope beginend not allowed in masked callback");
            }
        }
    }

    /// `ompt_callback_dispatch`.
    ///
    /// Only section dispatch is reported: each dispatch enters the new
    /// section and exits the previous one (the last section is closed by
    /// sections-end).
    ///
    /// # Safety
    ///
    /// `task_data` must carry a task pointer this adapter installed.
    pub unsafe fn dispatch(
        &self,
        _parallel_data: *mut OmptData,
        task_data: *mut OmptData,
        kind: DispatchKind,
        instance: OmptData,
    ) {
        let _guard = InMeasurement::enter();
        let atid = thread::adapter_tid();
        tracing::trace!(atid, ?kind, instance = instance.value(), "dispatch");
        if !self.record_events() {
            tracing::trace!("event ignored (either PRE, or POST after finalize_tool)");
            return;
        }

        // Safety: slot validity per the function contract.
        let task = unsafe { (*task_data).ptr() }.cast::<Task>();
        bug_on!(task.is_null());
        // Safety: the task is owned by the calling thread while it runs.
        if unsafe { (*task).belongs_to_league } {
            warn_once!("OpenMP league dispatch event detected; not handled yet");
            return;
        }

        match kind {
            DispatchKind::Section => {
                // Safety: see above.
                unsafe {
                    if (*task).dispatch_section != RegionHandle::INVALID {
                        self.exit((*task).dispatch_section);
                    }
                    let codeptr = NonZeroUsize::new(instance.ptr().addr());
                    (*task).dispatch_section = self.get_region(codeptr, ToolEvent::Section);
                    self.enter((*task).dispatch_section);
                }
            }
            DispatchKind::Iteration
            | DispatchKind::WsLoopChunk
            | DispatchKind::TaskloopChunk
            | DispatchKind::DistributeChunk => {
                warn_once!("dispatch kind {kind:?} not implemented yet");
            }
        }
    }

    /// `ompt_callback_flush`. No duration is available; the region enters
    /// and exits at one timestamp.
    ///
    /// # Safety
    ///
    /// `thread_data` must be the runtime's slot for the flushing thread.
    pub unsafe fn flush(&self, thread_data: *mut OmptData, codeptr: Option<NonZeroUsize>) {
        let _guard = InMeasurement::enter();
        // Safety: slot validity per the function contract.
        tracing::trace!(atid = unsafe { (*thread_data).value() }, "flush");
        if !self.record_events() {
            tracing::trace!("event ignored (either PRE, or POST after finalize_tool)");
            return;
        }

        let region = self.get_region(codeptr, ToolEvent::Flush);
        let location = self.current_location();
        let timestamp = self.now();
        self.enter_at(&location, timestamp, region);
        self.exit_at(&location, timestamp, region);
    }
}
