// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Adapter lifecycle: process-wide state, the measurement gate and the
//! subsystem protocol.
//!
//! The OpenMP specification only allows registering callbacks from the
//! tool's initializer, which runs long before measurement begins and cannot
//! be undone at measurement end. Events must therefore be filtered by the
//! [`record_events`] gate instead: callbacks arriving before subsystem-begin
//! or after subsystem-end are discarded. Subsystem-end flips
//! [`finalizing_tool`] and asks the runtime to deliver all outstanding
//! events synchronously before the gate closes.
//!
//! [`record_events`]: Adapter::record_events
//! [`finalizing_tool`]: Adapter::finalizing_tool

use crate::encoding::WordLayout;
use crate::macros::{bug, bug_on};
use crate::mutex::MutexRegistry;
use crate::parallel::{Parallel, ParallelPool};
use crate::regions::Regions;
use crate::substrate::{Location, ParameterHandle, RegionHandle, Substrate};
use crate::sys::OmptData;
use crate::task::Task;
use core::fmt;
use core::num::NonZeroUsize;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicUsize, Ordering};
use omptrace_spin::RawMutex;
use std::sync::{Arc, OnceLock};

/// Task information obtained from the runtime's `ompt_get_task_info` entry
/// point at ancestor level 0.
pub struct TaskInfo {
    /// The current task's `task_data` slot.
    pub task_data: *mut OmptData,
    /// The calling thread's number within its team.
    pub thread_num: u32,
}

/// Runtime entry points looked up during tool initialization.
pub struct RuntimeEntryPoints {
    /// `ompt_get_task_info`; `None` signals the runtime had no task at the
    /// requested ancestor level.
    pub get_task_info: Box<dyn Fn(u32) -> Option<TaskInfo> + Send + Sync>,
    /// `ompt_finalize_tool`: delivers all outstanding events synchronously.
    pub finalize_tool: Box<dyn Fn() + Send + Sync>,
}

/// Error returned by the subsystem hooks.
#[derive(Debug, PartialEq, Eq)]
pub enum SubsystemError {
    /// A subsystem id was assigned twice.
    AlreadyRegistered,
}

impl fmt::Display for SubsystemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyRegistered => f.write_str("subsystem already registered"),
        }
    }
}

impl std::error::Error for SubsystemError {}

/// Process-wide adapter state.
///
/// One instance lives behind the C entry point for real measurements; tests
/// construct their own against a recording substrate.
pub struct Adapter {
    substrate: Arc<dyn Substrate>,

    subsystem_id: AtomicUsize,
    tool_initialized: AtomicBool,
    record_events: AtomicBool,
    finalizing_tool: AtomicBool,

    /// Source of adapter thread ids; the first thread gets 1.
    thread_counter: AtomicU32,

    /// Process-wide explicit-task word layout, fixed once the initial
    /// thread reports the substrate's definition-id width.
    word_layout: OnceLock<WordLayout>,
    /// Fallback/lock regions and the codeptr cache, built on the initial
    /// thread before any contention.
    regions: OnceLock<Regions>,
    pub(crate) mutexes: MutexRegistry,
    pub(crate) parallel_pool: ParallelPool,

    /// The initial thread's initial task, set at its first
    /// implicit-task-begin. Null doubles as "not yet initialized".
    pub(crate) initial_task: AtomicPtr<Task>,
    /// The implicit parallel region surrounding the whole program.
    pub(crate) implicit_parallel: AtomicPtr<Parallel>,
    /// First non-league parallel-begin runs in serial context and registers
    /// the encountering task on the initial location.
    pub(crate) first_parallel_encountered: AtomicBool,

    runtime: OnceLock<RuntimeEntryPoints>,
    loop_schedule_parameter: OnceLock<ParameterHandle>,

    /// Serializes per-team cleanup when the runtime delivers leftover events
    /// from `finalize_tool` on arbitrary threads.
    pub(crate) finalize_team_cleanup: RawMutex,
}

// === impl Adapter ===

impl Adapter {
    pub fn new(substrate: Arc<dyn Substrate>) -> Self {
        Self {
            substrate,
            subsystem_id: AtomicUsize::new(usize::MAX),
            tool_initialized: AtomicBool::new(false),
            record_events: AtomicBool::new(false),
            finalizing_tool: AtomicBool::new(false),
            thread_counter: AtomicU32::new(0),
            word_layout: OnceLock::new(),
            regions: OnceLock::new(),
            mutexes: MutexRegistry::new(),
            parallel_pool: ParallelPool::new(),
            initial_task: AtomicPtr::new(core::ptr::null_mut()),
            implicit_parallel: AtomicPtr::new(core::ptr::null_mut()),
            first_parallel_encountered: AtomicBool::new(false),
            runtime: OnceLock::new(),
            loop_schedule_parameter: OnceLock::new(),
            finalize_team_cleanup: RawMutex::new(),
        }
    }

    // --- tool lifecycle ---

    /// The tool initializer: stores the runtime entry points looked up via
    /// the runtime's lookup function and registers auxiliary definitions.
    /// Callback registration itself happens in the FFI layer.
    pub fn initialize_tool(&self, runtime: RuntimeEntryPoints) {
        if self.runtime.set(runtime).is_err() {
            bug!("tool initialized twice");
        }
        let _ = self
            .loop_schedule_parameter
            .set(self.substrate.new_parameter("schedule"));
        self.tool_initialized.store(true, Ordering::SeqCst);
        tracing::debug!("tool initialized");
    }

    pub fn tool_initialized(&self) -> bool {
        self.tool_initialized.load(Ordering::SeqCst)
    }

    // --- gates ---

    /// Whether events are currently forwarded to the substrate. False
    /// before subsystem-begin and after subsystem-end (except for events
    /// triggered from inside subsystem-end's `finalize_tool`).
    #[inline]
    pub fn record_events(&self) -> bool {
        self.record_events.load(Ordering::Relaxed)
    }

    /// Whether subsystem-end is currently draining leftover runtime events.
    #[inline]
    pub(crate) fn finalizing_tool(&self) -> bool {
        self.finalizing_tool.load(Ordering::Relaxed)
    }

    // --- subsystem protocol ---

    /// Stores the subsystem id assigned by the measurement core.
    pub fn subsystem_register(&self, id: usize) -> Result<(), SubsystemError> {
        if self
            .subsystem_id
            .compare_exchange(usize::MAX, id, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SubsystemError::AlreadyRegistered);
        }
        tracing::debug!(id, "subsystem registered");
        Ok(())
    }

    /// Registers the paradigm and its team communicator template, and hooks
    /// the codeptr cache's unload notification into the address resolver.
    pub fn subsystem_init(&self) -> Result<(), SubsystemError> {
        tracing::debug!("register paradigm");
        self.substrate
            .register_paradigm("OpenMP", "Thread team ${id}");
        // The codeptr cache keeps shared-object addresses past dlclose;
        // unloads are only worth a warning.
        self.substrate
            .register_dlclose_callback(Box::new(crate::regions::dlclose_notification));
        Ok(())
    }

    /// Opens the measurement gate.
    pub fn subsystem_begin(&self) -> Result<(), SubsystemError> {
        tracing::debug!("start recording events");
        self.record_events.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Asks the runtime to flush outstanding events, then closes the gate.
    pub fn subsystem_end(&self) {
        if !self.tool_initialized() {
            tracing::debug!("tool wasn't initialized");
            return;
        }
        tracing::debug!("finalizing tool, might trigger overdue events");
        self.finalizing_tool.store(true, Ordering::SeqCst);
        (self.runtime().finalize_tool)();

        // Ignore subsequent events.
        self.record_events.store(false, Ordering::SeqCst);
        tracing::debug!("stop recording events");
    }

    /// Attaches the per-location adapter block to a new CPU location.
    pub fn subsystem_init_location(&self, location: &Location) -> Result<(), SubsystemError> {
        tracing::debug!(location = location.id(), "init location");
        let _ = location.subsystem_data();
        Ok(())
    }

    // --- shared state accessors ---

    pub(crate) fn substrate(&self) -> &dyn Substrate {
        &*self.substrate
    }

    pub(crate) fn runtime(&self) -> &RuntimeEntryPoints {
        let Some(runtime) = self.runtime.get() else {
            bug!("runtime entry points used before tool initialization");
        };
        runtime
    }

    pub(crate) fn regions(&self) -> &Regions {
        self.regions.get_or_init(|| Regions::new(&*self.substrate))
    }

    /// Initializes the process-wide explicit-task word layout; initial
    /// thread only.
    pub(crate) fn init_word_layout(&self) {
        let nbits = self.substrate.region_id_bit_width();
        let _ = self.word_layout.set(WordLayout::new(nbits));
    }

    pub(crate) fn word_layout(&self) -> &WordLayout {
        let Some(layout) = self.word_layout.get() else {
            bug!("explicit-task word layout used before the initial thread began");
        };
        layout
    }

    pub(crate) fn next_adapter_tid(&self) -> u32 {
        self.thread_counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn loop_schedule_parameter(&self) -> Option<ParameterHandle> {
        self.loop_schedule_parameter.get().copied()
    }

    // --- event emission helpers ---

    pub(crate) fn now(&self) -> u64 {
        self.substrate.clock_ticks()
    }

    pub(crate) fn current_location(&self) -> Arc<Location> {
        self.substrate.current_location()
    }

    pub(crate) fn get_region(
        &self,
        codeptr: Option<NonZeroUsize>,
        event: crate::regions::ToolEvent,
    ) -> RegionHandle {
        self.regions().get(&*self.substrate, codeptr, event)
    }

    pub(crate) fn lock_region(&self, event: crate::regions::LockEvent) -> RegionHandle {
        self.regions().lock_region(event)
    }

    /// Enter on the calling thread's location at the current time.
    pub(crate) fn enter(&self, region: RegionHandle) {
        let location = self.current_location();
        self.enter_at(&location, self.now(), region);
    }

    /// Exit on the calling thread's location at the current time.
    pub(crate) fn exit(&self, region: RegionHandle) {
        let location = self.current_location();
        self.exit_at(&location, self.now(), region);
    }

    pub(crate) fn enter_at(&self, location: &Location, timestamp: u64, region: RegionHandle) {
        self.substrate.enter_region(location, timestamp, region);
        location.note_timestamp(timestamp);
    }

    pub(crate) fn exit_at(&self, location: &Location, timestamp: u64, region: RegionHandle) {
        self.substrate.exit_region(location, timestamp, region);
        location.note_timestamp(timestamp);
    }

    // --- runtime introspection ---

    /// The task object of the callback's current task, via the runtime's
    /// `get_task_info` entry point.
    pub(crate) fn current_task(&self) -> *mut Task {
        let Some(info) = (self.runtime().get_task_info)(0) else {
            bug!("get_task_info reported no task at ancestor level 0");
        };
        bug_on!(info.task_data.is_null());
        // Safety: the runtime owns the slot and keeps it valid for the
        // duration of the callback.
        let task = unsafe { (*info.task_data).ptr() }.cast::<Task>();
        bug_on!(task.is_null());
        task
    }

    /// The calling thread's number within its team.
    pub(crate) fn current_thread_num(&self) -> u32 {
        let Some(info) = (self.runtime().get_task_info)(0) else {
            bug!("get_task_info reported no task at ancestor level 0");
        };
        info.thread_num
    }
}

impl fmt::Debug for Adapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Adapter")
            .field("tool_initialized", &self.tool_initialized())
            .field("record_events", &self.record_events())
            .field("finalizing_tool", &self.finalizing_tool())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::substrate::recording::RecordingSubstrate;

    #[test]
    fn subsystem_gate_protocol() {
        let substrate = Arc::new(RecordingSubstrate::new());
        let adapter = Adapter::new(substrate.clone());
        assert!(!adapter.record_events());
        adapter.subsystem_register(3).unwrap();
        assert_eq!(
            adapter.subsystem_register(4),
            Err(SubsystemError::AlreadyRegistered)
        );
        adapter.subsystem_init().unwrap();
        assert_eq!(
            substrate.registered_paradigm(),
            Some(("OpenMP".to_owned(), "Thread team ${id}".to_owned()))
        );
        assert!(substrate.dlclose_callback_registered());
        adapter.subsystem_begin().unwrap();
        assert!(adapter.record_events());
        // Without an initialized tool, subsystem-end leaves the gate alone.
        adapter.subsystem_end();
        assert!(adapter.record_events());
    }

    #[test]
    fn subsystem_end_flushes_and_closes_gate() {
        let adapter = Adapter::new(Arc::new(RecordingSubstrate::new()));
        let flushed = Arc::new(AtomicBool::new(false));
        let flushed2 = Arc::clone(&flushed);
        adapter.initialize_tool(RuntimeEntryPoints {
            get_task_info: Box::new(|_| None),
            finalize_tool: Box::new(move || flushed2.store(true, Ordering::SeqCst)),
        });
        adapter.subsystem_begin().unwrap();
        adapter.subsystem_end();
        assert!(flushed.load(Ordering::SeqCst));
        assert!(!adapter.record_events());
    }
}
