// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The seam between the adapter and the measurement substrate.
//!
//! The adapter itself is only a translator: it turns runtime callbacks into
//! calls on [`Substrate`], which owns definitions, locations, the clock and
//! the actual event sinks. Everything behind this trait is out of scope for
//! the adapter; tests implement it with a recorder.

use crate::location::CpuLocationData;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

#[cfg(test)]
pub(crate) mod recording;

/// Handle to a region definition. Id 0 is the invalid/sentinel handle; it
/// doubles as the "undeferred" marker inside the explicit-task word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegionHandle(pub u32);

impl RegionHandle {
    pub const INVALID: RegionHandle = RegionHandle(0);

    #[inline]
    #[must_use]
    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }

    /// The raw definition id, as packed into the explicit-task word.
    #[inline]
    #[must_use]
    pub fn id(self) -> u32 {
        self.0
    }
}

/// Handle to a source-file definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceFileHandle(pub u32);

impl SourceFileHandle {
    pub const INVALID: SourceFileHandle = SourceFileHandle(0);
}

/// Handle to a parameter definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParameterHandle(pub u32);

/// Thread-private data: the substrate's notion of a thread in the fork-join
/// tree. Opaque to the adapter; passed from `team_begin`/`join` back into
/// later threading calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tpd(pub u64);

/// The substrate's task object, returned by `team_begin`/`task_begin` and
/// consumed by `task_switch`/`task_end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubstrateTask(pub u64);

/// Region classification carried into the definition registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegionKind {
    Unknown,
    Parallel,
    ImplicitBarrier,
    Barrier,
    Single,
    SingleSblock,
    Task,
    TaskUntied,
    TaskCreate,
    Loop,
    Sections,
    Section,
    Workshare,
    Masked,
    Critical,
    CriticalSblock,
    Ordered,
    OrderedSblock,
    Flush,
    /// Runtime-library entry points (lock routines).
    Wrapper,
}

/// Everything needed to register a region definition.
#[derive(Debug, Clone, Copy)]
pub struct RegionDescriptor<'a> {
    pub name: &'a str,
    /// Demangled/unique name; `None` means same as `name`.
    pub canonical_name: Option<&'a str>,
    pub file: SourceFileHandle,
    /// 0 means unknown.
    pub begin_line: u32,
    pub kind: RegionKind,
}

/// Result of activating a team member on a location.
#[derive(Debug, Clone, Copy)]
pub struct TeamBegin {
    pub tpd: Tpd,
    pub task: SubstrateTask,
}

/// A source position resolved from a return address.
#[derive(Debug, Clone)]
pub struct ResolvedAddress {
    pub path: String,
    pub line: u32,
}

/// Callback invoked when a shared object is unloaded; receives the
/// object's file name.
pub type DlcloseCallback = Box<dyn Fn(&str) + Send + Sync>;

/// A CPU location: the per-thread event stream the substrate writes to.
///
/// Locations are created and owned by the substrate; the adapter attaches
/// its per-location [`CpuLocationData`] block through the subsystem slot and
/// otherwise treats locations as opaque ordering domains.
pub struct Location {
    id: u32,
    last_timestamp: AtomicU64,
    subsystem: OnceLock<Box<CpuLocationData>>,
}

// === impl Location ===

impl Location {
    #[must_use]
    pub fn new(id: u32) -> Arc<Location> {
        Arc::new(Location {
            id,
            last_timestamp: AtomicU64::new(0),
            subsystem: OnceLock::new(),
        })
    }

    #[inline]
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Timestamp of the last event written to this location.
    #[inline]
    #[must_use]
    pub fn last_timestamp(&self) -> u64 {
        self.last_timestamp.load(Ordering::Relaxed)
    }

    pub(crate) fn note_timestamp(&self, timestamp: u64) {
        self.last_timestamp.store(timestamp, Ordering::Relaxed);
    }

    /// The adapter's per-location block, attached on first use.
    pub(crate) fn subsystem_data(&self) -> &CpuLocationData {
        self.subsystem.get_or_init(CpuLocationData::new_boxed)
    }
}

impl fmt::Debug for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Location")
            .field("id", &self.id)
            .field("last_timestamp", &self.last_timestamp())
            .finish_non_exhaustive()
    }
}

/// The capability set the adapter consumes from the measurement substrate.
///
/// Calls that take an explicit [`Location`] and timestamp may target a
/// location other than the caller's (the overdue-event protocol emits a
/// team's missing exits from whichever thread notices them). The substrate
/// must invoke no adapter code from inside these sinks except where
/// documented ([`team_begin`] is preceded by the overdue-drain hook).
///
/// [`team_begin`]: Substrate::team_begin
pub trait Substrate: Send + Sync {
    // --- definitions ---

    fn new_source_file(&self, name: &str) -> SourceFileHandle;
    fn new_region(&self, region: &RegionDescriptor<'_>) -> RegionHandle;
    /// Registers a string-typed parameter.
    fn new_parameter(&self, name: &str) -> ParameterHandle;
    /// Bit width of region definition ids; bounds the region field of the
    /// explicit-task word.
    fn region_id_bit_width(&self) -> u8;
    /// Registers the fork-join paradigm and its team communicator template.
    fn register_paradigm(&self, name: &str, communicator_template: &str);

    // --- timer / locations ---

    /// Monotonic clock ticks.
    fn clock_ticks(&self) -> u64;
    /// The calling thread's CPU location.
    fn current_location(&self) -> Arc<Location>;
    /// Thread-private data of the initial thread.
    fn initial_tpd(&self) -> Tpd;

    // --- event sink ---

    fn enter_region(&self, location: &Location, timestamp: u64, region: RegionHandle);
    fn exit_region(&self, location: &Location, timestamp: u64, region: RegionHandle);
    fn string_parameter(&self, location: &Location, parameter: ParameterHandle, value: &str);

    // --- threading sink ---

    fn fork(&self, location: &Location, timestamp: u64, requested_parallelism: u32);
    fn join(&self, location: &Location, timestamp: u64) -> Tpd;
    fn team_begin(
        &self,
        location: &Location,
        timestamp: u64,
        index: u32,
        team_size: u32,
        parent: Tpd,
    ) -> TeamBegin;
    fn team_end(&self, location: &Location, timestamp: u64, tpd: Tpd, index: u32, team_size: u32);

    // --- task sink ---

    fn task_create(&self, location: &Location, thread_num: u32, generation: u32);
    fn task_begin(
        &self,
        location: &Location,
        region: RegionHandle,
        thread_num: u32,
        generation: u32,
    ) -> SubstrateTask;
    fn task_switch(&self, location: &Location, task: SubstrateTask);
    fn task_end(&self, location: &Location, region: RegionHandle, task: SubstrateTask);

    // --- lock sink ---

    fn acquire_lock(&self, location: &Location, id: u32, acquisition_order: u32);
    fn release_lock(&self, location: &Location, id: u32, acquisition_order: u32);

    // --- address resolution ---

    /// Resolves a return address to a source position, if debug information
    /// is available.
    fn resolve_address(&self, addr: usize) -> Option<ResolvedAddress>;

    /// Registers a callback the address resolver invokes when a shared
    /// object is unloaded.
    fn register_dlclose_callback(&self, callback: DlcloseCallback);
}
