// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A recording substrate for the protocol tests.
//!
//! Plays the measurement core: hands out deterministic handles, a strictly
//! increasing fake clock, one location per OS thread, and records every
//! sink call per location so tests can assert exact event sequences.

use crate::substrate::{
    DlcloseCallback, Location, ParameterHandle, RegionDescriptor, RegionHandle, ResolvedAddress,
    SourceFileHandle, Substrate, SubstrateTask, TeamBegin, Tpd,
};
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Event {
    Enter {
        timestamp: u64,
        region: RegionHandle,
    },
    Exit {
        timestamp: u64,
        region: RegionHandle,
    },
    StringParameter {
        parameter: ParameterHandle,
        value: String,
    },
    Fork {
        timestamp: u64,
        requested_parallelism: u32,
    },
    Join {
        timestamp: u64,
    },
    TeamBegin {
        timestamp: u64,
        index: u32,
        team_size: u32,
        parent: Tpd,
        tpd: Tpd,
    },
    TeamEnd {
        timestamp: u64,
        tpd: Tpd,
        index: u32,
        team_size: u32,
    },
    TaskCreate {
        thread_num: u32,
        generation: u32,
    },
    TaskBegin {
        region: RegionHandle,
        thread_num: u32,
        generation: u32,
        task: SubstrateTask,
    },
    TaskSwitch {
        task: SubstrateTask,
    },
    TaskEnd {
        region: RegionHandle,
        task: SubstrateTask,
    },
    AcquireLock {
        id: u32,
        acquisition_order: u32,
    },
    ReleaseLock {
        id: u32,
        acquisition_order: u32,
    },
}

impl Event {
    fn timestamp(&self) -> Option<u64> {
        match self {
            Event::Enter { timestamp, .. }
            | Event::Exit { timestamp, .. }
            | Event::Fork { timestamp, .. }
            | Event::Join { timestamp }
            | Event::TeamBegin { timestamp, .. }
            | Event::TeamEnd { timestamp, .. } => Some(*timestamp),
            _ => None,
        }
    }
}

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Current location per (substrate instance, thread).
    static CURRENT_LOCATION: RefCell<HashMap<u64, Arc<Location>>> =
        RefCell::new(HashMap::new());
}

pub(crate) struct RecordingSubstrate {
    instance: u64,
    clock: AtomicU64,
    next_location: AtomicU32,
    next_region: AtomicU32,
    next_tpd: AtomicU64,
    next_task: AtomicU64,
    region_names: Mutex<HashMap<RegionHandle, String>>,
    source_files: Mutex<Vec<String>>,
    parameters: Mutex<Vec<String>>,
    addresses: Mutex<HashMap<usize, ResolvedAddress>>,
    paradigm: Mutex<Option<(String, String)>>,
    dlclose: Mutex<Option<DlcloseCallback>>,
    events: Mutex<Vec<(u32, Event)>>,
}

// === impl RecordingSubstrate ===

impl RecordingSubstrate {
    pub(crate) fn new() -> Self {
        Self {
            instance: NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed),
            clock: AtomicU64::new(0),
            next_location: AtomicU32::new(0),
            next_region: AtomicU32::new(1),
            // Tpd(1) is the initial thread.
            next_tpd: AtomicU64::new(2),
            next_task: AtomicU64::new(1),
            region_names: Mutex::new(HashMap::new()),
            source_files: Mutex::new(Vec::new()),
            parameters: Mutex::new(Vec::new()),
            addresses: Mutex::new(HashMap::new()),
            paradigm: Mutex::new(None),
            dlclose: Mutex::new(None),
            events: Mutex::new(Vec::new()),
        }
    }

    /// Teaches the fake address resolver a source position.
    pub(crate) fn map_address(&self, addr: usize, path: &str, line: u32) {
        self.addresses.lock().unwrap().insert(
            addr,
            ResolvedAddress {
                path: path.to_owned(),
                line,
            },
        );
    }

    pub(crate) fn region_name(&self, region: RegionHandle) -> String {
        self.region_names
            .lock()
            .unwrap()
            .get(&region)
            .cloned()
            .unwrap_or_else(|| format!("<region {}>", region.id()))
    }

    pub(crate) fn registered_paradigm(&self) -> Option<(String, String)> {
        self.paradigm.lock().unwrap().clone()
    }

    pub(crate) fn dlclose_callback_registered(&self) -> bool {
        self.dlclose.lock().unwrap().is_some()
    }

    /// Plays the address resolver unloading a shared object.
    pub(crate) fn notify_dlclose(&self, so_file_name: &str) {
        let dlclose = self.dlclose.lock().unwrap();
        if let Some(callback) = dlclose.as_ref() {
            callback(so_file_name);
        }
    }

    /// All events recorded for `location`, in emission order.
    pub(crate) fn events_for(&self, location: u32) -> Vec<Event> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(loc, _)| *loc == location)
            .map(|(_, event)| event.clone())
            .collect()
    }

    /// Human-readable event sequence for `location`, for compact
    /// assertions.
    pub(crate) fn summary_for(&self, location: u32) -> Vec<String> {
        self.events_for(location)
            .iter()
            .map(|event| match event {
                Event::Enter { region, .. } => format!("enter {}", self.region_name(*region)),
                Event::Exit { region, .. } => format!("exit {}", self.region_name(*region)),
                Event::StringParameter { value, .. } => format!("parameter {value}"),
                Event::Fork {
                    requested_parallelism,
                    ..
                } => format!("fork({requested_parallelism})"),
                Event::Join { .. } => "join".to_owned(),
                Event::TeamBegin { index, .. } => format!("team_begin({index})"),
                Event::TeamEnd { index, .. } => format!("team_end({index})"),
                Event::TaskCreate {
                    thread_num,
                    generation,
                } => format!("task_create({thread_num},{generation})"),
                Event::TaskBegin {
                    region,
                    thread_num,
                    generation,
                    ..
                } => format!(
                    "task_begin({},{thread_num},{generation})",
                    self.region_name(*region)
                ),
                Event::TaskSwitch { .. } => "task_switch".to_owned(),
                Event::TaskEnd { region, .. } => {
                    format!("task_end({})", self.region_name(*region))
                }
                Event::AcquireLock {
                    id,
                    acquisition_order,
                } => format!("acquire_lock({id},{acquisition_order})"),
                Event::ReleaseLock {
                    id,
                    acquisition_order,
                } => format!("release_lock({id},{acquisition_order})"),
            })
            .collect()
    }

    /// Timestamps of the timestamped events on `location`, in emission
    /// order.
    pub(crate) fn timestamps_for(&self, location: u32) -> Vec<u64> {
        self.events_for(location)
            .iter()
            .filter_map(Event::timestamp)
            .collect()
    }

    /// Ids of all locations that recorded at least one event.
    pub(crate) fn locations(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self
            .events
            .lock()
            .unwrap()
            .iter()
            .map(|(loc, _)| *loc)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    fn record(&self, location: &Location, event: Event) {
        self.events.lock().unwrap().push((location.id(), event));
    }
}

impl Substrate for RecordingSubstrate {
    fn new_source_file(&self, name: &str) -> SourceFileHandle {
        let mut files = self.source_files.lock().unwrap();
        if let Some(idx) = files.iter().position(|f| f == name) {
            return SourceFileHandle(idx as u32 + 1);
        }
        files.push(name.to_owned());
        SourceFileHandle(files.len() as u32)
    }

    fn new_region(&self, region: &RegionDescriptor<'_>) -> RegionHandle {
        let handle = RegionHandle(self.next_region.fetch_add(1, Ordering::Relaxed));
        self.region_names
            .lock()
            .unwrap()
            .insert(handle, region.name.to_owned());
        handle
    }

    fn new_parameter(&self, name: &str) -> ParameterHandle {
        let mut parameters = self.parameters.lock().unwrap();
        parameters.push(name.to_owned());
        ParameterHandle(parameters.len() as u32)
    }

    fn region_id_bit_width(&self) -> u8 {
        32
    }

    fn register_paradigm(&self, name: &str, communicator_template: &str) {
        *self.paradigm.lock().unwrap() =
            Some((name.to_owned(), communicator_template.to_owned()));
    }

    fn clock_ticks(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn current_location(&self) -> Arc<Location> {
        CURRENT_LOCATION.with(|current| {
            current
                .borrow_mut()
                .entry(self.instance)
                .or_insert_with(|| {
                    Location::new(self.next_location.fetch_add(1, Ordering::SeqCst))
                })
                .clone()
        })
    }

    fn initial_tpd(&self) -> Tpd {
        Tpd(1)
    }

    fn enter_region(&self, location: &Location, timestamp: u64, region: RegionHandle) {
        self.record(location, Event::Enter { timestamp, region });
    }

    fn exit_region(&self, location: &Location, timestamp: u64, region: RegionHandle) {
        self.record(location, Event::Exit { timestamp, region });
    }

    fn string_parameter(&self, location: &Location, parameter: ParameterHandle, value: &str) {
        self.record(
            location,
            Event::StringParameter {
                parameter,
                value: value.to_owned(),
            },
        );
    }

    fn fork(&self, location: &Location, timestamp: u64, requested_parallelism: u32) {
        self.record(
            location,
            Event::Fork {
                timestamp,
                requested_parallelism,
            },
        );
    }

    fn join(&self, location: &Location, timestamp: u64) -> Tpd {
        self.record(location, Event::Join { timestamp });
        Tpd(self.next_tpd.fetch_add(1, Ordering::SeqCst))
    }

    fn team_begin(
        &self,
        location: &Location,
        timestamp: u64,
        index: u32,
        team_size: u32,
        parent: Tpd,
    ) -> TeamBegin {
        let tpd = Tpd(self.next_tpd.fetch_add(1, Ordering::SeqCst));
        let task = SubstrateTask(self.next_task.fetch_add(1, Ordering::SeqCst));
        self.record(
            location,
            Event::TeamBegin {
                timestamp,
                index,
                team_size,
                parent,
                tpd,
            },
        );
        TeamBegin { tpd, task }
    }

    fn team_end(&self, location: &Location, timestamp: u64, tpd: Tpd, index: u32, team_size: u32) {
        self.record(
            location,
            Event::TeamEnd {
                timestamp,
                tpd,
                index,
                team_size,
            },
        );
    }

    fn task_create(&self, location: &Location, thread_num: u32, generation: u32) {
        self.record(
            location,
            Event::TaskCreate {
                thread_num,
                generation,
            },
        );
    }

    fn task_begin(
        &self,
        location: &Location,
        region: RegionHandle,
        thread_num: u32,
        generation: u32,
    ) -> SubstrateTask {
        let task = SubstrateTask(self.next_task.fetch_add(1, Ordering::SeqCst));
        self.record(
            location,
            Event::TaskBegin {
                region,
                thread_num,
                generation,
                task,
            },
        );
        task
    }

    fn task_switch(&self, location: &Location, task: SubstrateTask) {
        self.record(location, Event::TaskSwitch { task });
    }

    fn task_end(&self, location: &Location, region: RegionHandle, task: SubstrateTask) {
        self.record(location, Event::TaskEnd { region, task });
    }

    fn acquire_lock(&self, location: &Location, id: u32, acquisition_order: u32) {
        self.record(
            location,
            Event::AcquireLock {
                id,
                acquisition_order,
            },
        );
    }

    fn release_lock(&self, location: &Location, id: u32, acquisition_order: u32) {
        self.record(
            location,
            Event::ReleaseLock {
                id,
                acquisition_order,
            },
        );
    }

    fn resolve_address(&self, addr: usize) -> Option<ResolvedAddress> {
        self.addresses.lock().unwrap().get(&addr).cloned()
    }

    fn register_dlclose_callback(&self, callback: DlcloseCallback) {
        *self.dlclose.lock().unwrap() = Some(callback);
    }
}
