// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The simulated OpenMP runtime.
//!
//! The harness owns the `ompt_data_t` slots the real runtime would carry
//! between callbacks, provides `get_task_info` backed by a thread-local
//! "current task", and sequences simulated runtime threads with channels.

use crate::mgmt::{Adapter, RuntimeEntryPoints, TaskInfo};
use crate::substrate::recording::RecordingSubstrate;
use crate::sys::{OmptData, ScopeEndpoint, TaskFlags, ThreadKind};
use std::cell::{Cell, UnsafeCell};
use std::ptr;
use std::sync::Arc;
use std::sync::mpsc::{Receiver, Sender, channel};

/// A runtime-owned opaque data slot, shareable between simulated runtime
/// threads the way the real runtime shares `parallel_data`.
pub(crate) struct Slot(UnsafeCell<OmptData>);

// Safety: tests synchronize slot access through the harness sequencing,
// mirroring the runtime's own guarantees.
unsafe impl Sync for Slot {}
// Safety: see above.
unsafe impl Send for Slot {}

// === impl Slot ===

impl Slot {
    pub(crate) fn new() -> Self {
        Self(UnsafeCell::new(OmptData::NONE))
    }

    pub(crate) fn get(&self) -> *mut OmptData {
        self.0.get()
    }

    pub(crate) fn value(&self) -> u64 {
        // Safety: plain read of the 64-bit slot.
        unsafe { (*self.get()).value() }
    }

    pub(crate) fn ptr_value(&self) -> *mut core::ffi::c_void {
        // Safety: plain read of the 64-bit slot.
        unsafe { (*self.get()).ptr() }
    }
}

thread_local! {
    static CURRENT_TASK_DATA: Cell<*mut OmptData> = const { Cell::new(ptr::null_mut()) };
    static CURRENT_THREAD_NUM: Cell<u32> = const { Cell::new(0) };
}

/// Declares which task the runtime would report for `get_task_info` on this
/// thread.
pub(crate) fn set_current_task(task_data: *mut OmptData, thread_num: u32) {
    CURRENT_TASK_DATA.with(|c| c.set(task_data));
    CURRENT_THREAD_NUM.with(|c| c.set(thread_num));
}

/// Entry points backed by the harness thread-locals, with a custom
/// `finalize_tool`.
pub(crate) fn runtime_entries_with_finalize(
    finalize: impl Fn() + Send + Sync + 'static,
) -> RuntimeEntryPoints {
    RuntimeEntryPoints {
        get_task_info: Box::new(|_ancestor_level| {
            let task_data = CURRENT_TASK_DATA.with(Cell::get);
            if task_data.is_null() {
                return None;
            }
            Some(TaskInfo {
                task_data,
                thread_num: CURRENT_THREAD_NUM.with(Cell::get),
            })
        }),
        finalize_tool: Box::new(finalize),
    }
}

pub(crate) fn runtime_entries() -> RuntimeEntryPoints {
    runtime_entries_with_finalize(|| {})
}

pub(crate) struct Fixture {
    pub(crate) substrate: Arc<RecordingSubstrate>,
    pub(crate) adapter: Arc<Adapter>,
}

// === impl Fixture ===

impl Fixture {
    /// Substrate + adapter, tool not yet initialized.
    pub(crate) fn new() -> Self {
        let substrate = Arc::new(RecordingSubstrate::new());
        let adapter = Arc::new(Adapter::new(substrate.clone()));
        Self { substrate, adapter }
    }

    /// The common setup: tool initialized with harness entry points,
    /// subsystem registered and recording.
    pub(crate) fn started() -> Self {
        let fixture = Self::new();
        fixture.adapter.initialize_tool(runtime_entries());
        fixture.start();
        fixture
    }

    pub(crate) fn start(&self) {
        self.adapter.subsystem_register(0).unwrap();
        self.adapter.subsystem_init().unwrap();
        self.adapter.subsystem_begin().unwrap();
    }

    /// Runs thread-begin and the initial implicit-task-begin on the calling
    /// thread, returning the initial task's slots.
    ///
    /// The slots are boxed so their addresses survive moves of the
    /// returned pair.
    pub(crate) fn begin_initial_thread(&self) -> (Box<Slot>, Box<Slot>) {
        let thread_data = Box::new(Slot::new());
        let initial_task_data = Box::new(Slot::new());
        let initial_parallel_data = Box::new(Slot::new());
        // Safety: harness-owned slots, valid for the call.
        unsafe {
            self.adapter
                .thread_begin(ThreadKind::Initial, thread_data.get());
            self.adapter.implicit_task(
                ScopeEndpoint::Begin,
                initial_parallel_data.get(),
                initial_task_data.get(),
                1,
                0,
                TaskFlags::INITIAL,
            );
        }
        set_current_task(initial_task_data.get(), 0);
        (initial_task_data, initial_parallel_data)
    }

    /// Asserts that every location's event stream is in nondecreasing
    /// timestamp order.
    pub(crate) fn assert_timestamp_order(&self) {
        for location in self.substrate.locations() {
            let timestamps = self.substrate.timestamps_for(location);
            assert!(
                timestamps.windows(2).all(|pair| pair[0] <= pair[1]),
                "location {location} violates timestamp order: {timestamps:?}"
            );
        }
    }
}

/// A two-party step sequencer: each `step` call unblocks the other side's
/// matching `wait`.
pub(crate) struct Sequencer {
    tx: Sender<&'static str>,
    rx: Receiver<&'static str>,
}

// === impl Sequencer ===

impl Sequencer {
    pub(crate) fn pair() -> (Sequencer, Sequencer) {
        let (tx_a, rx_b) = channel();
        let (tx_b, rx_a) = channel();
        (
            Sequencer { tx: tx_a, rx: rx_a },
            Sequencer { tx: tx_b, rx: rx_b },
        )
    }

    /// Signals the peer that `label` is done.
    pub(crate) fn signal(&self, label: &'static str) {
        self.tx.send(label).unwrap();
    }

    /// Blocks until the peer signals `label`.
    pub(crate) fn wait(&self, label: &'static str) {
        let got = self.rx.recv().unwrap();
        assert_eq!(got, label, "steps out of order");
    }
}

