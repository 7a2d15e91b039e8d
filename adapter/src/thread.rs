// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Per-thread adapter state.
//!
//! Callbacks run on runtime-owned threads; the few values that bridge
//! callbacks on the same thread live here. None of this is ever read from
//! another thread.

use crate::substrate::Tpd;
use core::cell::Cell;

struct ThreadState {
    /// Adapter-local thread id, assigned at thread-begin starting at 1.
    /// 0 means the thread never saw thread-begin.
    atid: Cell<u32>,
    /// Thread-private data handle, bridging parallel-begin to
    /// implicit-task-begin on the encountering thread.
    tpd: Cell<Option<Tpd>>,
    /// Measurement-nesting depth of the current callback stack.
    in_measurement: Cell<u32>,
}

thread_local! {
    static THREAD: ThreadState = const {
        ThreadState {
            atid: Cell::new(0),
            tpd: Cell::new(None),
            in_measurement: Cell::new(0),
        }
    };
}

/// The calling thread's adapter thread id ("atid"); 0 if uninitialized.
pub(crate) fn adapter_tid() -> u32 {
    THREAD.with(|t| t.atid.get())
}

pub(crate) fn set_adapter_tid(atid: u32) {
    THREAD.with(|t| t.atid.set(atid));
}

pub(crate) fn tpd() -> Option<Tpd> {
    THREAD.with(|t| t.tpd.get())
}

pub(crate) fn set_tpd(tpd: Option<Tpd>) {
    THREAD.with(|t| t.tpd.set(tpd));
}

/// RAII marker for "this thread is inside a measurement callback".
pub(crate) struct InMeasurement(());

// === impl InMeasurement ===

impl InMeasurement {
    pub(crate) fn enter() -> Self {
        THREAD.with(|t| t.in_measurement.set(t.in_measurement.get() + 1));
        Self(())
    }
}

impl Drop for InMeasurement {
    fn drop(&mut self) {
        THREAD.with(|t| t.in_measurement.set(t.in_measurement.get() - 1));
    }
}
