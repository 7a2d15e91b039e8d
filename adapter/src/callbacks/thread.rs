// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Thread begin/end.

use crate::macros::bug_on;
use crate::mgmt::Adapter;
use crate::sys::{OmptData, ThreadKind};
use crate::thread::{self, InMeasurement};

impl Adapter {
    /// `ompt_callback_thread_begin`.
    ///
    /// Assigns the adapter thread id and, on the initial thread, sets up
    /// everything that must exist before any contention: the fallback and
    /// lock regions and the process-wide explicit-task word layout.
    ///
    /// # Safety
    ///
    /// `thread_data` must be the runtime's slot for the beginning thread,
    /// valid for the duration of the call.
    pub unsafe fn thread_begin(&self, thread_kind: ThreadKind, thread_data: *mut OmptData) {
        let _guard = InMeasurement::enter();

        bug_on!(thread::adapter_tid() != 0);
        let atid = self.next_adapter_tid();
        thread::set_adapter_tid(atid);
        // Safety: slot validity per the function contract.
        unsafe { (*thread_data).value = u64::from(atid) };

        if thread_kind == ThreadKind::Initial {
            thread::set_tpd(Some(self.substrate().initial_tpd()));
            // Create fallback and lock regions up front, uncontended.
            let _ = self.regions();
            // The new-task bit makes the task word odd; used by the first
            // task-schedule to identify a not-yet-started task.
            self.init_word_layout();
        }

        tracing::trace!(atid, ?thread_kind, "thread begin");
    }

    /// `ompt_callback_thread_end`.
    ///
    /// # Safety
    ///
    /// `thread_data` must be the runtime's slot for the ending thread.
    pub unsafe fn thread_end(&self, thread_data: *mut OmptData) {
        let _guard = InMeasurement::enter();
        // Safety: slot validity per the function contract.
        tracing::trace!(atid = unsafe { (*thread_data).value() }, "thread end");
    }
}
