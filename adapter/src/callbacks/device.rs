// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Device callbacks. Offload measurement is out of scope; only the
//! initialization of a device is logged.

use crate::mgmt::Adapter;
use crate::thread::{self, InMeasurement};

impl Adapter {
    /// `ompt_callback_device_initialize`.
    pub fn device_initialize(&self, device_num: i32, device_type: &str) {
        let _guard = InMeasurement::enter();
        tracing::debug!(
            atid = thread::adapter_tid(),
            device_num,
            device_type,
            "device initialize"
        );
    }
}
