// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Error-signaling macros for the callback paths.
//!
//! The tool-callback interface has no return channel, so a violated protocol
//! invariant cannot be reported upwards; measurement data would be corrupt
//! from that point on. `bug!`/`bug_on!` therefore abort via panic.
//! `warn_once!` is for conditions that are worth a log line exactly once per
//! process (unsupported runtime features, known-lossy fallbacks).

/// Aborts the measurement over a broken protocol invariant.
macro_rules! bug {
    ($($arg:tt)+) => {
        panic!("measurement protocol bug: {}", format_args!($($arg)+))
    };
}

/// Aborts the measurement if `cond` holds.
macro_rules! bug_on {
    ($cond:expr) => {
        if $cond {
            $crate::macros::bug!("{}", stringify!($cond));
        }
    };
    ($cond:expr, $($arg:tt)+) => {
        if $cond {
            $crate::macros::bug!($($arg)+);
        }
    };
}

/// Emits a `tracing` warning the first time this call site is hit.
macro_rules! warn_once {
    ($($arg:tt)+) => {{
        static WARNED: core::sync::atomic::AtomicBool =
            core::sync::atomic::AtomicBool::new(false);
        if !WARNED.swap(true, core::sync::atomic::Ordering::Relaxed) {
            tracing::warn!($($arg)+);
        }
    }};
}

pub(crate) use {bug, bug_on, warn_once};
