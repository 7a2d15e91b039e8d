// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Spin-based synchronization primitives for the omptrace adapter.
//!
//! Tool callbacks run on runtime-owned threads and must never park, so all
//! mutual exclusion in the adapter is spinning. Two flavors are provided:
//!
//! - [`RawMutex`], a bare atomic-bool lock with explicit [`lock`]/[`unlock`]
//!   that may be released by a thread other than the one that acquired it.
//!   The overdue-event protocol depends on exactly that: a location's order
//!   lock is taken on the thread that finishes an implicit barrier and
//!   released on whichever thread writes the final task-end.
//! - [`Mutex`], a conventional guard-based data mutex built on `lock_api`
//!   over the same raw lock, for state that has a single logical owner per
//!   critical section (e.g. free lists).
//!
//! [`lock`]: RawMutex::lock
//! [`unlock`]: RawMutex::unlock

#![cfg_attr(not(test), no_std)]

mod cache_padded;
mod loom;
mod raw_mutex;

pub use cache_padded::CachePadded;
pub use raw_mutex::{RawMutex, SpinWait};

/// A guard-based spin mutex over [`RawMutex`].
#[cfg(not(loom))]
pub type Mutex<T> = lock_api::Mutex<RawMutex, T>;

/// RAII guard returned by [`Mutex::lock`].
#[cfg(not(loom))]
pub type MutexGuard<'a, T> = lock_api::MutexGuard<'a, RawMutex, T>;

/// Wraps a `const fn` stripping the "constness" when compiled under loom.
///
/// `loom` works by tracking additional state alongside each type, so many
/// methods that are `const` in `core` cannot be `const` in `loom`.
#[macro_export]
macro_rules! loom_const_fn {
    (
        $(#[$meta:meta])*
        $vis:vis const fn $name:ident($($arg:ident: $T:ty),*) -> $Ret:ty $body:block
    ) => {
        $(#[$meta])*
        #[cfg(not(loom))]
        $vis const fn $name($($arg: $T),*) -> $Ret $body

        $(#[$meta])*
        #[cfg(loom)]
        $vis fn $name($($arg: $T),*) -> $Ret $body
    };
}
