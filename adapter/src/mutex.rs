// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Wait-id→mutex registry.
//!
//! The runtime identifies a mutex across acquire/acquired/released callbacks
//! by an integer wait-id. The lock sink wants a numeric lock id plus a
//! monotone acquisition order, so each `(wait_id, kind)` pair maps to a
//! [`MutexObj`] in a monotonic hash table. Locks could be removed at their
//! destroy callback, but critical and ordered constructs have no such event;
//! a limited number of mutexes is expected, so everything stays in the
//! inserts-only table and objects live for the whole measurement.

use crate::macros::bug;
use crate::substrate::RegionHandle;
use crate::sys::{MutexKind, WaitId};
use core::sync::atomic::{AtomicU32, Ordering};
use omptrace_chunk_table::{ChunkTable, hash_u64};
use omptrace_spin::RawMutex;

/// State for one runtime mutex (lock, nest lock, critical or ordered).
pub(crate) struct MutexObj {
    /// Lock id reported to the substrate.
    pub id: u32,
    /// Monotone per-mutex counter the substrate uses to reconstruct
    /// happens-before between acquisitions.
    acquisition_order: AtomicU32,
    /// Outer/sblock regions of the current holder; critical and ordered
    /// only. The acquired callback of the next holder may overwrite these,
    /// hence the release window below.
    outer_region: AtomicU32,
    sblock_region: AtomicU32,
    /// Nest locks only.
    nest_level: AtomicU32,
    /// Held from acquired to released so the acquisition order read at the
    /// release matches the acquire even when the lock was immediately
    /// re-acquired by another thread.
    pub in_release_operation: RawMutex,
}

// === impl MutexObj ===

impl MutexObj {
    fn new(id: u32) -> &'static MutexObj {
        Box::leak(Box::new(MutexObj {
            id,
            acquisition_order: AtomicU32::new(0),
            outer_region: AtomicU32::new(RegionHandle::INVALID.id()),
            sblock_region: AtomicU32::new(RegionHandle::INVALID.id()),
            nest_level: AtomicU32::new(0),
            in_release_operation: RawMutex::new(),
        }))
    }

    /// Increments and returns the acquisition order. Caller holds
    /// `in_release_operation`.
    pub(crate) fn next_acquisition(&self) -> u32 {
        let order = self.acquisition_order.load(Ordering::Relaxed) + 1;
        self.acquisition_order.store(order, Ordering::Relaxed);
        order
    }

    pub(crate) fn acquisition_order(&self) -> u32 {
        self.acquisition_order.load(Ordering::Relaxed)
    }

    /// Nest level bookkeeping; guarded by the lock's own application-level
    /// exclusivity.
    pub(crate) fn nest_level(&self) -> u32 {
        self.nest_level.load(Ordering::Relaxed)
    }

    pub(crate) fn set_nest_level(&self, level: u32) {
        self.nest_level.store(level, Ordering::Relaxed);
    }

    /// Stashes the regions the released callback must exit.
    pub(crate) fn set_regions(&self, outer: RegionHandle, sblock: RegionHandle) {
        self.outer_region.store(outer.id(), Ordering::Relaxed);
        self.sblock_region.store(sblock.id(), Ordering::Relaxed);
    }

    pub(crate) fn outer_region(&self) -> RegionHandle {
        RegionHandle(self.outer_region.load(Ordering::Relaxed))
    }

    pub(crate) fn sblock_region(&self) -> RegionHandle {
        RegionHandle(self.sblock_region.load(Ordering::Relaxed))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MutexKey {
    wait_id: WaitId,
    kind: MutexKind,
}

fn mutex_key_hash(key: &MutexKey) -> u32 {
    hash_u64(key.wait_id, hash_u64(key.kind as u64, 0))
}

const MUTEX_HASH_BITS: u32 = 8;

/// The `(wait_id, kind)` → [`MutexObj`] registry.
pub(crate) struct MutexRegistry {
    table: ChunkTable<MutexKey, &'static MutexObj>,
    next_id: AtomicU32,
}

// === impl MutexRegistry ===

impl MutexRegistry {
    pub(crate) fn new() -> Self {
        Self {
            table: ChunkTable::new(MUTEX_HASH_BITS, mutex_key_hash),
            next_id: AtomicU32::new(0),
        }
    }

    /// The mutex object for `(wait_id, kind)`, created on first sight.
    pub(crate) fn get_or_insert(&self, wait_id: WaitId, kind: MutexKind) -> &'static MutexObj {
        let key = MutexKey { wait_id, kind };
        let (mutex, _) = self.table.get_or_insert(key, |_| {
            MutexObj::new(self.next_id.fetch_add(1, Ordering::SeqCst))
        });
        mutex
    }

    /// The mutex object for `(wait_id, kind)`; it must have been inserted by
    /// an earlier init/acquired callback.
    pub(crate) fn get(&self, wait_id: WaitId, kind: MutexKind) -> &'static MutexObj {
        let key = MutexKey { wait_id, kind };
        let Some(mutex) = self.table.get(&key) else {
            bug!("mutex object for wait_id {wait_id} not in hash table, but should be");
        };
        mutex
    }
}
