// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Region definitions: codeptr→region cache, fallbacks and lock regions.
//!
//! Every construct the adapter reports is a region. When the runtime hands
//! us a return address we cache one region per `(address, construct)` pair
//! in a monotonic hash table, naming it after the resolved source position;
//! without an address the per-construct fallback region is used. Lock
//! runtime-entry regions (`omp_set_lock` …) are defined once up front and
//! shared by all locks.

use crate::substrate::{
    RegionDescriptor, RegionHandle, RegionKind, SourceFileHandle, Substrate,
};
use core::num::NonZeroUsize;
use omptrace_chunk_table::{ChunkTable, hash_u64};

/// The construct a region stands for; part of the codeptr cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub(crate) enum ToolEvent {
    Unknown = 0,
    Parallel,
    ImplicitBarrier,
    Single,
    SingleSblock,
    Task,
    TaskUntied,
    TaskCreate,
    Loop,
    Sections,
    Workshare,
    Taskwait,
    Taskgroup,
    Barrier,
    Masked,
    Critical,
    CriticalSblock,
    Ordered,
    OrderedSblock,
    Section,
    Flush,
}

impl ToolEvent {
    const COUNT: usize = ToolEvent::Flush as usize + 1;
}

/// `(name prefix, region kind)` per tool event, indexed by discriminant.
/// OpenMP 5.1+ would let us distinguish more barrier types.
const FALLBACKS: [(&str, RegionKind); ToolEvent::COUNT] = [
    ("!$omp unknown", RegionKind::Unknown),
    ("!$omp parallel", RegionKind::Parallel),
    ("!$omp implicit barrier", RegionKind::ImplicitBarrier),
    ("!$omp single", RegionKind::Single),
    ("!$omp single sblock", RegionKind::SingleSblock),
    ("!$omp task", RegionKind::Task),
    ("!$omp task untied", RegionKind::TaskUntied),
    ("!$omp create task", RegionKind::TaskCreate),
    ("!$omp for/do", RegionKind::Loop),
    ("!$omp sections", RegionKind::Sections),
    ("!$omp workshare", RegionKind::Workshare),
    ("!$omp taskwait", RegionKind::Barrier),
    ("!$omp taskgroup", RegionKind::Barrier),
    ("!$omp barrier", RegionKind::Barrier),
    ("!$omp masked", RegionKind::Masked),
    ("!$omp critical", RegionKind::Critical),
    ("!$omp critical sblock", RegionKind::CriticalSblock),
    ("!$omp ordered", RegionKind::Ordered),
    ("!$omp ordered sblock", RegionKind::OrderedSblock),
    ("!$omp section", RegionKind::Section),
    ("!$omp flush", RegionKind::Flush),
];

/// Lock runtime-entry events sharing one region each, like the classic
/// source-instrumentation tools do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum LockEvent {
    Init = 0,
    InitWithHint,
    Destroy,
    Set,
    Unset,
    Test,
    InitNest,
    InitNestWithHint,
    DestroyNest,
    SetNest,
    UnsetNest,
    TestNest,
}

impl LockEvent {
    const COUNT: usize = LockEvent::TestNest as usize + 1;
}

/// No leading `!$`, matching the runtime-library entry point names.
const LOCK_REGION_NAMES: [&str; LockEvent::COUNT] = [
    "omp_init_lock",
    "omp_init_lock_with_hint",
    "omp_destroy_lock",
    "omp_set_lock",
    "omp_unset_lock",
    "omp_test_lock",
    "omp_init_nest_lock",
    "omp_init_nest_lock_with_hint",
    "omp_destroy_nest_lock",
    "omp_set_nest_lock",
    "omp_unset_nest_lock",
    "omp_test_nest_lock",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CodeKey {
    addr: usize,
    event: ToolEvent,
}

fn code_key_hash(key: &CodeKey) -> u32 {
    hash_u64(key.addr as u64, hash_u64(key.event as u64, 0))
}

/// The hash table has 256 buckets; collisions chain through small chunks.
const CODEPTR_HASH_BITS: u32 = 8;

/// All region state: fallbacks, lock regions and the codeptr cache.
pub(crate) struct Regions {
    omp_file: SourceFileHandle,
    fallbacks: [RegionHandle; ToolEvent::COUNT],
    lock_regions: [RegionHandle; LockEvent::COUNT],
    codeptr_cache: ChunkTable<CodeKey, RegionHandle>,
}

// === impl Regions ===

impl Regions {
    /// Registers all fallback and lock regions up front, uncontended, even
    /// if they never get used.
    pub(crate) fn new(substrate: &dyn Substrate) -> Self {
        let omp_file = substrate.new_source_file("OMP");

        let fallbacks = FALLBACKS.map(|(name, kind)| {
            substrate.new_region(&RegionDescriptor {
                name,
                canonical_name: None,
                file: omp_file,
                begin_line: 0,
                kind,
            })
        });

        let lock_regions = LOCK_REGION_NAMES.map(|name| {
            substrate.new_region(&RegionDescriptor {
                name,
                canonical_name: None,
                file: omp_file,
                begin_line: 0,
                kind: RegionKind::Wrapper,
            })
        });

        Self {
            omp_file,
            fallbacks,
            lock_regions,
            codeptr_cache: ChunkTable::new(CODEPTR_HASH_BITS, code_key_hash),
        }
    }

    pub(crate) fn fallback(&self, event: ToolEvent) -> RegionHandle {
        self.fallbacks[event as usize]
    }

    pub(crate) fn lock_region(&self, event: LockEvent) -> RegionHandle {
        self.lock_regions[event as usize]
    }

    /// The region for `(codeptr, event)`.
    ///
    /// A missing entry is created by resolving the address to a source
    /// position and registering a region named `"<prefix> @<file>:<line>"`
    /// (or `"<prefix> @0x<addr>"` without debug information). Idempotent:
    /// repeated lookups return the identical handle.
    pub(crate) fn get(
        &self,
        substrate: &dyn Substrate,
        codeptr: Option<NonZeroUsize>,
        event: ToolEvent,
    ) -> RegionHandle {
        let Some(codeptr) = codeptr else {
            let region = self.fallback(event);
            tracing::trace!(
                region = region.id(),
                name = FALLBACKS[event as usize].0,
                "no codeptr, using fallback region"
            );
            return region;
        };

        let key = CodeKey {
            addr: codeptr.get(),
            event,
        };
        let (region, inserted) = self
            .codeptr_cache
            .get_or_insert(key, |key| self.define_region(substrate, key));
        tracing::trace!(
            codeptr = codeptr.get(),
            region = region.id(),
            inserted,
            "codeptr region"
        );
        region
    }

    fn define_region(&self, substrate: &dyn Substrate, key: &CodeKey) -> RegionHandle {
        let (prefix, kind) = FALLBACKS[key.event as usize];
        // File name and line number are only available if the binary carries
        // debug information.
        let resolved = substrate.resolve_address(key.addr);

        match resolved {
            Some(resolved) => {
                let file = substrate.new_source_file(&resolved.path);
                let basename = resolved
                    .path
                    .rsplit('/')
                    .next()
                    .unwrap_or(resolved.path.as_str());
                let name = format!("{prefix} @{basename}:{}", resolved.line);
                substrate.new_region(&RegionDescriptor {
                    name: &name,
                    canonical_name: Some(&name),
                    file,
                    begin_line: resolved.line,
                    kind,
                })
            }
            None => {
                let name = format!("{prefix} @{:#010x}", key.addr);
                substrate.new_region(&RegionDescriptor {
                    name: &name,
                    canonical_name: Some(&name),
                    file: self.omp_file,
                    begin_line: 0,
                    kind,
                })
            }
        }
    }
}

/// Unload notification for the codeptr cache, registered with the address
/// resolver at subsystem init. Unloaded addresses stay in the cache: if the
/// address range is reused by another object, later events get regions with
/// stale source positions, never corruption.
pub(crate) fn dlclose_notification(so_file_name: &str) {
    tracing::warn!(
        "shared object {so_file_name} was dlclosed; its addresses are not removed \
         from the codeptr hash table, so reused addresses may map to regions with \
         wrong source code locations"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::substrate::recording::RecordingSubstrate;
    use std::num::NonZeroUsize;
    use std::sync::Arc;

    fn addr(a: usize) -> Option<NonZeroUsize> {
        NonZeroUsize::new(a)
    }

    #[test]
    fn fallback_without_codeptr() {
        let substrate = Arc::new(RecordingSubstrate::new());
        let regions = Regions::new(&*substrate);
        let r = regions.get(&*substrate, None, ToolEvent::Barrier);
        assert_eq!(r, regions.fallback(ToolEvent::Barrier));
        assert_eq!(substrate.region_name(r), "!$omp barrier");
    }

    #[test]
    fn codeptr_regions_are_idempotent() {
        let substrate = Arc::new(RecordingSubstrate::new());
        let regions = Regions::new(&*substrate);
        let a = regions.get(&*substrate, addr(0x1000), ToolEvent::Parallel);
        let b = regions.get(&*substrate, addr(0x1000), ToolEvent::Parallel);
        assert_eq!(a, b);
        // Same address, different construct: distinct region.
        let c = regions.get(&*substrate, addr(0x1000), ToolEvent::ImplicitBarrier);
        assert_ne!(a, c);
        assert_eq!(substrate.region_name(a), "!$omp parallel @0x00001000");
    }

    #[test]
    fn resolved_addresses_name_source_positions() {
        let substrate = Arc::new(RecordingSubstrate::new());
        substrate.map_address(0x2000, "/home/user/src/compute.c", 17);
        let regions = Regions::new(&*substrate);
        let r = regions.get(&*substrate, addr(0x2000), ToolEvent::Task);
        assert_eq!(substrate.region_name(r), "!$omp task @compute.c:17");
    }

    #[test]
    fn lock_regions_cover_all_entry_points() {
        let substrate = Arc::new(RecordingSubstrate::new());
        let regions = Regions::new(&*substrate);
        assert_eq!(
            substrate.region_name(regions.lock_region(LockEvent::SetNest)),
            "omp_set_nest_lock"
        );
        assert_eq!(
            substrate.region_name(regions.lock_region(LockEvent::Test)),
            "omp_test_lock"
        );
    }
}
