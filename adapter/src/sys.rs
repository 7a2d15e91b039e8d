// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Mirrors of the OpenMP 5.2 tool-interface types the adapter consumes.
//!
//! Values match the numbers in `omp-tools.h`; conversions from the raw C
//! integers are fallible so the FFI layer can skip events carrying values
//! this adapter does not know about instead of misinterpreting them.

use core::ffi::c_void;
use core::fmt;

// The explicit-task protocol stores either a pointer or a 64-bit encoded
// word in the runtime's opaque slot, distinguished by the low bit.
static_assertions::const_assert_eq!(size_of::<*mut c_void>(), size_of::<u64>());

/// The runtime-owned opaque slot attached to threads, parallel regions and
/// tasks. The runtime preserves the 64 bits between callbacks; their
/// interpretation is entirely up to the tool.
#[repr(C)]
#[derive(Clone, Copy)]
pub union OmptData {
    pub value: u64,
    pub ptr: *mut c_void,
}

// === impl OmptData ===

impl OmptData {
    /// The all-zero slot the runtime hands to a tool initially.
    pub const NONE: OmptData = OmptData { value: 0 };

    #[inline]
    #[must_use]
    pub fn value(&self) -> u64 {
        // Safety: both union fields are 8 plain bytes; reading either
        // interpretation is always defined.
        unsafe { self.value }
    }

    #[inline]
    #[must_use]
    pub fn ptr(&self) -> *mut c_void {
        // Safety: see `value`.
        unsafe { self.ptr }
    }
}

impl fmt::Debug for OmptData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OmptData({:#x})", self.value())
    }
}

/// Integer the runtime uses to identify a mutex across
/// acquire/acquired/released callbacks.
pub type WaitId = u64;

macro_rules! raw_enum {
    (
        $(#[$meta:meta])*
        $vis:vis enum $Name:ident: $Raw:ty {
            $($(#[$vmeta:meta])* $Variant:ident = $value:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr($Raw)]
        $vis enum $Name {
            $($(#[$vmeta])* $Variant = $value),+
        }

        impl TryFrom<$Raw> for $Name {
            type Error = $Raw;

            fn try_from(raw: $Raw) -> Result<Self, $Raw> {
                match raw {
                    $($value => Ok(Self::$Variant),)+
                    other => Err(other),
                }
            }
        }
    };
}

raw_enum! {
    /// `ompt_scope_endpoint_t`.
    pub enum ScopeEndpoint: i32 {
        Begin = 1,
        End = 2,
        BeginEnd = 3,
    }
}

raw_enum! {
    /// `ompt_thread_t`.
    pub enum ThreadKind: i32 {
        Initial = 1,
        Worker = 2,
        Other = 3,
        Unknown = 4,
    }
}

raw_enum! {
    /// `ompt_task_status_t`.
    pub enum TaskStatus: i32 {
        Complete = 1,
        Yield = 2,
        Cancel = 3,
        Detach = 4,
        EarlyFulfill = 5,
        LateFulfill = 6,
        Switch = 7,
        TaskwaitComplete = 8,
    }
}

raw_enum! {
    /// `ompt_sync_region_t`. The first two values are deprecated since
    /// OpenMP 5.1 but still delivered by some runtimes.
    pub enum SyncRegionKind: i32 {
        Barrier = 1,
        BarrierImplicit = 2,
        BarrierExplicit = 3,
        BarrierImplementation = 4,
        Taskwait = 5,
        Taskgroup = 6,
        Reduction = 7,
        BarrierImplicitWorkshare = 8,
        BarrierImplicitParallel = 9,
        BarrierTeams = 10,
    }
}

raw_enum! {
    /// `ompt_work_t`, including the 5.2 loop-schedule refinements.
    pub enum WorkKind: i32 {
        Loop = 1,
        Sections = 2,
        SingleExecutor = 3,
        SingleOther = 4,
        Workshare = 5,
        Distribute = 6,
        Taskloop = 7,
        Scope = 8,
        LoopStatic = 10,
        LoopDynamic = 11,
        LoopGuided = 12,
        LoopOther = 13,
    }
}

impl WorkKind {
    /// Whether this is one of the loop kinds (`Loop` or a 5.2 schedule
    /// refinement thereof).
    #[must_use]
    pub fn is_loop(self) -> bool {
        matches!(
            self,
            Self::Loop | Self::LoopStatic | Self::LoopDynamic | Self::LoopGuided | Self::LoopOther
        )
    }

    /// The `schedule` parameter value reported for loop work regions.
    #[must_use]
    pub fn schedule_name(self) -> &'static str {
        match self {
            Self::Loop => "runtime",
            Self::LoopStatic => "static",
            Self::LoopDynamic => "dynamic",
            Self::LoopGuided => "guided",
            _ => "other",
        }
    }
}

raw_enum! {
    /// `ompt_mutex_t`.
    pub enum MutexKind: i32 {
        Lock = 1,
        TestLock = 2,
        NestLock = 3,
        TestNestLock = 4,
        Critical = 5,
        Atomic = 6,
        Ordered = 7,
    }
}

raw_enum! {
    /// `ompt_dispatch_t`.
    pub enum DispatchKind: i32 {
        Iteration = 1,
        Section = 2,
        WsLoopChunk = 3,
        TaskloopChunk = 4,
        DistributeChunk = 5,
    }
}

raw_enum! {
    /// `ompt_set_result_t`, returned by the runtime's `ompt_set_callback`.
    pub enum SetResult: i32 {
        Error = 0,
        Never = 1,
        Impossible = 2,
        Sometimes = 3,
        SometimesPaired = 4,
        Always = 5,
    }
}

raw_enum! {
    /// `ompt_callbacks_t` — the callback kinds this adapter registers.
    pub enum CallbackKind: i32 {
        ThreadBegin = 1,
        ThreadEnd = 2,
        ParallelBegin = 3,
        ParallelEnd = 4,
        TaskCreate = 5,
        TaskSchedule = 6,
        ImplicitTask = 7,
        DeviceInitialize = 12,
        MutexReleased = 17,
        Work = 20,
        Masked = 21,
        SyncRegion = 23,
        LockInit = 24,
        LockDestroy = 25,
        MutexAcquire = 26,
        MutexAcquired = 27,
        NestLock = 28,
        Flush = 29,
        Dispatch = 32,
    }
}

bitflags::bitflags! {
    /// `ompt_parallel_flag_t`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ParallelFlags: u32 {
        const INVOKER_PROGRAM = 0x0000_0001;
        const INVOKER_RUNTIME = 0x0000_0002;
        const LEAGUE = 0x4000_0000;
        const TEAM = 0x8000_0000;
    }
}

bitflags::bitflags! {
    /// `ompt_task_flag_t`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TaskFlags: u32 {
        const INITIAL = 0x0000_0001;
        const IMPLICIT = 0x0000_0002;
        const EXPLICIT = 0x0000_0004;
        const TARGET = 0x0000_0008;
        const TASKWAIT = 0x0000_0010;
        const UNDEFERRED = 0x0800_0000;
        const UNTIED = 0x1000_0000;
        const FINAL = 0x2000_0000;
        const MERGEABLE = 0x4000_0000;
        const MERGED = 0x8000_0000;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_conversions() {
        assert_eq!(ScopeEndpoint::try_from(1), Ok(ScopeEndpoint::Begin));
        assert_eq!(ScopeEndpoint::try_from(2), Ok(ScopeEndpoint::End));
        assert_eq!(ScopeEndpoint::try_from(17), Err(17));
        assert_eq!(
            SyncRegionKind::try_from(9),
            Ok(SyncRegionKind::BarrierImplicitParallel)
        );
        assert_eq!(MutexKind::try_from(6), Ok(MutexKind::Atomic));
        assert_eq!(WorkKind::try_from(9), Err(9));
    }

    #[test]
    fn loop_kinds() {
        assert!(WorkKind::LoopGuided.is_loop());
        assert!(!WorkKind::Sections.is_loop());
        assert_eq!(WorkKind::LoopStatic.schedule_name(), "static");
        assert_eq!(WorkKind::Loop.schedule_name(), "runtime");
    }

    #[test]
    fn task_flag_bits() {
        let flags = TaskFlags::EXPLICIT | TaskFlags::UNDEFERRED;
        assert!(flags.contains(TaskFlags::EXPLICIT));
        assert!(!flags.contains(TaskFlags::MERGED));
        assert_eq!(TaskFlags::MERGED.bits(), 0x8000_0000);
    }
}
