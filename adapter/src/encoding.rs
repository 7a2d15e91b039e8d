// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The 64-bit explicit-task word.
//!
//! Task-create and the first task-schedule for a task may run on different
//! threads; a heap allocation made on the creating thread would be freed on
//! the executing one and drain one thread's pool into another's. Instead,
//! everything task-schedule needs is packed into the runtime-preserved
//! 64-bit slot:
//!
//! ```text
//! MSB [ region : nbits_region ][ thread_num ][ generation ][ new-task : 1 ] LSB
//! ```
//!
//! The new-task bit makes the word odd. Real task pointers are at least
//! pointer-aligned and therefore even, so the first schedule can tell an
//! encoded word from the pointer it replaces it with.
//!
//! The region width is process-wide (the substrate's definition-id width);
//! thread-num and generation widths depend on the team size and are kept per
//! parallel region.

use crate::macros::bug_on;
use crate::substrate::RegionHandle;

/// Process-wide layout: the region field and the new-task bit.
#[derive(Debug, Clone, Copy)]
pub(crate) struct WordLayout {
    pub nbits_region: u8,
    pub shift_region: u8,
    pub mask_region: u64,
    pub mask_new_task: u64,
}

// === impl WordLayout ===

impl WordLayout {
    /// Builds the layout from the substrate's definition-id bit width.
    pub(crate) fn new(nbits_region: u8) -> Self {
        let shift_region = 64 - nbits_region;
        Self {
            nbits_region,
            shift_region,
            mask_region: get_mask(u32::from(nbits_region), u32::from(shift_region)),
            mask_new_task: get_mask(1, 0),
        }
    }

    /// Whether `word` still carries task-create data (first schedule not yet
    /// seen). Cleared words hold a real task pointer and are even.
    #[inline]
    pub(crate) fn is_new_task(&self, word: u64) -> bool {
        word & self.mask_new_task != 0
    }

    /// The word for an undeferred task: no region, only the new-task bit.
    /// `RegionHandle::INVALID` in the region field is the undeferred marker.
    pub(crate) fn encode_undeferred(&self) -> u64 {
        u64::from(RegionHandle::INVALID.id()) << self.shift_region | self.mask_new_task
    }

    pub(crate) fn decode_region(&self, word: u64) -> RegionHandle {
        let id = (word & self.mask_region) >> self.shift_region;
        bug_on!(id > u64::from(u32::MAX));
        RegionHandle(id as u32)
    }
}

/// Per-parallel-region packing of the thread-num and generation fields.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct TaskWordPacking {
    pub shift_thread_num: u8,
    pub mask_thread_num: u64,
    pub shift_generation: u8,
    pub mask_generation: u64,
    /// Largest generation number that fits; exceeding it is a protocol bug.
    pub max_explicit_tasks: u32,
}

// === impl TaskWordPacking ===

impl TaskWordPacking {
    /// Computes the packing for a team of `team_size` threads.
    ///
    /// Thread-num values are `0..team_size`, so they need
    /// ⌈log₂(team_size)⌉ bits; the generation number takes what remains
    /// below the region field, capped at 32 bits.
    pub(crate) fn for_team(layout: &WordLayout, team_size: u32) -> Self {
        bug_on!(team_size == 0);

        let mut nbits_thread_num = 1_u8;
        while (team_size - 1) >> nbits_thread_num != 0 {
            nbits_thread_num += 1;
        }
        let used = i32::from(layout.nbits_region) + i32::from(nbits_thread_num) + 1;
        bug_on!(
            64 - used <= 0,
            "no bits left to encode task generation numbers (region {} + thread_num {})",
            layout.nbits_region,
            nbits_thread_num
        );
        let nbits_generation = u8::try_from(64 - used).unwrap_or(32).min(32);

        let shift_thread_num = layout.shift_region - nbits_thread_num;
        let shift_generation = shift_thread_num - nbits_generation;
        Self {
            shift_thread_num,
            mask_thread_num: get_mask(u32::from(nbits_thread_num), u32::from(shift_thread_num)),
            shift_generation,
            mask_generation: get_mask(u32::from(nbits_generation), u32::from(shift_generation)),
            max_explicit_tasks: ((1_u64 << nbits_generation) - 1).min(u64::from(u32::MAX)) as u32,
        }
    }

    /// Packs task-create data into the word handed to the runtime.
    pub(crate) fn encode(
        &self,
        layout: &WordLayout,
        region: RegionHandle,
        thread_num: u32,
        generation: u32,
    ) -> u64 {
        u64::from(region.id()) << layout.shift_region
            | u64::from(thread_num) << self.shift_thread_num
            | u64::from(generation) << self.shift_generation
            | layout.mask_new_task
    }

    pub(crate) fn decode_thread_num(&self, word: u64) -> u32 {
        ((word & self.mask_thread_num) >> self.shift_thread_num) as u32
    }

    pub(crate) fn decode_generation(&self, word: u64) -> u32 {
        ((word & self.mask_generation) >> self.shift_generation) as u32
    }
}

/// A mask of `width` one-bits starting at bit `shift`.
pub(crate) fn get_mask(width: u32, shift: u32) -> u64 {
    bug_on!(width == 0 || width > 64, "width = {width}");
    bug_on!(shift > 63, "shift = {shift}");
    bug_on!(width + shift > 64, "width = {width} | shift = {shift}");

    let mut mask = u64::MAX;
    mask <<= 64 - width;
    mask >> (64 - width - shift)
}
