// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A monotonic concurrent hash table.
//!
//! Monotonic means inserts-only: entries are never removed or mutated while
//! the table is shared, which is what makes the reader side trivial. The
//! table is a fixed power-of-two array of buckets; each bucket is a linked
//! list of small cache-line-aligned chunks. Inserters append entries under a
//! per-bucket spin lock and publish them with a release store of the chunk's
//! entry count (or of the bucket head, for a fresh chunk). Readers walk the
//! chunk list with acquire loads and never block writers. Because chunks are
//! only freed when the table itself is dropped, readers need no guard.
//!
//! The value for a missing key is built by a caller-supplied constructor that
//! runs under the bucket's insert lock, so it executes at most once per key.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::alloc::{Layout, alloc, dealloc, handle_alloc_error};
use alloc::boxed::Box;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use omptrace_spin::{CachePadded, RawMutex};

/// Key-value pairs per chunk.
const CHUNK_ENTRIES: usize = 2;

/// A 32-bit integer mixing step (Wang/Jenkins style avalanche).
#[inline]
#[must_use]
pub fn mix32(mut h: u32) -> u32 {
    h = (h ^ 61) ^ (h >> 16);
    h = h.wrapping_add(h << 3);
    h ^= h >> 4;
    h = h.wrapping_mul(0x27d4_eb2d);
    h ^ (h >> 15)
}

/// Folds a 64-bit key field into a 32-bit hash, chained through `seed` so
/// multi-field keys can combine their fields.
#[inline]
#[must_use]
pub fn hash_u64(value: u64, seed: u32) -> u32 {
    let lo = value as u32;
    let hi = (value >> 32) as u32;
    mix32(mix32(seed ^ lo).wrapping_add(hi))
}

struct Chunk<K, V> {
    /// Number of initialized entries. Only the inserter (under the bucket
    /// lock) advances this; readers load it with `Acquire`.
    used: AtomicUsize,
    /// Older chunk in this bucket. Written before the chunk is published,
    /// immutable afterwards.
    next: *mut Chunk<K, V>,
    entries: [UnsafeCell<MaybeUninit<(K, V)>>; CHUNK_ENTRIES],
}

struct Bucket<K, V> {
    head: AtomicPtr<Chunk<K, V>>,
    insert: RawMutex,
}

/// See the [crate docs](crate) for the structure and synchronization rules.
pub struct ChunkTable<K, V> {
    buckets: Box<[CachePadded<Bucket<K, V>>]>,
    mask: u32,
    hash: fn(&K) -> u32,
}

// Safety: readers only observe entries after their release-store publication
// and entries are never mutated afterwards; all insert-side mutation is
// serialized by the per-bucket lock.
unsafe impl<K: Send + Sync, V: Send + Sync> Sync for ChunkTable<K, V> {}
// Safety: the table owns its chunks; sending it moves ownership wholesale.
unsafe impl<K: Send, V: Send> Send for ChunkTable<K, V> {}

// === impl ChunkTable ===

impl<K, V> ChunkTable<K, V>
where
    K: Copy + Eq,
    V: Copy,
{
    /// Returns a table with `1 << bucket_bits` buckets using `hash` to place
    /// keys.
    ///
    /// # Panics
    ///
    /// Panics if `bucket_bits` is 0 or exceeds 31.
    #[must_use]
    pub fn new(bucket_bits: u32, hash: fn(&K) -> u32) -> Self {
        assert!(bucket_bits > 0 && bucket_bits < 32);
        let len = 1_usize << bucket_bits;
        let buckets: Vec<_> = (0..len)
            .map(|_| {
                CachePadded::new(Bucket {
                    head: AtomicPtr::new(ptr::null_mut()),
                    insert: RawMutex::new(),
                })
            })
            .collect();
        Self {
            buckets: buckets.into_boxed_slice(),
            mask: (1_u32 << bucket_bits) - 1,
            hash,
        }
    }

    fn bucket(&self, key: &K) -> &Bucket<K, V> {
        let idx = ((self.hash)(key) & self.mask) as usize;
        &self.buckets[idx]
    }

    /// Lock-free lookup.
    pub fn get(&self, key: &K) -> Option<V> {
        let bucket = self.bucket(key);
        let mut chunk = bucket.head.load(Ordering::Acquire);
        while !chunk.is_null() {
            // Safety: non-null chunk pointers come from `publish` below and
            // stay valid until the table is dropped, which requires `&mut`.
            let c = unsafe { &*chunk };
            let used = c.used.load(Ordering::Acquire);
            for entry in &c.entries[..used] {
                // Safety: entries below `used` were fully written before the
                // release store of `used` and are immutable afterwards.
                let (k, v) = unsafe { (*entry.get()).assume_init_ref() };
                if k == key {
                    return Some(*v);
                }
            }
            chunk = c.next;
        }
        None
    }

    /// Looks up `key`, constructing and inserting the value if absent.
    ///
    /// Returns the value and whether this call inserted it. `ctor` runs at
    /// most once per key, under the bucket's insert lock; it may allocate or
    /// register definitions but must not re-enter the same bucket.
    pub fn get_or_insert(&self, key: K, ctor: impl FnOnce(&K) -> V) -> (V, bool) {
        if let Some(v) = self.get(&key) {
            return (v, false);
        }

        let bucket = self.bucket(&key);
        bucket.insert.lock();
        // Lost the race if another inserter published the key while we were
        // waiting for the lock.
        if let Some(v) = self.get(&key) {
            // Safety: locked right above.
            unsafe { bucket.insert.unlock() };
            return (v, false);
        }

        let value = ctor(&key);
        // Safety: we hold the bucket's insert lock.
        unsafe { Self::publish(bucket, key, value) };
        // Safety: locked above.
        unsafe { bucket.insert.unlock() };
        (value, true)
    }

    /// Appends an entry to the bucket, reusing the head chunk's free slot or
    /// linking a fresh chunk in front.
    ///
    /// # Safety
    ///
    /// The caller must hold the bucket's insert lock.
    unsafe fn publish(bucket: &Bucket<K, V>, key: K, value: V) {
        let head = bucket.head.load(Ordering::Relaxed);
        if !head.is_null() {
            // Safety: published chunks stay valid for the table's lifetime.
            let chunk = unsafe { &*head };
            let used = chunk.used.load(Ordering::Relaxed);
            if used < CHUNK_ENTRIES {
                // Safety: slots at and above `used` are unpublished; the
                // insert lock means no other writer touches them.
                unsafe { (*chunk.entries[used].get()).write((key, value)) };
                chunk.used.store(used + 1, Ordering::Release);
                return;
            }
        }

        let chunk = Self::alloc_chunk();
        // Safety: freshly allocated, not yet shared.
        unsafe {
            (*chunk).next = head;
            (*(*chunk).entries[0].get()).write((key, value));
            (*chunk).used = AtomicUsize::new(1);
        }
        bucket.head.store(chunk, Ordering::Release);
    }

    fn alloc_chunk() -> *mut Chunk<K, V> {
        let layout = Self::chunk_layout();
        // Safety: `Chunk` has non-zero size.
        let raw = unsafe { alloc(layout) }.cast::<Chunk<K, V>>();
        if raw.is_null() {
            handle_alloc_error(layout);
        }
        // Safety: `raw` is valid for writes of `Chunk`.
        unsafe {
            raw.write(Chunk {
                used: AtomicUsize::new(0),
                next: ptr::null_mut(),
                entries: [const { UnsafeCell::new(MaybeUninit::uninit()) }; CHUNK_ENTRIES],
            });
        }
        raw
    }

    fn chunk_layout() -> Layout {
        Layout::new::<Chunk<K, V>>()
            .align_to(CachePadded::<()>::LINE_SIZE)
            .expect("chunk layout")
            .pad_to_align()
    }

    /// Number of entries in the table. Not synchronized against concurrent
    /// inserts; exact only when externally quiesced.
    #[must_use]
    pub fn len(&self) -> usize {
        let mut len = 0;
        for bucket in &self.buckets {
            let mut chunk = bucket.head.load(Ordering::Acquire);
            while !chunk.is_null() {
                // Safety: see `get`.
                let c = unsafe { &*chunk };
                len += c.used.load(Ordering::Acquire);
                chunk = c.next;
            }
        }
        len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, V> Drop for ChunkTable<K, V> {
    fn drop(&mut self) {
        let layout = Layout::new::<Chunk<K, V>>()
            .align_to(CachePadded::<()>::LINE_SIZE)
            .expect("chunk layout")
            .pad_to_align();
        for bucket in &mut self.buckets {
            let mut chunk = *bucket.head.get_mut();
            while !chunk.is_null() {
                // Safety: `&mut self` means no readers remain; chunks were
                // allocated with `alloc_chunk` using this layout. `K`/`V` are
                // `Copy` everywhere the table is constructed, so dropping
                // entry payloads is not required.
                unsafe {
                    let next = (*chunk).next;
                    dealloc(chunk.cast(), layout);
                    chunk = next;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicU32;
    use std::thread;

    fn table() -> ChunkTable<(u64, u32), u64> {
        ChunkTable::new(8, |key| hash_u64(key.1.into(), hash_u64(key.0, 0)))
    }

    #[test]
    fn miss_then_hit() {
        let t = table();
        assert_eq!(t.get(&(1, 2)), None);
        let (v, inserted) = t.get_or_insert((1, 2), |_| 42);
        assert!(inserted);
        assert_eq!(v, 42);
        let (v, inserted) = t.get_or_insert((1, 2), |_| 99);
        assert!(!inserted);
        assert_eq!(v, 42);
        assert_eq!(t.get(&(1, 2)), Some(42));
    }

    #[test]
    fn chunk_overflow_keeps_older_entries() {
        // More entries than one chunk holds, all hashed into few buckets.
        let t = table();
        for i in 0..64_u64 {
            t.get_or_insert((i, 0), |_| i * 10);
        }
        for i in 0..64_u64 {
            assert_eq!(t.get(&(i, 0)), Some(i * 10), "entry {i}");
        }
        assert_eq!(t.len(), 64);
    }

    #[test]
    fn ctor_runs_once_per_key() {
        let t = Arc::new(table());
        let calls = Arc::new(AtomicU32::new(0));

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let t = Arc::clone(&t);
                let calls = Arc::clone(&calls);
                thread::spawn(move || {
                    for i in 0..256_u64 {
                        let (v, _) = t.get_or_insert((i % 32, 7), |key| {
                            calls.fetch_add(1, Ordering::Relaxed);
                            key.0 + 1000
                        });
                        assert_eq!(v, (i % 32) + 1000);
                    }
                })
            })
            .collect();
        for th in threads {
            th.join().unwrap();
        }

        assert_eq!(calls.load(Ordering::Relaxed), 32);
        assert_eq!(t.len(), 32);
    }

    #[test]
    fn mix32_spreads_small_keys() {
        let mut seen = std::collections::HashSet::new();
        for i in 0..1024_u32 {
            seen.insert(mix32(i) & 0xff);
        }
        // All 256 buckets should be hit by 1024 consecutive keys.
        assert_eq!(seen.len(), 256);
    }
}
