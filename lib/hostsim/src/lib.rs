// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host-backed implementations of the `rt-hal` traits (spec.md §6): a
//! wall-clock timebase, a `std::thread`-backed task spawner, an in-memory
//! flash partition reader, and a heap-backed region allocator for the ELF
//! loader. This is the collaborator set `task/supervisor` wires up and
//! `test/test-suite` drives its scenarios against; no embedded target needs
//! any of it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use rt_abi::Error;
use rt_hal::{CacheMaintenance, FlashPartitionReader, PartitionHandle, TaskHandle, TaskSpawner, TaskSpec, Timebase};
use rt_loader::{Region, RegionAllocator};

/// Milliseconds since this timebase was constructed. Good enough for
/// heartbeat and watchdog bookkeeping in a hosted process; a real platform
/// would derive this from a hardware tick counter instead.
pub struct WallClock {
    start: Instant,
}

impl WallClock {
    pub fn new() -> Self {
        WallClock { start: Instant::now() }
    }
}

impl Default for WallClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Timebase for WallClock {
    fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

/// A task spawned onto a real OS thread. `suspend`/`resume` are no-ops: a
/// hosted `std::thread` has no portable suspend primitive, so this sim only
/// promises what spec.md §5 actually requires of `kill` -- that it's safe to
/// call regardless of what the task is doing -- and leaves cooperative pause
/// to the task itself.
struct ThreadHandle {
    alive: Arc<AtomicBool>,
    killed: Arc<AtomicBool>,
}

impl TaskHandle for ThreadHandle {
    fn suspend(&self) -> Result<(), Error> {
        Ok(())
    }

    fn resume(&self) -> Result<(), Error> {
        Ok(())
    }

    fn kill(&self) -> Result<(), Error> {
        self.killed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst) && !self.killed.load(Ordering::SeqCst)
    }
}

/// Spawns every task onto a detached `std::thread`, named for easier
/// debugging under a host debugger.
pub struct ThreadSpawner;

impl TaskSpawner for ThreadSpawner {
    fn spawn(&self, spec: TaskSpec) -> Result<Box<dyn TaskHandle>, Error> {
        let alive = Arc::new(AtomicBool::new(true));
        let killed = Arc::new(AtomicBool::new(false));
        let thread_alive = alive.clone();
        let name = spec.name;
        let stack_size = spec.stack_size.max(16 * 1024);
        let entry = spec.entry;

        std::thread::Builder::new()
            .name(name.clone())
            .stack_size(stack_size)
            .spawn(move || {
                entry();
                thread_alive.store(false, Ordering::SeqCst);
            })
            .map_err(|_| Error::NoMemory)?;

        Ok(Box::new(ThreadHandle { alive, killed }))
    }
}

/// An in-memory stand-in for a flash partition: labeled byte blobs seeded by
/// the caller (typically a packaged app image for the loader to read back).
/// Stored as an append-only `Vec` rather than a map so a `PartitionHandle`'s
/// index stays valid for the program's lifetime.
#[derive(Default)]
pub struct MemoryFlash {
    partitions: Mutex<Vec<(String, Vec<u8>)>>,
}

impl MemoryFlash {
    pub fn new() -> Self {
        MemoryFlash::default()
    }

    pub fn install(&self, label: &str, image: Vec<u8>) {
        self.partitions.lock().unwrap().push((label.to_string(), image));
    }
}

impl FlashPartitionReader for MemoryFlash {
    fn find_first(&self, label: &str) -> Option<PartitionHandle> {
        self.partitions
            .lock()
            .unwrap()
            .iter()
            .position(|(name, _)| name == label)
            .map(|idx| PartitionHandle(idx as u32))
    }

    fn size(&self, handle: PartitionHandle) -> Result<usize, Error> {
        self.partitions
            .lock()
            .unwrap()
            .get(handle.0 as usize)
            .map(|(_, bytes)| bytes.len())
            .ok_or(Error::NotFound)
    }

    fn read(&self, handle: PartitionHandle, offset: usize, buf: &mut [u8]) -> Result<(), Error> {
        let partitions = self.partitions.lock().unwrap();
        let (_, bytes) = partitions.get(handle.0 as usize).ok_or(Error::NotFound)?;
        let end = offset.checked_add(buf.len()).ok_or(Error::InvalidArg)?;
        let src = bytes.get(offset..end).ok_or(Error::InvalidArg)?;
        buf.copy_from_slice(src);
        Ok(())
    }
}

/// A `CacheMaintenance` that logs the ranges it was asked to publish rather
/// than doing nothing silently; useful for seeing the loader's write/reloc
/// traffic under a host debugger. Functionally still a no-op, since a host
/// process has no split instruction/data cache to maintain.
#[derive(Default, Clone, Copy)]
pub struct LoggingCacheMaintenance;

impl CacheMaintenance for LoggingCacheMaintenance {
    fn publish(&self, ranges: &[(usize, usize)]) {
        for (addr, len) in ranges {
            log::debug!("cache publish: {:#x}..{:#x}", addr, addr + len);
        }
    }
}

/// Heap-backed [`RegionAllocator`]: every "memory region" the loader asks
/// for is just a zeroed `Vec<u8>`, with the vector's own pointer standing in
/// for the load address (spec.md §4.N keeps relocation math in terms of a
/// logical base address, never a real mapped range).
pub struct HeapAllocator;

impl RegionAllocator for HeapAllocator {
    fn allocate(&self, size: usize) -> Result<Region, Error> {
        let bytes = vec![0u8; size.max(1)];
        let base = bytes.as_ptr() as usize;
        Ok(Region::new(base, bytes))
    }
}

fn byte_at(region: &Region, addr: usize) -> Option<u8> {
    let len = region.len();
    (addr >= region.base && addr < region.base + len).then(|| region.as_slice()[addr - region.base])
}

/// Toy "calls" a loaded app's entry point (spec.md §9 "testing can supply a
/// stub that applies a toy encoding"): there is no real executable mapping
/// behind a [`Region`], so this reads a single opcode byte at `entry_point`
/// instead of jumping to it. `0x00` is the only defined opcode and means
/// "return 0 immediately"; anything else is reported as unsupported.
pub fn call_entry(image: &rt_loader::LoadedImage) -> Result<i32, Error> {
    let opcode = byte_at(&image.code_region, image.entry_point)
        .or_else(|| byte_at(&image.data_region, image.entry_point))
        .ok_or(Error::ElfInvalid)?;
    match opcode {
        0x00 => Ok(0),
        _ => Err(Error::ElfUnsupported),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wall_clock_advances() {
        let clock = WallClock::new();
        let first = clock.now_ms();
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(clock.now_ms() >= first);
    }

    #[test]
    fn thread_spawner_runs_entry_and_reports_alive_then_dead() {
        let spawner = ThreadSpawner;
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let handle = spawner
            .spawn(TaskSpec {
                name: "probe".to_string(),
                stack_size: 4096,
                priority: 1,
                entry: Box::new(move || flag.store(true, Ordering::SeqCst)),
            })
            .unwrap();
        for _ in 0..100 {
            if !handle.is_alive() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn memory_flash_round_trips_an_installed_image() {
        let flash = MemoryFlash::new();
        flash.install("app0", vec![1, 2, 3, 4]);
        let handle = flash.find_first("app0").unwrap();
        assert_eq!(flash.size(handle).unwrap(), 4);
        let mut buf = [0u8; 2];
        flash.read(handle, 1, &mut buf).unwrap();
        assert_eq!(buf, [2, 3]);
    }

    #[test]
    fn missing_partition_is_not_found() {
        let flash = MemoryFlash::new();
        assert!(flash.find_first("nope").is_none());
    }

    #[test]
    fn heap_allocator_zeroes_and_sizes_regions() {
        let alloc = HeapAllocator;
        let region = alloc.allocate(16).unwrap();
        assert_eq!(region.len(), 16);
        assert!(region.as_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn call_entry_returns_ok_for_the_zero_opcode() {
        let alloc = HeapAllocator;
        let code_region = alloc.allocate(4).unwrap();
        let entry_point = code_region.base;
        let image = rt_loader::LoadedImage {
            code_region,
            data_region: alloc.allocate(1).unwrap(),
            bss_region: alloc.allocate(1).unwrap(),
            section_map: vec![],
            entry_point,
            manifest_addr: None,
            exit_addr: None,
            reloc_stats: Default::default(),
        };
        assert_eq!(call_entry(&image).unwrap(), 0);
    }
}
