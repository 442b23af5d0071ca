// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Abstract collaborators the runtime core consumes (spec.md §1):
//! a timebase, a task spawner, a flash partition reader, and a cache
//! maintenance hook. Logging uses the `log` crate's global facade directly
//! -- that facade *is* the "abstract log sink" spec.md asks for, and a
//! platform satisfies it the ordinary way, by installing a `log::Log`
//! implementation before starting the runtime.
//!
//! `sys/runtime` and `apps/loader` depend only on the traits in this crate.
//! `lib/hostsim` is the concrete implementation used by tests and by the
//! `task/supervisor` binary.

use rt_abi::Error;

/// Monotonic milliseconds since an arbitrary epoch (spec.md §3, `timestamp_ms`
/// / `last_heartbeat_ms`).
pub trait Timebase: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// A running (or suspended) task created through a `TaskSpawner`.
pub trait TaskHandle: Send + Sync {
    fn suspend(&self) -> Result<(), Error>;
    fn resume(&self) -> Result<(), Error>;
    /// Forcibly deletes the task. Per spec.md §5, this must be safe to call
    /// even if the task is mid-execution; no generic cancellation exists.
    fn kill(&self) -> Result<(), Error>;
    fn is_alive(&self) -> bool;
}

/// What to start a task with (spec.md §1 "start/suspend/resume/kill a
/// preemptive task with a name and stack size").
pub struct TaskSpec {
    pub name: String,
    pub stack_size: usize,
    pub priority: u8,
    pub entry: Box<dyn FnOnce() + Send + 'static>,
}

pub trait TaskSpawner: Send + Sync {
    fn spawn(&self, spec: TaskSpec) -> Result<Box<dyn TaskHandle>, Error>;
}

/// Opaque handle to a located flash partition.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PartitionHandle(pub u32);

/// spec.md §6 "Partition reader consumed by the loader".
pub trait FlashPartitionReader: Send + Sync {
    fn find_first(&self, label: &str) -> Option<PartitionHandle>;
    fn size(&self, handle: PartitionHandle) -> Result<usize, Error>;
    fn read(&self, handle: PartitionHandle, offset: usize, buf: &mut [u8]) -> Result<(), Error>;
}

/// Write-back + instruction-cache-invalidate hook the ELF loader must call
/// after writing code or applying relocations (spec.md §4.N step 7).
/// Platforms without split caches implement this as a no-op.
pub trait CacheMaintenance: Send + Sync {
    /// `ranges` are `(address, length)` pairs covering every region the
    /// loader modified since the last `publish` call.
    fn publish(&self, ranges: &[(usize, usize)]);
}

/// No-op `CacheMaintenance`, for platforms with unified caches (and for
/// tests, where there is no instruction cache to speak of).
#[derive(Default, Clone, Copy)]
pub struct NoCacheMaintenance;

impl CacheMaintenance for NoCacheMaintenance {
    fn publish(&self, _ranges: &[(usize, usize)]) {}
}
