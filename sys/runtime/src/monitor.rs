// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-handler timing and fault containment (spec.md §4.L). The monitor
//! only observes; it never aborts a handler itself.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Mutex;

use rt_abi::ServiceId;
use rt_hal::Timebase;

#[derive(Debug, Clone, Copy, Default)]
pub struct HandlerStats {
    pub avg_time_us: u64,
    pub max_time_us: u64,
    pub timeout_count: u64,
    samples: u64,
    total_us: u64,
}

pub struct HandlerMonitor {
    stats: Mutex<HashMap<ServiceId, HandlerStats>>,
    threshold_us: u64,
}

impl HandlerMonitor {
    pub fn new(threshold_us: u64) -> Self {
        HandlerMonitor {
            stats: Mutex::new(HashMap::new()),
            threshold_us,
        }
    }

    /// Calls `f`, timing it with `timebase` and catching any panic so a
    /// misbehaving handler can't bring down the dispatcher (spec.md §4.G
    /// "Handler exceptions ... must not leak past the monitor").
    pub fn invoke(&self, service: ServiceId, timebase: &dyn Timebase, f: impl FnOnce()) {
        let start = timebase.now_ms();
        let outcome = catch_unwind(AssertUnwindSafe(f));
        let elapsed_us = timebase.now_ms().saturating_sub(start) * 1000;

        let mut stats = self.stats.lock().unwrap();
        let entry = stats.entry(service).or_default();
        entry.samples += 1;
        entry.total_us += elapsed_us;
        entry.avg_time_us = entry.total_us / entry.samples;
        if elapsed_us > entry.max_time_us {
            entry.max_time_us = elapsed_us;
        }
        if elapsed_us > self.threshold_us {
            entry.timeout_count += 1;
            log::warn!("handler for service {service} took {elapsed_us}us, exceeding the configured threshold");
        }
        drop(stats);

        if outcome.is_err() {
            log::error!("handler for service {service} panicked; dispatcher continuing");
        }
    }

    pub fn stats(&self, service: ServiceId) -> Option<HandlerStats> {
        self.stats.lock().unwrap().get(&service).copied()
    }
}
