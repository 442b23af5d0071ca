// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-service resource quotas (spec.md §4.H). A service with no configured
//! quota is unconstrained -- caps are "lazily created on first `set`", per
//! spec.md §3, not defaulted.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::Deserialize;

use rt_abi::{Error, ServiceId};

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct QuotaConfig {
    pub max_events_per_sec: u32,
    pub max_subscriptions: u32,
    pub max_payload_bytes: u32,
    pub max_memory_bytes: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct QuotaUsage {
    pub events_this_second: u32,
    pub active_subscriptions: u32,
    pub current_memory_bytes: u64,
    pub total_events_posted: u64,
    pub violations: u64,
}

struct Entry {
    config: QuotaConfig,
    usage: QuotaUsage,
}

pub struct ResourceQuota {
    entries: Mutex<HashMap<ServiceId, Entry>>,
}

impl ResourceQuota {
    pub fn new() -> Self {
        ResourceQuota {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn set(&self, service: ServiceId, config: QuotaConfig) {
        let mut entries = self.entries.lock().unwrap();
        entries
            .entry(service)
            .and_modify(|e| e.config = config)
            .or_insert(Entry {
                config,
                usage: QuotaUsage::default(),
            });
    }

    /// Checks and, on success, records a post of `payload_len` bytes against
    /// `service`'s per-second and payload-size caps.
    pub fn check_and_record_post(&self, service: ServiceId, payload_len: usize) -> Result<(), Error> {
        let mut entries = self.entries.lock().unwrap();
        let Some(entry) = entries.get_mut(&service) else {
            return Ok(());
        };
        if payload_len as u32 > entry.config.max_payload_bytes {
            entry.usage.violations += 1;
            return Err(Error::QuotaDataSizeExceeded);
        }
        if entry.usage.events_this_second >= entry.config.max_events_per_sec {
            entry.usage.violations += 1;
            return Err(Error::QuotaEventsExceeded);
        }
        entry.usage.events_this_second += 1;
        entry.usage.total_events_posted += 1;
        Ok(())
    }

    pub fn check_and_record_subscribe(&self, service: ServiceId) -> Result<(), Error> {
        let mut entries = self.entries.lock().unwrap();
        let Some(entry) = entries.get_mut(&service) else {
            return Ok(());
        };
        if entry.usage.active_subscriptions >= entry.config.max_subscriptions {
            entry.usage.violations += 1;
            return Err(Error::QuotaSubscriptionsExceeded);
        }
        entry.usage.active_subscriptions += 1;
        Ok(())
    }

    pub fn release_subscription(&self, service: ServiceId) {
        if let Some(entry) = self.entries.lock().unwrap().get_mut(&service) {
            entry.usage.active_subscriptions = entry.usage.active_subscriptions.saturating_sub(1);
        }
    }

    /// Records `bytes` of current memory usage; logged, never blocks
    /// allocation (spec.md §4.H).
    pub fn record_memory(&self, service: ServiceId, bytes: u64) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(&service) {
            entry.usage.current_memory_bytes = bytes;
            if bytes > entry.config.max_memory_bytes {
                log::warn!(
                    "service {service} memory usage {bytes} exceeds configured cap {}",
                    entry.config.max_memory_bytes
                );
            }
        }
    }

    /// 1 Hz tick: zeroes every service's per-second event bucket.
    pub fn reset_counters(&self) {
        for entry in self.entries.lock().unwrap().values_mut() {
            entry.usage.events_this_second = 0;
        }
    }

    pub fn usage(&self, service: ServiceId) -> Option<QuotaUsage> {
        self.entries.lock().unwrap().get(&service).map(|e| e.usage)
    }
}

impl Default for ResourceQuota {
    fn default() -> Self {
        Self::new()
    }
}
