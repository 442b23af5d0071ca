// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! TOML-driven bring-up configuration, in the same shape the packaging
//! tool's own `Config` struct uses: a plain `serde`-derived struct loaded
//! with `toml::from_str`, kebab-case keys, unknown keys rejected.

use serde::Deserialize;

use rt_abi::{APP_MAX_APPS, SYSTEM_SERVICE_MAX_SERVICES};

use crate::quota::QuotaConfig;
use crate::watchdog::WatchdogConfig;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct SystemConfig {
    #[serde(default = "default_max_services")]
    pub max_services: usize,
    #[serde(default = "default_max_apps")]
    pub max_apps: usize,
    #[serde(default = "default_max_event_types")]
    pub max_event_types: usize,
    #[serde(default = "default_max_subscriptions")]
    pub max_subscriptions: usize,
    #[serde(default)]
    pub memory_pool: MemoryPoolConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default = "default_dispatcher_priority")]
    pub dispatcher_priority: u8,
    #[serde(default = "default_watchdog_priority")]
    pub watchdog_priority: u8,
    #[serde(default = "default_watchdog_period_ms")]
    pub watchdog_period_ms: u64,
    #[serde(default = "default_handler_threshold_us")]
    pub handler_warn_threshold_us: u64,
    /// Static bring-up table: per-service quota, watchdog policy and
    /// dependency edges, applied by `System::register_service` as each
    /// named service comes up (spec.md §4.H, §4.I, §4.J).
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ServiceConfig {
    pub name: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub quota: Option<QuotaConfig>,
    #[serde(default)]
    pub watchdog: Option<WatchdogConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct MemoryPoolConfig {
    #[serde(default = "default_pool_class_counts")]
    pub class_counts: [usize; 4],
}

impl Default for MemoryPoolConfig {
    fn default() -> Self {
        MemoryPoolConfig {
            class_counts: default_pool_class_counts(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct QueueConfig {
    #[serde(default = "default_lane_capacities")]
    pub lane_capacities: [usize; 4],
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            lane_capacities: default_lane_capacities(),
        }
    }
}

fn default_max_services() -> usize {
    SYSTEM_SERVICE_MAX_SERVICES
}

fn default_max_apps() -> usize {
    APP_MAX_APPS
}

fn default_max_event_types() -> usize {
    64
}

fn default_max_subscriptions() -> usize {
    128
}

fn default_pool_class_counts() -> [usize; 4] {
    [32, 16, 8, 4]
}

fn default_lane_capacities() -> [usize; 4] {
    [32, 32, 64, 64]
}

fn default_dispatcher_priority() -> u8 {
    4
}

fn default_watchdog_priority() -> u8 {
    3
}

fn default_watchdog_period_ms() -> u64 {
    1000
}

fn default_handler_threshold_us() -> u64 {
    5_000
}

impl Default for SystemConfig {
    fn default() -> Self {
        SystemConfig {
            max_services: default_max_services(),
            max_apps: default_max_apps(),
            max_event_types: default_max_event_types(),
            max_subscriptions: default_max_subscriptions(),
            memory_pool: MemoryPoolConfig::default(),
            queue: QueueConfig::default(),
            dispatcher_priority: default_dispatcher_priority(),
            watchdog_priority: default_watchdog_priority(),
            watchdog_period_ms: default_watchdog_period_ms(),
            handler_warn_threshold_us: default_handler_threshold_us(),
            services: Vec::new(),
        }
    }
}

impl SystemConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_every_default() {
        let config = SystemConfig::from_toml_str("").unwrap();
        assert_eq!(config.max_services, SYSTEM_SERVICE_MAX_SERVICES);
        assert_eq!(config.memory_pool.class_counts, default_pool_class_counts());
    }

    #[test]
    fn overrides_apply_and_unknown_keys_reject() {
        let config = SystemConfig::from_toml_str("max-services = 4\n").unwrap();
        assert_eq!(config.max_services, 4);
        assert!(SystemConfig::from_toml_str("bogus-key = 1\n").is_err());
    }

    #[test]
    fn per_service_table_parses_quota_watchdog_and_deps() {
        let toml = r#"
            [[services]]
            name = "sensor"
            depends-on = ["bus"]

            [services.quota]
            max-events-per-sec = 10
            max-subscriptions = 4
            max-payload-bytes = 256
            max-memory-bytes = 4096

            [services.watchdog]
            timeout-ms = 500
            auto-restart = true
            max-restart-attempts = 3
            is-critical = false
        "#;
        let config = SystemConfig::from_toml_str(toml).unwrap();
        assert_eq!(config.services.len(), 1);
        let service = &config.services[0];
        assert_eq!(service.name, "sensor");
        assert_eq!(service.depends_on, vec!["bus".to_string()]);
        assert_eq!(service.quota.unwrap().max_events_per_sec, 10);
        assert_eq!(service.watchdog.unwrap().max_restart_attempts, 3);
    }
}
