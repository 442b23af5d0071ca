// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Heartbeat liveness, restart policy and safe-mode latch (spec.md §4.I).
//!
//! The restart hook is an explicit seam (spec.md §9 open question): the
//! surveyed design conflates "restart a service" with "mark it errored",
//! when the two only coincide for services, not for apps. [`RestartHook`]
//! lets the app manager (in a different crate, to avoid a dependency
//! cycle) install the real Stop->Start behavior for apps while services
//! fall back to [`ServiceErrorRestartHook`].

use std::collections::HashMap;
use std::sync::Mutex;

use serde::Deserialize;

use rt_abi::{Error, RestartCause, SafeModeReason, ServiceId, ServiceState};

use crate::registry::ServiceRegistry;

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct WatchdogConfig {
    pub timeout_ms: u64,
    pub auto_restart: bool,
    pub max_restart_attempts: u32,
    pub is_critical: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WatchdogStatus {
    pub restart_attempts: u32,
    pub timeout_detected: bool,
    pub failed_restarts: u32,
    pub critical_failure: bool,
}

struct Entry {
    config: WatchdogConfig,
    status: WatchdogStatus,
}

pub trait RestartHook: Send + Sync {
    fn restart(&self, service: ServiceId, cause: RestartCause) -> Result<(), Error>;
}

/// Fallback restart hook for plain services: per spec.md §4.M.5, "full
/// restart requires cooperation the core cannot guarantee alone", so this
/// just marks the service `Error`.
pub struct ServiceErrorRestartHook {
    registry: std::sync::Arc<ServiceRegistry>,
}

impl ServiceErrorRestartHook {
    pub fn new(registry: std::sync::Arc<ServiceRegistry>) -> Self {
        ServiceErrorRestartHook { registry }
    }
}

impl RestartHook for ServiceErrorRestartHook {
    fn restart(&self, service: ServiceId, _cause: RestartCause) -> Result<(), Error> {
        self.registry.set_state(service, ServiceState::Error)
    }
}

pub struct Watchdog {
    entries: Mutex<HashMap<ServiceId, Entry>>,
    safe_mode: Mutex<Option<SafeModeReason>>,
}

impl Watchdog {
    pub fn new() -> Self {
        Watchdog {
            entries: Mutex::new(HashMap::new()),
            safe_mode: Mutex::new(None),
        }
    }

    pub fn configure(&self, service: ServiceId, config: WatchdogConfig) {
        self.entries.lock().unwrap().insert(
            service,
            Entry {
                config,
                status: WatchdogStatus::default(),
            },
        );
    }

    pub fn status(&self, service: ServiceId) -> Option<WatchdogStatus> {
        self.entries.lock().unwrap().get(&service).map(|e| e.status)
    }

    pub fn safe_mode(&self) -> Option<SafeModeReason> {
        *self.safe_mode.lock().unwrap()
    }

    /// Runs one watchdog pass over every configured entry (spec.md §4.I).
    pub fn tick(&self, registry: &ServiceRegistry, hook: &dyn RestartHook, now_ms: u64) {
        let mut entries = self.entries.lock().unwrap();
        for (&service, entry) in entries.iter_mut() {
            let Ok(last_heartbeat) = registry.last_heartbeat_ms(service) else {
                continue;
            };
            let elapsed = now_ms.saturating_sub(last_heartbeat);

            if elapsed > entry.config.timeout_ms {
                if entry.status.timeout_detected {
                    continue;
                }
                entry.status.timeout_detected = true;

                if entry.config.is_critical {
                    let mut safe_mode = self.safe_mode.lock().unwrap();
                    if safe_mode.is_none() {
                        *safe_mode = Some(SafeModeReason {
                            service,
                            elapsed_ms: elapsed,
                        });
                        log::error!("service {service} missed its heartbeat: entering safe mode");
                    }
                } else if entry.config.auto_restart
                    && entry.status.restart_attempts < entry.config.max_restart_attempts
                {
                    match hook.restart(service, RestartCause::WatchdogTimeout) {
                        Ok(()) => {
                            entry.status.timeout_detected = false;
                            entry.status.restart_attempts += 1;
                            // Refresh so the next tick doesn't immediately re-fire on stale state.
                            let _ = registry.heartbeat(service, now_ms);
                        }
                        Err(_) => {
                            entry.status.failed_restarts += 1;
                            if entry.status.restart_attempts + 1 >= entry.config.max_restart_attempts {
                                entry.status.critical_failure = true;
                            } else {
                                // Let the next tick retry rather than getting
                                // stuck behind the `timeout_detected` guard
                                // above, mirroring the `Ok` arm.
                                entry.status.timeout_detected = false;
                                let _ = registry.heartbeat(service, now_ms);
                            }
                        }
                    }
                } else if entry.config.auto_restart {
                    // Attempts exhausted: stop trying and latch the failure.
                    entry.status.critical_failure = true;
                    log::error!("service {service} exhausted its restart attempts");
                } else {
                    log::warn!("service {service} missed its heartbeat by {elapsed}ms");
                }
            } else if entry.status.timeout_detected {
                log::info!("service {service} heartbeat recovered");
                entry.status.timeout_detected = false;
                entry.status.restart_attempts = 0;
            }
        }
    }
}

impl Default for Watchdog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingHook {
        calls: std::sync::atomic::AtomicU32,
        fail_after: u32,
    }

    impl RestartHook for CountingHook {
        fn restart(&self, _service: ServiceId, _cause: RestartCause) -> Result<(), Error> {
            let n = self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if n + 1 > self.fail_after {
                Err(Error::RestartFailed)
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn auto_restart_increments_attempts_on_timeout() {
        let registry = std::sync::Arc::new(ServiceRegistry::new(4));
        let id = registry.register("flaky", 0, 0).unwrap();
        let watchdog = Watchdog::new();
        watchdog.configure(
            id,
            WatchdogConfig {
                timeout_ms: 100,
                auto_restart: true,
                max_restart_attempts: 2,
                is_critical: false,
            },
        );
        let hook = CountingHook {
            calls: std::sync::atomic::AtomicU32::new(0),
            fail_after: 100,
        };

        watchdog.tick(&registry, &hook, 150);
        assert_eq!(watchdog.status(id).unwrap().restart_attempts, 1);

        registry.heartbeat(id, 150).unwrap();
        watchdog.tick(&registry, &hook, 150 + 150);
        assert_eq!(watchdog.status(id).unwrap().restart_attempts, 2);
    }

    #[test]
    fn critical_service_timeout_enters_safe_mode() {
        let registry = std::sync::Arc::new(ServiceRegistry::new(4));
        let id = registry.register("core", 0, 0).unwrap();
        let watchdog = Watchdog::new();
        watchdog.configure(
            id,
            WatchdogConfig {
                timeout_ms: 50,
                auto_restart: false,
                max_restart_attempts: 0,
                is_critical: true,
            },
        );
        let hook = CountingHook {
            calls: std::sync::atomic::AtomicU32::new(0),
            fail_after: 0,
        };
        watchdog.tick(&registry, &hook, 100);
        assert!(watchdog.safe_mode().is_some());
    }
}
