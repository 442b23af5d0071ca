// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! `System`: the single owned runtime object spec.md §9 asks for in place
//! of "global mutable state guarded by a single lock". Every "global" API
//! the spec describes is a method here; thread safety comes from the
//! components' own internal synchronization, not from holding one lock for
//! the whole call.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rt_abi::{
    EventTypeId, Priority, SafeModeReason, ServiceId, ServiceState,
};
use rt_hal::{TaskHandle, TaskSpawner, TaskSpec, Timebase};

use crate::config::SystemConfig;
use crate::deps::DependencyGraph;
use crate::dispatcher::Dispatcher;
use crate::event_types::EventTypeRegistry;
use crate::mempool::MemoryPool;
use crate::monitor::HandlerMonitor;
use crate::queue::PriorityQueue;
use crate::quota::{QuotaConfig, QuotaUsage, ResourceQuota};
use crate::registry::ServiceRegistry;
use crate::reqresp::{RequestId, RequestTable};
use crate::security::{SecureKeyGuard, SecurityToken};
use crate::subscriptions::{Handler, SubscriptionTable};
use crate::watchdog::{RestartHook, ServiceErrorRestartHook, Watchdog, WatchdogConfig, WatchdogStatus};
use rt_abi::Error;

pub struct System {
    config: SystemConfig,
    security: SecureKeyGuard,
    pool: Arc<MemoryPool>,
    queue: Arc<PriorityQueue>,
    registry: Arc<ServiceRegistry>,
    event_types: Arc<EventTypeRegistry>,
    subscriptions: Arc<SubscriptionTable>,
    quota: Arc<ResourceQuota>,
    watchdog: Arc<Watchdog>,
    deps: Arc<DependencyGraph>,
    requests: Arc<RequestTable>,
    monitor: Arc<HandlerMonitor>,
    timebase: Arc<dyn Timebase>,
    spawner: Arc<dyn TaskSpawner>,
    restart_hook: Mutex<Arc<dyn RestartHook>>,
    dispatcher: Arc<Dispatcher>,
    running: AtomicBool,
    dispatcher_task: Mutex<Option<Box<dyn TaskHandle>>>,
    ticker_task: Mutex<Option<Box<dyn TaskHandle>>>,
}

impl System {
    pub fn new(
        config: SystemConfig,
        timebase: Arc<dyn Timebase>,
        spawner: Arc<dyn TaskSpawner>,
    ) -> (Arc<System>, SecurityToken) {
        let (security, token) = SecureKeyGuard::new(timebase.as_ref());
        let registry = Arc::new(ServiceRegistry::new(config.max_services));
        let event_types = Arc::new(EventTypeRegistry::new(config.max_event_types));
        let subscriptions = Arc::new(SubscriptionTable::new(config.max_subscriptions));
        let pool = Arc::new(MemoryPool::new(config.memory_pool.class_counts));
        let queue = Arc::new(PriorityQueue::new(config.queue.lane_capacities));
        let quota = Arc::new(ResourceQuota::new());
        let watchdog = Arc::new(Watchdog::new());
        let deps = Arc::new(DependencyGraph::new());
        let requests = Arc::new(RequestTable::new());
        let monitor = Arc::new(HandlerMonitor::new(config.handler_warn_threshold_us));
        let restart_hook: Arc<dyn RestartHook> =
            Arc::new(ServiceErrorRestartHook::new(registry.clone()));

        let dispatcher = Arc::new(Dispatcher::new(
            queue.clone(),
            pool.clone(),
            subscriptions.clone(),
            monitor.clone(),
            timebase.clone(),
        ));

        let system = Arc::new(System {
            config,
            security,
            pool,
            queue,
            registry,
            event_types,
            subscriptions,
            quota,
            watchdog,
            deps,
            requests,
            monitor,
            timebase,
            spawner,
            restart_hook: Mutex::new(restart_hook),
            dispatcher,
            running: AtomicBool::new(false),
            dispatcher_task: Mutex::new(None),
            ticker_task: Mutex::new(None),
        });
        (system, token)
    }

    // -- component accessors, for wiring an AppManager against the same
    // shared instances (sys/runtime and apps/loader avoid a dependency
    // cycle by sharing these Arcs rather than apps/loader owning its own).

    pub fn registry(&self) -> Arc<ServiceRegistry> {
        self.registry.clone()
    }

    pub fn event_types(&self) -> Arc<EventTypeRegistry> {
        self.event_types.clone()
    }

    pub fn subscriptions(&self) -> Arc<SubscriptionTable> {
        self.subscriptions.clone()
    }

    pub fn quota(&self) -> Arc<ResourceQuota> {
        self.quota.clone()
    }

    pub fn watchdog(&self) -> Arc<Watchdog> {
        self.watchdog.clone()
    }

    pub fn dependencies(&self) -> Arc<DependencyGraph> {
        self.deps.clone()
    }

    pub fn requests(&self) -> Arc<RequestTable> {
        self.requests.clone()
    }

    pub fn pool(&self) -> Arc<MemoryPool> {
        self.pool.clone()
    }

    pub fn timebase(&self) -> Arc<dyn Timebase> {
        self.timebase.clone()
    }

    pub fn spawner(&self) -> Arc<dyn TaskSpawner> {
        self.spawner.clone()
    }

    /// Installs the restart hook invoked by the watchdog (spec.md §4.M.5).
    /// The app manager calls this once, at bring-up, to replace the default
    /// "mark the service Error" fallback with real Stop->Start semantics for
    /// apps.
    pub fn set_restart_hook(&self, token: SecurityToken, hook: Arc<dyn RestartHook>) -> Result<(), Error> {
        self.security.verify(token)?;
        *self.restart_hook.lock().unwrap() = hook;
        Ok(())
    }

    fn now_ms(&self) -> u64 {
        self.timebase.now_ms()
    }

    // -- D: service registry --

    pub fn register_service(&self, name: &str, context: usize) -> Result<ServiceId, Error> {
        let id = self.registry.register(name, context, self.now_ms())?;
        self.apply_service_config(name, id)?;
        Ok(id)
    }

    /// Applies the static quota/watchdog/dependency bring-up table from
    /// `SystemConfig` for a just-registered service, keyed by name (the
    /// config is parsed before any `ServiceId` exists to assign it to).
    fn apply_service_config(&self, name: &str, id: ServiceId) -> Result<(), Error> {
        let Some(entry) = self.config.services.iter().find(|s| s.name == name) else {
            return Ok(());
        };
        if let Some(quota) = entry.quota {
            self.quota.set(id, quota);
        }
        if let Some(watchdog) = entry.watchdog {
            self.watchdog.configure(id, watchdog);
        }
        for dependency in &entry.depends_on {
            self.deps.add(name, dependency)?;
        }
        Ok(())
    }

    pub fn unregister_service(&self, id: ServiceId) -> Result<(), Error> {
        if !self.registry.unregister(id) {
            return Err(Error::NotFound);
        }
        self.subscriptions.deactivate_all_for(id);
        Ok(())
    }

    pub fn set_state(&self, id: ServiceId, state: ServiceState) -> Result<(), Error> {
        self.registry.set_state(id, state)
    }

    pub fn heartbeat(&self, id: ServiceId) -> Result<(), Error> {
        self.registry.heartbeat(id, self.now_ms())
    }

    // -- E: event-type registry --

    pub fn register_type(&self, name: &str) -> Result<EventTypeId, Error> {
        self.event_types.register(name)
    }

    pub fn get_type_name(&self, id: EventTypeId) -> Result<String, Error> {
        self.event_types.name(id).map(|s| s.as_str().to_string())
    }

    // -- F: subscriptions --

    pub fn subscribe(&self, service: ServiceId, event_type: EventTypeId, handler: Handler) -> Result<(), Error> {
        if !self.registry.is_registered(service) {
            return Err(Error::NotFound);
        }
        if !self.event_types.is_registered(event_type) {
            return Err(Error::NotFound);
        }
        self.quota.check_and_record_subscribe(service)?;
        if let Err(e) = self.subscriptions.subscribe(service, event_type, handler) {
            self.quota.release_subscription(service);
            return Err(e);
        }
        Ok(())
    }

    pub fn unsubscribe(&self, service: ServiceId, event_type: EventTypeId) -> Result<(), Error> {
        self.subscriptions.unsubscribe(service, event_type)?;
        self.quota.release_subscription(service);
        Ok(())
    }

    // -- G/H/C/B: post an event through quota, pool and queue --

    pub fn post(
        &self,
        sender: ServiceId,
        event_type: EventTypeId,
        priority: Priority,
        data: &[u8],
    ) -> Result<u64, Error> {
        if data.len() > rt_abi::MAX_EVENT_PAYLOAD {
            return Err(Error::PayloadTooLarge);
        }
        self.quota.check_and_record_post(sender, data.len())?;

        let payload = if data.is_empty() {
            None
        } else {
            let handle = self.pool.alloc_from(data)?;
            self.quota.record_memory(sender, handle.len() as u64);
            Some(handle)
        };

        let result = self
            .queue
            .enqueue(event_type, priority, sender, self.now_ms(), payload, &self.pool);

        match result {
            Ok(seq) => {
                let _ = self.registry.record_event_posted(sender);
                Ok(seq)
            }
            Err(e) => Err(e),
        }
    }

    // -- H: quota configuration --

    pub fn configure_quota(&self, service: ServiceId, config: QuotaConfig) {
        self.quota.set(service, config);
    }

    pub fn quota_usage(&self, service: ServiceId) -> Option<QuotaUsage> {
        self.quota.usage(service)
    }

    // -- I: watchdog --

    pub fn configure_watchdog(&self, service: ServiceId, config: WatchdogConfig) {
        self.watchdog.configure(service, config);
    }

    pub fn watchdog_status(&self, service: ServiceId) -> Option<WatchdogStatus> {
        self.watchdog.status(service)
    }

    pub fn safe_mode(&self) -> Option<SafeModeReason> {
        self.watchdog.safe_mode()
    }

    /// Runs one watchdog pass immediately; normally driven by the internal
    /// ticker task started by `start`, exposed directly for deterministic
    /// tests.
    pub fn watchdog_tick(&self) {
        let hook = self.restart_hook.lock().unwrap().clone();
        self.watchdog.tick(&self.registry, hook.as_ref(), self.now_ms());
    }

    // -- J: dependency graph --

    pub fn dependency_add(&self, service: &str, depends_on: &str) -> Result<(), Error> {
        self.deps.add(service, depends_on)
    }

    pub fn dependency_init_order(&self) -> Vec<String> {
        self.deps.init_order()
    }

    pub fn dependency_check_ready(&self, service: &str) -> Result<(), Error> {
        self.deps.check_ready(service)
    }

    pub fn dependency_mark_initialized(&self, service: &str) {
        self.deps.mark_initialized(service);
    }

    // -- K: request/response --

    pub fn send_sync(
        &self,
        requester: ServiceId,
        post: impl FnOnce(RequestId) -> Result<(), Error>,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, Error> {
        self.requests.send_sync(requester, post, buf, timeout)
    }

    pub fn send_async(
        &self,
        requester: ServiceId,
        post: impl FnOnce(RequestId) -> Result<(), Error>,
        callback: impl FnOnce(RequestId, &[u8]) + Send + 'static,
    ) -> Result<RequestId, Error> {
        self.requests.send_async(requester, post, callback)
    }

    pub fn send_response(&self, id: RequestId, data: &[u8]) -> Result<(), Error> {
        self.requests.send_response(id, data)
    }

    pub fn cancel_request(&self, id: RequestId) {
        self.requests.cancel(id);
    }

    // -- lifecycle --

    /// Starts the dispatcher task and the watchdog/quota ticker task.
    /// Requires the token issued by `System::new`.
    pub fn start(self: &Arc<Self>, token: SecurityToken) -> Result<(), Error> {
        self.security.verify(token)?;
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(Error::InvalidState);
        }

        let dispatcher = self.dispatcher.clone();
        let dispatcher_handle = self.spawner.spawn(TaskSpec {
            name: "event-dispatcher".to_string(),
            stack_size: 4096,
            priority: self.config.dispatcher_priority,
            entry: Box::new(move || dispatcher.run()),
        })?;
        *self.dispatcher_task.lock().unwrap() = Some(dispatcher_handle);

        let this = self.clone();
        let ticker_handle = self.spawner.spawn(TaskSpec {
            name: "watchdog-ticker".to_string(),
            stack_size: 2048,
            priority: self.config.watchdog_priority,
            entry: Box::new(move || this.run_ticker()),
        })?;
        *self.ticker_task.lock().unwrap() = Some(ticker_handle);

        Ok(())
    }

    pub fn stop(&self, token: SecurityToken) -> Result<(), Error> {
        self.security.verify(token)?;
        self.running.store(false, Ordering::SeqCst);
        self.dispatcher.request_shutdown();
        if let Some(handle) = self.dispatcher_task.lock().unwrap().take() {
            let _ = handle.kill();
        }
        if let Some(handle) = self.ticker_task.lock().unwrap().take() {
            let _ = handle.kill();
        }
        Ok(())
    }

    pub fn deinit(&self, token: SecurityToken) -> Result<(), Error> {
        self.security.verify(token)?;
        self.security.deinit();
        Ok(())
    }

    fn run_ticker(&self) {
        let mut last_quota_reset = self.now_ms();
        let mut last_watchdog_tick = self.now_ms();
        while self.running.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(100));
            let now = self.now_ms();
            if now.saturating_sub(last_quota_reset) >= 1000 {
                self.quota.reset_counters();
                last_quota_reset = now;
            }
            if now.saturating_sub(last_watchdog_tick) >= self.config.watchdog_period_ms {
                self.watchdog_tick();
                last_watchdog_tick = now;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    struct TestClock(AtomicU64);
    impl Timebase for TestClock {
        fn now_ms(&self) -> u64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    struct InlineSpawner;
    struct NoopHandle;
    impl TaskHandle for NoopHandle {
        fn suspend(&self) -> Result<(), Error> {
            Ok(())
        }
        fn resume(&self) -> Result<(), Error> {
            Ok(())
        }
        fn kill(&self) -> Result<(), Error> {
            Ok(())
        }
        fn is_alive(&self) -> bool {
            true
        }
    }
    impl TaskSpawner for InlineSpawner {
        fn spawn(&self, spec: TaskSpec) -> Result<Box<dyn TaskHandle>, Error> {
            std::thread::spawn(spec.entry);
            Ok(Box::new(NoopHandle))
        }
    }

    fn test_system() -> (Arc<System>, SecurityToken) {
        System::new(
            SystemConfig::default(),
            Arc::new(TestClock(AtomicU64::new(0))),
            Arc::new(InlineSpawner),
        )
    }

    #[test]
    fn basic_pub_sub_scenario() {
        let (system, _token) = test_system();
        let a = system.register_service("A", 0).unwrap();
        let b = system.register_service("B", 0).unwrap();
        assert_eq!(a.index(), 0);
        assert_eq!(b.index(), 1);

        let tick = system.register_type("tick").unwrap();
        assert_eq!(tick.index(), 0);

        let received = Arc::new(std::sync::Mutex::new(None));
        let r2 = received.clone();
        system
            .subscribe(
                b,
                tick,
                Handler::Native(Arc::new(move |evt: crate::subscriptions::DeliveredEvent| {
                    *r2.lock().unwrap() = Some((evt.sender, evt.event_type, evt.data.to_vec()));
                })),
            )
            .unwrap();

        system.post(a, tick, Priority::Normal, &[7]).unwrap();
        // Drain manually since no dispatcher task is running in this test.
        let event = system.queue.dequeue(Some(Duration::from_millis(100))).unwrap();
        let subs = system.subscriptions.snapshot_for(event.event_type);
        for sub in subs {
            if let Handler::Native(f) = sub.handler {
                f(crate::subscriptions::DeliveredEvent {
                    event_type: event.event_type,
                    sender: event.sender,
                    data: event.payload.as_ref().map(|p| p.as_slice()).unwrap_or(&[]),
                });
            }
        }

        let got = received.lock().unwrap().take().unwrap();
        assert_eq!(got.0, a);
        assert_eq!(got.1, tick);
        assert_eq!(got.2, vec![7]);

        system.unregister_service(b).unwrap();
        assert_eq!(system.subscriptions.snapshot_for(tick).len(), 0);
    }

    #[test]
    fn quota_limits_events_per_second() {
        let (system, _token) = test_system();
        let a = system.register_service("A", 0).unwrap();
        system.configure_quota(
            a,
            QuotaConfig {
                max_events_per_sec: 2,
                max_subscriptions: 4,
                max_payload_bytes: 512,
                max_memory_bytes: 1 << 20,
            },
        );
        let t = system.register_type("tick").unwrap();
        system.post(a, t, Priority::Normal, &[1]).unwrap();
        system.post(a, t, Priority::Normal, &[1]).unwrap();
        assert_eq!(
            system.post(a, t, Priority::Normal, &[1]).unwrap_err(),
            Error::QuotaEventsExceeded
        );
        system.quota.reset_counters();
        assert!(system.post(a, t, Priority::Normal, &[1]).is_ok());
    }

    #[test]
    fn registering_a_configured_service_applies_its_quota_and_watchdog() {
        let mut config = SystemConfig::default();
        config.services.push(crate::config::ServiceConfig {
            name: "sensor".to_string(),
            depends_on: vec!["bus".to_string()],
            quota: Some(QuotaConfig {
                max_events_per_sec: 1,
                max_subscriptions: 1,
                max_payload_bytes: 64,
                max_memory_bytes: 1024,
            }),
            watchdog: Some(WatchdogConfig {
                timeout_ms: 200,
                auto_restart: false,
                max_restart_attempts: 0,
                is_critical: false,
            }),
        });
        let (system, _token) = System::new(
            config,
            Arc::new(TestClock(AtomicU64::new(0))),
            Arc::new(InlineSpawner),
        );
        system.register_service("bus", 0).unwrap();
        let sensor = system.register_service("sensor", 0).unwrap();
        assert!(system.watchdog_status(sensor).is_some());
        assert_eq!(system.quota_usage(sensor).unwrap().events_this_second, 0);
        assert_eq!(system.dependency_check_ready("sensor"), Err(Error::DependencyNotReady));
        system.dependency_mark_initialized("bus");
        assert!(system.dependency_check_ready("sensor").is_ok());
    }

    #[test]
    fn lifecycle_calls_require_the_issued_token() {
        let (system, _token) = test_system();
        let wrong = SecurityToken(0xDEAD_BEEF);
        assert_eq!(system.stop(wrong).unwrap_err(), Error::SecurityInvalidKey);
    }
}
