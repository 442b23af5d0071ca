// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The event dispatcher (spec.md §4.G): a single dedicated loop that pops
//! one event at a time, snapshots matching subscribers under the registry
//! lock, releases the lock, then calls each handler through the monitor
//! before freeing the event's payload.

use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rt_hal::Timebase;

use crate::mempool::MemoryPool;
use crate::monitor::HandlerMonitor;
use crate::queue::PriorityQueue;
use crate::subscriptions::{DeliveredEvent, Handler, SubscriptionTable};

/// How long the dispatcher waits on an empty queue before re-checking the
/// shutdown flag. The spec calls for "an effectively infinite wait"; a
/// bounded poll is what makes a clean shutdown possible in a hosted binary.
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(200);

pub struct Dispatcher {
    queue: Arc<PriorityQueue>,
    pool: Arc<MemoryPool>,
    subscriptions: Arc<SubscriptionTable>,
    monitor: Arc<HandlerMonitor>,
    timebase: Arc<dyn Timebase>,
    shutdown: AtomicBool,
}

impl Dispatcher {
    pub fn new(
        queue: Arc<PriorityQueue>,
        pool: Arc<MemoryPool>,
        subscriptions: Arc<SubscriptionTable>,
        monitor: Arc<HandlerMonitor>,
        timebase: Arc<dyn Timebase>,
    ) -> Self {
        Dispatcher {
            queue,
            pool,
            subscriptions,
            monitor,
            timebase,
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Runs the dispatch loop until `request_shutdown` is called. Intended
    /// to be the body of a dedicated task started through `rt_hal::TaskSpawner`.
    pub fn run(&self) {
        while !self.shutdown.load(Ordering::SeqCst) {
            let Some(event) = self.queue.dequeue(Some(SHUTDOWN_POLL_INTERVAL)) else {
                continue;
            };

            let subscribers = self.subscriptions.snapshot_for(event.event_type);
            for sub in subscribers {
                let data = event.payload.as_ref().map(|p| p.as_slice()).unwrap_or(&[]);
                match sub.handler {
                    Handler::Native(f) => {
                        self.monitor.invoke(sub.service, self.timebase.as_ref(), move || {
                            f(DeliveredEvent {
                                event_type: event.event_type,
                                sender: event.sender,
                                data,
                            });
                        });
                    }
                    Handler::Extern { func, user_data } => {
                        let event_type = event.event_type.0;
                        let sender = event.sender.0;
                        let len = data.len() as u32;
                        let ptr = data.as_ptr();
                        let raw_user_data: *mut c_void = user_data.0;
                        self.monitor.invoke(sub.service, self.timebase.as_ref(), move || {
                            func(event_type, sender, ptr, len, raw_user_data);
                        });
                    }
                }
            }

            if let Some(payload) = event.payload {
                self.pool.free(payload);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rt_abi::{EventTypeId, Priority, ServiceId};
    use std::sync::atomic::AtomicUsize;

    struct FixedClock;
    impl Timebase for FixedClock {
        fn now_ms(&self) -> u64 {
            0
        }
    }

    #[test]
    fn delivers_one_event_to_its_subscriber() {
        let queue = Arc::new(PriorityQueue::new([4, 4, 4, 4]));
        let pool = Arc::new(MemoryPool::new([4, 4, 4, 4]));
        let subs = Arc::new(SubscriptionTable::new(4));
        let monitor = Arc::new(HandlerMonitor::new(u64::MAX));
        let timebase: Arc<dyn Timebase> = Arc::new(FixedClock);

        let received = Arc::new(AtomicUsize::new(0));
        let r2 = received.clone();
        subs.subscribe(
            ServiceId(1),
            EventTypeId(0),
            Handler::Native(Arc::new(move |evt: DeliveredEvent| {
                assert_eq!(evt.data, &[7]);
                r2.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();

        let payload = pool.alloc_from(&[7]).unwrap();
        queue
            .enqueue(EventTypeId(0), Priority::Normal, ServiceId(0), 0, Some(payload), &pool)
            .unwrap();

        let dispatcher = Arc::new(Dispatcher::new(queue, pool, subs, monitor, timebase));
        let d2 = dispatcher.clone();
        let handle = std::thread::spawn(move || d2.run());
        std::thread::sleep(Duration::from_millis(50));
        dispatcher.request_shutdown();
        handle.join().unwrap();

        assert_eq!(received.load(Ordering::SeqCst), 1);
    }
}
