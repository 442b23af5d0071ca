// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Four-lane priority queue (spec.md §4.C). Lanes are scanned
//! Critical -> High -> Normal -> Low on dequeue; enqueue writes to the lane
//! matching the event's priority and never reorders within a lane.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use rt_abi::{Error, EventTypeId, Priority, ServiceId};

use crate::mempool::{MemoryPool, PoolHandle};

/// An event that has been assigned a sequence number and is owned by the
/// queue until the dispatcher frees its payload.
pub struct QueuedEvent {
    pub event_type: EventTypeId,
    pub priority: Priority,
    pub sender: ServiceId,
    pub timestamp_ms: u64,
    pub sequence: u64,
    pub payload: Option<PoolHandle>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct QueueStats {
    /// Indexed by lane: [Critical, High, Normal, Low].
    pub overflow_by_lane: [u64; 4],
    pub low_lane_drops: u64,
    pub total_queued: u64,
    pub total_processed: u64,
}

fn lane_index(priority: Priority) -> usize {
    match priority {
        Priority::Critical => 0,
        Priority::High => 1,
        Priority::Normal => 2,
        Priority::Low => 3,
    }
}

const LOW_LANE: usize = 3;

struct Inner {
    lanes: [VecDeque<QueuedEvent>; 4],
    capacities: [usize; 4],
    next_sequence: u64,
    stats: QueueStats,
}

pub struct PriorityQueue {
    inner: Mutex<Inner>,
    not_empty: Condvar,
}

impl PriorityQueue {
    pub fn new(capacities: [usize; 4]) -> Self {
        PriorityQueue {
            inner: Mutex::new(Inner {
                lanes: Default::default(),
                capacities,
                next_sequence: 1,
                stats: QueueStats::default(),
            }),
            not_empty: Condvar::new(),
        }
    }

    /// Enqueues `event`, assigning it the next sequence number. On a full
    /// Low lane the oldest low-priority entry is dropped (its payload freed
    /// through `pool`) and the enqueue retried once; every other lane fails
    /// closed with `Timeout`.
    pub fn enqueue(
        &self,
        event_type: EventTypeId,
        priority: Priority,
        sender: ServiceId,
        timestamp_ms: u64,
        payload: Option<PoolHandle>,
        pool: &MemoryPool,
    ) -> Result<u64, Error> {
        let mut inner = self.inner.lock().unwrap();
        let lane = lane_index(priority);

        if inner.lanes[lane].len() >= inner.capacities[lane] {
            if lane == LOW_LANE {
                if let Some(dropped) = inner.lanes[LOW_LANE].pop_front() {
                    inner.stats.low_lane_drops += 1;
                    if let Some(data) = dropped.payload {
                        pool.free(data);
                    }
                }
            }
            if inner.lanes[lane].len() >= inner.capacities[lane] {
                inner.stats.overflow_by_lane[lane] += 1;
                return Err(Error::Timeout);
            }
        }

        let sequence = inner.next_sequence;
        inner.next_sequence += 1;
        inner.lanes[lane].push_back(QueuedEvent {
            event_type,
            priority,
            sender,
            timestamp_ms,
            sequence,
            payload,
        });
        inner.stats.total_queued += 1;
        drop(inner);
        self.not_empty.notify_one();
        Ok(sequence)
    }

    /// Pops the highest-priority, oldest-enqueued event. Blocks up to
    /// `timeout` (or indefinitely if `None`) when every lane is empty.
    pub fn dequeue(&self, timeout: Option<Duration>) -> Option<QueuedEvent> {
        let mut inner = self.inner.lock().unwrap();
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            for lane in inner.lanes.iter_mut() {
                if let Some(event) = lane.pop_front() {
                    inner.stats.total_processed += 1;
                    return Some(event);
                }
            }

            inner = match deadline {
                None => self.not_empty.wait(inner).unwrap(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    let (guard, _) = self
                        .not_empty
                        .wait_timeout(inner, deadline - now)
                        .unwrap();
                    guard
                }
            };
        }
    }

    pub fn stats(&self) -> QueueStats {
        self.inner.lock().unwrap().stats
    }

    pub fn depths(&self) -> [usize; 4] {
        let inner = self.inner.lock().unwrap();
        std::array::from_fn(|i| inner.lanes[i].len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn evt(priority: Priority) -> (EventTypeId, Priority, ServiceId, u64, Option<PoolHandle>) {
        (EventTypeId(0), priority, ServiceId(0), 0, None)
    }

    #[test]
    fn priority_overtakes_fifo_order() {
        let pool = MemoryPool::new([0, 0, 0, 0]);
        let q = PriorityQueue::new([4, 4, 4, 4]);
        let (t, p, s, ts, pl) = evt(Priority::Normal);
        q.enqueue(t, p, s, ts, pl, &pool).unwrap();
        let (t, p, s, ts, pl) = evt(Priority::Critical);
        q.enqueue(t, p, s, ts, pl, &pool).unwrap();
        let (t, p, s, ts, pl) = evt(Priority::Normal);
        q.enqueue(t, p, s, ts, pl, &pool).unwrap();

        let first = q.dequeue(Some(Duration::from_millis(10))).unwrap();
        assert_eq!(first.priority, Priority::Critical);
        assert_eq!(first.sequence, 2);
        let second = q.dequeue(Some(Duration::from_millis(10))).unwrap();
        assert_eq!(second.sequence, 1);
        let third = q.dequeue(Some(Duration::from_millis(10))).unwrap();
        assert_eq!(third.sequence, 3);
    }

    #[test]
    fn full_low_lane_drops_oldest() {
        let pool = MemoryPool::new([0, 0, 0, 0]);
        let q = PriorityQueue::new([4, 4, 4, 1]);
        let (t, p, s, ts, pl) = evt(Priority::Low);
        q.enqueue(t, p, s, ts, pl, &pool).unwrap();
        let (t, p, s, ts, pl) = evt(Priority::Low);
        let seq = q.enqueue(t, p, s, ts, pl, &pool).unwrap();
        let remaining = q.dequeue(Some(Duration::from_millis(10))).unwrap();
        assert_eq!(remaining.sequence, seq);
        assert_eq!(q.stats().low_lane_drops, 1);
    }

    #[test]
    fn full_high_lane_times_out_without_dropping() {
        let pool = MemoryPool::new([0, 0, 0, 0]);
        let q = PriorityQueue::new([4, 1, 4, 4]);
        let (t, p, s, ts, pl) = evt(Priority::High);
        q.enqueue(t, p, s, ts, pl, &pool).unwrap();
        let (t, p, s, ts, pl) = evt(Priority::High);
        let err = q.enqueue(t, p, s, ts, pl, &pool).unwrap_err();
        assert_eq!(err, Error::Timeout);
    }

    #[test]
    fn dequeue_times_out_on_empty_queue() {
        let q = PriorityQueue::new([4, 4, 4, 4]);
        assert!(q.dequeue(Some(Duration::from_millis(5))).is_none());
    }
}
