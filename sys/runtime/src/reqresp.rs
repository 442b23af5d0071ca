// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Sync-over-async request/response layer (spec.md §4.K): a small ring of
//! pending requests identified by a non-zero sequence number, with blocking
//! (`send_sync`) and callback (`send_async`) variants.
//!
//! The surveyed source always records `requester = 0`; this spec requires a
//! real requester id but leaves how the caller obtains it unspecified
//! (spec.md §9). Here the caller simply passes its own `ServiceId` in.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use rt_abi::{Error, ServiceId};

pub type RequestId = std::num::NonZeroU32;

const MAX_PENDING: usize = 16;

struct SyncSlot {
    ready: Mutex<Option<Vec<u8>>>,
    signal: Condvar,
}

enum Kind {
    Sync(Arc<SyncSlot>),
    Async(Box<dyn FnOnce(RequestId, &[u8]) + Send>),
}

struct Pending {
    #[allow(dead_code)] // kept for introspection/future accounting, not read yet
    requester: ServiceId,
    kind: Kind,
}

pub struct RequestTable {
    slots: Mutex<HashMap<RequestId, Pending>>,
    next_id: AtomicU32,
}

impl RequestTable {
    pub fn new() -> Self {
        RequestTable {
            slots: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(1),
        }
    }

    fn allocate_id(&self) -> RequestId {
        loop {
            let candidate = self.next_id.fetch_add(1, Ordering::Relaxed);
            if let Some(id) = RequestId::new(candidate) {
                return id;
            }
            // candidate == 0 after wraparound; loop to skip it.
        }
    }

    /// Allocates a pending slot, hands the assigned id to `post` so the
    /// caller can stamp it into the outgoing request's payload header, then
    /// blocks up to `timeout` for a response. On success the response is
    /// copied into `buf` (truncated to its length) and the actual size
    /// returned.
    pub fn send_sync(
        &self,
        requester: ServiceId,
        post: impl FnOnce(RequestId) -> Result<(), Error>,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, Error> {
        let id = self.allocate_id();
        let slot = Arc::new(SyncSlot {
            ready: Mutex::new(None),
            signal: Condvar::new(),
        });
        {
            let mut slots = self.slots.lock().unwrap();
            if slots.len() >= MAX_PENDING {
                return Err(Error::NoMemory);
            }
            slots.insert(
                id,
                Pending {
                    requester,
                    kind: Kind::Sync(slot.clone()),
                },
            );
        }

        if let Err(e) = post(id) {
            self.slots.lock().unwrap().remove(&id);
            return Err(e);
        }

        let data = {
            let guard = slot.ready.lock().unwrap();
            let (mut guard, _) = slot
                .signal
                .wait_timeout_while(guard, timeout, |r| r.is_none())
                .unwrap();
            guard.take()
        };
        // No-op if `send_response` already removed it; present if we timed out.
        self.slots.lock().unwrap().remove(&id);

        match data {
            Some(data) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                Ok(n)
            }
            None => Err(Error::Timeout),
        }
    }

    /// Registers `callback` for the response and returns immediately; `post`
    /// is called with the allocated id before registration completes.
    pub fn send_async(
        &self,
        requester: ServiceId,
        post: impl FnOnce(RequestId) -> Result<(), Error>,
        callback: impl FnOnce(RequestId, &[u8]) + Send + 'static,
    ) -> Result<RequestId, Error> {
        let id = self.allocate_id();
        {
            let mut slots = self.slots.lock().unwrap();
            if slots.len() >= MAX_PENDING {
                return Err(Error::NoMemory);
            }
            slots.insert(
                id,
                Pending {
                    requester,
                    kind: Kind::Async(Box::new(callback)),
                },
            );
        }
        if let Err(e) = post(id) {
            self.slots.lock().unwrap().remove(&id);
            return Err(e);
        }
        Ok(id)
    }

    /// Delivers a response to the slot identified by `id`. Unknown or
    /// already-reaped ids fail with `NotFound`, matching spec.md §4.K.
    pub fn send_response(&self, id: RequestId, data: &[u8]) -> Result<(), Error> {
        let pending = self.slots.lock().unwrap().remove(&id).ok_or(Error::NotFound)?;
        match pending.kind {
            Kind::Async(callback) => {
                callback(id, data);
                Ok(())
            }
            Kind::Sync(slot) => {
                *slot.ready.lock().unwrap() = Some(data.to_vec());
                slot.signal.notify_one();
                Ok(())
            }
        }
    }

    /// Frees the slot; any response that arrives afterward for this id is
    /// silently discarded by `send_response` returning `NotFound`.
    pub fn cancel(&self, id: RequestId) {
        self.slots.lock().unwrap().remove(&id);
    }

    pub fn pending_count(&self) -> usize {
        self.slots.lock().unwrap().len()
    }
}

impl Default for RequestTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;

    #[test]
    fn send_sync_round_trips_through_send_response() {
        let table = Arc::new(RequestTable::new());
        let t2 = table.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            let id = RequestId::new(1).unwrap();
            t2.send_response(id, b"pong").unwrap();
        });

        let mut buf = [0u8; 8];
        let n = table
            .send_sync(ServiceId(0), |_id| Ok(()), &mut buf, Duration::from_secs(1))
            .unwrap();
        handle.join().unwrap();
        assert_eq!(&buf[..n], b"pong");
    }

    #[test]
    fn send_sync_times_out_without_a_response() {
        let table = RequestTable::new();
        let mut buf = [0u8; 8];
        let err = table
            .send_sync(ServiceId(0), |_id| Ok(()), &mut buf, Duration::from_millis(20))
            .unwrap_err();
        assert_eq!(err, Error::Timeout);
    }

    #[test]
    fn send_async_invokes_callback_on_response() {
        let table = Arc::new(RequestTable::new());
        let (tx, rx) = mpsc::channel();
        let id = table
            .send_async(ServiceId(0), |_id| Ok(()), move |_id, data| {
                tx.send(data.to_vec()).unwrap();
            })
            .unwrap();
        table.send_response(id, b"ack").unwrap();
        assert_eq!(rx.recv().unwrap(), b"ack");
    }

    #[test]
    fn cancel_makes_late_response_not_found() {
        let table = RequestTable::new();
        let id = table.send_async(ServiceId(0), |_id| Ok(()), |_, _| {}).unwrap();
        table.cancel(id);
        assert_eq!(table.send_response(id, b"late").unwrap_err(), Error::NotFound);
    }
}
