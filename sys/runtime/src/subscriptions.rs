// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Subscription table: `(service, event_type) -> handler` (spec.md §4.F).
//! Subscribe is idempotent per key; unsubscribe and service unregistration
//! both mark entries inactive rather than compacting the table, so the
//! dispatcher's linear scan never has to deal with a moving slot index
//! mid-iteration.

use std::ffi::c_void;
use std::sync::{Arc, Mutex};

use rt_abi::{EventHandlerFn, Error, EventTypeId, ServiceId};

/// An opaque pointer handed back to a handler unchanged. The subscriber
/// owns the referent and must keep it alive until `unsubscribe` returns
/// (spec.md §5 "Memory ownership"); the table only ever moves the pointer
/// value around.
#[derive(Copy, Clone)]
pub struct ExternUserData(pub *mut c_void);

// Safety: the table never dereferences this pointer itself, only passes it
// back to the subscriber's own handler, which runs on the single dispatcher
// task. The subscriber is responsible for any synchronization the referent
// needs.
unsafe impl Send for ExternUserData {}
unsafe impl Sync for ExternUserData {}

/// A delivered event, as seen by a native (in-process) handler.
pub struct DeliveredEvent<'a> {
    pub event_type: EventTypeId,
    pub sender: ServiceId,
    pub data: &'a [u8],
}

#[derive(Clone)]
pub enum Handler {
    /// A handler belonging to a native, in-process service.
    Native(Arc<dyn Fn(DeliveredEvent) + Send + Sync>),
    /// A handler belonging to a loaded app, called through the frozen
    /// `AppContext` ABI (spec.md §4.M.1).
    Extern {
        func: EventHandlerFn,
        user_data: ExternUserData,
    },
}

#[derive(Clone)]
pub struct SubscriptionEntry {
    pub service: ServiceId,
    pub event_type: EventTypeId,
    pub handler: Handler,
    active: bool,
}

pub struct SubscriptionTable {
    entries: Mutex<Vec<Option<SubscriptionEntry>>>,
}

impl SubscriptionTable {
    pub fn new(capacity: usize) -> Self {
        let mut entries = Vec::with_capacity(capacity);
        entries.resize_with(capacity, || None);
        SubscriptionTable {
            entries: Mutex::new(entries),
        }
    }

    /// Subscribes `service` to `event_type`. A second call with the same
    /// key is a no-op success, matching spec.md §3.
    pub fn subscribe(
        &self,
        service: ServiceId,
        event_type: EventTypeId,
        handler: Handler,
    ) -> Result<(), Error> {
        let mut entries = self.entries.lock().unwrap();
        if entries.iter().flatten().any(|e| {
            e.active && e.service == service && e.event_type == event_type
        }) {
            return Ok(());
        }
        let slot = entries
            .iter()
            .position(|e| e.as_ref().map_or(true, |e| !e.active))
            .ok_or(Error::SubscriptionFull)?;
        entries[slot] = Some(SubscriptionEntry {
            service,
            event_type,
            handler,
            active: true,
        });
        Ok(())
    }

    pub fn unsubscribe(&self, service: ServiceId, event_type: EventTypeId) -> Result<(), Error> {
        let mut entries = self.entries.lock().unwrap();
        let found = entries.iter_mut().flatten().find(|e| {
            e.active && e.service == service && e.event_type == event_type
        });
        match found {
            Some(entry) => {
                entry.active = false;
                Ok(())
            }
            None => Err(Error::NotFound),
        }
    }

    /// Deactivates every subscription owned by `service`. Returns the
    /// number deactivated, used when unregistering the owning service.
    pub fn deactivate_all_for(&self, service: ServiceId) -> usize {
        let mut entries = self.entries.lock().unwrap();
        let mut count = 0;
        for entry in entries.iter_mut().flatten() {
            if entry.active && entry.service == service {
                entry.active = false;
                count += 1;
            }
        }
        count
    }

    pub fn active_count_for(&self, service: ServiceId) -> usize {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .flatten()
            .filter(|e| e.active && e.service == service)
            .count()
    }

    /// Snapshot of every active subscription matching `event_type`, taken
    /// under the table lock and returned by value so the dispatcher can
    /// release the lock before invoking handlers (spec.md §4.G step 2).
    pub fn snapshot_for(&self, event_type: EventTypeId) -> Vec<SubscriptionEntry> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .flatten()
            .filter(|e| e.active && e.event_type == event_type)
            .cloned()
            .collect()
    }
}
