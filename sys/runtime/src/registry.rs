// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Slotted service table (spec.md §4.D). `service_id` is the slot index and
//! is stable for the registration's lifetime.

use std::sync::Mutex;

use rt_abi::{BoundedString, Error, ServiceId, ServiceState};

pub struct ServiceEntry {
    pub name: BoundedString<31>,
    pub state: ServiceState,
    pub context: usize,
    pub last_heartbeat_ms: u64,
    pub event_count: u64,
}

pub struct ServiceRegistry {
    slots: Mutex<Vec<Option<ServiceEntry>>>,
}

impl ServiceRegistry {
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        ServiceRegistry {
            slots: Mutex::new(slots),
        }
    }

    pub fn register(&self, name: &str, context: usize, now_ms: u64) -> Result<ServiceId, Error> {
        let bounded = BoundedString::try_from_str(name)?;
        let mut slots = self.slots.lock().unwrap();
        if slots
            .iter()
            .flatten()
            .any(|entry| entry.name.as_str() == name)
        {
            return Err(Error::AlreadyExists);
        }
        let idx = slots
            .iter()
            .position(|slot| slot.is_none())
            .ok_or(Error::RegistryFull)?;
        slots[idx] = Some(ServiceEntry {
            name: bounded,
            state: ServiceState::Registered,
            context,
            last_heartbeat_ms: now_ms,
            event_count: 0,
        });
        Ok(ServiceId::from_index(idx))
    }

    /// Removes the service and returns `true` if it existed. The caller
    /// (the owning `System`) is responsible for deactivating this service's
    /// subscriptions in the same critical section, per spec.md §3.
    pub fn unregister(&self, id: ServiceId) -> bool {
        let mut slots = self.slots.lock().unwrap();
        match slots.get_mut(id.index()) {
            Some(slot @ Some(_)) => {
                *slot = None;
                true
            }
            _ => false,
        }
    }

    pub fn set_state(&self, id: ServiceId, state: ServiceState) -> Result<(), Error> {
        let mut slots = self.slots.lock().unwrap();
        let entry = slots
            .get_mut(id.index())
            .and_then(|s| s.as_mut())
            .ok_or(Error::NotFound)?;
        entry.state = state;
        Ok(())
    }

    pub fn state(&self, id: ServiceId) -> Result<ServiceState, Error> {
        let slots = self.slots.lock().unwrap();
        slots
            .get(id.index())
            .and_then(|s| s.as_ref())
            .map(|e| e.state)
            .ok_or(Error::NotFound)
    }

    pub fn heartbeat(&self, id: ServiceId, now_ms: u64) -> Result<(), Error> {
        let mut slots = self.slots.lock().unwrap();
        let entry = slots
            .get_mut(id.index())
            .and_then(|s| s.as_mut())
            .ok_or(Error::NotFound)?;
        entry.last_heartbeat_ms = now_ms;
        Ok(())
    }

    pub fn last_heartbeat_ms(&self, id: ServiceId) -> Result<u64, Error> {
        let slots = self.slots.lock().unwrap();
        slots
            .get(id.index())
            .and_then(|s| s.as_ref())
            .map(|e| e.last_heartbeat_ms)
            .ok_or(Error::NotFound)
    }

    pub fn is_registered(&self, id: ServiceId) -> bool {
        let slots = self.slots.lock().unwrap();
        matches!(slots.get(id.index()), Some(Some(_)))
    }

    pub fn name(&self, id: ServiceId) -> Result<BoundedString<31>, Error> {
        let slots = self.slots.lock().unwrap();
        slots
            .get(id.index())
            .and_then(|s| s.as_ref())
            .map(|e| e.name)
            .ok_or(Error::NotFound)
    }

    pub fn context(&self, id: ServiceId) -> Result<usize, Error> {
        let slots = self.slots.lock().unwrap();
        slots
            .get(id.index())
            .and_then(|s| s.as_ref())
            .map(|e| e.context)
            .ok_or(Error::NotFound)
    }

    pub fn record_event_posted(&self, id: ServiceId) -> Result<(), Error> {
        let mut slots = self.slots.lock().unwrap();
        let entry = slots
            .get_mut(id.index())
            .and_then(|s| s.as_mut())
            .ok_or(Error::NotFound)?;
        entry.event_count += 1;
        Ok(())
    }

    pub fn count(&self) -> usize {
        self.slots.lock().unwrap().iter().flatten().count()
    }

    /// All registered ids; used by the watchdog tick and safe-mode sweeps.
    pub fn registered_ids(&self) -> Vec<ServiceId> {
        self.slots
            .lock()
            .unwrap()
            .iter()
            .enumerate()
            .filter_map(|(idx, s)| s.as_ref().map(|_| ServiceId::from_index(idx)))
            .collect()
    }
}
