// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Name-to-id interning for event types (spec.md §4.E). `id = slot`, and
//! re-registering an existing name is a no-op that returns the same id.

use std::sync::Mutex;

use rt_abi::{BoundedString, Error, EventTypeId};

pub struct EventTypeRegistry {
    slots: Mutex<Vec<Option<BoundedString<31>>>>,
}

impl EventTypeRegistry {
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        EventTypeRegistry {
            slots: Mutex::new(slots),
        }
    }

    pub fn register(&self, name: &str) -> Result<EventTypeId, Error> {
        let mut slots = self.slots.lock().unwrap();
        if let Some(idx) = slots
            .iter()
            .position(|s| s.as_ref().is_some_and(|n| n.as_str() == name))
        {
            return Ok(EventTypeId::from_index(idx));
        }
        let bounded = BoundedString::try_from_str(name)?;
        let idx = slots
            .iter()
            .position(|s| s.is_none())
            .ok_or(Error::RegistryFull)?;
        slots[idx] = Some(bounded);
        Ok(EventTypeId::from_index(idx))
    }

    pub fn name(&self, id: EventTypeId) -> Result<BoundedString<31>, Error> {
        let slots = self.slots.lock().unwrap();
        slots
            .get(id.index())
            .and_then(|s| s.as_ref())
            .copied()
            .ok_or(Error::NotFound)
    }

    pub fn is_registered(&self, id: EventTypeId) -> bool {
        matches!(self.slots.lock().unwrap().get(id.index()), Some(Some(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn re_registering_same_name_returns_same_id() {
        let reg = EventTypeRegistry::new(4);
        let a = reg.register("tick").unwrap();
        let b = reg.register("tick").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn distinct_names_get_distinct_ids() {
        let reg = EventTypeRegistry::new(4);
        let a = reg.register("tick").unwrap();
        let b = reg.register("tock").unwrap();
        assert_ne!(a, b);
        assert_eq!(reg.name(a).unwrap().as_str(), "tick");
        assert_eq!(reg.name(b).unwrap().as_str(), "tock");
    }

    #[test]
    fn full_registry_rejects_new_names() {
        let reg = EventTypeRegistry::new(1);
        reg.register("tick").unwrap();
        assert_eq!(reg.register("tock").unwrap_err(), Error::RegistryFull);
    }
}
