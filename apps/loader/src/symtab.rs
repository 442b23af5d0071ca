// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host symbol table (spec.md §4.O): the fixed set of host exports visible
//! to a dynamically loaded app during relocation. Lookup is linear and
//! case-sensitive; registration is idempotent-replace.

use std::sync::Mutex;

use rt_abi::Error;

/// Default capacity, per spec.md §4.O "capacity is fixed (>= 256)".
pub const HOST_SYMBOL_TABLE_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SymbolKind {
    Function,
    Data,
}

struct Entry {
    name: String,
    address: usize,
    kind: SymbolKind,
}

pub struct HostSymbolTable {
    entries: Mutex<Vec<Entry>>,
    capacity: usize,
}

impl HostSymbolTable {
    pub fn new(capacity: usize) -> Self {
        HostSymbolTable {
            entries: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
        }
    }

    /// Registers `name` at `address`. Re-registering an existing name
    /// replaces its address and kind in place.
    pub fn register(&self, name: &str, address: usize, kind: SymbolKind) -> Result<(), Error> {
        let mut entries = self.entries.lock().unwrap();
        if let Some(existing) = entries.iter_mut().find(|e| e.name == name) {
            existing.address = address;
            existing.kind = kind;
            return Ok(());
        }
        if entries.len() >= self.capacity {
            return Err(Error::RegistryFull);
        }
        entries.push(Entry {
            name: name.to_string(),
            address,
            kind,
        });
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<usize> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.address)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every registered export, for introspection tooling
    /// (spec.md §6 "get_all(&count) -> entries").
    pub fn get_all(&self) -> Vec<(String, usize, SymbolKind)> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .map(|e| (e.name.clone(), e.address, e.kind))
            .collect()
    }
}

impl Default for HostSymbolTable {
    fn default() -> Self {
        Self::new(HOST_SYMBOL_TABLE_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_misses_return_none() {
        let table = HostSymbolTable::default();
        assert!(table.lookup("memcpy").is_none());
    }

    #[test]
    fn register_then_lookup_round_trips() {
        let table = HostSymbolTable::default();
        table.register("memcpy", 0x1000, SymbolKind::Function).unwrap();
        assert_eq!(table.lookup("memcpy"), Some(0x1000));
    }

    #[test]
    fn re_registering_replaces_in_place() {
        let table = HostSymbolTable::default();
        table.register("memcpy", 0x1000, SymbolKind::Function).unwrap();
        table.register("memcpy", 0x2000, SymbolKind::Function).unwrap();
        assert_eq!(table.lookup("memcpy"), Some(0x2000));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn get_all_snapshots_every_entry() {
        let table = HostSymbolTable::default();
        table.register("memcpy", 0x1000, SymbolKind::Function).unwrap();
        table.register("g_counter", 0x2000, SymbolKind::Data).unwrap();
        let all = table.get_all();
        assert_eq!(all.len(), 2);
        assert!(all.contains(&("memcpy".to_string(), 0x1000, SymbolKind::Function)));
        assert!(all.contains(&("g_counter".to_string(), 0x2000, SymbolKind::Data)));
    }

    #[test]
    fn full_table_rejects_new_names() {
        let table = HostSymbolTable::new(1);
        table.register("a", 1, SymbolKind::Function).unwrap();
        assert_eq!(
            table.register("b", 2, SymbolKind::Function).unwrap_err(),
            Error::RegistryFull
        );
    }
}
