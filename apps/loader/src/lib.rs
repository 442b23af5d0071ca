// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Dynamic application loading: the ELF loader (spec.md §4.N), the host
//! symbol table it resolves against (§4.O), and the app lifecycle manager
//! that drives both through the frozen `AppContext` ABI (§4.M).

pub mod elf;
pub mod manager;
pub mod reloc;
pub mod symtab;

pub use elf::{
    ElfLoader, LoadedImage, Region, RegionAllocator, RegionKind, RelocStats, SectionMapEntry,
};
pub use manager::AppManager;
pub use reloc::{ArchRelocator, GenericArch};
pub use symtab::{HostSymbolTable, SymbolKind, HOST_SYMBOL_TABLE_CAPACITY};
