// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-architecture relocation behavior (spec.md §9 "isolate behind an
//! `ArchRelocator` interface keyed on relocation type"). Each host
//! architecture provides its own `r_type` -> [`RelocType`] mapping;
//! [`GenericArch`] is the stand-in used by hosted tests, applying the toy
//! encoding spec.md §9 explicitly allows ("testing can supply a stub that
//! applies a toy encoding").

use rt_abi::RelocType;

/// Host ELF machine constant this relocator accepts. Real architectures
/// return their own `goblin::elf::header::EM_*` value; the generic test
/// arch uses `EM_NONE` so fixtures don't need a real target toolchain.
pub trait ArchRelocator: Send + Sync {
    fn machine(&self) -> u16;
    fn classify(&self, r_type: u32) -> RelocType;
}

/// The reference architecture used by host-side tests and by
/// `rt-hostsim`. Its numbering matches [`rt_abi::RelocType::classify_generic`].
pub struct GenericArch;

impl ArchRelocator for GenericArch {
    fn machine(&self) -> u16 {
        goblin::elf::header::EM_NONE
    }

    fn classify(&self, r_type: u32) -> RelocType {
        RelocType::classify_generic(r_type)
    }
}
