// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Relocation type classification used by the ELF loader (spec.md §4.N
//! step 5). The numeric encoding of each ELF relocation type is
//! architecture-specific; `RelocType::classify` maps the raw `r_type` field
//! read out of a `.rela` entry into the small set of *behaviors* spec.md
//! describes, so the loader's relocation loop never needs an
//! architecture-specific `match` of its own.

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RelocType {
    /// No-op relocation, or an assembler expansion marker. Tallied, no write.
    None,
    /// Base-relocation: patch site holds (or, with nonzero addend, is given)
    /// an ELF virtual address to be mapped through the section map.
    Relative,
    /// Absolute 32-bit: write `map(addend)`.
    Absolute32,
    /// GOT/PLT slot resolved against an external symbol.
    GlobDat,
    JmpSlot,
    /// Relocation already baked in by the assembler; treat as processed.
    Slot0Op,
    /// Anything else: log and skip.
    Other(u32),
}

impl RelocType {
    /// Classifies a raw ELF `r_type` for the host's "generic 32-bit" arch
    /// family. Real architectures assign different numeric codes to the
    /// same behaviors; an `ArchRelocator` implementation is expected to
    /// perform this mapping for its own ISA. This default covers the
    /// numbering used by the reference simulator arch (`apps/loader`'s
    /// `GenericArch`) and by test fixtures.
    pub fn classify_generic(r_type: u32) -> RelocType {
        match r_type {
            0 => RelocType::None,
            8 => RelocType::Relative,
            1 => RelocType::Absolute32,
            6 => RelocType::GlobDat,
            7 => RelocType::JmpSlot,
            0xff00..=0xffff => RelocType::Slot0Op,
            other => RelocType::Other(other),
        }
    }
}
