// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The ELF32 loader (spec.md §4.N): parses a relocatable image, places its
//! sections into executable and non-executable regions, applies
//! architecture-specific relocations, resolves external symbols against the
//! host symbol table, and produces an entry point.
//!
//! Regions are modeled as flat byte buffers tagged with a logical base
//! address (spec.md §9 "model as an `Allocator` trait/interface with
//! per-site selection"); relocation math works against that logical address
//! space rather than raw pointers, so the whole loader stays in safe Rust.

use goblin::elf::header::{EM_NONE, ET_DYN};
use goblin::elf::section_header::{SHF_ALLOC, SHF_EXECINSTR, SHT_NOBITS};
use goblin::elf::Elf;

use rt_abi::{Error, RelocType};
use rt_hal::CacheMaintenance;

use crate::reloc::ArchRelocator;
use crate::symtab::HostSymbolTable;

/// An executable- or data-memory allocator the loader draws regions from
/// (spec.md §9's `Allocator` trait). `rt-hostsim` supplies the default
/// heap-backed implementation; a real platform would hand out internal RAM
/// or bulk RAM instead.
pub trait RegionAllocator: Send + Sync {
    fn allocate(&self, size: usize) -> Result<Region, Error>;
}

/// A contiguous, owned memory region with a logical base address used for
/// relocation bookkeeping.
#[derive(Debug)]
pub struct Region {
    pub base: usize,
    bytes: Vec<u8>,
}

impl Region {
    pub fn new(base: usize, bytes: Vec<u8>) -> Self {
        Region { base, bytes }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.base + self.bytes.len()
    }

    fn write_u32(&mut self, addr: usize, value: u32) -> Result<(), Error> {
        let off = addr.checked_sub(self.base).ok_or(Error::ElfInvalid)?;
        self.bytes
            .get_mut(off..off + 4)
            .ok_or(Error::ElfInvalid)?
            .copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    fn read_u32(&self, addr: usize) -> Result<u32, Error> {
        let off = addr.checked_sub(self.base).ok_or(Error::ElfInvalid)?;
        let bytes: [u8; 4] = self
            .bytes
            .get(off..off + 4)
            .ok_or(Error::ElfInvalid)?
            .try_into()
            .unwrap();
        Ok(u32::from_le_bytes(bytes))
    }
}

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum RegionKind {
    Code,
    Data,
    Bss,
}

#[derive(Debug)]
pub struct SectionMapEntry {
    pub elf_vaddr: u64,
    pub loaded_addr: usize,
    pub size: usize,
    pub region: RegionKind,
}

#[derive(Default, Debug)]
pub struct RelocStats {
    pub none: u32,
    pub relative: u32,
    pub absolute32: u32,
    pub glob_dat_jmp_slot: u32,
    pub slot0: u32,
    pub other_skipped: u32,
    pub xip_skipped: u32,
    pub unresolved: u32,
}

#[derive(Debug)]
pub struct LoadedImage {
    pub code_region: Region,
    pub data_region: Region,
    pub bss_region: Region,
    pub section_map: Vec<SectionMapEntry>,
    pub entry_point: usize,
    pub manifest_addr: Option<usize>,
    pub exit_addr: Option<usize>,
    pub reloc_stats: RelocStats,
}

fn map_vaddr(elf_vaddr: u64, section_map: &[SectionMapEntry]) -> Option<usize> {
    section_map.iter().find_map(|entry| {
        let within = elf_vaddr >= entry.elf_vaddr && elf_vaddr < entry.elf_vaddr + entry.size as u64;
        within.then_some(entry.loaded_addr + (elf_vaddr - entry.elf_vaddr) as usize)
    })
}

fn kind_for_addr(addr: usize, code: &Region, data: &Region, bss: &Region) -> Option<RegionKind> {
    if code.contains(addr) {
        Some(RegionKind::Code)
    } else if data.contains(addr) {
        Some(RegionKind::Data)
    } else if bss.contains(addr) {
        Some(RegionKind::Bss)
    } else {
        None
    }
}

pub struct ElfLoader<'a> {
    pub arch: &'a dyn ArchRelocator,
    pub code_alloc: &'a dyn RegionAllocator,
    pub data_alloc: &'a dyn RegionAllocator,
    pub symbols: &'a HostSymbolTable,
    pub cache: &'a dyn CacheMaintenance,
}

impl<'a> ElfLoader<'a> {
    pub fn load(&self, image: &[u8]) -> Result<LoadedImage, Error> {
        if image.len() < 4 || &image[0..4] != b"\x7fELF" {
            return Err(Error::ElfInvalid);
        }
        let elf = Elf::parse(image).map_err(|_| Error::ElfInvalid)?;

        if self.arch.machine() != EM_NONE && elf.header.e_machine != self.arch.machine() {
            return Err(Error::ElfUnsupported);
        }
        if elf.header.e_type != ET_DYN {
            log::warn!("app image e_type {} is not ET_DYN; loading anyway", elf.header.e_type);
        }

        // Step 2: classify and size allocatable sections.
        struct Placement {
            kind: RegionKind,
            elf_vaddr: u64,
            size: usize,
            file_offset: usize,
            nobits: bool,
        }
        let mut placements = Vec::new();
        let (mut code_size, mut data_size, mut bss_size) = (0usize, 0usize, 0usize);

        for sh in &elf.section_headers {
            if sh.sh_flags as u32 & SHF_ALLOC == 0 {
                continue;
            }
            let nobits = sh.sh_type == SHT_NOBITS;
            let kind = if nobits {
                RegionKind::Bss
            } else if sh.sh_flags as u32 & SHF_EXECINSTR != 0 {
                RegionKind::Code
            } else {
                RegionKind::Data
            };
            let size = sh.sh_size as usize;
            match kind {
                RegionKind::Code => code_size += size,
                RegionKind::Data => data_size += size,
                RegionKind::Bss => bss_size += size,
            }
            placements.push(Placement {
                kind,
                elf_vaddr: sh.sh_addr,
                size,
                file_offset: sh.sh_offset as usize,
                nobits,
            });
        }

        // Step 3: allocate regions.
        let mut code_region = self.code_alloc.allocate(code_size).map_err(|_| Error::NoMemoryForCode)?;
        let mut data_region = self.data_alloc.allocate(data_size)?;
        let mut bss_region = self.data_alloc.allocate(bss_size)?;

        // Step 4: place sections in order, building the section map.
        let mut section_map = Vec::with_capacity(placements.len());
        let (mut code_off, mut data_off, mut bss_off) = (0usize, 0usize, 0usize);

        for p in &placements {
            let loaded_addr = match p.kind {
                RegionKind::Code => {
                    let dst = code_off;
                    if !p.nobits {
                        code_region.as_mut_slice()[dst..dst + p.size]
                            .copy_from_slice(&image[p.file_offset..p.file_offset + p.size]);
                    }
                    code_off += p.size;
                    code_region.base + dst
                }
                RegionKind::Data => {
                    let dst = data_off;
                    if !p.nobits {
                        data_region.as_mut_slice()[dst..dst + p.size]
                            .copy_from_slice(&image[p.file_offset..p.file_offset + p.size]);
                    }
                    data_off += p.size;
                    data_region.base + dst
                }
                RegionKind::Bss => {
                    let dst = bss_off;
                    bss_off += p.size;
                    bss_region.base + dst
                }
            };
            section_map.push(SectionMapEntry {
                elf_vaddr: p.elf_vaddr,
                loaded_addr,
                size: p.size,
                region: p.kind,
            });
        }

        // Step 5: apply relocations from every rela section the parser found.
        let mut stats = RelocStats::default();
        let relocs = elf
            .dynrelas
            .iter()
            .chain(elf.pltrelocs.iter())
            .collect::<Vec<_>>();

        for reloc in relocs {
            let Some(target_addr) = map_vaddr(reloc.r_offset, &section_map) else {
                stats.other_skipped += 1;
                continue;
            };
            let Some(target_kind) = kind_for_addr(target_addr, &code_region, &data_region, &bss_region) else {
                stats.other_skipped += 1;
                continue;
            };
            macro_rules! target_region {
                () => {
                    match target_kind {
                        RegionKind::Code => &mut code_region,
                        RegionKind::Data => &mut data_region,
                        RegionKind::Bss => &mut bss_region,
                    }
                };
            }

            match self.arch.classify(reloc.r_type) {
                RelocType::None => stats.none += 1,
                RelocType::Relative => {
                    let addend = reloc.r_addend.unwrap_or(0);
                    let elf_va = if addend != 0 {
                        addend as u64
                    } else {
                        target_region!().read_u32(target_addr)? as u64
                    };
                    let mapped = map_vaddr(elf_va, &section_map).unwrap_or(code_region.base + elf_va as usize);
                    target_region!().write_u32(target_addr, mapped as u32)?;
                    stats.relative += 1;
                }
                RelocType::Absolute32 => {
                    let elf_va = reloc.r_addend.unwrap_or(0) as u64;
                    let mapped = map_vaddr(elf_va, &section_map).unwrap_or(code_region.base + elf_va as usize);
                    target_region!().write_u32(target_addr, mapped as u32)?;
                    stats.absolute32 += 1;
                }
                RelocType::GlobDat | RelocType::JmpSlot => {
                    let sym = elf.dynsyms.get(reloc.r_sym).ok_or(Error::ElfInvalid)?;
                    if sym.st_shndx == 0 && sym.st_name != 0 {
                        let name = elf.dynstrtab.get_at(sym.st_name).unwrap_or("");
                        match self.symbols.lookup(name) {
                            Some(addr) => {
                                target_region!().write_u32(target_addr, addr as u32)?;
                            }
                            None => {
                                target_region!().write_u32(target_addr, 0)?;
                                stats.unresolved += 1;
                            }
                        }
                    } else {
                        let mapped = map_vaddr(sym.st_value, &section_map)
                            .unwrap_or(code_region.base + sym.st_value as usize);
                        target_region!().write_u32(target_addr, mapped as u32)?;
                    }
                    stats.glob_dat_jmp_slot += 1;
                }
                RelocType::Slot0Op => stats.slot0 += 1,
                RelocType::Other(t) => {
                    log::warn!("skipping unsupported relocation type {t}");
                    stats.other_skipped += 1;
                }
            }
        }

        // Step 6: resolve the app's exported entry/exit/manifest symbols.
        let mut entry_addr = None;
        let mut exit_addr = None;
        let mut manifest_addr = None;
        for sym in elf.dynsyms.iter() {
            if sym.st_name == 0 {
                continue;
            }
            let name = elf.dynstrtab.get_at(sym.st_name).unwrap_or("");
            let mapped = map_vaddr(sym.st_value, &section_map);
            if name.ends_with("_app_entry") {
                entry_addr = mapped;
            } else if name.ends_with("_app_exit") {
                exit_addr = mapped;
            } else if name.ends_with("_app_manifest") {
                manifest_addr = mapped;
            }
        }
        let entry_point = entry_addr
            .or_else(|| map_vaddr(elf.header.e_entry, &section_map))
            .unwrap_or(code_region.base);

        // Step 7: cache maintenance must precede first execution. Relocations
        // can target any of the three regions (a RELATIVE/ABSOLUTE_32 fixup
        // against a `.bss` global pointer writes through `bss_region` just
        // like the code/data cases), so all three are published.
        self.cache.publish(&[
            (code_region.base, code_region.len()),
            (data_region.base, data_region.len()),
            (bss_region.base, bss_region.len()),
        ]);

        // Step 8: fail closed on unresolved symbols.
        if stats.unresolved > 0 {
            return Err(Error::UnresolvedSymbol);
        }

        Ok(LoadedImage {
            code_region,
            data_region,
            bss_region,
            section_map,
            entry_point,
            manifest_addr,
            exit_addr,
            reloc_stats: stats,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub struct VecAllocator;
    impl RegionAllocator for VecAllocator {
        fn allocate(&self, size: usize) -> Result<Region, Error> {
            let bytes = vec![0u8; size];
            let base = bytes.as_ptr() as usize;
            Ok(Region::new(base, bytes))
        }
    }

    #[test]
    fn rejects_non_elf_images() {
        let alloc = VecAllocator;
        let symbols = HostSymbolTable::default();
        let cache = rt_hal::NoCacheMaintenance;
        let arch = crate::reloc::GenericArch;
        let loader = ElfLoader {
            arch: &arch,
            code_alloc: &alloc,
            data_alloc: &alloc,
            symbols: &symbols,
            cache: &cache,
        };
        assert_eq!(loader.load(b"not an elf").unwrap_err(), Error::ElfInvalid);
    }
}
