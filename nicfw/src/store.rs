// SPDX-FileCopyrightText: 2024-2026 nicfw contributors
// SPDX-License-Identifier: GPL-3.0-only

//! The section store: every parsed TOC entry together with its decoded
//! section bytes, plus the mutation algorithms (replace, insert, remove,
//! device-data shift and realignment) that keep entry CRCs, section CRCs,
//! the END marker, and sibling addresses consistent.

use thiserror::Error;
use tracing::debug;

use crate::{
    format::toc::{
        seal_section, SectionType, TocEntry, TocHeader, TocKind, MAX_TOC_ENTRIES, TOC_ENTRY_SIZE,
        TOC_HEADER_SIZE,
    },
    io::BlockIo,
    util,
};

/// The fixed device-data sections subject to flash-generation realignment,
/// in table order: FW_NV_LOG, NV_DATA0, NV_DATA2, and the two DEV_INFO
/// copies.
pub const ALIGN_SECTION_COUNT: usize = 5;

/// Where those sections live on the legacy layout.
pub const LEGACY_DEV_OFFSETS: [u32; ALIGN_SECTION_COUNT] =
    [0xc0_0000, 0xc1_0000, 0xc2_0000, 0xc3_0000, 0xc4_0000];

/// Where they move on the current layout.
pub const ALIGNED_DEV_OFFSETS: [u32; ALIGN_SECTION_COUNT] =
    [0xf9_0000, 0xfb_0000, 0xfc_0000, 0xfd_0000, 0xfe_0000];

#[derive(Debug, Error)]
pub enum Error {
    #[error("No {0} section in {1}")]
    SectionNotFound(SectionType, &'static str),
    #[error("Cannot add TOC entry, too many entries ({MAX_TOC_ENTRIES} max)")]
    TooManyEntries,
    #[error("Section size {actual:#x} exceeds available space {max:#x}")]
    ImageTooLarge { actual: u32, max: u32 },
    #[error("{a} at {a_range:x?} overlaps {b} at {b_range:x?}")]
    Overlap {
        a: SectionType,
        a_range: (u32, u32),
        b: SectionType,
        b_range: (u32, u32),
    },
    #[error("{section} expected at {expected:#x} but found at {actual:#x}")]
    MisplacedSection {
        section: SectionType,
        expected: u32,
        actual: u32,
    },
    #[error("Section size {0:#x} is not dword aligned")]
    UnalignedSize(u32),
    #[error("Internal error: {0}")]
    Internal(String),
    #[error("I/O error")]
    Io(#[from] crate::io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// One TOC entry with its section payload and the address its 32-byte
/// record occupies inside the TOC array.
#[derive(Clone)]
pub struct TocSlot {
    pub entry: TocEntry,
    pub entry_addr: u32,
    pub data: Vec<u8>,
}

impl std::fmt::Debug for TocSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TocSlot")
            .field("entry", &self.entry)
            .field("entry_addr", &format_args!("{:#x}", self.entry_addr))
            .field("data", &util::NumBytes(self.data.len()))
            .finish()
    }
}

impl TocSlot {
    pub fn packed(&self) -> [u8; TOC_ENTRY_SIZE] {
        self.entry.pack()
    }
}

/// An ordered table of contents plus its sections.
#[derive(Clone, Debug)]
pub struct SectionStore {
    pub header: TocHeader,
    /// Address of the TOC header: logical for an ITOC, absolute for a DTOC.
    pub toc_addr: u32,
    pub slots: Vec<TocSlot>,
}

impl SectionStore {
    pub fn new(kind: TocKind, flash_layout_version: u8, toc_addr: u32) -> Self {
        Self {
            header: TocHeader::new(kind, flash_layout_version),
            toc_addr,
            slots: Vec::new(),
        }
    }

    pub fn kind(&self) -> TocKind {
        self.header.kind
    }

    pub fn find(&self, section_type: SectionType) -> Option<&TocSlot> {
        self.slots
            .iter()
            .find(|s| s.entry.section_type == section_type)
    }

    pub fn find_mut(&mut self, section_type: SectionType) -> Option<&mut TocSlot> {
        self.slots
            .iter_mut()
            .find(|s| s.entry.section_type == section_type)
    }

    pub fn index_of(&self, section_type: SectionType) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.entry.section_type == section_type)
    }

    pub fn contains(&self, section_type: SectionType) -> bool {
        self.index_of(section_type).is_some()
    }

    /// Sum of all section payloads, in bytes.
    pub fn sections_total_size(&self) -> u32 {
        self.slots.iter().map(|s| s.entry.size_bytes()).sum()
    }

    /// Highest end address among slot-relative sections.
    pub fn last_relative_end(&self) -> u32 {
        self.slots
            .iter()
            .filter(|s| s.entry.relative_addr)
            .map(|s| s.entry.end_addr())
            .max()
            .unwrap_or(0)
    }

    /// Lowest start address among absolute sections.
    pub fn smallest_absolute_addr(&self) -> Option<u32> {
        self.slots
            .iter()
            .filter(|s| !s.entry.relative_addr)
            .map(|s| s.entry.flash_addr())
            .min()
    }

    /// Byte size of the serialized TOC array, END marker included.
    pub fn serialized_size(&self) -> usize {
        TOC_HEADER_SIZE + (self.slots.len() + 1) * TOC_ENTRY_SIZE
    }

    /// Serialize header, entries, and trailing END marker.
    pub fn serialize_toc(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.serialized_size());
        out.extend_from_slice(&self.header.pack());
        for slot in &self.slots {
            out.extend_from_slice(&slot.packed());
        }
        out.extend_from_slice(&TocEntry::end_marker_bytes());
        out
    }

    /// Move the TOC array base (the fail-safe ITOC rewrite alternates
    /// between two sectors) and refresh every entry record address.
    pub fn set_toc_addr(&mut self, addr: u32) {
        self.toc_addr = addr;
        self.reindex();
    }

    /// Recompute every entry record address from the TOC base.
    fn reindex(&mut self) {
        for (i, slot) in self.slots.iter_mut().enumerate() {
            slot.entry_addr = self.toc_addr + (TOC_HEADER_SIZE + i * TOC_ENTRY_SIZE) as u32;
        }
    }

    fn checked_size_dwords(data: &[u8]) -> Result<u32> {
        if data.len() % 4 != 0 {
            return Err(Error::UnalignedSize(data.len() as u32));
        }
        Ok((data.len() / 4) as u32)
    }

    /// Swap in new section bytes for an existing entry, resealing the
    /// section CRC carrier and the entry CRC. Growth is bounded by the next
    /// section's start.
    pub fn replace(&mut self, section_type: SectionType, data: Vec<u8>) -> Result<()> {
        let size_dwords = Self::checked_size_dwords(&data)?;

        let index = self
            .index_of(section_type)
            .ok_or(Error::SectionNotFound(section_type, self.kind().name()))?;

        let new_end = self.slots[index].entry.flash_addr() + size_dwords * 4;
        if let Some(limit) = self.next_section_start(index) {
            if new_end > limit {
                return Err(Error::ImageTooLarge {
                    actual: new_end,
                    max: limit,
                });
            }
        }

        let slot = &mut self.slots[index];
        slot.entry.size_dwords = size_dwords;
        slot.data = data;
        seal_section(&mut slot.entry, &mut slot.data);

        debug_assert_eq!(slot.entry.compute_entry_crc(), slot.entry.entry_crc);
        Ok(())
    }

    /// Start address of the nearest section above `index`'s start, among
    /// entries sharing its address space.
    fn next_section_start(&self, index: usize) -> Option<u32> {
        let base = &self.slots[index].entry;
        self.slots
            .iter()
            .enumerate()
            .filter(|(i, s)| {
                *i != index
                    && s.entry.relative_addr == base.relative_addr
                    && s.entry.flash_addr() > base.flash_addr()
            })
            .map(|(_, s)| s.entry.flash_addr())
            .min()
    }

    /// Insert a section described by `template` (type, CRC mode, flags).
    ///
    /// With `before`, the new section takes that entry's address and every
    /// following slot-relative entry ripples up by the new size rounded to
    /// a sector. Without it, the section lands after the last relative
    /// entry, rounded up to a sector boundary.
    pub fn insert(
        &mut self,
        mut template: TocEntry,
        mut data: Vec<u8>,
        before: Option<SectionType>,
        sector_size: u32,
    ) -> Result<()> {
        if self.slots.len() + 1 > MAX_TOC_ENTRIES {
            return Err(Error::TooManyEntries);
        }
        template.size_dwords = Self::checked_size_dwords(&data)?;

        let (position, flash_addr) = match before {
            Some(anchor) => {
                let index = self
                    .index_of(anchor)
                    .ok_or(Error::SectionNotFound(anchor, self.kind().name()))?;
                (index, self.slots[index].entry.flash_addr())
            }
            None => {
                let end = self.last_relative_end();
                let addr = util::round_up(end, sector_size)
                    .ok_or_else(|| Error::Internal("address overflow".into()))?;
                (self.slots.len(), addr)
            }
        };

        let shift = util::round_up(template.size_bytes(), sector_size)
            .ok_or_else(|| Error::Internal("size overflow".into()))?;

        for slot in &mut self.slots[position..] {
            if slot.entry.relative_addr {
                slot.entry
                    .set_flash_addr(slot.entry.flash_addr() + shift);
                slot.entry.seal();
            }
        }

        template.set_flash_addr(flash_addr);
        seal_section(&mut template, &mut data);

        self.slots.insert(
            position,
            TocSlot {
                entry: template,
                entry_addr: 0,
                data,
            },
        );
        self.reindex();
        Ok(())
    }

    /// Remove a section, rippling the following slot-relative entries back
    /// down by its sector-rounded size. Returns the evicted payload.
    pub fn remove(&mut self, section_type: SectionType, sector_size: u32) -> Result<Vec<u8>> {
        let index = self
            .index_of(section_type)
            .ok_or(Error::SectionNotFound(section_type, self.kind().name()))?;

        let removed = self.slots.remove(index);
        let shift = util::round_up(removed.entry.size_bytes(), sector_size)
            .ok_or_else(|| Error::Internal("size overflow".into()))?;

        for slot in &mut self.slots[index..] {
            if slot.entry.relative_addr {
                slot.entry
                    .set_flash_addr(slot.entry.flash_addr() - shift);
                slot.entry.seal();
            }
        }

        self.reindex();
        Ok(removed.data)
    }

    /// No two entries may overlap under either slot origin (the dual-slot
    /// layout maps relative addresses twice).
    pub fn check_consistency(&self, chunk_log2: u8) -> Result<()> {
        for origin in [0u32, 1u32 << chunk_log2] {
            let mut ranges: Vec<(u32, u32, SectionType)> = self
                .slots
                .iter()
                .filter(|s| s.entry.size_dwords > 0)
                .map(|s| {
                    let start = if s.entry.relative_addr {
                        origin + s.entry.flash_addr()
                    } else {
                        s.entry.flash_addr()
                    };
                    (start, start + s.entry.size_bytes(), s.entry.section_type)
                })
                .collect();
            ranges.sort_unstable();

            for pair in ranges.windows(2) {
                let (a_start, a_end, a_type) = pair[0];
                let (b_start, b_end, b_type) = pair[1];
                if b_start < a_end {
                    return Err(Error::Overlap {
                        a: a_type,
                        a_range: (a_start, a_end),
                        b: b_type,
                        b_range: (b_start, b_end),
                    });
                }
            }
        }
        Ok(())
    }

    /// Write the serialized TOC at its base address.
    pub fn write_toc(&self, io: &mut impl BlockIo) -> Result<()> {
        let phys = self.kind() == TocKind::Dtoc;
        io.write(self.toc_addr, &self.serialize_toc(), phys)?;
        Ok(())
    }

    /// Migrate every device-data section down by `offset` bytes, lowest
    /// address first so no write lands on a not-yet-moved sibling, then
    /// rewrite the TOC. Flash layout only; the caller holds write
    /// protection off.
    pub fn shift_dev_data(&mut self, io: &mut impl BlockIo, offset: u32) -> Result<()> {
        let mut order: Vec<usize> = (0..self.slots.len()).collect();
        order.sort_unstable_by_key(|i| self.slots[*i].entry.flash_addr());

        for index in order {
            let slot = &mut self.slots[index];
            let new_addr = slot.entry.flash_addr() - offset;
            debug!(
                "Moving {} from {:#x} to {new_addr:#x}",
                slot.entry.section_type,
                slot.entry.flash_addr(),
            );

            slot.entry.set_flash_addr(new_addr);
            slot.entry.seal();
            io.write(new_addr, &slot.data, true)?;
        }

        self.write_toc(io)
    }

    /// Reassign the five fixed device-data sections to `new_offsets`,
    /// checking the current layout and overlap-freedom first, then write
    /// the moved sections and the updated TOC. Used when migrating old
    /// layouts onto parts with a different write-protect granularity.
    pub fn align_dev_data(
        &mut self,
        io: &mut impl BlockIo,
        expected_offsets: &[u32; ALIGN_SECTION_COUNT],
        new_offsets: &[u32; ALIGN_SECTION_COUNT],
    ) -> Result<()> {
        let targets = self.locate_align_sections()?;

        // Pre-checks before any write: sections sit where the legacy layout
        // put them, and no new range collides with a non-moved entry or
        // another new range.
        for (i, &index) in targets.iter().enumerate() {
            let entry = &self.slots[index].entry;
            if entry.flash_addr() != expected_offsets[i] {
                return Err(Error::MisplacedSection {
                    section: entry.section_type,
                    expected: expected_offsets[i],
                    actual: entry.flash_addr(),
                });
            }

            let new_range = (new_offsets[i], new_offsets[i] + entry.size_bytes());

            for (j, other) in self.slots.iter().enumerate() {
                if targets.contains(&j) {
                    continue;
                }
                let other_range = (other.entry.flash_addr(), other.entry.end_addr());
                if ranges_overlap(new_range, other_range) {
                    return Err(Error::Overlap {
                        a: entry.section_type,
                        a_range: new_range,
                        b: other.entry.section_type,
                        b_range: other_range,
                    });
                }
            }

            for (j, &other_index) in targets.iter().enumerate() {
                if i == j {
                    continue;
                }
                let other = &self.slots[other_index].entry;
                let other_range = (new_offsets[j], new_offsets[j] + other.size_bytes());
                if ranges_overlap(new_range, other_range) {
                    return Err(Error::Overlap {
                        a: entry.section_type,
                        a_range: new_range,
                        b: other.section_type,
                        b_range: other_range,
                    });
                }
            }
        }

        for (i, &index) in targets.iter().enumerate() {
            let slot = &mut self.slots[index];
            slot.entry.set_flash_addr(new_offsets[i]);
            slot.entry.seal();
            io.write(new_offsets[i], &slot.data, true)?;
        }

        self.header.flash_layout_version = 1;
        self.header.seal();
        self.write_toc(io)
    }

    /// Indexes of FW_NV_LOG, NV_DATA0, NV_DATA2, and both DEV_INFO copies.
    fn locate_align_sections(&self) -> Result<[usize; ALIGN_SECTION_COUNT]> {
        let mut found: [Option<usize>; ALIGN_SECTION_COUNT] = [None; ALIGN_SECTION_COUNT];

        for (i, slot) in self.slots.iter().enumerate() {
            match slot.entry.section_type {
                SectionType::FwNvLog => found[0] = found[0].or(Some(i)),
                SectionType::NvData0 => found[1] = found[1].or(Some(i)),
                SectionType::NvData2 => found[2] = found[2].or(Some(i)),
                SectionType::DevInfo => {
                    if found[3].is_none() {
                        found[3] = Some(i);
                    } else {
                        found[4] = found[4].or(Some(i));
                    }
                }
                _ => {}
            }
        }

        let sections = [
            SectionType::FwNvLog,
            SectionType::NvData0,
            SectionType::NvData2,
            SectionType::DevInfo,
            SectionType::DevInfo,
        ];
        let mut out = [0usize; ALIGN_SECTION_COUNT];
        for (i, slot) in found.iter().enumerate() {
            out[i] = slot.ok_or(Error::SectionNotFound(sections[i], "DTOC"))?;
        }
        Ok(out)
    }
}

fn ranges_overlap(a: (u32, u32), b: (u32, u32)) -> bool {
    a.0 < b.1 && b.0 < a.1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::toc::CrcMode;

    const SECTOR: u32 = 0x1000;

    fn entry(section_type: SectionType, addr: u32, size: u32) -> TocEntry {
        let mut e = TocEntry {
            section_type,
            size_dwords: size / 4,
            crc_mode: CrcMode::InEntry,
            relative_addr: true,
            ..Default::default()
        };
        e.set_flash_addr(addr);
        e
    }

    fn store_with(entries: &[(SectionType, u32, u32)]) -> SectionStore {
        let mut store = SectionStore::new(TocKind::Itoc, 1, 0x7000);
        for (st, addr, size) in entries {
            let mut e = entry(*st, *addr, *size);
            let mut data = vec![0x11u8; *size as usize];
            seal_section(&mut e, &mut data);
            store.slots.push(TocSlot {
                entry: e,
                entry_addr: 0,
                data,
            });
        }
        store.reindex();
        store
    }

    #[test]
    fn insert_before_ripples_addresses() {
        let mut store = store_with(&[
            (SectionType::PciCode, 0x5000, 0x1000),
            (SectionType::MainCode, 0x6000, 0x10000),
        ]);

        let rom = TocEntry {
            section_type: SectionType::RomCode,
            crc_mode: CrcMode::InEntry,
            relative_addr: true,
            ..Default::default()
        };
        store
            .insert(rom, vec![0xaa; 0x800], Some(SectionType::PciCode), SECTOR)
            .unwrap();

        let rom = store.find(SectionType::RomCode).unwrap();
        assert_eq!(rom.entry.flash_addr(), 0x5000);
        assert_eq!(rom.entry.size_bytes(), 0x800);

        let pci = store.find(SectionType::PciCode).unwrap();
        assert_eq!(pci.entry.flash_addr(), 0x6000);
        let main = store.find(SectionType::MainCode).unwrap();
        assert_eq!(main.entry.flash_addr(), 0x7000);

        // All touched CRCs are fresh.
        for slot in &store.slots {
            assert_eq!(slot.entry.compute_entry_crc(), slot.entry.entry_crc);
        }
        assert_eq!(
            rom.entry.section_crc,
            crate::format::crc::crc16_sw(&rom.data)
        );

        store.check_consistency(21).unwrap();
    }

    #[test]
    fn remove_mirrors_insert() {
        let mut store = store_with(&[
            (SectionType::PciCode, 0x5000, 0x1000),
            (SectionType::MainCode, 0x6000, 0x10000),
        ]);

        let rom = TocEntry {
            section_type: SectionType::RomCode,
            crc_mode: CrcMode::InEntry,
            relative_addr: true,
            ..Default::default()
        };
        store
            .insert(rom, vec![0xaa; 0x800], Some(SectionType::PciCode), SECTOR)
            .unwrap();
        let data = store.remove(SectionType::RomCode, SECTOR).unwrap();
        assert_eq!(data.len(), 0x800);

        assert_eq!(
            store.find(SectionType::PciCode).unwrap().entry.flash_addr(),
            0x5000
        );
        assert_eq!(
            store.find(SectionType::MainCode).unwrap().entry.flash_addr(),
            0x6000
        );
        assert_eq!(store.slots.len(), 2);
    }

    #[test]
    fn append_lands_after_last_relative_entry() {
        let mut store = store_with(&[(SectionType::MainCode, 0x5000, 0x1234)]);
        // 0x5000 + 0x1234 rounded up -> 0x7000.
        store
            .insert(
                TocEntry {
                    section_type: SectionType::RomCode,
                    relative_addr: true,
                    ..Default::default()
                },
                vec![0u8; 0x100],
                None,
                SECTOR,
            )
            .unwrap();

        assert_eq!(
            store.find(SectionType::RomCode).unwrap().entry.flash_addr(),
            0x7000
        );
    }

    #[test]
    fn replace_identity_is_byte_stable() {
        let mut store = store_with(&[(SectionType::ImageInfo, 0x5000, 0x400)]);
        let before = store.serialize_toc();
        let data = store.find(SectionType::ImageInfo).unwrap().data.clone();

        store.replace(SectionType::ImageInfo, data).unwrap();
        assert_eq!(store.serialize_toc(), before);
    }

    #[test]
    fn replace_growth_is_bounded() {
        let mut store = store_with(&[
            (SectionType::ImageInfo, 0x5000, 0x400),
            (SectionType::MainCode, 0x6000, 0x1000),
        ]);

        assert!(store
            .replace(SectionType::ImageInfo, vec![0u8; 0x1000])
            .is_ok());
        assert!(matches!(
            store.replace(SectionType::ImageInfo, vec![0u8; 0x1004]),
            Err(Error::ImageTooLarge { .. })
        ));
    }

    #[test]
    fn consistency_rejects_overlap() {
        let store = store_with(&[
            (SectionType::PciCode, 0x5000, 0x2000),
            (SectionType::MainCode, 0x6000, 0x1000),
        ]);
        assert!(matches!(
            store.check_consistency(21),
            Err(Error::Overlap { .. })
        ));
    }

    #[test]
    fn serialize_ends_with_end_marker() {
        let store = store_with(&[(SectionType::PciCode, 0x5000, 0x100)]);
        let toc = store.serialize_toc();
        assert_eq!(toc.len(), TOC_HEADER_SIZE + 2 * TOC_ENTRY_SIZE);
        assert!(toc[toc.len() - TOC_ENTRY_SIZE..].iter().all(|b| *b == 0xff));
    }

    #[test]
    fn align_dev_data_prechecks() {
        let mut store = SectionStore::new(TocKind::Dtoc, 0, 0xfff000);
        let specs = [
            (SectionType::FwNvLog, LEGACY_DEV_OFFSETS[0]),
            (SectionType::NvData0, LEGACY_DEV_OFFSETS[1]),
            (SectionType::NvData2, LEGACY_DEV_OFFSETS[2]),
            (SectionType::DevInfo, LEGACY_DEV_OFFSETS[3]),
            (SectionType::DevInfo, LEGACY_DEV_OFFSETS[4]),
        ];
        for (st, addr) in specs {
            let mut e = TocEntry {
                section_type: st,
                size_dwords: 0x200 / 4,
                device_data: true,
                crc_mode: CrcMode::InEntry,
                ..Default::default()
            };
            e.set_flash_addr(addr);
            let mut data = vec![0u8; 0x200];
            seal_section(&mut e, &mut data);
            store.slots.push(TocSlot {
                entry: e,
                entry_addr: 0,
                data,
            });
        }
        store.reindex();

        let mut img = crate::io::FileImage::new(vec![0xff; 0x100_0000]);
        store
            .align_dev_data(&mut img, &LEGACY_DEV_OFFSETS, &ALIGNED_DEV_OFFSETS)
            .unwrap();

        for (i, offset) in ALIGNED_DEV_OFFSETS.iter().enumerate() {
            let slot = &store.slots[store.locate_align_sections().unwrap()[i]];
            assert_eq!(slot.entry.flash_addr(), *offset);
        }
        assert_eq!(store.header.flash_layout_version, 1);

        // A second run fails the placement pre-check.
        assert!(matches!(
            store.align_dev_data(&mut img, &LEGACY_DEV_OFFSETS, &ALIGNED_DEV_OFFSETS),
            Err(Error::MisplacedSection { .. })
        ));
    }
}
