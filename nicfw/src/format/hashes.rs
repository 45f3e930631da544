// SPDX-FileCopyrightText: 2024-2026 nicfw contributors
// SPDX-License-Identifier: GPL-3.0-only

//! The hashes table: a CRC-framed block holding the HTOC, which maps
//! section types to SHA digests. When present it replaces the grouped
//! section signatures of the version-1 secure-boot chain.
//!
//! ```text
//! +0x00  hashes-table header (last dword: header CRC)
//! +0x10  HTOC header: version, num_entries, hash_size
//! +0x20  HTOC entries (8 bytes each, MAX_HTOC_ENTRIES slots)
//! +....  hash area (MAX_HTOC_ENTRIES x hash_size)
//! +tail  8 bytes, last dword: whole-table CRC
//! ```

use byteorder::{BigEndian, ByteOrder};
use thiserror::Error;

use crate::format::{crc, toc::SectionType};

pub const HASHES_TABLE_HEADER_SIZE: usize = 0x10;
pub const HTOC_HEADER_SIZE: usize = 0x10;
pub const HTOC_ENTRY_SIZE: usize = 8;
pub const HASHES_TABLE_TAIL_SIZE: usize = 8;
pub const MAX_HTOC_ENTRIES: usize = 16;

pub const SHA512_HASH_SIZE: u16 = 64;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Hashes table is truncated: {actual} bytes, need {expected}")]
    Truncated { actual: usize, expected: usize },
    #[error("Hashes table claims {0} entries, limit is {MAX_HTOC_ENTRIES}")]
    TooManyEntries(u8),
    #[error("Section {0} has no HTOC slot")]
    NoSlot(SectionType),
    #[error("Digest size {actual} does not match HTOC hash size {expected}")]
    HashSizeMismatch { actual: usize, expected: u16 },
}

type Result<T> = std::result::Result<T, Error>;

/// Total table footprint for a given per-entry hash size.
pub fn table_size(hash_size: u16) -> usize {
    HASHES_TABLE_HEADER_SIZE
        + HTOC_HEADER_SIZE
        + MAX_HTOC_ENTRIES * (HTOC_ENTRY_SIZE + hash_size as usize)
        + HASHES_TABLE_TAIL_SIZE
}

#[derive(Clone, Copy, Debug)]
pub struct TableCrc {
    pub stored: u16,
    pub computed: u16,
}

impl TableCrc {
    pub fn is_ok(&self) -> bool {
        self.stored == self.computed
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct HtocEntry {
    pub section_type: SectionType,
    /// Offset of this entry's digest, relative to the HTOC start.
    pub hash_offset: u16,
}

/// An owned hashes table. The raw bytes are the source of truth; header and
/// entry views are decoded on parse and kept in sync by the mutators.
#[derive(Clone, Debug)]
pub struct HashesTable {
    pub version: u32,
    pub hash_size: u16,
    pub entries: Vec<HtocEntry>,
    raw: Vec<u8>,
}

impl HashesTable {
    /// Parse a full table blob (header through tail).
    pub fn parse(raw: Vec<u8>) -> Result<Self> {
        let min = HASHES_TABLE_HEADER_SIZE + HTOC_HEADER_SIZE;
        if raw.len() < min {
            return Err(Error::Truncated {
                actual: raw.len(),
                expected: min,
            });
        }

        let htoc = &raw[HASHES_TABLE_HEADER_SIZE..];
        let version = BigEndian::read_u32(htoc);
        let meta = BigEndian::read_u32(&htoc[4..]);
        let num_entries = (meta >> 24) as u8;
        let hash_size = meta as u16;

        if num_entries as usize > MAX_HTOC_ENTRIES {
            return Err(Error::TooManyEntries(num_entries));
        }

        let expected = table_size(hash_size);
        if raw.len() < expected {
            return Err(Error::Truncated {
                actual: raw.len(),
                expected,
            });
        }

        let mut entries = Vec::with_capacity(num_entries as usize);
        for i in 0..num_entries as usize {
            let at = HASHES_TABLE_HEADER_SIZE + HTOC_HEADER_SIZE + i * HTOC_ENTRY_SIZE;
            let d0 = BigEndian::read_u32(&raw[at..]);
            entries.push(HtocEntry {
                section_type: SectionType::from_raw((d0 >> 24) as u8),
                hash_offset: d0 as u16,
            });
        }

        Ok(Self {
            version,
            hash_size,
            entries,
            raw,
        })
    }

    /// Build an empty table with slots for the given section types, sealed.
    pub fn build(version: u32, hash_size: u16, sections: &[SectionType]) -> Result<Self> {
        if sections.len() > MAX_HTOC_ENTRIES {
            return Err(Error::TooManyEntries(sections.len() as u8));
        }

        let mut raw = vec![0u8; table_size(hash_size)];

        let htoc_at = HASHES_TABLE_HEADER_SIZE;
        BigEndian::write_u32(&mut raw[htoc_at..], version);
        BigEndian::write_u32(
            &mut raw[htoc_at + 4..],
            (sections.len() as u32) << 24 | u32::from(hash_size),
        );

        let hash_area = (HTOC_HEADER_SIZE + MAX_HTOC_ENTRIES * HTOC_ENTRY_SIZE) as u16;
        let mut entries = Vec::with_capacity(sections.len());
        for (i, section) in sections.iter().enumerate() {
            let offset = hash_area + (i as u16) * hash_size;
            let at = htoc_at + HTOC_HEADER_SIZE + i * HTOC_ENTRY_SIZE;
            BigEndian::write_u32(
                &mut raw[at..],
                u32::from(section.to_raw()) << 24 | u32::from(offset),
            );
            entries.push(HtocEntry {
                section_type: *section,
                hash_offset: offset,
            });
        }

        let mut table = Self {
            version,
            hash_size,
            entries,
            raw,
        };
        table.seal();
        Ok(table)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }

    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    pub fn entry_for(&self, section_type: SectionType) -> Option<HtocEntry> {
        self.entries
            .iter()
            .copied()
            .find(|e| e.section_type == section_type)
    }

    fn hash_range(&self, entry: HtocEntry) -> std::ops::Range<usize> {
        let start = HASHES_TABLE_HEADER_SIZE + entry.hash_offset as usize;
        start..start + self.hash_size as usize
    }

    pub fn hash_for(&self, section_type: SectionType) -> Option<&[u8]> {
        let entry = self.entry_for(section_type)?;
        Some(&self.raw[self.hash_range(entry)])
    }

    /// Store a digest into a section's HTOC slot and reseal the trailing
    /// table CRC.
    pub fn set_hash(&mut self, section_type: SectionType, digest: &[u8]) -> Result<()> {
        if digest.len() != self.hash_size as usize {
            return Err(Error::HashSizeMismatch {
                actual: digest.len(),
                expected: self.hash_size,
            });
        }
        let entry = self
            .entry_for(section_type)
            .ok_or(Error::NoSlot(section_type))?;

        let range = self.hash_range(entry);
        self.raw[range].copy_from_slice(digest);
        self.seal();
        Ok(())
    }

    pub fn header_crc(&self) -> TableCrc {
        TableCrc {
            stored: BigEndian::read_u32(&self.raw[HASHES_TABLE_HEADER_SIZE - 4..]) as u16,
            computed: crc::crc16_sw(&self.raw[..HASHES_TABLE_HEADER_SIZE - 4]),
        }
    }

    pub fn table_crc(&self) -> TableCrc {
        let len = self.raw.len();
        TableCrc {
            stored: BigEndian::read_u32(&self.raw[len - 4..]) as u16,
            computed: crc::crc16_sw(&self.raw[..len - 4]),
        }
    }

    /// Recompute both the header CRC and the trailing table CRC.
    pub fn seal(&mut self) {
        let header_crc = crc::crc16_sw(&self.raw[..HASHES_TABLE_HEADER_SIZE - 4]);
        BigEndian::write_u32(
            &mut self.raw[HASHES_TABLE_HEADER_SIZE - 4..HASHES_TABLE_HEADER_SIZE],
            u32::from(header_crc),
        );

        let len = self.raw.len();
        let table_crc = crc::crc16_sw(&self.raw[..len - 4]);
        BigEndian::write_u32(&mut self.raw[len - 4..], u32::from(table_crc));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_parse_round_trip() {
        let table = HashesTable::build(
            1,
            SHA512_HASH_SIZE,
            &[
                SectionType::BootCode,
                SectionType::MainCode,
                SectionType::Itoc,
            ],
        )
        .unwrap();

        assert!(table.header_crc().is_ok());
        assert!(table.table_crc().is_ok());

        let parsed = HashesTable::parse(table.as_bytes().to_vec()).unwrap();
        assert_eq!(parsed.entries, table.entries);
        assert_eq!(parsed.hash_size, SHA512_HASH_SIZE);
    }

    #[test]
    fn set_hash_reseals() {
        let mut table =
            HashesTable::build(1, SHA512_HASH_SIZE, &[SectionType::MainCode]).unwrap();

        let digest = [0x5au8; 64];
        table.set_hash(SectionType::MainCode, &digest).unwrap();

        assert_eq!(table.hash_for(SectionType::MainCode).unwrap(), &digest);
        assert!(table.table_crc().is_ok());

        assert!(matches!(
            table.set_hash(SectionType::PciCode, &digest),
            Err(Error::NoSlot(SectionType::PciCode))
        ));
        assert!(matches!(
            table.set_hash(SectionType::MainCode, &[0u8; 32]),
            Err(Error::HashSizeMismatch { .. })
        ));
    }

    #[test]
    fn stale_hash_breaks_table_crc() {
        let mut table =
            HashesTable::build(1, SHA512_HASH_SIZE, &[SectionType::MainCode]).unwrap();
        table.set_hash(SectionType::MainCode, &[0x11; 64]).unwrap();

        // Corrupt the stored digest without resealing.
        let entry = table.entry_for(SectionType::MainCode).unwrap();
        let at = HASHES_TABLE_HEADER_SIZE + entry.hash_offset as usize;
        table.raw[at] ^= 0xff;
        assert!(!table.table_crc().is_ok());
    }
}
