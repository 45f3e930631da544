// SPDX-FileCopyrightText: 2024-2026 nicfw contributors
// SPDX-License-Identifier: GPL-3.0-only

//! The fixed front of an image slot: the 16-byte magic pattern, the boot
//! version word, the hardware pointer table, and the tools area. These are
//! the only structures the boot ROM reads before it can follow the ITOC.

use std::io::Cursor;

use byteorder::{BigEndian, ByteOrder, ReadBytesExt, WriteBytesExt};
use thiserror::Error;
use zerocopy::{big_endian, FromBytes};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::{
    format::crc::{self, Crc16},
    io::BlockIo,
};

/// Fixed tag at the start of every valid image slot. Writing it is the
/// atomic commit of a new image; clearing its first word invalidates one.
pub const MAGIC_PATTERN: [u8; 16] = [
    0x4d, 0x54, 0x46, 0x57, 0x8c, 0xdf, 0xd0, 0x00, //
    0xde, 0xad, 0x92, 0x70, 0x41, 0x54, 0xbe, 0xef,
];

/// Offset of the boot version dword within a slot.
pub const BOOT_VERSION_OFFSET: u32 = 0x10;

/// Offset of the hardware pointer table within a slot.
pub const HW_POINTERS_OFFSET: u32 = 0x18;

pub const HW_POINTER_COUNT: usize = 16;
pub const HW_POINTER_ENTRY_SIZE: usize = 8;
pub const HW_POINTERS_SIZE: usize = HW_POINTER_COUNT * HW_POINTER_ENTRY_SIZE;

pub const TOOLS_AREA_SIZE: usize = 0x40;

/// Size of the FS3 preboot block in dwords, trailing CRC word included.
pub const PREBOOT_WORDS: usize = 13;

const BIN_VER_MAJOR_MIN: u8 = 1;
const BIN_VER_MAJOR_MAX: u8 = 2;

/// Chunk-log2 quirk for 16 MiB CX4-generation parts: a slot size of 4 MiB
/// with the image parked at 8 MiB actually means 8 MiB chunks.
pub const CX4_QUIRK_LOG2: u8 = 0x16;
pub const CX4_QUIRK_IMG_START: u32 = 0x80_0000;
pub const CX4_QUIRK_EFFECTIVE_LOG2: u8 = 0x17;

/// Chunk log2 assumed for encrypted images whose tools area is unreadable.
pub const ENCRYPTED_CHUNK_LOG2: u8 = 24;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unsupported binary version {major}.{minor}")]
    UnsupportedBinVersion { major: u8, minor: u8 },
    #[error("HW pointer {index} has bad CRC (expected {expected:#06x}, actual {actual:#06x})")]
    BadHwPointerCrc {
        index: usize,
        expected: u16,
        actual: u16,
    },
    #[error("Boot2 claims an implausible payload of {0:#x} dwords")]
    InvalidBoot2Size(u32),
    #[error("No valid image found")]
    NoValidImage,
    #[error("More than one valid image found on {0}")]
    MultipleValidImages(&'static str),
    #[error("I/O error")]
    Io(#[from] crate::io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Scan every sector boundary for the magic pattern and return all hits.
pub fn find_image_starts(io: &mut impl BlockIo) -> Result<Vec<u32>> {
    let saved = io.convertor();
    io.set_convertor(0, false);

    let sector = io.sector_size();
    let mut starts = Vec::new();
    let mut buf = [0u8; MAGIC_PATTERN.len()];

    let mut addr = 0u32;
    while addr + sector <= io.size() {
        io.read(addr, &mut buf)?;
        if buf == MAGIC_PATTERN {
            starts.push(addr);
        }
        addr += sector;
    }

    io.set_convertor(saved.chunk_log2, saved.second_slot);
    Ok(starts)
}

/// Locate the single valid image start, failing on zero or multiple hits.
pub fn locate_image(io: &mut impl BlockIo) -> Result<u32> {
    let starts = find_image_starts(io)?;
    match starts.len() {
        0 => Err(Error::NoValidImage),
        1 => Ok(starts[0]),
        _ => Err(Error::MultipleValidImages(if io.is_flash() {
            "device"
        } else {
            "image"
        })),
    }
}

/// Image format tag stored in the top byte of the boot version dword. FS4
/// images carry 1; FS3 predates the field and reads 0.
pub const FS4_FORMAT_TAG: u8 = 1;

/// The boot version dword: the image format tag, slot-size log2, and the
/// binary format version.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct BootVersion {
    pub format_tag: u8,
    pub chunk_log2: u8,
    pub major: u8,
    pub minor: u8,
}

impl BootVersion {
    pub fn from_raw(dword: u32) -> Self {
        Self {
            format_tag: (dword >> 24) as u8,
            chunk_log2: (dword >> 16) as u8,
            major: (dword >> 8) as u8,
            minor: dword as u8,
        }
    }

    pub fn to_raw(self) -> u32 {
        u32::from(self.format_tag) << 24
            | u32::from(self.chunk_log2) << 16
            | u32::from(self.major) << 8
            | u32::from(self.minor)
    }

    pub fn is_fs4(self) -> bool {
        self.format_tag == FS4_FORMAT_TAG
    }

    /// Version gate: `0.0` is an uninitialized image and accepted; anything
    /// with an out-of-range major is refused.
    pub fn check_supported(self) -> Result<()> {
        if self.major == 0 && self.minor == 0 {
            return Ok(());
        }
        if self.major < BIN_VER_MAJOR_MIN || self.major > BIN_VER_MAJOR_MAX {
            return Err(Error::UnsupportedBinVersion {
                major: self.major,
                minor: self.minor,
            });
        }
        Ok(())
    }
}

/// Raw on-flash layout of one hardware pointer entry.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct RawHwPointer {
    ptr: big_endian::U32,
    reserved: big_endian::U16,
    crc: big_endian::U16,
}

/// One CRC verdict per pointer entry, surfaced to the verify callback.
#[derive(Clone, Copy, Debug)]
pub struct HwPointerCrc {
    pub index: usize,
    pub ptr: u32,
    pub stored: u16,
    pub computed: u16,
    /// Absent entries (pointer `0xFFFF_FFFF`) skip the CRC check.
    pub absent: bool,
}

impl HwPointerCrc {
    pub fn is_ok(&self) -> bool {
        self.absent || self.stored == self.computed
    }
}

/// The FS4 hardware pointer table: 16 `(pointer, CRC)` pairs naming every
/// structure the boot ROM must find before the ITOC exists. Pointers read
/// as `0xFFFF_FFFF` are absent and normalized to zero in memory.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct HwPointers {
    pub boot_record: u32,
    pub boot2: u32,
    pub toc: u32,
    pub tools: u32,
    pub authentication_start: u32,
    pub authentication_end: u32,
    pub digest_mdk: u32,
    pub digest_recovery_key: u32,
    pub public_key: u32,
    pub fw_security_version: u32,
    pub gcm_iv_delta: u32,
    pub hashes_table: u32,
    pub hmac_start: u32,
}

impl HwPointers {
    /// Compute the per-entry CRC verdicts without failing. The caller
    /// decides whether a mismatch is fatal.
    pub fn checks(buf: &[u8; HW_POINTERS_SIZE]) -> Vec<HwPointerCrc> {
        let mut out = Vec::with_capacity(HW_POINTER_COUNT);

        for (index, chunk) in buf.chunks_exact(HW_POINTER_ENTRY_SIZE).enumerate() {
            let raw = RawHwPointer::read_from_bytes(chunk).unwrap();
            let ptr = raw.ptr.get();
            let absent = ptr == u32::MAX;

            let mut head = [0u8; 6];
            head.copy_from_slice(&chunk[..6]);

            out.push(HwPointerCrc {
                index,
                ptr,
                stored: raw.crc.get(),
                computed: crc::crc16_hw(&head),
                absent,
            });
        }

        out
    }

    /// Parse the table, failing on the first bad pointer CRC.
    pub fn parse(buf: &[u8; HW_POINTERS_SIZE]) -> Result<Self> {
        for check in Self::checks(buf) {
            if !check.is_ok() {
                return Err(Error::BadHwPointerCrc {
                    index: check.index,
                    expected: check.stored,
                    actual: check.computed,
                });
            }
        }
        Ok(Self::parse_unchecked(buf))
    }

    pub fn parse_unchecked(buf: &[u8; HW_POINTERS_SIZE]) -> Self {
        let mut ptrs = [0u32; HW_POINTER_COUNT];
        for (i, chunk) in buf.chunks_exact(HW_POINTER_ENTRY_SIZE).enumerate() {
            let raw = RawHwPointer::read_from_bytes(chunk).unwrap();
            let ptr = raw.ptr.get();
            ptrs[i] = if ptr == u32::MAX { 0 } else { ptr };
        }

        Self {
            boot_record: ptrs[0],
            boot2: ptrs[1],
            toc: ptrs[2],
            tools: ptrs[3],
            authentication_start: ptrs[4],
            authentication_end: ptrs[5],
            digest_mdk: ptrs[6],
            digest_recovery_key: ptrs[7],
            public_key: ptrs[8],
            fw_security_version: ptrs[9],
            gcm_iv_delta: ptrs[10],
            hashes_table: ptrs[11],
            hmac_start: ptrs[12],
        }
    }

    fn to_array(self) -> [u32; HW_POINTER_COUNT] {
        let mut ptrs = [0u32; HW_POINTER_COUNT];
        ptrs[0] = self.boot_record;
        ptrs[1] = self.boot2;
        ptrs[2] = self.toc;
        ptrs[3] = self.tools;
        ptrs[4] = self.authentication_start;
        ptrs[5] = self.authentication_end;
        ptrs[6] = self.digest_mdk;
        ptrs[7] = self.digest_recovery_key;
        ptrs[8] = self.public_key;
        ptrs[9] = self.fw_security_version;
        ptrs[10] = self.gcm_iv_delta;
        ptrs[11] = self.hashes_table;
        ptrs[12] = self.hmac_start;
        ptrs
    }

    /// Pack the table with freshly computed entry CRCs.
    pub fn pack(self) -> [u8; HW_POINTERS_SIZE] {
        let mut out = [0u8; HW_POINTERS_SIZE];

        for (i, ptr) in self.to_array().into_iter().enumerate() {
            let chunk = &mut out[i * HW_POINTER_ENTRY_SIZE..(i + 1) * HW_POINTER_ENTRY_SIZE];
            BigEndian::write_u32(&mut chunk[..4], ptr);

            let mut head = [0u8; 6];
            head.copy_from_slice(&chunk[..6]);
            BigEndian::write_u16(&mut chunk[6..], crc::crc16_hw(&head));
        }

        out
    }

    /// The bare pointer values without CRCs, in table order. This is the
    /// form that enters the version-2 secure-boot digest.
    pub fn bare_bytes(self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HW_POINTER_COUNT * 4);
        for ptr in self.to_array() {
            out.extend_from_slice(&ptr.to_be_bytes());
        }
        out
    }
}

/// The FS4 tools area: the binary version and the slot-size log2 that
/// drives all logical-to-physical address translation.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ToolsArea {
    pub bin_ver_major: u8,
    pub bin_ver_minor: u8,
    pub log2_slot_size: u8,
}

impl ToolsArea {
    pub fn parse(buf: &[u8; TOOLS_AREA_SIZE]) -> (Self, ToolsAreaCrc) {
        let mut reader = Cursor::new(&buf[..]);
        let head = reader.read_u32::<BigEndian>().unwrap();

        let area = Self {
            bin_ver_major: (head >> 24) as u8,
            bin_ver_minor: (head >> 16) as u8,
            log2_slot_size: (head >> 8) as u8,
        };

        let stored = BigEndian::read_u32(&buf[TOOLS_AREA_SIZE - 4..]) as u16;
        let computed = crc::crc16_sw(&buf[..TOOLS_AREA_SIZE - 4]);

        (area, ToolsAreaCrc { stored, computed })
    }

    pub fn pack(self) -> [u8; TOOLS_AREA_SIZE] {
        let mut out = [0u8; TOOLS_AREA_SIZE];
        let head = u32::from(self.bin_ver_major) << 24
            | u32::from(self.bin_ver_minor) << 16
            | u32::from(self.log2_slot_size) << 8;
        BigEndian::write_u32(&mut out[..4], head);

        let crc = crc::crc16_sw(&out[..TOOLS_AREA_SIZE - 4]);
        BigEndian::write_u32(&mut out[TOOLS_AREA_SIZE - 4..], u32::from(crc));
        out
    }

    pub fn bin_version(self) -> BootVersion {
        BootVersion {
            format_tag: 0,
            chunk_log2: self.log2_slot_size,
            major: self.bin_ver_major,
            minor: self.bin_ver_minor,
        }
    }

    /// Resolve the effective chunk log2, applying the CX4 16 MiB quirk.
    pub fn effective_chunk_log2(self, img_start: u32) -> u8 {
        if self.log2_slot_size == CX4_QUIRK_LOG2 && img_start == CX4_QUIRK_IMG_START {
            CX4_QUIRK_EFFECTIVE_LOG2
        } else {
            self.log2_slot_size
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ToolsAreaCrc {
    pub stored: u16,
    pub computed: u16,
}

impl ToolsAreaCrc {
    pub fn is_ok(&self) -> bool {
        self.stored == self.computed
    }
}

/// Boot2 layout: a header dword, a size dword counting payload dwords, the
/// payload, and a two-dword tail whose last word carries the CRC.
pub fn boot2_total_size(io: &mut impl BlockIo, ptr: u32) -> Result<u32> {
    let mut buf = [0u8; 8];
    io.read(ptr, &mut buf)?;
    let payload_dwords = BigEndian::read_u32(&buf[4..]);

    payload_dwords
        .checked_add(4)
        .and_then(|dwords| dwords.checked_mul(4))
        .filter(|total| *total <= io.size())
        .ok_or(Error::InvalidBoot2Size(payload_dwords))
}

#[derive(Clone, Copy, Debug)]
pub struct Boot2Crc {
    pub size: u32,
    pub stored: u16,
    pub computed: u16,
}

impl Boot2Crc {
    pub fn is_ok(&self) -> bool {
        self.stored == self.computed
    }
}

/// Read boot2 in full and compute its CRC verdict.
pub fn check_boot2(io: &mut impl BlockIo, ptr: u32) -> Result<Boot2Crc> {
    let size = boot2_total_size(io, ptr)?;
    let data = io.read_vec(ptr, size)?;

    let stored = BigEndian::read_u32(&data[data.len() - 4..]) as u16;
    let computed = crc::crc16_sw(&data[..data.len() - 4]);

    Ok(Boot2Crc {
        size,
        stored,
        computed,
    })
}

/// Emit a boot2 blob around a payload, with size and CRC filled in.
pub fn build_boot2(payload: &[u8]) -> Vec<u8> {
    debug_assert_eq!(payload.len() % 4, 0);

    let mut out = Vec::with_capacity(payload.len() + 16);
    out.write_u32::<BigEndian>(0).unwrap();
    out.write_u32::<BigEndian>((payload.len() / 4) as u32)
        .unwrap();
    out.extend_from_slice(payload);
    out.write_u32::<BigEndian>(0).unwrap();

    let crc = crc::crc16_sw(&out);
    out.write_u32::<BigEndian>(u32::from(crc)).unwrap();
    out
}

#[derive(Clone, Copy, Debug)]
pub struct PrebootCrc {
    pub stored: u16,
    pub proper: u16,
    pub legacy: u16,
}

impl PrebootCrc {
    /// Either variant passes; see [`crate::format::crc::crc16_preboot_legacy`].
    pub fn is_ok(&self) -> bool {
        self.stored == self.proper || self.stored == self.legacy
    }
}

/// Compute both preboot CRC candidates over the leading block of an image.
pub fn check_preboot(words: &[u32; PREBOOT_WORDS]) -> PrebootCrc {
    PrebootCrc {
        stored: words[PREBOOT_WORDS - 1] as u16,
        proper: crc::crc16_preboot(words),
        legacy: crc::crc16_preboot_legacy(words),
    }
}

/// Recompute the preboot trailing CRC word, always in the proper form.
pub fn seal_preboot(words: &mut [u32; PREBOOT_WORDS]) {
    let mut crc = Crc16::new();
    for w in &words[..PREBOOT_WORDS - 1] {
        crc.add(*w);
    }
    crc.finish();
    words[PREBOOT_WORDS - 1] = u32::from(crc.get());
}
