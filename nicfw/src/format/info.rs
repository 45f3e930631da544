// SPDX-FileCopyrightText: 2024-2026 nicfw contributors
// SPDX-License-Identifier: GPL-3.0-only

//! Decoders for the well-known informational sections. Field layouts are
//! fixed-offset, big-endian records; the GUID/MAC blocks come in two
//! generations (pre- and post-ConnectX-4) selected by the section's major
//! version.
//!
//! IMAGE_INFO layout:
//!
//! ```text
//! 0x000  major[31:24] minor[23:16]
//! 0x004  fw_major[15:0]
//! 0x008  fw_minor[31:16] fw_subminor[15:0]
//! 0x00c  year[31:16] month[15:8] day[7:0]
//! 0x010  mic_major[15:0]
//! 0x014  mic_minor[31:16] mic_subminor[15:0]
//! 0x018  image_security_version
//! 0x020  supported_hw_id[4]
//! 0x030  psid[16]
//! 0x050  vsd[208]
//! 0x120  product_ver[16]
//! 0x130  name[64]
//! 0x170  description[256]
//! ```

use std::fmt;

use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::util;

pub const IMAGE_INFO_SIZE: usize = 0x400;
pub const MFG_INFO_SIZE: usize = 0x100;
pub const DEV_INFO_SIZE: usize = 0x200;

pub const PSID_LEN: usize = 16;
pub const VSD_LEN: usize = 208;
pub const PRODUCT_VER_LEN: usize = 16;
pub const NAME_LEN: usize = 64;
pub const DESCRIPTION_LEN: usize = 256;

pub const MAX_SUPPORTED_HW_IDS: usize = 4;

/// The four words marking the valid copy of DEV_INFO.
pub const DEV_INFO_SIGNATURE: [u32; 4] = [0x6d44_6576, 0x496e_666f, 0x2342_cafa, 0xbaca_fe00];

const UID_AREA_OFFSET: usize = 0x20;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unknown {which} format version ({major}.{minor})")]
    UnknownSectVersion {
        which: &'static str,
        major: u8,
        minor: u8,
    },
    #[error("{which} section is truncated: {actual} bytes, need {expected}")]
    Truncated {
        which: &'static str,
        actual: usize,
        expected: usize,
    },
}

type Result<T> = std::result::Result<T, Error>;

fn check_len(which: &'static str, buf: &[u8], expected: usize) -> Result<()> {
    if buf.len() < expected {
        return Err(Error::Truncated {
            which,
            actual: buf.len(),
            expected,
        });
    }
    Ok(())
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
pub struct FwVersion {
    pub major: u16,
    pub minor: u16,
    pub subminor: u16,
}

impl fmt::Display for FwVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.subminor)
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
pub struct FwDate {
    pub year: u16,
    pub month: u8,
    pub day: u8,
}

/// One GUID or MAC allocation: a base UID plus a per-port range.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
pub struct UidEntry {
    pub uid: u64,
    pub num_allocated: u8,
    pub step: u8,
}

impl UidEntry {
    fn parse(buf: &[u8]) -> Self {
        let meta = BigEndian::read_u32(&buf[8..]);
        Self {
            uid: BigEndian::read_u64(buf),
            num_allocated: (meta >> 24) as u8,
            step: (meta >> 16) as u8,
        }
    }

    fn pack(&self, buf: &mut [u8]) {
        BigEndian::write_u64(buf, self.uid);
        BigEndian::write_u32(
            &mut buf[8..],
            u32::from(self.num_allocated) << 24 | u32::from(self.step) << 16,
        );
    }
}

/// GUID/MAC block, in its two generations. The old layout carries per-port
/// pairs; ConnectX-4 and later collapse to one entry each for GUIDs and
/// MACs.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub enum UidLayout {
    Cib {
        guids: [UidEntry; 2],
        macs: [UidEntry; 2],
    },
    Cx4 {
        guids: UidEntry,
        macs: UidEntry,
    },
}

impl UidLayout {
    fn parse_cib(buf: &[u8]) -> Self {
        Self::Cib {
            guids: [UidEntry::parse(&buf[0x00..]), UidEntry::parse(&buf[0x10..])],
            macs: [UidEntry::parse(&buf[0x20..]), UidEntry::parse(&buf[0x30..])],
        }
    }

    fn parse_cx4(buf: &[u8]) -> Self {
        Self::Cx4 {
            guids: UidEntry::parse(&buf[0x00..]),
            macs: UidEntry::parse(&buf[0x10..]),
        }
    }

    fn pack(&self, buf: &mut [u8]) {
        match self {
            Self::Cib { guids, macs } => {
                guids[0].pack(&mut buf[0x00..]);
                guids[1].pack(&mut buf[0x10..]);
                macs[0].pack(&mut buf[0x20..]);
                macs[1].pack(&mut buf[0x30..]);
            }
            Self::Cx4 { guids, macs } => {
                guids.pack(&mut buf[0x00..]);
                macs.pack(&mut buf[0x10..]);
            }
        }
    }
}

/// Fold a GUID base into the 48-bit MAC base: low 24 bits of each half,
/// concatenated.
pub fn mac_from_guid(guid: u64) -> u64 {
    let lo = guid as u32;
    let hi = (guid >> 32) as u32;
    u64::from(lo & 0x00ff_ffff) | (u64::from(hi & 0xffff_ff00) << 16)
}

/// A requested re-derivation of the GUID/MAC block from base values.
/// Unset fields keep whatever the section already carries.
#[derive(Clone, Copy, Debug, Default)]
pub struct BaseUid {
    pub base_guid: Option<u64>,
    pub base_mac: Option<u64>,
    pub mac_from_guid: bool,
    pub num_per_port: [Option<u8>; 2],
    pub step_per_port: [Option<u8>; 2],
}

/// Re-derive a GUID/MAC block in place from a base allocation.
///
/// The old layout derives both per-port entries from a single base; the new
/// one takes independent GUID and MAC bases, optionally folding the MAC out
/// of the GUID.
pub fn apply_base_uid(layout: &mut UidLayout, base: &BaseUid) {
    match layout {
        UidLayout::Cib { guids, macs } => {
            let base_guid = base.base_guid.unwrap_or(guids[0].uid);
            let base_mac = mac_from_guid(base_guid);

            for (port, entry) in guids.iter_mut().enumerate() {
                if let Some(num) = base.num_per_port[port] {
                    entry.num_allocated = num;
                }
                if let Some(step) = base.step_per_port[port] {
                    entry.step = step;
                }
            }
            guids[0].uid = base_guid;
            guids[1].uid =
                base_guid + u64::from(guids[0].num_allocated) * u64::from(guids[0].step);

            for (port, entry) in macs.iter_mut().enumerate() {
                if let Some(num) = base.num_per_port[port] {
                    entry.num_allocated = num;
                }
                if let Some(step) = base.step_per_port[port] {
                    entry.step = step;
                }
            }
            macs[0].uid = base_mac;
            macs[1].uid = base_mac + u64::from(macs[0].num_allocated) * u64::from(macs[0].step);
        }
        UidLayout::Cx4 { guids, macs } => {
            if let Some(num) = base.num_per_port[0] {
                guids.num_allocated = num;
                macs.num_allocated = num;
            }
            if let Some(step) = base.step_per_port[0] {
                guids.step = step;
                macs.step = step;
            }
            if let Some(base_guid) = base.base_guid {
                guids.uid = base_guid;
                if base.mac_from_guid {
                    macs.uid = mac_from_guid(base_guid);
                }
            }
            if let Some(base_mac) = base.base_mac {
                macs.uid = base_mac;
            }
        }
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
pub struct ImageInfo {
    pub minor_version: u8,
    pub fw_version: FwVersion,
    pub fw_date: FwDate,
    pub mic_version: FwVersion,
    pub security_version: u32,
    pub supported_hw_ids: Vec<u32>,
    pub psid: String,
    pub vsd: String,
    pub product_ver: String,
    pub name: String,
    pub description: String,
}

impl ImageInfo {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        check_len("IMAGE_INFO", buf, IMAGE_INFO_SIZE)?;

        let head = BigEndian::read_u32(buf);
        let major = (head >> 24) as u8;
        let minor = (head >> 16) as u8;
        if major != 0 {
            return Err(Error::UnknownSectVersion {
                which: "IMAGE_INFO",
                major,
                minor,
            });
        }

        let date = BigEndian::read_u32(&buf[0x0c..]);

        let supported_hw_ids = buf[0x20..0x30]
            .chunks_exact(4)
            .map(BigEndian::read_u32)
            .filter(|id| *id != 0)
            .collect();

        Ok(Self {
            minor_version: minor,
            fw_version: FwVersion {
                major: BigEndian::read_u32(&buf[0x04..]) as u16,
                minor: (BigEndian::read_u32(&buf[0x08..]) >> 16) as u16,
                subminor: BigEndian::read_u32(&buf[0x08..]) as u16,
            },
            fw_date: FwDate {
                year: (date >> 16) as u16,
                month: (date >> 8) as u8,
                day: date as u8,
            },
            mic_version: FwVersion {
                major: BigEndian::read_u32(&buf[0x10..]) as u16,
                minor: (BigEndian::read_u32(&buf[0x14..]) >> 16) as u16,
                subminor: BigEndian::read_u32(&buf[0x14..]) as u16,
            },
            security_version: BigEndian::read_u32(&buf[0x18..]),
            supported_hw_ids,
            psid: util::fixed_str(&buf[0x30..0x30 + PSID_LEN]),
            vsd: util::fixed_str(&buf[0x50..0x50 + VSD_LEN]),
            product_ver: util::fixed_str(&buf[0x120..0x120 + PRODUCT_VER_LEN]),
            name: util::fixed_str(&buf[0x130..0x130 + NAME_LEN]),
            description: util::fixed_str(&buf[0x170..0x170 + DESCRIPTION_LEN]),
        })
    }

    pub fn pack(&self) -> Vec<u8> {
        let mut buf = vec![0u8; IMAGE_INFO_SIZE];

        BigEndian::write_u32(&mut buf[0x00..], u32::from(self.minor_version) << 16);
        BigEndian::write_u32(&mut buf[0x04..], u32::from(self.fw_version.major));
        BigEndian::write_u32(
            &mut buf[0x08..],
            u32::from(self.fw_version.minor) << 16 | u32::from(self.fw_version.subminor),
        );
        BigEndian::write_u32(
            &mut buf[0x0c..],
            u32::from(self.fw_date.year) << 16
                | u32::from(self.fw_date.month) << 8
                | u32::from(self.fw_date.day),
        );
        BigEndian::write_u32(&mut buf[0x10..], u32::from(self.mic_version.major));
        BigEndian::write_u32(
            &mut buf[0x14..],
            u32::from(self.mic_version.minor) << 16 | u32::from(self.mic_version.subminor),
        );
        BigEndian::write_u32(&mut buf[0x18..], self.security_version);

        for (i, id) in self
            .supported_hw_ids
            .iter()
            .take(MAX_SUPPORTED_HW_IDS)
            .enumerate()
        {
            BigEndian::write_u32(&mut buf[0x20 + i * 4..], *id);
        }

        buf[0x30..0x30 + PSID_LEN].copy_from_slice(&util::to_fixed::<PSID_LEN>(&self.psid));
        buf[0x50..0x50 + VSD_LEN].copy_from_slice(&util::to_fixed::<VSD_LEN>(&self.vsd));
        buf[0x120..0x120 + PRODUCT_VER_LEN]
            .copy_from_slice(&util::to_fixed::<PRODUCT_VER_LEN>(&self.product_ver));
        buf[0x130..0x130 + NAME_LEN].copy_from_slice(&util::to_fixed::<NAME_LEN>(&self.name));
        buf[0x170..0x170 + DESCRIPTION_LEN]
            .copy_from_slice(&util::to_fixed::<DESCRIPTION_LEN>(&self.description));

        buf
    }

    /// Overwrite only the VSD field inside a packed section.
    pub fn patch_vsd(section: &mut [u8], vsd: &str) {
        section[0x50..0x50 + VSD_LEN].copy_from_slice(&util::to_fixed::<VSD_LEN>(vsd));
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct MfgInfo {
    pub minor_version: u8,
    pub psid: String,
    pub guids_override_en: bool,
    pub uids: UidLayout,
}

impl MfgInfo {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        check_len("MFG_INFO", buf, MFG_INFO_SIZE)?;

        let head = BigEndian::read_u32(&buf[0x10..]);
        let major = (head >> 24) as u8;
        let minor = (head >> 16) as u8;

        let uids = match major {
            0 => UidLayout::parse_cib(&buf[UID_AREA_OFFSET..]),
            1 => UidLayout::parse_cx4(&buf[UID_AREA_OFFSET..]),
            _ => {
                return Err(Error::UnknownSectVersion {
                    which: "MFG_INFO",
                    major,
                    minor,
                })
            }
        };

        Ok(Self {
            minor_version: minor,
            psid: util::fixed_str(&buf[..PSID_LEN]),
            guids_override_en: head & 1 != 0,
            uids,
        })
    }

    pub fn pack(&self) -> Vec<u8> {
        let mut buf = vec![0u8; MFG_INFO_SIZE];

        buf[..PSID_LEN].copy_from_slice(&util::to_fixed::<PSID_LEN>(&self.psid));

        let major: u8 = match self.uids {
            UidLayout::Cib { .. } => 0,
            UidLayout::Cx4 { .. } => 1,
        };
        BigEndian::write_u32(
            &mut buf[0x10..],
            u32::from(major) << 24
                | u32::from(self.minor_version) << 16
                | u32::from(self.guids_override_en),
        );

        self.uids.pack(&mut buf[UID_AREA_OFFSET..]);
        buf
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct DevInfo {
    pub minor_version: u8,
    pub vsd: String,
    pub uids: UidLayout,
}

impl DevInfo {
    /// Only the copy carrying the signature quartet is live; its twin is
    /// the stale side of the dual-write scheme.
    pub fn has_valid_signature(buf: &[u8]) -> bool {
        buf.len() >= 16
            && DEV_INFO_SIGNATURE
                .iter()
                .enumerate()
                .all(|(i, sig)| BigEndian::read_u32(&buf[i * 4..]) == *sig)
    }

    pub fn parse(buf: &[u8]) -> Result<Self> {
        check_len("DEV_INFO", buf, DEV_INFO_SIZE)?;

        let head = BigEndian::read_u32(&buf[0x10..]);
        let major = (head >> 24) as u8;
        let minor = (head >> 16) as u8;

        let uids = match major {
            1 => UidLayout::parse_cib(&buf[UID_AREA_OFFSET..]),
            2 => UidLayout::parse_cx4(&buf[UID_AREA_OFFSET..]),
            _ => {
                return Err(Error::UnknownSectVersion {
                    which: "DEV_INFO",
                    major,
                    minor,
                })
            }
        };

        Ok(Self {
            minor_version: minor,
            vsd: util::fixed_str(&buf[0x120..0x120 + VSD_LEN]),
            uids,
        })
    }

    /// Pack without the trailing CRC dword; DEV_INFO is an in-section CRC
    /// carrier and the store seals it.
    pub fn pack(&self) -> Vec<u8> {
        let mut buf = vec![0u8; DEV_INFO_SIZE];

        for (i, sig) in DEV_INFO_SIGNATURE.iter().enumerate() {
            BigEndian::write_u32(&mut buf[i * 4..], *sig);
        }

        let major: u8 = match self.uids {
            UidLayout::Cib { .. } => 1,
            UidLayout::Cx4 { .. } => 2,
        };
        BigEndian::write_u32(
            &mut buf[0x10..],
            u32::from(major) << 24 | u32::from(self.minor_version) << 16,
        );

        self.uids.pack(&mut buf[UID_AREA_OFFSET..]);
        buf[0x120..0x120 + VSD_LEN].copy_from_slice(&util::to_fixed::<VSD_LEN>(&self.vsd));
        buf
    }
}

/// Expansion ROM product kinds advertised in ROM_CODE.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub enum RomKind {
    Pxe,
    Uefi,
    Unknown(u16),
}

impl RomKind {
    fn from_raw(value: u16) -> Self {
        match value {
            0x10 => Self::Pxe,
            0x11 => Self::Uefi,
            v => Self::Unknown(v),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct RomProduct {
    pub kind: RomKind,
    pub major: u8,
    pub minor: u8,
    pub build: u16,
    pub proto: u8,
}

const ROM_PRODUCT_MAGIC: u32 = 0x6d6c_6e78; // "mlnx"

/// Scan a ROM_CODE payload for embedded product records.
pub fn parse_rom_products(buf: &[u8]) -> Vec<RomProduct> {
    let mut out = Vec::new();

    for offset in (0..buf.len().saturating_sub(12)).step_by(4) {
        if BigEndian::read_u32(&buf[offset..]) != ROM_PRODUCT_MAGIC {
            continue;
        }
        let d1 = BigEndian::read_u32(&buf[offset + 4..]);
        let d2 = BigEndian::read_u32(&buf[offset + 8..]);
        out.push(RomProduct {
            kind: RomKind::from_raw((d1 >> 16) as u16),
            major: (d1 >> 8) as u8,
            minor: d1 as u8,
            build: (d2 >> 16) as u16,
            proto: (d2 >> 8) as u8,
        });
    }

    out
}
