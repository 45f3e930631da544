// SPDX-FileCopyrightText: 2024-2026 nicfw contributors
// SPDX-License-Identifier: GPL-3.0-only

//! Wire model for the two tables of contents. An ITOC indexes firmware
//! sections at slot-relative addresses; a DTOC indexes device-resident data
//! at absolute flash addresses. Both share the same 32-byte header and
//! 32-byte entry records.
//!
//! Entry layout (big-endian dwords):
//!
//! ```text
//! 0  type[31:24]            size_dw[21:0]
//! 1  zipped[31] cache_line_crc[30] encrypted[29] param0[28:0]
//! 2  param1
//! 3  reserved
//! 4  reserved
//! 5  crc_mode[17:16]        section_crc[15:0]
//! 6  no_crc[31] device_data[30] relative_addr[29] flash_addr_dw[28:0]
//! 7  entry_crc[15:0]
//! ```
//!
//! The entry CRC covers dwords 0 through 6; the header CRC covers the same
//! span of its own record.

use std::fmt;

use bstr::ByteSlice;
use byteorder::{BigEndian, ByteOrder};
use thiserror::Error;

use crate::format::crc;

pub const TOC_HEADER_SIZE: usize = 32;
pub const TOC_ENTRY_SIZE: usize = 32;
pub const MAX_TOC_ENTRIES: usize = 128;

pub const ITOC_SIGNATURE: [u8; 4] = *b"MTFW";
pub const DTOC_SIGNATURE: [u8; 4] = *b"DTOC";

pub const TOC_RAND1: u32 = 0x0408_1516;
pub const TOC_RAND2: u32 = 0x2342_cafa;
pub const TOC_RAND3: u32 = 0xbaca_fe00;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid TOC header signature: {sig:?}", sig = .0.as_bstr())]
    BadSignature([u8; 4]),
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, serde::Serialize, serde::Deserialize)]
pub enum SectionType {
    BootCode,
    PciCode,
    MainCode,
    PcieLinkCode,
    IronPrepCode,
    PostIronBootCode,
    UpgradeCode,
    HwBootCfg,
    HwMainCfg,
    PhyUcCode,
    PhyUcConsts,
    PhyUcCmd,
    ImageInfo,
    FwBootCfg,
    FwMainCfg,
    RomCode,
    ResetInfo,
    DbgFwIni,
    DbgFwParams,
    FwAdb,
    ImageSignature256,
    PublicKeys2048,
    ForbiddenVersions,
    ImageSignature512,
    PublicKeys4096,
    HmacDigest,
    RsaPublicKey,
    Rsa4096Signatures,
    MfgInfo,
    DevInfo,
    NvData1,
    VpdR0,
    NvData2,
    FwNvLog,
    NvData0,
    Itoc,
    End,
    Unknown(u8),
}

impl SectionType {
    pub fn from_raw(value: u8) -> Self {
        match value {
            0x01 => Self::BootCode,
            0x02 => Self::PciCode,
            0x03 => Self::MainCode,
            0x04 => Self::PcieLinkCode,
            0x05 => Self::IronPrepCode,
            0x06 => Self::PostIronBootCode,
            0x07 => Self::UpgradeCode,
            0x08 => Self::HwBootCfg,
            0x09 => Self::HwMainCfg,
            0x0a => Self::PhyUcCode,
            0x0b => Self::PhyUcConsts,
            0x0c => Self::PhyUcCmd,
            0x10 => Self::ImageInfo,
            0x11 => Self::FwBootCfg,
            0x12 => Self::FwMainCfg,
            0x18 => Self::RomCode,
            0x20 => Self::ResetInfo,
            0x30 => Self::DbgFwIni,
            0x32 => Self::DbgFwParams,
            0x33 => Self::FwAdb,
            0xa0 => Self::ImageSignature256,
            0xa1 => Self::PublicKeys2048,
            0xa2 => Self::ForbiddenVersions,
            0xa3 => Self::ImageSignature512,
            0xa4 => Self::PublicKeys4096,
            0xa5 => Self::HmacDigest,
            0xa6 => Self::RsaPublicKey,
            0xa7 => Self::Rsa4096Signatures,
            0xe0 => Self::MfgInfo,
            0xe1 => Self::DevInfo,
            0xe2 => Self::NvData1,
            0xe3 => Self::VpdR0,
            0xe4 => Self::NvData2,
            0xe5 => Self::FwNvLog,
            0xe6 => Self::NvData0,
            0xfd => Self::Itoc,
            0xff => Self::End,
            v => Self::Unknown(v),
        }
    }

    pub fn to_raw(self) -> u8 {
        match self {
            Self::BootCode => 0x01,
            Self::PciCode => 0x02,
            Self::MainCode => 0x03,
            Self::PcieLinkCode => 0x04,
            Self::IronPrepCode => 0x05,
            Self::PostIronBootCode => 0x06,
            Self::UpgradeCode => 0x07,
            Self::HwBootCfg => 0x08,
            Self::HwMainCfg => 0x09,
            Self::PhyUcCode => 0x0a,
            Self::PhyUcConsts => 0x0b,
            Self::PhyUcCmd => 0x0c,
            Self::ImageInfo => 0x10,
            Self::FwBootCfg => 0x11,
            Self::FwMainCfg => 0x12,
            Self::RomCode => 0x18,
            Self::ResetInfo => 0x20,
            Self::DbgFwIni => 0x30,
            Self::DbgFwParams => 0x32,
            Self::FwAdb => 0x33,
            Self::ImageSignature256 => 0xa0,
            Self::PublicKeys2048 => 0xa1,
            Self::ForbiddenVersions => 0xa2,
            Self::ImageSignature512 => 0xa3,
            Self::PublicKeys4096 => 0xa4,
            Self::HmacDigest => 0xa5,
            Self::RsaPublicKey => 0xa6,
            Self::Rsa4096Signatures => 0xa7,
            Self::MfgInfo => 0xe0,
            Self::DevInfo => 0xe1,
            Self::NvData1 => 0xe2,
            Self::VpdR0 => 0xe3,
            Self::NvData2 => 0xe4,
            Self::FwNvLog => 0xe5,
            Self::NvData0 => 0xe6,
            Self::Itoc => 0xfd,
            Self::End => 0xff,
            Self::Unknown(v) => v,
        }
    }

    /// Device-resident data that survives firmware upgrades.
    pub fn is_device_data(self) -> bool {
        matches!(
            self,
            Self::MfgInfo
                | Self::DevInfo
                | Self::NvData0
                | Self::NvData1
                | Self::NvData2
                | Self::VpdR0
                | Self::FwNvLog
        )
    }

    /// Sections covered by the critical-group secure-boot signature.
    pub fn is_critical(self) -> bool {
        matches!(self, Self::HwBootCfg | Self::PcieLinkCode | Self::PhyUcCmd)
    }

    /// Signature carriers are excluded from both signing concatenations.
    pub fn is_signature(self) -> bool {
        matches!(
            self,
            Self::ImageSignature256 | Self::ImageSignature512 | Self::Rsa4096Signatures
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::BootCode => "BOOT_CODE",
            Self::PciCode => "PCI_CODE",
            Self::MainCode => "MAIN_CODE",
            Self::PcieLinkCode => "PCIE_LINK_CODE",
            Self::IronPrepCode => "IRON_PREP_CODE",
            Self::PostIronBootCode => "POST_IRON_BOOT_CODE",
            Self::UpgradeCode => "UPGRADE_CODE",
            Self::HwBootCfg => "HW_BOOT_CFG",
            Self::HwMainCfg => "HW_MAIN_CFG",
            Self::PhyUcCode => "PHY_UC_CODE",
            Self::PhyUcConsts => "PHY_UC_CONSTS",
            Self::PhyUcCmd => "PHY_UC_CMD",
            Self::ImageInfo => "IMAGE_INFO",
            Self::FwBootCfg => "FW_BOOT_CFG",
            Self::FwMainCfg => "FW_MAIN_CFG",
            Self::RomCode => "ROM_CODE",
            Self::ResetInfo => "RESET_INFO",
            Self::DbgFwIni => "DBG_FW_INI",
            Self::DbgFwParams => "DBG_FW_PARAMS",
            Self::FwAdb => "FW_ADB",
            Self::ImageSignature256 => "IMAGE_SIGNATURE_256",
            Self::PublicKeys2048 => "PUBLIC_KEYS_2048",
            Self::ForbiddenVersions => "FORBIDDEN_VERSIONS",
            Self::ImageSignature512 => "IMAGE_SIGNATURE_512",
            Self::PublicKeys4096 => "PUBLIC_KEYS_4096",
            Self::HmacDigest => "HMAC_DIGEST",
            Self::RsaPublicKey => "RSA_PUBLIC_KEY",
            Self::Rsa4096Signatures => "RSA_4096_SIGNATURES",
            Self::MfgInfo => "MFG_INFO",
            Self::DevInfo => "DEV_INFO",
            Self::NvData1 => "NV_DATA1",
            Self::VpdR0 => "VPD_R0",
            Self::NvData2 => "NV_DATA2",
            Self::FwNvLog => "FW_NV_LOG",
            Self::NvData0 => "NV_DATA0",
            Self::Itoc => "ITOC",
            Self::End => "END",
            Self::Unknown(_) => "UNKNOWN",
        }
    }
}

impl fmt::Display for SectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Self::Unknown(v) = self {
            write!(f, "UNKNOWN:{v:#x}")
        } else {
            f.write_str(self.name())
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum CrcMode {
    /// The section CRC lives in the TOC entry.
    #[default]
    InEntry,
    /// No section CRC at all.
    None,
    /// The last dword of the section stores the CRC; the entry's
    /// `section_crc` is informational.
    InSection,
}

impl CrcMode {
    pub fn from_raw(value: u32) -> Self {
        match value & 0x3 {
            1 => Self::None,
            2 => Self::InSection,
            _ => Self::InEntry,
        }
    }

    pub fn to_raw(self) -> u32 {
        match self {
            Self::InEntry => 0,
            Self::None => 1,
            Self::InSection => 2,
        }
    }
}

#[derive(Clone, Copy, Default, Eq, PartialEq)]
pub struct TocEntry {
    pub section_type: SectionType,
    /// Section size in dwords.
    pub size_dwords: u32,
    pub param0: u32,
    pub param1: u32,
    pub zipped: bool,
    pub cache_line_crc: bool,
    pub encrypted: bool,
    pub crc_mode: CrcMode,
    pub section_crc: u16,
    /// Section start in dwords; logical when `relative_addr`, absolute
    /// otherwise.
    pub flash_addr_dwords: u32,
    pub relative_addr: bool,
    pub device_data: bool,
    pub no_crc: bool,
    pub entry_crc: u16,
    pub reserved: [u32; 2],
}

impl Default for SectionType {
    fn default() -> Self {
        Self::End
    }
}

impl fmt::Debug for TocEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TocEntry")
            .field("section_type", &self.section_type)
            .field("size", &crate::util::NumBytes(self.size_bytes()))
            .field("flash_addr", &format_args!("{:#x}", self.flash_addr()))
            .field("relative_addr", &self.relative_addr)
            .field("device_data", &self.device_data)
            .field("crc_mode", &self.effective_crc_mode())
            .field("section_crc", &format_args!("{:#06x}", self.section_crc))
            .field("entry_crc", &format_args!("{:#06x}", self.entry_crc))
            .finish()
    }
}

impl TocEntry {
    pub fn parse(buf: &[u8; TOC_ENTRY_SIZE]) -> Self {
        let d0 = BigEndian::read_u32(&buf[0..]);
        let d1 = BigEndian::read_u32(&buf[4..]);
        let d2 = BigEndian::read_u32(&buf[8..]);
        let d3 = BigEndian::read_u32(&buf[12..]);
        let d4 = BigEndian::read_u32(&buf[16..]);
        let d5 = BigEndian::read_u32(&buf[20..]);
        let d6 = BigEndian::read_u32(&buf[24..]);
        let d7 = BigEndian::read_u32(&buf[28..]);

        Self {
            section_type: SectionType::from_raw((d0 >> 24) as u8),
            size_dwords: d0 & 0x003f_ffff,
            zipped: d1 & 0x8000_0000 != 0,
            cache_line_crc: d1 & 0x4000_0000 != 0,
            encrypted: d1 & 0x2000_0000 != 0,
            param0: d1 & 0x1fff_ffff,
            param1: d2,
            reserved: [d3, d4],
            crc_mode: CrcMode::from_raw(d5 >> 16),
            section_crc: d5 as u16,
            no_crc: d6 & 0x8000_0000 != 0,
            device_data: d6 & 0x4000_0000 != 0,
            relative_addr: d6 & 0x2000_0000 != 0,
            flash_addr_dwords: d6 & 0x1fff_ffff,
            entry_crc: d7 as u16,
        }
    }

    pub fn pack(&self) -> [u8; TOC_ENTRY_SIZE] {
        let mut buf = [0u8; TOC_ENTRY_SIZE];

        let d0 = u32::from(self.section_type.to_raw()) << 24 | (self.size_dwords & 0x003f_ffff);
        let d1 = (self.zipped as u32) << 31
            | (self.cache_line_crc as u32) << 30
            | (self.encrypted as u32) << 29
            | (self.param0 & 0x1fff_ffff);
        let d5 = self.crc_mode.to_raw() << 16 | u32::from(self.section_crc);
        let d6 = (self.no_crc as u32) << 31
            | (self.device_data as u32) << 30
            | (self.relative_addr as u32) << 29
            | (self.flash_addr_dwords & 0x1fff_ffff);

        BigEndian::write_u32(&mut buf[0..], d0);
        BigEndian::write_u32(&mut buf[4..], d1);
        BigEndian::write_u32(&mut buf[8..], self.param1);
        BigEndian::write_u32(&mut buf[12..], self.reserved[0]);
        BigEndian::write_u32(&mut buf[16..], self.reserved[1]);
        BigEndian::write_u32(&mut buf[20..], d5);
        BigEndian::write_u32(&mut buf[24..], d6);
        BigEndian::write_u32(&mut buf[28..], u32::from(self.entry_crc));

        buf
    }

    pub fn is_end(&self) -> bool {
        self.section_type == SectionType::End
    }

    pub fn size_bytes(&self) -> u32 {
        self.size_dwords * 4
    }

    pub fn flash_addr(&self) -> u32 {
        self.flash_addr_dwords * 4
    }

    pub fn set_flash_addr(&mut self, addr: u32) {
        debug_assert_eq!(addr % 4, 0);
        self.flash_addr_dwords = addr / 4;
    }

    pub fn end_addr(&self) -> u32 {
        self.flash_addr() + self.size_bytes()
    }

    /// The CRC scheme actually applied to the section. The `no_crc` flag and
    /// the encrypted cache-line-CRC combination both downgrade to no check.
    pub fn effective_crc_mode(&self) -> CrcMode {
        if self.no_crc || (self.cache_line_crc && self.encrypted) {
            CrcMode::None
        } else {
            self.crc_mode
        }
    }

    /// CRC over everything before the entry's own CRC word.
    pub fn compute_entry_crc(&self) -> u16 {
        let packed = self.pack();
        crc::crc16_sw(&packed[..TOC_ENTRY_SIZE - 4])
    }

    /// Refresh `entry_crc` to match the current field values.
    pub fn seal(&mut self) {
        self.entry_crc = self.compute_entry_crc();
    }

    /// An all-0xFF END marker, as written after the last live entry.
    pub fn end_marker_bytes() -> [u8; TOC_ENTRY_SIZE] {
        [0xff; TOC_ENTRY_SIZE]
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TocKind {
    Itoc,
    Dtoc,
}

impl TocKind {
    pub fn signature(self) -> [u8; 4] {
        match self {
            Self::Itoc => ITOC_SIGNATURE,
            Self::Dtoc => DTOC_SIGNATURE,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Itoc => "ITOC",
            Self::Dtoc => "DTOC",
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TocHeader {
    pub kind: TocKind,
    pub flash_layout_version: u8,
    pub crc: u16,
}

#[derive(Clone, Copy, Debug)]
pub struct HeaderCrc {
    pub stored: u16,
    pub computed: u16,
}

impl HeaderCrc {
    pub fn is_ok(&self) -> bool {
        self.stored == self.computed
    }
}

impl TocHeader {
    pub fn new(kind: TocKind, flash_layout_version: u8) -> Self {
        let mut header = Self {
            kind,
            flash_layout_version,
            crc: 0,
        };
        header.crc = header.compute_crc();
        header
    }

    /// Parse a header, failing only on a signature mismatch. CRC verdicts
    /// are returned for the caller to judge.
    pub fn parse(buf: &[u8; TOC_HEADER_SIZE]) -> Result<(Self, HeaderCrc)> {
        let mut signature = [0u8; 4];
        signature.copy_from_slice(&buf[..4]);

        let kind = if signature == ITOC_SIGNATURE {
            TocKind::Itoc
        } else if signature == DTOC_SIGNATURE {
            TocKind::Dtoc
        } else {
            return Err(Error::BadSignature(signature));
        };

        let rand_ok = BigEndian::read_u32(&buf[4..]) == TOC_RAND1
            && BigEndian::read_u32(&buf[8..]) == TOC_RAND2
            && BigEndian::read_u32(&buf[12..]) == TOC_RAND3;
        if !rand_ok {
            return Err(Error::BadSignature(signature));
        }

        let header = Self {
            kind,
            flash_layout_version: BigEndian::read_u32(&buf[16..]) as u8,
            crc: BigEndian::read_u32(&buf[28..]) as u16,
        };

        let crc = HeaderCrc {
            stored: header.crc,
            computed: crc::crc16_sw(&buf[..TOC_HEADER_SIZE - 4]),
        };

        Ok((header, crc))
    }

    pub fn pack(&self) -> [u8; TOC_HEADER_SIZE] {
        let mut buf = [0u8; TOC_HEADER_SIZE];
        buf[..4].copy_from_slice(&self.kind.signature());
        BigEndian::write_u32(&mut buf[4..], TOC_RAND1);
        BigEndian::write_u32(&mut buf[8..], TOC_RAND2);
        BigEndian::write_u32(&mut buf[12..], TOC_RAND3);
        BigEndian::write_u32(&mut buf[16..], u32::from(self.flash_layout_version));
        BigEndian::write_u32(&mut buf[28..], u32::from(self.crc));
        buf
    }

    pub fn compute_crc(&self) -> u16 {
        let packed = self.pack();
        crc::crc16_sw(&packed[..TOC_HEADER_SIZE - 4])
    }

    pub fn seal(&mut self) {
        self.crc = self.compute_crc();
    }
}

/// Section CRC verdict under the entry's effective mode.
#[derive(Clone, Copy, Debug)]
pub struct SectionCrc {
    pub mode: CrcMode,
    pub stored: u16,
    pub computed: u16,
}

impl SectionCrc {
    pub fn is_ok(&self) -> bool {
        self.mode == CrcMode::None || self.stored == self.computed
    }
}

/// Judge a section's bytes against its entry.
pub fn check_section_crc(entry: &TocEntry, data: &[u8]) -> SectionCrc {
    match entry.effective_crc_mode() {
        CrcMode::None => SectionCrc {
            mode: CrcMode::None,
            stored: 0,
            computed: 0,
        },
        CrcMode::InEntry => SectionCrc {
            mode: CrcMode::InEntry,
            stored: entry.section_crc,
            computed: crc::crc16_sw(data),
        },
        CrcMode::InSection => SectionCrc {
            mode: CrcMode::InSection,
            stored: BigEndian::read_u32(&data[data.len() - 4..]) as u16,
            computed: crc::crc16_sw(&data[..data.len() - 4]),
        },
    }
}

/// Refresh a section's CRC carrier and the entry CRC after a mutation.
///
/// `InEntry` updates the entry's `section_crc`; `InSection` rewrites the
/// section's trailing dword; `None` touches only the entry CRC.
pub fn seal_section(entry: &mut TocEntry, data: &mut [u8]) {
    debug_assert_eq!(data.len(), entry.size_bytes() as usize);

    match entry.effective_crc_mode() {
        CrcMode::None => {}
        CrcMode::InEntry => {
            entry.section_crc = crc::crc16_sw(data);
        }
        CrcMode::InSection => {
            let crc = crc::crc16_sw(&data[..data.len() - 4]);
            let at = data.len() - 4;
            BigEndian::write_u32(&mut data[at..], u32::from(crc));
        }
    }

    entry.seal();
}
