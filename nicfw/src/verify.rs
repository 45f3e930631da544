// SPDX-FileCopyrightText: 2024-2026 nicfw contributors
// SPDX-License-Identifier: GPL-3.0-only

//! End-to-end verification: locate the image, parse the boot structures,
//! walk both tables of contents with every CRC checked, and fold the
//! well-known informational sections into a query summary.

use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    format::{
        boot::{
            self, BootVersion, HwPointers, ToolsArea, BOOT_VERSION_OFFSET, ENCRYPTED_CHUNK_LOG2,
            HW_POINTERS_OFFSET, HW_POINTERS_SIZE, PREBOOT_WORDS, TOOLS_AREA_SIZE,
        },
        hashes::{self, HashesTable},
        info::{self, DevInfo, ImageInfo, MfgInfo, RomProduct, IMAGE_INFO_SIZE},
        toc::{
            self, check_section_crc, SectionType, TocEntry, TocHeader, TocKind, MAX_TOC_ENTRIES,
            TOC_ENTRY_SIZE, TOC_HEADER_SIZE,
        },
    },
    io::BlockIo,
    store::{SectionStore, TocSlot},
};

/// Boot-code offset for FS3, which has no hardware pointer table.
pub const FS3_BOOT_CODE_OFFSET: u32 = 0x38;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Bad {kind} CRC at {addr:#x} (expected {expected:#06x}, actual {actual:#06x})")]
    BadCrc {
        kind: CheckKind,
        addr: u32,
        expected: u16,
        actual: u16,
    },
    #[error("No MFG_INFO section")]
    NoMfgInfo,
    #[error("No valid DEV_INFO section")]
    NoValidDeviceInfo,
    #[error("Two valid DEV_INFO sections")]
    TwoValidDeviceInfo,
    #[error("No valid ITOC header was found")]
    NoValidItoc,
    #[error("No valid DTOC header was found")]
    NoValidDtoc,
    #[error("Number of {0} entries exceeds the allowed {MAX_TOC_ENTRIES}")]
    TooManyEntries(&'static str),
    #[error("Operation not supported on an encrypted image")]
    EncryptedImage,
    #[error("Boot area error")]
    Boot(#[from] boot::Error),
    #[error("Section format error")]
    Info(#[from] info::Error),
    #[error("Hashes table error")]
    Hashes(#[from] hashes::Error),
    #[error("Section store error")]
    Store(#[from] crate::store::Error),
    #[error("I/O error")]
    Io(#[from] crate::io::Error),
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CheckKind {
    HwPointer,
    ToolsArea,
    Preboot,
    Boot2,
    TocHeader(TocKind),
    TocEntry(TocKind),
    Section(SectionType),
    HashesTableHeader,
    HashesTable,
}

impl std::fmt::Display for CheckKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::HwPointer => f.write_str("HW pointer"),
            Self::ToolsArea => f.write_str("tools area"),
            Self::Preboot => f.write_str("preboot"),
            Self::Boot2 => f.write_str("boot2"),
            Self::TocHeader(kind) => write!(f, "{} header", kind.name()),
            Self::TocEntry(kind) => write!(f, "{} entry", kind.name()),
            Self::Section(st) => write!(f, "{st} section"),
            Self::HashesTableHeader => f.write_str("hashes table header"),
            Self::HashesTable => f.write_str("hashes table"),
        }
    }
}

/// One CRC check verdict, reported for every check performed.
#[derive(Clone, Copy, Debug)]
pub struct CrcCheck {
    pub kind: CheckKind,
    pub addr: u32,
    pub size: u32,
    pub expected: u16,
    pub actual: u16,
    /// True when the scheme (or an override) skips enforcement.
    pub ignored: bool,
}

impl CrcCheck {
    pub fn is_ok(&self) -> bool {
        self.ignored || self.expected == self.actual
    }
}

/// Per-check observer. Every CRC comparison flows through here before the
/// engine decides whether it is fatal.
pub type VerifyCallback<'a> = &'a mut dyn FnMut(&CrcCheck);

#[derive(Clone, Copy, Debug, Default)]
pub struct QueryOptions {
    /// Visit only the informational sections instead of reading everything.
    pub quick: bool,
    /// Read ROM_CODE during a quick query.
    pub read_rom: bool,
    pub ignore_dtoc: bool,
    /// Downgrade CRC mismatches to callback reports.
    pub ignore_crc_check: bool,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FwFormat {
    Fs3,
    Fs4,
}

/// Device life-cycle state, read from registers by the front-end and fed
/// into the query for devices only.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub enum LifeCycle {
    Production,
    GaSecured,
    GaNonSecured,
    ReturnToManufacturer,
}

/// Structured summary of everything the informational sections carry.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct FwQuery {
    pub image_info: Option<ImageInfo>,
    pub mfg_info: Option<MfgInfo>,
    pub dev_info: Option<DevInfo>,
    #[serde(skip)]
    pub rom_products: Vec<RomProduct>,
    pub security_version: u32,
    pub life_cycle: Option<LifeCycle>,
}

impl FwQuery {
    pub fn psid(&self) -> Option<&str> {
        self.image_info.as_ref().map(|i| i.psid.as_str())
    }

    pub fn fw_version(&self) -> Option<info::FwVersion> {
        self.image_info.as_ref().map(|i| i.fw_version)
    }

    pub fn supported_hw_ids(&self) -> &[u32] {
        self.image_info
            .as_ref()
            .map(|i| i.supported_hw_ids.as_slice())
            .unwrap_or_default()
    }
}

/// A parsed firmware image bound to its I/O handle. All mutation and burn
/// operations start from this.
pub struct FwImage<I: BlockIo> {
    io: I,
    format: FwFormat,
    img_start: u32,
    chunk_log2: u8,
    boot_version: BootVersion,
    tools: Option<ToolsArea>,
    hw: Option<HwPointers>,
    hashes_table: Option<HashesTable>,
    itoc: SectionStore,
    dtoc: Option<SectionStore>,
    first_itoc_empty: bool,
    encrypted: bool,
    bad_dev_data: bool,
    boot2_end: u32,
    pub query: FwQuery,
}

/// Running state shared by the TOC walks.
#[derive(Default)]
struct WalkFlags {
    mfg_seen: bool,
    valid_dev_info: u32,
    bad_dev_data: bool,
}

impl<I: BlockIo> FwImage<I> {
    /// Parse and verify an image, reporting every CRC check through `cb`.
    pub fn parse(io: I, opts: QueryOptions, cb: VerifyCallback<'_>) -> Result<Self> {
        let mut this = Self {
            io,
            format: FwFormat::Fs4,
            img_start: 0,
            chunk_log2: 0,
            boot_version: BootVersion::default(),
            tools: None,
            hw: None,
            hashes_table: None,
            itoc: SectionStore::new(TocKind::Itoc, 1, 0),
            dtoc: None,
            first_itoc_empty: false,
            encrypted: false,
            bad_dev_data: false,
            boot2_end: 0,
            query: FwQuery::default(),
        };

        let starts = boot::find_image_starts(&mut this.io)?;
        this.img_start = match starts.len() {
            0 => return Err(boot::Error::NoValidImage.into()),
            1 => starts[0],
            // A stale slot can keep its magic when only its first TOC word
            // was cleared; a start whose ITOC no longer parses is not a
            // candidate.
            _ => {
                let mut valid = Vec::new();
                for start in starts {
                    if Self::probe_itoc(&mut this.io, start)? {
                        valid.push(start);
                    }
                }
                match valid.len() {
                    1 => valid[0],
                    _ => {
                        return Err(boot::Error::MultipleValidImages(if this.io.is_flash() {
                            "device"
                        } else {
                            "image"
                        })
                        .into())
                    }
                }
            }
        };
        debug!("Image start at {:#x}", this.img_start);

        this.io.set_convertor(0, false);
        let raw_version = this.read_u32_at(this.img_start + BOOT_VERSION_OFFSET)?;
        this.boot_version = BootVersion::from_raw(raw_version);

        if this.boot_version.is_fs4() {
            this.format = FwFormat::Fs4;
            let mut hw_buf = [0u8; HW_POINTERS_SIZE];
            this.io
                .read(this.img_start + HW_POINTERS_OFFSET, &mut hw_buf)?;
            this.parse_fs4(&hw_buf, opts, cb)?;
        } else {
            this.format = FwFormat::Fs3;
            this.parse_fs3(opts, cb)?;
        }

        Ok(this)
    }

    /// Parse without an observer.
    pub fn parse_quiet(io: I, opts: QueryOptions) -> Result<Self> {
        Self::parse(io, opts, &mut |_| {})
    }

    /// Whether a candidate image start leads to a parsable ITOC header at
    /// either of its two legitimate locations. FS3 candidates are accepted
    /// outright; their TOC position depends on the boot code size.
    fn probe_itoc(io: &mut I, start: u32) -> Result<bool> {
        let mut buf = [0u8; 4];
        io.read(start + BOOT_VERSION_OFFSET, &mut buf)?;
        if !BootVersion::from_raw(BigEndian::read_u32(&buf)).is_fs4() {
            return Ok(true);
        }

        let mut hw_buf = [0u8; HW_POINTERS_SIZE];
        io.read(start + HW_POINTERS_OFFSET, &mut hw_buf)?;
        let hw = HwPointers::parse_unchecked(&hw_buf);
        if hw.toc == 0 {
            return Ok(false);
        }

        let sector = io.sector_size();
        for addr in [start + hw.toc, start + hw.toc + sector] {
            let mut header = [0u8; TOC_HEADER_SIZE];
            io.read(addr, &mut header)?;
            if matches!(TocHeader::parse(&header), Ok((h, _)) if h.kind == TocKind::Itoc) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn parse_fs4(
        &mut self,
        hw_buf: &[u8; HW_POINTERS_SIZE],
        opts: QueryOptions,
        cb: VerifyCallback<'_>,
    ) -> Result<()> {
        for check in HwPointers::checks(hw_buf) {
            let event = CrcCheck {
                kind: CheckKind::HwPointer,
                addr: self.img_start + HW_POINTERS_OFFSET + (check.index as u32) * 8,
                size: 8,
                expected: check.stored,
                actual: check.computed,
                ignored: check.absent || opts.ignore_crc_check,
            };
            cb(&event);
            if !check.is_ok() && !opts.ignore_crc_check {
                return Err(Error::BadCrc {
                    kind: CheckKind::HwPointer,
                    addr: event.addr,
                    expected: check.stored,
                    actual: check.computed,
                });
            }
        }
        let hw = HwPointers::parse_unchecked(hw_buf);
        self.query.security_version = hw.fw_security_version;

        // Tools area: binary version and chunk size.
        let tools_addr = self.img_start + hw.tools;
        let mut tools_buf = [0u8; TOOLS_AREA_SIZE];
        self.io.read(tools_addr, &mut tools_buf)?;
        let (tools, tools_crc) = ToolsArea::parse(&tools_buf);
        cb(&CrcCheck {
            kind: CheckKind::ToolsArea,
            addr: tools_addr,
            size: TOOLS_AREA_SIZE as u32,
            expected: tools_crc.stored,
            actual: tools_crc.computed,
            ignored: opts.ignore_crc_check,
        });
        if !tools_crc.is_ok() && !opts.ignore_crc_check {
            return Err(Error::BadCrc {
                kind: CheckKind::ToolsArea,
                addr: tools_addr,
                expected: tools_crc.stored,
                actual: tools_crc.computed,
            });
        }

        tools.bin_version().check_supported()?;
        self.chunk_log2 = tools.effective_chunk_log2(self.img_start);
        self.tools = Some(tools);
        self.hw = Some(hw);

        self.io.set_convertor(self.chunk_log2, self.img_start != 0);

        // Boot2 size (and CRC on a full walk).
        if hw.boot2 != 0 {
            if opts.quick {
                self.boot2_end = hw.boot2 + boot::boot2_total_size(&mut self.io, hw.boot2)?;
            } else {
                let check = boot::check_boot2(&mut self.io, hw.boot2)?;
                self.boot2_end = hw.boot2 + check.size;
                cb(&CrcCheck {
                    kind: CheckKind::Boot2,
                    addr: hw.boot2,
                    size: check.size,
                    expected: check.stored,
                    actual: check.computed,
                    ignored: opts.ignore_crc_check,
                });
                if !check.is_ok() && !opts.ignore_crc_check {
                    return Err(Error::BadCrc {
                        kind: CheckKind::Boot2,
                        addr: hw.boot2,
                        expected: check.stored,
                        actual: check.computed,
                    });
                }
            }
        }

        if hw.hashes_table != 0 {
            self.verify_hashes_table(hw.hashes_table, opts, cb)?;
        }

        // The ITOC header may legitimately live one sector past its
        // pointer; remember which location answered because a fail-safe
        // TOC rewrite alternates between the two.
        let mut itoc_addr = hw.toc;
        let sector = self.io.sector_size();
        match self.try_toc_header(itoc_addr, TocKind::Itoc, opts, cb)? {
            Some(header) => {
                self.itoc = SectionStore::new(TocKind::Itoc, header.flash_layout_version, itoc_addr)
            }
            None => {
                itoc_addr += sector;
                self.first_itoc_empty = true;
                match self.try_toc_header(itoc_addr, TocKind::Itoc, opts, cb)? {
                    Some(header) => {
                        self.itoc =
                            SectionStore::new(TocKind::Itoc, header.flash_layout_version, itoc_addr)
                    }
                    None => {
                        // Both candidates unreadable: the ITOC itself is
                        // encrypted. Everything else is learned from
                        // IMAGE_INFO and the DTOC.
                        self.encrypted = true;
                        self.chunk_log2 = ENCRYPTED_CHUNK_LOG2;
                        return self.parse_encrypted(opts, cb);
                    }
                }
            }
        }

        let mut flags = WalkFlags::default();
        self.walk_toc(TocKind::Itoc, opts, cb, &mut flags)?;

        if !opts.ignore_dtoc {
            self.parse_dtoc(opts, cb)?;
        }

        self.bad_dev_data |= flags.bad_dev_data;
        Ok(())
    }

    fn parse_fs3(&mut self, opts: QueryOptions, cb: VerifyCallback<'_>) -> Result<()> {
        self.boot_version.check_supported()?;
        self.chunk_log2 = self.boot_version.chunk_log2;

        // Preboot block: both the proper and the legacy CRC are accepted.
        if !opts.quick {
            let mut words = [0u32; PREBOOT_WORDS];
            let buf = self
                .io
                .read_vec(self.img_start, (PREBOOT_WORDS * 4) as u32)?;
            for (i, chunk) in buf.chunks_exact(4).enumerate() {
                words[i] = BigEndian::read_u32(chunk);
            }
            let check = boot::check_preboot(&words);
            cb(&CrcCheck {
                kind: CheckKind::Preboot,
                addr: self.img_start,
                size: (PREBOOT_WORDS * 4) as u32,
                expected: check.stored,
                actual: check.proper,
                ignored: check.stored == check.legacy || opts.ignore_crc_check,
            });
            if !check.is_ok() && !opts.ignore_crc_check {
                return Err(Error::BadCrc {
                    kind: CheckKind::Preboot,
                    addr: self.img_start,
                    expected: check.stored,
                    actual: check.proper,
                });
            }
        }

        self.io.set_convertor(self.chunk_log2, self.img_start != 0);

        let boot2_size = boot::boot2_total_size(&mut self.io, FS3_BOOT_CODE_OFFSET)?;
        self.boot2_end = FS3_BOOT_CODE_OFFSET + boot2_size;
        if !opts.quick {
            let check = boot::check_boot2(&mut self.io, FS3_BOOT_CODE_OFFSET)?;
            cb(&CrcCheck {
                kind: CheckKind::Boot2,
                addr: FS3_BOOT_CODE_OFFSET,
                size: check.size,
                expected: check.stored,
                actual: check.computed,
                ignored: opts.ignore_crc_check,
            });
            if !check.is_ok() && !opts.ignore_crc_check {
                return Err(Error::BadCrc {
                    kind: CheckKind::Boot2,
                    addr: FS3_BOOT_CODE_OFFSET,
                    expected: check.stored,
                    actual: check.computed,
                });
            }
        }

        // The ITOC starts at the first sector boundary after boot2; empty
        // leading sectors are skipped, one header probe per sector.
        let sector = self.io.sector_size();
        let mut offset = crate::util::round_up(self.boot2_end, sector)
            .ok_or(Error::NoValidItoc)?;
        let mut probed_first = false;

        loop {
            if offset >= self.io.size() {
                return Err(Error::NoValidItoc);
            }
            match self.try_toc_header(offset, TocKind::Itoc, opts, cb)? {
                Some(header) => {
                    self.itoc =
                        SectionStore::new(TocKind::Itoc, header.flash_layout_version, offset);
                    break;
                }
                None => {
                    if probed_first {
                        return Err(Error::NoValidItoc);
                    }
                    probed_first = true;
                    self.first_itoc_empty = true;
                    offset += sector;
                }
            }
        }

        let mut flags = WalkFlags::default();
        self.walk_toc(TocKind::Itoc, opts, cb, &mut flags)?;

        // FS3 keeps device data in the same TOC; apply the DTOC integrity
        // rules to its device-data subset.
        if !opts.ignore_dtoc {
            if !flags.mfg_seen {
                self.bad_dev_data = true;
                return Err(Error::NoMfgInfo);
            }
            match flags.valid_dev_info {
                1 => {}
                0 => {
                    self.bad_dev_data = true;
                    return Err(Error::NoValidDeviceInfo);
                }
                _ => {
                    self.bad_dev_data = true;
                    return Err(Error::TwoValidDeviceInfo);
                }
            }
        }

        self.bad_dev_data |= flags.bad_dev_data;
        Ok(())
    }

    /// Encrypted FS4 image: IMAGE_INFO is reachable through the HMAC start
    /// pointer and the DTOC is in the clear; the ITOC is not.
    fn parse_encrypted(&mut self, opts: QueryOptions, cb: VerifyCallback<'_>) -> Result<()> {
        let hw = self.hw.as_ref().expect("hw pointers parsed before itoc");

        if hw.hmac_start != 0 {
            let addr = self.img_start + hw.hmac_start;
            self.io.set_convertor(0, false);
            let buf = self.io.read_vec(addr, IMAGE_INFO_SIZE as u32)?;
            self.query.image_info = Some(ImageInfo::parse(&buf)?);
        }

        if !opts.ignore_dtoc {
            self.parse_dtoc(opts, cb)?;
        }
        Ok(())
    }

    fn parse_dtoc(&mut self, opts: QueryOptions, cb: VerifyCallback<'_>) -> Result<()> {
        let saved = self.io.convertor();
        self.io.set_convertor(0, false);

        let result = self.parse_dtoc_inner(opts, cb);

        self.io.set_convertor(saved.chunk_log2, saved.second_slot);
        result
    }

    fn parse_dtoc_inner(&mut self, opts: QueryOptions, cb: VerifyCallback<'_>) -> Result<()> {
        let dtoc_addr = self.io.size() - self.io.sector_size();

        let header = self
            .try_toc_header(dtoc_addr, TocKind::Dtoc, opts, cb)?
            .ok_or(Error::NoValidDtoc)?;
        self.dtoc = Some(SectionStore::new(
            TocKind::Dtoc,
            header.flash_layout_version,
            dtoc_addr,
        ));

        let mut flags = WalkFlags::default();
        self.walk_toc(TocKind::Dtoc, opts, cb, &mut flags)?;

        if !flags.mfg_seen {
            self.bad_dev_data = true;
            return Err(Error::NoMfgInfo);
        }
        match flags.valid_dev_info {
            1 => {}
            0 => {
                self.bad_dev_data = true;
                return Err(Error::NoValidDeviceInfo);
            }
            _ => {
                self.bad_dev_data = true;
                return Err(Error::TwoValidDeviceInfo);
            }
        }

        self.bad_dev_data |= flags.bad_dev_data;
        Ok(())
    }

    /// Probe for a TOC header at `addr`. `Ok(None)` means the signature did
    /// not match (a legitimate state for the two ITOC candidates); a CRC
    /// mismatch on a well-signed header is an error.
    fn try_toc_header(
        &mut self,
        addr: u32,
        kind: TocKind,
        opts: QueryOptions,
        cb: VerifyCallback<'_>,
    ) -> Result<Option<TocHeader>> {
        let mut buf = [0u8; TOC_HEADER_SIZE];
        self.io.read(addr, &mut buf)?;

        let (header, crc) = match TocHeader::parse(&buf) {
            Ok(parsed) => parsed,
            Err(toc::Error::BadSignature(_)) => return Ok(None),
        };
        if header.kind != kind {
            return Ok(None);
        }

        cb(&CrcCheck {
            kind: CheckKind::TocHeader(kind),
            addr,
            size: TOC_HEADER_SIZE as u32,
            expected: crc.stored,
            actual: crc.computed,
            ignored: opts.ignore_crc_check,
        });
        if !crc.is_ok() && !opts.ignore_crc_check {
            return Err(Error::BadCrc {
                kind: CheckKind::TocHeader(kind),
                addr,
                expected: crc.stored,
                actual: crc.computed,
            });
        }

        Ok(Some(header))
    }

    fn store_mut(&mut self, kind: TocKind) -> &mut SectionStore {
        match kind {
            TocKind::Itoc => &mut self.itoc,
            TocKind::Dtoc => self.dtoc.as_mut().expect("dtoc store initialized"),
        }
    }

    fn walk_toc(
        &mut self,
        kind: TocKind,
        opts: QueryOptions,
        cb: VerifyCallback<'_>,
        flags: &mut WalkFlags,
    ) -> Result<()> {
        let toc_addr = self.store_mut(kind).toc_addr;

        for index in 0..MAX_TOC_ENTRIES + 1 {
            if index == MAX_TOC_ENTRIES {
                return Err(Error::TooManyEntries(kind.name()));
            }

            let entry_addr = toc_addr + (TOC_HEADER_SIZE + index * TOC_ENTRY_SIZE) as u32;
            let mut buf = [0u8; TOC_ENTRY_SIZE];
            self.io.read(entry_addr, &mut buf)?;
            let entry = TocEntry::parse(&buf);

            if entry.is_end() {
                break;
            }
            if entry.section_type == SectionType::MfgInfo {
                flags.mfg_seen = true;
            }

            let computed = entry.compute_entry_crc();
            cb(&CrcCheck {
                kind: CheckKind::TocEntry(kind),
                addr: entry_addr,
                size: TOC_ENTRY_SIZE as u32,
                expected: entry.entry_crc,
                actual: computed,
                ignored: opts.ignore_crc_check,
            });
            if computed != entry.entry_crc && !opts.ignore_crc_check {
                return Err(Error::BadCrc {
                    kind: CheckKind::TocEntry(kind),
                    addr: entry_addr,
                    expected: entry.entry_crc,
                    actual: computed,
                });
            }

            self.check_dev_data_recovery(&entry, cb);

            let data = if self.should_read(&entry, opts) {
                self.read_and_check_section(&entry, opts, cb, flags)?
            } else {
                Vec::new()
            };

            self.store_mut(kind).slots.push(TocSlot {
                entry,
                entry_addr,
                data,
            });
        }

        Ok(())
    }

    /// Recovery path for broken binaries: known device-data types whose
    /// entry lost the `device_data` bit are accepted with a warning rather
    /// than rejected.
    fn check_dev_data_recovery(&self, entry: &TocEntry, cb: VerifyCallback<'_>) {
        if self.format != FwFormat::Fs3 {
            return;
        }
        let hack = matches!(
            entry.section_type,
            SectionType::NvData0 | SectionType::NvData2 | SectionType::FwNvLog
        ) && !entry.device_data
            && !entry.no_crc
            && entry.relative_addr;

        if hack {
            warn!(
                "{} entry is missing the device-data attribute; accepting for recovery",
                entry.section_type
            );
            cb(&CrcCheck {
                kind: CheckKind::Section(entry.section_type),
                addr: entry.flash_addr(),
                size: entry.size_bytes(),
                expected: 0,
                actual: 0,
                ignored: true,
            });
        }
    }

    fn should_read(&self, entry: &TocEntry, opts: QueryOptions) -> bool {
        if !opts.quick {
            return true;
        }
        match entry.section_type {
            SectionType::MfgInfo | SectionType::ImageInfo | SectionType::DevInfo => true,
            SectionType::RomCode => opts.read_rom,
            _ => false,
        }
    }

    fn read_and_check_section(
        &mut self,
        entry: &TocEntry,
        opts: QueryOptions,
        cb: VerifyCallback<'_>,
        flags: &mut WalkFlags,
    ) -> Result<Vec<u8>> {
        let data = self.read_section_bytes(entry)?;

        // Encrypted payloads cannot be CRC'd at this layer.
        let skip_crc = self.encrypted;

        let is_dev_info = entry.section_type == SectionType::DevInfo;
        let dev_info_valid = is_dev_info && DevInfo::has_valid_signature(&data);
        if dev_info_valid {
            flags.valid_dev_info += 1;
        }

        if !skip_crc && (!is_dev_info || dev_info_valid) {
            let check = check_section_crc(entry, &data);
            cb(&CrcCheck {
                kind: CheckKind::Section(entry.section_type),
                addr: entry.flash_addr(),
                size: entry.size_bytes(),
                expected: check.stored,
                actual: check.computed,
                ignored: check.mode == toc::CrcMode::None || opts.ignore_crc_check,
            });
            if !check.is_ok() && !opts.ignore_crc_check {
                if entry.device_data {
                    flags.bad_dev_data = true;
                }
                return Err(Error::BadCrc {
                    kind: CheckKind::Section(entry.section_type),
                    addr: entry.flash_addr(),
                    expected: check.stored,
                    actual: check.computed,
                });
            }
        }

        if !is_dev_info || dev_info_valid {
            self.collect_info(entry, &data)?;
        }

        Ok(data)
    }

    fn read_section_bytes(&mut self, entry: &TocEntry) -> Result<Vec<u8>> {
        if entry.relative_addr {
            Ok(self.io.read_vec(entry.flash_addr(), entry.size_bytes())?)
        } else {
            let saved = self.io.convertor();
            self.io.set_convertor(0, false);
            let result = self.io.read_vec(entry.flash_addr(), entry.size_bytes());
            self.io.set_convertor(saved.chunk_log2, saved.second_slot);
            Ok(result?)
        }
    }

    fn collect_info(&mut self, entry: &TocEntry, data: &[u8]) -> Result<()> {
        match entry.section_type {
            SectionType::ImageInfo => {
                self.query.image_info = Some(ImageInfo::parse(data)?);
            }
            SectionType::MfgInfo => {
                self.query.mfg_info = Some(MfgInfo::parse(data)?);
            }
            SectionType::DevInfo => {
                self.query.dev_info = Some(DevInfo::parse(data)?);
            }
            SectionType::RomCode => {
                self.query.rom_products = info::parse_rom_products(data);
            }
            _ => {}
        }
        Ok(())
    }

    fn verify_hashes_table(
        &mut self,
        ptr: u32,
        opts: QueryOptions,
        cb: VerifyCallback<'_>,
    ) -> Result<()> {
        // Header first: it frames the HTOC that determines the total size.
        let header = self
            .io
            .read_vec(ptr, hashes::HASHES_TABLE_HEADER_SIZE as u32)?;
        let header_stored =
            BigEndian::read_u32(&header[hashes::HASHES_TABLE_HEADER_SIZE - 4..]) as u16;
        let header_computed =
            crate::format::crc::crc16_sw(&header[..hashes::HASHES_TABLE_HEADER_SIZE - 4]);
        cb(&CrcCheck {
            kind: CheckKind::HashesTableHeader,
            addr: ptr,
            size: hashes::HASHES_TABLE_HEADER_SIZE as u32,
            expected: header_stored,
            actual: header_computed,
            ignored: opts.ignore_crc_check,
        });
        if header_stored != header_computed && !opts.ignore_crc_check {
            return Err(Error::BadCrc {
                kind: CheckKind::HashesTableHeader,
                addr: ptr,
                expected: header_stored,
                actual: header_computed,
            });
        }

        let htoc_meta = self.io.read_vec(
            ptr + hashes::HASHES_TABLE_HEADER_SIZE as u32,
            hashes::HTOC_HEADER_SIZE as u32,
        )?;
        let hash_size = BigEndian::read_u32(&htoc_meta[4..]) as u16;

        let total = hashes::table_size(hash_size) as u32;
        let raw = self.io.read_vec(ptr, total)?;
        let table = HashesTable::parse(raw)?;

        let table_crc = table.table_crc();
        cb(&CrcCheck {
            kind: CheckKind::HashesTable,
            addr: ptr,
            size: total,
            expected: table_crc.stored,
            actual: table_crc.computed,
            ignored: opts.ignore_crc_check,
        });
        if !table_crc.is_ok() && !opts.ignore_crc_check {
            return Err(Error::BadCrc {
                kind: CheckKind::HashesTable,
                addr: ptr,
                expected: table_crc.stored,
                actual: table_crc.computed,
            });
        }

        self.hashes_table = Some(table);
        Ok(())
    }

    fn read_u32_at(&mut self, addr: u32) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.io.read(addr, &mut buf)?;
        Ok(BigEndian::read_u32(&buf))
    }

    // Accessors used by the burn and signing layers.

    pub fn io(&mut self) -> &mut I {
        &mut self.io
    }

    pub fn into_io(self) -> I {
        self.io
    }

    pub fn format(&self) -> FwFormat {
        self.format
    }

    pub fn img_start(&self) -> u32 {
        self.img_start
    }

    pub fn chunk_log2(&self) -> u8 {
        self.chunk_log2
    }

    pub fn slot_size(&self) -> u32 {
        1u32 << self.chunk_log2
    }

    pub fn boot_version(&self) -> BootVersion {
        self.boot_version
    }

    pub fn hw_pointers(&self) -> Option<&HwPointers> {
        self.hw.as_ref()
    }

    pub fn hashes_table(&self) -> Option<&HashesTable> {
        self.hashes_table.as_ref()
    }

    pub fn hashes_table_mut(&mut self) -> Option<&mut HashesTable> {
        self.hashes_table.as_mut()
    }

    pub fn itoc(&self) -> &SectionStore {
        &self.itoc
    }

    pub fn itoc_mut(&mut self) -> &mut SectionStore {
        &mut self.itoc
    }

    pub fn dtoc(&self) -> Option<&SectionStore> {
        self.dtoc.as_ref()
    }

    pub fn dtoc_mut(&mut self) -> Option<&mut SectionStore> {
        self.dtoc.as_mut()
    }

    pub fn first_itoc_empty(&self) -> bool {
        self.first_itoc_empty
    }

    /// Flip which of the two candidate ITOC sectors is live; called after a
    /// fail-safe TOC rewrite lands in the other one.
    pub fn toggle_first_itoc_empty(&mut self) {
        self.first_itoc_empty = !self.first_itoc_empty;
    }

    /// Image size without borrowing mutably.
    pub fn io_size(&self) -> u32 {
        self.io.size()
    }

    /// Swap in an updated DTOC model after a bulk device-data move.
    pub fn replace_dtoc(&mut self, dtoc: SectionStore) {
        self.dtoc = Some(dtoc);
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    pub fn has_bad_dev_data(&self) -> bool {
        self.bad_dev_data
    }

    pub fn boot2_end(&self) -> u32 {
        self.boot2_end
    }

    pub fn set_life_cycle(&mut self, life_cycle: LifeCycle) {
        self.query.life_cycle = Some(life_cycle);
    }

    /// Write the in-memory ITOC and all of its sections back into the
    /// image.
    pub fn flush_itoc(&mut self) -> Result<()> {
        let toc = self.itoc.serialize_toc();
        self.io.write(self.itoc.toc_addr, &toc, false)?;

        for index in 0..self.itoc.slots.len() {
            let (entry, data) = {
                let slot = &self.itoc.slots[index];
                (slot.entry, slot.data.clone())
            };
            if data.is_empty() {
                continue;
            }
            self.io
                .write(entry.flash_addr(), &data, !entry.relative_addr)?;
        }
        Ok(())
    }

    /// Rewrite the ITOC array. On flash the write alternates between the
    /// two candidate sectors and then invalidates the old header, so a
    /// crash mid-rewrite always leaves one valid table.
    pub fn reburn_itoc(&mut self) -> Result<()> {
        let sector = self.io.sector_size();
        let old_addr = self.itoc.toc_addr;
        let failsafe = self.io.is_flash();

        let new_addr = if failsafe {
            if self.first_itoc_empty {
                old_addr - sector
            } else {
                old_addr + sector
            }
        } else {
            old_addr
        };

        if new_addr != old_addr {
            self.itoc.set_toc_addr(new_addr);
            self.first_itoc_empty = !self.first_itoc_empty;
        }

        let toc = self.itoc.serialize_toc();
        self.io.write(new_addr, &toc, false)?;

        if failsafe && new_addr != old_addr {
            self.io.write(old_addr, &[0u8; 4], false)?;
        }

        Ok(())
    }

    /// Replace one section's bytes and rewrite it together with its TOC.
    /// The hash chain, if any, is the caller's to refresh.
    pub fn replace_section_in_place(
        &mut self,
        section_type: SectionType,
        data: Vec<u8>,
    ) -> Result<()> {
        if self.encrypted {
            return Err(Error::EncryptedImage);
        }

        if self.itoc.contains(section_type) {
            self.itoc.replace(section_type, data)?;

            let (entry, bytes) = {
                let slot = self.itoc.find(section_type).expect("just replaced");
                (slot.entry, slot.data.clone())
            };
            self.io
                .write(entry.flash_addr(), &bytes, !entry.relative_addr)?;

            self.reburn_itoc()
        } else {
            let dtoc = self
                .dtoc
                .as_mut()
                .ok_or(crate::store::Error::SectionNotFound(section_type, "image"))?;
            dtoc.replace(section_type, data)?;

            let (entry, bytes, toc_bytes, toc_addr) = {
                let dtoc = self.dtoc.as_ref().expect("checked above");
                let slot = dtoc.find(section_type).expect("just replaced");
                (
                    slot.entry,
                    slot.data.clone(),
                    dtoc.serialize_toc(),
                    dtoc.toc_addr,
                )
            };
            self.io.write(entry.flash_addr(), &bytes, true)?;
            self.io.write(toc_addr, &toc_bytes, true)?;
            Ok(())
        }
    }

    /// Fetch a section's bytes, from the store if the walk read them or
    /// from the image otherwise.
    pub fn section_data(&mut self, section_type: SectionType) -> Result<Vec<u8>> {
        if self.encrypted {
            return Err(Error::EncryptedImage);
        }

        let slot = self
            .itoc
            .find(section_type)
            .or_else(|| self.dtoc.as_ref().and_then(|d| d.find(section_type)))
            .ok_or(Error::Store(crate::store::Error::SectionNotFound(
                section_type,
                "image",
            )))?;

        if !slot.data.is_empty() {
            return Ok(slot.data.clone());
        }
        let entry = slot.entry;
        self.read_section_bytes(&entry)
    }
}
