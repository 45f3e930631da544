// SPDX-FileCopyrightText: 2024-2026 nicfw contributors
// SPDX-License-Identifier: GPL-3.0-only

//! Synthesizes complete FS4 images in memory for the integration tests.

use byteorder::{BigEndian, ByteOrder};
use nicfw::{
    format::{
        boot::{self, BootVersion, HwPointers, ToolsArea, FS4_FORMAT_TAG, MAGIC_PATTERN,
            PREBOOT_WORDS},
        hashes::{HashesTable, SHA512_HASH_SIZE},
        info::{DevInfo, FwDate, FwVersion, ImageInfo, MfgInfo, UidEntry, UidLayout},
        toc::{seal_section, CrcMode, SectionType, TocEntry, TocKind},
    },
    store::{SectionStore, TocSlot},
};

pub const SECTOR: u32 = 0x1000;
pub const CHUNK_LOG2: u8 = 21;
pub const SLOT: u32 = 1 << CHUNK_LOG2;
pub const FLASH_SIZE: u32 = 2 * SLOT;

pub const TOOLS_ADDR: u32 = 0x500;
pub const BOOT2_ADDR: u32 = 0x1000;
pub const HASHES_ADDR: u32 = 0x2000;
pub const IMAGE_INFO_PLAIN_ADDR: u32 = 0x3000;
pub const DIGEST_ADDR: u32 = 0x3800;
pub const ITOC_ADDR: u32 = 0x4000;
pub const IMAGE_INFO_ADDR: u32 = 0x6000;
pub const PCI_CODE_ADDR: u32 = 0x7000;
pub const MAIN_CODE_ADDR: u32 = 0x8000;
pub const SIGNATURES_ADDR: u32 = 0xa000;
pub const PUBLIC_KEY_ADDR: u32 = 0xb000;
pub const HW_BOOT_CFG_ADDR: u32 = 0xc000;
pub const DTOC_ADDR: u32 = FLASH_SIZE - SECTOR;
pub const MFG_INFO_ADDR: u32 = 0x3f_0000;
pub const DEV_INFO_ADDR: u32 = 0x3f_1000;
pub const DEV_INFO_STALE_ADDR: u32 = 0x3f_2000;

pub const PSID: &str = "MT_0000000001";
pub const HW_ID: u32 = 0x20d;

#[derive(Clone)]
pub struct FixtureOpts {
    pub sign_sections: bool,
    pub hashes_table: bool,
    pub fw_subminor: u16,
    pub psid: &'static str,
    pub security_version: u32,
}

impl Default for FixtureOpts {
    fn default() -> Self {
        Self {
            sign_sections: false,
            hashes_table: false,
            fw_subminor: 2000,
            psid: PSID,
            security_version: 5,
        }
    }
}

pub fn put(img: &mut [u8], addr: u32, bytes: &[u8]) {
    img[addr as usize..addr as usize + bytes.len()].copy_from_slice(bytes);
}

fn add_section(
    store: &mut SectionStore,
    img: &mut [u8],
    section_type: SectionType,
    addr: u32,
    data: Vec<u8>,
    crc_mode: CrcMode,
    relative: bool,
    device_data: bool,
) {
    let mut entry = TocEntry {
        section_type,
        size_dwords: (data.len() / 4) as u32,
        crc_mode,
        relative_addr: relative,
        device_data,
        ..Default::default()
    };
    entry.set_flash_addr(addr);

    let mut data = data;
    seal_section(&mut entry, &mut data);
    put(img, addr, &data);

    store.slots.push(TocSlot {
        entry,
        entry_addr: 0,
        data,
    });
}

pub fn image_info(opts: &FixtureOpts) -> ImageInfo {
    ImageInfo {
        minor_version: 1,
        fw_version: FwVersion {
            major: 16,
            minor: 35,
            subminor: opts.fw_subminor,
        },
        fw_date: FwDate {
            year: 2025,
            month: 11,
            day: 3,
        },
        mic_version: FwVersion {
            major: 2,
            minor: 0,
            subminor: 0,
        },
        security_version: opts.security_version,
        supported_hw_ids: vec![HW_ID],
        psid: opts.psid.to_owned(),
        vsd: "image vsd".to_owned(),
        product_ver: "rel-16_35".to_owned(),
        name: "TestAdapter".to_owned(),
        description: "integration fixture".to_owned(),
    }
}

pub fn dev_info() -> DevInfo {
    DevInfo {
        minor_version: 0,
        vsd: "device vsd".to_owned(),
        uids: UidLayout::Cx4 {
            guids: UidEntry {
                uid: 0x0002_c903_0010_0000,
                num_allocated: 8,
                step: 1,
            },
            macs: UidEntry {
                uid: 0x0002_c910_0000,
                num_allocated: 8,
                step: 1,
            },
        },
    }
}

pub fn mfg_info(opts: &FixtureOpts) -> MfgInfo {
    MfgInfo {
        minor_version: 0,
        psid: opts.psid.to_owned(),
        guids_override_en: true,
        uids: UidLayout::Cx4 {
            guids: UidEntry {
                uid: 0x0002_c903_0010_0000,
                num_allocated: 8,
                step: 1,
            },
            macs: UidEntry {
                uid: 0x0002_c910_0000,
                num_allocated: 8,
                step: 1,
            },
        },
    }
}

/// Build a complete, verifiable FS4 image occupying slot 0 of a
/// `FLASH_SIZE` byte flash, device data included.
pub fn build_image(opts: &FixtureOpts) -> Vec<u8> {
    let mut img = vec![0xffu8; FLASH_SIZE as usize];

    put(&mut img, 0, &MAGIC_PATTERN);

    let version = BootVersion {
        format_tag: FS4_FORMAT_TAG,
        chunk_log2: CHUNK_LOG2,
        major: 1,
        minor: 0,
    };
    put(&mut img, 0x10, &version.to_raw().to_be_bytes());

    let hw = HwPointers {
        boot2: BOOT2_ADDR,
        toc: ITOC_ADDR,
        tools: TOOLS_ADDR,
        authentication_start: 0x10,
        authentication_end: 0x54f,
        digest_recovery_key: DIGEST_ADDR,
        fw_security_version: opts.security_version,
        hashes_table: if opts.hashes_table { HASHES_ADDR } else { 0 },
        hmac_start: IMAGE_INFO_PLAIN_ADDR,
        ..Default::default()
    };
    put(&mut img, 0x18, &hw.pack());

    let tools = ToolsArea {
        bin_ver_major: 1,
        bin_ver_minor: 0,
        log2_slot_size: CHUNK_LOG2,
    };
    put(&mut img, TOOLS_ADDR, &tools.pack());

    put(&mut img, BOOT2_ADDR, &boot::build_boot2(&[0xb2u8; 0x100]));

    if opts.hashes_table {
        let table = HashesTable::build(
            1,
            SHA512_HASH_SIZE,
            &[SectionType::ImageInfo, SectionType::Itoc],
        )
        .unwrap();
        put(&mut img, HASHES_ADDR, table.as_bytes());
    }

    // A plain-text IMAGE_INFO reachable through the HMAC start pointer,
    // as an encrypted image would carry.
    put(&mut img, IMAGE_INFO_PLAIN_ADDR, &image_info(opts).pack());

    // ITOC.
    let mut itoc = SectionStore::new(TocKind::Itoc, 1, ITOC_ADDR);
    add_section(
        &mut itoc,
        &mut img,
        SectionType::ImageInfo,
        IMAGE_INFO_ADDR,
        image_info(opts).pack(),
        CrcMode::InEntry,
        true,
        false,
    );
    add_section(
        &mut itoc,
        &mut img,
        SectionType::PciCode,
        PCI_CODE_ADDR,
        vec![0x11; 0x1000],
        CrcMode::InEntry,
        true,
        false,
    );
    add_section(
        &mut itoc,
        &mut img,
        SectionType::MainCode,
        MAIN_CODE_ADDR,
        vec![0x22; 0x2000],
        CrcMode::InEntry,
        true,
        false,
    );
    if opts.sign_sections {
        add_section(
            &mut itoc,
            &mut img,
            SectionType::HwBootCfg,
            HW_BOOT_CFG_ADDR,
            vec![0x33; 0x100],
            CrcMode::InEntry,
            true,
            false,
        );
        add_section(
            &mut itoc,
            &mut img,
            SectionType::Rsa4096Signatures,
            SIGNATURES_ADDR,
            vec![0; 0x600],
            CrcMode::None,
            true,
            false,
        );
        add_section(
            &mut itoc,
            &mut img,
            SectionType::RsaPublicKey,
            PUBLIC_KEY_ADDR,
            vec![0; 0x240],
            CrcMode::InEntry,
            true,
            false,
        );
    }
    itoc.set_toc_addr(ITOC_ADDR);
    put(&mut img, ITOC_ADDR, &itoc.serialize_toc());

    // DTOC: MFG_INFO plus the signed and stale DEV_INFO copies.
    let mut dtoc = SectionStore::new(TocKind::Dtoc, 1, DTOC_ADDR);
    add_section(
        &mut dtoc,
        &mut img,
        SectionType::MfgInfo,
        MFG_INFO_ADDR,
        mfg_info(opts).pack(),
        CrcMode::InEntry,
        false,
        true,
    );
    add_section(
        &mut dtoc,
        &mut img,
        SectionType::DevInfo,
        DEV_INFO_ADDR,
        dev_info().pack(),
        CrcMode::InSection,
        false,
        true,
    );
    add_section(
        &mut dtoc,
        &mut img,
        SectionType::DevInfo,
        DEV_INFO_STALE_ADDR,
        vec![0; 0x200],
        CrcMode::InSection,
        false,
        true,
    );
    dtoc.set_toc_addr(DTOC_ADDR);
    put(&mut img, DTOC_ADDR, &dtoc.serialize_toc());

    img
}

pub fn standard_image() -> Vec<u8> {
    build_image(&FixtureOpts::default())
}

pub const FS3_BOOT2_ADDR: u32 = 0x38;
pub const FS3_ITOC_ADDR: u32 = 0x1000;

/// An FS3 image: no hardware pointers, the chunk size in the boot version
/// word, one TOC holding firmware and device-data entries side by side, and
/// a CRC-sealed preboot block.
pub fn build_fs3_image(opts: &FixtureOpts) -> Vec<u8> {
    let mut img = vec![0xffu8; FLASH_SIZE as usize];

    put(&mut img, 0, &MAGIC_PATTERN);

    let version = BootVersion {
        format_tag: 0,
        chunk_log2: CHUNK_LOG2,
        major: 1,
        minor: 0,
    };
    put(&mut img, 0x10, &version.to_raw().to_be_bytes());

    put(&mut img, FS3_BOOT2_ADDR, &boot::build_boot2(&[0xb3u8; 0x100]));

    // Preboot CRC over the leading words, stored in the block's last dword.
    let mut words = [0u32; PREBOOT_WORDS];
    for (i, word) in words.iter_mut().enumerate() {
        *word = BigEndian::read_u32(&img[i * 4..]);
    }
    boot::seal_preboot(&mut words);
    BigEndian::write_u32(
        &mut img[(PREBOOT_WORDS - 1) * 4..],
        words[PREBOOT_WORDS - 1],
    );

    let mut itoc = SectionStore::new(TocKind::Itoc, 1, FS3_ITOC_ADDR);
    add_section(
        &mut itoc,
        &mut img,
        SectionType::ImageInfo,
        IMAGE_INFO_ADDR,
        image_info(opts).pack(),
        CrcMode::InEntry,
        true,
        false,
    );
    add_section(
        &mut itoc,
        &mut img,
        SectionType::MainCode,
        PCI_CODE_ADDR,
        vec![0x22; 0x1000],
        CrcMode::InEntry,
        true,
        false,
    );
    // A broken generator stripped the device-data bit from this entry; the
    // verifier accepts it with a warning.
    add_section(
        &mut itoc,
        &mut img,
        SectionType::NvData0,
        MAIN_CODE_ADDR,
        vec![0x44; 0x200],
        CrcMode::InEntry,
        true,
        false,
    );
    add_section(
        &mut itoc,
        &mut img,
        SectionType::MfgInfo,
        MFG_INFO_ADDR,
        mfg_info(opts).pack(),
        CrcMode::InEntry,
        false,
        true,
    );
    add_section(
        &mut itoc,
        &mut img,
        SectionType::DevInfo,
        DEV_INFO_ADDR,
        dev_info().pack(),
        CrcMode::InSection,
        false,
        true,
    );
    add_section(
        &mut itoc,
        &mut img,
        SectionType::DevInfo,
        DEV_INFO_STALE_ADDR,
        vec![0; 0x200],
        CrcMode::InSection,
        false,
        true,
    );
    itoc.set_toc_addr(FS3_ITOC_ADDR);
    put(&mut img, FS3_ITOC_ADDR, &itoc.serialize_toc());

    img
}
