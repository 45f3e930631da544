// SPDX-FileCopyrightText: 2024-2026 nicfw contributors
// SPDX-License-Identifier: GPL-3.0-only

mod common;

use byteorder::{BigEndian, ByteOrder};
use common::*;
use nicfw::{
    burn,
    format::{
        boot::{self, MAGIC_PATTERN},
        info::UidLayout,
        toc::{SectionType, TOC_HEADER_SIZE},
    },
    io::FileImage,
    verify::{CheckKind, CrcCheck, Error, FwFormat, FwImage, QueryOptions},
};

fn full_query() -> QueryOptions {
    QueryOptions::default()
}

fn quick_query() -> QueryOptions {
    QueryOptions {
        quick: true,
        read_rom: true,
        ..Default::default()
    }
}

#[test]
fn verify_standard_image() {
    let img = FwImage::parse_quiet(FileImage::new(standard_image()), full_query()).unwrap();

    assert_eq!(img.format(), FwFormat::Fs4);
    assert_eq!(img.img_start(), 0);
    assert_eq!(img.chunk_log2(), CHUNK_LOG2);
    assert!(!img.first_itoc_empty());
    assert!(!img.is_encrypted());
    assert!(!img.has_bad_dev_data());

    let info = img.query.image_info.as_ref().unwrap();
    assert_eq!(info.psid, PSID);
    assert_eq!(
        (info.fw_version.major, info.fw_version.minor, info.fw_version.subminor),
        (16, 35, 2000)
    );
    assert_eq!(info.supported_hw_ids, vec![HW_ID]);
    assert_eq!(img.query.security_version, 5);

    let mfg = img.query.mfg_info.as_ref().unwrap();
    assert_eq!(mfg.psid, PSID);
    assert!(matches!(mfg.uids, UidLayout::Cx4 { .. }));

    let dev = img.query.dev_info.as_ref().unwrap();
    assert_eq!(dev.vsd, "device vsd");

    assert_eq!(img.itoc().slots.len(), 3);
    assert_eq!(img.dtoc().unwrap().slots.len(), 3);
}

#[test]
fn quick_query_skips_bulk_sections() {
    let img = FwImage::parse_quiet(FileImage::new(standard_image()), quick_query()).unwrap();

    assert!(img.query.image_info.is_some());
    let main = img.itoc().find(SectionType::MainCode).unwrap();
    assert!(main.data.is_empty());
}

#[test]
fn every_crc_check_is_reported_ok() {
    let mut checks: Vec<CrcCheck> = Vec::new();
    let img = FwImage::parse(FileImage::new(standard_image()), full_query(), &mut |c| {
        checks.push(*c)
    })
    .unwrap();
    drop(img);

    assert!(checks.iter().all(|c| c.is_ok()));
    // HW pointers, tools area, boot2, both TOC headers, entries, sections.
    assert!(checks.iter().any(|c| c.kind == CheckKind::ToolsArea));
    assert!(checks.iter().any(|c| c.kind == CheckKind::Boot2));
    assert!(checks
        .iter()
        .any(|c| matches!(c.kind, CheckKind::TocHeader(_))));
    assert!(checks
        .iter()
        .any(|c| matches!(c.kind, CheckKind::Section(SectionType::MainCode))));
}

#[test]
fn empty_flash_has_no_valid_image() {
    let result = FwImage::parse_quiet(
        FileImage::new(vec![0xff; 0x100_0000]),
        QueryOptions::default(),
    );
    assert!(matches!(
        result,
        Err(Error::Boot(boot::Error::NoValidImage))
    ));
}

#[test]
fn duplicate_magic_with_one_valid_itoc_resolves() {
    // A stale copy of the image in slot 1 whose ITOC header was
    // invalidated: the locator must settle on slot 0.
    let mut data = standard_image();
    let slot = SLOT as usize;
    let copy: Vec<u8> = data[..0x10000].to_vec();
    data[slot..slot + copy.len()].copy_from_slice(&copy);
    // Wipe both candidate ITOC headers in the stale copy.
    data[slot + ITOC_ADDR as usize..slot + (ITOC_ADDR + 0x20) as usize].fill(0);
    data[slot + (ITOC_ADDR + SECTOR) as usize..slot + (ITOC_ADDR + SECTOR + 0x20) as usize]
        .fill(0);

    let img = FwImage::parse_quiet(FileImage::new(data), quick_query()).unwrap();
    assert_eq!(img.img_start(), 0);
}

#[test]
fn duplicate_valid_images_are_rejected() {
    let mut data = standard_image();
    let slot = SLOT as usize;
    let copy: Vec<u8> = data[..0x10000].to_vec();
    data[slot..slot + copy.len()].copy_from_slice(&copy);

    let result = FwImage::parse_quiet(FileImage::new(data), quick_query());
    assert!(matches!(
        result,
        Err(Error::Boot(boot::Error::MultipleValidImages(_)))
    ));
}

#[test]
fn corrupt_itoc_header_crc_is_fatal() {
    let mut data = standard_image();
    // Flip a bit in the flash-layout-version word, leaving the signature
    // intact.
    data[ITOC_ADDR as usize + 16] ^= 1;

    let result = FwImage::parse_quiet(FileImage::new(data), full_query());
    assert!(matches!(
        result,
        Err(Error::BadCrc {
            kind: CheckKind::TocHeader(_),
            ..
        })
    ));
}

#[test]
fn corrupt_entry_crc_is_fatal() {
    let mut data = standard_image();
    let entry_addr = ITOC_ADDR as usize + TOC_HEADER_SIZE;
    data[entry_addr + 9] ^= 0x40; // param0 area of the first entry

    let result = FwImage::parse_quiet(FileImage::new(data), full_query());
    assert!(matches!(
        result,
        Err(Error::BadCrc {
            kind: CheckKind::TocEntry(_),
            ..
        })
    ));
}

#[test]
fn corrupt_section_without_crc_update_is_fatal() {
    let mut data = standard_image();
    data[MAIN_CODE_ADDR as usize] ^= 0xff;

    let result = FwImage::parse_quiet(FileImage::new(data), full_query());
    assert!(matches!(
        result,
        Err(Error::BadCrc {
            kind: CheckKind::Section(SectionType::MainCode),
            ..
        })
    ));

    // The same corruption passes with the CRC override, reported through
    // the callback.
    let mut data = standard_image();
    data[MAIN_CODE_ADDR as usize] ^= 0xff;
    let mut bad = 0;
    let opts = QueryOptions {
        ignore_crc_check: true,
        ..Default::default()
    };
    FwImage::parse(FileImage::new(data), opts, &mut |c| {
        if c.expected != c.actual {
            bad += 1;
        }
    })
    .unwrap();
    assert_eq!(bad, 1);
}

#[test]
fn missing_mfg_info_is_fatal() {
    let mut data = standard_image();
    // Retype the MFG_INFO entry as NV_DATA0 and reseal its CRC.
    let entry_addr = DTOC_ADDR as usize + TOC_HEADER_SIZE;
    let mut entry_buf = [0u8; 32];
    entry_buf.copy_from_slice(&data[entry_addr..entry_addr + 32]);
    let mut entry = nicfw::format::toc::TocEntry::parse(&entry_buf);
    assert_eq!(entry.section_type, SectionType::MfgInfo);
    entry.section_type = SectionType::NvData0;
    entry.seal();
    data[entry_addr..entry_addr + 32].copy_from_slice(&entry.pack());

    let result = FwImage::parse_quiet(FileImage::new(data), full_query());
    assert!(matches!(result, Err(Error::NoMfgInfo)));
}

#[test]
fn two_valid_dev_info_copies_are_fatal() {
    let mut data = standard_image();
    // Give the stale copy a valid signature and reseal its trailing CRC.
    let dev = common::dev_info().pack();
    let mut entry = {
        let entry_addr = DTOC_ADDR as usize + TOC_HEADER_SIZE + 2 * 32;
        let mut buf = [0u8; 32];
        buf.copy_from_slice(&data[entry_addr..entry_addr + 32]);
        nicfw::format::toc::TocEntry::parse(&buf)
    };
    assert_eq!(entry.section_type, SectionType::DevInfo);
    let mut section = dev;
    nicfw::format::toc::seal_section(&mut entry, &mut section);
    put(&mut data, DEV_INFO_STALE_ADDR, &section);
    let entry_addr = DTOC_ADDR as usize + TOC_HEADER_SIZE + 2 * 32;
    data[entry_addr..entry_addr + 32].copy_from_slice(&entry.pack());

    let result = FwImage::parse_quiet(FileImage::new(data), full_query());
    assert!(matches!(result, Err(Error::TwoValidDeviceInfo)));
}

#[test]
fn encrypted_image_detected_by_unreadable_itoc() {
    let mut data = standard_image();
    // Scramble both candidate ITOC headers: an encrypted ITOC does not
    // parse as a TOC signature.
    for addr in [ITOC_ADDR, ITOC_ADDR + SECTOR] {
        for i in 0..TOC_HEADER_SIZE {
            data[addr as usize + i] = 0x5a;
        }
    }

    let mut img = FwImage::parse_quiet(FileImage::new(data), full_query()).unwrap();
    assert!(img.is_encrypted());

    // Query facts still come from the plain IMAGE_INFO and the DTOC.
    assert_eq!(img.query.image_info.as_ref().unwrap().psid, PSID);
    assert!(img.dtoc().is_some());

    // ITOC-touching operations refuse.
    assert!(matches!(
        img.section_data(SectionType::MainCode),
        Err(Error::EncryptedImage)
    ));
}

#[test]
fn extract_round_trip_preserves_query() {
    let mut img =
        FwImage::parse_quiet(FileImage::new(standard_image()), full_query()).unwrap();
    let extracted = burn::extract_image(&mut img, false).unwrap();

    let again = FwImage::parse_quiet(FileImage::new(extracted), full_query()).unwrap();
    assert_eq!(
        img.query.image_info.as_ref().unwrap(),
        again.query.image_info.as_ref().unwrap()
    );
    assert_eq!(img.itoc().slots.len(), again.itoc().slots.len());
}

#[test]
fn extract_with_masking_is_not_bootable() {
    let mut img =
        FwImage::parse_quiet(FileImage::new(standard_image()), full_query()).unwrap();
    let masked = burn::extract_image(&mut img, true).unwrap();

    assert!(masked[..MAGIC_PATTERN.len()].iter().all(|b| *b == 0xff));
    let dtoc_at = (FLASH_SIZE - SECTOR) as usize;
    assert!(masked[dtoc_at..].iter().all(|b| *b == 0xff));

    let result = FwImage::parse_quiet(FileImage::new(masked), quick_query());
    assert!(matches!(
        result,
        Err(Error::Boot(boot::Error::NoValidImage))
    ));
}

#[test]
fn magic_pattern_appears_exactly_once() {
    let data = standard_image();
    let mut io = FileImage::new(data);
    let starts = boot::find_image_starts(&mut io).unwrap();
    assert_eq!(starts, vec![0]);
}

#[test]
fn verify_fs3_image() {
    let mut events: Vec<CrcCheck> = Vec::new();
    let img = FwImage::parse(
        FileImage::new(build_fs3_image(&FixtureOpts::default())),
        full_query(),
        &mut |c| events.push(*c),
    )
    .unwrap();

    assert_eq!(img.format(), FwFormat::Fs3);
    assert_eq!(img.chunk_log2(), CHUNK_LOG2);
    assert_eq!(img.query.image_info.as_ref().unwrap().psid, PSID);
    assert!(img.query.mfg_info.is_some());
    assert_eq!(img.query.dev_info.as_ref().unwrap().vsd, "device vsd");

    // The preboot block was checked and passed on the proper CRC.
    assert!(events
        .iter()
        .any(|c| c.kind == CheckKind::Preboot && c.is_ok()));

    // The mis-attributed NV_DATA0 entry was accepted through the recovery
    // branch, reported as an ignored check.
    assert!(events
        .iter()
        .any(|c| matches!(c.kind, CheckKind::Section(SectionType::NvData0)) && c.ignored));
    assert!(img.itoc().contains(SectionType::NvData0));
}

#[test]
fn fs3_image_version_word_is_recognized() {
    // The FS4 tag is load-bearing: without it the parser takes the FS3
    // path, which this fixture does not populate.
    let mut data = standard_image();
    BigEndian::write_u32(&mut data[0x10..], 0x0015_0100);

    let result = FwImage::parse_quiet(FileImage::new(data), quick_query());
    assert!(result.is_err());
}
