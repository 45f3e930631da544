// SPDX-FileCopyrightText: 2024-2026 nicfw contributors
// SPDX-License-Identifier: GPL-3.0-only

mod common;

use common::*;
use hmac::{Hmac, Mac};
use nicfw::{
    burn,
    format::toc::SectionType,
    io::FileImage,
    sign::{self, SignVersion},
    verify::{FwImage, QueryOptions},
};
use rsa::{Pkcs1v15Sign, RsaPrivateKey};
use sha2::{Digest, Sha256, Sha512};

fn parse(data: Vec<u8>) -> FwImage<FileImage> {
    FwImage::parse_quiet(FileImage::new(data), QueryOptions::default()).unwrap()
}

fn test_key() -> RsaPrivateKey {
    let mut rng = rand::thread_rng();
    RsaPrivateKey::new(&mut rng, 2048).unwrap()
}

#[test]
fn secure_boot_v1_signatures_verify() {
    let mut img = parse(build_image(&FixtureOpts {
        sign_sections: true,
        ..Default::default()
    }));
    assert_eq!(sign::sign_version(&img), SignVersion::V1);

    let key = test_key();
    let uuid = sign::random_uuid();
    sign::sign_for_secure_boot(&mut img, &key, uuid).unwrap();

    // The image must still verify end to end after the rewrite.
    let mut img = parse(img.into_io().into_inner());

    let boot = sign::boot_data_v1(&mut img).unwrap();
    let (critical, non_critical) = sign::section_groups(&mut img, true).unwrap();
    let signatures = img.section_data(SectionType::Rsa4096Signatures).unwrap();

    let public = key.to_public_key();
    let scheme = || Pkcs1v15Sign::new::<Sha512>();
    let sig_len = 256; // 2048-bit key

    public
        .verify(scheme(), &Sha512::digest(&boot), &signatures[..sig_len])
        .unwrap();
    public
        .verify(
            scheme(),
            &Sha512::digest(&critical),
            &signatures[512..512 + sig_len],
        )
        .unwrap();
    public
        .verify(
            scheme(),
            &Sha512::digest(&non_critical),
            &signatures[1024..1024 + sig_len],
        )
        .unwrap();

    // Critical/non-critical grouping: HW_BOOT_CFG is critical and excluded
    // from the non-critical stream.
    assert!(critical.len() >= 0x100);

    // The public key section carries the exponent, UUID, and modulus.
    let key_section = img.section_data(SectionType::RsaPublicKey).unwrap();
    assert_eq!(&key_section[..4], &[0, 1, 0, 1]);
    assert_eq!(&key_section[4..20], &uuid);
}

#[test]
fn secure_boot_v2_signs_boot_blob_only() {
    let mut img = parse(build_image(&FixtureOpts {
        sign_sections: true,
        hashes_table: true,
        ..Default::default()
    }));
    assert_eq!(sign::sign_version(&img), SignVersion::V2);

    let key = test_key();
    sign::sign_for_secure_boot(&mut img, &key, sign::random_uuid()).unwrap();

    let mut img = parse(img.into_io().into_inner());
    let boot = sign::boot_data_v2(&mut img).unwrap();
    let signatures = img.section_data(SectionType::Rsa4096Signatures).unwrap();

    key.to_public_key()
        .verify(
            Pkcs1v15Sign::new::<Sha512>(),
            &Sha512::digest(&boot),
            &signatures[..256],
        )
        .unwrap();

    // Group slots stay zeroed under version 2.
    assert!(signatures[512..].iter().all(|b| *b == 0));
}

#[test]
fn update_section_refreshes_hash_chain() {
    let mut img = parse(build_image(&FixtureOpts {
        sign_sections: true,
        hashes_table: true,
        ..Default::default()
    }));

    let new_info = {
        let mut info = common::image_info(&FixtureOpts::default());
        info.vsd = "hashed".to_owned();
        info.pack()
    };
    burn::update_section(&mut img, SectionType::ImageInfo, new_info.clone()).unwrap();

    let table = img.hashes_table().unwrap();
    assert!(table.table_crc().is_ok());
    assert_eq!(
        table.hash_for(SectionType::ImageInfo).unwrap(),
        Sha512::digest(&new_info).as_slice()
    );
    // The ITOC digest slot tracks the rewritten table of contents.
    assert!(table
        .hash_for(SectionType::Itoc)
        .unwrap()
        .iter()
        .any(|b| *b != 0));

    // And the updated table verifies from a cold parse.
    let img = parse(img.into_io().into_inner());
    let table = img.hashes_table().unwrap();
    assert_eq!(
        table.hash_for(SectionType::ImageInfo).unwrap(),
        Sha512::digest(&new_info).as_slice()
    );
}

#[test]
fn hmac_signing_writes_three_digests() {
    let mut img = parse(build_image(&FixtureOpts {
        sign_sections: true,
        ..Default::default()
    }));

    let key = [0x6b_u8; sign::HMAC_KEY_LEN];
    sign::sign_with_hmac(&mut img, &key).unwrap();

    let boot = sign::boot_data_v1(&mut img).unwrap();
    let (critical, non_critical) = sign::section_groups(&mut img, false).unwrap();

    let bytes = img.into_io().into_inner();
    for (index, region) in [&boot, &critical, &non_critical].into_iter().enumerate() {
        let mut mac = Hmac::<Sha256>::new_from_slice(&key).unwrap();
        mac.update(region);
        let expected = mac.finalize().into_bytes();

        let at = DIGEST_ADDR as usize + index * sign::HMAC_DIGEST_LEN;
        assert_eq!(
            &bytes[at..at + sign::HMAC_DIGEST_LEN],
            expected.as_slice(),
            "digest {index} mismatch"
        );
    }
}

#[test]
fn hmac_rejects_wrong_key_length() {
    let mut img = parse(build_image(&FixtureOpts {
        sign_sections: true,
        ..Default::default()
    }));
    assert!(matches!(
        sign::sign_with_hmac(&mut img, &[0u8; 32]),
        Err(sign::Error::KeyLength(32))
    ));
}
