// SPDX-FileCopyrightText: 2024-2026 nicfw contributors
// SPDX-License-Identifier: GPL-3.0-only

//! Secure-boot signing and the hashes-table hash chain.
//!
//! Two generations coexist. Version 1 signs three blobs with RSA over
//! SHA-512: the boot area between the authentication pointers, the critical
//! section group, and the non-critical group. Version 2 (any image with a
//! hashes table) signs a synthesized boot blob only and keys every section
//! into the HTOC hash chain instead.

use byteorder::{BigEndian, ByteOrder};
use hmac::{Hmac, Mac};
use rsa::{traits::PublicKeyParts, Pkcs1v15Sign, RsaPrivateKey};
use sha2::{Digest, Sha256, Sha512};
use thiserror::Error;
use tracing::debug;

use crate::{
    format::{
        boot::{BOOT_VERSION_OFFSET, HW_POINTERS_OFFSET, HW_POINTER_COUNT},
        toc::{SectionType, TOC_ENTRY_SIZE, TOC_HEADER_SIZE},
    },
    io::BlockIo,
    verify::FwImage,
};

pub const RSA_SIGNATURE_SIZE: usize = 512;
pub const PUBLIC_KEY_SIZE: usize = 512;
pub const UUID_SIZE: usize = 16;
pub const HMAC_KEY_LEN: usize = 64;
pub const HMAC_DIGEST_LEN: usize = 32;

/// Group concatenations are padded to this alignment with 0xFF.
const GROUP_ALIGNMENT: usize = 8;

/// Size of the boot record contributing to the version-2 boot blob.
const BOOT_RECORD_SIZE: u32 = 0x100;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Image carries no {0} pointer")]
    MissingPointer(&'static str),
    #[error("Image carries no {0} section to hold the result")]
    MissingSection(SectionType),
    #[error("{0} section is too small: {1} bytes needed")]
    SectionTooSmall(SectionType, usize),
    #[error("HMAC key must be {HMAC_KEY_LEN} bytes, got {0}")]
    KeyLength(usize),
    #[error("Failed to RSA sign digest")]
    RsaSign(#[source] rsa::Error),
    #[error("Verify error")]
    Verify(#[from] crate::verify::Error),
    #[error("Hashes table error")]
    Hashes(#[from] crate::format::hashes::Error),
    #[error("Section store error")]
    Store(#[from] crate::store::Error),
    #[error("I/O error")]
    Io(#[from] crate::io::Error),
    #[error("Boot format error")]
    Boot(#[from] crate::format::boot::Error),
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SignVersion {
    V1,
    V2,
}

/// The signing generation is selected by the presence of a hashes table.
pub fn sign_version<I: BlockIo>(img: &FwImage<I>) -> SignVersion {
    if img.hashes_table().is_some() {
        SignVersion::V2
    } else {
        SignVersion::V1
    }
}

/// A 16-byte key UUID for the public-key section.
pub fn random_uuid() -> [u8; UUID_SIZE] {
    let mut uuid = [0u8; UUID_SIZE];
    rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut uuid);
    uuid
}

fn rsa_sign_sha512(key: &RsaPrivateKey, data: &[u8]) -> Result<Vec<u8>> {
    let digest = Sha512::digest(data);
    let scheme = Pkcs1v15Sign::new::<Sha512>();
    key.sign(scheme, &digest).map_err(Error::RsaSign)
}

/// The version-1 boot blob: everything between the authentication pointers,
/// inclusive.
pub fn boot_data_v1<I: BlockIo>(img: &mut FwImage<I>) -> Result<Vec<u8>> {
    let hw = img
        .hw_pointers()
        .copied()
        .ok_or(Error::MissingPointer("hardware"))?;
    if hw.authentication_start == 0 || hw.authentication_end == 0 {
        return Err(Error::MissingPointer("authentication"));
    }

    let len = hw.authentication_end - hw.authentication_start + 1;
    Ok(img.io().read_vec(hw.authentication_start, len)?)
}

/// The version-2 boot blob, synthesized from the pieces the boot ROM
/// actually consumes: the boot version dword (with its reserved twin), the
/// sixteen bare pointers without CRCs, the boot record, boot2, and the
/// hashes table.
pub fn boot_data_v2<I: BlockIo>(img: &mut FwImage<I>) -> Result<Vec<u8>> {
    let hw = img
        .hw_pointers()
        .copied()
        .ok_or(Error::MissingPointer("hardware"))?;
    let table_len = img
        .hashes_table()
        .map(|t| t.len() as u32)
        .ok_or(Error::MissingPointer("hashes table"))?;

    let mut data = Vec::new();

    data.extend_from_slice(&img.io().read_vec(BOOT_VERSION_OFFSET, 8)?);

    for index in 0..HW_POINTER_COUNT as u32 {
        let ptr_bytes = img.io().read_vec(HW_POINTERS_OFFSET + index * 8, 4)?;
        data.extend_from_slice(&ptr_bytes);
    }

    if hw.boot_record != 0 {
        data.extend_from_slice(&img.io().read_vec(hw.boot_record, BOOT_RECORD_SIZE)?);
    }

    let boot2_size = crate::format::boot::boot2_total_size(img.io(), hw.boot2)?;
    data.extend_from_slice(&img.io().read_vec(hw.boot2, boot2_size)?);

    data.extend_from_slice(&img.io().read_vec(hw.hashes_table, table_len)?);

    Ok(data)
}

fn pad_group(group: &mut Vec<u8>) {
    let rem = group.len() % GROUP_ALIGNMENT;
    if rem != 0 {
        group.resize(group.len() + GROUP_ALIGNMENT - rem, 0xff);
    }
}

/// Concatenate the critical and non-critical section groups, 0xFF-padded
/// per section. Signature carriers stay out of both.
pub fn section_groups<I: BlockIo>(
    img: &mut FwImage<I>,
    padded: bool,
) -> Result<(Vec<u8>, Vec<u8>)> {
    let mut critical = Vec::new();
    let mut non_critical = Vec::new();

    let count = img.itoc().slots.len();
    for index in 0..count {
        let (section_type, entry) = {
            let slot = &img.itoc().slots[index];
            (slot.entry.section_type, slot.entry)
        };

        if section_type.is_signature() {
            continue;
        }

        let data = if img.itoc().slots[index].data.is_empty() {
            img.io().read_vec(entry.flash_addr(), entry.size_bytes())?
        } else {
            img.itoc().slots[index].data.clone()
        };

        let group = if section_type.is_critical() {
            &mut critical
        } else {
            &mut non_critical
        };
        group.extend_from_slice(&data);
        if padded {
            pad_group(group);
        }
    }

    Ok((critical, non_critical))
}

/// The RSA_4096_SIGNATURES payload: boot, critical, and non-critical
/// signatures back to back. Version 2 leaves the group slots zeroed.
fn signatures_payload(
    boot: &[u8],
    critical: Option<&[u8]>,
    non_critical: Option<&[u8]>,
    section_len: usize,
) -> Vec<u8> {
    let mut out = vec![0u8; section_len];
    out[..boot.len()].copy_from_slice(boot);
    if let Some(sig) = critical {
        out[RSA_SIGNATURE_SIZE..RSA_SIGNATURE_SIZE + sig.len()].copy_from_slice(sig);
    }
    if let Some(sig) = non_critical {
        out[2 * RSA_SIGNATURE_SIZE..2 * RSA_SIGNATURE_SIZE + sig.len()].copy_from_slice(sig);
    }
    out
}

/// Sign an image for secure boot and store the results into its signature
/// and public-key sections.
///
/// Ordering is load-bearing. The public key section is stored first so the
/// signed non-critical group covers its final contents; under version 2 the
/// ITOC digest is settled in the hashes table before the boot blob (which
/// embeds that table) is signed. The signatures section itself is excluded
/// from every signed region, and rewriting it leaves the ITOC bytes
/// unchanged, so storing it last closes the chain.
pub fn sign_for_secure_boot<I: BlockIo>(
    img: &mut FwImage<I>,
    key: &RsaPrivateKey,
    uuid: [u8; UUID_SIZE],
) -> Result<()> {
    let version = sign_version(img);
    debug!("Secure-boot signing, {version:?}");

    let sig_section_len = img
        .itoc()
        .find(SectionType::Rsa4096Signatures)
        .ok_or(Error::MissingSection(SectionType::Rsa4096Signatures))?
        .entry
        .size_bytes() as usize;
    if sig_section_len < 3 * RSA_SIGNATURE_SIZE {
        return Err(Error::SectionTooSmall(
            SectionType::Rsa4096Signatures,
            3 * RSA_SIGNATURE_SIZE,
        ));
    }

    store_public_key(img, key, uuid)?;

    let payload = match version {
        SignVersion::V1 => {
            let boot = boot_data_v1(img)?;
            let (critical, non_critical) = section_groups(img, true)?;

            let boot_sig = rsa_sign_sha512(key, &boot)?;
            let critical_sig = rsa_sign_sha512(key, &critical)?;
            let non_critical_sig = rsa_sign_sha512(key, &non_critical)?;

            signatures_payload(
                &boot_sig,
                Some(&critical_sig),
                Some(&non_critical_sig),
                sig_section_len,
            )
        }
        SignVersion::V2 => {
            refresh_section_hash(img, SectionType::RsaPublicKey)?;
            refresh_itoc_hash(img)?;

            let boot = boot_data_v2(img)?;
            let boot_sig = rsa_sign_sha512(key, &boot)?;
            signatures_payload(&boot_sig, None, None, sig_section_len)
        }
    };

    img.replace_section_in_place(SectionType::Rsa4096Signatures, payload)?;
    Ok(())
}

/// Store the public key and its UUID into RSA_PUBLIC_KEY: exponent dword,
/// UUID, then the big-endian modulus.
pub fn store_public_key<I: BlockIo>(
    img: &mut FwImage<I>,
    key: &RsaPrivateKey,
    uuid: [u8; UUID_SIZE],
) -> Result<()> {
    let section_len = img
        .itoc()
        .find(SectionType::RsaPublicKey)
        .ok_or(Error::MissingSection(SectionType::RsaPublicKey))?
        .entry
        .size_bytes() as usize;

    let needed = 4 + UUID_SIZE + PUBLIC_KEY_SIZE;
    if section_len < needed {
        return Err(Error::SectionTooSmall(SectionType::RsaPublicKey, needed));
    }

    let mut payload = vec![0u8; section_len];
    BigEndian::write_u32(&mut payload[..4], 0x0001_0001);
    payload[4..4 + UUID_SIZE].copy_from_slice(&uuid);

    let modulus = key.n().to_bytes_be();
    let at = 4 + UUID_SIZE + PUBLIC_KEY_SIZE - modulus.len();
    payload[at..4 + UUID_SIZE + PUBLIC_KEY_SIZE].copy_from_slice(&modulus);

    img.replace_section_in_place(SectionType::RsaPublicKey, payload)?;
    Ok(())
}

/// Recompute one section's SHA-512 and write it into its HTOC slot, then
/// push the resealed table back to the image.
pub fn refresh_section_hash<I: BlockIo>(
    img: &mut FwImage<I>,
    section_type: SectionType,
) -> Result<()> {
    let Some(table) = img.hashes_table() else {
        return Ok(());
    };
    if table.entry_for(section_type).is_none() {
        return Ok(());
    }

    let data = img.section_data(section_type)?;
    let digest = Sha512::digest(&data);

    let table = img.hashes_table_mut().expect("checked above");
    table.set_hash(section_type, &digest)?;

    write_hashes_table(img)
}

/// Recompute the digest of the ITOC itself (header plus live entries) into
/// its HTOC slot.
pub fn refresh_itoc_hash<I: BlockIo>(img: &mut FwImage<I>) -> Result<()> {
    let Some(table) = img.hashes_table() else {
        return Ok(());
    };
    if table.entry_for(SectionType::Itoc).is_none() {
        return Ok(());
    }

    let toc = img.itoc().serialize_toc();
    let live_len = TOC_HEADER_SIZE + img.itoc().slots.len() * TOC_ENTRY_SIZE;
    let digest = Sha512::digest(&toc[..live_len]);

    let table = img.hashes_table_mut().expect("checked above");
    table.set_hash(SectionType::Itoc, &digest)?;

    write_hashes_table(img)
}

fn write_hashes_table<I: BlockIo>(img: &mut FwImage<I>) -> Result<()> {
    let ptr = img
        .hw_pointers()
        .map(|hw| hw.hashes_table)
        .filter(|ptr| *ptr != 0)
        .ok_or(Error::MissingPointer("hashes table"))?;

    let bytes = img
        .hashes_table()
        .expect("caller verified table presence")
        .as_bytes()
        .to_vec();
    img.io().write(ptr, &bytes, false)?;
    Ok(())
}

/// Development signing: HMAC-SHA256 over the same three regions, digests
/// written back to back at the recovery-key digest pointer.
pub fn sign_with_hmac<I: BlockIo>(img: &mut FwImage<I>, key: &[u8]) -> Result<()> {
    if key.len() != HMAC_KEY_LEN {
        return Err(Error::KeyLength(key.len()));
    }
    let digest_ptr = img
        .hw_pointers()
        .map(|hw| hw.digest_recovery_key)
        .filter(|ptr| *ptr != 0)
        .ok_or(Error::MissingPointer("digest recovery key"))?;

    let boot = boot_data_v1(img)?;
    let (critical, non_critical) = section_groups(img, false)?;

    for (index, region) in [&boot, &critical, &non_critical].into_iter().enumerate() {
        let mut mac = Hmac::<Sha256>::new_from_slice(key).expect("any key length accepted");
        mac.update(region);
        let digest = mac.finalize().into_bytes();

        img.io().write(
            digest_ptr + (index * HMAC_DIGEST_LEN) as u32,
            &digest,
            true,
        )?;
    }

    Ok(())
}
