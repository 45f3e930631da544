// SPDX-FileCopyrightText: 2024-2026 nicfw contributors
// SPDX-License-Identifier: GPL-3.0-only

//! The burn protocol: fail-safe and non-fail-safe programming of a verified
//! source image onto a target, plus the in-place section update operations
//! (GUIDs, VSD, VPD, ROM) that ride on the same TOC-rewrite machinery.
//!
//! The fail-safe write order is a strict total order and must never be
//! rearranged:
//!
//! 1. everything except the 16-byte magic pattern, into the inactive slot
//! 2. device data (DTOC), only when taken from the image
//! 3. signatures, for signed chains
//! 4. the magic pattern (the commit point)
//! 5. invalidation of the other slot's magic
//! 6. boot address update / in-situ activation

use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    format::{
        boot::{self, MAGIC_PATTERN},
        info::{BaseUid, DevInfo, ImageInfo, MfgInfo},
        toc::{SectionType, TocEntry, TocKind},
    },
    io::BlockIo,
    sign, store,
    verify::{FwImage, FwQuery},
};

/// HMAC digest block copied to the device during a signed burn: three
/// 64-byte digests.
const DIGEST_BLOCK_SIZE: u32 = 3 * 64;

/// Sectors reserved at the top of an image slot for the fail-safe ITOC
/// alternation and scratch space.
const RESERVED_TAIL_SECTORS: u32 = 6;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Device/image mismatch: {reason}")]
    DeviceImageMismatch { reason: String },
    #[error("Image data size {actual:#x} exceeds the maximum {max:#x}")]
    ImageTooLarge { actual: u32, max: u32 },
    #[error("DTOC section overwrites an image chunk")]
    DtocOverwritesChunk,
    #[error("Cannot burn device data sections, flash is write protected")]
    WriteProtected,
    #[error("Unsupported burn mode: {0}")]
    UnsupportedBurnMode(&'static str),
    #[error("Operation requires direct flash access (cache replacement off)")]
    OcrRequired,
    #[error("Burn cancelled")]
    Cancelled,
    #[error("Image is corrupted: {0}")]
    ImageCorrupted(String),
    #[error("Image security version {image} is older than device {device}")]
    SecurityVersionViolated { image: u32, device: u32 },
    #[error("Verify error")]
    Verify(#[from] crate::verify::Error),
    #[error("Section store error")]
    Store(#[from] store::Error),
    #[error("Signing error")]
    Sign(#[from] sign::Error),
    #[error("I/O error")]
    Io(#[from] crate::io::Error),
    #[error("Info section error")]
    Info(#[from] crate::format::info::Error),
    #[error("Boot format error")]
    Boot(#[from] crate::format::boot::Error),
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum RomPolicy {
    #[default]
    Default,
    FromDeviceIfExists,
    None,
}

/// Knobs recognized by the burn protocol; all consumed here, none parsed.
#[derive(Clone, Debug)]
pub struct BurnOptions {
    pub failsafe: bool,
    pub use_image_dev_data: bool,
    pub allow_psid_change: bool,
    pub ignore_devid: bool,
    pub ignore_version: bool,
    pub burn_rom_policy: RomPolicy,
    pub user_vsd: Option<String>,
    pub ignore_cache_replacement: bool,
    /// The target's hardware device id, read from registers by the caller.
    pub device_hw_id: Option<u32>,
    /// The target's eFuse security version, read by the caller.
    pub device_security_version: Option<u32>,
    /// Latched once from the caller's environment.
    pub ignore_security_version: bool,
}

impl Default for BurnOptions {
    fn default() -> Self {
        Self {
            failsafe: true,
            use_image_dev_data: false,
            allow_psid_change: false,
            ignore_devid: false,
            ignore_version: false,
            burn_rom_policy: RomPolicy::Default,
            user_vsd: None,
            ignore_cache_replacement: false,
            device_hw_id: None,
            device_security_version: None,
            ignore_security_version: false,
        }
    }
}

/// Seam for the device's in-situ activation registers (new-image address
/// plus warm-boot request). A bad-parameter response from old firmware is
/// the driver's business to treat as success.
pub trait Activator {
    fn activate(&mut self, new_image_start: u32) -> std::io::Result<()>;
}

/// Progress/cancel plumbing for a burn. The cancel flag is honored between
/// writes, never mid-write.
pub struct BurnHooks<'a> {
    pub progress: Option<&'a mut dyn FnMut(u64, u64)>,
    pub activator: Option<&'a mut dyn Activator>,
    pub cancel: &'a AtomicBool,
}

impl<'a> BurnHooks<'a> {
    pub fn new(cancel: &'a AtomicBool) -> Self {
        Self {
            progress: None,
            activator: None,
            cancel,
        }
    }

    fn check_cancel(&self) -> Result<()> {
        if self.cancel.load(Ordering::SeqCst) {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    fn report(&mut self, done: u64, total: u64) {
        if let Some(progress) = self.progress.as_mut() {
            progress(done, total);
        }
    }
}

fn version_tuple(query: &FwQuery) -> (u16, u16, u16) {
    query
        .fw_version()
        .map(|v| (v.major, v.minor, v.subminor))
        .unwrap_or_default()
}

/// Burn a verified source image onto the target, honoring the fail-safe
/// write order. On failure the target remains bootable from its pre-burn
/// image as long as `failsafe` was set.
pub fn burn<DI: BlockIo, SI: BlockIo>(
    device: &mut FwImage<DI>,
    source: &mut FwImage<SI>,
    opts: &BurnOptions,
    hooks: &mut BurnHooks<'_>,
) -> Result<()> {
    preflight(device, source, opts)?;

    // An encrypted image is a sealed blob; its ITOC cannot be walked, so it
    // is programmed wholesale.
    if source.is_encrypted() {
        return write_encrypted_image(device, source, opts, hooks);
    }

    // ROM carry-over: graft the device's expansion ROM into the source
    // before anything is written.
    if opts.burn_rom_policy == RomPolicy::FromDeviceIfExists
        && device.itoc().contains(SectionType::RomCode)
        && opts.failsafe
    {
        let rom = device.section_data(SectionType::RomCode)?;
        debug!("Carrying {} bytes of ROM from the device", rom.len());
        merge_rom(source, rom)?;
    }

    // VSD override patches the source's IMAGE_INFO in place.
    if let Some(vsd) = &opts.user_vsd {
        let mut data = source.section_data(SectionType::ImageInfo)?;
        ImageInfo::patch_vsd(&mut data, vsd);
        source.itoc_mut().replace(SectionType::ImageInfo, data)?;
        source.flush_itoc()?;
    }

    check_image_size(device, source, opts)?;
    source
        .itoc()
        .check_consistency(source.chunk_log2())
        .map_err(|e| Error::ImageCorrupted(e.to_string()))?;

    write_image(device, source, opts, hooks)
}

fn preflight<DI: BlockIo, SI: BlockIo>(
    device: &mut FwImage<DI>,
    source: &mut FwImage<SI>,
    opts: &BurnOptions,
) -> Result<()> {
    if source.format() != device.format() {
        return Err(Error::DeviceImageMismatch {
            reason: "image format is not compatible with the device".into(),
        });
    }
    if source.img_start() != 0 {
        return Err(Error::ImageCorrupted(
            "source image does not start at offset zero".into(),
        ));
    }

    // Hardware id gate.
    if !opts.ignore_devid {
        if let Some(hw_id) = opts.device_hw_id {
            let supported = source.query.supported_hw_ids();
            if supported.is_empty() {
                return Err(Error::DeviceImageMismatch {
                    reason: "no supported devices were found in the image".into(),
                });
            }
            if !supported.contains(&hw_id) {
                return Err(Error::DeviceImageMismatch {
                    reason: format!("device id {hw_id:#x} is not supported by the image"),
                });
            }
        }
    }

    // PSID gate.
    let dev_psid = device.query.psid().unwrap_or_default();
    let img_psid = source.query.psid().unwrap_or_default();
    if !dev_psid.is_empty() && dev_psid != img_psid && !opts.allow_psid_change {
        return Err(Error::DeviceImageMismatch {
            reason: format!("PSID mismatch (device {dev_psid:?}, image {img_psid:?})"),
        });
    }

    // Security version gate.
    if let Some(device_sv) = opts.device_security_version {
        let image_sv = source.query.security_version;
        if image_sv < device_sv && !opts.ignore_security_version {
            return Err(Error::SecurityVersionViolated {
                image: image_sv,
                device: device_sv,
            });
        }
    }

    if opts.failsafe {
        if device.chunk_log2() != source.chunk_log2() {
            return Err(Error::DeviceImageMismatch {
                reason: format!(
                    "chunk size mismatch (device 2^{}, image 2^{})",
                    device.chunk_log2(),
                    source.chunk_log2()
                ),
            });
        }
        if !opts.ignore_version && version_tuple(&source.query) < version_tuple(&device.query) {
            return Err(Error::DeviceImageMismatch {
                reason: "image firmware version is older than the device".into(),
            });
        }
    } else if opts.use_image_dev_data {
        if device.io().is_write_protected()? {
            return Err(Error::WriteProtected);
        }
    } else {
        // Device data stays on the device; it must be intact there.
        if device.dtoc().is_none() {
            return Err(Error::ImageCorrupted(
                "cannot extract device data sections: invalid DTOC".into(),
            ));
        }
        if device.has_bad_dev_data() {
            return Err(Error::ImageCorrupted(
                "cannot integrate device data sections: device data is corrupted".into(),
            ));
        }
    }

    Ok(())
}

/// I7/I8: the image must leave the reserved tail sectors free, and device
/// data must stay out of the image chunks.
fn check_image_size<DI: BlockIo, SI: BlockIo>(
    device: &mut FwImage<DI>,
    source: &FwImage<SI>,
    opts: &BurnOptions,
) -> Result<()> {
    let sector = device.io().sector_size();
    let flash_size = device.io().size();
    let slot_size = source.slot_size();

    let max = if opts.failsafe {
        slot_size - RESERVED_TAIL_SECTORS * sector
    } else {
        flash_size - RESERVED_TAIL_SECTORS * sector
    };

    let last_end = source.itoc().last_relative_end();
    if last_end >= max {
        return Err(Error::ImageTooLarge {
            actual: last_end,
            max,
        });
    }

    // Device data bounds, from whichever DTOC will govern the device. The
    // image occupies [0, last_end) in slot 0 and [slot, slot+last_end) in
    // slot 1; device data must stay clear of both.
    let dtoc_min = if opts.use_image_dev_data {
        source.dtoc().and_then(|d| d.smallest_absolute_addr())
    } else {
        device.dtoc().and_then(|d| d.smallest_absolute_addr())
    };
    if let Some(min_addr) = dtoc_min {
        if min_addr < flash_size.saturating_sub(slot_size) {
            return Err(Error::DtocOverwritesChunk);
        }
        let max_data = if min_addr >= slot_size {
            min_addr - slot_size
        } else {
            min_addr
        };
        if last_end > max_data {
            return Err(Error::ImageTooLarge {
                actual: last_end,
                max: max_data,
            });
        }
    }

    Ok(())
}

/// Pick the inactive slot for the new image.
fn select_slot<DI: BlockIo>(device: &FwImage<DI>, opts: &BurnOptions, chunk_log2: u8) -> u32 {
    let is_curr_odd =
        device.img_start() != 0 || (!opts.failsafe && opts.ignore_cache_replacement);
    if is_curr_odd {
        0
    } else {
        1u32 << chunk_log2
    }
}

fn write_image<DI: BlockIo, SI: BlockIo>(
    device: &mut FwImage<DI>,
    source: &mut FwImage<SI>,
    opts: &BurnOptions,
    hooks: &mut BurnHooks<'_>,
) -> Result<()> {
    let sector = device.io().sector_size();
    let chunk_log2 = source.chunk_log2();
    let magic_len = MAGIC_PATTERN.len() as u32;
    let new_image_start = select_slot(device, opts, chunk_log2);

    if new_image_start == boot::CX4_QUIRK_IMG_START {
        device
            .io()
            .set_convertor(boot::CX4_QUIRK_EFFECTIVE_LOG2, true);
    } else {
        device
            .io()
            .set_convertor(chunk_log2, new_image_start != 0);
    }
    debug!(
        "Burning into slot at {new_image_start:#x} (current image at {:#x})",
        device.img_start()
    );

    // Step 1 spans from past the magic pattern through the end of the ITOC
    // sector.
    let head_len = source.itoc().toc_addr + sector - magic_len;
    let head = read_source(source, magic_len, head_len)?;

    let mut total = u64::from(head_len)
        + u64::from(source.itoc().sections_total_size())
        + u64::from(magic_len);
    if opts.use_image_dev_data {
        if let Some(dtoc) = source.dtoc() {
            total += u64::from(sector) + u64::from(dtoc.sections_total_size());
        }
    }
    let mut done = 0u64;

    // Step 1: boot area, boot code, and the ITOC, at logical addresses in
    // the target slot.
    hooks.check_cancel()?;
    device.io().write(magic_len, &head, false)?;
    done += head.len() as u64;
    hooks.report(done, total);

    // ITOC sections. Device-data entries (FS3 carries them in the same
    // TOC, at absolute addresses) stay on the device unless the caller
    // asked to take them from the image.
    let section_count = source.itoc().slots.len();
    for index in 0..section_count {
        hooks.check_cancel()?;
        let (entry, data) = source_slot_bytes(source, TocKind::Itoc, index)?;

        if entry.device_data || !entry.relative_addr {
            if opts.use_image_dev_data {
                device.io().write(entry.flash_addr(), &data, true)?;
                done += data.len() as u64;
                hooks.report(done, total);
            }
            continue;
        }

        device.io().write(entry.flash_addr(), &data, false)?;
        done += data.len() as u64;
        hooks.report(done, total);
    }

    // Step 2: device data from the image, at absolute addresses.
    if opts.use_image_dev_data {
        write_dev_data(device, source, hooks, chunk_log2, &mut done, total)?;
    }

    // Step 3: signed chains get their digest block installed in the new
    // slot before the commit point. The old slot is never touched here.
    if device.io().is_flash() {
        if let Some(hw) = device.hw_pointers().copied() {
            let digest_ptr = if hw.digest_mdk != 0 {
                hw.digest_mdk
            } else {
                hw.digest_recovery_key
            };
            if digest_ptr != 0 && digest_ptr + DIGEST_BLOCK_SIZE <= source_size(source) {
                hooks.check_cancel()?;
                let digests = read_source(source, digest_ptr, DIGEST_BLOCK_SIZE)?;
                device.io().write(digest_ptr, &digests, false)?;
            }
        }
    }

    commit_and_finish(device, opts, hooks, new_image_start, chunk_log2, &mut done, total)
}

/// The encrypted-image path: the blob is written wholesale, minus its
/// leading magic pattern, at physical addresses in the target slot.
fn write_encrypted_image<DI: BlockIo, SI: BlockIo>(
    device: &mut FwImage<DI>,
    source: &mut FwImage<SI>,
    opts: &BurnOptions,
    hooks: &mut BurnHooks<'_>,
) -> Result<()> {
    let sector = device.io().sector_size();
    let chunk_log2 = source.chunk_log2();
    let magic_len = MAGIC_PATTERN.len() as u32;
    let new_image_start = select_slot(device, opts, chunk_log2);

    device.io().set_convertor(0, false);
    debug!("Burning encrypted image into slot at {new_image_start:#x}");

    let img_len = source_size(source).min(1u32 << chunk_log2);
    let body_len = img_len - magic_len;

    let mut total = u64::from(img_len);
    if opts.use_image_dev_data {
        if let Some(dtoc) = source.dtoc() {
            total += u64::from(sector) + u64::from(dtoc.sections_total_size());
        }
    }
    let mut done = 0u64;

    let body = read_source(source, magic_len, body_len)?;
    hooks.check_cancel()?;
    device.io().write(new_image_start + magic_len, &body, true)?;
    done += u64::from(body_len);
    hooks.report(done, total);

    if opts.use_image_dev_data {
        write_dev_data(device, source, hooks, chunk_log2, &mut done, total)?;
    }

    commit_and_finish(device, opts, hooks, new_image_start, chunk_log2, &mut done, total)
}

/// Step 2: the DTOC array and its sections, all at absolute addresses.
fn write_dev_data<DI: BlockIo, SI: BlockIo>(
    device: &mut FwImage<DI>,
    source: &mut FwImage<SI>,
    hooks: &mut BurnHooks<'_>,
    chunk_log2: u8,
    done: &mut u64,
    total: u64,
) -> Result<()> {
    let sector = device.io().sector_size();

    let dtoc = source.dtoc().ok_or(Error::ImageCorrupted(
        "image carries no DTOC to burn".into(),
    ))?;
    if device.io().size() != source_size(source) {
        return Err(Error::DeviceImageMismatch {
            reason: "flash size differs from image size; cannot burn device data".into(),
        });
    }
    dtoc.check_consistency(chunk_log2)
        .map_err(|e| Error::ImageCorrupted(e.to_string()))?;

    let dtoc_bytes = dtoc.serialize_toc();
    let dtoc_addr = dtoc.toc_addr;

    hooks.check_cancel()?;
    device.io().write(dtoc_addr, &dtoc_bytes, true)?;
    *done += u64::from(sector);
    hooks.report(*done, total);

    let dtoc_count = source.dtoc().map(|d| d.slots.len()).unwrap_or(0);
    for index in 0..dtoc_count {
        hooks.check_cancel()?;
        let (entry, data) = source_slot_bytes(source, TocKind::Dtoc, index)?;
        device.io().write(entry.flash_addr(), &data, true)?;
        *done += data.len() as u64;
        hooks.report(*done, total);
    }

    Ok(())
}

/// Steps 4 through 6: commit the magic pattern, retire the old image(s),
/// and point the boot ROM at the new slot.
fn commit_and_finish<DI: BlockIo>(
    device: &mut FwImage<DI>,
    opts: &BurnOptions,
    hooks: &mut BurnHooks<'_>,
    new_image_start: u32,
    chunk_log2: u8,
    done: &mut u64,
    total: u64,
) -> Result<()> {
    // Step 4: the commit point. The new slot becomes bootable here.
    hooks.check_cancel()?;
    device.io().write(new_image_start, &MAGIC_PATTERN, true)?;
    *done += MAGIC_PATTERN.len() as u64;
    hooks.report(*done, total);

    // Step 5: retire the old image(s). Fail-safe clears only the old slot;
    // a raw burn may leave stale magics at other chunk sizes, so clear
    // every one that is not ours.
    let zero = [0u8; 4];
    if opts.failsafe {
        let old_start = if new_image_start == 0 {
            1u32 << chunk_log2
        } else {
            0
        };
        device.io().write(old_start, &zero, true)?;
    } else {
        for start in boot::find_image_starts(device.io())? {
            if start != new_image_start {
                device.io().write(start, &zero, true)?;
            }
        }
    }

    // Step 6: point the boot ROM at the new slot. Failure is not fatal;
    // the device picks the image up on the next power cycle.
    if let Some(activator) = hooks.activator.as_mut() {
        if let Err(e) = activator.activate(new_image_start) {
            warn!("Failed to update FW boot address; power cycle to load the new FW: {e}");
        }
    }

    Ok(())
}

fn source_size<SI: BlockIo>(source: &FwImage<SI>) -> u32 {
    // The borrow through `io()` needs mut; size is logically const.
    // Mirror of BlockIo::size for an immutable receiver.
    source.io_size()
}

fn read_source<SI: BlockIo>(source: &mut FwImage<SI>, addr: u32, len: u32) -> Result<Vec<u8>> {
    let saved = source.io().convertor();
    source.io().set_convertor(0, false);
    let result = source.io().read_vec(addr, len);
    source
        .io()
        .set_convertor(saved.chunk_log2, saved.second_slot);
    Ok(result?)
}

fn source_slot_bytes<SI: BlockIo>(
    source: &mut FwImage<SI>,
    kind: TocKind,
    index: usize,
) -> Result<(TocEntry, Vec<u8>)> {
    let store = match kind {
        TocKind::Itoc => source.itoc(),
        TocKind::Dtoc => source.dtoc().expect("dtoc presence checked by caller"),
    };
    let slot = &store.slots[index];
    let entry = slot.entry;

    if !slot.data.is_empty() {
        return Ok((entry, slot.data.clone()));
    }

    let data = if entry.relative_addr {
        source.io().read_vec(entry.flash_addr(), entry.size_bytes())?
    } else {
        read_source(source, entry.flash_addr(), entry.size_bytes())?
    };
    Ok((entry, data))
}

/// Replace or add the expansion ROM in a source image and rewrite its ITOC.
pub fn merge_rom<SI: BlockIo>(source: &mut FwImage<SI>, rom: Vec<u8>) -> Result<()> {
    if source.is_encrypted() {
        return Err(Error::UnsupportedBurnMode("encrypted image ROM update"));
    }

    let sector = source.io().sector_size();
    if source.itoc().contains(SectionType::RomCode) {
        source.itoc_mut().remove(SectionType::RomCode, sector)?;
    }

    let template = TocEntry {
        section_type: SectionType::RomCode,
        relative_addr: true,
        ..Default::default()
    };
    source.itoc_mut().insert(template, rom, None, sector)?;
    source.flush_itoc()?;
    Ok(())
}

/// Remove the expansion ROM from an image.
pub fn delete_rom<SI: BlockIo>(source: &mut FwImage<SI>) -> Result<()> {
    let sector = source.io().sector_size();
    source.itoc_mut().remove(SectionType::RomCode, sector)?;
    source.flush_itoc()?;
    Ok(())
}

/// Update one section in place and refresh the secure-boot hash chain when
/// one is present.
pub fn update_section<I: BlockIo>(
    img: &mut FwImage<I>,
    section_type: SectionType,
    data: Vec<u8>,
) -> Result<()> {
    img.replace_section_in_place(section_type, data)?;

    // Version-2 secure boot keys every section into the hash chain.
    if img.hashes_table().is_some() {
        sign::refresh_section_hash(img, section_type)?;
        sign::refresh_itoc_hash(img)?;
    }

    Ok(())
}

/// Re-derive the MFG_INFO GUID/MAC block from a base allocation.
pub fn set_mfg_uids<I: BlockIo>(img: &mut FwImage<I>, base: &BaseUid) -> Result<()> {
    let data = img.section_data(SectionType::MfgInfo)?;
    let mut mfg = MfgInfo::parse(&data)?;
    crate::format::info::apply_base_uid(&mut mfg.uids, base);
    update_section(img, SectionType::MfgInfo, mfg.pack())
}

/// Re-derive the DEV_INFO GUID/MAC block from a base allocation. Only the
/// signed (valid) copy is rewritten.
pub fn set_dev_uids<I: BlockIo>(img: &mut FwImage<I>, base: &BaseUid) -> Result<()> {
    let data = img.section_data(SectionType::DevInfo)?;
    let mut dev = DevInfo::parse(&data)?;
    crate::format::info::apply_base_uid(&mut dev.uids, base);
    update_section(img, SectionType::DevInfo, dev.pack())
}

/// Replace the device VSD carried in DEV_INFO.
pub fn set_device_vsd<I: BlockIo>(img: &mut FwImage<I>, vsd: &str) -> Result<()> {
    let data = img.section_data(SectionType::DevInfo)?;
    let mut dev = DevInfo::parse(&data)?;
    dev.vsd = vsd.to_owned();
    update_section(img, SectionType::DevInfo, dev.pack())
}

/// Replace the read-only VPD section.
pub fn set_vpd<I: BlockIo>(img: &mut FwImage<I>, vpd: Vec<u8>) -> Result<()> {
    if vpd.len() % 4 != 0 {
        return Err(Error::ImageCorrupted(
            "VPD size is not dword aligned".into(),
        ));
    }
    update_section(img, SectionType::VpdR0, vpd)
}

/// Shift every device-data section down by `offset`, for migrating old
/// layouts onto parts with coarser write protection.
pub fn shift_dev_data<I: BlockIo>(img: &mut FwImage<I>, offset: u32) -> Result<()> {
    let mut dtoc = img
        .dtoc()
        .ok_or(Error::ImageCorrupted("image carries no DTOC".into()))?
        .clone();

    dtoc.shift_dev_data(img.io(), offset)?;
    img.replace_dtoc(dtoc);
    Ok(())
}

/// Extract the raw image bytes, optionally masking the magic pattern and
/// the DTOC sector so the result cannot be mistaken for a bootable image.
pub fn extract_image<I: BlockIo>(
    img: &mut FwImage<I>,
    mask_magic_and_dtoc: bool,
) -> Result<Vec<u8>> {
    let size = img.io_size();
    let sector = img.io().sector_size();

    let mut out = read_source_any(img, 0, size)?;
    if mask_magic_and_dtoc {
        out[..MAGIC_PATTERN.len()].fill(0xff);
        let dtoc_at = (size - sector) as usize;
        out[dtoc_at..].fill(0xff);
    }
    Ok(out)
}

fn read_source_any<I: BlockIo>(img: &mut FwImage<I>, addr: u32, len: u32) -> Result<Vec<u8>> {
    let saved = img.io().convertor();
    img.io().set_convertor(0, false);
    let result = img.io().read_vec(addr, len);
    img.io().set_convertor(saved.chunk_log2, saved.second_slot);
    Ok(result?)
}

/// Realign the fixed device-data sections for a newer flash generation.
pub fn align_dev_data<I: BlockIo>(img: &mut FwImage<I>) -> Result<()> {
    let mut dtoc = img
        .dtoc()
        .ok_or(Error::ImageCorrupted("image carries no DTOC".into()))?
        .clone();

    dtoc.align_dev_data(
        img.io(),
        &store::LEGACY_DEV_OFFSETS,
        &store::ALIGNED_DEV_OFFSETS,
    )?;
    img.replace_dtoc(dtoc);
    Ok(())
}

/// [`align_dev_data`] for a live device: moving device data is not
/// fail-safe, so the raw-access flag is mandatory, and write protection is
/// dropped for the duration and restored on every exit path.
pub fn align_dev_data_on_flash<D: crate::io::FlashDriver>(
    img: &mut FwImage<crate::io::FlashImage<D>>,
    ignore_cache_replacement: bool,
) -> Result<()> {
    if !ignore_cache_replacement {
        return Err(Error::OcrRequired);
    }

    let mut dtoc = img
        .dtoc()
        .ok_or(Error::ImageCorrupted("device carries no DTOC".into()))?
        .clone();

    img.io().with_unprotected(|io| {
        io.with_direct_access(|io| {
            dtoc.align_dev_data(
                io,
                &store::LEGACY_DEV_OFFSETS,
                &store::ALIGNED_DEV_OFFSETS,
            )
            .map_err(Error::Store)
        })
    })?;

    img.replace_dtoc(dtoc);
    Ok(())
}

/// [`shift_dev_data`] for a live device, under the same raw-access and
/// write-protect discipline.
pub fn shift_dev_data_on_flash<D: crate::io::FlashDriver>(
    img: &mut FwImage<crate::io::FlashImage<D>>,
    offset: u32,
    ignore_cache_replacement: bool,
) -> Result<()> {
    if !ignore_cache_replacement {
        return Err(Error::OcrRequired);
    }

    let mut dtoc = img
        .dtoc()
        .ok_or(Error::ImageCorrupted("device carries no DTOC".into()))?
        .clone();

    img.io().with_unprotected(|io| {
        io.with_direct_access(|io| dtoc.shift_dev_data(io, offset).map_err(Error::Store))
    })?;

    img.replace_dtoc(dtoc);
    Ok(())
}
