// SPDX-FileCopyrightText: 2024-2026 nicfw contributors
// SPDX-License-Identifier: GPL-3.0-only

//! Byte-addressed block I/O over either a raw image file or a live flash
//! device, including the logical-to-physical address convertor used by the
//! fail-safe dual-slot layout.

use std::{
    fs::File,
    io::{self, Read},
    path::Path,
};

use thiserror::Error;
use tracing::debug;

/// Default NOR sector size. Flash drivers may report 64 KiB parts; image
/// files always use this granularity.
pub const DEFAULT_SECTOR_SIZE: u32 = 0x1000;

/// Number of polls allowed while waiting for a write-protect change to
/// settle.
const WRITE_PROTECT_POLLS: u32 = 5;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Address range {addr:#x}+{size:#x} exceeds image size {total:#x}")]
    OutOfRange { addr: u32, size: u32, total: u32 },
    #[error("Failed to read {size:#x} bytes at {addr:#x}")]
    ReadFailed {
        addr: u32,
        size: u32,
        #[source]
        source: io::Error,
    },
    #[error("Failed to write {size:#x} bytes at {addr:#x}")]
    WriteFailed {
        addr: u32,
        size: u32,
        #[source]
        source: io::Error,
    },
    #[error("Failed to erase sector at {addr:#x}")]
    EraseFailed {
        addr: u32,
        #[source]
        source: io::Error,
    },
    #[error("Flash is write protected")]
    WriteProtected,
    #[error("Write protection did not settle after {WRITE_PROTECT_POLLS} polls")]
    WriteProtectStuck,
    #[error("Operation requires a flash device")]
    NotFlash,
    #[error("Flash driver error")]
    Driver(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Per-bank write-protect descriptor, as reported by the flash part.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct WriteProtect {
    pub is_subsector: bool,
    pub sectors_num: u32,
    pub is_bottom: bool,
}

impl WriteProtect {
    pub fn is_protected(&self) -> bool {
        self.sectors_num != 0
    }
}

/// Static flash attributes queried once at open.
#[derive(Clone, Debug)]
pub struct FlashAttr {
    pub size: u32,
    pub sector_size: u32,
    pub banks_num: u8,
    pub protect_info: Vec<WriteProtect>,
}

/// The narrow contract with the low-level flash driver. Erase, program, and
/// status polling live behind this seam; the engine never talks to the part
/// directly.
pub trait FlashDriver {
    fn attr(&self) -> &FlashAttr;

    fn read(&mut self, addr: u32, buf: &mut [u8]) -> io::Result<()>;

    /// Program bytes at `addr`. The driver owns erase-before-write at its own
    /// granularity.
    fn write(&mut self, addr: u32, data: &[u8]) -> io::Result<()>;

    fn erase_sector(&mut self, addr: u32) -> io::Result<()>;

    fn set_write_protect(&mut self, bank: u8, protect: &WriteProtect) -> io::Result<()>;

    fn is_write_protected(&mut self) -> io::Result<bool>;

    /// Tell the part which slot to boot from on the next reset.
    fn update_boot_addr(&mut self, addr: u32) -> io::Result<()>;

    /// Block until an in-flight write-protect change is visible. Called
    /// between polls; expected to sleep on the order of hundreds of
    /// milliseconds.
    fn settle(&mut self);

    /// Enter raw access mode, bypassing the device's flash cache
    /// replacement. Holds an exclusive lease until released.
    fn begin_direct_access(&mut self) -> io::Result<()>;

    fn end_direct_access(&mut self) -> io::Result<()>;
}

/// Maps a logical image offset onto a physical flash offset by forcing bit
/// `chunk_log2` of the address to match the selected slot. The identity
/// convertor (`chunk_log2 == 0`) is used for absolute addresses and for
/// image files.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Convertor {
    pub chunk_log2: u8,
    pub second_slot: bool,
}

impl Convertor {
    pub const IDENTITY: Self = Self {
        chunk_log2: 0,
        second_slot: false,
    };

    pub fn new(chunk_log2: u8, second_slot: bool) -> Self {
        Self {
            chunk_log2,
            second_slot,
        }
    }

    pub fn phys(&self, addr: u32) -> u32 {
        if self.chunk_log2 == 0 {
            return addr;
        }

        let bit = 1u32 << self.chunk_log2;
        (addr & !bit) | if self.second_slot { bit } else { 0 }
    }
}

/// Compute the physical address for a logical offset under an explicit slot
/// selection, without touching the I/O handle's current convertor.
pub fn phys_from_logical(addr: u32, chunk_log2: u8, second_slot: bool) -> u32 {
    Convertor::new(chunk_log2, second_slot).phys(addr)
}

/// Uniform byte-addressed access over an image file or a flash device.
pub trait BlockIo {
    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<()>;

    /// Write bytes at `addr`. When `phys` is set the address convertor is
    /// bypassed and `addr` is taken as a physical flash offset.
    fn write(&mut self, addr: u32, data: &[u8], phys: bool) -> Result<()>;

    fn erase_sector(&mut self, addr: u32) -> Result<()>;

    fn size(&self) -> u32;

    fn sector_size(&self) -> u32;

    fn is_flash(&self) -> bool;

    fn convertor(&self) -> Convertor;

    fn set_convertor(&mut self, chunk_log2: u8, second_slot: bool);

    fn is_write_protected(&mut self) -> Result<bool> {
        Ok(false)
    }

    fn read_vec(&mut self, addr: u32, size: u32) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; size as usize];
        self.read(addr, &mut buf)?;
        Ok(buf)
    }
}

/// An in-memory image, loadable from a raw file. Reads and writes go through
/// the same convertor interface as flash so that the engine code is shared,
/// but the convertor is a no-op unless explicitly set.
pub struct FileImage {
    data: Vec<u8>,
    convertor: Convertor,
}

impl FileImage {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            convertor: Convertor::IDENTITY,
        }
    }

    pub fn open(path: &Path) -> io::Result<Self> {
        let mut data = Vec::new();
        File::open(path)?.read_to_end(&mut data)?;
        Ok(Self::new(data))
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    fn check_range(&self, addr: u32, size: u32) -> Result<()> {
        let end = addr
            .checked_add(size)
            .filter(|e| *e as usize <= self.data.len());
        if end.is_none() {
            return Err(Error::OutOfRange {
                addr,
                size,
                total: self.data.len() as u32,
            });
        }
        Ok(())
    }
}

impl BlockIo for FileImage {
    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<()> {
        let addr = self.convertor.phys(addr);
        self.check_range(addr, buf.len() as u32)?;
        buf.copy_from_slice(&self.data[addr as usize..addr as usize + buf.len()]);
        Ok(())
    }

    fn write(&mut self, addr: u32, data: &[u8], phys: bool) -> Result<()> {
        let addr = if phys { addr } else { self.convertor.phys(addr) };
        self.check_range(addr, data.len() as u32)?;
        self.data[addr as usize..addr as usize + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn erase_sector(&mut self, addr: u32) -> Result<()> {
        let sector = self.sector_size();
        let addr = addr & !(sector - 1);
        self.check_range(addr, sector)?;
        self.data[addr as usize..(addr + sector) as usize].fill(0xff);
        Ok(())
    }

    fn size(&self) -> u32 {
        self.data.len() as u32
    }

    fn sector_size(&self) -> u32 {
        DEFAULT_SECTOR_SIZE
    }

    fn is_flash(&self) -> bool {
        false
    }

    fn convertor(&self) -> Convertor {
        self.convertor
    }

    fn set_convertor(&mut self, chunk_log2: u8, second_slot: bool) {
        self.convertor = Convertor::new(chunk_log2, second_slot);
    }
}

/// A live flash device behind a [`FlashDriver`].
pub struct FlashImage<D: FlashDriver> {
    driver: D,
    convertor: Convertor,
}

impl<D: FlashDriver> FlashImage<D> {
    pub fn new(driver: D) -> Self {
        Self {
            driver,
            convertor: Convertor::IDENTITY,
        }
    }

    pub fn driver(&mut self) -> &mut D {
        &mut self.driver
    }

    pub fn attr(&self) -> FlashAttr {
        self.driver.attr().clone()
    }

    pub fn update_boot_addr(&mut self, addr: u32) -> Result<()> {
        self.driver.update_boot_addr(addr)?;
        Ok(())
    }

    fn check_range(&self, addr: u32, size: u32) -> Result<()> {
        let total = self.driver.attr().size;
        if addr.checked_add(size).filter(|e| *e <= total).is_none() {
            return Err(Error::OutOfRange { addr, size, total });
        }
        Ok(())
    }

    /// Disable write protection on every bank, run `op`, and restore the
    /// saved protection state on every exit path.
    pub fn with_unprotected<T, E: From<Error>>(
        &mut self,
        op: impl FnOnce(&mut Self) -> std::result::Result<T, E>,
    ) -> std::result::Result<T, E> {
        let attr = self.driver.attr().clone();
        let off = WriteProtect::default();

        for bank in 0..attr.banks_num {
            self.driver
                .set_write_protect(bank, &off)
                .map_err(|e| E::from(Error::Driver(e)))?;
        }

        let mut polls = 0;
        loop {
            match self.driver.is_write_protected() {
                Ok(false) => break,
                Ok(true) => {
                    polls += 1;
                    if polls >= WRITE_PROTECT_POLLS {
                        self.restore_protection(&attr);
                        return Err(E::from(Error::WriteProtectStuck));
                    }
                    self.driver.settle();
                }
                Err(e) => {
                    self.restore_protection(&attr);
                    return Err(E::from(Error::Driver(e)));
                }
            }
        }

        let result = op(self);

        self.restore_protection(&attr);
        result
    }

    fn restore_protection(&mut self, attr: &FlashAttr) {
        for (bank, protect) in attr.protect_info.iter().enumerate() {
            if let Err(e) = self.driver.set_write_protect(bank as u8, protect) {
                debug!("Failed to restore write protection on bank {bank}: {e}");
            }
        }
    }

    /// Run `op` while holding the raw-access (cache-replacement-off) lease.
    /// The lease is released on every exit path.
    pub fn with_direct_access<T, E: From<Error>>(
        &mut self,
        op: impl FnOnce(&mut Self) -> std::result::Result<T, E>,
    ) -> std::result::Result<T, E> {
        self.driver
            .begin_direct_access()
            .map_err(|e| E::from(Error::Driver(e)))?;
        let result = op(self);
        if let Err(e) = self.driver.end_direct_access() {
            debug!("Failed to release direct flash access: {e}");
        }
        result
    }
}

impl<D: FlashDriver> BlockIo for FlashImage<D> {
    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<()> {
        let addr = self.convertor.phys(addr);
        self.check_range(addr, buf.len() as u32)?;
        self.driver
            .read(addr, buf)
            .map_err(|source| Error::ReadFailed {
                addr,
                size: buf.len() as u32,
                source,
            })
    }

    fn write(&mut self, addr: u32, data: &[u8], phys: bool) -> Result<()> {
        let addr = if phys { addr } else { self.convertor.phys(addr) };
        self.check_range(addr, data.len() as u32)?;
        self.driver
            .write(addr, data)
            .map_err(|source| Error::WriteFailed {
                addr,
                size: data.len() as u32,
                source,
            })
    }

    fn erase_sector(&mut self, addr: u32) -> Result<()> {
        let addr = self.convertor.phys(addr);
        self.driver
            .erase_sector(addr)
            .map_err(|source| Error::EraseFailed { addr, source })
    }

    fn size(&self) -> u32 {
        self.driver.attr().size
    }

    fn sector_size(&self) -> u32 {
        self.driver.attr().sector_size
    }

    fn is_flash(&self) -> bool {
        true
    }

    fn convertor(&self) -> Convertor {
        self.convertor
    }

    fn set_convertor(&mut self, chunk_log2: u8, second_slot: bool) {
        self.convertor = Convertor::new(chunk_log2, second_slot);
    }

    fn is_write_protected(&mut self) -> Result<bool> {
        Ok(self.driver.is_write_protected()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn convertor_forces_slot_bit() {
        let c = Convertor::new(21, false);
        assert_eq!(c.phys(0x1000), 0x1000);
        assert_eq!(c.phys(0x20_1000), 0x1000);

        let c = Convertor::new(21, true);
        assert_eq!(c.phys(0x1000), 0x20_1000);
        assert_eq!(c.phys(0x20_1000), 0x20_1000);

        assert_eq!(Convertor::IDENTITY.phys(0x1234), 0x1234);
    }

    #[test]
    fn file_image_convertor_round_trip() {
        let mut img = FileImage::new(vec![0u8; 0x40_0000]);
        img.set_convertor(21, true);
        img.write(0x10, b"abcd", false).unwrap();

        let mut buf = [0u8; 4];
        img.read(0x10, &mut buf).unwrap();
        assert_eq!(&buf, b"abcd");

        // The write landed in the second slot.
        img.set_convertor(0, false);
        img.read(0x20_0010, &mut buf).unwrap();
        assert_eq!(&buf, b"abcd");
    }

    #[test]
    fn file_image_bounds() {
        let mut img = FileImage::new(vec![0u8; 0x1000]);
        assert!(matches!(
            img.read(0xfff, &mut [0u8; 2]),
            Err(Error::OutOfRange { .. })
        ));
    }

    #[test]
    fn erase_fills_with_ff() {
        let mut img = FileImage::new(vec![0u8; 0x2000]);
        img.erase_sector(0x1234).unwrap();
        assert!(img.as_slice()[0x1000..0x2000].iter().all(|b| *b == 0xff));
        assert!(img.as_slice()[..0x1000].iter().all(|b| *b == 0));
    }
}
