// SPDX-License-Identifier: Apache-2.0

//! Disk image backends consumed by the block device.
//!
//! The block device only sees [`DiskImage`]; raw files are provided here,
//! other formats (QCOW and friends) plug in behind the same trait.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::{FileExt, MetadataExt};
use std::path::Path;

/// Bytes per sector, the unit the block protocol counts in.
pub const SECTOR_SIZE: u64 = 512;

/// Longest serial the block device will report.
pub const DISK_SERIAL_BYTES: usize = 20;

pub trait DiskImage: Send + Sync {
    /// Image size in bytes.
    fn size(&self) -> u64;
    /// Read starting at `sector`, up to `buf.len()` bytes.
    fn read_at(&self, sector: u64, buf: &mut [u8]) -> io::Result<usize>;
    /// Write starting at `sector`.
    fn write_at(&self, sector: u64, buf: &[u8]) -> io::Result<usize>;
    /// Commit everything written so far to stable storage.
    fn flush(&self) -> io::Result<()>;
    /// Stable identifier, at most [`DISK_SERIAL_BYTES`] bytes.
    fn serial(&self) -> &str;
    fn read_only(&self) -> bool;
}

/// A plain file, sector-addressed.
pub struct RawImage {
    file: File,
    size: u64,
    serial: String,
    read_only: bool,
}

impl RawImage {
    pub fn open(path: &Path, read_only: bool) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(path)?;
        let meta = file.metadata()?;

        let mut serial = format!("{}-{}", meta.dev(), meta.ino());
        serial.truncate(DISK_SERIAL_BYTES);

        Ok(RawImage {
            size: meta.len(),
            file,
            serial,
            read_only,
        })
    }
}

impl DiskImage for RawImage {
    fn size(&self) -> u64 {
        self.size
    }

    fn read_at(&self, sector: u64, buf: &mut [u8]) -> io::Result<usize> {
        let offset = sector
            .checked_mul(SECTOR_SIZE)
            .filter(|off| *off < self.size)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EINVAL))?;
        self.file.read_at(buf, offset)
    }

    fn write_at(&self, sector: u64, buf: &[u8]) -> io::Result<usize> {
        if self.read_only {
            return Err(io::Error::from_raw_os_error(libc::EROFS));
        }
        let offset = sector
            .checked_mul(SECTOR_SIZE)
            .filter(|off| *off < self.size)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EINVAL))?;
        self.file.write_at(buf, offset)
    }

    fn flush(&self) -> io::Result<()> {
        self.file.sync_data()
    }

    fn serial(&self) -> &str {
        &self.serial
    }

    fn read_only(&self) -> bool {
        self.read_only
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use vmm_sys_util::tempfile::TempFile;

    fn image(len: usize) -> (TempFile, RawImage) {
        let file = TempFile::new().unwrap();
        let pattern: Vec<u8> = (0..len).map(|i| (i % 256) as u8).collect();
        file.as_file().write_all(&pattern).unwrap();
        let img = RawImage::open(file.as_path(), false).unwrap();
        (file, img)
    }

    #[test]
    fn sector_addressing() {
        let (_file, img) = image(4096);
        assert_eq!(img.size(), 4096);

        let mut buf = [0u8; 512];
        assert_eq!(img.read_at(1, &mut buf).unwrap(), 512);
        assert_eq!(buf[0], (512 % 256) as u8);

        assert_eq!(img.write_at(2, &[0xeeu8; 512]).unwrap(), 512);
        img.flush().unwrap();
        img.read_at(2, &mut buf).unwrap();
        assert_eq!(buf, [0xee; 512]);
    }

    #[test]
    fn out_of_range_sector_fails() {
        let (_file, img) = image(1024);
        let mut buf = [0u8; 512];
        assert!(img.read_at(9999, &mut buf).is_err());
    }

    #[test]
    fn read_only_rejects_writes() {
        let file = TempFile::new().unwrap();
        file.as_file().write_all(&[0u8; 1024]).unwrap();
        let img = RawImage::open(file.as_path(), true).unwrap();
        assert!(img.read_only());
        assert!(img.write_at(0, &[1u8; 512]).is_err());
    }

    #[test]
    fn serial_fits_the_wire_format() {
        let (_file, img) = image(512);
        assert!(!img.serial().is_empty());
        assert!(img.serial().len() <= DISK_SERIAL_BYTES);
    }
}
