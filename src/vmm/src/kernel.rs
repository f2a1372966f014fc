// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

#![cfg(target_arch = "x86_64")]

//! Kernel image loading.
//!
//! The loader first treats the image as a bzImage: real-mode setup copied to
//! segment 0x1000, protected-mode body to 1 MiB, command line at 0x20000 and
//! the setup header patched in place. Anything without the bzImage magic is
//! copied verbatim to segment 0x1000 and entered at offset zero. See
//! Documentation/x86/boot.txt for the on-disk and in-memory layout.

use std::cmp;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use linux_loader::bootparam::boot_params;
use vm_memory::{Address, ByteValued, Bytes, GuestAddress, GuestMemory, GuestMemoryMmap};

use crate::memory::MMIO_GAP_START;

/// Real-mode segment the image is loaded at.
pub const BOOT_LOADER_SELECTOR: u16 = 0x1000;
/// Offset of the first loaded byte within that segment.
pub const BOOT_LOADER_IP: u16 = 0x0000;
/// Boot stack, grows down from under the setup code.
pub const BOOT_LOADER_SP: u16 = 0x8000;
/// Where the protected-mode kernel body lives.
const BZ_KERNEL_START: u64 = 0x0010_0000;
/// Where the command line is written.
const BOOT_CMDLINE_OFFSET: u64 = 0x0002_0000;

/// `HdrS`, little endian.
const BZIMAGE_MAGIC: u32 = 0x5372_6448;
/// Oldest boot protocol this monitor is willing to feed.
const BOOT_PROTOCOL_REQUIRED: u16 = 0x206;
/// Images predating the `setup_sects` field get the historical default.
const BZ_DEFAULT_SETUP_SECTS: u8 = 4;
/// `loadflags` bit: the setup heap past `heap_end_ptr` is usable.
const CAN_USE_HEAP: u8 = 0x80;

/// RFC 1952.
const GZIP_ID: [u8; 2] = [0x1f, 0x8b];

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to read kernel image: {0}")]
    KernelRead(std::io::Error),
    #[error("boot protocol {0:#x} is too old (need at least 0x206)")]
    UnsupportedKernel(u16),
    #[error("failed to read initrd: {0}")]
    InitrdRead(std::io::Error),
    #[error("initrd is not a gzip image")]
    InitrdNotGzip,
    #[error("not enough memory for initrd")]
    InsufficientMemory,
    #[error("failed to write guest memory: {0}")]
    GuestMemory(vm_memory::GuestMemoryError),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Register state the boot CPU starts from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KernelLoad {
    pub boot_selector: u16,
    pub boot_ip: u16,
    pub boot_sp: u16,
}

fn flat(selector: u16, offset: u16) -> u64 {
    (u64::from(selector) << 4) + u64::from(offset)
}

/// Load `kernel` (and optionally `initrd`) into guest memory with `cmdline`.
pub fn load_kernel(
    guest_memory: &GuestMemoryMmap,
    kernel: &Path,
    initrd: Option<&Path>,
    cmdline: &str,
    vid_mode: u16,
) -> Result<KernelLoad> {
    let mut kernel_file = File::open(kernel).map_err(Error::KernelRead)?;

    match load_bzimage(guest_memory, &mut kernel_file, initrd, cmdline, vid_mode) {
        Ok(load) => Ok(load),
        Err(Error::UnsupportedKernel(v)) => Err(Error::UnsupportedKernel(v)),
        Err(Error::InitrdNotGzip) => Err(Error::InitrdNotGzip),
        Err(Error::InsufficientMemory) => Err(Error::InsufficientMemory),
        Err(_) => {
            log::warn!(
                "{} is not a bzImage, loading it as a flat binary",
                kernel.display()
            );
            load_flat_binary(guest_memory, &mut kernel_file)
        }
    }
}

fn load_bzimage(
    guest_memory: &GuestMemoryMmap,
    kernel_file: &mut File,
    initrd: Option<&Path>,
    cmdline: &str,
    vid_mode: u16,
) -> Result<KernelLoad> {
    let mut boot = boot_params::default();

    kernel_file
        .seek(SeekFrom::Start(0))
        .and_then(|_| kernel_file.read_exact(boot.as_mut_slice()))
        .map_err(Error::KernelRead)?;

    if boot.hdr.header != BZIMAGE_MAGIC {
        return Err(Error::KernelRead(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "bzImage magic not found",
        )));
    }
    if boot.hdr.version < BOOT_PROTOCOL_REQUIRED {
        return Err(Error::UnsupportedKernel(boot.hdr.version));
    }

    if boot.hdr.setup_sects == 0 {
        boot.hdr.setup_sects = BZ_DEFAULT_SETUP_SECTS;
    }
    let setup_size = (usize::from(boot.hdr.setup_sects) + 1) << 9;
    let setup_addr = GuestAddress(flat(BOOT_LOADER_SELECTOR, BOOT_LOADER_IP));

    // Real-mode setup, then the compressed body at 1 MiB.
    let mut setup = vec![0u8; setup_size];
    kernel_file
        .seek(SeekFrom::Start(0))
        .and_then(|_| kernel_file.read_exact(&mut setup))
        .map_err(Error::KernelRead)?;
    guest_memory
        .write_slice(&setup, setup_addr)
        .map_err(Error::GuestMemory)?;

    let mut body = Vec::new();
    kernel_file
        .read_to_end(&mut body)
        .map_err(Error::KernelRead)?;
    guest_memory
        .write_slice(&body, GuestAddress(BZ_KERNEL_START))
        .map_err(Error::GuestMemory)?;

    // Command line, truncated to what the header says the kernel accepts.
    let room = cmp::max(boot.hdr.cmdline_size as usize, 1);
    let mut line = vec![0u8; room];
    let take = cmp::min(cmdline.len(), room - 1);
    line[..take].copy_from_slice(&cmdline.as_bytes()[..take]);
    guest_memory
        .write_slice(&line, GuestAddress(BOOT_CMDLINE_OFFSET))
        .map_err(Error::GuestMemory)?;

    boot.hdr.cmd_line_ptr = BOOT_CMDLINE_OFFSET as u32;
    boot.hdr.type_of_loader = 0xff;
    boot.hdr.heap_end_ptr = 0xfe00;
    boot.hdr.loadflags |= CAN_USE_HEAP;
    boot.hdr.vid_mode = vid_mode;

    if let Some(initrd) = initrd {
        let (addr, size) = load_initrd(guest_memory, initrd, &boot)?;
        boot.hdr.ramdisk_image = addr as u32;
        boot.hdr.ramdisk_size = size as u32;
    }

    // Patch only the setup header back into the loaded image; the bytes
    // around it are live setup code.
    let hdr_offset = {
        let base = &boot as *const boot_params as usize;
        let hdr = &boot.hdr as *const _ as usize;
        hdr - base
    };
    let hdr_size = std::mem::size_of_val(&boot.hdr);
    guest_memory
        .write_slice(
            &boot.as_slice()[hdr_offset..hdr_offset + hdr_size],
            setup_addr.unchecked_add(hdr_offset as u64),
        )
        .map_err(Error::GuestMemory)?;

    Ok(KernelLoad {
        boot_selector: BOOT_LOADER_SELECTOR,
        // The real-mode setup entry sits at offset 0x200 of the image.
        boot_ip: BOOT_LOADER_IP + 0x200,
        boot_sp: BOOT_LOADER_SP,
    })
}

/// Find a 1 MiB aligned window below `initrd_addr_max`, above the kernel and
/// inside lowmem, then read the image there.
fn load_initrd(
    guest_memory: &GuestMemoryMmap,
    initrd: &Path,
    boot: &boot_params,
) -> Result<(u64, u64)> {
    let mut file = File::open(initrd).map_err(Error::InitrdRead)?;

    let mut id = [0u8; 2];
    file.read_exact(&mut id).map_err(Error::InitrdRead)?;
    if id != GZIP_ID {
        return Err(Error::InitrdNotGzip);
    }

    let size = file.metadata().map_err(Error::InitrdRead)?.len();
    let lowmem_top = cmp::min(guest_memory.last_addr().raw_value() + 1, MMIO_GAP_START);

    let mut addr = u64::from(boot.hdr.initrd_addr_max) & !0xfffff;
    loop {
        if addr < BZ_KERNEL_START {
            return Err(Error::InsufficientMemory);
        }
        if addr.checked_add(size).map_or(false, |end| end <= lowmem_top) {
            break;
        }
        addr -= 0x10_0000;
    }

    let mut image = Vec::with_capacity(size as usize);
    file.seek(SeekFrom::Start(0)).map_err(Error::InitrdRead)?;
    file.read_to_end(&mut image).map_err(Error::InitrdRead)?;
    guest_memory
        .write_slice(&image, GuestAddress(addr))
        .map_err(Error::GuestMemory)?;

    Ok((addr, size))
}

fn load_flat_binary(guest_memory: &GuestMemoryMmap, kernel_file: &mut File) -> Result<KernelLoad> {
    let mut image = Vec::new();
    kernel_file
        .seek(SeekFrom::Start(0))
        .and_then(|_| kernel_file.read_to_end(&mut image))
        .map_err(Error::KernelRead)?;

    guest_memory
        .write_slice(
            &image,
            GuestAddress(flat(BOOT_LOADER_SELECTOR, BOOT_LOADER_IP)),
        )
        .map_err(Error::GuestMemory)?;

    Ok(KernelLoad {
        boot_selector: BOOT_LOADER_SELECTOR,
        boot_ip: BOOT_LOADER_IP,
        boot_sp: BOOT_LOADER_SP,
    })
}
