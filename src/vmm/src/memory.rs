// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Guest RAM layout and registration.
//!
//! Guests smaller than the 32-bit MMIO gap get a single flat mapping at
//! guest physical zero. Larger guests are backed by one contiguous host
//! reservation in which the gap itself is protected no-access, so a stray
//! host-side store into the hole faults instead of silently landing in RAM.
//! Either way `host_addr = base + gpa` holds for every address outside the
//! gap, and two memory slots are registered with KVM for the split case.

use std::io;

use kvm_bindings::kvm_userspace_memory_region;
use kvm_ioctls::VmFd;
use vm_memory::{
    Address, GuestAddress, GuestMemory, GuestMemoryMmap, GuestMemoryRegion, GuestRegionMmap,
    MmapRegion,
};

/// First address past the 32-bit space.
pub const MMIO_GAP_END: u64 = 1 << 32;
/// Size of the gap kept free of RAM below 4 GiB.
pub const MMIO_GAP_SIZE: u64 = 512 << 20;
/// Start of the gap; RAM above this point is remapped past 4 GiB.
pub const MMIO_GAP_START: u64 = MMIO_GAP_END - MMIO_GAP_SIZE;

/// Guest memory errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The anonymous RAM reservation failed.
    #[error("failed to mmap {0} bytes of guest RAM: {1}")]
    Mmap(usize, io::Error),
    /// A backing region could not be wrapped.
    #[error("failed to build a guest memory region: {0:?}")]
    MmapRegion(vm_memory::mmap::MmapRegionError),
    /// Guest memory could not be assembled from its regions.
    #[error("failed to build guest memory: {0:?}")]
    Memory(vm_memory::Error),
    /// KVM rejected a memory slot.
    #[error("KVM_SET_USER_MEMORY_REGION ioctl: {0}")]
    SetUserMemoryRegion(kvm_ioctls::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Allocate guest RAM of `size` bytes and lay it out around the MMIO gap.
pub fn create_guest_memory(size: usize) -> Result<GuestMemoryMmap> {
    if (size as u64) < MMIO_GAP_START {
        return GuestMemoryMmap::from_ranges(&[(GuestAddress(0), size)]).map_err(Error::Memory);
    }

    // One reservation covering RAM plus the hole keeps host and guest
    // offsets identical on both sides of the gap.
    let span = size + MMIO_GAP_SIZE as usize;
    let prot = libc::PROT_READ | libc::PROT_WRITE;
    let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE;
    let base = unsafe { libc::mmap(std::ptr::null_mut(), span, prot, flags, -1, 0) };
    if base == libc::MAP_FAILED {
        return Err(Error::Mmap(span, io::Error::last_os_error()));
    }
    let base = base as *mut u8;

    unsafe {
        // Nothing may touch the hole from the host side.
        libc::mprotect(
            base.add(MMIO_GAP_START as usize) as *mut libc::c_void,
            MMIO_GAP_SIZE as usize,
            libc::PROT_NONE,
        );
    }

    let lowmem = unsafe {
        MmapRegion::build_raw(base, MMIO_GAP_START as usize, prot, flags)
            .map_err(Error::MmapRegion)?
    };
    let highmem = unsafe {
        MmapRegion::build_raw(
            base.add(MMIO_GAP_END as usize),
            size - MMIO_GAP_START as usize,
            prot,
            flags,
        )
        .map_err(Error::MmapRegion)?
    };

    GuestMemoryMmap::from_regions(vec![
        GuestRegionMmap::new(lowmem, GuestAddress(0)).map_err(Error::Memory)?,
        GuestRegionMmap::new(highmem, GuestAddress(MMIO_GAP_END)).map_err(Error::Memory)?,
    ])
    .map_err(Error::Memory)
}

/// Register every RAM region as a KVM memory slot.
pub fn register_with_vm(vm_fd: &VmFd, guest_memory: &GuestMemoryMmap) -> Result<()> {
    for (index, region) in guest_memory.iter().enumerate() {
        let kvm_memory_region = kvm_userspace_memory_region {
            slot: index as u32,
            guest_phys_addr: region.start_addr().raw_value(),
            memory_size: region.len() as u64,
            // It's safe to unwrap because the guest address is valid.
            userspace_addr: guest_memory.get_host_address(region.start_addr()).unwrap() as u64,
            flags: 0,
        };

        unsafe { vm_fd.set_user_memory_region(kvm_memory_region) }
            .map_err(Error::SetUserMemoryRegion)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_layout_is_contiguous() {
        let mem = create_guest_memory(128 << 20).unwrap();
        let base = mem.get_host_address(GuestAddress(0)).unwrap() as usize;
        let probe = mem.get_host_address(GuestAddress(0x1_0000)).unwrap() as usize;
        assert_eq!(probe - base, 0x1_0000);
        assert!(mem.get_host_address(GuestAddress(128 << 20)).is_err());
    }

    #[test]
    fn split_layout_hides_the_gap() {
        // 4 GiB of RAM: lowmem up to the gap, the rest remapped past 4 GiB.
        let mem = create_guest_memory(4 << 30).unwrap();
        assert_eq!(mem.num_regions(), 2);

        let base = mem.get_host_address(GuestAddress(0)).unwrap() as usize;
        let high = mem.get_host_address(GuestAddress(MMIO_GAP_END)).unwrap() as usize;
        assert_eq!(high - base, MMIO_GAP_END as usize);

        // The hole is not guest RAM.
        assert!(mem.get_host_address(GuestAddress(MMIO_GAP_START)).is_err());
        assert!(mem
            .get_host_address(GuestAddress(MMIO_GAP_END - 0x1000))
            .is_err());

        // Last byte of RAM sits at gap start + size - 1... which is
        // MMIO_GAP_END + (size - MMIO_GAP_START) - 1 in guest space.
        let last = GuestAddress(MMIO_GAP_END + (4u64 << 30) - MMIO_GAP_START - 1);
        assert!(mem.get_host_address(last).is_ok());
        assert!(mem.get_host_address(last.unchecked_add(1)).is_err());
    }
}
