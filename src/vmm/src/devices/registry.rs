// SPDX-License-Identifier: Apache-2.0

//! Port-I/O and MMIO dispatch.
//!
//! Both registries are interval maps owned by one [`IoRegistry`]: devices
//! claim ranges while the machine is being assembled, vCPU threads only
//! dispatch. Virtio transports may ask for a wildcard port window, which is
//! carved out of the legacy virtio I/O-port range.

use std::sync::{Arc, Mutex};

use log::warn;
use vm_allocator::{AddressAllocator, AllocPolicy};
use vm_device::bus::{MmioAddress, PioAddress};
use vm_device::device_manager::{IoManager, MmioManager, PioManager};
use vm_device::resources::Resource;
use vm_device::{MutDeviceMmio, MutDevicePio};

/// Virtio BAR windows are carved out of this legacy port range.
pub const VIRTIO_PORT_START: u16 = 0xa000;
pub const VIRTIO_PORT_END: u16 = 0xf2ff;
/// Ports claimed by one virtio transport.
pub const VIRTIO_PORT_SIZE: u16 = 0x100;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The requested range overlaps an existing registration.
    #[error("I/O range {base:#x}+{size:#x} is already in use")]
    AddressInUse { base: u64, size: u64 },
    /// The wildcard port window is full.
    #[error("no free window in the virtio port range")]
    PortsExhausted,
    /// Allocator bookkeeping failed.
    #[error("port allocator: {0:?}")]
    Allocator(vm_allocator::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

pub struct IoRegistry {
    io: IoManager,
    port_alloc: AddressAllocator,
}

impl IoRegistry {
    pub fn new() -> Result<Self> {
        Ok(IoRegistry {
            io: IoManager::new(),
            port_alloc: AddressAllocator::new(
                u64::from(VIRTIO_PORT_START),
                u64::from(VIRTIO_PORT_END - VIRTIO_PORT_START) + 1,
            )
            .map_err(Error::Allocator)?,
        })
    }

    /// Claim a fixed port range for `device`.
    pub fn register_pio<D>(&mut self, base: u16, size: u16, device: Arc<Mutex<D>>) -> Result<()>
    where
        D: MutDevicePio + Send + 'static,
    {
        self.io
            .register_pio_resources(device, &[Resource::PioAddressRange { base, size }])
            .map_err(|_| Error::AddressInUse {
                base: u64::from(base),
                size: u64::from(size),
            })
    }

    /// Claim the next free virtio port window and return its base.
    pub fn allocate_pio<D>(&mut self, device: Arc<Mutex<D>>) -> Result<u16>
    where
        D: MutDevicePio + Send + 'static,
    {
        let window = self
            .port_alloc
            .allocate(
                u64::from(VIRTIO_PORT_SIZE),
                u64::from(VIRTIO_PORT_SIZE),
                AllocPolicy::FirstMatch,
            )
            .map_err(|_| Error::PortsExhausted)?;

        let base = window.start() as u16;
        self.register_pio(base, VIRTIO_PORT_SIZE, device)?;
        Ok(base)
    }

    /// Claim a guest-physical range for `device`.
    pub fn register_mmio<D>(&mut self, base: u64, size: u64, device: Arc<Mutex<D>>) -> Result<()>
    where
        D: MutDeviceMmio + Send + 'static,
    {
        self.io
            .register_mmio_resources(device, &[Resource::MmioAddressRange { base, size }])
            .map_err(|_| Error::AddressInUse { base, size })
    }

    /// Dispatch a port read. Returns false when no device claims the port,
    /// in which case the caller treats the access as benign.
    pub fn pio_read(&self, port: u16, data: &mut [u8]) -> bool {
        self.io.pio_read(PioAddress(port), data).is_ok()
    }

    pub fn pio_write(&self, port: u16, data: &[u8]) -> bool {
        self.io.pio_write(PioAddress(port), data).is_ok()
    }

    pub fn mmio_read(&self, addr: u64, data: &mut [u8]) -> bool {
        self.io.mmio_read(MmioAddress(addr), data).is_ok()
    }

    pub fn mmio_write(&self, addr: u64, data: &[u8]) -> bool {
        self.io.mmio_write(MmioAddress(addr), data).is_ok()
    }
}

/// The benign-miss contract: reads float high, writes are dropped.
pub fn unhandled_read(port_or_addr: u64, data: &mut [u8], debug: bool) {
    for byte in data.iter_mut() {
        *byte = 0xff;
    }
    if debug {
        warn!("unhandled I/O read at {:#x}", port_or_addr);
    }
}

pub fn unhandled_write(port_or_addr: u64, data: &[u8], debug: bool) {
    if debug {
        warn!(
            "unhandled I/O write at {:#x} ({} bytes dropped)",
            port_or_addr,
            data.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Scratch {
        last_write: Vec<u8>,
        fill: u8,
    }

    impl MutDevicePio for Scratch {
        fn pio_read(&mut self, _base: PioAddress, _offset: u16, data: &mut [u8]) {
            for byte in data.iter_mut() {
                *byte = self.fill;
            }
        }

        fn pio_write(&mut self, _base: PioAddress, _offset: u16, data: &[u8]) {
            self.last_write = data.to_vec();
        }
    }

    #[test]
    fn fixed_registration_and_dispatch() {
        let mut registry = IoRegistry::new().unwrap();
        let dev = Arc::new(Mutex::new(Scratch {
            fill: 0xab,
            ..Default::default()
        }));
        registry.register_pio(0x3f8, 8, dev.clone()).unwrap();

        let mut data = [0u8; 1];
        assert!(registry.pio_read(0x3f8, &mut data));
        assert_eq!(data[0], 0xab);

        assert!(registry.pio_write(0x3fa, &[1, 2]));
        assert_eq!(dev.lock().unwrap().last_write, vec![1, 2]);

        // Nothing lives at 0x70 yet.
        assert!(!registry.pio_read(0x70, &mut data));
    }

    #[test]
    fn conflicting_registration_fails() {
        let mut registry = IoRegistry::new().unwrap();
        let a = Arc::new(Mutex::new(Scratch::default()));
        let b = Arc::new(Mutex::new(Scratch::default()));
        registry.register_pio(0x60, 8, a).unwrap();
        assert!(matches!(
            registry.register_pio(0x64, 8, b),
            Err(Error::AddressInUse { .. })
        ));
    }

    #[test]
    fn wildcard_ports_come_from_the_virtio_range() {
        let mut registry = IoRegistry::new().unwrap();
        let first = registry
            .allocate_pio(Arc::new(Mutex::new(Scratch::default())))
            .unwrap();
        let second = registry
            .allocate_pio(Arc::new(Mutex::new(Scratch::default())))
            .unwrap();

        assert!(first >= VIRTIO_PORT_START);
        assert_ne!(first, second);
        assert_eq!((second - first) % VIRTIO_PORT_SIZE, 0);
    }

    #[test]
    fn mmio_dispatch() {
        struct Wide;
        impl MutDeviceMmio for Wide {
            fn mmio_read(&mut self, _base: MmioAddress, offset: u64, data: &mut [u8]) {
                data[0] = offset as u8;
            }
            fn mmio_write(&mut self, _base: MmioAddress, _offset: u64, _data: &[u8]) {}
        }

        let mut registry = IoRegistry::new().unwrap();
        registry
            .register_mmio(0xd000_0000, 0x1000, Arc::new(Mutex::new(Wide)))
            .unwrap();

        let mut data = [0u8; 1];
        assert!(registry.mmio_read(0xd000_0010, &mut data));
        assert_eq!(data[0], 0x10);
        assert!(!registry.mmio_read(0xd000_1000, &mut data));
    }
}
