// SPDX-License-Identifier: Apache-2.0

//! Shared shape of the paravirtual devices: the capability trait the legacy
//! PCI transport drives, interrupt signaling, and the PCI identity every
//! virtio function carries.

use std::io;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use crate::devices::irq::IrqLine;

pub mod balloon;
pub mod blk;
pub mod console;
pub mod net;
pub mod p9;
pub mod pci;
pub mod queue;
pub mod rng;

/// Red Hat / Qumranet, the vendor id every virtio function advertises.
pub const PCI_VENDOR_ID_REDHAT_QUMRANET: u16 = 0x1af4;

// Transitional PCI device ids.
pub const PCI_DEVICE_ID_VIRTIO_NET: u16 = 0x1000;
pub const PCI_DEVICE_ID_VIRTIO_BLK: u16 = 0x1001;
pub const PCI_DEVICE_ID_VIRTIO_BALLOON: u16 = 0x1002;
pub const PCI_DEVICE_ID_VIRTIO_CONSOLE: u16 = 0x1003;
pub const PCI_DEVICE_ID_VIRTIO_RNG: u16 = 0x1004;
pub const PCI_DEVICE_ID_VIRTIO_P9: u16 = 0x1009;

// Virtio device types, used as the subsystem id.
pub const VIRTIO_ID_NET: u16 = 1;
pub const VIRTIO_ID_BLOCK: u16 = 2;
pub const VIRTIO_ID_BALLOON: u16 = 5;
pub const VIRTIO_ID_CONSOLE: u16 = 3;
pub const VIRTIO_ID_RNG: u16 = 4;
pub const VIRTIO_ID_9P: u16 = 9;

// Device status bits, in the order the driver walks them.
pub const VIRTIO_STATUS_ACKNOWLEDGE: u8 = 1;
pub const VIRTIO_STATUS_DRIVER: u8 = 2;
pub const VIRTIO_STATUS_DRIVER_OK: u8 = 4;
pub const VIRTIO_STATUS_FAILED: u8 = 0x80;

// ISR bits; bit 0 is a queue interrupt, bit 1 a config change.
pub const VIRTIO_IRQ_VRING: u8 = 0x1;
pub const VIRTIO_IRQ_CONFIG: u8 = 0x2;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("virtqueue setup: {0:?}")]
    Queue(virtio_queue::Error),
    #[error("guest memory access: {0}")]
    GuestMemory(vm_memory::GuestMemoryError),
    #[error("guest handed the device a bad ring address at pfn {0:#x}")]
    BadQueuePfn(u32),
    #[error("queue {0} does not exist")]
    BadQueueIndex(u16),
    #[error("{device} backend: {source}")]
    Backend {
        device: &'static str,
        source: io::Error,
    },
    #[error("{0}")]
    Ports(#[from] crate::devices::registry::Error),
    #[error("{0}")]
    Irq(#[from] crate::devices::irq::Error),
    #[error("KVM_IOEVENTFD: {0}")]
    Ioevent(kvm_ioctls::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// The capability set the transport drives. Implementations own their
/// virtqueues and backend resources; the transport owns the register file.
pub trait VirtioDevice: Send {
    /// Feature bitmap offered to the guest.
    fn host_features(&self) -> u32;
    /// Guest-accepted feature subset.
    fn set_guest_features(&mut self, features: u32);
    /// Device-type-specific configuration, offsets relative to 0x14.
    fn config_read(&self, offset: u64, data: &mut [u8]);
    fn config_write(&mut self, offset: u64, data: &[u8]);
    fn num_queues(&self) -> u16;
    fn queue_max_size(&self, index: u16) -> u16;
    /// Bind a queue to the guest page the driver supplied.
    fn init_queue(&mut self, index: u16, pfn: u32) -> Result<()>;
    fn queue_pfn(&self, index: u16) -> u32;
    /// The driver put new descriptors on `index`. Must not block.
    fn notify_queue(&mut self, index: u16);
    /// Status dropped to zero or FAILED: forget rings and features.
    fn reset(&mut self);
}

/// Byte-granular access into a device config blob. Reads past the end
/// float high, writes past the end are dropped.
pub fn config_blob_read(blob: &[u8], offset: u64, data: &mut [u8]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte = blob
            .get(offset as usize + i)
            .copied()
            .unwrap_or(0xff);
    }
}

pub fn config_blob_write(blob: &mut [u8], offset: u64, data: &[u8]) {
    for (i, byte) in data.iter().enumerate() {
        if let Some(slot) = blob.get_mut(offset as usize + i) {
            *slot = *byte;
        }
    }
}

/// Interrupt plumbing shared between a transport and its device workers.
/// Queue and config causes accumulate independently; an ISR read returns
/// and clears the whole mask and drops the line.
#[derive(Clone)]
pub struct VirtioInterrupt {
    isr: Arc<AtomicU8>,
    line: Option<IrqLine>,
}

impl VirtioInterrupt {
    pub fn new(line: IrqLine) -> Self {
        VirtioInterrupt {
            isr: Arc::new(AtomicU8::new(0)),
            line: Some(line),
        }
    }

    /// An interrupt sink with no line behind it, for assembling devices
    /// before the irqchip exists.
    pub fn disconnected() -> Self {
        VirtioInterrupt {
            isr: Arc::new(AtomicU8::new(0)),
            line: None,
        }
    }

    pub fn signal_vring(&self) {
        self.isr.fetch_or(VIRTIO_IRQ_VRING, Ordering::SeqCst);
        if let Some(line) = &self.line {
            line.raise();
        }
    }

    pub fn signal_config(&self) {
        self.isr.fetch_or(VIRTIO_IRQ_CONFIG, Ordering::SeqCst);
        if let Some(line) = &self.line {
            line.raise();
        }
    }

    /// Clear-on-read semantics of the ISR register.
    pub fn read_and_clear(&self) -> u8 {
        let pending = self.isr.swap(0, Ordering::SeqCst);
        if let Some(line) = &self.line {
            line.lower();
        }
        pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn isr_is_clear_on_read() {
        let intr = VirtioInterrupt::disconnected();
        intr.signal_vring();
        intr.signal_config();
        assert_eq!(intr.read_and_clear(), VIRTIO_IRQ_VRING | VIRTIO_IRQ_CONFIG);
        assert_eq!(intr.read_and_clear(), 0);
    }

    #[test]
    fn config_blob_edges() {
        let mut blob = vec![1u8, 2, 3, 4];
        let mut out = [0u8; 3];
        config_blob_read(&blob, 2, &mut out);
        assert_eq!(out, [3, 4, 0xff]);

        config_blob_write(&mut blob, 3, &[9, 9]);
        assert_eq!(blob, vec![1, 2, 3, 9]);
    }
}
