// SPDX-License-Identifier: Apache-2.0

//! PCI slot and interrupt line bookkeeping.
//!
//! Every virtio transport gets a PCI device number, an INTx pin and a GSI
//! from here during machine assembly. The allocator is append-only; lines
//! are raised and lowered through [`IrqLine`] handles that share the VM fd.

use std::sync::Arc;

use kvm_ioctls::VmFd;
use log::warn;

/// First GSI handed to a PCI device. Lines below are claimed by the legacy
/// platform (the 8250 sits on 4).
const IRQ_LINE_BASE: u32 = 5;
/// Last IOAPIC input usable for device interrupts.
const IRQ_LINE_MAX: u32 = 23;
/// PCI device numbers 1..=31; slot 0 stays empty like the original bridge.
const PCI_DEVICE_MAX: u8 = 31;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("out of {0}")]
    ResourceExhausted(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Resources assigned to one PCI device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PciIrq {
    pub device: u8,
    pub pin: u8,
    pub line: u32,
}

pub struct IrqAllocator {
    next_device: u8,
    next_line: u32,
}

impl IrqAllocator {
    pub fn new() -> Self {
        IrqAllocator {
            next_device: 1,
            next_line: IRQ_LINE_BASE,
        }
    }

    /// Hand out the next device number, INTx pin and interrupt line.
    pub fn register_device(&mut self) -> Result<PciIrq> {
        if self.next_device > PCI_DEVICE_MAX {
            return Err(Error::ResourceExhausted("PCI device slots"));
        }
        if self.next_line > IRQ_LINE_MAX {
            return Err(Error::ResourceExhausted("interrupt lines"));
        }

        let assigned = PciIrq {
            device: self.next_device,
            pin: (self.next_device - 1) % 4 + 1,
            line: self.next_line,
        };
        self.next_device += 1;
        self.next_line += 1;

        Ok(assigned)
    }
}

/// A handle for asserting one in-kernel irqchip line.
#[derive(Clone)]
pub struct IrqLine {
    vm_fd: Arc<VmFd>,
    line: u32,
}

impl IrqLine {
    pub fn new(vm_fd: Arc<VmFd>, line: u32) -> Self {
        IrqLine { vm_fd, line }
    }

    pub fn line(&self) -> u32 {
        self.line
    }

    /// Assert the line. Failures are logged, not fatal: the guest driver
    /// will notice the missed completion and poke the queue again.
    pub fn raise(&self) {
        if let Err(e) = self.vm_fd.set_irq_line(self.line, true) {
            warn!("KVM_IRQ_LINE raise on {} failed: {}", self.line, e);
        }
    }

    pub fn lower(&self) {
        if let Err(e) = self.vm_fd.set_irq_line(self.line, false) {
            warn!("KVM_IRQ_LINE lower on {} failed: {}", self.line, e);
        }
    }
}
