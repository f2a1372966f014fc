// SPDX-License-Identifier: Apache-2.0

//! The legacy virtio-PCI transport: one 256-port BAR per device, register
//! file in front, capability trait behind. The transport owns device
//! status and queue selection; everything else is delegated.

use std::sync::{Arc, Mutex};

use log::warn;
use vm_device::bus::PioAddress;
use vm_device::MutDevicePio;

use crate::devices::irq::PciIrq;
use crate::devices::pci::{PciBus, PciDeviceHeader, PCI_BASE_ADDRESS_SPACE_IO};
use crate::devices::registry::{self, IoRegistry, VIRTIO_PORT_SIZE};

use super::{VirtioDevice, VirtioInterrupt, PCI_VENDOR_ID_REDHAT_QUMRANET, VIRTIO_STATUS_DRIVER_OK, VIRTIO_STATUS_FAILED};

// BAR0 register layout, little endian.
const VIRTIO_PCI_HOST_FEATURES: u16 = 0x00;
const VIRTIO_PCI_GUEST_FEATURES: u16 = 0x04;
const VIRTIO_PCI_QUEUE_PFN: u16 = 0x08;
const VIRTIO_PCI_QUEUE_NUM: u16 = 0x0c;
const VIRTIO_PCI_QUEUE_SEL: u16 = 0x0e;
const VIRTIO_PCI_QUEUE_NOTIFY: u16 = 0x10;
const VIRTIO_PCI_STATUS: u16 = 0x12;
const VIRTIO_PCI_ISR: u16 = 0x13;
/// First device-type-specific config byte.
pub const VIRTIO_PCI_CONFIG: u16 = 0x14;
/// Offset of QUEUE_NOTIFY within the BAR, for ioeventfd registration.
pub const VIRTIO_PCI_QUEUE_NOTIFY_OFFSET: u64 = VIRTIO_PCI_QUEUE_NOTIFY as u64;

fn read_le(data: &[u8]) -> u64 {
    let mut value = 0u64;
    for (i, byte) in data.iter().enumerate().take(8) {
        value |= u64::from(*byte) << (8 * i);
    }
    value
}

fn write_le(data: &mut [u8], value: u64) {
    for (i, byte) in data.iter_mut().enumerate().take(8) {
        *byte = (value >> (8 * i)) as u8;
    }
}

pub struct VirtioPciTransport {
    device: Arc<Mutex<dyn VirtioDevice>>,
    intr: VirtioInterrupt,
    status: u8,
    queue_sel: u16,
}

impl VirtioPciTransport {
    pub fn new(device: Arc<Mutex<dyn VirtioDevice>>, intr: VirtioInterrupt) -> Self {
        VirtioPciTransport {
            device,
            intr,
            status: 0,
            queue_sel: 0,
        }
    }

    pub fn status(&self) -> u8 {
        self.status
    }
}

impl MutDevicePio for VirtioPciTransport {
    fn pio_read(&mut self, _base: PioAddress, offset: u16, data: &mut [u8]) {
        match offset {
            VIRTIO_PCI_HOST_FEATURES => {
                write_le(data, u64::from(self.device.lock().unwrap().host_features()))
            }
            VIRTIO_PCI_QUEUE_PFN => write_le(
                data,
                u64::from(self.device.lock().unwrap().queue_pfn(self.queue_sel)),
            ),
            VIRTIO_PCI_QUEUE_NUM => write_le(
                data,
                u64::from(self.device.lock().unwrap().queue_max_size(self.queue_sel)),
            ),
            VIRTIO_PCI_STATUS => write_le(data, u64::from(self.status)),
            VIRTIO_PCI_ISR => write_le(data, u64::from(self.intr.read_and_clear())),
            offset if offset >= VIRTIO_PCI_CONFIG => self
                .device
                .lock()
                .unwrap()
                .config_read(u64::from(offset - VIRTIO_PCI_CONFIG), data),
            // Write-only registers float high.
            _ => {
                for byte in data.iter_mut() {
                    *byte = 0xff;
                }
            }
        }
    }

    fn pio_write(&mut self, _base: PioAddress, offset: u16, data: &[u8]) {
        match offset {
            VIRTIO_PCI_GUEST_FEATURES => {
                // Feature negotiation is closed once the driver is running.
                if self.status & VIRTIO_STATUS_DRIVER_OK == 0 {
                    self.device
                        .lock()
                        .unwrap()
                        .set_guest_features(read_le(data) as u32);
                }
            }
            VIRTIO_PCI_QUEUE_PFN => {
                let pfn = read_le(data) as u32;
                if let Err(e) = self
                    .device
                    .lock()
                    .unwrap()
                    .init_queue(self.queue_sel, pfn)
                {
                    warn!("guest violation binding queue {}: {}", self.queue_sel, e);
                }
            }
            VIRTIO_PCI_QUEUE_SEL => self.queue_sel = read_le(data) as u16,
            VIRTIO_PCI_QUEUE_NOTIFY => {
                let index = read_le(data) as u16;
                self.device.lock().unwrap().notify_queue(index);
            }
            VIRTIO_PCI_STATUS => {
                let status = read_le(data) as u8;
                if status == 0 || status & VIRTIO_STATUS_FAILED != 0 {
                    self.device.lock().unwrap().reset();
                    self.queue_sel = 0;
                }
                self.status = status;
            }
            offset if offset >= VIRTIO_PCI_CONFIG => self
                .device
                .lock()
                .unwrap()
                .config_write(u64::from(offset - VIRTIO_PCI_CONFIG), data),
            _ => {}
        }
    }
}

/// Put `device` on the port bus and the PCI bus.
///
/// Returns the allocated BAR0 base so callers can hang ioeventfds off it.
pub fn attach(
    io_registry: &mut IoRegistry,
    pci_bus: &Arc<Mutex<PciBus>>,
    assigned: &PciIrq,
    device: Arc<Mutex<dyn VirtioDevice>>,
    intr: VirtioInterrupt,
    device_id: u16,
    subsys_id: u16,
    class: u32,
) -> registry::Result<u16> {
    let transport = Arc::new(Mutex::new(VirtioPciTransport::new(device, intr)));
    let base = io_registry.allocate_pio(transport)?;

    pci_bus.lock().unwrap().register(
        assigned.device,
        PciDeviceHeader {
            vendor_id: PCI_VENDOR_ID_REDHAT_QUMRANET,
            device_id,
            class,
            subsys_vendor_id: PCI_VENDOR_ID_REDHAT_QUMRANET,
            subsys_id,
            bar0: u32::from(base) | PCI_BASE_ADDRESS_SPACE_IO,
            bar0_size: u32::from(VIRTIO_PORT_SIZE),
            irq_pin: assigned.pin,
            irq_line: assigned.line as u8,
        },
    );

    Ok(base)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::virtio::Result;

    #[derive(Default)]
    struct StubDevice {
        guest_features: Option<u32>,
        bound: Vec<(u16, u32)>,
        notified: Vec<u16>,
        resets: usize,
        config: [u8; 4],
    }

    impl VirtioDevice for StubDevice {
        fn host_features(&self) -> u32 {
            0x1234_5678
        }
        fn set_guest_features(&mut self, features: u32) {
            self.guest_features = Some(features);
        }
        fn config_read(&self, offset: u64, data: &mut [u8]) {
            super::super::config_blob_read(&self.config, offset, data);
        }
        fn config_write(&mut self, offset: u64, data: &[u8]) {
            super::super::config_blob_write(&mut self.config, offset, data);
        }
        fn num_queues(&self) -> u16 {
            1
        }
        fn queue_max_size(&self, _index: u16) -> u16 {
            128
        }
        fn init_queue(&mut self, index: u16, pfn: u32) -> Result<()> {
            self.bound.push((index, pfn));
            Ok(())
        }
        fn queue_pfn(&self, _index: u16) -> u32 {
            self.bound.last().map(|(_, pfn)| *pfn).unwrap_or(0)
        }
        fn notify_queue(&mut self, index: u16) {
            self.notified.push(index);
        }
        fn reset(&mut self) {
            self.resets += 1;
            self.guest_features = None;
        }
    }

    fn transport() -> (VirtioPciTransport, Arc<Mutex<StubDevice>>) {
        let device = Arc::new(Mutex::new(StubDevice {
            config: [0xca, 0xfe, 0xba, 0xbe],
            ..Default::default()
        }));
        let t = VirtioPciTransport::new(device.clone(), VirtioInterrupt::disconnected());
        (t, device)
    }

    fn read32(t: &mut VirtioPciTransport, offset: u16) -> u32 {
        let mut data = [0u8; 4];
        t.pio_read(PioAddress(0), offset, &mut data);
        u32::from_le_bytes(data)
    }

    #[test]
    fn negotiation_walks_the_register_file() {
        let (mut t, device) = transport();

        assert_eq!(read32(&mut t, VIRTIO_PCI_HOST_FEATURES), 0x1234_5678);
        t.pio_write(PioAddress(0), VIRTIO_PCI_GUEST_FEATURES, &0x30u32.to_le_bytes());
        assert_eq!(device.lock().unwrap().guest_features, Some(0x30));

        t.pio_write(PioAddress(0), VIRTIO_PCI_QUEUE_SEL, &0u16.to_le_bytes());
        t.pio_write(PioAddress(0), VIRTIO_PCI_QUEUE_PFN, &0x200u32.to_le_bytes());
        assert_eq!(device.lock().unwrap().bound, vec![(0, 0x200)]);
        assert_eq!(read32(&mut t, VIRTIO_PCI_QUEUE_PFN), 0x200);

        t.pio_write(PioAddress(0), VIRTIO_PCI_QUEUE_NOTIFY, &0u16.to_le_bytes());
        assert_eq!(device.lock().unwrap().notified, vec![0]);
    }

    #[test]
    fn features_freeze_after_driver_ok() {
        let (mut t, device) = transport();

        t.pio_write(PioAddress(0), VIRTIO_PCI_GUEST_FEATURES, &1u32.to_le_bytes());
        t.pio_write(PioAddress(0), VIRTIO_PCI_STATUS, &[VIRTIO_STATUS_DRIVER_OK]);
        t.pio_write(PioAddress(0), VIRTIO_PCI_GUEST_FEATURES, &2u32.to_le_bytes());

        assert_eq!(device.lock().unwrap().guest_features, Some(1));
    }

    #[test]
    fn failed_status_resets_the_device() {
        let (mut t, device) = transport();
        t.pio_write(PioAddress(0), VIRTIO_PCI_STATUS, &[VIRTIO_STATUS_FAILED]);
        assert_eq!(device.lock().unwrap().resets, 1);

        t.pio_write(PioAddress(0), VIRTIO_PCI_STATUS, &[0]);
        assert_eq!(device.lock().unwrap().resets, 2);
    }

    #[test]
    fn isr_reads_clear() {
        let device = Arc::new(Mutex::new(StubDevice::default()));
        let intr = VirtioInterrupt::disconnected();
        let mut t = VirtioPciTransport::new(device, intr.clone());

        intr.signal_vring();
        let mut data = [0u8; 1];
        t.pio_read(PioAddress(0), VIRTIO_PCI_ISR, &mut data);
        assert_eq!(data[0], 1);
        t.pio_read(PioAddress(0), VIRTIO_PCI_ISR, &mut data);
        assert_eq!(data[0], 0);
    }

    #[test]
    fn device_config_is_offset_by_0x14() {
        let (mut t, _) = transport();
        let mut data = [0u8; 2];
        t.pio_read(PioAddress(0), VIRTIO_PCI_CONFIG + 2, &mut data);
        assert_eq!(data, [0xba, 0xbe]);

        t.pio_write(PioAddress(0), VIRTIO_PCI_CONFIG, &[0x11]);
        let mut one = [0u8; 1];
        t.pio_read(PioAddress(0), VIRTIO_PCI_CONFIG, &mut one);
        assert_eq!(one[0], 0x11);
    }
}
