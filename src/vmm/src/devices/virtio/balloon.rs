// SPDX-License-Identifier: Apache-2.0

//! Virtio memory balloon, acknowledge-only.
//!
//! The guest posts page-frame arrays on the inflate and deflate queues;
//! this monitor completes them without reclaiming anything and reports a
//! zero target in its config, which is all a cooperative guest needs to
//! keep the device quiet.

use std::sync::{Arc, Mutex};

use kvm_ioctls::VmFd;
use log::warn;
use vm_memory::GuestMemoryMmap;

use crate::devices::irq::{IrqAllocator, IrqLine};
use crate::devices::pci::PciBus;
use crate::devices::registry::IoRegistry;
use crate::threadpool::{JobHandle, ThreadPool};

use super::queue::Virtqueue;
use super::{
    config_blob_read, config_blob_write, pci, Error, Result, VirtioDevice, VirtioInterrupt,
    PCI_DEVICE_ID_VIRTIO_BALLOON, VIRTIO_ID_BALLOON,
};

pub const VIRTIO_BLN_QUEUE_SIZE: u16 = 128;
const NUM_QUEUES: usize = 2;

pub struct Balloon {
    guest_memory: Arc<GuestMemoryMmap>,
    intr: VirtioInterrupt,
    vqs: [Virtqueue; NUM_QUEUES],
    // num_pages and actual, both zero: no pressure is ever applied.
    config: Vec<u8>,
    guest_features: u32,
    pool: Option<Arc<ThreadPool>>,
    job: Option<JobHandle>,
}

impl Balloon {
    pub fn new(guest_memory: Arc<GuestMemoryMmap>, intr: VirtioInterrupt) -> Result<Self> {
        Ok(Balloon {
            guest_memory,
            intr,
            vqs: [
                Virtqueue::new(VIRTIO_BLN_QUEUE_SIZE)?,
                Virtqueue::new(VIRTIO_BLN_QUEUE_SIZE)?,
            ],
            config: vec![0u8; 8],
            guest_features: 0,
            pool: None,
            job: None,
        })
    }
}

pub(crate) fn process_queues(balloon: &Arc<Mutex<Balloon>>) {
    let mem = balloon.lock().unwrap().guest_memory.clone();
    let intr = balloon.lock().unwrap().intr.clone();

    for index in 0..NUM_QUEUES {
        let mut drained = false;
        loop {
            let mut locked = balloon.lock().unwrap();
            match locked.vqs[index].pop(&mem) {
                Some(chain) => {
                    locked.vqs[index].add_used(&mem, chain.head_index, 0);
                    drained = true;
                }
                None => break,
            }
        }
        let mut locked = balloon.lock().unwrap();
        if drained && locked.vqs[index].needs_notification(&mem) {
            intr.signal_vring();
        }
    }
}

impl VirtioDevice for Balloon {
    fn host_features(&self) -> u32 {
        0
    }

    fn set_guest_features(&mut self, features: u32) {
        self.guest_features = features;
    }

    fn config_read(&self, offset: u64, data: &mut [u8]) {
        config_blob_read(&self.config, offset, data);
    }

    fn config_write(&mut self, offset: u64, data: &[u8]) {
        // The guest reports its actual page count here; remember it.
        config_blob_write(&mut self.config, offset, data);
    }

    fn num_queues(&self) -> u16 {
        NUM_QUEUES as u16
    }

    fn queue_max_size(&self, _index: u16) -> u16 {
        VIRTIO_BLN_QUEUE_SIZE
    }

    fn init_queue(&mut self, index: u16, pfn: u32) -> Result<()> {
        let mem = self.guest_memory.clone();
        self.vqs
            .get_mut(index as usize)
            .ok_or(Error::BadQueueIndex(index))?
            .bind(pfn, &mem)
    }

    fn queue_pfn(&self, index: u16) -> u32 {
        self.vqs.get(index as usize).map(Virtqueue::pfn).unwrap_or(0)
    }

    fn notify_queue(&mut self, index: u16) {
        if usize::from(index) >= NUM_QUEUES {
            warn!("notify for bogus balloon queue {}", index);
            return;
        }
        if let (Some(pool), Some(job)) = (&self.pool, &self.job) {
            pool.do_job(job);
        }
    }

    fn reset(&mut self) {
        for vq in self.vqs.iter_mut() {
            vq.reset();
        }
        self.guest_features = 0;
    }
}

/// Create the balloon and put it on the buses.
pub fn install(
    io_registry: &mut IoRegistry,
    pci_bus: &Arc<Mutex<PciBus>>,
    irq_alloc: &mut IrqAllocator,
    vm_fd: &Arc<VmFd>,
    guest_memory: Arc<GuestMemoryMmap>,
    pool: &Arc<ThreadPool>,
) -> Result<()> {
    let assigned = irq_alloc.register_device()?;
    let intr = VirtioInterrupt::new(IrqLine::new(vm_fd.clone(), assigned.line));

    let balloon = Arc::new(Mutex::new(Balloon::new(guest_memory, intr.clone())?));
    let job = {
        let balloon = balloon.clone();
        pool.add_job(move || process_queues(&balloon))
    };
    {
        let mut locked = balloon.lock().unwrap();
        locked.pool = Some(pool.clone());
        locked.job = Some(job);
    }

    pci::attach(
        io_registry,
        pci_bus,
        &assigned,
        balloon,
        intr,
        PCI_DEVICE_ID_VIRTIO_BALLOON,
        VIRTIO_ID_BALLOON,
        0xff0000,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::virtio::queue::tests::GuestRing;

    #[test]
    fn inflate_chains_are_acknowledged() {
        let mem = Arc::new(crate::memory::create_guest_memory(64 << 20).unwrap());
        let balloon = Arc::new(Mutex::new(
            Balloon::new(mem.clone(), VirtioInterrupt::disconnected()).unwrap(),
        ));
        balloon.lock().unwrap().init_queue(0, 0x200).unwrap();

        let ring = GuestRing {
            base: 0x200 << 12,
            size: VIRTIO_BLN_QUEUE_SIZE,
        };
        ring.write_desc(&mem, 0, 0x3000, 4096, 0, 0);
        ring.publish_avail(&mem, 0);

        process_queues(&balloon);
        assert_eq!(ring.used_idx(&mem), 1);
        assert_eq!(ring.used_entry(&mem, 0), (0, 0));
    }
}
