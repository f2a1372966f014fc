// SPDX-License-Identifier: Apache-2.0

//! Virtio entropy device: guest buffers are filled from a host randomness
//! source, one threadpool job per notify, one interrupt per drained batch.

use std::fs::File;
use std::io::Read;
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
    pci, Error, Result, VirtioDevice, VirtioInterrupt, PCI_DEVICE_ID_VIRTIO_RNG, VIRTIO_ID_RNG,
};

pub const VIRTIO_RNG_QUEUE_SIZE: u16 = 128;

const ENTROPY_SOURCE: &str = "/dev/urandom";

pub struct Rng {
    guest_memory: Arc<GuestMemoryMmap>,
    intr: VirtioInterrupt,
    vq: Virtqueue,
    source: Arc<File>,
    guest_features: u32,
    pool: Option<Arc<ThreadPool>>,
    job: Option<JobHandle>,
}

impl Rng {
    pub fn new(
        guest_memory: Arc<GuestMemoryMmap>,
        intr: VirtioInterrupt,
        source: File,
    ) -> Result<Self> {
        Ok(Rng {
            guest_memory,
            intr,
            vq: Virtqueue::new(VIRTIO_RNG_QUEUE_SIZE)?,
            source: Arc::new(source),
            guest_features: 0,
            pool: None,
            job: None,
        })
    }
}

/// Fill every posted buffer with entropy. Runs as a threadpool job.
pub(crate) fn process_queue(rng: &Arc<Mutex<Rng>>) {
    let (mem, source, intr) = {
        let locked = rng.lock().unwrap();
        (
            locked.guest_memory.clone(),
            locked.source.clone(),
            locked.intr.clone(),
        )
    };

    let mut drained = false;
    loop {
        let chain = match rng.lock().unwrap().vq.pop(&mem) {
            Some(chain) => chain,
            None => break,
        };

        let mut bytes = vec![0u8; chain.in_len()];
        let filled = match (&*source).read(&mut bytes) {
            Ok(n) => n,
            Err(e) => {
                warn!("entropy source read failed: {}", e);
                0
            }
        };
        let published = chain.write_in(&mem, &bytes[..filled]).unwrap_or(0);

        rng.lock()
            .unwrap()
            .vq
            .add_used(&mem, chain.head_index, published);
        drained = true;
    }

    // One pulse per batch is plenty for an entropy pool.
    if drained && rng.lock().unwrap().vq.needs_notification(&mem) {
        intr.signal_vring();
    }
}

impl VirtioDevice for Rng {
    fn host_features(&self) -> u32 {
        0
    }

    fn set_guest_features(&mut self, features: u32) {
        self.guest_features = features;
    }

    fn config_read(&self, _offset: u64, data: &mut [u8]) {
        for byte in data.iter_mut() {
            *byte = 0xff;
        }
    }

    fn config_write(&mut self, _offset: u64, _data: &[u8]) {}

    fn num_queues(&self) -> u16 {
        1
    }

    fn queue_max_size(&self, _index: u16) -> u16 {
        VIRTIO_RNG_QUEUE_SIZE
    }

    fn init_queue(&mut self, index: u16, pfn: u32) -> Result<()> {
        if index != 0 {
            return Err(Error::BadQueueIndex(index));
        }
        self.vq.bind(pfn, &self.guest_memory)
    }

    fn queue_pfn(&self, index: u16) -> u32 {
        if index == 0 {
            self.vq.pfn()
        } else {
            0
        }
    }

    fn notify_queue(&mut self, index: u16) {
        if index != 0 {
            warn!("notify for bogus rng queue {}", index);
            return;
        }
        if let (Some(pool), Some(job)) = (&self.pool, &self.job) {
            pool.do_job(job);
        }
    }

    fn reset(&mut self) {
        self.vq.reset();
        self.guest_features = 0;
    }
}

/// Create the entropy device and put it on the buses.
pub fn install(
    io_registry: &mut IoRegistry,
    pci_bus: &Arc<Mutex<PciBus>>,
    irq_alloc: &mut IrqAllocator,
    vm_fd: &Arc<VmFd>,
    guest_memory: Arc<GuestMemoryMmap>,
    pool: &Arc<ThreadPool>,
) -> Result<()> {
    let source = File::open(ENTROPY_SOURCE).map_err(|source| Error::Backend {
        device: "rng",
        source,
    })?;

    let assigned = irq_alloc.register_device()?;
    let intr = VirtioInterrupt::new(IrqLine::new(vm_fd.clone(), assigned.line));

    let rng = Arc::new(Mutex::new(Rng::new(guest_memory, intr.clone(), source)?));
    let job = {
        let rng = rng.clone();
        pool.add_job(move || process_queue(&rng))
    };
    {
        let mut locked = rng.lock().unwrap();
        locked.pool = Some(pool.clone());
        locked.job = Some(job);
    }

    pci::attach(
        io_registry,
        pci_bus,
        &assigned,
        rng,
        intr,
        PCI_DEVICE_ID_VIRTIO_RNG,
        VIRTIO_ID_RNG,
        0x010000,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::virtio::queue::tests::{GuestRing, VRING_DESC_F_NEXT, VRING_DESC_F_WRITE};

    const PFN: u32 = 0x140;

    #[test]
    fn buffers_fill_and_complete() {
        let mem = Arc::new(crate::memory::create_guest_memory(64 << 20).unwrap());
        let source = File::open(ENTROPY_SOURCE).unwrap();
        let rng = Arc::new(Mutex::new(
            Rng::new(mem.clone(), VirtioInterrupt::disconnected(), source).unwrap(),
        ));
        let intr = rng.lock().unwrap().intr.clone();
        rng.lock().unwrap().init_queue(0, PFN).unwrap();

        let ring = GuestRing {
            base: u64::from(PFN) << 12,
            size: VIRTIO_RNG_QUEUE_SIZE,
        };
        ring.write_desc(&mem, 0, 0x3000, 32, VRING_DESC_F_NEXT | VRING_DESC_F_WRITE, 1);
        ring.write_desc(&mem, 1, 0x4000, 32, VRING_DESC_F_WRITE, 0);
        ring.publish_avail(&mem, 0);

        process_queue(&rng);

        assert_eq!(ring.used_idx(&mem), 1);
        assert_eq!(ring.used_entry(&mem, 0), (0, 64));
        assert_eq!(intr.read_and_clear(), 1);
    }
}
