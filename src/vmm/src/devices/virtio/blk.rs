// SPDX-License-Identifier: Apache-2.0

//! Virtio block device.
//!
//! One queue. Every request chain is a 16-byte header, a data iovec and a
//! trailing status byte. The ring is drained from a threadpool job so disk
//! latency never stalls the vCPU that wrote QUEUE_NOTIFY; request scratch
//! buffers are recycled through a fixed free list.

use std::sync::{Arc, Mutex};

use kvm_ioctls::VmFd;
use log::warn;
use virtio_bindings::bindings::virtio_blk::{
    VIRTIO_BLK_F_FLUSH, VIRTIO_BLK_F_SEG_MAX, VIRTIO_BLK_S_IOERR, VIRTIO_BLK_S_OK,
    VIRTIO_BLK_S_UNSUPP, VIRTIO_BLK_T_FLUSH, VIRTIO_BLK_T_GET_ID, VIRTIO_BLK_T_IN,
    VIRTIO_BLK_T_OUT,
};
use vm_memory::{Bytes, GuestAddress, GuestMemoryMmap};

use crate::devices::irq::{IrqAllocator, IrqLine};
use crate::devices::pci::PciBus;
use crate::devices::registry::IoRegistry;
use crate::disk::{DiskImage, DISK_SERIAL_BYTES, SECTOR_SIZE};
use crate::threadpool::{JobHandle, ThreadPool};

use super::queue::{ChainBuffers, Virtqueue};
use super::{
    config_blob_read, config_blob_write, pci, Error, Result, VirtioDevice, VirtioInterrupt,
    PCI_DEVICE_ID_VIRTIO_BLK, VIRTIO_ID_BLOCK,
};

pub const VIRTIO_BLK_QUEUE_SIZE: u16 = 128;
/// Header and status eat two descriptors out of every chain.
const DISK_SEG_MAX: u32 = VIRTIO_BLK_QUEUE_SIZE as u32 - 2;

const REQUEST_HEADER_BYTES: usize = 16;

/// Recycled request scratch buffers: free -> in-flight -> free. The pool is
/// sized to the queue, so a slot can never be completed twice concurrently.
struct SlotPool {
    free: Mutex<Vec<Vec<u8>>>,
}

impl SlotPool {
    fn new(slots: usize) -> Self {
        SlotPool {
            free: Mutex::new((0..slots).map(|_| Vec::new()).collect()),
        }
    }

    fn take(&self) -> Option<Vec<u8>> {
        self.free.lock().unwrap().pop()
    }

    fn put(&self, mut slot: Vec<u8>) {
        slot.clear();
        self.free.lock().unwrap().push(slot);
    }
}

pub struct Blk {
    guest_memory: Arc<GuestMemoryMmap>,
    disk: Arc<dyn DiskImage>,
    intr: VirtioInterrupt,
    vq: Virtqueue,
    config: Vec<u8>,
    guest_features: u32,
    slots: Arc<SlotPool>,
    pool: Option<Arc<ThreadPool>>,
    job: Option<JobHandle>,
}

impl Blk {
    pub fn new(
        guest_memory: Arc<GuestMemoryMmap>,
        disk: Arc<dyn DiskImage>,
        intr: VirtioInterrupt,
    ) -> Result<Self> {
        let mut config = Vec::with_capacity(16);
        config.extend_from_slice(&(disk.size() / SECTOR_SIZE).to_le_bytes());
        config.extend_from_slice(&0u32.to_le_bytes()); // size_max, unused
        config.extend_from_slice(&DISK_SEG_MAX.to_le_bytes());

        Ok(Blk {
            guest_memory,
            disk,
            intr,
            vq: Virtqueue::new(VIRTIO_BLK_QUEUE_SIZE)?,
            config,
            guest_features: 0,
            slots: Arc::new(SlotPool::new(VIRTIO_BLK_QUEUE_SIZE as usize)),
            pool: None,
            job: None,
        })
    }
}

fn gather(mem: &GuestMemoryMmap, bufs: &[(GuestAddress, u32)], out: &mut Vec<u8>) -> Result<()> {
    for (addr, len) in bufs {
        let start = out.len();
        out.resize(start + *len as usize, 0);
        mem.read_slice(&mut out[start..], *addr)
            .map_err(Error::GuestMemory)?;
    }
    Ok(())
}

fn scatter(mem: &GuestMemoryMmap, bufs: &[(GuestAddress, u32)], data: &[u8]) -> Result<u32> {
    let mut written = 0usize;
    for (addr, len) in bufs {
        if written == data.len() {
            break;
        }
        let take = std::cmp::min(*len as usize, data.len() - written);
        mem.write_slice(&data[written..written + take], *addr)
            .map_err(Error::GuestMemory)?;
        written += take;
    }
    Ok(written as u32)
}

/// Execute one request chain; returns (used length, status byte).
fn execute(
    mem: &GuestMemoryMmap,
    disk: &Arc<dyn DiskImage>,
    chain: &ChainBuffers,
    scratch: &mut Vec<u8>,
) -> (u32, u8) {
    // First out-descriptor is the header, last in-descriptor the status.
    let header_buf = match chain.to_device.first() {
        Some(buf) if buf.1 as usize >= REQUEST_HEADER_BYTES => *buf,
        _ => return (0, VIRTIO_BLK_S_IOERR as u8),
    };
    if chain.to_guest.is_empty() {
        return (0, VIRTIO_BLK_S_IOERR as u8);
    }

    let mut header = [0u8; REQUEST_HEADER_BYTES];
    if mem.read_slice(&mut header, header_buf.0).is_err() {
        return (0, VIRTIO_BLK_S_IOERR as u8);
    }
    let req_type = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    let sector = u64::from_le_bytes([
        header[8], header[9], header[10], header[11], header[12], header[13], header[14],
        header[15],
    ]);

    let data_in = &chain.to_guest[..chain.to_guest.len() - 1];

    match req_type {
        VIRTIO_BLK_T_IN => {
            let want: usize = data_in.iter().map(|(_, len)| *len as usize).sum();
            scratch.resize(want, 0);
            match disk.read_at(sector, scratch) {
                Ok(n) => match scatter(mem, data_in, &scratch[..n]) {
                    Ok(done) => (done, VIRTIO_BLK_S_OK as u8),
                    Err(_) => (0, VIRTIO_BLK_S_IOERR as u8),
                },
                Err(e) => {
                    warn!("disk read at sector {}: {}", sector, e);
                    (0, VIRTIO_BLK_S_IOERR as u8)
                }
            }
        }
        VIRTIO_BLK_T_OUT => {
            scratch.clear();
            if gather(mem, &chain.to_device[1..], scratch).is_err() {
                return (0, VIRTIO_BLK_S_IOERR as u8);
            }
            match disk.write_at(sector, scratch) {
                Ok(n) => (n as u32, VIRTIO_BLK_S_OK as u8),
                Err(e) => {
                    warn!("disk write at sector {}: {}", sector, e);
                    (0, VIRTIO_BLK_S_IOERR as u8)
                }
            }
        }
        VIRTIO_BLK_T_FLUSH => match disk.flush() {
            Ok(()) => (0, VIRTIO_BLK_S_OK as u8),
            Err(e) => {
                warn!("disk flush: {}", e);
                (0, VIRTIO_BLK_S_IOERR as u8)
            }
        },
        VIRTIO_BLK_T_GET_ID => {
            let mut id = [0u8; DISK_SERIAL_BYTES];
            let serial = disk.serial().as_bytes();
            let take = std::cmp::min(serial.len(), DISK_SERIAL_BYTES);
            id[..take].copy_from_slice(&serial[..take]);
            // The serial goes into the first data descriptor only.
            match data_in.first() {
                Some((addr, len)) => {
                    let copy = std::cmp::min(id.len(), *len as usize);
                    match mem.write_slice(&id[..copy], *addr) {
                        Ok(()) => (copy as u32, VIRTIO_BLK_S_OK as u8),
                        Err(_) => (0, VIRTIO_BLK_S_IOERR as u8),
                    }
                }
                None => (0, VIRTIO_BLK_S_IOERR as u8),
            }
        }
        other => {
            warn!("unsupported block request type {}", other);
            (0, VIRTIO_BLK_S_UNSUPP as u8)
        }
    }
}

/// Drain every available request. Runs as a threadpool job.
pub(crate) fn process_queue(blk: &Arc<Mutex<Blk>>) {
    let (mem, disk, intr, slots) = {
        let locked = blk.lock().unwrap();
        (
            locked.guest_memory.clone(),
            locked.disk.clone(),
            locked.intr.clone(),
            locked.slots.clone(),
        )
    };

    loop {
        let chain = match blk.lock().unwrap().vq.pop(&mem) {
            Some(chain) => chain,
            None => break,
        };

        // The pool is queue-sized and this job never races itself, so a
        // slot is always free here.
        let mut scratch = slots.take().unwrap_or_default();
        let (len, status) = execute(&mem, &disk, &chain, &mut scratch);

        if let Some((status_addr, _)) = chain.to_guest.last() {
            if let Err(e) = mem.write_obj(status, *status_addr) {
                warn!("failed to write block status byte: {}", e);
            }
        }

        {
            let mut locked = blk.lock().unwrap();
            locked.vq.add_used(&mem, chain.head_index, len);
            if locked.vq.needs_notification(&mem) {
                intr.signal_vring();
            }
        }

        slots.put(scratch);
    }
}

impl VirtioDevice for Blk {
    fn host_features(&self) -> u32 {
        1 << VIRTIO_BLK_F_SEG_MAX | 1 << VIRTIO_BLK_F_FLUSH
    }

    fn set_guest_features(&mut self, features: u32) {
        self.guest_features = features;
    }

    fn config_read(&self, offset: u64, data: &mut [u8]) {
        config_blob_read(&self.config, offset, data);
    }

    fn config_write(&mut self, offset: u64, data: &[u8]) {
        config_blob_write(&mut self.config, offset, data);
    }

    fn num_queues(&self) -> u16 {
        1
    }

    fn queue_max_size(&self, _index: u16) -> u16 {
        VIRTIO_BLK_QUEUE_SIZE
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
            warn!("notify for bogus block queue {}", index);
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

/// Create a block device for `disk` and put it on the buses.
pub fn install(
    io_registry: &mut IoRegistry,
    pci_bus: &Arc<Mutex<PciBus>>,
    irq_alloc: &mut IrqAllocator,
    vm_fd: &Arc<VmFd>,
    guest_memory: Arc<GuestMemoryMmap>,
    pool: &Arc<ThreadPool>,
    disk: Box<dyn DiskImage>,
) -> Result<()> {
    let assigned = irq_alloc.register_device()?;
    let intr = VirtioInterrupt::new(IrqLine::new(vm_fd.clone(), assigned.line));

    let blk = Arc::new(Mutex::new(Blk::new(
        guest_memory,
        Arc::from(disk),
        intr.clone(),
    )?));

    let job = {
        let blk = blk.clone();
        pool.add_job(move || process_queue(&blk))
    };
    {
        let mut locked = blk.lock().unwrap();
        locked.pool = Some(pool.clone());
        locked.job = Some(job);
    }

    pci::attach(
        io_registry,
        pci_bus,
        &assigned,
        blk,
        intr,
        PCI_DEVICE_ID_VIRTIO_BLK,
        VIRTIO_ID_BLOCK,
        0x010000,
    )?;
    Ok(())
}
