// SPDX-License-Identifier: Apache-2.0

//! Legacy split-ring handling on top of `virtio-queue`.
//!
//! The guest hands over one page frame number per queue; descriptor table,
//! available ring and used ring all live at canonical offsets from it. A
//! popped chain comes back as host-side buffer lists, device-readable
//! buffers first, the way the device models consume them.

use log::warn;
use virtio_queue::{Queue, QueueOwnedT, QueueT};
use vm_memory::{Bytes, GuestAddress, GuestMemoryMmap};

use super::{Error, Result};

/// Ring alignment mandated by the legacy transport.
pub const VIRTIO_PCI_VRING_ALIGN: u64 = 4096;

/// One split virtqueue bound (or not yet bound) to guest pages.
pub struct Virtqueue {
    queue: Queue,
    pfn: u32,
    broken: bool,
}

impl Virtqueue {
    pub fn new(max_size: u16) -> Result<Self> {
        Ok(Virtqueue {
            queue: Queue::new(max_size).map_err(Error::Queue)?,
            pfn: 0,
            broken: false,
        })
    }

    pub fn max_size(&self) -> u16 {
        self.queue.max_size()
    }

    pub fn pfn(&self) -> u32 {
        self.pfn
    }

    pub fn ready(&self) -> bool {
        self.queue.ready() && !self.broken
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Unbind and forget everything the guest ever told us.
    pub fn reset(&mut self) {
        self.queue.reset();
        self.pfn = 0;
        self.broken = false;
    }

    /// Bind the ring to the page the driver wrote into QUEUE_PFN.
    /// A zero pfn unbinds, per the legacy contract.
    pub fn bind(&mut self, pfn: u32, guest_memory: &GuestMemoryMmap) -> Result<()> {
        if pfn == 0 {
            self.reset();
            return Ok(());
        }

        let base = u64::from(pfn) << 12;
        let size = u64::from(self.queue.max_size());
        let desc_table = base;
        let avail_ring = base + 16 * size;
        // Past the available ring's used_event word, rounded up.
        let used_ring = (avail_ring + 6 + 2 * size + VIRTIO_PCI_VRING_ALIGN - 1)
            & !(VIRTIO_PCI_VRING_ALIGN - 1);

        let max = self.queue.max_size();
        self.queue.set_size(max);
        self.queue
            .try_set_desc_table_address(GuestAddress(desc_table))
            .map_err(|_| Error::BadQueuePfn(pfn))?;
        self.queue
            .try_set_avail_ring_address(GuestAddress(avail_ring))
            .map_err(|_| Error::BadQueuePfn(pfn))?;
        self.queue
            .try_set_used_ring_address(GuestAddress(used_ring))
            .map_err(|_| Error::BadQueuePfn(pfn))?;
        self.queue.set_ready(true);

        if !self.queue.is_valid(guest_memory) {
            self.reset();
            self.broken = true;
            return Err(Error::BadQueuePfn(pfn));
        }

        self.pfn = pfn;
        self.broken = false;
        Ok(())
    }

    /// Pop one available chain. `None` means the ring is empty, unbound, or
    /// has been marked broken after a guest violation.
    pub fn pop(&mut self, guest_memory: &GuestMemoryMmap) -> Option<ChainBuffers> {
        if !self.ready() {
            return None;
        }

        let mut iter = match self.queue.iter(guest_memory) {
            Ok(iter) => iter,
            Err(e) => {
                warn!("available ring walk failed: {:?}; failing the queue", e);
                self.broken = true;
                return None;
            }
        };
        let chain = iter.next()?;

        let mut buffers = ChainBuffers {
            head_index: chain.head_index(),
            to_device: Vec::new(),
            to_guest: Vec::new(),
        };

        // The chain iterator bounds the walk by queue size, so a descriptor
        // cycle shows up as a truncated chain: the last descriptor we saw
        // still pointed at a next one.
        let mut truncated = true;
        for desc in chain {
            truncated = desc.has_next();
            if desc.is_write_only() {
                buffers.to_guest.push((desc.addr(), desc.len()));
            } else {
                buffers.to_device.push((desc.addr(), desc.len()));
            }
        }
        if truncated {
            warn!(
                "descriptor chain at head {} never terminates; failing the queue",
                buffers.head_index
            );
            self.broken = true;
            return None;
        }

        Some(buffers)
    }

    /// Publish a completion: used-ring entry, index bump, fences. The
    /// interrupt decision stays with the caller.
    pub fn add_used(&mut self, guest_memory: &GuestMemoryMmap, head_index: u16, len: u32) {
        if let Err(e) = self.queue.add_used(guest_memory, head_index, len) {
            warn!("failed to publish used element {}: {:?}", head_index, e);
        }
    }

    /// Whether the driver wants an interrupt for the last completion.
    pub fn needs_notification(&mut self, guest_memory: &GuestMemoryMmap) -> bool {
        self.queue.needs_notification(guest_memory).unwrap_or(true)
    }

    /// Whether the driver has published descriptors not yet popped.
    pub fn has_available(&mut self, guest_memory: &GuestMemoryMmap) -> bool {
        if !self.ready() {
            return false;
        }
        match self
            .queue
            .avail_idx(guest_memory, std::sync::atomic::Ordering::Acquire)
        {
            Ok(idx) => idx.0 != self.queue.next_avail(),
            Err(_) => false,
        }
    }
}

/// A popped descriptor chain, flattened to guest buffers.
/// `to_device` entries precede `to_guest` entries in descriptor order.
pub struct ChainBuffers {
    pub head_index: u16,
    pub to_device: Vec<(GuestAddress, u32)>,
    pub to_guest: Vec<(GuestAddress, u32)>,
}

impl ChainBuffers {
    pub fn out_len(&self) -> usize {
        self.to_device.iter().map(|(_, len)| *len as usize).sum()
    }

    pub fn in_len(&self) -> usize {
        self.to_guest.iter().map(|(_, len)| *len as usize).sum()
    }

    /// Gather every device-readable byte into one buffer.
    pub fn read_out(&self, guest_memory: &GuestMemoryMmap) -> Result<Vec<u8>> {
        let mut data = Vec::with_capacity(self.out_len());
        for (addr, len) in &self.to_device {
            let start = data.len();
            data.resize(start + *len as usize, 0);
            guest_memory
                .read_slice(&mut data[start..], *addr)
                .map_err(Error::GuestMemory)?;
        }
        Ok(data)
    }

    /// Scatter `data` across the device-writable buffers; the return value
    /// is what belongs in the used-ring length.
    pub fn write_in(&self, guest_memory: &GuestMemoryMmap, data: &[u8]) -> Result<u32> {
        let mut written = 0usize;
        for (addr, len) in &self.to_guest {
            if written == data.len() {
                break;
            }
            let take = std::cmp::min(*len as usize, data.len() - written);
            guest_memory
                .write_slice(&data[written..written + take], *addr)
                .map_err(Error::GuestMemory)?;
            written += take;
        }
        Ok(written as u32)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub const VRING_DESC_F_NEXT: u16 = 0x1;
    pub const VRING_DESC_F_WRITE: u16 = 0x2;

    /// Driver-side view of a bound legacy ring, for poking it the way a
    /// guest would.
    pub struct GuestRing {
        pub base: u64,
        pub size: u16,
    }

    impl GuestRing {
        pub fn write_desc(
            &self,
            mem: &GuestMemoryMmap,
            index: u16,
            addr: u64,
            len: u32,
            flags: u16,
            next: u16,
        ) {
            let desc = self.base + 16 * u64::from(index);
            mem.write_obj(addr, GuestAddress(desc)).unwrap();
            mem.write_obj(len, GuestAddress(desc + 8)).unwrap();
            mem.write_obj(flags, GuestAddress(desc + 12)).unwrap();
            mem.write_obj(next, GuestAddress(desc + 14)).unwrap();
        }

        pub fn publish_avail(&self, mem: &GuestMemoryMmap, head: u16) {
            let avail = self.base + 16 * u64::from(self.size);
            let idx: u16 = mem.read_obj(GuestAddress(avail + 2)).unwrap();
            mem.write_obj(
                head,
                GuestAddress(avail + 4 + 2 * u64::from(idx % self.size)),
            )
            .unwrap();
            mem.write_obj(idx.wrapping_add(1), GuestAddress(avail + 2))
                .unwrap();
        }

        pub fn used_idx(&self, mem: &GuestMemoryMmap) -> u16 {
            mem.read_obj(GuestAddress(self.used_base() + 2)).unwrap()
        }

        pub fn used_entry(&self, mem: &GuestMemoryMmap, slot: u16) -> (u32, u32) {
            let entry = self.used_base() + 4 + 8 * u64::from(slot % self.size);
            (
                mem.read_obj(GuestAddress(entry)).unwrap(),
                mem.read_obj(GuestAddress(entry + 4)).unwrap(),
            )
        }

        fn used_base(&self) -> u64 {
            let avail_end = self.base + 16 * u64::from(self.size) + 6 + 2 * u64::from(self.size);
            (avail_end + VIRTIO_PCI_VRING_ALIGN - 1) & !(VIRTIO_PCI_VRING_ALIGN - 1)
        }
    }

    pub fn mem() -> GuestMemoryMmap {
        crate::memory::create_guest_memory(64 << 20).unwrap()
    }

    pub fn bound_queue(mem: &GuestMemoryMmap, size: u16, pfn: u32) -> (Virtqueue, GuestRing) {
        let mut vq = Virtqueue::new(size).unwrap();
        vq.bind(pfn, mem).unwrap();
        (
            vq,
            GuestRing {
                base: u64::from(pfn) << 12,
                size,
            },
        )
    }

    #[test]
    fn completions_come_back_in_order() {
        let mem = mem();
        let (mut vq, ring) = bound_queue(&mem, 4, 0x100);

        // Three single-descriptor chains, made available in order.
        for i in 0..3u16 {
            ring.write_desc(&mem, i, 0x2000 + u64::from(i) * 0x100, 64, 0, 0);
            ring.publish_avail(&mem, i);
        }

        for expect_head in 0..3u16 {
            let chain = vq.pop(&mem).unwrap();
            assert_eq!(chain.head_index, expect_head);
            vq.add_used(&mem, chain.head_index, u32::from(expect_head) + 10);
        }
        assert!(vq.pop(&mem).is_none());

        assert_eq!(ring.used_idx(&mem), 3);
        for slot in 0..3u16 {
            assert_eq!(
                ring.used_entry(&mem, slot),
                (u32::from(slot), u32::from(slot) + 10)
            );
        }
    }

    #[test]
    fn chain_classification_and_data() {
        let mem = mem();
        let (mut vq, ring) = bound_queue(&mem, 4, 0x100);

        // desc0: out header, desc1: in buffer, desc2: in status byte.
        ring.write_desc(&mem, 0, 0x3000, 16, VRING_DESC_F_NEXT, 1);
        ring.write_desc(&mem, 1, 0x4000, 32, VRING_DESC_F_NEXT | VRING_DESC_F_WRITE, 2);
        ring.write_desc(&mem, 2, 0x5000, 1, VRING_DESC_F_WRITE, 0);
        mem.write_slice(&[0xaau8; 16], GuestAddress(0x3000)).unwrap();
        ring.publish_avail(&mem, 0);

        let chain = vq.pop(&mem).unwrap();
        assert_eq!(chain.to_device.len(), 1);
        assert_eq!(chain.to_guest.len(), 2);
        assert_eq!(chain.out_len(), 16);
        assert_eq!(chain.in_len(), 33);
        assert_eq!(chain.read_out(&mem).unwrap(), vec![0xaa; 16]);

        let written = chain.write_in(&mem, &[0x55u8; 40]).unwrap();
        assert_eq!(written, 33);
        let mut probe = [0u8; 32];
        mem.read_slice(&mut probe, GuestAddress(0x4000)).unwrap();
        assert_eq!(probe, [0x55; 32]);
    }

    #[test]
    fn descriptor_cycle_breaks_the_queue() {
        let mem = mem();
        let (mut vq, ring) = bound_queue(&mem, 4, 0x100);

        ring.write_desc(&mem, 0, 0x3000, 8, VRING_DESC_F_NEXT, 1);
        ring.write_desc(&mem, 1, 0x3000, 8, VRING_DESC_F_NEXT, 0);
        ring.publish_avail(&mem, 0);

        assert!(vq.pop(&mem).is_none());
        assert!(vq.is_broken());

        // Further notifies find nothing to do.
        ring.publish_avail(&mem, 0);
        assert!(vq.pop(&mem).is_none());
    }

    #[test]
    fn zero_pfn_unbinds() {
        let mem = mem();
        let (mut vq, _) = bound_queue(&mem, 4, 0x100);
        assert!(vq.ready());
        assert_eq!(vq.pfn(), 0x100);

        vq.bind(0, &mem).unwrap();
        assert!(!vq.ready());
        assert_eq!(vq.pfn(), 0);
    }
}
