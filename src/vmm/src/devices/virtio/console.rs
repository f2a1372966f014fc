// SPDX-License-Identifier: Apache-2.0

//! Virtio console, single port.
//!
//! TX chains are drained to the terminal sink by a threadpool job. RX is
//! polled: the 1 ms platform tick posts the RX job, which moves any bytes
//! the terminal router queued into one descriptor chain.

use std::collections::VecDeque;
use std::io::Write;
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
    config_blob_read, pci, Error, Result, VirtioDevice, VirtioInterrupt,
    PCI_DEVICE_ID_VIRTIO_CONSOLE, VIRTIO_ID_CONSOLE,
};

pub const VIRTIO_CONSOLE_QUEUE_SIZE: u16 = 128;
const RX_QUEUE: u16 = 0;
const TX_QUEUE: u16 = 1;

pub struct Console {
    guest_memory: Arc<GuestMemoryMmap>,
    intr: VirtioInterrupt,
    vqs: [Virtqueue; 2],
    config: Vec<u8>,
    guest_features: u32,
    sink: Box<dyn Write + Send>,
    pending_input: VecDeque<u8>,
    pool: Option<Arc<ThreadPool>>,
    jobs: [Option<JobHandle>; 2],
}

impl Console {
    pub fn new(
        guest_memory: Arc<GuestMemoryMmap>,
        intr: VirtioInterrupt,
        sink: Box<dyn Write + Send>,
    ) -> Result<Self> {
        // cols, rows, max_nr_ports.
        let mut config = Vec::with_capacity(8);
        config.extend_from_slice(&80u16.to_le_bytes());
        config.extend_from_slice(&24u16.to_le_bytes());
        config.extend_from_slice(&1u32.to_le_bytes());

        Ok(Console {
            guest_memory,
            intr,
            vqs: [
                Virtqueue::new(VIRTIO_CONSOLE_QUEUE_SIZE)?,
                Virtqueue::new(VIRTIO_CONSOLE_QUEUE_SIZE)?,
            ],
            config,
            guest_features: 0,
            sink,
            pending_input: VecDeque::new(),
            pool: None,
            jobs: [None, None],
        })
    }

    /// Bytes typed on the host side, waiting for guest RX buffers.
    pub fn queue_input(&mut self, bytes: &[u8]) {
        self.pending_input.extend(bytes);
    }
}

/// Write every TX chain to the sink. Runs as a threadpool job.
pub(crate) fn process_tx(console: &Arc<Mutex<Console>>) {
    let mem = console.lock().unwrap().guest_memory.clone();
    let intr = console.lock().unwrap().intr.clone();

    let mut drained = false;
    loop {
        let mut locked = console.lock().unwrap();
        let chain = match locked.vqs[TX_QUEUE as usize].pop(&mem) {
            Some(chain) => chain,
            None => break,
        };
        let bytes = match chain.read_out(&mem) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("console tx chain unreadable: {}", e);
                locked.vqs[TX_QUEUE as usize].add_used(&mem, chain.head_index, 0);
                continue;
            }
        };
        if let Err(e) = locked.sink.write_all(&bytes).and_then(|_| locked.sink.flush()) {
            warn!("console sink write failed: {}", e);
        }
        locked.vqs[TX_QUEUE as usize].add_used(&mem, chain.head_index, bytes.len() as u32);
        drained = true;
    }

    let mut locked = console.lock().unwrap();
    if drained && locked.vqs[TX_QUEUE as usize].needs_notification(&mem) {
        intr.signal_vring();
    }
}

/// Move queued host input into one RX chain, if both sides are ready.
/// Posted by the periodic tick and by RX queue notifies.
pub(crate) fn process_rx(console: &Arc<Mutex<Console>>) {
    let mem = console.lock().unwrap().guest_memory.clone();

    let mut locked = console.lock().unwrap();
    if locked.pending_input.is_empty() {
        return;
    }
    let chain = match locked.vqs[RX_QUEUE as usize].pop(&mem) {
        Some(chain) => chain,
        None => return,
    };

    let take = std::cmp::min(chain.in_len(), locked.pending_input.len());
    let bytes: Vec<u8> = locked.pending_input.drain(..take).collect();
    let written = chain.write_in(&mem, &bytes).unwrap_or(0);

    locked.vqs[RX_QUEUE as usize].add_used(&mem, chain.head_index, written);
    let intr = locked.intr.clone();
    if locked.vqs[RX_QUEUE as usize].needs_notification(&mem) {
        intr.signal_vring();
    }
}

impl VirtioDevice for Console {
    fn host_features(&self) -> u32 {
        0
    }

    fn set_guest_features(&mut self, features: u32) {
        self.guest_features = features;
    }

    fn config_read(&self, offset: u64, data: &mut [u8]) {
        config_blob_read(&self.config, offset, data);
    }

    fn config_write(&mut self, _offset: u64, _data: &[u8]) {}

    fn num_queues(&self) -> u16 {
        2
    }

    fn queue_max_size(&self, _index: u16) -> u16 {
        VIRTIO_CONSOLE_QUEUE_SIZE
    }

    fn init_queue(&mut self, index: u16, pfn: u32) -> Result<()> {
        let vq = self
            .vqs
            .get_mut(index as usize)
            .ok_or(Error::BadQueueIndex(index))?;
        let mem = self.guest_memory.clone();
        vq.bind(pfn, &mem)
    }

    fn queue_pfn(&self, index: u16) -> u32 {
        self.vqs.get(index as usize).map(Virtqueue::pfn).unwrap_or(0)
    }

    fn notify_queue(&mut self, index: u16) {
        let job = match self.jobs.get(index as usize) {
            Some(Some(job)) => job.clone(),
            _ => {
                warn!("notify for bogus console queue {}", index);
                return;
            }
        };
        if let Some(pool) = &self.pool {
            pool.do_job(&job);
        }
    }

    fn reset(&mut self) {
        for vq in self.vqs.iter_mut() {
            vq.reset();
        }
        self.guest_features = 0;
        self.pending_input.clear();
    }
}

/// A live console: `tick` is called from the periodic timer, `queue_input`
/// from the terminal router.
pub struct ConsoleHandle {
    console: Arc<Mutex<Console>>,
    pool: Arc<ThreadPool>,
    rx_job: JobHandle,
}

impl ConsoleHandle {
    pub fn tick(&self) {
        self.pool.do_job(&self.rx_job);
    }

    pub fn queue_input(&self, bytes: &[u8]) {
        self.console.lock().unwrap().queue_input(bytes);
    }
}

/// Create the console device and put it on the buses.
pub fn install(
    io_registry: &mut IoRegistry,
    pci_bus: &Arc<Mutex<PciBus>>,
    irq_alloc: &mut IrqAllocator,
    vm_fd: &Arc<VmFd>,
    guest_memory: Arc<GuestMemoryMmap>,
    pool: &Arc<ThreadPool>,
    sink: Box<dyn Write + Send>,
) -> Result<ConsoleHandle> {
    let assigned = irq_alloc.register_device()?;
    let intr = VirtioInterrupt::new(IrqLine::new(vm_fd.clone(), assigned.line));

    let console = Arc::new(Mutex::new(Console::new(guest_memory, intr.clone(), sink)?));
    let rx_job = {
        let console = console.clone();
        pool.add_job(move || process_rx(&console))
    };
    let tx_job = {
        let console = console.clone();
        pool.add_job(move || process_tx(&console))
    };
    {
        let mut locked = console.lock().unwrap();
        locked.pool = Some(pool.clone());
        locked.jobs = [Some(rx_job.clone()), Some(tx_job)];
    }

    pci::attach(
        io_registry,
        pci_bus,
        &assigned,
        console.clone(),
        intr,
        PCI_DEVICE_ID_VIRTIO_CONSOLE,
        VIRTIO_ID_CONSOLE,
        0x078000,
    )?;

    Ok(ConsoleHandle {
        console,
        pool: pool.clone(),
        rx_job,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::virtio::queue::tests::{GuestRing, VRING_DESC_F_WRITE};
    use vm_memory::{Bytes, GuestAddress};

    const RX_PFN: u32 = 0x180;
    const TX_PFN: u32 = 0x1c0;

    #[derive(Clone, Default)]
    struct SharedSink(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn console_under_test() -> (
        Arc<GuestMemoryMmap>,
        Arc<Mutex<Console>>,
        SharedSink,
        GuestRing,
        GuestRing,
    ) {
        let mem = Arc::new(crate::memory::create_guest_memory(64 << 20).unwrap());
        let sink = SharedSink::default();
        let console = Arc::new(Mutex::new(
            Console::new(
                mem.clone(),
                VirtioInterrupt::disconnected(),
                Box::new(sink.clone()),
            )
            .unwrap(),
        ));
        {
            let mut locked = console.lock().unwrap();
            locked.init_queue(RX_QUEUE, RX_PFN).unwrap();
            locked.init_queue(TX_QUEUE, TX_PFN).unwrap();
        }
        let rx_ring = GuestRing {
            base: u64::from(RX_PFN) << 12,
            size: VIRTIO_CONSOLE_QUEUE_SIZE,
        };
        let tx_ring = GuestRing {
            base: u64::from(TX_PFN) << 12,
            size: VIRTIO_CONSOLE_QUEUE_SIZE,
        };
        (mem, console, sink, rx_ring, tx_ring)
    }

    #[test]
    fn tx_drains_to_the_sink() {
        let (mem, console, sink, _rx, tx_ring) = console_under_test();

        mem.write_slice(b"hello, guest\n", GuestAddress(0x3000)).unwrap();
        tx_ring.write_desc(&mem, 0, 0x3000, 13, 0, 0);
        tx_ring.publish_avail(&mem, 0);

        process_tx(&console);

        assert_eq!(sink.0.lock().unwrap().as_slice(), b"hello, guest\n");
        assert_eq!(tx_ring.used_idx(&mem), 1);
    }

    #[test]
    fn rx_waits_for_both_bytes_and_buffers() {
        let (mem, console, _sink, rx_ring, _tx) = console_under_test();

        // Buffers but no bytes: nothing happens.
        rx_ring.write_desc(&mem, 0, 0x5000, 64, VRING_DESC_F_WRITE, 0);
        rx_ring.publish_avail(&mem, 0);
        process_rx(&console);
        assert_eq!(rx_ring.used_idx(&mem), 0);

        console.lock().unwrap().queue_input(b"ls\n");
        process_rx(&console);

        assert_eq!(rx_ring.used_idx(&mem), 1);
        assert_eq!(rx_ring.used_entry(&mem, 0), (0, 3));
        let mut got = [0u8; 3];
        mem.read_slice(&mut got, GuestAddress(0x5000)).unwrap();
        assert_eq!(&got, b"ls\n");
    }

    #[test]
    fn config_reports_a_single_port() {
        let (_mem, console, _sink, _rx, _tx) = console_under_test();
        let mut cfg = [0u8; 8];
        console.lock().unwrap().config_read(0, &mut cfg);
        assert_eq!(u16::from_le_bytes([cfg[0], cfg[1]]), 80);
        assert_eq!(u16::from_le_bytes([cfg[2], cfg[3]]), 24);
        assert_eq!(u32::from_le_bytes([cfg[4], cfg[5], cfg[6], cfg[7]]), 1);
    }
}
