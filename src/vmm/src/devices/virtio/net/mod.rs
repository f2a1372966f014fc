// SPDX-License-Identifier: Apache-2.0

//! Virtio network device.
//!
//! Two queues, two dedicated threads. The TX thread drains guest frames
//! into the backend; the RX thread blocks on the backend and copies frames
//! into posted buffers. QUEUE_NOTIFY (by port exit or ioeventfd) only ever
//! nudges a condition variable.

pub mod tap;
pub mod uip;

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use kvm_ioctls::VmFd;
use log::warn;
use virtio_bindings::bindings::virtio_net::{
    VIRTIO_NET_F_CSUM, VIRTIO_NET_F_GUEST_TSO4, VIRTIO_NET_F_GUEST_TSO6, VIRTIO_NET_F_GUEST_UFO,
    VIRTIO_NET_F_HOST_TSO4, VIRTIO_NET_F_HOST_TSO6, VIRTIO_NET_F_HOST_UFO, VIRTIO_NET_F_MAC,
    VIRTIO_NET_S_LINK_UP,
};
use vm_memory::GuestMemoryMmap;

use crate::devices::ioevent;
use crate::devices::irq::{IrqAllocator, IrqLine};
use crate::devices::pci::PciBus;
use crate::devices::registry::IoRegistry;

use super::queue::Virtqueue;
use super::{
    config_blob_read, config_blob_write, pci, Error, Result, VirtioDevice, VirtioInterrupt,
    PCI_DEVICE_ID_VIRTIO_NET, VIRTIO_ID_NET,
};

pub const VIRTIO_NET_QUEUE_SIZE: u16 = 128;
const RX_QUEUE: u16 = 0;
const TX_QUEUE: u16 = 1;

/// Size of the legacy `virtio_net_hdr` that frames a packet on the ring
/// (and on a VNET_HDR tap).
pub const VIRTIO_NET_HDR_SIZE: usize = 10;

/// Largest frame a backend may hand us: 64K of TSO payload plus headers.
const MAX_FRAME_SIZE: usize = 65565;

/// A frame mover. `rx` blocks until a frame is available; both ends carry
/// the virtio-net header.
pub trait NetBackend: Send + Sync {
    fn rx(&self, frame: &mut [u8]) -> io::Result<usize>;
    fn tx(&self, frame: &[u8]) -> io::Result<usize>;
}

/// Wakeup channel between the notify path and a queue thread.
struct NetSignal {
    flag: Mutex<bool>,
    cond: Condvar,
}

impl NetSignal {
    fn new() -> Self {
        NetSignal {
            flag: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    fn signal(&self) {
        *self.flag.lock().unwrap() = true;
        self.cond.notify_one();
    }

    fn wait(&self) {
        let mut flag = self.flag.lock().unwrap();
        while !*flag {
            flag = self.cond.wait(flag).unwrap();
        }
        *flag = false;
    }
}

pub struct Net {
    guest_memory: Arc<GuestMemoryMmap>,
    intr: VirtioInterrupt,
    vqs: [Virtqueue; 2],
    config: Vec<u8>,
    guest_features: u32,
    rx_signal: Arc<NetSignal>,
    tx_signal: Arc<NetSignal>,
}

impl Net {
    pub fn new(
        guest_memory: Arc<GuestMemoryMmap>,
        intr: VirtioInterrupt,
        mac: [u8; 6],
    ) -> Result<Self> {
        let mut config = Vec::with_capacity(8);
        config.extend_from_slice(&mac);
        config.extend_from_slice(&(VIRTIO_NET_S_LINK_UP as u16).to_le_bytes());

        Ok(Net {
            guest_memory,
            intr,
            vqs: [
                Virtqueue::new(VIRTIO_NET_QUEUE_SIZE)?,
                Virtqueue::new(VIRTIO_NET_QUEUE_SIZE)?,
            ],
            config,
            guest_features: 0,
            rx_signal: Arc::new(NetSignal::new()),
            tx_signal: Arc::new(NetSignal::new()),
        })
    }
}

impl VirtioDevice for Net {
    fn host_features(&self) -> u32 {
        1 << VIRTIO_NET_F_MAC
            | 1 << VIRTIO_NET_F_CSUM
            | 1 << VIRTIO_NET_F_HOST_UFO
            | 1 << VIRTIO_NET_F_HOST_TSO4
            | 1 << VIRTIO_NET_F_HOST_TSO6
            | 1 << VIRTIO_NET_F_GUEST_UFO
            | 1 << VIRTIO_NET_F_GUEST_TSO4
            | 1 << VIRTIO_NET_F_GUEST_TSO6
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
        2
    }

    fn queue_max_size(&self, _index: u16) -> u16 {
        VIRTIO_NET_QUEUE_SIZE
    }

    fn init_queue(&mut self, index: u16, pfn: u32) -> Result<()> {
        let mem = self.guest_memory.clone();
        self.vqs
            .get_mut(index as usize)
            .ok_or(Error::BadQueueIndex(index))?
            .bind(pfn, &mem)?;
        // The RX thread may already be waiting for buffers.
        if index == RX_QUEUE {
            self.rx_signal.signal();
        }
        Ok(())
    }

    fn queue_pfn(&self, index: u16) -> u32 {
        self.vqs.get(index as usize).map(Virtqueue::pfn).unwrap_or(0)
    }

    fn notify_queue(&mut self, index: u16) {
        match index {
            RX_QUEUE => self.rx_signal.signal(),
            TX_QUEUE => self.tx_signal.signal(),
            other => warn!("notify for bogus net queue {}", other),
        }
    }

    fn reset(&mut self) {
        for vq in self.vqs.iter_mut() {
            vq.reset();
        }
        self.guest_features = 0;
    }
}

/// Push every pending TX frame into the backend.
pub(crate) fn drain_tx(
    net: &Arc<Mutex<Net>>,
    backend: &Arc<dyn NetBackend>,
    guest_memory: &GuestMemoryMmap,
    intr: &VirtioInterrupt,
) {
    loop {
        let (chain, frame) = {
            let mut locked = net.lock().unwrap();
            let chain = match locked.vqs[TX_QUEUE as usize].pop(guest_memory) {
                Some(chain) => chain,
                None => break,
            };
            let frame = chain.read_out(guest_memory);
            (chain, frame)
        };

        let sent = match frame {
            Ok(frame) => match backend.tx(&frame) {
                Ok(n) => n as u32,
                Err(e) => {
                    warn!("net tx failed: {}", e);
                    0
                }
            },
            Err(e) => {
                warn!("net tx chain unreadable: {}", e);
                0
            }
        };

        net.lock()
            .unwrap()
            .vqs[TX_QUEUE as usize]
            .add_used(guest_memory, chain.head_index, sent);
    }

    let mut locked = net.lock().unwrap();
    if locked.vqs[TX_QUEUE as usize].needs_notification(guest_memory) {
        intr.signal_vring();
    }
}

/// Copy one received frame into the next posted RX chain.
pub(crate) fn deliver_rx_frame(
    net: &Arc<Mutex<Net>>,
    guest_memory: &GuestMemoryMmap,
    intr: &VirtioInterrupt,
    frame: &[u8],
) -> bool {
    let mut locked = net.lock().unwrap();
    let chain = match locked.vqs[RX_QUEUE as usize].pop(guest_memory) {
        Some(chain) => chain,
        None => {
            warn!("rx frame dropped, no guest buffers");
            return false;
        }
    };

    let written = chain.write_in(guest_memory, frame).unwrap_or(0);
    if (written as usize) < frame.len() {
        warn!("rx frame truncated from {} to {} bytes", frame.len(), written);
    }
    locked.vqs[RX_QUEUE as usize].add_used(guest_memory, chain.head_index, written);

    // Interrupt per frame, anything else hurts latency.
    if locked.vqs[RX_QUEUE as usize].needs_notification(guest_memory) {
        intr.signal_vring();
    }
    true
}

fn rx_thread(
    net: Arc<Mutex<Net>>,
    backend: Arc<dyn NetBackend>,
    guest_memory: Arc<GuestMemoryMmap>,
    intr: VirtioInterrupt,
    stop: Arc<AtomicBool>,
) {
    let signal = net.lock().unwrap().rx_signal.clone();
    let mut frame = vec![0u8; MAX_FRAME_SIZE];

    while !stop.load(Ordering::Acquire) {
        // No point reading a frame we could only drop.
        while !net.lock().unwrap().vqs[RX_QUEUE as usize].has_available(&guest_memory) {
            if stop.load(Ordering::Acquire) {
                return;
            }
            signal.wait();
        }

        match backend.rx(&mut frame) {
            Ok(n) if n > 0 => {
                deliver_rx_frame(&net, &guest_memory, &intr, &frame[..n]);
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                // RX errors complete nothing; the guest only sees silence.
                warn!("net rx failed: {}", e);
            }
        }
    }
}

fn tx_thread(
    net: Arc<Mutex<Net>>,
    backend: Arc<dyn NetBackend>,
    guest_memory: Arc<GuestMemoryMmap>,
    intr: VirtioInterrupt,
    stop: Arc<AtomicBool>,
) {
    let signal = net.lock().unwrap().tx_signal.clone();
    while !stop.load(Ordering::Acquire) {
        signal.wait();
        drain_tx(&net, &backend, &guest_memory, &intr);
    }
}

/// Create a NIC over `backend` and put it on the buses.
pub fn install(
    io_registry: &mut IoRegistry,
    pci_bus: &Arc<Mutex<PciBus>>,
    irq_alloc: &mut IrqAllocator,
    vm_fd: &Arc<VmFd>,
    guest_memory: Arc<GuestMemoryMmap>,
    backend: Arc<dyn NetBackend>,
    mac: [u8; 6],
    ioevents: &mut ioevent::IoeventRegistry,
    stop: Arc<AtomicBool>,
) -> Result<()> {
    let assigned = irq_alloc.register_device()?;
    let intr = VirtioInterrupt::new(IrqLine::new(vm_fd.clone(), assigned.line));

    let net = Arc::new(Mutex::new(Net::new(
        guest_memory.clone(),
        intr.clone(),
        mac,
    )?));

    let base = pci::attach(
        io_registry,
        pci_bus,
        &assigned,
        net.clone(),
        intr.clone(),
        PCI_DEVICE_ID_VIRTIO_NET,
        VIRTIO_ID_NET,
        0x020000,
    )?;

    // Kernel-assisted queue notify for both queues.
    for queue in [RX_QUEUE, TX_QUEUE] {
        ioevents.register(vm_fd, base, queue, net.clone())?;
    }

    {
        let net = net.clone();
        let backend = backend.clone();
        let guest_memory = guest_memory.clone();
        let intr = intr.clone();
        let stop = stop.clone();
        thread::Builder::new()
            .name("virtio-net-rx".to_string())
            .spawn(move || rx_thread(net, backend, guest_memory, intr, stop))
            .map_err(|source| Error::Backend {
                device: "net",
                source,
            })?;
    }
    thread::Builder::new()
        .name("virtio-net-tx".to_string())
        .spawn(move || tx_thread(net, backend, guest_memory, intr, stop))
        .map_err(|source| Error::Backend {
            device: "net",
            source,
        })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::virtio::queue::tests::{GuestRing, VRING_DESC_F_WRITE};
    use vm_memory::{Bytes, GuestAddress};

    const RX_PFN: u32 = 0x300;
    const TX_PFN: u32 = 0x340;

    #[derive(Default)]
    struct RecordingBackend {
        sent: Mutex<Vec<Vec<u8>>>,
    }

    impl NetBackend for RecordingBackend {
        fn rx(&self, _frame: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::from_raw_os_error(libc::EAGAIN))
        }
        fn tx(&self, frame: &[u8]) -> io::Result<usize> {
            self.sent.lock().unwrap().push(frame.to_vec());
            Ok(frame.len())
        }
    }

    fn net_under_test() -> (
        Arc<GuestMemoryMmap>,
        Arc<Mutex<Net>>,
        VirtioInterrupt,
        GuestRing,
        GuestRing,
    ) {
        let mem = Arc::new(crate::memory::create_guest_memory(64 << 20).unwrap());
        let intr = VirtioInterrupt::disconnected();
        let net = Arc::new(Mutex::new(
            Net::new(mem.clone(), intr.clone(), [2, 0, 0, 0, 0, 1]).unwrap(),
        ));
        {
            let mut locked = net.lock().unwrap();
            locked.init_queue(RX_QUEUE, RX_PFN).unwrap();
            locked.init_queue(TX_QUEUE, TX_PFN).unwrap();
        }
        let rx_ring = GuestRing {
            base: u64::from(RX_PFN) << 12,
            size: VIRTIO_NET_QUEUE_SIZE,
        };
        let tx_ring = GuestRing {
            base: u64::from(TX_PFN) << 12,
            size: VIRTIO_NET_QUEUE_SIZE,
        };
        (mem, net, intr, rx_ring, tx_ring)
    }

    #[test]
    fn tx_frames_reach_the_backend() {
        let (mem, net, intr, _rx, tx_ring) = net_under_test();
        let backend = Arc::new(RecordingBackend::default());
        let dyn_backend: Arc<dyn NetBackend> = backend.clone();

        let mut frame = vec![0u8; VIRTIO_NET_HDR_SIZE];
        frame.extend_from_slice(b"\xff\xff\xff\xff\xff\xff\x02\x00\x00\x00\x00\x01\x08\x00etc");
        mem.write_slice(&frame, GuestAddress(0x3000)).unwrap();
        tx_ring.write_desc(&mem, 0, 0x3000, frame.len() as u32, 0, 0);
        tx_ring.publish_avail(&mem, 0);

        drain_tx(&net, &dyn_backend, &mem, &intr);

        let sent = backend.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0], frame);
        assert_eq!(tx_ring.used_idx(&mem), 1);
        assert_eq!(intr.read_and_clear(), 1);
    }

    #[test]
    fn rx_frame_lands_in_guest_buffers() {
        let (mem, net, intr, rx_ring, _tx) = net_under_test();

        rx_ring.write_desc(&mem, 0, 0x5000, 2048, VRING_DESC_F_WRITE, 0);
        rx_ring.publish_avail(&mem, 0);
        assert!(net.lock().unwrap().vqs[0].has_available(&mem));

        let mut frame = vec![0u8; VIRTIO_NET_HDR_SIZE];
        frame.extend_from_slice(b"ping");
        assert!(deliver_rx_frame(&net, &mem, &intr, &frame));

        assert_eq!(rx_ring.used_idx(&mem), 1);
        assert_eq!(rx_ring.used_entry(&mem, 0).1, frame.len() as u32);
        let mut got = vec![0u8; frame.len()];
        mem.read_slice(&mut got, GuestAddress(0x5000)).unwrap();
        assert_eq!(got, frame);
        assert_eq!(intr.read_and_clear(), 1);
    }

    #[test]
    fn rx_without_buffers_drops() {
        let (mem, net, intr, _rx, _tx) = net_under_test();
        assert!(!deliver_rx_frame(&net, &mem, &intr, b"dropped"));
        assert_eq!(intr.read_and_clear(), 0);
    }

    #[test]
    fn mac_is_in_config_space() {
        let (_mem, net, _intr, _rx, _tx) = net_under_test();
        let mut mac = [0u8; 6];
        net.lock().unwrap().config_read(0, &mut mac);
        assert_eq!(mac, [2, 0, 0, 0, 0, 1]);
        let mut status = [0u8; 2];
        net.lock().unwrap().config_read(6, &mut status);
        assert_eq!(u16::from_le_bytes(status), VIRTIO_NET_S_LINK_UP as u16);
    }
}
