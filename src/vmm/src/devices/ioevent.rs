// SPDX-License-Identifier: Apache-2.0

//! Kernel-assisted queue notification.
//!
//! A guest write to QUEUE_NOTIFY normally costs a full port-I/O exit; an
//! ioeventfd turns it into an eventfd wakeup that bypasses the vCPU thread
//! entirely. Handlers collected here are attached to the event-manager loop
//! once the machine is assembled.

use std::sync::{Arc, Mutex};

use event_manager::{EventManager, EventOps, Events, MutEventSubscriber, SubscriberOps};
use kvm_ioctls::{IoEventAddress, VmFd};
use libc::EFD_NONBLOCK;
use log::warn;
use vmm_sys_util::epoll::EventSet;
use vmm_sys_util::eventfd::EventFd;

use crate::devices::virtio::pci::VIRTIO_PCI_QUEUE_NOTIFY_OFFSET;
use crate::devices::virtio::{Error, Result, VirtioDevice};

/// One eventfd bound to (BAR0 + QUEUE_NOTIFY, datamatch = queue index).
pub struct QueueNotifyHandler {
    event: EventFd,
    device: Arc<Mutex<dyn VirtioDevice>>,
    queue: u16,
}

impl MutEventSubscriber for QueueNotifyHandler {
    fn process(&mut self, events: Events, _ops: &mut EventOps) {
        if events.event_set() != EventSet::IN {
            return;
        }
        if let Err(e) = self.event.read() {
            warn!("ioeventfd read failed: {}", e);
            return;
        }
        self.device.lock().unwrap().notify_queue(self.queue);
    }

    fn init(&mut self, ops: &mut EventOps) {
        ops.add(Events::new(&self.event, EventSet::IN))
            .expect("failed to register ioeventfd with the event loop");
    }
}

/// Handlers created during device setup, waiting for the event loop.
pub struct IoeventRegistry {
    pending: Vec<Arc<Mutex<QueueNotifyHandler>>>,
}

impl IoeventRegistry {
    pub fn new() -> Self {
        IoeventRegistry {
            pending: Vec::new(),
        }
    }

    /// Wire `queue` of the device behind `base_port` to an eventfd.
    pub fn register(
        &mut self,
        vm_fd: &VmFd,
        base_port: u16,
        queue: u16,
        device: Arc<Mutex<dyn VirtioDevice>>,
    ) -> Result<()> {
        let event = EventFd::new(EFD_NONBLOCK).map_err(|source| Error::Backend {
            device: "ioeventfd",
            source,
        })?;

        vm_fd
            .register_ioevent(
                &event,
                &IoEventAddress::Pio(u64::from(base_port) + VIRTIO_PCI_QUEUE_NOTIFY_OFFSET),
                queue,
            )
            .map_err(Error::Ioevent)?;

        self.pending.push(Arc::new(Mutex::new(QueueNotifyHandler {
            event,
            device,
            queue,
        })));
        Ok(())
    }

    /// Hand every handler to the event-manager loop.
    pub fn attach_all(
        &mut self,
        event_manager: &mut EventManager<Arc<Mutex<dyn MutEventSubscriber>>>,
    ) {
        for handler in self.pending.drain(..) {
            let subscriber: Arc<Mutex<dyn MutEventSubscriber>> = handler;
            event_manager.add_subscriber(subscriber);
        }
    }
}
