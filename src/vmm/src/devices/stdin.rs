// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Routes host terminal input to whichever console the guest is using:
//! the 8250 (which raises its own irqfd) or the virtio console (which the
//! periodic tick flushes into the RX ring).

use std::io::Read;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::{Arc, Mutex};

use event_manager::{EventOps, Events, MutEventSubscriber};
use log::warn;
use vmm_sys_util::epoll::EventSet;

use crate::devices::serial::SerialConsole;
use crate::devices::virtio::console::ConsoleHandle;

const STDIN_DATA: u32 = 0;

/// Which console transport the guest was booted with.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ActiveConsole {
    Serial,
    Virtio,
}

struct FdWrapper(RawFd);

impl AsRawFd for FdWrapper {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

pub struct StdinRouter {
    serial: Arc<Mutex<SerialConsole>>,
    console: Option<Arc<ConsoleHandle>>,
    active: ActiveConsole,
    stdin_fd: FdWrapper,
}

impl StdinRouter {
    pub fn new(
        serial: Arc<Mutex<SerialConsole>>,
        console: Option<Arc<ConsoleHandle>>,
        active: ActiveConsole,
    ) -> Self {
        StdinRouter {
            serial,
            console,
            active,
            stdin_fd: FdWrapper(libc::STDIN_FILENO),
        }
    }
}

impl MutEventSubscriber for StdinRouter {
    fn process(&mut self, events: Events, ops: &mut EventOps) {
        if events.event_set() != EventSet::IN || events.data() != STDIN_DATA {
            return;
        }

        let mut out = [0u8; 64];
        match std::io::stdin().read(&mut out) {
            Ok(0) => {
                // EOF: nothing more will ever arrive.
                let _ = ops.remove(Events::empty(&self.stdin_fd));
            }
            Ok(n) => match self.active {
                ActiveConsole::Serial => {
                    self.serial.lock().unwrap().enqueue_input(&out[..n]);
                }
                ActiveConsole::Virtio => {
                    if let Some(console) = &self.console {
                        console.queue_input(&out[..n]);
                    }
                }
            },
            Err(e) => warn!("failed to read stdin: {}", e),
        }
    }

    fn init(&mut self, ops: &mut EventOps) {
        ops.add(Events::with_data(&self.stdin_fd, STDIN_DATA, EventSet::IN))
            .expect("unable to add stdin event");
    }
}
