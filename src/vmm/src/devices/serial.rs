// SPDX-License-Identifier: Apache-2.0

//! The 8250 UART at 0x3f8, interrupt line 4.
//!
//! vm-superio does the register emulation; this wrapper wires its trigger
//! to a KVM irqfd and puts the device on the port bus.

use std::io::{Error, Result, Write};
use std::ops::Deref;

use log::{debug, warn};
use vm_device::bus::PioAddress;
use vm_device::MutDevicePio;
use vm_superio::serial::NoEvents;
use vm_superio::{Serial, Trigger};
use vmm_sys_util::eventfd::EventFd;

pub const SERIAL_PORT_BASE: u16 = 0x3f8;
pub const SERIAL_PORT_SIZE: u16 = 8;
/// ISA interrupt line of COM1.
pub const SERIAL_IRQ: u32 = 4;

pub struct EventFdTrigger(EventFd);

impl Trigger for EventFdTrigger {
    type E = Error;

    fn trigger(&self) -> Result<()> {
        self.write(1)
    }
}

impl Deref for EventFdTrigger {
    type Target = EventFd;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl EventFdTrigger {
    pub fn new(flag: i32) -> Result<Self> {
        Ok(EventFdTrigger(EventFd::new(flag)?))
    }
    pub fn try_clone(&self) -> Result<Self> {
        Ok(EventFdTrigger((**self).try_clone()?))
    }
}

pub struct SerialConsole {
    // The eventfd the device pulls to interrupt the guest; also registered
    // as an irqfd on SERIAL_IRQ.
    eventfd: EventFdTrigger,

    // The actual 8250.
    pub serial: Serial<EventFdTrigger, NoEvents, Box<dyn Write + Send>>,
}

impl SerialConsole {
    pub fn new(output: Box<dyn Write + Send>) -> Result<Self> {
        let eventfd = EventFdTrigger::new(libc::EFD_NONBLOCK)?;

        Ok(SerialConsole {
            eventfd: eventfd.try_clone()?,
            serial: Serial::new(eventfd.try_clone()?, output),
        })
    }

    pub fn eventfd(&self) -> Result<EventFd> {
        Ok(self.eventfd.try_clone()?.0)
    }

    /// Host-side input headed for the guest.
    pub fn enqueue_input(&mut self, bytes: &[u8]) {
        if let Err(e) = self.serial.enqueue_raw_bytes(bytes) {
            warn!("serial input dropped: {:?}", e);
        }
    }

    /// Nudge the guest's magic-sysrq handler. A real UART would raise a
    /// break condition first; the emulated line feeds the key directly.
    pub fn inject_sysrq(&mut self, key: u8) {
        debug!("injecting sysrq '{}' on the serial console", key as char);
        self.enqueue_input(&[key]);
    }
}

impl MutDevicePio for SerialConsole {
    fn pio_read(&mut self, _base: PioAddress, offset: u16, data: &mut [u8]) {
        if data.len() != 1 {
            return;
        }
        data[0] = self.serial.read(offset as u8);
    }

    fn pio_write(&mut self, _base: PioAddress, offset: u16, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        if let Err(e) = self.serial.write(offset as u8, data[0]) {
            warn!("serial register write failed: {:?}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

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

    #[test]
    fn tx_lands_in_the_sink() {
        let sink = SharedSink::default();
        let mut console = SerialConsole::new(Box::new(sink.clone())).unwrap();

        // THR is offset 0 with DLAB clear.
        console.pio_write(PioAddress(SERIAL_PORT_BASE), 0, b"o");
        console.pio_write(PioAddress(SERIAL_PORT_BASE), 0, b"k");

        assert_eq!(sink.0.lock().unwrap().as_slice(), b"ok");
    }

    #[test]
    fn input_raises_the_trigger() {
        let sink = SharedSink::default();
        let mut console = SerialConsole::new(Box::new(sink)).unwrap();
        let eventfd = console.eventfd().unwrap();

        // Enable the data-available interrupt (IER offset 1).
        console.pio_write(PioAddress(SERIAL_PORT_BASE), 1, &[0x1]);
        console.enqueue_input(b"x");

        assert!(eventfd.read().unwrap() > 0);

        // The queued byte comes back out of RBR.
        let mut byte = [0u8; 1];
        console.pio_read(PioAddress(SERIAL_PORT_BASE), 0, &mut byte);
        assert_eq!(&byte, b"x");
    }
}
