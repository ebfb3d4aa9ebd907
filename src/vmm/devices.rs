//! Host side of port-I/O exits.

use log::{debug, warn};
use std::io::{self, Write};
use vm_superio::serial::NoEvents;
use vm_superio::{Serial, Trigger};

/// Services port I/O on behalf of the guest; called from the exit loop.
pub trait IoHandler {
    fn io_out(&mut self, port: u16, data: &[u8]) -> io::Result<()>;
    fn io_in(&mut self, port: u16, data: &mut [u8]) -> io::Result<()>;
}

/// The guest never enables UART interrupts; there is no irqchip to raise them on.
pub struct NoInterrupt;

impl Trigger for NoInterrupt {
    type E = io::Error;

    fn trigger(&self) -> Result<(), Self::E> {
        Ok(())
    }
}

/// 8250 UART on eight consecutive ports starting at `base`; everything else
/// is an unbacked port.
pub struct SerialConsole<W: Write> {
    base: u16,
    serial: Serial<NoInterrupt, NoEvents, W>,
}

impl<W: Write> SerialConsole<W> {
    pub fn new(base: u16, out: W) -> Self {
        Self { base, serial: Serial::new(NoInterrupt, out) }
    }

    fn offset(&self, port: u16) -> Option<u8> {
        port.checked_sub(self.base).filter(|off| *off < 8).map(|off| off as u8)
    }
}

impl<W: Write> IoHandler for SerialConsole<W> {
    fn io_out(&mut self, port: u16, data: &[u8]) -> io::Result<()> {
        let Some(offset) = self.offset(port) else {
            warn!("write to unbacked port {:#x} ignored ({} bytes)", port, data.len());
            return Ok(());
        };
        for byte in data {
            self.serial
                .write(offset, *byte)
                .map_err(|e| io::Error::other(format!("serial write: {:?}", e)))?;
        }
        debug!("serial out {:#x}: {:02x?}", port, data);
        Ok(())
    }

    fn io_in(&mut self, port: u16, data: &mut [u8]) -> io::Result<()> {
        match self.offset(port) {
            Some(offset) => data.iter_mut().for_each(|b| *b = self.serial.read(offset)),
            None => {
                warn!("read from unbacked port {:#x}", port);
                data.fill(0xff);
            }
        }
        Ok(())
    }
}
