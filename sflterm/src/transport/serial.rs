//! Direct serial transport using the `serialport` crate.

use crate::error::{Error, Result};
use crate::transport::Transport;
use serialport::{DataBits, FlowControl, Parity, StopBits};
use std::io::{Read, Write};
use std::time::Duration;

/// How long one read poll blocks before reporting "nothing yet".
///
/// This bounds how quickly a loop observes its cancellation flag; it is not
/// a protocol deadline.
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Serial port connection to a bootloader.
pub struct SerialLink {
    port: Option<Box<dyn serialport::SerialPort>>,
    name: String,
}

impl SerialLink {
    /// Open a serial port at 8N1 with no flow control.
    pub fn open(port_name: &str, baud_rate: u32) -> Result<Self> {
        let port = serialport::new(port_name, baud_rate)
            .timeout(POLL_TIMEOUT)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .open()?;

        Ok(Self {
            port: Some(port),
            name: port_name.to_string(),
        })
    }

    /// List available serial ports.
    pub fn list_ports() -> Result<Vec<serialport::SerialPortInfo>> {
        serialport::available_ports().map_err(Error::Serial)
    }

    /// Get the port name/path.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    fn port_mut(&mut self) -> std::io::Result<&mut Box<dyn serialport::SerialPort>> {
        self.port
            .as_mut()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotConnected, "port closed"))
    }
}

impl Transport for SerialLink {
    fn send(&mut self, data: &[u8]) -> Result<()> {
        let port = self.port_mut()?;
        port.write_all(data)?;
        port.flush()?;
        Ok(())
    }

    fn poll_byte(&mut self) -> Result<Option<u8>> {
        let mut buf = [0u8; 1];
        match self.port_mut()?.read(&mut buf) {
            Ok(1) => Ok(Some(buf[0])),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn try_clone(&self) -> Result<Self> {
        let port = self
            .port
            .as_ref()
            .ok_or_else(|| Error::Connection(format!("{} is closed", self.name)))?
            .try_clone()?;
        Ok(Self {
            port: Some(port),
            name: self.name.clone(),
        })
    }

    fn close(&mut self) -> Result<()> {
        // Take ownership of the port and let it drop (close)
        self.port.take();
        Ok(())
    }
}
