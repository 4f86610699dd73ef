//! Transport abstraction over the two ways to reach a bootloader.
//!
//! The protocol layer is transport-agnostic: it sends byte slices and
//! receives bytes one at a time, and does not care whether they travel over
//! a serial line or get tunneled bit by bit through a debug probe.
//!
//! ```text
//! +--------------------+     +--------------------+
//! |  Protocol / Loader |     |  Protocol / Loader |
//! +---------+----------+     +---------+----------+
//!           |                          |
//!           v                          v
//! +---------+----------+     +---------+----------+
//! |  Transport trait   |     |  Transport trait   |
//! +---------+----------+     +---------+----------+
//!           |                          |
//!           v                          v
//! +---------+----------+     +---------+----------+
//! |     SerialLink     |     |      JtagLink      |
//! |    (serialport)    |     | (TCL scan tunnel)  |
//! +--------------------+     +--------------------+
//! ```

pub mod jtag;
pub mod serial;

pub use jtag::JtagLink;
pub use serial::SerialLink;

use crate::error::Result;

/// Byte transport to a bootloader peer.
///
/// Reads are polled: [`Transport::poll_byte`] performs one bounded I/O
/// cycle and returns `Ok(None)` when nothing has arrived yet, which is the
/// boundary where loops check their cancellation flags.
pub trait Transport: Send {
    /// Write a byte sequence to the peer.
    fn send(&mut self, data: &[u8]) -> Result<()>;

    /// Poll for one inbound byte; `Ok(None)` when none arrived in time.
    fn poll_byte(&mut self) -> Result<Option<u8>>;

    /// Read exactly `n` bytes, polling until they arrive.
    ///
    /// There is no deadline: a peer that never answers stalls the caller,
    /// which is the interactive-terminal contract.
    fn recv(&mut self, n: usize) -> Result<Vec<u8>> {
        let mut data = Vec::with_capacity(n);
        while data.len() < n {
            if let Some(byte) = self.poll_byte()? {
                data.push(byte);
            }
        }
        Ok(data)
    }

    /// Create a second handle onto the same connection.
    ///
    /// The duplex session reads and writes from two threads; each holds its
    /// own handle.
    fn try_clone(&self) -> Result<Self>
    where
        Self: Sized;

    /// Close the connection. Idempotent; a closed handle stays closed.
    fn close(&mut self) -> Result<()>;
}

/// Closed set of supported transports.
///
/// Call sites stay transport-agnostic through [`Transport`]; the enum keeps
/// the set closed instead of inviting open-ended implementations.
pub enum Link {
    /// Direct byte stream over a serial device.
    Serial(SerialLink),
    /// Bytes tunneled through a JTAG scan chain via a debug-probe bridge.
    Jtag(JtagLink),
}

impl Link {
    /// Open a serial link at the given baud rate.
    pub fn open_serial(port_name: &str, baud_rate: u32) -> Result<Self> {
        Ok(Self::Serial(SerialLink::open(port_name, baud_rate)?))
    }

    /// Open a scan-chain link through the debug-probe bridge.
    pub fn open_jtag(bridge_addr: &str, tap: &str) -> Result<Self> {
        Ok(Self::Jtag(JtagLink::open(bridge_addr, tap)?))
    }

    /// Human-readable endpoint description, for diagnostics.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        match self {
            Self::Serial(link) => link.name(),
            Self::Jtag(link) => link.endpoint(),
        }
    }
}

impl Transport for Link {
    fn send(&mut self, data: &[u8]) -> Result<()> {
        match self {
            Self::Serial(link) => link.send(data),
            Self::Jtag(link) => link.send(data),
        }
    }

    fn poll_byte(&mut self) -> Result<Option<u8>> {
        match self {
            Self::Serial(link) => link.poll_byte(),
            Self::Jtag(link) => link.poll_byte(),
        }
    }

    fn try_clone(&self) -> Result<Self> {
        match self {
            Self::Serial(link) => Ok(Self::Serial(link.try_clone()?)),
            Self::Jtag(link) => Ok(Self::Jtag(link.try_clone()?)),
        }
    }

    fn close(&mut self) -> Result<()> {
        match self {
            Self::Serial(link) => link.close(),
            Self::Jtag(link) => link.close(),
        }
    }
}
