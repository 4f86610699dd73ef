//! Scan-chain transport tunneled through a debug-probe bridge.
//!
//! The target exposes a 10-bit shift register on its JTAG chain; the
//! bridge (an OpenOCD TCL server) shifts values in and out on our behalf.
//! Each protocol byte is carried in one scan: the byte sits in bits 8..=1
//! and bit 0 flags "valid data present". Scanning a neutral all-zero value
//! reads the register without feeding it, and scanning `0x200` acknowledges
//! a byte the target handed us.
//!
//! ## Bridge protocol
//!
//! Text commands over a local TCP socket, each message terminated by
//! `0x1A`, each command answered by the echoed hexadecimal scan result:
//!
//! ```text
//! irscan 0 0x3              select the 2-entry chain
//! drscan <tap> 10 0x<val>   shift one 10-bit value
//! exit                      release the bridge
//! ```

use crate::error::{Error, Result};
use crate::transport::Transport;
use log::{debug, warn};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::{Arc, Mutex};

/// Message terminator on the TCL control socket.
const TCL_TERMINATOR: u8 = 0x1A;

/// Default TCL bridge endpoint.
pub const DEFAULT_BRIDGE_ADDR: &str = "127.0.0.1:6666";

/// Default TAP name of the shift register on the scan chain.
pub const DEFAULT_TAP: &str = "xc6s.tap";

/// Neutral scan value: reads the register without presenting data.
const SHIFT_NEUTRAL: u16 = 0x000;

/// Acknowledge scan value: tells the target its byte was consumed.
const SHIFT_ACK: u16 = 0x200;

/// Decoded result of one 10-bit shift exchange.
///
/// The bridge replies with the scanned-out register as hexadecimal; two
/// bytes of it are meaningful. Bit 0 of the low byte is the data-ready
/// flag; the tunneled byte spans bit 0 of the high byte (its MSB) and the
/// upper seven bits of the low byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShiftResponse {
    /// Target has a byte waiting in the register.
    pub ready: bool,
    /// The tunneled byte (meaningful only when `ready`).
    pub value: u8,
}

impl ShiftResponse {
    /// Parse the echoed hexadecimal scan result.
    ///
    /// Returns `None` for anything that does not decode to at least two
    /// bytes of hex; the caller treats that as "no data yet".
    #[must_use]
    pub fn parse(reply: &str) -> Option<Self> {
        let reply = reply.trim();
        if reply.len() < 4 {
            return None;
        }
        let high = u8::from_str_radix(reply.get(0..2)?, 16).ok()?;
        let low = u8::from_str_radix(reply.get(2..4)?, 16).ok()?;
        Some(Self {
            ready: low & 0x01 != 0,
            value: ((high & 0x01) << 7) | (low >> 1),
        })
    }
}

/// One scan-chain session over a request/response control stream.
///
/// Generic over the stream so the exchange logic can be exercised against
/// scripted replies.
pub struct JtagChain<S: Read + Write> {
    stream: S,
    tap: String,
}

impl<S: Read + Write> JtagChain<S> {
    /// Wrap an open control stream targeting the given TAP.
    pub fn new(stream: S, tap: &str) -> Self {
        Self {
            stream,
            tap: tap.to_string(),
        }
    }

    /// Select the 2-entry chain index; must run once before any scan.
    pub fn select_chain(&mut self) -> Result<()> {
        self.exchange("irscan 0 0x3")?;
        Ok(())
    }

    /// Send one command and collect the reply line.
    fn exchange(&mut self, command: &str) -> Result<String> {
        self.stream.write_all(command.as_bytes())?;
        self.stream.write_all(&[TCL_TERMINATOR])?;
        self.stream.flush()?;

        let mut raw = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            self.stream.read_exact(&mut byte)?;
            if byte[0] == TCL_TERMINATOR {
                break;
            }
            raw.push(byte[0]);
        }
        Ok(String::from_utf8_lossy(&raw).trim().to_string())
    }

    fn shift(&mut self, value: u16) -> Result<String> {
        self.exchange(&format!("drscan {} 10 0x{value:03x}", self.tap))
    }

    /// Tunnel one byte to the target: the byte in bits 8..=1, bit 0 set to
    /// mark it valid.
    pub fn write_byte(&mut self, byte: u8) -> Result<()> {
        let framed = (u16::from(byte) << 1) | 1;
        self.shift(framed)?;
        Ok(())
    }

    /// Poll the register once; acknowledge and return a byte if one is
    /// waiting.
    ///
    /// Malformed replies are logged and reported as "no data yet" so a
    /// glitched exchange does not kill the session.
    pub fn poll_byte(&mut self) -> Result<Option<u8>> {
        let reply = self.shift(SHIFT_NEUTRAL)?;
        match ShiftResponse::parse(&reply) {
            Some(ShiftResponse { ready: true, value }) => {
                self.shift(SHIFT_ACK)?;
                Ok(Some(value))
            }
            Some(ShiftResponse { ready: false, .. }) => Ok(None),
            None => {
                warn!("malformed scan reply {reply:?}, treating as no data");
                Ok(None)
            }
        }
    }

    /// Tell the bridge to release the connection.
    ///
    /// Errors are swallowed so the underlying socket is dropped either way.
    pub fn exit(&mut self) {
        if let Err(e) = self.exchange("exit") {
            debug!("bridge exit command failed: {e}");
        }
    }
}

/// Scan-chain transport handle.
///
/// Reads and writes both run full request/response exchanges over one
/// control socket, so the two session threads must not interleave them;
/// the bridge is shared behind a mutex held for a whole exchange.
pub struct JtagLink {
    chain: Arc<Mutex<Option<JtagChain<TcpStream>>>>,
    endpoint: String,
}

impl JtagLink {
    /// Connect to the TCL bridge and select the scan chain.
    pub fn open(bridge_addr: &str, tap: &str) -> Result<Self> {
        let stream = TcpStream::connect(bridge_addr)
            .map_err(|e| Error::Connection(format!("bridge {bridge_addr}: {e}")))?;
        let mut chain = JtagChain::new(stream, tap);
        chain.select_chain()?;
        debug!("scan chain selected via {bridge_addr} (tap {tap})");
        Ok(Self {
            chain: Arc::new(Mutex::new(Some(chain))),
            endpoint: bridge_addr.to_string(),
        })
    }

    /// Bridge endpoint description, for diagnostics.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn with_chain<R>(&self, f: impl FnOnce(&mut JtagChain<TcpStream>) -> Result<R>) -> Result<R> {
        let mut guard = self
            .chain
            .lock()
            .map_err(|_| Error::Connection("bridge lock poisoned".to_string()))?;
        let chain = guard
            .as_mut()
            .ok_or_else(|| Error::Connection(format!("bridge {} is closed", self.endpoint)))?;
        f(chain)
    }
}

impl Transport for JtagLink {
    fn send(&mut self, data: &[u8]) -> Result<()> {
        self.with_chain(|chain| {
            for &byte in data {
                chain.write_byte(byte)?;
            }
            Ok(())
        })
    }

    fn poll_byte(&mut self) -> Result<Option<u8>> {
        self.with_chain(JtagChain::poll_byte)
    }

    fn try_clone(&self) -> Result<Self> {
        Ok(Self {
            chain: Arc::clone(&self.chain),
            endpoint: self.endpoint.clone(),
        })
    }

    fn close(&mut self) -> Result<()> {
        let mut guard = self
            .chain
            .lock()
            .map_err(|_| Error::Connection("bridge lock poisoned".to_string()))?;
        if let Some(mut chain) = guard.take() {
            chain.exit();
        }
        Ok(())
    }
}
