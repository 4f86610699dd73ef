//! # sflterm
//!
//! A library for talking to SFL serial bootloaders.
//!
//! This crate provides the host side of the Serial Firmware Loader
//! protocol: a length-prefixed, CRC-protected framing scheme used to push
//! an executable image into target memory and start it, combined with an
//! interactive duplex terminal over the same link. It includes:
//!
//! - SFL frame encoding and CRC16 checksum calculation
//! - Boot-request (magic handshake) detection in the inbound stream
//! - A chunked upload engine with acknowledge/retry handling
//! - Two interchangeable transports: a direct serial port and a JTAG
//!   scan-chain tunnel driven through a debug-probe TCL bridge
//!
//! ## Example
//!
//! ```rust,no_run
//! use sflterm::{Link, Session, SessionConfig};
//!
//! fn main() -> sflterm::Result<()> {
//!     let link = Link::open_serial("/dev/ttyUSB0", 115200)?;
//!     let config = SessionConfig {
//!         image: Some("firmware.bin".into()),
//!         load_address: 0x4000_0000,
//!         entry_address: 0x4000_0000,
//!     };
//!
//!     let mut session = Session::new(link, config);
//!     // start() takes the local echo sink and a keystroke source; see
//!     // the sflterm CLI for a raw-terminal implementation.
//!     # let echo: Box<dyn std::io::Write + Send> = Box::new(std::io::sink());
//!     # struct NoKeys;
//!     # impl sflterm::KeyInput for NoKeys {
//!     #     fn poll_key(&mut self) -> sflterm::Result<Option<u8>> { Ok(None) }
//!     # }
//!     session.start(echo, Box::new(NoKeys))?;
//!     session.stop();
//!     session.join()?;
//!     session.close()?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod loader;
pub mod protocol;
pub mod session;
pub mod transport;

// Re-exports for convenience
pub use {
    error::{Error, Result},
    loader::{LOAD_CHUNK, Uploader},
    protocol::{
        crc::crc16,
        sfl::{Command, Frame, MAGIC_ACK, MAGIC_REQUEST, MAX_PAYLOAD, MagicDetector, Reply},
    },
    session::{KeyInput, Session, SessionConfig, SessionState},
    transport::{
        JtagLink, Link, SerialLink, Transport,
        jtag::{DEFAULT_BRIDGE_ADDR, DEFAULT_TAP},
    },
};
