//! Error types for sflterm.

use std::io;
use thiserror::Error;

use crate::protocol::sfl::Reply;

/// Result type for sflterm operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for sflterm operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (socket, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Failed to reach or initialize the remote endpoint.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Frame payload exceeds the protocol limit.
    #[error("Payload too large: {len} bytes (limit {limit})")]
    PayloadTooLarge {
        /// Requested payload length.
        len: usize,
        /// Protocol payload limit.
        limit: usize,
    },

    /// The bootloader answered a frame with something other than success.
    #[error("Unexpected bootloader reply: {0}")]
    UnexpectedReply(Reply),

    /// An upload was aborted mid-transfer.
    #[error("Upload aborted at {address:#010x} after {sent} bytes: bootloader replied {reply}")]
    Upload {
        /// Reply that caused the abort.
        reply: Reply,
        /// Target address the transfer had reached.
        address: u32,
        /// Image bytes acknowledged before the abort.
        sent: usize,
    },

    /// Session lifecycle misuse (start/stop/join ordering).
    #[error("Session error: {0}")]
    Session(String),
}
