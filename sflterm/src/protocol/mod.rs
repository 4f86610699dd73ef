//! Protocol implementations.

pub mod crc;
pub mod sfl;

// Re-export common types
pub use crc::crc16;
pub use sfl::{Command, Frame, MAGIC_ACK, MAGIC_REQUEST, MAX_PAYLOAD, MagicDetector, Reply};
