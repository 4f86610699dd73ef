//! Upload engine: pushes an image into target memory and starts it.
//!
//! The image is cut into load frames, each acknowledged by the bootloader
//! before the next is sent. A CRC complaint from the peer re-sends the
//! identical frame; any other non-success reply aborts the transfer.
//! Aborted transfers leave whatever was already written in target memory,
//! there is no rollback in the protocol.

use crate::error::{Error, Result};
use crate::protocol::sfl::{Frame, MAX_PAYLOAD, Reply};
use crate::transport::Transport;
use log::{debug, info, trace};

/// Image bytes carried by one load frame; the 4-byte address prefix uses
/// the rest of the payload budget.
pub const LOAD_CHUNK: usize = MAX_PAYLOAD - 4;

/// Drives an SFL upload over any transport.
pub struct Uploader<'a, T: Transport> {
    link: &'a mut T,
}

impl<'a, T: Transport> Uploader<'a, T> {
    /// Create an uploader borrowing the transport.
    pub fn new(link: &'a mut T) -> Self {
        Self { link }
    }

    /// Send one frame and wait for the bootloader's verdict.
    ///
    /// Re-sends the identical byte sequence for as long as the peer reports
    /// a CRC error; that reply is the protocol's retry signal, not a
    /// failure. Any other non-success reply aborts.
    pub fn send_frame(&mut self, frame: &Frame) -> Result<()> {
        let encoded = frame.encode();
        loop {
            self.link.send(&encoded)?;
            let raw = self.link.recv(1)?;
            match Reply::from_read(&raw) {
                Reply::Success => return Ok(()),
                Reply::CrcError => {
                    debug!("peer reported a CRC error, re-sending frame");
                }
                reply => {
                    debug!("aborting on reply bytes {raw:02x?}");
                    return Err(Error::UnexpectedReply(reply));
                }
            }
        }
    }

    /// Upload `image` to consecutive memory starting at `base_address`.
    ///
    /// `progress` is called with `(bytes_sent, total)` after each
    /// acknowledged chunk; it is observability only, not part of the
    /// transfer contract. Returns the number of image bytes delivered.
    #[allow(clippy::cast_possible_truncation)] // chunks are at most 247 bytes
    pub fn upload<F>(&mut self, image: &[u8], base_address: u32, mut progress: F) -> Result<usize>
    where
        F: FnMut(usize, usize),
    {
        let total = image.len();
        let mut address = base_address;
        let mut sent = 0usize;
        info!("uploading {total} bytes to {base_address:#010x}");

        for chunk in image.chunks(LOAD_CHUNK) {
            trace!("load frame: {} bytes at {address:#010x}", chunk.len());
            let frame = Frame::load(address, chunk)?;
            self.send_frame(&frame).map_err(|e| match e {
                Error::UnexpectedReply(reply) => Error::Upload {
                    reply,
                    address,
                    sent,
                },
                other => other,
            })?;
            // The address only advances once the chunk was acknowledged.
            sent += chunk.len();
            address = address.wrapping_add(chunk.len() as u32);
            progress(sent, total);
        }

        Ok(sent)
    }

    /// Tell the bootloader to jump to `entry_address`.
    pub fn boot(&mut self, entry_address: u32) -> Result<()> {
        info!("booting the device at {entry_address:#010x}");
        self.send_frame(&Frame::jump(entry_address))
    }
}
