//! Raw-terminal plumbing for the interactive session.
//!
//! The library's session wants a keystroke source and an echo sink; this
//! module provides both on top of crossterm, keeping raw-mode handling out
//! of the library.

use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyModifiers};
use crossterm::terminal;
use sflterm::KeyInput;
use std::collections::VecDeque;
use std::io::{self, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// How long one keyboard poll waits before reporting "no key".
const KEY_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// RAII guard to restore terminal mode on drop.
pub struct RawModeGuard;

impl RawModeGuard {
    /// Enter raw mode; the guard restores cooked mode when dropped.
    pub fn enable() -> io::Result<Self> {
        terminal::enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
    }
}

/// Stdout wrapper that rewrites `\n` to `\r\n`.
///
/// In raw mode a bare line feed moves down without returning the cursor to
/// column zero, so device output drifts across the screen without this.
pub struct RawWriter<W: Write> {
    inner: W,
}

impl<W: Write> RawWriter<W> {
    /// Wrap a writer.
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

impl<W: Write> Write for RawWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for &byte in buf {
            if byte == b'\n' {
                self.inner.write_all(b"\r\n")?;
            } else {
                self.inner.write_all(&[byte])?;
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Keystroke source backed by crossterm events.
///
/// Ctrl-C is not forwarded to the peer; it raises the shared quit flag so
/// the supervising loop can wind the session down.
pub struct CrosstermKeys {
    quit: Arc<AtomicBool>,
    pending: VecDeque<u8>,
}

impl CrosstermKeys {
    /// Create a key source sharing the given quit flag.
    pub fn new(quit: Arc<AtomicBool>) -> Self {
        Self {
            quit,
            pending: VecDeque::new(),
        }
    }
}

impl KeyInput for CrosstermKeys {
    fn poll_key(&mut self) -> sflterm::Result<Option<u8>> {
        if let Some(byte) = self.pending.pop_front() {
            return Ok(Some(byte));
        }

        if !event::poll(KEY_POLL_INTERVAL).map_err(sflterm::Error::Io)? {
            return Ok(None);
        }
        let Event::Key(KeyEvent {
            code, modifiers, ..
        }) = event::read().map_err(sflterm::Error::Io)?
        else {
            return Ok(None);
        };

        match (code, modifiers) {
            // Ctrl+C: hand control back to the supervisor
            (KeyCode::Char('c'), KeyModifiers::CONTROL) => {
                self.quit.store(true, Ordering::Relaxed);
                Ok(None)
            }
            (KeyCode::Enter, _) => Ok(Some(b'\r')),
            (KeyCode::Char(c), KeyModifiers::NONE | KeyModifiers::SHIFT) => {
                let mut buf = [0u8; 4];
                let bytes = c.encode_utf8(&mut buf).as_bytes();
                self.pending.extend(&bytes[1..]);
                Ok(Some(bytes[0]))
            }
            (KeyCode::Backspace, _) => Ok(Some(0x08)),
            (KeyCode::Tab, _) => Ok(Some(0x09)),
            (KeyCode::Esc, _) => Ok(Some(0x1B)),
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_writer_expands_line_feeds() {
        let mut out = Vec::new();
        RawWriter::new(&mut out).write_all(b"a\nb\n").unwrap();
        assert_eq!(out, b"a\r\nb\r\n");
    }

    #[test]
    fn test_raw_writer_passes_other_bytes() {
        let mut out = Vec::new();
        RawWriter::new(&mut out).write_all(b"\rxyz\x1b[1m").unwrap();
        assert_eq!(out, b"\rxyz\x1b[1m");
    }

    #[test]
    fn test_crossterm_keys_drains_pending_before_polling() {
        let mut keys = CrosstermKeys::new(Arc::new(AtomicBool::new(false)));
        keys.pending.extend(b"ab");
        assert_eq!(keys.poll_key().unwrap(), Some(b'a'));
        assert_eq!(keys.poll_key().unwrap(), Some(b'b'));
    }
}
