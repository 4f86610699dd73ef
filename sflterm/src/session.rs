//! Duplex terminal session with autonomous firmware delivery.
//!
//! Two threads share the transport for the lifetime of a session: the
//! reader echoes inbound bytes to the local terminal and watches for the
//! boot request, the writer forwards local keystrokes to the peer. Both
//! loops are gated on their own atomic flag and observe [`Session::stop`]
//! at the next poll boundary; neither is interrupted mid-read.
//!
//! When the boot request shows up and an image is configured, the upload
//! runs synchronously on the reader thread, so inbound echo is suspended
//! for the duration of the transfer.

use crate::error::{Error, Result};
use crate::loader::Uploader;
use crate::protocol::sfl::{MAGIC_ACK, MagicDetector};
use crate::transport::Transport;
use log::{info, warn};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Instant;

/// Source of local keystrokes for the writer loop.
///
/// Raw-terminal handling lives with the embedding application; the session
/// only needs "give me one key, or tell me none arrived yet" so it can
/// check its cancellation flag between polls.
pub trait KeyInput: Send {
    /// Wait briefly for one keypress; `Ok(None)` when none arrived.
    fn poll_key(&mut self) -> Result<Option<u8>>;
}

/// What the session does when the bootloader asks for firmware.
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    /// Image to deliver on a boot request; `None` leaves detection inert.
    pub image: Option<PathBuf>,
    /// Target memory address the image is loaded at.
    pub load_address: u32,
    /// Address execution jumps to after the upload.
    pub entry_address: u32,
}

/// Session lifecycle. `Stopped` is terminal; a session is not restartable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, not yet started.
    Idle,
    /// Reader and writer are live.
    Running,
    /// Stopped; only join and close remain.
    Stopped,
}

/// Interactive duplex session over one transport.
pub struct Session<T: Transport + 'static> {
    link: T,
    config: Arc<SessionConfig>,
    state: SessionState,
    reader_running: Arc<AtomicBool>,
    writer_running: Arc<AtomicBool>,
    reader: Option<JoinHandle<Result<()>>>,
    writer: Option<JoinHandle<Result<()>>>,
}

impl<T: Transport + 'static> Session<T> {
    /// Create a session owning the transport.
    pub fn new(link: T, config: SessionConfig) -> Self {
        Self {
            link,
            config: Arc::new(config),
            state: SessionState::Idle,
            reader_running: Arc::new(AtomicBool::new(false)),
            writer_running: Arc::new(AtomicBool::new(false)),
            reader: None,
            writer: None,
        }
    }

    /// Launch the reader and writer.
    ///
    /// `echo` receives the peer's output for local display; `keys` feeds
    /// the writer. Fails unless the session is [`SessionState::Idle`].
    pub fn start(&mut self, echo: Box<dyn Write + Send>, keys: Box<dyn KeyInput>) -> Result<()> {
        if self.state != SessionState::Idle {
            return Err(Error::Session(format!(
                "cannot start from {:?}",
                self.state
            )));
        }

        self.reader_running.store(true, Ordering::Relaxed);
        self.writer_running.store(true, Ordering::Relaxed);

        let mut reader_link = self.link.try_clone()?;
        let mut writer_link = self.link.try_clone()?;

        let config = Arc::clone(&self.config);
        let running = Arc::clone(&self.reader_running);
        self.reader = Some(thread::spawn(move || {
            let result = reader_loop(&mut reader_link, echo, &config, &running);
            // The flag drops with the loop, whichever way it exited.
            running.store(false, Ordering::Relaxed);
            if let Err(ref e) = result {
                warn!("reader stopped: {e}");
            }
            result
        }));

        let running = Arc::clone(&self.writer_running);
        let mut keys = keys;
        self.writer = Some(thread::spawn(move || {
            let result = writer_loop(&mut writer_link, keys.as_mut(), &running);
            running.store(false, Ordering::Relaxed);
            if let Err(ref e) = result {
                warn!("writer stopped: {e}");
            }
            result
        }));

        self.state = SessionState::Running;
        Ok(())
    }

    /// Ask both loops to stop at their next poll boundary.
    pub fn stop(&mut self) {
        self.reader_running.store(false, Ordering::Relaxed);
        self.writer_running.store(false, Ordering::Relaxed);
        if self.state == SessionState::Running {
            self.state = SessionState::Stopped;
        }
    }

    /// Wait for both units to exit; the reader's failure wins if both
    /// carry one.
    pub fn join(&mut self) -> Result<()> {
        let writer_result = join_unit(self.writer.take());
        let reader_result = join_unit(self.reader.take());
        reader_result.and(writer_result)
    }

    /// Wait for the writer only, confirming input forwarding has drained.
    pub fn join_writer(&mut self) -> Result<()> {
        join_unit(self.writer.take())
    }

    /// Whether the reader loop is still live.
    #[must_use]
    pub fn reader_alive(&self) -> bool {
        self.reader_running.load(Ordering::Relaxed)
    }

    /// Whether the writer loop is still live.
    #[must_use]
    pub fn writer_alive(&self) -> bool {
        self.writer_running.load(Ordering::Relaxed)
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Close the underlying transport. Call after joining both units.
    pub fn close(&mut self) -> Result<()> {
        self.link.close()
    }
}

fn join_unit(handle: Option<JoinHandle<Result<()>>>) -> Result<()> {
    match handle {
        Some(handle) => handle
            .join()
            .map_err(|_| Error::Session("session unit panicked".to_string()))?,
        None => Ok(()),
    }
}

/// Inbound loop: echo, boot-request detection, autonomous upload.
fn reader_loop<T: Transport>(
    link: &mut T,
    mut echo: Box<dyn Write + Send>,
    config: &SessionConfig,
    running: &AtomicBool,
) -> Result<()> {
    let mut detector = MagicDetector::new();

    while running.load(Ordering::Relaxed) {
        let byte = match link.poll_byte()? {
            Some(byte) => byte,
            None => continue,
        };

        // Carriage returns display as newlines locally.
        let shown = if byte == b'\r' { b'\n' } else { byte };
        echo.write_all(&[shown])?;
        echo.flush()?;

        if detector.push(byte) {
            match answer_magic(link, config, echo.as_mut()) {
                Ok(()) => {}
                // Protocol-level aborts end the transfer, not the terminal.
                Err(e @ (Error::Upload { .. } | Error::UnexpectedReply(_))) => {
                    warn!("firmware delivery failed: {e}");
                }
                Err(other) => return Err(other),
            }
        }
    }
    Ok(())
}

/// Respond to a boot request: ack, upload, jump.
fn answer_magic<T: Transport>(
    link: &mut T,
    config: &SessionConfig,
    echo: &mut dyn Write,
) -> Result<()> {
    let Some(image_path) = config.image.as_ref() else {
        return Ok(());
    };
    if !image_path.exists() {
        warn!(
            "device requested firmware but {} does not exist",
            image_path.display()
        );
        return Ok(());
    }

    info!("received firmware download request from the device");
    link.send(MAGIC_ACK)?;

    let image = std::fs::read(image_path)?;
    let start = Instant::now();
    let sent = Uploader::new(link).upload(&image, config.load_address, |done, total| {
        let _ = write!(echo, "{}%\r", done * 100 / total.max(1));
        let _ = echo.flush();
    })?;

    let elapsed = start.elapsed().as_secs_f64();
    if elapsed > 0.0 {
        #[allow(clippy::cast_precision_loss)]
        let rate = sent as f64 / (elapsed * 1024.0);
        info!("upload complete ({rate:.1} KB/s)");
    }

    Uploader::new(link).boot(config.entry_address)
}

/// Outbound loop: forward keystrokes verbatim.
fn writer_loop<T: Transport>(
    link: &mut T,
    keys: &mut dyn KeyInput,
    running: &AtomicBool,
) -> Result<()> {
    while running.load(Ordering::Relaxed) {
        if let Some(byte) = keys.poll_key()? {
            link.send(&[byte])?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::sfl::{Frame, MAGIC_REQUEST};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Transport stub shared between cloned handles: scripted inbound
    /// bytes, recorded writes, optional failure once the script runs dry.
    struct StubState {
        inbound: VecDeque<u8>,
        writes: Vec<Vec<u8>>,
        fail_when_dry: bool,
    }

    #[derive(Clone)]
    struct StubTransport {
        state: Arc<Mutex<StubState>>,
    }

    impl StubTransport {
        fn new(inbound: &[u8]) -> Self {
            Self::with_failure(inbound, false)
        }

        fn with_failure(inbound: &[u8], fail_when_dry: bool) -> Self {
            Self {
                state: Arc::new(Mutex::new(StubState {
                    inbound: inbound.iter().copied().collect(),
                    writes: Vec::new(),
                    fail_when_dry,
                })),
            }
        }

        fn writes(&self) -> Vec<Vec<u8>> {
            self.state.lock().unwrap().writes.clone()
        }

        fn drained(&self) -> bool {
            self.state.lock().unwrap().inbound.is_empty()
        }
    }

    impl Transport for StubTransport {
        fn send(&mut self, data: &[u8]) -> Result<()> {
            self.state.lock().unwrap().writes.push(data.to_vec());
            Ok(())
        }

        fn poll_byte(&mut self) -> Result<Option<u8>> {
            let mut state = self.state.lock().unwrap();
            match state.inbound.pop_front() {
                Some(byte) => Ok(Some(byte)),
                None if state.fail_when_dry => Err(Error::Connection("link dropped".into())),
                None => {
                    drop(state);
                    // Simulate a read timeout slice.
                    thread::sleep(Duration::from_millis(1));
                    Ok(None)
                }
            }
        }

        fn try_clone(&self) -> Result<Self> {
            Ok(self.clone())
        }

        fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    /// Echo sink observable from the test thread.
    #[derive(Clone)]
    struct SharedSink(Arc<Mutex<Vec<u8>>>);

    impl SharedSink {
        fn new() -> Self {
            Self(Arc::new(Mutex::new(Vec::new())))
        }

        fn contents(&self) -> Vec<u8> {
            self.0.lock().unwrap().clone()
        }
    }

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    /// Scripted key source; reports "no key" once the script is done.
    struct ScriptedKeys(VecDeque<u8>);

    impl ScriptedKeys {
        fn new(keys: &[u8]) -> Self {
            Self(keys.iter().copied().collect())
        }

        fn none() -> Self {
            Self(VecDeque::new())
        }
    }

    impl KeyInput for ScriptedKeys {
        fn poll_key(&mut self) -> Result<Option<u8>> {
            match self.0.pop_front() {
                Some(byte) => Ok(Some(byte)),
                None => {
                    thread::sleep(Duration::from_millis(1));
                    Ok(None)
                }
            }
        }
    }

    fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            thread::sleep(Duration::from_millis(2));
        }
        panic!("condition not reached in time");
    }

    #[test]
    fn test_stop_then_join_terminates_both_units() {
        let link = StubTransport::new(b"");
        let mut session = Session::new(link, SessionConfig::default());
        session
            .start(Box::new(SharedSink::new()), Box::new(ScriptedKeys::none()))
            .unwrap();
        assert_eq!(session.state(), SessionState::Running);

        session.stop();
        session.join().unwrap();
        assert!(!session.reader_alive());
        assert!(!session.writer_alive());
        assert_eq!(session.state(), SessionState::Stopped);
        session.close().unwrap();
    }

    #[test]
    fn test_start_twice_fails() {
        let link = StubTransport::new(b"");
        let mut session = Session::new(link, SessionConfig::default());
        session
            .start(Box::new(SharedSink::new()), Box::new(ScriptedKeys::none()))
            .unwrap();
        let err = session
            .start(Box::new(SharedSink::new()), Box::new(ScriptedKeys::none()))
            .unwrap_err();
        assert!(matches!(err, Error::Session(_)));
        session.stop();
        session.join().unwrap();
    }

    #[test]
    fn test_reader_echo_translates_carriage_returns() {
        let link = StubTransport::new(b"ok\rdone");
        let sink = SharedSink::new();
        let mut session = Session::new(link.clone(), SessionConfig::default());
        session
            .start(Box::new(sink.clone()), Box::new(ScriptedKeys::none()))
            .unwrap();

        wait_until(|| sink.contents().len() == 7);
        session.stop();
        session.join().unwrap();
        assert_eq!(sink.contents(), b"ok\ndone");
    }

    #[test]
    fn test_writer_forwards_keystrokes_verbatim() {
        let link = StubTransport::new(b"");
        let mut session = Session::new(link.clone(), SessionConfig::default());
        session
            .start(
                Box::new(SharedSink::new()),
                Box::new(ScriptedKeys::new(b"ls\r")),
            )
            .unwrap();

        wait_until(|| link.writes().len() == 3);
        session.stop();
        session.join().unwrap();
        assert_eq!(link.writes(), vec![b"l".to_vec(), b"s".to_vec(), b"\r".to_vec()]);
    }

    #[test]
    fn test_magic_request_triggers_ack_upload_and_jump() {
        let image_file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(image_file.path(), [0x42u8; 10]).unwrap();

        // Noise, the boot request, then the two success replies the
        // uploader will consume (one load frame, one jump frame).
        let mut inbound = b"boot log\n".to_vec();
        inbound.extend_from_slice(MAGIC_REQUEST);
        inbound.extend_from_slice(b"KK");

        let link = StubTransport::new(&inbound);
        let config = SessionConfig {
            image: Some(image_file.path().to_path_buf()),
            load_address: 0x40000000,
            entry_address: 0x40000000,
        };
        let mut session = Session::new(link.clone(), config);
        session
            .start(Box::new(SharedSink::new()), Box::new(ScriptedKeys::none()))
            .unwrap();

        wait_until(|| link.writes().len() == 3);
        session.stop();
        session.join().unwrap();

        let writes = link.writes();
        assert_eq!(writes[0], MAGIC_ACK.to_vec());
        assert_eq!(
            writes[1],
            Frame::load(0x40000000, &[0x42u8; 10]).unwrap().encode()
        );
        assert_eq!(writes[2], Frame::jump(0x40000000).encode());
    }

    #[test]
    fn test_magic_request_inert_without_image() {
        let link = StubTransport::new(MAGIC_REQUEST);
        let sink = SharedSink::new();
        let mut session = Session::new(link.clone(), SessionConfig::default());
        session
            .start(Box::new(sink.clone()), Box::new(ScriptedKeys::none()))
            .unwrap();

        wait_until(|| sink.contents().len() == MAGIC_REQUEST.len());
        session.stop();
        session.join().unwrap();
        // Bytes were echoed, nothing was sent back.
        assert!(link.writes().is_empty());
    }

    #[test]
    fn test_reader_failure_propagates_and_leaves_writer_alive() {
        let link = StubTransport::with_failure(b"x", true);
        let mut session = Session::new(link.clone(), SessionConfig::default());
        session
            .start(Box::new(SharedSink::new()), Box::new(ScriptedKeys::none()))
            .unwrap();

        wait_until(|| !session.reader_alive());
        // Asymmetric shutdown: the writer keeps polling.
        assert!(session.writer_alive());

        session.stop();
        let err = session.join().unwrap_err();
        assert!(matches!(err, Error::Connection(_)));
    }

    #[test]
    fn test_join_writer_only_drains_input() {
        let link = StubTransport::new(b"");
        let mut session = Session::new(link.clone(), SessionConfig::default());
        session
            .start(
                Box::new(SharedSink::new()),
                Box::new(ScriptedKeys::new(b"q")),
            )
            .unwrap();

        wait_until(|| !link.drained() || link.writes().len() == 1);
        session.stop();
        session.join_writer().unwrap();
        // Reader may still be mid-poll; join the rest for cleanliness.
        session.join().unwrap();
    }
}
