//! # Serial Communication Module
//!
//! Handles the serial link to the sensor microcontroller.
//!
//! This module handles:
//! - Opening the serial port with 8-N-1 framing
//! - Buffering incoming bytes and splitting them into lines
//! - Writing single-byte commands
//! - Sharing one session between the monitor and the collection task

pub mod port_trait;

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::{LoggerError, Result};
use crate::events::{EventSink, Severity};
use crate::sensor::protocol::{Command, LINE_TERMINATOR};
use port_trait::{PortOpener, SerialPortIO};

/// Bytes requested from the port per read
const READ_CHUNK_SIZE: usize = 256;

/// Longest line kept while waiting for a terminator
const MAX_LINE_LENGTH: usize = 1024;

/// Connection to the sensor over a serial port
///
/// Incoming bytes are buffered until a newline arrives, so a line split
/// across several reads is returned whole.
pub struct LinkSession {
    /// Port handle, `None` once closed
    port: Option<Box<dyn SerialPortIO>>,
    /// Device path (e.g., /dev/ttyUSB0)
    device_path: String,
    /// Bytes received but not yet returned as a line
    rx_buf: BytesMut,
    /// Upper bound on one read poll
    read_timeout: Duration,
    /// Open time or arrival of the most recent byte
    last_activity: Instant,
}

impl std::fmt::Debug for LinkSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkSession")
            .field("device_path", &self.device_path)
            .field("alive", &self.is_alive())
            .field("buffered", &self.rx_buf.len())
            .finish_non_exhaustive()
    }
}

impl LinkSession {
    /// Open a session on a serial device
    ///
    /// # Arguments
    ///
    /// * `opener` - Port factory
    /// * `path` - Device path (e.g., "/dev/ttyUSB0")
    /// * `baud_rate` - Firmware baud rate
    /// * `read_timeout` - Bound on each `read_line` poll
    ///
    /// # Errors
    ///
    /// Returns `LoggerError::Connection` if the device cannot be opened
    pub fn open(
        opener: &dyn PortOpener,
        path: &str,
        baud_rate: u32,
        read_timeout: Duration,
    ) -> Result<Self> {
        debug!("Trying to open serial port: {}", path);
        let port = opener.open(path, baud_rate)?;
        info!("Opened sensor link at {} ({} baud)", path, baud_rate);
        Ok(Self::from_port(port, path, read_timeout))
    }

    /// Wrap an already opened port
    pub fn from_port(port: Box<dyn SerialPortIO>, device_path: &str, read_timeout: Duration) -> Self {
        Self {
            port: Some(port),
            device_path: device_path.to_string(),
            rx_buf: BytesMut::with_capacity(READ_CHUNK_SIZE),
            read_timeout,
            last_activity: Instant::now(),
        }
    }

    pub fn is_alive(&self) -> bool {
        self.port.is_some()
    }

    pub fn device_path(&self) -> &str {
        &self.device_path
    }

    /// When the session was opened or last received a byte
    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// Poll for one complete line
    ///
    /// Waits at most the configured read timeout for new bytes.
    ///
    /// # Returns
    ///
    /// * `Ok(Some(line))` - A newline-terminated line (terminator included)
    /// * `Ok(None)` - No complete line is buffered yet
    ///
    /// # Errors
    ///
    /// Returns `LoggerError::Connection` if the session is closed, the port
    /// reports an error, or the stream ended
    pub async fn read_line(&mut self) -> Result<Option<Bytes>> {
        if let Some(line) = self.take_buffered_line() {
            return Ok(Some(line));
        }

        let port = self
            .port
            .as_mut()
            .ok_or_else(|| LoggerError::Connection("Link session is closed".to_string()))?;

        let mut chunk = [0u8; READ_CHUNK_SIZE];
        let n = match timeout(self.read_timeout, port.read(&mut chunk)).await {
            Err(_) => return Ok(None),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::TimedOut => return Ok(None),
            Ok(Err(e)) => {
                return Err(LoggerError::Connection(format!("Failed to read from {}: {}", self.device_path, e)))
            }
            Ok(Ok(0)) => {
                return Err(LoggerError::Connection(format!("Serial stream from {} ended", self.device_path)))
            }
            Ok(Ok(n)) => n,
        };

        self.last_activity = Instant::now();
        self.rx_buf.extend_from_slice(&chunk[..n]);

        if self.rx_buf.len() > MAX_LINE_LENGTH && !self.rx_buf.contains(&LINE_TERMINATOR) {
            warn!("Dropping {} bytes received without a line terminator", self.rx_buf.len());
            self.rx_buf.clear();
        }

        Ok(self.take_buffered_line())
    }

    /// Write raw bytes and flush
    ///
    /// # Errors
    ///
    /// Returns `LoggerError::Connection` if the session is closed or the write fails
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        let port = self
            .port
            .as_mut()
            .ok_or_else(|| LoggerError::Connection("Link session is closed".to_string()))?;

        port.write_all(data)
            .await
            .map_err(|e| LoggerError::Connection(format!("Failed to write to {}: {}", self.device_path, e)))?;

        port.flush()
            .await
            .map_err(|e| LoggerError::Connection(format!("Failed to flush {}: {}", self.device_path, e)))?;

        Ok(())
    }

    /// Send a single-byte command
    pub async fn send(&mut self, command: Command) -> Result<()> {
        self.write(&[command.as_byte()]).await?;
        debug!("Sent {:?} command", command);
        Ok(())
    }

    /// Forget buffered input so a new run does not see the previous one's tail
    pub fn discard_input(&mut self) {
        self.rx_buf.clear();
        self.last_activity = Instant::now();
        if let Some(port) = self.port.as_mut() {
            if let Err(e) = port.clear_input() {
                debug!("Failed to clear input buffer of {}: {}", self.device_path, e);
            }
        }
    }

    /// Release the port; calling it again is a no-op
    pub fn close(&mut self) {
        if self.port.take().is_some() {
            info!("Closed sensor link at {}", self.device_path);
        }
        self.rx_buf.clear();
    }

    fn take_buffered_line(&mut self) -> Option<Bytes> {
        let end = self.rx_buf.iter().position(|&b| b == LINE_TERMINATOR)?;
        Some(self.rx_buf.split_to(end + 1).freeze())
    }
}

/// Connectivity of the sensor link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connected,
}

/// Session handle and link state, guarded together
#[derive(Debug)]
pub struct LinkSlot {
    pub session: Option<LinkSession>,
    pub state: LinkState,
}

impl LinkSlot {
    /// The session, if the link is connected and the port is open
    pub fn connected_session(&mut self) -> Option<&mut LinkSession> {
        if self.state != LinkState::Connected {
            return None;
        }
        self.session.as_mut().filter(|s| s.is_alive())
    }
}

/// Link shared between the connection monitor and the collection controller
///
/// Every operation on the session holds the lock for its whole duration.
/// Callers must drop the guard before sleeping.
#[derive(Debug, Clone)]
pub struct SharedLink {
    inner: Arc<Mutex<LinkSlot>>,
}

impl Default for SharedLink {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedLink {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(LinkSlot {
                session: None,
                state: LinkState::Disconnected,
            })),
        }
    }

    pub async fn lock(&self) -> MutexGuard<'_, LinkSlot> {
        self.inner.lock().await
    }

    pub async fn state(&self) -> LinkState {
        self.inner.lock().await.state
    }

    /// Close the session and mark the link disconnected
    ///
    /// This is the only place the link goes down. Connectivity events are
    /// emitted only when the link was actually connected.
    ///
    /// # Returns
    ///
    /// * `bool` - Whether the link was connected before the call
    pub async fn disconnect(&self, events: &EventSink, reason: &str) -> bool {
        let was_connected = {
            let mut slot = self.inner.lock().await;
            let was_connected = slot.state == LinkState::Connected;
            slot.state = LinkState::Disconnected;
            if let Some(mut session) = slot.session.take() {
                session.close();
            }
            was_connected
        };

        if was_connected {
            warn!("Sensor link lost: {}", reason);
            events.connectivity(false);
            events.status("Sensor Status: Disconnected", Severity::Error);
        }

        was_connected
    }
}

#[cfg(test)]
mod tests {
    use super::port_trait::mocks::MockSerialPort;
    use super::*;
    use crate::events::{self, UiEvent};

    fn session_with(port: &MockSerialPort) -> LinkSession {
        LinkSession::from_port(Box::new(port.clone()), "/dev/mock0", Duration::from_millis(20))
    }

    #[tokio::test]
    async fn test_read_line_returns_complete_lines() {
        let port = MockSerialPort::new();
        port.push_incoming(b"42.5,21.3,60.1\nLoop: 1\n");
        let mut session = session_with(&port);

        assert_eq!(session.read_line().await.unwrap().as_deref(), Some(&b"42.5,21.3,60.1\n"[..]));
        // Second line comes from the buffer without touching the port
        assert_eq!(session.read_line().await.unwrap().as_deref(), Some(&b"Loop: 1\n"[..]));
    }

    #[tokio::test]
    async fn test_read_line_joins_split_lines() {
        let port = MockSerialPort::new();
        port.push_incoming(b"42.5,21");
        port.push_incoming(b".3,60.1\n");
        let mut session = session_with(&port);

        assert_eq!(session.read_line().await.unwrap(), None);
        assert_eq!(session.read_line().await.unwrap().as_deref(), Some(&b"42.5,21.3,60.1\n"[..]));
    }

    #[tokio::test]
    async fn test_read_line_times_out_on_idle_link() {
        let port = MockSerialPort::new();
        let mut session = session_with(&port);

        let started = Instant::now();
        assert_eq!(session.read_line().await.unwrap(), None);
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_read_error_is_connection_error() {
        let port = MockSerialPort::new();
        port.set_read_error(std::io::ErrorKind::BrokenPipe);
        let mut session = session_with(&port);

        assert!(matches!(session.read_line().await, Err(LoggerError::Connection(_))));
    }

    #[tokio::test]
    async fn test_oversized_garbage_is_dropped() {
        let port = MockSerialPort::new();
        port.push_incoming(&[b'x'; 200]);
        port.push_incoming(&[b'x'; 200]);
        port.push_incoming(&[b'x'; 200]);
        port.push_incoming(&[b'x'; 200]);
        port.push_incoming(&[b'x'; 200]);
        port.push_incoming(&[b'x'; 200]);
        let mut session = session_with(&port);

        for _ in 0..6 {
            assert_eq!(session.read_line().await.unwrap(), None);
        }
        assert!(session.rx_buf.len() <= MAX_LINE_LENGTH);
    }

    #[tokio::test]
    async fn test_send_writes_command_byte() {
        let port = MockSerialPort::new();
        let mut session = session_with(&port);

        session.send(Command::Start).await.unwrap();
        session.send(Command::Probe).await.unwrap();
        session.send(Command::Stop).await.unwrap();

        assert_eq!(port.written_bytes(), vec![b'S', 0x00, b'X']);
    }

    #[tokio::test]
    async fn test_write_failure_is_connection_error() {
        let port = MockSerialPort::new();
        port.set_write_error(std::io::ErrorKind::BrokenPipe);
        let mut session = session_with(&port);

        match session.write(b"S").await {
            Err(LoggerError::Connection(msg)) => assert!(msg.contains("/dev/mock0")),
            other => panic!("Expected Connection error, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let port = MockSerialPort::new();
        let mut session = session_with(&port);

        assert!(session.is_alive());
        session.close();
        session.close();
        assert!(!session.is_alive());
        assert!(matches!(session.write(b"X").await, Err(LoggerError::Connection(_))));
        assert!(matches!(session.read_line().await, Err(LoggerError::Connection(_))));
    }

    #[tokio::test]
    async fn test_discard_input_clears_buffers() {
        let port = MockSerialPort::new();
        port.push_incoming(b"Complete: Finished 5 loops\npartial");
        let mut session = session_with(&port);
        session.read_line().await.unwrap();
        assert!(!session.rx_buf.is_empty());

        session.discard_input();
        assert!(session.rx_buf.is_empty());
        assert_eq!(port.clear_count(), 1);
    }

    #[test]
    fn test_open_uses_opener() {
        let port = MockSerialPort::new();
        let opener = port_trait::mocks::opener_for(&port);

        let session = LinkSession::open(&opener, "/dev/ttyUSB0", 115200, Duration::from_millis(100)).unwrap();
        assert_eq!(session.device_path(), "/dev/ttyUSB0");
        assert!(session.is_alive());
    }

    #[test]
    fn test_open_failure_propagates() {
        let mut opener = port_trait::MockPortOpener::new();
        opener
            .expect_open()
            .returning(|path, _| Err(LoggerError::Connection(format!("Failed to open {}", path))));

        let result = LinkSession::open(&opener, "/dev/ttyUSB9", 9600, Duration::from_millis(100));
        assert!(matches!(result, Err(LoggerError::Connection(_))));
    }

    #[tokio::test]
    async fn test_disconnect_emits_events_once() {
        let (sink, mut rx) = events::channel();
        let link = SharedLink::new();
        {
            let mut slot = link.lock().await;
            slot.session = Some(session_with(&MockSerialPort::new()));
            slot.state = LinkState::Connected;
        }

        assert!(link.disconnect(&sink, "test").await);
        assert!(!link.disconnect(&sink, "test").await);
        assert_eq!(link.state().await, LinkState::Disconnected);
        assert!(link.lock().await.session.is_none());

        assert_eq!(rx.recv().await, Some(UiEvent::Connectivity(false)));
        assert!(matches!(rx.recv().await, Some(UiEvent::Status { severity: Severity::Error, .. })));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_connected_session_requires_connected_state() {
        let link = SharedLink::new();
        let mut slot = link.lock().await;
        slot.session = Some(session_with(&MockSerialPort::new()));
        assert!(slot.connected_session().is_none());
        slot.state = LinkState::Connected;
        assert!(slot.connected_session().is_some());
    }

    // Integration test - only runs with real hardware
    #[tokio::test]
    #[ignore]
    async fn test_collect_with_real_sensor() {
        // This test requires the sensor board on /dev/ttyUSB0
        let mut session = LinkSession::open(
            &port_trait::TokioSerialOpener,
            "/dev/ttyUSB0",
            115200,
            Duration::from_millis(500),
        )
        .expect("Sensor not found");

        // Board resets on open
        tokio::time::sleep(Duration::from_secs(2)).await;
        session.discard_input();
        session.send(Command::Start).await.unwrap();

        for _ in 0..40 {
            if let Some(line) = session.read_line().await.unwrap() {
                println!("Received line: {:?}", String::from_utf8_lossy(&line));
                session.send(Command::Stop).await.unwrap();
                return;
            }
        }
        panic!("No line received within 20 seconds");
    }
}
