//! # Collection Controller
//!
//! Drives one acquisition run at a time: sends the start command, routes
//! incoming lines to the store, tracks `Loop: N` progress and decides how
//! the run ends.
//!
//! A run ends in exactly one of three ways:
//! - `Completed` - the firmware reported the last loop or sent `Complete:`
//! - `Incomplete` - the timeout elapsed first
//! - `Interrupted` - the link dropped, `stop()` was called, or the process is shutting down

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::config::CollectionConfig;
use crate::context::AppContext;
use crate::error::{LoggerError, Result};
use crate::events::Severity;
use crate::sensor::decoder::parse_line;
use crate::sensor::protocol::{Command, ParsedLine, StatusEvent};

/// Lifecycle of a collection run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionState {
    Idle,
    Running,
    Completed,
    Incomplete,
    Interrupted,
}

/// Progress of the current or last run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub loops: u32,
    pub total: u32,
}

impl Progress {
    pub fn percent(&self) -> f64 {
        f64::from(self.loops) / f64::from(self.total) * 100.0
    }
}

#[derive(Debug)]
struct RunStatus {
    state: CollectionState,
    loops: u32,
    /// Bumped on every start so a finished task cannot touch a newer run
    generation: u64,
    task: Option<JoinHandle<()>>,
}

struct Inner {
    ctx: AppContext,
    config: CollectionConfig,
    run: Mutex<RunStatus>,
    /// Generation of the active run, 0 when none is running.
    /// Readable under the link lock without taking the run lock.
    active_generation: AtomicU64,
}

impl Inner {
    /// Change the run state; callers hold the run lock
    fn set_state(&self, run: &mut RunStatus, state: CollectionState) {
        run.state = state;
        let active = if state == CollectionState::Running { run.generation } else { 0 };
        self.active_generation.store(active, Ordering::SeqCst);
    }
}

/// Handle to the collection controller, cheap to clone
#[derive(Clone)]
pub struct CollectionController {
    inner: Arc<Inner>,
}

/// What one read attempt produced
enum Poll {
    Line(bytes::Bytes),
    Idle,
    LinkDown,
    /// The run ended while waiting for the link
    Stale,
}

impl CollectionController {
    pub fn new(ctx: &AppContext, config: CollectionConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                ctx: ctx.clone(),
                config,
                run: Mutex::new(RunStatus {
                    state: CollectionState::Idle,
                    loops: 0,
                    generation: 0,
                    task: None,
                }),
                active_generation: AtomicU64::new(0),
            }),
        }
    }

    /// Start a collection run
    ///
    /// # Errors
    ///
    /// * `LoggerError::AlreadyRunning` - a run is active
    /// * `LoggerError::NotConnected` - the sensor link is down
    /// * `LoggerError::Connection` - the start command could not be written
    pub async fn start(&self) -> Result<()> {
        let inner = &self.inner;
        let mut run = inner.run.lock().await;

        if run.state == CollectionState::Running {
            inner.ctx.events.status("Already collecting data", Severity::Warning);
            return Err(LoggerError::AlreadyRunning);
        }

        let sent = {
            let mut slot = inner.ctx.link.lock().await;
            match slot.connected_session() {
                None => None,
                Some(session) => {
                    session.discard_input();
                    Some(session.send(Command::Start).await)
                }
            }
        };

        match sent {
            None => {
                inner.ctx.events.status("Cannot Start: Not Connected", Severity::Error);
                return Err(LoggerError::NotConnected);
            }
            Some(Err(e)) => {
                warn!("Start failed: {}", e);
                inner.ctx.link.disconnect(&inner.ctx.events, "start command failed").await;
                inner.ctx.events.status("Start Failed: Disconnected", Severity::Error);
                return Err(e);
            }
            Some(Ok(())) => {}
        }

        run.loops = 0;
        run.generation += 1;
        inner.set_state(&mut run, CollectionState::Running);
        let generation = run.generation;

        info!("Collection run {} started", generation);
        inner.ctx.events.status("Data Collection: Started", Severity::Info);
        inner.ctx.events.progress(0.0);

        let controller = self.clone();
        run.task = Some(tokio::spawn(async move {
            controller.acquire(generation).await;
        }));

        Ok(())
    }

    /// Ask the device to stop and end any active run as `Interrupted`
    ///
    /// The stop command is best effort; a write failure is only logged.
    pub async fn stop(&self) {
        let inner = &self.inner;
        let mut run = inner.run.lock().await;

        {
            let mut slot = inner.ctx.link.lock().await;
            if let Some(session) = slot.connected_session() {
                if let Err(e) = session.send(Command::Stop).await {
                    debug!("Stop command not delivered: {}", e);
                }
            }
        }

        if run.state == CollectionState::Running {
            inner.set_state(&mut run, CollectionState::Interrupted);
            info!("Collection run {} stopped by user", run.generation);
            inner.ctx.events.status("Data Collection: Stopped", Severity::Warning);
        }
    }

    /// End an active run as `Interrupted`
    ///
    /// Called when the link drops and on shutdown.
    ///
    /// # Returns
    ///
    /// * `bool` - Whether a run was active
    pub async fn interrupt(&self, reason: &str) -> bool {
        let mut run = self.inner.run.lock().await;
        if run.state != CollectionState::Running {
            return false;
        }
        self.inner.set_state(&mut run, CollectionState::Interrupted);
        warn!("Collection run {} interrupted: {}", run.generation, reason);
        self.inner.ctx.events.status(reason, Severity::Warning);
        true
    }

    pub async fn state(&self) -> CollectionState {
        self.inner.run.lock().await.state
    }

    pub async fn is_running(&self) -> bool {
        self.state().await == CollectionState::Running
    }

    pub async fn progress(&self) -> Progress {
        let run = self.inner.run.lock().await;
        Progress {
            loops: run.loops,
            total: self.inner.config.total_loops,
        }
    }

    /// Wait for the acquisition task of the latest run to exit
    ///
    /// # Returns
    ///
    /// * `CollectionState` - State after the task exited
    pub async fn wait(&self) -> CollectionState {
        let task = self.inner.run.lock().await.task.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Acquisition task failed: {}", e);
            }
        }
        self.state().await
    }

    async fn acquire(&self, generation: u64) {
        let inner = &self.inner;
        let started = Instant::now();
        let timeout = inner.config.timeout();

        loop {
            if inner.ctx.is_shutting_down() || !self.is_current(generation).await {
                return;
            }

            if started.elapsed() >= timeout {
                info!("Data collection timeout after {:?}", timeout);
                self.finish(generation, CollectionState::Incomplete).await;
                return;
            }

            match self.poll_line(generation).await {
                Poll::Stale => return,
                Poll::LinkDown => {
                    self.finish(generation, CollectionState::Interrupted).await;
                    return;
                }
                Poll::Idle => sleep(inner.config.idle_sleep()).await,
                Poll::Line(raw) => {
                    debug!("Received: {:?}", String::from_utf8_lossy(&raw));
                    if let Some(outcome) = self.route(generation, &raw).await {
                        self.finish(generation, outcome).await;
                        return;
                    }
                }
            }
        }
    }

    /// Read one line while holding the link lock
    ///
    /// Nothing is read once `generation` is no longer the active run, so a
    /// finished task never consumes input meant for the next run.
    async fn poll_line(&self, generation: u64) -> Poll {
        let inner = &self.inner;
        let result = {
            let mut slot = inner.ctx.link.lock().await;
            if inner.active_generation.load(Ordering::SeqCst) != generation {
                return Poll::Stale;
            }
            match slot.connected_session() {
                None => return Poll::LinkDown,
                Some(session) => session.read_line().await,
            }
        };

        match result {
            Ok(Some(line)) => Poll::Line(line),
            Ok(None) => Poll::Idle,
            Err(e) => {
                warn!("Serial error during collection: {}", e);
                inner.ctx.link.disconnect(&inner.ctx.events, "read failed during collection").await;
                Poll::LinkDown
            }
        }
    }

    /// Handle one line, returning the final state if it ends the run
    async fn route(&self, generation: u64, raw: &[u8]) -> Option<CollectionState> {
        let inner = &self.inner;

        match parse_line(raw)? {
            ParsedLine::Sample(sample) => {
                match inner.ctx.store.insert(&sample).await {
                    Ok(reading) => info!(
                        "Saved reading {}: moisture {:?}, temperature {:?}, humidity {:?}",
                        reading.id, reading.moisture_percent, reading.temperature, reading.humidity
                    ),
                    Err(e) => warn!("Error saving reading {:?}: {}", sample, e),
                }
                None
            }
            ParsedLine::Status(StatusEvent::Loop(loops)) => {
                let total = inner.config.total_loops;
                {
                    let mut run = inner.run.lock().await;
                    if run.generation != generation || run.state != CollectionState::Running {
                        return None;
                    }
                    run.loops = loops;
                }
                debug!("Updated loop: {}/{}", loops, total);
                inner.ctx.events.progress(Progress { loops, total }.percent());
                (loops >= total).then_some(CollectionState::Completed)
            }
            ParsedLine::Status(StatusEvent::Complete(message)) => {
                info!("Device reported completion: {}", message);
                Some(CollectionState::Completed)
            }
            ParsedLine::Status(StatusEvent::Started(text) | StatusEvent::Stopped(text)) => {
                inner.ctx.events.status(format!("Sensor Status: {}", text), Severity::Info);
                None
            }
        }
    }

    async fn is_current(&self, generation: u64) -> bool {
        let run = self.inner.run.lock().await;
        run.generation == generation && run.state == CollectionState::Running
    }

    /// Record the outcome unless the run was already ended elsewhere
    async fn finish(&self, generation: u64, outcome: CollectionState) {
        let inner = &self.inner;
        let mut run = inner.run.lock().await;
        if run.generation != generation || run.state != CollectionState::Running {
            return;
        }
        inner.set_state(&mut run, outcome);

        info!("Collection run {} ended: {:?} ({}/{} loops)", generation, outcome, run.loops, inner.config.total_loops);
        match outcome {
            CollectionState::Completed => {
                inner.ctx.events.progress(100.0);
                inner.ctx.events.status("Data Collection: Complete", Severity::Success);
            }
            CollectionState::Interrupted => {
                inner.ctx.events.status("Connection lost during collection", Severity::Warning);
            }
            _ => inner.ctx.events.status("Data Collection: Incomplete", Severity::Error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{self, EventReceiver, UiEvent};
    use crate::serial::port_trait::mocks::MockSerialPort;
    use crate::serial::{LinkSession, LinkState, SharedLink};
    use crate::store::ReadingStore;
    use std::time::Duration;

    fn test_config() -> CollectionConfig {
        CollectionConfig {
            total_loops: 5,
            timeout_s: 30,
            idle_sleep_ms: 5,
            shutdown_grace_ms: 0,
        }
    }

    struct Fixture {
        controller: CollectionController,
        port: MockSerialPort,
        link: SharedLink,
        store: ReadingStore,
        events: EventReceiver,
    }

    async fn fixture(config: CollectionConfig) -> Fixture {
        let port = MockSerialPort::new();
        let link = SharedLink::new();
        {
            let mut slot = link.lock().await;
            slot.session = Some(LinkSession::from_port(
                Box::new(port.clone()),
                "/dev/mock0",
                Duration::from_millis(10),
            ));
            slot.state = LinkState::Connected;
        }
        let store = ReadingStore::open_in_memory().await.unwrap();
        let (sink, events) = events::channel();
        let mut ctx = AppContext::new(store.clone(), sink);
        ctx.link = link.clone();
        let controller = CollectionController::new(&ctx, config);
        Fixture { controller, port, link, store, events }
    }

    fn drain(rx: &mut EventReceiver) -> Vec<UiEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn test_full_run_completes_and_stores_readings() {
        let mut f = fixture(test_config()).await;
        f.port.push_incoming(b"Started\n");
        for i in 1..=5 {
            f.port.push_incoming(format!("50.15,21.0{},40.00\nLoop: {}\n", i, i).as_bytes());
        }
        f.port.push_incoming(b"Complete: Finished 5 loops\n");

        f.controller.start().await.unwrap();
        assert_eq!(f.controller.wait().await, CollectionState::Completed);

        assert_eq!(f.store.count().await.unwrap(), 5);
        assert_eq!(f.controller.progress().await, Progress { loops: 5, total: 5 });
        assert_eq!(f.port.written_bytes(), vec![b'S']);

        let events = drain(&mut f.events);
        assert!(events.contains(&UiEvent::Progress(60.0)));
        assert!(events.contains(&UiEvent::Status {
            text: "Data Collection: Complete".to_string(),
            severity: Severity::Success,
        }));
    }

    #[tokio::test]
    async fn test_loop_report_updates_progress() {
        let mut f = fixture(test_config()).await;
        f.port.push_incoming(b"Loop: 3\n");

        f.controller.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(f.controller.progress().await, Progress { loops: 3, total: 5 });
        assert!(f.controller.is_running().await);
        assert!(drain(&mut f.events).contains(&UiEvent::Progress(60.0)));

        f.controller.stop().await;
    }

    #[tokio::test]
    async fn test_complete_marker_ends_run_early() {
        let f = fixture(test_config()).await;
        f.port.push_incoming(b"Loop: 1\nComplete: Finished 1 loops\n");

        f.controller.start().await.unwrap();
        assert_eq!(f.controller.wait().await, CollectionState::Completed);
        assert_eq!(f.controller.progress().await.loops, 1);
    }

    #[tokio::test]
    async fn test_status_and_garbage_lines_are_not_stored() {
        let f = fixture(test_config()).await;
        f.port.push_incoming(b"Started\n\xff\xfe\n1,2\nabc,1,2\nStopped\n\n");
        f.port.push_incoming(b"Loop: 1\n42.5,21.3,60.1\nComplete: done\n");

        f.controller.start().await.unwrap();
        assert_eq!(f.controller.wait().await, CollectionState::Completed);

        let stored = f.store.all().await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].moisture_percent, Some(42.5));
        assert_eq!(stored[0].temperature, Some(21.3));
        assert_eq!(stored[0].humidity, Some(60.1));
    }

    #[tokio::test]
    async fn test_store_failure_does_not_end_run() {
        let f = fixture(test_config()).await;
        f.store.close().await;
        f.port.push_incoming(b"42.5,21.3,60.1\nLoop: 5\n");

        f.controller.start().await.unwrap();
        assert_eq!(f.controller.wait().await, CollectionState::Completed);
        assert_eq!(f.controller.progress().await.loops, 5);
    }

    #[tokio::test]
    async fn test_nan_moisture_line_is_stored_as_null() {
        let f = fixture(test_config()).await;
        f.port.push_incoming(b"nan,20.0,30.0\nComplete: done\n");

        f.controller.start().await.unwrap();
        assert_eq!(f.controller.wait().await, CollectionState::Completed);

        let stored = f.store.all().await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].moisture_percent, None);
        assert_eq!(stored[0].temperature, Some(20.0));
    }

    #[tokio::test]
    async fn test_silent_link_times_out_as_incomplete() {
        let mut config = test_config();
        config.timeout_s = 1;
        let f = fixture(config).await;
        f.port.push_incoming(b"Started\nLoop: 1\n");

        let started = std::time::Instant::now();
        f.controller.start().await.unwrap();
        let state = f.controller.wait().await;

        assert_eq!(state, CollectionState::Incomplete);
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert_eq!(f.controller.progress().await.loops, 1);
    }

    #[tokio::test]
    async fn test_start_when_disconnected_fails() {
        let f = fixture(test_config()).await;
        f.link.lock().await.state = LinkState::Disconnected;

        assert!(matches!(f.controller.start().await, Err(LoggerError::NotConnected)));
        assert_eq!(f.controller.state().await, CollectionState::Idle);
        assert!(f.port.written_bytes().is_empty());
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let f = fixture(test_config()).await;

        f.controller.start().await.unwrap();
        assert!(matches!(f.controller.start().await, Err(LoggerError::AlreadyRunning)));
        assert_eq!(f.port.written_bytes(), vec![b'S']);

        f.controller.stop().await;
    }

    #[tokio::test]
    async fn test_start_write_failure_disconnects() {
        let f = fixture(test_config()).await;
        f.port.set_write_error(std::io::ErrorKind::BrokenPipe);

        assert!(matches!(f.controller.start().await, Err(LoggerError::Connection(_))));
        assert_eq!(f.link.state().await, LinkState::Disconnected);
        assert_eq!(f.controller.state().await, CollectionState::Idle);
    }

    #[tokio::test]
    async fn test_stop_mid_run_interrupts() {
        let f = fixture(test_config()).await;
        f.port.push_incoming(b"Started\nLoop: 1\n");

        f.controller.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        f.controller.stop().await;

        assert_eq!(f.controller.wait().await, CollectionState::Interrupted);
        assert_eq!(f.port.written_bytes(), vec![b'S', b'X']);
    }

    #[tokio::test]
    async fn test_stop_swallows_write_failure() {
        let f = fixture(test_config()).await;
        f.controller.start().await.unwrap();
        f.port.set_write_error(std::io::ErrorKind::BrokenPipe);

        f.controller.stop().await;
        assert_eq!(f.controller.wait().await, CollectionState::Interrupted);
    }

    #[tokio::test]
    async fn test_stop_when_idle_keeps_idle() {
        let f = fixture(test_config()).await;
        f.controller.stop().await;
        assert_eq!(f.controller.state().await, CollectionState::Idle);
        assert_eq!(f.port.written_bytes(), vec![b'X']);
    }

    #[tokio::test]
    async fn test_link_loss_mid_run_interrupts() {
        let f = fixture(test_config()).await;
        f.controller.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        f.port.set_read_error(std::io::ErrorKind::BrokenPipe);

        assert_eq!(f.controller.wait().await, CollectionState::Interrupted);
        assert_eq!(f.link.state().await, LinkState::Disconnected);
    }

    #[tokio::test]
    async fn test_interrupt_only_affects_active_run() {
        let f = fixture(test_config()).await;
        assert!(!f.controller.interrupt("Collection interrupted").await);

        f.controller.start().await.unwrap();
        assert!(f.controller.interrupt("Collection interrupted").await);
        assert_eq!(f.controller.wait().await, CollectionState::Interrupted);
    }

    #[tokio::test]
    async fn test_new_run_after_finished_run() {
        let f = fixture(test_config()).await;
        f.port.push_incoming(b"Complete: done\n");
        f.controller.start().await.unwrap();
        assert_eq!(f.controller.wait().await, CollectionState::Completed);

        f.controller.start().await.unwrap();
        assert_eq!(f.controller.state().await, CollectionState::Running);
        assert_eq!(f.controller.progress().await.loops, 0);
        f.controller.stop().await;
        assert_eq!(f.controller.wait().await, CollectionState::Interrupted);
    }

    #[tokio::test]
    async fn test_ended_run_leaves_input_for_next_run() {
        let f = fixture(test_config()).await;
        f.controller.start().await.unwrap();
        f.controller.stop().await;
        f.controller.wait().await;

        f.controller.start().await.unwrap();
        f.controller.stop().await;
        f.controller.wait().await;
        f.port.push_incoming(b"Loop: 2\n");

        // Neither ended run may consume the line
        assert!(matches!(f.controller.poll_line(1).await, Poll::Stale));
        assert!(matches!(f.controller.poll_line(2).await, Poll::Stale));

        let mut slot = f.link.lock().await;
        let line = slot.connected_session().unwrap().read_line().await.unwrap();
        assert_eq!(line.as_deref(), Some(&b"Loop: 2\n"[..]));
    }

    #[tokio::test]
    async fn test_active_run_polls_its_input() {
        let f = fixture(test_config()).await;
        f.controller.start().await.unwrap();
        f.controller.stop().await;
        f.controller.wait().await;

        // Generation 2 is active; pretend its task is the one polling
        {
            let mut run = f.controller.inner.run.lock().await;
            run.generation = 2;
            f.controller.inner.set_state(&mut run, CollectionState::Running);
        }
        f.port.push_incoming(b"Loop: 2\n");

        assert!(matches!(f.controller.poll_line(1).await, Poll::Stale));
        match f.controller.poll_line(2).await {
            Poll::Line(line) => assert_eq!(&line[..], b"Loop: 2\n"),
            _ => panic!("expected the buffered line"),
        }
    }

    #[test]
    fn test_progress_percent() {
        assert_eq!(Progress { loops: 3, total: 5 }.percent(), 60.0);
        assert_eq!(Progress { loops: 0, total: 5 }.percent(), 0.0);
    }
}
