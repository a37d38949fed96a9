//! # Connection Monitor
//!
//! Background loop that keeps the sensor link alive.
//!
//! ```text
//! Disconnected --open ok--> Connected --probe fails--> Disconnected
//! ```
//!
//! While disconnected it tries to open a fresh session once per polling
//! interval. While connected it writes a harmless probe byte once per
//! interval. A probe only proves the write side works, so the monitor can
//! also require recent incoming bytes while a run is active (see
//! `MonitorConfig::max_read_silence_ms`).

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{debug, info};

use crate::collection::CollectionController;
use crate::config::{MonitorConfig, SerialConfig};
use crate::context::AppContext;
use crate::error::{LoggerError, Result};
use crate::events::Severity;
use crate::sensor::protocol::Command;
use crate::serial::port_trait::PortOpener;
use crate::serial::{LinkSession, LinkState};

/// Longest single sleep, so shutdown is noticed promptly
const SHUTDOWN_CHECK_SLICE: Duration = Duration::from_millis(50);

pub struct ConnectionMonitor {
    ctx: AppContext,
    opener: Arc<dyn PortOpener>,
    serial: SerialConfig,
    config: MonitorConfig,
    controller: CollectionController,
}

impl ConnectionMonitor {
    pub fn new(
        ctx: &AppContext,
        opener: Arc<dyn PortOpener>,
        serial: SerialConfig,
        config: MonitorConfig,
        controller: CollectionController,
    ) -> Self {
        Self {
            ctx: ctx.clone(),
            opener,
            serial,
            config,
            controller,
        }
    }

    /// Run until shutdown is requested
    pub async fn run(self) {
        info!("Connection monitor started for {}", self.serial.port);

        while !self.ctx.is_shutting_down() {
            match self.ctx.link.state().await {
                LinkState::Disconnected => {
                    if let Err(e) = self.connect().await {
                        debug!("Connection attempt failed: {}", e);
                    }
                }
                LinkState::Connected => {
                    if let Err(e) = self.check_health().await {
                        info!("Disconnection detected: {}", e);
                        self.handle_disconnection(&e.to_string()).await;
                        self.pause(self.config.cooldown()).await;
                    }
                }
            }

            self.pause(self.config.poll_interval()).await;
        }

        info!("Connection monitor stopped");
    }

    /// Open a fresh session and mark the link connected
    ///
    /// Any stale session is closed first. After a successful open the lock
    /// is held through the stabilization delay so nothing talks to the
    /// device while it resets.
    ///
    /// # Errors
    ///
    /// Returns `LoggerError::Connection` if the port cannot be opened
    pub async fn connect(&self) -> Result<()> {
        let mut slot = self.ctx.link.lock().await;

        if let Some(mut stale) = slot.session.take() {
            stale.close();
        }

        let session = LinkSession::open(
            self.opener.as_ref(),
            &self.serial.port,
            self.serial.baud_rate,
            self.serial.read_timeout(),
        )?;
        slot.session = Some(session);
        slot.state = LinkState::Connected;

        self.ctx.events.connectivity(true);
        self.ctx.events.status("Sensor Status: Connected", Severity::Success);

        sleep(self.config.stabilize()).await;
        if let Some(session) = slot.session.as_mut() {
            session.discard_input();
        }

        Ok(())
    }

    /// Probe the link once
    async fn check_health(&self) -> Result<()> {
        let mut silence_window = self.config.max_read_silence();
        if silence_window.is_some() && !self.controller.is_running().await {
            silence_window = None;
        }

        let mut slot = self.ctx.link.lock().await;
        let session = slot
            .connected_session()
            .ok_or_else(|| LoggerError::Connection("Port closed".to_string()))?;

        session.send(Command::Probe).await?;

        if let Some(window) = silence_window {
            let silent_for = session.last_activity().elapsed();
            if silent_for > window {
                return Err(LoggerError::Connection(format!(
                    "No data received for {:?} during collection",
                    silent_for
                )));
            }
        }

        Ok(())
    }

    /// Take the link down and end any active run
    async fn handle_disconnection(&self, reason: &str) {
        self.ctx.link.disconnect(&self.ctx.events, reason).await;
        self.controller.interrupt("Connection lost during collection").await;
    }

    /// Sleep, waking early on shutdown
    async fn pause(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        while !self.ctx.is_shutting_down() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            sleep((deadline - now).min(SHUTDOWN_CHECK_SLICE)).await;
        }
    }
}
