//! # Application Lifecycle
//!
//! Wires the store, link, monitor and controller together and owns the
//! startup and shutdown sequences.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::collection::CollectionController;
use crate::config::Config;
use crate::context::AppContext;
use crate::error::Result;
use crate::events::EventSink;
use crate::monitor::ConnectionMonitor;
use crate::sensor::protocol::Command;
use crate::serial::port_trait::PortOpener;
use crate::serial::LinkState;
use crate::store::ReadingStore;

/// Running logger: background monitor plus the collection controller
pub struct App {
    ctx: AppContext,
    controller: CollectionController,
    monitor: Option<JoinHandle<()>>,
    shutdown_grace: Duration,
}

impl App {
    /// Acquire the sensor link and start the connection monitor
    ///
    /// # Errors
    ///
    /// Returns `LoggerError::Connection` if the link cannot be opened. This
    /// is the one failure that aborts startup; later drops are recovered by
    /// the monitor.
    pub async fn start(
        config: &Config,
        opener: Arc<dyn PortOpener>,
        store: ReadingStore,
        events: EventSink,
    ) -> Result<Self> {
        let ctx = AppContext::new(store, events);
        let controller = CollectionController::new(&ctx, config.collection.clone());
        let monitor = ConnectionMonitor::new(
            &ctx,
            opener,
            config.serial.clone(),
            config.monitor.clone(),
            controller.clone(),
        );

        monitor.connect().await?;
        info!("Sensor link acquired at {}", config.serial.port);

        Ok(Self {
            ctx,
            controller,
            monitor: Some(tokio::spawn(monitor.run())),
            shutdown_grace: config.collection.shutdown_grace(),
        })
    }

    pub fn controller(&self) -> &CollectionController {
        &self.controller
    }

    pub fn context(&self) -> &AppContext {
        &self.ctx
    }

    /// Stop everything in order
    ///
    /// 1. Flag shutdown and mark any active run `Interrupted`
    /// 2. Wait for the monitor and acquisition tasks to exit
    /// 3. Send a final stop command, give the device a moment, close the port
    pub async fn shutdown(mut self) {
        info!("Shutting down...");
        self.ctx.request_shutdown();
        self.controller.interrupt("Collection interrupted").await;

        if let Some(monitor) = self.monitor.take() {
            if let Err(e) = monitor.await {
                warn!("Connection monitor task failed: {}", e);
            }
        }
        self.controller.wait().await;

        let stop_sent = {
            let mut slot = self.ctx.link.lock().await;
            match slot.connected_session() {
                Some(session) => match session.send(Command::Stop).await {
                    Ok(()) => true,
                    Err(e) => {
                        debug!("Final stop command not delivered: {}", e);
                        false
                    }
                },
                None => false,
            }
        };

        if stop_sent {
            sleep(self.shutdown_grace).await;
        }

        let was_connected = {
            let mut slot = self.ctx.link.lock().await;
            if let Some(mut session) = slot.session.take() {
                session.close();
            }
            let was_connected = slot.state == LinkState::Connected;
            slot.state = LinkState::Disconnected;
            was_connected
        };

        if was_connected {
            self.ctx.events.connectivity(false);
        }
        self.ctx.store.close().await;
        info!("Connections closed");
    }
}
