//! Shared handles owned by the running application

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::events::EventSink;
use crate::serial::SharedLink;
use crate::store::ReadingStore;

/// Everything the background components share
///
/// Built once at startup and cloned into each component.
#[derive(Debug, Clone)]
pub struct AppContext {
    pub link: SharedLink,
    pub store: ReadingStore,
    pub events: EventSink,
    shutdown: Arc<AtomicBool>,
}

impl AppContext {
    pub fn new(store: ReadingStore, events: EventSink) -> Self {
        Self {
            link: SharedLink::new(),
            store,
            events,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Ask every background loop to exit at its next check
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}
