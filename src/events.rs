//! # UI Event Queue
//!
//! Background tasks never touch presentation state directly. They push
//! [`UiEvent`]s into an unbounded channel that the front end drains on its
//! own schedule.

use tokio::sync::mpsc;
use tracing::trace;

/// How prominently a status message should be shown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

/// Update for the presentation layer
#[derive(Debug, Clone, PartialEq)]
pub enum UiEvent {
    /// Status line text
    Status { text: String, severity: Severity },

    /// Collection progress in percent (0-100)
    Progress(f64),

    /// Sensor link connectivity indicator
    Connectivity(bool),
}

/// Receiving half of the event queue
pub type EventReceiver = mpsc::UnboundedReceiver<UiEvent>;

/// Sending half of the event queue, cheap to clone
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<UiEvent>,
}

/// Create a connected sink/receiver pair
pub fn channel() -> (EventSink, EventReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSink { tx }, rx)
}

impl EventSink {
    pub fn status(&self, text: impl Into<String>, severity: Severity) {
        self.emit(UiEvent::Status { text: text.into(), severity });
    }

    pub fn progress(&self, percent: f64) {
        self.emit(UiEvent::Progress(percent.clamp(0.0, 100.0)));
    }

    pub fn connectivity(&self, connected: bool) {
        self.emit(UiEvent::Connectivity(connected));
    }

    fn emit(&self, event: UiEvent) {
        // A closed queue only means nobody is rendering any more
        if self.tx.send(event).is_err() {
            trace!("Event queue closed, dropping UI event");
        }
    }
}
