//! Progress reporting and UI notifications for sync operations
//!
//! Every notification is a one-way message on an unbounded channel, so the
//! engine never waits on whoever renders it. A dropped receiver is tolerated.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{Result, SyncError};

/// Notification emitted by the engine
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum SyncEvent {
    /// Per-item progress inside a phase
    Progress {
        source: String,
        message: String,
        current: usize,
        total: usize,
    },
    /// A sync (or single-source refresh) finished
    EndSync {
        source: String,
        destination: String,
    },
    /// A sync was abandoned
    CancelSync {
        source: String,
        message: String,
        link: Option<String>,
    },
    /// The contact list should be shown
    ShowContacts,
    /// The contact list items should be reloaded
    UpdateItems,
    /// Warning message
    Warning { message: String },
    /// Info message
    Info { message: String },
}

/// Receiving end of the notification stream
pub struct ProgressChannel {
    receiver: mpsc::UnboundedReceiver<SyncEvent>,
}

impl ProgressChannel {
    /// Create a new progress channel
    pub fn new() -> (ProgressReporter, Self) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let reporter = ProgressReporter::new(Some(sender));
        (reporter, Self { receiver })
    }

    /// Receive the next event
    pub async fn recv(&mut self) -> Option<SyncEvent> {
        self.receiver.recv().await
    }

    /// Try to receive an event without waiting
    pub fn try_recv(&mut self) -> Result<SyncEvent> {
        self.receiver.try_recv().map_err(|e| match e {
            mpsc::error::TryRecvError::Empty => {
                SyncError::Progress("No progress events available".to_string())
            }
            mpsc::error::TryRecvError::Disconnected => {
                SyncError::Progress("Progress channel disconnected".to_string())
            }
        })
    }

    /// Drain everything currently queued
    pub fn drain(&mut self) -> Vec<SyncEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.receiver.try_recv() {
            events.push(event);
        }
        events
    }

    /// Close the channel
    pub fn close(&mut self) {
        self.receiver.close();
    }
}

/// Sending end of the notification stream
#[derive(Clone)]
pub struct ProgressReporter {
    sender: Option<mpsc::UnboundedSender<SyncEvent>>,
    session_id: Uuid,
    start_time: Instant,
    state: Arc<RwLock<ProgressState>>,
}

#[derive(Debug, Default)]
struct ProgressState {
    events_sent: usize,
    events_dropped: usize,
    warnings: usize,
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::detached()
    }
}

impl ProgressReporter {
    fn new(sender: Option<mpsc::UnboundedSender<SyncEvent>>) -> Self {
        Self {
            sender,
            session_id: Uuid::new_v4(),
            start_time: Instant::now(),
            state: Arc::new(RwLock::new(ProgressState::default())),
        }
    }

    /// A reporter nobody listens to
    pub fn detached() -> Self {
        Self::new(None)
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn progress(
        &self,
        source: impl Into<String>,
        message: impl Into<String>,
        current: usize,
        total: usize,
    ) {
        self.send(SyncEvent::Progress {
            source: source.into(),
            message: message.into(),
            current,
            total,
        });
    }

    pub fn end_sync(&self, source: impl Into<String>, destination: impl Into<String>) {
        self.send(SyncEvent::EndSync {
            source: source.into(),
            destination: destination.into(),
        });
    }

    pub fn cancel_sync(
        &self,
        source: impl Into<String>,
        message: impl Into<String>,
        link: Option<String>,
    ) {
        self.send(SyncEvent::CancelSync {
            source: source.into(),
            message: message.into(),
            link,
        });
    }

    pub fn show_contacts(&self) {
        self.send(SyncEvent::ShowContacts);
    }

    pub fn update_items(&self) {
        self.send(SyncEvent::UpdateItems);
    }

    pub fn warning(&self, message: impl Into<String>) {
        self.state.write().warnings += 1;
        self.send(SyncEvent::Warning {
            message: message.into(),
        });
    }

    pub fn info(&self, message: impl Into<String>) {
        self.send(SyncEvent::Info {
            message: message.into(),
        });
    }

    /// Start a counter for one phase over `total` items
    pub fn phase(&self, source: impl Into<String>, verb: &'static str, total: usize) -> PhaseProgress {
        PhaseProgress {
            reporter: self.clone(),
            source: source.into(),
            verb,
            current: 0,
            total,
        }
    }

    /// Number of events delivered and dropped so far
    pub fn counts(&self) -> (usize, usize) {
        let state = self.state.read();
        (state.events_sent, state.events_dropped)
    }

    /// Number of warnings raised through this reporter and its clones
    pub fn warnings(&self) -> usize {
        self.state.read().warnings
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }

    fn send(&self, event: SyncEvent) {
        let delivered = match &self.sender {
            Some(sender) => sender.send(event).is_ok(),
            None => false,
        };

        let mut state = self.state.write();
        if delivered {
            state.events_sent += 1;
        } else {
            state.events_dropped += 1;
        }
    }
}

/// Monotonic `current/total` counter for a single phase
pub struct PhaseProgress {
    reporter: ProgressReporter,
    source: String,
    verb: &'static str,
    current: usize,
    total: usize,
}

impl PhaseProgress {
    /// Count one item and report it
    pub fn advance(&mut self) {
        self.current += 1;
        if self.current > self.total {
            self.total = self.current;
        }
        self.reporter.progress(
            self.source.clone(),
            format!("{} ({}/{})", self.verb, self.current, self.total),
            self.current,
            self.total,
        );
    }

    /// Switch the reported source name, keeping the count
    pub fn set_source(&mut self, source: impl Into<String>) {
        self.source = source.into();
    }

    pub fn current(&self) -> usize {
        self.current
    }

    pub fn total(&self) -> usize {
        self.total
    }
}
