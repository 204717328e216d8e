//! Event system for contact operations
//!
//! Events are emitted only after the identify transaction has committed.

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

use crate::db::{ContactId, LinkPrecedence};

/// Contact events emitted by services
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContactEvent {
    ContactCreated {
        id: ContactId,
        link_precedence: LinkPrecedence,
        linked_id: Option<ContactId>,
    },
    GroupsMerged {
        primary_id: ContactId,
        demoted_ids: Vec<ContactId>,
    },
}

/// Trait for event listeners
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &ContactEvent);
}

/// Event bus for broadcasting contact events
pub struct EventBus {
    sender: broadcast::Sender<ContactEvent>,
}

impl EventBus {
    /// Create a new event bus with default capacity
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all subscribers
    pub fn emit(&self, event: ContactEvent) {
        trace!(event = ?event, "Emitting contact event");
        // No subscribers is fine
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ContactEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Logging event listener for audit trails
pub struct LoggingEventListener;

impl EventListener for LoggingEventListener {
    fn on_event(&self, event: &ContactEvent) {
        match event {
            ContactEvent::ContactCreated {
                id,
                link_precedence,
                linked_id,
            } => {
                debug!(id, precedence = %link_precedence, linked_id = ?linked_id, "Contact created");
            }
            ContactEvent::GroupsMerged {
                primary_id,
                demoted_ids,
            } => {
                info!(primary_id, demoted = ?demoted_ids, "Identity groups merged");
            }
        }
    }
}

/// Spawn a background task that logs all events
pub fn spawn_logging_listener(event_bus: Arc<EventBus>) -> tokio::task::JoinHandle<()> {
    let mut receiver = event_bus.subscribe();
    let listener = LoggingEventListener;

    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => listener.on_event(&event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!(skipped = n, "Event listener lagged, skipped events");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Event bus closed, stopping listener");
                    break;
                }
            }
        }
    })
}

/// Wait for a listener task to drain after the bus is dropped.
///
/// Returns false when the task panicked or was cancelled.
pub async fn join_listener(handle: tokio::task::JoinHandle<()>) -> bool {
    match handle.await {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "Event listener task failed");
            false
        }
    }
}
