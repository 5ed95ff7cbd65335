//! Engine events.
//!
//! Components receive an [`EventSink`] at construction and emit typed
//! events into it. Observers call [`EventSink::subscribe`] and get a
//! [`Subscription`]; dropping the subscription unsubscribes.

use sync_types::DeviceId;
use tokio::sync::broadcast;

/// Events buffered per subscriber before the slowest one starts lagging.
const EVENT_BUFFER: usize = 1024;

/// Coarse activity of a folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FolderState {
    /// Nothing running.
    Idle,
    /// Walking the folder and hashing changes.
    Scanning,
    /// Running a pull cycle.
    Syncing,
    /// The folder root is unusable.
    Error,
}

/// What a pull job does to a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemAction {
    /// Create or replace content.
    Update,
    /// Apply metadata only.
    Metadata,
    /// Remove the entry.
    Delete,
}

/// Local index changed by a scan or a finished pull.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIndexUpdated {
    /// Folder ID.
    pub folder: String,
    /// Names of the changed records.
    pub names: Vec<String>,
}

/// A peer announced index records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteIndexUpdated {
    /// Folder ID.
    pub folder: String,
    /// Announcing device.
    pub device: DeviceId,
    /// Number of records received.
    pub items: usize,
}

/// A pull job started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemStarted {
    /// Folder ID.
    pub folder: String,
    /// File name.
    pub name: String,
    /// Kind of change.
    pub action: ItemAction,
}

/// A pull job reached a terminal state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemFinished {
    /// Folder ID.
    pub folder: String,
    /// File name.
    pub name: String,
    /// Kind of change.
    pub action: ItemAction,
    /// Failure cause, `None` on success.
    pub error: Option<String>,
}

/// A per-file or folder-wide failure worth showing to an operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderError {
    /// Folder ID.
    pub folder: String,
    /// Affected file, if the failure is per file.
    pub name: Option<String>,
    /// Low-level cause.
    pub error: String,
}

/// Folder moved between activity states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChanged {
    /// Folder ID.
    pub folder: String,
    /// Previous state.
    pub from: FolderState,
    /// New state.
    pub to: FolderState,
}

/// Everything the engine reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// See [`LocalIndexUpdated`].
    LocalIndexUpdated(LocalIndexUpdated),
    /// See [`RemoteIndexUpdated`].
    RemoteIndexUpdated(RemoteIndexUpdated),
    /// See [`ItemStarted`].
    ItemStarted(ItemStarted),
    /// See [`ItemFinished`].
    ItemFinished(ItemFinished),
    /// See [`FolderError`].
    FolderError(FolderError),
    /// See [`StateChanged`].
    StateChanged(StateChanged),
}

/// Cloneable handle components emit events through.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: broadcast::Sender<Event>,
}

impl EventSink {
    /// Create a sink with no subscribers.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUFFER);
        Self { tx }
    }

    /// Emit an event. Events emitted while nobody is subscribed are dropped.
    pub fn emit(&self, event: Event) {
        let _ = self.tx.send(event);
    }

    /// Start receiving events emitted from now on.
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
        }
    }

    /// Number of live subscriptions.
    pub fn subscribers(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new()
    }
}

/// Scoped event subscription. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    rx: broadcast::Receiver<Event>,
}

impl Subscription {
    /// Wait for the next event. Returns `None` once every sink is gone.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event subscriber lagging, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next already-emitted event, if any.
    pub fn try_recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }

    /// Drain every already-emitted event.
    pub fn drain(&mut self) -> Vec<Event> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn folder_error(error: &str) -> Event {
        Event::FolderError(FolderError {
            folder: "default".into(),
            name: None,
            error: error.into(),
        })
    }

    #[tokio::test]
    async fn subscriber_receives_events() {
        let sink = EventSink::new();
        let mut sub = sink.subscribe();

        sink.emit(folder_error("disk full"));

        assert_eq!(sub.recv().await, Some(folder_error("disk full")));
    }

    #[test]
    fn dropping_subscription_unsubscribes() {
        let sink = EventSink::new();
        let sub = sink.subscribe();
        assert_eq!(sink.subscribers(), 1);
        drop(sub);
        assert_eq!(sink.subscribers(), 0);
    }

    #[test]
    fn emit_without_subscribers_is_fine() {
        let sink = EventSink::new();
        sink.emit(folder_error("nobody listens"));
    }

    #[test]
    fn drain_returns_in_order() {
        let sink = EventSink::new();
        let mut sub = sink.subscribe();
        sink.emit(folder_error("a"));
        sink.emit(folder_error("b"));

        assert_eq!(sub.drain(), vec![folder_error("a"), folder_error("b")]);
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn recv_ends_when_sink_dropped() {
        let sink = EventSink::new();
        let mut sub = sink.subscribe();
        drop(sink);
        assert_eq!(sub.recv().await, None);
    }
}
