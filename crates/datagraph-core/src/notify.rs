use crate::identifier::Identifier;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationKind {
    Attributes,
    Relationships,
    State,
    Errors,
    Identity,
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NotificationKind::Attributes => "attributes",
            NotificationKind::Relationships => "relationships",
            NotificationKind::State => "state",
            NotificationKind::Errors => "errors",
            NotificationKind::Identity => "identity",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub identifier: Identifier,
    pub kind: NotificationKind,
    pub field: Option<String>,
}

impl Notification {
    pub fn new(identifier: Identifier, kind: NotificationKind, field: Option<String>) -> Self {
        Self {
            identifier,
            kind,
            field,
        }
    }
}

/// Receives every observable change. Delivery is synchronous.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, notification: &Notification);
}

/// Fans notifications out to registered sinks and a broadcast channel.
pub struct Notifier {
    sinks: Vec<Arc<dyn NotificationSink>>,
    tx: broadcast::Sender<Notification>,
}

impl Notifier {
    pub fn new(buffer: usize) -> Self {
        let (tx, _rx) = broadcast::channel(buffer.max(1));
        Self {
            sinks: Vec::new(),
            tx,
        }
    }

    pub fn add_sink(&mut self, sink: Arc<dyn NotificationSink>) {
        self.sinks.push(sink);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    pub fn notify(&self, identifier: &Identifier, kind: NotificationKind, field: Option<&str>) {
        let notification = Notification::new(identifier.clone(), kind, field.map(str::to_string));
        trace!("notify {} {} {:?}", identifier, kind, field);
        for sink in &self.sinks {
            sink.notify(&notification);
        }
        // no receivers is fine
        let _ = self.tx.send(notification);
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// Sink that records everything it sees.
#[derive(Default)]
pub struct CollectingSink {
    seen: Mutex<Vec<Notification>>,
}

impl CollectingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn take(&self) -> Vec<Notification> {
        std::mem::take(&mut *self.seen.lock())
    }

    pub fn snapshot(&self) -> Vec<Notification> {
        self.seen.lock().clone()
    }

    pub fn count(&self, kind: NotificationKind) -> usize {
        self.seen.lock().iter().filter(|n| n.kind == kind).count()
    }
}

impl NotificationSink for CollectingSink {
    fn notify(&self, notification: &Notification) {
        self.seen.lock().push(notification.clone());
    }
}
