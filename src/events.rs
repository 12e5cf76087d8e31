//! Change notifications
//!
//! Components that write entity status publish which kind of entity changed
//! so connected clients can refresh. Nobody listening is fine.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Change {
    Certificates,
    Hosts,
    Upstreams,
}

impl Change {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Certificates => "certificates",
            Self::Hosts => "hosts",
            Self::Upstreams => "upstreams",
        }
    }
}

/// Broadcasts [`Change`] events to any number of subscribers
#[derive(Clone)]
pub struct ChangeNotifier {
    tx: broadcast::Sender<Change>,
}

impl ChangeNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Change> {
        self.tx.subscribe()
    }

    pub fn send_change(&self, change: Change) {
        let receivers = self.tx.send(change).unwrap_or(0);
        trace!(change = change.as_str(), receivers, "Change notification sent");
    }
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        Self::new(64)
    }
}
