use crate::index::ItemType;
use serde::Serialize;
use tokio::sync::broadcast;

/// Structural change to the binder, published after it has been applied.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type")]
pub enum BinderEvent {
    Created {
        id: String,
        parent: Option<String>,
        item_type: ItemType,
    },
    Renamed {
        id: String,
        title: String,
    },
    Moved {
        id: String,
        new_parent: Option<String>,
    },
    Trashed {
        id: String,
    },
    Recovered {
        id: String,
        new_parent: Option<String>,
    },
    MetadataUpdated {
        id: String,
    },
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BinderEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(100);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BinderEvent> {
        self.tx.subscribe()
    }

    /// Publish to current subscribers; having none is not an error.
    pub fn send(&self, event: BinderEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
