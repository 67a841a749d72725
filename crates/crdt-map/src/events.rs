//! Event infrastructure for `CrdtMap`.
//!
//! A map publishes two kinds of events:
//! - `update`: a local edit was committed or an incremental remote update was applied
//! - `snapshot`: a complete snapshot was merged into the map
//!
//! Listeners are registered per kind and identified by a `SubscriptionId`
//! that the caller keeps as a plain value and hands back to unsubscribe.

use serde::Serialize;
use std::fmt::{self, Display, Formatter};
use std::sync::{Arc, RwLock};
use uuid::Uuid;

/// The two event channels a map exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    Update,
    Snapshot,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Update => "update",
            EventKind::Snapshot => "snapshot",
        }
    }
}

impl Display for EventKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Origin {
    /// Edit made through this replica's API.
    Local,
    /// Update received from another replica.
    Remote,
}

/// Event emitted by a map after its state changed.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DocumentEvent {
    /// Incremental change.
    Update {
        origin: Origin,
        /// Encoded Loro update covering exactly this change.
        update: Vec<u8>,
    },
    /// A full snapshot was merged.
    Snapshot {
        /// Snapshot size in bytes.
        size: usize,
    },
}

impl DocumentEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            DocumentEvent::Update { .. } => EventKind::Update,
            DocumentEvent::Snapshot { .. } => EventKind::Snapshot,
        }
    }
}

/// Handle identifying one listener registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Display for SubscriptionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Listener callback shared between the bus and in-flight emits.
pub type EventHandler = Arc<dyn Fn(&DocumentEvent) + Send + Sync>;

/// Event bus for publishing map events to listeners.
///
/// Thread-safe; listeners may be invoked from whichever thread mutated the map.
#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<Vec<(EventKind, SubscriptionId, EventHandler)>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for one event kind.
    pub fn subscribe(&self, kind: EventKind, handler: EventHandler) -> SubscriptionId {
        let id = SubscriptionId::new();
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((kind, id, handler));
        id
    }

    /// Remove a listener. Returns false if it was not registered under `kind`.
    pub fn unsubscribe(&self, kind: EventKind, id: SubscriptionId) -> bool {
        let mut guard = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        let before = guard.len();
        guard.retain(|(k, i, _)| !(*k == kind && *i == id));
        guard.len() != before
    }

    /// Number of listeners registered for `kind`.
    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(k, _, _)| *k == kind)
            .count()
    }

    /// Emit an event to every listener of its kind.
    pub fn emit(&self, event: &DocumentEvent) {
        let kind = event.kind();
        // Clone the handlers out so a listener may subscribe or unsubscribe re-entrantly.
        let handlers: Vec<EventHandler> = self
            .listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(k, _, _)| *k == kind)
            .map(|(_, _, handler)| Arc::clone(handler))
            .collect();

        for handler in handlers {
            handler(event);
        }
    }
}
