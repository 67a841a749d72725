//! The document side of persistence.
//!
//! `SyncAdapter` needs only four things from a replicated document: event
//! subscription, unsubscription, merging a stored snapshot, and exporting
//! its complete state. `CrdtMap` is the production implementation.

use crdt_map::{CrdtMap, DocumentError, EventHandler, EventKind, Snapshot, SubscriptionId};

/// A replicated document whose full state can be persisted as one blob.
pub trait PersistableDocument: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Register `handler` for `kind` events.
    fn subscribe(&self, kind: EventKind, handler: EventHandler) -> SubscriptionId;

    /// Remove a handler. Returns false if it was not registered.
    fn unsubscribe(&self, kind: EventKind, id: SubscriptionId) -> bool;

    /// Decode stored bytes and merge them into the current state.
    fn apply_snapshot(&self, bytes: &[u8]) -> Result<(), Self::Error>;

    /// Encode the complete current state.
    fn export_snapshot(&self) -> Result<Vec<u8>, Self::Error>;
}

impl PersistableDocument for CrdtMap {
    type Error = DocumentError;

    fn subscribe(&self, kind: EventKind, handler: EventHandler) -> SubscriptionId {
        self.on(kind, handler)
    }

    fn unsubscribe(&self, kind: EventKind, id: SubscriptionId) -> bool {
        self.off(kind, id)
    }

    fn apply_snapshot(&self, bytes: &[u8]) -> Result<(), DocumentError> {
        let snapshot = Snapshot::decode(bytes)?;
        self.apply(&snapshot)
    }

    fn export_snapshot(&self) -> Result<Vec<u8>, DocumentError> {
        Ok(CrdtMap::export_snapshot(self)?.encode())
    }
}
