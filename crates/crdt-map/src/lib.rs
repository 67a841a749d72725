//! crdt-map: A replicated key-value map backed by Loro CRDTs.
//!
//! This crate provides:
//! - `CrdtMap`, a string-keyed map whose merge semantics are delegated to Loro
//! - `Snapshot`, the opaque wire format for a map's complete state
//! - `EventBus` with "update" and "snapshot" events for observers
//! - `ReplicaId` for stable per-device identity in version vectors

pub mod document;
pub mod events;
pub mod replica_id;

pub use document::{CrdtMap, DocumentError, Snapshot};
pub use events::{DocumentEvent, EventBus, EventHandler, EventKind, Origin, SubscriptionId};
pub use replica_id::{ReplicaId, ReplicaIdError};
