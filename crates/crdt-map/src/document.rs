//! CrdtMap: Loro document wrapper for a replicated key-value map.
//!
//! All entries live in a single `LoroMap` container named `entries`.
//! Merge and causality are handled entirely by Loro; this type adds
//! JSON-friendly accessors and publishes `update`/`snapshot` events.

use crate::events::{DocumentEvent, EventBus, EventHandler, EventKind, Origin, SubscriptionId};
use crate::replica_id::ReplicaId;
use loro::{ExportMode, LoroDoc, LoroMap, LoroValue, VersionVector};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, warn};

/// Container holding the map entries.
const ENTRIES: &str = "entries";

/// Every Loro export starts with these bytes.
const LORO_MAGIC: &[u8; 4] = b"loro";

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("Loro error: {0}")]
    Loro(String),

    #[error("Invalid snapshot: {0}")]
    InvalidSnapshot(String),

    #[error("Invalid replica ID: {0}")]
    InvalidReplicaId(#[from] crate::replica_id::ReplicaIdError),
}

pub type Result<T> = std::result::Result<T, DocumentError>;

/// Encoded complete state of a map.
///
/// Opaque to everything except Loro; persisted and transferred as raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot(Vec<u8>);

impl Snapshot {
    /// Decode bytes read from storage or the network.
    ///
    /// Only the Loro header is checked here; a damaged body is reported
    /// by `CrdtMap::apply`.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() <= LORO_MAGIC.len() || !bytes.starts_with(LORO_MAGIC) {
            return Err(DocumentError::InvalidSnapshot(format!(
                "missing Loro header ({} bytes)",
                bytes.len()
            )));
        }
        Ok(Self(bytes.to_vec()))
    }

    /// Encode for storage.
    pub fn encode(&self) -> Vec<u8> {
        self.0.clone()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A replicated map of string keys to JSON-like values.
pub struct CrdtMap {
    doc: LoroDoc,
    events: EventBus,
}

impl CrdtMap {
    /// Create an empty map with a random replica ID.
    pub fn new() -> Self {
        let replica_id = ReplicaId::generate();
        let doc = LoroDoc::new();
        if let Err(e) = doc.set_peer_id(replica_id.as_u64()) {
            warn!("Keeping Loro's peer id, could not set {}: {}", replica_id, e);
        }
        Self {
            doc,
            events: EventBus::new(),
        }
    }

    /// Create an empty map that edits as `replica_id`.
    ///
    /// Must be used before any edit so the version vector stays under one ID.
    pub fn with_replica_id(replica_id: ReplicaId) -> Result<Self> {
        let doc = LoroDoc::new();
        doc.set_peer_id(replica_id.as_u64())
            .map_err(|e| DocumentError::Loro(e.to_string()))?;
        Ok(Self {
            doc,
            events: EventBus::new(),
        })
    }

    /// The replica ID local edits are recorded under.
    pub fn replica_id(&self) -> Result<ReplicaId> {
        Ok(ReplicaId::try_from(self.doc.peer_id())?)
    }

    fn entries(&self) -> LoroMap {
        self.doc.get_map(ENTRIES)
    }

    /// Insert or overwrite `key`, then emit a local `update` event.
    pub fn set(&self, key: &str, value: impl Into<LoroValue>) -> Result<()> {
        let before = self.doc.state_vv();
        self.entries()
            .insert(key, value)
            .map_err(|e| DocumentError::Loro(e.to_string()))?;
        self.commit_local(&before)
    }

    /// Remove `key`. Returns false (and emits nothing) if it was absent.
    pub fn delete(&self, key: &str) -> Result<bool> {
        if !self.contains_key(key) {
            return Ok(false);
        }
        let before = self.doc.state_vv();
        self.entries()
            .delete(key)
            .map_err(|e| DocumentError::Loro(e.to_string()))?;
        self.commit_local(&before)?;
        Ok(true)
    }

    fn commit_local(&self, before: &VersionVector) -> Result<()> {
        self.doc.commit();
        let update = self.export_updates(before)?;
        self.events.emit(&DocumentEvent::Update {
            origin: Origin::Local,
            update,
        });
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        match self.entries().get_deep_value() {
            LoroValue::Map(map) => map.get(key).map(loro_value_to_json),
            _ => None,
        }
    }

    pub fn contains_key(&self, key: &str) -> bool {
        match self.entries().get_deep_value() {
            LoroValue::Map(map) => map.contains_key(key),
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All entries as JSON values, ordered by key.
    pub fn to_json(&self) -> BTreeMap<String, serde_json::Value> {
        match self.entries().get_deep_value() {
            LoroValue::Map(map) => map
                .iter()
                .map(|(key, value)| (key.clone(), loro_value_to_json(value)))
                .collect(),
            _ => BTreeMap::new(),
        }
    }

    /// Listen for `kind` events.
    pub fn on(&self, kind: EventKind, handler: EventHandler) -> SubscriptionId {
        self.events.subscribe(kind, handler)
    }

    /// Stop a listener registered with `on`.
    pub fn off(&self, kind: EventKind, id: SubscriptionId) -> bool {
        self.events.unsubscribe(kind, id)
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.events.listener_count(kind)
    }

    /// Export the complete state from the beginning of history.
    pub fn export_snapshot(&self) -> Result<Snapshot> {
        self.doc
            .export(ExportMode::Snapshot)
            .map(Snapshot)
            .map_err(|e| DocumentError::Loro(e.to_string()))
    }

    /// Merge a snapshot into the current state and emit a `snapshot` event.
    ///
    /// Entries that only exist locally are kept; concurrent writes to the
    /// same key resolve by Loro's last-writer-wins rules.
    pub fn apply(&self, snapshot: &Snapshot) -> Result<()> {
        self.doc
            .import(snapshot.as_bytes())
            .map_err(|e| DocumentError::Loro(e.to_string()))?;
        debug!("Applied snapshot ({} bytes), {} entries", snapshot.len(), self.len());
        self.events.emit(&DocumentEvent::Snapshot {
            size: snapshot.len(),
        });
        Ok(())
    }

    /// Merge an incremental update from another replica and emit a remote `update` event.
    pub fn apply_update(&self, update: &[u8]) -> Result<()> {
        self.doc
            .import(update)
            .map_err(|e| DocumentError::Loro(e.to_string()))?;
        self.events.emit(&DocumentEvent::Update {
            origin: Origin::Remote,
            update: update.to_vec(),
        });
        Ok(())
    }

    /// Get current version vector
    pub fn version(&self) -> VersionVector {
        self.doc.state_vv()
    }

    /// Export updates since a version
    pub fn export_updates(&self, from: &VersionVector) -> Result<Vec<u8>> {
        self.doc
            .export(ExportMode::updates(from))
            .map_err(|e| DocumentError::Loro(e.to_string()))
    }
}

impl Default for CrdtMap {
    fn default() -> Self {
        Self::new()
    }
}

/// Convert LoroValue to serde_json::Value
fn loro_value_to_json(value: &LoroValue) -> serde_json::Value {
    match value {
        LoroValue::Null => serde_json::Value::Null,
        LoroValue::Bool(b) => serde_json::Value::Bool(*b),
        LoroValue::I64(n) => serde_json::json!(*n),
        LoroValue::Double(n) => serde_json::json!(*n),
        LoroValue::String(s) => serde_json::Value::String(s.to_string()),
        LoroValue::Binary(bytes) => serde_json::json!(bytes.to_vec()),
        LoroValue::List(list) => {
            serde_json::Value::Array(list.iter().map(loro_value_to_json).collect())
        }
        LoroValue::Map(map) => serde_json::Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), loro_value_to_json(v)))
                .collect(),
        ),
        // Nested containers are resolved by get_deep_value
        _ => serde_json::Value::Null,
    }
}
