//! crdt-map-settings: Persist a `CrdtMap` into a synchronous settings store.
//!
//! `SyncAdapter` loads the last persisted snapshot into a map on startup,
//! reports when that load has finished ("synced"), and afterwards writes the
//! map's full state back to the store, debounced, whenever it changes.

pub mod adapter;
pub mod config;
pub mod document;
pub mod file_store;
pub mod store;

pub use adapter::{AdapterError, PersistOutcome, SyncAdapter};
pub use config::{ConfigError, SyncConfig};
pub use document::PersistableDocument;
pub use file_store::FileStore;
pub use store::{InMemoryStore, SettingsStore, StoreError};
