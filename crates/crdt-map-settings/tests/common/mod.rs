//! Shared helpers for adapter integration tests.

#![allow(dead_code)]

use crdt_map::{CrdtMap, DocumentError, EventHandler, EventKind, Snapshot, SubscriptionId};
use crdt_map_settings::{
    InMemoryStore, PersistOutcome, PersistableDocument, SettingsStore, StoreError, SyncAdapter,
    SyncConfig,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::timeout;

pub const KEY: &str = "DEMO";

/// Short debounce so tests stay fast.
pub const TEST_DEBOUNCE: Duration = Duration::from_millis(20);

/// Upper bound for anything a test waits on.
pub const WAIT: Duration = Duration::from_secs(5);

pub fn test_config() -> SyncConfig {
    SyncConfig::default().with_debounce(TEST_DEBOUNCE)
}

/// Install a test-writer subscriber (honors RUST_LOG). Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// In-memory store that counts writes and can fail or stall on demand.
#[derive(Default)]
pub struct TestStore {
    values: InMemoryStore,
    writes: AtomicUsize,
    failing_writes: AtomicUsize,
    fail_reads: AtomicBool,
    read_gate: GateSlot,
    write_gate: GateSlot,
}

/// Where a held call parks: signals `entered`, then waits for `release`.
type GateSlot = Mutex<Option<(mpsc::Sender<()>, mpsc::Receiver<()>)>>;

/// Controls one call held by a `hold_next_*` method.
pub struct Gate {
    entered: mpsc::Receiver<()>,
    release: mpsc::Sender<()>,
}

impl Gate {
    fn arm(slot: &GateSlot) -> Self {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        *slot.lock().unwrap() = Some((entered_tx, release_rx));
        Gate {
            entered: entered_rx,
            release: release_tx,
        }
    }

    /// Block until the held call has started.
    pub fn wait_entered(&self) {
        self.entered
            .recv_timeout(WAIT)
            .expect("held call never started");
    }

    pub fn release(self) {
        let _ = self.release.send(());
    }
}

/// Park the caller if `slot` is armed.
fn pass(slot: &GateSlot) {
    let gate = slot.lock().unwrap().take();
    if let Some((entered, release)) = gate {
        let _ = entered.send(());
        let _ = release.recv();
    }
}

impl TestStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Store bytes without counting them as an adapter write.
    pub fn seed(&self, key: &str, bytes: &[u8]) {
        self.values.write(key, bytes).unwrap();
    }

    /// Block the next `read` until the returned gate is released.
    pub fn hold_next_read(&self) -> Gate {
        Gate::arm(&self.read_gate)
    }

    /// Block the next `write` until the returned gate is released.
    pub fn hold_next_write(&self) -> Gate {
        Gate::arm(&self.write_gate)
    }

    pub fn fail_next_writes(&self, count: usize) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    pub fn fail_reads(&self) {
        self.fail_reads.store(true, Ordering::SeqCst);
    }

    /// Successful writes so far.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl SettingsStore for TestStore {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        pass(&self.read_gate);
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("reads disabled".into()));
        }
        self.values.read(key)
    }

    fn write(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        pass(&self.write_gate);
        let failing = self.failing_writes.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_writes.store(failing - 1, Ordering::SeqCst);
            return Err(StoreError::Unavailable("writes disabled".into()));
        }
        self.values.write(key, value)?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.values.remove(key)
    }
}

/// Register a persisted hook and return a receiver for its outcome.
pub fn persisted_signal<D, S>(adapter: &SyncAdapter<D, S>) -> oneshot::Receiver<PersistOutcome>
where
    D: PersistableDocument + ?Sized + 'static,
    S: SettingsStore + ?Sized + 'static,
{
    let (tx, rx) = oneshot::channel();
    adapter.on_persisted(move |outcome| {
        let _ = tx.send(outcome.clone());
    });
    rx
}

pub async fn wait_persisted(rx: oneshot::Receiver<PersistOutcome>) -> PersistOutcome {
    timeout(WAIT, rx)
        .await
        .expect("timed out waiting for persist")
        .expect("persist hook dropped")
}

pub async fn wait_synced<D, S>(adapter: &SyncAdapter<D, S>)
where
    D: PersistableDocument + ?Sized + 'static,
    S: SettingsStore + ?Sized + 'static,
{
    timeout(WAIT, adapter.synced())
        .await
        .expect("timed out waiting for sync")
        .expect("adapter destroyed before sync");
}

/// A `CrdtMap` whose next snapshot apply can be held open.
#[derive(Default)]
pub struct GatedDocument {
    map: CrdtMap,
    apply_gate: GateSlot,
}

impl GatedDocument {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn map(&self) -> &CrdtMap {
        &self.map
    }

    /// Block the next `apply_snapshot` until the returned gate is released.
    pub fn hold_next_apply(&self) -> Gate {
        Gate::arm(&self.apply_gate)
    }
}

impl PersistableDocument for GatedDocument {
    type Error = DocumentError;

    fn subscribe(&self, kind: EventKind, handler: EventHandler) -> SubscriptionId {
        self.map.on(kind, handler)
    }

    fn unsubscribe(&self, kind: EventKind, id: SubscriptionId) -> bool {
        self.map.off(kind, id)
    }

    fn apply_snapshot(&self, bytes: &[u8]) -> Result<(), DocumentError> {
        pass(&self.apply_gate);
        PersistableDocument::apply_snapshot(&self.map, bytes)
    }

    fn export_snapshot(&self) -> Result<Vec<u8>, DocumentError> {
        PersistableDocument::export_snapshot(&self.map)
    }
}

/// Decode whatever is stored under `key` into a fresh map.
pub fn stored_map(store: &dyn SettingsStore, key: &str) -> CrdtMap {
    let bytes = store
        .read(key)
        .unwrap()
        .expect("nothing stored under key");
    let map = CrdtMap::new();
    map.apply(&Snapshot::decode(&bytes).unwrap()).unwrap();
    map
}

/// Snapshot bytes of a map holding `entries`.
pub fn snapshot_of(entries: &[(&str, i64)]) -> Vec<u8> {
    let map = CrdtMap::new();
    for (key, value) in entries {
        map.set(key, *value).unwrap();
    }
    map.export_snapshot().unwrap().encode()
}

/// Several debounce windows, for asserting that nothing else happens.
pub async fn settle() {
    tokio::time::sleep(TEST_DEBOUNCE * 5).await;
}
