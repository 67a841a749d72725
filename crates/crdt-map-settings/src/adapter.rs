//! SyncAdapter: Keeps one replicated document persisted under one store key.
//!
//! Lifecycle:
//!
//! 1. `new` subscribes to the document's `update` and `snapshot` events and
//!    starts loading the stored snapshot on Tokio's blocking pool.
//! 2. Once the load attempt finishes (data, no data, or failure) the adapter
//!    is *synced*: queued `when_synced` callbacks fire in registration order.
//! 3. Every event after that re-arms a single debounce timer. When the
//!    document has been quiet for `SyncConfig::debounce`, its full state is
//!    written to the store.
//! 4. `destroy` (or drop) unsubscribes, cancels a pending write, waits for a
//!    load or write already in progress, and suppresses a load that has not
//!    reached the document yet. Stored data is untouched.
//!
//! Events that arrive before the adapter is synced are ignored. This includes
//! the `snapshot` event raised by applying the loaded data itself.

use crate::config::SyncConfig;
use crate::document::PersistableDocument;
use crate::store::SettingsStore;
use crdt_map::{DocumentEvent, EventHandler, EventKind, SubscriptionId};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("Storage key must not be empty")]
    EmptyKey,

    #[error("No Tokio runtime available: {0}")]
    NoRuntime(String),

    #[error("Adapter has been destroyed")]
    Destroyed,

    #[error("Adapter has not finished loading persisted state")]
    NotSynced,

    #[error("Persist failed: {0}")]
    Persist(String),
}

pub type Result<T> = std::result::Result<T, AdapterError>;

/// Result of one attempt to write the document to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistOutcome {
    /// Snapshot written; size in bytes.
    Written { bytes: usize },
    /// Export or store write failed.
    Failed(String),
}

type SyncedCallback = Box<dyn FnOnce() + Send + 'static>;
type PersistHook = Box<dyn FnOnce(&PersistOutcome) + Send + 'static>;

/// Published on the watch channel backing `synced()`.
#[derive(Debug, Clone, Copy, Default)]
struct Lifecycle {
    synced: bool,
    destroyed: bool,
}

#[derive(Debug, Clone, Copy)]
struct Subscriptions {
    update: SubscriptionId,
    snapshot: SubscriptionId,
}

/// The armed debounce timer.
struct PendingWrite {
    generation: u64,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct State {
    synced: bool,
    destroyed: bool,
    synced_callbacks: Vec<SyncedCallback>,
    pending_write: Option<PendingWrite>,
    /// Incremented every time the timer is armed; a timer only writes if it
    /// still holds the latest generation when it wakes up.
    generation: u64,
    subscriptions: Option<Subscriptions>,
}

struct Inner<D, S>
where
    D: PersistableDocument + ?Sized + 'static,
    S: SettingsStore + ?Sized + 'static,
{
    key: String,
    document: Arc<D>,
    store: Arc<S>,
    config: SyncConfig,
    runtime: Handle,
    state: Mutex<State>,
    lifecycle: watch::Sender<Lifecycle>,
    /// Serializes store writes between timers and `flush`, and the initial
    /// apply against `destroy`.
    persist_lock: Mutex<()>,
    on_persisted: Mutex<Option<PersistHook>>,
}

/// Persists a replicated document under one key of a settings store.
///
/// Must be created inside a Tokio runtime; the load task and the debounce
/// timer run on that runtime. Dropping the adapter destroys it.
pub struct SyncAdapter<D, S>
where
    D: PersistableDocument + ?Sized + 'static,
    S: SettingsStore + ?Sized + 'static,
{
    inner: Arc<Inner<D, S>>,
}

impl<D, S> SyncAdapter<D, S>
where
    D: PersistableDocument + ?Sized + 'static,
    S: SettingsStore + ?Sized + 'static,
{
    /// Start persisting `document` under `key` with the default configuration.
    pub fn new(key: impl Into<String>, document: Arc<D>, store: Arc<S>) -> Result<Self> {
        Self::with_config(key, document, store, SyncConfig::default())
    }

    pub fn with_config(
        key: impl Into<String>,
        document: Arc<D>,
        store: Arc<S>,
        config: SyncConfig,
    ) -> Result<Self> {
        let key = key.into();
        if key.is_empty() {
            return Err(AdapterError::EmptyKey);
        }
        let runtime = Handle::try_current().map_err(|e| AdapterError::NoRuntime(e.to_string()))?;

        let inner = Arc::new(Inner {
            key,
            document,
            store,
            config,
            runtime,
            state: Mutex::new(State::default()),
            lifecycle: watch::Sender::new(Lifecycle::default()),
            persist_lock: Mutex::new(()),
            on_persisted: Mutex::new(None),
        });

        // Same handler for both kinds: the whole state is persisted either way.
        let update = inner
            .document
            .subscribe(EventKind::Update, Inner::event_handler(&inner));
        let snapshot = inner
            .document
            .subscribe(EventKind::Snapshot, Inner::event_handler(&inner));
        inner.lock_state().subscriptions = Some(Subscriptions { update, snapshot });
        debug!("Subscribed to document events for {}", inner.key);

        let loader = Arc::clone(&inner);
        inner.runtime.spawn_blocking(move || loader.load_persisted());

        Ok(Self { inner })
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    pub fn document(&self) -> &Arc<D> {
        &self.inner.document
    }

    pub fn store(&self) -> &Arc<S> {
        &self.inner.store
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    /// Whether the initial load has completed. Never reverts to false.
    pub fn is_synced(&self) -> bool {
        self.inner.lock_state().synced
    }

    /// Run `callback` once the adapter is synced.
    ///
    /// Runs immediately on the calling thread if already synced; otherwise
    /// queued and run, in registration order, when the load completes.
    /// After `destroy`, callbacks are dropped without running.
    pub fn when_synced(&self, callback: impl FnOnce() + Send + 'static) {
        let mut state = self.inner.lock_state();
        if state.destroyed {
            debug!("Ignoring when_synced on destroyed adapter for {}", self.inner.key);
        } else if state.synced {
            drop(state);
            callback();
        } else {
            state.synced_callbacks.push(Box::new(callback));
        }
    }

    /// Wait until the adapter is synced.
    ///
    /// Fails with `AdapterError::Destroyed` if the adapter was destroyed
    /// before the initial load completed.
    pub async fn synced(&self) -> Result<()> {
        let mut rx = self.inner.lifecycle.subscribe();
        let lifecycle = *rx
            .wait_for(|l| l.synced || l.destroyed)
            .await
            .map_err(|_| AdapterError::Destroyed)?;
        if lifecycle.synced {
            Ok(())
        } else {
            Err(AdapterError::Destroyed)
        }
    }

    /// Register a one-shot hook called after the next write attempt.
    ///
    /// Replaces any hook that has not fired yet.
    pub fn on_persisted(&self, hook: impl FnOnce(&PersistOutcome) + Send + 'static) {
        *self.inner.lock_hook() = Some(Box::new(hook));
    }

    /// Cancel the pending debounce timer and persist right now.
    ///
    /// Blocks the calling thread for the duration of the store write.
    /// Returns the number of bytes written.
    pub fn flush(&self) -> Result<usize> {
        {
            let mut state = self.inner.lock_state();
            if state.destroyed {
                return Err(AdapterError::Destroyed);
            }
            if !state.synced {
                return Err(AdapterError::NotSynced);
            }
            if let Some(pending) = state.pending_write.take() {
                pending.task.abort();
            }
        }

        match self.inner.persist() {
            Some(PersistOutcome::Written { bytes }) => Ok(bytes),
            Some(PersistOutcome::Failed(reason)) => Err(AdapterError::Persist(reason)),
            None => Err(AdapterError::Destroyed),
        }
    }

    /// Stop reacting to document events.
    ///
    /// Idempotent. Persisted data is left as is.
    pub fn destroy(&self) {
        self.inner.destroy();
    }
}

impl<D, S> Drop for SyncAdapter<D, S>
where
    D: PersistableDocument + ?Sized + 'static,
    S: SettingsStore + ?Sized + 'static,
{
    fn drop(&mut self) {
        self.inner.destroy();
    }
}

impl<D, S> Inner<D, S>
where
    D: PersistableDocument + ?Sized + 'static,
    S: SettingsStore + ?Sized + 'static,
{
    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_persist(&self) -> MutexGuard<'_, ()> {
        self.persist_lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_hook(&self) -> MutexGuard<'_, Option<PersistHook>> {
        self.on_persisted.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Document listener holding only a weak reference to the adapter.
    fn event_handler(inner: &Arc<Self>) -> EventHandler {
        let weak: Weak<Self> = Arc::downgrade(inner);
        Arc::new(move |_event: &DocumentEvent| {
            if let Some(inner) = weak.upgrade() {
                inner.schedule_persist();
            }
        })
    }

    /// Read the stored snapshot, merge it, then mark the adapter synced.
    fn load_persisted(&self) {
        if self.lock_state().destroyed {
            return;
        }

        match self.store.read(&self.key) {
            Ok(Some(bytes)) => {
                // Held across the apply so `destroy` waits for it to finish
                let _guard = self.lock_persist();
                if self.lock_state().destroyed {
                    debug!("Discarding load for {}: adapter destroyed", self.key);
                    return;
                }
                match self.document.apply_snapshot(&bytes) {
                    Ok(()) => info!("Loaded {} bytes for {}", bytes.len(), self.key),
                    Err(e) => warn!("Failed to apply stored snapshot for {}: {}", self.key, e),
                }
            }
            Ok(None) => debug!("No stored snapshot for {}", self.key),
            Err(e) => warn!("Failed to read {} from store: {}", self.key, e),
        }

        self.emit_synced();
    }

    fn emit_synced(&self) {
        let callbacks = {
            let mut state = self.lock_state();
            if state.destroyed || state.synced {
                return;
            }
            state.synced = true;
            self.lifecycle.send_modify(|l| l.synced = true);
            std::mem::take(&mut state.synced_callbacks)
        };

        debug!("{} synced, running {} callback(s)", self.key, callbacks.len());
        for callback in callbacks {
            callback();
        }
    }

    /// Re-arm the debounce timer. No-op until synced and after destroy.
    fn schedule_persist(self: &Arc<Self>) {
        let mut state = self.lock_state();
        if !state.synced || state.destroyed {
            return;
        }

        if let Some(pending) = state.pending_write.take() {
            pending.task.abort();
        }
        state.generation += 1;
        let generation = state.generation;

        let weak = Arc::downgrade(self);
        let delay = self.config.debounce;
        let task = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if !inner.take_pending(generation) {
                return;
            }
            let writer = Arc::clone(&inner);
            if let Err(e) = tokio::task::spawn_blocking(move || writer.persist()).await {
                warn!("Persist task for {} failed: {}", inner.key, e);
            }
        });
        state.pending_write = Some(PendingWrite { generation, task });
        debug!("Persist for {} scheduled in {:?}", self.key, delay);
    }

    /// Claim the timer slot for `generation`. False if superseded or destroyed.
    fn take_pending(&self, generation: u64) -> bool {
        let mut state = self.lock_state();
        let current = state.pending_write.as_ref().map(|pending| pending.generation);
        if state.destroyed || current != Some(generation) {
            return false;
        }
        state.pending_write = None;
        true
    }

    /// Export the full document and write it under the key.
    ///
    /// Returns `None` without touching the store once destroyed. The hook is
    /// claimed under the persist lock and invoked after it is released, so
    /// it may call `flush`.
    fn persist(&self) -> Option<PersistOutcome> {
        let (outcome, hook) = {
            let _guard = self.lock_persist();
            if self.lock_state().destroyed {
                return None;
            }
            let outcome = match self.document.export_snapshot() {
                Ok(bytes) => match self.store.write(&self.key, &bytes) {
                    Ok(()) => PersistOutcome::Written { bytes: bytes.len() },
                    Err(e) => PersistOutcome::Failed(e.to_string()),
                },
                Err(e) => PersistOutcome::Failed(e.to_string()),
            };
            (outcome, self.lock_hook().take())
        };

        match &outcome {
            PersistOutcome::Written { bytes } => debug!("Persisted {} bytes for {}", bytes, self.key),
            PersistOutcome::Failed(reason) => warn!("Failed to persist {}: {}", self.key, reason),
        }

        if let Some(hook) = hook {
            hook(&outcome);
        }
        Some(outcome)
    }

    fn destroy(&self) {
        let (subscriptions, pending) = {
            let mut state = self.lock_state();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
            state.synced_callbacks.clear();
            self.lifecycle.send_modify(|l| l.destroyed = true);
            (state.subscriptions.take(), state.pending_write.take())
        };

        if let Some(pending) = pending {
            pending.task.abort();
        }
        // Wait out a load or write that is already in progress
        drop(self.lock_persist());
        self.lock_hook().take();

        if let Some(subscriptions) = subscriptions {
            self.document
                .unsubscribe(EventKind::Update, subscriptions.update);
            self.document
                .unsubscribe(EventKind::Snapshot, subscriptions.snapshot);
        }

        debug!("Destroyed adapter for {}", self.key);
    }
}
