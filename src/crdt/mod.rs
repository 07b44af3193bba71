/*
    crdt - Observed-remove replicated containers

    The map core lives here; the signed map and the set variant compose
    it. Replicas exchange opaque batches: applying the same multiset of
    batches in any order, with duplicates, converges every replica to
    the same live-pair table.

    Conflict resolution is by id: ids begin with a fixed-width time
    prefix, so the larger id usually means "later", and the random
    suffix breaks timestamp collisions the same way on every replica.
    Deletions tombstone one observed id, never a key; a deletion can
    only ever cancel insertions its writer had actually seen.
*/

use crate::config::MapOptions;
use crate::error::{MapError, MapResult};
use crate::events::{EventBus, MapEvent};
use crate::id::{IdGenerator, OpId};
use crate::store::{LivePair, MemoryStore, StateStore};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace};

mod set;
mod signed;

pub use set::ObservedRemoveSet;
pub use signed::{SignedBatch, SignedDeletion, SignedInsertion, SignedObservedRemoveMap};

/// Insertion record: at `id`, `key` was assigned this value
pub type Insertion<V> = (String, (OpId, V));

/// Deletion record: the insertion with `id` is removed; the key only
/// locates the affected live pair during replay
pub type Deletion = (OpId, String);

/// Wire batch: `[insertions, deletions]`
///
/// A tuple struct so the serialized form is the two-element JSON array
/// the transport carries; `dump()` uses the same shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch<V>(pub Vec<Insertion<V>>, pub Vec<Deletion>);

impl<V> Batch<V> {
    pub fn new() -> Self {
        Batch(Vec::new(), Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty() && self.1.is_empty()
    }

    fn extend(&mut self, other: Batch<V>) {
        self.0.extend(other.0);
        self.1.extend(other.1);
    }
}

impl<V> Default for Batch<V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Readiness of the startup reconciliation
#[derive(Debug, Clone)]
enum Readiness {
    Pending,
    Ready,
    Failed(String),
}

pub(crate) struct MapShared<V, S> {
    pub(crate) store: S,
    pub(crate) options: MapOptions,
    /// Single-flight guard: local mutators and `process` serialize here,
    /// so local observation matches remote observation
    pub(crate) state: Mutex<()>,
    size: AtomicUsize,
    queues: StdMutex<Batch<V>>,
    publish_task: StdMutex<Option<JoinHandle<()>>>,
    /// Wrappers with their own wire format keep the core quiet
    publishing: AtomicBool,
    events: EventBus<MapEvent<V>>,
    ids: IdGenerator,
    readiness: watch::Sender<Readiness>,
}

/// Observed-remove map replica
///
/// Cheaply clonable handle; all clones share one replica state. Must be
/// created inside a tokio runtime (readiness runs on a spawned task).
pub struct ObservedRemoveMap<V, S = MemoryStore<V>> {
    pub(crate) inner: Arc<MapShared<V, S>>,
}

impl<V, S> Clone for ObservedRemoveMap<V, S> {
    fn clone(&self) -> Self {
        ObservedRemoveMap { inner: self.inner.clone() }
    }
}

impl<V> ObservedRemoveMap<V, MemoryStore<V>>
where
    V: Clone + Send + Sync + 'static,
{
    /// In-memory replica with no initial entries
    pub fn in_memory(options: MapOptions) -> Self {
        Self::new(MemoryStore::new(), options)
    }
}

impl<V, S> ObservedRemoveMap<V, S>
where
    V: Clone + Send + Sync + 'static,
    S: StateStore<V>,
{
    pub fn new(store: S, options: MapOptions) -> Self {
        Self::with_entries(store, Vec::new(), options)
    }

    /// Construction returns immediately; `ready()` resolves once the
    /// size counter is reconciled and `entries` have been applied
    pub fn with_entries(store: S, entries: Vec<(String, V)>, options: MapOptions) -> Self {
        let (readiness, _) = watch::channel(Readiness::Pending);
        let map = ObservedRemoveMap {
            inner: Arc::new(MapShared {
                store,
                options,
                state: Mutex::new(()),
                size: AtomicUsize::new(0),
                queues: StdMutex::new(Batch::new()),
                publish_task: StdMutex::new(None),
                publishing: AtomicBool::new(true),
                events: EventBus::default(),
                ids: IdGenerator::new(),
                readiness,
            }),
        };

        let init = map.clone();
        tokio::spawn(async move {
            let result = init.run_init(entries).await;
            let state = match result {
                Ok(()) => Readiness::Ready,
                Err(e) => {
                    let message = e.to_string();
                    error!(%message, "replica initialization failed");
                    init.inner.events.emit(MapEvent::Error { message: message.clone() });
                    Readiness::Failed(message)
                }
            };
            // send_replace: the value must stick even before anyone
            // has called ready()
            init.inner.readiness.send_replace(state);
        });

        map
    }

    async fn run_init(&self, entries: Vec<(String, V)>) -> MapResult<()> {
        let count = {
            let _guard = self.inner.state.lock().await;
            self.inner.store.init().await?
        };
        self.inner.size.store(count, Ordering::SeqCst);
        for (key, value) in entries {
            self.set(key, value).await?;
        }
        Ok(())
    }

    /// Resolves when startup reconciliation has finished
    pub async fn ready(&self) -> MapResult<()> {
        let mut rx = self.inner.readiness.subscribe();
        loop {
            let state = rx.borrow_and_update().clone();
            match state {
                Readiness::Ready => return Ok(()),
                Readiness::Failed(message) => return Err(MapError::Readiness(message)),
                Readiness::Pending => {}
            }
            if rx.changed().await.is_err() {
                return Err(MapError::Readiness("initialization task dropped".to_string()));
            }
        }
    }

    /// Subscribe to semantic and publish events
    pub fn subscribe(&self) -> broadcast::Receiver<MapEvent<V>> {
        self.inner.events.subscribe()
    }

    /// Assign `value` to `key` under a fresh id; returns the id used
    pub async fn set(&self, key: impl Into<String>, value: V) -> MapResult<OpId> {
        let id = self.inner.ids.generate();
        self.set_with_id(key, value, id).await
    }

    /// Assign `value` to `key` under a caller-chosen id
    pub async fn set_with_id(&self, key: impl Into<String>, value: V, id: OpId) -> MapResult<OpId> {
        let key = key.into();
        let batch = {
            let _guard = self.inner.state.lock().await;
            let mut batch = Batch::new();
            if let Some(previous) = self.inner.store.live_pair(&key).await? {
                if previous.id != id {
                    batch.1.push((previous.id, key.clone()));
                }
            }
            batch.0.push((key, (id.clone(), value)));
            // skip_flush: local observation must match remote observation,
            // and flush belongs to remote batch processing
            self.process_locked(&batch, true).await?;
            batch
        };
        self.enqueue(batch);
        self.schedule_publish().await;
        Ok(id)
    }

    /// Remove `key`'s live pair; a miss is a no-op. Returns the id of
    /// the removed insertion, if any
    pub async fn delete(&self, key: &str) -> MapResult<Option<OpId>> {
        let (batch, id) = {
            let _guard = self.inner.state.lock().await;
            let Some(previous) = self.inner.store.live_pair(key).await? else {
                return Ok(None);
            };
            let batch = Batch(Vec::new(), vec![(previous.id.clone(), key.to_string())]);
            self.process_locked(&batch, true).await?;
            (batch, previous.id)
        };
        self.enqueue(batch);
        self.schedule_publish().await;
        Ok(Some(id))
    }

    /// Delete every current key
    pub async fn clear(&self) -> MapResult<()> {
        for key in self.keys().await? {
            self.delete(&key).await?;
        }
        Ok(())
    }

    pub async fn get(&self, key: &str) -> MapResult<Option<V>> {
        Ok(self.inner.store.live_pair(key).await?.map(|pair| pair.value))
    }

    pub async fn has(&self, key: &str) -> MapResult<bool> {
        Ok(self.inner.store.live_pair(key).await?.is_some())
    }

    /// Live-pair count, maintained incrementally and reconciled at startup
    pub fn len(&self) -> usize {
        self.inner.size.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn keys(&self) -> MapResult<Vec<String>> {
        Ok(self.inner.store.live_pairs().await?.into_iter().map(|(key, _)| key).collect())
    }

    pub async fn values(&self) -> MapResult<Vec<V>> {
        Ok(self.inner.store.live_pairs().await?.into_iter().map(|(_, pair)| pair.value).collect())
    }

    /// Streaming cursor over live pairs in key order
    pub fn entries(&self) -> EntryCursor<V, S> {
        EntryCursor {
            map: self.clone(),
            after: None,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    pub async fn tombstone_count(&self) -> MapResult<usize> {
        self.inner.store.tombstone_count().await
    }

    /// Full-state snapshot: `[live pairs, tombstones]`
    pub async fn dump(&self) -> MapResult<Batch<V>> {
        let _guard = self.inner.state.lock().await;
        self.dump_locked().await
    }

    pub(crate) async fn dump_locked(&self) -> MapResult<Batch<V>> {
        let pairs = self.inner.store.live_pairs().await?;
        let tombstones = self.inner.store.tombstones().await?;
        Ok(Batch(
            pairs.into_iter().map(|(key, pair)| (key, (pair.id, pair.value))).collect(),
            tombstones,
        ))
    }

    /// Emit `queue` as a publish event; with no queue, emit `dump()`
    /// (how a peer is brought up or reconciled)
    pub async fn sync(&self, queue: Option<Batch<V>>) -> MapResult<()> {
        let batch = match queue {
            Some(batch) => batch,
            None => self.dump().await?,
        };
        if !batch.is_empty() {
            self.inner.events.emit(MapEvent::Publish { batch });
        }
        Ok(())
    }

    /// Apply a remote (or locally assembled) batch
    ///
    /// Single-flight: a second call cannot begin before the previous one
    /// has finished, flush included.
    pub async fn process(&self, batch: &Batch<V>, skip_flush: bool) -> MapResult<()> {
        let _guard = self.inner.state.lock().await;
        self.process_locked(batch, skip_flush).await
    }

    /// The two-pass batch application. Deletions are recorded before
    /// insertions are evaluated and live pairs are removed after, which
    /// makes the batch observation-equivalent under any internal order.
    pub(crate) async fn process_locked(&self, batch: &Batch<V>, skip_flush: bool) -> MapResult<()> {
        let Batch(insertions, deletions) = batch;
        let store = &self.inner.store;
        let mut events: Vec<MapEvent<V>> = Vec::new();

        // Pass 1: record every tombstone, even when nothing references
        // it yet, so a later-arriving insertion with the same id is
        // suppressed
        for (id, key) in deletions {
            store.put_tombstone(id, key).await?;
        }

        // Pass 2: evaluate insertions against tombstones and current pairs
        for (key, (id, value)) in insertions {
            if store.tombstone_key(id).await?.is_some() {
                trace!(%key, %id, "insertion already cancelled");
                continue;
            }
            match store.live_pair(key).await? {
                None => {
                    store.put_live_pair(key, &LivePair { id: id.clone(), value: value.clone() }).await?;
                    self.inner.size.fetch_add(1, Ordering::SeqCst);
                    events.push(MapEvent::Set {
                        key: key.clone(),
                        value: value.clone(),
                        previous: None,
                    });
                }
                Some(current) if current.id < *id => {
                    store.put_live_pair(key, &LivePair { id: id.clone(), value: value.clone() }).await?;
                    events.push(MapEvent::Set {
                        key: key.clone(),
                        value: value.clone(),
                        previous: Some(current.value),
                    });
                }
                Some(current) if current.id == *id => {
                    events.push(MapEvent::Affirm { key: key.clone(), value: value.clone() });
                }
                Some(_) => {
                    // A larger id already holds the key
                }
            }
        }

        // Pass 3: remove live pairs whose exact id was deleted
        for (id, key) in deletions {
            if let Some(current) = store.live_pair(key).await? {
                if current.id == *id {
                    store.remove_live_pair(key).await?;
                    self.inner.size.fetch_sub(1, Ordering::SeqCst);
                    events.push(MapEvent::Delete { key: key.clone(), value: current.value });
                }
            }
        }

        if !skip_flush {
            self.flush_locked().await?;
        }

        // State is committed; only now do observers hear about it
        for event in events {
            self.inner.events.emit(event);
        }
        Ok(())
    }

    /// Drop tombstones (and deletion signatures) older than `max_age`
    pub async fn flush(&self) -> MapResult<usize> {
        let _guard = self.inner.state.lock().await;
        self.flush_locked().await
    }

    async fn flush_locked(&self) -> MapResult<usize> {
        let cutoff = IdGenerator::cutoff(self.inner.options.max_age);
        let removed = self.inner.store.flush(&cutoff).await?;
        if removed > 0 {
            debug!(removed, "flushed aged tombstones");
        }
        Ok(removed)
    }

    /// Cancel the pending publish timer and drain in-flight processing.
    /// Further mutations after shutdown are undefined.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.take_publish_task() {
            handle.abort();
            // Await the cancelled task so its replica handle (and any
            // store it keeps alive) is released before we return
            let _ = handle.await;
        }
        let _drain = self.inner.state.lock().await;
    }

    pub(crate) fn generate_id(&self) -> OpId {
        self.inner.ids.generate()
    }

    /// Wrappers that publish their own wire format call this once
    pub(crate) fn disable_publishing(&self) {
        self.inner.publishing.store(false, Ordering::SeqCst);
    }

    fn enqueue(&self, batch: Batch<V>) {
        if !self.inner.publishing.load(Ordering::SeqCst) {
            return;
        }
        self.inner
            .queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(batch);
    }

    /// At most one pending publish: either a timer is already set, or we
    /// schedule one, or (with no buffering) publish inline
    async fn schedule_publish(&self) {
        if !self.inner.publishing.load(Ordering::SeqCst) {
            return;
        }
        let delay = self.inner.options.buffer_publishing;
        if delay.is_zero() {
            self.publish().await;
            return;
        }

        let mut slot = self.inner.publish_task.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        let map = self.clone();
        *slot = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            map.take_publish_task();
            map.publish().await;
        }));
    }

    /// Swap the queues for empty ones and emit the swapped batch
    pub(crate) async fn publish(&self) {
        let batch = std::mem::take(
            &mut *self.inner.queues.lock().unwrap_or_else(PoisonError::into_inner),
        );
        if batch.is_empty() {
            return;
        }
        // Infallible: the batch is handed straight to the event bus
        let _ = self.sync(Some(batch)).await;
    }

    fn take_publish_task(&self) -> Option<JoinHandle<()>> {
        self.inner.publish_task.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

const CURSOR_PAGE: usize = 64;

/// Explicit streaming cursor over a replica's live pairs
///
/// Each page is an independent bounded range read, so dropping the
/// cursor holds no store resources.
pub struct EntryCursor<V, S = MemoryStore<V>> {
    map: ObservedRemoveMap<V, S>,
    after: Option<String>,
    buffer: VecDeque<(String, V)>,
    exhausted: bool,
}

impl<V, S> EntryCursor<V, S>
where
    V: Clone + Send + Sync + 'static,
    S: StateStore<V>,
{
    /// Next live pair in key order, or `None` at the end
    pub async fn next(&mut self) -> MapResult<Option<(String, V)>> {
        if self.buffer.is_empty() && !self.exhausted {
            let page = self
                .map
                .inner
                .store
                .live_pairs_page(self.after.as_deref(), CURSOR_PAGE)
                .await?;
            if page.len() < CURSOR_PAGE {
                self.exhausted = true;
            }
            self.after = page.last().map(|(key, _)| key.clone());
            self.buffer.extend(page.into_iter().map(|(key, pair)| (key, pair.value)));
        }
        Ok(self.buffer.pop_front())
    }
}
