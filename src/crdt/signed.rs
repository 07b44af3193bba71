/*
    signed.rs - Signed observed-remove map

    Composes the unsigned core instead of extending it: the unsigned
    mutators simply do not exist on this type, so "use the signed form"
    is enforced by the compiler, not at runtime. Every mutation carries
    a caller-supplied id and an Ed25519 signature over its operation
    tuple; a batch with any bad signature is rejected before a single
    byte of state changes.

    Signature lifecycle:
    - insertion signatures live while their id is authoritative for its
      key, and are dropped on supersede or deletion
    - deletion signatures live exactly as long as their tombstone and
      are flushed by the same cutoff
*/

use super::{Batch, ObservedRemoveMap};
use crate::config::{MapOptions, SignedOptions};
use crate::error::{MapError, MapResult};
use crate::events::{EventBus, MapEvent};
use crate::id::OpId;
use crate::signer::{OperationVerifier, Signature};
use crate::store::{MemoryStore, StateStore};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::warn;

/// Signed insertion record: `(signature, id, key, value)`
pub type SignedInsertion<V> = (Signature, OpId, String, V);

/// Signed deletion record: `(signature, id, key)`
pub type SignedDeletion = (Signature, OpId, String);

/// Signed wire batch: `[signed insertions, signed deletions]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedBatch<V>(pub Vec<SignedInsertion<V>>, pub Vec<SignedDeletion>);

impl<V> SignedBatch<V> {
    pub fn new() -> Self {
        SignedBatch(Vec::new(), Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty() && self.1.is_empty()
    }

    fn extend(&mut self, other: SignedBatch<V>) {
        self.0.extend(other.0);
        self.1.extend(other.1);
    }
}

impl<V> Default for SignedBatch<V> {
    fn default() -> Self {
        Self::new()
    }
}

struct SignedShared<V, S> {
    map: ObservedRemoveMap<V, S>,
    verifier: OperationVerifier,
    /// Single-flight guard for signed processing; always taken before
    /// the core's state mutex, never after
    lock: Mutex<()>,
    queues: StdMutex<SignedBatch<V>>,
    publish_task: StdMutex<Option<JoinHandle<()>>>,
    publishes: EventBus<SignedBatch<V>>,
}

/// Observed-remove map whose every operation is cryptographically
/// authorized against one configured public key
pub struct SignedObservedRemoveMap<V, S = MemoryStore<V>> {
    inner: Arc<SignedShared<V, S>>,
}

impl<V, S> Clone for SignedObservedRemoveMap<V, S> {
    fn clone(&self) -> Self {
        SignedObservedRemoveMap { inner: self.inner.clone() }
    }
}

impl<V, S> SignedObservedRemoveMap<V, S>
where
    V: Clone + Serialize + Send + Sync + 'static,
    S: StateStore<V>,
{
    /// Fails when the configured public key is unusable
    pub fn new(store: S, options: MapOptions, signed: SignedOptions) -> MapResult<Self> {
        let verifier = OperationVerifier::new(&signed.public_key, signed.format)?;
        let map = ObservedRemoveMap::new(store, options);
        // The core never publishes: this type emits signed batches
        map.disable_publishing();
        Ok(SignedObservedRemoveMap {
            inner: Arc::new(SignedShared {
                map,
                verifier,
                lock: Mutex::new(()),
                queues: StdMutex::new(SignedBatch::new()),
                publish_task: StdMutex::new(None),
                publishes: EventBus::default(),
            }),
        })
    }

    pub async fn ready(&self) -> MapResult<()> {
        self.inner.map.ready().await
    }

    /// Semantic events (`set`/`delete`/`affirm`/`error`) from the core
    pub fn subscribe(&self) -> broadcast::Receiver<MapEvent<V>> {
        self.inner.map.subscribe()
    }

    /// Outgoing signed batches for the transport
    pub fn subscribe_publish(&self) -> broadcast::Receiver<SignedBatch<V>> {
        self.inner.publishes.subscribe()
    }

    /// Authorized assignment; the id must be caller-supplied so the
    /// signature could cover it
    pub async fn set_signed(
        &self,
        key: impl Into<String>,
        value: V,
        id: OpId,
        signature: Signature,
    ) -> MapResult<()> {
        let batch = SignedBatch(vec![(signature, id, key.into(), value)], Vec::new());
        self.process_signed(&batch, true).await?;
        self.enqueue(batch);
        self.schedule_publish().await;
        Ok(())
    }

    /// Authorized removal of the insertion `id` at `key`
    pub async fn delete_signed(
        &self,
        key: impl Into<String>,
        id: OpId,
        signature: Signature,
    ) -> MapResult<()> {
        let batch = SignedBatch(Vec::new(), vec![(signature, id, key.into())]);
        self.process_signed(&batch, true).await?;
        self.enqueue(batch);
        self.schedule_publish().await;
        Ok(())
    }

    /// Apply a remote signed batch; single-flight
    pub async fn process_signed(&self, batch: &SignedBatch<V>, skip_flush: bool) -> MapResult<()> {
        let _guard = self.inner.lock.lock().await;
        self.process_signed_locked(batch, skip_flush).await
    }

    async fn process_signed_locked(
        &self,
        batch: &SignedBatch<V>,
        skip_flush: bool,
    ) -> MapResult<()> {
        let SignedBatch(insertions, deletions) = batch;

        // Every verification precedes every write: a forged entry
        // anywhere rejects the whole batch with state untouched
        for (signature, id, key, value) in insertions {
            if !self.inner.verifier.verify_insert(signature, key, value, id)? {
                warn!(%key, %id, "rejecting batch: bad insertion signature");
                return Err(MapError::InvalidSignature(format!("insertion {key}@{id}")));
            }
        }
        for (signature, id, key) in deletions {
            if !self.inner.verifier.verify_delete(signature, key, id)? {
                warn!(%key, %id, "rejecting batch: bad deletion signature");
                return Err(MapError::InvalidSignature(format!("deletion {key}@{id}")));
            }
        }

        let store = &self.inner.map.inner.store;
        for (signature, id, _, _) in insertions {
            store.put_insert_signature(id, signature).await?;
        }
        for (signature, id, _) in deletions {
            store.put_delete_signature(id, signature).await?;
        }

        let unsigned = Batch(
            insertions
                .iter()
                .map(|(_, id, key, value)| (key.clone(), (id.clone(), value.clone())))
                .collect(),
            deletions.iter().map(|(_, id, key)| (id.clone(), key.clone())).collect(),
        );
        self.inner.map.process(&unsigned, skip_flush).await?;

        // An insertion signature only matters while its id is the
        // authoritative value for its key
        for (_, id, key, _) in insertions {
            let authoritative = matches!(
                store.live_pair(key).await?,
                Some(pair) if pair.id == *id
            );
            if !authoritative {
                store.remove_insert_signature(id).await?;
            }
        }
        for (_, id, _) in deletions {
            store.remove_insert_signature(id).await?;
        }
        Ok(())
    }

    /// Full signed snapshot. Fails with `MissingSignature` when a live
    /// pair or retained tombstone has no stored signature, which means
    /// the store is corrupt.
    pub async fn dump(&self) -> MapResult<SignedBatch<V>> {
        let _guard = self.inner.lock.lock().await;
        let Batch(insertions, deletions) = self.inner.map.dump().await?;
        let store = &self.inner.map.inner.store;

        let mut signed = SignedBatch::new();
        for (key, (id, value)) in insertions {
            let signature = store.insert_signature(&id).await?.ok_or_else(|| {
                MapError::MissingSignature(format!("no insertion signature for {key}@{id}"))
            })?;
            signed.0.push((signature, id, key, value));
        }
        for (id, key) in deletions {
            let signature = store.delete_signature(&id).await?.ok_or_else(|| {
                MapError::MissingSignature(format!("no deletion signature for {key}@{id}"))
            })?;
            signed.1.push((signature, id, key));
        }
        Ok(signed)
    }

    /// Emit `queue` as a signed publish; with no queue, emit `dump()`
    pub async fn sync(&self, queue: Option<SignedBatch<V>>) -> MapResult<()> {
        let batch = match queue {
            Some(batch) => batch,
            None => self.dump().await?,
        };
        if !batch.is_empty() {
            self.inner.publishes.emit(batch);
        }
        Ok(())
    }

    pub async fn get(&self, key: &str) -> MapResult<Option<V>> {
        self.inner.map.get(key).await
    }

    pub async fn has(&self, key: &str) -> MapResult<bool> {
        self.inner.map.has(key).await
    }

    pub fn len(&self) -> usize {
        self.inner.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.map.is_empty()
    }

    pub async fn keys(&self) -> MapResult<Vec<String>> {
        self.inner.map.keys().await
    }

    pub async fn values(&self) -> MapResult<Vec<V>> {
        self.inner.map.values().await
    }

    /// Streaming cursor over live pairs in key order
    pub fn entries(&self) -> super::EntryCursor<V, S> {
        self.inner.map.entries()
    }

    pub async fn tombstone_count(&self) -> MapResult<usize> {
        self.inner.map.tombstone_count().await
    }

    pub async fn flush(&self) -> MapResult<usize> {
        self.inner.map.flush().await
    }

    /// Cancel the signed publish timer, drain signed processing, then
    /// shut the core down
    pub async fn shutdown(&self) {
        if let Some(handle) = self.take_publish_task() {
            handle.abort();
            let _ = handle.await;
        }
        let drain = self.inner.lock.lock().await;
        drop(drain);
        self.inner.map.shutdown().await;
    }

    fn enqueue(&self, batch: SignedBatch<V>) {
        self.inner
            .queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(batch);
    }

    async fn schedule_publish(&self) {
        let delay = self.inner.map.inner.options.buffer_publishing;
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

    async fn publish(&self) {
        let batch = std::mem::take(
            &mut *self.inner.queues.lock().unwrap_or_else(PoisonError::into_inner),
        );
        if batch.is_empty() {
            return;
        }
        let _ = self.sync(Some(batch)).await;
    }

    fn take_publish_task(&self) -> Option<JoinHandle<()>> {
        self.inner.publish_task.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}
