/*
    set.rs - Observed-remove set keyed by value fingerprint

    Wraps the map core: the key for a value is the 128-bit murmur hash
    of its canonical JSON, so two adds of equal-hashed values collapse
    to one live entry under the larger id. The wire format is its own:
    a publish message is a gzip-compressed JSON array whose elements
    are either a bare id string (deletion) or `[id, canonical_json]`
    (insertion).
*/

use super::{Batch, ObservedRemoveMap};
use crate::canonical::{canonical_json, fingerprint, fingerprint_of_canonical};
use crate::config::MapOptions;
use crate::error::MapResult;
use crate::events::{EventBus, MapEvent, SetEvent};
use crate::id::OpId;
use crate::store::{MemoryStore, StateStore};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// One element of the compressed wire array
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum WireOp {
    /// Bare id: the insertion with this id is removed
    Deletion(OpId),
    /// `[id, canonical_json]`
    Insertion((OpId, String)),
}

struct SetShared<V, S> {
    map: ObservedRemoveMap<V, S>,
    queues: StdMutex<Vec<WireOp>>,
    publish_task: StdMutex<Option<JoinHandle<()>>>,
    events: EventBus<SetEvent<V>>,
}

/// Observed-remove set replica
pub struct ObservedRemoveSet<V, S = MemoryStore<V>> {
    inner: Arc<SetShared<V, S>>,
}

impl<V, S> Clone for ObservedRemoveSet<V, S> {
    fn clone(&self) -> Self {
        ObservedRemoveSet { inner: self.inner.clone() }
    }
}

impl<V> ObservedRemoveSet<V, MemoryStore<V>>
where
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn in_memory(options: MapOptions) -> Self {
        Self::new(MemoryStore::new(), options)
    }
}

impl<V, S> ObservedRemoveSet<V, S>
where
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    S: StateStore<V>,
{
    pub fn new(store: S, options: MapOptions) -> Self {
        let map = ObservedRemoveMap::new(store, options);
        // The core's map-shaped publishes stay quiet; this type emits
        // the compressed form
        map.disable_publishing();

        let events: EventBus<SetEvent<V>> = EventBus::default();
        let mut semantic = map.subscribe();
        let bus = events.clone();
        tokio::spawn(async move {
            loop {
                match semantic.recv().await {
                    Ok(MapEvent::Set { value, .. }) => {
                        bus.emit(SetEvent::Add { value });
                    }
                    Ok(MapEvent::Delete { value, .. }) => {
                        bus.emit(SetEvent::Delete { value });
                    }
                    Ok(MapEvent::Affirm { value, .. }) => {
                        bus.emit(SetEvent::Affirm { value });
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        ObservedRemoveSet {
            inner: Arc::new(SetShared {
                map,
                queues: StdMutex::new(Vec::new()),
                publish_task: StdMutex::new(None),
                events,
            }),
        }
    }

    pub async fn ready(&self) -> MapResult<()> {
        self.inner.map.ready().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SetEvent<V>> {
        self.inner.events.subscribe()
    }

    /// Make `value` a member; returns the id of the insertion
    pub async fn add(&self, value: V) -> MapResult<OpId> {
        let (hash, canonical) = fingerprint(&value)?;
        let id = self.inner.map.generate_id();

        // Same shape as the map's set: an observed equal-hash entry is
        // tombstoned, and that deletion rides the wire too, so a peer
        // receiving add/add/delete in one batch cannot keep the first
        // insertion alive
        let superseded = {
            let _guard = self.inner.map.inner.state.lock().await;
            let previous = self.inner.map.inner.store.live_pair(&hash).await?;
            let mut batch = Batch::new();
            if let Some(prev) = &previous {
                batch.1.push((prev.id.clone(), hash.clone()));
            }
            batch.0.push((hash, (id.clone(), value)));
            self.inner.map.process_locked(&batch, true).await?;
            previous.map(|prev| prev.id)
        };

        if let Some(old) = superseded {
            self.enqueue(WireOp::Deletion(old));
        }
        self.enqueue(WireOp::Insertion((id.clone(), canonical)));
        self.schedule_publish().await;
        Ok(id)
    }

    /// Remove `value` from membership; a miss is a no-op
    pub async fn delete(&self, value: &V) -> MapResult<Option<OpId>> {
        let (hash, _) = fingerprint(value)?;
        let Some(id) = self.inner.map.delete(&hash).await? else {
            return Ok(None);
        };
        self.enqueue(WireOp::Deletion(id.clone()));
        self.schedule_publish().await;
        Ok(Some(id))
    }

    pub async fn has(&self, value: &V) -> MapResult<bool> {
        let (hash, _) = fingerprint(value)?;
        self.inner.map.has(&hash).await
    }

    /// Current members in fingerprint order
    pub async fn values(&self) -> MapResult<Vec<V>> {
        self.inner.map.values().await
    }

    pub fn len(&self) -> usize {
        self.inner.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.map.is_empty()
    }

    pub async fn clear(&self) -> MapResult<()> {
        for value in self.values().await? {
            self.delete(&value).await?;
        }
        Ok(())
    }

    pub async fn tombstone_count(&self) -> MapResult<usize> {
        self.inner.map.tombstone_count().await
    }

    pub async fn flush(&self) -> MapResult<usize> {
        self.inner.map.flush().await
    }

    /// Apply a remote compressed message
    pub async fn process(&self, buffer: &[u8]) -> MapResult<()> {
        let ops = decode_ops(buffer)?;

        let _guard = self.inner.map.inner.state.lock().await;
        let mut batch = Batch::new();
        for op in ops {
            match op {
                WireOp::Insertion((id, canonical)) => {
                    let value: V = serde_json::from_str(&canonical)?;
                    let hash = fingerprint_of_canonical(&canonical)?;
                    batch.0.push((hash, (id, value)));
                }
                WireOp::Deletion(id) => {
                    // Recover the affected key when the insertion was
                    // seen; an unseen id still tombstones, which keeps
                    // suppressing it on late arrival
                    let key =
                        self.inner.map.inner.store.key_for_id(&id).await?.unwrap_or_default();
                    batch.1.push((id, key));
                }
            }
        }
        self.inner.map.process_locked(&batch, false).await
    }

    /// Full-state snapshot in the compressed wire form
    pub async fn dump(&self) -> MapResult<Vec<u8>> {
        let Batch(insertions, deletions) = self.inner.map.dump().await?;
        let mut ops = Vec::with_capacity(insertions.len() + deletions.len());
        for (_, (id, value)) in insertions {
            ops.push(WireOp::Insertion((id, canonical_json(&value)?)));
        }
        for (id, _) in deletions {
            ops.push(WireOp::Deletion(id));
        }
        encode_ops(&ops)
    }

    /// Emit `buffer` as a publish; with no buffer, emit `dump()`
    pub async fn sync(&self, buffer: Option<Vec<u8>>) -> MapResult<()> {
        let buffer = match buffer {
            Some(buffer) => buffer,
            None => self.dump().await?,
        };
        self.inner.events.emit(SetEvent::Publish { buffer });
        Ok(())
    }

    pub async fn shutdown(&self) {
        if let Some(handle) = self.take_publish_task() {
            handle.abort();
            let _ = handle.await;
        }
        self.inner.map.shutdown().await;
    }

    fn enqueue(&self, op: WireOp) {
        self.inner.queues.lock().unwrap_or_else(PoisonError::into_inner).push(op);
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
        let set = self.clone();
        *slot = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            set.take_publish_task();
            set.publish().await;
        }));
    }

    async fn publish(&self) {
        let ops = std::mem::take(
            &mut *self.inner.queues.lock().unwrap_or_else(PoisonError::into_inner),
        );
        if ops.is_empty() {
            return;
        }
        if let Ok(buffer) = encode_ops(&ops) {
            let _ = self.sync(Some(buffer)).await;
        }
    }

    fn take_publish_task(&self) -> Option<JoinHandle<()>> {
        self.inner.publish_task.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

fn encode_ops(ops: &[WireOp]) -> MapResult<Vec<u8>> {
    let json = serde_json::to_vec(ops)?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&json)?;
    Ok(encoder.finish()?)
}

fn decode_ops(buffer: &[u8]) -> MapResult<Vec<WireOp>> {
    let mut decoder = GzDecoder::new(buffer);
    let mut json = Vec::new();
    decoder.read_to_end(&mut json)?;
    Ok(serde_json::from_slice(&json)?)
}
