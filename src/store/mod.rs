/*
    store - State backends for the observed-remove containers

    A replica's state is four keyed tables:

    - live pairs:          key -> (id, value), at most one per key
    - tombstones:          id  -> key
    - insertion signatures: id -> signature   (signed variant)
    - deletion signatures:  id -> signature   (signed variant)

    The map core owns a single-flight mutex and funnels every mutation
    through it, so implementations only need interior consistency, not
    cross-call atomicity.
*/

use crate::error::MapResult;
use crate::id::OpId;
use crate::signer::Signature;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

mod memory;
mod persistent;

pub use memory::MemoryStore;
pub use persistent::PersistentStore;

/// The current (id, value) installed for a key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LivePair<V> {
    pub id: OpId,
    pub value: V,
}

/// Abstract state backend
///
/// Reads return `Option`: absence is an expected signal and never an
/// error. Only real I/O failures surface as `MapError::Storage`.
#[async_trait]
pub trait StateStore<V>: Send + Sync + 'static {
    /// Reconcile startup state; returns the live-pair count
    async fn init(&self) -> MapResult<usize>;

    async fn live_pair(&self, key: &str) -> MapResult<Option<LivePair<V>>>;

    async fn put_live_pair(&self, key: &str, pair: &LivePair<V>) -> MapResult<()>;

    async fn remove_live_pair(&self, key: &str) -> MapResult<()>;

    /// Snapshot of all live pairs in key order
    async fn live_pairs(&self) -> MapResult<Vec<(String, LivePair<V>)>>;

    /// Page of live pairs with keys strictly after `after`, in key order
    async fn live_pairs_page(
        &self,
        after: Option<&str>,
        limit: usize,
    ) -> MapResult<Vec<(String, LivePair<V>)>>;

    /// Reverse lookup: the key whose live pair carries `id`, if any
    async fn key_for_id(&self, id: &OpId) -> MapResult<Option<String>>;

    async fn tombstone_key(&self, id: &OpId) -> MapResult<Option<String>>;

    async fn put_tombstone(&self, id: &OpId, key: &str) -> MapResult<()>;

    /// Snapshot of all tombstones in id order
    async fn tombstones(&self) -> MapResult<Vec<(OpId, String)>>;

    async fn tombstone_count(&self) -> MapResult<usize>;

    /// Remove tombstones and deletion signatures whose id sorts below
    /// `cutoff`; returns how many tombstones went away
    async fn flush(&self, cutoff: &str) -> MapResult<usize>;

    async fn put_insert_signature(&self, id: &OpId, signature: &Signature) -> MapResult<()>;

    async fn insert_signature(&self, id: &OpId) -> MapResult<Option<Signature>>;

    async fn remove_insert_signature(&self, id: &OpId) -> MapResult<()>;

    async fn put_delete_signature(&self, id: &OpId, signature: &Signature) -> MapResult<()>;

    async fn delete_signature(&self, id: &OpId) -> MapResult<Option<Signature>>;
}
