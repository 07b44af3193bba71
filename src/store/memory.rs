/*
    memory.rs - In-memory state backend

    BTreeMap tables behind a std mutex. Iteration order is key order,
    matching the persistent backend's range scans, so the two backends
    observe identical sequences. The lock is never held across an await;
    the map core serializes mutations through its own tokio mutex.
*/

use super::{LivePair, StateStore};
use crate::error::MapResult;
use crate::id::OpId;
use crate::signer::Signature;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Mutex, PoisonError};

/// Volatile backend for replicas that do not outlive the process
#[derive(Debug, Default)]
pub struct MemoryStore<V> {
    inner: Mutex<Tables<V>>,
}

#[derive(Debug)]
struct Tables<V> {
    pairs: BTreeMap<String, LivePair<V>>,
    /// id string -> key
    tombstones: BTreeMap<String, String>,
    insert_signatures: BTreeMap<String, Signature>,
    delete_signatures: BTreeMap<String, Signature>,
}

impl<V> Default for Tables<V> {
    fn default() -> Self {
        Tables {
            pairs: BTreeMap::new(),
            tombstones: BTreeMap::new(),
            insert_signatures: BTreeMap::new(),
            delete_signatures: BTreeMap::new(),
        }
    }
}

impl<V> MemoryStore<V> {
    pub fn new() -> Self {
        MemoryStore { inner: Mutex::new(Tables::default()) }
    }

    fn tables(&self) -> std::sync::MutexGuard<'_, Tables<V>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl<V> StateStore<V> for MemoryStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    async fn init(&self) -> MapResult<usize> {
        Ok(self.tables().pairs.len())
    }

    async fn live_pair(&self, key: &str) -> MapResult<Option<LivePair<V>>> {
        Ok(self.tables().pairs.get(key).cloned())
    }

    async fn put_live_pair(&self, key: &str, pair: &LivePair<V>) -> MapResult<()> {
        self.tables().pairs.insert(key.to_string(), pair.clone());
        Ok(())
    }

    async fn remove_live_pair(&self, key: &str) -> MapResult<()> {
        self.tables().pairs.remove(key);
        Ok(())
    }

    async fn live_pairs(&self) -> MapResult<Vec<(String, LivePair<V>)>> {
        Ok(self.tables().pairs.iter().map(|(k, p)| (k.clone(), p.clone())).collect())
    }

    async fn live_pairs_page(
        &self,
        after: Option<&str>,
        limit: usize,
    ) -> MapResult<Vec<(String, LivePair<V>)>> {
        let lower = match after {
            Some(key) => Bound::Excluded(key.to_string()),
            None => Bound::Unbounded,
        };
        Ok(self
            .tables()
            .pairs
            .range((lower, Bound::Unbounded))
            .take(limit)
            .map(|(k, p)| (k.clone(), p.clone()))
            .collect())
    }

    async fn key_for_id(&self, id: &OpId) -> MapResult<Option<String>> {
        Ok(self
            .tables()
            .pairs
            .iter()
            .find(|(_, pair)| pair.id == *id)
            .map(|(key, _)| key.clone()))
    }

    async fn tombstone_key(&self, id: &OpId) -> MapResult<Option<String>> {
        Ok(self.tables().tombstones.get(id.as_str()).cloned())
    }

    async fn put_tombstone(&self, id: &OpId, key: &str) -> MapResult<()> {
        self.tables().tombstones.insert(id.0.clone(), key.to_string());
        Ok(())
    }

    async fn tombstones(&self) -> MapResult<Vec<(OpId, String)>> {
        Ok(self
            .tables()
            .tombstones
            .iter()
            .map(|(id, key)| (OpId(id.clone()), key.clone()))
            .collect())
    }

    async fn tombstone_count(&self) -> MapResult<usize> {
        Ok(self.tables().tombstones.len())
    }

    async fn flush(&self, cutoff: &str) -> MapResult<usize> {
        let mut tables = self.tables();

        // split_off keeps everything >= cutoff; ids sort by their time
        // prefix, so everything below the cutoff is older than max_age
        let kept = tables.tombstones.split_off(cutoff);
        let removed = tables.tombstones.len();
        tables.tombstones = kept;

        let kept = tables.delete_signatures.split_off(cutoff);
        tables.delete_signatures = kept;

        Ok(removed)
    }

    async fn put_insert_signature(&self, id: &OpId, signature: &Signature) -> MapResult<()> {
        self.tables().insert_signatures.insert(id.0.clone(), signature.clone());
        Ok(())
    }

    async fn insert_signature(&self, id: &OpId) -> MapResult<Option<Signature>> {
        Ok(self.tables().insert_signatures.get(id.as_str()).cloned())
    }

    async fn remove_insert_signature(&self, id: &OpId) -> MapResult<()> {
        self.tables().insert_signatures.remove(id.as_str());
        Ok(())
    }

    async fn put_delete_signature(&self, id: &OpId, signature: &Signature) -> MapResult<()> {
        self.tables().delete_signatures.insert(id.0.clone(), signature.clone());
        Ok(())
    }

    async fn delete_signature(&self, id: &OpId) -> MapResult<Option<Signature>> {
        Ok(self.tables().delete_signatures.get(id.as_str()).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(id: &str, value: i64) -> LivePair<i64> {
        LivePair { id: OpId::from(id), value }
    }

    #[tokio::test]
    async fn test_live_pair_round_trip() {
        let store: MemoryStore<i64> = MemoryStore::new();

        assert!(store.live_pair("a").await.unwrap().is_none());
        store.put_live_pair("a", &pair("0000000001aaaa000000", 7)).await.unwrap();
        assert_eq!(store.live_pair("a").await.unwrap().unwrap().value, 7);

        store.remove_live_pair("a").await.unwrap();
        assert!(store.live_pair("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_live_pairs_are_key_ordered() {
        let store: MemoryStore<i64> = MemoryStore::new();
        for (key, value) in [("c", 3), ("a", 1), ("b", 2)] {
            store.put_live_pair(key, &pair("0000000001aaaa000000", value)).await.unwrap();
        }

        let keys: Vec<String> =
            store.live_pairs().await.unwrap().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_paging_walks_the_whole_table() {
        let store: MemoryStore<i64> = MemoryStore::new();
        for n in 0..10 {
            store.put_live_pair(&format!("k{n}"), &pair("0000000001aaaa000000", n)).await.unwrap();
        }

        let mut seen = Vec::new();
        let mut after: Option<String> = None;
        loop {
            let page = store.live_pairs_page(after.as_deref(), 3).await.unwrap();
            if page.is_empty() {
                break;
            }
            after = page.last().map(|(k, _)| k.clone());
            seen.extend(page.into_iter().map(|(k, _)| k));
        }
        assert_eq!(seen.len(), 10);
    }

    #[tokio::test]
    async fn test_flush_respects_cutoff() {
        let store: MemoryStore<i64> = MemoryStore::new();
        store.put_tombstone(&OpId::from("000000001aaaa0000000"), "a").await.unwrap();
        store.put_tombstone(&OpId::from("000000005aaaa0000000"), "b").await.unwrap();
        store.put_tombstone(&OpId::from("000000009aaaa0000000"), "c").await.unwrap();

        let removed = store.flush("000000001").await.unwrap();
        assert_eq!(removed, 0);
        assert_eq!(store.tombstone_count().await.unwrap(), 3);

        let removed = store.flush("000000007").await.unwrap();
        assert_eq!(removed, 2);

        let removed = store.flush("00000000a").await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.tombstone_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_flush_takes_delete_signatures_with_tombstones() {
        let store: MemoryStore<i64> = MemoryStore::new();
        let id = OpId::from("0000000001aaaa000000");
        store.put_tombstone(&id, "a").await.unwrap();
        store.put_delete_signature(&id, &Signature(vec![1, 2, 3])).await.unwrap();
        store.put_insert_signature(&id, &Signature(vec![4, 5, 6])).await.unwrap();

        store.flush("0000000002").await.unwrap();

        assert!(store.delete_signature(&id).await.unwrap().is_none());
        // insertion signatures have their own lifecycle
        assert!(store.insert_signature(&id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_key_for_id_reverse_lookup() {
        let store: MemoryStore<i64> = MemoryStore::new();
        let installed = pair("0000000004bbbb000000", 4);
        store.put_live_pair("found", &installed).await.unwrap();

        assert_eq!(store.key_for_id(&installed.id).await.unwrap().as_deref(), Some("found"));
        assert!(store.key_for_id(&OpId::from("0000000009zzzz000000")).await.unwrap().is_none());
    }
}
