/*
    persistent.rs - Ordered persistent state backend on redb

    All four tables share one redb table under a configured namespace N,
    separated by ASCII punctuation whose natural order keeps the ranges
    disjoint and contiguous:

        live pairs  N > key   ->  json [id, value]
        tombstones  N < id    ->  key bytes
        ins-sig     N [ id    ->  signature bytes
        del-sig     N ] id    ->  signature bytes

    Range iteration uses N∥sep .. N∥next(sep) (for example ">".."?"),
    so flush is a bounded range removal: everything in N< .. N<cutoff
    carries a time prefix below the cutoff. A missing table on the read
    path means the database is brand new and reads as empty.
*/

use super::{LivePair, StateStore};
use crate::config::PersistentOptions;
use crate::error::{MapError, MapResult};
use crate::id::OpId;
use crate::signer::Signature;
use async_trait::async_trait;
use redb::{Database, ReadableTable, TableDefinition, TableError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::ops::Bound;
use std::path::Path;
use std::sync::Arc;

const STATE: TableDefinition<&str, &[u8]> = TableDefinition::new("observed_remove");

const LIVE: char = '>';
const LIVE_END: char = '?';
const TOMB: char = '<';
const TOMB_END: char = '=';
const INS_SIG: char = '[';
const DEL_SIG: char = ']';

/// Durable backend; several replicas may share one database under
/// distinct namespaces
pub struct PersistentStore<V> {
    db: Arc<Database>,
    namespace: String,
    _values: PhantomData<fn() -> V>,
}

impl<V> std::fmt::Debug for PersistentStore<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentStore").field("namespace", &self.namespace).finish_non_exhaustive()
    }
}

impl<V> PersistentStore<V> {
    /// Open or create a database file owned by this store alone
    pub fn open(path: impl AsRef<Path>, options: PersistentOptions) -> MapResult<Self> {
        let db = Database::create(path.as_ref()).map_err(storage)?;
        Ok(Self::with_database(Arc::new(db), options))
    }

    /// Attach to a shared database under this store's namespace
    pub fn with_database(db: Arc<Database>, options: PersistentOptions) -> Self {
        PersistentStore { db, namespace: options.namespace, _values: PhantomData }
    }

    fn pair_key(&self, key: &str) -> String {
        format!("{}{LIVE}{key}", self.namespace)
    }

    fn tombstone_table_key(&self, id: &OpId) -> String {
        format!("{}{TOMB}{id}", self.namespace)
    }

    fn insert_sig_key(&self, id: &OpId) -> String {
        format!("{}{INS_SIG}{id}", self.namespace)
    }

    fn delete_sig_key(&self, id: &OpId) -> String {
        format!("{}{DEL_SIG}{id}", self.namespace)
    }

    fn get_raw(&self, key: &str) -> MapResult<Option<Vec<u8>>> {
        let txn = self.db.begin_read().map_err(storage)?;
        let table = match txn.open_table(STATE) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(e) => return Err(storage(e)),
        };
        Ok(table.get(key).map_err(storage)?.map(|guard| guard.value().to_vec()))
    }

    fn put_raw(&self, key: &str, value: &[u8]) -> MapResult<()> {
        let txn = self.db.begin_write().map_err(storage)?;
        {
            let mut table = txn.open_table(STATE).map_err(storage)?;
            table.insert(key, value).map_err(storage)?;
        }
        txn.commit().map_err(storage)?;
        Ok(())
    }

    fn remove_raw(&self, key: &str) -> MapResult<()> {
        let txn = self.db.begin_write().map_err(storage)?;
        {
            let mut table = txn.open_table(STATE).map_err(storage)?;
            table.remove(key).map_err(storage)?;
        }
        txn.commit().map_err(storage)?;
        Ok(())
    }

    /// All entries in [from, to), keys returned with the prefix stripped
    fn scan_range(&self, from: &str, to: &str) -> MapResult<Vec<(String, Vec<u8>)>> {
        let txn = self.db.begin_read().map_err(storage)?;
        let table = match txn.open_table(STATE) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(e) => return Err(storage(e)),
        };

        let prefix_len = self.namespace.len() + 1;
        let mut out = Vec::new();
        for entry in table.range(from..to).map_err(storage)? {
            let (k, v) = entry.map_err(storage)?;
            out.push((k.value()[prefix_len..].to_string(), v.value().to_vec()));
        }
        Ok(out)
    }

    /// Remove every key in [from, to); returns how many went away
    fn remove_range(&self, from: &str, to: &str) -> MapResult<usize> {
        let txn = self.db.begin_write().map_err(storage)?;
        let removed;
        {
            let mut table = txn.open_table(STATE).map_err(storage)?;
            let mut doomed = Vec::new();
            for entry in table.range(from..to).map_err(storage)? {
                let (k, _) = entry.map_err(storage)?;
                doomed.push(k.value().to_string());
            }
            removed = doomed.len();
            for key in &doomed {
                table.remove(key.as_str()).map_err(storage)?;
            }
        }
        txn.commit().map_err(storage)?;
        Ok(removed)
    }

    fn range_of(&self, sep: char, end: char) -> (String, String) {
        (format!("{}{sep}", self.namespace), format!("{}{end}", self.namespace))
    }
}

#[async_trait]
impl<V> StateStore<V> for PersistentStore<V>
where
    V: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn init(&self) -> MapResult<usize> {
        let (from, to) = self.range_of(LIVE, LIVE_END);
        Ok(self.scan_range(&from, &to)?.len())
    }

    async fn live_pair(&self, key: &str) -> MapResult<Option<LivePair<V>>> {
        match self.get_raw(&self.pair_key(key))? {
            None => Ok(None),
            Some(bytes) => {
                let (id, value): (OpId, V) = serde_json::from_slice(&bytes)?;
                Ok(Some(LivePair { id, value }))
            }
        }
    }

    async fn put_live_pair(&self, key: &str, pair: &LivePair<V>) -> MapResult<()> {
        let bytes = serde_json::to_vec(&(&pair.id, &pair.value))?;
        self.put_raw(&self.pair_key(key), &bytes)
    }

    async fn remove_live_pair(&self, key: &str) -> MapResult<()> {
        self.remove_raw(&self.pair_key(key))
    }

    async fn live_pairs(&self) -> MapResult<Vec<(String, LivePair<V>)>> {
        let (from, to) = self.range_of(LIVE, LIVE_END);
        self.scan_range(&from, &to)?
            .into_iter()
            .map(|(key, bytes)| {
                let (id, value): (OpId, V) = serde_json::from_slice(&bytes)?;
                Ok((key, LivePair { id, value }))
            })
            .collect()
    }

    async fn live_pairs_page(
        &self,
        after: Option<&str>,
        limit: usize,
    ) -> MapResult<Vec<(String, LivePair<V>)>> {
        let txn = self.db.begin_read().map_err(storage)?;
        let table = match txn.open_table(STATE) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(e) => return Err(storage(e)),
        };

        let (range_start, range_end) = self.range_of(LIVE, LIVE_END);
        let from = match after {
            Some(key) => self.pair_key(key),
            None => range_start,
        };
        let lower = if after.is_some() {
            Bound::Excluded(from.as_str())
        } else {
            Bound::Included(from.as_str())
        };

        let prefix_len = self.namespace.len() + 1;
        let mut out = Vec::new();
        for entry in table.range::<&str>((lower, Bound::Excluded(range_end.as_str()))).map_err(storage)? {
            if out.len() == limit {
                break;
            }
            let (k, v) = entry.map_err(storage)?;
            let (id, value): (OpId, V) = serde_json::from_slice(v.value())?;
            out.push((k.value()[prefix_len..].to_string(), LivePair { id, value }));
        }
        Ok(out)
    }

    async fn key_for_id(&self, id: &OpId) -> MapResult<Option<String>> {
        let (from, to) = self.range_of(LIVE, LIVE_END);
        for (key, bytes) in self.scan_range(&from, &to)? {
            // Only the id field matters here; skip decoding the value
            let (pair_id, _): (OpId, serde::de::IgnoredAny) = serde_json::from_slice(&bytes)?;
            if pair_id == *id {
                return Ok(Some(key));
            }
        }
        Ok(None)
    }

    async fn tombstone_key(&self, id: &OpId) -> MapResult<Option<String>> {
        Ok(self
            .get_raw(&self.tombstone_table_key(id))?
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }

    async fn put_tombstone(&self, id: &OpId, key: &str) -> MapResult<()> {
        self.put_raw(&self.tombstone_table_key(id), key.as_bytes())
    }

    async fn tombstones(&self) -> MapResult<Vec<(OpId, String)>> {
        let (from, to) = self.range_of(TOMB, TOMB_END);
        Ok(self
            .scan_range(&from, &to)?
            .into_iter()
            .map(|(id, bytes)| (OpId(id), String::from_utf8_lossy(&bytes).into_owned()))
            .collect())
    }

    async fn tombstone_count(&self) -> MapResult<usize> {
        let (from, to) = self.range_of(TOMB, TOMB_END);
        Ok(self.scan_range(&from, &to)?.len())
    }

    async fn flush(&self, cutoff: &str) -> MapResult<usize> {
        let from = format!("{}{TOMB}", self.namespace);
        let to = format!("{}{TOMB}{cutoff}", self.namespace);
        let removed = self.remove_range(&from, &to)?;

        // Deletion signatures age out with their tombstones, same bounds
        let from = format!("{}{DEL_SIG}", self.namespace);
        let to = format!("{}{DEL_SIG}{cutoff}", self.namespace);
        self.remove_range(&from, &to)?;

        Ok(removed)
    }

    async fn put_insert_signature(&self, id: &OpId, signature: &Signature) -> MapResult<()> {
        self.put_raw(&self.insert_sig_key(id), &signature.0)
    }

    async fn insert_signature(&self, id: &OpId) -> MapResult<Option<Signature>> {
        Ok(self.get_raw(&self.insert_sig_key(id))?.map(Signature))
    }

    async fn remove_insert_signature(&self, id: &OpId) -> MapResult<()> {
        self.remove_raw(&self.insert_sig_key(id))
    }

    async fn put_delete_signature(&self, id: &OpId, signature: &Signature) -> MapResult<()> {
        self.put_raw(&self.delete_sig_key(id), &signature.0)
    }

    async fn delete_signature(&self, id: &OpId) -> MapResult<Option<Signature>> {
        Ok(self.get_raw(&self.delete_sig_key(id))?.map(Signature))
    }
}

fn storage<E: std::fmt::Display>(err: E) -> MapError {
    MapError::Storage(err.to_string())
}
