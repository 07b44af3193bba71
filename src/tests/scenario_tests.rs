/*
    scenario_tests.rs - Literal end-to-end replica scenarios

    Each test walks one concrete exchange between replicas, asserting
    sizes, lookups and emitted events step by step.
*/

use crate::config::MapOptions;
use crate::crdt::ObservedRemoveMap;
use crate::events::MapEvent;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::time::Duration;

fn quiet() -> MapOptions {
    MapOptions::default().with_buffer_publishing(Duration::from_secs(3600))
}

async fn fresh() -> ObservedRemoveMap<i64> {
    let map = ObservedRemoveMap::in_memory(quiet());
    map.ready().await.unwrap();
    map
}

/// Set / delete / size bookkeeping on a single replica
#[tokio::test]
async fn test_set_delete_size() {
    let map = fresh().await;

    map.set("a", 1).await.unwrap();
    assert_eq!(map.len(), 1);
    assert!(map.has("a").await.unwrap());

    map.set("b", 2).await.unwrap();
    assert_eq!(map.len(), 2);

    map.delete("a").await.unwrap();
    assert_eq!(map.len(), 1);
    assert!(!map.has("a").await.unwrap());

    // Deleting an absent key changes nothing and emits nothing
    let mut events = map.subscribe();
    map.delete("a").await.unwrap();
    assert_eq!(map.len(), 1);
    assert!(events.try_recv().is_err());
}

/// Out-of-order merge: late-arriving older state cannot resurrect
#[tokio::test]
async fn test_out_of_order_merge() {
    let alice = fresh().await;
    let bob = fresh().await;

    alice.set("k", 1).await.unwrap();
    let d1 = alice.dump().await.unwrap();

    alice.set("k", 2).await.unwrap();
    let d2 = alice.dump().await.unwrap();

    bob.process(&d2, false).await.unwrap();
    assert_eq!(bob.get("k").await.unwrap(), Some(2));

    bob.delete("k").await.unwrap();
    let d3 = bob.dump().await.unwrap();

    alice.process(&d3, false).await.unwrap();
    assert_eq!(alice.get("k").await.unwrap(), None);

    // The v1 insertion is tombstoned in d2's tombstone table
    bob.process(&d1, false).await.unwrap();
    assert_eq!(bob.get("k").await.unwrap(), None);

    // Re-processing the deletion batch is idempotent
    alice.process(&d3, false).await.unwrap();
    assert_eq!(alice.get("k").await.unwrap(), None);
    assert_eq!(alice.len(), 0);
}

/// Concurrent writers: the larger id wins on both sides
#[tokio::test]
async fn test_concurrent_sets_settle_on_larger_id() {
    let alice = fresh().await;
    let bob = fresh().await;

    alice.set("k", 10).await.unwrap();
    // A later millisecond guarantees bob's id sorts above alice's
    tokio::time::sleep(Duration::from_millis(5)).await;
    bob.set("k", 20).await.unwrap();

    let from_alice = alice.dump().await.unwrap();
    let from_bob = bob.dump().await.unwrap();
    alice.process(&from_bob, false).await.unwrap();
    bob.process(&from_alice, false).await.unwrap();

    assert_eq!(alice.get("k").await.unwrap(), Some(20));
    assert_eq!(bob.get("k").await.unwrap(), Some(20));
    assert_eq!(alice.len(), 1);
    assert_eq!(bob.len(), 1);
}

/// Flush honors the embedded age, and never touches live pairs
#[tokio::test]
async fn test_flush_respects_max_age() {
    let map = ObservedRemoveMap::<i64>::in_memory(
        quiet().with_max_age(Duration::from_millis(300)),
    );
    map.ready().await.unwrap();

    map.set("keep", 0).await.unwrap();
    for key in ["a", "b", "c"] {
        map.set(key, 1).await.unwrap();
        map.delete(key).await.unwrap();
    }
    assert_eq!(map.tombstone_count().await.unwrap(), 3);

    // Young tombstones survive a flush
    map.flush().await.unwrap();
    assert_eq!(map.tombstone_count().await.unwrap(), 3);

    tokio::time::sleep(Duration::from_millis(400)).await;
    map.flush().await.unwrap();
    assert_eq!(map.tombstone_count().await.unwrap(), 0);

    // Live pairs are unaffected by flushing
    assert_eq!(map.get("keep").await.unwrap(), Some(0));
    assert_eq!(map.len(), 1);
}

/// A set followed by its delete reaches the same state as silence,
/// on the writer and on every peer whatever batches it saw
#[tokio::test]
async fn test_set_then_delete_identity() {
    let alice = fresh().await;
    let bob = fresh().await;

    alice.set("k", 1).await.unwrap();
    let mid = alice.dump().await.unwrap();
    alice.delete("k").await.unwrap();
    let end = alice.dump().await.unwrap();

    assert_eq!(alice.len(), 0);
    assert!(alice.keys().await.unwrap().is_empty());

    // Bob sees the intermediate batch, then the final one
    bob.process(&mid, false).await.unwrap();
    assert_eq!(bob.get("k").await.unwrap(), Some(1));
    bob.process(&end, false).await.unwrap();
    assert_eq!(bob.get("k").await.unwrap(), None);
    assert_eq!(bob.len(), 0);
}

/// Fan-out: two writers, randomized duplicated delivery, every replica
/// iterates to the same (empty) sequence
#[tokio::test]
async fn test_fan_out_of_100_replicas() {
    const REPLICAS: usize = 100;
    let mut rng = StdRng::seed_from_u64(42);

    let mut maps = Vec::with_capacity(REPLICAS);
    for _ in 0..REPLICAS {
        maps.push(fresh().await);
    }

    let writer_a = rng.gen_range(0..REPLICAS);
    let writer_b = loop {
        let candidate = rng.gen_range(0..REPLICAS);
        if candidate != writer_a {
            break candidate;
        }
    };

    // Three sets and three deletes split across the two writers
    maps[writer_a].set("a", 1).await.unwrap();
    maps[writer_b].set("b", 2).await.unwrap();
    maps[writer_a].set("c", 3).await.unwrap();
    maps[writer_a].delete("a").await.unwrap();
    maps[writer_b].delete("b").await.unwrap();
    maps[writer_a].delete("c").await.unwrap();

    let dumps =
        [maps[writer_a].dump().await.unwrap(), maps[writer_b].dump().await.unwrap()];

    // Randomized delivery: every replica receives both dumps in its own
    // order, sometimes twice
    for map in &maps {
        let mut deliveries: Vec<usize> = vec![0, 1];
        if rng.gen_bool(0.5) {
            deliveries.push(rng.gen_range(0..2));
        }
        deliveries.shuffle(&mut rng);
        for source in deliveries {
            map.process(&dumps[source], false).await.unwrap();
        }
    }

    for (index, map) in maps.iter().enumerate() {
        assert_eq!(map.len(), 0, "replica {index} is not empty");
        let mut cursor = map.entries();
        assert!(cursor.next().await.unwrap().is_none(), "replica {index} still iterates");
    }
}

/// Publish events reach the transport with the coalesced batch intact
#[tokio::test]
async fn test_publish_feeds_a_peer_to_convergence() {
    let alice = ObservedRemoveMap::<i64>::in_memory(
        MapOptions::default().with_buffer_publishing(Duration::from_millis(10)),
    );
    let bob = fresh().await;
    alice.ready().await.unwrap();

    let mut from_alice = alice.subscribe();
    alice.set("x", 7).await.unwrap();
    alice.set("y", 8).await.unwrap();

    let batch = loop {
        match from_alice.recv().await.unwrap() {
            MapEvent::Publish { batch } => break batch,
            _ => {}
        }
    };
    bob.process(&batch, false).await.unwrap();

    assert_eq!(bob.get("x").await.unwrap(), Some(7));
    assert_eq!(bob.get("y").await.unwrap(), Some(8));
}
