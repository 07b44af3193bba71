/*
    observed-remove - Replicated key-value containers

    An observed-remove map (and set) CRDT: peers mutate concurrently,
    exchange opaque batches asynchronously, and every replica that has
    seen the same set of updates converges to the same state. Two state
    backends: in-memory, and an ordered persistent store. A signed
    variant authorizes every operation with an Ed25519 signature.

    The transport is not this crate's business: replicas emit publish
    events and accept batches through `process`; how the bytes travel
    is up to the embedding application.
*/

pub mod canonical;
pub mod config;
pub mod crdt;
pub mod error;
pub mod events;
pub mod id;
pub mod logging;
pub mod signer;
pub mod store;

#[cfg(test)]
mod tests;

pub use config::{MapOptions, PersistentOptions, SignedOptions};
pub use crdt::{
    Batch, Deletion, EntryCursor, Insertion, ObservedRemoveMap, ObservedRemoveSet, SignedBatch,
    SignedDeletion, SignedInsertion, SignedObservedRemoveMap,
};
pub use error::{MapError, MapResult};
pub use events::{EventBus, MapEvent, SetEvent};
pub use id::{IdGenerator, OpId};
pub use logging::{init_logging, init_logging_with_filter, LoggingError};
pub use signer::{KeyFormat, KeyPair, OperationVerifier, Signature};
pub use store::{LivePair, MemoryStore, PersistentStore, StateStore};
