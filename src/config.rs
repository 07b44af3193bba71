//! Configuration for the observed-remove containers
//!
//! Plain typed option structs with documented defaults. Durations
//! serialize through `humantime_serde` so config files can say "30ms".

use crate::signer::KeyFormat;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Options shared by the map, the signed map and the set variant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapOptions {
    /// Tombstones (and deletion signatures) older than this are removed
    /// by flush, measured against the timestamp embedded in their id
    #[serde(with = "humantime_serde")]
    pub max_age: Duration,

    /// How long outgoing operations are coalesced before a publish
    /// event fires; zero publishes inline
    #[serde(with = "humantime_serde")]
    pub buffer_publishing: Duration,
}

impl Default for MapOptions {
    fn default() -> Self {
        MapOptions {
            max_age: Duration::from_millis(5000),
            buffer_publishing: Duration::from_millis(30),
        }
    }
}

impl MapOptions {
    /// Override the tombstone max age
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    /// Override the publish buffering window
    pub fn with_buffer_publishing(mut self, buffer_publishing: Duration) -> Self {
        self.buffer_publishing = buffer_publishing;
        self
    }
}

/// Options for the persistent backend
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistentOptions {
    /// Key prefix isolating one replica's state inside a shared store
    pub namespace: String,
}

impl PersistentOptions {
    pub fn with_namespace(namespace: impl Into<String>) -> Self {
        PersistentOptions { namespace: namespace.into() }
    }
}

/// Options for the signed map
///
/// There is no `Default`: the public key is required.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedOptions {
    /// Public key every operation in this replica set must verify against
    pub public_key: Vec<u8>,

    /// Signature and key format tag
    pub format: KeyFormat,
}

impl SignedOptions {
    pub fn new(public_key: Vec<u8>) -> Self {
        SignedOptions { public_key, format: KeyFormat::default() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_options_defaults() {
        let options = MapOptions::default();
        assert_eq!(options.max_age, Duration::from_millis(5000));
        assert_eq!(options.buffer_publishing, Duration::from_millis(30));
    }

    #[test]
    fn test_map_options_builder() {
        let options = MapOptions::default()
            .with_max_age(Duration::from_millis(300))
            .with_buffer_publishing(Duration::ZERO);

        assert_eq!(options.max_age, Duration::from_millis(300));
        assert!(options.buffer_publishing.is_zero());
    }

    #[test]
    fn test_persistent_options_default_namespace_is_empty() {
        assert_eq!(PersistentOptions::default().namespace, "");
        assert_eq!(PersistentOptions::with_namespace("alice").namespace, "alice");
    }

    #[test]
    fn test_options_round_trip_through_json() {
        let options = MapOptions::default();
        let encoded = serde_json::to_string(&options).unwrap();
        let decoded: MapOptions = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.max_age, options.max_age);
        assert_eq!(decoded.buffer_publishing, options.buffer_publishing);
    }
}
