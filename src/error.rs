/*
    error.rs - Error types for the observed-remove containers

    One error enum shared by the map, the signed map, the set variant and
    both state stores. "Not found" is never represented here: store reads
    return Option and absence is consumed by the caller.
*/

use thiserror::Error;

/// Errors surfaced by map, set and store operations
#[derive(Debug, Error)]
pub enum MapError {
    /// A signature in a signed batch failed verification.
    /// The whole batch is rejected before any state is written.
    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    /// A stored signature that must exist (live pair or retained
    /// tombstone during a signed dump) could not be found.
    #[error("missing signature: {0}")]
    MissingSignature(String),

    /// Persistent store I/O failure
    #[error("storage error: {0}")]
    Storage(String),

    /// Value could not be serialized or deserialized
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Initial batch ingestion or size reconciliation failed
    #[error("readiness failure: {0}")]
    Readiness(String),
}

/// Result type for map and store operations
pub type MapResult<T> = Result<T, MapError>;

impl From<serde_json::Error> for MapError {
    fn from(err: serde_json::Error) -> Self {
        MapError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for MapError {
    fn from(err: std::io::Error) -> Self {
        MapError::Storage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MapError::InvalidSignature("insertion a@0001".to_string());
        assert_eq!(err.to_string(), "invalid signature: insertion a@0001");

        let err = MapError::Storage("disk full".to_string());
        assert!(err.to_string().contains("disk full"));
    }

    #[test]
    fn test_serde_error_conversion() {
        let bad = serde_json::from_str::<u32>("not json").unwrap_err();
        let err: MapError = bad.into();
        assert!(matches!(err, MapError::Serialization(_)));
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let err: MapError = io.into();
        assert!(matches!(err, MapError::Storage(_)));
    }
}
