//! How a versioned read was served.

use verso_core::VersionStamp;

/// The path a read took through the cache layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Served from the cache; the backend was not called.
    Hit,
    /// The backend was called and the result written back.
    Miss,
    /// The cache path failed and the backend result was returned unaltered.
    Bypass,
    /// Another in-flight call produced the result.
    Coalesced,
    /// The operation caches nothing.
    PassThrough,
}

impl ReadOutcome {
    pub fn is_hit(&self) -> bool {
        matches!(self, Self::Hit)
    }

    /// True if this call (or the leader it waited on) reached the backend.
    pub fn reached_backend(&self) -> bool {
        !self.is_hit()
    }
}

/// Result of a versioned read, carrying how it was served.
#[derive(Debug, Clone)]
pub struct CacheRead<T> {
    value: T,
    outcome: ReadOutcome,
    /// Stamp the value was cached under, when one is known.
    version: Option<VersionStamp>,
}

impl<T> CacheRead<T> {
    pub fn hit(value: T, version: VersionStamp) -> Self {
        Self {
            value,
            outcome: ReadOutcome::Hit,
            version: Some(version),
        }
    }

    pub fn miss(value: T, version: Option<VersionStamp>) -> Self {
        Self {
            value,
            outcome: ReadOutcome::Miss,
            version,
        }
    }

    pub fn with_outcome(value: T, outcome: ReadOutcome) -> Self {
        Self {
            value,
            outcome,
            version: None,
        }
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn into_value(self) -> T {
        self.value
    }

    pub fn outcome(&self) -> ReadOutcome {
        self.outcome
    }

    pub fn version(&self) -> Option<VersionStamp> {
        self.version
    }

    pub fn was_cache_hit(&self) -> bool {
        self.outcome.is_hit()
    }

    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> CacheRead<U> {
        CacheRead {
            value: f(self.value),
            outcome: self.outcome,
            version: self.version,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_carries_version() {
        let read = CacheRead::hit("photo", VersionStamp::new(42));
        assert!(read.was_cache_hit());
        assert_eq!(read.version(), Some(VersionStamp::new(42)));
        assert!(!read.outcome().reached_backend());
    }

    #[test]
    fn test_map_keeps_metadata() {
        let read = CacheRead::miss(2, Some(VersionStamp::new(7))).map(|v| v * 10);
        assert_eq!(*read.value(), 20);
        assert_eq!(read.outcome(), ReadOutcome::Miss);
        assert_eq!(read.version(), Some(VersionStamp::new(7)));
    }

    #[test]
    fn test_bypass_reached_backend() {
        let read = CacheRead::with_outcome((), ReadOutcome::Bypass);
        assert!(read.outcome().reached_backend());
        assert_eq!(read.version(), None);
    }
}
