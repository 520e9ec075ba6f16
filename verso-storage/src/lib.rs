//! VERSO Storage - Cache Stores, Versioned Read-Through and Coalescing
//!
//! The cache-aside layer: pluggable stores and their near/far composition,
//! the versioned consistency protocol that decides hits against version keys,
//! and the request coalescer that keeps concurrent misses from stampeding
//! the backend.

pub mod cache;
pub mod coalesce;
pub mod operation;
pub mod versioned;

pub use cache::{
    add_with_optional_ttl, CacheManager, CacheRead, CacheStats, CacheStore, LmdbCacheError,
    LmdbCacheStore, MemoryCacheStore, MultiLevelCache, ReadOutcome, Reachability,
};
pub use coalesce::{Leader, OperationKey, Registration, RequestCoalescer, Waiter};
pub use operation::{
    CachePath, CoalescePolicy, Maintenance, OperationBuilder, OperationDescriptor,
    OperationRegistry, ReadThrough, ResultShape,
};
pub use versioned::{
    BackendCoalescer, BackendExecutor, BackendOutcome, Call, ProtocolStats, SharedOutcome,
    VersionedCache,
};
