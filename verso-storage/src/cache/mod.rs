//! Cache stores and their composition.
//!
//! Every backing cache client is adapted to [`CacheStore`], whose only
//! failure is `CacheError::Unreachable`. Stores compose into near/far chains
//! through [`MultiLevelCache`] and are looked up by pool through
//! [`CacheManager`].
//!
//! # Example
//!
//! ```ignore
//! let near = Arc::new(MemoryCacheStore::new("near"));
//! let far = Arc::new(LmdbCacheStore::new("far", path, 64)?);
//! let photos = MultiLevelCache::new("photos", near)
//!     .with_far(far)
//!     .with_reconnect_interval(Duration::from_secs(30));
//! let manager = CacheManager::new().with_default(Arc::new(photos));
//! ```

pub mod lmdb_backend;
pub mod manager;
pub mod memory;
pub mod multi_level;
pub mod outcome;
pub mod traits;

pub use lmdb_backend::{LmdbCacheError, LmdbCacheStore};
pub use manager::CacheManager;
pub use memory::MemoryCacheStore;
pub use multi_level::{MultiLevelCache, Reachability};
pub use outcome::{CacheRead, ReadOutcome};
pub use traits::{add_with_optional_ttl, CacheStats, CacheStore};
