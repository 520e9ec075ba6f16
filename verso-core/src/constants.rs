//! Constants for VERSO
//!
//! Centralizing constants makes them easy to find, modify, and test.

// ============================================================================
// POOLS
// ============================================================================

/// Pool used when an operation does not name one.
pub const DEFAULT_POOL: &str = "default";

// ============================================================================
// KEY LAYOUT
// ============================================================================

/// Prefix of the page-metadata entry stored next to a paginated cache key.
pub const PAGE_META_PREFIX: &str = "page-";

/// Separator between a cache key and its page number.
pub const PAGE_SUFFIX: &str = "-p";

/// Reserved placeholder root bound to the operation's own return value.
pub const RESULT_ALIAS: &str = "result";

/// Placeholder sigil in key templates.
pub const PLACEHOLDER_SIGIL: char = ':';

// ============================================================================
// TIMING
// ============================================================================

/// Default half-open retry interval for an unreachable far tier (1 minute)
pub const DEFAULT_RECONNECT_INTERVAL_MS: u64 = 60_000;

// ============================================================================
// LMDB
// ============================================================================

/// Default LMDB map size in megabytes
pub const DEFAULT_LMDB_MAX_SIZE_MB: usize = 64;
