//! VERSO Core - Data Types, Key Templates and Errors
//!
//! Pure data structures and the key template machinery. All other crates
//! depend on this. No I/O happens here.

pub mod args;
pub mod batch;
pub mod config;
pub mod constants;
pub mod entities;
pub mod error;
pub mod stamp;
pub mod template;

pub use args::{ArgumentExtractor, BoundArgs, PathExtractor};
pub use batch::expand_batch;
pub use config::VersoConfig;
pub use constants::*;
pub use entities::{page_meta_key, paged_key, CacheEntry, PageDescriptor, PageMeta};
pub use error::{
    BackendError, CacheError, CoalesceError, ConfigError, TemplateError, VersoError, VersoResult,
};
pub use stamp::VersionStamp;
pub use template::{format_positional, KeyResolver, KeyTemplate, Placeholder, Segment};

/// Result type for cache store calls.
pub type CacheResult<T> = Result<T, CacheError>;
