//! Cached entry shapes and pagination.

use crate::constants::{PAGE_META_PREFIX, PAGE_SUFFIX};
use crate::stamp::VersionStamp;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A cached result together with the stamp it was written under.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub value: Value,
    #[serde(default)]
    pub version: VersionStamp,
}

impl CacheEntry {
    pub fn new(value: Value, version: VersionStamp) -> Self {
        Self { value, version }
    }

    /// Decode a stored entry. Values that are not entries read as `None`.
    pub fn from_value(raw: Value) -> Option<Self> {
        serde_json::from_value(raw).ok()
    }

    pub fn to_value(&self) -> Value {
        serde_json::json!({ "value": self.value, "version": self.version })
    }
}

/// Page metadata stored next to a paginated entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageMeta {
    pub total: u64,
}

impl PageMeta {
    pub fn from_value(raw: Value) -> Option<Self> {
        serde_json::from_value(raw).ok()
    }

    pub fn to_value(self) -> Value {
        serde_json::json!({ "total": self.total })
    }
}

/// Caller-supplied pagination state.
///
/// The cache layer reads `current_page` and writes `total`; everything else
/// is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageDescriptor {
    pub current_page: u32,
    pub page_size: u32,
    pub total: u64,
}

impl PageDescriptor {
    /// Pages are 1-based; page 0 is clamped to 1.
    pub fn new(current_page: u32, page_size: u32) -> Self {
        Self {
            current_page: current_page.max(1),
            page_size,
            total: 0,
        }
    }

    pub fn total_pages(&self) -> u64 {
        if self.page_size == 0 {
            return 0;
        }
        self.total.div_ceil(self.page_size as u64)
    }

    pub fn start_offset(&self) -> u64 {
        (self.current_page.max(1) as u64 - 1) * self.page_size as u64
    }
}

/// `key` with the page suffix for `page`: `photo-l-d-album1` → `photo-l-d-album1-p2`.
pub fn paged_key(key: &str, page: u32) -> String {
    format!("{}{}{}", key, PAGE_SUFFIX, page)
}

/// Where the page metadata for `key` lives.
pub fn page_meta_key(key: &str) -> String {
    format!("{}{}", PAGE_META_PREFIX, key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_cache_entry_roundtrip_through_value() {
        let entry = CacheEntry::new(json!({"id": 1}), VersionStamp::new(99));
        let raw = entry.to_value();
        assert_eq!(raw, json!({"value": {"id": 1}, "version": 99}));
        assert_eq!(CacheEntry::from_value(raw), Some(entry));
    }

    #[test]
    fn test_non_entry_value_reads_as_none() {
        assert_eq!(CacheEntry::from_value(json!(42)), None);
    }

    #[test]
    fn test_entry_without_version_is_unstamped() {
        let entry = CacheEntry::from_value(json!({"value": "x"})).unwrap();
        assert_eq!(entry.version, VersionStamp::NONE);
    }

    #[test]
    fn test_page_keys() {
        let key = paged_key("photo-l-d-album1", 2);
        assert_eq!(key, "photo-l-d-album1-p2");
        assert_eq!(page_meta_key(&key), "page-photo-l-d-album1-p2");
    }

    #[test]
    fn test_page_descriptor_math() {
        let mut page = PageDescriptor::new(3, 10);
        page.total = 25;
        assert_eq!(page.total_pages(), 3);
        assert_eq!(page.start_offset(), 20);
        assert_eq!(PageDescriptor::new(0, 10).current_page, 1);
        assert_eq!(PageDescriptor::new(1, 0).total_pages(), 0);
    }
}
