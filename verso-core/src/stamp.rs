//! Version stamps.
//!
//! A version key holds a stamp: a wall-clock token in milliseconds. Cache
//! entries carry the stamp that was current when they were written. Stamps
//! are compared for equality only, but every mint is strictly greater than
//! the previous one in this process, so a bump never writes back the token
//! it replaces.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

static LAST_MINTED: AtomicI64 = AtomicI64::new(0);

/// A version token. Zero (or negative) means "no stamp".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct VersionStamp(i64);

impl VersionStamp {
    /// The "no stamp" value.
    pub const NONE: VersionStamp = VersionStamp(0);

    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// Mint a fresh stamp from the current wall-clock time.
    pub fn mint() -> Self {
        Self::mint_after(Self::NONE)
    }

    /// Mint a stamp greater than `previous` and than any stamp minted
    /// earlier in this process: `max(now_ms, previous + 1, last + 1)`.
    pub fn mint_after(previous: VersionStamp) -> Self {
        let now = Utc::now().timestamp_millis();
        let floor = previous.0.max(0).saturating_add(1);
        let mut last = LAST_MINTED.load(Ordering::Relaxed);
        loop {
            let next = now.max(floor).max(last.saturating_add(1));
            match LAST_MINTED.compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed) {
                Ok(_) => return Self(next),
                Err(actual) => last = actual,
            }
        }
    }

    /// Read a stamp out of a version key's stored value. Anything that is not
    /// an integer reads as [`VersionStamp::NONE`].
    pub fn from_value(value: Option<&Value>) -> Self {
        value.and_then(Value::as_i64).map(Self).unwrap_or(Self::NONE)
    }

    pub fn as_i64(&self) -> i64 {
        self.0
    }

    pub fn to_value(self) -> Value {
        Value::from(self.0)
    }

    /// True if this is a real stamp.
    pub fn is_valid(&self) -> bool {
        self.0 > 0
    }

    /// True if both are real stamps and equal.
    pub fn matches(&self, other: VersionStamp) -> bool {
        self.is_valid() && self.0 == other.0
    }
}

impl fmt::Display for VersionStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
