//! Bound call arguments and argument extraction.
//!
//! A call's arguments are bound by name once, up front. Templates then read
//! them through an [`ArgumentExtractor`] instead of reflective getters.

use crate::constants::RESULT_ALIAS;
use crate::error::TemplateError;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// Named arguments of one call.
///
/// Ordered by name so the canonical form is stable and can be used as an
/// identity for coalescing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BoundArgs {
    values: BTreeMap<String, Value>,
}

impl BoundArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a JSON value under `name`.
    ///
    /// `result` is reserved for the operation's return value and cannot be
    /// bound by callers.
    pub fn bind(mut self, name: impl Into<String>, value: impl Into<Value>) -> Result<Self, TemplateError> {
        let name = name.into();
        if name == RESULT_ALIAS {
            return Err(TemplateError::ReservedName { name });
        }
        self.values.insert(name, value.into());
        Ok(self)
    }

    /// Bind any serializable value under `name`.
    pub fn bind_serialized<T: Serialize>(
        self,
        name: impl Into<String>,
        value: &T,
    ) -> Result<Self, TemplateError> {
        let name = name.into();
        let value = serde_json::to_value(value).map_err(|e| TemplateError::Unresolved {
            template: String::new(),
            placeholder: format!("{} ({})", name, e),
        })?;
        self.bind(name, value)
    }

    /// Bind the reserved `result` alias. Only the protocol does this.
    pub fn for_result(value: Value) -> Self {
        let mut values = BTreeMap::new();
        values.insert(RESULT_ALIAS.to_string(), value);
        Self { values }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub(crate) fn insert_raw(&mut self, name: String, value: Value) {
        self.values.insert(name, value);
    }

    /// Canonical JSON rendering, sorted by name.
    pub fn canonical(&self) -> String {
        // BTreeMap<String, Value> always serializes.
        serde_json::to_string(&self.values).unwrap_or_default()
    }
}

/// Resolves a placeholder's value from bound arguments.
///
/// Supplied by the caller. This replaces reflective getter lookup.
pub trait ArgumentExtractor: Send + Sync {
    /// Return the value at `root` followed by `path`, or `None` if any step
    /// is missing.
    fn extract(&self, args: &BoundArgs, root: &str, path: &[String]) -> Option<Value>;
}

/// Default extractor: walks JSON objects by field name and arrays by index.
#[derive(Debug, Clone, Copy, Default)]
pub struct PathExtractor;

impl ArgumentExtractor for PathExtractor {
    fn extract(&self, args: &BoundArgs, root: &str, path: &[String]) -> Option<Value> {
        let mut current = args.get(root)?;
        for segment in path {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current.clone())
    }
}
