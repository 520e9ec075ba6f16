//! Operation descriptors.
//!
//! Each data-access operation is described once at startup: which pool it
//! caches in, how its keys are built, whether it reads through the cache or
//! maintains it after a write, and whether concurrent calls are coalesced.
//! Descriptors are validated when built and never change afterwards.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use verso_core::{ConfigError, KeyTemplate, VersoResult, RESULT_ALIAS};

/// Shape of an operation's result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResultShape {
    /// One object. Its version key is resolved from the object itself.
    #[default]
    Single,
    /// A list or query result. Its version key is resolved from the call
    /// arguments.
    Collection,
}

/// Read-through caching configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadThrough {
    pub key: KeyTemplate,
    pub version_key: Option<KeyTemplate>,
}

/// Cache maintenance run after a successful write.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Maintenance {
    /// Cache keys to delete.
    pub evict: Vec<KeyTemplate>,
    /// Version keys to refresh with a new stamp.
    pub bump: Vec<KeyTemplate>,
}

impl Maintenance {
    pub fn is_empty(&self) -> bool {
        self.evict.is_empty() && self.bump.is_empty()
    }

    pub fn templates(&self) -> impl Iterator<Item = &KeyTemplate> {
        self.evict.iter().chain(self.bump.iter())
    }
}

/// Request coalescing for an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CoalescePolicy {
    /// How long followers wait for the executing call. `None` falls back to
    /// the configured default.
    pub timeout: Option<Duration>,
}

/// What the cache layer does around the backend call.
#[derive(Debug, Clone, Copy)]
pub enum CachePath<'a> {
    ReadThrough(&'a ReadThrough),
    Maintenance(&'a Maintenance),
    PassThrough,
}

/// An immutable, validated operation description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationDescriptor {
    id: String,
    pool: Option<String>,
    shape: ResultShape,
    paginated: bool,
    ttl: Option<Duration>,
    params: Vec<String>,
    batch_params: Vec<String>,
    read_through: Option<ReadThrough>,
    maintenance: Option<Maintenance>,
    coalesce: Option<CoalescePolicy>,
}

impl OperationDescriptor {
    pub fn builder(id: impl Into<String>) -> OperationBuilder {
        OperationBuilder::new(id)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The pool named by the operation, or `default` when it names none.
    pub fn pool_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.pool.as_deref().unwrap_or(default)
    }

    pub fn shape(&self) -> ResultShape {
        self.shape
    }

    pub fn is_paginated(&self) -> bool {
        self.paginated
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    pub fn params(&self) -> &[String] {
        &self.params
    }

    pub fn batch_params(&self) -> &[String] {
        &self.batch_params
    }

    pub fn read_through(&self) -> Option<&ReadThrough> {
        self.read_through.as_ref()
    }

    pub fn maintenance(&self) -> Option<&Maintenance> {
        self.maintenance.as_ref()
    }

    pub fn coalesce(&self) -> Option<CoalescePolicy> {
        self.coalesce
    }

    pub fn cache_path(&self) -> CachePath<'_> {
        match (&self.read_through, &self.maintenance) {
            (Some(read), _) => CachePath::ReadThrough(read),
            (None, Some(maintenance)) => CachePath::Maintenance(maintenance),
            (None, None) => CachePath::PassThrough,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.id.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "id".to_string(),
            });
        }

        if let Some(pool) = &self.pool {
            if pool.trim().is_empty() {
                return Err(invalid("pool", pool, "pool name must not be empty"));
            }
        }

        if self.ttl == Some(Duration::ZERO) {
            return Err(invalid("ttl", "0", "ttl must be positive"));
        }

        for name in self.params.iter().chain(self.batch_params.iter()) {
            if name == RESULT_ALIAS {
                return Err(ConfigError::ReservedName { name: name.clone() });
            }
        }

        for name in &self.batch_params {
            if !self.params.is_empty() && !self.params.contains(name) {
                return Err(invalid("batch", name, "batch parameter is not declared"));
            }
        }

        if self.read_through.is_some() && self.maintenance.is_some() {
            return Err(ConfigError::IncompatibleOptions {
                option_a: "read_through".to_string(),
                option_b: "maintenance".to_string(),
            });
        }

        if let Some(read) = &self.read_through {
            self.validate_read_through(read)?;
        }

        if let Some(maintenance) = &self.maintenance {
            if maintenance.is_empty() {
                return Err(ConfigError::MissingRequired {
                    field: "maintenance".to_string(),
                });
            }
            for template in maintenance.templates() {
                self.validate_argument_template("maintenance", template)?;
            }
        }

        Ok(())
    }

    fn validate_read_through(&self, read: &ReadThrough) -> Result<(), ConfigError> {
        if read.key.is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "key".to_string(),
            });
        }
        self.validate_argument_template("key", &read.key)?;

        match (self.shape, &read.version_key) {
            (ResultShape::Collection, None) => Err(ConfigError::MissingRequired {
                field: "version_key".to_string(),
            }),
            (ResultShape::Collection, Some(vk)) => self.validate_argument_template("version_key", vk),
            (ResultShape::Single, Some(vk)) if !vk.only_references_result() => Err(invalid(
                "version_key",
                vk.text(),
                "single-object version keys may only reference :result",
            )),
            (ResultShape::Single, _) => Ok(()),
        }
    }

    /// Templates resolved from call arguments cannot see the result and may
    /// only reference declared parameters (when any are declared).
    fn validate_argument_template(&self, field: &str, template: &KeyTemplate) -> Result<(), ConfigError> {
        if template.references_result() {
            return Err(invalid(
                field,
                template.text(),
                "the result is not known when this key is resolved",
            ));
        }
        if self.params.is_empty() {
            return Ok(());
        }
        match template.roots().into_iter().find(|root| !self.params.iter().any(|p| p.as_str() == *root)) {
            Some(root) => Err(invalid(
                field,
                template.text(),
                &format!("placeholder :{} is not a declared parameter", root),
            )),
            None => Ok(()),
        }
    }
}

fn invalid(field: &str, value: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

/// Builder for [`OperationDescriptor`].
///
/// Template texts are kept raw until [`OperationBuilder::build`], which
/// applies positional table substitution and then parses them.
#[derive(Debug, Clone, Default)]
pub struct OperationBuilder {
    id: String,
    pool: Option<String>,
    shape: ResultShape,
    paginated: bool,
    ttl: Option<Duration>,
    params: Vec<String>,
    batch_params: Vec<String>,
    key: Option<String>,
    version_key: Option<String>,
    evict: Option<Vec<String>>,
    bump: Option<Vec<String>>,
    coalesce: Option<CoalescePolicy>,
    tables: Vec<String>,
}

impl OperationBuilder {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn pool(mut self, pool: impl Into<String>) -> Self {
        self.pool = Some(pool.into());
        self
    }

    pub fn shape(mut self, shape: ResultShape) -> Self {
        self.shape = shape;
        self
    }

    pub fn single(self) -> Self {
        self.shape(ResultShape::Single)
    }

    pub fn collection(self) -> Self {
        self.shape(ResultShape::Collection)
    }

    pub fn paginated(mut self) -> Self {
        self.paginated = true;
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Declare a parameter name. Once any are declared, templates may only
    /// reference declared names.
    pub fn param(mut self, name: impl Into<String>) -> Self {
        self.params.push(name.into());
        self
    }

    /// Declare an array-valued parameter expanded by batch invocation.
    pub fn batch_param(mut self, name: impl Into<String>) -> Self {
        self.batch_params.push(name.into());
        self
    }

    /// Enable read-through caching under `key`.
    pub fn read_through(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn version_key(mut self, template: impl Into<String>) -> Self {
        self.version_key = Some(template.into());
        self
    }

    /// Delete the key built from `template` after a successful call.
    pub fn evict(mut self, template: impl Into<String>) -> Self {
        self.evict.get_or_insert_with(Vec::new).push(template.into());
        self
    }

    /// Refresh the version key built from `template` after a successful call.
    pub fn bump(mut self, template: impl Into<String>) -> Self {
        self.bump.get_or_insert_with(Vec::new).push(template.into());
        self
    }

    /// Declare write maintenance with explicit (possibly empty) lists.
    pub fn maintenance<I, J, S, T>(mut self, evict: I, bump: J) -> Self
    where
        I: IntoIterator<Item = S>,
        J: IntoIterator<Item = T>,
        S: Into<String>,
        T: Into<String>,
    {
        self.evict = Some(evict.into_iter().map(Into::into).collect());
        self.bump = Some(bump.into_iter().map(Into::into).collect());
        self
    }

    pub fn coalesce(mut self) -> Self {
        self.coalesce.get_or_insert_with(CoalescePolicy::default);
        self
    }

    pub fn coalesce_timeout(mut self, timeout: Duration) -> Self {
        self.coalesce = Some(CoalescePolicy {
            timeout: Some(timeout),
        });
        self
    }

    /// Value for positional `{n}` substitution, in order.
    pub fn table(mut self, name: impl Into<String>) -> Self {
        self.tables.push(name.into());
        self
    }

    pub fn build(self) -> VersoResult<OperationDescriptor> {
        let tables = self.tables;
        let parse = |text: &str| KeyTemplate::parse_with_tables(text, &tables);

        if self.version_key.is_some() && self.key.is_none() {
            return Err(ConfigError::MissingRequired {
                field: "key".to_string(),
            }
            .into());
        }

        let read_through = match self.key {
            Some(key) => Some(ReadThrough {
                key: parse(&key)?,
                version_key: match self.version_key.as_deref() {
                    Some(text) if !text.is_empty() => Some(parse(text)?),
                    _ => None,
                },
            }),
            None => None,
        };

        let maintenance = if self.evict.is_some() || self.bump.is_some() {
            let evict = self.evict.unwrap_or_default();
            let bump = self.bump.unwrap_or_default();
            Some(Maintenance {
                evict: evict.iter().map(|t| parse(t)).collect::<Result<_, _>>()?,
                bump: bump.iter().map(|t| parse(t)).collect::<Result<_, _>>()?,
            })
        } else {
            None
        };

        let descriptor = OperationDescriptor {
            id: self.id,
            pool: self.pool,
            shape: self.shape,
            paginated: self.paginated,
            ttl: self.ttl,
            params: self.params,
            batch_params: self.batch_params,
            read_through,
            maintenance,
            coalesce: self.coalesce,
        };
        descriptor.validate()?;
        Ok(descriptor)
    }
}

/// Registered operations by id.
#[derive(Debug, Default)]
pub struct OperationRegistry {
    operations: RwLock<HashMap<String, Arc<OperationDescriptor>>>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `descriptor`. Ids are unique.
    pub fn insert(&self, descriptor: OperationDescriptor) -> Result<Arc<OperationDescriptor>, ConfigError> {
        let mut operations = self.operations.write().unwrap_or_else(PoisonError::into_inner);
        if operations.contains_key(descriptor.id()) {
            return Err(ConfigError::IncompatibleOptions {
                option_a: format!("operation {}", descriptor.id()),
                option_b: "an existing registration with the same id".to_string(),
            });
        }
        let descriptor = Arc::new(descriptor);
        operations.insert(descriptor.id().to_string(), descriptor.clone());
        Ok(descriptor)
    }

    pub fn get(&self, id: &str) -> Result<Arc<OperationDescriptor>, ConfigError> {
        self.operations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownOperation {
                operation: id.to_string(),
            })
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .operations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.operations.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
