//! Error types for the cache.
//!
//! Errors fall into three categories:
//!
//! - [`ContractViolation`] -- a programming error in the caller (duplicate
//!   insert, caching a to-many relation, unknown entity type, `remove`). Not
//!   retryable; drivers should abort the unit of work.
//! - [`CacheError::NotFound`] -- raised only by the `..._or_fail` reads.
//!   Plain reads report absence as `None`.
//! - [`StoreError`] -- a failure in the persistent store, propagated as is.

use relcache_types::{EntityId, EntityName, SchemaError};

/// A caller broke the cache's contract.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContractViolation {
    /// The id is already cached, or already pending insert or upsert.
    #[error("duplicate insert of {entity} {id}")]
    DuplicateInsert {
        /// The entity type.
        entity: EntityName,
        /// The duplicated id.
        id: EntityId,
    },

    /// A to-many relation value was handed to the cache.
    #[error("to-many relation {entity}.{field} cannot be cached")]
    ToManyRelation {
        /// The entity type.
        entity: EntityName,
        /// The to-many field.
        field: String,
    },

    /// A field that is neither a column nor a relation of the type.
    #[error("{entity} has no field {field}")]
    UnknownField {
        /// The entity type.
        entity: EntityName,
        /// The undeclared field.
        field: String,
    },

    /// A value whose shape does not fit the declared column or relation.
    #[error("{entity}.{field} expects {expected}, got {found}")]
    FieldType {
        /// The entity type.
        entity: EntityName,
        /// The field.
        field: String,
        /// Declared kind.
        expected: &'static str,
        /// Kind of the supplied value.
        found: &'static str,
    },

    /// Schema metadata is missing or invalid.
    #[error("schema error: {0}")]
    Schema(#[from] SchemaError),

    /// The foreign-key graph has a cycle across distinct entity types.
    #[error("foreign-key cycle between entity types: {}", join(.0))]
    SchemaCycle(Vec<EntityName>),

    /// `remove` was called. Deleting entities is not supported.
    #[error("remove is not supported (entity type {0})")]
    RemoveUnsupported(EntityName),
}

fn join(names: &[EntityName]) -> String {
    names
        .iter()
        .map(EntityName::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

/// A failure reported by the persistent store.
#[derive(Debug, thiserror::Error)]
#[error("{context}: {source}")]
pub struct StoreError {
    context: String,
    #[source]
    source: Box<dyn std::error::Error + Send + Sync>,
}

impl StoreError {
    /// Wrap an underlying error with a short description of the operation.
    pub fn new(
        context: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self {
            context: context.into(),
            source: source.into(),
        }
    }

    /// The operation that failed.
    pub fn context(&self) -> &str {
        &self.context
    }
}

/// Errors returned by [`CacheStore`](crate::CacheStore) operations.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The caller broke the cache's contract.
    #[error("contract violation: {0}")]
    Contract(#[from] ContractViolation),

    /// An `..._or_fail` read found nothing.
    #[error("{entity} not found: {query}")]
    NotFound {
        /// The entity type.
        entity: EntityName,
        /// What was looked up (an id or a filter).
        query: String,
    },

    /// The persistent store failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl CacheError {
    /// Whether this error indicates a programming error rather than a
    /// runtime condition.
    pub const fn is_contract_violation(&self) -> bool {
        matches!(self, Self::Contract(_))
    }
}

impl From<SchemaError> for CacheError {
    fn from(error: SchemaError) -> Self {
        Self::Contract(ContractViolation::Schema(error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_message_lists_types() {
        let err = ContractViolation::SchemaCycle(vec![EntityName::from("A"), EntityName::from("B")]);
        assert_eq!(err.to_string(), "foreign-key cycle between entity types: A, B");
    }

    #[test]
    fn schema_errors_are_contract_violations() {
        let err = CacheError::from(SchemaError::UnknownEntity(EntityName::from("Nope")));
        assert!(err.is_contract_violation());
        assert!(err.to_string().contains("Nope"));
    }

    #[test]
    fn store_error_keeps_context() {
        let err = CacheError::from(StoreError::new("bulk insert into transfer", "connection reset"));
        assert!(!err.is_contract_violation());
        let msg = err.to_string();
        assert!(msg.contains("bulk insert into transfer"));
        assert!(msg.contains("connection reset"));
    }
}
