//! Error types for the PostgreSQL store.
//!
//! All errors are propagated via [`DbError`]. At the [`EntityStore`]
//! boundary they are wrapped into a [`StoreError`] naming the operation that
//! failed.
//!
//! [`EntityStore`]: relcache_core::EntityStore

use relcache_core::{ContractViolation, StoreError};
use relcache_types::{EntityName, SchemaError};

/// Errors that can occur in the PostgreSQL store.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// A `PostgreSQL` operation failed.
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] sqlx::Error),

    /// A configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The schema registry does not describe the request.
    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    /// The registry's foreign keys do not admit a write order.
    #[error("Schema error: {0}")]
    Contract(#[from] ContractViolation),

    /// A field that is neither a column nor a to-one relation of the type.
    #[error("{entity} has no column for field `{field}`")]
    UnknownField {
        /// The entity type.
        entity: EntityName,
        /// The offending field.
        field: String,
    },

    /// A value cannot be bound to its column.
    #[error("cannot bind {found} to {entity}.{field} ({expected})")]
    Encode {
        /// The entity type.
        entity: EntityName,
        /// The field being written.
        field: String,
        /// Expected column type.
        expected: &'static str,
        /// Kind of the value supplied.
        found: &'static str,
    },

    /// A numeric value outside the range `PostgreSQL` accepts.
    #[error("value out of range: {0}")]
    OutOfRange(String),
}

impl DbError {
    /// Wrap into a [`StoreError`] for `operation` on `entity`.
    pub fn into_store_error(self, operation: &str, entity: &EntityName) -> StoreError {
        StoreError::new(format!("{operation} {entity}"), self)
    }
}
