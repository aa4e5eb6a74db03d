//! Error types for the processor binary.

use relcache_core::{CacheError, ContractViolation};
use relcache_db::DbError;
use relcache_types::SchemaError;

use crate::config::ConfigError;

/// Top-level error for the processor binary.
#[derive(Debug, thiserror::Error)]
pub enum ProcessorError {
    /// Configuration loading failed.
    #[error("config error: {source}")]
    Config {
        /// The underlying config error.
        #[from]
        source: ConfigError,
    },

    /// Pool, transaction or DDL failure.
    #[error("database error: {source}")]
    Db {
        /// The underlying database error.
        #[from]
        source: DbError,
    },

    /// A cache operation failed inside a batch.
    #[error("cache error: {source}")]
    Cache {
        /// The underlying cache error.
        #[from]
        source: CacheError,
    },

    /// Reading the input failed.
    #[error("input error: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// An input line is not a valid record.
    #[error("invalid record on line {line}: {source}")]
    Decode {
        /// 1-based input line number.
        line: usize,
        /// The underlying JSON error.
        source: serde_json::Error,
    },

    /// A record names an account the batch never resolved.
    #[error("account {account} was not resolved for this batch")]
    UnresolvedAccount {
        /// The account address.
        account: String,
    },

    /// Applying a record would overflow an account balance.
    #[error("balance overflow on account {account}")]
    Overflow {
        /// The account address.
        account: String,
    },
}

impl From<ContractViolation> for ProcessorError {
    fn from(source: ContractViolation) -> Self {
        Self::Cache {
            source: source.into(),
        }
    }
}

impl From<SchemaError> for ProcessorError {
    fn from(source: SchemaError) -> Self {
        Self::Cache {
            source: source.into(),
        }
    }
}
