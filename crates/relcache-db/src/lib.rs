//! `PostgreSQL` backend for relcache.
//!
//! [`PgStore`] implements [`relcache_core::EntityStore`] over a single
//! transaction, generating every statement from the schema registry:
//!
//! ```text
//! CacheStore::flush
//!     |
//!     +-- insert_many --> INSERT INTO t (...) VALUES (...), (...)
//!     +-- upsert_many --> ... ON CONFLICT ("id") DO UPDATE SET ...
//!
//! CacheStore::get / resolve / find
//!     |
//!     +-- find_by_ids --> SELECT ... WHERE "id" = ANY($1)
//!     +-- find        --> SELECT ... WHERE ... ORDER BY ... LIMIT ...
//! ```
//!
//! # Modules
//!
//! - [`postgres`] -- connection pool and configuration
//! - [`pg_store`] -- the transactional entity store
//! - [`ddl`] -- table creation from the registry
//! - [`error`] -- shared error types

pub mod ddl;
pub mod error;
pub mod pg_store;
pub mod postgres;
mod sql;

pub use ddl::{create_table_sql, create_tables};
pub use error::DbError;
pub use pg_store::PgStore;
pub use postgres::{PostgresConfig, PostgresPool};
