//! Transactional read-through cache and dependency-ordered write buffer.
//!
//! A [`CacheStore`] sits between a batch-processing driver and a persistent
//! relational store. During one unit of work it memoizes every entity the
//! driver has seen, batches deferred lookups of the same entity type into one
//! bulk read, and buffers inserts and upserts until a flush writes them in
//! foreign-key order.
//!
//! # Architecture
//!
//! ```text
//! Driver
//!   |
//!   +-- get / find / count ----+--> flush (up to the type read)
//!   |                          +--> EntityCache hit, or EntityStore read
//!   +-- defer ----------------> DeferredRegistry (one bulk read per type)
//!   +-- insert / upsert ------> EntityCache + WriteBuffer
//!   +-- flush ----------------> SchemaGraph write order --> EntityStore
//! ```
//!
//! # Modules
//!
//! - [`graph`] -- Foreign-key graph and memoized write order ([`Catalog`])
//! - [`cache`] -- Per-type id map with explicit "absent" markers
//! - [`deferred`] -- Deferred load registry and the [`Deferred`] handle
//! - [`buffer`] -- Pending inserts and upserts
//! - [`backend`] -- The [`EntityStore`] collaborator trait
//! - [`memory`] -- In-memory [`EntityStore`] with a call journal
//! - [`store`] -- The [`CacheStore`] facade and flush coordinator
//! - [`error`] -- Error types

pub mod backend;
pub mod buffer;
pub mod cache;
pub mod deferred;
pub mod error;
pub mod graph;
pub mod memory;
pub mod store;

pub use backend::EntityStore;
pub use cache::{CacheEntry, EntityCache, Lookup};
pub use deferred::{Deferred, DeferredRegistry};
pub use error::{CacheError, ContractViolation, StoreError};
pub use graph::{Catalog, SchemaGraph};
pub use memory::{MemoryStore, StoreCall};
pub use store::CacheStore;
