//! Shared type definitions for relcache.
//!
//! This crate holds the vocabulary every other crate in the workspace speaks:
//! entity records, their identifiers, relation paths, query options, and the
//! statically declared schema that describes entity types and foreign keys.
//!
//! # Modules
//!
//! - [`ids`] -- String newtypes for entity type names and entity identifiers
//! - [`entity`] -- The generic [`Entity`] record and its field [`Value`]s
//! - [`relation`] -- [`RelationPath`], the "which relations to populate" tree
//! - [`query`] -- [`FindOptions`] and [`Filter`] for general queries
//! - [`schema`] -- [`SchemaRegistry`] and the per-type schema description

pub mod entity;
pub mod ids;
pub mod query;
pub mod relation;
pub mod schema;

pub use entity::{Entity, Value};
pub use ids::{EntityId, EntityName};
pub use query::{Filter, FindOptions, Order};
pub use relation::{RelationPath, RelationSelect};
pub use schema::{
    Cardinality, Column, ColumnKind, EntitySchema, Relation, SchemaError, SchemaRegistry,
};
