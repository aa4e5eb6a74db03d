//! The persistent store collaborator.
//!
//! [`EntityStore`] is everything the cache needs from the underlying
//! relational store. Implementations own their own transaction handling; the
//! cache performs no retries and treats every failure as fatal for the
//! current flush or read.
//!
//! Every method returns an `impl Future + Send`; implementations are free to
//! write them as `async fn`.

use std::future::Future;

use relcache_types::{Entity, EntityId, EntityName, Filter, FindOptions, RelationPath};

use crate::error::StoreError;

/// Bulk read/write capability of a persistent store.
pub trait EntityStore {
    /// Insert every row of `entity`. Fails if any id already exists.
    fn insert_many(
        &self,
        entity: &EntityName,
        rows: &[Entity],
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Insert-or-replace every row of `entity` by id.
    fn upsert_many(
        &self,
        entity: &EntityName,
        rows: &[Entity],
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Load the existing rows among `ids`, with `relations` populated.
    ///
    /// Missing ids are simply not returned; order is unspecified.
    fn find_by_ids(
        &self,
        entity: &EntityName,
        ids: &[EntityId],
        relations: &RelationPath,
    ) -> impl Future<Output = Result<Vec<Entity>, StoreError>> + Send;

    /// General query passthrough.
    fn find(
        &self,
        entity: &EntityName,
        options: &FindOptions,
    ) -> impl Future<Output = Result<Vec<Entity>, StoreError>> + Send;

    /// Number of rows of `entity` matching `filter`.
    fn count(
        &self,
        entity: &EntityName,
        filter: &Filter,
    ) -> impl Future<Output = Result<u64, StoreError>> + Send;
}
