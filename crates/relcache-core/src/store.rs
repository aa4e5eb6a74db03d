//! The cache facade and flush coordinator.
//!
//! [`CacheStore`] owns every piece of per-session state (the entity cache, the
//! deferred load registry, and the write buffer) together with the
//! [`EntityStore`] it reads from and flushes to. Exclusive access is enforced
//! by `&mut self` on every operation; drivers that share a session across
//! tasks wrap it in a `tokio::sync::Mutex`.
//!
//! # Read path
//!
//! Every read flushes pending writes up to and including its entity type in
//! write order, so it observes everything buffered before it. It is then
//! served from the cache when possible and from the store otherwise, with
//! store results merged back into the cache.
//!
//! # Write path
//!
//! `insert` and `upsert` only touch the cache and the write buffer. Nothing
//! reaches the store until the next flush, explicit or implied by a read.

use std::sync::Arc;

use relcache_types::{Entity, EntityId, EntityName, Filter, FindOptions, RelationPath, Value};
use tracing::{debug, trace, warn};

use crate::backend::EntityStore;
use crate::buffer::WriteBuffer;
use crate::cache::{CacheEntry, EntityCache, Lookup};
use crate::deferred::{Deferred, DeferredRegistry};
use crate::error::{CacheError, ContractViolation};
use crate::graph::Catalog;

/// Read-through cache and write buffer over an [`EntityStore`].
#[derive(Debug)]
pub struct CacheStore<S> {
    store: S,
    catalog: Arc<Catalog>,
    cache: EntityCache,
    deferred: DeferredRegistry,
    buffer: WriteBuffer,
}

impl<S: EntityStore> CacheStore<S> {
    /// Start a session over `store`.
    pub const fn new(store: S, catalog: Arc<Catalog>) -> Self {
        Self {
            store,
            catalog,
            cache: EntityCache::new(),
            deferred: DeferredRegistry::new(),
            buffer: WriteBuffer::new(),
        }
    }

    /// The underlying store.
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// The shared schema catalog.
    pub const fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    /// Read-only view of the session cache.
    pub const fn cache(&self) -> &EntityCache {
        &self.cache
    }

    /// Pending writes not yet flushed.
    pub fn pending_writes(&self) -> usize {
        self.buffer.len()
    }

    /// End the session and return the store. Pending writes are discarded;
    /// call [`CacheStore::flush`] first.
    pub fn into_inner(self) -> S {
        if !self.buffer.is_empty() {
            warn!(pending = self.buffer.len(), "session closed with unflushed writes");
        }
        self.store
    }

    /// Reset the cache, the deferred registry and the write buffer.
    pub fn clear(&mut self) {
        if !self.buffer.is_empty() {
            warn!(pending = self.buffer.len(), "clearing session with unflushed writes");
        }
        self.cache.clear();
        self.deferred.clear();
        self.buffer.clear();
    }

    // =====================================================================
    // Writes
    // =====================================================================

    /// Buffer new entities for insertion.
    ///
    /// Inserting an id that is already cached as present, or already pending
    /// insert or upsert, is a [`ContractViolation::DuplicateInsert`].
    pub fn insert(
        &mut self,
        entity: &EntityName,
        rows: impl IntoIterator<Item = Entity>,
    ) -> Result<(), CacheError> {
        for row in rows {
            let cached = matches!(self.cache.entry(entity, &row.id), CacheEntry::Present(_));
            if cached || self.buffer.is_pending(entity, &row.id) {
                return Err(ContractViolation::DuplicateInsert {
                    entity: entity.clone(),
                    id: row.id,
                }
                .into());
            }
            let canonical = self.cache.put(self.catalog.registry(), entity, &row)?;
            self.buffer.insert(entity, canonical)?;
        }
        Ok(())
    }

    /// Buffer a single new entity for insertion.
    pub fn insert_one(&mut self, entity: &EntityName, row: Entity) -> Result<(), CacheError> {
        self.insert(entity, [row])
    }

    /// Buffer entities for insert-or-replace.
    ///
    /// Repeated upserts of an id coalesce to the latest value. Upserting an id
    /// pending insert updates the pending insert instead.
    pub fn upsert(
        &mut self,
        entity: &EntityName,
        rows: impl IntoIterator<Item = Entity>,
    ) -> Result<(), CacheError> {
        for row in rows {
            let canonical = self.cache.put(self.catalog.registry(), entity, &row)?;
            self.buffer.upsert(entity, canonical);
        }
        Ok(())
    }

    /// Buffer a single entity for insert-or-replace.
    pub fn upsert_one(&mut self, entity: &EntityName, row: Entity) -> Result<(), CacheError> {
        self.upsert(entity, [row])
    }

    /// Alias of [`CacheStore::upsert`].
    pub fn save(
        &mut self,
        entity: &EntityName,
        rows: impl IntoIterator<Item = Entity>,
    ) -> Result<(), CacheError> {
        self.upsert(entity, rows)
    }

    /// Deleting entities is not supported; always fails.
    #[allow(clippy::unused_self)]
    pub fn remove(&mut self, entity: &EntityName, _id: &EntityId) -> Result<(), CacheError> {
        Err(ContractViolation::RemoveUnsupported(entity.clone()).into())
    }

    // =====================================================================
    // Flush
    // =====================================================================

    /// Write buffered entities to the store in dependency order.
    ///
    /// With `stop_at`, iteration stops right after that type has been
    /// written; every type it may reference comes earlier in the order and is
    /// therefore flushed too.
    pub async fn flush(&mut self, stop_at: Option<&EntityName>) -> Result<(), CacheError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let catalog = Arc::clone(&self.catalog);
        for entity in catalog.write_order()? {
            // Rows go back into the buffer when the store rejects them, so a
            // retried flush writes them again or fails again.
            let inserts = self.buffer.take_inserts(entity);
            if !inserts.is_empty() {
                if let Err(e) = self.store.insert_many(entity, &inserts).await {
                    warn!(entity = %entity, count = inserts.len(), "bulk insert failed");
                    self.buffer.restore_inserts(entity, inserts);
                    return Err(e.into());
                }
                debug!(entity = %entity, count = inserts.len(), "flushed inserts");
            }
            let upserts = self.buffer.take_upserts(entity);
            if !upserts.is_empty() {
                if let Err(e) = self.store.upsert_many(entity, &upserts).await {
                    warn!(entity = %entity, count = upserts.len(), "bulk upsert failed");
                    self.buffer.restore_upserts(entity, upserts);
                    return Err(e.into());
                }
                debug!(entity = %entity, count = upserts.len(), "flushed upserts");
            }
            if stop_at == Some(entity) {
                break;
            }
        }
        Ok(())
    }

    // =====================================================================
    // Deferred loads
    // =====================================================================

    /// Register interest in `(entity, id)` without loading it yet.
    ///
    /// Ids already known to the cache are not queued. The returned handle
    /// loads every outstanding id of the type in one bulk read the first time
    /// any handle of that type is resolved.
    pub fn defer(
        &mut self,
        entity: &EntityName,
        id: impl Into<EntityId>,
        relations: Option<&RelationPath>,
    ) -> Result<Deferred, CacheError> {
        let id = id.into();
        let relations = relations.cloned().unwrap_or_default();
        self.check_relations(entity, &relations)?;
        let queued = (!self.cache.is_known(entity, &id)).then_some(&id);
        self.deferred.register(entity, queued, &relations);
        Ok(Deferred::new(entity.clone(), id, relations))
    }

    /// Resolve a handle returned by [`CacheStore::defer`].
    pub async fn resolve(&mut self, deferred: &Deferred) -> Result<Option<Entity>, CacheError> {
        self.flush(Some(deferred.entity())).await?;
        self.load_deferred(deferred.entity()).await?;
        self.read(deferred.entity(), deferred.id(), deferred.relations()).await
    }

    async fn load_deferred(&mut self, entity: &EntityName) -> Result<(), CacheError> {
        let Some(request) = self.deferred.take(entity) else {
            return Ok(());
        };
        let ids: Vec<EntityId> = request
            .ids
            .into_iter()
            .filter(|id| !self.cache.is_known(entity, id))
            .collect();
        if ids.is_empty() {
            return Ok(());
        }

        // Placeholders: anything the bulk read does not return stays absent.
        for id in &ids {
            self.cache.mark_absent(entity, id);
        }
        let rows = match self.store.find_by_ids(entity, &ids, &request.relations).await {
            Ok(rows) => rows,
            Err(e) => {
                // Requeue the whole batch so the next resolution retries it
                // in one read.
                for id in &ids {
                    self.cache.forget(entity, id);
                    self.deferred.register(entity, Some(id), &request.relations);
                }
                return Err(e.into());
            }
        };
        for row in &rows {
            self.cache.put(self.catalog.registry(), entity, row)?;
        }
        debug!(
            entity = %entity,
            requested = ids.len(),
            found = rows.len(),
            "resolved deferred loads"
        );
        Ok(())
    }

    // =====================================================================
    // Reads
    // =====================================================================

    /// Load one entity by id. `None` means it does not exist.
    pub async fn get(
        &mut self,
        entity: &EntityName,
        id: &EntityId,
        relations: Option<&RelationPath>,
    ) -> Result<Option<Entity>, CacheError> {
        let empty = RelationPath::new();
        let relations = relations.unwrap_or(&empty);
        self.check_relations(entity, relations)?;
        self.flush(Some(entity)).await?;
        self.read(entity, id, relations).await
    }

    /// Like [`CacheStore::get`], failing with [`CacheError::NotFound`] if the
    /// entity does not exist.
    pub async fn get_or_fail(
        &mut self,
        entity: &EntityName,
        id: &EntityId,
        relations: Option<&RelationPath>,
    ) -> Result<Entity, CacheError> {
        self.get(entity, id, relations)
            .await?
            .ok_or_else(|| CacheError::NotFound {
                entity: entity.clone(),
                query: format!("id = {id}"),
            })
    }

    /// Serve `(entity, id)` from the cache, falling back to the store.
    /// Assumes the caller has already flushed.
    async fn read(
        &mut self,
        entity: &EntityName,
        id: &EntityId,
        relations: &RelationPath,
    ) -> Result<Option<Entity>, CacheError> {
        match self.cache.materialize(self.catalog.registry(), entity, id, relations)? {
            Lookup::Found(found) => return Ok(Some(found)),
            Lookup::Absent => return Ok(None),
            Lookup::Miss => {}
        }

        trace!(entity = %entity, id = %id, "cache miss");
        let rows = self
            .store
            .find_by_ids(entity, std::slice::from_ref(id), relations)
            .await?;
        let Some(row) = rows.into_iter().find(|row| &row.id == id) else {
            self.cache.mark_absent(entity, id);
            return Ok(None);
        };
        self.cache.put(self.catalog.registry(), entity, &row)?;
        self.mark_dangling(entity, &row, relations)?;
        match self.cache.materialize(self.catalog.registry(), entity, id, relations)? {
            Lookup::Found(found) => Ok(Some(found)),
            Lookup::Absent | Lookup::Miss => Ok(Some(row)),
        }
    }

    /// Cache as absent every requested to-one target the store left as a
    /// bare reference: it was asked to populate it and found nothing.
    fn mark_dangling(
        &mut self,
        entity: &EntityName,
        row: &Entity,
        relations: &RelationPath,
    ) -> Result<(), ContractViolation> {
        let catalog = Arc::clone(&self.catalog);
        let schema = catalog.registry().get(entity)?;
        let empty = RelationPath::new();
        for (field, nested) in relations.included() {
            let Some(relation) = schema.find_relation(field) else {
                continue;
            };
            match row.get(field) {
                Some(Value::Ref(target)) if !self.cache.is_known(&relation.target, target) => {
                    self.cache.mark_absent(&relation.target, target);
                }
                Some(Value::Entity(target)) => {
                    self.mark_dangling(&relation.target, target, nested.unwrap_or(&empty))?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Run a general query against the store and merge the results into the
    /// cache.
    pub async fn find(
        &mut self,
        entity: &EntityName,
        options: &FindOptions,
    ) -> Result<Vec<Entity>, CacheError> {
        self.check_relations(entity, &options.relations)?;
        self.flush(Some(entity)).await?;
        let rows = self.store.find(entity, options).await?;
        for row in &rows {
            self.cache.put(self.catalog.registry(), entity, row)?;
        }
        Ok(rows)
    }

    /// [`CacheStore::find`] with only an equality filter.
    pub async fn find_by(
        &mut self,
        entity: &EntityName,
        filter: Filter,
    ) -> Result<Vec<Entity>, CacheError> {
        self.find(entity, &FindOptions::from(filter)).await
    }

    /// First result of a query, if any.
    pub async fn find_one(
        &mut self,
        entity: &EntityName,
        options: &FindOptions,
    ) -> Result<Option<Entity>, CacheError> {
        let options = options.clone().take(1);
        Ok(self.find(entity, &options).await?.into_iter().next())
    }

    /// First entity matching `filter`, if any.
    pub async fn find_one_by(
        &mut self,
        entity: &EntityName,
        filter: Filter,
    ) -> Result<Option<Entity>, CacheError> {
        self.find_one(entity, &FindOptions::from(filter)).await
    }

    /// Like [`CacheStore::find_one`], failing with [`CacheError::NotFound`].
    pub async fn find_one_or_fail(
        &mut self,
        entity: &EntityName,
        options: &FindOptions,
    ) -> Result<Entity, CacheError> {
        self.find_one(entity, options)
            .await?
            .ok_or_else(|| not_found(entity, &options.filter))
    }

    /// Like [`CacheStore::find_one_by`], failing with [`CacheError::NotFound`].
    pub async fn find_one_by_or_fail(
        &mut self,
        entity: &EntityName,
        filter: Filter,
    ) -> Result<Entity, CacheError> {
        self.find_one_or_fail(entity, &FindOptions::from(filter)).await
    }

    /// Number of stored entities matching `options.filter`.
    pub async fn count(
        &mut self,
        entity: &EntityName,
        options: &FindOptions,
    ) -> Result<u64, CacheError> {
        self.count_by(entity, &options.filter).await
    }

    /// Number of stored entities matching `filter`.
    pub async fn count_by(&mut self, entity: &EntityName, filter: &Filter) -> Result<u64, CacheError> {
        self.catalog.registry().get(entity)?;
        self.flush(Some(entity)).await?;
        Ok(self.store.count(entity, filter).await?)
    }

    /// Reject paths whose results could not be cached.
    fn check_relations(
        &self,
        entity: &EntityName,
        relations: &RelationPath,
    ) -> Result<(), ContractViolation> {
        let registry = self.catalog.registry();
        let schema = registry.get(entity)?;
        for (field, nested) in relations.included() {
            let relation =
                schema
                    .find_relation(field)
                    .ok_or_else(|| ContractViolation::UnknownField {
                        entity: entity.clone(),
                        field: field.to_owned(),
                    })?;
            if !relation.is_to_one() {
                return Err(ContractViolation::ToManyRelation {
                    entity: entity.clone(),
                    field: field.to_owned(),
                });
            }
            if let Some(nested) = nested {
                self.check_relations(&relation.target, nested)?;
            }
        }
        Ok(())
    }
}

fn not_found(entity: &EntityName, filter: &Filter) -> CacheError {
    let query = filter
        .iter()
        .map(|(field, value)| format!("{field} = {value:?}"))
        .collect::<Vec<_>>()
        .join(" and ");
    CacheError::NotFound {
        entity: entity.clone(),
        query,
    }
}
