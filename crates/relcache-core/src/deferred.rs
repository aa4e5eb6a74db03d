//! Deferred loads.
//!
//! A driver often learns which entities it *might* need long before it needs
//! them (for example every account touched by a batch of transfers). Instead
//! of reading them one by one, it defers each id and later resolves the
//! handles; the first resolution for a type loads every outstanding id of
//! that type in one bulk read.

use std::collections::{BTreeMap, BTreeSet};

use relcache_types::{Entity, EntityId, EntityName, RelationPath};

use crate::backend::EntityStore;
use crate::error::CacheError;
use crate::store::CacheStore;

/// Outstanding ids of one entity type and the union of their relation paths.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeferredRequest {
    /// Ids awaiting resolution.
    pub ids: BTreeSet<EntityId>,
    /// Merged relation path required across all requests.
    pub relations: RelationPath,
}

/// Per-type registry of deferred loads.
#[derive(Debug, Clone, Default)]
pub struct DeferredRegistry {
    requests: BTreeMap<EntityName, DeferredRequest>,
}

impl DeferredRegistry {
    /// An empty registry.
    pub const fn new() -> Self {
        Self {
            requests: BTreeMap::new(),
        }
    }

    /// Merge `relations` into the type's path and, if `id` is given, add it
    /// to the type's outstanding set.
    pub fn register(&mut self, name: &EntityName, id: Option<&EntityId>, relations: &RelationPath) {
        let request = self.requests.entry(name.clone()).or_default();
        request.relations.merge(relations);
        if let Some(id) = id {
            request.ids.insert(id.clone());
        }
    }

    /// Remove and return the type's request if it has outstanding ids.
    pub fn take(&mut self, name: &EntityName) -> Option<DeferredRequest> {
        let request = self.requests.remove(name)?;
        (!request.ids.is_empty()).then_some(request)
    }

    /// Number of outstanding ids for `name`.
    pub fn pending(&self, name: &EntityName) -> usize {
        self.requests.get(name).map_or(0, |request| request.ids.len())
    }

    /// Whether nothing is outstanding.
    pub fn is_empty(&self) -> bool {
        self.requests.values().all(|request| request.ids.is_empty())
    }

    /// Drop every outstanding request.
    pub fn clear(&mut self) {
        self.requests.clear();
    }
}

/// Lazy handle returned by [`CacheStore::defer`].
///
/// Holds no reference to the cache; it is resolved against the session that
/// issued it with [`Deferred::get`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use = "a deferred load does nothing until it is resolved"]
pub struct Deferred {
    entity: EntityName,
    id: EntityId,
    relations: RelationPath,
}

impl Deferred {
    pub(crate) const fn new(entity: EntityName, id: EntityId, relations: RelationPath) -> Self {
        Self {
            entity,
            id,
            relations,
        }
    }

    /// Entity type of the deferred load.
    pub const fn entity(&self) -> &EntityName {
        &self.entity
    }

    /// Id of the deferred load.
    pub const fn id(&self) -> &EntityId {
        &self.id
    }

    /// Relations requested with this load.
    pub const fn relations(&self) -> &RelationPath {
        &self.relations
    }

    /// Resolve the handle. `None` means the entity does not exist.
    pub async fn get<S: EntityStore>(
        &self,
        store: &mut CacheStore<S>,
    ) -> Result<Option<Entity>, CacheError> {
        store.resolve(self).await
    }

    /// Resolve the handle, failing with [`CacheError::NotFound`] if the
    /// entity does not exist.
    pub async fn get_or_fail<S: EntityStore>(
        &self,
        store: &mut CacheStore<S>,
    ) -> Result<Entity, CacheError> {
        self.get(store).await?.ok_or_else(|| CacheError::NotFound {
            entity: self.entity.clone(),
            query: format!("id = {}", self.id),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_accumulates_ids_and_paths() {
        let mut registry = DeferredRegistry::new();
        let account = EntityName::from("Account");

        registry.register(&account, Some(&EntityId::from("0x1")), &RelationPath::new().include("parent"));
        registry.register(&account, Some(&EntityId::from("0x2")), &RelationPath::new());
        registry.register(&account, Some(&EntityId::from("0x1")), &RelationPath::new());

        assert_eq!(registry.pending(&account), 2);
        let request = registry.take(&account);
        assert_eq!(
            request,
            Some(DeferredRequest {
                ids: [EntityId::from("0x1"), EntityId::from("0x2")].into(),
                relations: RelationPath::new().include("parent"),
            })
        );
        assert_eq!(registry.pending(&account), 0);
        assert!(registry.is_empty());
    }

    #[test]
    fn take_without_ids_is_none() {
        let mut registry = DeferredRegistry::new();
        let account = EntityName::from("Account");
        registry.register(&account, None, &RelationPath::new().include("parent"));

        assert!(registry.is_empty());
        assert_eq!(registry.take(&account), None);
        assert_eq!(registry.take(&EntityName::from("Transfer")), None);
    }
}
