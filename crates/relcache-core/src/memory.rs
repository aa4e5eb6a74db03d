//! In-memory [`EntityStore`].
//!
//! Tables are `type -> id -> row` maps holding foreign keys as
//! [`Value::Ref`]. Every call through the trait is appended to a journal so
//! tests can assert how many bulk operations the cache issued and in which
//! order. The helpers [`MemoryStore::seed`] and [`MemoryStore::row`] bypass
//! the journal.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use relcache_types::{
    Cardinality, Entity, EntityId, EntityName, Filter, FindOptions, Order, RelationPath, Value,
};
use tokio::sync::Mutex;

use crate::backend::EntityStore;
use crate::error::StoreError;
use crate::graph::Catalog;

/// One journaled store call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCall {
    /// [`EntityStore::insert_many`].
    Insert {
        /// Entity type.
        entity: EntityName,
        /// Ids written, in call order.
        ids: Vec<EntityId>,
    },
    /// [`EntityStore::upsert_many`].
    Upsert {
        /// Entity type.
        entity: EntityName,
        /// Ids written, in call order.
        ids: Vec<EntityId>,
    },
    /// [`EntityStore::find_by_ids`].
    FindByIds {
        /// Entity type.
        entity: EntityName,
        /// Ids requested, in call order.
        ids: Vec<EntityId>,
    },
    /// [`EntityStore::find`].
    Find {
        /// Entity type.
        entity: EntityName,
    },
    /// [`EntityStore::count`].
    Count {
        /// Entity type.
        entity: EntityName,
    },
}

impl StoreCall {
    /// Entity type the call touched.
    pub const fn entity(&self) -> &EntityName {
        match self {
            Self::Insert { entity, .. }
            | Self::Upsert { entity, .. }
            | Self::FindByIds { entity, .. }
            | Self::Find { entity }
            | Self::Count { entity } => entity,
        }
    }

    /// Whether the call is a read.
    pub const fn is_read(&self) -> bool {
        matches!(self, Self::FindByIds { .. } | Self::Find { .. } | Self::Count { .. })
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    tables: BTreeMap<EntityName, BTreeMap<EntityId, Entity>>,
    journal: Vec<StoreCall>,
}

/// In-memory store keyed by entity type and id.
#[derive(Debug)]
pub struct MemoryStore {
    catalog: Arc<Catalog>,
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    /// An empty store for the types in `catalog`.
    pub fn new(catalog: Arc<Catalog>) -> Self {
        Self {
            catalog,
            state: Mutex::new(MemoryState::default()),
        }
    }

    /// Write rows directly, without journaling or duplicate checks.
    pub async fn seed(&self, entity: &EntityName, rows: impl IntoIterator<Item = Entity>) {
        let mut state = self.state.lock().await;
        let table = state.tables.entry(entity.clone()).or_default();
        for row in rows {
            table.insert(row.id.clone(), self.strip(entity, row));
        }
    }

    /// Read a stored row directly, without journaling.
    pub async fn row(&self, entity: &EntityName, id: &EntityId) -> Option<Entity> {
        let state = self.state.lock().await;
        state.tables.get(entity).and_then(|t| t.get(id)).cloned()
    }

    /// Number of stored rows of `entity`.
    pub async fn row_count(&self, entity: &EntityName) -> usize {
        let state = self.state.lock().await;
        state.tables.get(entity).map_or(0, BTreeMap::len)
    }

    /// Journal of every trait call so far.
    pub async fn calls(&self) -> Vec<StoreCall> {
        self.state.lock().await.journal.clone()
    }

    /// Clear the journal.
    pub async fn clear_calls(&self) {
        self.state.lock().await.journal.clear();
    }

    /// Keep foreign keys only: populated to-one relations become refs and
    /// to-many values are dropped.
    fn strip(&self, entity: &EntityName, mut row: Entity) -> Entity {
        let Ok(schema) = self.catalog.registry().get(entity) else {
            return row;
        };
        for relation in &schema.relations {
            let Some(value) = row.fields.get_mut(&relation.field) else {
                continue;
            };
            match relation.cardinality {
                Cardinality::ToOne => {
                    if let Some(id) = value.ref_id().cloned() {
                        *value = Value::Ref(id);
                    }
                }
                Cardinality::ToMany => {
                    row.fields.remove(&relation.field);
                }
            }
        }
        row
    }

    fn populate(
        &self,
        state: &MemoryState,
        entity: &EntityName,
        mut row: Entity,
        relations: &RelationPath,
    ) -> Result<Entity, StoreError> {
        let schema = self
            .catalog
            .registry()
            .get(entity)
            .map_err(|e| StoreError::new("populate relations", e))?;
        let empty = RelationPath::new();
        for (field, nested) in relations.included() {
            let relation = schema.find_relation(field).ok_or_else(|| {
                StoreError::new("populate relations", format!("{entity} has no relation {field}"))
            })?;
            let nested = nested.unwrap_or(&empty);
            let table = state.tables.get(&relation.target);
            match relation.cardinality {
                Cardinality::ToOne => {
                    let target = row
                        .relation_id(field)
                        .and_then(|id| table.and_then(|t| t.get(id)))
                        .cloned();
                    if let Some(target) = target {
                        let target = self.populate(state, &relation.target, target, nested)?;
                        row.set(field, target);
                    }
                }
                Cardinality::ToMany => {
                    let inverse = relation.inverse.as_deref().unwrap_or_default();
                    let mut related = Vec::new();
                    for candidate in table.into_iter().flat_map(BTreeMap::values) {
                        if candidate.relation_id(inverse) == Some(&row.id) {
                            related.push(self.populate(
                                state,
                                &relation.target,
                                candidate.clone(),
                                nested,
                            )?);
                        }
                    }
                    row.set(field, Value::Entities(related));
                }
            }
        }
        Ok(row)
    }
}

impl EntityStore for MemoryStore {
    async fn insert_many(&self, entity: &EntityName, rows: &[Entity]) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.journal.push(StoreCall::Insert {
            entity: entity.clone(),
            ids: rows.iter().map(|r| r.id.clone()).collect(),
        });
        let table = state.tables.entry(entity.clone()).or_default();
        if let Some(existing) = rows.iter().find(|r| table.contains_key(&r.id)) {
            return Err(StoreError::new(
                format!("bulk insert into {entity}"),
                format!("duplicate key {}", existing.id),
            ));
        }
        for row in rows {
            table.insert(row.id.clone(), self.strip(entity, row.clone()));
        }
        Ok(())
    }

    async fn upsert_many(&self, entity: &EntityName, rows: &[Entity]) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.journal.push(StoreCall::Upsert {
            entity: entity.clone(),
            ids: rows.iter().map(|r| r.id.clone()).collect(),
        });
        let table = state.tables.entry(entity.clone()).or_default();
        for row in rows {
            table.insert(row.id.clone(), self.strip(entity, row.clone()));
        }
        Ok(())
    }

    async fn find_by_ids(
        &self,
        entity: &EntityName,
        ids: &[EntityId],
        relations: &RelationPath,
    ) -> Result<Vec<Entity>, StoreError> {
        let mut state = self.state.lock().await;
        state.journal.push(StoreCall::FindByIds {
            entity: entity.clone(),
            ids: ids.to_vec(),
        });
        let rows: Vec<Entity> = state
            .tables
            .get(entity)
            .map(|table| ids.iter().filter_map(|id| table.get(id)).cloned().collect())
            .unwrap_or_default();
        rows.into_iter()
            .map(|row| self.populate(&state, entity, row, relations))
            .collect()
    }

    async fn find(
        &self,
        entity: &EntityName,
        options: &FindOptions,
    ) -> Result<Vec<Entity>, StoreError> {
        let mut state = self.state.lock().await;
        state.journal.push(StoreCall::Find {
            entity: entity.clone(),
        });
        let mut rows: Vec<Entity> = state
            .tables
            .get(entity)
            .map(|table| {
                table
                    .values()
                    .filter(|row| options.filter.matches(row))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        rows.sort_by(|a, b| compare_rows(a, b, &options.order));
        let skip = options.skip.map_or(0, |n| usize::try_from(n).unwrap_or(usize::MAX));
        let take = options.take.map_or(usize::MAX, |n| usize::try_from(n).unwrap_or(usize::MAX));

        rows.into_iter()
            .skip(skip)
            .take(take)
            .map(|row| self.populate(&state, entity, row, &options.relations))
            .collect()
    }

    async fn count(&self, entity: &EntityName, filter: &Filter) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        state.journal.push(StoreCall::Count {
            entity: entity.clone(),
        });
        let count = state
            .tables
            .get(entity)
            .map_or(0, |table| table.values().filter(|row| filter.matches(row)).count());
        Ok(u64::try_from(count).unwrap_or(u64::MAX))
    }
}

fn compare_rows(a: &Entity, b: &Entity, order: &[(String, Order)]) -> Ordering {
    for (field, direction) in order {
        let ordering = if field == "id" {
            a.id.cmp(&b.id)
        } else {
            compare_values(
                a.get(field).unwrap_or(&Value::Null),
                b.get(field).unwrap_or(&Value::Null),
            )
        };
        let ordering = match direction {
            Order::Asc => ordering,
            Order::Desc => ordering.reverse(),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    a.id.cmp(&b.id)
}

/// Nulls sort first; values of different kinds compare equal.
fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
        (Value::Int(a), Value::Int(b)) => a.cmp(b),
        (Value::Numeric(a), Value::Numeric(b)) => a.cmp(b),
        (Value::Text(a), Value::Text(b)) => a.cmp(b),
        (Value::Timestamp(a), Value::Timestamp(b)) => a.cmp(b),
        _ => match (a.ref_id(), b.ref_id()) {
            (Some(a), Some(b)) => a.cmp(b),
            _ => Ordering::Equal,
        },
    }
}
