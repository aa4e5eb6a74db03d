//! Per-type entity cache.
//!
//! Each `(type, id)` key is in one of three states:
//!
//! | State | Meaning |
//! |-------|---------|
//! | missing | never looked at |
//! | [`Slot::Absent`] | confirmed not to exist in storage |
//! | [`Slot::Present`] | canonical copy of the entity |
//!
//! Canonical copies hold to-one relations as [`Value::Ref`]; populated
//! relation targets are cached under their own type and re-attached on read
//! by [`EntityCache::materialize`]. Values handed out are always owned clones,
//! so callers cannot mutate cache state through them.

use std::collections::BTreeMap;

use relcache_types::{
    Cardinality, ColumnKind, Entity, EntityId, EntityName, EntitySchema, RelationPath,
    SchemaRegistry, Value,
};

use crate::error::ContractViolation;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Slot {
    Absent,
    Present(Entity),
}

/// Borrowed view of a cache slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheEntry<'a> {
    /// Never looked at.
    Unknown,
    /// Confirmed not to exist.
    Absent,
    /// Cached canonical copy.
    Present(&'a Entity),
}

/// Result of [`EntityCache::materialize`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    /// The entity with the requested relations attached.
    Found(Entity),
    /// Confirmed not to exist.
    Absent,
    /// The cache cannot answer: the entity or a requested relation target
    /// has never been looked at.
    Miss,
}

/// Memo of every entity seen during a session.
#[derive(Debug, Clone, Default)]
pub struct EntityCache {
    slots: BTreeMap<EntityName, BTreeMap<EntityId, Slot>>,
}

impl EntityCache {
    /// An empty cache.
    pub const fn new() -> Self {
        Self {
            slots: BTreeMap::new(),
        }
    }

    /// State of `(name, id)`.
    pub fn entry(&self, name: &EntityName, id: &EntityId) -> CacheEntry<'_> {
        match self.slots.get(name).and_then(|slots| slots.get(id)) {
            None => CacheEntry::Unknown,
            Some(Slot::Absent) => CacheEntry::Absent,
            Some(Slot::Present(entity)) => CacheEntry::Present(entity),
        }
    }

    /// Whether `(name, id)` has been looked at (present or absent).
    pub fn is_known(&self, name: &EntityName, id: &EntityId) -> bool {
        !matches!(self.entry(name, id), CacheEntry::Unknown)
    }

    /// Record that `(name, id)` does not exist in storage.
    pub fn mark_absent(&mut self, name: &EntityName, id: &EntityId) {
        self.slots
            .entry(name.clone())
            .or_default()
            .insert(id.clone(), Slot::Absent);
    }

    /// Forget `(name, id)` entirely, returning it to the unknown state.
    pub fn forget(&mut self, name: &EntityName, id: &EntityId) {
        if let Some(slots) = self.slots.get_mut(name) {
            slots.remove(id);
        }
    }

    /// Store a deep copy of `entity` and return the canonical cached copy.
    ///
    /// Populated to-one relations are cached recursively under their own
    /// type and replaced by [`Value::Ref`]. A set to-many relation, a field
    /// the schema does not declare, or a value of the wrong shape is a
    /// contract violation.
    pub fn put(
        &mut self,
        registry: &SchemaRegistry,
        name: &EntityName,
        entity: &Entity,
    ) -> Result<Entity, ContractViolation> {
        let schema = registry.get(name)?;
        let canonical = self.canonicalize(registry, schema, entity)?;
        self.slots
            .entry(name.clone())
            .or_default()
            .insert(entity.id.clone(), Slot::Present(canonical.clone()));
        Ok(canonical)
    }

    fn canonicalize(
        &mut self,
        registry: &SchemaRegistry,
        schema: &EntitySchema,
        entity: &Entity,
    ) -> Result<Entity, ContractViolation> {
        let mut canonical = Entity::new(entity.id.clone());
        for (field, value) in &entity.fields {
            if let Some(relation) = schema.find_relation(field) {
                let stored = match (relation.cardinality, value) {
                    (Cardinality::ToMany, Value::Null) => continue,
                    (Cardinality::ToMany, _) => {
                        return Err(ContractViolation::ToManyRelation {
                            entity: schema.name.clone(),
                            field: field.clone(),
                        });
                    }
                    (Cardinality::ToOne, Value::Null) => Value::Null,
                    (Cardinality::ToOne, Value::Ref(id)) => Value::Ref(id.clone()),
                    (Cardinality::ToOne, Value::Entity(target)) => {
                        self.put(registry, &relation.target, target)?;
                        Value::Ref(target.id.clone())
                    }
                    (Cardinality::ToOne, other) => {
                        return Err(field_type(schema, field, "ref", other));
                    }
                };
                canonical.fields.insert(field.clone(), stored);
            } else if let Some(column) = schema.find_column(field) {
                if !fits(column.kind, value) {
                    return Err(field_type(schema, field, kind_name(column.kind), value));
                }
                canonical.fields.insert(field.clone(), value.clone());
            } else {
                return Err(ContractViolation::UnknownField {
                    entity: schema.name.clone(),
                    field: field.clone(),
                });
            }
        }
        Ok(canonical)
    }

    /// Owned copy of `(name, id)` with `relations` re-attached from the
    /// cache.
    pub fn materialize(
        &self,
        registry: &SchemaRegistry,
        name: &EntityName,
        id: &EntityId,
        relations: &RelationPath,
    ) -> Result<Lookup, ContractViolation> {
        match self.entry(name, id) {
            CacheEntry::Unknown => Ok(Lookup::Miss),
            CacheEntry::Absent => Ok(Lookup::Absent),
            CacheEntry::Present(entity) => Ok(self
                .hydrate(registry, name, entity.clone(), relations)?
                .map_or(Lookup::Miss, Lookup::Found)),
        }
    }

    fn hydrate(
        &self,
        registry: &SchemaRegistry,
        name: &EntityName,
        mut entity: Entity,
        relations: &RelationPath,
    ) -> Result<Option<Entity>, ContractViolation> {
        let schema = registry.get(name)?;
        let empty = RelationPath::new();
        for (field, nested) in relations.included() {
            let relation = schema.find_relation(field).ok_or_else(|| {
                ContractViolation::UnknownField {
                    entity: name.clone(),
                    field: field.to_owned(),
                }
            })?;
            if !relation.is_to_one() {
                return Err(ContractViolation::ToManyRelation {
                    entity: name.clone(),
                    field: field.to_owned(),
                });
            }
            let Some(target_id) = entity.relation_id(field).cloned() else {
                continue;
            };
            match self.entry(&relation.target, &target_id) {
                CacheEntry::Unknown => return Ok(None),
                // Dangling reference: keep the bare id.
                CacheEntry::Absent => {}
                CacheEntry::Present(target) => {
                    let nested = nested.unwrap_or(&empty);
                    let Some(target) =
                        self.hydrate(registry, &relation.target, target.clone(), nested)?
                    else {
                        return Ok(None);
                    };
                    entity.set(field, target);
                }
            }
        }
        Ok(Some(entity))
    }

    /// Number of known keys (present or absent) across all types.
    pub fn len(&self) -> usize {
        self.slots.values().map(BTreeMap::len).sum()
    }

    /// Whether nothing has been looked at.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.slots.clear();
    }
}

const fn fits(kind: ColumnKind, value: &Value) -> bool {
    matches!(
        (kind, value),
        (_, Value::Null)
            | (ColumnKind::Bool, Value::Bool(_))
            | (ColumnKind::Int, Value::Int(_))
            | (ColumnKind::Numeric, Value::Numeric(_))
            | (ColumnKind::Text, Value::Text(_))
            | (ColumnKind::Timestamp, Value::Timestamp(_))
            | (ColumnKind::Json, Value::Json(_))
    )
}

const fn kind_name(kind: ColumnKind) -> &'static str {
    match kind {
        ColumnKind::Bool => "bool",
        ColumnKind::Int => "int",
        ColumnKind::Numeric => "numeric",
        ColumnKind::Text => "text",
        ColumnKind::Timestamp => "timestamp",
        ColumnKind::Json => "json",
    }
}

fn field_type(
    schema: &EntitySchema,
    field: &str,
    expected: &'static str,
    found: &Value,
) -> ContractViolation {
    ContractViolation::FieldType {
        entity: schema.name.clone(),
        field: field.to_owned(),
        expected,
        found: found.kind(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;

    fn registry() -> SchemaRegistry {
        SchemaRegistry::from_entities([
            EntitySchema::new("Account")
                .column("balance", ColumnKind::Numeric)
                .to_one("parent", "Account")
                .to_many("outgoing", "Transfer", "from"),
            EntitySchema::new("Transfer")
                .column("amount", ColumnKind::Numeric)
                .to_one("from", "Account")
                .to_one("to", "Account"),
        ])
        .unwrap()
    }

    fn account() -> EntityName {
        EntityName::from("Account")
    }

    fn transfer() -> EntityName {
        EntityName::from("Transfer")
    }

    #[test]
    fn unknown_absent_present() {
        let registry = registry();
        let mut cache = EntityCache::new();
        let id = EntityId::from("0xabc");

        assert_eq!(cache.entry(&account(), &id), CacheEntry::Unknown);
        cache.mark_absent(&account(), &id);
        assert_eq!(cache.entry(&account(), &id), CacheEntry::Absent);

        let entity = Entity::new("0xabc").with("balance", dec!(1));
        cache.put(&registry, &account(), &entity).unwrap();
        assert_eq!(cache.entry(&account(), &id), CacheEntry::Present(&entity));

        cache.forget(&account(), &id);
        assert!(!cache.is_known(&account(), &id));
    }

    #[test]
    fn populated_relations_are_cached_separately() {
        let registry = registry();
        let mut cache = EntityCache::new();
        let from = Entity::new("0xabc").with("balance", dec!(10));
        let t1 = Entity::new("t1")
            .with("from", from.clone())
            .with("to", EntityId::from("0xdef"))
            .with("amount", dec!(5));

        let canonical = cache.put(&registry, &transfer(), &t1).unwrap();

        assert_eq!(canonical.get("from"), Some(&Value::Ref(EntityId::from("0xabc"))));
        assert_eq!(
            cache.entry(&account(), &EntityId::from("0xabc")),
            CacheEntry::Present(&from)
        );
    }

    #[test]
    fn materialize_reattaches_requested_relations() {
        let registry = registry();
        let mut cache = EntityCache::new();
        let from = Entity::new("0xabc").with("balance", dec!(10));
        cache.put(&registry, &account(), &from).unwrap();
        cache
            .put(
                &registry,
                &transfer(),
                &Entity::new("t1").with("from", EntityId::from("0xabc")),
            )
            .unwrap();

        let found = cache
            .materialize(
                &registry,
                &transfer(),
                &EntityId::from("t1"),
                &RelationPath::new().include("from"),
            )
            .unwrap();

        assert_eq!(found, Lookup::Found(Entity::new("t1").with("from", from)));
    }

    #[test]
    fn materialize_misses_on_unknown_relation_target() {
        let registry = registry();
        let mut cache = EntityCache::new();
        cache
            .put(
                &registry,
                &transfer(),
                &Entity::new("t1").with("to", EntityId::from("0xdef")),
            )
            .unwrap();

        let path = RelationPath::new().include("to");
        let result = cache.materialize(&registry, &transfer(), &EntityId::from("t1"), &path);
        assert_eq!(result, Ok(Lookup::Miss));

        let plain = cache.materialize(&registry, &transfer(), &EntityId::from("t1"), &RelationPath::new());
        assert!(matches!(plain, Ok(Lookup::Found(_))));
    }

    #[test]
    fn returned_copies_do_not_alias_cache() {
        let registry = registry();
        let mut cache = EntityCache::new();
        cache
            .put(&registry, &account(), &Entity::new("0xabc").with("balance", dec!(1)))
            .unwrap();

        let Ok(Lookup::Found(mut copy)) =
            cache.materialize(&registry, &account(), &EntityId::from("0xabc"), &RelationPath::new())
        else {
            panic!("entity was just cached");
        };
        copy.set("balance", dec!(999));

        let again =
            cache.materialize(&registry, &account(), &EntityId::from("0xabc"), &RelationPath::new());
        assert_eq!(
            again,
            Ok(Lookup::Found(Entity::new("0xabc").with("balance", dec!(1))))
        );
    }

    #[test]
    fn to_many_values_are_rejected() {
        let registry = registry();
        let mut cache = EntityCache::new();
        let entity = Entity::new("0xabc").with("outgoing", Value::Entities(Vec::new()));

        let result = cache.put(&registry, &account(), &entity);

        assert!(matches!(result, Err(ContractViolation::ToManyRelation { .. })));
        assert!(!cache.is_known(&account(), &EntityId::from("0xabc")));
    }

    #[test]
    fn unknown_fields_and_wrong_shapes_are_rejected() {
        let registry = registry();
        let mut cache = EntityCache::new();

        let unknown = cache.put(&registry, &account(), &Entity::new("a").with("nickname", "bob"));
        assert!(matches!(unknown, Err(ContractViolation::UnknownField { .. })));

        let wrong = cache.put(&registry, &account(), &Entity::new("a").with("balance", "ten"));
        assert!(matches!(
            wrong,
            Err(ContractViolation::FieldType { expected: "numeric", found: "text", .. })
        ));

        let missing = cache.put(&registry, &EntityName::from("Nope"), &Entity::new("a"));
        assert!(matches!(missing, Err(ContractViolation::Schema(_))));
    }
}
