//! Pending writes.
//!
//! Inserts and upserts are staged per entity type in insertion order and
//! drained by the flush coordinator. An id is pending in at most one of the
//! two buffers:
//!
//! - inserting an id already pending anywhere is a duplicate insert;
//! - upserting an id pending insert replaces the insert's payload in place,
//!   so the row is still written by the bulk insert but with the latest value;
//! - upserting an id pending upsert replaces it (last writer wins).

use std::collections::BTreeMap;

use relcache_types::{Entity, EntityId, EntityName};

use crate::error::ContractViolation;

/// Insertion-ordered rows of one entity type, indexed by id.
#[derive(Debug, Clone, Default)]
struct Pending {
    rows: Vec<Entity>,
    index: BTreeMap<EntityId, usize>,
}

impl Pending {
    fn contains(&self, id: &EntityId) -> bool {
        self.index.contains_key(id)
    }

    /// Replace the row with the same id, handing the entity back if there is
    /// none.
    fn replace(&mut self, entity: Entity) -> Result<(), Entity> {
        match self.index.get(&entity.id).and_then(|&pos| self.rows.get_mut(pos)) {
            Some(slot) => {
                *slot = entity;
                Ok(())
            }
            None => Err(entity),
        }
    }

    fn push_or_replace(&mut self, entity: Entity) {
        if let Err(entity) = self.replace(entity) {
            self.index.insert(entity.id.clone(), self.rows.len());
            self.rows.push(entity);
        }
    }
}

/// Per-type insert and upsert buffers.
#[derive(Debug, Clone, Default)]
pub struct WriteBuffer {
    inserts: BTreeMap<EntityName, Pending>,
    upserts: BTreeMap<EntityName, Pending>,
}

impl WriteBuffer {
    /// Empty buffers.
    pub const fn new() -> Self {
        Self {
            inserts: BTreeMap::new(),
            upserts: BTreeMap::new(),
        }
    }

    /// Whether `(name, id)` is pending insert or upsert.
    pub fn is_pending(&self, name: &EntityName, id: &EntityId) -> bool {
        [&self.inserts, &self.upserts]
            .iter()
            .any(|buffer| buffer.get(name).is_some_and(|pending| pending.contains(id)))
    }

    /// Stage an insert.
    pub fn insert(&mut self, name: &EntityName, entity: Entity) -> Result<(), ContractViolation> {
        if self.is_pending(name, &entity.id) {
            return Err(ContractViolation::DuplicateInsert {
                entity: name.clone(),
                id: entity.id,
            });
        }
        self.inserts.entry(name.clone()).or_default().push_or_replace(entity);
        Ok(())
    }

    /// Stage an upsert, coalescing with any pending write of the same id.
    pub fn upsert(&mut self, name: &EntityName, entity: Entity) {
        let entity = match self.inserts.get_mut(name) {
            Some(pending) => match pending.replace(entity) {
                Ok(()) => return,
                Err(entity) => entity,
            },
            None => entity,
        };
        self.upserts.entry(name.clone()).or_default().push_or_replace(entity);
    }

    /// Drain pending inserts of `name`, in insertion order.
    pub fn take_inserts(&mut self, name: &EntityName) -> Vec<Entity> {
        self.inserts.remove(name).map(|p| p.rows).unwrap_or_default()
    }

    /// Drain pending upserts of `name`, in first-upsert order.
    pub fn take_upserts(&mut self, name: &EntityName) -> Vec<Entity> {
        self.upserts.remove(name).map(|p| p.rows).unwrap_or_default()
    }

    /// Put back inserts drained by [`WriteBuffer::take_inserts`] whose write
    /// failed. Restored rows go ahead of anything staged since; a newer
    /// payload for the same id wins.
    pub fn restore_inserts(&mut self, name: &EntityName, rows: Vec<Entity>) {
        restore(&mut self.inserts, name, rows);
    }

    /// Put back upserts drained by [`WriteBuffer::take_upserts`] whose write
    /// failed.
    pub fn restore_upserts(&mut self, name: &EntityName, rows: Vec<Entity>) {
        restore(&mut self.upserts, name, rows);
    }

    /// Number of pending inserts of `name`.
    pub fn pending_inserts(&self, name: &EntityName) -> usize {
        self.inserts.get(name).map_or(0, |p| p.rows.len())
    }

    /// Number of pending upserts of `name`.
    pub fn pending_upserts(&self, name: &EntityName) -> usize {
        self.upserts.get(name).map_or(0, |p| p.rows.len())
    }

    /// Total number of pending rows across all types.
    pub fn len(&self) -> usize {
        self.inserts
            .values()
            .chain(self.upserts.values())
            .map(|p| p.rows.len())
            .sum()
    }

    /// Whether nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Discard everything pending.
    pub fn clear(&mut self) {
        self.inserts.clear();
        self.upserts.clear();
    }
}

fn restore(buffers: &mut BTreeMap<EntityName, Pending>, name: &EntityName, rows: Vec<Entity>) {
    if rows.is_empty() {
        return;
    }
    let newer = buffers.remove(name).unwrap_or_default();
    let mut pending = Pending::default();
    for row in rows.into_iter().chain(newer.rows) {
        pending.push_or_replace(row);
    }
    buffers.insert(name.clone(), pending);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account() -> EntityName {
        EntityName::from("Account")
    }

    fn ids(rows: &[Entity]) -> Vec<&str> {
        rows.iter().map(|e| e.id.as_str()).collect()
    }

    #[test]
    fn inserts_keep_order() {
        let mut buffer = WriteBuffer::new();
        for id in ["c", "a", "b"] {
            assert!(buffer.insert(&account(), Entity::new(id)).is_ok());
        }
        assert_eq!(buffer.pending_inserts(&account()), 3);
        assert_eq!(ids(&buffer.take_inserts(&account())), vec!["c", "a", "b"]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let mut buffer = WriteBuffer::new();
        assert!(buffer.insert(&account(), Entity::new("a")).is_ok());
        let result = buffer.insert(&account(), Entity::new("a").with("balance", 1_i64));
        assert_eq!(
            result,
            Err(ContractViolation::DuplicateInsert {
                entity: account(),
                id: EntityId::from("a"),
            })
        );
    }

    #[test]
    fn insert_after_upsert_is_rejected() {
        let mut buffer = WriteBuffer::new();
        buffer.upsert(&account(), Entity::new("a"));
        assert!(buffer.insert(&account(), Entity::new("a")).is_err());
    }

    #[test]
    fn upserts_coalesce_to_latest_value() {
        let mut buffer = WriteBuffer::new();
        buffer.upsert(&account(), Entity::new("a").with("n", 1_i64));
        buffer.upsert(&account(), Entity::new("b").with("n", 1_i64));
        buffer.upsert(&account(), Entity::new("a").with("n", 2_i64));

        let rows = buffer.take_upserts(&account());
        assert_eq!(ids(&rows), vec!["a", "b"]);
        assert_eq!(rows.first(), Some(&Entity::new("a").with("n", 2_i64)));
    }

    #[test]
    fn upsert_of_pending_insert_updates_the_insert() {
        let mut buffer = WriteBuffer::new();
        assert!(buffer.insert(&account(), Entity::new("a").with("n", 1_i64)).is_ok());
        buffer.upsert(&account(), Entity::new("a").with("n", 2_i64));

        assert_eq!(buffer.pending_upserts(&account()), 0);
        assert_eq!(
            buffer.take_inserts(&account()),
            vec![Entity::new("a").with("n", 2_i64)]
        );
    }

    #[test]
    fn restored_rows_keep_order_and_yield_to_newer_values() {
        let mut buffer = WriteBuffer::new();
        for id in ["a", "b"] {
            assert!(buffer.insert(&account(), Entity::new(id)).is_ok());
        }
        let drained = buffer.take_inserts(&account());
        assert!(buffer.is_empty());

        buffer.upsert(&account(), Entity::new("c"));
        buffer.restore_inserts(&account(), drained);
        buffer.upsert(&account(), Entity::new("b").with("n", 2_i64));

        assert!(buffer.is_pending(&account(), &EntityId::from("a")));
        assert_eq!(buffer.pending_upserts(&account()), 1);
        assert_eq!(
            buffer.take_inserts(&account()),
            vec![Entity::new("a"), Entity::new("b").with("n", 2_i64)]
        );
    }
}
