//! Generic entity records.
//!
//! An [`Entity`] is a typed record identified by a stable string id. Its
//! fields are kept in a name-ordered map of [`Value`]s; which fields are legal
//! for a given entity type is decided by the [`SchemaRegistry`], not by this
//! type.
//!
//! Relations are represented in three shapes:
//!
//! | Variant | Meaning |
//! |---------|---------|
//! | [`Value::Ref`] | To-one foreign key, target not populated |
//! | [`Value::Entity`] | To-one relation, target populated |
//! | [`Value::Entities`] | To-many relation, targets populated |
//!
//! [`SchemaRegistry`]: crate::SchemaRegistry

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::ids::EntityId;

/// A single field value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    /// SQL `NULL` / unset relation.
    #[default]
    Null,
    /// Boolean column.
    Bool(bool),
    /// 64-bit integer column.
    Int(i64),
    /// Arbitrary precision numeric column.
    Numeric(Decimal),
    /// Text column.
    Text(String),
    /// Timestamp column.
    Timestamp(DateTime<Utc>),
    /// JSON document column.
    Json(serde_json::Value),
    /// Unpopulated to-one relation, holding only the target id.
    Ref(EntityId),
    /// Populated to-one relation.
    Entity(Box<Entity>),
    /// Populated to-many relation.
    Entities(Vec<Entity>),
}

impl Value {
    /// Whether this is [`Value::Null`].
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// The target id if this value is a to-one relation (populated or not).
    pub fn ref_id(&self) -> Option<&EntityId> {
        match self {
            Self::Ref(id) => Some(id),
            Self::Entity(entity) => Some(&entity.id),
            _ => None,
        }
    }

    /// Short name of the variant, for diagnostics.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Numeric(_) => "numeric",
            Self::Text(_) => "text",
            Self::Timestamp(_) => "timestamp",
            Self::Json(_) => "json",
            Self::Ref(_) => "ref",
            Self::Entity(_) => "entity",
            Self::Entities(_) => "entities",
        }
    }

    /// Compare two values the way an equality filter does: relations match
    /// on target id regardless of whether they are populated.
    pub fn matches(&self, other: &Self) -> bool {
        match (self.ref_id(), other.ref_id()) {
            (Some(a), Some(b)) => a == b,
            _ => self == other,
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<Decimal> for Value {
    fn from(value: Decimal) -> Self {
        Self::Numeric(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Timestamp(value)
    }
}

impl From<EntityId> for Value {
    fn from(value: EntityId) -> Self {
        Self::Ref(value)
    }
}

impl From<Entity> for Value {
    fn from(value: Entity) -> Self {
        Self::Entity(Box::new(value))
    }
}

/// A record of some entity type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    /// Unique identifier within the entity type.
    pub id: EntityId,
    /// Field values keyed by field name. The id is not repeated here.
    #[serde(default)]
    pub fields: BTreeMap<String, Value>,
}

impl Entity {
    /// Create an entity with no fields set.
    pub fn new(id: impl Into<EntityId>) -> Self {
        Self {
            id: id.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Builder-style field setter.
    #[must_use]
    pub fn with(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(field.to_owned(), value.into());
        self
    }

    /// Read a field. Unset fields read as `None`.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Set a field, returning the previous value.
    pub fn set(&mut self, field: &str, value: impl Into<Value>) -> Option<Value> {
        self.fields.insert(field.to_owned(), value.into())
    }

    /// Target id of a to-one relation field, if set.
    pub fn relation_id(&self, field: &str) -> Option<&EntityId> {
        self.fields.get(field).and_then(Value::ref_id)
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;

    #[test]
    fn relation_id_reads_refs_and_populated_targets() {
        let owner = Entity::new("0xabc");
        let transfer = Entity::new("t1")
            .with("from", owner)
            .with("to", EntityId::from("0xdef"))
            .with("amount", dec!(5));

        assert_eq!(transfer.relation_id("from").map(EntityId::as_str), Some("0xabc"));
        assert_eq!(transfer.relation_id("to").map(EntityId::as_str), Some("0xdef"));
        assert_eq!(transfer.relation_id("amount"), None);
    }

    #[test]
    fn matches_compares_relations_by_id() {
        let populated = Value::from(Entity::new("0xabc").with("balance", 10_i64));
        let reference = Value::Ref(EntityId::from("0xabc"));
        assert!(populated.matches(&reference));
        assert!(!Value::from(1_i64).matches(&Value::from(2_i64)));
    }

    #[test]
    fn set_returns_previous() {
        let mut entity = Entity::new("a").with("n", 1_i64);
        let previous = entity.set("n", 2_i64);
        assert_eq!(previous, Some(Value::Int(1)));
        assert_eq!(entity.get("n"), Some(&Value::Int(2)));
    }

    #[test]
    fn entity_json_shape() {
        let entity = Entity::new("a").with("name", "alice");
        let json = serde_json::to_value(&entity).ok();
        assert_eq!(
            json,
            Some(serde_json::json!({
                "id": "a",
                "fields": { "name": { "type": "text", "value": "alice" } }
            }))
        );
    }
}
