//! Options for general queries that the cache cannot serve by id.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::entity::{Entity, Value};
use crate::relation::RelationPath;

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Order {
    /// Ascending.
    Asc,
    /// Descending.
    Desc,
}

/// Conjunction of field equalities.
///
/// The pseudo-field `id` matches the entity id. Relation fields match on the
/// target id, so `Value::Ref` and a populated `Value::Entity` are equivalent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Filter(BTreeMap<String, Value>);

impl Filter {
    /// A filter matching everything.
    pub const fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Add an equality condition.
    #[must_use]
    pub fn and_eq(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.0.insert(field.to_owned(), value.into());
        self
    }

    /// Whether there are no conditions.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Conditions in field order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(field, value)| (field.as_str(), value))
    }

    /// Evaluate the filter against an in-memory entity.
    pub fn matches(&self, entity: &Entity) -> bool {
        self.0.iter().all(|(field, expected)| {
            if field == "id" {
                return match expected {
                    Value::Text(id) => id == entity.id.as_str(),
                    other => other.ref_id() == Some(&entity.id),
                };
            }
            entity
                .get(field)
                .unwrap_or(&Value::Null)
                .matches(expected)
        })
    }
}

/// Options of a `find`/`count` style query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindOptions {
    /// Equality conditions.
    #[serde(default)]
    pub filter: Filter,
    /// Relations to populate on every result.
    #[serde(default)]
    pub relations: RelationPath,
    /// Sort keys, most significant first.
    #[serde(default)]
    pub order: Vec<(String, Order)>,
    /// Maximum number of results.
    #[serde(default)]
    pub take: Option<u64>,
    /// Number of results to skip.
    #[serde(default)]
    pub skip: Option<u64>,
}

impl FindOptions {
    /// Options matching every entity of the type.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an equality condition.
    #[must_use]
    pub fn where_eq(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.filter = self.filter.and_eq(field, value);
        self
    }

    /// Populate `relations` on every result.
    #[must_use]
    pub fn with_relations(mut self, relations: RelationPath) -> Self {
        self.relations = relations;
        self
    }

    /// Append a sort key.
    #[must_use]
    pub fn order_by(mut self, field: &str, order: Order) -> Self {
        self.order.push((field.to_owned(), order));
        self
    }

    /// Limit the number of results.
    #[must_use]
    pub const fn take(mut self, take: u64) -> Self {
        self.take = Some(take);
        self
    }

    /// Skip the first `skip` results.
    #[must_use]
    pub const fn skip(mut self, skip: u64) -> Self {
        self.skip = Some(skip);
        self
    }
}

impl From<Filter> for FindOptions {
    fn from(filter: Filter) -> Self {
        Self {
            filter,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::ids::EntityId;

    use super::*;

    #[test]
    fn filter_matches_id_and_relations() {
        let transfer = Entity::new("t1")
            .with("from", EntityId::from("0xabc"))
            .with("amount", 5_i64);

        assert!(Filter::new().and_eq("id", "t1").matches(&transfer));
        assert!(Filter::new()
            .and_eq("from", Entity::new("0xabc"))
            .and_eq("amount", 5_i64)
            .matches(&transfer));
        assert!(!Filter::new().and_eq("amount", 6_i64).matches(&transfer));
    }

    #[test]
    fn unset_fields_match_null() {
        let entity = Entity::new("a");
        assert!(Filter::new().and_eq("parent", Value::Null).matches(&entity));
        assert!(Filter::new().matches(&entity));
    }
}
