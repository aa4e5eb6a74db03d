//! Statically declared schema description.
//!
//! The cache never inspects runtime type information. Everything it needs to
//! know about an entity type (its table, scalar columns, and relations with
//! their cardinality and target) is declared up front in a
//! [`SchemaRegistry`], usually deserialized from the processor configuration.
//!
//! # Example
//!
//! ```yaml
//! entities:
//!   - name: Account
//!     columns:
//!       - { name: balance, kind: numeric }
//!   - name: Transfer
//!     columns:
//!       - { name: amount, kind: numeric }
//!     relations:
//!       - { field: from, target: Account }
//!       - { field: to, target: Account }
//! ```

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::ids::EntityName;

/// Errors raised while building or querying a [`SchemaRegistry`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaError {
    /// No schema is registered for the entity type.
    #[error("no schema registered for entity type {0}")]
    UnknownEntity(EntityName),

    /// The same entity type was declared twice.
    #[error("entity type {0} is declared more than once")]
    DuplicateEntity(EntityName),

    /// A field name is used twice within one entity type, or shadows `id`.
    #[error("field {field} of {entity} is declared more than once")]
    DuplicateField {
        /// The entity type.
        entity: EntityName,
        /// The offending field.
        field: String,
    },

    /// A relation points at an entity type that is not declared.
    #[error("relation {entity}.{field} targets undeclared entity type {target}")]
    UnknownTarget {
        /// The entity type owning the relation.
        entity: EntityName,
        /// The relation field.
        field: String,
        /// The undeclared target.
        target: EntityName,
    },

    /// A to-many relation does not name a to-one relation back to its owner.
    #[error("to-many relation {entity}.{field} needs an inverse to-one field on {target}")]
    InvalidInverse {
        /// The entity type owning the relation.
        entity: EntityName,
        /// The relation field.
        field: String,
        /// The relation target.
        target: EntityName,
    },
}

/// Scalar column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    /// Boolean.
    Bool,
    /// 64-bit signed integer.
    Int,
    /// Arbitrary precision decimal.
    Numeric,
    /// UTF-8 text.
    Text,
    /// Timestamp with time zone.
    Timestamp,
    /// JSON document.
    Json,
}

/// A scalar column of an entity type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    /// Field and column name.
    pub name: String,
    /// Column type.
    pub kind: ColumnKind,
    /// Whether the column accepts `NULL`.
    #[serde(default = "default_true")]
    pub nullable: bool,
}

/// Relation cardinality.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cardinality {
    /// A foreign key on this type pointing at one target row.
    #[default]
    ToOne,
    /// Any number of target rows pointing back at this one.
    ToMany,
}

/// A relation field of an entity type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relation {
    /// Field name on the owning entity.
    pub field: String,
    /// Referenced entity type.
    pub target: EntityName,
    /// To-one or to-many.
    #[serde(default)]
    pub cardinality: Cardinality,
    /// Foreign-key column of a to-one relation. Defaults to `<field>_id`.
    #[serde(default)]
    pub column: Option<String>,
    /// To-one field on the target that points back here (to-many only).
    #[serde(default)]
    pub inverse: Option<String>,
    /// Whether a to-one foreign key accepts `NULL`.
    #[serde(default = "default_true")]
    pub nullable: bool,
}

impl Relation {
    /// Whether this is a to-one relation.
    pub fn is_to_one(&self) -> bool {
        self.cardinality == Cardinality::ToOne
    }

    /// Foreign-key column name for a to-one relation.
    pub fn foreign_key(&self) -> Option<&str> {
        self.column.as_deref()
    }
}

/// Schema of one entity type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySchema {
    /// Entity type name.
    pub name: EntityName,
    /// Backing table. Defaults to the lowercased type name.
    #[serde(default)]
    pub table: String,
    /// Scalar columns in declaration order.
    #[serde(default)]
    pub columns: Vec<Column>,
    /// Relation fields in declaration order.
    #[serde(default)]
    pub relations: Vec<Relation>,
}

impl EntitySchema {
    /// Start describing an entity type.
    pub fn new(name: impl Into<EntityName>) -> Self {
        Self {
            name: name.into(),
            table: String::new(),
            columns: Vec::new(),
            relations: Vec::new(),
        }
    }

    /// Override the table name.
    #[must_use]
    pub fn table(mut self, table: &str) -> Self {
        table.clone_into(&mut self.table);
        self
    }

    /// Add a nullable scalar column.
    #[must_use]
    pub fn column(mut self, name: &str, kind: ColumnKind) -> Self {
        self.columns.push(Column {
            name: name.to_owned(),
            kind,
            nullable: true,
        });
        self
    }

    /// Add a nullable to-one relation with the default foreign-key column.
    #[must_use]
    pub fn to_one(mut self, field: &str, target: impl Into<EntityName>) -> Self {
        self.relations.push(Relation {
            field: field.to_owned(),
            target: target.into(),
            cardinality: Cardinality::ToOne,
            column: None,
            inverse: None,
            nullable: true,
        });
        self
    }

    /// Add a to-many relation mapped by `inverse` on `target`.
    #[must_use]
    pub fn to_many(mut self, field: &str, target: impl Into<EntityName>, inverse: &str) -> Self {
        self.relations.push(Relation {
            field: field.to_owned(),
            target: target.into(),
            cardinality: Cardinality::ToMany,
            column: None,
            inverse: Some(inverse.to_owned()),
            nullable: true,
        });
        self
    }

    /// Look up a scalar column by field name.
    pub fn find_column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Look up a relation by field name.
    pub fn find_relation(&self, field: &str) -> Option<&Relation> {
        self.relations.iter().find(|r| r.field == field)
    }

    /// To-one relations, in declaration order.
    pub fn to_one_relations(&self) -> impl Iterator<Item = &Relation> {
        self.relations.iter().filter(|r| r.is_to_one())
    }

    fn normalize(&mut self) -> Result<(), SchemaError> {
        if self.table.is_empty() {
            self.table = self.name.as_str().to_lowercase();
        }
        for relation in &mut self.relations {
            if relation.is_to_one() && relation.column.is_none() {
                relation.column = Some(format!("{}_id", relation.field));
            }
        }

        let mut seen = BTreeSet::from(["id"]);
        let fields = self
            .columns
            .iter()
            .map(|c| c.name.as_str())
            .chain(self.relations.iter().map(|r| r.field.as_str()));
        for field in fields {
            if !seen.insert(field) {
                return Err(SchemaError::DuplicateField {
                    entity: self.name.clone(),
                    field: field.to_owned(),
                });
            }
        }
        Ok(())
    }
}

/// Registry of every entity type known to the cache.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RegistryDocument")]
pub struct SchemaRegistry {
    entities: BTreeMap<EntityName, EntitySchema>,
}

#[derive(Deserialize)]
struct RegistryDocument {
    #[serde(default)]
    entities: Vec<EntitySchema>,
}

impl TryFrom<RegistryDocument> for SchemaRegistry {
    type Error = SchemaError;

    fn try_from(document: RegistryDocument) -> Result<Self, Self::Error> {
        Self::from_entities(document.entities)
    }
}

impl SchemaRegistry {
    /// Build and validate a registry.
    ///
    /// Fills in default table and foreign-key column names, then checks that
    /// field names are unique, every relation target is declared, and every
    /// to-many relation names a to-one inverse pointing back at its owner.
    pub fn from_entities(
        entities: impl IntoIterator<Item = EntitySchema>,
    ) -> Result<Self, SchemaError> {
        let mut map = BTreeMap::new();
        for mut schema in entities {
            schema.normalize()?;
            let name = schema.name.clone();
            if map.insert(name.clone(), schema).is_some() {
                return Err(SchemaError::DuplicateEntity(name));
            }
        }
        let registry = Self { entities: map };
        registry.validate()?;
        Ok(registry)
    }

    fn validate(&self) -> Result<(), SchemaError> {
        for schema in self.entities.values() {
            for relation in &schema.relations {
                let Some(target) = self.entities.get(&relation.target) else {
                    return Err(SchemaError::UnknownTarget {
                        entity: schema.name.clone(),
                        field: relation.field.clone(),
                        target: relation.target.clone(),
                    });
                };
                if relation.is_to_one() {
                    continue;
                }
                let inverse_ok = relation
                    .inverse
                    .as_deref()
                    .and_then(|inverse| target.find_relation(inverse))
                    .is_some_and(|inverse| inverse.is_to_one() && inverse.target == schema.name);
                if !inverse_ok {
                    return Err(SchemaError::InvalidInverse {
                        entity: schema.name.clone(),
                        field: relation.field.clone(),
                        target: relation.target.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Schema of `name`.
    pub fn get(&self, name: &EntityName) -> Result<&EntitySchema, SchemaError> {
        self.entities
            .get(name)
            .ok_or_else(|| SchemaError::UnknownEntity(name.clone()))
    }

    /// Whether `name` is registered.
    pub fn contains(&self, name: &EntityName) -> bool {
        self.entities.contains_key(name)
    }

    /// All schemas in name order.
    pub fn iter(&self) -> impl Iterator<Item = &EntitySchema> {
        self.entities.values()
    }

    /// Number of registered entity types.
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Whether no entity type is registered.
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

const fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transfers() -> Result<SchemaRegistry, SchemaError> {
        SchemaRegistry::from_entities([
            EntitySchema::new("Account")
                .column("balance", ColumnKind::Numeric)
                .to_many("outgoing", "Transfer", "from"),
            EntitySchema::new("Transfer")
                .column("amount", ColumnKind::Numeric)
                .to_one("from", "Account")
                .to_one("to", "Account"),
        ])
    }

    #[test]
    fn defaults_are_filled_in() {
        let registry = transfers();
        assert!(registry.is_ok());
        let registry = registry.unwrap_or_default();
        let transfer = registry.get(&EntityName::from("Transfer")).ok();
        assert_eq!(transfer.map(|s| s.table.as_str()), Some("transfer"));
        let fk = transfer
            .and_then(|s| s.find_relation("from"))
            .and_then(Relation::foreign_key);
        assert_eq!(fk, Some("from_id"));
    }

    #[test]
    fn unknown_target_is_rejected() {
        let result =
            SchemaRegistry::from_entities([EntitySchema::new("Transfer").to_one("from", "Account")]);
        assert!(matches!(result, Err(SchemaError::UnknownTarget { .. })));
    }

    #[test]
    fn to_many_needs_matching_inverse() {
        let result = SchemaRegistry::from_entities([
            EntitySchema::new("Account").to_many("outgoing", "Transfer", "amount"),
            EntitySchema::new("Transfer").column("amount", ColumnKind::Numeric),
        ]);
        assert!(matches!(result, Err(SchemaError::InvalidInverse { .. })));
    }

    #[test]
    fn duplicate_fields_are_rejected() {
        let result = SchemaRegistry::from_entities([EntitySchema::new("Account")
            .column("balance", ColumnKind::Numeric)
            .column("balance", ColumnKind::Int)]);
        assert!(matches!(result, Err(SchemaError::DuplicateField { .. })));

        let result =
            SchemaRegistry::from_entities([EntitySchema::new("Account").column("id", ColumnKind::Text)]);
        assert!(matches!(result, Err(SchemaError::DuplicateField { .. })));
    }

    #[test]
    fn deserializes_from_yaml() {
        let yaml = r"
entities:
  - name: Account
    table: accounts
    columns:
      - { name: balance, kind: numeric, nullable: false }
  - name: Transfer
    columns:
      - { name: amount, kind: numeric }
    relations:
      - { field: from, target: Account }
";
        let registry: Result<SchemaRegistry, _> = serde_yml::from_str(yaml);
        let registry = registry.unwrap_or_default();
        assert_eq!(registry.len(), 2);
        let account = registry.get(&EntityName::from("Account")).ok();
        assert_eq!(account.map(|s| s.table.as_str()), Some("accounts"));
        assert_eq!(
            account.and_then(|s| s.find_column("balance")).map(|c| c.nullable),
            Some(false)
        );
    }

    #[test]
    fn invalid_yaml_schema_fails_deserialization() {
        let yaml = "entities:\n  - name: Transfer\n    relations:\n      - { field: from, target: Nope }\n";
        let registry: Result<SchemaRegistry, _> = serde_yml::from_str(yaml);
        assert!(registry.is_err());
    }
}
