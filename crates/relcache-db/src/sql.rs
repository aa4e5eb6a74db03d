//! SQL text and parameter plumbing shared by [`PgStore`](crate::PgStore)
//! and the DDL generator.

use std::fmt::Display;

use chrono::{DateTime, Utc};
use relcache_types::{
    Column, ColumnKind, Entity, EntityId, EntitySchema, Filter, Order, Relation, Value,
};
use rust_decimal::Decimal;
use sqlx::postgres::PgRow;
use sqlx::query_builder::Separated;
use sqlx::{Postgres, QueryBuilder, Row};

use crate::error::DbError;

/// `PostgreSQL` accepts at most this many bind parameters per statement.
pub(crate) const MAX_BIND_PARAMS: usize = 65_535;

/// Quote an identifier taken from the registry.
pub(crate) fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Foreign-key column of a to-one relation.
pub(crate) fn fk_column(relation: &Relation) -> &str {
    relation.foreign_key().unwrap_or(relation.field.as_str())
}

/// A physical column of an entity table.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Field<'a> {
    /// The primary key.
    Id,
    /// A scalar column.
    Scalar(&'a Column),
    /// The foreign key of a to-one relation.
    ForeignKey(&'a Relation),
}

impl<'a> Field<'a> {
    /// Resolve an entity field name against `schema`.
    pub(crate) fn resolve(schema: &'a EntitySchema, field: &str) -> Result<Self, DbError> {
        if field == "id" {
            return Ok(Self::Id);
        }
        if let Some(column) = schema.find_column(field) {
            return Ok(Self::Scalar(column));
        }
        match schema.find_relation(field) {
            Some(relation) if relation.is_to_one() => Ok(Self::ForeignKey(relation)),
            _ => Err(DbError::UnknownField {
                entity: schema.name.clone(),
                field: field.to_owned(),
            }),
        }
    }

    /// Name of the field on the entity.
    pub(crate) fn field(&self) -> &'a str {
        match *self {
            Self::Id => "id",
            Self::Scalar(column) => &column.name,
            Self::ForeignKey(relation) => &relation.field,
        }
    }

    /// Name of the column in the table.
    pub(crate) fn column(&self) -> &'a str {
        match *self {
            Self::Id => "id",
            Self::Scalar(column) => &column.name,
            Self::ForeignKey(relation) => fk_column(relation),
        }
    }

    /// Column type used for binding and decoding.
    pub(crate) const fn kind(&self) -> ColumnKind {
        match *self {
            Self::Id | Self::ForeignKey(_) => ColumnKind::Text,
            Self::Scalar(column) => column.kind,
        }
    }

    /// Encode `value` for this column.
    pub(crate) fn encode(&self, schema: &EntitySchema, value: &Value) -> Result<Bind, DbError> {
        let bind = match (self, value) {
            (_, Value::Null) => Some(Bind::null(self.kind())),
            (Self::Id | Self::ForeignKey(_), Value::Text(id)) => Some(Bind::Text(Some(id.clone()))),
            (Self::Id | Self::ForeignKey(_), Value::Ref(id)) => {
                Some(Bind::Text(Some(id.as_str().to_owned())))
            }
            (Self::ForeignKey(_), Value::Entity(target)) => {
                Some(Bind::Text(Some(target.id.as_str().to_owned())))
            }
            (Self::Scalar(column), value) => Bind::scalar(column.kind, value),
            _ => None,
        };
        bind.ok_or_else(|| DbError::Encode {
            entity: schema.name.clone(),
            field: self.field().to_owned(),
            expected: sql_type(self.kind()),
            found: value.kind(),
        })
    }

    /// Decode this column of `row` into the entity value, `None` for `NULL`.
    fn decode(&self, row: &PgRow) -> Result<Option<Value>, DbError> {
        let column = self.column();
        let value = match self {
            Self::Id => row.try_get::<Option<String>, _>(column)?.map(Value::Text),
            Self::ForeignKey(_) => row
                .try_get::<Option<String>, _>(column)?
                .map(|id| Value::Ref(EntityId::from(id))),
            Self::Scalar(c) => match c.kind {
                ColumnKind::Bool => row.try_get::<Option<bool>, _>(column)?.map(Value::Bool),
                ColumnKind::Int => row.try_get::<Option<i64>, _>(column)?.map(Value::Int),
                ColumnKind::Numeric => row
                    .try_get::<Option<Decimal>, _>(column)?
                    .map(Value::Numeric),
                ColumnKind::Text => row.try_get::<Option<String>, _>(column)?.map(Value::Text),
                ColumnKind::Timestamp => row
                    .try_get::<Option<DateTime<Utc>>, _>(column)?
                    .map(Value::Timestamp),
                ColumnKind::Json => row
                    .try_get::<Option<serde_json::Value>, _>(column)?
                    .map(Value::Json),
            },
        };
        Ok(value)
    }
}

/// Every non-key column of a table: scalars first, then foreign keys.
pub(crate) fn data_fields(schema: &EntitySchema) -> Vec<Field<'_>> {
    schema
        .columns
        .iter()
        .map(Field::Scalar)
        .chain(schema.to_one_relations().map(Field::ForeignKey))
        .collect()
}

/// `"id", "a", "b_id", ...` for `schema`.
pub(crate) fn select_list(schema: &EntitySchema) -> String {
    std::iter::once(Field::Id)
        .chain(data_fields(schema))
        .map(|field| quote(field.column()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Decode one row selected with [`select_list`]. `NULL` columns are left
/// unset on the entity.
pub(crate) fn decode_row(schema: &EntitySchema, row: &PgRow) -> Result<Entity, DbError> {
    let id: String = row.try_get("id")?;
    let mut entity = Entity::new(id);
    for field in data_fields(schema) {
        if let Some(value) = field.decode(row)? {
            entity.set(field.field(), value);
        }
    }
    Ok(entity)
}

/// Bind-ready values for one row in [`data_fields`] order, prefixed with the
/// id. Unset fields bind as `NULL`.
pub(crate) fn encode_row(schema: &EntitySchema, entity: &Entity) -> Result<Vec<Bind>, DbError> {
    for field in entity.fields.keys() {
        Field::resolve(schema, field)?;
    }
    let mut binds = vec![Bind::Text(Some(entity.id.as_str().to_owned()))];
    for field in data_fields(schema) {
        let value = entity.get(field.field()).unwrap_or(&Value::Null);
        binds.push(field.encode(schema, value)?);
    }
    Ok(binds)
}

/// Append ` WHERE ...` for an equality filter.
pub(crate) fn push_filter(
    builder: &mut QueryBuilder<'_, Postgres>,
    schema: &EntitySchema,
    filter: &Filter,
) -> Result<(), DbError> {
    let mut keyword = " WHERE ";
    for (name, value) in filter.iter() {
        let field = Field::resolve(schema, name)?;
        builder.push(keyword).push(quote(field.column()));
        if value.is_null() {
            builder.push(" IS NULL");
        } else {
            builder.push(" = ");
            field.encode(schema, value)?.push_to(builder);
        }
        keyword = " AND ";
    }
    Ok(())
}

/// Append ` ORDER BY ...`, breaking ties by id.
pub(crate) fn push_order(
    builder: &mut QueryBuilder<'_, Postgres>,
    schema: &EntitySchema,
    order: &[(String, Order)],
) -> Result<(), DbError> {
    builder.push(" ORDER BY ");
    for (name, direction) in order {
        let field = Field::resolve(schema, name)?;
        let direction = match direction {
            Order::Asc => "ASC",
            Order::Desc => "DESC",
        };
        builder
            .push(quote(field.column()))
            .push(" ")
            .push(direction)
            .push(", ");
    }
    builder.push("\"id\" ASC");
    Ok(())
}

/// Append ` LIMIT ... OFFSET ...`.
pub(crate) fn push_paging(
    builder: &mut QueryBuilder<'_, Postgres>,
    take: Option<u64>,
    skip: Option<u64>,
) -> Result<(), DbError> {
    if let Some(take) = take {
        builder.push(" LIMIT ").push_bind(to_i64(take)?);
    }
    if let Some(skip) = skip {
        builder.push(" OFFSET ").push_bind(to_i64(skip)?);
    }
    Ok(())
}

fn to_i64(value: u64) -> Result<i64, DbError> {
    i64::try_from(value).map_err(|e| DbError::OutOfRange(format!("{value}: {e}")))
}

/// SQL type of a column kind.
pub(crate) const fn sql_type(kind: ColumnKind) -> &'static str {
    match kind {
        ColumnKind::Bool => "BOOLEAN",
        ColumnKind::Int => "BIGINT",
        ColumnKind::Numeric => "NUMERIC",
        ColumnKind::Text => "TEXT",
        ColumnKind::Timestamp => "TIMESTAMPTZ",
        ColumnKind::Json => "JSONB",
    }
}

/// An owned, typed bind parameter.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Bind {
    Bool(Option<bool>),
    Int(Option<i64>),
    Numeric(Option<Decimal>),
    Text(Option<String>),
    Timestamp(Option<DateTime<Utc>>),
    Json(Option<serde_json::Value>),
}

impl Bind {
    /// A typed `NULL`.
    const fn null(kind: ColumnKind) -> Self {
        match kind {
            ColumnKind::Bool => Self::Bool(None),
            ColumnKind::Int => Self::Int(None),
            ColumnKind::Numeric => Self::Numeric(None),
            ColumnKind::Text => Self::Text(None),
            ColumnKind::Timestamp => Self::Timestamp(None),
            ColumnKind::Json => Self::Json(None),
        }
    }

    fn scalar(kind: ColumnKind, value: &Value) -> Option<Self> {
        let bind = match (kind, value) {
            (ColumnKind::Bool, Value::Bool(v)) => Self::Bool(Some(*v)),
            (ColumnKind::Int, Value::Int(v)) => Self::Int(Some(*v)),
            (ColumnKind::Numeric, Value::Numeric(v)) => Self::Numeric(Some(*v)),
            (ColumnKind::Text, Value::Text(v)) => Self::Text(Some(v.clone())),
            (ColumnKind::Timestamp, Value::Timestamp(v)) => Self::Timestamp(Some(*v)),
            (ColumnKind::Json, Value::Json(v)) => Self::Json(Some(v.clone())),
            _ => return None,
        };
        Some(bind)
    }

    /// Bind as the next value of a `VALUES` tuple.
    pub(crate) fn push_separated<Sep: Display>(
        self,
        builder: &mut Separated<'_, '_, Postgres, Sep>,
    ) {
        match self {
            Self::Bool(v) => builder.push_bind(v),
            Self::Int(v) => builder.push_bind(v),
            Self::Numeric(v) => builder.push_bind(v),
            Self::Text(v) => builder.push_bind(v),
            Self::Timestamp(v) => builder.push_bind(v),
            Self::Json(v) => builder.push_bind(v),
        };
    }

    /// Bind at the current position of `builder`.
    pub(crate) fn push_to(self, builder: &mut QueryBuilder<'_, Postgres>) {
        match self {
            Self::Bool(v) => builder.push_bind(v),
            Self::Int(v) => builder.push_bind(v),
            Self::Numeric(v) => builder.push_bind(v),
            Self::Text(v) => builder.push_bind(v),
            Self::Timestamp(v) => builder.push_bind(v),
            Self::Json(v) => builder.push_bind(v),
        };
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use relcache_types::SchemaRegistry;
    use rust_decimal_macros::dec;

    use super::*;

    fn registry() -> SchemaRegistry {
        SchemaRegistry::from_entities([
            EntitySchema::new("Account").column("balance", ColumnKind::Numeric),
            EntitySchema::new("Transfer")
                .column("amount", ColumnKind::Numeric)
                .to_one("from", "Account"),
        ])
        .unwrap()
    }

    #[test]
    fn identifiers_are_quoted() {
        assert_eq!(quote("from_id"), "\"from_id\"");
        assert_eq!(quote("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn select_list_covers_keys_and_columns() {
        let registry = registry();
        let schema = registry.get(&"Transfer".into()).unwrap();
        assert_eq!(select_list(schema), "\"id\", \"amount\", \"from_id\"");
    }

    #[test]
    fn encode_row_binds_nulls_and_references() {
        let registry = registry();
        let schema = registry.get(&"Transfer".into()).unwrap();
        let row = Entity::new("t1").with("from", Entity::new("a"));
        let binds = encode_row(schema, &row).unwrap();
        assert_eq!(
            binds,
            vec![
                Bind::Text(Some("t1".to_owned())),
                Bind::Numeric(None),
                Bind::Text(Some("a".to_owned())),
            ]
        );
    }

    #[test]
    fn encode_row_rejects_mismatched_values() {
        let registry = registry();
        let schema = registry.get(&"Transfer".into()).unwrap();
        let row = Entity::new("t1").with("amount", "five");
        assert!(matches!(
            encode_row(schema, &row),
            Err(DbError::Encode { expected: "NUMERIC", found: "text", .. })
        ));
        let row = Entity::new("t1").with("memo", dec!(1));
        assert!(matches!(encode_row(schema, &row), Err(DbError::UnknownField { .. })));
    }

    #[test]
    fn filter_and_order_render_placeholders() {
        let registry = registry();
        let schema = registry.get(&"Transfer".into()).unwrap();
        let filter = Filter::new()
            .and_eq("from", EntityId::from("a"))
            .and_eq("amount", Value::Null);

        let mut builder = QueryBuilder::<Postgres>::new("SELECT 1 FROM \"transfer\"");
        push_filter(&mut builder, schema, &filter).unwrap();
        push_order(&mut builder, schema, &[("amount".to_owned(), Order::Desc)]).unwrap();
        push_paging(&mut builder, Some(10), None).unwrap();

        assert_eq!(
            builder.sql(),
            "SELECT 1 FROM \"transfer\" WHERE \"amount\" IS NULL AND \"from_id\" = $1 \
             ORDER BY \"amount\" DESC, \"id\" ASC LIMIT $2"
        );
    }
}
