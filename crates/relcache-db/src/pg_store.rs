//! [`EntityStore`] over one `PostgreSQL` transaction.
//!
//! A [`PgStore`] is opened per processing batch. Every bulk call the cache
//! issues runs inside the same transaction, so a batch either commits as a
//! whole or leaves no trace. The transaction sits behind a
//! [`tokio::sync::Mutex`] because the store trait takes `&self`.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use relcache_core::{Catalog, EntityStore, StoreError};
use relcache_types::{
    Entity, EntityId, EntityName, EntitySchema, Filter, FindOptions, RelationPath,
    SchemaRegistry, Value,
};
use sqlx::{PgConnection, Postgres, QueryBuilder, Transaction};
use tokio::sync::Mutex;

use crate::ddl;
use crate::error::DbError;
use crate::postgres::PostgresPool;
use crate::sql::{
    self, MAX_BIND_PARAMS, data_fields, decode_row, encode_row, fk_column, quote, select_list,
};

/// Default number of rows per multi-row `INSERT`.
const DEFAULT_BATCH_SIZE: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteMode {
    Insert,
    Upsert,
}

/// Entity store bound to one open transaction.
pub struct PgStore {
    tx: Mutex<Transaction<'static, Postgres>>,
    catalog: Arc<Catalog>,
    batch_size: usize,
}

impl std::fmt::Debug for PgStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgStore")
            .field("batch_size", &self.batch_size)
            .finish_non_exhaustive()
    }
}

impl PgStore {
    /// Open a transaction on `pool`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if no connection could be acquired.
    pub async fn begin(pool: &PostgresPool, catalog: Arc<Catalog>) -> Result<Self, DbError> {
        let tx = pool.pool().begin().await?;
        tracing::debug!("Opened store transaction");
        Ok(Self {
            tx: Mutex::new(tx),
            catalog,
            batch_size: DEFAULT_BATCH_SIZE,
        })
    }

    /// Set the maximum number of rows per `INSERT` statement. Statements are
    /// also capped by the bind-parameter limit.
    #[must_use]
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// The schema catalog this store writes against.
    pub const fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    /// Create any missing tables inside this transaction.
    pub async fn create_tables(&self) -> Result<(), DbError> {
        let mut tx = self.tx.lock().await;
        ddl::create_tables(&mut tx, &self.catalog).await
    }

    /// Commit everything written through this store.
    pub async fn commit(self) -> Result<(), DbError> {
        self.tx.into_inner().commit().await?;
        tracing::debug!("Committed store transaction");
        Ok(())
    }

    /// Discard everything written through this store.
    pub async fn rollback(self) -> Result<(), DbError> {
        self.tx.into_inner().rollback().await?;
        tracing::debug!("Rolled back store transaction");
        Ok(())
    }

    /// Rows per statement for a table with `width` columns.
    fn rows_per_statement(&self, width: usize) -> usize {
        let by_params = MAX_BIND_PARAMS.checked_div(width).unwrap_or(MAX_BIND_PARAMS);
        self.batch_size.min(by_params).max(1)
    }

    async fn write(&self, entity: &EntityName, rows: &[Entity], mode: WriteMode) -> Result<(), DbError> {
        if rows.is_empty() {
            return Ok(());
        }
        let schema = self.catalog.registry().get(entity)?;
        let fields = data_fields(schema);
        let mut encoded = rows
            .iter()
            .map(|row| encode_row(schema, row))
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .peekable();

        let header = format!(
            "INSERT INTO {} ({}) ",
            quote(&schema.table),
            select_list(schema)
        );
        let conflict = match mode {
            WriteMode::Insert => String::new(),
            WriteMode::Upsert if fields.is_empty() => " ON CONFLICT (\"id\") DO NOTHING".to_owned(),
            WriteMode::Upsert => {
                let updates = fields
                    .iter()
                    .map(|field| {
                        let column = quote(field.column());
                        format!("{column} = EXCLUDED.{column}")
                    })
                    .collect::<Vec<_>>()
                    .join(", ");
                format!(" ON CONFLICT (\"id\") DO UPDATE SET {updates}")
            }
        };
        let per_statement = self.rows_per_statement(fields.len().saturating_add(1));

        let mut tx = self.tx.lock().await;
        while encoded.peek().is_some() {
            let chunk: Vec<_> = encoded.by_ref().take(per_statement).collect();
            let mut builder = QueryBuilder::<Postgres>::new(header.as_str());
            builder.push_values(chunk, |mut tuple, binds| {
                for bind in binds {
                    bind.push_separated(&mut tuple);
                }
            });
            builder.push(conflict.as_str());
            builder.build().execute(&mut **tx).await?;
        }

        tracing::debug!(
            entity = %entity,
            count = rows.len(),
            upsert = mode == WriteMode::Upsert,
            "Wrote rows"
        );
        Ok(())
    }

    async fn select_by_ids(
        &self,
        entity: &EntityName,
        ids: &[EntityId],
        relations: &RelationPath,
    ) -> Result<Vec<Entity>, DbError> {
        let registry = self.catalog.registry();
        let schema = registry.get(entity)?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let keys: Vec<String> = ids.iter().map(|id| id.as_str().to_owned()).collect();
        let mut tx = self.tx.lock().await;
        let mut rows = select_by_column(&mut tx, schema, "id", keys).await?;
        populate(&mut tx, registry, schema, &mut rows, relations).await?;
        Ok(rows)
    }

    async fn select(&self, entity: &EntityName, options: &FindOptions) -> Result<Vec<Entity>, DbError> {
        let registry = self.catalog.registry();
        let schema = registry.get(entity)?;
        let mut builder = QueryBuilder::<Postgres>::new(format!(
            "SELECT {} FROM {}",
            select_list(schema),
            quote(&schema.table)
        ));
        sql::push_filter(&mut builder, schema, &options.filter)?;
        sql::push_order(&mut builder, schema, &options.order)?;
        sql::push_paging(&mut builder, options.take, options.skip)?;

        let mut tx = self.tx.lock().await;
        let fetched = builder.build().fetch_all(&mut **tx).await?;
        let mut rows = fetched
            .iter()
            .map(|row| decode_row(schema, row))
            .collect::<Result<Vec<_>, _>>()?;
        populate(&mut tx, registry, schema, &mut rows, &options.relations).await?;
        Ok(rows)
    }

    async fn select_count(&self, entity: &EntityName, filter: &Filter) -> Result<u64, DbError> {
        let schema = self.catalog.registry().get(entity)?;
        let mut builder =
            QueryBuilder::<Postgres>::new(format!("SELECT COUNT(*) FROM {}", quote(&schema.table)));
        sql::push_filter(&mut builder, schema, filter)?;

        let mut tx = self.tx.lock().await;
        let count: i64 = builder.build_query_scalar::<i64>().fetch_one(&mut **tx).await?;
        u64::try_from(count).map_err(|e| DbError::OutOfRange(format!("row count {count}: {e}")))
    }
}

impl EntityStore for PgStore {
    async fn insert_many(&self, entity: &EntityName, rows: &[Entity]) -> Result<(), StoreError> {
        self.write(entity, rows, WriteMode::Insert)
            .await
            .map_err(|e| e.into_store_error("bulk insert into", entity))
    }

    async fn upsert_many(&self, entity: &EntityName, rows: &[Entity]) -> Result<(), StoreError> {
        self.write(entity, rows, WriteMode::Upsert)
            .await
            .map_err(|e| e.into_store_error("bulk upsert into", entity))
    }

    async fn find_by_ids(
        &self,
        entity: &EntityName,
        ids: &[EntityId],
        relations: &RelationPath,
    ) -> Result<Vec<Entity>, StoreError> {
        self.select_by_ids(entity, ids, relations)
            .await
            .map_err(|e| e.into_store_error("find by ids in", entity))
    }

    async fn find(&self, entity: &EntityName, options: &FindOptions) -> Result<Vec<Entity>, StoreError> {
        self.select(entity, options)
            .await
            .map_err(|e| e.into_store_error("find in", entity))
    }

    async fn count(&self, entity: &EntityName, filter: &Filter) -> Result<u64, StoreError> {
        self.select_count(entity, filter)
            .await
            .map_err(|e| e.into_store_error("count in", entity))
    }
}

/// Rows of `schema` whose `column` is one of `keys`, ordered by id.
async fn select_by_column(
    conn: &mut PgConnection,
    schema: &EntitySchema,
    column: &str,
    keys: Vec<String>,
) -> Result<Vec<Entity>, DbError> {
    let mut builder = QueryBuilder::<Postgres>::new(format!(
        "SELECT {} FROM {} WHERE {} = ANY(",
        select_list(schema),
        quote(&schema.table),
        quote(column)
    ));
    builder.push_bind(keys).push(") ORDER BY \"id\"");
    let fetched = builder.build().fetch_all(&mut *conn).await?;
    fetched.iter().map(|row| decode_row(schema, row)).collect()
}

type PopulateFuture<'a> = Pin<Box<dyn Future<Output = Result<(), DbError>> + Send + 'a>>;

/// Attach the relations named by `relations` to `rows`, one query per
/// relation and level. To-one targets replace the foreign key; to-many
/// relations become [`Value::Entities`] read through the inverse key.
fn populate<'a>(
    conn: &'a mut PgConnection,
    registry: &'a SchemaRegistry,
    schema: &'a EntitySchema,
    rows: &'a mut [Entity],
    relations: &'a RelationPath,
) -> PopulateFuture<'a> {
    Box::pin(async move {
        if rows.is_empty() {
            return Ok(());
        }
        let empty = RelationPath::new();
        for (field, nested) in relations.included() {
            let relation = schema.find_relation(field).ok_or_else(|| DbError::UnknownField {
                entity: schema.name.clone(),
                field: field.to_owned(),
            })?;
            let target = registry.get(&relation.target)?;
            let nested = nested.unwrap_or(&empty);

            if relation.is_to_one() {
                let keys: BTreeSet<String> = rows
                    .iter()
                    .filter_map(|row| row.relation_id(field))
                    .map(|id| id.as_str().to_owned())
                    .collect();
                if keys.is_empty() {
                    continue;
                }
                let mut targets =
                    select_by_column(conn, target, "id", keys.into_iter().collect()).await?;
                populate(conn, registry, target, &mut targets, nested).await?;
                let by_id: BTreeMap<EntityId, Entity> = targets
                    .into_iter()
                    .map(|target| (target.id.clone(), target))
                    .collect();
                for row in rows.iter_mut() {
                    let found = row.relation_id(field).and_then(|id| by_id.get(id)).cloned();
                    if let Some(found) = found {
                        row.set(field, found);
                    }
                }
            } else {
                let inverse_field = relation.inverse.as_deref().unwrap_or_default();
                let inverse = target
                    .find_relation(inverse_field)
                    .filter(|inverse| inverse.is_to_one())
                    .ok_or_else(|| DbError::UnknownField {
                        entity: target.name.clone(),
                        field: inverse_field.to_owned(),
                    })?;
                let keys = rows.iter().map(|row| row.id.as_str().to_owned()).collect();
                let mut children = select_by_column(conn, target, fk_column(inverse), keys).await?;
                populate(conn, registry, target, &mut children, nested).await?;
                let mut grouped: BTreeMap<EntityId, Vec<Entity>> = BTreeMap::new();
                for child in children {
                    if let Some(owner) = child.relation_id(inverse_field).cloned() {
                        grouped.entry(owner).or_default().push(child);
                    }
                }
                for row in rows.iter_mut() {
                    let related = grouped.remove(&row.id).unwrap_or_default();
                    row.set(field, Value::Entities(related));
                }
            }
        }
        Ok(())
    })
}
