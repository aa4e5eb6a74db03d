//! Table creation from the schema registry.
//!
//! One table per entity type: a `TEXT` primary key named `id`, one column
//! per scalar, and one `TEXT` foreign key per to-one relation. To-many
//! relations have no column; they are read through the target's foreign key.

use relcache_core::Catalog;
use relcache_types::{EntitySchema, SchemaRegistry};
use sqlx::PgConnection;

use crate::error::DbError;
use crate::sql::{fk_column, quote, sql_type};

/// `CREATE TABLE IF NOT EXISTS` statement for `schema`.
pub fn create_table_sql(registry: &SchemaRegistry, schema: &EntitySchema) -> Result<String, DbError> {
    let mut columns = vec!["\"id\" TEXT PRIMARY KEY".to_owned()];
    for column in &schema.columns {
        let null = if column.nullable { "" } else { " NOT NULL" };
        columns.push(format!("{} {}{null}", quote(&column.name), sql_type(column.kind)));
    }
    for relation in schema.to_one_relations() {
        let target = registry.get(&relation.target)?;
        let null = if relation.nullable { "" } else { " NOT NULL" };
        columns.push(format!(
            "{} TEXT{null} REFERENCES {} (\"id\")",
            quote(fk_column(relation)),
            quote(&target.table)
        ));
    }
    Ok(format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        quote(&schema.table),
        columns.join(", ")
    ))
}

/// Create every table in write order, so referenced tables exist before the
/// tables holding foreign keys into them.
pub async fn create_tables(conn: &mut PgConnection, catalog: &Catalog) -> Result<(), DbError> {
    let registry = catalog.registry();
    for name in catalog.write_order()? {
        let schema = registry.get(name)?;
        let statement = create_table_sql(registry, schema)?;
        sqlx::query(&statement).execute(&mut *conn).await?;
        tracing::debug!(entity = %name, table = %schema.table, "Ensured table");
    }
    tracing::info!(tables = registry.len(), "Schema tables ready");
    Ok(())
}
