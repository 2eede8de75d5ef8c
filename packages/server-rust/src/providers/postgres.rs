//! [`EntityMetadataProvider`] over `PostgreSQL` via sqlx.
//!
//! Each entity type lives in its own table, `"<schema>"."<prefix><type>"`,
//! with an `entity_id` primary key, an `entity_version` counter, and one
//! nullable column per schema field. Tables are created on initialize and
//! their columns checked against the registered schemas.
//!
//! Every write is a single statement, so no explicit transactions are needed:
//! optimistic concurrency is the `entity_version` predicate of the `UPDATE`.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metastore_core::types::validate_entity_id;
use metastore_core::{
    Clause, ClauseOp, CursorPosition, EntityMetadata, EntityMetadataType, EntityUpdate,
    EntityVersion, FieldMap, FieldSchema, FieldType, FieldValue, ProviderError, ProviderResult,
    QueryDescriptor, QueryPage, SchemaRegistry, SortDirection, TokenIssuer, UpdateMode,
    ValidationMode,
};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, QueryBuilder, Row};
use tracing::{debug, info, warn};

use crate::config::PostgresProviderOptions;
use crate::mapper::relational::{
    create_table_sql, qualified_table, quote_ident, reported_data_type, select_columns,
    table_name, ID_COLUMN, VERSION_COLUMN,
};
use crate::traits::{ClearReport, EntityMetadataProvider, ProviderKind};

fn sql_err(e: &sqlx::Error) -> ProviderError {
    match e {
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::Io(_)
        | sqlx::Error::Tls(_) => ProviderError::unavailable(e.to_string()),
        _ => ProviderError::backend(e.to_string()),
    }
}

fn to_timestamp(ms: i64) -> ProviderResult<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| ProviderError::validation(format!("date {ms} is out of range")))
}

/// Appends a bind parameter for `value`.
fn push_value(qb: &mut QueryBuilder<'static, Postgres>, value: &FieldValue) -> ProviderResult<()> {
    match value {
        FieldValue::String(s) => qb.push_bind(s.clone()),
        FieldValue::Number(n) => qb.push_bind(*n),
        FieldValue::Boolean(b) => qb.push_bind(*b),
        FieldValue::Date(ms) => qb.push_bind(to_timestamp(*ms)?),
        FieldValue::StringArray(items) => qb.push_bind(items.clone()),
    };
    Ok(())
}

/// Column expression used for comparisons and ordering. Strings compare
/// bytewise, matching the other providers.
fn comparable(name: &str, field_type: FieldType) -> String {
    match field_type {
        FieldType::String => format!("{} COLLATE \"C\"", quote_ident(name)),
        _ => quote_ident(name),
    }
}

/// Appends ` AND <clause>`. NULL columns never satisfy a clause.
fn push_clause(
    qb: &mut QueryBuilder<'static, Postgres>,
    clause: &Clause,
    field_type: FieldType,
) -> ProviderResult<()> {
    let column = quote_ident(&clause.field);
    qb.push(" AND ");
    match (field_type, &clause.value, clause.op) {
        (FieldType::StringArray, FieldValue::String(_), ClauseOp::Eq) => {
            qb.push(format!("{column} IS NOT NULL AND "));
            push_value(qb, &clause.value)?;
            qb.push(format!(" = ANY({column})"));
        }
        (FieldType::StringArray, FieldValue::String(_), ClauseOp::Ne) => {
            qb.push(format!("{column} IS NOT NULL AND NOT ("));
            push_value(qb, &clause.value)?;
            qb.push(format!(" = ANY({column}))"));
        }
        _ => {
            qb.push(format!("{} {} ", comparable(&clause.field, field_type), clause.op.as_sql()));
            push_value(qb, &clause.value)?;
        }
    }
    Ok(())
}

fn read_field(row: &PgRow, name: &str, field_type: FieldType) -> Result<Option<FieldValue>, sqlx::Error> {
    Ok(match field_type {
        FieldType::String => row.try_get::<Option<String>, _>(name)?.map(FieldValue::String),
        FieldType::Number => row.try_get::<Option<f64>, _>(name)?.map(FieldValue::Number),
        FieldType::Boolean => row.try_get::<Option<bool>, _>(name)?.map(FieldValue::Boolean),
        FieldType::Date => row
            .try_get::<Option<DateTime<Utc>>, _>(name)?
            .map(|ts| FieldValue::Date(ts.timestamp_millis())),
        FieldType::StringArray => row
            .try_get::<Option<Vec<String>>, _>(name)?
            .map(FieldValue::StringArray),
    })
}

fn row_to_record(row: &PgRow, schema: &FieldSchema) -> ProviderResult<EntityMetadata> {
    let entity_type = schema.entity_type.as_str();
    let id: String = row
        .try_get(ID_COLUMN)
        .map_err(|e| ProviderError::corrupt(entity_type, "?", e.to_string()))?;
    let version: i64 = row
        .try_get(VERSION_COLUMN)
        .map_err(|e| ProviderError::corrupt(entity_type, &id, e.to_string()))?;

    let mut fields = FieldMap::new();
    for (name, spec) in &schema.fields {
        let value = read_field(row, name, spec.field_type)
            .map_err(|e| ProviderError::corrupt(entity_type, &id, format!("column {name}: {e}")))?;
        if let Some(value) = value {
            fields.insert(name.clone(), value);
        }
    }
    Ok(EntityMetadata {
        entity_type: schema.entity_type.clone(),
        entity_id: id,
        version: Some(EntityVersion::new(version.to_string())),
        fields,
    })
}

/// Entity metadata in `PostgreSQL`, one table per entity type.
pub struct PostgresEntityMetadataProvider {
    options: PostgresProviderOptions,
    schemas: SchemaRegistry,
    pool: ArcSwapOption<PgPool>,
    init_lock: tokio::sync::Mutex<()>,
    tokens: TokenIssuer,
}

impl PostgresEntityMetadataProvider {
    /// Builds an unconnected provider. No I/O happens until
    /// [`initialize`](EntityMetadataProvider::initialize).
    #[must_use]
    pub fn new(options: PostgresProviderOptions, schemas: SchemaRegistry) -> Self {
        Self {
            options,
            schemas,
            pool: ArcSwapOption::empty(),
            init_lock: tokio::sync::Mutex::new(()),
            tokens: TokenIssuer::new(
                ProviderKind::Postgres.as_str(),
                uuid::Uuid::new_v4().to_string(),
            ),
        }
    }

    fn pool(&self) -> ProviderResult<Arc<PgPool>> {
        self.pool
            .load_full()
            .ok_or_else(|| ProviderError::unavailable("postgres provider is not initialized"))
    }

    fn table(&self, entity_type: &EntityMetadataType) -> String {
        qualified_table(&self.options.schema, &self.options.table_prefix, entity_type)
    }

    /// Creates the table for `schema` if needed, then checks that every
    /// column exists with the expected type.
    async fn prepare_table(&self, pool: &PgPool, schema: &FieldSchema) -> ProviderResult<()> {
        let ddl = create_table_sql(&self.options.schema, &self.options.table_prefix, schema);
        sqlx::query(&ddl).execute(pool).await.map_err(|e| sql_err(&e))?;

        let name = table_name(&self.options.table_prefix, &schema.entity_type);
        let rows = sqlx::query(
            "SELECT column_name::text AS column_name, data_type::text AS data_type \
             FROM information_schema.columns \
             WHERE table_schema = $1 AND table_name = $2",
        )
        .bind(&self.options.schema)
        .bind(&name)
        .fetch_all(pool)
        .await
        .map_err(|e| sql_err(&e))?;

        let mut columns = HashMap::with_capacity(rows.len());
        for row in &rows {
            let column: String = row.try_get("column_name").map_err(|e| sql_err(&e))?;
            let data_type: String = row.try_get("data_type").map_err(|e| sql_err(&e))?;
            columns.insert(column, data_type);
        }

        let expected = [(ID_COLUMN, "text"), (VERSION_COLUMN, "bigint")]
            .into_iter()
            .map(|(column, ty)| (column.to_string(), ty))
            .chain(
                schema
                    .fields
                    .iter()
                    .map(|(field, spec)| (field.clone(), reported_data_type(spec.field_type))),
            );
        for (column, wanted) in expected {
            match columns.get(&column) {
                Some(found) if found == wanted => {}
                Some(found) => {
                    return Err(ProviderError::configuration(format!(
                        "column {name}.{column} is {found}, expected {wanted}"
                    )))
                }
                None => {
                    return Err(ProviderError::configuration(format!(
                        "table {name} has no column {column}"
                    )))
                }
            }
        }
        debug!(table = %name, columns = columns.len(), "table schema verified");
        Ok(())
    }

    async fn fetch_version(&self, pool: &PgPool, entity_type: &EntityMetadataType, id: &str) -> ProviderResult<Option<i64>> {
        let sql = format!(
            "SELECT {VERSION_COLUMN} FROM {} WHERE {ID_COLUMN} = $1",
            self.table(entity_type)
        );
        sqlx::query_scalar::<_, i64>(&sql)
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(|e| sql_err(&e))
    }
}

#[async_trait]
impl EntityMetadataProvider for PostgresEntityMetadataProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Postgres
    }

    async fn initialize(&self) -> ProviderResult<()> {
        let _guard = self.init_lock.lock().await;
        if self.pool.load().is_some() {
            return Ok(());
        }
        self.options.validate()?;
        self.schemas.check_definitions()?;

        let pool = PgPoolOptions::new()
            .max_connections(self.options.max_connections)
            .acquire_timeout(self.options.acquire_timeout)
            .connect(&self.options.connection_string)
            .await
            .map_err(|e| ProviderError::unavailable(format!("connect to postgres: {e}")))?;

        for schema in self.schemas.iter() {
            if let Err(e) = self.prepare_table(&pool, schema).await {
                pool.close().await;
                return Err(e);
            }
        }
        self.pool.store(Some(Arc::new(pool)));

        info!(
            provider = "postgres",
            schema = %self.options.schema,
            prefix = %self.options.table_prefix,
            tables = self.schemas.len(),
            "entity metadata provider ready"
        );
        Ok(())
    }

    async fn get(&self, entity_type: &EntityMetadataType, id: &str) -> ProviderResult<EntityMetadata> {
        let schema = self.schemas.require(entity_type)?;
        let pool = self.pool()?;
        let sql = format!(
            "SELECT {} FROM {} WHERE {ID_COLUMN} = $1",
            select_columns(schema),
            self.table(entity_type)
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(pool.as_ref())
            .await
            .map_err(|e| sql_err(&e))?
            .ok_or_else(|| ProviderError::not_found(entity_type.as_str(), id))?;
        row_to_record(&row, schema)
    }

    async fn create(
        &self,
        entity_type: &EntityMetadataType,
        id: &str,
        fields: FieldMap,
    ) -> ProviderResult<EntityMetadata> {
        validate_entity_id(id)?;
        let schema = self.schemas.require(entity_type)?;
        self.schemas.validate(entity_type, &fields, ValidationMode::Full)?;
        let pool = self.pool()?;

        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "INSERT INTO {} ({ID_COLUMN}, {VERSION_COLUMN}",
            self.table(entity_type)
        ));
        for name in fields.keys() {
            qb.push(", ").push(quote_ident(name));
        }
        qb.push(") VALUES (").push_bind(id.to_string()).push(", 1");
        for value in fields.values() {
            qb.push(", ");
            push_value(&mut qb, value)?;
        }
        qb.push(format!(
            ") ON CONFLICT ({ID_COLUMN}) DO NOTHING RETURNING {}",
            select_columns(schema)
        ));

        let row = qb
            .build()
            .fetch_optional(pool.as_ref())
            .await
            .map_err(|e| sql_err(&e))?;
        match row {
            Some(row) => {
                debug!(entity_type = %entity_type, entity_id = %id, "created");
                row_to_record(&row, schema)
            }
            None => {
                warn!(entity_type = %entity_type, entity_id = %id, "create conflict");
                Err(ProviderError::conflict(entity_type.as_str(), id))
            }
        }
    }

    async fn update(
        &self,
        entity_type: &EntityMetadataType,
        id: &str,
        update: EntityUpdate,
    ) -> ProviderResult<EntityMetadata> {
        let schema = self.schemas.require(entity_type)?;
        let mode = match update.mode {
            UpdateMode::Replace => ValidationMode::Full,
            UpdateMode::Merge => ValidationMode::Partial,
        };
        self.schemas.validate(entity_type, &update.fields, mode)?;
        let pool = self.pool()?;

        let expected = match &update.expected_version {
            Some(version) => match version.as_str().parse::<i64>() {
                Ok(n) => Some(n),
                Err(_) => {
                    let actual = self
                        .fetch_version(&pool, entity_type, id)
                        .await?
                        .ok_or_else(|| ProviderError::not_found(entity_type.as_str(), id))?;
                    return Err(ProviderError::concurrency_conflict(
                        entity_type.as_str(),
                        id,
                        version.as_str(),
                        actual.to_string(),
                    ));
                }
            },
            None => None,
        };

        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "UPDATE {} SET {VERSION_COLUMN} = {VERSION_COLUMN} + 1",
            self.table(entity_type)
        ));
        match update.mode {
            UpdateMode::Merge => {
                for (name, value) in &update.fields {
                    qb.push(format!(", {} = ", quote_ident(name)));
                    push_value(&mut qb, value)?;
                }
            }
            UpdateMode::Replace => {
                for name in schema.fields.keys() {
                    qb.push(format!(", {} = ", quote_ident(name)));
                    match update.fields.get(name) {
                        Some(value) => push_value(&mut qb, value)?,
                        None => {
                            qb.push("NULL");
                        }
                    }
                }
            }
        }
        qb.push(format!(" WHERE {ID_COLUMN} = ")).push_bind(id.to_string());
        if let Some(expected) = expected {
            qb.push(format!(" AND {VERSION_COLUMN} = ")).push_bind(expected);
        }
        qb.push(format!(" RETURNING {}", select_columns(schema)));

        let row = qb
            .build()
            .fetch_optional(pool.as_ref())
            .await
            .map_err(|e| sql_err(&e))?;
        if let Some(row) = row {
            debug!(entity_type = %entity_type, entity_id = %id, "updated");
            return row_to_record(&row, schema);
        }

        match (expected, self.fetch_version(&pool, entity_type, id).await?) {
            (Some(expected), Some(actual)) => {
                warn!(entity_type = %entity_type, entity_id = %id, expected, actual, "version conflict");
                Err(ProviderError::concurrency_conflict(
                    entity_type.as_str(),
                    id,
                    expected.to_string(),
                    actual.to_string(),
                ))
            }
            _ => Err(ProviderError::not_found(entity_type.as_str(), id)),
        }
    }

    async fn delete(&self, entity_type: &EntityMetadataType, id: &str) -> ProviderResult<()> {
        self.schemas.require(entity_type)?;
        let pool = self.pool()?;
        let sql = format!("DELETE FROM {} WHERE {ID_COLUMN} = $1", self.table(entity_type));
        let result = sqlx::query(&sql)
            .bind(id)
            .execute(pool.as_ref())
            .await
            .map_err(|e| sql_err(&e))?;
        if result.rows_affected() == 0 {
            return Err(ProviderError::not_found(entity_type.as_str(), id));
        }
        debug!(entity_type = %entity_type, entity_id = %id, "deleted");
        Ok(())
    }

    async fn query(&self, descriptor: &QueryDescriptor) -> ProviderResult<QueryPage> {
        let schema = self.schemas.require(&descriptor.entity_type)?;
        let page_size = descriptor.validate(Some(schema))?;
        let position = self.tokens.resume(descriptor)?;
        let pool = self.pool()?;

        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "SELECT {} FROM {} WHERE TRUE",
            select_columns(schema),
            self.table(&descriptor.entity_type)
        ));
        for clause in &descriptor.clauses {
            let field_type = schema.field_type(&clause.field).ok_or_else(|| {
                ProviderError::invalid_query(format!("unknown field '{}'", clause.field))
            })?;
            push_clause(&mut qb, clause, field_type)?;
        }

        let limit = i64::try_from(page_size + 1)
            .map_err(|_| ProviderError::invalid_query("page size out of range"))?;
        let mut offset = 0u64;
        match (&descriptor.sort, position) {
            (None, position) => {
                match position {
                    None => {}
                    Some(CursorPosition::AfterKey(key)) => {
                        qb.push(format!(" AND {ID_COLUMN} COLLATE \"C\" > ")).push_bind(key);
                    }
                    Some(_) => {
                        return Err(ProviderError::invalid_query(
                            "continuation token does not match an unsorted query",
                        ))
                    }
                }
                qb.push(format!(" ORDER BY {ID_COLUMN} COLLATE \"C\" LIMIT ")).push_bind(limit);
            }
            (Some(sort), position) => {
                offset = match position {
                    None => 0,
                    Some(CursorPosition::Offset(n)) => n,
                    Some(_) => {
                        return Err(ProviderError::invalid_query(
                            "continuation token does not match a sorted query",
                        ))
                    }
                };
                let field_type = schema.field_type(&sort.field).ok_or_else(|| {
                    ProviderError::invalid_query(format!("unknown sort field '{}'", sort.field))
                })?;
                let direction = match sort.direction {
                    SortDirection::Asc => "ASC NULLS LAST",
                    SortDirection::Desc => "DESC NULLS FIRST",
                };
                qb.push(format!(
                    " ORDER BY {} {direction}, {ID_COLUMN} COLLATE \"C\" ASC LIMIT ",
                    comparable(&sort.field, field_type)
                ))
                .push_bind(limit)
                .push(" OFFSET ")
                .push_bind(
                    i64::try_from(offset)
                        .map_err(|_| ProviderError::invalid_query("continuation offset out of range"))?,
                );
            }
        }

        let rows = qb
            .build()
            .fetch_all(pool.as_ref())
            .await
            .map_err(|e| sql_err(&e))?;
        let has_more = rows.len() > page_size;
        let items = rows
            .iter()
            .take(page_size)
            .map(|row| row_to_record(row, schema))
            .collect::<ProviderResult<Vec<_>>>()?;

        let next = match (&descriptor.sort, items.last()) {
            (_, None) => None,
            _ if !has_more => None,
            (None, Some(last)) => Some(CursorPosition::AfterKey(last.entity_id.clone())),
            (Some(_), Some(_)) => Some(CursorPosition::Offset(offset + items.len() as u64)),
        };
        let continuation = next
            .map(|position| self.tokens.issue(descriptor, position))
            .transpose()?;
        debug!(entity_type = %descriptor.entity_type, returned = items.len(), more = continuation.is_some(), "query");
        Ok(QueryPage { items, continuation })
    }

    async fn clear_type(&self, entity_type: &EntityMetadataType) -> ProviderResult<ClearReport> {
        self.schemas.require(entity_type)?;
        let pool = self.pool()?;
        let sql = format!("DELETE FROM {}", self.table(entity_type));
        let result = sqlx::query(&sql)
            .execute(pool.as_ref())
            .await
            .map_err(|e| sql_err(&e))?;
        let deleted = result.rows_affected();
        info!(entity_type = %entity_type, deleted, "cleared entity type");
        Ok(ClearReport { deleted })
    }

    async fn close(&self) -> ProviderResult<()> {
        let _guard = self.init_lock.lock().await;
        if let Some(pool) = self.pool.swap(None) {
            pool.close().await;
            info!(provider = "postgres", "entity metadata provider closed");
        }
        Ok(())
    }
}
