//! [`EntityMetadataProvider`] over a partition/row-key table store (redb).
//!
//! All entity types share one table keyed by `(partition, row)` where the
//! partition is the entity type and the row key is the entity id. Values are
//! MessagePack-encoded [`TableRow`]s holding an `ETag` and typed properties.
//!
//! redb is synchronous, so every operation runs on the blocking pool inside a
//! single transaction. Write transactions are serialized by redb, which makes
//! the read-compare-write of an `ETag`-conditioned update atomic. If the caller
//! drops the future the blocking task still commits or rolls back on its own.

use std::ops::Bound;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use metastore_core::query::slice_page;
use metastore_core::types::validate_entity_id;
use metastore_core::{
    CursorPosition, EntityMetadata, EntityMetadataType, EntityUpdate, EntityVersion, FieldMap,
    FieldSchema, ProviderError, ProviderResult, QueryDescriptor, QueryPage, SchemaRegistry,
    TokenIssuer, UpdateMode, ValidationMode,
};
use redb::backends::InMemoryBackend;
use redb::{Database, ReadableTable, TableDefinition, TableError};
use tracing::{debug, info, warn};

use crate::config::TableProviderOptions;
use crate::mapper::table::{from_properties, to_properties, TableRow};
use crate::traits::{ClearReport, EntityMetadataProvider, ProviderKind};

/// Rows deleted per write transaction by `clear_type`.
const CLEAR_BATCH_SIZE: usize = 100;

type RowTable<'a> = TableDefinition<'a, (&'static str, &'static str), &'static [u8]>;

fn row_table(name: &str) -> RowTable<'_> {
    TableDefinition::new(name)
}

fn storage_err(e: impl Into<redb::Error>) -> ProviderError {
    ProviderError::backend(format!("table store: {}", e.into()))
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
}

fn new_etag() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn decode_record(schema: &FieldSchema, id: &str, bytes: &[u8]) -> ProviderResult<EntityMetadata> {
    let row = TableRow::decode(bytes, schema.entity_type.as_str(), id)?;
    let fields = from_properties(&row.properties, schema, id)?;
    Ok(EntityMetadata {
        entity_type: schema.entity_type.clone(),
        entity_id: id.to_string(),
        version: Some(EntityVersion::new(row.etag)),
        fields,
    })
}

fn encode_row(fields: &FieldMap) -> ProviderResult<(String, Vec<u8>)> {
    let row = TableRow {
        etag: new_etag(),
        timestamp: now_millis(),
        properties: to_properties(fields)?,
    };
    let bytes = row.encode()?;
    Ok((row.etag, bytes))
}

/// Entity metadata in a redb table, on disk or in memory.
///
/// Every entity type must have a registered [`FieldSchema`]; string arrays
/// are decoded through it.
pub struct TableEntityMetadataProvider {
    path: Option<PathBuf>,
    table_name: Arc<str>,
    schemas: SchemaRegistry,
    db: ArcSwapOption<Database>,
    init_lock: tokio::sync::Mutex<()>,
    tokens: TokenIssuer,
}

impl TableEntityMetadataProvider {
    /// Builds an unopened provider. No I/O happens until
    /// [`initialize`](EntityMetadataProvider::initialize).
    #[must_use]
    pub fn new(options: TableProviderOptions, schemas: SchemaRegistry) -> Self {
        Self {
            path: options.database_path,
            table_name: Arc::from(options.table_name.as_str()),
            schemas,
            db: ArcSwapOption::empty(),
            init_lock: tokio::sync::Mutex::new(()),
            tokens: TokenIssuer::new(ProviderKind::Table.as_str(), uuid::Uuid::new_v4().to_string()),
        }
    }

    fn database(&self) -> ProviderResult<Arc<Database>> {
        self.db
            .load_full()
            .ok_or_else(|| ProviderError::unavailable("table provider is not initialized"))
    }

    fn schema(&self, entity_type: &EntityMetadataType) -> ProviderResult<FieldSchema> {
        self.schemas.require(entity_type).cloned()
    }

    /// Runs `op` on the blocking pool with the open database and table name.
    async fn blocking<T, F>(&self, op: F) -> ProviderResult<T>
    where
        F: FnOnce(&Database, &str) -> ProviderResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.database()?;
        let table = Arc::clone(&self.table_name);
        tokio::task::spawn_blocking(move || op(&db, &table))
            .await
            .map_err(|e| ProviderError::backend(format!("table store task failed: {e}")))?
    }
}

fn open_database(path: Option<&PathBuf>, table: &str) -> ProviderResult<Database> {
    let db = match path {
        Some(path) => Database::create(path).map_err(|e| {
            ProviderError::unavailable(format!("open table store {}: {e}", path.display()))
        })?,
        None => Database::builder()
            .create_with_backend(InMemoryBackend::new())
            .map_err(|e| ProviderError::unavailable(format!("open in-memory table store: {e}")))?,
    };
    let txn = db.begin_write().map_err(storage_err)?;
    txn.open_table(row_table(table)).map_err(storage_err)?;
    txn.commit().map_err(storage_err)?;
    Ok(db)
}

#[async_trait]
impl EntityMetadataProvider for TableEntityMetadataProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Table
    }

    async fn initialize(&self) -> ProviderResult<()> {
        let _guard = self.init_lock.lock().await;
        if self.db.load().is_some() {
            return Ok(());
        }
        self.schemas.check_definitions()?;

        let path = self.path.clone();
        let table = Arc::clone(&self.table_name);
        let db = tokio::task::spawn_blocking(move || open_database(path.as_ref(), &table))
            .await
            .map_err(|e| ProviderError::backend(format!("table store task failed: {e}")))??;
        self.db.store(Some(Arc::new(db)));

        info!(
            provider = "table",
            table = %self.table_name,
            path = ?self.path,
            schemas = self.schemas.len(),
            "entity metadata provider ready"
        );
        Ok(())
    }

    async fn get(&self, entity_type: &EntityMetadataType, id: &str) -> ProviderResult<EntityMetadata> {
        let schema = self.schema(entity_type)?;
        let id = id.to_string();
        self.blocking(move |db, table| {
            let txn = db.begin_read().map_err(storage_err)?;
            let rows = txn.open_table(row_table(table)).map_err(storage_err)?;
            let partition = schema.entity_type.as_str();
            let bytes = rows
                .get((partition, id.as_str()))
                .map_err(storage_err)?
                .map(|guard| guard.value().to_vec())
                .ok_or_else(|| ProviderError::not_found(partition, &id))?;
            decode_record(&schema, &id, &bytes)
        })
        .await
    }

    async fn create(
        &self,
        entity_type: &EntityMetadataType,
        id: &str,
        fields: FieldMap,
    ) -> ProviderResult<EntityMetadata> {
        validate_entity_id(id)?;
        let schema = self.schema(entity_type)?;
        self.schemas.validate(entity_type, &fields, ValidationMode::Full)?;

        let key = id.to_string();
        let record = self
            .blocking(move |db, table| {
                let partition = schema.entity_type.as_str();
                let txn = db.begin_write().map_err(storage_err)?;
                let etag = {
                    let mut rows = txn.open_table(row_table(table)).map_err(storage_err)?;
                    if rows.get((partition, key.as_str())).map_err(storage_err)?.is_some() {
                        return Err(ProviderError::conflict(partition, &key));
                    }
                    let (etag, bytes) = encode_row(&fields)?;
                    rows.insert((partition, key.as_str()), bytes.as_slice())
                        .map_err(storage_err)?;
                    etag
                };
                txn.commit().map_err(storage_err)?;
                Ok(EntityMetadata {
                    entity_type: schema.entity_type.clone(),
                    entity_id: key,
                    version: Some(EntityVersion::new(etag)),
                    fields,
                })
            })
            .await;
        match &record {
            Ok(_) => debug!(entity_type = %entity_type, entity_id = %id, "created"),
            Err(ProviderError::Conflict { .. }) => {
                warn!(entity_type = %entity_type, entity_id = %id, "create conflict");
            }
            Err(_) => {}
        }
        record
    }

    async fn update(
        &self,
        entity_type: &EntityMetadataType,
        id: &str,
        update: EntityUpdate,
    ) -> ProviderResult<EntityMetadata> {
        let schema = self.schema(entity_type)?;
        let mode = match update.mode {
            UpdateMode::Replace => ValidationMode::Full,
            UpdateMode::Merge => ValidationMode::Partial,
        };
        self.schemas.validate(entity_type, &update.fields, mode)?;

        let id = id.to_string();
        let result = self
            .blocking(move |db, table| {
                let partition = schema.entity_type.as_str();
                let txn = db.begin_write().map_err(storage_err)?;
                let record = {
                    let mut rows = txn.open_table(row_table(table)).map_err(storage_err)?;
                    let existing = rows
                        .get((partition, id.as_str()))
                        .map_err(storage_err)?
                        .map(|bytes| bytes.value().to_vec())
                        .ok_or_else(|| ProviderError::not_found(partition, &id))?;
                    let mut record = decode_record(&schema, &id, &existing)?;

                    if let (Some(expected), Some(actual)) = (&update.expected_version, &record.version) {
                        if expected != actual {
                            return Err(ProviderError::concurrency_conflict(
                                partition,
                                &id,
                                expected.as_str(),
                                actual.as_str(),
                            ));
                        }
                    }

                    update.apply_to(&mut record.fields);
                    let (etag, bytes) = encode_row(&record.fields)?;
                    rows.insert((partition, id.as_str()), bytes.as_slice())
                        .map_err(storage_err)?;
                    record.version = Some(EntityVersion::new(etag));
                    record
                };
                txn.commit().map_err(storage_err)?;
                Ok(record)
            })
            .await;
        match &result {
            Ok(record) => debug!(entity_type = %entity_type, entity_id = %record.entity_id, "updated"),
            Err(ProviderError::ConcurrencyConflict { entity_id, expected, actual, .. }) => {
                warn!(entity_type = %entity_type, entity_id = %entity_id, %expected, %actual, "etag mismatch");
            }
            Err(_) => {}
        }
        result
    }

    async fn delete(&self, entity_type: &EntityMetadataType, id: &str) -> ProviderResult<()> {
        let partition = self.schema(entity_type)?.entity_type;
        let id = id.to_string();
        self.blocking(move |db, table| {
            let txn = db.begin_write().map_err(storage_err)?;
            let mut rows = txn.open_table(row_table(table)).map_err(storage_err)?;
            let removed = rows
                .remove((partition.as_str(), id.as_str()))
                .map_err(storage_err)?
                .is_some();
            drop(rows);
            if !removed {
                return Err(ProviderError::not_found(partition.as_str(), &id));
            }
            txn.commit().map_err(storage_err)?;
            debug!(entity_type = %partition, entity_id = %id, "deleted");
            Ok(())
        })
        .await
    }

    async fn query(&self, descriptor: &QueryDescriptor) -> ProviderResult<QueryPage> {
        let schema = self.schema(&descriptor.entity_type)?;
        let page_size = descriptor.validate(Some(&schema))?;
        let position = self.tokens.resume(descriptor)?;

        let (after, offset) = match (&descriptor.sort, position) {
            (_, None) => (None, 0),
            (None, Some(CursorPosition::AfterKey(key))) => (Some(key), 0),
            (Some(_), Some(CursorPosition::Offset(n))) => (
                None,
                usize::try_from(n)
                    .map_err(|_| ProviderError::invalid_query("continuation offset out of range"))?,
            ),
            _ => {
                return Err(ProviderError::invalid_query(
                    "continuation token does not match this query",
                ))
            }
        };

        let query = descriptor.clone();
        let (items, next) = self
            .blocking(move |db, table| {
                let txn = db.begin_read().map_err(storage_err)?;
                let rows = txn.open_table(row_table(table)).map_err(storage_err)?;
                let partition = schema.entity_type.as_str();
                let start = match &after {
                    Some(key) => Bound::Excluded((partition, key.as_str())),
                    None => Bound::Included((partition, "")),
                };
                // Unsorted pages stop one record early to learn whether more follow.
                let limit = if query.sort.is_some() { usize::MAX } else { page_size + 1 };

                let mut matched = Vec::new();
                for entry in rows.range((start, Bound::Unbounded)).map_err(storage_err)? {
                    let (key, value) = entry.map_err(storage_err)?;
                    let (row_partition, row_key) = key.value();
                    if row_partition != partition {
                        break;
                    }
                    let record = decode_record(&schema, row_key, value.value())?;
                    if query.matches(&record) {
                        matched.push(record);
                        if matched.len() == limit {
                            break;
                        }
                    }
                }

                match &query.sort {
                    Some(sort) => {
                        matched.sort_by(|a, b| sort.compare(a, b));
                        let (items, next) = slice_page(matched, offset, page_size);
                        Ok((items, next.map(CursorPosition::Offset)))
                    }
                    None => {
                        let has_more = matched.len() > page_size;
                        matched.truncate(page_size);
                        let next = match matched.last() {
                            Some(last) if has_more => {
                                Some(CursorPosition::AfterKey(last.entity_id.clone()))
                            }
                            _ => None,
                        };
                        Ok((matched, next))
                    }
                }
            })
            .await?;

        let continuation = next
            .map(|position| self.tokens.issue(descriptor, position))
            .transpose()?;
        debug!(entity_type = %descriptor.entity_type, returned = items.len(), more = continuation.is_some(), "query");
        Ok(QueryPage { items, continuation })
    }

    async fn clear_type(&self, entity_type: &EntityMetadataType) -> ProviderResult<ClearReport> {
        let partition = self.schema(entity_type)?.entity_type;
        let report = self
            .blocking(move |db, table| {
                clear_in_batches(partition.as_str(), || delete_batch(db, table, partition.as_str()))
            })
            .await;
        match &report {
            Ok(report) => info!(entity_type = %entity_type, deleted = report.deleted, "cleared entity type"),
            Err(e) => warn!(entity_type = %entity_type, error = %e, "clear failed"),
        }
        report
    }

    async fn close(&self) -> ProviderResult<()> {
        let _guard = self.init_lock.lock().await;
        if self.db.swap(None).is_some() {
            info!(provider = "table", table = %self.table_name, "entity metadata provider closed");
        }
        Ok(())
    }
}

/// Runs `batch` until it deletes nothing. A failure after at least one
/// committed batch becomes [`ProviderError::PartialClear`].
fn clear_in_batches(
    entity_type: &str,
    mut batch: impl FnMut() -> ProviderResult<usize>,
) -> ProviderResult<ClearReport> {
    let mut deleted = 0u64;
    loop {
        match batch() {
            Ok(0) => return Ok(ClearReport { deleted }),
            Ok(n) => deleted += n as u64,
            Err(e) if deleted == 0 => return Err(e),
            Err(e) => {
                return Err(ProviderError::PartialClear {
                    entity_type: entity_type.to_string(),
                    deleted,
                    message: e.to_string(),
                })
            }
        }
    }
}

/// Deletes up to [`CLEAR_BATCH_SIZE`] rows of a partition in one write
/// transaction and returns how many went.
fn delete_batch(db: &Database, table: &str, partition: &str) -> ProviderResult<usize> {
    let txn = db.begin_write().map_err(storage_err)?;
    let count = {
        let mut rows = match txn.open_table(row_table(table)) {
            Ok(rows) => rows,
            Err(TableError::TableDoesNotExist(_)) => return Ok(0),
            Err(e) => return Err(storage_err(e)),
        };
        let mut ids = Vec::with_capacity(CLEAR_BATCH_SIZE);
        for entry in rows
            .range((Bound::Included((partition, "")), Bound::Unbounded))
            .map_err(storage_err)?
        {
            let (key, _) = entry.map_err(storage_err)?;
            let (row_partition, row_key) = key.value();
            if row_partition != partition || ids.len() == CLEAR_BATCH_SIZE {
                break;
            }
            ids.push(row_key.to_string());
        }
        for id in &ids {
            rows.remove((partition, id.as_str())).map_err(storage_err)?;
        }
        ids.len()
    };
    txn.commit().map_err(storage_err)?;
    Ok(count)
}
