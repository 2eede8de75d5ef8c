//! In-process [`EntityMetadataProvider`] backed by [`DashMap`].
//!
//! Each entity type gets its own shard entry holding an id → record map.
//! Every mutation runs under that entry's lock with no await in between, so
//! a record is never observed half-written. Versions come from one global
//! write sequence, which also keeps a re-created record from matching a
//! version handed out before it was deleted.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use metastore_core::query::slice_page;
use metastore_core::types::validate_entity_id;
use metastore_core::{
    CursorPosition, EntityMetadata, EntityMetadataType, EntityUpdate, EntityVersion, FieldMap,
    ProviderError, ProviderResult, QueryDescriptor, QueryPage, SchemaRegistry, TokenIssuer,
    UpdateMode, ValidationMode,
};
use tracing::{debug, info, warn};

use crate::traits::{ClearReport, EntityMetadataProvider, ProviderKind};

#[derive(Debug, Clone)]
struct StoredEntity {
    /// Sequence number of the create; defines natural (insertion) order.
    inserted: u64,
    /// Sequence number of the last write.
    version: u64,
    fields: FieldMap,
}

impl StoredEntity {
    fn to_record(&self, entity_type: &EntityMetadataType, id: &str) -> EntityMetadata {
        EntityMetadata {
            entity_type: entity_type.clone(),
            entity_id: id.to_string(),
            version: Some(EntityVersion::new(self.version.to_string())),
            fields: self.fields.clone(),
        }
    }
}

/// Entity metadata held in process memory.
///
/// Suitable for development and tests. Field maps are validated against
/// registered schemas exactly like the typed backends do.
pub struct MemoryEntityMetadataProvider {
    types: DashMap<EntityMetadataType, HashMap<String, StoredEntity>>,
    sequence: AtomicU64,
    schemas: SchemaRegistry,
    tokens: TokenIssuer,
}

impl MemoryEntityMetadataProvider {
    #[must_use]
    pub fn new(schemas: SchemaRegistry) -> Self {
        Self {
            types: DashMap::new(),
            sequence: AtomicU64::new(0),
            schemas,
            tokens: TokenIssuer::new(
                ProviderKind::Memory.as_str(),
                uuid::Uuid::new_v4().to_string(),
            ),
        }
    }

    /// Number of records currently stored for a type.
    #[must_use]
    pub fn len(&self, entity_type: &EntityMetadataType) -> usize {
        self.types.get(entity_type).map_or(0, |bucket| bucket.len())
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed) + 1
    }
}

impl Default for MemoryEntityMetadataProvider {
    fn default() -> Self {
        Self::new(SchemaRegistry::new())
    }
}

#[async_trait]
impl EntityMetadataProvider for MemoryEntityMetadataProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Memory
    }

    async fn initialize(&self) -> ProviderResult<()> {
        self.schemas.check_definitions()?;
        info!(provider = "memory", schemas = self.schemas.len(), "entity metadata provider ready");
        Ok(())
    }

    async fn get(&self, entity_type: &EntityMetadataType, id: &str) -> ProviderResult<EntityMetadata> {
        self.types
            .get(entity_type)
            .and_then(|bucket| bucket.get(id).map(|stored| stored.to_record(entity_type, id)))
            .ok_or_else(|| ProviderError::not_found(entity_type.as_str(), id))
    }

    async fn create(
        &self,
        entity_type: &EntityMetadataType,
        id: &str,
        fields: FieldMap,
    ) -> ProviderResult<EntityMetadata> {
        validate_entity_id(id)?;
        self.schemas.validate(entity_type, &fields, ValidationMode::Full)?;

        let mut bucket = self.types.entry(entity_type.clone()).or_default();
        match bucket.entry(id.to_string()) {
            Entry::Occupied(_) => {
                warn!(entity_type = %entity_type, entity_id = %id, "create conflict");
                Err(ProviderError::conflict(entity_type.as_str(), id))
            }
            Entry::Vacant(slot) => {
                let seq = self.next_sequence();
                let stored = slot.insert(StoredEntity {
                    inserted: seq,
                    version: seq,
                    fields,
                });
                debug!(entity_type = %entity_type, entity_id = %id, version = seq, "created");
                Ok(stored.to_record(entity_type, id))
            }
        }
    }

    async fn update(
        &self,
        entity_type: &EntityMetadataType,
        id: &str,
        update: EntityUpdate,
    ) -> ProviderResult<EntityMetadata> {
        let mode = match update.mode {
            UpdateMode::Replace => ValidationMode::Full,
            UpdateMode::Merge => ValidationMode::Partial,
        };
        self.schemas.validate(entity_type, &update.fields, mode)?;

        let mut bucket = self
            .types
            .get_mut(entity_type)
            .ok_or_else(|| ProviderError::not_found(entity_type.as_str(), id))?;
        let stored = bucket
            .get_mut(id)
            .ok_or_else(|| ProviderError::not_found(entity_type.as_str(), id))?;

        if let Some(expected) = &update.expected_version {
            let actual = stored.version.to_string();
            if expected.as_str() != actual {
                warn!(entity_type = %entity_type, entity_id = %id, %expected, %actual, "version conflict");
                return Err(ProviderError::concurrency_conflict(
                    entity_type.as_str(),
                    id,
                    expected.as_str(),
                    actual,
                ));
            }
        }

        update.apply_to(&mut stored.fields);
        stored.version = self.next_sequence();
        debug!(entity_type = %entity_type, entity_id = %id, version = stored.version, "updated");
        Ok(stored.to_record(entity_type, id))
    }

    async fn delete(&self, entity_type: &EntityMetadataType, id: &str) -> ProviderResult<()> {
        let removed = self
            .types
            .get_mut(entity_type)
            .and_then(|mut bucket| bucket.remove(id));
        match removed {
            Some(_) => {
                debug!(entity_type = %entity_type, entity_id = %id, "deleted");
                Ok(())
            }
            None => Err(ProviderError::not_found(entity_type.as_str(), id)),
        }
    }

    async fn query(&self, descriptor: &QueryDescriptor) -> ProviderResult<QueryPage> {
        let page_size = descriptor.validate(self.schemas.get(&descriptor.entity_type))?;
        let position = self.tokens.resume(descriptor)?;

        let mut matches: Vec<(u64, EntityMetadata)> = match self.types.get(&descriptor.entity_type) {
            Some(bucket) => bucket
                .iter()
                .map(|(id, stored)| (stored.inserted, stored.to_record(&descriptor.entity_type, id)))
                .filter(|(_, record)| descriptor.matches(record))
                .collect(),
            None => Vec::new(),
        };

        if let Some(sort) = &descriptor.sort {
            let offset = match position {
                None => 0,
                Some(CursorPosition::Offset(n)) => usize::try_from(n)
                    .map_err(|_| ProviderError::invalid_query("continuation offset out of range"))?,
                Some(_) => {
                    return Err(ProviderError::invalid_query(
                        "continuation token does not match a sorted query",
                    ))
                }
            };
            let mut records: Vec<EntityMetadata> = matches.into_iter().map(|(_, r)| r).collect();
            records.sort_by(|a, b| sort.compare(a, b));
            let (items, next) = slice_page(records, offset, page_size);
            let continuation = next
                .map(|n| self.tokens.issue(descriptor, CursorPosition::Offset(n)))
                .transpose()?;
            return Ok(QueryPage { items, continuation });
        }

        let after = match position {
            None => 0,
            Some(CursorPosition::AfterSequence(seq)) => seq,
            Some(_) => {
                return Err(ProviderError::invalid_query(
                    "continuation token does not match an unsorted query",
                ))
            }
        };
        matches.retain(|(inserted, _)| *inserted > after);
        matches.sort_by_key(|(inserted, _)| *inserted);

        let has_more = matches.len() > page_size;
        matches.truncate(page_size);
        let continuation = match matches.last() {
            Some((last, _)) if has_more => Some(
                self.tokens
                    .issue(descriptor, CursorPosition::AfterSequence(*last))?,
            ),
            _ => None,
        };
        Ok(QueryPage {
            items: matches.into_iter().map(|(_, r)| r).collect(),
            continuation,
        })
    }

    async fn clear_type(&self, entity_type: &EntityMetadataType) -> ProviderResult<ClearReport> {
        let deleted = self
            .types
            .remove(entity_type)
            .map_or(0, |(_, bucket)| bucket.len() as u64);
        info!(entity_type = %entity_type, deleted, "cleared entity type");
        Ok(ClearReport { deleted })
    }

    async fn close(&self) -> ProviderResult<()> {
        info!(provider = "memory", "entity metadata provider closed");
        Ok(())
    }
}
