use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use metastore_core::{
    EntityMetadata, EntityMetadataType, EntityUpdate, FieldMap, ProviderError, ProviderResult,
    QueryDescriptor, QueryPage,
};

/// The storage backends a provider can be built on.
///
/// A closed set: the factory selects one variant at startup and the choice
/// never changes for the life of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    /// Process-local map. The default when no provider is configured.
    Memory,
    /// Partition/row-key table store (redb).
    Table,
    /// Relational store (`PostgreSQL`).
    Postgres,
}

impl ProviderKind {
    /// Every kind, in configuration-name order.
    pub const ALL: [ProviderKind; 3] = [Self::Memory, Self::Table, Self::Postgres];

    /// The configuration name (`memory`, `table`, `postgres`).
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Table => "table",
            Self::Postgres => "postgres",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = ProviderError;

    /// Parses a configuration name. Names match exactly: `memory`, `table`
    /// or `postgres`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| {
                ProviderError::configuration(format!(
                    "{s} EntityMetadataProvider not implemented (expected one of: memory, table, postgres)"
                ))
            })
    }
}

/// Outcome of [`EntityMetadataProvider::clear_type`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClearReport {
    /// Number of records removed.
    pub deleted: u64,
}

/// Uniform storage contract for entity metadata.
///
/// Every backend implements the same operation set with the same semantics,
/// so metadata stores built on top never know which backend is active.
/// Call [`initialize()`](Self::initialize) once before anything else and keep
/// the instance for the life of the process.
///
/// Used as `Arc<dyn EntityMetadataProvider>`.
#[async_trait]
pub trait EntityMetadataProvider: Send + Sync {
    /// Which backend this provider stores into.
    fn kind(&self) -> ProviderKind;

    /// One-time setup: open pools, create tables, validate schemas.
    ///
    /// Idempotent once it has succeeded. Fails with `BackendUnavailable` or
    /// `Configuration`.
    async fn initialize(&self) -> ProviderResult<()>;

    /// Loads one record. Fails with `NotFound` if absent.
    async fn get(&self, entity_type: &EntityMetadataType, id: &str)
        -> ProviderResult<EntityMetadata>;

    /// Inserts a new record and returns it with its assigned version.
    /// Fails with `Conflict` if `(entity_type, id)` already exists.
    async fn create(
        &self,
        entity_type: &EntityMetadataType,
        id: &str,
        fields: FieldMap,
    ) -> ProviderResult<EntityMetadata>;

    /// Replaces or merges fields of an existing record.
    ///
    /// Fails with `NotFound` if absent, and with `ConcurrencyConflict` if
    /// `update.expected_version` is set and differs from the stored version.
    /// Without an expected version the last write wins.
    async fn update(
        &self,
        entity_type: &EntityMetadataType,
        id: &str,
        update: EntityUpdate,
    ) -> ProviderResult<EntityMetadata>;

    /// Deletes one record. Fails with `NotFound` if absent.
    async fn delete(&self, entity_type: &EntityMetadataType, id: &str) -> ProviderResult<()>;

    /// Returns one page of records matching the descriptor.
    async fn query(&self, descriptor: &QueryDescriptor) -> ProviderResult<QueryPage>;

    /// Deletes every record of a type. Intended for tests and resets.
    ///
    /// If the backend cannot finish, returns `PartialClear` with the number
    /// of records already deleted.
    async fn clear_type(&self, entity_type: &EntityMetadataType) -> ProviderResult<ClearReport>;

    /// Releases connections and handles. Called once at process shutdown.
    async fn close(&self) -> ProviderResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_names_match_exactly() {
        assert_eq!("memory".parse::<ProviderKind>().unwrap(), ProviderKind::Memory);
        assert_eq!("table".parse::<ProviderKind>().unwrap(), ProviderKind::Table);
        assert_eq!("postgres".parse::<ProviderKind>().unwrap(), ProviderKind::Postgres);
        for name in ["Memory", " table", "POSTGRES", "memory "] {
            let err = name.parse::<ProviderKind>().unwrap_err();
            assert!(matches!(err, ProviderError::Configuration { .. }), "{name:?}");
        }
    }

    #[test]
    fn unknown_kind_is_configuration_error() {
        let err = "nosuch".parse::<ProviderKind>().unwrap_err();
        assert!(matches!(err, ProviderError::Configuration { .. }));
        assert!(err.to_string().contains("nosuch EntityMetadataProvider not implemented"));
    }

    #[test]
    fn kind_display_round_trips() {
        for kind in ProviderKind::ALL {
            assert_eq!(kind.to_string().parse::<ProviderKind>().unwrap(), kind);
        }
    }
}
