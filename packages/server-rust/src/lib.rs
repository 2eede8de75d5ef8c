//! Metastore Server: entity metadata providers over memory, a redb table
//! store, and `PostgreSQL`, selected at startup through one factory.

pub mod config;
pub mod factory;
pub mod health;
pub mod mapper;
pub mod providers;
pub mod stream;
pub mod traits;

#[cfg(test)]
pub(crate) mod conformance;

pub use config::{
    EntityMetadataProvidersOptions, PostgresProviderOptions, ProviderArgs, TableProviderOptions,
};
pub use factory::{
    create_and_initialize_entity_metadata_provider, create_entity_metadata_provider, resolve_kind,
};
pub use health::{initialize_provider, shutdown_provider, HealthState, ReadinessGate};
pub use stream::{query_pages, query_stream};
pub use traits::{ClearReport, EntityMetadataProvider, ProviderKind};
