//! Provider construction from configuration.
//!
//! The backend is chosen once, at startup. Construction performs no I/O;
//! [`create_and_initialize_entity_metadata_provider`] additionally awaits
//! `initialize()` and never hands out a provider whose initialization failed.

use std::sync::Arc;

use metastore_core::{ProviderError, ProviderResult, SchemaRegistry};
use tracing::{error, info, warn};

use crate::config::{EntityMetadataProvidersOptions, PostgresProviderOptions, TableProviderOptions};
use crate::providers::MemoryEntityMetadataProvider;
use crate::traits::{EntityMetadataProvider, ProviderKind};

/// Maps a configured provider name to a [`ProviderKind`].
///
/// Unset or empty selects [`ProviderKind::Memory`].
///
/// # Errors
///
/// Returns [`ProviderError::Configuration`] for an unrecognized name.
pub fn resolve_kind(name: Option<&str>) -> ProviderResult<ProviderKind> {
    match name {
        None | Some("") => Ok(ProviderKind::Memory),
        Some(name) => name.parse(),
    }
}

/// Builds the configured provider without touching the backend.
///
/// # Errors
///
/// Returns [`ProviderError::Configuration`] for an unknown provider name,
/// missing or invalid backend options, or a backend whose cargo feature is
/// not enabled.
pub fn create_entity_metadata_provider(
    options: EntityMetadataProvidersOptions,
) -> ProviderResult<Arc<dyn EntityMetadataProvider>> {
    let kind = resolve_kind(options.provider_type_name.as_deref())?;
    let provider: Arc<dyn EntityMetadataProvider> = match kind {
        ProviderKind::Memory => Arc::new(MemoryEntityMetadataProvider::new(options.schemas)),
        ProviderKind::Table => table_provider(options.table_options, options.schemas)?,
        ProviderKind::Postgres => postgres_provider(options.postgres_options, options.schemas)?,
    };
    info!(provider = %kind, "entity metadata provider constructed");
    Ok(provider)
}

/// Builds and initializes a provider.
///
/// A non-empty `override_type` replaces the configured provider name. If
/// `initialize()` fails the provider is closed and the error returned.
///
/// # Errors
///
/// Any construction error, or the error `initialize()` returned.
pub async fn create_and_initialize_entity_metadata_provider(
    mut options: EntityMetadataProvidersOptions,
    override_type: Option<&str>,
) -> ProviderResult<Arc<dyn EntityMetadataProvider>> {
    if let Some(name) = override_type.filter(|name| !name.is_empty()) {
        options.provider_type_name = Some(name.to_string());
    }
    let provider = create_entity_metadata_provider(options)?;
    if let Err(e) = provider.initialize().await {
        error!(provider = %provider.kind(), error = %e, "entity metadata provider failed to initialize");
        if let Err(close_err) = provider.close().await {
            warn!(provider = %provider.kind(), error = %close_err, "close after failed initialize");
        }
        return Err(e);
    }
    Ok(provider)
}

#[cfg(feature = "redb")]
fn table_provider(
    options: Option<TableProviderOptions>,
    schemas: SchemaRegistry,
) -> ProviderResult<Arc<dyn EntityMetadataProvider>> {
    let options = options
        .ok_or_else(|| ProviderError::configuration("table provider requires table options"))?;
    options.validate()?;
    Ok(Arc::new(crate::providers::TableEntityMetadataProvider::new(
        options, schemas,
    )))
}

#[cfg(not(feature = "redb"))]
fn table_provider(
    _options: Option<TableProviderOptions>,
    _schemas: SchemaRegistry,
) -> ProviderResult<Arc<dyn EntityMetadataProvider>> {
    Err(ProviderError::configuration(
        "table provider is not compiled in (enable the `redb` feature)",
    ))
}

#[cfg(feature = "postgres")]
fn postgres_provider(
    options: Option<PostgresProviderOptions>,
    schemas: SchemaRegistry,
) -> ProviderResult<Arc<dyn EntityMetadataProvider>> {
    let options = options
        .ok_or_else(|| ProviderError::configuration("postgres provider requires postgres options"))?;
    options.validate()?;
    Ok(Arc::new(crate::providers::PostgresEntityMetadataProvider::new(
        options, schemas,
    )))
}

#[cfg(not(feature = "postgres"))]
fn postgres_provider(
    _options: Option<PostgresProviderOptions>,
    _schemas: SchemaRegistry,
) -> ProviderResult<Arc<dyn EntityMetadataProvider>> {
    Err(ProviderError::configuration(
        "postgres provider is not compiled in (enable the `postgres` feature)",
    ))
}
