//! Smoke check for a configured entity metadata provider.
//!
//! Initializes the provider selected by flags / environment, runs one
//! create, get, versioned update, delete cycle on a `widget` record, and
//! exits non-zero if any step misbehaves.
//!
//! Usage:
//!   metastore-check --provider table --table-path ./meta.redb
//!   ENTITY_METADATA_PROVIDER=postgres ENTITY_METADATA_POSTGRES_URL=postgres://... metastore-check

use std::io;

use anyhow::{bail, ensure, Context, Result};
use clap::{Parser, ValueEnum};
use metastore_core::types::fields;
use metastore_core::{
    EntityMetadataType, EntityUpdate, FieldSchema, FieldType, FieldValue, ProviderError,
    SchemaRegistry,
};
use metastore_server::{initialize_provider, shutdown_provider, EntityMetadataProvider, ProviderArgs, ReadinessGate};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "metastore-check")]
#[command(about = "Exercise an entity metadata provider end to end")]
struct Cli {
    #[command(flatten)]
    provider: ProviderArgs,

    /// Log output format.
    #[arg(long, env = "METASTORE_LOG_FORMAT", value_enum, default_value = "text")]
    log_format: LogFormat,
}

fn init_logging(format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = fmt().with_env_filter(env_filter).with_target(false).with_writer(io::stderr);
    let _ = match format {
        LogFormat::Text => builder.compact().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
}

fn widget_schemas() -> Result<SchemaRegistry> {
    let widget = EntityMetadataType::new("widget")?;
    Ok(SchemaRegistry::new().with(
        FieldSchema::new(widget)
            .required("name", FieldType::String)
            .field("count", FieldType::Number),
    ))
}

async fn run_scenario(provider: &dyn EntityMetadataProvider) -> Result<()> {
    let widget = EntityMetadataType::new("widget")?;
    let id = format!("check-{}", uuid::Uuid::new_v4());
    let initial = fields([
        ("name", FieldValue::from("Widget")),
        ("count", FieldValue::from(3)),
    ]);

    let created = provider
        .create(&widget, &id, initial.clone())
        .await
        .context("create widget")?;
    let stale_version = created.version.clone().context("created record has no version")?;

    let fetched = provider.get(&widget, &id).await.context("get widget")?;
    ensure!(fetched.fields == initial, "fetched fields differ from created fields");

    provider
        .update(
            &widget,
            &id,
            EntityUpdate::merge(fields([("name", FieldValue::from("Widget v2"))])),
        )
        .await
        .context("unconditional update")?;

    let bump = fields([("count", FieldValue::from(4))]);
    match provider
        .update(&widget, &id, EntityUpdate::merge(bump.clone()).if_version(stale_version))
        .await
    {
        Err(ProviderError::ConcurrencyConflict { .. }) => {}
        Ok(_) => bail!("update with a stale version succeeded"),
        Err(e) => return Err(e).context("update with a stale version"),
    }

    let current = provider.get(&widget, &id).await.context("re-fetch widget")?;
    let version = current.version.context("fetched record has no version")?;
    let updated = provider
        .update(&widget, &id, EntityUpdate::merge(bump).if_version(version))
        .await
        .context("update with the current version")?;
    ensure!(
        updated.field("count") == Some(&FieldValue::Number(4.0)),
        "count was not updated"
    );
    info!(record = %serde_json::to_string(&updated)?, "updated widget");

    provider.delete(&widget, &id).await.context("delete widget")?;
    match provider.get(&widget, &id).await {
        Err(ProviderError::NotFound { .. }) => Ok(()),
        Ok(_) => bail!("widget still present after delete"),
        Err(e) => Err(e).context("get after delete"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_format);

    let options = cli.provider.into_options(widget_schemas()?);
    let gate = ReadinessGate::new();
    let provider = initialize_provider(&gate, options, None)
        .await
        .context("initialize entity metadata provider")?;
    info!(provider = %provider.kind(), state = ?gate.state(), "running widget scenario");

    let outcome = run_scenario(provider.as_ref()).await;
    shutdown_provider(&gate, provider)
        .await
        .context("close entity metadata provider")?;
    outcome?;

    info!("entity metadata provider check passed");
    Ok(())
}
