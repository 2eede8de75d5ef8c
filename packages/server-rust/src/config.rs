//! Provider configuration types.
//!
//! [`EntityMetadataProvidersOptions`] is what the factory consumes. Hosts can
//! fill it by hand or from the command line / environment through
//! [`ProviderArgs`].

use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::Duration;

use clap::Args;
use metastore_core::types::MAX_TYPE_NAME_LEN;
use metastore_core::{ProviderError, ProviderResult, SchemaRegistry};
use regex::Regex;

static IDENTIFIER_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z_][a-z0-9_]*$").unwrap_or_else(|e| panic!("invalid identifier pattern: {e}"))
});

/// Longest `PostgreSQL` identifier.
const MAX_IDENTIFIER_LEN: usize = 63;

/// Top-level configuration bundle for provider construction.
#[derive(Debug, Clone, Default)]
pub struct EntityMetadataProvidersOptions {
    /// `memory`, `table` or `postgres`. Unset or empty selects `memory`.
    pub provider_type_name: Option<String>,
    /// Required when the provider type is `table`.
    pub table_options: Option<TableProviderOptions>,
    /// Required when the provider type is `postgres`.
    pub postgres_options: Option<PostgresProviderOptions>,
    /// Field schemas for every entity type the host stores.
    pub schemas: SchemaRegistry,
}

/// Options for the table-store provider.
#[derive(Debug, Clone)]
pub struct TableProviderOptions {
    /// Database file. `None` keeps the table store in memory.
    pub database_path: Option<PathBuf>,
    /// Name of the table holding every entity type's rows.
    pub table_name: String,
}

impl Default for TableProviderOptions {
    fn default() -> Self {
        Self {
            database_path: None,
            table_name: "entitymetadata".to_string(),
        }
    }
}

impl TableProviderOptions {
    /// # Errors
    ///
    /// Returns [`ProviderError::Configuration`] for an empty table name.
    pub fn validate(&self) -> ProviderResult<()> {
        if self.table_name.trim().is_empty() {
            return Err(ProviderError::configuration(
                "table provider requires a non-empty table name",
            ));
        }
        Ok(())
    }
}

/// Options for the `PostgreSQL` provider.
///
/// No `Default` impl because the connection string has no sensible default.
#[derive(Debug, Clone)]
pub struct PostgresProviderOptions {
    /// `postgres://` or `postgresql://` URL.
    pub connection_string: String,
    /// Schema the entity tables live in.
    pub schema: String,
    /// Prepended to the entity type name to form each table name.
    pub table_prefix: String,
    /// Upper bound on pooled connections.
    pub max_connections: u32,
    /// Maximum time to wait for a pooled connection.
    pub acquire_timeout: Duration,
}

impl PostgresProviderOptions {
    /// Options with default schema, prefix and pool settings.
    #[must_use]
    pub fn new(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
            schema: "public".to_string(),
            table_prefix: "entitymetadata_".to_string(),
            max_connections: 10,
            acquire_timeout: Duration::from_secs(30),
        }
    }

    /// # Errors
    ///
    /// Returns [`ProviderError::Configuration`] for a non-postgres URL, a
    /// schema or prefix that is not a plain lowercase identifier, a prefix
    /// too long to leave room for any type name, or a pool size of zero.
    pub fn validate(&self) -> ProviderResult<()> {
        let url = self.connection_string.trim();
        if !(url.starts_with("postgres://") || url.starts_with("postgresql://")) {
            return Err(ProviderError::configuration(
                "postgres provider requires a postgres:// connection string",
            ));
        }
        if !is_identifier(&self.schema) {
            return Err(ProviderError::configuration(format!(
                "postgres schema '{}' is not a valid identifier",
                self.schema
            )));
        }
        if !self.table_prefix.is_empty() && !is_identifier(&self.table_prefix) {
            return Err(ProviderError::configuration(format!(
                "postgres table prefix '{}' is not a valid identifier",
                self.table_prefix
            )));
        }
        // `<prefix><type>` must not be truncated by the server.
        if self.table_prefix.len() + MAX_TYPE_NAME_LEN > MAX_IDENTIFIER_LEN {
            return Err(ProviderError::configuration(format!(
                "postgres table prefix '{}' is longer than {} characters",
                self.table_prefix,
                MAX_IDENTIFIER_LEN - MAX_TYPE_NAME_LEN
            )));
        }
        if self.max_connections == 0 {
            return Err(ProviderError::configuration(
                "postgres max_connections must be at least 1",
            ));
        }
        Ok(())
    }
}

fn is_identifier(s: &str) -> bool {
    s.len() <= MAX_IDENTIFIER_LEN && IDENTIFIER_PATTERN.is_match(s)
}

/// Command-line / environment binding for provider options.
///
/// Flatten into a host's `clap::Parser` to expose the provider settings.
#[derive(Debug, Clone, Args)]
pub struct ProviderArgs {
    /// Provider type: memory, table or postgres.
    #[arg(long = "provider", env = "ENTITY_METADATA_PROVIDER")]
    pub provider: Option<String>,

    /// Table-store database file (in-memory when omitted).
    #[arg(long, env = "ENTITY_METADATA_TABLE_PATH")]
    pub table_path: Option<PathBuf>,

    /// Table-store table name.
    #[arg(long, env = "ENTITY_METADATA_TABLE_NAME", default_value = "entitymetadata")]
    pub table_name: String,

    /// `PostgreSQL` connection string.
    #[arg(long, env = "ENTITY_METADATA_POSTGRES_URL")]
    pub postgres_url: Option<String>,

    /// `PostgreSQL` schema.
    #[arg(long, env = "ENTITY_METADATA_POSTGRES_SCHEMA", default_value = "public")]
    pub postgres_schema: String,

    /// `PostgreSQL` table name prefix.
    #[arg(
        long,
        env = "ENTITY_METADATA_POSTGRES_TABLE_PREFIX",
        default_value = "entitymetadata_"
    )]
    pub postgres_table_prefix: String,

    /// `PostgreSQL` pool size.
    #[arg(long, env = "ENTITY_METADATA_POSTGRES_MAX_CONNECTIONS", default_value_t = 10)]
    pub postgres_max_connections: u32,
}

impl ProviderArgs {
    /// Builds factory options. Table options are always filled since every
    /// table setting has a default; postgres options only when a URL is set.
    #[must_use]
    pub fn into_options(self, schemas: SchemaRegistry) -> EntityMetadataProvidersOptions {
        let table_options = Some(TableProviderOptions {
            database_path: self.table_path,
            table_name: self.table_name,
        });
        let postgres_options = self.postgres_url.map(|url| PostgresProviderOptions {
            schema: self.postgres_schema,
            table_prefix: self.postgres_table_prefix,
            max_connections: self.postgres_max_connections,
            ..PostgresProviderOptions::new(url)
        });
        EntityMetadataProvidersOptions {
            provider_type_name: self.provider,
            table_options,
            postgres_options,
            schemas,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Cli {
        #[command(flatten)]
        provider: ProviderArgs,
    }

    #[test]
    fn table_options_defaults() {
        let options = TableProviderOptions::default();
        assert!(options.database_path.is_none());
        assert_eq!(options.table_name, "entitymetadata");
        assert!(options.validate().is_ok());
    }

    #[test]
    fn table_options_reject_blank_name() {
        let options = TableProviderOptions {
            table_name: "  ".into(),
            ..TableProviderOptions::default()
        };
        assert!(matches!(
            options.validate(),
            Err(ProviderError::Configuration { .. })
        ));
    }

    #[test]
    fn postgres_options_defaults() {
        let options = PostgresProviderOptions::new("postgres://localhost/meta");
        assert_eq!(options.schema, "public");
        assert_eq!(options.table_prefix, "entitymetadata_");
        assert_eq!(options.max_connections, 10);
        assert_eq!(options.acquire_timeout, Duration::from_secs(30));
        assert!(options.validate().is_ok());
    }

    #[test]
    fn postgres_options_reject_bad_values() {
        assert!(PostgresProviderOptions::new("mysql://x").validate().is_err());

        let mut options = PostgresProviderOptions::new("postgresql://x/db");
        options.schema = "public; drop".into();
        assert!(options.validate().is_err());

        let mut options = PostgresProviderOptions::new("postgresql://x/db");
        options.table_prefix = "Bad-Prefix".into();
        assert!(options.validate().is_err());

        let mut options = PostgresProviderOptions::new("postgresql://x/db");
        options.max_connections = 0;
        assert!(options.validate().is_err());

        let mut options = PostgresProviderOptions::new("postgresql://x/db");
        options.table_prefix = String::new();
        assert!(options.validate().is_ok());
    }

    #[test]
    fn postgres_prefix_leaves_room_for_type_names() {
        let room = MAX_IDENTIFIER_LEN - MAX_TYPE_NAME_LEN;
        let mut options = PostgresProviderOptions::new("postgres://x/db");
        options.table_prefix = "p".repeat(room);
        assert!(options.validate().is_ok());

        options.table_prefix = "p".repeat(room + 1);
        assert!(matches!(
            options.validate(),
            Err(ProviderError::Configuration { .. })
        ));
    }

    #[test]
    fn args_map_to_options() {
        let cli = Cli::parse_from([
            "host",
            "--provider",
            "postgres",
            "--postgres-url",
            "postgres://db/meta",
            "--postgres-schema",
            "portal",
            "--postgres-max-connections",
            "4",
        ]);
        let options = cli.provider.into_options(SchemaRegistry::new());
        assert_eq!(options.provider_type_name.as_deref(), Some("postgres"));
        let pg = options.postgres_options.unwrap();
        assert_eq!(pg.connection_string, "postgres://db/meta");
        assert_eq!(pg.schema, "portal");
        assert_eq!(pg.table_prefix, "entitymetadata_");
        assert_eq!(pg.max_connections, 4);
    }

    #[test]
    fn args_without_postgres_url_leave_postgres_unset() {
        let cli = Cli::parse_from(["host", "--provider", "table", "--table-name", "meta"]);
        let options = cli.provider.into_options(SchemaRegistry::new());
        assert!(options.postgres_options.is_none());
        assert_eq!(options.table_options.unwrap().table_name, "meta");
    }
}
