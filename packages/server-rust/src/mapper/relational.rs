//! Field mapping for the relational store.
//!
//! Each entity type maps to one table named `<prefix><type>` with an
//! `entity_id TEXT` primary key, an `entity_version BIGINT` row version, and
//! one nullable column per schema field. Absent fields are stored as `NULL`
//! and read back as absent.

use std::fmt::Write as _;

use metastore_core::{EntityMetadataType, FieldSchema, FieldType};

/// Column holding the entity id.
pub const ID_COLUMN: &str = "entity_id";

/// Column holding the row version.
pub const VERSION_COLUMN: &str = "entity_version";

/// SQL column type for a logical field type.
#[must_use]
pub fn column_type(field_type: FieldType) -> &'static str {
    match field_type {
        FieldType::String => "TEXT",
        FieldType::Number => "DOUBLE PRECISION",
        FieldType::Boolean => "BOOLEAN",
        FieldType::Date => "TIMESTAMPTZ",
        FieldType::StringArray => "TEXT[]",
    }
}

/// `information_schema.columns.data_type` reported for a column created
/// with [`column_type`].
#[must_use]
pub fn reported_data_type(field_type: FieldType) -> &'static str {
    match field_type {
        FieldType::String => "text",
        FieldType::Number => "double precision",
        FieldType::Boolean => "boolean",
        FieldType::Date => "timestamp with time zone",
        FieldType::StringArray => "ARRAY",
    }
}

/// Double-quotes an identifier, escaping embedded quotes.
#[must_use]
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Unquoted table name for an entity type.
#[must_use]
pub fn table_name(prefix: &str, entity_type: &EntityMetadataType) -> String {
    format!("{prefix}{entity_type}")
}

/// Schema-qualified, quoted table reference.
#[must_use]
pub fn qualified_table(schema: &str, prefix: &str, entity_type: &EntityMetadataType) -> String {
    format!(
        "{}.{}",
        quote_ident(schema),
        quote_ident(&table_name(prefix, entity_type))
    )
}

/// `CREATE TABLE IF NOT EXISTS` statement for a field schema.
#[must_use]
pub fn create_table_sql(schema: &str, prefix: &str, fields: &FieldSchema) -> String {
    let mut sql = format!(
        "CREATE TABLE IF NOT EXISTS {} ({ID_COLUMN} TEXT PRIMARY KEY, {VERSION_COLUMN} BIGINT NOT NULL",
        qualified_table(schema, prefix, &fields.entity_type)
    );
    for (name, spec) in &fields.fields {
        let _ = write!(sql, ", {} {}", quote_ident(name), column_type(spec.field_type));
    }
    sql.push(')');
    sql
}

/// Column list for `SELECT`, identity and version first.
#[must_use]
pub fn select_columns(fields: &FieldSchema) -> String {
    let mut columns = format!("{ID_COLUMN}, {VERSION_COLUMN}");
    for name in fields.fields.keys() {
        columns.push_str(", ");
        columns.push_str(&quote_ident(name));
    }
    columns
}
