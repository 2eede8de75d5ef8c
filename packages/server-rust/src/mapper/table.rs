//! Field mapping for the table store.
//!
//! Table rows carry typed properties, so strings, numbers, booleans and
//! dates survive structurally. The table store has no collection type:
//! string arrays are written as a JSON-encoded `Edm.String` and turned back
//! into arrays using the entity type's [`FieldSchema`].

use std::collections::BTreeMap;

use metastore_core::{
    FieldMap, FieldSchema, FieldType, FieldValue, ProviderError, ProviderResult,
};
use serde::{Deserialize, Serialize};

/// A typed table property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v")]
pub enum EdmProperty {
    #[serde(rename = "Edm.String")]
    String(String),
    #[serde(rename = "Edm.Double")]
    Double(f64),
    #[serde(rename = "Edm.Boolean")]
    Boolean(bool),
    /// Milliseconds since the Unix epoch.
    #[serde(rename = "Edm.DateTime")]
    DateTime(i64),
}

/// A stored table row: system columns plus the property bag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableRow {
    pub etag: String,
    /// Last write time, milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub properties: BTreeMap<String, EdmProperty>,
}

impl TableRow {
    /// MessagePack encoding of the row.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Backend`] if encoding fails.
    pub fn encode(&self) -> ProviderResult<Vec<u8>> {
        rmp_serde::to_vec_named(self)
            .map_err(|e| ProviderError::backend(format!("encode table row: {e}")))
    }

    /// Decodes a row written by [`encode`](Self::encode).
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::CorruptRecord`] if the bytes are not a row.
    pub fn decode(bytes: &[u8], entity_type: &str, id: &str) -> ProviderResult<Self> {
        rmp_serde::from_slice(bytes)
            .map_err(|e| ProviderError::corrupt(entity_type, id, format!("decode table row: {e}")))
    }
}

/// Converts logical fields to table properties.
///
/// The fields must already have been validated against `schema`.
///
/// # Errors
///
/// Returns [`ProviderError::Backend`] if a string array cannot be encoded.
pub fn to_properties(fields: &FieldMap) -> ProviderResult<BTreeMap<String, EdmProperty>> {
    fields
        .iter()
        .map(|(name, value)| {
            let property = match value {
                FieldValue::String(s) => EdmProperty::String(s.clone()),
                FieldValue::Number(n) => EdmProperty::Double(*n),
                FieldValue::Boolean(b) => EdmProperty::Boolean(*b),
                FieldValue::Date(ms) => EdmProperty::DateTime(*ms),
                FieldValue::StringArray(items) => EdmProperty::String(
                    serde_json::to_string(items).map_err(|e| {
                        ProviderError::backend(format!("encode string array '{name}': {e}"))
                    })?,
                ),
            };
            Ok((name.clone(), property))
        })
        .collect()
}

/// Converts table properties back to logical fields using the schema.
///
/// # Errors
///
/// Returns [`ProviderError::CorruptRecord`] for a property the schema does
/// not declare, a property whose type disagrees with the schema, or an
/// array property that is not a JSON string list.
pub fn from_properties(
    properties: &BTreeMap<String, EdmProperty>,
    schema: &FieldSchema,
    id: &str,
) -> ProviderResult<FieldMap> {
    let entity_type = schema.entity_type.as_str();
    properties
        .iter()
        .map(|(name, property)| {
            let Some(field_type) = schema.field_type(name) else {
                return Err(ProviderError::corrupt(
                    entity_type,
                    id,
                    format!("property '{name}' is not declared in the schema"),
                ));
            };
            let value = match (field_type, property) {
                (FieldType::String, EdmProperty::String(s)) => FieldValue::String(s.clone()),
                (FieldType::StringArray, EdmProperty::String(json)) => {
                    let items: Vec<String> = serde_json::from_str(json).map_err(|e| {
                        ProviderError::corrupt(
                            entity_type,
                            id,
                            format!("property '{name}' is not a string array: {e}"),
                        )
                    })?;
                    FieldValue::StringArray(items)
                }
                (FieldType::Number, EdmProperty::Double(n)) => FieldValue::Number(*n),
                (FieldType::Boolean, EdmProperty::Boolean(b)) => FieldValue::Boolean(*b),
                (FieldType::Date, EdmProperty::DateTime(ms)) => FieldValue::Date(*ms),
                (expected, _) => {
                    return Err(ProviderError::corrupt(
                        entity_type,
                        id,
                        format!("property '{name}' does not hold a {expected} value"),
                    ))
                }
            };
            Ok((name.clone(), value))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use metastore_core::types::fields;
    use metastore_core::EntityMetadataType;

    use super::*;

    fn schema() -> FieldSchema {
        FieldSchema::new(EntityMetadataType::new("sample").unwrap())
            .field("s", FieldType::String)
            .field("n", FieldType::Number)
            .field("b", FieldType::Boolean)
            .field("d", FieldType::Date)
            .field("tags", FieldType::StringArray)
    }

    #[test]
    fn arrays_become_json_strings() {
        let props = to_properties(&fields([(
            "tags",
            FieldValue::StringArray(vec!["a".into(), "b,c".into()]),
        )]))
        .unwrap();
        assert_eq!(
            props.get("tags"),
            Some(&EdmProperty::String(r#"["a","b,c"]"#.to_string()))
        );
    }

    #[test]
    fn all_types_survive_a_row_encoding() {
        let original = fields([
            ("s", FieldValue::from("text")),
            ("n", FieldValue::Number(-2.5)),
            ("b", FieldValue::Boolean(true)),
            ("d", FieldValue::Date(1_700_000_000_123)),
            ("tags", FieldValue::StringArray(vec![])),
        ]);
        let row = TableRow {
            etag: "e1".into(),
            timestamp: 1,
            properties: to_properties(&original).unwrap(),
        };
        let bytes = row.encode().unwrap();
        let decoded = TableRow::decode(&bytes, "sample", "x").unwrap();
        assert_eq!(decoded, row);
        assert_eq!(from_properties(&decoded.properties, &schema(), "x").unwrap(), original);
    }

    #[test]
    fn string_field_holding_json_stays_a_string() {
        let original = fields([("s", FieldValue::from(r#"["not","an","array"]"#))]);
        let props = to_properties(&original).unwrap();
        assert_eq!(from_properties(&props, &schema(), "x").unwrap(), original);
    }

    #[test]
    fn type_disagreement_is_corrupt() {
        let mut props = BTreeMap::new();
        props.insert("n".to_string(), EdmProperty::String("3".into()));
        assert!(matches!(
            from_properties(&props, &schema(), "x"),
            Err(ProviderError::CorruptRecord { .. })
        ));
    }

    #[test]
    fn undeclared_property_is_corrupt() {
        let mut props = BTreeMap::new();
        props.insert("extra".to_string(), EdmProperty::Boolean(false));
        assert!(from_properties(&props, &schema(), "x").is_err());
    }

    #[test]
    fn garbage_bytes_are_corrupt() {
        assert!(matches!(
            TableRow::decode(&[0xc1], "sample", "x"),
            Err(ProviderError::CorruptRecord { .. })
        ));
    }
}
