//! Entity metadata record types.
//!
//! An entity is identified by an [`EntityMetadataType`] and a caller-supplied
//! id, and carries a [`FieldMap`] whose values are restricted to the five
//! logical types in [`FieldType`]. Every provider backend must be able to
//! store and reproduce all five without loss.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{ProviderError, ProviderResult};

/// Longest entity type name accepted. Keeps `<prefix><type>` within the
/// 63-byte `PostgreSQL` identifier limit for prefixes up to 15 bytes.
pub const MAX_TYPE_NAME_LEN: usize = 48;

/// Longest entity id accepted, in bytes.
pub const MAX_ENTITY_ID_LEN: usize = 512;

/// Earliest storable date: 4714-11-24 BC 00:00 UTC, the `PostgreSQL`
/// timestamp lower bound.
pub const MIN_DATE_MILLIS: i64 = -210_866_803_200_000;

/// Latest storable date: +262142-12-31 23:59:59.999 UTC.
pub const MAX_DATE_MILLIS: i64 = 8_210_266_876_799_999;

static TYPE_NAME_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z][a-z0-9_]*$").unwrap_or_else(|e| panic!("invalid type name pattern: {e}"))
});

/// Process-wide unique name of a kind of entity metadata (`"approval"`, `"link"`).
///
/// Adapters use the name verbatim as a partition key or table-name suffix,
/// so it is restricted to lowercase ASCII letters, digits and underscores.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityMetadataType(String);

impl EntityMetadataType {
    /// Validates and wraps a type name.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Validation`] if the name is empty, too long,
    /// or contains characters other than `[a-z0-9_]` (leading letter).
    pub fn new(name: impl Into<String>) -> ProviderResult<Self> {
        let name = name.into();
        if name.len() > MAX_TYPE_NAME_LEN {
            return Err(ProviderError::validation(format!(
                "entity type name '{name}' is longer than {MAX_TYPE_NAME_LEN} characters"
            )));
        }
        if !TYPE_NAME_PATTERN.is_match(&name) {
            return Err(ProviderError::validation(format!(
                "entity type name '{name}' must match [a-z][a-z0-9_]*"
            )));
        }
        Ok(Self(name))
    }

    /// The type name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityMetadataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for EntityMetadataType {
    type Error = ProviderError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for EntityMetadataType {
    type Error = ProviderError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<EntityMetadataType> for String {
    fn from(value: EntityMetadataType) -> Self {
        value.0
    }
}

/// Checks a caller-supplied entity id.
///
/// Ids must be non-empty, at most [`MAX_ENTITY_ID_LEN`] bytes, and free of
/// control characters (table-store row keys reject them).
///
/// # Errors
///
/// Returns [`ProviderError::Validation`] describing the first problem found.
pub fn validate_entity_id(id: &str) -> ProviderResult<()> {
    if id.is_empty() {
        return Err(ProviderError::validation("entity id must not be empty"));
    }
    if id.len() > MAX_ENTITY_ID_LEN {
        return Err(ProviderError::validation(format!(
            "entity id is longer than {MAX_ENTITY_ID_LEN} bytes"
        )));
    }
    if id.chars().any(char::is_control) {
        return Err(ProviderError::validation(
            "entity id must not contain control characters",
        ));
    }
    Ok(())
}

/// Logical type of a field value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FieldType {
    /// UTF-8 text.
    String,
    /// IEEE-754 double.
    Number,
    /// `true` / `false`.
    Boolean,
    /// UTC instant with millisecond precision.
    Date,
    /// Ordered list of strings.
    StringArray,
}

impl FieldType {
    /// Human-readable name, used in validation messages.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Date => "date",
            Self::StringArray => "string-array",
        }
    }

    /// Whether values of this type have a total order usable for range
    /// clauses and sorting.
    #[must_use]
    pub fn is_orderable(self) -> bool {
        !matches!(self, Self::StringArray)
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed field value.
///
/// Dates are milliseconds since the Unix epoch (UTC).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum FieldValue {
    String(String),
    Number(f64),
    Boolean(bool),
    Date(i64),
    StringArray(Vec<String>),
}

impl FieldValue {
    /// The logical type of this value.
    #[must_use]
    pub fn field_type(&self) -> FieldType {
        match self {
            Self::String(_) => FieldType::String,
            Self::Number(_) => FieldType::Number,
            Self::Boolean(_) => FieldType::Boolean,
            Self::Date(_) => FieldType::Date,
            Self::StringArray(_) => FieldType::StringArray,
        }
    }

    /// Describes why this value cannot be stored by every backend, if so:
    /// dates outside [`MIN_DATE_MILLIS`]..=[`MAX_DATE_MILLIS`] and strings
    /// containing NUL.
    #[must_use]
    pub fn storage_violation(&self) -> Option<String> {
        match self {
            Self::Date(ms) if !(MIN_DATE_MILLIS..=MAX_DATE_MILLIS).contains(ms) => {
                Some(format!("date {ms} is out of range"))
            }
            Self::String(s) if s.contains('\0') => Some("string contains NUL".to_string()),
            Self::StringArray(items) if items.iter().any(|s| s.contains('\0')) => {
                Some("string array item contains NUL".to_string())
            }
            _ => None,
        }
    }

    /// Compares two values of the same orderable type.
    ///
    /// Strings compare bytewise, numbers numerically (NaN falls back to
    /// [`f64::total_cmp`]), dates numerically and booleans as `false < true`.
    /// Returns `None` when the types differ or the type is a string array.
    #[must_use]
    pub fn compare(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::String(a), Self::String(b)) => Some(a.as_bytes().cmp(b.as_bytes())),
            (Self::Number(a), Self::Number(b)) => {
                Some(a.partial_cmp(b).unwrap_or_else(|| a.total_cmp(b)))
            }
            (Self::Boolean(a), Self::Boolean(b)) => Some(a.cmp(b)),
            (Self::Date(a), Self::Date(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<i32> for FieldValue {
    fn from(value: i32) -> Self {
        Self::Number(f64::from(value))
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl From<Vec<String>> for FieldValue {
    fn from(value: Vec<String>) -> Self {
        Self::StringArray(value)
    }
}

/// Field name → value. Ordered for deterministic serialization.
pub type FieldMap = BTreeMap<String, FieldValue>;

/// Opaque version tag assigned by a backend on every successful write.
///
/// Only compared for equality. Callers pass back the tag they last read as
/// `expected_version` to get optimistic concurrency on update.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityVersion(String);

impl EntityVersion {
    #[must_use]
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A stored entity metadata record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityMetadata {
    pub entity_type: EntityMetadataType,
    pub entity_id: String,
    /// Version of the stored record. `None` only for records that were
    /// built locally and never written.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub version: Option<EntityVersion>,
    pub fields: FieldMap,
}

impl EntityMetadata {
    /// Creates an unversioned record.
    #[must_use]
    pub fn new(entity_type: EntityMetadataType, entity_id: impl Into<String>, fields: FieldMap) -> Self {
        Self {
            entity_type,
            entity_id: entity_id.into(),
            version: None,
            fields,
        }
    }

    /// Returns the value of a field, if present.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }
}

/// How [`EntityUpdate::fields`] is applied to the stored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UpdateMode {
    /// The supplied fields become the complete field set.
    #[default]
    Replace,
    /// Only the supplied fields are overwritten; others are kept.
    Merge,
}

/// An update request for one record.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EntityUpdate {
    pub fields: FieldMap,
    pub mode: UpdateMode,
    /// When set, the update only applies if the stored version matches.
    pub expected_version: Option<EntityVersion>,
}

impl EntityUpdate {
    /// Full replacement of the field set, last-write-wins.
    #[must_use]
    pub fn replace(fields: FieldMap) -> Self {
        Self {
            fields,
            mode: UpdateMode::Replace,
            expected_version: None,
        }
    }

    /// Partial update of the supplied fields, last-write-wins.
    #[must_use]
    pub fn merge(fields: FieldMap) -> Self {
        Self {
            fields,
            mode: UpdateMode::Merge,
            expected_version: None,
        }
    }

    /// Requires the stored version to equal `version`.
    #[must_use]
    pub fn if_version(mut self, version: EntityVersion) -> Self {
        self.expected_version = Some(version);
        self
    }

    /// Applies this update to an existing field set in place.
    pub fn apply_to(&self, fields: &mut FieldMap) {
        match self.mode {
            UpdateMode::Replace => fields.clone_from(&self.fields),
            UpdateMode::Merge => {
                for (name, value) in &self.fields {
                    fields.insert(name.clone(), value.clone());
                }
            }
        }
    }
}

/// Builds a [`FieldMap`] from `(name, value)` pairs.
///
/// ```
/// use metastore_core::types::{fields, FieldValue};
///
/// let map = fields([("name", FieldValue::from("Widget")), ("count", FieldValue::from(3))]);
/// assert_eq!(map.len(), 2);
/// ```
#[must_use]
pub fn fields<I, K>(pairs: I) -> FieldMap
where
    I: IntoIterator<Item = (K, FieldValue)>,
    K: Into<String>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_name_accepts_lowercase_identifiers() {
        assert!(EntityMetadataType::new("approval").is_ok());
        assert!(EntityMetadataType::new("team_join_request2").is_ok());
    }

    #[test]
    fn type_name_rejects_bad_names() {
        for bad in ["", "Widget", "2fast", "with-dash", "sp ace", "quote\""] {
            let err = EntityMetadataType::new(bad).unwrap_err();
            assert!(matches!(err, ProviderError::Validation { .. }), "{bad}");
        }
        let long = "a".repeat(MAX_TYPE_NAME_LEN + 1);
        assert!(EntityMetadataType::new(long).is_err());
    }

    #[test]
    fn type_name_serde_validates() {
        let ok: EntityMetadataType = serde_json::from_str("\"link\"").unwrap();
        assert_eq!(ok.as_str(), "link");
        assert!(serde_json::from_str::<EntityMetadataType>("\"Link\"").is_err());
    }

    #[test]
    fn entity_id_rules() {
        assert!(validate_entity_id("w1").is_ok());
        assert!(validate_entity_id("org/repo#12").is_ok());
        assert!(validate_entity_id("").is_err());
        assert!(validate_entity_id("a\u{0}b").is_err());
        assert!(validate_entity_id(&"x".repeat(MAX_ENTITY_ID_LEN + 1)).is_err());
    }

    #[test]
    fn compare_same_types() {
        assert_eq!(
            FieldValue::from("a").compare(&FieldValue::from("b")),
            Some(Ordering::Less)
        );
        assert_eq!(
            FieldValue::Number(2.0).compare(&FieldValue::Number(1.5)),
            Some(Ordering::Greater)
        );
        assert_eq!(
            FieldValue::Boolean(false).compare(&FieldValue::Boolean(true)),
            Some(Ordering::Less)
        );
        assert_eq!(FieldValue::Date(5).compare(&FieldValue::Date(5)), Some(Ordering::Equal));
    }

    #[test]
    fn compare_mixed_or_array_is_none() {
        assert_eq!(FieldValue::from("1").compare(&FieldValue::Number(1.0)), None);
        let arr = FieldValue::StringArray(vec!["a".into()]);
        assert_eq!(arr.compare(&arr), None);
    }

    #[test]
    fn compare_strings_bytewise() {
        // Uppercase sorts before lowercase in byte order.
        assert_eq!(
            FieldValue::from("Zebra").compare(&FieldValue::from("apple")),
            Some(Ordering::Less)
        );
    }

    #[test]
    fn replace_update_drops_missing_fields() {
        let mut stored = fields([("a", FieldValue::from(1)), ("b", FieldValue::from(2))]);
        EntityUpdate::replace(fields([("a", FieldValue::from(9))])).apply_to(&mut stored);
        assert_eq!(stored, fields([("a", FieldValue::from(9))]));
    }

    #[test]
    fn merge_update_keeps_other_fields() {
        let mut stored = fields([("a", FieldValue::from(1)), ("b", FieldValue::from(2))]);
        EntityUpdate::merge(fields([("a", FieldValue::from(9))])).apply_to(&mut stored);
        assert_eq!(
            stored,
            fields([("a", FieldValue::from(9)), ("b", FieldValue::from(2))])
        );
    }

    #[test]
    fn field_value_json_shape() {
        let json = serde_json::to_value(FieldValue::StringArray(vec!["x".into()])).unwrap();
        assert_eq!(json, serde_json::json!({"type": "stringArray", "value": ["x"]}));
    }
}
