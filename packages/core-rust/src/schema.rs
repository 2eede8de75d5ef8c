//! Field schemas: the per-type half of the field type mapper.
//!
//! A [`FieldSchema`] declares the logical type of every field an entity type
//! may carry. Typed backends (table store, relational) need one for each
//! type they store; the memory backend validates against it when present so
//! that a bad write fails the same way in development as in production.

use std::collections::{BTreeMap, HashMap};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{ProviderError, ProviderResult};
use crate::types::{EntityMetadataType, FieldMap, FieldType};

/// Column names the relational backend reserves for identity and version.
pub const RESERVED_FIELD_NAMES: &[&str] = &["entity_id", "entity_version"];

/// Longest field name accepted (the `PostgreSQL` identifier limit).
pub const MAX_FIELD_NAME_LEN: usize = 63;

static FIELD_NAME_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$")
        .unwrap_or_else(|e| panic!("invalid field name pattern: {e}"))
});

/// Checks that `name` can be used as a field name on every backend.
#[must_use]
pub fn is_valid_field_name(name: &str) -> bool {
    name.len() <= MAX_FIELD_NAME_LEN
        && FIELD_NAME_PATTERN.is_match(name)
        && !RESERVED_FIELD_NAMES.contains(&name)
}

/// Declaration of a single field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldSpec {
    pub field_type: FieldType,
    /// Whether the field must be present after a create or replace.
    pub required: bool,
}

/// How strictly to validate a field map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationMode {
    /// The map is the complete field set (create, replace): required fields
    /// must be present.
    Full,
    /// The map is a subset being merged into a stored record.
    Partial,
}

/// Result of validating a field map against a schema.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationResult {
    /// The value conforms to the schema.
    Valid,
    /// The value violates one or more schema constraints.
    Invalid {
        /// Human-readable descriptions of each validation failure.
        errors: Vec<String>,
    },
}

impl ValidationResult {
    #[must_use]
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid)
    }

    /// Converts into a provider result, mapping `Invalid` to
    /// [`ProviderError::Validation`].
    ///
    /// # Errors
    ///
    /// Returns the collected validation errors.
    pub fn into_result(self) -> ProviderResult<()> {
        match self {
            Self::Valid => Ok(()),
            Self::Invalid { errors } => Err(ProviderError::Validation { errors }),
        }
    }

    fn from_errors(errors: Vec<String>) -> Self {
        if errors.is_empty() {
            Self::Valid
        } else {
            Self::Invalid { errors }
        }
    }
}

/// Field declarations for one entity type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldSchema {
    pub entity_type: EntityMetadataType,
    /// Ordered by name so adapters derive columns deterministically.
    pub fields: BTreeMap<String, FieldSpec>,
}

impl FieldSchema {
    #[must_use]
    pub fn new(entity_type: EntityMetadataType) -> Self {
        Self {
            entity_type,
            fields: BTreeMap::new(),
        }
    }

    /// Declares an optional field.
    #[must_use]
    pub fn field(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.fields.insert(
            name.into(),
            FieldSpec {
                field_type,
                required: false,
            },
        );
        self
    }

    /// Declares a field that must be present after create or replace.
    #[must_use]
    pub fn required(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.fields.insert(
            name.into(),
            FieldSpec {
                field_type,
                required: true,
            },
        );
        self
    }

    /// Looks up the declared type of a field.
    #[must_use]
    pub fn field_type(&self, name: &str) -> Option<FieldType> {
        self.fields.get(name).map(|spec| spec.field_type)
    }

    /// Checks the declarations themselves (names usable on every backend).
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Configuration`] naming the bad fields.
    pub fn check_definition(&self) -> ProviderResult<()> {
        let bad: Vec<&str> = self
            .fields
            .keys()
            .filter(|name| !is_valid_field_name(name))
            .map(String::as_str)
            .collect();
        if bad.is_empty() {
            Ok(())
        } else {
            Err(ProviderError::configuration(format!(
                "schema for {} declares invalid field names: {}",
                self.entity_type,
                bad.join(", ")
            )))
        }
    }

    /// Validates a field map against this schema.
    #[must_use]
    pub fn validate(&self, fields: &FieldMap, mode: ValidationMode) -> ValidationResult {
        let mut errors = Vec::new();

        for (name, value) in fields {
            match self.fields.get(name) {
                None => errors.push(format!(
                    "field '{name}' is not declared for {}",
                    self.entity_type
                )),
                Some(spec) if spec.field_type != value.field_type() => errors.push(format!(
                    "field '{name}' expects {} but got {}",
                    spec.field_type,
                    value.field_type()
                )),
                Some(_) => {}
            }
        }

        if mode == ValidationMode::Full {
            for (name, spec) in &self.fields {
                if spec.required && !fields.contains_key(name) {
                    errors.push(format!("required field '{name}' is missing"));
                }
            }
        }

        ValidationResult::from_errors(errors)
    }
}

/// Validates field names without a schema (memory backend, untyped types).
#[must_use]
pub fn validate_field_names(fields: &FieldMap) -> ValidationResult {
    let errors = fields
        .keys()
        .filter(|name| !is_valid_field_name(name))
        .map(|name| format!("'{name}' is not a valid field name"))
        .collect();
    ValidationResult::from_errors(errors)
}

/// Rejects values some backend cannot store (see
/// [`FieldValue::storage_violation`](crate::types::FieldValue::storage_violation)).
#[must_use]
pub fn validate_values(fields: &FieldMap) -> ValidationResult {
    let errors = fields
        .iter()
        .filter_map(|(name, value)| {
            value
                .storage_violation()
                .map(|reason| format!("field '{name}': {reason}"))
        })
        .collect();
    ValidationResult::from_errors(errors)
}

/// All field schemas known to a provider, keyed by entity type.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: HashMap<EntityMetadataType, FieldSchema>,
}

impl SchemaRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a schema, replacing any previous one for the same type.
    #[must_use]
    pub fn with(mut self, schema: FieldSchema) -> Self {
        self.register(schema);
        self
    }

    /// Registers a schema, replacing any previous one for the same type.
    pub fn register(&mut self, schema: FieldSchema) {
        self.schemas.insert(schema.entity_type.clone(), schema);
    }

    #[must_use]
    pub fn get(&self, entity_type: &EntityMetadataType) -> Option<&FieldSchema> {
        self.schemas.get(entity_type)
    }

    /// Like [`get`](Self::get) but fails for unregistered types, for
    /// backends that cannot store untyped fields.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Configuration`] if no schema is registered.
    pub fn require(&self, entity_type: &EntityMetadataType) -> ProviderResult<&FieldSchema> {
        self.schemas.get(entity_type).ok_or_else(|| {
            ProviderError::configuration(format!(
                "no field schema registered for entity type {entity_type}"
            ))
        })
    }

    /// Iterates registered schemas in type-name order.
    pub fn iter(&self) -> impl Iterator<Item = &FieldSchema> {
        let mut all: Vec<&FieldSchema> = self.schemas.values().collect();
        all.sort_by(|a, b| a.entity_type.cmp(&b.entity_type));
        all.into_iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }

    /// Checks every registered schema's declarations.
    ///
    /// # Errors
    ///
    /// Returns the first [`ProviderError::Configuration`] found.
    pub fn check_definitions(&self) -> ProviderResult<()> {
        self.iter().try_for_each(FieldSchema::check_definition)
    }

    /// Validates a field map for `entity_type`: names and value ranges
    /// always, and the schema when one is registered.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Validation`] on any violation.
    pub fn validate(
        &self,
        entity_type: &EntityMetadataType,
        fields: &FieldMap,
        mode: ValidationMode,
    ) -> ProviderResult<()> {
        validate_field_names(fields).into_result()?;
        validate_values(fields).into_result()?;
        match self.get(entity_type) {
            Some(schema) => schema.validate(fields, mode).into_result(),
            None => Ok(()),
        }
    }
}
