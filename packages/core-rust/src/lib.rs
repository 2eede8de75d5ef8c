//! Metastore Core: entity metadata records, field schemas, query descriptors
//! and the provider error taxonomy shared by every storage backend.

pub mod error;
pub mod hash;
pub mod query;
pub mod schema;
pub mod types;

pub use error::{ProviderError, ProviderResult};
pub use query::{
    Clause, ClauseOp, ContinuationToken, CursorPosition, QueryDescriptor, QueryPage,
    SortDirection, SortSpec, TokenIssuer,
};
pub use schema::{FieldSchema, FieldSpec, SchemaRegistry, ValidationMode, ValidationResult};
pub use types::{
    EntityMetadata, EntityMetadataType, EntityUpdate, EntityVersion, FieldMap, FieldType,
    FieldValue, UpdateMode,
};
