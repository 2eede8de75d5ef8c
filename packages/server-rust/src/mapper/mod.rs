//! Backend-specific halves of the field type mapper.
//!
//! The backend-independent half (schemas and validation) lives in
//! [`metastore_core::schema`]. The memory backend stores values natively and
//! needs no mapping beyond validation.

pub mod relational;
pub mod table;
