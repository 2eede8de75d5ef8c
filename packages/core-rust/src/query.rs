//! Backend-agnostic query descriptors, result pages and continuation tokens.
//!
//! A [`QueryDescriptor`] is interpreted identically by every provider:
//! clauses are ANDed together, a record lacking a clause field never matches,
//! and ordering is either the backend's natural key order or an explicit
//! [`SortSpec`] with missing values last (ascending) / first (descending) and
//! ties broken by id.
//!
//! Continuation tokens are opaque to callers. Internally a token is a
//! MessagePack envelope, base64url encoded, that binds a backend position to
//! the issuing provider instance and to the fingerprint of the query. A token
//! presented with any other query or to any other provider instance is
//! rejected with [`ProviderError::InvalidQuery`].

use std::cmp::Ordering;
use std::fmt;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::error::{ProviderError, ProviderResult};
use crate::hash::Fnv1a64;
use crate::schema::{is_valid_field_name, FieldSchema};
use crate::types::{EntityMetadata, EntityMetadataType, FieldMap, FieldType, FieldValue};

/// Page size used when a descriptor does not specify one.
pub const DEFAULT_PAGE_SIZE: u32 = 100;

/// Largest page size a descriptor may request.
pub const MAX_PAGE_SIZE: u32 = 1000;

// ---------------------------------------------------------------------------
// Clauses
// ---------------------------------------------------------------------------

/// Comparison operator of a [`Clause`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClauseOp {
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
}

impl ClauseOp {
    /// Whether the operator needs an ordering rather than plain equality.
    #[must_use]
    pub fn is_range(self) -> bool {
        matches!(self, Self::Lt | Self::Lte | Self::Gt | Self::Gte)
    }

    /// SQL spelling of the operator.
    #[must_use]
    pub fn as_sql(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "<>",
            Self::Lt => "<",
            Self::Lte => "<=",
            Self::Gt => ">",
            Self::Gte => ">=",
        }
    }

    fn accepts(self, ord: Ordering) -> bool {
        match self {
            Self::Eq => ord == Ordering::Equal,
            Self::Ne => ord != Ordering::Equal,
            Self::Lt => ord == Ordering::Less,
            Self::Lte => ord != Ordering::Greater,
            Self::Gt => ord == Ordering::Greater,
            Self::Gte => ord != Ordering::Less,
        }
    }
}

/// A single `field <op> value` condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Clause {
    pub field: String,
    pub op: ClauseOp,
    pub value: FieldValue,
}

impl Clause {
    #[must_use]
    pub fn new(field: impl Into<String>, op: ClauseOp, value: impl Into<FieldValue>) -> Self {
        Self {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    #[must_use]
    pub fn eq(field: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        Self::new(field, ClauseOp::Eq, value)
    }

    /// Evaluates the clause against a field map.
    ///
    /// A string clause against a string-array field tests membership
    /// (`Eq` = contains, `Ne` = does not contain).
    #[must_use]
    pub fn matches(&self, fields: &FieldMap) -> bool {
        let Some(stored) = fields.get(&self.field) else {
            return false;
        };
        match (stored, &self.value) {
            (FieldValue::StringArray(items), FieldValue::String(wanted)) => match self.op {
                ClauseOp::Eq => items.contains(wanted),
                ClauseOp::Ne => !items.contains(wanted),
                _ => false,
            },
            (FieldValue::StringArray(a), FieldValue::StringArray(b)) => match self.op {
                ClauseOp::Eq => a == b,
                ClauseOp::Ne => a != b,
                _ => false,
            },
            _ => stored
                .compare(&self.value)
                .is_some_and(|ord| self.op.accepts(ord)),
        }
    }

    fn check(&self, schema: Option<&FieldSchema>) -> ProviderResult<()> {
        if !is_valid_field_name(&self.field) {
            return Err(ProviderError::invalid_query(format!(
                "'{}' is not a valid field name",
                self.field
            )));
        }
        if self.op.is_range() && !self.value.field_type().is_orderable() {
            return Err(ProviderError::invalid_query(format!(
                "operator {:?} cannot be applied to a string array on '{}'",
                self.op, self.field
            )));
        }
        let Some(schema) = schema else {
            return Ok(());
        };
        let Some(field_type) = schema.field_type(&self.field) else {
            return Err(ProviderError::invalid_query(format!(
                "field '{}' is not declared for {}",
                self.field, schema.entity_type
            )));
        };
        let value_type = self.value.field_type();
        let membership = field_type == FieldType::StringArray
            && value_type == FieldType::String
            && !self.op.is_range();
        if value_type != field_type && !membership {
            return Err(ProviderError::invalid_query(format!(
                "clause on '{}' compares a {field_type} field with a {value_type} value",
                self.field
            )));
        }
        if self.op.is_range() && !field_type.is_orderable() {
            return Err(ProviderError::invalid_query(format!(
                "range operator on string-array field '{}'",
                self.field
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Sorting
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

/// Explicit result ordering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SortSpec {
    pub field: String,
    pub direction: SortDirection,
}

impl SortSpec {
    /// Orders two records by the sort field, then by id.
    ///
    /// Records lacking the field sort after all others when ascending and
    /// before all others when descending, which is `PostgreSQL`'s default
    /// `NULLS LAST` / `NULLS FIRST` placement.
    #[must_use]
    pub fn compare(&self, a: &EntityMetadata, b: &EntityMetadata) -> Ordering {
        let by_value = match (a.field(&self.field), b.field(&self.field)) {
            (Some(x), Some(y)) => x.compare(y).unwrap_or(Ordering::Equal),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        let by_value = match self.direction {
            SortDirection::Asc => by_value,
            SortDirection::Desc => by_value.reverse(),
        };
        by_value.then_with(|| a.entity_id.as_bytes().cmp(b.entity_id.as_bytes()))
    }
}

// ---------------------------------------------------------------------------
// Descriptor
// ---------------------------------------------------------------------------

/// Opaque resume position handed out with a [`QueryPage`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContinuationToken(String);

impl ContinuationToken {
    /// Wraps a token string previously obtained from [`as_str`](Self::as_str),
    /// for example after a round trip through an HTTP query parameter.
    #[must_use]
    pub fn from_string(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContinuationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// "Find entities of type T matching clauses C", optionally sorted and paged.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryDescriptor {
    pub entity_type: EntityMetadataType,
    /// ANDed together, evaluated in order.
    pub clauses: Vec<Clause>,
    pub sort: Option<SortSpec>,
    pub continuation: Option<ContinuationToken>,
    pub page_size: Option<u32>,
}

impl QueryDescriptor {
    /// All records of `entity_type`, natural order, default page size.
    #[must_use]
    pub fn new(entity_type: EntityMetadataType) -> Self {
        Self {
            entity_type,
            clauses: Vec::new(),
            sort: None,
            continuation: None,
            page_size: None,
        }
    }

    #[must_use]
    pub fn filter(mut self, clause: Clause) -> Self {
        self.clauses.push(clause);
        self
    }

    #[must_use]
    pub fn where_eq(self, field: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.filter(Clause::eq(field, value))
    }

    #[must_use]
    pub fn sort_by(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.sort = Some(SortSpec {
            field: field.into(),
            direction,
        });
        self
    }

    #[must_use]
    pub fn page_size(mut self, size: u32) -> Self {
        self.page_size = Some(size);
        self
    }

    /// Resumes after the page that returned `token`.
    #[must_use]
    pub fn continue_from(mut self, token: Option<ContinuationToken>) -> Self {
        self.continuation = token;
        self
    }

    /// Checks the descriptor and returns the effective page size.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::InvalidQuery`] for invalid field names,
    /// clauses incompatible with the schema, a non-orderable sort field, or a
    /// page size of `0` or above [`MAX_PAGE_SIZE`].
    pub fn validate(&self, schema: Option<&FieldSchema>) -> ProviderResult<usize> {
        for clause in &self.clauses {
            clause.check(schema)?;
        }
        if let Some(sort) = &self.sort {
            if !is_valid_field_name(&sort.field) {
                return Err(ProviderError::invalid_query(format!(
                    "'{}' is not a valid sort field",
                    sort.field
                )));
            }
            if let Some(schema) = schema {
                match schema.field_type(&sort.field) {
                    None => {
                        return Err(ProviderError::invalid_query(format!(
                            "sort field '{}' is not declared for {}",
                            sort.field, schema.entity_type
                        )))
                    }
                    Some(ty) if !ty.is_orderable() => {
                        return Err(ProviderError::invalid_query(format!(
                            "cannot sort on {ty} field '{}'",
                            sort.field
                        )))
                    }
                    Some(_) => {}
                }
            }
        }
        let size = self.page_size.unwrap_or(DEFAULT_PAGE_SIZE);
        if size == 0 || size > MAX_PAGE_SIZE {
            return Err(ProviderError::invalid_query(format!(
                "page size must be between 1 and {MAX_PAGE_SIZE}, got {size}"
            )));
        }
        Ok(size as usize)
    }

    /// Whether a record satisfies every clause.
    #[must_use]
    pub fn matches(&self, record: &EntityMetadata) -> bool {
        self.clauses.iter().all(|clause| clause.matches(&record.fields))
    }

    /// Stable hash of the parts that define the result set: type, clauses
    /// and sort. Page size and continuation are excluded.
    #[must_use]
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = Fnv1a64::new();
        hasher.write_str(self.entity_type.as_str());
        for clause in &self.clauses {
            hasher.write_str(&clause.field);
            hasher.write_str(clause.op.as_sql());
            hash_value(&mut hasher, &clause.value);
        }
        if let Some(sort) = &self.sort {
            hasher.write_str(&sort.field);
            hasher.write_str(match sort.direction {
                SortDirection::Asc => "asc",
                SortDirection::Desc => "desc",
            });
        }
        hasher.finish()
    }
}

/// Feeds a type tag and the exact value, so non-finite numbers stay distinct.
fn hash_value(hasher: &mut Fnv1a64, value: &FieldValue) {
    fn write_bytes(hasher: &mut Fnv1a64, bytes: &[u8]) {
        hasher.write_u64(bytes.len() as u64);
        hasher.write(bytes);
    }

    match value {
        FieldValue::String(s) => {
            hasher.write(&[0]);
            write_bytes(hasher, s.as_bytes());
        }
        FieldValue::Number(n) => {
            hasher.write(&[1]);
            hasher.write_u64(n.to_bits());
        }
        FieldValue::Boolean(b) => hasher.write(&[2, u8::from(*b)]),
        FieldValue::Date(ms) => {
            hasher.write(&[3]);
            hasher.write(&ms.to_le_bytes());
        }
        FieldValue::StringArray(items) => {
            hasher.write(&[4]);
            hasher.write_u64(items.len() as u64);
            for item in items {
                write_bytes(hasher, item.as_bytes());
            }
        }
    }
}

/// One page of query results.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryPage {
    pub items: Vec<EntityMetadata>,
    /// Present when more results may follow.
    pub continuation: Option<ContinuationToken>,
}

impl QueryPage {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            continuation: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Continuation tokens
// ---------------------------------------------------------------------------

/// Where a backend resumes a query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CursorPosition {
    /// Resume strictly after this key in natural key order.
    AfterKey(String),
    /// Resume strictly after this insertion sequence number.
    AfterSequence(u64),
    /// Skip this many records of the sorted result.
    Offset(u64),
}

#[derive(Debug, Serialize, Deserialize)]
struct TokenEnvelope {
    #[serde(rename = "p")]
    provider: String,
    #[serde(rename = "i")]
    instance: String,
    #[serde(rename = "f")]
    fingerprint: u64,
    #[serde(rename = "c")]
    position: CursorPosition,
}

/// Issues and checks continuation tokens on behalf of one provider instance.
#[derive(Debug, Clone)]
pub struct TokenIssuer {
    provider: String,
    instance: String,
}

impl TokenIssuer {
    /// `provider` names the backend kind; `instance` must be unique per
    /// provider instance for the life of the process.
    #[must_use]
    pub fn new(provider: impl Into<String>, instance: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            instance: instance.into(),
        }
    }

    /// Encodes a resume position for `descriptor`.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Backend`] if the envelope cannot be encoded.
    pub fn issue(
        &self,
        descriptor: &QueryDescriptor,
        position: CursorPosition,
    ) -> ProviderResult<ContinuationToken> {
        let envelope = TokenEnvelope {
            provider: self.provider.clone(),
            instance: self.instance.clone(),
            fingerprint: descriptor.fingerprint(),
            position,
        };
        let bytes = rmp_serde::to_vec_named(&envelope)
            .map_err(|e| ProviderError::backend(format!("encode continuation token: {e}")))?;
        Ok(ContinuationToken(URL_SAFE_NO_PAD.encode(bytes)))
    }

    /// Decodes the descriptor's continuation token, if any.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::InvalidQuery`] if the token is malformed or
    /// was issued by another provider instance or for another query.
    pub fn resume(&self, descriptor: &QueryDescriptor) -> ProviderResult<Option<CursorPosition>> {
        let Some(token) = &descriptor.continuation else {
            return Ok(None);
        };
        let bytes = URL_SAFE_NO_PAD
            .decode(token.as_str())
            .map_err(|_| ProviderError::invalid_query("continuation token is not valid base64"))?;
        let envelope: TokenEnvelope = rmp_serde::from_slice(&bytes)
            .map_err(|_| ProviderError::invalid_query("continuation token is malformed"))?;
        if envelope.provider != self.provider || envelope.instance != self.instance {
            return Err(ProviderError::invalid_query(
                "continuation token was issued by a different provider instance",
            ));
        }
        if envelope.fingerprint != descriptor.fingerprint() {
            return Err(ProviderError::invalid_query(
                "continuation token was issued for a different query",
            ));
        }
        Ok(Some(envelope.position))
    }
}

/// Cuts one page out of an already filtered and sorted result.
///
/// Returns the page and, when records remain, the offset of the next page.
#[must_use]
pub fn slice_page(
    sorted: Vec<EntityMetadata>,
    offset: usize,
    page_size: usize,
) -> (Vec<EntityMetadata>, Option<u64>) {
    let total = sorted.len();
    let page: Vec<EntityMetadata> = sorted.into_iter().skip(offset).take(page_size).collect();
    let next = offset + page.len();
    if next < total {
        (page, Some(next as u64))
    } else {
        (page, None)
    }
}
