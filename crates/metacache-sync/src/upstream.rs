//! # Upstream Boundary
//!
//! The metadata service this cache sits in front of, seen through the
//! three calls the sync engine needs. Transport, authentication and OData
//! URL building live behind [`MetadataSource`] implementations.
//!
//! ## Page Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  fetch_metadata_page(kind, { continuation: None })                     │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  RawPage { records: [ {Name, PublicEntityName, ...}, ... ],            │
//! │            next: Some("skiptoken=100"), total: Some(2400) }            │
//! │       │                                                                 │
//! │       ├──► decode_page(kind, &page) ──► Vec<MetadataRecord>            │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  fetch_metadata_page(kind, { continuation: Some("skiptoken=100") })    │
//! │       ...until next == None                                            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Decoding
//! Records arrive as OData-style JSON objects. Decoding is lenient about
//! optional fields and strict about identity: an object without a `Name`
//! is [`UpstreamError::Malformed`], which fails the sync without retries.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use thiserror::Error;

use metacache_core::{
    ActionParameter, ActionRecord, Capabilities, DataEntityRecord, EnumMember,
    EnumerationRecord, KeyDescriptor, LabelKey, LabelRecord, MetadataRecord, MetadataVersion,
    RecordHeader, RecordKind,
};

// =============================================================================
// Errors
// =============================================================================

/// Failures reported by a [`MetadataSource`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UpstreamError {
    /// Network failure, 5xx, connection reset.
    #[error("upstream unavailable: {0}")]
    Unavailable(String),

    #[error("upstream timed out: {0}")]
    Timeout(String),

    /// 429; honour `retry_after_secs` when present.
    #[error("upstream rate limited")]
    RateLimited { retry_after_secs: Option<u64> },

    /// Authentication or validation failure (4xx).
    #[error("upstream rejected request: {0}")]
    Rejected(String),

    /// The response could not be understood.
    #[error("malformed upstream payload: {0}")]
    Malformed(String),
}

impl UpstreamError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            UpstreamError::Unavailable(_)
                | UpstreamError::Timeout(_)
                | UpstreamError::RateLimited { .. }
        )
    }
}

// =============================================================================
// Source Trait
// =============================================================================

/// Request for one page of a metadata collection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageRequest {
    /// Token returned by the previous page; `None` for the first page.
    pub continuation: Option<String>,
    /// Incremental syncs ask only for records modified after this instant.
    /// Sources may ignore it; results are filtered again locally.
    pub modified_since: Option<DateTime<Utc>>,
}

/// One page of undecoded records.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawPage {
    pub records: Vec<Value>,
    pub next: Option<String>,
    /// Collection size, when the source reports one.
    pub total: Option<u64>,
}

/// The upstream metadata endpoints.
#[async_trait]
pub trait MetadataSource: Send + Sync {
    async fn fetch_metadata_page(
        &self,
        kind: RecordKind,
        request: &PageRequest,
    ) -> Result<RawPage, UpstreamError>;

    async fn fetch_version(&self) -> Result<MetadataVersion, UpstreamError>;

    /// Resolves many labels in one round trip. Keys the source does not
    /// know are simply absent from the result.
    async fn fetch_labels_batch(
        &self,
        keys: &[LabelKey],
    ) -> Result<HashMap<LabelKey, String>, UpstreamError>;
}

// =============================================================================
// Decoding
// =============================================================================

/// Decodes every record of a page, failing on the first malformed one.
pub fn decode_page(kind: RecordKind, page: &RawPage) -> Result<Vec<MetadataRecord>, UpstreamError> {
    page.records.iter().map(|value| decode_record(kind, value)).collect()
}

/// Decodes one upstream JSON object into a record of `kind`.
pub fn decode_record(kind: RecordKind, value: &Value) -> Result<MetadataRecord, UpstreamError> {
    let obj = value
        .as_object()
        .ok_or_else(|| UpstreamError::Malformed(format!("{kind} record is not an object")))?;

    Ok(match kind {
        RecordKind::Label => return decode_label(obj),
        RecordKind::DataEntity => MetadataRecord::DataEntity(DataEntityRecord {
            header: decode_header(kind, obj)?,
        }),
        RecordKind::Action => MetadataRecord::Action(ActionRecord {
            header: decode_header(kind, obj)?,
            parameters: list(obj, "Parameters")
                .filter_map(|p| {
                    Some(ActionParameter {
                        name: text(p, "Name")?,
                        type_name: text(p, "Type").unwrap_or_default(),
                    })
                })
                .collect(),
            return_type: text(obj, "ReturnType"),
        }),
        RecordKind::Enumeration => MetadataRecord::Enumeration(EnumerationRecord {
            header: decode_header(kind, obj)?,
            members: list(obj, "Members")
                .filter_map(|m| {
                    Some(EnumMember {
                        name: text(m, "Name")?,
                        value: integer(m, "Value").unwrap_or_default(),
                        label_id: text(m, "LabelId"),
                    })
                })
                .collect(),
        }),
    })
}

fn decode_header(kind: RecordKind, obj: &Map<String, Value>) -> Result<RecordHeader, UpstreamError> {
    let name = text(obj, "Name")
        .ok_or_else(|| UpstreamError::Malformed(format!("{kind} record without Name")))?;

    Ok(RecordHeader {
        name,
        public_name: text(obj, "PublicEntityName").or_else(|| text(obj, "PublicName")),
        collection_name: text(obj, "PublicCollectionName").or_else(|| text(obj, "EntitySetName")),
        category: text(obj, "EntityCategory").or_else(|| text(obj, "BindingKind")),
        capabilities: Capabilities {
            service_enabled: flag(obj, "DataServiceEnabled"),
            data_management_enabled: flag(obj, "DataManagementEnabled"),
            read_only: flag(obj, "IsReadOnly"),
        },
        label_id: text(obj, "LabelId"),
        label_text: None,
        key: KeyDescriptor::new(key_fields(obj)),
        modified_at: text(obj, "ModifiedDateTime")
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc)),
    })
}

fn decode_label(obj: &Map<String, Value>) -> Result<MetadataRecord, UpstreamError> {
    let label_id = text(obj, "LabelId")
        .or_else(|| text(obj, "Id"))
        .ok_or_else(|| UpstreamError::Malformed("label without LabelId".to_string()))?;
    let language = text(obj, "Language")
        .ok_or_else(|| UpstreamError::Malformed(format!("label {label_id} without Language")))?;
    Ok(MetadataRecord::Label(LabelRecord {
        text: text(obj, "Value").or_else(|| text(obj, "Text")).unwrap_or_default(),
        label_id,
        language,
    }))
}

fn text(obj: &Map<String, Value>, field: &str) -> Option<String> {
    obj.get(field)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Booleans arrive either as JSON booleans or as `"Yes"` / `"No"` enum text.
fn flag(obj: &Map<String, Value>, field: &str) -> bool {
    match obj.get(field) {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => matches!(s.to_ascii_lowercase().as_str(), "yes" | "true"),
        _ => false,
    }
}

fn integer(obj: &Map<String, Value>, field: &str) -> Option<i64> {
    match obj.get(field)? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn list<'a>(obj: &'a Map<String, Value>, field: &str) -> impl Iterator<Item = &'a Map<String, Value>> {
    obj.get(field)
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_object)
}

/// `Keys` is either `["A", "B"]` or `[{"Name": "A"}, ...]`.
fn key_fields(obj: &Map<String, Value>) -> Vec<String> {
    obj.get("Keys")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|k| match k {
            Value::String(s) => Some(s.clone()),
            Value::Object(o) => text(o, "Name"),
            _ => None,
        })
        .collect()
}

// =============================================================================
// Unit Tests
// =============================================================================
