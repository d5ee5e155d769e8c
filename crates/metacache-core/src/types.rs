//! # Domain Types
//!
//! Core domain types shared by every tier of the cache.
//!
//! ## Type Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │  Environment    │   │ MetadataVersion │   │   RecordKind    │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  id (internal)  │   │  app version    │   │  DataEntity     │       │
//! │  │  base_url       │   │  platform ver.  │   │  Action         │       │
//! │  │  current ver.   │   │  builds         │   │  Enumeration    │       │
//! │  │  last_sync_at   │   │  fingerprint()  │   │  Label          │       │
//! │  └─────────────────┘   └─────────────────┘   └─────────────────┘       │
//! │                                                                         │
//! │  MetadataRecord (closed, tagged)                                       │
//! │  ├── DataEntity(DataEntityRecord)   header + nothing else              │
//! │  ├── Action(ActionRecord)           header + parameters, return type   │
//! │  ├── Enumeration(EnumerationRecord) header + members                   │
//! │  └── Label(LabelRecord)             (label id, language) → text        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Upstream responses are decoded into these variants at the boundary;
//! nothing past the boundary handles untyped maps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Internal identifier of an environment row in the relational tier.
pub type EnvironmentId = i64;

/// Internal identifier of a metadata version row in the relational tier.
pub type VersionId = i64;

// =============================================================================
// Record Kind
// =============================================================================

/// The kinds of metadata the cache stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    DataEntity,
    Action,
    Enumeration,
    Label,
}

impl RecordKind {
    /// Kinds stored in the relational record table, in sync order.
    ///
    /// Labels are not in this list: they are resolved after the kinds that
    /// reference them.
    pub const SYNC_ORDER: [RecordKind; 3] = [
        RecordKind::DataEntity,
        RecordKind::Action,
        RecordKind::Enumeration,
    ];

    /// Stable string form used in keys, file names and SQL.
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::DataEntity => "data_entity",
            RecordKind::Action => "action",
            RecordKind::Enumeration => "enumeration",
            RecordKind::Label => "label",
        }
    }

    /// Returns true for kinds that live in the record table and the search index.
    pub fn is_indexed(&self) -> bool {
        !matches!(self, RecordKind::Label)
    }
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RecordKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "data_entity" | "dataentity" | "entity" => Ok(RecordKind::DataEntity),
            "action" => Ok(RecordKind::Action),
            "enumeration" | "enum" => Ok(RecordKind::Enumeration),
            "label" => Ok(RecordKind::Label),
            other => Err(CoreError::UnknownRecordKind(other.to_string())),
        }
    }
}

// =============================================================================
// Record Header
// =============================================================================

/// Capability flags reported by the upstream metadata service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub service_enabled: bool,
    pub data_management_enabled: bool,
    pub read_only: bool,
}

/// Key descriptor of a record: one field for a simple key, several for a
/// composite key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyDescriptor {
    pub fields: Vec<String>,
}

impl KeyDescriptor {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        KeyDescriptor {
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_composite(&self) -> bool {
        self.fields.len() > 1
    }
}

/// The denormalized projection shared by entity, action and enumeration records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordHeader {
    /// Natural key, unique within (environment, version, kind).
    pub name: String,

    /// Public (OData) name, if the record is exposed publicly.
    pub public_name: Option<String>,

    /// Collection (entity set) name.
    pub collection_name: Option<String>,

    pub category: Option<String>,

    #[serde(default)]
    pub capabilities: Capabilities,

    pub label_id: Option<String>,

    /// Resolved label text; `None` until the label phase of a sync ran.
    pub label_text: Option<String>,

    #[serde(default)]
    pub key: KeyDescriptor,

    /// Upstream last-modified marker, used by incremental syncs.
    pub modified_at: Option<DateTime<Utc>>,
}

impl RecordHeader {
    pub fn named(name: impl Into<String>) -> Self {
        RecordHeader {
            name: name.into(),
            ..Default::default()
        }
    }

    /// The text fields the search index covers.
    pub fn indexed_fields(&self) -> IndexedFields {
        IndexedFields {
            name: self.name.clone(),
            public_name: self.public_name.clone(),
            collection_name: self.collection_name.clone(),
            label_text: self.label_text.clone(),
            category: self.category.clone(),
        }
    }
}

/// Snapshot of the indexed text fields of a record.
///
/// Two snapshots comparing equal means the search index entry is still valid.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexedFields {
    pub name: String,
    pub public_name: Option<String>,
    pub collection_name: Option<String>,
    pub label_text: Option<String>,
    pub category: Option<String>,
}

impl IndexedFields {
    /// Field name / value pairs in ranking weight order, skipping empty fields.
    pub fn weighted(&self) -> Vec<(&'static str, &str)> {
        let mut fields = vec![("name", self.name.as_str())];
        let optional = [
            ("public_name", &self.public_name),
            ("collection_name", &self.collection_name),
            ("label_text", &self.label_text),
            ("category", &self.category),
        ];
        for (field, value) in optional {
            if let Some(value) = value.as_deref().filter(|v| !v.is_empty()) {
                fields.push((field, value));
            }
        }
        fields
    }
}

// =============================================================================
// Record Variants
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataEntityRecord {
    #[serde(flatten)]
    pub header: RecordHeader,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionParameter {
    pub name: String,
    pub type_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionRecord {
    #[serde(flatten)]
    pub header: RecordHeader,
    #[serde(default)]
    pub parameters: Vec<ActionParameter>,
    pub return_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnumMember {
    pub name: String,
    pub value: i64,
    pub label_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnumerationRecord {
    #[serde(flatten)]
    pub header: RecordHeader,
    #[serde(default)]
    pub members: Vec<EnumMember>,
}

/// A resolved label. Immutable once resolved for a given (id, language).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelRecord {
    pub label_id: String,
    pub language: String,
    pub text: String,
}

impl LabelRecord {
    pub fn key(&self) -> LabelKey {
        LabelKey::new(self.label_id.clone(), self.language.clone())
    }
}

/// Lookup key of a label: (label identifier, language tag).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LabelKey {
    pub label_id: String,
    pub language: String,
}

impl LabelKey {
    pub fn new(label_id: impl Into<String>, language: impl Into<String>) -> Self {
        LabelKey {
            label_id: label_id.into(),
            language: language.into(),
        }
    }

    /// Parses the `language/label_id` form used as a `get(Label, key)` key.
    pub fn parse(key: &str) -> Result<Self, CoreError> {
        match key.split_once('/') {
            Some((language, label_id)) if !language.is_empty() && !label_id.is_empty() => {
                Ok(LabelKey::new(label_id, language))
            }
            _ => Err(CoreError::InvalidLabelKey(key.to_string())),
        }
    }
}

impl std::fmt::Display for LabelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.language, self.label_id)
    }
}

/// A metadata record of any kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MetadataRecord {
    DataEntity(DataEntityRecord),
    Action(ActionRecord),
    Enumeration(EnumerationRecord),
    Label(LabelRecord),
}

impl MetadataRecord {
    pub fn kind(&self) -> RecordKind {
        match self {
            MetadataRecord::DataEntity(_) => RecordKind::DataEntity,
            MetadataRecord::Action(_) => RecordKind::Action,
            MetadataRecord::Enumeration(_) => RecordKind::Enumeration,
            MetadataRecord::Label(_) => RecordKind::Label,
        }
    }

    /// The lookup key of the record: its name, or `language/label_id` for labels.
    pub fn key(&self) -> String {
        match self {
            MetadataRecord::Label(label) => label.key().to_string(),
            other => other.name().to_string(),
        }
    }

    /// The natural name of the record (label id for labels).
    pub fn name(&self) -> &str {
        match self {
            MetadataRecord::DataEntity(r) => &r.header.name,
            MetadataRecord::Action(r) => &r.header.name,
            MetadataRecord::Enumeration(r) => &r.header.name,
            MetadataRecord::Label(r) => &r.label_id,
        }
    }

    pub fn header(&self) -> Option<&RecordHeader> {
        match self {
            MetadataRecord::DataEntity(r) => Some(&r.header),
            MetadataRecord::Action(r) => Some(&r.header),
            MetadataRecord::Enumeration(r) => Some(&r.header),
            MetadataRecord::Label(_) => None,
        }
    }

    pub fn header_mut(&mut self) -> Option<&mut RecordHeader> {
        match self {
            MetadataRecord::DataEntity(r) => Some(&mut r.header),
            MetadataRecord::Action(r) => Some(&mut r.header),
            MetadataRecord::Enumeration(r) => Some(&mut r.header),
            MetadataRecord::Label(_) => None,
        }
    }

    /// Label ids this record references (its own label and enum member labels).
    pub fn referenced_labels(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self
            .header()
            .and_then(|h| h.label_id.as_deref())
            .into_iter()
            .collect();
        if let MetadataRecord::Enumeration(e) = self {
            ids.extend(e.members.iter().filter_map(|m| m.label_id.as_deref()));
        }
        ids
    }
}

// =============================================================================
// Versions and Environments
// =============================================================================

/// Identity of one generation of an environment's metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MetadataVersion {
    pub application_version: String,
    pub platform_version: String,
    pub application_build: String,
    pub platform_build: String,
}

impl MetadataVersion {
    /// Stable identity string; two versions with the same fingerprint hold
    /// the same metadata.
    pub fn fingerprint(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.application_version,
            self.platform_version,
            self.application_build,
            self.platform_build
        )
    }
}

impl std::fmt::Display for MetadataVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "app {} ({}) / platform {} ({})",
            self.application_version,
            self.application_build,
            self.platform_version,
            self.platform_build
        )
    }
}

/// A version row as stored in the relational tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredVersion {
    pub id: VersionId,
    pub environment_id: EnvironmentId,
    pub version: MetadataVersion,
    pub first_seen_at: DateTime<Utc>,
}

/// A remote ERP environment, identified by its base URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct Environment {
    pub id: EnvironmentId,
    pub base_url: String,
    pub current_version_id: Option<VersionId>,
    pub created_at: DateTime<Utc>,
    /// Start time of the last successful sync session.
    pub last_sync_at: Option<DateTime<Utc>>,
}

impl Environment {
    pub fn has_synced(&self) -> bool {
        self.last_sync_at.is_some()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
