//! Core data model and task configuration for legacy reconciliation.

use std::collections::BTreeMap;

use chrono::{DateTime, FixedOffset, Offset, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "lrc-core";

/// Untyped nested tree handed over by a source reader.
pub type RawNode = JsonValue;

/// Typed scalar held by a canonical record or a stored row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Null,
    Text(String),
    Integer(i64),
    Decimal(f64),
    Timestamp(DateTime<Utc>),
    Boolean(bool),
}

impl FieldValue {
    pub fn is_blank(&self) -> bool {
        match self {
            FieldValue::Null => true,
            FieldValue::Text(s) => s.trim().is_empty(),
            _ => false,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Integer(v) => Some(*v as f64),
            FieldValue::Decimal(v) => Some(*v),
            _ => None,
        }
    }

    /// Value-semantic equality used by the differ.
    ///
    /// Blank text and null are the same value; integers and decimals compare
    /// numerically within `tolerance`; timestamps compare as instants.
    pub fn matches(&self, other: &FieldValue, tolerance: f64) -> bool {
        if self.is_blank() && other.is_blank() {
            return true;
        }
        match (self, other) {
            (FieldValue::Text(a), FieldValue::Text(b)) => a == b,
            (FieldValue::Boolean(a), FieldValue::Boolean(b)) => a == b,
            (FieldValue::Timestamp(a), FieldValue::Timestamp(b)) => a == b,
            (FieldValue::Integer(a), FieldValue::Integer(b)) => a == b,
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => (x - y).abs() <= tolerance,
                _ => false,
            },
        }
    }

    /// JSON form written to stores and reports.
    pub fn to_json(&self) -> JsonValue {
        match self {
            FieldValue::Null => JsonValue::Null,
            FieldValue::Text(s) => JsonValue::String(s.clone()),
            FieldValue::Integer(v) => JsonValue::from(*v),
            FieldValue::Decimal(v) => serde_json::Number::from_f64(*v)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            FieldValue::Timestamp(ts) => JsonValue::String(ts.to_rfc3339()),
            FieldValue::Boolean(v) => JsonValue::Bool(*v),
        }
    }
}

impl std::fmt::Display for FieldValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldValue::Null => write!(f, "null"),
            FieldValue::Text(s) => write!(f, "{s}"),
            FieldValue::Integer(v) => write!(f, "{v}"),
            FieldValue::Decimal(v) => write!(f, "{v}"),
            FieldValue::Timestamp(ts) => write!(f, "{}", ts.to_rfc3339()),
            FieldValue::Boolean(v) => write!(f, "{v}"),
        }
    }
}

/// Flat normalized representation of one legacy entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub legacy_id: String,
    /// Values keyed by target column name.
    pub fields: BTreeMap<String, FieldValue>,
    /// Raw auxiliary text kept for correction flows (e.g. contact notes).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extras: BTreeMap<String, String>,
    /// Columns whose date input was unparsable and defaulted to "now".
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub defaulted: Vec<String>,
}

impl CanonicalRecord {
    pub fn get(&self, column: &str) -> Option<&FieldValue> {
        self.fields.get(column)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    Insert,
    Update,
}

/// One pending write against the target store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    pub kind: MutationKind,
    pub legacy_id: String,
    pub target_id: String,
    /// Columns to write. Updates only carry the columns that are meant to change.
    pub values: BTreeMap<String, FieldValue>,
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("task {task}: {message}")]
    Invalid { task: String, message: String },
    #[error("id convention template {0:?} must contain exactly one {{id}} placeholder")]
    Template(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    #[default]
    Text,
    Integer,
    Decimal,
    Timestamp,
    Boolean,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    /// Field name in the legacy record.
    pub source: String,
    /// Column name in the target store.
    pub column: String,
    #[serde(default)]
    pub kind: FieldKind,
    /// Name of a vocabulary translating legacy labels to canonical codes.
    #[serde(default)]
    pub vocabulary: Option<String>,
    /// Applied to decimal values after parsing (e.g. a markup factor).
    #[serde(default)]
    pub multiplier: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Vocabulary {
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub default: Option<String>,
}

/// Target identifier naming convention such as `client-{id}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdConvention {
    pub name: String,
    pub template: String,
}

impl IdConvention {
    pub fn new(name: impl Into<String>, template: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            template: template.into(),
        }
    }

    fn parts(&self) -> Result<(&str, &str), ConfigError> {
        let mut split = self.template.splitn(2, "{id}");
        let prefix = split.next().unwrap_or_default();
        match split.next() {
            Some(suffix) if !suffix.contains("{id}") => Ok((prefix, suffix)),
            _ => Err(ConfigError::Template(self.template.clone())),
        }
    }

    /// Extracts the numeric legacy id from a target id following this convention.
    pub fn parse(&self, target_id: &str) -> Option<String> {
        let (prefix, suffix) = self.parts().ok()?;
        let rest = target_id.strip_prefix(prefix)?.strip_suffix(suffix)?;
        if !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()) {
            Some(rest.to_string())
        } else {
            None
        }
    }

    pub fn format(&self, legacy_id: &str) -> String {
        self.template.replacen("{id}", legacy_id, 1)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.parts().map(|_| ())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BatchSettings {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_true")]
    pub exponential: bool,
    #[serde(default = "default_inter_batch_delay_ms")]
    pub inter_batch_delay_ms: u64,
    /// Batches in flight at once; 1 applies them strictly in order.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

fn default_batch_size() -> usize {
    500
}

fn default_max_retries() -> usize {
    3
}

fn default_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    8_000
}

fn default_true() -> bool {
    true
}

fn default_inter_batch_delay_ms() -> u64 {
    200
}

fn default_concurrency() -> usize {
    1
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            backoff_ms: default_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            exponential: true,
            inter_batch_delay_ms: default_inter_batch_delay_ms(),
            concurrency: default_concurrency(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NameRepairSettings {
    /// Legacy field holding free-text notes.
    pub notes_field: String,
    /// Target column holding the display name.
    pub name_column: String,
    /// Stored names treated as "no real name yet".
    #[serde(default)]
    pub placeholders: Vec<String>,
}

/// Everything the engine needs to reconcile one entity type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityTask {
    pub name: String,
    /// Target table / resource name.
    pub entity: String,
    #[serde(default = "default_key_column")]
    pub key_column: String,
    /// Object keys leading from the export root to the entity collection.
    pub source_path: Vec<String>,
    pub legacy_id_field: String,
    /// Ordered; the first one is used to name newly inserted rows.
    pub conventions: Vec<IdConvention>,
    pub fields: Vec<FieldSpec>,
    /// Target columns compared by the differ.
    #[serde(default)]
    pub compare: Vec<String>,
    /// Target columns never written by update mutations.
    #[serde(default)]
    pub preserve: Vec<String>,
    #[serde(default)]
    pub vocabularies: BTreeMap<String, Vocabulary>,
    #[serde(default)]
    pub batch: BatchSettings,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_decimal_tolerance")]
    pub decimal_tolerance: f64,
    /// Offset of the legacy system's wall clock, in minutes east of UTC.
    #[serde(default)]
    pub source_utc_offset_minutes: i32,
    #[serde(default)]
    pub name_repair: Option<NameRepairSettings>,
}

fn default_key_column() -> String {
    "id".to_string()
}

fn default_page_size() -> usize {
    1000
}

fn default_decimal_tolerance() -> f64 {
    0.005
}

impl EntityTask {
    pub fn field_for_column(&self, column: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.column == column)
    }

    pub fn primary_convention(&self) -> Option<&IdConvention> {
        self.conventions.first()
    }

    pub fn source_offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.source_utc_offset_minutes * 60)
            .unwrap_or_else(|| Utc.fix())
    }

    /// Columns fetched into the store snapshot.
    pub fn snapshot_columns(&self) -> Vec<String> {
        let mut columns = vec![self.key_column.clone()];
        for column in &self.compare {
            if !columns.contains(column) {
                columns.push(column.clone());
            }
        }
        if let Some(repair) = &self.name_repair {
            if !columns.contains(&repair.name_column) {
                columns.push(repair.name_column.clone());
            }
        }
        columns
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: String| ConfigError::Invalid {
            task: self.name.clone(),
            message,
        };
        if self.entity.trim().is_empty() {
            return Err(invalid("entity must not be empty".into()));
        }
        if self.legacy_id_field.trim().is_empty() {
            return Err(invalid("legacy_id_field must not be empty".into()));
        }
        if self.conventions.is_empty() {
            return Err(invalid("at least one id convention is required".into()));
        }
        for convention in &self.conventions {
            convention.validate()?;
        }
        if self.batch.batch_size == 0 {
            return Err(invalid("batch.batch_size must be positive".into()));
        }
        if self.page_size == 0 {
            return Err(invalid("page_size must be positive".into()));
        }
        for column in &self.compare {
            if self.field_for_column(column).is_none() {
                return Err(invalid(format!("compare column {column} has no field spec")));
            }
        }
        for field in &self.fields {
            if let Some(vocab) = &field.vocabulary {
                if !self.vocabularies.contains_key(vocab) {
                    return Err(invalid(format!(
                        "field {} references unknown vocabulary {vocab}",
                        field.column
                    )));
                }
            }
        }
        if let Some(repair) = &self.name_repair {
            if self.field_for_column(&repair.name_column).is_none() {
                return Err(invalid(format!(
                    "name_repair column {} has no field spec",
                    repair.name_column
                )));
            }
        }
        Ok(())
    }
}
