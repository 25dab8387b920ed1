//! Field normalization: raw export values to typed canonical values.
//!
//! Every function here is total. Unusable input degrades to an empty/zero
//! value, or for dates to "now" with a flag the caller is expected to log.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, Offset, TimeZone, Utc};
use lrc_core::{EntityTask, FieldKind, FieldSpec, FieldValue, RawNode, Vocabulary};
use serde_json::Value as JsonValue;

const DATE_ONLY_LEN: usize = 10;
const DATE_TIME_MIN_LEN: usize = 19;

const DATE_ONLY_FORMATS: &[&str] = &["%Y-%m-%d", "%d.%m.%Y"];
const DATE_TIME_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%d.%m.%Y %H:%M:%S"];

/// Trimmed text of a raw value.
///
/// Single-element lists produced by the source reader collapse to their
/// first element; objects contribute their `#text` node if they have one.
pub fn scalar_text(value: Option<&RawNode>) -> String {
    match value {
        None | Some(JsonValue::Null) => String::new(),
        Some(JsonValue::String(s)) => s.trim().to_string(),
        Some(JsonValue::Number(n)) => n.to_string(),
        Some(JsonValue::Bool(b)) => b.to_string(),
        Some(JsonValue::Array(items)) => scalar_text(items.first()),
        Some(JsonValue::Object(map)) => scalar_text(map.get("#text")),
    }
}

/// Parses a decimal that may use a comma as decimal separator.
pub fn parse_decimal(text: &str) -> Option<f64> {
    let compact: String = text
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '\u{a0}')
        .collect();
    if !compact.chars().any(|c| c.is_ascii_digit()) {
        return None;
    }
    let normalized = if compact.contains(',') && compact.contains('.') {
        compact.replace('.', "").replace(',', ".")
    } else {
        compact.replace(',', ".")
    };
    if !normalized
        .chars()
        .all(|c| c.is_ascii_digit() || matches!(c, '.' | '-' | '+'))
    {
        return None;
    }
    normalized.parse::<f64>().ok().filter(|v| v.is_finite())
}

pub fn decimal_or_zero(text: &str) -> f64 {
    parse_decimal(text).unwrap_or(0.0)
}

pub fn integer_or_zero(text: &str) -> i64 {
    let trimmed = text.trim();
    trimmed
        .parse::<i64>()
        .ok()
        .or_else(|| parse_decimal(trimmed).map(|v| v.trunc() as i64))
        .unwrap_or(0)
}

pub fn parse_boolean(text: &str) -> bool {
    matches!(
        text.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "y" | "да" | "истина"
    )
}

/// Parses the two legacy date shapes into an instant.
///
/// Ten-character tokens are dates at local midnight; tokens of at least
/// nineteen characters are date-times (anything after the seconds, such as
/// fractional parts, is ignored unless the token is full RFC 3339).
pub fn parse_timestamp(text: &str, source_offset: FixedOffset) -> Option<DateTime<Utc>> {
    let trimmed = text.trim();
    let len = trimmed.chars().count();
    if len == DATE_ONLY_LEN {
        return DATE_ONLY_FORMATS
            .iter()
            .find_map(|fmt| NaiveDate::parse_from_str(trimmed, fmt).ok())
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .and_then(|naive| localize(naive, source_offset));
    }
    if len >= DATE_TIME_MIN_LEN {
        if let Ok(ts) = DateTime::parse_from_rfc3339(trimmed) {
            return Some(ts.with_timezone(&Utc));
        }
        let head: String = trimmed.chars().take(DATE_TIME_MIN_LEN).collect();
        return DATE_TIME_FORMATS
            .iter()
            .find_map(|fmt| NaiveDateTime::parse_from_str(&head, fmt).ok())
            .and_then(|naive| localize(naive, source_offset));
    }
    None
}

fn localize(naive: NaiveDateTime, offset: FixedOffset) -> Option<DateTime<Utc>> {
    offset
        .from_local_datetime(&naive)
        .single()
        .map(|ts| ts.with_timezone(&Utc))
}

/// Date parse result; `defaulted` is set when the input was unusable and
/// `value` fell back to the current time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DateOutcome {
    pub value: DateTime<Utc>,
    pub defaulted: bool,
}

pub fn timestamp_or_now(text: &str, source_offset: FixedOffset) -> DateOutcome {
    match parse_timestamp(text, source_offset) {
        Some(value) => DateOutcome {
            value,
            defaulted: false,
        },
        None => DateOutcome {
            value: Utc::now(),
            defaulted: true,
        },
    }
}

pub fn translate(vocabulary: &Vocabulary, label: &str) -> String {
    let wanted = label.trim().to_lowercase();
    vocabulary
        .labels
        .iter()
        .find(|(k, _)| k.trim().to_lowercase() == wanted)
        .map(|(_, v)| v.clone())
        .or_else(|| vocabulary.default.clone())
        .unwrap_or_else(|| label.trim().to_string())
}

fn round_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub value: FieldValue,
    pub defaulted: bool,
}

/// Applies a task's field declarations to raw and stored values.
#[derive(Debug, Clone, Copy)]
pub struct FieldNormalizer<'t> {
    task: &'t EntityTask,
}

impl<'t> FieldNormalizer<'t> {
    pub fn new(task: &'t EntityTask) -> Self {
        Self { task }
    }

    /// Normalizes a value coming out of the legacy export.
    ///
    /// Absent or empty input becomes `Null` for dates (there is nothing to
    /// default) and the empty/zero value for other kinds.
    pub fn normalize_source(&self, spec: &FieldSpec, raw: Option<&RawNode>) -> Normalized {
        let text = scalar_text(raw);
        let plain = |value| Normalized {
            value,
            defaulted: false,
        };
        match spec.kind {
            FieldKind::Text => {
                let text = match spec
                    .vocabulary
                    .as_ref()
                    .and_then(|name| self.task.vocabularies.get(name))
                {
                    Some(vocab) if !text.is_empty() => translate(vocab, &text),
                    _ => text,
                };
                plain(FieldValue::Text(text))
            }
            FieldKind::Integer => plain(FieldValue::Integer(integer_or_zero(&text))),
            FieldKind::Decimal => {
                let mut value = decimal_or_zero(&text);
                if let Some(multiplier) = spec.multiplier {
                    value = round_cents(value * multiplier);
                }
                plain(FieldValue::Decimal(value))
            }
            FieldKind::Boolean => plain(FieldValue::Boolean(parse_boolean(&text))),
            FieldKind::Timestamp if text.is_empty() => plain(FieldValue::Null),
            FieldKind::Timestamp => {
                let outcome = timestamp_or_now(&text, self.task.source_offset());
                Normalized {
                    value: FieldValue::Timestamp(outcome.value),
                    defaulted: outcome.defaulted,
                }
            }
        }
    }

    /// Normalizes a value read back from the target store.
    ///
    /// Store nulls stay null and unreadable dates become null: the store is
    /// never "defaulted" to now. Zone-less stored timestamps are UTC, the
    /// zone every write uses; the legacy offset only applies to source text.
    pub fn normalize_stored(&self, kind: FieldKind, value: &JsonValue) -> FieldValue {
        if value.is_null() {
            return FieldValue::Null;
        }
        match (kind, value) {
            (FieldKind::Decimal, JsonValue::Number(n)) => {
                FieldValue::Decimal(n.as_f64().unwrap_or(0.0))
            }
            (FieldKind::Integer, JsonValue::Number(n)) => FieldValue::Integer(
                n.as_i64()
                    .or_else(|| n.as_f64().map(|v| v.trunc() as i64))
                    .unwrap_or(0),
            ),
            (FieldKind::Boolean, JsonValue::Bool(b)) => FieldValue::Boolean(*b),
            _ => {
                let text = scalar_text(Some(value));
                match kind {
                    FieldKind::Text => FieldValue::Text(text),
                    FieldKind::Integer => FieldValue::Integer(integer_or_zero(&text)),
                    FieldKind::Decimal => FieldValue::Decimal(decimal_or_zero(&text)),
                    FieldKind::Boolean => FieldValue::Boolean(parse_boolean(&text)),
                    FieldKind::Timestamp => parse_timestamp(&text, Utc.fix())
                        .map(FieldValue::Timestamp)
                        .unwrap_or(FieldValue::Null),
                }
            }
        }
    }
}
