use std::collections::BTreeMap;

use lrc_core::{CanonicalRecord, EntityTask, RawNode};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::warn;

use crate::normalize::{scalar_text, FieldNormalizer};
use crate::ExtractError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExtractStats {
    pub seen: usize,
    pub extracted: usize,
    /// Records without a usable legacy identifier.
    pub dropped: usize,
    pub defaulted_dates: usize,
}

/// Resolves `path` inside the export tree.
///
/// Arrays met along the way fan out, and a bare object where a collection is
/// expected counts as a one-element collection.
pub fn entity_nodes<'a>(tree: &'a RawNode, path: &[String]) -> Result<Vec<&'a RawNode>, ExtractError> {
    let mut current: Vec<&RawNode> = vec![tree];
    for segment in path {
        let mut next = Vec::new();
        let mut found = false;
        for node in current {
            for item in as_collection(node) {
                if let Some(child) = item.get(segment.as_str()) {
                    found = true;
                    next.push(child);
                }
            }
        }
        if !found {
            return Err(ExtractError::MissingPath(path.join("/")));
        }
        current = next;
    }
    Ok(current.into_iter().flat_map(as_collection).collect())
}

fn as_collection(node: &RawNode) -> Vec<&RawNode> {
    match node {
        JsonValue::Array(items) => items.iter().collect(),
        JsonValue::Null => Vec::new(),
        other => vec![other],
    }
}

/// Turns entity nodes of an export tree into canonical records for one task.
#[derive(Debug, Clone, Copy)]
pub struct SourceExtractor<'t> {
    task: &'t EntityTask,
    normalizer: FieldNormalizer<'t>,
}

impl<'t> SourceExtractor<'t> {
    pub fn new(task: &'t EntityTask) -> Self {
        Self {
            task,
            normalizer: FieldNormalizer::new(task),
        }
    }

    /// Lazily yields records. Each call starts from the first node again.
    pub fn extract<'a>(&'a self, tree: &'a RawNode) -> Result<Records<'a, 't>, ExtractError> {
        let nodes = entity_nodes(tree, &self.task.source_path)?;
        Ok(Records {
            extractor: self,
            nodes: nodes.into_iter(),
            stats: ExtractStats::default(),
        })
    }

    fn record_from(&self, node: &RawNode) -> Option<CanonicalRecord> {
        if !node.is_object() {
            return None;
        }
        let legacy_id = scalar_text(node.get(self.task.legacy_id_field.as_str()));
        if legacy_id.is_empty() {
            return None;
        }

        let mut fields = BTreeMap::new();
        let mut defaulted = Vec::new();
        for spec in &self.task.fields {
            let normalized = self
                .normalizer
                .normalize_source(spec, node.get(spec.source.as_str()));
            if normalized.defaulted {
                defaulted.push(spec.column.clone());
            }
            fields.insert(spec.column.clone(), normalized.value);
        }

        let mut extras = BTreeMap::new();
        if let Some(repair) = &self.task.name_repair {
            extras.insert(
                repair.notes_field.clone(),
                notes_text(node.get(repair.notes_field.as_str())),
            );
        }

        Some(CanonicalRecord {
            legacy_id,
            fields,
            extras,
            defaulted,
        })
    }
}

/// Multi-line notes keep every line of list artifacts.
fn notes_text(value: Option<&RawNode>) -> String {
    match value {
        Some(JsonValue::Array(items)) if items.len() > 1 => items
            .iter()
            .map(|item| scalar_text(Some(item)))
            .collect::<Vec<_>>()
            .join("\n"),
        Some(JsonValue::String(s)) => s.clone(),
        other => scalar_text(other),
    }
}

pub struct Records<'a, 't> {
    extractor: &'a SourceExtractor<'t>,
    nodes: std::vec::IntoIter<&'a RawNode>,
    stats: ExtractStats,
}

impl Records<'_, '_> {
    pub fn stats(&self) -> ExtractStats {
        self.stats
    }
}

impl Iterator for Records<'_, '_> {
    type Item = CanonicalRecord;

    fn next(&mut self) -> Option<Self::Item> {
        for node in self.nodes.by_ref() {
            self.stats.seen += 1;
            match self.extractor.record_from(node) {
                Some(record) => {
                    self.stats.extracted += 1;
                    if !record.defaulted.is_empty() {
                        self.stats.defaulted_dates += record.defaulted.len();
                        warn!(
                            legacy_id = %record.legacy_id,
                            columns = ?record.defaulted,
                            "unparsable dates defaulted to now"
                        );
                    }
                    return Some(record);
                }
                None => {
                    self.stats.dropped += 1;
                    warn!(
                        task = %self.extractor.task.name,
                        position = self.stats.seen,
                        "dropping legacy record without identifier"
                    );
                }
            }
        }
        None
    }
}

/// Drains an extraction, returning the records together with the final counts.
pub fn collect_records(records: Records<'_, '_>) -> (Vec<CanonicalRecord>, ExtractStats) {
    let mut records = records;
    let collected: Vec<CanonicalRecord> = records.by_ref().collect();
    (collected, records.stats())
}

#[cfg(test)]
mod tests {
    use super::*;
    use lrc_core::{FieldKind, FieldSpec, FieldValue, IdConvention, NameRepairSettings};
    use serde_json::json;

    fn task() -> EntityTask {
        EntityTask {
            name: "clients".into(),
            entity: "clients".into(),
            key_column: "id".into(),
            source_path: vec!["Export".into(), "Clients".into(), "Client".into()],
            legacy_id_field: "ID".into(),
            conventions: vec![IdConvention::new("plain", "client-{id}")],
            fields: vec![
                FieldSpec {
                    source: "Name".into(),
                    column: "name".into(),
                    kind: FieldKind::Text,
                    vocabulary: None,
                    multiplier: None,
                },
                FieldSpec {
                    source: "Created".into(),
                    column: "created_at".into(),
                    kind: FieldKind::Timestamp,
                    vocabulary: None,
                    multiplier: None,
                },
            ],
            compare: vec!["name".into()],
            preserve: vec![],
            vocabularies: Default::default(),
            batch: Default::default(),
            page_size: 1000,
            decimal_tolerance: 0.005,
            source_utc_offset_minutes: 0,
            name_repair: Some(NameRepairSettings {
                notes_field: "Notes".into(),
                name_column: "name".into(),
                placeholders: vec![],
            }),
        }
    }

    #[test]
    fn single_object_is_treated_as_collection() {
        let task = task();
        let tree = json!({"Export": {"Clients": {"Client": {"ID": "7", "Name": ["Альфа"]}}}});
        let extractor = SourceExtractor::new(&task);
        let records: Vec<_> = extractor.extract(&tree).unwrap().collect();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].legacy_id, "7");
        assert_eq!(records[0].get("name"), Some(&FieldValue::Text("Альфа".into())));
        assert_eq!(records[0].get("created_at"), Some(&FieldValue::Null));
    }

    #[test]
    fn records_without_identifier_are_dropped_and_counted() {
        let task = task();
        let tree = json!({"Export": {"Clients": {"Client": [
            {"ID": "1", "Name": "A", "Created": "2020-01-01"},
            {"ID": "  ", "Name": "B"},
            {"Name": "C"},
            "garbage",
            {"ID": ["3"], "Name": "D", "Created": "not a date"}
        ]}}});
        let extractor = SourceExtractor::new(&task);
        let (records, stats) = collect_records(extractor.extract(&tree).unwrap());
        assert_eq!(records.iter().map(|r| r.legacy_id.as_str()).collect::<Vec<_>>(), vec!["1", "3"]);
        assert_eq!(
            stats,
            ExtractStats {
                seen: 5,
                extracted: 2,
                dropped: 3,
                defaulted_dates: 1
            }
        );
        assert_eq!(records[1].defaulted, vec!["created_at".to_string()]);
    }

    #[test]
    fn extraction_restarts_on_every_call() {
        let task = task();
        let tree = json!({"Export": {"Clients": {"Client": [{"ID": "1"}, {"ID": "2"}]}}});
        let extractor = SourceExtractor::new(&task);
        assert_eq!(extractor.extract(&tree).unwrap().count(), 2);
        assert_eq!(extractor.extract(&tree).unwrap().count(), 2);
    }

    #[test]
    fn missing_path_is_an_error() {
        let task = task();
        let tree = json!({"Export": {"Suppliers": []}});
        let extractor = SourceExtractor::new(&task);
        assert!(matches!(extractor.extract(&tree), Err(ExtractError::MissingPath(_))));
    }

    #[test]
    fn empty_collection_yields_nothing() {
        let task = task();
        let tree = json!({"Export": {"Clients": {"Client": null}}});
        let extractor = SourceExtractor::new(&task);
        assert_eq!(extractor.extract(&tree).unwrap().count(), 0);
    }

    #[test]
    fn notes_keep_all_lines() {
        let task = task();
        let tree = json!({"Export": {"Clients": {"Client": {"ID": "1", "Notes": ["директор", "Сидоров А.А."]}}}});
        let extractor = SourceExtractor::new(&task);
        let record = extractor.extract(&tree).unwrap().next().unwrap();
        assert_eq!(record.extras["Notes"], "директор\nСидоров А.А.");
    }
}
