//! Classification of source records against a store snapshot, and the
//! mutations that close the gap.

use lrc_core::{CanonicalRecord, EntityTask, FieldValue, Mutation, MutationKind};
use serde::Serialize;

use crate::mapping::IdentifierMapping;
use crate::snapshot::StoreSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Missing,
    Changed,
    Unchanged,
}

impl Classification {
    pub fn as_str(self) -> &'static str {
        match self {
            Classification::Missing => "missing",
            Classification::Changed => "changed",
            Classification::Unchanged => "unchanged",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldDelta {
    pub column: String,
    pub source: FieldValue,
    pub stored: FieldValue,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MissingRecord {
    pub target_id: String,
    /// The mapping named a target id the snapshot does not hold.
    pub stale_mapping: bool,
    pub record: CanonicalRecord,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangedRecord {
    pub target_id: String,
    pub deltas: Vec<FieldDelta>,
    pub record: CanonicalRecord,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnchangedRecord {
    pub legacy_id: String,
    pub target_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DiffResult {
    pub missing: Vec<MissingRecord>,
    pub changed: Vec<ChangedRecord>,
    pub unchanged: Vec<UnchangedRecord>,
}

impl DiffResult {
    pub fn total(&self) -> usize {
        self.missing.len() + self.changed.len() + self.unchanged.len()
    }

    pub fn is_converged(&self) -> bool {
        self.missing.is_empty() && self.changed.is_empty()
    }

    /// `(legacy_id, target_id, classification, changed columns)` per record.
    pub fn rows(&self) -> Vec<(&str, &str, Classification, Vec<&str>)> {
        let missing = self.missing.iter().map(|m| {
            (m.record.legacy_id.as_str(), m.target_id.as_str(), Classification::Missing, Vec::new())
        });
        let changed = self.changed.iter().map(|c| {
            (
                c.record.legacy_id.as_str(),
                c.target_id.as_str(),
                Classification::Changed,
                c.deltas.iter().map(|d| d.column.as_str()).collect(),
            )
        });
        let unchanged = self.unchanged.iter().map(|u| {
            (u.legacy_id.as_str(), u.target_id.as_str(), Classification::Unchanged, Vec::new())
        });
        missing.chain(changed).chain(unchanged).collect()
    }
}

/// Compares the task's compare columns, minus preserved ones, between source
/// records and stored rows.
#[derive(Debug, Clone)]
pub struct Differ<'t> {
    task: &'t EntityTask,
    columns: Vec<&'t str>,
}

impl<'t> Differ<'t> {
    pub fn new(task: &'t EntityTask) -> Self {
        let columns = task
            .compare
            .iter()
            .filter(|c| !task.preserve.contains(c) && **c != task.key_column)
            .map(String::as_str)
            .collect();
        Self { task, columns }
    }

    pub fn columns(&self) -> &[&'t str] {
        &self.columns
    }

    pub fn diff(
        &self,
        records: impl IntoIterator<Item = CanonicalRecord>,
        snapshot: &StoreSnapshot,
        mapping: &IdentifierMapping,
    ) -> DiffResult {
        let mut result = DiffResult::default();
        for record in records {
            let mapped = mapping.lookup(&record.legacy_id);
            let stored = mapped.and_then(|target| snapshot.get(target).map(|row| (target, row)));
            let Some((target_id, stored)) = stored else {
                result.missing.push(MissingRecord {
                    target_id: mapping.insert_id(&record.legacy_id),
                    stale_mapping: mapped.is_some(),
                    record,
                });
                continue;
            };

            let deltas = self.deltas(&record, stored);
            if deltas.is_empty() {
                result.unchanged.push(UnchangedRecord {
                    legacy_id: record.legacy_id,
                    target_id: target_id.to_string(),
                });
            } else {
                result.changed.push(ChangedRecord {
                    target_id: target_id.to_string(),
                    deltas,
                    record,
                });
            }
        }
        result
    }

    fn deltas(
        &self,
        record: &CanonicalRecord,
        stored: &std::collections::BTreeMap<String, FieldValue>,
    ) -> Vec<FieldDelta> {
        // A defaulted date is "now" at extraction time, not source data.
        self.columns
            .iter()
            .filter(|column| !record.defaulted.iter().any(|d| d.as_str() == **column))
            .filter_map(|column| {
                let source = record.get(column).cloned().unwrap_or(FieldValue::Null);
                let current = stored.get(*column).cloned().unwrap_or(FieldValue::Null);
                if source.matches(&current, self.task.decimal_tolerance) {
                    None
                } else {
                    Some(FieldDelta {
                        column: column.to_string(),
                        source,
                        stored: current,
                    })
                }
            })
            .collect()
    }
}

/// Inserts carry every mapped field; updates only the differing columns.
pub fn plan_mutations(diff: &DiffResult, task: &EntityTask) -> Vec<Mutation> {
    let inserts = diff.missing.iter().map(|m| Mutation {
        kind: MutationKind::Insert,
        legacy_id: m.record.legacy_id.clone(),
        target_id: m.target_id.clone(),
        values: m.record.fields.clone(),
    });
    let updates = diff.changed.iter().filter_map(|c| {
        let values: std::collections::BTreeMap<_, _> = c
            .deltas
            .iter()
            .filter(|d| !task.preserve.contains(&d.column) && !c.record.defaulted.contains(&d.column))
            .map(|d| (d.column.clone(), d.source.clone()))
            .collect();
        (!values.is_empty()).then(|| Mutation {
            kind: MutationKind::Update,
            legacy_id: c.record.legacy_id.clone(),
            target_id: c.target_id.clone(),
            values,
        })
    });
    inserts.chain(updates).collect()
}
