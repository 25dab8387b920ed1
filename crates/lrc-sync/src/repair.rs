//! Planning of display-name corrections from legacy free-text notes.

use std::collections::BTreeMap;

use lrc_core::{CanonicalRecord, FieldValue, Mutation, MutationKind, NameRepairSettings};
use lrc_extract::NameExtractor;
use serde::Serialize;
use tracing::debug;

use crate::mapping::IdentifierMapping;
use crate::snapshot::StoreSnapshot;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NameRepair {
    pub legacy_id: String,
    pub target_id: String,
    pub current: FieldValue,
    pub proposed: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NameRepairPlan {
    pub repairs: Vec<NameRepair>,
    /// Placeholder rows whose notes held no recognisable name.
    pub no_name_found: Vec<String>,
    /// Source records with no stored counterpart.
    pub unmatched: Vec<String>,
    pub already_named: usize,
}

impl NameRepairPlan {
    pub fn mutations(&self, name_column: &str) -> Vec<Mutation> {
        self.repairs
            .iter()
            .map(|repair| Mutation {
                kind: MutationKind::Update,
                legacy_id: repair.legacy_id.clone(),
                target_id: repair.target_id.clone(),
                values: BTreeMap::from([(
                    name_column.to_string(),
                    FieldValue::Text(repair.proposed.clone()),
                )]),
            })
            .collect()
    }
}

/// A stored name needs repair when blank, a configured placeholder, or just
/// the row's own identifier echoed back.
pub fn is_placeholder_name(
    current: &FieldValue,
    settings: &NameRepairSettings,
    legacy_id: &str,
    target_id: &str,
) -> bool {
    let Some(text) = current.as_text().map(str::trim) else {
        return current.is_blank();
    };
    text.is_empty()
        || text == legacy_id
        || text == target_id
        || settings
            .placeholders
            .iter()
            .any(|p| p.trim().to_lowercase() == text.to_lowercase())
}

pub fn plan_name_repairs(
    records: &[CanonicalRecord],
    snapshot: &StoreSnapshot,
    mapping: &IdentifierMapping,
    settings: &NameRepairSettings,
    extractor: &NameExtractor,
) -> NameRepairPlan {
    let mut plan = NameRepairPlan::default();
    for record in records {
        let Some((target_id, stored)) = mapping
            .lookup(&record.legacy_id)
            .and_then(|target| snapshot.get(target).map(|row| (target, row)))
        else {
            plan.unmatched.push(record.legacy_id.clone());
            continue;
        };

        let current = stored
            .get(&settings.name_column)
            .cloned()
            .unwrap_or(FieldValue::Null);
        if !is_placeholder_name(&current, settings, &record.legacy_id, target_id) {
            plan.already_named += 1;
            continue;
        }

        let notes = record
            .extras
            .get(&settings.notes_field)
            .map(String::as_str)
            .unwrap_or_default();
        match extractor.extract(notes) {
            Some(proposed) => plan.repairs.push(NameRepair {
                legacy_id: record.legacy_id.clone(),
                target_id: target_id.to_string(),
                current,
                proposed,
            }),
            None => {
                debug!(legacy_id = %record.legacy_id, "no name in notes");
                plan.no_name_found.push(record.legacy_id.clone());
            }
        }
    }
    plan
}
