//! Legacy id ⇄ target id mapping built from the task's naming conventions.

use std::collections::{BTreeMap, BTreeSet};

use lrc_core::IdConvention;
use serde::Serialize;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MappingEntry {
    pub legacy_id: String,
    pub target_id: String,
    /// Name of the convention that recognised `target_id`.
    pub convention: String,
    #[serde(skip)]
    priority: usize,
}

/// Two target ids resolving to one legacy id. `kept` wins lookups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicateMapping {
    pub legacy_id: String,
    pub kept: String,
    pub shadowed: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReverseEntry<'a> {
    Legacy(&'a MappingEntry),
    NonStandard,
}

#[derive(Debug, Clone, Default)]
pub struct IdentifierMapping {
    conventions: Vec<IdConvention>,
    forward: BTreeMap<String, MappingEntry>,
    reverse: BTreeMap<String, Option<String>>,
    non_standard: BTreeSet<String>,
    duplicates: Vec<DuplicateMapping>,
}

/// Parses `target_id` with each convention in order; the first match wins.
/// Returns the convention index alongside the legacy id.
pub fn parse_target_id(conventions: &[IdConvention], target_id: &str) -> Option<(usize, String)> {
    conventions
        .iter()
        .enumerate()
        .find_map(|(idx, convention)| convention.parse(target_id).map(|legacy| (idx, legacy)))
}

impl IdentifierMapping {
    pub fn build<'a>(target_ids: impl IntoIterator<Item = &'a str>, conventions: &[IdConvention]) -> Self {
        let mut mapping = Self {
            conventions: conventions.to_vec(),
            ..Default::default()
        };

        let ordered: BTreeSet<&str> = target_ids.into_iter().collect();
        for target_id in ordered {
            let Some((priority, legacy_id)) = parse_target_id(conventions, target_id) else {
                mapping.non_standard.insert(target_id.to_string());
                mapping.reverse.insert(target_id.to_string(), None);
                continue;
            };
            mapping
                .reverse
                .insert(target_id.to_string(), Some(legacy_id.clone()));

            let entry = MappingEntry {
                legacy_id: legacy_id.clone(),
                target_id: target_id.to_string(),
                convention: conventions[priority].name.clone(),
                priority,
            };
            match mapping.forward.get(&legacy_id) {
                Some(existing) if existing.priority <= priority => {
                    mapping.duplicates.push(DuplicateMapping {
                        legacy_id,
                        kept: existing.target_id.clone(),
                        shadowed: entry.target_id,
                    });
                }
                Some(existing) => {
                    mapping.duplicates.push(DuplicateMapping {
                        legacy_id: legacy_id.clone(),
                        kept: entry.target_id.clone(),
                        shadowed: existing.target_id.clone(),
                    });
                    mapping.forward.insert(legacy_id, entry);
                }
                None => {
                    mapping.forward.insert(legacy_id, entry);
                }
            }
        }

        if !mapping.non_standard.is_empty() {
            warn!(count = mapping.non_standard.len(), "target ids outside every naming convention");
        }
        for dup in &mapping.duplicates {
            warn!(legacy_id = %dup.legacy_id, kept = %dup.kept, shadowed = %dup.shadowed, "duplicate mapping");
        }
        mapping
    }

    pub fn lookup(&self, legacy_id: &str) -> Option<&str> {
        self.forward.get(legacy_id).map(|e| e.target_id.as_str())
    }

    pub fn entry(&self, legacy_id: &str) -> Option<&MappingEntry> {
        self.forward.get(legacy_id)
    }

    pub fn reverse(&self, target_id: &str) -> Option<ReverseEntry<'_>> {
        match self.reverse.get(target_id)? {
            Some(legacy) => self.forward.get(legacy).map(ReverseEntry::Legacy),
            None => Some(ReverseEntry::NonStandard),
        }
    }

    pub fn contains_target(&self, target_id: &str) -> bool {
        self.reverse.contains_key(target_id)
    }

    pub fn is_non_standard(&self, target_id: &str) -> bool {
        self.non_standard.contains(target_id)
    }

    pub fn non_standard(&self) -> impl Iterator<Item = &str> {
        self.non_standard.iter().map(String::as_str)
    }

    pub fn duplicates(&self) -> &[DuplicateMapping] {
        &self.duplicates
    }

    /// Target id a new record gets: the first convention's rendering.
    pub fn insert_id(&self, legacy_id: &str) -> String {
        self.conventions
            .first()
            .map(|c| c.format(legacy_id))
            .unwrap_or_else(|| legacy_id.to_string())
    }

    pub fn len(&self) -> usize {
        self.forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }
}
