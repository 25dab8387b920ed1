//! Reconciliation engine: identifier mapping, store snapshots, diffing,
//! batched sync and run orchestration.

pub mod config;
pub mod diff;
pub mod engine;
pub mod mapping;
pub mod pipeline;
pub mod repair;
pub mod report;
pub mod snapshot;

pub use config::{connect_store, load_name_extractor, load_task, ConnectedStore, RunConfig, StoreKind};
pub use diff::{plan_mutations, Classification, DiffResult, Differ, FieldDelta};
pub use engine::{
    BatchOutcome, BatchState, ExecutorSink, FailedMutation, MutationSink, ScriptSink, StoreSink,
    SyncEngine, SyncReport,
};
pub use mapping::{DuplicateMapping, IdentifierMapping};
pub use pipeline::{ReconcilePipeline, RunMode, RunSummary, ScheduledRuns};
pub use repair::{plan_name_repairs, NameRepair, NameRepairPlan};
pub use snapshot::{fetch_all, SnapshotError, StoreSnapshot};

pub const CRATE_NAME: &str = "lrc-sync";

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::BTreeMap;

    use lrc_core::{
        BatchSettings, CanonicalRecord, EntityTask, FieldKind, FieldSpec, FieldValue, IdConvention,
        NameRepairSettings, Vocabulary,
    };

    fn field(source: &str, column: &str, kind: FieldKind) -> FieldSpec {
        FieldSpec {
            source: source.into(),
            column: column.into(),
            kind,
            vocabulary: None,
            multiplier: None,
        }
    }

    pub fn sample_task() -> EntityTask {
        let mut status = field("Status", "status", FieldKind::Text);
        status.vocabulary = Some("status".into());
        let mut price = field("Cost", "price", FieldKind::Decimal);
        price.multiplier = Some(1.2);

        EntityTask {
            name: "clients".into(),
            entity: "clients".into(),
            key_column: "id".into(),
            source_path: vec!["Export".into(), "Clients".into(), "Client".into()],
            legacy_id_field: "ID".into(),
            conventions: vec![
                IdConvention::new("current", "client-{id}"),
                IdConvention::new("xml-import", "client-xml-{id}"),
            ],
            fields: vec![
                field("Name", "name", FieldKind::Text),
                status,
                field("Balance", "balance", FieldKind::Decimal),
                price,
                field("Updated", "updated_at", FieldKind::Timestamp),
            ],
            compare: vec![
                "name".into(),
                "status".into(),
                "balance".into(),
                "price".into(),
                "updated_at".into(),
            ],
            preserve: vec!["updated_at".into()],
            vocabularies: BTreeMap::from([(
                "status".to_string(),
                Vocabulary {
                    labels: BTreeMap::from([
                        ("Активный".to_string(), "active".to_string()),
                        ("Архив".to_string(), "archived".to_string()),
                    ]),
                    default: None,
                },
            )]),
            batch: BatchSettings {
                batch_size: 100,
                max_retries: 2,
                backoff_ms: 0,
                max_backoff_ms: 0,
                exponential: false,
                inter_batch_delay_ms: 0,
                concurrency: 1,
            },
            page_size: 1000,
            decimal_tolerance: 0.005,
            source_utc_offset_minutes: 180,
            name_repair: Some(NameRepairSettings {
                notes_field: "Notes".into(),
                name_column: "name".into(),
                placeholders: vec!["Без имени".into(), "-".into()],
            }),
        }
    }

    pub fn record(legacy_id: &str, texts: &[(&str, &str)], balance: f64) -> CanonicalRecord {
        let mut fields: BTreeMap<String, FieldValue> = texts
            .iter()
            .map(|(k, v)| (k.to_string(), FieldValue::Text(v.to_string())))
            .collect();
        fields.insert("balance".into(), FieldValue::Decimal(balance));
        CanonicalRecord {
            legacy_id: legacy_id.into(),
            fields,
            ..Default::default()
        }
    }
}
