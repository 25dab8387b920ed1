use std::path::PathBuf;
use std::sync::Arc;

use lrc_extract::{JsonFileReader, NameExtractor};
use lrc_storage::{MemoryStore, StoreRow};
use lrc_sync::{load_task, ReconcilePipeline, RunConfig, RunMode};
use serde_json::json;

fn workspace_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../..")
}

fn row(value: serde_json::Value) -> StoreRow {
    value.as_object().cloned().unwrap()
}

async fn seeded_store() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    store
        .seed(
            "clients",
            "id",
            vec![
                row(json!({"id": "client-101", "name": "Альфа ООО", "status": "active",
                           "balance": 1250.0, "price": 120.0, "updated_at": "2023-05-10T11:30:00+00:00"})),
                row(json!({"id": "client-xml-102", "name": "Бета", "status": "active",
                           "balance": 0, "price": 66.6, "updated_at": "2020-01-01T00:00:00+00:00"})),
                row(json!({"id": "client-103", "name": "client-103", "status": "active",
                           "balance": 15.75, "price": 0})),
                row(json!({"id": "client-104", "name": "Без имени", "status": "Новый",
                           "balance": 0, "price": 0})),
                row(json!({"id": "legacy-id-9", "name": "Старый", "status": "active"})),
            ],
        )
        .await;
    store
}

fn pipeline(store: Arc<MemoryStore>, reports: &tempfile::TempDir) -> ReconcilePipeline {
    let mut config = RunConfig::for_workspace(workspace_root());
    config.reports_dir = reports.path().to_path_buf();
    ReconcilePipeline::new(config, store)
}

#[tokio::test]
async fn reconcile_converges_and_is_idempotent() {
    let reports = tempfile::tempdir().unwrap();
    let task = load_task(&workspace_root().join("tasks/clients.yaml")).unwrap();
    let reader = JsonFileReader::new(workspace_root().join("fixtures/clients/export.json"));
    let store = seeded_store().await;
    let pipeline = pipeline(store.clone(), &reports);

    let first = pipeline.reconcile(&task, &reader, &RunMode::Apply).await.unwrap();
    assert_eq!(first.extract.seen, 6);
    assert_eq!(first.extract.dropped, 1);
    assert_eq!(first.extract.defaulted_dates, 1);
    assert_eq!(first.non_standard_ids, 1);
    assert_eq!((first.missing, first.changed, first.unchanged), (1, 1, 3));
    let sync = first.sync.as_ref().unwrap();
    assert_eq!(sync.applied(), 2);
    assert!(sync.failed.is_empty());

    let rows = store.rows("clients").await;
    assert_eq!(rows["client-xml-102"]["status"], "archived");
    assert_eq!(rows["client-xml-102"]["updated_at"], "2020-01-01T00:00:00+00:00");
    assert_eq!(rows["client-106"]["status"], "active");
    assert_eq!(rows["client-106"]["price"], 12.0);
    assert!(!rows.contains_key("client-102"));

    let second = pipeline.reconcile(&task, &reader, &RunMode::DryRun).await.unwrap();
    assert_eq!((second.missing, second.changed, second.unchanged), (0, 0, 5));
    assert_eq!(second.source_sha256, first.source_sha256);

    for name in ["summary.md", "diff.json", "diff.parquet", "failures.json", "manifest.json"] {
        assert!(PathBuf::from(&second.reports_dir).join(name).exists(), "{name} missing");
    }
}

#[tokio::test]
async fn name_repair_fills_placeholders_once() {
    let reports = tempfile::tempdir().unwrap();
    let task = load_task(&workspace_root().join("tasks/clients.yaml")).unwrap();
    let reader = JsonFileReader::new(workspace_root().join("fixtures/clients/export.json"));
    let store = seeded_store().await;
    let pipeline = pipeline(store.clone(), &reports);
    let extractor = NameExtractor::default();

    let first = pipeline
        .repair_names(&task, &reader, &extractor, &RunMode::Apply)
        .await
        .unwrap();
    let counts = first.repairs.unwrap();
    assert_eq!(counts.planned, 1);
    assert_eq!(counts.no_name_found, 1);
    assert_eq!(counts.already_named, 2);
    // client-106 only exists after a reconcile run.
    assert_eq!(counts.unmatched, 1);
    assert_eq!(store.rows("clients").await["client-104"]["name"], "Кузнецова Мария");

    let second = pipeline
        .repair_names(&task, &reader, &extractor, &RunMode::Apply)
        .await
        .unwrap();
    assert_eq!(second.repairs.unwrap().planned, 0);
}
