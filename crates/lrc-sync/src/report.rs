//! Per-run report files: markdown summary, JSON detail and a parquet export
//! of the diff classification with a sha256 manifest.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{RecordBatch, StringArray, UInt32Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use parquet::arrow::ArrowWriter;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::fs;

use crate::diff::DiffResult;
use crate::pipeline::RunSummary;
use crate::repair::NameRepairPlan;

#[derive(Debug, Clone, Serialize)]
pub struct ReportManifest {
    pub schema_version: u32,
    pub run_id: String,
    pub files: Vec<ReportManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub fn render_summary_markdown(summary: &RunSummary) -> String {
    let mut lines = vec![
        format!("# Reconciliation `{}`", summary.task),
        String::new(),
        format!("- Run ID: `{}`", summary.run_id),
        format!("- Mode: {}", summary.mode),
        format!("- Started: {}", summary.started_at),
        format!("- Finished: {}", summary.finished_at),
        format!("- Source: `{}` (sha256 `{}`)", summary.source, summary.source_sha256),
        format!("- Store: `{}` ({} rows in {} pages)", summary.store, summary.snapshot_rows, summary.snapshot_pages),
        String::new(),
        "## Extraction".to_string(),
        format!("- records seen: {}", summary.extract.seen),
        format!("- extracted: {}", summary.extract.extracted),
        format!("- dropped without identifier: {}", summary.extract.dropped),
        format!("- dates defaulted to now: {}", summary.extract.defaulted_dates),
        String::new(),
        "## Identifiers".to_string(),
        format!("- non-standard target ids: {}", summary.non_standard_ids),
        format!("- duplicate mappings: {}", summary.duplicate_mappings.len()),
        String::new(),
        "## Classification".to_string(),
        format!("- missing: {}", summary.missing),
        format!("- changed: {}", summary.changed),
        format!("- unchanged: {}", summary.unchanged),
    ];

    if let Some(repairs) = &summary.repairs {
        lines.push(String::new());
        lines.push("## Name repair".to_string());
        lines.push(format!("- repairs planned: {}", repairs.planned));
        lines.push(format!("- already named: {}", repairs.already_named));
        lines.push(format!("- no name found in notes: {}", repairs.no_name_found));
        lines.push(format!("- no stored row: {}", repairs.unmatched));
    }

    lines.push(String::new());
    lines.push("## Writes".to_string());
    lines.push(format!("- planned mutations: {}", summary.planned_mutations));
    match &summary.sync {
        Some(sync) => {
            lines.push(format!("- sink: `{}`", sync.sink));
            lines.push(format!("- applied in batches: {}", sync.applied_in_batches));
            lines.push(format!("- applied individually: {}", sync.applied_individually));
            lines.push(format!("- retries: {}", sync.retries));
            lines.push(format!("- failed: {}", sync.failed.len()));
            if sync.cancelled {
                lines.push(format!("- skipped after cancellation: {}", sync.skipped));
            }
        }
        None => lines.push("- nothing written (dry run)".to_string()),
    }
    if let Some(script) = &summary.script {
        lines.push(format!("- script: `{}` ({} statements)", script.path, script.statements));
    }

    if let Some(sync) = summary.sync.as_ref().filter(|s| !s.failed.is_empty()) {
        lines.push(String::new());
        lines.push("## Permanent failures".to_string());
        for f in &sync.failed {
            lines.push(format!("- `{}` (legacy `{}`): {}", f.target_id, f.legacy_id, f.error));
        }
    }
    lines.push(String::new());
    lines.join("\n")
}

/// Writes every report file into `run_dir` and returns the manifest path.
pub async fn write_reports(
    run_dir: &Path,
    summary: &RunSummary,
    diff: Option<&DiffResult>,
    repairs: Option<&NameRepairPlan>,
) -> Result<PathBuf> {
    fs::create_dir_all(run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let mut written = Vec::new();

    let summary_md = run_dir.join("summary.md");
    fs::write(&summary_md, render_summary_markdown(summary))
        .await
        .context("writing summary.md")?;
    written.push(("summary", summary_md));

    let summary_json = run_dir.join("summary.json");
    write_json(&summary_json, summary).await?;
    written.push(("summary_json", summary_json));

    let failures = run_dir.join("failures.json");
    let failed = summary.sync.as_ref().map(|s| s.failed.as_slice()).unwrap_or_default();
    write_json(&failures, &failed).await?;
    written.push(("failures", failures));

    if let Some(diff) = diff {
        let diff_json = run_dir.join("diff.json");
        write_json(&diff_json, diff).await?;
        written.push(("diff", diff_json));

        let diff_parquet = run_dir.join("diff.parquet");
        write_diff_parquet(&diff_parquet, diff)?;
        written.push(("diff_parquet", diff_parquet));
    }

    if let Some(repairs) = repairs {
        let repairs_json = run_dir.join("name_repairs.json");
        write_json(&repairs_json, repairs).await?;
        written.push(("name_repairs", repairs_json));
    }

    let manifest = ReportManifest {
        schema_version: 1,
        run_id: summary.run_id.to_string(),
        files: written
            .iter()
            .map(|(name, path)| manifest_entry(name, run_dir, path))
            .collect::<Result<Vec<_>>>()?,
    };
    let manifest_path = run_dir.join("manifest.json");
    write_json(&manifest_path, &manifest).await?;
    Ok(manifest_path)
}

async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)
        .with_context(|| format!("serializing {}", path.display()))?;
    fs::write(path, bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))
}

fn write_diff_parquet(path: &Path, diff: &DiffResult) -> Result<()> {
    let rows = diff.rows();
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("legacy_id", DataType::Utf8, false),
        ArrowField::new("target_id", DataType::Utf8, false),
        ArrowField::new("classification", DataType::Utf8, false),
        ArrowField::new("changed_columns", DataType::Utf8, true),
        ArrowField::new("changed_count", DataType::UInt32, false),
    ]));

    let legacy_ids = StringArray::from(rows.iter().map(|r| Some(r.0)).collect::<Vec<_>>());
    let target_ids = StringArray::from(rows.iter().map(|r| Some(r.1)).collect::<Vec<_>>());
    let classes = StringArray::from(rows.iter().map(|r| Some(r.2.as_str())).collect::<Vec<_>>());
    let changed_columns = StringArray::from(
        rows.iter()
            .map(|r| (!r.3.is_empty()).then(|| r.3.join(",")))
            .collect::<Vec<_>>(),
    );
    let changed_counts = UInt32Array::from(rows.iter().map(|r| r.3.len() as u32).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(legacy_ids),
            Arc::new(target_ids),
            Arc::new(classes),
            Arc::new(changed_columns),
            Arc::new(changed_counts),
        ],
    )
    .context("building diff record batch")?;

    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn manifest_entry(name: &str, run_dir: &Path, path: &Path) -> Result<ReportManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let rel = path.strip_prefix(run_dir).unwrap_or(path).display().to_string();
    Ok(ReportManifestFile {
        name: name.to_string(),
        path: rel,
        sha256: sha256_hex(&bytes),
        bytes: bytes.len() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::{MissingRecord, UnchangedRecord};
    use crate::engine::{FailedMutation, SyncReport};
    use crate::pipeline::{RunMode, RunSummary};
    use lrc_core::{CanonicalRecord, MutationKind};
    use parquet::file::reader::{FileReader, SerializedFileReader};

    fn summary() -> RunSummary {
        let mut summary = RunSummary::new("clients", "clients", RunMode::Apply);
        summary.missing = 1;
        summary.unchanged = 1;
        summary.sync = Some(SyncReport {
            sink: "memory/clients".into(),
            planned: 1,
            failed: vec![FailedMutation {
                legacy_id: "7".into(),
                target_id: "client-7".into(),
                kind: MutationKind::Insert,
                batch_index: 0,
                error: "store rejected write: constraint".into(),
            }],
            ..Default::default()
        });
        summary
    }

    fn diff() -> DiffResult {
        DiffResult {
            missing: vec![MissingRecord {
                target_id: "client-7".into(),
                stale_mapping: false,
                record: CanonicalRecord {
                    legacy_id: "7".into(),
                    ..Default::default()
                },
            }],
            changed: vec![],
            unchanged: vec![UnchangedRecord {
                legacy_id: "8".into(),
                target_id: "client-8".into(),
            }],
        }
    }

    #[test]
    fn sha256_is_hex_encoded() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn markdown_lists_permanent_failures() {
        let md = render_summary_markdown(&summary());
        assert!(md.contains("- missing: 1"));
        assert!(md.contains("## Permanent failures"));
        assert!(md.contains("`client-7` (legacy `7`)"));
    }

    #[tokio::test]
    async fn reports_and_manifest_are_written() {
        let dir = tempfile::tempdir().unwrap();
        let summary = summary();
        let run_dir = dir.path().join(summary.run_id.to_string());
        let manifest_path = write_reports(&run_dir, &summary, Some(&diff()), None).await.unwrap();

        for name in ["summary.md", "summary.json", "failures.json", "diff.json", "diff.parquet"] {
            assert!(run_dir.join(name).exists(), "{name} missing");
        }
        let manifest: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&manifest_path).unwrap()).unwrap();
        assert_eq!(manifest["files"].as_array().unwrap().len(), 5);

        let failures: serde_json::Value =
            serde_json::from_slice(&std::fs::read(run_dir.join("failures.json")).unwrap()).unwrap();
        assert_eq!(failures[0]["target_id"], "client-7");

        let reader = SerializedFileReader::new(File::open(run_dir.join("diff.parquet")).unwrap()).unwrap();
        assert_eq!(reader.metadata().file_metadata().num_rows(), 2);
    }
}
