//! One reconciliation run: extract, snapshot, map, diff, apply, report.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use lrc_core::{CanonicalRecord, EntityTask, Mutation};
use lrc_extract::{collect_records, ExtractStats, NameExtractor, SourceExtractor, SourceReader};
use lrc_storage::{StatementExecutor, TargetStore};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::{ConnectedStore, RunConfig};
use crate::diff::{plan_mutations, DiffResult, Differ};
use crate::engine::{backoff_policy, ExecutorSink, ScriptSink, StoreSink, SyncEngine, SyncReport};
use crate::mapping::{DuplicateMapping, IdentifierMapping};
use crate::repair::{plan_name_repairs, NameRepairPlan};
use crate::report::{sha256_hex, write_reports};
use crate::snapshot::{fetch_all, StoreSnapshot};

/// What a run does with its planned mutations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Classify and report only.
    DryRun,
    /// Write through the target store.
    Apply,
    /// Write through the store's raw statement channel.
    Statements,
    /// Render statements into a script file.
    Script(PathBuf),
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunMode::DryRun => write!(f, "dry-run"),
            RunMode::Apply => write!(f, "apply"),
            RunMode::Statements => write!(f, "statements"),
            RunMode::Script(path) => write!(f, "script ({})", path.display()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScriptOutput {
    pub path: String,
    pub statements: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RepairCounts {
    pub planned: usize,
    pub already_named: usize,
    pub no_name_found: usize,
    pub unmatched: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub task: String,
    pub entity: String,
    pub mode: RunMode,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub source: String,
    pub source_sha256: String,
    pub store: String,
    pub extract: ExtractStats,
    pub snapshot_rows: usize,
    pub snapshot_pages: usize,
    pub non_standard_ids: usize,
    pub duplicate_mappings: Vec<DuplicateMapping>,
    pub missing: usize,
    pub changed: usize,
    pub unchanged: usize,
    pub repairs: Option<RepairCounts>,
    pub planned_mutations: usize,
    pub sync: Option<SyncReport>,
    pub script: Option<ScriptOutput>,
    pub reports_dir: String,
}

impl RunSummary {
    pub fn new(task: impl Into<String>, entity: impl Into<String>, mode: RunMode) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            task: task.into(),
            entity: entity.into(),
            mode,
            started_at: now,
            finished_at: now,
            source: String::new(),
            source_sha256: String::new(),
            store: String::new(),
            extract: ExtractStats::default(),
            snapshot_rows: 0,
            snapshot_pages: 0,
            non_standard_ids: 0,
            duplicate_mappings: Vec::new(),
            missing: 0,
            changed: 0,
            unchanged: 0,
            repairs: None,
            planned_mutations: 0,
            sync: None,
            script: None,
            reports_dir: String::new(),
        }
    }

    pub fn failed(&self) -> usize {
        self.sync.as_ref().map(|s| s.failed.len()).unwrap_or(0)
    }
}

/// Source and store state gathered at the start of every run.
struct Prepared {
    records: Vec<CanonicalRecord>,
    snapshot: StoreSnapshot,
    mapping: IdentifierMapping,
}

pub struct ReconcilePipeline {
    config: RunConfig,
    store: Arc<dyn TargetStore>,
    executor: Option<Arc<dyn StatementExecutor>>,
    cancel: CancellationToken,
}

impl ReconcilePipeline {
    pub fn new(config: RunConfig, store: Arc<dyn TargetStore>) -> Self {
        Self {
            config,
            store,
            executor: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn from_connected(config: RunConfig, connected: ConnectedStore) -> Self {
        Self {
            executor: connected.executor,
            ..Self::new(config, connected.store)
        }
    }

    pub fn with_executor(mut self, executor: Arc<dyn StatementExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Brings the store in line with the source for every compare column.
    pub async fn reconcile(
        &self,
        task: &EntityTask,
        reader: &dyn SourceReader,
        mode: &RunMode,
    ) -> Result<RunSummary> {
        let mut summary = RunSummary::new(&task.name, &task.entity, mode.clone());
        let span = info_span!("reconcile", run_id = %summary.run_id, task = %task.name, mode = %mode);
        async move {
            let prepared = self.prepare(task, reader, &mut summary).await?;
            let diff = Differ::new(task).diff(prepared.records, &prepared.snapshot, &prepared.mapping);
            summary.missing = diff.missing.len();
            summary.changed = diff.changed.len();
            summary.unchanged = diff.unchanged.len();
            info!(
                missing = summary.missing,
                changed = summary.changed,
                unchanged = summary.unchanged,
                "classification done"
            );

            let mutations = plan_mutations(&diff, task);
            self.execute(task, mutations, mode, &mut summary).await?;
            self.finish(&mut summary, Some(&diff), None).await?;
            Ok(summary)
        }
        .instrument(span)
        .await
    }

    /// Fills placeholder display names from the legacy notes.
    pub async fn repair_names(
        &self,
        task: &EntityTask,
        reader: &dyn SourceReader,
        extractor: &NameExtractor,
        mode: &RunMode,
    ) -> Result<RunSummary> {
        let settings = task
            .name_repair
            .as_ref()
            .with_context(|| format!("task {} has no name_repair settings", task.name))?;
        let mut summary = RunSummary::new(&task.name, &task.entity, mode.clone());
        let span = info_span!("repair_names", run_id = %summary.run_id, task = %task.name, mode = %mode);
        async move {
            let prepared = self.prepare(task, reader, &mut summary).await?;
            let plan = plan_name_repairs(
                &prepared.records,
                &prepared.snapshot,
                &prepared.mapping,
                settings,
                extractor,
            );
            summary.repairs = Some(RepairCounts {
                planned: plan.repairs.len(),
                already_named: plan.already_named,
                no_name_found: plan.no_name_found.len(),
                unmatched: plan.unmatched.len(),
            });
            info!(planned = plan.repairs.len(), "name repairs planned");

            let mutations = plan.mutations(&settings.name_column);
            self.execute(task, mutations, mode, &mut summary).await?;
            self.finish(&mut summary, None, Some(&plan)).await?;
            Ok(summary)
        }
        .instrument(span)
        .await
    }

    async fn prepare(
        &self,
        task: &EntityTask,
        reader: &dyn SourceReader,
        summary: &mut RunSummary,
    ) -> Result<Prepared> {
        summary.source = reader.describe();
        summary.store = self.store.describe();

        let tree = reader.read()?;
        let canonical = serde_json::to_vec(&tree).context("serializing source tree")?;
        summary.source_sha256 = sha256_hex(&canonical);

        let extractor = SourceExtractor::new(task);
        let (records, stats) = collect_records(extractor.extract(&tree)?);
        summary.extract = stats;
        info!(extracted = stats.extracted, dropped = stats.dropped, "source extracted");

        let snapshot = fetch_all(self.store.as_ref(), task, &backoff_policy(&task.batch))
            .await
            .with_context(|| format!("building snapshot of {}", task.entity))?;
        summary.snapshot_rows = snapshot.len();
        summary.snapshot_pages = snapshot.pages_read();

        let mapping = IdentifierMapping::build(snapshot.ids(), &task.conventions);
        summary.non_standard_ids = mapping.non_standard().count();
        summary.duplicate_mappings = mapping.duplicates().to_vec();

        Ok(Prepared {
            records,
            snapshot,
            mapping,
        })
    }

    async fn execute(
        &self,
        task: &EntityTask,
        mutations: Vec<Mutation>,
        mode: &RunMode,
        summary: &mut RunSummary,
    ) -> Result<()> {
        summary.planned_mutations = mutations.len();
        let engine = SyncEngine::new(&task.batch).with_cancellation(self.cancel.clone());
        match mode {
            RunMode::DryRun => {}
            RunMode::Apply => {
                let sink = StoreSink::new(self.store.clone(), task);
                summary.sync = Some(engine.apply(&sink, &mutations).await);
            }
            RunMode::Statements => {
                let Some(executor) = &self.executor else {
                    bail!("store {} has no statement channel", self.store.describe());
                };
                let sink = ExecutorSink::new(executor.clone(), task);
                summary.sync = Some(engine.apply(&sink, &mutations).await);
            }
            RunMode::Script(path) => {
                let sink = ScriptSink::create(path.clone(), task).await?;
                let report = engine.apply(&sink, &mutations).await;
                let (path, statements) = sink.finish().await?;
                info!(path = %path.display(), statements, "statement script written");
                summary.script = Some(ScriptOutput {
                    path: path.display().to_string(),
                    statements,
                });
                summary.sync = Some(report);
            }
        }
        Ok(())
    }

    async fn finish(
        &self,
        summary: &mut RunSummary,
        diff: Option<&DiffResult>,
        repairs: Option<&NameRepairPlan>,
    ) -> Result<()> {
        let run_dir = self.config.reports_dir.join(summary.run_id.to_string());
        summary.reports_dir = run_dir.display().to_string();
        summary.finished_at = Utc::now();
        let manifest = write_reports(&run_dir, summary, diff, repairs).await?;
        info!(
            manifest = %manifest.display(),
            failed = summary.failed(),
            "run reports written"
        );
        Ok(())
    }

    /// Builds a cron scheduler ticking on `config.sync_cron`, or `None` when
    /// scheduling is disabled. Ticks are consumed by [`Self::run_scheduled`];
    /// a tick arriving while a run is still busy is dropped.
    pub async fn maybe_build_scheduler(&self) -> Result<Option<ScheduledRuns>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.sync_cron.clone();
        let (tx, ticks) = mpsc::channel(1);
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let tx = tx.clone();
            Box::pin(async move {
                if tx.try_send(()).is_err() {
                    warn!("previous scheduled reconciliation still running, skipping tick");
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(ScheduledRuns {
            scheduler: sched,
            ticks,
        }))
    }

    /// Runs one reconciliation per tick until the ticks stop or the run is
    /// cancelled. Failed runs are logged and do not end the loop. Returns the
    /// number of runs started.
    pub async fn run_scheduled(
        &self,
        task: &EntityTask,
        reader: &dyn SourceReader,
        mode: &RunMode,
        ticks: &mut mpsc::Receiver<()>,
    ) -> usize {
        let mut runs = 0usize;
        loop {
            tokio::select! {
                tick = ticks.recv() => {
                    if tick.is_none() {
                        break;
                    }
                    runs += 1;
                    match self.reconcile(task, reader, mode).await {
                        Ok(summary) => info!(
                            run_id = %summary.run_id,
                            applied = summary.sync.as_ref().map(|s| s.applied()).unwrap_or(0),
                            "scheduled reconciliation finished"
                        ),
                        Err(err) => error!(error = %format!("{err:#}"), "scheduled reconciliation failed"),
                    }
                }
                _ = self.cancel.cancelled() => break,
            }
        }
        runs
    }
}

/// A started-or-not cron scheduler and the ticks it produces.
pub struct ScheduledRuns {
    pub scheduler: JobScheduler,
    pub ticks: mpsc::Receiver<()>,
}
