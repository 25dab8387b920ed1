//! Batched application of mutations with retry, backoff and per-record
//! fallback.
//!
//! Each batch moves through
//! `Pending → Attempting → {Succeeded | Retrying → Attempting | Failed → IndividualRetry}`.
//! A batch that keeps failing is split into single-record writes so one bad
//! row cannot sink its neighbours. Every outcome ends up in the returned
//! [`SyncReport`].

use std::path::PathBuf;
use std::slice;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use lrc_core::{BatchSettings, EntityTask, Mutation, MutationKind};
use lrc_storage::sql::render_batch;
use lrc_storage::{
    BackoffPolicy, RetryDisposition, ScriptWriter, StatementExecutor, StoreError, TargetStore,
};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Where a batch of mutations is written.
#[async_trait]
pub trait MutationSink: Send + Sync {
    fn describe(&self) -> String;

    /// Writes the batch as one unit, returning affected rows.
    async fn write(&self, batch: &[Mutation]) -> Result<u64, StoreError>;
}

pub struct StoreSink {
    store: Arc<dyn TargetStore>,
    entity: String,
    key_column: String,
}

impl StoreSink {
    pub fn new(store: Arc<dyn TargetStore>, task: &EntityTask) -> Self {
        Self {
            store,
            entity: task.entity.clone(),
            key_column: task.key_column.clone(),
        }
    }
}

#[async_trait]
impl MutationSink for StoreSink {
    fn describe(&self) -> String {
        format!("{}/{}", self.store.describe(), self.entity)
    }

    async fn write(&self, batch: &[Mutation]) -> Result<u64, StoreError> {
        self.store.apply_batch(&self.entity, &self.key_column, batch).await
    }
}

/// Feeds rendered SQL to a raw statement channel, one `execute` call (and so
/// one transaction) per batch.
pub struct ExecutorSink {
    executor: Arc<dyn StatementExecutor>,
    entity: String,
    key_column: String,
}

impl ExecutorSink {
    pub fn new(executor: Arc<dyn StatementExecutor>, task: &EntityTask) -> Self {
        Self {
            executor,
            entity: task.entity.clone(),
            key_column: task.key_column.clone(),
        }
    }
}

#[async_trait]
impl MutationSink for ExecutorSink {
    fn describe(&self) -> String {
        format!("statements/{}", self.entity)
    }

    async fn write(&self, batch: &[Mutation]) -> Result<u64, StoreError> {
        let statements = render_batch(&self.entity, &self.key_column, batch);
        if statements.is_empty() {
            return Ok(0);
        }
        let output = self.executor.execute(&statements.join("\n")).await?;
        debug!(output = %output.output, "statement batch executed");
        Ok(output.affected_rows)
    }
}

/// Appends each batch to a statement script instead of touching the store.
pub struct ScriptSink {
    writer: Mutex<ScriptWriter>,
    entity: String,
    key_column: String,
}

impl ScriptSink {
    pub async fn create(path: impl Into<PathBuf>, task: &EntityTask) -> Result<Self> {
        Ok(Self {
            writer: Mutex::new(ScriptWriter::create(path).await?),
            entity: task.entity.clone(),
            key_column: task.key_column.clone(),
        })
    }

    pub async fn finish(self) -> Result<(PathBuf, usize)> {
        self.writer.into_inner().finish().await
    }
}

#[async_trait]
impl MutationSink for ScriptSink {
    fn describe(&self) -> String {
        format!("script/{}", self.entity)
    }

    async fn write(&self, batch: &[Mutation]) -> Result<u64, StoreError> {
        let mut writer = self.writer.lock().await;
        for statement in render_batch(&self.entity, &self.key_column, batch) {
            writer.write_statement(&statement).await.map_err(|e| {
                StoreError::Rejected(format!("writing {}: {e}", writer.path().display()))
            })?;
        }
        Ok(batch.len() as u64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Pending,
    Attempting,
    Retrying,
    Succeeded,
    Failed,
    IndividualRetry,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchOutcome {
    pub index: usize,
    pub size: usize,
    /// Terminal state: `Succeeded`, `Failed` or `Skipped`.
    pub state: BatchState,
    pub attempts: usize,
    pub fell_back: bool,
    pub applied: usize,
    pub failed: usize,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedMutation {
    pub legacy_id: String,
    pub target_id: String,
    pub kind: MutationKind,
    pub batch_index: usize,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncReport {
    pub sink: String,
    pub planned: usize,
    pub applied_in_batches: usize,
    pub applied_individually: usize,
    /// Extra write attempts caused by transient failures.
    pub retries: usize,
    /// Mutations never attempted because the run was cancelled.
    pub skipped: usize,
    pub cancelled: bool,
    pub failed: Vec<FailedMutation>,
    pub batches: Vec<BatchOutcome>,
}

impl SyncReport {
    pub fn applied(&self) -> usize {
        self.applied_in_batches + self.applied_individually
    }

    pub fn failed_ids(&self) -> Vec<&str> {
        self.failed.iter().map(|f| f.target_id.as_str()).collect()
    }
}

struct BatchResult {
    outcome: BatchOutcome,
    applied_in_batch: usize,
    applied_individually: usize,
    retries: usize,
    failed: Vec<FailedMutation>,
}

struct WriteAttempt {
    result: Result<u64, StoreError>,
    attempts: usize,
}

#[derive(Debug, Clone)]
pub struct SyncEngine {
    batch_size: usize,
    concurrency: usize,
    inter_batch_delay: Duration,
    backoff: BackoffPolicy,
    cancel: CancellationToken,
}

impl SyncEngine {
    pub fn new(settings: &BatchSettings) -> Self {
        Self {
            batch_size: settings.batch_size.max(1),
            concurrency: settings.concurrency.max(1),
            inter_batch_delay: Duration::from_millis(settings.inter_batch_delay_ms),
            backoff: backoff_policy(settings),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    pub async fn apply(&self, sink: &dyn MutationSink, mutations: &[Mutation]) -> SyncReport {
        let span = info_span!("sync_apply", sink = %sink.describe(), mutations = mutations.len());
        async move {
            let mut results: Vec<BatchResult> = stream::iter(mutations.chunks(self.batch_size).enumerate())
                .map(|(index, batch)| self.run_batch(sink, index, batch))
                .buffer_unordered(self.concurrency)
                .collect()
                .await;
            results.sort_by_key(|r| r.outcome.index);

            let mut report = SyncReport {
                sink: sink.describe(),
                planned: mutations.len(),
                ..Default::default()
            };
            for result in results {
                report.applied_in_batches += result.applied_in_batch;
                report.applied_individually += result.applied_individually;
                report.retries += result.retries;
                if result.outcome.state == BatchState::Skipped {
                    report.cancelled = true;
                    report.skipped += result.outcome.size;
                }
                report.failed.extend(result.failed);
                report.batches.push(result.outcome);
            }
            info!(
                applied = report.applied(),
                failed = report.failed.len(),
                retries = report.retries,
                skipped = report.skipped,
                "sync finished"
            );
            report
        }
        .instrument(span)
        .await
    }

    async fn run_batch(&self, sink: &dyn MutationSink, index: usize, batch: &[Mutation]) -> BatchResult {
        if index > 0 && !self.inter_batch_delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(self.inter_batch_delay) => {}
                _ = self.cancel.cancelled() => {}
            }
        }

        let mut outcome = BatchOutcome {
            index,
            size: batch.len(),
            state: BatchState::Pending,
            attempts: 0,
            fell_back: false,
            applied: 0,
            failed: 0,
            last_error: None,
        };
        if self.cancel.is_cancelled() {
            outcome.state = BatchState::Skipped;
            debug!(batch_index = index, "cancelled before batch");
            return BatchResult {
                outcome,
                applied_in_batch: 0,
                applied_individually: 0,
                retries: 0,
                failed: Vec::new(),
            };
        }

        let span = info_span!("batch", batch_index = index, size = batch.len());
        async move {
            transition(&mut outcome, BatchState::Attempting);
            let attempt = self
                .write_with_retry(sink, batch, || debug!(batch_index = index, "batch state -> Retrying"))
                .await;
            outcome.attempts = attempt.attempts;
            let mut retries = attempt.attempts - 1;

            let err = match attempt.result {
                Ok(_) => {
                    transition(&mut outcome, BatchState::Succeeded);
                    outcome.applied = batch.len();
                    return BatchResult {
                        outcome,
                        applied_in_batch: batch.len(),
                        applied_individually: 0,
                        retries,
                        failed: Vec::new(),
                    };
                }
                Err(err) => err,
            };

            transition(&mut outcome, BatchState::Failed);
            outcome.last_error = Some(err.to_string());
            let mut failed = Vec::new();
            let mut applied_individually = 0usize;

            if batch.len() == 1 {
                failed.push(failure(&batch[0], index, &err));
            } else {
                warn!(error = %err, "batch failed, retrying records individually");
                transition(&mut outcome, BatchState::IndividualRetry);
                outcome.fell_back = true;
                for mutation in batch {
                    let single = self.write_with_retry(sink, slice::from_ref(mutation), || {}).await;
                    retries += single.attempts - 1;
                    match single.result {
                        Ok(_) => applied_individually += 1,
                        Err(err) => failed.push(failure(mutation, index, &err)),
                    }
                }
            }

            for f in &failed {
                error!(legacy_id = %f.legacy_id, target_id = %f.target_id, error = %f.error, "permanent write failure");
            }
            outcome.applied = applied_individually;
            outcome.failed = failed.len();
            let terminal = if failed.is_empty() {
                BatchState::Succeeded
            } else {
                BatchState::Failed
            };
            transition(&mut outcome, terminal);
            BatchResult {
                outcome,
                applied_in_batch: 0,
                applied_individually,
                retries,
                failed,
            }
        }
        .instrument(span)
        .await
    }

    async fn write_with_retry(
        &self,
        sink: &dyn MutationSink,
        batch: &[Mutation],
        on_retry: impl Fn(),
    ) -> WriteAttempt {
        let mut attempts = 0usize;
        loop {
            attempts += 1;
            match sink.write(batch).await {
                Ok(affected) => {
                    return WriteAttempt {
                        result: Ok(affected),
                        attempts,
                    }
                }
                Err(err)
                    if err.disposition() == RetryDisposition::Retryable
                        && attempts <= self.backoff.max_retries =>
                {
                    let delay = self.backoff.delay_for_attempt(attempts - 1);
                    warn!(attempt = attempts, ?delay, size = batch.len(), error = %err, "transient write failure, retrying");
                    on_retry();
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    return WriteAttempt {
                        result: Err(err),
                        attempts,
                    }
                }
            }
        }
    }
}

pub fn backoff_policy(settings: &BatchSettings) -> BackoffPolicy {
    BackoffPolicy {
        max_retries: settings.max_retries,
        base_delay: Duration::from_millis(settings.backoff_ms),
        max_delay: Duration::from_millis(settings.max_backoff_ms.max(settings.backoff_ms)),
        exponential: settings.exponential,
    }
}

fn transition(outcome: &mut BatchOutcome, next: BatchState) {
    debug!(batch_index = outcome.index, from = ?outcome.state, to = ?next, "batch state");
    outcome.state = next;
}

fn failure(mutation: &Mutation, batch_index: usize, err: &StoreError) -> FailedMutation {
    FailedMutation {
        legacy_id: mutation.legacy_id.clone(),
        target_id: mutation.target_id.clone(),
        kind: mutation.kind,
        batch_index,
        error: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::sample_task;
    use lrc_core::FieldValue;
    use lrc_storage::{ExecOutput, MemoryStore};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn settings(batch_size: usize, max_retries: usize) -> BatchSettings {
        BatchSettings {
            batch_size,
            max_retries,
            backoff_ms: 0,
            max_backoff_ms: 0,
            exponential: false,
            inter_batch_delay_ms: 0,
            concurrency: 1,
        }
    }

    fn inserts(count: usize) -> Vec<Mutation> {
        (0..count)
            .map(|i| Mutation {
                kind: MutationKind::Insert,
                legacy_id: i.to_string(),
                target_id: format!("client-{i}"),
                values: BTreeMap::from([(
                    "name".to_string(),
                    FieldValue::Text(if i == 42 { "bad".into() } else { format!("Client {i}") }),
                )]),
            })
            .collect()
    }

    #[tokio::test]
    async fn one_bad_row_does_not_sink_the_batch() {
        let store = Arc::new(MemoryStore::new().with_row_rejection(|row| row.get("name") == Some(&json!("bad"))));
        let sink = StoreSink::new(store.clone(), &sample_task());
        let report = SyncEngine::new(&settings(100, 3)).apply(&sink, &inserts(100)).await;

        assert_eq!(report.applied(), 99);
        assert_eq!(report.applied_individually, 99);
        assert_eq!(report.failed_ids(), vec!["client-42"]);
        assert_eq!(report.retries, 0);
        assert_eq!(report.batches[0].state, BatchState::Failed);
        assert!(report.batches[0].fell_back);
        assert_eq!(store.rows("clients").await.len(), 99);
        assert_eq!(store.write_calls(), 101);
    }

    #[tokio::test]
    async fn partly_written_batch_converges_through_fallback() {
        let store = Arc::new(MemoryStore::new().with_row_rejection(|row| row.get("name") == Some(&json!("bad"))));
        store
            .seed("clients", "id", [json!({"id": "client-1", "name": "Old"}).as_object().cloned().unwrap()])
            .await;
        let sink = StoreSink::new(store.clone(), &sample_task());
        let batch = vec![
            inserts(1).remove(0),
            Mutation {
                kind: MutationKind::Update,
                legacy_id: "1".into(),
                target_id: "client-1".into(),
                values: BTreeMap::from([("name".to_string(), FieldValue::Text("bad".into()))]),
            },
        ];
        let report = SyncEngine::new(&settings(10, 0)).apply(&sink, &batch).await;

        assert_eq!(report.applied_in_batches, 0);
        assert_eq!(report.applied_individually, 1);
        assert_eq!(report.failed_ids(), vec!["client-1"]);
        let rows = store.rows("clients").await;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows["client-0"]["name"], "Client 0");
        assert_eq!(rows["client-1"]["name"], "Old");
    }

    #[tokio::test]
    async fn transient_failures_retry_the_whole_batch() {
        let store = Arc::new(MemoryStore::new().with_transient_write_failures(2));
        let sink = StoreSink::new(store.clone(), &sample_task());
        let report = SyncEngine::new(&settings(10, 2)).apply(&sink, &inserts(10)).await;

        assert_eq!(report.applied_in_batches, 10);
        assert_eq!(report.retries, 2);
        assert_eq!(report.batches[0].attempts, 3);
        assert_eq!(report.batches[0].state, BatchState::Succeeded);
        assert!(report.failed.is_empty());
    }

    #[tokio::test]
    async fn exhausted_retries_fall_back_to_single_records() {
        let store = Arc::new(MemoryStore::new().with_transient_write_failures(3));
        let sink = StoreSink::new(store.clone(), &sample_task());
        let report = SyncEngine::new(&settings(3, 2)).apply(&sink, &inserts(3)).await;

        assert_eq!(report.applied_in_batches, 0);
        assert_eq!(report.applied_individually, 3);
        assert_eq!(report.batches[0].state, BatchState::Succeeded);
        assert!(report.batches[0].fell_back);
        assert_eq!(store.rows("clients").await.len(), 3);
    }

    #[tokio::test]
    async fn cancelled_run_skips_remaining_batches() {
        let store = Arc::new(MemoryStore::new());
        let sink = StoreSink::new(store.clone(), &sample_task());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = SyncEngine::new(&settings(10, 0))
            .with_cancellation(cancel)
            .apply(&sink, &inserts(25))
            .await;

        assert!(report.cancelled);
        assert_eq!(report.skipped, 25);
        assert_eq!(report.batches.len(), 3);
        assert!(report.batches.iter().all(|b| b.state == BatchState::Skipped));
        assert_eq!(store.write_calls(), 0);
    }

    /// Counts writes and cancels the run during the first one.
    struct CancellingSink {
        cancel: CancellationToken,
        writes: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl MutationSink for CancellingSink {
        fn describe(&self) -> String {
            "cancelling".into()
        }

        async fn write(&self, batch: &[Mutation]) -> Result<u64, StoreError> {
            self.writes.lock().await.push(batch.len());
            self.cancel.cancel();
            Ok(batch.len() as u64)
        }
    }

    #[tokio::test]
    async fn cancelling_mid_run_finishes_the_current_batch_only() {
        let cancel = CancellationToken::new();
        let sink = CancellingSink {
            cancel: cancel.clone(),
            writes: Mutex::new(Vec::new()),
        };
        let report = SyncEngine::new(&settings(10, 0))
            .with_cancellation(cancel)
            .apply(&sink, &inserts(35))
            .await;

        assert_eq!(report.applied(), 10);
        assert_eq!(report.applied_in_batches, 10);
        assert!(report.cancelled);
        assert_eq!(report.skipped, 25);
        assert_eq!(report.batches[0].state, BatchState::Succeeded);
        assert!(report.batches[1..].iter().all(|b| b.state == BatchState::Skipped));
        assert_eq!(*sink.writes.lock().await, vec![10]);
    }

    #[tokio::test]
    async fn inter_batch_delay_separates_batches() {
        let store = Arc::new(MemoryStore::new());
        let sink = StoreSink::new(store.clone(), &sample_task());
        let mut settings = settings(10, 0);
        settings.inter_batch_delay_ms = 40;

        let started = std::time::Instant::now();
        let report = SyncEngine::new(&settings).apply(&sink, &inserts(30)).await;
        assert_eq!(report.applied(), 30);
        // Three batches, two pauses; none before the first batch.
        assert!(started.elapsed() >= Duration::from_millis(80));
        assert_eq!(store.write_calls(), 3);
    }

    #[tokio::test]
    async fn concurrent_batches_aggregate_in_order() {
        let store = Arc::new(MemoryStore::new());
        let sink = StoreSink::new(store.clone(), &sample_task());
        let mut settings = settings(50, 0);
        settings.concurrency = 4;
        let report = SyncEngine::new(&settings).apply(&sink, &inserts(250)).await;

        assert_eq!(report.applied(), 250);
        assert_eq!(
            report.batches.iter().map(|b| b.index).collect::<Vec<_>>(),
            vec![0, 1, 2, 3, 4]
        );
        assert_eq!(store.rows("clients").await.len(), 250);
    }

    #[tokio::test]
    async fn script_sink_renders_statements() {
        let dir = tempfile::tempdir().unwrap();
        let task = sample_task();
        let sink = ScriptSink::create(dir.path().join("fix.sql"), &task).await.unwrap();
        let report = SyncEngine::new(&settings(2, 0)).apply(&sink, &inserts(5)).await;
        assert_eq!(report.applied(), 5);

        let (path, statements) = sink.finish().await.unwrap();
        assert_eq!(statements, 3);
        let text = std::fs::read_to_string(path).unwrap();
        assert!(text.lines().all(|l| l.starts_with("INSERT INTO \"clients\"")));
    }

    /// Rejects any call whose script mentions a poisoned id, like a
    /// database rolling back the whole transaction.
    struct RecordingExecutor {
        scripts: Mutex<Vec<String>>,
        poisoned: Option<&'static str>,
    }

    impl RecordingExecutor {
        fn new(poisoned: Option<&'static str>) -> Self {
            Self {
                scripts: Mutex::new(Vec::new()),
                poisoned,
            }
        }
    }

    #[async_trait]
    impl StatementExecutor for RecordingExecutor {
        async fn execute(&self, statement: &str) -> Result<ExecOutput, StoreError> {
            self.scripts.lock().await.push(statement.to_string());
            if let Some(id) = self.poisoned.filter(|id| statement.contains(id)) {
                return Err(StoreError::Rejected(format!("null value in column \"name\" for {id}")));
            }
            Ok(ExecOutput {
                affected_rows: statement.lines().count() as u64,
                output: "UPDATE".into(),
            })
        }
    }

    fn renames(count: usize) -> Vec<Mutation> {
        (0..count)
            .map(|i| Mutation {
                kind: MutationKind::Update,
                legacy_id: i.to_string(),
                target_id: format!("client-{i}"),
                values: BTreeMap::from([("name".to_string(), FieldValue::Text(format!("Client {i}")))]),
            })
            .collect()
    }

    #[tokio::test]
    async fn executor_sink_sends_one_call_per_batch() {
        let executor = Arc::new(RecordingExecutor::new(None));
        let sink = ExecutorSink::new(executor.clone(), &sample_task());
        let report = SyncEngine::new(&settings(2, 0)).apply(&sink, &inserts(4)).await;
        assert_eq!(report.applied(), 4);

        let scripts = executor.scripts.lock().await;
        assert_eq!(scripts.len(), 2);
        assert!(scripts[0].starts_with("INSERT INTO"));
        assert!(!scripts[0].contains("BEGIN"));
    }

    #[tokio::test]
    async fn executor_failure_falls_back_per_record() {
        let executor = Arc::new(RecordingExecutor::new(Some("'client-1'")));
        let sink = ExecutorSink::new(executor.clone(), &sample_task());
        let report = SyncEngine::new(&settings(3, 2)).apply(&sink, &renames(3)).await;

        assert_eq!(report.applied_individually, 2);
        assert_eq!(report.failed_ids(), vec!["client-1"]);
        assert_eq!(report.retries, 0);
        assert!(report.batches[0].fell_back);
        // One batch call plus one call per record.
        assert_eq!(executor.scripts.lock().await.len(), 4);
    }
}
