//! Target store contract, store implementations and statement rendering.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use lrc_core::{FieldValue, Mutation, MutationKind};
use serde_json::{Map as JsonMap, Value as JsonValue};
use thiserror::Error;

pub mod memory;
pub mod postgres;
pub mod rest;
pub mod sql;

pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use rest::{RestStore, RestStoreConfig};
pub use sql::ScriptWriter;

pub const CRATE_NAME: &str = "lrc-storage";

/// One row as read from or written to the store, keyed by column.
pub type StoreRow = JsonMap<String, JsonValue>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// Connectivity, rate limiting, lock or serialization conflicts.
    #[error("transient store failure: {0}")]
    Transient(String),
    /// The store refused the statement or one of its rows.
    #[error("store rejected write: {0}")]
    Rejected(String),
    #[error("decoding store response: {0}")]
    Decode(String),
    #[error("store configuration: {0}")]
    Config(String),
}

impl StoreError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            StoreError::Transient(_) => RetryDisposition::Retryable,
            _ => RetryDisposition::NonRetryable,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub exponential: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            exponential: true,
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        if !self.exponential {
            return self.base_delay.min(self.max_delay);
        }
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Output of a raw statement run through a [`StatementExecutor`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub affected_rows: u64,
    pub output: String,
}

/// Runs raw SQL statements, e.g. against a database reachable only through a
/// remote shell. Transport concerns live in the implementation.
///
/// Each `execute` call is one transaction: the statements in it commit
/// together, and after a failure nothing of the call remains and the next
/// call starts clean.
#[async_trait]
pub trait StatementExecutor: Send + Sync {
    async fn execute(&self, statement: &str) -> Result<ExecOutput, StoreError>;
}

/// The store operations reconciliation relies on: paginated read, keyed
/// upsert and keyed batch update.
#[async_trait]
pub trait TargetStore: Send + Sync {
    fn describe(&self) -> String;

    /// Reads `limit` rows starting at `offset`, ordered by `key_column`.
    async fn fetch_page(
        &self,
        entity: &str,
        key_column: &str,
        columns: &[String],
        offset: usize,
        limit: usize,
    ) -> Result<Vec<StoreRow>, StoreError>;

    async fn upsert(
        &self,
        entity: &str,
        key_column: &str,
        rows: &[StoreRow],
    ) -> Result<u64, StoreError>;

    /// Writes the same `values` to every row whose key is in `ids`.
    async fn update_by_ids(
        &self,
        entity: &str,
        key_column: &str,
        ids: &[String],
        values: &StoreRow,
    ) -> Result<u64, StoreError>;

    /// Applies a batch of mutations. Inserts become one upsert; updates are
    /// grouped by identical change sets into keyed batch updates.
    ///
    /// This default issues those as separate calls, so on a store without
    /// transactions (REST, memory) a failing batch may already have applied
    /// its earlier calls. Every write here is an idempotent keyed upsert or
    /// update, so the per-record fallback rewrites them harmlessly. Stores
    /// that can (Postgres) override this to apply the batch atomically.
    async fn apply_batch(
        &self,
        entity: &str,
        key_column: &str,
        batch: &[Mutation],
    ) -> Result<u64, StoreError> {
        let plan = BatchPlan::from_mutations(key_column, batch);
        let mut affected = 0u64;
        if !plan.upserts.is_empty() {
            affected += self.upsert(entity, key_column, &plan.upserts).await?;
        }
        for group in &plan.updates {
            affected += self
                .update_by_ids(entity, key_column, &group.ids, &group.values)
                .await?;
        }
        Ok(affected)
    }
}

pub fn values_to_row(values: &BTreeMap<String, FieldValue>) -> StoreRow {
    values
        .iter()
        .map(|(column, value)| (column.clone(), value.to_json()))
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateGroup {
    pub values: StoreRow,
    pub ids: Vec<String>,
}

/// A mutation batch split into store operations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchPlan {
    pub upserts: Vec<StoreRow>,
    pub updates: Vec<UpdateGroup>,
}

impl BatchPlan {
    pub fn from_mutations(key_column: &str, batch: &[Mutation]) -> Self {
        let mut upserts = Vec::new();
        let mut grouped: BTreeMap<String, UpdateGroup> = BTreeMap::new();
        for mutation in batch {
            let mut row = values_to_row(&mutation.values);
            match mutation.kind {
                MutationKind::Insert => {
                    row.insert(
                        key_column.to_string(),
                        JsonValue::String(mutation.target_id.clone()),
                    );
                    upserts.push(row);
                }
                MutationKind::Update => {
                    row.remove(key_column);
                    let signature = JsonValue::Object(row.clone()).to_string();
                    grouped
                        .entry(signature)
                        .or_insert_with(|| UpdateGroup {
                            values: row,
                            ids: Vec::new(),
                        })
                        .ids
                        .push(mutation.target_id.clone());
                }
            }
        }
        Self {
            upserts,
            updates: grouped.into_values().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mutation(kind: MutationKind, id: &str, status: &str) -> Mutation {
        Mutation {
            kind,
            legacy_id: id.trim_start_matches("client-").to_string(),
            target_id: id.to_string(),
            values: [("status".to_string(), FieldValue::Text(status.to_string()))]
                .into_iter()
                .collect(),
        }
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            exponential: true,
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(350));
    }

    #[test]
    fn fixed_backoff_ignores_attempt_index() {
        let policy = BackoffPolicy {
            exponential: false,
            base_delay: Duration::from_millis(250),
            ..Default::default()
        };
        assert_eq!(policy.delay_for_attempt(0), policy.delay_for_attempt(3));
    }

    #[test]
    fn only_transient_errors_are_retryable() {
        assert_eq!(
            StoreError::Transient("timeout".into()).disposition(),
            RetryDisposition::Retryable
        );
        assert_eq!(
            StoreError::Rejected("constraint".into()).disposition(),
            RetryDisposition::NonRetryable
        );
    }

    #[test]
    fn batch_plan_groups_updates_by_change_set() {
        let batch = vec![
            mutation(MutationKind::Update, "client-1", "active"),
            mutation(MutationKind::Insert, "client-2", "active"),
            mutation(MutationKind::Update, "client-3", "archived"),
            mutation(MutationKind::Update, "client-4", "active"),
        ];
        let plan = BatchPlan::from_mutations("id", &batch);
        assert_eq!(plan.upserts.len(), 1);
        assert_eq!(plan.upserts[0]["id"], "client-2");
        assert_eq!(plan.updates.len(), 2);
        let active = plan
            .updates
            .iter()
            .find(|g| g.values["status"] == "active")
            .unwrap();
        assert_eq!(active.ids, vec!["client-1".to_string(), "client-4".to_string()]);
    }
}
