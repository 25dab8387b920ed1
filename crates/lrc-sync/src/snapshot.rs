//! Full-population reads of the target store.

use std::collections::BTreeMap;

use lrc_core::{EntityTask, FieldKind, FieldValue};
use lrc_extract::FieldNormalizer;
use lrc_storage::{BackoffPolicy, RetryDisposition, StoreError, StoreRow, TargetStore};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot of {entity} incomplete: page at offset {offset} failed: {source}")]
    Incomplete {
        entity: String,
        offset: usize,
        #[source]
        source: StoreError,
    },
    #[error("snapshot of {entity}: row at offset {offset} has no usable {key_column}")]
    MissingKey {
        entity: String,
        key_column: String,
        offset: usize,
    },
}

pub type StoredFields = BTreeMap<String, FieldValue>;

/// Every row of one entity currently in the store, keyed by target id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreSnapshot {
    pub entity: String,
    rows: BTreeMap<String, StoredFields>,
    pages_read: usize,
}

impl StoreSnapshot {
    pub fn from_rows(entity: impl Into<String>, rows: BTreeMap<String, StoredFields>) -> Self {
        Self {
            entity: entity.into(),
            rows,
            pages_read: 0,
        }
    }

    pub fn contains(&self, target_id: &str) -> bool {
        self.rows.contains_key(target_id)
    }

    pub fn get(&self, target_id: &str) -> Option<&StoredFields> {
        self.rows.get(target_id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.rows.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn pages_read(&self) -> usize {
        self.pages_read
    }
}

fn key_text(value: Option<&JsonValue>) -> Option<String> {
    match value? {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Reads pages of `task.page_size` rows until a short page comes back.
///
/// Transient page failures are retried under `backoff`; once retries run out
/// (or on any other failure) the whole snapshot fails.
pub async fn fetch_all(
    store: &dyn TargetStore,
    task: &EntityTask,
    backoff: &BackoffPolicy,
) -> Result<StoreSnapshot, SnapshotError> {
    let columns = task.snapshot_columns();
    let normalizer = FieldNormalizer::new(task);
    let page_size = task.page_size.max(1);
    let mut snapshot = StoreSnapshot {
        entity: task.entity.clone(),
        ..Default::default()
    };

    let mut offset = 0usize;
    loop {
        let page = fetch_page_with_retry(store, task, &columns, offset, page_size, backoff).await?;
        snapshot.pages_read += 1;
        let fetched = page.len();
        debug!(entity = %task.entity, offset, fetched, "snapshot page");

        for (idx, row) in page.into_iter().enumerate() {
            snapshot.insert_row(task, &normalizer, row, offset + idx)?;
        }

        if fetched < page_size {
            break;
        }
        offset += fetched;
    }

    info!(
        entity = %task.entity,
        rows = snapshot.len(),
        pages = snapshot.pages_read,
        "store snapshot complete"
    );
    Ok(snapshot)
}

impl StoreSnapshot {
    fn insert_row(
        &mut self,
        task: &EntityTask,
        normalizer: &FieldNormalizer<'_>,
        mut row: StoreRow,
        offset: usize,
    ) -> Result<(), SnapshotError> {
        let key = key_text(row.get(&task.key_column)).ok_or_else(|| SnapshotError::MissingKey {
            entity: task.entity.clone(),
            key_column: task.key_column.clone(),
            offset,
        })?;
        row.remove(&task.key_column);
        let fields = row
            .into_iter()
            .map(|(column, value)| {
                let kind = task
                    .field_for_column(&column)
                    .map(|spec| spec.kind)
                    .unwrap_or(FieldKind::Text);
                let typed = normalizer.normalize_stored(kind, &value);
                (column, typed)
            })
            .collect();
        self.rows.insert(key, fields);
        Ok(())
    }
}

async fn fetch_page_with_retry(
    store: &dyn TargetStore,
    task: &EntityTask,
    columns: &[String],
    offset: usize,
    limit: usize,
    backoff: &BackoffPolicy,
) -> Result<Vec<StoreRow>, SnapshotError> {
    let mut attempt = 0usize;
    loop {
        match store
            .fetch_page(&task.entity, &task.key_column, columns, offset, limit)
            .await
        {
            Ok(page) => return Ok(page),
            Err(err) if err.disposition() == RetryDisposition::Retryable && attempt < backoff.max_retries => {
                let delay = backoff.delay_for_attempt(attempt);
                warn!(entity = %task.entity, offset, attempt, ?delay, error = %err, "retrying snapshot page");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(source) => {
                return Err(SnapshotError::Incomplete {
                    entity: task.entity.clone(),
                    offset,
                    source,
                })
            }
        }
    }
}
