//! In-process store used for dry runs and tests, with fault injection.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;

use crate::{StoreError, StoreRow, TargetStore};

type RowPredicate = Box<dyn Fn(&StoreRow) -> bool + Send + Sync>;

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<BTreeMap<String, BTreeMap<String, StoreRow>>>,
    page_reads: AtomicUsize,
    write_calls: AtomicUsize,
    failing_pages: BTreeSet<usize>,
    transient_write_failures: AtomicUsize,
    reject: Option<RowPredicate>,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("page_reads", &self.page_reads)
            .field("write_calls", &self.write_calls)
            .field("failing_pages", &self.failing_pages)
            .finish_non_exhaustive()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Page reads with these zero-based indexes fail transiently.
    pub fn with_failing_pages(mut self, pages: impl IntoIterator<Item = usize>) -> Self {
        self.failing_pages = pages.into_iter().collect();
        self
    }

    /// The next `count` write calls fail transiently.
    pub fn with_transient_write_failures(self, count: usize) -> Self {
        self.transient_write_failures.store(count, Ordering::SeqCst);
        self
    }

    /// Writes containing a row matching `predicate` are rejected as a whole.
    pub fn with_row_rejection(
        mut self,
        predicate: impl Fn(&StoreRow) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.reject = Some(Box::new(predicate));
        self
    }

    pub async fn seed(&self, entity: &str, key_column: &str, rows: impl IntoIterator<Item = StoreRow>) {
        let mut tables = self.tables.lock().await;
        let table = tables.entry(entity.to_string()).or_default();
        for row in rows {
            if let Some(key) = row.get(key_column).and_then(key_text) {
                table.insert(key, row);
            }
        }
    }

    pub async fn rows(&self, entity: &str) -> BTreeMap<String, StoreRow> {
        self.tables
            .lock()
            .await
            .get(entity)
            .cloned()
            .unwrap_or_default()
    }

    pub fn page_reads(&self) -> usize {
        self.page_reads.load(Ordering::SeqCst)
    }

    pub fn write_calls(&self) -> usize {
        self.write_calls.load(Ordering::SeqCst)
    }

    fn begin_write(&self) -> Result<(), StoreError> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        let injected = self
            .transient_write_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(StoreError::Transient("injected write failure".into()));
        }
        Ok(())
    }

    fn check_rows<'r>(&self, rows: impl IntoIterator<Item = &'r StoreRow>) -> Result<(), StoreError> {
        let Some(reject) = &self.reject else {
            return Ok(());
        };
        for row in rows {
            if reject(row) {
                return Err(StoreError::Rejected(format!(
                    "row violates constraint: {}",
                    JsonValue::Object(row.clone())
                )));
            }
        }
        Ok(())
    }
}

fn key_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[async_trait]
impl TargetStore for MemoryStore {
    fn describe(&self) -> String {
        "memory".to_string()
    }

    async fn fetch_page(
        &self,
        entity: &str,
        _key_column: &str,
        columns: &[String],
        offset: usize,
        limit: usize,
    ) -> Result<Vec<StoreRow>, StoreError> {
        let page_index = self.page_reads.fetch_add(1, Ordering::SeqCst);
        if self.failing_pages.contains(&page_index) {
            return Err(StoreError::Transient(format!("injected failure reading page {page_index}")));
        }
        let tables = self.tables.lock().await;
        let Some(table) = tables.get(entity) else {
            return Ok(Vec::new());
        };
        Ok(table
            .values()
            .skip(offset)
            .take(limit)
            .map(|row| {
                columns
                    .iter()
                    .map(|c| (c.clone(), row.get(c).cloned().unwrap_or(JsonValue::Null)))
                    .collect()
            })
            .collect())
    }

    async fn upsert(&self, entity: &str, key_column: &str, rows: &[StoreRow]) -> Result<u64, StoreError> {
        self.begin_write()?;
        self.check_rows(rows)?;
        let mut keyed = Vec::with_capacity(rows.len());
        for row in rows {
            let key = row
                .get(key_column)
                .and_then(key_text)
                .ok_or_else(|| StoreError::Rejected(format!("row without {key_column}")))?;
            keyed.push((key, row));
        }
        let mut tables = self.tables.lock().await;
        let table = tables.entry(entity.to_string()).or_default();
        for (key, row) in keyed {
            let stored = table.entry(key).or_default();
            for (column, value) in row {
                stored.insert(column.clone(), value.clone());
            }
        }
        Ok(rows.len() as u64)
    }

    async fn update_by_ids(
        &self,
        entity: &str,
        _key_column: &str,
        ids: &[String],
        values: &StoreRow,
    ) -> Result<u64, StoreError> {
        self.begin_write()?;
        let mut tables = self.tables.lock().await;
        let Some(table) = tables.get_mut(entity) else {
            return Ok(0);
        };
        let merged: Vec<(String, StoreRow)> = ids
            .iter()
            .filter_map(|id| {
                table.get(id).map(|existing| {
                    let mut row = existing.clone();
                    row.extend(values.clone());
                    (id.clone(), row)
                })
            })
            .collect();
        self.check_rows(merged.iter().map(|(_, row)| row))?;
        let affected = merged.len() as u64;
        for (id, row) in merged {
            table.insert(id, row);
        }
        Ok(affected)
    }
}
