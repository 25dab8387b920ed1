//! Postgres-backed target store.
//!
//! Rows travel as JSON and are typed by the table's own row type through
//! `jsonb_populate_recordset`, so one statement covers any column set.

use anyhow::Context;
use async_trait::async_trait;
use lrc_core::Mutation;
use serde_json::Value as JsonValue;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::debug;

use crate::sql::{columns_of, quote_ident, quote_qualified};
use crate::{BatchPlan, ExecOutput, StatementExecutor, StoreError, StoreRow, TargetStore};

/// SQLSTATEs worth retrying: serialization failure, deadlock, lock not
/// available, query cancelled, too many connections.
const RETRYABLE_SQLSTATES: &[&str] = &["40001", "40P01", "55P03", "57014", "53300"];

pub fn classify_sqlx_error(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => StoreError::Transient(err.to_string()),
        sqlx::Error::Database(db) => {
            let retryable = db
                .code()
                .map(|code| RETRYABLE_SQLSTATES.iter().any(|c| code == *c))
                .unwrap_or(false);
            if retryable {
                StoreError::Transient(err.to_string())
            } else {
                StoreError::Rejected(err.to_string())
            }
        }
        sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::Decode(_)
        | sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::TypeNotFound { .. } => StoreError::Decode(err.to_string()),
        sqlx::Error::Configuration(_) => StoreError::Config(err.to_string()),
        _ => StoreError::Rejected(err.to_string()),
    }
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await
            .context("connecting to target database")?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn upsert_sql(entity: &str, key_column: &str, columns: &[String]) -> String {
        let table = quote_qualified(entity);
        let column_list = columns.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ");
        let assignments = columns
            .iter()
            .filter(|c| c.as_str() != key_column)
            .map(|c| format!("{0} = EXCLUDED.{0}", quote_ident(c)))
            .collect::<Vec<_>>();
        let conflict = if assignments.is_empty() {
            "DO NOTHING".to_string()
        } else {
            format!("DO UPDATE SET {}", assignments.join(", "))
        };
        format!(
            "INSERT INTO {table} ({column_list}) \
             SELECT {column_list} FROM jsonb_populate_recordset(NULL::{table}, $1) \
             ON CONFLICT ({}) {conflict}",
            quote_ident(key_column)
        )
    }

    fn update_sql(entity: &str, key_column: &str, columns: &[String]) -> String {
        let table = quote_qualified(entity);
        let assignments = columns
            .iter()
            .map(|c| format!("{0} = v.{0}", quote_ident(c)))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "UPDATE {table} AS t SET {assignments} \
             FROM jsonb_populate_record(NULL::{table}, $1) AS v \
             WHERE t.{}::text = ANY($2)",
            quote_ident(key_column)
        )
    }
}

#[async_trait]
impl TargetStore for PgStore {
    fn describe(&self) -> String {
        "postgres".to_string()
    }

    async fn fetch_page(
        &self,
        entity: &str,
        key_column: &str,
        columns: &[String],
        offset: usize,
        limit: usize,
    ) -> Result<Vec<StoreRow>, StoreError> {
        let projection = columns.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ");
        let sql = format!(
            "SELECT to_jsonb(t) AS row FROM (SELECT {projection} FROM {} ORDER BY {} LIMIT $1 OFFSET $2) t",
            quote_qualified(entity),
            quote_ident(key_column)
        );
        debug!(entity, offset, limit, "fetching page");
        let rows = sqlx::query(&sql)
            .bind(limit as i64)
            .bind(offset as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(classify_sqlx_error)?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let value: JsonValue = row.try_get("row").map_err(classify_sqlx_error)?;
            match value {
                JsonValue::Object(map) => out.push(map),
                other => return Err(StoreError::Decode(format!("expected row object, got {other}"))),
            }
        }
        Ok(out)
    }

    async fn upsert(&self, entity: &str, key_column: &str, rows: &[StoreRow]) -> Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let sql = Self::upsert_sql(entity, key_column, &columns_of(rows));
        let result = sqlx::query(&sql)
            .bind(Json(rows))
            .execute(&self.pool)
            .await
            .map_err(classify_sqlx_error)?;
        Ok(result.rows_affected())
    }

    async fn update_by_ids(
        &self,
        entity: &str,
        key_column: &str,
        ids: &[String],
        values: &StoreRow,
    ) -> Result<u64, StoreError> {
        if ids.is_empty() || values.is_empty() {
            return Ok(0);
        }
        let columns: Vec<String> = values.keys().cloned().collect();
        let sql = Self::update_sql(entity, key_column, &columns);
        let result = sqlx::query(&sql)
            .bind(Json(values))
            .bind(ids)
            .execute(&self.pool)
            .await
            .map_err(classify_sqlx_error)?;
        Ok(result.rows_affected())
    }

    /// Runs every statement of the batch in one transaction so the batch
    /// lands as a unit or not at all.
    async fn apply_batch(&self, entity: &str, key_column: &str, batch: &[Mutation]) -> Result<u64, StoreError> {
        let plan = BatchPlan::from_mutations(key_column, batch);
        let mut tx = self.pool.begin().await.map_err(classify_sqlx_error)?;
        let mut affected = 0u64;
        if !plan.upserts.is_empty() {
            let sql = Self::upsert_sql(entity, key_column, &columns_of(&plan.upserts));
            affected += sqlx::query(&sql)
                .bind(Json(&plan.upserts))
                .execute(&mut *tx)
                .await
                .map_err(classify_sqlx_error)?
                .rows_affected();
        }
        for group in plan.updates.iter().filter(|g| !g.values.is_empty()) {
            let columns: Vec<String> = group.values.keys().cloned().collect();
            let sql = Self::update_sql(entity, key_column, &columns);
            affected += sqlx::query(&sql)
                .bind(Json(&group.values))
                .bind(&group.ids)
                .execute(&mut *tx)
                .await
                .map_err(classify_sqlx_error)?
                .rows_affected();
        }
        tx.commit().await.map_err(classify_sqlx_error)?;
        Ok(affected)
    }
}

#[async_trait]
impl StatementExecutor for PgStore {
    /// A failing statement drops the transaction, which rolls back before the
    /// connection returns to the pool.
    async fn execute(&self, statement: &str) -> Result<ExecOutput, StoreError> {
        let mut tx = self.pool.begin().await.map_err(classify_sqlx_error)?;
        let result = sqlx::Executor::execute(&mut *tx, sqlx::raw_sql(statement))
            .await
            .map_err(classify_sqlx_error)?;
        tx.commit().await.map_err(classify_sqlx_error)?;
        Ok(ExecOutput {
            affected_rows: result.rows_affected(),
            output: format!("{} rows affected", result.rows_affected()),
        })
    }
}
