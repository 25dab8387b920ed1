//! SQL text rendering for statement scripts and raw statement executors.

use std::path::{Path, PathBuf};

use anyhow::Context;
use lrc_core::Mutation;
use serde_json::Value as JsonValue;
use tokio::fs;
use tokio::io::{AsyncWriteExt, BufWriter};

use crate::{BatchPlan, StoreRow};

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quotes a possibly schema-qualified name such as `public.clients`.
pub fn quote_qualified(name: &str) -> String {
    name.split('.').map(quote_ident).collect::<Vec<_>>().join(".")
}

pub fn literal(value: &JsonValue) -> String {
    match value {
        JsonValue::Null => "NULL".to_string(),
        JsonValue::Bool(true) => "TRUE".to_string(),
        JsonValue::Bool(false) => "FALSE".to_string(),
        JsonValue::Number(n) => n.to_string(),
        JsonValue::String(s) => string_literal(s),
        other => string_literal(&other.to_string()),
    }
}

/// Strings with line breaks or backslashes use the `E''` escape form so a
/// statement never spans lines.
fn string_literal(s: &str) -> String {
    if s.contains(['\n', '\r', '\\']) {
        let escaped = s
            .replace('\\', "\\\\")
            .replace('\'', "\\'")
            .replace('\n', "\\n")
            .replace('\r', "\\r");
        format!("E'{escaped}'")
    } else {
        format!("'{}'", s.replace('\'', "''"))
    }
}

pub(crate) fn columns_of(rows: &[StoreRow]) -> Vec<String> {
    let mut columns: Vec<String> = Vec::new();
    for row in rows {
        for column in row.keys() {
            if !columns.contains(column) {
                columns.push(column.clone());
            }
        }
    }
    columns
}

/// `INSERT .. ON CONFLICT (key) DO UPDATE` over every row, missing cells as NULL.
pub fn upsert_statement(entity: &str, key_column: &str, rows: &[StoreRow]) -> String {
    let columns = columns_of(rows);
    let column_list = columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    let values = rows
        .iter()
        .map(|row| {
            let cells = columns
                .iter()
                .map(|c| literal(row.get(c).unwrap_or(&JsonValue::Null)))
                .collect::<Vec<_>>()
                .join(", ");
            format!("({cells})")
        })
        .collect::<Vec<_>>()
        .join(", ");
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
        "INSERT INTO {} ({column_list}) VALUES {values} ON CONFLICT ({}) {conflict};",
        quote_qualified(entity),
        quote_ident(key_column)
    )
}

pub fn update_statement(entity: &str, key_column: &str, ids: &[String], values: &StoreRow) -> String {
    let assignments = values
        .iter()
        .map(|(column, value)| format!("{} = {}", quote_ident(column), literal(value)))
        .collect::<Vec<_>>()
        .join(", ");
    let id_list = ids
        .iter()
        .map(|id| literal(&JsonValue::String(id.clone())))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "UPDATE {} SET {assignments} WHERE {} IN ({id_list});",
        quote_qualified(entity),
        quote_ident(key_column)
    )
}

/// Renders a mutation batch as one statement per line.
pub fn render_batch(entity: &str, key_column: &str, batch: &[Mutation]) -> Vec<String> {
    let plan = BatchPlan::from_mutations(key_column, batch);
    let mut statements = Vec::new();
    if !plan.upserts.is_empty() {
        statements.push(upsert_statement(entity, key_column, &plan.upserts));
    }
    for group in plan.updates.iter().filter(|g| !g.values.is_empty()) {
        statements.push(update_statement(entity, key_column, &group.ids, &group.values));
    }
    statements
}

/// Appends corrective statements to a script file for later replay.
pub struct ScriptWriter {
    path: PathBuf,
    writer: BufWriter<fs::File>,
    statements: usize,
}

impl ScriptWriter {
    pub async fn create(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating script directory {}", parent.display()))?;
        }
        let file = fs::File::create(&path)
            .await
            .with_context(|| format!("creating statement script {}", path.display()))?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
            statements: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn statements(&self) -> usize {
        self.statements
    }

    pub async fn write_statement(&mut self, statement: &str) -> std::io::Result<()> {
        self.writer.write_all(statement.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.statements += 1;
        Ok(())
    }

    pub async fn finish(mut self) -> anyhow::Result<(PathBuf, usize)> {
        self.writer
            .flush()
            .await
            .with_context(|| format!("flushing statement script {}", self.path.display()))?;
        Ok((self.path, self.statements))
    }
}
