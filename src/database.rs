//! Query Executor
//!
//! Runs sanitized SQL against the relational database and renders the result
//! as text for the rephraser. A statement the database rejects is not a
//! pipeline failure: the error message becomes the result text so the
//! rephraser can explain it to the user.

use crate::config::DatabaseConfig;
use crate::dialect::Dialect;
use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use futures::{Stream, StreamExt, TryStreamExt};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::mysql::{MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Column, Row, TypeInfo, ValueRef};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Rows returned by a successful statement.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryRows {
    pub columns: Vec<String>,
    pub rows: Vec<Map<String, Value>>,
    /// More rows existed than were kept.
    pub truncated: bool,
}

impl QueryRows {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Compact JSON array of row objects.
    pub fn to_compact_json(&self) -> String {
        serde_json::to_string(&self.rows).unwrap_or_else(|_| "[]".to_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Rows(QueryRows),
    Failed(String),
}

impl ExecutionOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, ExecutionOutcome::Failed(_))
    }

    /// Text handed to the rephraser as the SQL result.
    pub fn as_text(&self) -> String {
        match self {
            ExecutionOutcome::Rows(rows) if rows.truncated => format!(
                "{} (showing the first {} rows)",
                rows.to_compact_json(),
                rows.row_count()
            ),
            ExecutionOutcome::Rows(rows) => rows.to_compact_json(),
            ExecutionOutcome::Failed(message) => format!("Error: {}", message),
        }
    }
}

#[async_trait]
pub trait Database: Send + Sync {
    /// Run one statement. A database rejection comes back as its message.
    async fn execute(&self, sql: &str) -> std::result::Result<QueryRows, String>;

    /// Column listing and sample rows for the named tables.
    async fn table_info(&self, tables: &[String]) -> Result<String>;
}

/// Wraps a [`Database`] so that execution never fails.
pub struct QueryExecutor {
    db: Arc<dyn Database>,
}

impl QueryExecutor {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    pub async fn execute(&self, sql: &str) -> ExecutionOutcome {
        let start = Instant::now();
        match self.db.execute(sql).await {
            Ok(rows) => {
                info!(
                    "Query returned {} rows in {}ms",
                    rows.row_count(),
                    start.elapsed().as_millis()
                );
                ExecutionOutcome::Rows(rows)
            }
            Err(message) => {
                warn!("Query failed, passing the error to the rephraser: {}", message);
                ExecutionOutcome::Failed(message)
            }
        }
    }
}

#[derive(Debug, Clone)]
enum Pool {
    MySql(MySqlPool),
    Postgres(PgPool),
}

/// MySQL or PostgreSQL database behind an sqlx pool.
#[derive(Debug, Clone)]
pub struct SqlDatabase {
    pool: Pool,
    max_result_rows: usize,
    sample_rows: usize,
}

impl SqlDatabase {
    pub async fn connect(config: &DatabaseConfig, max_result_rows: usize) -> Result<Self> {
        let acquire_timeout = Duration::from_secs(config.acquire_timeout_secs);
        let connect_err = |e: sqlx::Error| PipelineError::Database(format!("failed to connect: {}", e));

        let pool = match config.dialect {
            Dialect::MySql => {
                let pool = MySqlPoolOptions::new()
                    .max_connections(config.max_connections)
                    .acquire_timeout(acquire_timeout)
                    .connect(&config.url)
                    .await
                    .map_err(connect_err)?;
                sqlx::query("SELECT 1").execute(&pool).await.map_err(connect_err)?;
                Pool::MySql(pool)
            }
            Dialect::Postgres => {
                let pool = PgPoolOptions::new()
                    .max_connections(config.max_connections)
                    .acquire_timeout(acquire_timeout)
                    .connect(&config.url)
                    .await
                    .map_err(connect_err)?;
                sqlx::query("SELECT 1").execute(&pool).await.map_err(connect_err)?;
                Pool::Postgres(pool)
            }
        };

        info!("Connected to {} database", config.dialect);
        Ok(Self {
            pool,
            max_result_rows,
            sample_rows: config.sample_rows,
        })
    }

    pub fn dialect(&self) -> Dialect {
        match self.pool {
            Pool::MySql(_) => Dialect::MySql,
            Pool::Postgres(_) => Dialect::Postgres,
        }
    }

    async fn fetch(&self, sql: &str, limit: usize) -> std::result::Result<QueryRows, sqlx::Error> {
        match &self.pool {
            Pool::MySql(pool) => {
                let (rows, truncated) = take_capped(sqlx::query(sql).fetch(pool), limit).await?;
                Ok(collect_rows(&rows, truncated, mysql_cell))
            }
            Pool::Postgres(pool) => {
                let (rows, truncated) = take_capped(sqlx::query(sql).fetch(pool), limit).await?;
                Ok(collect_rows(&rows, truncated, pg_cell))
            }
        }
    }

    async fn columns_of(&self, table: &str) -> Result<Vec<ColumnInfo>> {
        let to_db_err =
            |e: sqlx::Error| PipelineError::Database(format!("failed to describe {}: {}", table, e));

        let columns = match &self.pool {
            Pool::MySql(pool) => sqlx::query(
                "SELECT CAST(column_name AS CHAR), CAST(column_type AS CHAR), CAST(is_nullable AS CHAR) \
                 FROM information_schema.columns \
                 WHERE table_schema = DATABASE() AND table_name = ? \
                 ORDER BY ordinal_position",
            )
            .bind(table)
            .fetch_all(pool)
            .await
            .map_err(to_db_err)?
            .iter()
            .map(|row| column_info(row.try_get(0), row.try_get(1), row.try_get(2)))
            .collect::<std::result::Result<Vec<_>, _>>(),
            Pool::Postgres(pool) => sqlx::query(
                "SELECT column_name::text, data_type::text, is_nullable::text \
                 FROM information_schema.columns \
                 WHERE table_schema = current_schema() AND table_name = $1 \
                 ORDER BY ordinal_position",
            )
            .bind(table)
            .fetch_all(pool)
            .await
            .map_err(to_db_err)?
            .iter()
            .map(|row| column_info(row.try_get(0), row.try_get(1), row.try_get(2)))
            .collect::<std::result::Result<Vec<_>, _>>(),
        }
        .map_err(to_db_err)?;

        if columns.is_empty() {
            return Err(PipelineError::Database(format!(
                "table '{}' does not exist in the database",
                table
            )));
        }
        Ok(columns)
    }
}

#[async_trait]
impl Database for SqlDatabase {
    async fn execute(&self, sql: &str) -> std::result::Result<QueryRows, String> {
        debug!("Executing: {}", sql);
        self.fetch(sql, self.max_result_rows)
            .await
            .map_err(|e| e.to_string())
    }

    async fn table_info(&self, tables: &[String]) -> Result<String> {
        let mut sections = Vec::with_capacity(tables.len());
        for table in tables {
            let columns = self.columns_of(table).await?;
            let sample_sql = format!(
                "SELECT * FROM {} LIMIT {}",
                self.dialect().quote_identifier(table),
                self.sample_rows
            );
            let sample = if self.sample_rows == 0 {
                QueryRows::default()
            } else {
                self.fetch(&sample_sql, self.sample_rows).await.map_err(|e| {
                    PipelineError::Database(format!("failed to sample {}: {}", table, e))
                })?
            };
            sections.push(format_table_info(table, &columns, &sample));
        }
        Ok(sections.join("\n\n"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
}

fn column_info(
    name: std::result::Result<String, sqlx::Error>,
    data_type: std::result::Result<String, sqlx::Error>,
    is_nullable: std::result::Result<String, sqlx::Error>,
) -> std::result::Result<ColumnInfo, sqlx::Error> {
    Ok(ColumnInfo {
        name: name?,
        data_type: data_type?,
        nullable: is_nullable?.eq_ignore_ascii_case("YES"),
    })
}

/// DDL-like listing followed by a comment block of sample rows.
pub fn format_table_info(table: &str, columns: &[ColumnInfo], sample: &QueryRows) -> String {
    let column_lines: Vec<String> = columns
        .iter()
        .map(|c| {
            if c.nullable {
                format!("\t{} {}", c.name, c.data_type)
            } else {
                format!("\t{} {} NOT NULL", c.name, c.data_type)
            }
        })
        .collect();

    let mut out = format!("CREATE TABLE {} (\n{}\n)", table, column_lines.join(",\n"));
    if !sample.rows.is_empty() {
        let header = sample.columns.join("\t");
        let lines: Vec<String> = sample
            .rows
            .iter()
            .map(|row| {
                sample
                    .columns
                    .iter()
                    .map(|c| row.get(c).map(value_text).unwrap_or_default())
                    .collect::<Vec<_>>()
                    .join("\t")
            })
            .collect();
        out.push_str(&format!(
            "\n\n/*\n{} rows from {} table:\n{}\n{}\n*/",
            sample.rows.len(),
            table,
            header,
            lines.join("\n")
        ));
    }
    out
}

fn value_text(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Pull at most `limit` items, plus one to learn whether more were available.
/// The rest of the stream is never read.
async fn take_capped<S, T, E>(stream: S, limit: usize) -> std::result::Result<(Vec<T>, bool), E>
where
    S: Stream<Item = std::result::Result<T, E>>,
{
    let mut items: Vec<T> = stream.take(limit.saturating_add(1)).try_collect().await?;
    let truncated = items.len() > limit;
    items.truncate(limit);
    Ok((items, truncated))
}

fn collect_rows<R, F>(rows: &[R], truncated: bool, cell: F) -> QueryRows
where
    R: Row,
    F: Fn(&R, usize) -> Value,
{
    let columns: Vec<String> = rows
        .first()
        .map(|row| row.columns().iter().map(|c| c.name().to_string()).collect())
        .unwrap_or_default();

    let kept = rows
        .iter()
        .map(|row| {
            columns
                .iter()
                .enumerate()
                .map(|(idx, name)| (name.clone(), cell(row, idx)))
                .collect::<Map<String, Value>>()
        })
        .collect();

    QueryRows {
        columns,
        rows: kept,
        truncated,
    }
}

/// Return the first type the column decodes as.
macro_rules! decode_first {
    ($row:expr, $idx:expr, $($ty:ty => $render:expr),+ $(,)?) => {
        $(
            if let Ok(Some(value)) = $row.try_get::<Option<$ty>, _>($idx) {
                return ($render)(value);
            }
        )+
    };
}

fn mysql_cell(row: &MySqlRow, idx: usize) -> Value {
    match row.try_get_raw(idx) {
        Ok(raw) if raw.is_null() => return Value::Null,
        Err(_) => return Value::Null,
        Ok(_) => {}
    }
    decode_first!(row, idx,
        i64 => |v: i64| Value::from(v),
        u64 => |v: u64| Value::from(v),
        f64 => |v: f64| Value::from(v),
        f32 => |v: f32| Value::from(v),
        Decimal => |v: Decimal| Value::String(v.to_string()),
        bool => |v: bool| Value::from(v),
        String => |v: String| Value::String(v),
        chrono::NaiveDateTime => |v: chrono::NaiveDateTime| Value::String(v.to_string()),
        chrono::DateTime<chrono::Utc> => |v: chrono::DateTime<chrono::Utc>| Value::String(v.to_rfc3339()),
        chrono::NaiveDate => |v: chrono::NaiveDate| Value::String(v.to_string()),
        chrono::NaiveTime => |v: chrono::NaiveTime| Value::String(v.to_string()),
        Vec<u8> => |v: Vec<u8>| Value::String(String::from_utf8_lossy(&v).into_owned()),
    );
    Value::String(format!("<{}>", row.column(idx).type_info().name()))
}

fn pg_cell(row: &PgRow, idx: usize) -> Value {
    match row.try_get_raw(idx) {
        Ok(raw) if raw.is_null() => return Value::Null,
        Err(_) => return Value::Null,
        Ok(_) => {}
    }
    decode_first!(row, idx,
        i64 => |v: i64| Value::from(v),
        i32 => |v: i32| Value::from(v),
        i16 => |v: i16| Value::from(v),
        f64 => |v: f64| Value::from(v),
        f32 => |v: f32| Value::from(v),
        Decimal => |v: Decimal| Value::String(v.to_string()),
        bool => |v: bool| Value::from(v),
        String => |v: String| Value::String(v),
        chrono::NaiveDateTime => |v: chrono::NaiveDateTime| Value::String(v.to_string()),
        chrono::DateTime<chrono::Utc> => |v: chrono::DateTime<chrono::Utc>| Value::String(v.to_rfc3339()),
        chrono::NaiveDate => |v: chrono::NaiveDate| Value::String(v.to_string()),
        chrono::NaiveTime => |v: chrono::NaiveTime| Value::String(v.to_string()),
        Vec<u8> => |v: Vec<u8>| Value::String(String::from_utf8_lossy(&v).into_owned()),
    );
    Value::String(format!("<{}>", row.column(idx).type_info().name()))
}
