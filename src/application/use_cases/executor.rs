//! Query execution for planner-approved SELECTs.
//!
//! Each query resolves its target connection (query-supplied, else the
//! scope's first entry, always within scope), passes validation, and runs
//! with a statement timeout and a hard row cap. The first failure
//! short-circuits the batch so the planner can retry with the error fed
//! back.

use crate::application::use_cases::schema_context::AllowlistMap;
use crate::application::use_cases::sql_validator::validate_sql;
use crate::domain::connection::ConnectionProvider;
use crate::domain::error::{AppError, Result};
use crate::domain::planner::{ExecutedQuery, PlannerQuery, SqlError, SqlResult};
use crate::infrastructure::config::Settings;
use crate::infrastructure::engine_cache::EngineCache;
use async_trait::async_trait;
use bigdecimal::BigDecimal;
use sqlx::{Column, Row};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

/// Raw output of one SELECT.
#[derive(Debug, Clone)]
pub struct SelectOutput {
    pub columns: Vec<String>,
    pub rows: Vec<HashMap<String, serde_json::Value>>,
}

/// Seam between the executor and the live target database.
#[async_trait]
pub trait SelectRunner: Send + Sync {
    async fn run_select(&self, connection_id: i64, sql: &str) -> Result<SelectOutput>;
}

/// Outcome of one execution round. `error` is set when a query failed and
/// the remainder of the batch was skipped.
#[derive(Debug, Default)]
pub struct ExecutionBatch {
    pub results: Vec<SqlResult>,
    pub executed: Vec<ExecutedQuery>,
    pub error: Option<SqlError>,
}

pub struct QueryExecutor {
    runner: Arc<dyn SelectRunner>,
    settings: Arc<Settings>,
}

impl QueryExecutor {
    pub fn new(runner: Arc<dyn SelectRunner>, settings: Arc<Settings>) -> Self {
        Self { runner, settings }
    }

    pub async fn run(
        &self,
        queries: &[PlannerQuery],
        connection_ids: &[i64],
        allowlists: &AllowlistMap,
    ) -> ExecutionBatch {
        let mut batch = ExecutionBatch::default();
        let empty_allowlist = HashSet::new();
        let max_rows = self.settings.sql_max_rows;

        for query in queries {
            let connection_id = match query.connection_id.or_else(|| connection_ids.first().copied())
            {
                Some(id) => id,
                None => {
                    batch.error = Some(SqlError {
                        query_name: query.name.clone(),
                        message: "No connection available to execute the query.".to_string(),
                    });
                    break;
                }
            };
            if !connection_ids.contains(&connection_id) {
                batch.error = Some(SqlError {
                    query_name: query.name.clone(),
                    message: "Connection not permitted for this query.".to_string(),
                });
                break;
            }

            let allowed = allowlists.get(&connection_id).unwrap_or(&empty_allowlist);
            let validation = validate_sql(&query.sql, allowed, max_rows);
            if !validation.is_valid {
                batch.error = Some(SqlError {
                    query_name: query.name.clone(),
                    message: validation
                        .error
                        .unwrap_or_else(|| "Invalid query.".to_string()),
                });
                break;
            }

            let started = Instant::now();
            match self
                .runner
                .run_select(connection_id, &validation.safe_sql)
                .await
            {
                Ok(output) => {
                    let mut rows = output.rows;
                    rows.truncate(max_rows as usize);
                    let row_count = rows.len();
                    let truncated = row_count >= max_rows as usize;
                    let elapsed_ms = started.elapsed().as_millis() as i64;
                    batch.results.push(SqlResult {
                        name: query.name.clone(),
                        sql: validation.safe_sql.clone(),
                        columns: output.columns,
                        rows,
                        row_count,
                        truncated,
                        connection_id,
                    });
                    batch.executed.push(ExecutedQuery {
                        name: query.name.clone(),
                        sql: validation.safe_sql,
                        rows_returned: row_count as i64,
                        truncated,
                        elapsed_ms,
                        connection_id,
                    });
                }
                Err(e) => {
                    batch.error = Some(SqlError {
                        query_name: query.name.clone(),
                        message: e.to_string(),
                    });
                    break;
                }
            }
        }

        batch
    }
}

/// Live runner: resolves the connection, takes an engine from the cache,
/// applies the statement timeout, and fetches capped rows.
pub struct PgSelectRunner {
    cache: Arc<EngineCache>,
    connections: Arc<dyn ConnectionProvider>,
    settings: Arc<Settings>,
}

impl PgSelectRunner {
    pub fn new(
        cache: Arc<EngineCache>,
        connections: Arc<dyn ConnectionProvider>,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            cache,
            connections,
            settings,
        }
    }
}

#[async_trait]
impl SelectRunner for PgSelectRunner {
    async fn run_select(&self, connection_id: i64, sql: &str) -> Result<SelectOutput> {
        let info = self
            .connections
            .get_connection(connection_id)
            .await?
            .ok_or_else(|| AppError::NotFound("Connection not found.".to_string()))?;

        let pool = self.cache.acquire(&info)?;
        let mut conn = pool
            .acquire()
            .await
            .map_err(|e| AppError::DatabaseError(format!("Failed to acquire connection: {}", e)))?;

        if self.settings.db_dialect == "postgres" {
            sqlx::query(&format!(
                "SET statement_timeout = {}",
                self.settings.sql_timeout_ms
            ))
            .execute(&mut *conn)
            .await
            .map_err(|e| {
                AppError::DatabaseError(format!("Failed to set statement timeout: {}", e))
            })?;
        }

        // Client-side ceiling on top of the server-side statement timeout.
        let timeout = Duration::from_millis(self.settings.sql_timeout_ms.max(0) as u64 + 1000);
        let rows = tokio::time::timeout(timeout, sqlx::query(sql).fetch_all(&mut *conn))
            .await
            .map_err(|_| {
                AppError::DatabaseError(format!(
                    "Query timed out after {} ms",
                    self.settings.sql_timeout_ms
                ))
            })?
            .map_err(|e| AppError::DatabaseError(format!("Query execution failed: {}", e)))?;

        let mut columns: Vec<String> = Vec::new();
        let mut rows_json: Vec<HashMap<String, serde_json::Value>> = Vec::new();
        for row in rows.iter().take(self.settings.sql_max_rows as usize) {
            if columns.is_empty() {
                columns = row.columns().iter().map(|c| c.name().to_string()).collect();
            }
            let mut row_map = HashMap::new();
            for (i, column) in row.columns().iter().enumerate() {
                row_map.insert(column.name().to_string(), extract_column_value(row, i));
            }
            rows_json.push(row_map);
        }

        info!(
            connection_id,
            rows = rows_json.len(),
            "select_executed"
        );

        Ok(SelectOutput {
            columns,
            rows: rows_json,
        })
    }
}

/// Best-effort coercion of a PostgreSQL value into JSON; unsupported
/// types become null rather than failing the whole row.
fn extract_column_value(row: &sqlx::postgres::PgRow, index: usize) -> serde_json::Value {
    if let Ok(v) = row.try_get::<Option<String>, _>(index) {
        return v
            .map(serde_json::Value::String)
            .unwrap_or(serde_json::Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<i64>, _>(index) {
        return v
            .map(|n| serde_json::Value::Number(n.into()))
            .unwrap_or(serde_json::Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<i32>, _>(index) {
        return v
            .map(|n| serde_json::Value::Number(n.into()))
            .unwrap_or(serde_json::Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(index) {
        return v
            .and_then(serde_json::Number::from_f64)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<BigDecimal>, _>(index) {
        return v
            .map(|n| serde_json::Value::String(n.to_string()))
            .unwrap_or(serde_json::Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<bool>, _>(index) {
        return v
            .map(serde_json::Value::Bool)
            .unwrap_or(serde_json::Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(index) {
        return v
            .map(|dt| serde_json::Value::String(dt.to_rfc3339()))
            .unwrap_or(serde_json::Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<chrono::NaiveDateTime>, _>(index) {
        return v
            .map(|dt| serde_json::Value::String(dt.to_string()))
            .unwrap_or(serde_json::Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<chrono::NaiveDate>, _>(index) {
        return v
            .map(|d| serde_json::Value::String(d.to_string()))
            .unwrap_or(serde_json::Value::Null);
    }

    serde_json::Value::Null
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeRunner {
        rows: Vec<HashMap<String, serde_json::Value>>,
        fail_with: Option<String>,
    }

    #[async_trait]
    impl SelectRunner for FakeRunner {
        async fn run_select(&self, _connection_id: i64, _sql: &str) -> Result<SelectOutput> {
            if let Some(message) = &self.fail_with {
                return Err(AppError::DatabaseError(message.clone()));
            }
            Ok(SelectOutput {
                columns: vec!["id".to_string(), "name".to_string()],
                rows: self.rows.clone(),
            })
        }
    }

    fn settings(max_rows: i64) -> Arc<Settings> {
        Arc::new(Settings {
            sql_max_rows: max_rows,
            ..Settings::default()
        })
    }

    fn allowlists() -> AllowlistMap {
        let mut map = AllowlistMap::new();
        map.insert(
            1,
            ["public.assets", "assets"].iter().map(|s| s.to_string()).collect(),
        );
        map
    }

    fn query(sql: &str, connection_id: Option<i64>) -> PlannerQuery {
        PlannerQuery {
            name: "probe".to_string(),
            purpose: "test".to_string(),
            sql: sql.to_string(),
            connection_id,
            expected_shape: None,
            safety: None,
        }
    }

    fn row(id: i64) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("id".to_string(), serde_json::json!(id));
        map
    }

    #[tokio::test]
    async fn test_executes_valid_query() {
        let runner = Arc::new(FakeRunner {
            rows: vec![row(1), row(2)],
            fail_with: None,
        });
        let executor = QueryExecutor::new(runner, settings(5));
        let batch = executor
            .run(&[query("SELECT id FROM public.assets", Some(1))], &[1], &allowlists())
            .await;
        assert!(batch.error.is_none());
        assert_eq!(batch.results.len(), 1);
        assert_eq!(batch.executed[0].rows_returned, 2);
        assert!(!batch.executed[0].truncated);
        assert!(batch.executed[0].sql.ends_with("LIMIT 5"));
    }

    #[tokio::test]
    async fn test_marks_truncated_at_cap() {
        let runner = Arc::new(FakeRunner {
            rows: (0..10).map(row).collect(),
            fail_with: None,
        });
        let executor = QueryExecutor::new(runner, settings(5));
        let batch = executor
            .run(&[query("SELECT id FROM public.assets", Some(1))], &[1], &allowlists())
            .await;
        assert_eq!(batch.results[0].row_count, 5);
        assert!(batch.results[0].truncated);
    }

    #[tokio::test]
    async fn test_defaults_to_first_scope_connection() {
        let runner = Arc::new(FakeRunner {
            rows: vec![row(1)],
            fail_with: None,
        });
        let executor = QueryExecutor::new(runner, settings(5));
        let batch = executor
            .run(&[query("SELECT id FROM public.assets", None)], &[1, 2], &allowlists())
            .await;
        assert!(batch.error.is_none());
        assert_eq!(batch.executed[0].connection_id, 1);
    }

    #[tokio::test]
    async fn test_rejects_out_of_scope_connection() {
        let runner = Arc::new(FakeRunner {
            rows: vec![],
            fail_with: None,
        });
        let executor = QueryExecutor::new(runner, settings(5));
        let batch = executor
            .run(&[query("SELECT id FROM public.assets", Some(9))], &[1], &allowlists())
            .await;
        let error = batch.error.unwrap();
        assert!(error.message.contains("not permitted"));
        assert!(batch.executed.is_empty());
    }

    #[tokio::test]
    async fn test_validation_failure_short_circuits() {
        let runner = Arc::new(FakeRunner {
            rows: vec![row(1)],
            fail_with: None,
        });
        let executor = QueryExecutor::new(runner, settings(5));
        let queries = vec![
            query("DELETE FROM public.assets", Some(1)),
            query("SELECT id FROM public.assets", Some(1)),
        ];
        let batch = executor.run(&queries, &[1], &allowlists()).await;
        assert!(batch.error.is_some());
        assert!(batch.results.is_empty());
    }

    #[tokio::test]
    async fn test_runner_failure_is_reported() {
        let runner = Arc::new(FakeRunner {
            rows: vec![],
            fail_with: Some("relation does not exist".to_string()),
        });
        let executor = QueryExecutor::new(runner, settings(5));
        let batch = executor
            .run(&[query("SELECT id FROM public.assets", Some(1))], &[1], &allowlists())
            .await;
        let error = batch.error.unwrap();
        assert_eq!(error.query_name, "probe");
        assert!(error.message.contains("relation does not exist"));
    }
}
