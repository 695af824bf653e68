//! Read access to the harvested catalog plus the scan-status updates the
//! reconciliation path performs. The scanner owns all other writes.

use crate::domain::catalog::{ScanRecord, ScanStatus};
use crate::domain::error::{AppError, Result};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use std::collections::HashMap;

/// One catalog table row with its scan lineage resolved.
#[derive(Debug, Clone)]
pub struct TableRow {
    pub id: i64,
    pub schema: String,
    pub name: String,
    pub table_type: Option<String>,
    pub description: Option<String>,
    pub annotations: Option<serde_json::Value>,
    pub scan_id: i64,
    pub connection_id: i64,
}

#[derive(Debug, Clone)]
pub struct ColumnRow {
    pub id: i64,
    pub table_id: i64,
    pub name: String,
    pub data_type: Option<String>,
    pub is_nullable: Option<bool>,
    pub description: Option<String>,
    pub annotations: Option<serde_json::Value>,
    pub table_schema: String,
    pub table_name: String,
    pub scan_id: i64,
    pub connection_id: i64,
}

#[derive(Debug, Clone)]
pub struct ConstraintRow {
    pub table_id: i64,
    pub name: String,
    pub constraint_type: Option<String>,
    pub definition: Option<String>,
}

#[derive(Debug, Clone)]
pub struct IndexRow {
    pub table_id: i64,
    pub name: String,
    pub definition: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ApiRouteRow {
    pub id: i64,
    pub name: String,
    pub method: String,
    pub path: String,
    pub base_url: Option<String>,
    pub description: Option<String>,
    pub auth_type: Option<String>,
    pub headers_template: Option<serde_json::Value>,
    pub body_template: Option<serde_json::Value>,
    pub query_params_template: Option<serde_json::Value>,
    pub tags: Option<serde_json::Value>,
}

pub struct CatalogRepository {
    pool: PgPool,
}

impl CatalogRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Scans for the given connections in the given statuses, newest first
    /// per connection (`finished_at` desc with nulls last, then
    /// `started_at` desc).
    pub async fn load_scans(
        &self,
        connection_ids: &[i64],
        statuses: &[ScanStatus],
    ) -> Result<Vec<ScanRecord>> {
        if connection_ids.is_empty() || statuses.is_empty() {
            return Ok(Vec::new());
        }
        let status_values: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
        let rows = sqlx::query(
            r#"
            SELECT id, connection_id, status, started_at, finished_at, error_message
            FROM scans
            WHERE connection_id = ANY($1) AND status = ANY($2)
            ORDER BY connection_id, finished_at DESC NULLS LAST, started_at DESC
            "#,
        )
        .bind(connection_ids)
        .bind(&status_values)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(format!("Failed to load scans: {}", e)))?;

        rows.into_iter().map(|row| self.map_scan(&row)).collect()
    }

    /// Running scans started before the cutoff.
    pub async fn load_stale_running_scans(
        &self,
        connection_ids: &[i64],
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<ScanRecord>> {
        if connection_ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            r#"
            SELECT id, connection_id, status, started_at, finished_at, error_message
            FROM scans
            WHERE connection_id = ANY($1)
              AND status = 'running'
              AND started_at IS NOT NULL
              AND started_at < $2
            ORDER BY id
            "#,
        )
        .bind(connection_ids)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(format!("Failed to load stale scans: {}", e)))?;

        rows.into_iter().map(|row| self.map_scan(&row)).collect()
    }

    /// Whether the scanner wrote at least one table for this scan.
    pub async fn scan_has_catalog(&self, scan_id: i64) -> Result<bool> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS table_count
            FROM db_tables t
            JOIN db_schemas s ON s.id = t.schema_id
            WHERE s.scan_id = $1
            "#,
        )
        .bind(scan_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(format!("Failed to probe scan catalog: {}", e)))?;

        let count: i64 = row
            .try_get("table_count")
            .map_err(|e| AppError::DatabaseError(format!("Failed to parse table_count: {}", e)))?;
        Ok(count > 0)
    }

    /// Promotes a scan to completed, keeping an existing `finished_at`.
    pub async fn complete_scan(&self, scan_id: i64, finished_at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE scans
            SET status = 'completed',
                finished_at = COALESCE(finished_at, $2),
                error_message = NULL
            WHERE id = $1
            "#,
        )
        .bind(scan_id)
        .bind(finished_at)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(format!("Failed to complete scan: {}", e)))?;
        Ok(())
    }

    pub async fn fail_scan(
        &self,
        scan_id: i64,
        finished_at: DateTime<Utc>,
        message: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE scans
            SET status = 'failed', finished_at = $2, error_message = $3
            WHERE id = $1
            "#,
        )
        .bind(scan_id)
        .bind(finished_at)
        .bind(message)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(format!("Failed to fail scan: {}", e)))?;
        Ok(())
    }

    /// Latest completed scan id per connection.
    pub async fn latest_completed_scan_ids(&self, connection_ids: &[i64]) -> Result<Vec<i64>> {
        let scans = self
            .load_scans(connection_ids, &[ScanStatus::Completed])
            .await?;
        let mut latest: HashMap<i64, i64> = HashMap::new();
        for scan in scans {
            latest.entry(scan.connection_id).or_insert(scan.id);
        }
        Ok(latest.into_values().collect())
    }

    pub async fn load_tables(&self, scan_ids: &[i64]) -> Result<Vec<TableRow>> {
        if scan_ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            r#"
            SELECT t.id, t.name, t.table_type, t.description, t.annotations,
                   s.name AS schema_name, s.scan_id, sc.connection_id
            FROM db_tables t
            JOIN db_schemas s ON s.id = t.schema_id
            JOIN scans sc ON sc.id = s.scan_id
            WHERE s.scan_id = ANY($1)
            ORDER BY t.id
            "#,
        )
        .bind(scan_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(format!("Failed to load tables: {}", e)))?;

        rows.into_iter().map(|row| self.map_table(&row)).collect()
    }

    /// Every catalog table, optionally narrowed to one scan. Used by the
    /// reindex pipeline.
    pub async fn load_tables_for_reindex(&self, scan_id: Option<i64>) -> Result<Vec<TableRow>> {
        let rows = sqlx::query(
            r#"
            SELECT t.id, t.name, t.table_type, t.description, t.annotations,
                   s.name AS schema_name, s.scan_id, sc.connection_id
            FROM db_tables t
            JOIN db_schemas s ON s.id = t.schema_id
            JOIN scans sc ON sc.id = s.scan_id
            WHERE $1::bigint IS NULL OR s.scan_id = $1
            ORDER BY t.id
            "#,
        )
        .bind(scan_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(format!("Failed to load tables: {}", e)))?;

        rows.into_iter().map(|row| self.map_table(&row)).collect()
    }

    pub async fn load_columns(&self, table_ids: &[i64]) -> Result<Vec<ColumnRow>> {
        if table_ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            r#"
            SELECT c.id, c.table_id, c.name, c.data_type, c.is_nullable,
                   c.description, c.annotations,
                   s.name AS schema_name, t.name AS table_name,
                   s.scan_id, sc.connection_id
            FROM db_columns c
            JOIN db_tables t ON t.id = c.table_id
            JOIN db_schemas s ON s.id = t.schema_id
            JOIN scans sc ON sc.id = s.scan_id
            WHERE c.table_id = ANY($1)
            ORDER BY c.table_id, c.id
            "#,
        )
        .bind(table_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(format!("Failed to load columns: {}", e)))?;

        rows.into_iter().map(|row| self.map_column(&row)).collect()
    }

    pub async fn load_columns_for_reindex(&self, scan_id: Option<i64>) -> Result<Vec<ColumnRow>> {
        let rows = sqlx::query(
            r#"
            SELECT c.id, c.table_id, c.name, c.data_type, c.is_nullable,
                   c.description, c.annotations,
                   s.name AS schema_name, t.name AS table_name,
                   s.scan_id, sc.connection_id
            FROM db_columns c
            JOIN db_tables t ON t.id = c.table_id
            JOIN db_schemas s ON s.id = t.schema_id
            JOIN scans sc ON sc.id = s.scan_id
            WHERE $1::bigint IS NULL OR s.scan_id = $1
            ORDER BY c.table_id, c.id
            "#,
        )
        .bind(scan_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(format!("Failed to load columns: {}", e)))?;

        rows.into_iter().map(|row| self.map_column(&row)).collect()
    }

    pub async fn load_constraints(&self, table_ids: &[i64]) -> Result<Vec<ConstraintRow>> {
        if table_ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            r#"
            SELECT table_id, name, constraint_type, definition
            FROM db_constraints
            WHERE table_id = ANY($1)
            ORDER BY table_id, id
            "#,
        )
        .bind(table_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(format!("Failed to load constraints: {}", e)))?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(ConstraintRow {
                table_id: try_get(&row, "table_id")?,
                name: try_get(&row, "name")?,
                constraint_type: try_get(&row, "constraint_type")?,
                definition: try_get(&row, "definition")?,
            });
        }
        Ok(out)
    }

    pub async fn load_indexes(&self, table_ids: &[i64]) -> Result<Vec<IndexRow>> {
        if table_ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            r#"
            SELECT table_id, name, definition
            FROM db_indexes
            WHERE table_id = ANY($1)
            ORDER BY table_id, id
            "#,
        )
        .bind(table_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(format!("Failed to load indexes: {}", e)))?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(IndexRow {
                table_id: try_get(&row, "table_id")?,
                name: try_get(&row, "name")?,
                definition: try_get(&row, "definition")?,
            });
        }
        Ok(out)
    }

    /// First sample-row set per table, as a JSON array of row objects.
    pub async fn load_samples(&self, table_ids: &[i64]) -> Result<HashMap<i64, Vec<serde_json::Value>>> {
        if table_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let rows = sqlx::query(
            r#"
            SELECT table_id, rows
            FROM samples
            WHERE table_id = ANY($1)
            ORDER BY table_id, id
            "#,
        )
        .bind(table_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(format!("Failed to load samples: {}", e)))?;

        let mut out: HashMap<i64, Vec<serde_json::Value>> = HashMap::new();
        for row in rows {
            let table_id: i64 = try_get(&row, "table_id")?;
            let value: serde_json::Value = try_get(&row, "rows")?;
            // Keep the first sample set per table.
            out.entry(table_id).or_insert_with(|| match value {
                serde_json::Value::Array(items) => items,
                other => vec![other],
            });
        }
        Ok(out)
    }

    pub async fn load_api_routes(&self) -> Result<Vec<ApiRouteRow>> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, method, path, base_url, description, auth_type,
                   headers_template, body_template, query_params_template, tags
            FROM api_routes
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(format!("Failed to load API routes: {}", e)))?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(ApiRouteRow {
                id: try_get(&row, "id")?,
                name: try_get(&row, "name")?,
                method: try_get(&row, "method")?,
                path: try_get(&row, "path")?,
                base_url: try_get(&row, "base_url")?,
                description: try_get(&row, "description")?,
                auth_type: try_get(&row, "auth_type")?,
                headers_template: try_get(&row, "headers_template")?,
                body_template: try_get(&row, "body_template")?,
                query_params_template: try_get(&row, "query_params_template")?,
                tags: try_get(&row, "tags")?,
            });
        }
        Ok(out)
    }

    fn map_scan(&self, row: &sqlx::postgres::PgRow) -> Result<ScanRecord> {
        let status_raw: String = try_get(row, "status")?;
        let status = ScanStatus::parse(&status_raw).ok_or_else(|| {
            AppError::DatabaseError(format!("Unknown scan status '{}'", status_raw))
        })?;
        Ok(ScanRecord {
            id: try_get(row, "id")?,
            connection_id: try_get(row, "connection_id")?,
            status,
            started_at: try_get(row, "started_at")?,
            finished_at: try_get(row, "finished_at")?,
            error_message: try_get(row, "error_message")?,
        })
    }

    fn map_table(&self, row: &sqlx::postgres::PgRow) -> Result<TableRow> {
        Ok(TableRow {
            id: try_get(row, "id")?,
            schema: try_get(row, "schema_name")?,
            name: try_get(row, "name")?,
            table_type: try_get(row, "table_type")?,
            description: try_get(row, "description")?,
            annotations: try_get(row, "annotations")?,
            scan_id: try_get(row, "scan_id")?,
            connection_id: try_get(row, "connection_id")?,
        })
    }

    fn map_column(&self, row: &sqlx::postgres::PgRow) -> Result<ColumnRow> {
        Ok(ColumnRow {
            id: try_get(row, "id")?,
            table_id: try_get(row, "table_id")?,
            name: try_get(row, "name")?,
            data_type: try_get(row, "data_type")?,
            is_nullable: try_get(row, "is_nullable")?,
            description: try_get(row, "description")?,
            annotations: try_get(row, "annotations")?,
            table_schema: try_get(row, "schema_name")?,
            table_name: try_get(row, "table_name")?,
            scan_id: try_get(row, "scan_id")?,
            connection_id: try_get(row, "connection_id")?,
        })
    }
}

fn try_get<'r, T>(row: &'r sqlx::postgres::PgRow, column: &str) -> Result<T>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get(column)
        .map_err(|e| AppError::DatabaseError(format!("Failed to parse {}: {}", column, e)))
}
