//! Catalog entities consumed by the orchestration core.
//!
//! The scanner (a collaborator) harvests schemas, tables, columns,
//! constraints, indexes and sample rows for a connection and records the
//! attempt as a `Scan`. This crate only reads that catalog, with one
//! exception: scan-status reconciliation may promote or fail a scan.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    Running,
    Completed,
    Failed,
}

impl ScanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanStatus::Running => "running",
            ScanStatus::Completed => "completed",
            ScanStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "running" => Some(ScanStatus::Running),
            "completed" => Some(ScanStatus::Completed),
            "failed" => Some(ScanStatus::Failed),
            _ => None,
        }
    }
}

/// One harvest attempt for a single connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanRecord {
    pub id: i64,
    pub connection_id: i64,
    pub status: ScanStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnSnapshot {
    pub name: String,
    pub data_type: Option<String>,
    pub is_nullable: Option<bool>,
    pub description: Option<String>,
    pub annotations: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSnapshot {
    pub schema: String,
    pub name: String,
    pub table_type: Option<String>,
    pub description: Option<String>,
    pub annotations: Option<serde_json::Value>,
    pub columns: Vec<ColumnSnapshot>,
    pub sample_rows: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConstraintSnapshot {
    pub schema: Option<String>,
    pub table: Option<String>,
    pub name: String,
    #[serde(rename = "type")]
    pub constraint_type: Option<String>,
    pub definition: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexSnapshot {
    pub schema: Option<String>,
    pub table: Option<String>,
    pub name: String,
    pub definition: Option<String>,
}

/// Bounded view of one connection's catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSchema {
    pub connection_id: i64,
    pub tables: Vec<TableSnapshot>,
    pub constraints: Vec<ConstraintSnapshot>,
    pub indexes: Vec<IndexSnapshot>,
}

/// Immutable schema snapshot handed to the planner and the fallback
/// planner. Built once per orchestration; never mutated between rounds so
/// prompt payloads stay stable across retries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    pub connections: Vec<ConnectionSchema>,
}

/// Flattened table reference used by the fallback planner.
#[derive(Debug, Clone)]
pub struct FlatTable {
    pub connection_id: i64,
    pub schema: String,
    pub name: String,
    pub columns: Vec<String>,
}

impl SchemaSnapshot {
    pub fn has_tables(&self) -> bool {
        self.connections.iter().any(|c| !c.tables.is_empty())
    }

    pub fn flatten_tables(&self) -> Vec<FlatTable> {
        let mut tables = Vec::new();
        for connection in &self.connections {
            for table in &connection.tables {
                tables.push(FlatTable {
                    connection_id: connection.connection_id,
                    schema: table.schema.clone(),
                    name: table.name.clone(),
                    columns: table.columns.iter().map(|c| c.name.clone()).collect(),
                });
            }
        }
        tables
    }
}

impl FlatTable {
    /// `schema.table` when a schema is present, bare table otherwise.
    pub fn qualified_name(&self) -> String {
        if self.schema.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.schema, self.name)
        }
    }
}
