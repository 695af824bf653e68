//! Schema context construction.
//!
//! Resolves the latest usable scan per connection, materialises a bounded
//! snapshot of its catalog, and derives the per-connection allowlist the
//! validator enforces. A `running` scan that already carries catalog rows
//! is usable (the scanner wrote tables before dying) and is promoted to
//! `completed` here, before allowlist construction, so it is not silently
//! dropped.

use crate::application::use_cases::scan_reconciler::ScanReconciler;
use crate::application::use_cases::sql_validator::normalize_identifier;
use crate::domain::catalog::{
    ColumnSnapshot, ConnectionSchema, ConstraintSnapshot, IndexSnapshot, ScanRecord, ScanStatus,
    SchemaSnapshot, TableSnapshot,
};
use crate::domain::error::Result;
use crate::infrastructure::config::Settings;
use crate::infrastructure::db::catalog_repo::{CatalogRepository, TableRow};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::warn;

/// Per-connection set of normalised table identifiers validated SQL may
/// reference.
pub type AllowlistMap = HashMap<i64, HashSet<String>>;

/// Seam between the orchestrator and the catalog store.
#[async_trait]
pub trait SchemaContextSource: Send + Sync {
    /// Reconciles scan statuses for the scope and builds the snapshot plus
    /// allowlists. Snapshots are ephemeral per orchestration.
    async fn build(&self, connection_ids: &[i64]) -> Result<(SchemaSnapshot, AllowlistMap)>;
}

pub struct SchemaContextBuilder {
    repo: Arc<CatalogRepository>,
    reconciler: ScanReconciler,
    settings: Arc<Settings>,
}

impl SchemaContextBuilder {
    pub fn new(repo: Arc<CatalogRepository>, settings: Arc<Settings>) -> Self {
        Self {
            reconciler: ScanReconciler::new(Arc::clone(&repo)),
            repo,
            settings,
        }
    }

    /// Latest usable scan per connection: first `completed`, else the
    /// first `running` that already has catalog rows. Returns the chosen
    /// scan ids and the subset that still needs promotion.
    async fn select_latest_scan_ids(
        &self,
        scans: &[ScanRecord],
    ) -> Result<(HashMap<i64, i64>, HashSet<i64>)> {
        let mut by_connection: HashMap<i64, Vec<&ScanRecord>> = HashMap::new();
        for scan in scans {
            by_connection.entry(scan.connection_id).or_default().push(scan);
        }

        let mut latest: HashMap<i64, i64> = HashMap::new();
        let mut running: HashSet<i64> = HashSet::new();
        for (connection_id, items) in by_connection {
            if let Some(completed) = items.iter().find(|s| s.status == ScanStatus::Completed) {
                latest.insert(connection_id, completed.id);
                continue;
            }
            for scan in items.iter().filter(|s| s.status == ScanStatus::Running) {
                if self.repo.scan_has_catalog(scan.id).await? {
                    latest.insert(connection_id, scan.id);
                    running.insert(scan.id);
                    break;
                }
            }
        }
        Ok((latest, running))
    }
}

#[async_trait]
impl SchemaContextSource for SchemaContextBuilder {
    async fn build(&self, connection_ids: &[i64]) -> Result<(SchemaSnapshot, AllowlistMap)> {
        if connection_ids.is_empty() {
            return Ok((SchemaSnapshot::default(), HashMap::new()));
        }

        self.reconciler
            .reconcile(connection_ids, self.settings.scan_stale_minutes)
            .await?;

        let scans = self
            .repo
            .load_scans(connection_ids, &[ScanStatus::Completed, ScanStatus::Running])
            .await?;
        let (latest_scan_ids, running_scan_ids) = self.select_latest_scan_ids(&scans).await?;

        for scan_id in &running_scan_ids {
            warn!(scan_id = *scan_id, "scan_status_auto_corrected");
            self.repo.complete_scan(*scan_id, Utc::now()).await?;
        }

        let scan_ids: Vec<i64> = latest_scan_ids.values().copied().collect();
        if scan_ids.is_empty() {
            return Ok((SchemaSnapshot::default(), HashMap::new()));
        }

        let tables = self.repo.load_tables(&scan_ids).await?;
        let table_ids: Vec<i64> = tables.iter().map(|t| t.id).collect();
        let columns = self.repo.load_columns(&table_ids).await?;
        let constraints = self.repo.load_constraints(&table_ids).await?;
        let indexes = self.repo.load_indexes(&table_ids).await?;
        let samples = self.repo.load_samples(&table_ids).await?;

        let mut column_map: HashMap<i64, Vec<ColumnSnapshot>> = HashMap::new();
        for column in columns {
            column_map.entry(column.table_id).or_default().push(ColumnSnapshot {
                name: column.name,
                data_type: column.data_type,
                is_nullable: column.is_nullable,
                description: column.description,
                annotations: column.annotations,
            });
        }

        let table_by_id: HashMap<i64, &TableRow> = tables.iter().map(|t| (t.id, t)).collect();

        // The allowlist covers every table of the chosen scans, not just
        // the ones that fit into the bounded snapshot.
        let mut allowlists: AllowlistMap = HashMap::new();
        for table in &tables {
            let schema_name = normalize_identifier(&table.schema);
            let table_name = normalize_identifier(&table.name);
            if schema_name.is_empty() || table_name.is_empty() {
                continue;
            }
            let entry = allowlists.entry(table.connection_id).or_default();
            entry.insert(format!("{}.{}", schema_name, table_name));
            entry.insert(table_name);
        }

        let mut tables_by_connection: HashMap<i64, Vec<TableSnapshot>> = HashMap::new();
        for table in &tables {
            let bucket = tables_by_connection.entry(table.connection_id).or_default();
            if bucket.len() >= self.settings.schema_context_tables_limit {
                continue;
            }
            let mut table_columns = column_map.remove(&table.id).unwrap_or_default();
            table_columns.truncate(self.settings.schema_context_columns_limit);
            let mut sample_rows = samples.get(&table.id).cloned().unwrap_or_default();
            sample_rows.truncate(self.settings.schema_context_sample_rows_limit);
            bucket.push(TableSnapshot {
                schema: table.schema.clone(),
                name: table.name.clone(),
                table_type: table.table_type.clone(),
                description: table.description.clone(),
                annotations: table.annotations.clone(),
                columns: table_columns,
                sample_rows,
            });
        }

        let mut connections = Vec::with_capacity(connection_ids.len());
        for connection_id in connection_ids {
            let connection_constraints: Vec<ConstraintSnapshot> = constraints
                .iter()
                .filter(|c| {
                    table_by_id
                        .get(&c.table_id)
                        .map(|t| t.connection_id == *connection_id)
                        .unwrap_or(false)
                })
                .take(self.settings.schema_context_constraints_limit)
                .map(|c| {
                    let table = table_by_id.get(&c.table_id);
                    ConstraintSnapshot {
                        schema: table.map(|t| t.schema.clone()),
                        table: table.map(|t| t.name.clone()),
                        name: c.name.clone(),
                        constraint_type: c.constraint_type.clone(),
                        definition: c.definition.clone(),
                    }
                })
                .collect();
            let connection_indexes: Vec<IndexSnapshot> = indexes
                .iter()
                .filter(|i| {
                    table_by_id
                        .get(&i.table_id)
                        .map(|t| t.connection_id == *connection_id)
                        .unwrap_or(false)
                })
                .take(self.settings.schema_context_indexes_limit)
                .map(|i| {
                    let table = table_by_id.get(&i.table_id);
                    IndexSnapshot {
                        schema: table.map(|t| t.schema.clone()),
                        table: table.map(|t| t.name.clone()),
                        name: i.name.clone(),
                        definition: i.definition.clone(),
                    }
                })
                .collect();

            connections.push(ConnectionSchema {
                connection_id: *connection_id,
                tables: tables_by_connection.remove(connection_id).unwrap_or_default(),
                constraints: connection_constraints,
                indexes: connection_indexes,
            });
        }

        Ok((SchemaSnapshot { connections }, allowlists))
    }
}
