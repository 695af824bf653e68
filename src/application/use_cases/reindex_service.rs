//! Embedding reindex pipeline.
//!
//! Each catalog entity (table, column, API route) gets a canonical
//! document; its SHA-256 hash decides whether the stored embedding is
//! still current. Only changed documents are deleted, re-embedded (one
//! batch call) and reinserted.

use crate::application::use_cases::suggested_selects::{build_suggested_selects, ColumnMeta};
use crate::domain::error::Result;
use crate::infrastructure::config::Settings;
use crate::infrastructure::db::catalog_repo::{ApiRouteRow, CatalogRepository, ColumnRow, TableRow};
use crate::infrastructure::db::embedding_repo::{EmbeddingRepository, NewEmbedding};
use crate::infrastructure::llm_clients::EmbeddingClient;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Canonical document for one catalog entity.
#[derive(Debug, Clone)]
pub struct Document {
    pub item_type: String,
    pub item_id: i64,
    pub meta: Value,
    pub text: String,
}

pub struct ReindexService {
    catalog: Arc<CatalogRepository>,
    embeddings: Arc<EmbeddingRepository>,
    embedder: Arc<dyn EmbeddingClient>,
    settings: Arc<Settings>,
}

impl ReindexService {
    pub fn new(
        catalog: Arc<CatalogRepository>,
        embeddings: Arc<EmbeddingRepository>,
        embedder: Arc<dyn EmbeddingClient>,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            catalog,
            embeddings,
            embedder,
            settings,
        }
    }

    /// Reindexes catalog entities, optionally scoped to a single scan.
    /// Returns the number of (re)indexed documents.
    pub async fn reindex(&self, scan_id: Option<i64>, include_api_routes: bool) -> Result<usize> {
        let tables = self.catalog.load_tables_for_reindex(scan_id).await?;
        let columns = self.catalog.load_columns_for_reindex(scan_id).await?;
        let table_ids: Vec<i64> = tables.iter().map(|t| t.id).collect();
        let samples = self.catalog.load_samples(&table_ids).await?;
        let routes = if include_api_routes {
            self.catalog.load_api_routes().await?
        } else {
            Vec::new()
        };

        let mut columns_by_table: HashMap<i64, Vec<&ColumnRow>> = HashMap::new();
        for column in &columns {
            columns_by_table.entry(column.table_id).or_default().push(column);
        }

        let mut documents: Vec<Document> = Vec::new();
        for table in &tables {
            let table_columns = columns_by_table.get(&table.id).map(|c| c.as_slice()).unwrap_or(&[]);
            let sample_rows = samples.get(&table.id).map(|s| s.as_slice()).unwrap_or(&[]);
            documents.push(build_table_document(table, table_columns, sample_rows));
        }
        for column in &columns {
            documents.push(build_column_document(column));
        }
        for route in &routes {
            documents.push(build_api_document(route));
        }

        if documents.is_empty() {
            return Ok(0);
        }

        let existing = self.embeddings.load_hashes().await?;
        let mut to_index: Vec<(Document, String)> = Vec::new();
        for document in documents {
            let content_hash = hash_content(&document.text);
            let key = (document.item_type.clone(), document.item_id);
            if existing.get(&key) == Some(&content_hash) {
                continue;
            }
            to_index.push((document, content_hash));
        }

        if to_index.is_empty() {
            return Ok(0);
        }

        let delete_targets: Vec<(String, i64)> = to_index
            .iter()
            .map(|(doc, _)| (doc.item_type.clone(), doc.item_id))
            .collect();
        self.embeddings.delete_pairs(&delete_targets).await?;

        let texts: Vec<String> = to_index.iter().map(|(doc, _)| doc.text.clone()).collect();
        let vectors = self
            .embedder
            .embed(&self.settings.embedding_model, &texts)
            .await?;

        let items: Vec<NewEmbedding> = to_index
            .iter()
            .zip(vectors)
            .map(|((doc, content_hash), vector)| NewEmbedding {
                item_type: doc.item_type.clone(),
                item_id: doc.item_id,
                content_hash: content_hash.clone(),
                vector,
                meta: doc.meta.clone(),
            })
            .collect();
        self.embeddings.insert_batch(&items).await?;

        info!(reindexed = items.len(), scan_id = ?scan_id, "embeddings_reindexed");
        Ok(items.len())
    }
}

pub fn hash_content(value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    hex::encode(hasher.finalize())
}

fn stringify_content(fields: &[(&str, Value)]) -> String {
    fields
        .iter()
        .map(|(key, value)| match value {
            Value::String(s) => format!("{}: {}", key, s),
            other => format!("{}: {}", key, other),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn build_table_document(
    table: &TableRow,
    columns: &[&ColumnRow],
    sample_rows: &[Value],
) -> Document {
    let column_meta: Vec<ColumnMeta> = columns
        .iter()
        .map(|column| {
            ColumnMeta::new(
                &column.name,
                column.annotations.as_ref().and_then(|a| a.get("tags")),
            )
        })
        .collect();
    let suggested = build_suggested_selects(
        &table.schema,
        &table.name,
        &column_meta,
        table.annotations.as_ref(),
        sample_rows,
    );

    let fields = vec![
        ("type", json!("table")),
        ("id", json!(table.id)),
        ("schema", json!(table.schema)),
        ("name", json!(table.name)),
        ("connection_id", json!(table.connection_id)),
        ("scan_id", json!(table.scan_id)),
        (
            "description",
            json!(table.description.clone().unwrap_or_default()),
        ),
        (
            "annotations",
            table.annotations.clone().unwrap_or_else(|| json!({})),
        ),
        ("suggested_selects", json!(suggested)),
    ];
    document_from_fields("table", table.id, fields)
}

pub fn build_column_document(column: &ColumnRow) -> Document {
    let fields = vec![
        ("type", json!("column")),
        ("id", json!(column.id)),
        ("connection_id", json!(column.connection_id)),
        ("scan_id", json!(column.scan_id)),
        (
            "table",
            json!(format!("{}.{}", column.table_schema, column.table_name)),
        ),
        ("name", json!(column.name)),
        ("data_type", json!(column.data_type.clone().unwrap_or_default())),
        (
            "description",
            json!(column.description.clone().unwrap_or_default()),
        ),
        (
            "annotations",
            column.annotations.clone().unwrap_or_else(|| json!({})),
        ),
    ];
    document_from_fields("column", column.id, fields)
}

pub fn build_api_document(route: &ApiRouteRow) -> Document {
    let header_keys = object_keys(route.headers_template.as_ref());
    let body_keys = object_keys(route.body_template.as_ref());
    let query_keys = object_keys(route.query_params_template.as_ref());
    let fields = vec![
        ("type", json!("api_route")),
        ("id", json!(route.id)),
        ("name", json!(route.name)),
        ("method", json!(route.method)),
        ("path", json!(route.path)),
        ("base_url", json!(route.base_url.clone().unwrap_or_default())),
        (
            "description",
            json!(route.description.clone().unwrap_or_default()),
        ),
        (
            "auth_type",
            json!(route.auth_type.clone().unwrap_or_default()),
        ),
        ("header_keys", json!(header_keys)),
        ("body_keys", json!(body_keys)),
        ("query_param_keys", json!(query_keys)),
        ("tags", route.tags.clone().unwrap_or_else(|| json!([]))),
    ];
    document_from_fields("api_route", route.id, fields)
}

fn document_from_fields(item_type: &str, item_id: i64, fields: Vec<(&str, Value)>) -> Document {
    let text = stringify_content(&fields);
    let mut meta = serde_json::Map::new();
    for (key, value) in fields {
        meta.insert(key.to_string(), value);
    }
    Document {
        item_type: item_type.to_string(),
        item_id,
        meta: Value::Object(meta),
        text,
    }
}

fn object_keys(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(|v| v.as_object())
        .map(|map| map.keys().cloned().collect())
        .unwrap_or_default()
}
