//! Embedding store access.
//!
//! Vectors are persisted as little-endian f32 byte arrays next to a
//! content hash, so reindexing can skip entities whose canonical document
//! did not change.

use crate::domain::error::{AppError, Result};
use sqlx::{PgPool, Row};
use std::collections::HashMap;

/// One stored embedding with its vector decoded.
#[derive(Debug, Clone)]
pub struct StoredEmbedding {
    pub item_type: String,
    pub item_id: i64,
    pub content_hash: String,
    pub vector: Vec<f32>,
    pub meta: serde_json::Value,
}

/// Row ready for insertion.
#[derive(Debug, Clone)]
pub struct NewEmbedding {
    pub item_type: String,
    pub item_id: i64,
    pub content_hash: String,
    pub vector: Vec<f32>,
    pub meta: serde_json::Value,
}

pub struct EmbeddingRepository {
    pool: PgPool,
}

impl EmbeddingRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Every stored embedding. Retrieval ranks these in-process.
    pub async fn load_all(&self) -> Result<Vec<StoredEmbedding>> {
        let rows = sqlx::query(
            r#"
            SELECT item_type, item_id, content_hash, embedding, meta
            FROM embeddings
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(format!("Failed to load embeddings: {}", e)))?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let bytes: Vec<u8> = row
                .try_get("embedding")
                .map_err(|e| AppError::DatabaseError(format!("Failed to parse embedding: {}", e)))?;
            out.push(StoredEmbedding {
                item_type: try_get(&row, "item_type")?,
                item_id: try_get(&row, "item_id")?,
                content_hash: try_get(&row, "content_hash")?,
                vector: bytes_to_embedding(&bytes)?,
                meta: try_get(&row, "meta")?,
            });
        }
        Ok(out)
    }

    /// Stored content hashes keyed by `(item_type, item_id)`.
    pub async fn load_hashes(&self) -> Result<HashMap<(String, i64), String>> {
        let rows = sqlx::query("SELECT item_type, item_id, content_hash FROM embeddings")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                AppError::DatabaseError(format!("Failed to load embedding hashes: {}", e))
            })?;

        let mut out = HashMap::with_capacity(rows.len());
        for row in rows {
            let item_type: String = try_get(&row, "item_type")?;
            let item_id: i64 = try_get(&row, "item_id")?;
            let content_hash: String = try_get(&row, "content_hash")?;
            out.insert((item_type, item_id), content_hash);
        }
        Ok(out)
    }

    /// Removes the given `(item_type, item_id)` pairs, grouped per type.
    pub async fn delete_pairs(&self, pairs: &[(String, i64)]) -> Result<()> {
        if pairs.is_empty() {
            return Ok(());
        }
        let mut by_type: HashMap<&str, Vec<i64>> = HashMap::new();
        for (item_type, item_id) in pairs {
            by_type.entry(item_type.as_str()).or_default().push(*item_id);
        }
        for (item_type, ids) in by_type {
            sqlx::query("DELETE FROM embeddings WHERE item_type = $1 AND item_id = ANY($2)")
                .bind(item_type)
                .bind(&ids)
                .execute(&self.pool)
                .await
                .map_err(|e| {
                    AppError::DatabaseError(format!("Failed to delete embeddings: {}", e))
                })?;
        }
        Ok(())
    }

    /// Inserts the batch inside one transaction.
    pub async fn insert_batch(&self, items: &[NewEmbedding]) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AppError::DatabaseError(format!("Failed to open transaction: {}", e)))?;

        for item in items {
            sqlx::query(
                r#"
                INSERT INTO embeddings (item_type, item_id, content_hash, embedding, meta)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(&item.item_type)
            .bind(item.item_id)
            .bind(&item.content_hash)
            .bind(embedding_to_bytes(&item.vector))
            .bind(&item.meta)
            .execute(&mut *tx)
            .await
            .map_err(|e| AppError::DatabaseError(format!("Failed to insert embedding: {}", e)))?;
        }

        tx.commit()
            .await
            .map_err(|e| AppError::DatabaseError(format!("Failed to commit embeddings: {}", e)))?;
        Ok(())
    }
}

pub fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(embedding.len() * 4);
    for &val in embedding {
        bytes.extend_from_slice(&val.to_le_bytes());
    }
    bytes
}

pub fn bytes_to_embedding(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return Err(AppError::Internal(
            "Invalid embedding bytes length".to_string(),
        ));
    }
    let mut embedding = Vec::with_capacity(bytes.len() / 4);
    for chunk in bytes.chunks_exact(4) {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(chunk);
        embedding.push(f32::from_le_bytes(buf));
    }
    Ok(embedding)
}

fn try_get<'r, T>(row: &'r sqlx::postgres::PgRow, column: &str) -> Result<T>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get(column)
        .map_err(|e| AppError::DatabaseError(format!("Failed to parse {}: {}", column, e)))
}
