//! Vector retrieval over the embedding store, and the retrieval-mode
//! answer path.
//!
//! Ranking happens in-process: candidates are ordered by cosine distance
//! (lower is more similar), cut at the `rag_min_score` ceiling, then
//! scope-filtered. When a scope is present the candidate pool is widened
//! to `top_k * 20` before filtering; if scoping empties a non-empty pool,
//! the top pre-filter candidates are kept instead of returning nothing.

use crate::domain::error::Result;
use crate::infrastructure::config::Settings;
use crate::infrastructure::db::catalog_repo::CatalogRepository;
use crate::infrastructure::db::embedding_repo::{EmbeddingRepository, StoredEmbedding};
use crate::infrastructure::llm_clients::{ChatClient, ChatRequest, EmbeddingClient};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::info;

pub const MSG_NO_COMPLETED_SCAN: &str =
    "No completed scan was found for the selected connections.";
pub const MSG_SCAN_NOT_INDEXED: &str =
    "The latest scan for the selected connections has not been indexed yet. Reindex the catalog to refresh the context.";
pub const MSG_INSUFFICIENT_CONTEXT: &str = "Insufficient context to answer safely.";

/// Narrowing applied to retrieval results.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetrievalScope {
    #[serde(default)]
    pub connection_ids: Vec<i64>,
    #[serde(default)]
    pub api_route_ids: Vec<i64>,
}

impl RetrievalScope {
    fn is_narrowing(&self) -> bool {
        !self.connection_ids.is_empty() || !self.api_route_ids.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RetrievalMatch {
    pub item_type: String,
    pub item_id: i64,
    pub distance: f32,
    pub meta: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct Citation {
    pub item_type: String,
    pub item_id: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RagAnswer {
    pub answer: String,
    pub citations: Vec<Citation>,
}

pub struct RetrievalService {
    catalog: Arc<CatalogRepository>,
    embeddings: Arc<EmbeddingRepository>,
    embedder: Arc<dyn EmbeddingClient>,
    chat: Arc<dyn ChatClient>,
    settings: Arc<Settings>,
}

impl RetrievalService {
    pub fn new(
        catalog: Arc<CatalogRepository>,
        embeddings: Arc<EmbeddingRepository>,
        embedder: Arc<dyn EmbeddingClient>,
        chat: Arc<dyn ChatClient>,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            catalog,
            embeddings,
            embedder,
            chat,
            settings,
        }
    }

    pub async fn search(
        &self,
        question: &str,
        top_k: usize,
        scope: Option<&RetrievalScope>,
    ) -> Result<Vec<RetrievalMatch>> {
        let vectors = self
            .embedder
            .embed(&self.settings.embedding_model, &[question.to_string()])
            .await?;
        let query_vector = vectors.into_iter().next().unwrap_or_default();

        let stored = self.embeddings.load_all().await?;
        let narrowing = scope.map(|s| s.is_narrowing()).unwrap_or(false);
        let limit = if narrowing { top_k * 20 } else { top_k };

        let mut ranked: Vec<(StoredEmbedding, f32)> = stored
            .into_iter()
            .map(|item| {
                let distance = 1.0 - cosine_similarity(&query_vector, &item.vector);
                (item, distance)
            })
            .collect();
        ranked.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        ranked.truncate(limit);

        let min_score = self.settings.rag_min_score;
        let mut filtered: Vec<RetrievalMatch> = ranked
            .iter()
            .filter(|(_, distance)| *distance <= min_score)
            .map(|(item, distance)| to_match(item, *distance))
            .collect();

        if let Some(scope) = scope {
            if scope.is_narrowing() {
                let connection_ids: HashSet<i64> = scope.connection_ids.iter().copied().collect();
                let api_route_ids: HashSet<i64> = scope.api_route_ids.iter().copied().collect();
                let latest_scan_ids: HashSet<i64> = if connection_ids.is_empty() {
                    HashSet::new()
                } else {
                    self.catalog
                        .latest_completed_scan_ids(&scope.connection_ids)
                        .await?
                        .into_iter()
                        .collect()
                };

                let scoped_candidates: Vec<&(StoredEmbedding, f32)> = ranked
                    .iter()
                    .filter(|(item, _)| {
                        in_scope(item, &connection_ids, &api_route_ids, &latest_scan_ids)
                    })
                    .collect();

                let mut scoped: Vec<RetrievalMatch> = scoped_candidates
                    .iter()
                    .filter(|(_, distance)| *distance <= min_score)
                    .map(|(item, distance)| to_match(item, *distance))
                    .collect();
                if scoped.is_empty() && !scoped_candidates.is_empty() {
                    // Scope narrowed past the threshold; keep the closest
                    // in-scope candidates rather than returning nothing.
                    scoped = scoped_candidates
                        .iter()
                        .take(top_k)
                        .map(|(item, distance)| to_match(item, *distance))
                        .collect();
                }
                filtered = scoped;
            }
        }

        filtered.truncate(top_k);
        info!(
            matches = filtered.len(),
            scoped = narrowing,
            "retrieval_search_completed"
        );
        Ok(filtered)
    }

    /// Retrieval-mode answering: scoped matches become the only context
    /// the model may use; citations point back at catalog entities.
    pub async fn answer(&self, question: &str, scope: Option<&RetrievalScope>) -> Result<RagAnswer> {
        let matches = self
            .search(question.trim(), self.settings.rag_top_k, scope)
            .await?;

        if matches.is_empty() {
            if let Some(scope) = scope {
                if !scope.connection_ids.is_empty() {
                    let latest = self
                        .catalog
                        .latest_completed_scan_ids(&scope.connection_ids)
                        .await?;
                    if latest.is_empty() {
                        return Ok(RagAnswer {
                            answer: MSG_NO_COMPLETED_SCAN.to_string(),
                            citations: vec![],
                        });
                    }
                    return Ok(RagAnswer {
                        answer: MSG_SCAN_NOT_INDEXED.to_string(),
                        citations: vec![],
                    });
                }
            }
            return Ok(RagAnswer {
                answer: MSG_INSUFFICIENT_CONTEXT.to_string(),
                citations: vec![],
            });
        }

        let context: Vec<&serde_json::Value> = matches.iter().map(|m| &m.meta).collect();
        let instructions = "You are a data and API catalog assistant. \
            Use only the provided context. If the context is insufficient, \
            ask for clarification and mention what was found. \
            Reference results using the internal IDs provided.";
        let user = format!(
            "Context: {}\nQuestion: {}",
            serde_json::to_string(&context).unwrap_or_default(),
            question
        );

        let answer = self
            .chat
            .complete(&ChatRequest {
                model: self.settings.responder_model.clone(),
                system: instructions.to_string(),
                user,
                temperature: 0.2,
                json_object: false,
            })
            .await?;

        let citations = matches
            .iter()
            .map(|m| Citation {
                item_type: m.item_type.clone(),
                item_id: m.item_id,
            })
            .collect();

        Ok(RagAnswer { answer, citations })
    }
}

fn to_match(item: &StoredEmbedding, distance: f32) -> RetrievalMatch {
    RetrievalMatch {
        item_type: item.item_type.clone(),
        item_id: item.item_id,
        distance,
        meta: item.meta.clone(),
    }
}

fn in_scope(
    item: &StoredEmbedding,
    connection_ids: &HashSet<i64>,
    api_route_ids: &HashSet<i64>,
    latest_scan_ids: &HashSet<i64>,
) -> bool {
    match item.item_type.as_str() {
        "table" | "column" => {
            if connection_ids.is_empty() {
                return false;
            }
            let connection_id = item.meta.get("connection_id").and_then(|v| v.as_i64());
            let scan_id = item.meta.get("scan_id").and_then(|v| v.as_i64());
            match connection_id {
                Some(id) if connection_ids.contains(&id) => {
                    latest_scan_ids.is_empty()
                        || scan_id.map(|s| latest_scan_ids.contains(&s)).unwrap_or(false)
                }
                _ => false,
            }
        }
        "api_route" => !api_route_ids.is_empty() && api_route_ids.contains(&item.item_id),
        _ => false,
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}
