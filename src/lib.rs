//! Retrieval-augmented SQL question answering over harvested schema
//! catalogs.
//!
//! The core is a bounded Planner -> Execute -> Respond loop between two
//! LLM roles and a SQL safety executor, backed by a schema catalog, a
//! connection-keyed engine cache and a vector retrieval pipeline. The
//! enclosing service supplies HTTP routing, entity CRUD, credential
//! handling and background scans; it talks to this crate through
//! `Settings`, the repositories, and the `ConnectionProvider`,
//! `ChatClient` and `EmbeddingClient` traits.

pub mod application;
pub mod domain;
pub mod infrastructure;

pub use application::use_cases::executor::{PgSelectRunner, QueryExecutor, SelectRunner};
pub use application::use_cases::fallback_planner::{FallbackPlanner, IntentPatterns};
pub use application::use_cases::orchestrator::{OrchestrationOutcome, SqlRagOrchestrator};
pub use application::use_cases::predefined_queries::PredefinedQueryRegistry;
pub use application::use_cases::reindex_service::ReindexService;
pub use application::use_cases::retrieval_service::{RagAnswer, RetrievalScope, RetrievalService};
pub use application::use_cases::scan_reconciler::ScanReconciler;
pub use application::use_cases::schema_context::{SchemaContextBuilder, SchemaContextSource};
pub use application::use_cases::sql_validator::validate_sql;
pub use domain::connection::{ConnectionInfo, ConnectionProvider};
pub use domain::error::{AppError, Result};
pub use infrastructure::config::Settings;
pub use infrastructure::db::catalog_repo::CatalogRepository;
pub use infrastructure::db::embedding_repo::EmbeddingRepository;
pub use infrastructure::engine_cache::EngineCache;
pub use infrastructure::llm_clients::openai::OpenAIClient;
pub use infrastructure::llm_clients::{ChatClient, EmbeddingClient};
pub use infrastructure::telemetry::init_tracing;
