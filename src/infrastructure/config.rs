//! Runtime configuration.
//!
//! Every knob has a serde default so `Settings` can be built directly in
//! tests; `load()` layers an optional `sqlrag.toml` file and `SQLRAG_*`
//! environment variables on top of the defaults.

use crate::domain::error::{AppError, Result};
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_planner_model")]
    pub planner_model: String,
    #[serde(default = "default_responder_model")]
    pub responder_model: String,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default)]
    pub openai_api_key: String,
    #[serde(default = "default_openai_base_url")]
    pub openai_base_url: String,
    #[serde(default = "default_db_dialect")]
    pub db_dialect: String,
    #[serde(default = "default_sql_max_queries")]
    pub sql_max_queries: usize,
    #[serde(default = "default_sql_max_rows")]
    pub sql_max_rows: i64,
    #[serde(default = "default_sql_timeout_ms")]
    pub sql_timeout_ms: i64,
    #[serde(default = "default_planner_retry_limit")]
    pub planner_retry_limit: usize,
    #[serde(default = "default_agent_select_rounds")]
    pub agent_select_rounds: usize,
    #[serde(default = "default_schema_context_tables_limit")]
    pub schema_context_tables_limit: usize,
    #[serde(default = "default_schema_context_columns_limit")]
    pub schema_context_columns_limit: usize,
    #[serde(default = "default_schema_context_sample_rows_limit")]
    pub schema_context_sample_rows_limit: usize,
    #[serde(default = "default_schema_context_constraints_limit")]
    pub schema_context_constraints_limit: usize,
    #[serde(default = "default_schema_context_indexes_limit")]
    pub schema_context_indexes_limit: usize,
    #[serde(default = "default_engine_cache_size")]
    pub engine_cache_size: usize,
    #[serde(default = "default_scan_stale_minutes")]
    pub scan_stale_minutes: i64,
    #[serde(default = "default_rag_top_k")]
    pub rag_top_k: usize,
    #[serde(default = "default_rag_min_score")]
    pub rag_min_score: f32,
    #[serde(default = "default_llm_timeout_secs")]
    pub llm_timeout_secs: u64,
    #[serde(default = "default_embedding_timeout_secs")]
    pub embedding_timeout_secs: u64,
}

fn default_planner_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_responder_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_db_dialect() -> String {
    "postgres".to_string()
}

fn default_sql_max_queries() -> usize {
    3
}

fn default_sql_max_rows() -> i64 {
    200
}

fn default_sql_timeout_ms() -> i64 {
    5000
}

fn default_planner_retry_limit() -> usize {
    2
}

fn default_agent_select_rounds() -> usize {
    3
}

fn default_schema_context_tables_limit() -> usize {
    40
}

fn default_schema_context_columns_limit() -> usize {
    40
}

fn default_schema_context_sample_rows_limit() -> usize {
    5
}

fn default_schema_context_constraints_limit() -> usize {
    20
}

fn default_schema_context_indexes_limit() -> usize {
    20
}

fn default_engine_cache_size() -> usize {
    8
}

fn default_scan_stale_minutes() -> i64 {
    15
}

fn default_rag_top_k() -> usize {
    5
}

fn default_rag_min_score() -> f32 {
    0.2
}

fn default_llm_timeout_secs() -> u64 {
    60
}

fn default_embedding_timeout_secs() -> u64 {
    30
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            planner_model: default_planner_model(),
            responder_model: default_responder_model(),
            embedding_model: default_embedding_model(),
            openai_api_key: String::new(),
            openai_base_url: default_openai_base_url(),
            db_dialect: default_db_dialect(),
            sql_max_queries: default_sql_max_queries(),
            sql_max_rows: default_sql_max_rows(),
            sql_timeout_ms: default_sql_timeout_ms(),
            planner_retry_limit: default_planner_retry_limit(),
            agent_select_rounds: default_agent_select_rounds(),
            schema_context_tables_limit: default_schema_context_tables_limit(),
            schema_context_columns_limit: default_schema_context_columns_limit(),
            schema_context_sample_rows_limit: default_schema_context_sample_rows_limit(),
            schema_context_constraints_limit: default_schema_context_constraints_limit(),
            schema_context_indexes_limit: default_schema_context_indexes_limit(),
            engine_cache_size: default_engine_cache_size(),
            scan_stale_minutes: default_scan_stale_minutes(),
            rag_top_k: default_rag_top_k(),
            rag_min_score: default_rag_min_score(),
            llm_timeout_secs: default_llm_timeout_secs(),
            embedding_timeout_secs: default_embedding_timeout_secs(),
        }
    }
}

impl Settings {
    /// Layered load: defaults, then `sqlrag.toml` (if present), then
    /// `SQLRAG_*` environment variables.
    pub fn load() -> Result<Self> {
        Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file("sqlrag.toml"))
            .merge(Env::prefixed("SQLRAG_"))
            .extract()
            .map_err(|e| AppError::ConfigError(format!("Failed to load settings: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.sql_max_queries, 3);
        assert_eq!(settings.sql_max_rows, 200);
        assert_eq!(settings.sql_timeout_ms, 5000);
        assert_eq!(settings.planner_retry_limit, 2);
        assert_eq!(settings.agent_select_rounds, 3);
        assert_eq!(settings.db_dialect, "postgres");
        assert!(settings.openai_api_key.is_empty());
    }

    #[test]
    fn test_env_override() {
        std::env::set_var("SQLRAG_SQL_MAX_ROWS", "50");
        std::env::set_var("SQLRAG_PLANNER_MODEL", "gpt-4o");
        let settings = Settings::load().expect("settings should load");
        assert_eq!(settings.sql_max_rows, 50);
        assert_eq!(settings.planner_model, "gpt-4o");
        std::env::remove_var("SQLRAG_SQL_MAX_ROWS");
        std::env::remove_var("SQLRAG_PLANNER_MODEL");
    }
}
