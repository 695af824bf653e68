pub mod executor;
pub mod fallback_planner;
pub mod orchestrator;
pub mod predefined_queries;
pub mod prompts;
pub mod reindex_service;
pub mod retrieval_service;
pub mod scan_reconciler;
pub mod schema_context;
pub mod sql_validator;
pub mod suggested_selects;
