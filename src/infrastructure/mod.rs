pub mod config;
pub mod db;
pub mod engine_cache;
pub mod llm_clients;
pub mod response;
pub mod telemetry;
