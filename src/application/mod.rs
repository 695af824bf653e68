pub mod use_cases;

pub use use_cases::orchestrator::{OrchestrationOutcome, SqlRagOrchestrator};
pub use use_cases::reindex_service::ReindexService;
pub use use_cases::retrieval_service::RetrievalService;
