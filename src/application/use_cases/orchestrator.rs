//! The SQL-RAG orchestration state machine.
//!
//! One orchestration answers one question: reconcile and build the schema
//! context, then drive a bounded Planner -> Execute -> Respond protocol.
//! The outer attempt loop retries with error feedback after planner or
//! execution failures; the inner round loop lets the planner refine its
//! queries against prior results. Total LLM usage is bounded by
//! `(planner_retry_limit + 1) * agent_select_rounds` planner calls plus
//! one responder call.
//!
//! Every terminal path produces a user-readable answer and the
//! executed-query manifest; protocol failures never surface as errors.

use crate::application::use_cases::executor::QueryExecutor;
use crate::application::use_cases::fallback_planner::FallbackPlanner;
use crate::application::use_cases::predefined_queries::PredefinedQueryRegistry;
use crate::application::use_cases::prompts::{
    planner_system_prompt, planner_user_payload, responder_system_prompt, responder_user_payload,
};
use crate::application::use_cases::schema_context::SchemaContextSource;
use crate::domain::catalog::SchemaSnapshot;
use crate::domain::error::Result;
use crate::domain::planner::{
    ErrorContext, ExecutedQuery, PlannerAction, PlannerQuery, PlannerResponse,
    PreviousQuerySummary, ResponderResponse, SqlResult,
};
use crate::infrastructure::config::Settings;
use crate::infrastructure::llm_clients::{ChatClient, ChatRequest};
use crate::infrastructure::response::extract_json_payload;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

pub const MSG_MISSING_API_KEY: &str =
    "The LLM API key is not configured. Set it before asking questions.";
pub const MSG_UNSUPPORTED_DIALECT: &str =
    "The configured database dialect is not yet supported for safe execution.";
pub const MSG_NO_CATALOG: &str =
    "No completed catalog scan is available for the selected connections. Run a scan and reindex the catalog.";
pub const MSG_RESPONDER_FAILED: &str = "Could not format the final answer. Please try again.";
pub const MSG_NO_SAFE_QUERY: &str = "Could not identify a safe query to execute.";
pub const MSG_EXECUTION_FAILED: &str =
    "Could not execute the requested queries. Please adjust the question.";
pub const MSG_PLANNER_FAILED: &str =
    "Could not understand the planner decision. Please try rephrasing the question.";
pub const MSG_INCOMPLETE: &str = "Could not complete the answer.";
pub const MSG_CLARIFY_DEFAULT: &str = "Could you provide more details?";

/// Result of one orchestration call.
#[derive(Debug, Clone)]
pub struct OrchestrationOutcome {
    pub answer: String,
    pub executed_queries: Vec<ExecutedQuery>,
    /// JSON audit blob for conversation history, or empty when no full
    /// round reached the responder.
    pub tool_payload: String,
}

impl OrchestrationOutcome {
    fn message(answer: &str) -> Self {
        Self {
            answer: answer.to_string(),
            executed_queries: Vec::new(),
            tool_payload: String::new(),
        }
    }
}

pub struct SqlRagOrchestrator {
    settings: Arc<Settings>,
    chat: Arc<dyn ChatClient>,
    context: Arc<dyn SchemaContextSource>,
    executor: QueryExecutor,
    fallback: FallbackPlanner,
    predefined: PredefinedQueryRegistry,
}

impl SqlRagOrchestrator {
    pub fn new(
        settings: Arc<Settings>,
        chat: Arc<dyn ChatClient>,
        context: Arc<dyn SchemaContextSource>,
        executor: QueryExecutor,
        fallback: FallbackPlanner,
        predefined: PredefinedQueryRegistry,
    ) -> Self {
        Self {
            settings,
            chat,
            context,
            executor,
            fallback,
            predefined,
        }
    }

    /// Answers one question over the given connection scope.
    pub async fn orchestrate(
        &self,
        question: &str,
        connection_ids: &[i64],
        conversation_context: &[serde_json::Value],
        agent_system_prompt: &str,
    ) -> Result<OrchestrationOutcome> {
        if self.settings.openai_api_key.is_empty() {
            return Ok(OrchestrationOutcome::message(MSG_MISSING_API_KEY));
        }
        if self.settings.db_dialect != "postgres" {
            warn!(db_dialect = %self.settings.db_dialect, "unsupported_dialect");
            return Ok(OrchestrationOutcome::message(MSG_UNSUPPORTED_DIALECT));
        }

        let request_id = Uuid::new_v4().to_string();
        let (snapshot, allowlists) = self.context.build(connection_ids).await?;
        if !snapshot.has_tables() {
            return Ok(OrchestrationOutcome::message(MSG_NO_CATALOG));
        }

        let mut error_context: Option<ErrorContext> = None;

        for attempt in 0..=self.settings.planner_retry_limit {
            if attempt == 0 {
                error_context = None;
            }
            let mut sql_results: Vec<SqlResult> = Vec::new();
            let mut executed_queries: Vec<ExecutedQuery> = Vec::new();
            let mut previous_summary: Vec<PreviousQuerySummary> = Vec::new();
            let mut retry_attempt = false;

            for round_index in 0..self.settings.agent_select_rounds {
                let planner_raw = self
                    .call_planner(
                        question,
                        &snapshot,
                        conversation_context,
                        error_context.as_ref(),
                        connection_ids,
                        &previous_summary,
                    )
                    .await?;

                let planner_response = match self.parse_planner(&request_id, &planner_raw) {
                    Some(response) => response,
                    None => {
                        error_context = Some(ErrorContext::from_planner(
                            "Planner returned invalid JSON.",
                            &preview(&planner_raw, 500),
                        ));
                        if self.fallback.matches_intent(question) {
                            self.fallback.plan(
                                question,
                                &snapshot,
                                connection_ids,
                                self.settings.sql_max_rows,
                            )
                        } else {
                            retry_attempt = true;
                            break;
                        }
                    }
                };

                info!(
                    request_id = %request_id,
                    decision = ?planner_response.decision,
                    reason = %planner_response.reason,
                    query_count = planner_response.queries.len(),
                    round = round_index + 1,
                    "planner_decision"
                );

                // A clarification request on a listing/extremum question
                // gets one more chance through the deterministic planner.
                let planner_response = match planner_response.decision {
                    crate::domain::planner::PlannerDecision::NeedClarification
                        if self.fallback.matches_intent(question) =>
                    {
                        self.fallback.plan(
                            question,
                            &snapshot,
                            connection_ids,
                            self.settings.sql_max_rows,
                        )
                    }
                    _ => planner_response,
                };

                let queries_to_run: Vec<PlannerQuery> = match planner_response.into_action() {
                    PlannerAction::NoSqlNeeded => {
                        let manifest = std::mem::take(&mut executed_queries);
                        return match self
                            .call_responder(question, &snapshot, &sql_results, agent_system_prompt)
                            .await?
                        {
                            Some(responder) => Ok(OrchestrationOutcome {
                                answer: responder.answer,
                                executed_queries: manifest,
                                tool_payload: String::new(),
                            }),
                            None => Ok(OrchestrationOutcome {
                                answer: MSG_RESPONDER_FAILED.to_string(),
                                executed_queries: manifest,
                                tool_payload: String::new(),
                            }),
                        };
                    }
                    PlannerAction::NeedClarification(clarifying_question) => {
                        return Ok(OrchestrationOutcome::message(
                            clarifying_question
                                .as_deref()
                                .unwrap_or(MSG_CLARIFY_DEFAULT),
                        ));
                    }
                    PlannerAction::Refuse(reason) => {
                        return Ok(OrchestrationOutcome::message(&reason));
                    }
                    PlannerAction::UsePredefined(id) => id
                        .as_deref()
                        .and_then(|id| self.predefined.resolve(id))
                        .into_iter()
                        .collect(),
                    PlannerAction::RunSelects(queries) => queries
                        .into_iter()
                        .take(self.settings.sql_max_queries)
                        .collect(),
                };

                if queries_to_run.is_empty() {
                    return Ok(OrchestrationOutcome::message(MSG_NO_SAFE_QUERY));
                }

                error_context = None;
                let round_started = std::time::Instant::now();
                let batch = self
                    .executor
                    .run(&queries_to_run, connection_ids, &allowlists)
                    .await;
                sql_results.extend(batch.results);
                executed_queries.extend(batch.executed);

                info!(
                    request_id = %request_id,
                    queries = queries_to_run.len(),
                    rows_returned = sql_results.iter().map(|r| r.row_count).sum::<usize>(),
                    elapsed_ms = round_started.elapsed().as_millis() as i64,
                    round = round_index + 1,
                    "sql_execution_completed"
                );

                if let Some(sql_error) = batch.error {
                    error_context = Some(ErrorContext {
                        planner_error: None,
                        sql_error: Some(sql_error),
                    });
                    if attempt < self.settings.planner_retry_limit {
                        break;
                    }
                    return Ok(OrchestrationOutcome::message(MSG_EXECUTION_FAILED));
                }

                previous_summary = sql_results
                    .iter()
                    .map(|result| PreviousQuerySummary {
                        name: result.name.clone(),
                        sql: result.sql.clone(),
                        row_count: result.row_count,
                        truncated: result.truncated,
                        connection_id: result.connection_id,
                        round: round_index + 1,
                    })
                    .collect();

                if round_index < self.settings.agent_select_rounds - 1 {
                    continue;
                }

                let manifest = std::mem::take(&mut executed_queries);
                return match self
                    .call_responder(question, &snapshot, &sql_results, agent_system_prompt)
                    .await?
                {
                    Some(responder) => {
                        let tool_payload =
                            self.build_tool_payload(&request_id, &sql_results, &manifest)?;
                        Ok(OrchestrationOutcome {
                            answer: responder.answer,
                            executed_queries: manifest,
                            tool_payload,
                        })
                    }
                    None => Ok(OrchestrationOutcome {
                        answer: MSG_RESPONDER_FAILED.to_string(),
                        executed_queries: manifest,
                        tool_payload: String::new(),
                    }),
                };
            }

            if retry_attempt && attempt >= self.settings.planner_retry_limit {
                return Ok(OrchestrationOutcome::message(MSG_PLANNER_FAILED));
            }
        }

        Ok(OrchestrationOutcome::message(MSG_INCOMPLETE))
    }

    async fn call_planner(
        &self,
        question: &str,
        snapshot: &SchemaSnapshot,
        conversation_context: &[serde_json::Value],
        error_context: Option<&ErrorContext>,
        connection_ids: &[i64],
        previous_summary: &[PreviousQuerySummary],
    ) -> Result<String> {
        let has_planner_error = error_context
            .map(|ctx| ctx.planner_error.is_some())
            .unwrap_or(false);
        let payload = planner_user_payload(
            question,
            snapshot,
            self.predefined.all(),
            &self.settings,
            conversation_context,
            error_context,
            connection_ids,
            previous_summary,
        )?;
        self.chat
            .complete(&ChatRequest {
                model: self.settings.planner_model.clone(),
                system: planner_system_prompt(has_planner_error),
                user: payload,
                temperature: 0.0,
                json_object: true,
            })
            .await
    }

    fn parse_planner(&self, request_id: &str, raw: &str) -> Option<PlannerResponse> {
        let cleaned = extract_json_payload(raw);
        match serde_json::from_str::<PlannerResponse>(&cleaned) {
            Ok(response) => Some(response),
            Err(e) => {
                warn!(
                    request_id = %request_id,
                    error = %e,
                    response = %preview(raw, 2000),
                    "planner_invalid_response"
                );
                None
            }
        }
    }

    async fn call_responder(
        &self,
        question: &str,
        snapshot: &SchemaSnapshot,
        sql_results: &[SqlResult],
        agent_system_prompt: &str,
    ) -> Result<Option<ResponderResponse>> {
        let payload = responder_user_payload(question, snapshot, sql_results, &self.settings)?;
        let raw = self
            .chat
            .complete(&ChatRequest {
                model: self.settings.responder_model.clone(),
                system: responder_system_prompt(agent_system_prompt),
                user: payload,
                temperature: 0.2,
                json_object: true,
            })
            .await?;
        let cleaned = extract_json_payload(&raw);
        match serde_json::from_str::<ResponderResponse>(&cleaned) {
            Ok(response) => Ok(Some(response)),
            Err(e) => {
                warn!(
                    error = %e,
                    response = %preview(&raw, 2000),
                    "responder_invalid_response"
                );
                Ok(None)
            }
        }
    }

    fn build_tool_payload(
        &self,
        request_id: &str,
        sql_results: &[SqlResult],
        executed_queries: &[ExecutedQuery],
    ) -> Result<String> {
        let limit = self.settings.schema_context_sample_rows_limit;
        let truncated_results: Vec<SqlResult> = sql_results
            .iter()
            .map(|result| {
                let mut result = result.clone();
                result.rows.truncate(limit);
                result
            })
            .collect();
        let payload = json!({
            "request_id": request_id,
            "sql_results": truncated_results,
            "executed_queries": executed_queries,
        });
        serde_json::to_string(&payload).map_err(|e| {
            crate::domain::error::AppError::Internal(format!(
                "Failed to serialise tool payload: {}",
                e
            ))
        })
    }
}

fn preview(value: &str, limit: usize) -> String {
    value.chars().take(limit).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::use_cases::executor::{SelectOutput, SelectRunner};
    use crate::application::use_cases::schema_context::AllowlistMap;
    use crate::domain::catalog::{ColumnSnapshot, ConnectionSchema, TableSnapshot};
    use crate::domain::error::AppError;
    use async_trait::async_trait;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct FakeChat {
        planner_responses: Mutex<Vec<String>>,
        responder_response: String,
        planner_calls: AtomicUsize,
        responder_calls: AtomicUsize,
    }

    impl FakeChat {
        fn new(planner_responses: Vec<&str>, responder_response: &str) -> Self {
            Self {
                planner_responses: Mutex::new(
                    planner_responses.into_iter().map(|s| s.to_string()).collect(),
                ),
                responder_response: responder_response.to_string(),
                planner_calls: AtomicUsize::new(0),
                responder_calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ChatClient for FakeChat {
        async fn complete(&self, request: &ChatRequest) -> Result<String> {
            if request.system.contains("SQL-RAG Planner") {
                self.planner_calls.fetch_add(1, Ordering::SeqCst);
                let mut responses = self.planner_responses.lock().unwrap();
                if responses.len() > 1 {
                    Ok(responses.remove(0))
                } else {
                    Ok(responses
                        .first()
                        .cloned()
                        .unwrap_or_else(|| "not-json".to_string()))
                }
            } else {
                self.responder_calls.fetch_add(1, Ordering::SeqCst);
                Ok(self.responder_response.clone())
            }
        }
    }

    struct FakeContext {
        snapshot: SchemaSnapshot,
        allowlists: AllowlistMap,
    }

    #[async_trait]
    impl SchemaContextSource for FakeContext {
        async fn build(&self, _connection_ids: &[i64]) -> Result<(SchemaSnapshot, AllowlistMap)> {
            Ok((self.snapshot.clone(), self.allowlists.clone()))
        }
    }

    struct FakeRunner {
        rows: Vec<HashMap<String, serde_json::Value>>,
        fail_with: Option<String>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SelectRunner for FakeRunner {
        async fn run_select(&self, _connection_id: i64, _sql: &str) -> Result<SelectOutput> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(message) = &self.fail_with {
                return Err(AppError::DatabaseError(message.clone()));
            }
            Ok(SelectOutput {
                columns: vec!["id".to_string(), "name".to_string()],
                rows: self.rows.clone(),
            })
        }
    }

    fn asset_rows(count: usize) -> Vec<HashMap<String, serde_json::Value>> {
        (0..count)
            .map(|i| {
                let mut row = HashMap::new();
                row.insert("id".to_string(), serde_json::json!(i + 1));
                row.insert(
                    "name".to_string(),
                    serde_json::json!(format!("Asset {}", i + 1)),
                );
                row
            })
            .collect()
    }

    fn assets_snapshot() -> SchemaSnapshot {
        SchemaSnapshot {
            connections: vec![ConnectionSchema {
                connection_id: 1,
                tables: vec![TableSnapshot {
                    schema: "public".to_string(),
                    name: "assets".to_string(),
                    table_type: Some("BASE TABLE".to_string()),
                    description: None,
                    annotations: None,
                    columns: ["id", "name"]
                        .iter()
                        .map(|c| ColumnSnapshot {
                            name: c.to_string(),
                            data_type: None,
                            is_nullable: None,
                            description: None,
                            annotations: None,
                        })
                        .collect(),
                    sample_rows: vec![],
                }],
                constraints: vec![],
                indexes: vec![],
            }],
        }
    }

    fn assets_allowlists() -> AllowlistMap {
        let mut map = AllowlistMap::new();
        let set: HashSet<String> = ["public.assets", "assets"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        map.insert(1, set);
        map
    }

    fn settings() -> Arc<Settings> {
        Arc::new(Settings {
            openai_api_key: "test-key".to_string(),
            sql_max_rows: 5,
            agent_select_rounds: 1,
            ..Settings::default()
        })
    }

    fn orchestrator_with(
        settings: Arc<Settings>,
        chat: Arc<FakeChat>,
        runner: Arc<FakeRunner>,
        snapshot: SchemaSnapshot,
        allowlists: AllowlistMap,
    ) -> SqlRagOrchestrator {
        let context = Arc::new(FakeContext {
            snapshot,
            allowlists,
        });
        let executor = QueryExecutor::new(runner, Arc::clone(&settings));
        SqlRagOrchestrator::new(
            settings,
            chat,
            context,
            executor,
            FallbackPlanner::default(),
            PredefinedQueryRegistry::default(),
        )
    }

    fn planner_run_selects() -> &'static str {
        r#"{
            "decision": "run_selects",
            "reason": "User asked to list 5 assets.",
            "entities": ["assets"],
            "queries": [
                {
                    "name": "list_assets",
                    "purpose": "List 5 assets.",
                    "sql": "SELECT id, name FROM public.assets LIMIT 5",
                    "connection_id": 1
                }
            ],
            "predefined_query_id": null,
            "clarifying_question": null
        }"#
    }

    fn responder_found_assets() -> &'static str {
        r#"{
            "answer": "I found 5 assets: Asset A, Asset B, Asset C, Asset D and Asset E.",
            "used_sql": [{"name": "list_assets", "sql": "SELECT id, name FROM public.assets LIMIT 5", "rows_returned": 5}],
            "assumptions": [],
            "caveats": [],
            "followups": []
        }"#
    }

    #[tokio::test]
    async fn test_orchestrate_smoke() {
        let chat = Arc::new(FakeChat::new(
            vec![planner_run_selects()],
            responder_found_assets(),
        ));
        let runner = Arc::new(FakeRunner {
            rows: asset_rows(5),
            fail_with: None,
            calls: AtomicUsize::new(0),
        });
        let orchestrator = orchestrator_with(
            settings(),
            Arc::clone(&chat),
            runner,
            assets_snapshot(),
            assets_allowlists(),
        );

        let outcome = orchestrator
            .orchestrate("quais assets nós temos na tabela? cite 5", &[1], &[], "system prompt")
            .await
            .unwrap();

        assert!(outcome.answer.contains("I found 5 assets"));
        assert_eq!(outcome.executed_queries[0].rows_returned, 5);
        assert!(outcome.executed_queries[0].sql.contains("LIMIT 5"));
        assert!(outcome.executed_queries[0].truncated);
        assert!(!outcome.tool_payload.is_empty());
        let payload: serde_json::Value = serde_json::from_str(&outcome.tool_payload).unwrap();
        assert!(payload["request_id"].as_str().is_some());
        assert_eq!(payload["executed_queries"][0]["rows_returned"], 5);
    }

    #[tokio::test]
    async fn test_invalid_planner_json_uses_fallback_for_list_intent() {
        let chat = Arc::new(FakeChat::new(
            vec!["not-json"],
            r#"{"answer": "Fallback answered with assets.", "used_sql": [], "assumptions": [], "caveats": [], "followups": []}"#,
        ));
        let runner = Arc::new(FakeRunner {
            rows: asset_rows(1),
            fail_with: None,
            calls: AtomicUsize::new(0),
        });
        let orchestrator = orchestrator_with(
            settings(),
            chat,
            runner,
            assets_snapshot(),
            assets_allowlists(),
        );

        let outcome = orchestrator
            .orchestrate("quais assets nós temos na tabela? cite 5", &[1], &[], "system prompt")
            .await
            .unwrap();

        assert!(outcome.answer.contains("Fallback answered"));
        assert_eq!(
            outcome.executed_queries[0].sql,
            "SELECT id, name FROM public.assets ORDER BY id DESC LIMIT 5"
        );
        assert!(!outcome.tool_payload.is_empty());
    }

    #[tokio::test]
    async fn test_no_catalog_returns_fixed_message() {
        let chat = Arc::new(FakeChat::new(vec![planner_run_selects()], "{}"));
        let runner = Arc::new(FakeRunner {
            rows: vec![],
            fail_with: None,
            calls: AtomicUsize::new(0),
        });
        let orchestrator = orchestrator_with(
            settings(),
            chat,
            runner,
            SchemaSnapshot::default(),
            AllowlistMap::new(),
        );

        let outcome = orchestrator
            .orchestrate("quais assets nós temos na tabela? cite 5", &[1], &[], "")
            .await
            .unwrap();

        assert_eq!(outcome.answer, MSG_NO_CATALOG);
        assert!(outcome.executed_queries.is_empty());
        assert!(outcome.tool_payload.is_empty());
    }

    #[tokio::test]
    async fn test_missing_api_key_short_circuits() {
        let chat = Arc::new(FakeChat::new(vec![planner_run_selects()], "{}"));
        let runner = Arc::new(FakeRunner {
            rows: vec![],
            fail_with: None,
            calls: AtomicUsize::new(0),
        });
        let settings = Arc::new(Settings {
            openai_api_key: String::new(),
            ..Settings::default()
        });
        let orchestrator = orchestrator_with(
            settings,
            Arc::clone(&chat),
            runner,
            assets_snapshot(),
            assets_allowlists(),
        );

        let outcome = orchestrator.orchestrate("anything", &[1], &[], "").await.unwrap();
        assert_eq!(outcome.answer, MSG_MISSING_API_KEY);
        assert_eq!(chat.planner_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unsupported_dialect_short_circuits() {
        let chat = Arc::new(FakeChat::new(vec![planner_run_selects()], "{}"));
        let runner = Arc::new(FakeRunner {
            rows: vec![],
            fail_with: None,
            calls: AtomicUsize::new(0),
        });
        let settings = Arc::new(Settings {
            openai_api_key: "test-key".to_string(),
            db_dialect: "mysql".to_string(),
            ..Settings::default()
        });
        let orchestrator = orchestrator_with(
            settings,
            Arc::clone(&chat),
            runner,
            assets_snapshot(),
            assets_allowlists(),
        );

        let outcome = orchestrator.orchestrate("anything", &[1], &[], "").await.unwrap();
        assert_eq!(outcome.answer, MSG_UNSUPPORTED_DIALECT);
        assert_eq!(chat.planner_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_refuse_returns_reason() {
        let chat = Arc::new(FakeChat::new(
            vec![r#"{"decision": "refuse", "reason": "Access policy violation."}"#],
            "{}",
        ));
        let runner = Arc::new(FakeRunner {
            rows: vec![],
            fail_with: None,
            calls: AtomicUsize::new(0),
        });
        let orchestrator = orchestrator_with(
            settings(),
            chat,
            runner,
            assets_snapshot(),
            assets_allowlists(),
        );

        let outcome = orchestrator
            .orchestrate("drop everything", &[1], &[], "")
            .await
            .unwrap();
        assert_eq!(outcome.answer, "Access policy violation.");
        assert!(outcome.executed_queries.is_empty());
    }

    #[tokio::test]
    async fn test_clarification_returned_for_non_intent_question() {
        let chat = Arc::new(FakeChat::new(
            vec![
                r#"{"decision": "need_clarification", "reason": "Ambiguous.", "clarifying_question": "Which table?"}"#,
            ],
            "{}",
        ));
        let runner = Arc::new(FakeRunner {
            rows: vec![],
            fail_with: None,
            calls: AtomicUsize::new(0),
        });
        let orchestrator = orchestrator_with(
            settings(),
            chat,
            runner,
            assets_snapshot(),
            assets_allowlists(),
        );

        let outcome = orchestrator
            .orchestrate("tell me about the data", &[1], &[], "")
            .await
            .unwrap();
        assert_eq!(outcome.answer, "Which table?");
    }

    #[tokio::test]
    async fn test_planner_retries_bounded_on_invalid_json() {
        let chat = Arc::new(FakeChat::new(vec!["not-json"], "{}"));
        let runner = Arc::new(FakeRunner {
            rows: vec![],
            fail_with: None,
            calls: AtomicUsize::new(0),
        });
        let settings = Arc::new(Settings {
            openai_api_key: "test-key".to_string(),
            planner_retry_limit: 2,
            agent_select_rounds: 3,
            ..Settings::default()
        });
        let orchestrator = orchestrator_with(
            settings,
            Arc::clone(&chat),
            runner,
            assets_snapshot(),
            assets_allowlists(),
        );

        // No listing/extremum intent, so the fallback never engages.
        let outcome = orchestrator
            .orchestrate("summarize the business", &[1], &[], "")
            .await
            .unwrap();
        assert_eq!(outcome.answer, MSG_PLANNER_FAILED);
        // One planner call per attempt; the round loop breaks immediately.
        assert_eq!(chat.planner_calls.load(Ordering::SeqCst), 3);
        assert_eq!(chat.responder_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_execution_failure_exhausts_retries() {
        let chat = Arc::new(FakeChat::new(vec![planner_run_selects()], "{}"));
        let runner = Arc::new(FakeRunner {
            rows: vec![],
            fail_with: Some("relation \"public.assets\" does not exist".to_string()),
            calls: AtomicUsize::new(0),
        });
        let settings = Arc::new(Settings {
            openai_api_key: "test-key".to_string(),
            planner_retry_limit: 1,
            agent_select_rounds: 1,
            ..Settings::default()
        });
        let orchestrator = orchestrator_with(
            settings,
            Arc::clone(&chat),
            runner,
            assets_snapshot(),
            assets_allowlists(),
        );

        let outcome = orchestrator
            .orchestrate("run the asset report", &[1], &[], "")
            .await
            .unwrap();
        assert_eq!(outcome.answer, MSG_EXECUTION_FAILED);
        assert!(outcome.executed_queries.is_empty());
        // Initial attempt plus one retry with the error fed back.
        assert_eq!(chat.planner_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_responder_failure_returns_apology_with_manifest() {
        let chat = Arc::new(FakeChat::new(vec![planner_run_selects()], "not-json"));
        let runner = Arc::new(FakeRunner {
            rows: asset_rows(2),
            fail_with: None,
            calls: AtomicUsize::new(0),
        });
        let orchestrator = orchestrator_with(
            settings(),
            chat,
            runner,
            assets_snapshot(),
            assets_allowlists(),
        );

        let outcome = orchestrator
            .orchestrate("liste 2 assets", &[1], &[], "")
            .await
            .unwrap();
        assert_eq!(outcome.answer, MSG_RESPONDER_FAILED);
        assert_eq!(outcome.executed_queries.len(), 1);
        assert!(outcome.tool_payload.is_empty());
    }

    #[tokio::test]
    async fn test_multi_round_planner_runs_each_round() {
        let chat = Arc::new(FakeChat::new(
            vec![planner_run_selects(), planner_run_selects()],
            responder_found_assets(),
        ));
        let runner = Arc::new(FakeRunner {
            rows: asset_rows(1),
            fail_with: None,
            calls: AtomicUsize::new(0),
        });
        let settings = Arc::new(Settings {
            openai_api_key: "test-key".to_string(),
            agent_select_rounds: 2,
            sql_max_rows: 5,
            ..Settings::default()
        });
        let orchestrator = orchestrator_with(
            settings,
            Arc::clone(&chat),
            Arc::clone(&runner),
            assets_snapshot(),
            assets_allowlists(),
        );

        let outcome = orchestrator
            .orchestrate("cite 5 assets", &[1], &[], "")
            .await
            .unwrap();
        assert!(outcome.answer.contains("I found 5 assets"));
        assert_eq!(chat.planner_calls.load(Ordering::SeqCst), 2);
        assert_eq!(runner.calls.load(Ordering::SeqCst), 2);
        // Results accumulate across rounds.
        assert_eq!(outcome.executed_queries.len(), 2);
    }
}
