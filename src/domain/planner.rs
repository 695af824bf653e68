//! Wire contracts for the Planner and Responder LLM roles, plus the
//! records the orchestrator accumulates while executing a plan.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Five-way decision returned by the Planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlannerDecision {
    RunSelects,
    UsePredefined,
    NoSqlNeeded,
    NeedClarification,
    Refuse,
}

/// One SELECT proposed by the Planner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerQuery {
    pub name: String,
    pub purpose: String,
    pub sql: String,
    #[serde(default)]
    pub connection_id: Option<i64>,
    #[serde(default)]
    pub expected_shape: Option<serde_json::Value>,
    #[serde(default)]
    pub safety: Option<serde_json::Value>,
}

/// Raw Planner response as it arrives over the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerResponse {
    pub decision: PlannerDecision,
    pub reason: String,
    #[serde(default)]
    pub entities: Vec<String>,
    #[serde(default)]
    pub queries: Vec<PlannerQuery>,
    #[serde(default)]
    pub predefined_query_id: Option<String>,
    #[serde(default)]
    pub clarifying_question: Option<String>,
}

/// Exhaustive dispatch form of a planner response. Adding a decision to
/// the wire contract forces every match site to handle it.
#[derive(Debug, Clone)]
pub enum PlannerAction {
    RunSelects(Vec<PlannerQuery>),
    UsePredefined(Option<String>),
    NoSqlNeeded,
    NeedClarification(Option<String>),
    Refuse(String),
}

impl PlannerResponse {
    pub fn into_action(self) -> PlannerAction {
        match self.decision {
            PlannerDecision::RunSelects => PlannerAction::RunSelects(self.queries),
            PlannerDecision::UsePredefined => {
                PlannerAction::UsePredefined(self.predefined_query_id)
            }
            PlannerDecision::NoSqlNeeded => PlannerAction::NoSqlNeeded,
            PlannerDecision::NeedClarification => {
                PlannerAction::NeedClarification(self.clarifying_question)
            }
            PlannerDecision::Refuse => PlannerAction::Refuse(self.reason),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponderUsedSql {
    pub name: String,
    pub sql: String,
    pub rows_returned: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponderResponse {
    pub answer: String,
    #[serde(default)]
    pub used_sql: Vec<ResponderUsedSql>,
    #[serde(default)]
    pub assumptions: Vec<String>,
    #[serde(default)]
    pub caveats: Vec<String>,
    #[serde(default)]
    pub followups: Vec<String>,
}

/// Parameterised safe query addressable by id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredefinedQuery {
    pub id: String,
    pub intent: String,
    pub description: String,
    pub dialect: String,
    pub sql_template: String,
    pub required_params: Vec<String>,
}

/// Full result of one executed SELECT, fed to the Responder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqlResult {
    pub name: String,
    pub sql: String,
    pub columns: Vec<String>,
    pub rows: Vec<HashMap<String, serde_json::Value>>,
    pub row_count: usize,
    pub truncated: bool,
    pub connection_id: i64,
}

/// Metadata-only record returned to the caller per executed query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutedQuery {
    pub name: String,
    pub sql: String,
    pub rows_returned: i64,
    pub truncated: bool,
    pub elapsed_ms: i64,
    pub connection_id: i64,
}

/// Planner-side error feedback carried into the next attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerError {
    pub message: String,
    pub raw_preview: String,
}

/// Execution-side error feedback carried into the next attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqlError {
    pub query_name: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub planner_error: Option<PlannerError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sql_error: Option<SqlError>,
}

impl ErrorContext {
    pub fn from_planner(message: &str, raw_preview: &str) -> Self {
        Self {
            planner_error: Some(PlannerError {
                message: message.to_string(),
                raw_preview: raw_preview.to_string(),
            }),
            sql_error: None,
        }
    }

    pub fn from_sql(query_name: &str, message: &str) -> Self {
        Self {
            planner_error: None,
            sql_error: Some(SqlError {
                query_name: query_name.to_string(),
                message: message.to_string(),
            }),
        }
    }
}

/// Compact per-round summary of prior results fed back to the Planner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreviousQuerySummary {
    pub name: String,
    pub sql: String,
    pub row_count: usize,
    pub truncated: bool,
    pub connection_id: i64,
    pub round: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_planner_response_parses_wire_format() {
        let raw = r#"{
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
        }"#;
        let response: PlannerResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(response.decision, PlannerDecision::RunSelects);
        match response.into_action() {
            PlannerAction::RunSelects(queries) => {
                assert_eq!(queries.len(), 1);
                assert_eq!(queries[0].connection_id, Some(1));
            }
            other => panic!("unexpected action: {:?}", other),
        }
    }

    #[test]
    fn test_planner_response_defaults_optional_fields() {
        let raw = r#"{"decision": "no_sql_needed", "reason": "Conceptual question."}"#;
        let response: PlannerResponse = serde_json::from_str(raw).unwrap();
        assert!(response.queries.is_empty());
        assert!(response.entities.is_empty());
        assert!(matches!(response.into_action(), PlannerAction::NoSqlNeeded));
    }

    #[test]
    fn test_planner_response_rejects_unknown_decision() {
        let raw = r#"{"decision": "drop_tables", "reason": "nope"}"#;
        assert!(serde_json::from_str::<PlannerResponse>(raw).is_err());
    }

    #[test]
    fn test_responder_response_defaults() {
        let raw = r#"{"answer": "Found 5 assets."}"#;
        let response: ResponderResponse = serde_json::from_str(raw).unwrap();
        assert!(response.used_sql.is_empty());
        assert!(response.caveats.is_empty());
    }
}
