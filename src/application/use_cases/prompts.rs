//! Prompt construction for the Planner and Responder roles.
//!
//! Both roles are instructed to answer with strict JSON matching the wire
//! contract in `domain::planner`; the user message carries the serialised
//! request payload (question, schema snapshot, constraints, feedback).

use crate::domain::catalog::SchemaSnapshot;
use crate::domain::error::{AppError, Result};
use crate::domain::planner::{
    ErrorContext, PredefinedQuery, PreviousQuerySummary, SqlResult,
};
use crate::infrastructure::config::Settings;
use serde_json::json;

pub const PLANNER_ROLE_TAG: &str = "SQL-RAG Planner";
pub const RESPONDER_ROLE_TAG: &str = "SQL-RAG Responder";

pub fn planner_system_prompt(has_planner_error: bool) -> String {
    let reminder = if has_planner_error {
        "IMPORTANT: your previous response was invalid. Answer with strict JSON now.\n"
    } else {
        ""
    };
    format!(
        r#"You are the {role}.
Your job is to decide whether the database must be queried and, if so, to propose 1..N small, safe SELECTs.
You MUST answer only with valid JSON matching the contract schema.
Rules:
- Never answer in free text. Answer only JSON.
- If error_context is present, fix the proposed queries and fix the format.
- Use need_clarification only when essential information is missing (e.g. no candidate table, or genuine ambiguity).
- If the user asks to list/show/cite N records and there is a clear target table, use decision=run_selects.
- When listing examples, include ORDER BY (id DESC or created_at DESC) when those columns exist.
- Always respect constraints.max_rows and use LIMIT accordingly (<= max_rows).
- With multiple connections, set connection_id on every query.

{reminder}Expected JSON schema:
{{
  "decision": "run_selects" | "use_predefined" | "no_sql_needed" | "need_clarification" | "refuse",
  "reason": "string",
  "entities": ["string"],
  "queries": [
    {{
      "name": "string",
      "purpose": "string",
      "sql": "string",
      "connection_id": 0,
      "expected_shape": {{"columns": ["string"], "notes": "string"}},
      "safety": {{"limit": 5, "reason": "string"}}
    }}
  ],
  "predefined_query_id": "string | null",
  "clarifying_question": "string | null"
}}

Examples:
1) run_selects
{{
  "decision": "run_selects",
  "reason": "User asked to list 5 assets and the catalog has an assets table.",
  "entities": ["assets"],
  "queries": [
    {{
      "name": "list_assets",
      "purpose": "List 5 assets with basic fields.",
      "sql": "SELECT id, name FROM public.assets ORDER BY id DESC LIMIT 5",
      "connection_id": 1,
      "expected_shape": {{"columns": ["id", "name"], "notes": "5 rows"}},
      "safety": {{"limit": 5, "reason": "Explicit user request"}}
    }}
  ],
  "predefined_query_id": null,
  "clarifying_question": null
}}
2) use_predefined
{{
  "decision": "use_predefined",
  "reason": "A matching predefined query exists.",
  "entities": ["orders"],
  "queries": [],
  "predefined_query_id": "orders_last_30_days",
  "clarifying_question": null
}}
3) no_sql_needed
{{
  "decision": "no_sql_needed",
  "reason": "The question is conceptual and can be answered without data.",
  "entities": [],
  "queries": [],
  "predefined_query_id": null,
  "clarifying_question": null
}}
4) need_clarification
{{
  "decision": "need_clarification",
  "reason": "Multiple asset tables exist and context is missing.",
  "entities": ["assets"],
  "queries": [],
  "predefined_query_id": null,
  "clarifying_question": "Which assets table should I use: assets_core or assets_legacy?"
}}
5) refuse
{{
  "decision": "refuse",
  "reason": "The request violates access policies.",
  "entities": [],
  "queries": [],
  "predefined_query_id": null,
  "clarifying_question": null
}}"#,
        role = PLANNER_ROLE_TAG,
        reminder = reminder,
    )
}

#[allow(clippy::too_many_arguments)]
pub fn planner_user_payload(
    question: &str,
    snapshot: &SchemaSnapshot,
    predefined: &[PredefinedQuery],
    settings: &Settings,
    conversation_context: &[serde_json::Value],
    error_context: Option<&ErrorContext>,
    connection_ids: &[i64],
    previous_summary: &[PreviousQuerySummary],
) -> Result<String> {
    let mut payload = json!({
        "user_question": question,
        "schema_context": snapshot,
        "predefined_queries_catalog": predefined,
        "db_dialect": settings.db_dialect,
        "constraints": {
            "max_queries": settings.sql_max_queries,
            "max_rows": settings.sql_max_rows,
            "timeout_ms": settings.sql_timeout_ms,
        },
        "conversation_context": conversation_context,
        "error_context": error_context,
        "available_connection_ids": connection_ids,
    });
    if !previous_summary.is_empty() {
        payload["previous_sql_results_summary"] = serde_json::to_value(previous_summary)
            .map_err(|e| AppError::Internal(format!("Failed to serialise summary: {}", e)))?;
    }
    serde_json::to_string(&payload)
        .map_err(|e| AppError::Internal(format!("Failed to serialise planner payload: {}", e)))
}

pub fn responder_system_prompt(agent_system_prompt: &str) -> String {
    let instructions = format!(
        r#"You are the {role}.
Answer the user based on the schema_context and on the results returned by the executed SELECTs.
You MUST answer only with valid JSON matching the Responder contract.

Expected JSON schema:
{{
  "answer": "string",
  "used_sql": [
    {{
      "name": "string",
      "sql": "string",
      "rows_returned": 0
    }}
  ],
  "assumptions": ["string"],
  "caveats": ["string"],
  "followups": ["string"]
}}

Example:
{{
  "answer": "I found 5 assets: Asset A, Asset B, Asset C, Asset D and Asset E.",
  "used_sql": [{{"name": "list_assets", "sql": "SELECT id, name FROM public.assets LIMIT 5", "rows_returned": 5}}],
  "assumptions": [],
  "caveats": ["Results may be truncated to the requested limit."],
  "followups": ["Want to filter by status or date?"]
}}"#,
        role = RESPONDER_ROLE_TAG,
    );
    if agent_system_prompt.is_empty() {
        instructions
    } else {
        format!("{}\n\n{}", agent_system_prompt, instructions)
    }
}

pub fn responder_user_payload(
    question: &str,
    snapshot: &SchemaSnapshot,
    sql_results: &[SqlResult],
    settings: &Settings,
) -> Result<String> {
    let payload = json!({
        "user_question": question,
        "schema_context": snapshot,
        "sql_results": sql_results,
        "db_dialect": settings.db_dialect,
    });
    serde_json::to_string(&payload)
        .map_err(|e| AppError::Internal(format!("Failed to serialise responder payload: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_planner_system_mentions_contract() {
        let prompt = planner_system_prompt(false);
        assert!(prompt.contains(PLANNER_ROLE_TAG));
        assert!(prompt.contains("run_selects"));
        assert!(!prompt.contains("previous response was invalid"));
    }

    #[test]
    fn test_planner_system_error_reminder() {
        let prompt = planner_system_prompt(true);
        assert!(prompt.contains("previous response was invalid"));
    }

    #[test]
    fn test_planner_payload_includes_constraints() {
        let settings = Settings::default();
        let payload = planner_user_payload(
            "list assets",
            &SchemaSnapshot::default(),
            &[],
            &settings,
            &[],
            None,
            &[1],
            &[],
        )
        .unwrap();
        let value: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(value["constraints"]["max_queries"], 3);
        assert_eq!(value["available_connection_ids"][0], 1);
        assert!(value.get("previous_sql_results_summary").is_none());
    }

    #[test]
    fn test_responder_system_prepends_agent_prompt() {
        let prompt = responder_system_prompt("You are a polite analyst.");
        assert!(prompt.starts_with("You are a polite analyst."));
        assert!(prompt.contains(RESPONDER_ROLE_TAG));
    }
}
