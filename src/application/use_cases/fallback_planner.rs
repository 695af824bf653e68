//! Deterministic fallback planner.
//!
//! When the Planner LLM returns something unusable and the question
//! textually matches a listing or extremum intent, this planner derives a
//! single safe SELECT from the schema snapshot instead of giving up.
//!
//! The intent patterns are data, not code: deployments with a different
//! user language can swap them at construction without touching the
//! planning logic. The defaults cover Portuguese and English phrasing.

use crate::domain::catalog::{FlatTable, SchemaSnapshot};
use crate::domain::error::{AppError, Result};
use crate::domain::planner::{PlannerDecision, PlannerQuery, PlannerResponse};
use once_cell::sync::Lazy;
use regex::Regex;

pub const DEFAULT_LIST_INTENT_PATTERN: &str =
    r"\b(listar|liste|mostrar|mostre|citar|cite|exemplos?|registros?)\b";
pub const DEFAULT_EXTREMUM_INTENT_PATTERN: &str =
    r"\b(maior|menor|top|últim[oa]|ultimo|primeiro|mais caro|mais barata|mais alto|mais baixo)\b";
pub const DEFAULT_LIST_LIMIT_PATTERN: &str =
    r"\b(?:cite|listar|liste|mostre|mostrar)\s+(\d+)\b";

const PREFERRED_COLUMNS: [&str; 7] = ["id", "name", "symbol", "ticker", "price", "value", "created_at"];
const NUMERIC_COLUMN_CANDIDATES: [&str; 10] = [
    "value", "valor", "price", "preco", "amount", "total", "cost", "volume", "market_cap",
    "marketcap",
];
const LIST_ORDER_CANDIDATES: [&str; 6] = ["id", "created_at", "updated_at", "timestamp", "date", "data"];

static NON_WORD_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\w\s]").unwrap());

/// Compiled intent patterns. Replaceable wholesale for other locales.
pub struct IntentPatterns {
    list: Regex,
    extremum: Regex,
    limit: Regex,
}

impl IntentPatterns {
    pub fn new(list: &str, extremum: &str, limit: &str) -> Result<Self> {
        Ok(Self {
            list: Regex::new(list)
                .map_err(|e| AppError::ConfigError(format!("Invalid list pattern: {}", e)))?,
            extremum: Regex::new(extremum)
                .map_err(|e| AppError::ConfigError(format!("Invalid extremum pattern: {}", e)))?,
            limit: Regex::new(limit)
                .map_err(|e| AppError::ConfigError(format!("Invalid limit pattern: {}", e)))?,
        })
    }
}

impl Default for IntentPatterns {
    fn default() -> Self {
        Self::new(
            DEFAULT_LIST_INTENT_PATTERN,
            DEFAULT_EXTREMUM_INTENT_PATTERN,
            DEFAULT_LIST_LIMIT_PATTERN,
        )
        .expect("default intent patterns compile")
    }
}

pub struct FallbackPlanner {
    patterns: IntentPatterns,
}

impl FallbackPlanner {
    pub fn new(patterns: IntentPatterns) -> Self {
        Self { patterns }
    }

    /// Whether the question carries a listing or extremum intent at all.
    /// The orchestrator only hands over to this planner when it does.
    pub fn matches_intent(&self, question: &str) -> bool {
        let normalized = normalize_question(question);
        self.patterns.list.is_match(&normalized) || self.patterns.extremum.is_match(&normalized)
    }

    pub fn plan(
        &self,
        question: &str,
        snapshot: &SchemaSnapshot,
        connection_ids: &[i64],
        max_rows: i64,
    ) -> PlannerResponse {
        let tables = snapshot.flatten_tables();
        let mut candidates = match_table_candidates(question, &tables);
        if candidates.is_empty() && tables.len() == 1 {
            candidates = tables.clone();
        }
        if candidates.is_empty() {
            return clarification(
                "No candidate table found to answer the question.",
                "Which table should I use to answer?",
            );
        }
        if candidates.len() > 1 {
            let mut names: Vec<&str> = candidates.iter().map(|t| t.name.as_str()).collect();
            names.sort_unstable();
            names.dedup();
            return clarification(
                "Multiple candidate tables match the question.",
                &format!("Which table should I use: {}?", names.join(", ")),
            );
        }

        let table = &candidates[0];
        let connection_id = Some(table.connection_id).filter(|id| *id != 0).or_else(|| {
            connection_ids.first().copied()
        });
        let Some(connection_id) = connection_id else {
            return clarification(
                "Could not resolve a connection for the candidate table.",
                "Which connection should I use to answer?",
            );
        };

        let full_table = table.qualified_name();
        let normalized = normalize_question(question);
        let limit = self
            .patterns
            .limit
            .captures(&normalized)
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse::<i64>().ok())
            .map(|n| n.min(max_rows))
            .unwrap_or_else(|| 5.min(max_rows));
        let columns = select_columns(table);

        if self.patterns.extremum.is_match(&normalized) {
            let numeric = pick_numeric_column(table)
                .unwrap_or_else(|| columns.first().cloned().unwrap_or_else(|| "*".to_string()));
            let direction = if normalized.contains("menor") { "ASC" } else { "DESC" };
            let sql = format!(
                "SELECT {} FROM {} ORDER BY {} {} LIMIT 1",
                columns.join(", "),
                full_table,
                numeric,
                direction
            );
            return run_single(
                "fallback_top",
                "Identify the requested extreme value.",
                "Heuristic fallback for an extremum question.",
                sql,
                connection_id,
            );
        }

        if self.patterns.list.is_match(&normalized) {
            let order_clause = pick_order_column(table)
                .map(|col| format!(" ORDER BY {} DESC", col))
                .unwrap_or_default();
            let sql = format!(
                "SELECT {} FROM {}{} LIMIT {}",
                columns.join(", "),
                full_table,
                order_clause,
                limit
            );
            return run_single(
                "fallback_list",
                "List the requested records.",
                "Heuristic fallback for a listing question.",
                sql,
                connection_id,
            );
        }

        PlannerResponse {
            decision: PlannerDecision::NoSqlNeeded,
            reason: "Question does not require an explicit SELECT.".to_string(),
            entities: vec![],
            queries: vec![],
            predefined_query_id: None,
            clarifying_question: None,
        }
    }
}

impl Default for FallbackPlanner {
    fn default() -> Self {
        Self::new(IntentPatterns::default())
    }
}

fn normalize_question(question: &str) -> String {
    NON_WORD_PATTERN.replace_all(question, " ").to_lowercase()
}

fn match_table_candidates(question: &str, tables: &[FlatTable]) -> Vec<FlatTable> {
    let normalized = normalize_question(question);
    let mut exact = Vec::new();
    let mut fuzzy = Vec::new();
    for table in tables {
        let name = table.name.to_lowercase();
        if name.is_empty() {
            continue;
        }
        let word_pattern = format!(r"\b{}\b", regex::escape(&name));
        let is_exact = Regex::new(&word_pattern)
            .map(|re| re.is_match(&normalized))
            .unwrap_or(false);
        if is_exact {
            exact.push(table.clone());
        } else if normalized.contains(&name) {
            fuzzy.push(table.clone());
        }
    }
    if exact.is_empty() {
        fuzzy
    } else {
        exact
    }
}

fn select_columns(table: &FlatTable) -> Vec<String> {
    let preferred: Vec<String> = PREFERRED_COLUMNS
        .iter()
        .filter(|candidate| table.columns.iter().any(|c| c == *candidate))
        .map(|c| c.to_string())
        .collect();
    if !preferred.is_empty() {
        return preferred.into_iter().take(4).collect();
    }
    if table.columns.is_empty() {
        vec!["*".to_string()]
    } else {
        table.columns.iter().take(4).cloned().collect()
    }
}

fn pick_numeric_column(table: &FlatTable) -> Option<String> {
    NUMERIC_COLUMN_CANDIDATES
        .iter()
        .find(|candidate| table.columns.iter().any(|c| c == *candidate))
        .map(|c| c.to_string())
        .or_else(|| table.columns.first().cloned())
}

fn pick_order_column(table: &FlatTable) -> Option<String> {
    LIST_ORDER_CANDIDATES
        .iter()
        .find(|candidate| table.columns.iter().any(|c| c == *candidate))
        .map(|c| c.to_string())
        .or_else(|| table.columns.first().cloned())
}

fn clarification(reason: &str, question: &str) -> PlannerResponse {
    PlannerResponse {
        decision: PlannerDecision::NeedClarification,
        reason: reason.to_string(),
        entities: vec![],
        queries: vec![],
        predefined_query_id: None,
        clarifying_question: Some(question.to_string()),
    }
}

fn run_single(
    name: &str,
    purpose: &str,
    reason: &str,
    sql: String,
    connection_id: i64,
) -> PlannerResponse {
    PlannerResponse {
        decision: PlannerDecision::RunSelects,
        reason: reason.to_string(),
        entities: vec![],
        queries: vec![PlannerQuery {
            name: name.to_string(),
            purpose: purpose.to_string(),
            sql,
            connection_id: Some(connection_id),
            expected_shape: None,
            safety: None,
        }],
        predefined_query_id: None,
        clarifying_question: None,
    }
}
