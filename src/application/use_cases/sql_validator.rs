//! Safety validation for planner-proposed SQL.
//!
//! The checks are deliberately pattern-based: a lightweight scanner over
//! the statement text, preferring false rejections over false acceptances.
//! Rules run in order and the first violation wins. Every accepted
//! statement leaves with an enforced row limit.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeSet;
use std::collections::HashSet;

static FORBIDDEN_KEYWORDS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\b(insert|update|delete|upsert|merge|drop|alter|create|grant|revoke|truncate|copy|execute|call)\b",
    )
    .unwrap()
});

static FORBIDDEN_FUNCTIONS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(pg_read_file|pg_ls_dir|pg_sleep|dblink|lo_export|lo_import)\b").unwrap()
});

static SELECT_INTO_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\bselect\b[\s\S]+?\binto\b").unwrap());

static FOR_UPDATE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\bfor\s+(update|share)\b").unwrap());

static FROM_JOIN_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)\b(from|join)\s+([a-zA-Z0-9_".]+)"#).unwrap());

static CTE_NAME_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bwith\s+([a-zA-Z_][a-zA-Z0-9_]*)\s+as\s*\(").unwrap());

static FOLLOWING_CTE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\)\s*,\s*([a-zA-Z_][a-zA-Z0-9_]*)\s+as\s*\(").unwrap());

static LIMIT_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\blimit\s+(\d+|:[a-zA-Z_][a-zA-Z0-9_]*|all)\b").unwrap());

/// Outcome of validating one candidate statement.
#[derive(Debug, Clone)]
pub struct SqlValidation {
    pub is_valid: bool,
    pub error: Option<String>,
    /// The statement with the row limit enforced. Meaningful only when
    /// `is_valid` is true.
    pub safe_sql: String,
}

impl SqlValidation {
    fn rejected(reason: &str, sql: &str) -> Self {
        Self {
            is_valid: false,
            error: Some(reason.to_string()),
            safe_sql: sql.to_string(),
        }
    }

    fn accepted(safe_sql: String) -> Self {
        Self {
            is_valid: true,
            error: None,
            safe_sql,
        }
    }
}

/// Identifier normalisation shared by the validator and the allowlist
/// builder: trim, drop one enclosing double-quote pair, lowercase.
pub fn normalize_identifier(value: &str) -> String {
    let trimmed = value.trim();
    let unquoted = trimmed
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(trimmed);
    unquoted.to_lowercase()
}

fn extract_table_names(sql: &str) -> HashSet<String> {
    let mut names = HashSet::new();
    for caps in FROM_JOIN_PATTERN.captures_iter(sql) {
        if let Some(raw) = caps.get(2) {
            let cleaned = raw.as_str().trim().trim_end_matches(',');
            let token = cleaned.split_whitespace().next().unwrap_or("");
            let normalized = normalize_identifier(token);
            if !normalized.is_empty() {
                names.insert(normalized);
            }
        }
    }
    names
}

fn extract_cte_names(sql: &str) -> HashSet<String> {
    let mut names: HashSet<String> = CTE_NAME_PATTERN
        .captures_iter(sql)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_lowercase()))
        .collect();
    for caps in FOLLOWING_CTE_PATTERN.captures_iter(sql) {
        if let Some(name) = caps.get(1) {
            names.insert(name.as_str().to_lowercase());
        }
    }
    names
}

fn ensure_limit(sql: &str, limit: i64) -> String {
    if let Some(caps) = LIMIT_PATTERN.captures(sql) {
        if let Some(raw) = caps.get(1) {
            if let Ok(existing) = raw.as_str().parse::<i64>() {
                if existing <= limit {
                    return sql.to_string();
                }
            }
        }
        return LIMIT_PATTERN
            .replace_all(sql, format!("LIMIT {}", limit).as_str())
            .to_string();
    }
    format!("{} LIMIT {}", sql.trim_end_matches(';'), limit)
}

/// Validates a candidate statement against the safety rules and the
/// per-connection allowlist, enforcing the row cap on acceptance.
pub fn validate_sql(sql: &str, allowed_tables: &HashSet<String>, max_rows: i64) -> SqlValidation {
    let trimmed = sql.trim();
    let cleaned = trimmed.strip_suffix(';').unwrap_or(trimmed).trim_end();

    if cleaned.contains(';') {
        return SqlValidation::rejected("Multiple statements not permitted.", cleaned);
    }

    let lowered = cleaned.to_lowercase();
    if !(lowered.starts_with("select") || lowered.starts_with("with")) {
        return SqlValidation::rejected("Only SELECT/CTE are permitted.", cleaned);
    }
    if SELECT_INTO_PATTERN.is_match(&lowered) {
        return SqlValidation::rejected("SELECT INTO is not permitted.", cleaned);
    }
    if FOR_UPDATE_PATTERN.is_match(&lowered) {
        // Checked ahead of the keyword sweep: `update` would shadow it.
        return SqlValidation::rejected(
            "SELECT with FOR UPDATE/SHARE is not permitted.",
            cleaned,
        );
    }
    if FORBIDDEN_KEYWORDS.is_match(&lowered) {
        return SqlValidation::rejected("Write or DDL statements are not permitted.", cleaned);
    }
    if FORBIDDEN_FUNCTIONS.is_match(&lowered) {
        return SqlValidation::rejected("Dangerous functions are not permitted.", cleaned);
    }

    let cte_names = extract_cte_names(cleaned);
    let referenced: HashSet<String> = extract_table_names(cleaned)
        .into_iter()
        .filter(|name| !cte_names.contains(name))
        .collect();

    if !referenced.is_empty() {
        let missing: BTreeSet<String> = referenced
            .iter()
            .filter(|name| !allowed_tables.contains(*name))
            .cloned()
            .collect();
        if !missing.is_empty() {
            if lowered.starts_with("with") {
                // Bare names under WITH may be inner CTE references the
                // lightweight scanner missed; only qualified misses reject.
                let missing_qualified: BTreeSet<String> =
                    missing.into_iter().filter(|name| name.contains('.')).collect();
                if !missing_qualified.is_empty() {
                    return SqlValidation::rejected(
                        &format!(
                            "Tables outside the permitted catalog: {:?}",
                            missing_qualified.iter().collect::<Vec<_>>()
                        ),
                        cleaned,
                    );
                }
            } else {
                return SqlValidation::rejected(
                    &format!(
                        "Tables outside the permitted catalog: {:?}",
                        missing.iter().collect::<Vec<_>>()
                    ),
                    cleaned,
                );
            }
        }
    }

    SqlValidation::accepted(ensure_limit(cleaned, max_rows))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allowlist() -> HashSet<String> {
        ["public.assets", "assets"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    #[test]
    fn test_accepts_select_and_appends_limit() {
        let result = validate_sql("SELECT id FROM public.assets", &allowlist(), 5);
        assert!(result.is_valid);
        assert!(result.safe_sql.ends_with("LIMIT 5"));
    }

    #[test]
    fn test_rejects_update() {
        let result = validate_sql("UPDATE public.assets SET name = 'x'", &allowlist(), 5);
        assert!(!result.is_valid);
        assert_eq!(result.error.as_deref(), Some("Only SELECT/CTE are permitted."));
    }

    #[test]
    fn test_rejects_multiple_statements() {
        let result = validate_sql(
            "SELECT * FROM public.assets; SELECT * FROM public.assets",
            &allowlist(),
            5,
        );
        assert!(!result.is_valid);
        assert_eq!(
            result.error.as_deref(),
            Some("Multiple statements not permitted.")
        );
    }

    #[test]
    fn test_rejects_embedded_write_keyword() {
        let result = validate_sql(
            "SELECT id FROM public.assets WHERE id IN (DELETE FROM assets)",
            &allowlist(),
            5,
        );
        assert!(!result.is_valid);
        assert_eq!(
            result.error.as_deref(),
            Some("Write or DDL statements are not permitted.")
        );
    }

    #[test]
    fn test_rejects_select_into() {
        let result = validate_sql(
            "SELECT id INTO backup FROM public.assets",
            &allowlist(),
            5,
        );
        assert!(!result.is_valid);
        assert_eq!(result.error.as_deref(), Some("SELECT INTO is not permitted."));
    }

    #[test]
    fn test_rejects_for_update() {
        let result = validate_sql("SELECT * FROM public.assets FOR UPDATE", &allowlist(), 5);
        assert!(!result.is_valid);
        assert_eq!(
            result.error.as_deref(),
            Some("SELECT with FOR UPDATE/SHARE is not permitted.")
        );
    }

    #[test]
    fn test_rejects_dangerous_functions() {
        let result = validate_sql(
            "SELECT pg_sleep(10) FROM public.assets",
            &allowlist(),
            5,
        );
        assert!(!result.is_valid);
        assert_eq!(
            result.error.as_deref(),
            Some("Dangerous functions are not permitted.")
        );
    }

    #[test]
    fn test_rejects_table_outside_allowlist() {
        let result = validate_sql("SELECT * FROM public.users", &allowlist(), 5);
        assert!(!result.is_valid);
        assert!(result
            .error
            .as_deref()
            .unwrap()
            .contains("public.users"));
    }

    #[test]
    fn test_clamps_excessive_limit() {
        let result = validate_sql("SELECT * FROM public.assets LIMIT 1000", &allowlist(), 5);
        assert!(result.is_valid);
        assert!(result.safe_sql.contains("LIMIT 5"));
        assert!(!result.safe_sql.contains("1000"));
    }

    #[test]
    fn test_keeps_limit_within_cap() {
        let result = validate_sql("SELECT * FROM public.assets LIMIT 3", &allowlist(), 5);
        assert!(result.is_valid);
        assert!(result.safe_sql.contains("LIMIT 3"));
    }

    #[test]
    fn test_replaces_limit_all() {
        let result = validate_sql("SELECT * FROM public.assets LIMIT ALL", &allowlist(), 5);
        assert!(result.is_valid);
        assert!(result.safe_sql.contains("LIMIT 5"));
    }

    #[test]
    fn test_replaces_bind_parameter_limit() {
        let result = validate_sql("SELECT * FROM public.assets LIMIT :n", &allowlist(), 5);
        assert!(result.is_valid);
        assert!(result.safe_sql.contains("LIMIT 5"));
    }

    #[test]
    fn test_accepts_cte_referencing_allowed_table() {
        let result = validate_sql(
            "WITH tmp AS (SELECT id FROM public.assets) SELECT id FROM tmp",
            &allowlist(),
            5,
        );
        assert!(result.is_valid, "error: {:?}", result.error);
        assert!(result.safe_sql.contains("LIMIT 5"));
    }

    #[test]
    fn test_cte_allows_bare_unknown_names_only() {
        // Bare unknown names under WITH pass (possible inner CTE refs)...
        let bare = validate_sql(
            "WITH tmp AS (SELECT id FROM assets) SELECT id FROM mystery",
            &allowlist(),
            5,
        );
        assert!(bare.is_valid);

        // ...but qualified unknown names still reject.
        let qualified = validate_sql(
            "WITH tmp AS (SELECT id FROM secret.users) SELECT id FROM tmp",
            &allowlist(),
            5,
        );
        assert!(!qualified.is_valid);
        assert!(qualified.error.as_deref().unwrap().contains("secret.users"));
    }

    #[test]
    fn test_following_cte_names_are_excluded() {
        let sql = "WITH a AS (SELECT id FROM public.assets), b AS (SELECT id FROM a) SELECT * FROM b";
        let result = validate_sql(sql, &allowlist(), 5);
        assert!(result.is_valid, "error: {:?}", result.error);
    }

    #[test]
    fn test_strips_single_trailing_semicolon() {
        let result = validate_sql("SELECT id FROM public.assets;", &allowlist(), 5);
        assert!(result.is_valid);
        assert!(!result.safe_sql.contains(';'));
    }

    #[test]
    fn test_quoted_identifier_normalisation() {
        assert_eq!(normalize_identifier("\"Assets\""), "assets");
        assert_eq!(normalize_identifier("  public.ASSETS "), "public.assets");
    }
}
