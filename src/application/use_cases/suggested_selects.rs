//! Heuristic SELECT suggestions embedded into table documents.
//!
//! The suggestions give the retrieval layer (and its LLM consumer) ready
//! to use preview queries per table: a column-prioritised preview, an
//! optional keyed filter, a time-ordered listing, and an aggregation for
//! fact tables.

use serde_json::Value;

/// Column metadata relevant to suggestion building.
#[derive(Debug, Clone)]
pub struct ColumnMeta {
    pub name: String,
    pub tags: Vec<String>,
}

impl ColumnMeta {
    pub fn new(name: &str, tags: Option<&Value>) -> Self {
        Self {
            name: name.to_string(),
            tags: normalize_tags(tags),
        }
    }
}

pub fn normalize_tags(value: Option<&Value>) -> Vec<String> {
    match value {
        None | Some(Value::Null) => vec![],
        Some(Value::String(s)) => vec![s.to_lowercase().trim().to_string()],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.to_lowercase().trim().to_string()),
                Value::Null => None,
                other => Some(other.to_string().to_lowercase()),
            })
            .collect(),
        Some(other) => vec![other.to_string().to_lowercase()],
    }
}

fn matches_needles(name: &str, tags: &[String], needles: &[&str]) -> bool {
    let lowered = name.to_lowercase();
    needles.contains(&lowered.as_str()) || tags.iter().any(|tag| needles.contains(&tag.as_str()))
}

fn is_likely_id(name: &str, tags: &[String]) -> bool {
    matches_needles(name, tags, &["id", "uuid", "code", "identifier", "chave"])
        || name.to_lowercase().ends_with("_id")
}

fn is_likely_label(name: &str, tags: &[String]) -> bool {
    matches_needles(name, tags, &["name", "title", "label", "descricao", "description"])
}

fn is_likely_status(name: &str, tags: &[String]) -> bool {
    matches_needles(name, tags, &["status", "state", "situacao", "flag"])
}

fn is_time_column(name: &str, tags: &[String]) -> bool {
    let needles = [
        "created_at",
        "updated_at",
        "timestamp",
        "data",
        "date",
        "datetime",
        "time",
    ];
    let lowered = name.to_lowercase();
    needles.iter().any(|needle| lowered.contains(needle))
        || tags.iter().any(|tag| needles.contains(&tag.as_str()))
}

/// Distinct sample values for a column, capped at 6; used to spot
/// low-cardinality filter candidates.
fn distinct_sample_values(sample_rows: &[Value], column_name: &str) -> Vec<Value> {
    let mut values: Vec<Value> = Vec::new();
    for row in sample_rows {
        if let Some(value) = row.get(column_name) {
            if !value.is_null() && !values.contains(value) {
                values.push(value.clone());
            }
        }
        if values.len() >= 6 {
            break;
        }
    }
    values
}

pub fn build_suggested_selects(
    schema_name: &str,
    table_name: &str,
    columns: &[ColumnMeta],
    table_annotations: Option<&Value>,
    sample_rows: &[Value],
) -> Vec<String> {
    let mut prioritized: Vec<&ColumnMeta> = Vec::new();
    for column in columns.iter().filter(|c| is_likely_id(&c.name, &c.tags)) {
        if !prioritized.iter().any(|c| c.name == column.name) {
            prioritized.push(column);
        }
    }
    for column in columns.iter().filter(|c| is_likely_label(&c.name, &c.tags)) {
        if !prioritized.iter().any(|c| c.name == column.name) {
            prioritized.push(column);
        }
    }
    for column in columns.iter().filter(|c| is_likely_status(&c.name, &c.tags)) {
        if !prioritized.iter().any(|c| c.name == column.name) {
            prioritized.push(column);
        }
    }
    for column in columns.iter().filter(|c| is_time_column(&c.name, &c.tags)) {
        if !prioritized.iter().any(|c| c.name == column.name) {
            prioritized.push(column);
        }
    }
    for column in columns {
        if !prioritized.iter().any(|c| c.name == column.name) {
            prioritized.push(column);
        }
    }

    let preview: Vec<&ColumnMeta> = prioritized.into_iter().take(6).collect();
    let select_columns = if preview.is_empty() {
        "*".to_string()
    } else {
        preview
            .iter()
            .map(|c| c.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    };

    let mut selects = vec![format!(
        "SELECT {} FROM {}.{} LIMIT 100;",
        select_columns, schema_name, table_name
    )];

    if !preview.is_empty() {
        let mut filter_candidates: Vec<&str> = preview
            .iter()
            .filter(|c| is_likely_id(&c.name, &c.tags) || is_likely_status(&c.name, &c.tags))
            .map(|c| c.name.as_str())
            .collect();
        if filter_candidates.is_empty() && !sample_rows.is_empty() {
            for column in &preview {
                let distinct = distinct_sample_values(sample_rows, &column.name);
                if !distinct.is_empty() && distinct.len() <= 5 {
                    filter_candidates.push(column.name.as_str());
                    break;
                }
            }
        }
        if let Some(filter_column) = filter_candidates.first() {
            selects.push(format!(
                "SELECT {} FROM {}.{} WHERE {} = :{} LIMIT 50;",
                select_columns, schema_name, table_name, filter_column, filter_column
            ));
        }
    }

    if let Some(time_column) = preview.iter().find(|c| is_time_column(&c.name, &c.tags)) {
        selects.push(format!(
            "SELECT {} FROM {}.{} ORDER BY {} DESC LIMIT 50;",
            select_columns, schema_name, table_name, time_column.name
        ));
    }

    let table_tags = normalize_tags(table_annotations.and_then(|a| a.get("tags")));
    if table_tags.iter().any(|tag| tag == "fact" || tag == "fato" || tag == "metric") {
        let numeric_candidate = preview.iter().find(|c| {
            c.tags
                .iter()
                .any(|tag| ["value", "valor", "amount", "total"].contains(&tag.as_str()))
        });
        if let Some(numeric) = numeric_candidate {
            selects.push(format!(
                "SELECT {}, COUNT(*) AS total FROM {}.{} GROUP BY {} ORDER BY total DESC LIMIT 25;",
                numeric.name, schema_name, table_name, numeric.name
            ));
        }
    }

    selects
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn columns(names: &[&str]) -> Vec<ColumnMeta> {
        names.iter().map(|name| ColumnMeta::new(name, None)).collect()
    }

    #[test]
    fn test_prioritises_id_and_label_columns() {
        let cols = columns(&["payload", "name", "id", "created_at"]);
        let selects = build_suggested_selects("public", "assets", &cols, None, &[]);
        assert!(selects[0].starts_with("SELECT id, name, created_at, payload FROM public.assets"));
    }

    #[test]
    fn test_id_column_suggests_filter() {
        let cols = columns(&["id", "name"]);
        let selects = build_suggested_selects("public", "assets", &cols, None, &[]);
        assert!(selects.iter().any(|s| s.contains("WHERE id = :id")));
    }

    #[test]
    fn test_time_column_adds_ordered_preview() {
        let cols = columns(&["id", "created_at"]);
        let selects = build_suggested_selects("public", "events", &cols, None, &[]);
        assert!(selects
            .iter()
            .any(|s| s.contains("ORDER BY created_at DESC LIMIT 50")));
    }

    #[test]
    fn test_low_cardinality_sample_column_becomes_filter() {
        let cols = vec![ColumnMeta::new("category", None)];
        let samples = vec![
            json!({"category": "a"}),
            json!({"category": "b"}),
            json!({"category": "a"}),
        ];
        let selects = build_suggested_selects("public", "items", &cols, None, &samples);
        assert!(selects.iter().any(|s| s.contains("WHERE category = :category")));
    }

    #[test]
    fn test_fact_table_gets_aggregation() {
        let cols = vec![
            ColumnMeta::new("id", None),
            ColumnMeta::new("amount", Some(&json!(["value"]))),
        ];
        let annotations = json!({"tags": ["fact"]});
        let selects = build_suggested_selects("public", "sales", &cols, Some(&annotations), &[]);
        assert!(selects.iter().any(|s| s.contains("GROUP BY amount")));
    }

    #[test]
    fn test_empty_columns_fall_back_to_star() {
        let selects = build_suggested_selects("public", "misc", &[], None, &[]);
        assert_eq!(selects, vec!["SELECT * FROM public.misc LIMIT 100;"]);
    }
}
