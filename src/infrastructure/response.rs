//! Cleanup of raw LLM output before JSON parsing.

/// Strips a triple-backtick fence (with an optional `json` language tag)
/// from a model response, returning the inner payload trimmed.
pub fn extract_json_payload(output: &str) -> String {
    strip_code_fence(output.trim())
}

fn strip_code_fence(value: &str) -> String {
    let trimmed = value.trim();
    if let Some(stripped) = trimmed.strip_prefix("```json") {
        return stripped.trim().trim_end_matches("```").trim().to_string();
    }
    if let Some(stripped) = trimmed.strip_prefix("```") {
        let stripped = stripped.trim();
        // Some models emit a bare `json` tag on the fence line.
        let stripped = stripped.strip_prefix("json").unwrap_or(stripped);
        return stripped.trim().trim_end_matches("```").trim().to_string();
    }
    trimmed.to_string()
}
