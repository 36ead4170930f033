use serde_json::Value;
use tracing::warn;

/// Repairs tool-call arguments before they are parsed or sent back to the
/// backend.
///
/// Some backends occasionally emit the arguments object twice in a row
/// (`{"a":1}{"a":1}`). Valid JSON is returned unchanged; otherwise the first
/// well-formed JSON value at the start of the string is kept. When nothing can
/// be extracted the original string is returned as-is.
pub fn sanitize_tool_arguments(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return "{}".to_string();
    }
    if serde_json::from_str::<Value>(trimmed).is_ok() {
        return raw.to_string();
    }
    let mut values = serde_json::Deserializer::from_str(trimmed).into_iter::<Value>();
    match values.next() {
        Some(Ok(first)) => {
            warn!(raw = %raw, "repaired concatenated tool arguments");
            first.to_string()
        }
        _ => raw.to_string(),
    }
}
