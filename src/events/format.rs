//! Display helpers for the subscriber-facing stream.

use std::sync::LazyLock;

use regex::Regex;

/// Cap on tool output carried in a workflow step (bytes).
pub const MAX_OUTPUT_LENGTH: usize = 5000;

/// Room kept free for the truncation marker so the result stays under the cap.
const MARKER_RESERVE: usize = 100;

/// How far back from the cut point to look for a newline.
const NEWLINE_SEARCH_WINDOW: usize = 500;

/// Status messages for known tools.
const TOOL_MESSAGES: &[(&str, &str)] = &[
    ("calculator", "🧮 Calculating"),
    ("list_all_tables", "📂 Listing all tables"),
    ("list_tables", "📂 Listing tables"),
    ("describe_table", "📑 Inspecting table structure"),
    ("describe_table_with_comments", "🗒️ Reading schema details"),
    ("get_query_syntax_help", "🔧 Getting query syntax"),
    ("query", "🔎 Querying database"),
    ("get_row_count", "🔢 Counting rows"),
    ("sample_data", "📊 Sampling data"),
    ("explain_query", "🧭 Analyzing query plan"),
    ("list_indexes", "🗂️ Listing indexes"),
    ("list_foreign_keys", "🔗 Checking relationships"),
    ("get_table_comments", "💬 Reading table comments"),
    ("database_health", "💚 Checking health"),
];

/// Human-readable progress message for a tool invocation.
pub fn tool_status_message(name: &str) -> String {
    TOOL_MESSAGES
        .iter()
        .find(|(tool, _)| *tool == name)
        .map(|(_, message)| (*message).to_string())
        .unwrap_or_else(|| format!("⚙️ Running {name}..."))
}

/// Largest char boundary at or below `index`.
fn floor_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut end = index;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    end
}

/// Truncate tool output so the result (marker included) fits in `max_len` bytes.
///
/// Prefers cutting at a newline close to the limit. Output already within
/// the cap is returned unchanged, which makes the operation idempotent.
pub fn truncate_output(output: &str, max_len: usize) -> String {
    if output.len() <= max_len {
        return output.to_string();
    }
    if max_len <= MARKER_RESERVE {
        return output[..floor_char_boundary(output, max_len)].to_string();
    }

    let budget = floor_char_boundary(output, max_len - MARKER_RESERVE);
    let window_start = floor_char_boundary(output, budget.saturating_sub(NEWLINE_SEARCH_WINDOW));
    let cut = match output[window_start..budget].rfind('\n') {
        Some(i) if window_start + i > 0 => window_start + i,
        _ => budget,
    };

    let kept = output[..cut].trim_end();
    let total_lines = output.matches('\n').count() + 1;
    let kept_lines = kept.matches('\n').count() + 1;
    let remaining_lines = total_lines.saturating_sub(kept_lines);
    let remaining_chars = output.len() - cut;

    format!(
        "{kept}\n\n... (truncated {remaining_lines} more lines, {remaining_chars} more characters)"
    )
}

static URL_CREDENTIALS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"://[^/\s:@]+:[^@\s]+@").expect("valid regex"));
static BEARER_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)bearer\s+[A-Za-z0-9._~+/=\-]+").expect("valid regex"));
static API_KEY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"sk-[A-Za-z0-9_\-]{8,}").expect("valid regex"));

/// Strip credentials that may appear in upstream error text.
pub fn redact_secrets(text: &str) -> String {
    let text = URL_CREDENTIALS.replace_all(text, "://***@");
    let text = BEARER_TOKEN.replace_all(&text, "Bearer ***");
    API_KEY.replace_all(&text, "sk-***").into_owned()
}

/// Turn an engine error into a message fit for end users.
pub fn sanitize_error_message(raw: &str) -> String {
    let lower = raw.to_lowercase();

    if lower.contains("validationexception") {
        return "Invalid request to AI model. Please check model configuration or try a different request."
            .to_string();
    }
    if lower.contains("error parsing tool call") {
        return "The model had trouble formatting its response. Please try rephrasing your question."
            .to_string();
    }
    if lower.contains("responseerror") {
        return "There was an error communicating with the model. Please try again.".to_string();
    }

    let redacted = redact_secrets(raw);
    let head = redacted.split(':').next().unwrap_or_default().trim();
    format!("An error occurred: {head}")
}
