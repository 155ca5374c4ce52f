use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedOutput {
    pub text: String,
    pub session_token: Option<String>,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
}

/// Extracts the trailing structured result from the executor's combined
/// output. Diagnostic noise (configuration warnings, progress chatter)
/// may precede the record, so the scan runs from the last line backwards
/// and takes the last well-formed record carrying a `result` field. If
/// nothing parses, the raw output is the result verbatim.
pub fn parse_executor_output(stdout: &str) -> ParsedOutput {
    for line in stdout.lines().rev() {
        let line = line.trim();
        if line.is_empty() || !line.starts_with('{') {
            continue;
        }
        let Ok(value) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        let Some(text) = value.get("result").and_then(Value::as_str) else {
            continue;
        };

        return ParsedOutput {
            text: text.to_string(),
            session_token: value
                .get("session_id")
                .and_then(Value::as_str)
                .map(str::to_string),
            input_tokens: value
                .pointer("/usage/input_tokens")
                .and_then(Value::as_u64),
            output_tokens: value
                .pointer("/usage/output_tokens")
                .and_then(Value::as_u64),
        };
    }

    ParsedOutput {
        text: stdout.trim().to_string(),
        session_token: None,
        input_tokens: None,
        output_tokens: None,
    }
}

/// Phrases the executor emits when a `--resume` token no longer maps to
/// a live session. Matching any of them marks a nonzero exit as a
/// stale-session failure, which the supervisor retries once fresh.
const STALE_SESSION_PHRASES: &[&str] = &[
    "no conversation found",
    "session not found",
    "failed to resume",
    "unable to resume",
];

pub fn is_stale_session_failure(stdout: &str, stderr: &str) -> bool {
    let haystack = format!("{stdout}\n{stderr}").to_ascii_lowercase();
    STALE_SESSION_PHRASES
        .iter()
        .any(|phrase| haystack.contains(phrase))
}
