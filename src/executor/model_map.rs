/// Short aliases accepted from user commands. Anything else is passed to
/// the executor verbatim so newly released models work without a code
/// change.
pub fn resolve_model(model: &str) -> String {
    match model.trim() {
        "sonnet" => "claude-sonnet-4-5".to_string(),
        "opus" => "claude-opus-4-6".to_string(),
        "haiku" => "claude-haiku-4-5".to_string(),
        other => other.to_string(),
    }
}
