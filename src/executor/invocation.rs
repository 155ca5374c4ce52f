use super::model_map::resolve_model;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationSpec {
    pub binary: String,
    pub args: Vec<String>,
    pub resolved_model: String,
}

/// Argument list for one executor invocation. A session token switches
/// the call from "start fresh" to "resume"; the prompt is always the
/// final positional argument.
pub fn build_invocation(
    binary: &str,
    model: &str,
    session_token: Option<&str>,
    prompt: &str,
) -> InvocationSpec {
    let resolved_model = resolve_model(model);
    let mut args = vec![
        "--print".to_string(),
        "--model".to_string(),
        resolved_model.clone(),
    ];
    if let Some(token) = session_token {
        args.push("--resume".to_string());
        args.push(token.to_string());
    }
    args.push("--output-format".to_string());
    args.push("json".to_string());
    args.push(prompt.to_string());

    InvocationSpec {
        binary: binary.to_string(),
        args,
        resolved_model,
    }
}
