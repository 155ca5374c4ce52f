use std::collections::BTreeMap;

/// The only parent-environment variables forwarded to the executor.
/// Everything else — API keys, tokens, cloud credentials — stays behind.
pub const ENV_WHITELIST: &[&str] = &[
    "PATH",
    "HOME",
    "SHELL",
    "USER",
    "LOGNAME",
    "LANG",
    "LC_ALL",
    "TZ",
    "TMPDIR",
    "GIT_AUTHOR_NAME",
    "GIT_AUTHOR_EMAIL",
    "GIT_COMMITTER_NAME",
    "GIT_COMMITTER_EMAIL",
];

pub fn filtered_env(overrides: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    for key in ENV_WHITELIST {
        if let Ok(value) = std::env::var(key) {
            env.insert((*key).to_string(), value);
        }
    }
    for (key, value) in overrides {
        env.insert(key.clone(), value.clone());
    }
    env
}
