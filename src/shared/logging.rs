use crate::state::StatePaths;
use std::fs;
use std::io::Write;
use std::path::Path;

/// Best-effort JSON-lines logging. Log failures must never interrupt
/// an orchestration operation, so every error here is dropped.
fn append_log_line(path: &Path, level: &str, event: &str, message: &str) {
    let payload = serde_json::json!({
        "timestamp": crate::shared::time::now_secs(),
        "level": level,
        "event": event,
        "message": message,
    });

    let Ok(line) = serde_json::to_string(&payload) else {
        return;
    };

    if let Some(parent) = path.parent() {
        if fs::create_dir_all(parent).is_err() {
            return;
        }
    }
    let Ok(mut file) = fs::OpenOptions::new().create(true).append(true).open(path) else {
        return;
    };
    let _ = writeln!(file, "{line}");
}

pub fn append_core_log(paths: &StatePaths, level: &str, event: &str, message: &str) {
    append_log_line(&paths.core_log_path(), level, event, message);
}

pub fn append_sandbox_log(paths: &StatePaths, level: &str, event: &str, message: &str) {
    append_log_line(&paths.sandbox_log_path(), level, event, message);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn core_log_lines_are_json_objects() {
        let dir = tempdir().expect("tempdir");
        let paths = StatePaths::new(dir.path().join(".corral"));

        append_core_log(&paths, "info", "slot.acquired", "conversation=abc");
        append_core_log(&paths, "warn", "lock.degraded", "retries exhausted");

        let raw = fs::read_to_string(paths.core_log_path()).expect("read log");
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            let value: serde_json::Value = serde_json::from_str(line).expect("json line");
            assert!(value.get("timestamp").is_some());
            assert!(value.get("event").is_some());
        }
    }
}
