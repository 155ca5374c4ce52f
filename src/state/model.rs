use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

pub const TASK_HISTORY_LIMIT: usize = 5;
pub const PROMPT_PREVIEW_MAX_CHARS: usize = 80;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
    pub tasks: u32,
}

impl TokenUsage {
    pub fn add(&mut self, input: u64, output: u64) {
        self.input = self.input.saturating_add(input);
        self.output = self.output.saturating_add(output);
        self.tasks = self.tasks.saturating_add(1);
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Completed,
    Error,
    Stopped,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub prompt_preview: String,
    pub started_at: i64,
    pub finished_at: i64,
    pub duration_secs: i64,
    #[serde(default)]
    pub input_tokens: Option<u64>,
    #[serde(default)]
    pub output_tokens: Option<u64>,
    pub status: TaskStatus,
}

/// Single-line prompt excerpt suitable for history listings.
pub fn prompt_preview(prompt: &str) -> String {
    let flattened: String = prompt
        .chars()
        .map(|ch| if ch == '\n' || ch == '\r' { ' ' } else { ch })
        .collect();
    let trimmed = flattened.trim();
    if trimmed.chars().count() <= PROMPT_PREVIEW_MAX_CHARS {
        return trimmed.to_string();
    }
    trimmed.chars().take(PROMPT_PREVIEW_MAX_CHARS).collect()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConversationState {
    #[serde(default)]
    pub session_token: Option<String>,
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
    #[serde(default)]
    pub model_override: Option<String>,
    #[serde(default)]
    pub usage: TokenUsage,
    #[serde(default)]
    pub history: Vec<TaskRecord>,
}

impl ConversationState {
    /// Appends to the bounded history ring, evicting the oldest record.
    pub fn record_task(&mut self, record: TaskRecord) {
        self.history.push(record);
        while self.history.len() > TASK_HISTORY_LIMIT {
            self.history.remove(0);
        }
    }

    pub fn reset(&mut self) {
        *self = ConversationState::default();
    }

    pub fn is_empty(&self) -> bool {
        *self == ConversationState::default()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CommandOverrides {
    #[serde(default)]
    pub enabled: BTreeSet<String>,
    #[serde(default)]
    pub disabled: BTreeSet<String>,
}

impl CommandOverrides {
    /// Resolves a gated command against this conversation's toggles.
    pub fn is_enabled(&self, command: &str, default_enabled: bool) -> bool {
        if self.disabled.contains(command) {
            return false;
        }
        if self.enabled.contains(command) {
            return true;
        }
        default_enabled
    }

    pub fn set(&mut self, command: &str, enabled: bool) {
        if enabled {
            self.disabled.remove(command);
            self.enabled.insert(command.to_string());
        } else {
            self.enabled.remove(command);
            self.disabled.insert(command.to_string());
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GroupLockEntry {
    pub timestamp: i64,
    pub owner: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClaimEntry {
    pub owner: String,
    pub timestamp: i64,
}

/// The whole cross-instance coordination envelope. Always rewritten as a
/// unit under the shared-document lock; never patched in place.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SharedDocument {
    #[serde(default)]
    pub conversations: BTreeMap<String, ConversationState>,
    #[serde(default)]
    pub command_overrides: BTreeMap<String, CommandOverrides>,
    #[serde(default)]
    pub locks: BTreeMap<String, GroupLockEntry>,
    #[serde(default)]
    pub claimed_messages: BTreeMap<String, ClaimEntry>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LocalDocument {
    #[serde(default)]
    pub conversations: BTreeMap<String, ConversationState>,
}
