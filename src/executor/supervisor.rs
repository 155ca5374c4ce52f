use super::invocation::{build_invocation, InvocationSpec};
use super::runner::{run_command, CancelHandle};
use super::{filtered_env, parse_executor_output, ExecutorError, ParsedOutput};
use crate::config::Settings;
use crate::sandbox::SandboxManager;
use crate::shared::{append_core_log, now_secs};
use crate::state::model::{prompt_preview, TaskRecord, TaskStatus};
use crate::state::SessionStore;
use std::collections::BTreeMap;
use std::process::Command;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Runs one executor invocation per call with full session bookkeeping:
/// token resolution and persistence, the single stale-session retry,
/// usage counters, task history, and the user-facing stop API.
pub struct TaskSupervisor {
    store: Arc<SessionStore>,
    sandbox: Option<Arc<SandboxManager>>,
    settings: Settings,
    active: Mutex<BTreeMap<String, CancelHandle>>,
}

impl TaskSupervisor {
    pub fn new(
        store: Arc<SessionStore>,
        sandbox: Option<Arc<SandboxManager>>,
        settings: Settings,
    ) -> Arc<TaskSupervisor> {
        Arc::new(TaskSupervisor {
            store,
            sandbox,
            settings,
            active: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn sandboxed(&self) -> bool {
        self.sandbox.is_some()
    }

    /// Executes `prompt` for the conversation and returns the result
    /// text. The caller (dispatch) guarantees at most one in-flight call
    /// per conversation.
    pub fn run_task(&self, conversation_id: &str, prompt: &str) -> Result<String, ExecutorError> {
        let cancel = CancelHandle::default();
        self.active
            .lock()
            .expect("active map poisoned")
            .insert(conversation_id.to_string(), cancel.clone());

        let started_at = now_secs();
        let outcome = self.run_with_retry(conversation_id, prompt, &cancel);
        let finished_at = now_secs();

        // A host-side stop or timeout only reaps the exec client; the
        // executor inside the container must be killed separately.
        if let (
            Err(ExecutorError::Stopped | ExecutorError::Timeout { .. }),
            Some(sandbox),
        ) = (&outcome, &self.sandbox)
        {
            sandbox.kill_executor(conversation_id, &self.settings.executor_binary);
        }

        self.active
            .lock()
            .expect("active map poisoned")
            .remove(conversation_id);

        let status = match &outcome {
            Ok(_) => TaskStatus::Completed,
            Err(ExecutorError::Stopped) => TaskStatus::Stopped,
            Err(_) => TaskStatus::Error,
        };
        let (input_tokens, output_tokens) = match &outcome {
            Ok(parsed) => (parsed.input_tokens, parsed.output_tokens),
            Err(_) => (None, None),
        };
        self.store.record_task(
            conversation_id,
            input_tokens.unwrap_or(0),
            output_tokens.unwrap_or(0),
            TaskRecord {
                prompt_preview: prompt_preview(prompt),
                started_at,
                finished_at,
                duration_secs: finished_at - started_at,
                input_tokens,
                output_tokens,
                status,
            },
        );

        let parsed = outcome?;
        if let Some(token) = &parsed.session_token {
            self.store
                .set_session_token(conversation_id, Some(token.clone()));
        }
        Ok(parsed.text)
    }

    /// Requests cancellation of the conversation's in-flight task.
    /// Returns false when nothing is running.
    pub fn stop(&self, conversation_id: &str) -> bool {
        let active = self.active.lock().expect("active map poisoned");
        match active.get(conversation_id) {
            Some(cancel) => {
                cancel.request_stop();
                append_core_log(
                    self.store.paths(),
                    "info",
                    "task.stop_requested",
                    conversation_id,
                );
                true
            }
            None => false,
        }
    }

    fn run_with_retry(
        &self,
        conversation_id: &str,
        prompt: &str,
        cancel: &CancelHandle,
    ) -> Result<ParsedOutput, ExecutorError> {
        let state = self.store.conversation(conversation_id);
        let model = state
            .model_override
            .clone()
            .unwrap_or_else(|| self.settings.default_model.clone());
        let token = state.session_token.clone();

        let first = self.attempt(conversation_id, prompt, &model, token.as_deref(), cancel);
        match first {
            Err(ExecutorError::NonZeroExit {
                stale_session: true,
                ..
            }) if token.is_some() => {
                // The stored token no longer resumes. Clear it and retry
                // exactly once with a fresh session.
                self.store.set_session_token(conversation_id, None);
                append_core_log(
                    self.store.paths(),
                    "warn",
                    "task.stale_session_retry",
                    conversation_id,
                );
                self.attempt(conversation_id, prompt, &model, None, cancel)
            }
            other => other,
        }
    }

    fn attempt(
        &self,
        conversation_id: &str,
        prompt: &str,
        model: &str,
        session_token: Option<&str>,
        cancel: &CancelHandle,
    ) -> Result<ParsedOutput, ExecutorError> {
        let spec = build_invocation(
            &self.settings.executor_binary,
            model,
            session_token,
            prompt,
        );
        let command = self.prepare_command(conversation_id, &spec)?;
        let timeout = Duration::from_secs(self.settings.task_timeout_secs);
        let output = run_command(command, timeout, cancel)?;
        Ok(parse_executor_output(&output.stdout))
    }

    fn prepare_command(
        &self,
        conversation_id: &str,
        spec: &InvocationSpec,
    ) -> Result<Command, ExecutorError> {
        let env = filtered_env(&BTreeMap::new());

        if let Some(sandbox) = &self.sandbox {
            let container = sandbox.ensure(conversation_id)?;
            let mut argv = Vec::with_capacity(spec.args.len() + 1);
            argv.push(spec.binary.clone());
            argv.extend(spec.args.iter().cloned());
            return Ok(sandbox.exec_command(&container, &argv, &env));
        }

        let mut command = Command::new(&spec.binary);
        command.args(&spec.args);
        command.env_clear().envs(&env);
        let cwd = self
            .store
            .conversation(conversation_id)
            .working_directory
            .filter(|dir| dir.is_dir())
            .unwrap_or_else(|| self.store.paths().root.clone());
        command.current_dir(cwd);
        Ok(command)
    }
}
