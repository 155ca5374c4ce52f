use crate::config::{load_settings, ConfigError, Settings};
use crate::executor::{ExecutorError, TaskSupervisor};
use crate::limiter::SlotLimiter;
use crate::sandbox::SandboxManager;
use crate::shared::append_core_log;
use crate::state::{
    acquire_group_lock, bootstrap_state_root, claim_message, release_group_lock, SessionStore,
    StateError, StatePaths,
};
use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    State(#[from] StateError),
}

/// Outbound surface back to the messaging transport. The core never
/// formats, chunks, or delivers messages itself.
pub trait Responder: Send + Sync {
    fn on_result(&self, conversation_id: &str, text: &str);
    fn on_error(&self, conversation_id: &str, description: &str);
}

/// Acknowledgement for an inbound message, returned synchronously so
/// the transport can answer "queued, position N" style receipts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    /// Task started (or will start as soon as a slot frees up).
    Started,
    /// Another task for this conversation is in flight; position is
    /// 1-based within the conversation's queue.
    Queued { position: usize },
    /// Another instance (or an earlier delivery) already claimed the
    /// message id; the caller must not process it.
    Duplicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopOutcome {
    pub stopped_in_flight: bool,
    pub drained: usize,
}

#[derive(Debug, Default)]
struct ConversationQueue {
    in_flight: bool,
    pending: VecDeque<String>,
}

/// Entry point of the orchestration core. Serializes tasks per
/// conversation, bounds global concurrency, and coordinates with
/// cooperating instances through the shared document.
pub struct Dispatcher {
    store: Arc<SessionStore>,
    supervisor: Arc<TaskSupervisor>,
    limiter: Arc<SlotLimiter>,
    responder: Arc<dyn Responder>,
    settings: Settings,
    instance_id: String,
    queues: Mutex<BTreeMap<String, ConversationQueue>>,
}

impl Dispatcher {
    /// Wires the whole core from a state root: settings, stores, sandbox
    /// detection, supervisor, limiter.
    pub fn bootstrap(
        state_root: &Path,
        responder: Arc<dyn Responder>,
    ) -> Result<Arc<Dispatcher>, OrchestratorError> {
        let paths = StatePaths::new(state_root);
        bootstrap_state_root(&paths)?;
        let settings = load_settings(&paths)?;

        let store = Arc::new(SessionStore::open(
            paths.clone(),
            &settings.shared_suffix,
            Duration::from_secs(settings.lock.mutex_stale_secs),
        ));
        let sandbox = SandboxManager::detect(&paths, &settings.sandbox);
        let supervisor = TaskSupervisor::new(Arc::clone(&store), sandbox, settings.clone());
        let limiter = SlotLimiter::new(settings.max_concurrent_tasks);
        Ok(Self::new(store, supervisor, limiter, responder, settings))
    }

    pub fn new(
        store: Arc<SessionStore>,
        supervisor: Arc<TaskSupervisor>,
        limiter: Arc<SlotLimiter>,
        responder: Arc<dyn Responder>,
        settings: Settings,
    ) -> Arc<Dispatcher> {
        Arc::new(Dispatcher {
            store,
            supervisor,
            limiter,
            responder,
            settings,
            instance_id: instance_id(),
            queues: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Inbound entry point. Claims the message (shared conversations
    /// only), then either starts the task on a worker thread or queues
    /// it behind the conversation's in-flight task.
    pub fn handle_inbound_message(
        self: &Arc<Self>,
        conversation_id: &str,
        message_id: &str,
        prompt: &str,
    ) -> Submission {
        if self.store.is_shared(conversation_id)
            && !claim_message(
                self.store.paths(),
                self.store.mutex_stale(),
                message_id,
                &self.instance_id,
            )
        {
            append_core_log(
                self.store.paths(),
                "info",
                "dispatch.duplicate",
                message_id,
            );
            return Submission::Duplicate;
        }

        let submission = {
            let mut queues = self.queues.lock().expect("queues poisoned");
            let queue = queues.entry(conversation_id.to_string()).or_default();
            if queue.in_flight {
                queue.pending.push_back(prompt.to_string());
                Submission::Queued {
                    position: queue.pending.len(),
                }
            } else {
                queue.in_flight = true;
                Submission::Started
            }
        };

        if submission == Submission::Started {
            let dispatcher = Arc::clone(self);
            let conversation = conversation_id.to_string();
            let prompt = prompt.to_string();
            thread::spawn(move || dispatcher.run_conversation(&conversation, prompt));
        }
        submission
    }

    /// Stops the in-flight task (if any) and clears everything queued
    /// behind it.
    pub fn stop_conversation(&self, conversation_id: &str) -> StopOutcome {
        let drained = {
            let mut queues = self.queues.lock().expect("queues poisoned");
            match queues.get_mut(conversation_id) {
                Some(queue) => {
                    let drained = queue.pending.len();
                    queue.pending.clear();
                    drained
                }
                None => 0,
            }
        };
        StopOutcome {
            stopped_in_flight: self.supervisor.stop(conversation_id),
            drained,
        }
    }

    pub fn queued_len(&self, conversation_id: &str) -> usize {
        self.queues
            .lock()
            .expect("queues poisoned")
            .get(conversation_id)
            .map(|queue| queue.pending.len())
            .unwrap_or(0)
    }

    fn run_conversation(self: &Arc<Self>, conversation_id: &str, first_prompt: String) {
        let mut next = Some(first_prompt);
        while let Some(prompt) = next.take() {
            self.execute_one(conversation_id, &prompt);

            let mut queues = self.queues.lock().expect("queues poisoned");
            let Some(queue) = queues.get_mut(conversation_id) else {
                break;
            };
            match queue.pending.pop_front() {
                Some(pending) => next = Some(pending),
                None => {
                    queue.in_flight = false;
                    queues.remove(conversation_id);
                }
            }
        }
    }

    fn execute_one(&self, conversation_id: &str, prompt: &str) {
        let shared = self.store.is_shared(conversation_id);
        if shared
            && !acquire_group_lock(
                self.store.paths(),
                self.store.mutex_stale(),
                Duration::from_secs(self.settings.lock.group_ttl_secs),
                conversation_id,
                &self.instance_id,
            )
        {
            self.responder.on_error(
                conversation_id,
                "Another instance is already working on this conversation. Try again shortly.",
            );
            return;
        }

        let outcome = {
            let _permit = self.limiter.acquire();
            self.supervisor.run_task(conversation_id, prompt)
        };

        if shared {
            release_group_lock(
                self.store.paths(),
                self.store.mutex_stale(),
                conversation_id,
            );
        }

        match outcome {
            Ok(text) => self.responder.on_result(conversation_id, &text),
            Err(ExecutorError::Stopped) => {
                // User-initiated stop is a distinct outcome, not an error;
                // the stop API already acknowledged it.
                append_core_log(
                    self.store.paths(),
                    "info",
                    "task.stopped",
                    conversation_id,
                );
            }
            Err(err) => self.responder.on_error(conversation_id, &err.to_string()),
        }
    }
}

fn instance_id() -> String {
    let mut bytes = [0u8; 4];
    let suffix = if getrandom::getrandom(&mut bytes).is_ok() {
        u32::from_le_bytes(bytes)
    } else {
        std::process::id()
    };
    format!("corral-{}-{suffix:08x}", std::process::id())
}
