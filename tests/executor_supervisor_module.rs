use corral::config::Settings;
use corral::executor::{ExecutorError, TaskSupervisor};
use corral::state::{bootstrap_state_root, SessionStore, StatePaths, TaskStatus};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, body).expect("write script");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(&path).expect("metadata").permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).expect("chmod");
    }
    path
}

fn supervisor_with(
    root: &Path,
    executor: &Path,
    timeout_secs: u64,
) -> (Arc<SessionStore>, Arc<TaskSupervisor>) {
    let paths = StatePaths::new(root);
    bootstrap_state_root(&paths).expect("bootstrap");
    let store = Arc::new(SessionStore::open(paths, "@g", Duration::from_secs(5)));
    let settings = Settings {
        executor_binary: executor.display().to_string(),
        task_timeout_secs: timeout_secs,
        ..Settings::default()
    };
    let supervisor = TaskSupervisor::new(Arc::clone(&store), None, settings);
    (store, supervisor)
}

#[test]
fn successful_task_stores_token_usage_and_history() {
    let dir = tempfile::tempdir().expect("tempdir");
    let executor = write_script(
        dir.path(),
        "fake-executor",
        concat!(
            "#!/bin/sh\n",
            "echo 'Warning: slow config load'\n",
            "echo '{\"result\":\"All set.\",\"session_id\":\"sess-new\",",
            "\"usage\":{\"input_tokens\":70,\"output_tokens\":30}}'\n",
        ),
    );
    let (store, supervisor) = supervisor_with(&dir.path().join(".corral"), &executor, 0);

    let text = supervisor
        .run_task("user-1@c.chat", "set everything up")
        .expect("task runs");
    assert_eq!(text, "All set.");

    let state = store.conversation("user-1@c.chat");
    assert_eq!(state.session_token.as_deref(), Some("sess-new"));
    assert_eq!(state.usage.input, 70);
    assert_eq!(state.usage.output, 30);
    assert_eq!(state.usage.tasks, 1);
    assert_eq!(state.history.len(), 1);
    assert_eq!(state.history[0].status, TaskStatus::Completed);
    assert_eq!(state.history[0].prompt_preview, "set everything up");
}

#[test]
fn stale_session_retries_once_fresh_and_stores_the_new_token() {
    let dir = tempfile::tempdir().expect("tempdir");
    let counter = dir.path().join("invocations");
    let executor = write_script(
        dir.path(),
        "fake-executor",
        &format!(
            concat!(
                "#!/bin/sh\n",
                "echo run >> {counter}\n",
                "for arg in \"$@\"; do\n",
                "  if [ \"$arg\" = \"--resume\" ]; then\n",
                "    echo 'No conversation found with session ID' >&2\n",
                "    exit 1\n",
                "  fi\n",
                "done\n",
                "echo '{{\"result\":\"fresh answer\",\"session_id\":\"sess-after-retry\"}}'\n",
            ),
            counter = counter.display()
        ),
    );
    let (store, supervisor) = supervisor_with(&dir.path().join(".corral"), &executor, 0);
    store.set_session_token("user-1@c.chat", Some("sess-stale".to_string()));

    let text = supervisor
        .run_task("user-1@c.chat", "hello again")
        .expect("retry succeeds");
    assert_eq!(text, "fresh answer");

    let runs = fs::read_to_string(&counter).expect("counter").lines().count();
    assert_eq!(runs, 2, "resume attempt plus exactly one fresh retry");
    assert_eq!(
        store.session_token("user-1@c.chat").as_deref(),
        Some("sess-after-retry")
    );
}

#[test]
fn stale_session_failure_on_the_retry_is_not_retried_again() {
    let dir = tempfile::tempdir().expect("tempdir");
    let counter = dir.path().join("invocations");
    let executor = write_script(
        dir.path(),
        "fake-executor",
        &format!(
            concat!(
                "#!/bin/sh\n",
                "echo run >> {counter}\n",
                "echo 'failed to resume session' >&2\n",
                "exit 1\n",
            ),
            counter = counter.display()
        ),
    );
    let (store, supervisor) = supervisor_with(&dir.path().join(".corral"), &executor, 0);
    store.set_session_token("user-1@c.chat", Some("sess-stale".to_string()));

    let err = supervisor
        .run_task("user-1@c.chat", "hello")
        .expect_err("must fail");
    assert!(matches!(err, ExecutorError::NonZeroExit { .. }));

    let runs = fs::read_to_string(&counter).expect("counter").lines().count();
    assert_eq!(runs, 2, "never more than one retry per invocation");
    assert!(store.session_token("user-1@c.chat").is_none());

    let state = store.conversation("user-1@c.chat");
    assert_eq!(state.history.len(), 1);
    assert_eq!(state.history[0].status, TaskStatus::Error);
}

#[test]
fn fresh_sessions_are_never_retried_on_failure() {
    let dir = tempfile::tempdir().expect("tempdir");
    let counter = dir.path().join("invocations");
    let executor = write_script(
        dir.path(),
        "fake-executor",
        &format!(
            "#!/bin/sh\necho run >> {}\necho 'boom' >&2\nexit 2\n",
            counter.display()
        ),
    );
    let (_store, supervisor) = supervisor_with(&dir.path().join(".corral"), &executor, 0);

    let err = supervisor
        .run_task("user-1@c.chat", "hello")
        .expect_err("must fail");
    match err {
        ExecutorError::NonZeroExit {
            exit_code, detail, ..
        } => {
            assert_eq!(exit_code, 2);
            assert_eq!(detail, "boom");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    let runs = fs::read_to_string(&counter).expect("counter").lines().count();
    assert_eq!(runs, 1);
}

#[test]
fn timeout_surfaces_a_timeout_error_and_an_error_record() {
    let dir = tempfile::tempdir().expect("tempdir");
    let executor = write_script(dir.path(), "fake-executor", "#!/bin/sh\nsleep 30\n");
    let (store, supervisor) = supervisor_with(&dir.path().join(".corral"), &executor, 1);

    let err = supervisor
        .run_task("user-1@c.chat", "never finishes")
        .expect_err("must time out");
    assert!(matches!(err, ExecutorError::Timeout { timeout_secs: 1 }));

    let state = store.conversation("user-1@c.chat");
    assert_eq!(state.history.len(), 1);
    assert_eq!(state.history[0].status, TaskStatus::Error);
}

#[cfg(unix)]
#[test]
fn stop_marks_the_task_stopped_not_failed() {
    use std::thread;

    let dir = tempfile::tempdir().expect("tempdir");
    let executor = write_script(dir.path(), "fake-executor", "#!/bin/sh\nsleep 30\n");
    let (store, supervisor) = supervisor_with(&dir.path().join(".corral"), &executor, 0);

    let runner = thread::spawn({
        let supervisor = Arc::clone(&supervisor);
        move || supervisor.run_task("user-1@c.chat", "long task")
    });

    // Wait until the task registers as active, then stop it.
    let started = std::time::Instant::now();
    loop {
        if supervisor.stop("user-1@c.chat") {
            break;
        }
        assert!(
            started.elapsed() < Duration::from_secs(5),
            "task never became active"
        );
        thread::sleep(Duration::from_millis(20));
    }

    let outcome = runner.join().expect("join");
    assert!(matches!(outcome, Err(ExecutorError::Stopped)));
    assert!(!supervisor.stop("user-1@c.chat"), "nothing left to stop");

    let state = store.conversation("user-1@c.chat");
    assert_eq!(state.history.len(), 1);
    assert_eq!(state.history[0].status, TaskStatus::Stopped);
}
