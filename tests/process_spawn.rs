//! Real OS processes: a POSIX shell script standing in for the engine.
#![cfg(unix)]

use std::sync::Arc;

use pvsbridge_engine::{
    EngineCommand, EngineManager, EnginePayload, EngineRole, HandleSettings, HandleState,
    ProcessLauncher,
};
use pvsbridge_process::ProcessConfig;

const FAKE_REPL: &str = r#"
printf 'fake engine\npvs(1): '
n=1
while IFS= read -r line; do
  n=$((n+1))
  case "$line" in
    "(quit)") exit 0 ;;
    "(hello)") printf '"hello"\npvs(%d): ' "$n" ;;
    *) printf 'NIL\npvs(%d): ' "$n" ;;
  esac
done
"#;

fn manager() -> EngineManager {
    let config = ProcessConfig::new("sh").args(["-c", FAKE_REPL]);
    EngineManager::new(
        Arc::new(ProcessLauncher::new(config)),
        HandleSettings::default(),
    )
}

#[tokio::test]
async fn spawned_engine_answers_and_is_killed() {
    let manager = manager();
    let handle = manager.acquire(EngineRole::Parser).await.unwrap();
    assert_eq!(handle.state(), HandleState::Ready);
    let pid = handle.pid().expect("os process");

    let response = handle.execute(EngineCommand::lisp("(hello)")).await.unwrap();
    assert_eq!(response.res, Some(EnginePayload::Text("\"hello\"".into())));

    manager.shutdown().await;
    assert_eq!(handle.state(), HandleState::Killed);
    #[cfg(target_os = "linux")]
    assert!(!std::path::Path::new(&format!("/proc/{pid}")).exists());
    let _ = pid;
}

#[tokio::test]
async fn engine_exit_is_a_crash() {
    let manager = manager();
    let handle = manager.acquire(EngineRole::Parser).await.unwrap();

    let err = handle
        .execute(EngineCommand::lisp("(quit)"))
        .await
        .unwrap_err();
    assert!(err.is_process_fault());
    assert_eq!(handle.state(), HandleState::Crashed);

    let fresh = manager.acquire(EngineRole::Parser).await.unwrap();
    assert_ne!(fresh.id(), handle.id());
    assert_eq!(fresh.state(), HandleState::Ready);
    manager.shutdown().await;
    handle.kill().await;
    assert_eq!(handle.state(), HandleState::Killed);
}

#[tokio::test]
async fn missing_binary_is_a_process_fault() {
    let config = ProcessConfig::new("/definitely/not/a/pvs");
    let manager = EngineManager::new(
        Arc::new(ProcessLauncher::new(config)),
        HandleSettings::default(),
    );
    let err = manager.acquire(EngineRole::Parser).await.unwrap_err();
    assert!(err.is_process_fault());
}
