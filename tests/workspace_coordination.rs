//! Context tracking, obligation aggregation and crash recovery through the
//! coordinator and facade.

use std::sync::Arc;
use std::time::Duration;

use pvsbridge_engine::fake::{FakeEngine, FakeLauncher, FakeStep};
use pvsbridge_engine::{
    EngineManager, EngineRole, ErrorKind, HandleSettings, HandleState, PvsFacade, PvsRequest,
    WorkspaceCoordinator,
};
use serde_json::json;
use tempfile::TempDir;

const FOO: &str = "% two theories\n\
    foo_th: THEORY\nBEGIN\n  x: posnat = 1\nEND foo_th\n\n\
    bar_th: THEORY\nBEGIN\n  y: nat = 2\nEND bar_th\n";

const TRIPLE: &str = "t1: THEORY BEGIN a: posnat = 1 END t1\n\
    t2: THEORY BEGIN b: posnat = 2 END t2\n\
    t3: THEORY BEGIN c: posnat = 3 END t3\n";

fn tcc(theory: &str, id: &str) -> String {
    format!(
        "((:id \"{id}\" :definition \"1 > 0\" :comment \"subtype TCC\" :from-decl \"x\" :proved nil :theory \"{theory}\"))"
    )
}

struct Fixture {
    dir: TempDir,
    launcher: Arc<FakeLauncher>,
    manager: Arc<EngineManager>,
    coordinator: Arc<WorkspaceCoordinator>,
}

impl Fixture {
    fn new(engine: FakeEngine) -> Self {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("foo.pvs"), FOO).unwrap();
        std::fs::write(dir.path().join("triple.pvs"), TRIPLE).unwrap();
        let launcher = Arc::new(FakeLauncher::new(engine));
        let manager = Arc::new(EngineManager::new(launcher.clone(), HandleSettings::default()));
        let coordinator = Arc::new(WorkspaceCoordinator::new(manager.clone(), "", 2));
        Self {
            dir,
            launcher,
            manager,
            coordinator,
        }
    }

    fn folder(&self) -> String {
        self.dir.path().to_string_lossy().to_string()
    }

    fn request(&self, file: &str) -> PvsRequest {
        PvsRequest::new(self.folder(), file)
    }
}

#[tokio::test]
async fn change_context_only_when_the_folder_differs() {
    let fx = Fixture::new(FakeEngine::idle());
    let other = TempDir::new().unwrap();
    let handle = fx.manager.acquire(EngineRole::Parser).await.unwrap();
    let log = fx.launcher.last_log(EngineRole::Parser).unwrap();

    drop(handle.enter_context(&fx.folder()).await.unwrap());
    assert_eq!(log.count("(change-context"), 1);

    drop(handle.enter_context(&fx.folder()).await.unwrap());
    drop(handle.enter_context(&format!("{}/", fx.folder())).await.unwrap());
    assert_eq!(log.count("(change-context"), 1);

    drop(handle.enter_context(&other.path().to_string_lossy()).await.unwrap());
    assert_eq!(log.count("(change-context"), 2);

    drop(handle.enter_context(&fx.folder()).await.unwrap());
    assert_eq!(log.count("(change-context"), 3);
    fx.coordinator.shutdown().await;
}

#[tokio::test]
async fn repeated_requests_in_one_folder_change_context_once() {
    let fx = Fixture::new(FakeEngine::idle());
    fx.coordinator.parse_file(&fx.request("foo")).await.unwrap();
    fx.coordinator.parse_file(&fx.request("triple")).await.unwrap();

    let log = fx.launcher.last_log(EngineRole::Parser).unwrap();
    assert_eq!(log.count("(change-context"), 1);
    assert_eq!(log.count("(parse-file"), 2);
    let changes: Vec<usize> = log
        .commands()
        .iter()
        .enumerate()
        .filter(|(_, c)| c.starts_with("(change-context"))
        .map(|(i, _)| i)
        .collect();
    let first_parse = log
        .commands()
        .iter()
        .position(|c| c.starts_with("(parse-file"))
        .unwrap();
    assert!(changes[0] < first_parse);
    fx.coordinator.shutdown().await;
}

#[tokio::test]
async fn explicit_change_context_waits_for_a_running_request() {
    let fx = Fixture::new(FakeEngine::new(|cmd| {
        let folder = cmd.strip_prefix("(change-context \"")?.split('"').next()?.to_string();
        Some(vec![
            FakeStep::Delay(Duration::from_millis(100)),
            FakeStep::output(format!("\"{folder}/\"")),
            FakeStep::Prompt,
        ])
    }));
    let other = TempDir::new().unwrap();
    let handle = fx.manager.acquire(EngineRole::Parser).await.unwrap();
    let log = fx.launcher.last_log(EngineRole::Parser).unwrap();

    let parse = {
        let coordinator = fx.coordinator.clone();
        let request = fx.request("foo");
        tokio::spawn(async move { coordinator.parse_file(&request).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    let switched = fx
        .coordinator
        .change_context(&other.path().to_string_lossy())
        .await
        .unwrap();
    parse.await.unwrap().unwrap();

    let sequence: Vec<String> = log
        .commands()
        .into_iter()
        .filter(|c| c.starts_with("(change-context") || c.starts_with("(parse-file"))
        .collect();
    assert_eq!(sequence.len(), 3, "{sequence:?}");
    assert!(sequence[0].contains(&fx.folder()));
    assert!(sequence[1].starts_with("(parse-file \"foo\""));
    assert!(sequence[2].contains(other.path().to_string_lossy().as_ref()));
    assert_eq!(handle.context(), Some(switched));
    fx.coordinator.shutdown().await;
}

#[tokio::test]
async fn failing_theory_gets_an_explicit_marker() {
    let fx = Fixture::new(FakeEngine::new(|cmd| {
        if cmd.starts_with("(show-tccs \"t1\"") {
            Some(FakeStep::reply(tcc("t1", "a_TCC1")))
        } else if cmd.starts_with("(show-tccs \"t2\"") {
            Some(FakeStep::reply(
                "<pvserror msg=\"Theory t2 has errors\">\n\"t2 detail\"\n</pvserror>",
            ))
        } else if cmd.starts_with("(show-tccs \"t3\"") {
            Some(FakeStep::reply(tcc("t3", "c_TCC1")))
        } else {
            None
        }
    }));

    let tccs = fx
        .coordinator
        .typecheck_file_and_show_tccs(&fx.request("triple"))
        .await
        .unwrap();
    assert_eq!(tccs.len(), 3);
    assert_eq!(tccs["t1"].tccs[0].id, "a_TCC1");
    assert_eq!(tccs["t3"].tccs[0].id, "c_TCC1");

    let t2 = &tccs["t2"];
    assert!(t2.tccs.is_empty());
    let failure = t2.error.as_ref().unwrap();
    assert_eq!(failure.kind, ErrorKind::EngineReported);
    assert_eq!(failure.message, "Theory t2 has errors");

    assert!(fx.dir.path().join("t1.tccs").exists());
    assert!(!fx.dir.path().join("t2.tccs").exists());
    assert!(fx.dir.path().join("t3.tccs").exists());
    fx.coordinator.shutdown().await;
}

#[tokio::test]
async fn crash_on_second_theory_replaces_the_engine() {
    let fx = Fixture::new(FakeEngine::new(|cmd| {
        if cmd.starts_with("(show-tccs \"foo_th\"") {
            Some(FakeStep::reply(tcc("foo_th", "x_TCC1")))
        } else if cmd.starts_with("(show-tccs \"bar_th\"") {
            Some(vec![
                FakeStep::output("Segmentation violation in show-tccs"),
                FakeStep::NestedPrompt(1),
            ])
        } else {
            None
        }
    }));
    let crashed = fx.manager.acquire(EngineRole::Typechecker).await.unwrap();

    let facade = PvsFacade::new(fx.coordinator.clone());
    let response = facade
        .handle(
            "typecheck-file-and-show-tccs",
            json!({"contextFolder": fx.folder(), "fileName": "foo", "fileExtension": ".pvs"}),
        )
        .await;
    let result = response.result.expect("aggregated result");
    assert_eq!(result["foo_th"]["theoryName"], "foo_th");
    assert_eq!(result["foo_th"]["fileName"], "foo");
    assert_eq!(result["foo_th"]["tccs"].as_array().unwrap().len(), 1);
    assert_eq!(result["bar_th"]["theoryName"], "bar_th");
    assert_eq!(result["bar_th"]["tccs"], json!([]));
    assert!(result["bar_th"]["error"].is_object());

    assert_eq!(crashed.state(), HandleState::Crashed);
    let fresh = fx.manager.current(EngineRole::Typechecker).await.unwrap();
    assert_ne!(fresh.id(), crashed.id());
    assert_eq!(fresh.state(), HandleState::Ready);

    // Later requests run on the replacement
    let launches = fx.launcher.launches();
    fx.coordinator.typecheck_file(&fx.request("foo")).await.unwrap();
    assert_eq!(fx.launcher.launches(), launches);
    let log = fx.launcher.last_log(EngineRole::Typechecker).unwrap();
    assert_eq!(log.count("(typecheck-file"), 1);
    fx.coordinator.shutdown().await;
}

#[tokio::test]
async fn engine_error_then_nested_prompt_is_acknowledged() {
    let fx = Fixture::new(FakeEngine::new(|cmd| {
        cmd.starts_with("(typecheck-file").then(|| {
            vec![
                FakeStep::output(
                    "foo.pvs (line 3, col 14)\nError: Expecting an expression\n\
                     Restart actions (select using :continue):\n 0: Return to Top Level",
                ),
                FakeStep::NestedPrompt(1),
            ]
        })
    }));

    let err = fx
        .coordinator
        .typecheck_file(&fx.request("foo"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::EngineReported);

    let handle = fx.manager.current(EngineRole::Typechecker).await.unwrap();
    assert_eq!(handle.state(), HandleState::Ready);
    let log = fx.launcher.last_log(EngineRole::Typechecker).unwrap();
    assert_eq!(log.count(":reset"), 1);
    fx.coordinator.shutdown().await;
}

#[tokio::test]
async fn shutdown_kills_every_handle() {
    let fx = Fixture::new(FakeEngine::idle());
    let parser = fx.manager.acquire(EngineRole::Parser).await.unwrap();
    let checker = fx.manager.acquire(EngineRole::Typechecker).await.unwrap();

    fx.coordinator.shutdown().await;
    assert_eq!(parser.state(), HandleState::Killed);
    assert_eq!(checker.state(), HandleState::Killed);
    fx.coordinator.shutdown().await;
    assert_eq!(parser.state(), HandleState::Killed);
}
