//! A client session over the framed stdio transport.

use std::collections::HashMap;
use std::sync::Arc;

use pvsbridge_engine::fake::{FakeEngine, FakeLauncher, FakeStep};
use pvsbridge_engine::rpc::{serve, MessageReader, MessageWriter};
use pvsbridge_engine::{
    EngineManager, HandleSettings, JsonRpcResponse, PvsFacade, WorkspaceCoordinator,
};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn facade() -> Arc<PvsFacade> {
    let engine = FakeEngine::new(|cmd| {
        if cmd.starts_with("(typecheck-file \"bad\"") {
            Some(FakeStep::reply(
                "<pvserror msg=\"Expecting an expression\">\n\"bad.pvs (line 2, col 7)\"\n</pvserror>",
            ))
        } else if cmd == "(+ 20 22)" {
            Some(FakeStep::reply("42"))
        } else {
            None
        }
    });
    let manager = Arc::new(EngineManager::new(
        Arc::new(FakeLauncher::new(engine)),
        HandleSettings::default(),
    ));
    Arc::new(PvsFacade::new(Arc::new(WorkspaceCoordinator::new(manager, "", 2))))
}

#[tokio::test]
async fn editor_session_over_stdio_framing() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("good.pvs"), "good: THEORY BEGIN END good\n").unwrap();
    std::fs::write(dir.path().join("bad.pvs"), "bad: THEORY BEGIN\n x: = END bad\n").unwrap();
    let folder = dir.path().to_string_lossy().to_string();

    let (client, server) = tokio::io::duplex(64 * 1024);
    let (server_read, server_write) = tokio::io::split(server);
    let (client_read, client_write) = tokio::io::split(client);
    let server = tokio::spawn(serve(
        facade(),
        server_read,
        server_write,
        CancellationToken::new(),
    ));

    let mut writer = MessageWriter::new(client_write);
    let mut reader = MessageReader::new(client_read);
    let requests = [
        json!({"jsonrpc": "2.0", "id": 1, "method": "change-context", "params": [folder]}),
        json!({"jsonrpc": "2.0", "id": 2, "method": "typecheck", "params": [{"contextFolder": folder, "fileName": "good", "fileExtension": ".pvs"}]}),
        json!({"jsonrpc": "2.0", "id": 3, "method": "typecheck", "params": {"contextFolder": folder, "fileName": "bad", "fileExtension": ".pvs"}}),
        json!({"jsonrpc": "2.0", "id": 4, "method": "lisp", "params": ["(+ 20 22)"]}),
        json!({"jsonrpc": "2.0", "id": 5, "method": "parse", "params": {"contextFolder": folder, "fileName": "missing"}}),
        json!({"jsonrpc": "2.0", "method": "status"}),
    ];
    for request in &requests {
        writer.write_message(&request.to_string()).await.unwrap();
    }

    let mut responses: HashMap<i64, JsonRpcResponse> = HashMap::new();
    while responses.len() < 5 {
        let body = reader.read_message().await.unwrap().expect("response");
        let response: JsonRpcResponse = serde_json::from_str(&body).unwrap();
        responses.insert(response.id.as_i64().unwrap(), response);
    }

    assert!(responses[&1].error.is_none());
    assert!(responses[&2].error.is_none());

    let bad = responses[&3].error.as_ref().unwrap();
    assert_eq!(bad.code, -32001);
    assert_eq!(bad.message, "Expecting an expression");
    assert_eq!(bad.data.as_ref().unwrap()["line"], 2);

    assert_eq!(responses[&4].result, Some(Value::String("42".into())));
    assert_eq!(responses[&5].error.as_ref().unwrap().code, -32003);

    writer
        .write_message(&json!({"jsonrpc": "2.0", "id": 6, "method": "shutdown"}).to_string())
        .await
        .unwrap();
    let body = reader.read_message().await.unwrap().unwrap();
    let response: JsonRpcResponse = serde_json::from_str(&body).unwrap();
    assert_eq!(response.id, json!(6));
    assert_eq!(response.result, Some(Value::Null));

    writer
        .write_message(&json!({"jsonrpc": "2.0", "method": "exit"}).to_string())
        .await
        .unwrap();
    server.await.unwrap().unwrap();
    assert!(reader.read_message().await.unwrap().is_none());
}
