// XML-RPC over HTTP

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::Router;
use pvsbridge_engine::xmlrpc::handle_xmlrpc;
use pvsbridge_engine::{EngineConfig, PvsFacade};
use tokio::net::TcpListener;
use tracing::{info, warn};

use super::{build_facade, Command};
use crate::error::{CliError, CliResult};

/// `POST <path>` answering `pvs.request`
pub fn xmlrpc_router(facade: Arc<PvsFacade>, path: &str) -> Router {
    let path = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    };
    Router::new()
        .route(&path, post(xmlrpc_endpoint))
        .with_state(facade)
}

async fn xmlrpc_endpoint(State(facade): State<Arc<PvsFacade>>, body: String) -> impl IntoResponse {
    let reply = handle_xmlrpc(&facade, &body).await;
    ([(header::CONTENT_TYPE, "text/xml")], reply)
}

pub struct XmlRpcCommand {
    config: EngineConfig,
    host: Option<String>,
    port: Option<u16>,
}

impl XmlRpcCommand {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            host: None,
            port: None,
        }
    }

    pub fn with_host(mut self, host: Option<String>) -> Self {
        self.host = host;
        self
    }

    pub fn with_port(mut self, port: Option<u16>) -> Self {
        self.port = port;
        self
    }

    pub fn bind_address(&self) -> String {
        let host = self.host.as_deref().unwrap_or(&self.config.xmlrpc.host);
        let port = self.port.unwrap_or(self.config.xmlrpc.server_port);
        format!("{host}:{port}")
    }
}

#[async_trait]
impl Command for XmlRpcCommand {
    async fn execute(&self) -> CliResult<()> {
        let facade = build_facade(&self.config);
        let router = xmlrpc_router(facade.clone(), &self.config.xmlrpc.path);
        let address = self.bind_address();
        let listener = TcpListener::bind(&address).await?;
        info!(address = %address, path = %self.config.xmlrpc.path, "Serving XML-RPC");

        let served = axum::serve(listener, router)
            .with_graceful_shutdown(async {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupted, shutting down");
                }
            })
            .await;
        facade.shutdown().await;
        served.map_err(|e| CliError::Server(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use pvsbridge_engine::fake::{FakeEngine, FakeLauncher};
    use pvsbridge_engine::{EngineManager, HandleSettings, WorkspaceCoordinator};
    use tower::ServiceExt;

    fn facade() -> Arc<PvsFacade> {
        let launcher = Arc::new(FakeLauncher::new(FakeEngine::idle()));
        let manager = Arc::new(EngineManager::new(launcher, HandleSettings::default()));
        Arc::new(PvsFacade::new(Arc::new(WorkspaceCoordinator::new(manager, "", 2))))
    }

    fn call(envelope: &str) -> String {
        format!(
            "<?xml version=\"1.0\"?><methodCall><methodName>pvs.request</methodName>\
             <params><param><value><string>{envelope}</string></value></param></params></methodCall>"
        )
    }

    async fn post_body(router: Router, path: &str, body: String) -> (StatusCode, String) {
        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(path)
                    .header(header::CONTENT_TYPE, "text/xml")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_list_methods_over_http() {
        let router = xmlrpc_router(facade(), "/RPC2");
        let (status, body) = post_body(
            router,
            "/RPC2",
            call(r#"{"jsonrpc":"2.0","method":"list-methods","id":"7"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("<methodResponse>"));
        assert!(body.contains("jsonrpc_result"));
        assert!(body.contains("change-context"));
    }

    #[tokio::test]
    async fn test_malformed_xml_is_a_fault() {
        let router = xmlrpc_router(facade(), "RPC2");
        let (status, body) = post_body(router, "/RPC2", "<methodCall>".to_string()).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("<fault>"));
    }

    #[test]
    fn test_bind_address() {
        let command = XmlRpcCommand::new(EngineConfig::default());
        assert_eq!(command.bind_address(), "127.0.0.1:22334");
        let command = command.with_host(Some("0.0.0.0".into())).with_port(Some(8080));
        assert_eq!(command.bind_address(), "0.0.0.0:8080");
    }
}
