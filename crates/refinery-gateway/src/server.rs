use std::sync::Arc;

use axum::routing::{get, patch, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;

use refinery_core::config::GatewayConfig;
use refinery_engine::WorkflowService;

use crate::routes;
use crate::state::AppState;

/// HTTP gateway over the workflow service, built on axum.
pub struct GatewayServer {
    config: GatewayConfig,
    service: Arc<WorkflowService>,
}

impl GatewayServer {
    pub fn new(config: GatewayConfig, service: Arc<WorkflowService>) -> Self {
        Self { config, service }
    }

    pub fn router(&self) -> Router {
        let state = Arc::new(AppState {
            service: self.service.clone(),
        });

        Router::new()
            .route("/api/health", get(routes::health))
            // Graph
            .route("/api/graph", get(routes::graph))
            .route("/api/agents", get(routes::list_agents))
            .route("/api/connections", post(routes::create_connection))
            .route(
                "/api/connections/{id}",
                patch(routes::update_connection).delete(routes::delete_connection),
            )
            // Executions
            .route("/api/executions", post(routes::start_execution))
            .route("/api/executions/{id}", get(routes::execution_status))
            .route("/api/executions/{id}/cancel", post(routes::cancel_execution))
            .layer(CorsLayer::permissive())
            .with_state(state)
    }

    /// Run the gateway server until the cancellation token is triggered.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let app = self.router();

        let listener = TcpListener::bind(&self.config.bind).await?;
        info!(bind = %self.config.bind, "Gateway listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        info!("Gateway shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use refinery_core::traits::WorkflowStore;
    use refinery_engine::WorkflowRuntime;
    use refinery_store::SqliteStore;
    use refinery_test_utils::{agent, connection, test_config, MockProcessor};

    async fn app(agents: &[&str], edges: &[(&str, &str)]) -> Router {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        for name in agents {
            store.upsert_agent(agent(name)).await.unwrap();
        }
        for (s, t) in edges {
            store.create_connection(connection(s, t)).await.unwrap();
        }
        // Workers are not started: executions stay pending
        let runtime = WorkflowRuntime::new(test_config(), store, Arc::new(MockProcessor::new()));
        GatewayServer::new(GatewayConfig::default(), runtime.service()).router()
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(b) => builder
                .header("content-type", "application/json")
                .body(Body::from(b.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn test_health() {
        let app = app(&[], &[]).await;
        let (status, body) = send(&app, "GET", "/api/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_graph_view() {
        let app = app(&["a", "b", "c"], &[("a", "b"), ("a", "c")]).await;
        let (status, body) = send(&app, "GET", "/api/graph", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["is_valid"], true);
        assert_eq!(body["nodes"].as_array().unwrap().len(), 3);
        assert_eq!(body["edges"].as_array().unwrap().len(), 2);
        let b = body["nodes"]
            .as_array()
            .unwrap()
            .iter()
            .find(|n| n["id"] == "b")
            .unwrap();
        assert_eq!(b["level"], 1);
        assert_eq!(b["inputs"], json!(["a"]));
    }

    #[tokio::test]
    async fn test_connection_lifecycle() {
        let app = app(&["a", "b"], &[]).await;

        let (status, body) = send(
            &app,
            "POST",
            "/api/connections",
            Some(json!({ "source": "a", "target": "b" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let id = body["id"].as_str().unwrap().to_string();

        let (status, _) = send(
            &app,
            "POST",
            "/api/connections",
            Some(json!({ "source": "b", "target": "b" })),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        let (status, _) = send(
            &app,
            "PATCH",
            &format!("/api/connections/{id}"),
            Some(json!({ "is_active": false })),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let uri = format!("/api/connections/{id}");
        assert_eq!(send(&app, "DELETE", &uri, None).await.0, StatusCode::NO_CONTENT);
        assert_eq!(send(&app, "DELETE", &uri, None).await.0, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_cyclic_graph_rejects_start() {
        let app = app(&["a", "b"], &[("a", "b"), ("b", "a")]).await;
        let (status, body) = send(
            &app,
            "POST",
            "/api/executions",
            Some(json!({ "cv_id": "cv", "document": "doc" })),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"], "graph contains a cycle");
    }

    #[tokio::test]
    async fn test_execution_status_and_cancel() {
        let app = app(&["a", "b"], &[("a", "b")]).await;

        let (status, body) = send(
            &app,
            "POST",
            "/api/executions",
            Some(json!({ "cv_id": "cv", "document": "doc" })),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let id = body["execution_id"].as_str().unwrap().to_string();

        let (status, body) = send(&app, "GET", &format!("/api/executions/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "pending");
        assert_eq!(body["progress"]["total"], 2);

        let cancel = format!("/api/executions/{id}/cancel");
        let (status, body) = send(&app, "POST", &cancel, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["skipped_steps"], 2);

        let (status, _) = send(&app, "POST", &cancel, None).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = send(&app, "GET", "/api/executions/missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
