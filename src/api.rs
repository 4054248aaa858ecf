// HTTP surface over the orchestrator

use std::collections::HashMap;

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::orchestrator::{OperationRequest, Orchestrator, PollStatus, TaskSummary};

/// Build the router; the orchestrator is the only shared state
pub fn router(orchestrator: Orchestrator) -> Router {
    Router::new()
        .route("/api/operations", post(start_operation).get(list_operations))
        .route("/api/operations/:id", get(poll_operation))
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(orchestrator)
}

/// Bind `addr` and serve until the process is stopped
pub async fn serve(orchestrator: Orchestrator, addr: &str) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("API listening on http://{}", listener.local_addr()?);
    axum::serve(listener, router(orchestrator)).await
}

async fn health_check() -> Json<serde_json::Value> {
    Json(json!({ "status": "healthy" }))
}

fn bad_request(message: String) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
}

async fn start_operation(
    State(orchestrator): State<Orchestrator>,
    body: Result<Json<OperationRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match body {
        Ok(body) => body,
        Err(rejection) => return bad_request(rejection.body_text()),
    };

    match orchestrator.start(request) {
        Ok(started) => (StatusCode::ACCEPTED, Json(started)).into_response(),
        Err(e) => {
            warn!(error = %e, "rejected operation request");
            bad_request(e.to_string())
        }
    }
}

async fn poll_operation(
    State(orchestrator): State<Orchestrator>,
    Path(id): Path<String>,
) -> Response {
    let poll = orchestrator.poll(&id);
    let code = if poll.status == PollStatus::NotFound {
        StatusCode::NOT_FOUND
    } else {
        StatusCode::OK
    };
    (code, Json(poll)).into_response()
}

async fn list_operations(
    State(orchestrator): State<Orchestrator>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Vec<TaskSummary>> {
    let tasks = orchestrator.list();
    match params.get("status") {
        Some(wanted) => Json(
            tasks
                .into_iter()
                .filter(|t| t.status.as_str() == wanted)
                .collect(),
        ),
        None => Json(tasks),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::testing::FakeRunner;
    use crate::inventory::{Host, HostRole, InventoryMaterializer, StaticDirectory};
    use crate::orchestrator::{PollResponse, Services, StartResponse, ToolSettings};
    use crate::tasks::{ExecutorConfig, TaskRegistry};
    use axum::body::Body;
    use axum::http::Request;
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    fn orchestrator(dir: &tempfile::TempDir) -> Orchestrator {
        let playbooks = dir.path().join("playbooks");
        std::fs::create_dir_all(&playbooks).unwrap();
        std::fs::write(playbooks.join("cni.yml"), "- hosts: all\n").unwrap();

        let services = Services {
            directory: Arc::new(StaticDirectory::with_hosts(vec![Host::new(
                "cp-1",
                HostRole::ControlPlane,
            )])),
            materializer: InventoryMaterializer::new(dir.path().join("state")),
            runner: Arc::new(FakeRunner::ok().with_delay(Duration::from_millis(50))),
            tool: ToolSettings {
                playbook_dir: playbooks,
                install_command: "true".to_string(),
                uninstall_command: "true".to_string(),
            },
        };
        Orchestrator::new(
            services,
            Arc::new(TaskRegistry::new()),
            ExecutorConfig::default(),
        )
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let dir = tempfile::tempdir().unwrap();
        let response = router(orchestrator(&dir))
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "healthy");
    }

    #[tokio::test]
    async fn test_start_then_poll() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(orchestrator(&dir));

        let response = app
            .clone()
            .oneshot(post_json(
                "/api/operations",
                r#"{"kind":"install-component","params":{"component":"cni"}}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let started: StartResponse = serde_json::from_value(body_json(response).await).unwrap();
        assert_eq!(started.status, PollStatus::Running);
        assert_eq!(started.message, "install-component started");

        let uri = format!("/api/operations/{}", started.task_id);
        let response = app
            .clone()
            .oneshot(Request::get(uri.as_str()).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let poll: PollResponse = serde_json::from_value(body_json(response).await).unwrap();
        assert_eq!(poll.task_id, started.task_id);

        let response = app
            .oneshot(Request::get("/api/operations").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let listed = body_json(response).await;
        assert_eq!(listed.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_task_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let response = router(orchestrator(&dir))
            .oneshot(
                Request::get("/api/operations/does-not-exist")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["status"], "not_found");
    }

    #[tokio::test]
    async fn test_bad_requests_are_400() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(orchestrator(&dir));

        let response = app
            .clone()
            .oneshot(post_json(
                "/api/operations",
                r#"{"kind":"install-addon","params":{}}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_json(response).await["error"]
            .as_str()
            .unwrap()
            .contains("addon"));

        let response = app
            .oneshot(post_json("/api/operations", r#"{"kind":"reboot"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
