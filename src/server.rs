//! Server assembly: config, router, worker pool, and graceful shutdown.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tower_http::cors::CorsLayer;

use crate::api::{AppState, SharedState, api_router};
use crate::db::{DbHandle, TaskStore};
use crate::notify::NotificationBridge;
use crate::pipeline::PipelineDriver;
use crate::providers::Providers;
use crate::queue::JobQueue;
use crate::worker::WorkerPool;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub db_path: PathBuf,
    pub workers: usize,
    /// Permissive CORS for local frontend development.
    pub dev_mode: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            db_path: PathBuf::from("conveyor.db"),
            workers: 2,
            dev_mode: false,
        }
    }
}

/// Build the application router around the shared state.
pub fn build_router(state: SharedState, dev_mode: bool) -> axum::Router {
    let router = api_router().with_state(state);
    if dev_mode {
        router.layer(CorsLayer::permissive())
    } else {
        router
    }
}

/// Open the database, assemble the state, spawn the worker pool, and serve
/// until ctrl-c.
pub async fn start_server(config: ServerConfig) -> Result<()> {
    let store = TaskStore::new(&config.db_path)
        .with_context(|| format!("Failed to open database at {}", config.db_path.display()))?;
    let db = DbHandle::new(store);
    let bridge = Arc::new(NotificationBridge::new());
    let queue = JobQueue::new(db.clone());
    let driver = Arc::new(PipelineDriver::new(
        db.clone(),
        bridge.clone(),
        Providers::simulated(),
    ));

    let pool = Arc::new(WorkerPool::new(
        db.clone(),
        queue.clone(),
        driver,
        bridge.clone(),
        config.workers,
    ));
    let released = pool.sweep_stale_now().await?;
    if released > 0 {
        tracing::warn!(released, "Recovered jobs from a previous run");
    }
    pool.spawn();

    let state: SharedState = Arc::new(AppState { db, queue, bridge });
    let app = build_router(state, config.dev_mode);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    tracing::info!(
        port = config.port,
        workers = config.workers,
        db = %config.db_path.display(),
        "Server listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
    tracing::info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::util::ServiceExt;

    fn test_state() -> SharedState {
        let db = DbHandle::new(TaskStore::new_in_memory().expect("in-memory db"));
        let bridge = Arc::new(NotificationBridge::new());
        let queue = JobQueue::new(db.clone());
        Arc::new(AppState { db, queue, bridge })
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn create_body() -> Body {
        Body::from(
            serde_json::json!({
                "title": "Fix login",
                "description": "Login crashes on empty password",
                "type": "fix-bug",
                "repository": {
                    "url": "https://github.com/acme/widgets",
                    "owner": "acme",
                    "name": "widgets",
                    "branch": "main"
                }
            })
            .to_string(),
        )
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let app = build_router(test_state(), false);
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn test_create_task_returns_created_with_pending_stages() {
        let app = build_router(test_state(), false);
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/tasks")
                    .header("content-type", "application/json")
                    .body(create_body())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let json = body_json(response).await;
        assert_eq!(json["status"], "pending");
        assert_eq!(json["progress"], 0);
        assert_eq!(json["owner"], "anonymous");
        assert_eq!(json["stages"].as_array().unwrap().len(), 6);
        assert_eq!(json["logs"][0]["message"], "Task created successfully");
    }

    #[tokio::test]
    async fn test_create_task_validates_title() {
        let app = build_router(test_state(), false);
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/tasks")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        serde_json::json!({
                            "title": "  ",
                            "description": "something",
                            "type": "custom",
                            "repository": {
                                "url": "u", "owner": "o", "name": "n", "branch": null
                            }
                        })
                        .to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert_eq!(json["error"], "Title is required");
    }

    #[tokio::test]
    async fn test_get_missing_task_is_404() {
        let app = build_router(test_state(), false);
        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/api/tasks/{}", uuid::Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_cancel_pending_task_then_retry_rejected_until_failed() {
        let state = test_state();
        let app = build_router(state.clone(), false);

        let created = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/tasks")
                    .header("content-type", "application/json")
                    .body(create_body())
                    .unwrap(),
            )
            .await
            .unwrap();
        let id = body_json(created).await["id"].as_str().unwrap().to_string();

        // Cancel moves the task to failed.
        let cancelled = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/api/tasks/{}/cancel", id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(cancelled.status(), StatusCode::OK);
        let json = body_json(cancelled).await;
        assert_eq!(json["status"], "failed");

        // Cancelling again is an invalid state transition.
        let again = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/api/tasks/{}/cancel", id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(again.status(), StatusCode::BAD_REQUEST);

        // Retry from failed succeeds and resets the record.
        let retried = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/api/tasks/{}/retry", id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(retried.status(), StatusCode::OK);
        let json = body_json(retried).await;
        assert_eq!(json["status"], "pending");
        assert_eq!(json["progress"], 0);

        // Retry of a non-failed task is rejected.
        let rejected = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/api/tasks/{}/retry", id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(rejected.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_list_tasks_omits_logs() {
        let state = test_state();
        let app = build_router(state, false);
        let _ = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/tasks")
                    .header("content-type", "application/json")
                    .body(create_body())
                    .unwrap(),
            )
            .await
            .unwrap();

        let response = app
            .oneshot(Request::builder().uri("/api/tasks").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        let tasks = json.as_array().unwrap();
        assert_eq!(tasks.len(), 1);
        assert!(tasks[0]["logs"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_logs_endpoint_returns_entries() {
        let state = test_state();
        let app = build_router(state, false);
        let created = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/tasks")
                    .header("content-type", "application/json")
                    .body(create_body())
                    .unwrap(),
            )
            .await
            .unwrap();
        let id = body_json(created).await["id"].as_str().unwrap().to_string();

        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/api/tasks/{}/logs", id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json[0]["message"], "Task created successfully");
        assert_eq!(json[0]["level"], "info");
    }

    #[tokio::test]
    async fn test_invalid_uuid_is_bad_request() {
        let app = build_router(test_state(), false);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/tasks/not-a-uuid")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
