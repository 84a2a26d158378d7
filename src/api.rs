//! HTTP surface: task CRUD, lifecycle actions, and the per-task WebSocket.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use serde::Deserialize;
use tokio::sync::broadcast;
use tokio::time::Instant;
use uuid::Uuid;

use crate::db::DbHandle;
use crate::errors::TaskError;
use crate::models::{LogLevel, Repository, Task, TaskType};
use crate::notify::NotificationBridge;
use crate::queue::{EnqueueOptions, JobQueue};

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
    pub queue: JobQueue,
    pub bridge: Arc<NotificationBridge>,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateTaskRequest {
    pub title: String,
    pub description: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub repository: Repository,
    pub owner: Option<String>,
    pub priority: Option<i64>,
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<TaskError> for ApiError {
    fn from(err: TaskError) -> Self {
        match err {
            TaskError::Validation(msg) => ApiError::BadRequest(msg),
            TaskError::TaskNotFound { .. } | TaskError::StageNotFound { .. } => {
                ApiError::NotFound(err.to_string())
            }
            TaskError::InvalidState { .. } => ApiError::BadRequest(err.to_string()),
            TaskError::Stage { .. } | TaskError::Infrastructure(_) => {
                ApiError::Internal(err.to_string())
            }
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err.to_string())
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/tasks", get(list_tasks).post(create_task))
        .route("/api/tasks/{id}", get(get_task))
        .route("/api/tasks/{id}/logs", get(get_task_logs))
        .route("/api/tasks/{id}/cancel", post(cancel_task))
        .route("/api/tasks/{id}/retry", post(retry_task))
        .route("/api/tasks/{id}/ws", get(task_ws))
        .route("/health", get(health_check))
}

fn parse_id(id: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(id).map_err(|_| ApiError::BadRequest(format!("Invalid task id: {}", id)))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn create_task(
    State(state): State<SharedState>,
    Json(req): Json<CreateTaskRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.title.trim().is_empty() {
        return Err(ApiError::BadRequest("Title is required".into()));
    }
    if req.description.trim().is_empty() {
        return Err(ApiError::BadRequest("Description is required".into()));
    }

    let mut task = Task::new(
        req.title.trim(),
        req.description.trim(),
        req.task_type,
        req.repository,
        req.owner.unwrap_or_else(|| "anonymous".to_string()),
    );
    let entry = task.push_log(LogLevel::Info, "Task created successfully", None);

    let task_id = task.id;
    let snapshot = task.clone();
    state
        .db
        .call(move |db| {
            db.save_task(&snapshot)?;
            db.append_log(task_id, &entry)
        })
        .await?;

    let opts = EnqueueOptions {
        priority: req.priority.unwrap_or(1),
        ..EnqueueOptions::default()
    };
    state.queue.enqueue(task_id, opts).await?;
    tracing::info!(%task_id, title = %task.title, "Task created and enqueued");

    Ok((StatusCode::CREATED, Json(task)))
}

async fn list_tasks(State(state): State<SharedState>) -> Result<Json<Vec<Task>>, ApiError> {
    let tasks = state.db.call(|db| db.list_tasks()).await?;
    Ok(Json(tasks))
}

async fn get_task(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<Task>, ApiError> {
    let id = parse_id(&id)?;
    let task = state
        .db
        .call(move |db| db.load_task(id))
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Task {} not found", id)))?;
    Ok(Json(task))
}

async fn get_task_logs(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let id = parse_id(&id)?;
    let task = state
        .db
        .call(move |db| db.load_task(id))
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Task {} not found", id)))?;
    Ok(Json(task.logs).into_response())
}

async fn cancel_task(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<Task>, ApiError> {
    let id = parse_id(&id)?;
    let task = state
        .db
        .call(move |db| {
            let mut task = match db.load_task(id)? {
                Some(task) => task,
                None => return Ok(Err(TaskError::TaskNotFound { id })),
            };
            match task.cancel() {
                Ok(()) => {}
                Err(e) => return Ok(Err(e)),
            }
            db.save_task(&task)?;
            if let Some(entry) = task.logs.last() {
                db.append_log(id, entry)?;
            }
            Ok(Ok(task))
        })
        .await?
        .map_err(ApiError::from)?;
    tracing::info!(task_id = %id, "Task cancelled");
    Ok(Json(task))
}

async fn retry_task(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<Task>, ApiError> {
    let id = parse_id(&id)?;
    let task = state
        .db
        .call(move |db| {
            let mut task = match db.load_task(id)? {
                Some(task) => task,
                None => return Ok(Err(TaskError::TaskNotFound { id })),
            };
            match task.reset_for_retry() {
                Ok(()) => {}
                Err(e) => return Ok(Err(e)),
            }
            let entry = task.push_log(LogLevel::Info, "Task retry initiated", None);
            db.save_task(&task)?;
            db.append_log(id, &entry)?;
            Ok(Ok(task))
        })
        .await?
        .map_err(ApiError::from)?;

    state.queue.enqueue(id, EnqueueOptions::default()).await?;
    tracing::info!(task_id = %id, "Task retry enqueued");
    Ok(Json(task))
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

// ── WebSocket ─────────────────────────────────────────────────────────

async fn task_ws(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let id = parse_id(&id)?;
    // Subscription does not require the task to exist yet; a client may
    // join the room before the create call lands.
    let rx = state.bridge.subscribe(id);
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, rx)))
}

async fn handle_socket(socket: WebSocket, rx: broadcast::Receiver<String>) {
    let (sender, receiver) = socket.split();
    run_socket_loop(sender, receiver, rx).await;
}

/// Core WebSocket loop with ping/pong keepalive.
///
/// Combines room forwarding, client message receiving, and periodic
/// ping/pong health checking into a single select loop. If no Pong is
/// received within [`PONG_TIMEOUT`] after a Ping is sent, the connection
/// is considered dead and the loop exits.
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut rx: broadcast::Receiver<String>,
) {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // The first tick completes immediately; consume it so the first real
    // ping fires after PING_INTERVAL has elapsed.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    break;
                }
                if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            result = rx.recv() => {
                match result {
                    Ok(msg) => {
                        if sender.send(Message::Text(msg.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        // Missed some events; continue receiving
                        continue;
                    }
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {
                        // Ignore other client messages (Text, Binary, Ping)
                    }
                    Some(Err(_)) => break,
                }
            }
        }
    }

    // Best-effort close frame
    let _ = sender.send(Message::Close(None)).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_error_maps_to_status_codes() {
        let bad = ApiError::from(TaskError::Validation("Title is required".into()));
        assert!(matches!(bad, ApiError::BadRequest(_)));

        let missing = ApiError::from(TaskError::TaskNotFound { id: Uuid::new_v4() });
        assert!(matches!(missing, ApiError::NotFound(_)));

        let invalid = ApiError::from(TaskError::InvalidState {
            action: "retry",
            status: crate::models::TaskStatus::Completed,
        });
        assert!(matches!(invalid, ApiError::BadRequest(_)));

        let infra = ApiError::from(TaskError::Infrastructure(anyhow::anyhow!("db gone")));
        assert!(matches!(infra, ApiError::Internal(_)));
    }

    #[test]
    fn test_parse_id_rejects_garbage() {
        assert!(parse_id("not-a-uuid").is_err());
        assert!(parse_id(&Uuid::new_v4().to_string()).is_ok());
    }

    #[test]
    fn test_keepalive_constants() {
        // PONG_TIMEOUT must exceed PING_INTERVAL so a fresh connection is
        // not declared dead before its first pong.
        assert!(PONG_TIMEOUT > PING_INTERVAL);
    }

    #[test]
    fn test_create_request_accepts_kebab_case_type() {
        let req: CreateTaskRequest = serde_json::from_str(
            r#"{
                "title": "Fix login",
                "description": "Login crashes on empty password",
                "type": "fix-bug",
                "repository": {
                    "url": "https://github.com/acme/widgets",
                    "owner": "acme",
                    "name": "widgets",
                    "branch": null
                }
            }"#,
        )
        .unwrap();
        assert_eq!(req.task_type, TaskType::FixBug);
        assert!(req.owner.is_none());
        assert!(req.priority.is_none());
    }
}
