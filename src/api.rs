use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::errors::{OrchestratorError, QueueError};
use crate::orchestrator::{Orchestrator, StartOutcome};
use crate::store::models::{ExecutionAttempt, ExecutionMode, NewTask, Project, Task};

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub orchestrator: Orchestrator,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn shared(orchestrator: Orchestrator) -> SharedState {
        Arc::new(Self { orchestrator })
    }
}

// ── Request / response types ──────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateProjectRequest {
    pub name: String,
    pub path: PathBuf,
    pub default_target_branch: Option<String>,
}

#[derive(Deserialize)]
pub struct CreateTaskRequest {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub execution_mode: ExecutionMode,
    pub target_branch: Option<String>,
}

#[derive(Deserialize)]
pub struct ProjectQuery {
    pub project_id: i64,
}

#[derive(Deserialize)]
pub struct ReorderRequest {
    pub new_index: usize,
}

#[derive(Deserialize)]
pub struct ExecutionModeRequest {
    pub execution_mode: ExecutionMode,
}

#[derive(Serialize)]
pub struct TaskDetail {
    #[serde(flatten)]
    pub task: Task,
    pub attempts: Vec<ExecutionAttempt>,
}

#[derive(Serialize)]
pub struct RequeueResponse {
    pub task: Task,
    pub start: StartOutcome,
}

#[derive(Serialize)]
pub struct ResumeResponse {
    pub project: Project,
    pub start: StartOutcome,
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        let message = err.to_string();
        match err {
            OrchestratorError::Queue(QueueError::TaskNotFound { .. })
            | OrchestratorError::Queue(QueueError::ProjectNotFound { .. }) => {
                ApiError::NotFound(message)
            }
            OrchestratorError::Queue(QueueError::Database(e)) | OrchestratorError::Other(e) => {
                error!(error = %format!("{:#}", e), "request failed");
                ApiError::Internal(format!("{:#}", e))
            }
            OrchestratorError::Queue(_)
            | OrchestratorError::Workspace(_)
            | OrchestratorError::NotRunning { .. } => ApiError::Conflict(message),
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/projects", get(list_projects).post(create_project))
        .route("/api/projects/{id}/tasks", post(create_task))
        .route("/api/projects/{id}/queue/resume", post(resume_queue))
        .route("/api/tasks/queue", get(get_queue))
        .route("/api/tasks/queue/history", get(get_queue_history))
        .route("/api/tasks/{id}", get(get_task))
        .route("/api/tasks/{id}/reorder-queue", post(reorder_queue))
        .route("/api/tasks/{id}/enqueue", post(enqueue_task))
        .route("/api/tasks/{id}/dequeue", post(dequeue_task))
        .route("/api/tasks/{id}/execution-mode", post(set_execution_mode))
        .route("/api/tasks/{id}/start", post(start_task))
        .route("/api/tasks/{id}/cancel", post(cancel_task))
        .route("/api/tasks/{id}/requeue", post(requeue_task))
        .route("/health", get(health))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health() -> &'static str {
    "ok"
}

async fn list_projects(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.orchestrator.list_projects().await?))
}

async fn create_project(
    State(state): State<SharedState>,
    Json(req): Json<CreateProjectRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.name.trim().is_empty() {
        return Err(ApiError::BadRequest("Project name must not be empty".into()));
    }
    let project = state
        .orchestrator
        .create_project(&req.name, &req.path, req.default_target_branch.as_deref())
        .await
        .map_err(|e| match e {
            // Path and branch validation failures.
            OrchestratorError::Other(e) => ApiError::BadRequest(format!("{:#}", e)),
            other => other.into(),
        })?;
    Ok((StatusCode::CREATED, Json(project)))
}

async fn create_task(
    State(state): State<SharedState>,
    Path(project_id): Path<i64>,
    Json(req): Json<CreateTaskRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.title.trim().is_empty() {
        return Err(ApiError::BadRequest("Task title must not be empty".into()));
    }
    let task = state
        .orchestrator
        .create_task(NewTask {
            project_id,
            title: req.title,
            description: req.description,
            execution_mode: req.execution_mode,
            target_branch: req.target_branch,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(task)))
}

async fn resume_queue(
    State(state): State<SharedState>,
    Path(project_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let (project, start) = state.orchestrator.resume_queue(project_id).await?;
    Ok(Json(ResumeResponse { project, start }))
}

async fn get_queue(
    State(state): State<SharedState>,
    Query(query): Query<ProjectQuery>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.orchestrator.get_queue(query.project_id).await?))
}

async fn get_queue_history(
    State(state): State<SharedState>,
    Query(query): Query<ProjectQuery>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(
        state.orchestrator.get_queue_history(query.project_id).await?,
    ))
}

async fn get_task(
    State(state): State<SharedState>,
    Path(task_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let task = state.orchestrator.get_task(task_id).await?;
    let attempts = state.orchestrator.list_attempts(task_id).await?;
    Ok(Json(TaskDetail { task, attempts }))
}

async fn reorder_queue(
    State(state): State<SharedState>,
    Path(task_id): Path<i64>,
    Json(req): Json<ReorderRequest>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.orchestrator.reorder(task_id, req.new_index).await?))
}

async fn enqueue_task(
    State(state): State<SharedState>,
    Path(task_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.orchestrator.enqueue(task_id).await?))
}

async fn dequeue_task(
    State(state): State<SharedState>,
    Path(task_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.orchestrator.dequeue(task_id).await?))
}

async fn set_execution_mode(
    State(state): State<SharedState>,
    Path(task_id): Path<i64>,
    Json(req): Json<ExecutionModeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(
        state
            .orchestrator
            .set_execution_mode(task_id, req.execution_mode)
            .await?,
    ))
}

async fn start_task(
    State(state): State<SharedState>,
    Path(task_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let outcome = state.orchestrator.start_task(task_id).await?;
    let status = match outcome {
        StartOutcome::Started { .. } => StatusCode::ACCEPTED,
        _ => StatusCode::OK,
    };
    Ok((status, Json(outcome)))
}

async fn cancel_task(
    State(state): State<SharedState>,
    Path(task_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    state.orchestrator.cancel(task_id)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({"task_id": task_id, "cancelling": true})),
    ))
}

async fn requeue_task(
    State(state): State<SharedState>,
    Path(task_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let (task, start) = state.orchestrator.requeue(task_id).await?;
    Ok(Json(RequeueResponse { task, start }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrunklineConfig;
    use crate::execution::{AgentExit, AgentRunner};
    use crate::test_support::{init_repo, memory_db};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tempfile::{TempDir, tempdir};
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    /// Finishes immediately without touching the workspace.
    struct NoopAgent;

    #[async_trait]
    impl AgentRunner for NoopAgent {
        async fn run(
            &self,
            _task: &Task,
            _working_dir: &std::path::Path,
            _cancel: CancellationToken,
        ) -> anyhow::Result<AgentExit> {
            Ok(AgentExit::Completed)
        }
    }

    struct TestApp {
        repo_dir: TempDir,
        _ws_root: TempDir,
        router: Router,
    }

    fn test_app() -> TestApp {
        let repo_dir = tempdir().unwrap();
        let ws_root = tempdir().unwrap();
        init_repo(repo_dir.path());
        let mut config = TrunklineConfig::with_defaults(repo_dir.path().to_path_buf());
        config.toml.workspace.root = Some(ws_root.path().to_path_buf());
        let orchestrator = Orchestrator::new(memory_db(), &config, Arc::new(NoopAgent));
        TestApp {
            repo_dir,
            _ws_root: ws_root,
            router: api_router().with_state(AppState::shared(orchestrator)),
        }
    }

    async fn body_json<T: serde::de::DeserializeOwned>(body: Body) -> T {
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn post_empty(uri: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    impl TestApp {
        async fn create_project(&self) -> Project {
            let response = self
                .router
                .clone()
                .oneshot(post_json(
                    "/api/projects",
                    serde_json::json!({"name": "demo", "path": self.repo_dir.path()}),
                ))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::CREATED);
            body_json(response.into_body()).await
        }

        async fn create_task(&self, project_id: i64, title: &str, mode: &str) -> Task {
            let response = self
                .router
                .clone()
                .oneshot(post_json(
                    &format!("/api/projects/{}/tasks", project_id),
                    serde_json::json!({"title": title, "execution_mode": mode}),
                ))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::CREATED);
            body_json(response.into_body()).await
        }

        async fn queue_ids(&self, project_id: i64) -> Vec<i64> {
            let response = self
                .router
                .clone()
                .oneshot(get(&format!("/api/tasks/queue?project_id={}", project_id)))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            let tasks: Vec<Task> = body_json(response.into_body()).await;
            tasks.into_iter().map(|t| t.id).collect()
        }
    }

    #[tokio::test]
    async fn test_health_check() {
        let app = test_app();
        let response = app.router.oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn test_create_and_list_projects() {
        let app = test_app();
        let project = app.create_project().await;
        assert_eq!(project.name, "demo");
        assert_eq!(project.default_target_branch, "main");
        assert!(!project.queue_halted);

        let response = app.router.clone().oneshot(get("/api/projects")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let projects: Vec<Project> = body_json(response.into_body()).await;
        assert_eq!(projects.len(), 1);
    }

    #[tokio::test]
    async fn test_create_project_rejects_non_repository() {
        let app = test_app();
        let plain = tempdir().unwrap();
        let response = app
            .router
            .oneshot(post_json(
                "/api/projects",
                serde_json::json!({"name": "nope", "path": plain.path()}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn test_sequential_tasks_join_queue_and_reorder() {
        let app = test_app();
        let project = app.create_project().await;
        let a = app.create_task(project.id, "Alpha", "sequential").await;
        let b = app.create_task(project.id, "Beta", "sequential").await;
        let p = app.create_task(project.id, "Side quest", "parallel").await;
        assert!(a.queue_position.is_some());
        assert!(p.queue_position.is_none());
        assert_eq!(app.queue_ids(project.id).await, vec![a.id, b.id]);

        let response = app
            .router
            .clone()
            .oneshot(post_json(
                &format!("/api/tasks/{}/reorder-queue", b.id),
                serde_json::json!({"new_index": 0}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let reordered: Vec<Task> = body_json(response.into_body()).await;
        assert_eq!(reordered.iter().map(|t| t.id).collect::<Vec<_>>(), vec![b.id, a.id]);
        assert_eq!(app.queue_ids(project.id).await, vec![b.id, a.id]);
    }

    #[tokio::test]
    async fn test_dequeue_and_enqueue_round_the_tail() {
        let app = test_app();
        let project = app.create_project().await;
        let a = app.create_task(project.id, "Alpha", "sequential").await;
        let b = app.create_task(project.id, "Beta", "sequential").await;

        let response = app
            .router
            .clone()
            .oneshot(post_empty(&format!("/api/tasks/{}/dequeue", a.id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let dequeued: Task = body_json(response.into_body()).await;
        assert!(dequeued.queue_position.is_none());
        assert_eq!(app.queue_ids(project.id).await, vec![b.id]);

        let response = app
            .router
            .clone()
            .oneshot(post_empty(&format!("/api/tasks/{}/enqueue", a.id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(app.queue_ids(project.id).await, vec![b.id, a.id]);
    }

    #[tokio::test]
    async fn test_execution_mode_switch_moves_task_into_queue() {
        let app = test_app();
        let project = app.create_project().await;
        let task = app.create_task(project.id, "Later", "parallel").await;

        let response = app
            .router
            .clone()
            .oneshot(post_json(
                &format!("/api/tasks/{}/execution-mode", task.id),
                serde_json::json!({"execution_mode": "sequential"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let updated: Task = body_json(response.into_body()).await;
        assert_eq!(updated.execution_mode, ExecutionMode::Sequential);
        assert_eq!(app.queue_ids(project.id).await, vec![task.id]);
    }

    #[tokio::test]
    async fn test_start_non_head_reports_queued() {
        let app = test_app();
        let project = app.create_project().await;
        let a = app.create_task(project.id, "Alpha", "sequential").await;
        let b = app.create_task(project.id, "Beta", "sequential").await;

        let response = app
            .router
            .clone()
            .oneshot(post_empty(&format!("/api/tasks/{}/start", b.id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(body["status"], "queued");
        assert_eq!(body["why"]["reason"], "not_head");
        assert_eq!(body["why"]["head"], a.id);
    }

    #[tokio::test]
    async fn test_get_task_includes_attempts() {
        let app = test_app();
        let project = app.create_project().await;
        let task = app.create_task(project.id, "Alpha", "parallel").await;

        let response = app
            .router
            .clone()
            .oneshot(get(&format!("/api/tasks/{}", task.id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(body["id"], task.id);
        assert_eq!(body["title"], "Alpha");
        assert!(body["attempts"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_task_is_not_found() {
        let app = test_app();
        let response = app.router.oneshot(post_empty("/api/tasks/999/enqueue")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_cancel_idle_task_conflicts() {
        let app = test_app();
        let project = app.create_project().await;
        let task = app.create_task(project.id, "Alpha", "sequential").await;
        let response = app
            .router
            .clone()
            .oneshot(post_empty(&format!("/api/tasks/{}/cancel", task.id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_queue_requires_project_id() {
        let app = test_app();
        let response = app.router.oneshot(get("/api/tasks/queue")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_resume_idle_queue() {
        let app = test_app();
        let project = app.create_project().await;
        let response = app
            .router
            .clone()
            .oneshot(post_empty(&format!("/api/projects/{}/queue/resume", project.id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(body["project"]["queue_halted"], false);
        assert_eq!(body["start"]["status"], "idle");
    }
}
