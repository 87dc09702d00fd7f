//! HTTP route handlers.

use std::sync::Arc;
use std::time::Duration;

use axum::middleware;
use axum::{
    extract::{DefaultBodyLimit, Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        Json,
    },
    routing::{delete, get, post},
    Router,
};
use futures::stream::Stream;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::config::Config;
use crate::handoff::HandoffStore;
use crate::overlay::Overlay;
use crate::storage::{validate_path, BlobStore, LocalBlobStore};
use crate::task::store::{create_task_store, NewTask, StoreError, TaskStore};
use crate::task::TaskRecord;
use crate::transform::OpenAiImageEditor;
use crate::trigger::{recover_interrupted, spawn_dispatcher, TaskProcessor};
use crate::util::is_valid_id;

use super::admin;
use super::auth;
use super::blobs;
use super::handoff as handoff_api;
use super::types::*;

/// Largest accepted photo upload.
const UPLOAD_BODY_LIMIT: usize = 25 * 1024 * 1024;

const STREAM_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Shared application state.
pub struct AppState {
    pub config: Config,
    /// Task records
    pub tasks: Arc<dyn TaskStore>,
    /// Input photos and generated results
    pub blobs: Arc<dyn BlobStore>,
    /// QR handoff payloads
    pub handoff: HandoffStore,
}

impl AppState {
    pub fn new(config: Config, tasks: Arc<dyn TaskStore>, blobs: Arc<dyn BlobStore>) -> Self {
        let handoff = HandoffStore::new(config.handoff_ttl, config.handoff_max_bytes);
        Self {
            config,
            tasks,
            blobs,
            handoff,
        }
    }
}

/// Build the application router.
pub fn router(state: Arc<AppState>) -> Router {
    let upload_route = Router::new()
        .route("/api/uploads", post(blobs::upload))
        .layer(DefaultBodyLimit::max(UPLOAD_BODY_LIMIT));

    let handoff_route = Router::new()
        .route("/api/handoff", post(handoff_api::create))
        .layer(DefaultBodyLimit::max(state.config.handoff_max_bytes + 64 * 1024));

    let public_routes = Router::new()
        .route("/api/health", get(health))
        .route("/api/auth/login", post(auth::login))
        .route("/api/tasks", post(create_task))
        .route("/api/tasks/:id", get(get_task))
        .route("/api/tasks/:id/stream", get(stream_task))
        .route("/api/handoff/:id", get(handoff_api::get))
        .route("/v0/b/:bucket/o/*object", get(blobs::download))
        .merge(upload_route)
        .merge(handoff_route);

    let admin_routes = Router::new()
        .route("/api/admin/tasks", get(admin::list_tasks))
        .route("/api/admin/tasks/:id", delete(admin::delete_task))
        .route("/api/admin/stats", get(admin::get_stats))
        .route("/api/admin/export", get(admin::export))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            auth::require_auth,
        ));

    Router::new()
        .merge(public_routes)
        .merge(admin_routes)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let tasks: Arc<dyn TaskStore> =
        Arc::from(create_task_store(config.task_store, config.data_dir.clone()).await?);
    tracing::info!(
        backend = config.task_store.as_str(),
        persistent = tasks.is_persistent(),
        "Task store ready"
    );

    let blobs: Arc<dyn BlobStore> = Arc::new(
        LocalBlobStore::new(config.data_dir.join("blobs"), &config.storage_bucket).await?,
    );

    let overlay = Overlay::from(&config.overlay);
    if !overlay.asset_path().exists() {
        tracing::warn!(
            asset = %overlay.asset_path().display(),
            "Watermark asset not found, results will be stored without it"
        );
    }

    let processor = Arc::new(TaskProcessor::new(
        Arc::clone(&tasks),
        Arc::clone(&blobs),
        Arc::new(OpenAiImageEditor::new(config.transform.clone())),
        overlay,
        config.public_base_url.clone(),
    ));

    let dispatcher = spawn_dispatcher(Arc::clone(&processor), tasks.subscribe());
    recover_interrupted(tasks.as_ref(), &processor).await?;

    let state = Arc::new(AppState::new(config.clone(), tasks, blobs));
    let app = router(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    dispatcher.abort();
    tracing::info!("Graceful shutdown complete");
    Ok(())
}

/// Wait for SIGINT/SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, in-flight tasks will be failed on next start");
}

/// Map task store errors onto HTTP statuses.
pub(super) fn store_error(err: StoreError) -> (StatusCode, String) {
    let status = match &err {
        StoreError::NotFound(_) => StatusCode::NOT_FOUND,
        StoreError::AlreadyExists(_) | StoreError::InvalidTransition(_) => StatusCode::CONFLICT,
        StoreError::InvalidCursor => StatusCode::BAD_REQUEST,
        StoreError::Backend(_) => {
            tracing::error!(error = %err, "Task store failure");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, err.to_string())
}

/// Health check endpoint.
async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        dev_mode: state.config.dev_mode,
        auth_required: state.config.auth.auth_required(state.config.dev_mode),
        task_store: state.config.task_store.as_str().to_string(),
    })
}

/// Create a new task. The dispatcher picks it up from the store's creation
/// channel.
async fn create_task(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateTaskRequest>,
) -> Result<(StatusCode, Json<TaskRecord>), (StatusCode, String)> {
    let id = req
        .id
        .map(|id| id.trim().to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    if !is_valid_id(&id) {
        return Err((StatusCode::BAD_REQUEST, format!("Invalid task id: {:?}", id)));
    }

    let input_path = req
        .input_path
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty());
    if let Some(path) = &input_path {
        validate_path(path).map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    }

    let record = state
        .tasks
        .create_task(NewTask { id, input_path })
        .await
        .map_err(store_error)?;

    tracing::info!(task_id = %record.id, input = ?record.input_path, "Task queued");
    Ok((StatusCode::CREATED, Json(record)))
}

/// Get a task record.
async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<TaskRecord>, (StatusCode, String)> {
    state
        .tasks
        .get_task(&id)
        .await
        .map_err(store_error)?
        .map(Json)
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("Task {} not found", id)))
}

/// Stream task status changes via SSE.
async fn stream_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, std::convert::Infallible>>>, (StatusCode, String)>
{
    if state.tasks.get_task(&id).await.map_err(store_error)?.is_none() {
        return Err((StatusCode::NOT_FOUND, format!("Task {} not found", id)));
    }

    // Poll the record and emit on every status change.
    let stream = async_stream::stream! {
        let mut last_status = None;

        loop {
            let record = match state.tasks.get_task(&id).await {
                Ok(Some(record)) => record,
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(task_id = %id, error = %err, "Task stream lookup failed");
                    break;
                }
            };

            if last_status != Some(record.status) {
                last_status = Some(record.status);
                if let Ok(event) = Event::default().event("status").json_data(&record) {
                    yield Ok(event);
                }
            }

            if record.status.is_terminal() {
                if let Ok(event) = Event::default().event("done").json_data(&record) {
                    yield Ok(event);
                }
                break;
            }

            tokio::time::sleep(STREAM_POLL_INTERVAL).await;
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

#[cfg(test)]
pub(super) mod testing {
    use super::*;
    use crate::storage::InMemoryBlobStore;
    use crate::task::store::InMemoryTaskStore;

    pub struct TestServer {
        pub base: String,
        pub state: Arc<AppState>,
        pub client: reqwest::Client,
        _temp: tempfile::TempDir,
    }

    impl TestServer {
        pub fn url(&self, path: &str) -> String {
            format!("{}{}", self.base, path)
        }
    }

    /// Serve the router on a loopback port with in-memory stores.
    pub async fn spawn(configure: impl FnOnce(&mut Config)) -> TestServer {
        let temp = tempfile::tempdir().unwrap();
        let mut config = Config::new("sk-test".to_string(), temp.path().to_path_buf());
        configure(&mut config);

        let bucket = config.storage_bucket.clone();
        let state = Arc::new(AppState::new(
            config,
            Arc::new(InMemoryTaskStore::new()),
            Arc::new(InMemoryBlobStore::new(&bucket)),
        ));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(Arc::clone(&state));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        TestServer {
            base: format!("http://{}", addr),
            state,
            client: reqwest::Client::new(),
            _temp: temp,
        }
    }
}
