use crate::config::{ForgeConfig, RemoteBridgeConfig};
use crate::core::{BuildAndFlashRequest, BuildRequest, ClassifyRequest, DetectRequest, FlashRequest};
use crate::backend::{self, ProgrammerBackend, RemoteBridgeBackend};
use crate::error::ErrorCode;
use crate::jobs::{JobManager, Outcome};
use crate::orchestrator::{OperationKind, Orchestrator};
use crate::targets;
use anyhow::Result;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tracing::info;
use uuid::Uuid;

const JOB_RETENTION_SECS: u64 = 3600;
const DEFAULT_DISCOVERY_SUBNET: &str = "192.168.4";
const DISCOVERY_TIMEOUT_MS: u64 = 500;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub jobs: JobManager,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            orchestrator,
            jobs: JobManager::new(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct RunParams {
    #[serde(default)]
    wait: bool,
}

#[derive(Debug, Serialize)]
struct JobAccepted {
    job_id: Uuid,
    kind: OperationKind,
    status: &'static str,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Deserialize)]
struct RemoteParams {
    host: String,
    port: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct DiscoverParams {
    /// First three octets of a /24 to sweep; ignored when `hosts` is given.
    subnet: Option<String>,
    hosts: Option<Vec<String>>,
    port: Option<u16>,
    timeout_ms: Option<u64>,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(ErrorBody { error: message.into() })).into_response()
}

/// Failed operations are still answered with their result body; only a
/// rejected request changes the status code.
fn outcome_status(code: Option<ErrorCode>) -> StatusCode {
    match code {
        Some(ErrorCode::ValidationError) => StatusCode::BAD_REQUEST,
        _ => StatusCode::OK,
    }
}

/// Run inline when `wait` is set, otherwise hand the operation to the job
/// manager and answer 202 with the job id.
async fn run_or_submit<F, T>(
    state: &AppState,
    kind: OperationKind,
    workspace: Option<PathBuf>,
    wait: bool,
    code: impl Fn(&T) -> Option<ErrorCode>,
    operation: F,
) -> Response
where
    F: Future<Output = T> + Send + 'static,
    T: Outcome + Serialize + Send + 'static,
{
    if wait {
        let result = operation.await;
        return (outcome_status(code(&result)), Json(result)).into_response();
    }
    let job_id = state.jobs.spawn(kind, workspace, operation);
    info!("Queued {:?} job {}", kind, job_id);
    (
        StatusCode::ACCEPTED,
        Json(JobAccepted {
            job_id,
            kind,
            status: "queued",
        }),
    )
        .into_response()
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "nabla-forge",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn environment_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.orchestrator.check_environment().await).into_response()
}

async fn targets_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "families": targets::supported_families(),
        "targets": targets::list_supported(),
    }))
}

async fn target_lookup_handler(Path(identifier): Path<String>) -> Response {
    let identification = targets::identify(&identifier);
    if identification.device_id.is_none() {
        return error_response(
            StatusCode::BAD_REQUEST,
            format!("'{}' is not a device identifier", identifier),
        );
    }
    Json(identification).into_response()
}

async fn backends_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.orchestrator.list_backends().await).into_response()
}

async fn backends_health_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.orchestrator.health_check().await).into_response()
}

async fn add_remote_handler(State(state): State<Arc<AppState>>, Json(params): Json<RemoteParams>) -> Response {
    if params.host.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "host is required");
    }
    let mut bridge = RemoteBridgeConfig::new(
        params.host.trim(),
        params.port.unwrap_or(crate::config::DEFAULT_BRIDGE_PORT),
    );
    if let Some(template) = state.orchestrator.config().remote_bridges.first() {
        bridge.banner_prefix = template.banner_prefix.clone();
    }
    let endpoint = bridge.endpoint();
    let backend: Arc<dyn ProgrammerBackend> = Arc::new(RemoteBridgeBackend::new(bridge));
    if state.orchestrator.router().add_remote(backend) {
        (StatusCode::CREATED, Json(serde_json::json!({ "added": endpoint }))).into_response()
    } else {
        error_response(StatusCode::CONFLICT, format!("{} is already registered", endpoint))
    }
}

async fn discover_handler(State(state): State<Arc<AppState>>, Json(params): Json<DiscoverParams>) -> Response {
    let hosts = match params.hosts {
        Some(hosts) if !hosts.is_empty() => hosts,
        _ => backend::remote::subnet_hosts(params.subnet.as_deref().unwrap_or(DEFAULT_DISCOVERY_SUBNET)),
    };
    let mut template = state
        .orchestrator
        .config()
        .remote_bridges
        .first()
        .cloned()
        .unwrap_or_default();
    template.port = params.port.unwrap_or(crate::config::DEFAULT_BRIDGE_PORT);
    let timeout = Duration::from_millis(params.timeout_ms.unwrap_or(DISCOVERY_TIMEOUT_MS).clamp(50, 10_000));

    info!("Discovering bridges on {} hosts, port {}", hosts.len(), template.port);
    let (discovered, added) = state
        .orchestrator
        .router()
        .discover_remotes(&hosts, &template, timeout)
        .await;
    Json(serde_json::json!({ "discovered": discovered, "added": added })).into_response()
}

async fn remove_remote_handler(State(state): State<Arc<AppState>>, Path(endpoint): Path<String>) -> Response {
    match state.orchestrator.router().remove_remote(&endpoint) {
        0 => error_response(StatusCode::NOT_FOUND, format!("no remote bridge {}", endpoint)),
        removed => Json(serde_json::json!({ "removed": removed })).into_response(),
    }
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.orchestrator.status()).into_response()
}

async fn classify_handler(State(state): State<Arc<AppState>>, Json(request): Json<ClassifyRequest>) -> Response {
    Json(state.orchestrator.classify_log(&request.log, request.workspace.as_deref())).into_response()
}

async fn detect_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RunParams>,
    body: Option<Json<DetectRequest>>,
) -> Response {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let orchestrator = state.orchestrator.clone();
    run_or_submit(&state, OperationKind::Detect, None, params.wait, |r: &crate::core::DetectResult| r.error_code, async move {
        orchestrator.detect_target(request).await
    })
    .await
}

async fn build_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RunParams>,
    Json(request): Json<BuildRequest>,
) -> Response {
    info!("Build request for {:?}", request.workspace);
    let workspace = Some(request.workspace.clone());
    let orchestrator = state.orchestrator.clone();
    run_or_submit(&state, OperationKind::Build, workspace, params.wait, |r: &crate::core::BuildResult| r.error_code, async move {
        orchestrator.build(request).await
    })
    .await
}

async fn flash_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RunParams>,
    Json(request): Json<FlashRequest>,
) -> Response {
    info!("Flash request for {:?}", request.workspace);
    let workspace = Some(request.workspace.clone());
    let orchestrator = state.orchestrator.clone();
    run_or_submit(&state, OperationKind::Flash, workspace, params.wait, |r: &crate::core::FlashResult| r.error_code, async move {
        orchestrator.flash(request).await
    })
    .await
}

async fn build_and_flash_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RunParams>,
    Json(request): Json<BuildAndFlashRequest>,
) -> Response {
    info!("Build-and-flash request for {:?}", request.build.workspace);
    let workspace = Some(request.build.workspace.clone());
    let orchestrator = state.orchestrator.clone();
    run_or_submit(
        &state,
        OperationKind::BuildAndFlash,
        workspace,
        params.wait,
        |r: &crate::core::BuildAndFlashResult| {
            r.build.error_code.filter(|_| !r.build.success).or_else(|| r.flash.as_ref().and_then(|f| f.error_code))
        },
        async move { orchestrator.build_and_flash(request).await },
    )
    .await
}

async fn list_jobs_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.jobs.list_jobs()).into_response()
}

async fn get_job_handler(State(state): State<Arc<AppState>>, Path(job_id): Path<Uuid>) -> Response {
    match state.jobs.get_job(&job_id) {
        Some(job) => Json(job).into_response(),
        None => error_response(StatusCode::NOT_FOUND, format!("job {} not found", job_id)),
    }
}

async fn cancel_job_handler(State(state): State<Arc<AppState>>, Path(job_id): Path<Uuid>) -> Response {
    match state.jobs.cancel_job(&job_id) {
        Ok(cancelled) => Json(serde_json::json!({ "job_id": job_id, "cancelled": cancelled })).into_response(),
        Err(e) => error_response(StatusCode::NOT_FOUND, e.to_string()),
    }
}

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/environment", get(environment_handler))
        .route("/targets", get(targets_handler))
        .route("/targets/:identifier", get(target_lookup_handler))
        .route("/backends", get(backends_handler))
        .route("/backends/health", get(backends_health_handler))
        .route("/backends/remote", post(add_remote_handler))
        .route("/backends/remote/:endpoint", delete(remove_remote_handler))
        .route("/backends/discover", post(discover_handler))
        .route("/status", get(status_handler))
        .route("/classify", post(classify_handler))
        .route("/detect", post(detect_handler))
        .route("/build", post(build_handler))
        .route("/flash", post(flash_handler))
        .route("/build-and-flash", post(build_and_flash_handler))
        .route("/jobs", get(list_jobs_handler))
        .route("/jobs/:id", get(get_job_handler).delete(cancel_job_handler))
        .layer(
            ServiceBuilder::new()
                .layer(CorsLayer::permissive())
                .into_inner(),
        )
        .with_state(Arc::new(state))
}

pub async fn run_server(config: ForgeConfig) -> Result<()> {
    let port = config.port;
    let orchestrator = Arc::new(Orchestrator::new(config));
    let state = AppState::new(orchestrator);

    let jobs = state.jobs.clone();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(300));
        loop {
            tick.tick().await;
            let removed = jobs.cleanup_completed_jobs(JOB_RETENTION_SECS);
            if removed > 0 {
                info!("Aged out {} finished jobs", removed);
            }
        }
    });

    let app = create_app(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    info!("Server running on http://0.0.0.0:{}", port);

    axum::serve(listener, app).await?;

    Ok(())
}
