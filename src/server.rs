use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, UnixListener};
use tokio_util::sync::CancellationToken;

use crate::config::DaemonConfig;
use crate::runner::StrategyRunner;

#[derive(Debug, Default, Deserialize)]
pub struct RestartRequest {
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RestartResponse {
    pub message: String,
    pub restarted_at: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub running: bool,
    pub strategy_file: String,
    pub active_queues: usize,
    pub active_processes: usize,
    pub firewall_backend: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

/// Control-plane error with a wire code, mapped onto an HTTP status.
#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "internal",
            message: message.into(),
        }
    }

    fn invalid_argument(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "invalid_argument",
            message: message.into(),
        }
    }

    fn failed_precondition(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            code: "failed_precondition",
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            code: self.code,
            message: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

#[derive(Clone)]
pub struct ApiState {
    runner: Option<Arc<StrategyRunner>>,
    /// Serializes restarts and carries the running count; the busy guard
    /// try-locks this so concurrent restarts fail fast instead of piling
    /// up behind the orchestrator lock.
    restarts: Arc<tokio::sync::Mutex<u64>>,
}

impl ApiState {
    pub fn new(runner: Option<Arc<StrategyRunner>>) -> Self {
        Self {
            runner,
            restarts: Arc::new(tokio::sync::Mutex::new(0)),
        }
    }
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/status", get(get_status))
        .route("/v1/restart", post(restart))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "zapretd"
    }))
}

async fn get_status(State(state): State<ApiState>) -> Json<StatusResponse> {
    let Some(ref runner) = state.runner else {
        return Json(StatusResponse {
            running: false,
            strategy_file: String::new(),
            active_queues: 0,
            active_processes: 0,
            firewall_backend: String::new(),
        });
    };

    let status = runner.status().await;
    Json(StatusResponse {
        running: status.running,
        strategy_file: status.strategy_file,
        active_queues: status.active_queues,
        active_processes: status.active_processes,
        firewall_backend: status.firewall_backend.to_string(),
    })
}

async fn restart(
    State(state): State<ApiState>,
    body: Result<Json<RestartRequest>, JsonRejection>,
) -> Result<Json<RestartResponse>, ApiError> {
    let req = match body {
        Ok(Json(req)) => req,
        // A bodyless POST means a plain restart.
        Err(JsonRejection::MissingJsonContentType(_)) => RestartRequest::default(),
        Err(rejection) => return Err(ApiError::invalid_argument(rejection.body_text())),
    };

    let mut count = if req.force {
        state.restarts.lock().await
    } else {
        state
            .restarts
            .try_lock()
            .map_err(|_| ApiError::failed_precondition("a restart is already in progress"))?
    };

    tracing::info!(force = req.force, restart_count = *count, "restart requested");

    if let Some(ref runner) = state.runner {
        runner.restart().await.map_err(|err| {
            tracing::error!(error = %err, "failed to restart strategy runner");
            ApiError::internal(err.to_string())
        })?;
    }

    *count += 1;
    let restarted_at = chrono::Utc::now().to_rfc3339();

    tracing::info!(
        restarted_at = %restarted_at,
        total_restarts = *count,
        "strategy runner restarted"
    );

    Ok(Json(RestartResponse {
        message: format!("strategy runner restarted successfully (restart #{count})"),
        restarted_at,
    }))
}

/// Serve the control plane on the configured unix socket and/or TCP
/// address until a shutdown signal arrives, then stop the runner and
/// clean up the socket file.
pub async fn serve(config: &DaemonConfig, state: ApiState) -> anyhow::Result<()> {
    let app = router(state.clone());
    let shutdown = shutdown_token();

    let mut servers = tokio::task::JoinSet::new();
    let mut socket_file: Option<PathBuf> = None;

    if !config.server.socket_path.is_empty() {
        let path = PathBuf::from(&config.server.socket_path);

        // A stale socket from a previous run would make bind fail.
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(&path)?;
        let mode = config.server.permissions_mode()?;
        if let Err(err) = std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode)) {
            tracing::warn!(path = %path.display(), error = %err, "failed to set socket permissions");
        }

        tracing::info!(path = %path.display(), "listening on unix socket");
        socket_file = Some(path);

        let app = app.clone();
        let token = shutdown.clone();
        servers.spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(token.cancelled_owned())
                .await
        });
    }

    if !config.server.network_address.is_empty() {
        let listener = TcpListener::bind(&config.server.network_address).await?;
        tracing::info!(address = %config.server.network_address, "listening on network");

        let app = app.clone();
        let token = shutdown.clone();
        servers.spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(token.cancelled_owned())
                .await
        });
    }

    let mut result = Ok(());
    while let Some(joined) = servers.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                shutdown.cancel();
                result = Err(anyhow::anyhow!("server error: {err}"));
            }
            Err(err) => {
                shutdown.cancel();
                result = Err(anyhow::anyhow!("server task panicked: {err}"));
            }
        }
    }

    tracing::info!("shutting down");

    if let Some(ref runner) = state.runner {
        if let Err(err) = runner.stop().await {
            tracing::warn!(error = %err, "error stopping strategy runner");
        }
    }

    if let Some(path) = socket_file {
        if let Err(err) = std::fs::remove_file(&path) {
            tracing::warn!(path = %path.display(), error = %err, "failed to remove socket file");
        }
    }

    tracing::info!("daemon stopped");
    result
}

/// Token cancelled on SIGINT or SIGTERM.
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let cancel = token.clone();

    tokio::spawn(async move {
        let ctrl_c = async {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to install Ctrl+C handler");
        };
        let terminate = async {
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler")
                .recv()
                .await;
        };

        tokio::select! {
            () = ctrl_c => {}
            () = terminate => {}
        }
        tracing::info!("received shutdown signal");
        cancel.cancel();
    });

    token
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn status_without_runner_reports_not_running() {
        let state = ApiState::new(None);
        let Json(status) = get_status(State(state)).await;
        assert!(!status.running);
        assert_eq!(status.active_queues, 0);
        assert!(status.firewall_backend.is_empty());
    }

    #[tokio::test]
    async fn restart_without_runner_succeeds_and_counts() {
        let state = ApiState::new(None);

        let Json(first) = restart(State(state.clone()), Ok(Json(RestartRequest::default())))
            .await
            .unwrap();
        assert!(first.message.contains("restarted"));
        assert!(first.message.contains("#1"));
        assert!(chrono::DateTime::parse_from_rfc3339(&first.restarted_at).is_ok());

        let Json(second) = restart(State(state), Ok(Json(RestartRequest { force: true })))
            .await
            .unwrap();
        assert!(second.message.contains("#2"));
    }

    #[tokio::test]
    async fn concurrent_restart_without_force_is_rejected() {
        let state = ApiState::new(None);
        let _held = state.restarts.try_lock().unwrap();

        let err = restart(State(state.clone()), Ok(Json(RestartRequest::default())))
            .await
            .err()
            .unwrap();
        assert_eq!(err.code, "failed_precondition");
        assert_eq!(err.status, StatusCode::CONFLICT);
    }
}
