use std::path::PathBuf;

use anyhow::{bail, Context};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Method, Request};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use tokio::net::{TcpStream, UnixStream};

use crate::config::DaemonConfig;
use crate::server::{RestartResponse, StatusResponse};

/// Where to reach the daemon's control plane.
#[derive(Debug, Clone)]
pub enum Endpoint {
    Unix(PathBuf),
    Tcp(String),
}

impl Endpoint {
    /// Resolve the endpoint from flags and config. Priority: network
    /// address flag, then socket flag, then the config file (network
    /// address preferred over socket there too).
    pub fn resolve(
        socket: Option<PathBuf>,
        address: Option<String>,
        config: &DaemonConfig,
    ) -> anyhow::Result<Self> {
        if let Some(address) = address {
            return Ok(Endpoint::Tcp(address));
        }
        if let Some(socket) = socket {
            return Ok(Endpoint::Unix(socket));
        }
        if !config.server.network_address.is_empty() {
            return Ok(Endpoint::Tcp(config.server.network_address.clone()));
        }
        if !config.server.socket_path.is_empty() {
            return Ok(Endpoint::Unix(PathBuf::from(&config.server.socket_path)));
        }
        bail!("no connection method configured");
    }
}

/// HTTP client for the daemon control plane, over a unix socket or TCP.
pub struct DaemonClient {
    endpoint: Endpoint,
}

impl DaemonClient {
    pub fn new(endpoint: Endpoint) -> Self {
        Self { endpoint }
    }

    pub async fn restart(&self, force: bool) -> anyhow::Result<RestartResponse> {
        self.request(
            Method::POST,
            "/v1/restart",
            Some(serde_json::json!({ "force": force })),
        )
        .await
    }

    pub async fn status(&self) -> anyhow::Result<StatusResponse> {
        self.request(Method::GET, "/v1/status", None).await
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> anyhow::Result<T> {
        let payload = match body {
            Some(value) => Bytes::from(serde_json::to_vec(&value)?),
            None => Bytes::new(),
        };

        let request = Request::builder()
            .method(method)
            .uri(path)
            .header(hyper::header::HOST, "zapretd")
            .header(hyper::header::CONTENT_TYPE, "application/json")
            .body(Full::new(payload))?;

        let response = match &self.endpoint {
            Endpoint::Unix(path) => {
                let stream = UnixStream::connect(path)
                    .await
                    .with_context(|| format!("failed to connect to {}", path.display()))?;
                send_request(stream, request).await?
            }
            Endpoint::Tcp(address) => {
                let stream = TcpStream::connect(address)
                    .await
                    .with_context(|| format!("failed to connect to {address}"))?;
                send_request(stream, request).await?
            }
        };

        let status = response.status();
        let bytes = response.into_body().collect().await?.to_bytes();

        if !status.is_success() {
            #[derive(serde::Deserialize)]
            struct ErrorBody {
                code: String,
                message: String,
            }
            if let Ok(err) = serde_json::from_slice::<ErrorBody>(&bytes) {
                bail!("request failed: {} (code: {})", err.message, err.code);
            }
            bail!("request failed with status {status}");
        }

        serde_json::from_slice(&bytes).context("failed to decode response")
    }
}

async fn send_request<S>(
    stream: S,
    request: Request<Full<Bytes>>,
) -> anyhow::Result<hyper::Response<hyper::body::Incoming>>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .context("http handshake failed")?;

    // Drive the connection until the response is read.
    tokio::spawn(async move {
        if let Err(err) = conn.await {
            tracing::debug!(error = %err, "connection closed with error");
        }
    });

    sender
        .send_request(request)
        .await
        .context("request failed")
}
