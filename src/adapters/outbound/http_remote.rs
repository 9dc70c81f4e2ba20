//! HTTP Remote Primary
//!
//! Speaks the push/pull protocol to a remote primary over HTTP(S) using
//! reqwest. `libsql://` and `wss://` endpoints are dialed over HTTPS.
//!
//! Endpoints:
//! - `GET  /v1/head` returns `{"head": u64}`
//! - `POST /v1/push` takes `{"replica", "frames", "checksum"}` and returns a [`PushAck`]
//! - `GET  /v1/pull?since=&limit=` returns a [`PullBatch`]
//!
//! Every request carries the bearer token and the `X-Replica-Protocol` header.

use crate::domain::entities::{frames_checksum, ChangeFrame, ReplicaId};
use crate::domain::errors::RemoteError;
use crate::domain::ports::{PullBatch, PushAck, RemoteConnector, RemotePrimary, PROTOCOL_VERSION};
use crate::domain::value_objects::{AuthToken, RemoteEndpoint, SyncConfig};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const PROTOCOL_HEADER: &str = "x-replica-protocol";

#[derive(Debug, Serialize, Deserialize)]
pub struct HeadResponse {
    pub head: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PushRequest {
    pub replica: ReplicaId,
    pub frames: Vec<ChangeFrame>,
    pub checksum: u32,
}

/// Opens [`HttpRemotePrimary`] sessions.
#[derive(Debug, Clone, Default)]
pub struct HttpRemoteConnector;

impl HttpRemoteConnector {
    pub fn new() -> Self {
        Self
    }
}

impl RemoteConnector for HttpRemoteConnector {
    fn connect(
        &self,
        endpoint: &RemoteEndpoint,
        config: &SyncConfig,
    ) -> Result<Arc<dyn RemotePrimary>, RemoteError> {
        let remote = HttpRemotePrimary::new(endpoint, config.auth_token().cloned(), config)?;
        Ok(Arc::new(remote))
    }
}

/// Session with a remote primary reached over HTTP.
pub struct HttpRemotePrimary {
    client: reqwest::Client,
    base_url: String,
    token: Option<AuthToken>,
}

impl HttpRemotePrimary {
    pub fn new(
        endpoint: &RemoteEndpoint,
        token: Option<AuthToken>,
        config: &SyncConfig,
    ) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| RemoteError::Network(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: endpoint.http_base(),
            token,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(method, format!("{}{}", self.base_url, path))
            .header(PROTOCOL_HEADER, PROTOCOL_VERSION.to_string());
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token.expose());
        }
        builder
    }

    async fn send<T: serde::de::DeserializeOwned>(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<T, RemoteError> {
        let response = builder.send().await.map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let remote_version = response
                .headers()
                .get(PROTOCOL_HEADER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u16>().ok())
                .unwrap_or(0);
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, remote_version, body));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| RemoteError::Protocol(format!("invalid response body: {}", e)))
    }
}

/// Map a non-success HTTP status to a remote error.
pub fn status_error(status: StatusCode, remote_version: u16, body: String) -> RemoteError {
    let detail = format!("{} - {}", status, body);
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => RemoteError::Authentication(detail),
        StatusCode::CONFLICT | StatusCode::UPGRADE_REQUIRED => RemoteError::ProtocolMismatch {
            local: PROTOCOL_VERSION,
            remote: remote_version,
        },
        StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE => RemoteError::Busy(detail),
        s if s.is_server_error() => RemoteError::Server(detail),
        _ => RemoteError::Protocol(detail),
    }
}

fn transport_error(err: reqwest::Error) -> RemoteError {
    if err.is_timeout() {
        RemoteError::Network(format!("request timed out: {}", err))
    } else if err.is_decode() {
        RemoteError::Protocol(err.to_string())
    } else {
        RemoteError::Network(err.to_string())
    }
}

#[async_trait]
impl RemotePrimary for HttpRemotePrimary {
    async fn head(&self) -> Result<u64, RemoteError> {
        let response: HeadResponse = self.send(self.request(reqwest::Method::GET, "/v1/head")).await?;
        Ok(response.head)
    }

    async fn push(&self, replica: &ReplicaId, frames: &[ChangeFrame]) -> Result<PushAck, RemoteError> {
        let body = PushRequest {
            replica: replica.clone(),
            frames: frames.to_vec(),
            checksum: frames_checksum(frames),
        };
        self.send(self.request(reqwest::Method::POST, "/v1/push").json(&body))
            .await
    }

    async fn pull(&self, since: u64, limit: usize) -> Result<PullBatch, RemoteError> {
        let builder = self
            .request(reqwest::Method::GET, "/v1/pull")
            .query(&[("since", since.to_string()), ("limit", limit.to_string())]);
        self.send(builder).await
    }
}
