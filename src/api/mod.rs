//! # HTTP API
//!
//! [`ApiServer`] serves the proxy API on a unix domain socket or a TCP
//! address and implements the [`Listener`] stop protocol:
//!
//! 1. [`ApiServer::bind`] binds the address; nothing is served yet.
//! 2. [`Listener::start`] spawns the serve task.
//! 3. [`Listener::async_stop`] stops accepting connections. Requests already
//!    in flight run to completion; the ones that fail are reported on the
//!    completion channel as [`ListenerError::Drain`].
//! 4. The completion channel closes once the serve task and every connection
//!    task have finished, since each of them owns a sender clone.
//!
//! Routes:
//!
//! | Method | Path | Query | Success |
//! |---|---|---|---|
//! | `POST` | `/topics/{topic}/messages` | `key`, `sync` | `202 {}` or `200 {"partition","offset"}` |
//! | `GET` | `/topics/{topic}/messages` | `group` | `200 {"key","value","partition","offset"}` |
//! | `GET` | `/topics/{topic}/offsets` | `group` | `200 [{"partition","begin","end","offset","lag"}]` |
//! | `POST` | `/topics/{topic}/offsets` | `group` | `200 {}` |
//!
//! Errors are answered as `{"error": "..."}`.

use std::io;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::{TcpListener, UnixListener};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::admin::{Admin, OffsetUpdate};
use crate::cluster::{ClusterError, Offset, Partition};
use crate::config::Config;
use crate::consumer::Consumer;
use crate::error::{Error, Result};
use crate::framework::{
    completion_channel, Backends, CompletionReceiver, CompletionSender, Listener, ListenerError,
    Network,
};
use crate::producer::Producer;

pub type ProxyBackends = Backends<Producer, Consumer, Admin>;

enum BoundListener {
    Unix(UnixListener),
    Tcp(TcpListener),
}

/// An HTTP API listener.
pub struct ApiServer {
    network: Network,
    addr: String,
    listener: Option<BoundListener>,
    state: Option<ApiState>,
    shutdown: CancellationToken,
    completion: CompletionReceiver,
}

impl ApiServer {
    /// Binds `addr` without serving it. A unix socket file left behind by a
    /// previous run is removed first.
    pub async fn bind(
        network: Network,
        addr: &str,
        config: &Config,
        backends: ProxyBackends,
    ) -> Result<Self> {
        let bind_error = |source: io::Error| Error::Bind {
            network,
            addr: addr.to_string(),
            source,
        };
        let listener = match network {
            Network::Unix => {
                match tokio::fs::remove_file(addr).await {
                    Ok(()) => warn!(%addr, "Removed stale unix socket"),
                    Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                    Err(err) => return Err(bind_error(err)),
                }
                BoundListener::Unix(UnixListener::bind(addr).map_err(bind_error)?)
            }
            Network::Tcp => BoundListener::Tcp(TcpListener::bind(addr).await.map_err(bind_error)?),
        };

        let (completion_tx, completion) = completion_channel(config.channel_buffer_size);
        let shutdown = CancellationToken::new();
        let state = ApiState {
            network,
            backends,
            shutdown: shutdown.clone(),
            completion: completion_tx,
        };
        Ok(Self {
            network,
            addr: addr.to_string(),
            listener: Some(listener),
            state: Some(state),
            shutdown,
            completion,
        })
    }

    /// Address actually bound; differs from the requested one for TCP port 0.
    pub fn local_addr(&self) -> Option<String> {
        match self.listener.as_ref()? {
            BoundListener::Tcp(listener) => listener.local_addr().ok().map(|addr| addr.to_string()),
            BoundListener::Unix(_) => Some(self.addr.clone()),
        }
    }
}

async fn remove_socket(addr: &str) {
    match tokio::fs::remove_file(addr).await {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!(%addr, error = %err, "Cannot remove unix socket"),
    }
}

impl Listener for ApiServer {
    fn network(&self) -> Network {
        self.network
    }

    fn start(&mut self) {
        let (Some(listener), Some(state)) = (self.listener.take(), self.state.take()) else {
            return;
        };
        let network = self.network;
        let addr = self.addr.clone();
        let shutdown = self.shutdown.clone();
        info!(%network, %addr, "Starting HTTP API");
        tokio::spawn(async move {
            // Keep one sender until serving ended so a crash can be reported.
            let completion = state.completion.clone();
            let app = router(state);
            let result = match listener {
                BoundListener::Unix(listener) => {
                    axum::serve(listener, app)
                        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
                        .await
                }
                BoundListener::Tcp(listener) => {
                    axum::serve(listener, app)
                        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
                        .await
                }
            };
            if network == Network::Unix {
                remove_socket(&addr).await;
            }
            let reason = match result {
                Err(err) => Some(err.to_string()),
                Ok(()) if !shutdown.is_cancelled() => Some("stopped serving".to_string()),
                Ok(()) => None,
            };
            match reason {
                Some(reason) => {
                    error!(%network, %addr, %reason, "HTTP API crashed");
                    let _ = completion.send(ListenerError::Crashed { network, reason }).await;
                }
                None => info!(%network, %addr, "HTTP API stopped"),
            }
        });
    }

    fn async_stop(&mut self) {
        self.shutdown.cancel();
        // Never started: dropping the only sender closes the channel, once
        // the socket file is gone.
        if let Some(state) = self.state.take() {
            self.listener = None;
            let network = self.network;
            let addr = self.addr.clone();
            tokio::spawn(async move {
                if network == Network::Unix {
                    remove_socket(&addr).await;
                }
                drop(state);
                info!(%network, %addr, "HTTP API stopped before start");
            });
        }
    }

    fn completion(&mut self) -> &mut CompletionReceiver {
        &mut self.completion
    }
}

/// Per-request state. Every clone carries a completion sender, so the
/// channel stays open while any request is in flight.
#[derive(Clone)]
struct ApiState {
    network: Network,
    backends: ProxyBackends,
    shutdown: CancellationToken,
    completion: CompletionSender,
}

impl ApiState {
    /// Maps a backend result to a response, reporting failures that happen
    /// while the listener drains.
    async fn finish<T>(&self, request: String, result: Result<T>) -> std::result::Result<T, ApiError> {
        let err = match result {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        if self.shutdown.is_cancelled() {
            let report = ListenerError::Drain {
                network: self.network,
                request,
                reason: err.to_string(),
            };
            if self.completion.send(report).await.is_err() {
                warn!(network = %self.network, "Completion channel gone, drain failure not reported");
            }
        }
        Err(ApiError::from(err))
    }
}

fn router(state: ApiState) -> Router {
    Router::new()
        .route("/topics/{topic}/messages", post(produce).get(consume))
        .route("/topics/{topic}/offsets", post(set_offsets).get(get_offsets))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct ProduceParams {
    key: Option<String>,
    sync: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GroupParams {
    group: Option<String>,
}

impl GroupParams {
    fn group(self) -> std::result::Result<String, ApiError> {
        match self.group {
            Some(group) if !group.is_empty() => Ok(group),
            _ => Err(ApiError::bad_request("group query parameter is required")),
        }
    }
}

#[derive(Debug, Serialize)]
struct ConsumeResponse {
    key: Option<String>,
    value: String,
    partition: Partition,
    offset: Offset,
}

#[instrument(skip_all, fields(network = %state.network, %topic))]
async fn produce(
    State(state): State<ApiState>,
    Path(topic): Path<String>,
    Query(params): Query<ProduceParams>,
    body: Bytes,
) -> std::result::Result<Response, ApiError> {
    let key = params.key.map(String::into_bytes);
    let request = format!("POST /topics/{topic}/messages");
    let producer = &state.backends.producer;
    if params.sync.is_some() {
        let result = producer.produce(topic, key, body.to_vec()).await;
        let delivery = state.finish(request, result).await?;
        Ok((StatusCode::OK, Json(delivery)).into_response())
    } else {
        let result = producer.async_produce(topic, key, body.to_vec()).await;
        state.finish(request, result).await?;
        Ok((StatusCode::ACCEPTED, Json(json!({}))).into_response())
    }
}

#[instrument(skip_all, fields(network = %state.network, %topic))]
async fn consume(
    State(state): State<ApiState>,
    Path(topic): Path<String>,
    Query(params): Query<GroupParams>,
) -> std::result::Result<Json<ConsumeResponse>, ApiError> {
    let group = params.group()?;
    let request = format!("GET /topics/{topic}/messages");
    let result = state.backends.consumer.consume(group, topic).await;
    let message = state.finish(request, result).await?;
    Ok(Json(ConsumeResponse {
        key: message.key.map(|key| STANDARD.encode(key)),
        value: STANDARD.encode(message.value),
        partition: message.partition,
        offset: message.offset,
    }))
}

#[instrument(skip_all, fields(network = %state.network, %topic))]
async fn get_offsets(
    State(state): State<ApiState>,
    Path(topic): Path<String>,
    Query(params): Query<GroupParams>,
) -> std::result::Result<Response, ApiError> {
    let group = params.group()?;
    let request = format!("GET /topics/{topic}/offsets");
    let result = state.backends.admin.get_group_offsets(&group, &topic).await;
    let offsets = state.finish(request, result).await?;
    Ok(Json(offsets).into_response())
}

#[instrument(skip_all, fields(network = %state.network, %topic))]
async fn set_offsets(
    State(state): State<ApiState>,
    Path(topic): Path<String>,
    Query(params): Query<GroupParams>,
    body: Bytes,
) -> std::result::Result<Response, ApiError> {
    let group = params.group()?;
    let updates: Vec<OffsetUpdate> = serde_json::from_slice(&body)
        .map_err(|err| ApiError::bad_request(format!("invalid offsets: {err}")))?;
    let request = format!("POST /topics/{topic}/offsets");
    let result = state.backends.admin.set_group_offsets(&group, &topic, &updates).await;
    state.finish(request, result).await?;
    Ok(Json(json!({})).into_response())
}

/// Error answered to an API client.
#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let status = match &err {
            Error::Cluster(ClusterError::UnknownTopic(_) | ClusterError::UnknownPartition { .. }) => {
                StatusCode::NOT_FOUND
            }
            Error::Config(_) => StatusCode::BAD_REQUEST,
            Error::LongPollTimeout { .. } => StatusCode::REQUEST_TIMEOUT,
            Error::Stopped(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}
