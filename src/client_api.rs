use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, put};
use axum::{body::Bytes, Router};
use tokio::sync::oneshot;
use tracing::error;

use crate::kv::{KvCommand, KvResult};
use crate::membership::Membership;
use crate::runtime::{Applied, ClientError};
use crate::types::NodeId;

/// A call forwarded from the HTTP layer into the consensus event loop.
pub enum ClientCall {
    Op(KvCommand),
    SetConfig(BTreeSet<NodeId>),
    Leader,
}

/// What the event loop sends back.
pub enum ApiResponse {
    Result(Result<Applied<KvResult>, ClientError>),
    Leader(Option<NodeId>),
}

/// One pending client request: the call to run and where to send the result.
pub struct ApiRequest {
    pub call: ClientCall,
    pub resp: oneshot::Sender<ApiResponse>,
}

/// Spawn a background thread that runs an axum HTTP server and forwards
/// requests to the consensus event loop via `tx`.
pub fn start(addr: SocketAddr, tx: mpsc::Sender<ApiRequest>) {
    thread::spawn(move || match tokio::runtime::Runtime::new() {
        Ok(rt) => rt.block_on(serve(addr, tx)),
        Err(e) => error!("client api: failed to start tokio runtime: {e}"),
    });
}

async fn serve(addr: SocketAddr, tx: mpsc::Sender<ApiRequest>) {
    let app = Router::new()
        .route("/kv/{key}", get(handle_get))
        .route("/kv/{key}", put(handle_put))
        .route("/kv/{key}", delete(handle_delete))
        .route("/config", put(handle_set_config))
        .route("/leader", get(handle_leader))
        .with_state(tx);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("client api: bind {addr} failed: {e}");
            return;
        }
    };

    tracing::info!("client api listening on {addr}");

    if let Err(e) = axum::serve(listener, app).await {
        error!("client api: server error: {e}");
    }
}

async fn handle_get(
    State(tx): State<mpsc::Sender<ApiRequest>>,
    Path(key): Path<String>,
) -> (StatusCode, String) {
    submit(tx, ClientCall::Op(KvCommand::Get { key })).await
}

async fn handle_put(
    State(tx): State<mpsc::Sender<ApiRequest>>,
    Path(key): Path<String>,
    body: Bytes,
) -> (StatusCode, String) {
    let value = String::from_utf8_lossy(&body).into_owned();
    submit(tx, ClientCall::Op(KvCommand::Set { key, value })).await
}

async fn handle_delete(
    State(tx): State<mpsc::Sender<ApiRequest>>,
    Path(key): Path<String>,
) -> (StatusCode, String) {
    submit(tx, ClientCall::Op(KvCommand::Delete { key })).await
}

/// PUT /config with a JSON array of node ids, e.g. `[1,2,4]`.
async fn handle_set_config(
    State(tx): State<mpsc::Sender<ApiRequest>>,
    body: Bytes,
) -> (StatusCode, String) {
    let ids: Vec<u64> = match serde_json::from_slice(&body) {
        Ok(ids) => ids,
        Err(e) => return (StatusCode::BAD_REQUEST, format!("bad server list: {e}")),
    };
    let servers = ids.into_iter().map(NodeId::from).collect();
    submit(tx, ClientCall::SetConfig(servers)).await
}

async fn handle_leader(State(tx): State<mpsc::Sender<ApiRequest>>) -> (StatusCode, String) {
    match roundtrip(tx, ClientCall::Leader).await {
        Some(ApiResponse::Leader(Some(id))) => (StatusCode::OK, id.to_string()),
        Some(ApiResponse::Leader(None)) => (StatusCode::NOT_FOUND, "no leader".into()),
        _ => (StatusCode::SERVICE_UNAVAILABLE, "unavailable".into()),
    }
}

/// Send a call to the event loop and render the outcome as HTTP.
async fn submit(tx: mpsc::Sender<ApiRequest>, call: ClientCall) -> (StatusCode, String) {
    match roundtrip(tx, call).await {
        Some(ApiResponse::Result(result)) => render(result),
        Some(ApiResponse::Leader(_)) | None => {
            (StatusCode::SERVICE_UNAVAILABLE, "unavailable".into())
        }
    }
}

/// Forward one call and wait up to 5 s for the event loop's answer.
async fn roundtrip(tx: mpsc::Sender<ApiRequest>, call: ClientCall) -> Option<ApiResponse> {
    let (resp_tx, resp_rx) = oneshot::channel::<ApiResponse>();

    if tx.send(ApiRequest { call, resp: resp_tx }).is_err() {
        return None;
    }

    match tokio::time::timeout(Duration::from_secs(5), resp_rx).await {
        Ok(Ok(response)) => Some(response),
        Ok(Err(_)) | Err(_) => None,
    }
}

fn render(result: Result<Applied<KvResult>, ClientError>) -> (StatusCode, String) {
    match result {
        Ok(Applied::Command(KvResult::Written)) => (StatusCode::OK, "ok".into()),
        Ok(Applied::Command(KvResult::Removed(true))) => (StatusCode::OK, "ok".into()),
        Ok(Applied::Command(KvResult::Removed(false))) => (StatusCode::NOT_FOUND, String::new()),
        Ok(Applied::Command(KvResult::Value(Some(v)))) => (StatusCode::OK, v),
        Ok(Applied::Command(KvResult::Value(None))) => (StatusCode::NOT_FOUND, String::new()),
        Ok(Applied::Config(config)) => (StatusCode::OK, render_config(&config)),
        Err(e @ ClientError::NotLeader(_)) | Err(e @ ClientError::ElectionInProgress) => {
            (StatusCode::SERVICE_UNAVAILABLE, e.to_string())
        }
        Err(e @ ClientError::ConfigChangeInProgress) => (StatusCode::CONFLICT, e.to_string()),
        Err(e @ ClientError::Timeout) => (StatusCode::GATEWAY_TIMEOUT, e.to_string()),
    }
}

fn render_config(config: &Membership) -> String {
    serde_json::to_string(config).unwrap_or_else(|_| format!("{config:?}"))
}
