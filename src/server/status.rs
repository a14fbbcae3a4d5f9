//! Read-only HTTP status endpoint.
//!
//! Serves `GET`/`HEAD /status` as a JSON snapshot of the connected nodes.
//! Handlers run on axum's tasks and never touch reflector state directly: a
//! request posts a [`StatusRequest`] into the core loop and awaits the
//! snapshot on a oneshot channel.

use std::collections::BTreeMap;

use axum::extract::State;
use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::any;
use axum::Router;
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};

/// Snapshot request posted into the core event loop.
#[derive(Debug)]
pub(crate) struct StatusRequest {
    pub(crate) reply: oneshot::Sender<StatusSnapshot>,
}

/// Top-level status document.
#[derive(Debug, Default, Serialize)]
pub(crate) struct StatusSnapshot {
    pub(crate) nodes: BTreeMap<String, NodeStatus>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct NodeStatus {
    pub(crate) addr: String,
    pub(crate) proto_ver: ProtoVerStatus,
    /// Serialized as a string for compatibility with existing consumers.
    pub(crate) tg: String,
    #[serde(rename = "monitoredTGs")]
    pub(crate) monitored_tgs: Vec<u32>,
    pub(crate) is_talker: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ProtoVerStatus {
    pub(crate) major_ver: u16,
    pub(crate) minor_ver: u16,
}

/// Run the status endpoint on an already-bound listener.
pub(crate) async fn serve(
    listener: TcpListener,
    status_tx: mpsc::UnboundedSender<StatusRequest>,
) {
    let app = Router::new()
        .route("/status", any(status_handler))
        .fallback(not_found)
        .with_state(status_tx);
    if let Err(err) = axum::serve(listener, app).await {
        tracing::warn!(error = %err, "status endpoint terminated");
    }
}

async fn status_handler(
    State(status_tx): State<mpsc::UnboundedSender<StatusRequest>>,
    method: Method,
) -> Response {
    match method {
        Method::GET | Method::HEAD => {
            let (reply, rx) = oneshot::channel();
            if status_tx.send(StatusRequest { reply }).is_err() {
                return StatusCode::SERVICE_UNAVAILABLE.into_response();
            }
            let Ok(snapshot) = rx.await else {
                return StatusCode::SERVICE_UNAVAILABLE.into_response();
            };
            let body = match serde_json::to_string(&snapshot) {
                Ok(body) => body,
                Err(err) => {
                    tracing::warn!(error = %err, "failed to serialize status snapshot");
                    return StatusCode::INTERNAL_SERVER_ERROR.into_response();
                }
            };
            let body = if method == Method::HEAD {
                String::new()
            } else {
                body
            };
            (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "application/json")],
                body,
            )
                .into_response()
        }
        other => (
            StatusCode::NOT_IMPLEMENTED,
            Json(json!({ "msg": format!("{other}: Method not implemented") })),
        )
            .into_response(),
    }
}

async fn not_found() -> Response {
    (StatusCode::NOT_FOUND, Json(json!({ "msg": "Not found!" }))).into_response()
}
