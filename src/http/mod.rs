//! RepliKV HTTP front-end.
//!
//! Translates client HTTP requests into actor submissions and waits on the
//! per-request completion signal. On a backup, reads are answered straight
//! from the local store and writes are rejected.

use std::net::SocketAddr;

use crate::replication::{ReplicaHandle, Role};
use crate::server::{RequestEntry, Response};
use crate::{pf_info, pf_trace};
use crate::utils::RepliKvError;

use axum::extract::{Path, State};
use axum::http::{Method, StatusCode};
use axum::routing::any;
use axum::{Json, Router};

use serde::Serialize;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time;

/// JSON reply body; absent fields are omitted from the serialization.
#[derive(Debug, Serialize)]
struct ApiReply {
    #[serde(skip_serializing_if = "Option::is_none")]
    key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl ApiReply {
    fn ok(key: impl Into<String>, value: impl Into<String>) -> Self {
        ApiReply {
            key: Some(key.into()),
            value: Some(value.into()),
            error: None,
        }
    }

    fn err(error: impl Into<String>) -> Self {
        ApiReply {
            key: None,
            value: None,
            error: Some(error.into()),
        }
    }
}

/// Maps an operation `Response` to an HTTP status and JSON body. A failed
/// read ("Key not found") stays a 500 carrying the error string, preserved
/// for compatibility.
fn reply_of(resp: Response) -> (StatusCode, Json<ApiReply>) {
    if resp.success {
        (StatusCode::OK, Json(ApiReply::ok(resp.key, resp.value)))
    } else {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiReply::err(resp.error)),
        )
    }
}

/// Splits a write path into key and value. The key is the first segment;
/// any further segments are rejoined, so values may contain `/`.
fn split_write_path(path: &str) -> Option<(&str, &str)> {
    let (key, value) = path.split_once('/')?;
    if key.is_empty() || value.is_empty() {
        return None;
    }
    Some((key, value))
}

/// Builds the front-end router over the single wildcard route.
pub(crate) fn router(handle: ReplicaHandle) -> Router {
    Router::new()
        .route("/*path", any(dispatch))
        .fallback(missing_key)
        .with_state(handle)
}

async fn missing_key() -> (StatusCode, Json<ApiReply>) {
    (StatusCode::BAD_REQUEST, Json(ApiReply::err("Missing key")))
}

async fn dispatch(
    State(handle): State<ReplicaHandle>,
    method: Method,
    Path(path): Path<String>,
) -> (StatusCode, Json<ApiReply>) {
    match method {
        Method::GET => handle_read(handle, path).await,
        Method::POST => handle_write(handle, path).await,
        _ => (
            StatusCode::METHOD_NOT_ALLOWED,
            Json(ApiReply::err("Method not allowed")),
        ),
    }
}

/// `GET /<key>`: quorum read through the actor on the primary,
/// staleness-tolerant local read on a backup.
async fn handle_read(
    handle: ReplicaHandle,
    path: String,
) -> (StatusCode, Json<ApiReply>) {
    if path.is_empty() || path.contains('/') {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiReply::err("Malformed read path")),
        );
    }

    match handle.role() {
        Role::Backup => reply_of(handle.local_read(&path)),
        Role::Primary => {
            submit_and_await(handle, RequestEntry::read(path)).await
        }
    }
}

/// `POST /<key>/<value...>`: replicated write through the actor; rejected
/// on a backup.
async fn handle_write(
    handle: ReplicaHandle,
    path: String,
) -> (StatusCode, Json<ApiReply>) {
    let Some((key, value)) = split_write_path(&path) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiReply::err("Missing value")),
        );
    };

    if handle.role() == Role::Backup {
        return (
            StatusCode::FORBIDDEN,
            Json(ApiReply::err("Cannot write to a backup replica")),
        );
    }

    submit_and_await(handle, RequestEntry::write(key, value)).await
}

/// Submits a request to the actor and parks on its completion signal under
/// the configured timeout.
async fn submit_and_await(
    handle: ReplicaHandle,
    entry: RequestEntry,
) -> (StatusCode, Json<ApiReply>) {
    pf_trace!("http"; "submitting {:?} '{}' (last assigned LSN {})",
                      entry.kind, entry.key, handle.current_lsn());

    let rx_done = match handle.submit(entry) {
        Ok(rx_done) => rx_done,
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiReply::err(e.to_string())),
            )
        }
    };

    match time::timeout(handle.req_timeout(), rx_done).await {
        Ok(Ok(resp)) => reply_of(resp),
        Ok(Err(_)) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiReply::err("Replica shut down")),
        ),
        // the in-flight replication is not cancelled; its completion will
        // simply go unheard
        Err(_) => (
            StatusCode::REQUEST_TIMEOUT,
            Json(ApiReply::err("Request timed out")),
        ),
    }
}

/// Serves the HTTP front-end until the termination signal fires.
pub async fn serve_http(
    handle: ReplicaHandle,
    api_addr: SocketAddr,
    mut rx_term: watch::Receiver<bool>,
) -> Result<(), RepliKvError> {
    let listener = TcpListener::bind(api_addr).await?;
    pf_info!("http"; "serving client API on '{}'", api_addr);

    axum::serve(listener, router(handle))
        .with_graceful_shutdown(async move {
            let _ = rx_term.changed().await;
        })
        .await?;
    Ok(())
}

#[cfg(test)]
mod http_tests {
    use super::*;

    #[test]
    fn write_path_splitting() {
        assert_eq!(split_write_path("k/v"), Some(("k", "v")));
        assert_eq!(split_write_path("k/v/with/slashes"), Some(("k", "v/with/slashes")));
        assert_eq!(split_write_path("k"), None);
        assert_eq!(split_write_path("k/"), None);
        assert_eq!(split_write_path("/v"), None);
    }

    #[test]
    fn reply_serialization_omits_absent_fields() {
        let ok = serde_json::to_string(&ApiReply::ok("k", "v")).unwrap();
        assert_eq!(ok, r#"{"key":"k","value":"v"}"#);

        let err = serde_json::to_string(&ApiReply::err("Key not found")).unwrap();
        assert_eq!(err, r#"{"error":"Key not found"}"#);
    }
}
