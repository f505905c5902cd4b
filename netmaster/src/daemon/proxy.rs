//! Follower mode: every request is forwarded to the current lock holder.

use std::sync::Arc;

use anyhow::{Result, bail};
use axum::Router;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::http::header::{CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use axum::response::{IntoResponse, Response};
use log::{error, info};

use super::{DaemonState, leader_addr};

pub fn follower_router(state: Arc<DaemonState>) -> Router {
    Router::new().fallback(proxy_handler).with_state(state)
}

async fn proxy_handler(State(s): State<Arc<DaemonState>>, req: Request) -> Response {
    match forward(&s, req).await {
        Ok(resp) => resp,
        Err(e) => {
            error!("proxy error: {e:#}");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

/// Looks the leader up on every request; a cached address goes stale on
/// failover.
async fn forward(s: &DaemonState, req: Request) -> Result<Response> {
    info!("proxy handler for {:?}", req.uri().path());
    let leader = leader_addr(s.lock.as_ref()).await?;
    if leader == s.lock.holder_id() {
        bail!("Self proxying error");
    }

    let path = req
        .uri()
        .path_and_query()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let url = format!("http://{leader}{path}");

    let (parts, body) = req.into_parts();
    let body = axum::body::to_bytes(body, usize::MAX).await?;
    let mut upstream = s.http.request(parts.method, &url);
    for (name, value) in parts.headers.iter() {
        if name != HOST && name != CONTENT_LENGTH {
            upstream = upstream.header(name.clone(), value.clone());
        }
    }
    let resp = upstream.body(body).send().await?;

    let mut out = Response::builder().status(resp.status());
    for (name, value) in resp.headers() {
        if name != TRANSFER_ENCODING && name != CONNECTION {
            out = out.header(name.clone(), value.clone());
        }
    }
    Ok(out.body(Body::from_stream(resp.bytes_stream()))?)
}
