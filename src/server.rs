//! HTTP front end.
//!
//! Every path outside `/__tapedeck` is a virtualized call handed to the
//! [`CallProcessor`]. The admin routes under `/__tapedeck` take and return
//! JSON.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bounds::parse_duration;
use crate::error::TapedeckError;
use crate::model::{Headers, RequestData, ResponseData};
use crate::processor::CallProcessor;
use crate::replay::live::is_forwarded;
use crate::tape::WriteMode;

/// Path prefix reserved for the admin API.
pub const ADMIN_PREFIX: &str = "/__tapedeck";

/// Default request body limit (10 MiB).
pub const DEFAULT_MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

/// Shared handler state.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Call pipeline.
    pub processor: Arc<CallProcessor>,
    /// Largest accepted request body in bytes.
    pub max_body_size: usize,
}

impl AppState {
    /// State with the default body limit.
    #[must_use]
    pub const fn new(processor: Arc<CallProcessor>) -> Self {
        Self {
            processor,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
        }
    }

    /// Builder: set the body limit.
    #[must_use]
    pub const fn with_max_body_size(mut self, max_body_size: usize) -> Self {
        self.max_body_size = max_body_size;
        self
    }
}

/// Builds the router: admin routes plus the catch-all call handler.
pub fn build_router(state: AppState) -> Router {
    let body_limit = axum::extract::DefaultBodyLimit::max(state.max_body_size);
    Router::new()
        .route("/__tapedeck/tapes", get(list_tapes))
        .route("/__tapedeck/bounds", post(start_bounds))
        .route("/__tapedeck/bounds/{handle}", delete(stop_bounds))
        .route("/__tapedeck/flush", post(flush))
        .fallback(handle_call)
        .layer(body_limit)
        .with_state(state)
}

/// Binds `bind_addr` and serves `router` until `cancel` fires.
///
/// Returns the bound address (useful when binding port 0) and the server
/// task.
///
/// # Errors
///
/// Returns [`TapedeckError::Io`] if the listener cannot bind.
pub async fn serve(
    bind_addr: &str,
    router: Router,
    cancel: CancellationToken,
) -> Result<(SocketAddr, JoinHandle<()>), TapedeckError> {
    let listener = TcpListener::bind(bind_addr).await?;
    let bound_addr = listener.local_addr()?;
    let handle = tokio::spawn(async move {
        info!(%bound_addr, "listening");
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await
        {
            warn!(error = %e, "server stopped with error");
        }
        debug!("server shut down");
    });
    Ok((bound_addr, handle))
}

/// Normalizes a bind address: `:8080` and `8080` bind every interface.
///
/// # Errors
///
/// Returns [`TapedeckError::Usage`] if the result is not a socket address.
pub fn parse_bind_addr(input: &str) -> Result<String, TapedeckError> {
    let addr = if input.starts_with(':') {
        format!("0.0.0.0{input}")
    } else if input.parse::<u16>().is_ok() {
        format!("0.0.0.0:{input}")
    } else {
        input.to_string()
    };
    addr.parse::<SocketAddr>()
        .map_err(|e| TapedeckError::Usage(format!("invalid bind address \"{input}\": {e}")))?;
    Ok(addr)
}

// ============================================================================
// Virtualized calls
// ============================================================================

async fn handle_call(State(state): State<AppState>, request: Request) -> Response {
    if request.uri().path().starts_with(ADMIN_PREFIX) {
        return StatusCode::NOT_FOUND.into_response();
    }
    let call = match to_request_data(request, state.max_body_size).await {
        Ok(call) => call,
        Err(response) => return response,
    };
    to_response(state.processor.handle(&call).await)
}

async fn to_request_data(request: Request, limit: usize) -> Result<RequestData, Response> {
    let (parts, body) = request.into_parts();
    let url = parts
        .uri
        .path_and_query()
        .map_or_else(|| parts.uri.path().to_string(), |pq| pq.as_str().to_string());
    let headers: Headers = parts
        .headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect();
    let bytes = axum::body::to_bytes(body, limit).await.map_err(|e| {
        debug!(error = %e, "request body rejected");
        (StatusCode::PAYLOAD_TOO_LARGE, format!("request body exceeds {limit} bytes")).into_response()
    })?;
    let mut call = RequestData::new(parts.method.as_str(), url);
    call.headers = headers;
    call.body = String::from_utf8_lossy(&bytes).into_owned();
    Ok(call)
}

fn to_response(data: ResponseData) -> Response {
    let status = StatusCode::from_u16(data.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = Response::new(Body::from(data.body));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    for entry in data.headers.iter().filter(|e| is_forwarded(&e.name)) {
        match (
            HeaderName::from_bytes(entry.name.as_bytes()),
            HeaderValue::from_str(&entry.value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.append(name, value);
            }
            _ => debug!(header = %entry.name, "dropping unrepresentable response header"),
        }
    }
    response
}

// ============================================================================
// Admin API
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TapeSummary {
    name: String,
    chapters: usize,
    mode: WriteMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    routing_url: Option<String>,
    always_live: bool,
}

async fn list_tapes(State(state): State<AppState>) -> Json<Vec<TapeSummary>> {
    let tapes = state
        .processor
        .catalog()
        .tapes()
        .iter()
        .map(|handle| {
            let tape = handle.lock();
            TapeSummary {
                name: tape.name.clone(),
                chapters: tape.chapters.len(),
                mode: tape.mode,
                routing_url: tape.routing_url.clone(),
                always_live: tape.always_live,
            }
        })
        .collect();
    Json(tapes)
}

#[derive(Debug, Deserialize)]
struct StartBounds {
    handle: String,
    #[serde(default)]
    tapes: Vec<String>,
    #[serde(default)]
    duration: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BoundsStarted {
    handle: String,
    tapes: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn bad_request(message: String) -> Response {
    (StatusCode::BAD_REQUEST, Json(ErrorBody { error: message })).into_response()
}

async fn start_bounds(State(state): State<AppState>, Json(body): Json<StartBounds>) -> Response {
    if body.handle.trim().is_empty() {
        return bad_request("handle must not be empty".to_string());
    }
    let duration = match body.duration.as_deref().map(parse_duration).transpose() {
        Ok(duration) => duration,
        Err(e) => return bad_request(format!("invalid duration: {e}")),
    };
    let catalog = state.processor.catalog();
    if let Some(unknown) = body.tapes.iter().find(|t| catalog.get(t).is_none()) {
        return bad_request(format!("unknown tape '{unknown}'"));
    }
    let bounds = state.processor.bounds().start(body.handle.trim(), body.tapes, duration);
    let started = BoundsStarted {
        handle: bounds.handle().to_string(),
        tapes: bounds.tapes().to_vec(),
        expires_at: bounds.expires_at(),
    };
    (StatusCode::CREATED, Json(started)).into_response()
}

async fn stop_bounds(State(state): State<AppState>, Path(handle): Path<String>) -> StatusCode {
    if state.processor.bounds().disable(&handle) {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn flush(State(state): State<AppState>) -> StatusCode {
    state.processor.catalog().flush().await;
    StatusCode::NO_CONTENT
}
