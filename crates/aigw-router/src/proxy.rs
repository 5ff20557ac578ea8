use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::extract::{RawQuery, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, Uri, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use bytes::Bytes;
use tokio_stream::wrappers::ReceiverStream;
use tracing::info;

use aigw_common::GatewayConfig;
use aigw_core::{
    DispatchOutput, Dispatcher, GatewayError, classify_request, extract_api_key,
};

const SSE_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
const SSE_HEARTBEAT_FRAME: Bytes = Bytes::from_static(b": keep-alive\n\n");

#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<GatewayConfig>,
    pub dispatcher: Arc<Dispatcher>,
}

#[derive(Clone)]
struct RequestTraceId(String);

pub fn gateway_router(config: Arc<GatewayConfig>, dispatcher: Arc<Dispatcher>) -> Router {
    let state = GatewayState { config, dispatcher };
    Router::new()
        .route("/v1/chat/completions", post(generate))
        .route("/v1/responses", post(generate))
        .route("/v1/messages", post(generate))
        .route("/v1beta/models/{*model}", post(generate))
        .route("/v1/models", get(model_list))
        .route("/v1beta/models", get(model_list))
        .route("/admin/risk/release", post(super::release::manual_release))
        .route("/admin/risk/summary", get(super::release::risk_summary))
        .route("/admin/risk/events", get(super::release::risk_events))
        .route(
            "/admin/risk/credentials",
            get(super::release::risk_credentials),
        )
        .route("/admin/risk/policy", post(super::release::update_policy))
        .layer(middleware::from_fn_with_state(state.clone(), gateway_auth))
        .with_state(state)
}

/// Downstream auth: any of the four accepted key positions must carry the
/// configured key.  Auth material is stripped before anything else sees the
/// request.
async fn gateway_auth(
    State(state): State<GatewayState>,
    mut request: axum::http::Request<Body>,
    next: Next,
) -> Result<Response, Response> {
    let trace_id = uuid::Uuid::now_v7().to_string();
    let presented = extract_api_key(request.headers(), request.uri().query());

    strip_auth_headers(request.headers_mut());
    strip_auth_query(request.uri_mut());
    request
        .extensions_mut()
        .insert(RequestTraceId(trace_id.clone()));

    match presented {
        Some(key) if key == state.config.required_api_key => Ok(next.run(request).await),
        Some(key) => {
            info!(
                event = "auth.rejected",
                trace_id = %trace_id,
                key = %aigw_common::mask_secret(&key),
            );
            Err(error_response(&GatewayError::forbidden("invalid api key")))
        }
        None => Err(error_response(&GatewayError::auth_required(
            "missing api key",
        ))),
    }
}

fn strip_auth_headers(headers: &mut HeaderMap) {
    headers.remove(header::AUTHORIZATION);
    headers.remove("x-api-key");
    headers.remove("x-goog-api-key");
}

fn strip_auth_query(uri: &mut Uri) {
    let Some(query) = uri.query() else { return };
    if !query.contains("key=") {
        return;
    }
    let kept: Vec<&str> = query
        .split('&')
        .filter(|pair| !pair.starts_with("key="))
        .collect();
    let path = uri.path().to_string();
    let rebuilt = if kept.is_empty() {
        path
    } else {
        format!("{path}?{}", kept.join("&"))
    };
    if let Ok(new_uri) = rebuilt.parse() {
        *uri = new_uri;
    }
}

async fn generate(
    State(state): State<GatewayState>,
    method: Method,
    uri: Uri,
    request: axum::http::Request<Body>,
) -> Response {
    let trace_id = request
        .extensions()
        .get::<RequestTraceId>()
        .map(|id| id.0.clone())
        .unwrap_or_default();
    let endpoint = match classify_request(&method, uri.path()) {
        Ok(endpoint) => endpoint,
        Err(err) => return error_response(&err),
    };
    let body = match axum::body::to_bytes(request.into_body(), 50 * 1024 * 1024).await {
        Ok(bytes) => bytes,
        Err(err) => {
            return error_response(&GatewayError::bad_request(format!("body read: {err}")));
        }
    };
    let body: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(err) => {
            return error_response(&GatewayError::bad_request(format!("invalid json: {err}")));
        }
    };

    match state
        .dispatcher
        .handle_generate(endpoint, body, trace_id)
        .await
    {
        Ok(DispatchOutput::Unary(value)) => json_response(StatusCode::OK, &value),
        Ok(DispatchOutput::Stream(rx)) => sse_response(rx),
        Err(err) => error_response(&err),
    }
}

async fn model_list(
    State(state): State<GatewayState>,
    method: Method,
    uri: Uri,
    RawQuery(_query): RawQuery,
) -> Response {
    let endpoint = match classify_request(&method, uri.path()) {
        Ok(endpoint) => endpoint,
        Err(err) => return error_response(&err),
    };
    match state.dispatcher.handle_model_list(&endpoint).await {
        Ok(value) => json_response(StatusCode::OK, &value),
        Err(err) => error_response(&err),
    }
}

fn sse_response(rx: tokio::sync::mpsc::Receiver<Bytes>) -> Response {
    // Interleave heartbeats with data frames so idle streams stay alive
    // through proxies.
    let (tx, merged) = tokio::sync::mpsc::channel::<Result<Bytes, std::convert::Infallible>>(32);
    tokio::spawn(async move {
        let mut rx = rx;
        loop {
            let next = tokio::time::timeout(SSE_HEARTBEAT_INTERVAL, rx.recv()).await;
            match next {
                Ok(Some(frame)) => {
                    if tx.send(Ok(frame)).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    if tx.send(Ok(SSE_HEARTBEAT_FRAME)).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(Body::from_stream(ReceiverStream::new(merged)))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

pub(crate) fn json_response(status: StatusCode, value: &serde_json::Value) -> Response {
    let body = serde_json::to_vec(value).unwrap_or_default();
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

pub(crate) fn error_response(err: &GatewayError) -> Response {
    let mut builder = Response::builder()
        .status(err.status())
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(retry_after) = err.retry_after
        && let Ok(value) = HeaderValue::from_str(&retry_after.to_string())
    {
        builder = builder.header(header::RETRY_AFTER, value);
    }
    builder
        .body(Body::from(
            serde_json::to_vec(&err.body()).unwrap_or_default(),
        ))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
