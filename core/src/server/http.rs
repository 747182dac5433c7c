//! HTTP server (spec §4.6, §6): a stateless axum router exposing unary,
//! producer/exchange init, exchange, describe, and capabilities endpoints
//! under a configurable path prefix.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{options, post};
use axum::Router;
use tower_http::cors::CorsLayer;

use crate::constants::{CONTENT_ENCODING_ZSTD, CONTENT_TYPE_ARROW_STREAM, HEADER_MAX_REQUEST_BYTES};
use crate::dispatch::http::{dispatch_exchange, dispatch_init, HttpDispatchConfig};
use crate::dispatch::unary::dispatch_unary;
use crate::registry::Protocol;
use crate::token::TokenCodec;

/// Tunables for the HTTP server that don't belong to the dispatch layer
/// itself (spec §6): path prefix, size cap, compression, CORS.
pub struct HttpServerConfig {
    pub server_id: String,
    pub prefix: String,
    pub max_request_bytes: usize,
    pub dispatch: HttpDispatchConfig,
    /// `Some(level)` turns on zstd compression of response bodies (spec
    /// §4.6: "a non-null compression level"). `None` leaves responses
    /// uncompressed regardless of what the request sent.
    pub compression_level: Option<i32>,
    /// `Some(origin)` turns on CORS for that origin (spec §4.6: "when a
    /// configured origin is set"). `None` serves no CORS headers at all.
    pub cors_origin: Option<String>,
}

impl Default for HttpServerConfig {
    fn default() -> Self {
        HttpServerConfig {
            server_id: super::random_server_id(),
            prefix: String::new(),
            max_request_bytes: 16 * 1024 * 1024,
            dispatch: HttpDispatchConfig::default(),
            compression_level: None,
            cors_origin: None,
        }
    }
}

struct AppState {
    protocol: Arc<Protocol>,
    tokens: TokenCodec,
    config: HttpServerConfig,
}

/// Build the axum [`Router`] for `protocol`. The caller owns binding a
/// listener and calling `axum::serve` (spec leaves transport binding to the
/// embedder, same as the pipe side leaves accepting connections to the
/// embedder).
pub fn build_router(protocol: Arc<Protocol>, config: HttpServerConfig) -> Router {
    let prefix = config.prefix.trim_end_matches('/').to_string();
    let cors = match &config.cors_origin {
        Some(origin) => CorsLayer::new()
            .allow_origin(
                origin
                    .parse::<HeaderValue>()
                    .expect("configured CORS origin is a valid header value"),
            )
            .allow_methods(tower_http::cors::Any)
            .allow_headers(tower_http::cors::Any),
        None => CorsLayer::new(),
    };
    let state = Arc::new(AppState {
        protocol,
        tokens: TokenCodec::new(),
        config,
    });

    Router::new()
        .route(&format!("{prefix}/__describe__"), post(describe_handler))
        .route(&format!("{prefix}/__capabilities__"), options(capabilities_handler))
        .route(&format!("{prefix}/:method"), post(unary_handler))
        .route(&format!("{prefix}/:method/init"), post(init_handler))
        .route(&format!("{prefix}/:method/exchange"), post(exchange_handler))
        .layer(cors)
        .with_state(state)
}

fn arrow_response(state: &AppState, bytes: Vec<u8>) -> Response {
    let body = match state.config.compression_level {
        Some(level) => match zstd::stream::encode_all(bytes.as_slice(), level) {
            Ok(compressed) => {
                let mut response = Response::new(axum::body::Body::from(compressed));
                response.headers_mut().insert(
                    axum::http::header::CONTENT_ENCODING,
                    HeaderValue::from_static(CONTENT_ENCODING_ZSTD),
                );
                response.headers_mut().insert(
                    axum::http::header::CONTENT_TYPE,
                    HeaderValue::from_static(CONTENT_TYPE_ARROW_STREAM),
                );
                return response;
            }
            Err(e) => {
                tracing::warn!(error = %e, "zstd response compression failed, sending uncompressed");
                bytes
            }
        },
        None => bytes,
    };
    let mut response = Response::new(axum::body::Body::from(body));
    response.headers_mut().insert(
        axum::http::header::CONTENT_TYPE,
        HeaderValue::from_static(CONTENT_TYPE_ARROW_STREAM),
    );
    response
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, message.into()).into_response()
}

/// Reject a route whose `{method}` path segment names no registered method
/// (spec §4.6/§6: "unknown method with 404 and an error batch listing
/// available methods"). Routing itself can't enforce this — axum's `:method`
/// segment matches any string — so every stream/unary handler checks here
/// before calling into `dispatch::*`, which has no HTTP-status concept and
/// would otherwise answer 200 with the error batch as its only content.
fn check_method_known(state: &AppState, method: &str) -> Result<(), Response> {
    if state.protocol.get(method).is_some() {
        return Ok(());
    }
    let available = state.protocol.method_names().join(", ");
    let err = crate::error::RpcError::protocol(format!(
        "unknown method {method:?}; available methods: {available}"
    ));
    let schema = crate::ipc::Schema::empty();
    let body = crate::codec::build_error_batch_shaped(&schema, &err, &state.config.server_id, None)
        .and_then(|batch| crate::ipc::write_stream(&schema, &[batch]));
    Err(match body {
        Ok(bytes) => {
            let mut resp = arrow_response(state, bytes);
            *resp.status_mut() = StatusCode::NOT_FOUND;
            resp
        }
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.wire_message()),
    })
}

fn check_content_type(headers: &HeaderMap) -> Result<(), Response> {
    let content_type = headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());
    match content_type {
        Some(ct) if ct.split(';').next().unwrap_or("").trim() == CONTENT_TYPE_ARROW_STREAM => Ok(()),
        _ => Err(error_response(
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            format!("expected Content-Type: {CONTENT_TYPE_ARROW_STREAM}"),
        )),
    }
}

fn check_size(state: &AppState, body: &Bytes) -> Result<(), Response> {
    if body.len() > state.config.max_request_bytes {
        return Err(error_response(
            StatusCode::PAYLOAD_TOO_LARGE,
            format!("request body exceeds {} bytes", state.config.max_request_bytes),
        ));
    }
    Ok(())
}

fn maybe_decompress(headers: &HeaderMap, body: Bytes) -> Result<Vec<u8>, Response> {
    let encoding = headers
        .get(axum::http::header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok());
    match encoding {
        Some(CONTENT_ENCODING_ZSTD) => zstd::stream::decode_all(body.as_ref())
            .map_err(|e| error_response(StatusCode::BAD_REQUEST, format!("invalid zstd body: {e}"))),
        Some(other) => Err(error_response(
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            format!("unsupported Content-Encoding: {other}"),
        )),
        None => Ok(body.to_vec()),
    }
}

async fn unary_handler(
    State(state): State<Arc<AppState>>,
    Path(method): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(resp) = check_method_known(&state, &method) {
        return resp;
    }
    if let Err(resp) = check_content_type(&headers) {
        return resp;
    }
    if let Err(resp) = check_size(&state, &body) {
        return resp;
    }
    let bytes = match maybe_decompress(&headers, body) {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    match dispatch_unary(&state.protocol, &state.config.server_id, &bytes).await {
        Ok(out) => arrow_response(&state, out),
        Err(err) => error_response(err.http_status(), err.wire_message()),
    }
}

async fn init_handler(
    State(state): State<Arc<AppState>>,
    Path(method): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(resp) = check_method_known(&state, &method) {
        return resp;
    }
    if let Err(resp) = check_content_type(&headers) {
        return resp;
    }
    if let Err(resp) = check_size(&state, &body) {
        return resp;
    }
    let bytes = match maybe_decompress(&headers, body) {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    match dispatch_init(&state.protocol, &state.config.server_id, &state.tokens, &state.config.dispatch, &method, &bytes).await {
        Ok(out) => arrow_response(&state, out),
        Err(err) => error_response(err.http_status(), err.wire_message()),
    }
}

async fn exchange_handler(
    State(state): State<Arc<AppState>>,
    Path(method): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(resp) = check_method_known(&state, &method) {
        return resp;
    }
    if let Err(resp) = check_content_type(&headers) {
        return resp;
    }
    if let Err(resp) = check_size(&state, &body) {
        return resp;
    }
    let bytes = match maybe_decompress(&headers, body) {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    match dispatch_exchange(&state.protocol, &state.config.server_id, &state.tokens, &state.config.dispatch, &method, &bytes).await {
        Ok(out) => arrow_response(&state, out),
        Err(err) => error_response(err.http_status(), err.wire_message()),
    }
}

async fn describe_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.protocol.describe_batch(&state.config.server_id) {
        Ok(batch) => {
            let schema = batch.schema().clone();
            match crate::ipc::write_stream(&schema, &[batch]) {
                Ok(bytes) => arrow_response(&state, bytes),
                Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, err.wire_message()),
            }
        }
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, err.wire_message()),
    }
}

async fn capabilities_handler(State(state): State<Arc<AppState>>) -> Response {
    let mut response = StatusCode::NO_CONTENT.into_response();
    response.headers_mut().insert(
        HEADER_MAX_REQUEST_BYTES,
        HeaderValue::from_str(&state.config.max_request_bytes.to_string())
            .expect("decimal byte count is valid header value"),
    );
    response
}
