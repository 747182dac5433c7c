//! HTTP client (spec §4.6, §4.7): stateless request/response calls against
//! a tablerpc HTTP server, threading the continuation token returned from
//! `/init` back through `/exchange` until the server signals completion by
//! omitting `stream_state` from its last batch.

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Request, Response, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client as LegacyClient;
use hyper_util::rt::TokioExecutor;

use crate::codec::{build_request_batch, classify_batch, dispatch_log_or_error, schema_from_row, IncomingBatch};
use crate::constants::{CONTENT_TYPE_ARROW_STREAM, KEY_STREAM_STATE};
use crate::error::{Result, RpcError};
use crate::ipc::Schema;
use crate::registry::Row;
use crate::dispatch::{batch_to_row, row_to_values};

/// Tunables for an [`HttpClient`] that don't belong to the per-call codec
/// layer itself (mirrors [`crate::server::http::HttpServerConfig`] on the
/// server side): where the server lives and what path prefix it's mounted
/// under.
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub base_url: String,
    pub prefix: String,
}

impl HttpClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        HttpClientConfig { base_url: base_url.into(), prefix: String::new() }
    }
}

/// A stateless HTTP client for one tablerpc server. Cheap to clone: the
/// inner hyper client pools connections itself.
#[derive(Clone)]
pub struct HttpClient {
    inner: LegacyClient<HttpConnector, Full<Bytes>>,
    base_url: String,
    prefix: String,
}

impl HttpClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_config(HttpClientConfig::new(base_url))
    }

    pub fn with_config(config: HttpClientConfig) -> Self {
        HttpClient {
            inner: LegacyClient::builder(TokioExecutor::new()).build_http(),
            base_url: config.base_url,
            prefix: config.prefix,
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    fn uri_for(&self, path: &str) -> Result<Uri> {
        let full = format!("{}{}{}", self.base_url, self.prefix, path);
        full.parse()
            .map_err(|e| RpcError::protocol(format!("invalid URL {full:?}: {e}")))
    }

    async fn post(&self, path: &str, body: Vec<u8>) -> Result<Vec<u8>> {
        let request = Request::post(self.uri_for(path)?)
            .header(hyper::header::CONTENT_TYPE, CONTENT_TYPE_ARROW_STREAM)
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| RpcError::protocol(format!("failed to build request: {e}")))?;

        let response: Response<Incoming> = self
            .inner
            .request(request)
            .await
            .map_err(|e| RpcError::Transport(std::io::Error::new(std::io::ErrorKind::Other, e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let bytes = response
                .into_body()
                .collect()
                .await
                .map(|c| c.to_bytes())
                .unwrap_or_default();
            let message = String::from_utf8_lossy(&bytes).into_owned();
            return Err(RpcError::protocol(format!("server returned {status}: {message}")));
        }

        let bytes = response
            .into_body()
            .collect()
            .await
            .map_err(|e| RpcError::Transport(std::io::Error::new(std::io::ErrorKind::Other, e)))?
            .to_bytes();
        Ok(bytes.to_vec())
    }

    /// Call a unary method.
    pub async fn call_unary(
        &self,
        method: &str,
        params_schema: &Schema,
        result_schema: &Schema,
        params: Row,
        request_id: Option<&str>,
    ) -> Result<Row> {
        let values = row_to_values(params_schema, &params)?;
        let request = build_request_batch(params_schema, Some(values), method, request_id)?;
        let body = crate::ipc::write_stream(params_schema, &[request])?;
        let response_bytes = self.post(&format!("/{method}"), body).await?;
        let (_schema, batches) = crate::ipc::read_stream(&response_bytes)?;

        let mut row = None;
        for batch in &batches {
            if let Some(data) = dispatch_log_or_error(batch, |_l, _m, _e| {})? {
                row = Some(batch_to_row(data, result_schema)?);
            }
        }
        row.ok_or_else(|| RpcError::protocol("unary response stream carried no result batch"))
    }

    /// Fetch the server's method table.
    pub async fn describe(&self) -> Result<crate::ipc::Batch> {
        let bytes = self.post("/__describe__", Vec::new()).await?;
        let (_schema, mut batches) = crate::ipc::read_stream(&bytes)?;
        batches
            .pop()
            .ok_or_else(|| RpcError::protocol("describe response carries no batch"))
    }

    /// Start a producer/exchange invocation. `params_schema`/`params` shape
    /// the one-shot init request (e.g. `{factor}`); `round_input_schema` is
    /// `None` for a producer (no further input is ever sent) or
    /// `Some({value, ...})` for an exchange's per-round data rows — a
    /// separate schema from `params_schema` (spec §3). Returns the header
    /// row (if the method declares a header schema) and a [`StreamCall`]
    /// carrying whatever rows and continuation state `/init` produced.
    pub async fn open_stream(
        &self,
        method: &str,
        params_schema: &Schema,
        params: Row,
        round_input_schema: Option<&Schema>,
        result_schema: Schema,
        header_schema: Option<&Schema>,
        request_id: Option<&str>,
    ) -> Result<(Option<Row>, StreamCall)> {
        let values = row_to_values(params_schema, &params)?;
        let request = build_request_batch(params_schema, Some(values), method, request_id)?;
        let body = crate::ipc::write_stream(params_schema, &[request])?;
        let response_bytes = self.post(&format!("/{method}/init"), body).await?;

        self.parse_stream_response(
            method,
            result_schema,
            header_schema,
            round_input_schema.cloned(),
            &response_bytes,
        )
    }

    /// Continue a producer/exchange invocation with the continuation token
    /// and (for an exchange) the next input row.
    ///
    /// The first round that carries a row locks the session's input schema,
    /// inferring it from that row's keys and value kinds when the caller
    /// didn't already pin one down via `open_stream`'s `round_input_schema`
    /// (spec: the HTTP session "infers an input schema from the first row's
    /// keys"). Every later round's row is checked against that locked schema
    /// client-side, before anything is sent: a mismatch is a `ProtocolError`
    /// that never touches the wire (spec's exchange schema-lock invariant).
    pub async fn continue_stream(
        &self,
        call: &StreamCall,
        input: Option<Row>,
    ) -> Result<(Option<Row>, StreamCall)> {
        let token = call
            .continuation
            .clone()
            .ok_or_else(|| RpcError::protocol("stream already completed; no continuation token"))?;

        let locked_schema = match (&call.input_schema, &input) {
            (Some(locked), Some(row)) => {
                let inferred = schema_from_row(row);
                if &inferred != locked {
                    return Err(RpcError::protocol(format!(
                        "exchange input schema changed mid-session: locked to [{}], got [{}]",
                        locked.names().join(", "),
                        inferred.names().join(", "),
                    )));
                }
                locked.clone()
            }
            (None, Some(row)) => schema_from_row(row),
            (Some(locked), None) => locked.clone(),
            (None, None) => Schema::empty(),
        };
        let values = match &input {
            Some(row) => Some(row_to_values(&locked_schema, row)?),
            None => None,
        };
        let mut batch = crate::codec::build_request_batch(&locked_schema, values, &call.method, None)?;
        batch = batch.with_metadata(KEY_STREAM_STATE, token);
        let body = crate::ipc::write_stream(&locked_schema, &[batch])?;
        let response_bytes = self.post(&format!("/{}/exchange", call.method), body).await?;

        self.parse_stream_response(
            &call.method,
            call.result_schema.clone(),
            call.header_schema.as_ref(),
            Some(locked_schema),
            &response_bytes,
        )
    }

    fn parse_stream_response(
        &self,
        method: &str,
        result_schema: Schema,
        header_schema: Option<&Schema>,
        input_schema: Option<Schema>,
        response_bytes: &[u8],
    ) -> Result<(Option<Row>, StreamCall)> {
        let mut cursor = response_bytes;
        let mut header_row = None;

        if let Some(hschema) = header_schema {
            let (_schema, batches, consumed) = crate::ipc::read_stream_prefix(cursor)?;
            for batch in &batches {
                if let Some(data) = dispatch_log_or_error(batch, |_l, _m, _e| {})? {
                    header_row = Some(batch_to_row(data, hschema)?);
                }
            }
            cursor = &cursor[consumed..];
        }

        let (_schema, batches) = crate::ipc::read_stream(cursor)?;
        let mut rows = Vec::new();
        let mut continuation = None;
        let mut error = None;
        for batch in &batches {
            if let Some(token) = batch.metadata_get(KEY_STREAM_STATE) {
                continuation = Some(token.to_string());
                if batch.row_count() == 0 {
                    continue;
                }
            }
            // A terminal EXCEPTION batch arriving alongside rows or a
            // continuation token is deferred rather than raised here (spec
            // §7): the caller drains the rows this round already carries,
            // and the error surfaces once it asks to continue past them.
            match classify_batch(batch)? {
                IncomingBatch::Error(err) => error = Some(err),
                IncomingBatch::Data(data) => rows.push(batch_to_row(data, &result_schema)?),
                IncomingBatch::Log { .. } => {}
            }
        }
        if let Some(err) = error {
            // Neither data nor a continuation accompanied the error in this
            // round: nothing for the caller to drain first, so raise now
            // rather than defer (spec §7's "throws immediately otherwise").
            if rows.is_empty() && continuation.is_none() {
                return Err(err);
            }
            continuation = None;
            return Ok((
                header_row,
                StreamCall {
                    method: method.to_string(),
                    result_schema,
                    header_schema: header_schema.cloned(),
                    input_schema,
                    rows,
                    continuation,
                    error: Some(err),
                },
            ));
        }

        Ok((
            header_row,
            StreamCall {
                method: method.to_string(),
                result_schema,
                header_schema: header_schema.cloned(),
                input_schema,
                rows,
                continuation,
                error: None,
            },
        ))
    }
}

/// One round of a producer/exchange invocation: the rows the server sent
/// back, plus whatever is needed to ask for more (spec §4.6's continuation
/// token handshake). `continuation` is `None` once the server has nothing
/// further to send.
///
/// `error` carries a mid-stream handler error that arrived alongside `rows`
/// (spec §7): the caller is expected to consume `rows` first and only then
/// call [`StreamCall::take_error`] to observe the failure, mirroring how the
/// pipe transport's iterator surfaces a mid-stream error only once the rows
/// already in flight have been read.
pub struct StreamCall {
    method: String,
    result_schema: Schema,
    header_schema: Option<Schema>,
    input_schema: Option<Schema>,
    pub rows: Vec<Row>,
    continuation: Option<String>,
    error: Option<RpcError>,
}

impl StreamCall {
    /// Take the deferred mid-stream error, if one arrived alongside this
    /// round's rows. Callers should drain `rows` before checking this.
    pub fn take_error(&mut self) -> Option<RpcError> {
        self.error.take()
    }

    pub fn is_finished(&self) -> bool {
        self.continuation.is_none()
    }

    /// The raw continuation token, if the stream isn't finished. Exposed
    /// mainly for tests that need to exercise the server's handling of a
    /// tampered or otherwise malformed token.
    pub fn continuation_token(&self) -> Option<&str> {
        self.continuation.as_deref()
    }

    /// The exchange input schema locked in so far: `None` before any round
    /// has carried a row to infer it from, `Some` once either the caller
    /// supplied one to `open_stream` or [`HttpClient::continue_stream`]
    /// inferred one from a row.
    pub fn input_schema(&self) -> Option<&Schema> {
        self.input_schema.as_ref()
    }
}
