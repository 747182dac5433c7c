//! End-to-end conformance scenarios (spec §8) run against the fixed
//! protocol in [`tablerpc_conformance::build_protocol`], over both
//! transports, against in-process servers (no subprocess involved — the
//! pipe transport runs over a `tokio::io::duplex`, the HTTP transport
//! against a loopback `TcpListener`).

use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Request, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client as LegacyClient;
use hyper_util::rt::TokioExecutor;

use tablerpc_conformance::build_protocol;
use tablerpc_core::client::http::HttpClient;
use tablerpc_core::client::pipe::PipeClient;
use tablerpc_core::codec::build_request_batch;
use tablerpc_core::constants::{CONTENT_TYPE_ARROW_STREAM, KEY_STREAM_STATE};
use tablerpc_core::dispatch::http::HttpDispatchConfig;
use tablerpc_core::ipc::{write_stream, Schema};
use tablerpc_core::registry::Row;
use tablerpc_core::server::http::{build_router, HttpServerConfig};
use tablerpc_core::server::pipe::PipeServer;
use tablerpc_core::Value;

async fn spawn_pipe_client() -> PipeClient<tokio::io::DuplexStream> {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let protocol = Arc::new(build_protocol());
    tokio::spawn(async move {
        let (reader, writer) = tokio::io::split(server_io);
        PipeServer::new(protocol).serve(reader, writer).await.unwrap();
    });
    PipeClient::new(client_io)
}

async fn spawn_http_client() -> (HttpClient, String) {
    spawn_http_client_with_config(HttpServerConfig::default()).await
}

async fn spawn_http_client_with_config(config: HttpServerConfig) -> (HttpClient, String) {
    let protocol = Arc::new(build_protocol());
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = build_router(protocol, config);
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    let base_url = format!("http://{addr}");
    (HttpClient::new(base_url.clone()), base_url)
}

fn row(pairs: &[(&str, Value)]) -> Row {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

fn f64_field(name: &str) -> tablerpc_core::Field {
    tablerpc_core::Field::new(name, tablerpc_core::DataKind::Float64, false)
}

fn schema_result() -> Schema {
    Schema::new(vec![f64_field("result")])
}

fn schema_ab() -> Schema {
    Schema::new(vec![f64_field("a"), f64_field("b")])
}

// Scenario 1 (spec §8): `add` over both transports agrees on the result.
#[tokio::test]
async fn add_agrees_across_transports() {
    let pipe = spawn_pipe_client().await;
    let (http, _base_url) = spawn_http_client().await;

    let params = row(&[("a", Value::Float64(2.5)), ("b", Value::Float64(4.25))]);

    let pipe_result = pipe
        .call("add", &schema_ab(), &schema_result(), params.clone(), None)
        .await
        .unwrap();
    let http_result = http
        .call_unary("add", &schema_ab(), &schema_result(), params, None)
        .await
        .unwrap();

    assert_eq!(pipe_result, http_result);
    assert_eq!(pipe_result["result"], Value::Float64(6.75));
}

// Scenario 2 (spec §8): a producer driven to exhaustion over the pipe
// transport emits exactly `limit` monotonically increasing rows, ticked one
// at a time by the client (the producer never learns it's done until the
// client asks for a row that isn't there).
#[tokio::test]
async fn count_producer_emits_every_row_over_pipe() {
    let pipe = spawn_pipe_client().await;
    let params_schema = Schema::new(vec![
        tablerpc_core::Field::new("limit", tablerpc_core::DataKind::Int32, false),
        tablerpc_core::Field::new("batch_size", tablerpc_core::DataKind::Int32, false),
    ]);
    let result_schema = Schema::new(vec![
        tablerpc_core::Field::new("n", tablerpc_core::DataKind::Int32, false),
        tablerpc_core::Field::new("n_squared", tablerpc_core::DataKind::Int64, false),
    ]);
    let params = row(&[("limit", Value::Int32(100_000)), ("batch_size", Value::Int32(1_000))]);

    let (_header, mut handle) = pipe
        .open_producer("count", &params_schema, params, result_schema, None, None)
        .await
        .unwrap();

    let mut rows = Vec::new();
    while let Some(r) = handle.next().await.unwrap() {
        rows.push(r);
    }
    handle.close().await.unwrap();

    assert_eq!(rows.len(), 100_000);
    for (i, window) in rows.windows(2).enumerate() {
        let (Value::Int32(a), Value::Int32(b)) = (&window[0]["n"], &window[1]["n"]) else {
            panic!("unexpected value shape at row {i}");
        };
        assert!(a < b, "rows must be strictly increasing");
    }
    assert_eq!(rows[999]["n"], Value::Int32(999));
    assert_eq!(rows[999]["n_squared"], Value::Int64(998_001));
    assert_eq!(rows[99_999]["n"], Value::Int32(99_999));
    assert_eq!(rows[99_999]["n_squared"], Value::Int64(9_999_800_001));
}

// Scenario 3 (spec §8): `scale` applies its factor to each round.
#[tokio::test]
async fn scale_exchange_multiplies_each_round() {
    let pipe = spawn_pipe_client().await;
    let params_schema = Schema::new(vec![f64_field("factor")]);
    let input_schema = Schema::new(vec![f64_field("value")]);
    let result_schema = Schema::new(vec![f64_field("value")]);

    let (_header, mut handle) = pipe
        .open_exchange(
            "scale",
            &params_schema,
            row(&[("factor", Value::Float64(2.0))]),
            input_schema,
            result_schema,
            None,
            None,
        )
        .await
        .unwrap();

    let first = handle.send(row(&[("value", Value::Float64(5.0))])).await.unwrap().unwrap();
    let second = handle.send(row(&[("value", Value::Float64(10.0))])).await.unwrap().unwrap();
    handle.close().await.unwrap();

    assert_eq!(first["value"], Value::Float64(10.0));
    assert_eq!(second["value"], Value::Float64(20.0));
}

// Scenario 4 (spec §8): `accumulate` carries running state across rounds.
#[tokio::test]
async fn accumulate_exchange_tracks_running_state() {
    let pipe = spawn_pipe_client().await;
    let input_schema = Schema::new(vec![f64_field("value")]);
    let result_schema = Schema::new(vec![
        f64_field("running_sum"),
        tablerpc_core::Field::new("exchange_count", tablerpc_core::DataKind::Int64, false),
    ]);

    let (_header, mut handle) = pipe
        .open_exchange(
            "accumulate",
            &Schema::empty(),
            Row::new(),
            input_schema,
            result_schema,
            None,
            None,
        )
        .await
        .unwrap();

    let r1 = handle.send(row(&[("value", Value::Float64(1.0))])).await.unwrap().unwrap();
    let r2 = handle.send(row(&[("value", Value::Float64(2.0))])).await.unwrap().unwrap();
    let r3 = handle.send(row(&[("value", Value::Float64(3.0))])).await.unwrap().unwrap();
    handle.close().await.unwrap();

    assert_eq!(r1["running_sum"], Value::Float64(1.0));
    assert_eq!(r1["exchange_count"], Value::Int64(1));
    assert_eq!(r2["running_sum"], Value::Float64(3.0));
    assert_eq!(r2["exchange_count"], Value::Int64(2));
    assert_eq!(r3["running_sum"], Value::Float64(6.0));
    assert_eq!(r3["exchange_count"], Value::Int64(3));
}

// Scenario 5 (spec §8): a producer that fails partway through delivers the
// rows emitted before the failure, then a handler error carrying the exact
// wire message the server produced.
#[tokio::test]
async fn producer_error_mid_stream_surfaces_after_partial_rows() {
    let pipe = spawn_pipe_client().await;
    let params_schema = Schema::new(vec![tablerpc_core::Field::new(
        "emit_before_error",
        tablerpc_core::DataKind::Int32,
        false,
    )]);
    let result_schema = Schema::new(vec![tablerpc_core::Field::new(
        "n",
        tablerpc_core::DataKind::Int32,
        false,
    )]);

    let (_header, mut handle) = pipe
        .open_producer(
            "produce_error_mid_stream",
            &params_schema,
            row(&[("emit_before_error", Value::Int32(2))]),
            result_schema,
            None,
            None,
        )
        .await
        .unwrap();

    let mut rows = Vec::new();
    let err = loop {
        match handle.next().await {
            Ok(Some(r)) => rows.push(r),
            Ok(None) => panic!("stream ended cleanly; expected a terminal error"),
            Err(e) => break e,
        }
    };

    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["n"], Value::Int32(0));
    assert_eq!(rows[1]["n"], Value::Int32(1));
    assert_eq!(
        err.to_string(),
        "ConformanceError: intentional error after 2 batches"
    );
}

// Scenario 5 (spec §8), HTTP transport: the same mid-stream failure, but
// observed through the stateless transport's deferred-error contract (spec
// §7) — the EXCEPTION batch arrives in the same response as the two rows
// that preceded it, so the client must hand back the rows before exposing
// the error rather than raising out of `open_stream`/`continue_stream`.
#[tokio::test]
async fn producer_error_mid_stream_over_http_defers_to_after_the_rows() {
    let (http, _base_url) = spawn_http_client().await;
    let params_schema = Schema::new(vec![tablerpc_core::Field::new(
        "emit_before_error",
        tablerpc_core::DataKind::Int32,
        false,
    )]);
    let result_schema = Schema::new(vec![tablerpc_core::Field::new(
        "n",
        tablerpc_core::DataKind::Int32,
        false,
    )]);

    let (_header, mut call) = http
        .open_stream(
            "produce_error_mid_stream",
            &params_schema,
            row(&[("emit_before_error", Value::Int32(2))]),
            None,
            result_schema,
            None,
            None,
        )
        .await
        .unwrap();

    assert_eq!(call.rows.len(), 2);
    assert_eq!(call.rows[0]["n"], Value::Int32(0));
    assert_eq!(call.rows[1]["n"], Value::Int32(1));
    assert!(call.is_finished(), "the error ends the stream, no continuation token");

    let err = call.take_error().expect("a deferred mid-stream error");
    assert_eq!(err.to_string(), "ConformanceError: intentional error after 2 batches");
}

// Testable property 6 (spec §8): the HTTP session infers an exchange's
// input schema from the first row it sends (no `round_input_schema` is
// given to `open_stream` here) and locks it from then on; a later round
// whose row doesn't match that inferred schema is rejected client-side,
// without a request ever reaching the server.
#[tokio::test]
async fn exchange_schema_lock_rejects_a_reshaped_row_without_hitting_the_wire() {
    let (http, _base_url) = spawn_http_client().await;
    let params_schema = Schema::new(vec![f64_field("factor")]);
    let result_schema = Schema::new(vec![f64_field("value")]);

    let (_header, call) = http
        .open_stream(
            "scale",
            &params_schema,
            row(&[("factor", Value::Float64(2.0))]),
            None,
            result_schema,
            None,
            None,
        )
        .await
        .unwrap();
    assert!(call.input_schema().is_none(), "schema isn't known until the first row");

    let (first, call) = http
        .continue_stream(&call, Some(row(&[("value", Value::Float64(5.0))])))
        .await
        .unwrap();
    assert_eq!(first.unwrap()["value"], Value::Float64(10.0));
    let locked = call.input_schema().cloned().expect("first row locked the schema");
    assert_eq!(locked.names(), vec!["value"]);

    let err = http
        .continue_stream(&call, Some(row(&[("other", Value::Float64(1.0))])))
        .await
        .unwrap_err();
    assert!(
        err.to_string().contains("schema changed"),
        "unexpected error: {err}"
    );
}

// Scenario 6 (spec §8): a state token survives a clean round trip but is
// rejected, with the server's exact wire message, once a single byte is
// flipped.
#[tokio::test]
async fn tampered_continuation_token_is_rejected() {
    let (http, base_url) = spawn_http_client().await;
    let params_schema = Schema::empty();
    let input_schema = Schema::new(vec![f64_field("value")]);
    let result_schema = Schema::new(vec![
        f64_field("running_sum"),
        tablerpc_core::Field::new("exchange_count", tablerpc_core::DataKind::Int64, false),
    ]);

    let (_header, call) = http
        .open_stream(
            "accumulate",
            &params_schema,
            Row::new(),
            Some(&input_schema),
            result_schema.clone(),
            None,
            None,
        )
        .await
        .unwrap();

    let (_row, call) = http.continue_stream(&call, None).await.unwrap();
    assert!(!call.is_finished(), "accumulate never signals completion on its own");
    let token = call.continuation_token().unwrap().to_string();

    let mut tampered: Vec<u8> = token.into_bytes();
    let last = tampered.len() - 1;
    tampered[last] = if tampered[last] == b'A' { b'B' } else { b'A' };
    let tampered_token = String::from_utf8(tampered).unwrap();

    let values = vec![Value::Float64(1.0)];
    let mut batch = build_request_batch(&input_schema, Some(values), "accumulate", None).unwrap();
    batch = batch.with_metadata(KEY_STREAM_STATE, tampered_token);
    let body = write_stream(&input_schema, &[batch]).unwrap();

    let raw_client: LegacyClient<HttpConnector, Full<Bytes>> =
        LegacyClient::builder(TokioExecutor::new()).build_http();
    let uri: hyper::Uri = format!("{base_url}/accumulate/exchange").parse().unwrap();
    let request = Request::post(uri)
        .header(hyper::header::CONTENT_TYPE, CONTENT_TYPE_ARROW_STREAM)
        .body(Full::new(Bytes::from(body)))
        .unwrap();

    let response = raw_client.request(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body_bytes = response.into_body().collect().await.unwrap().to_bytes();
    let message = String::from_utf8_lossy(&body_bytes);
    assert!(
        message.contains("HMAC verification failed"),
        "unexpected rejection message: {message}"
    );
}

// Testable property 8 (spec §8): a producer whose output would exceed a
// small byte budget in one `init` call stops early and hands back a
// continuation token instead; resuming via `/exchange` picks the producer
// back up from its saved state until the real end of the stream, for the
// same total row count a generous budget would have produced in one shot.
#[tokio::test]
async fn producer_over_http_resumes_across_a_byte_budget_continuation() {
    let config = HttpServerConfig {
        dispatch: HttpDispatchConfig { byte_budget: 200 },
        ..HttpServerConfig::default()
    };
    let (http, _base_url) = spawn_http_client_with_config(config).await;

    let params_schema = Schema::new(vec![
        tablerpc_core::Field::new("limit", tablerpc_core::DataKind::Int32, false),
        tablerpc_core::Field::new("batch_size", tablerpc_core::DataKind::Int32, false),
    ]);
    let result_schema = Schema::new(vec![
        tablerpc_core::Field::new("n", tablerpc_core::DataKind::Int32, false),
        tablerpc_core::Field::new("n_squared", tablerpc_core::DataKind::Int64, false),
    ]);
    let params = row(&[("limit", Value::Int32(500)), ("batch_size", Value::Int32(1))]);

    let (_header, mut call) = http
        .open_stream("count", &params_schema, params, None, result_schema, None, None)
        .await
        .unwrap();

    let mut rounds = 0;
    let mut rows = call.rows.clone();
    assert!(
        !call.is_finished(),
        "a 200-byte budget over 500 rows must not finish in the first round"
    );
    while !call.is_finished() {
        rounds += 1;
        let (_row, next_call) = http.continue_stream(&call, None).await.unwrap();
        rows.extend(next_call.rows.clone());
        call = next_call;
    }

    assert!(rounds > 1, "expected more than one continuation round, got {rounds}");
    assert_eq!(rows.len(), 500);
    for (i, r) in rows.iter().enumerate() {
        assert_eq!(r["n"], Value::Int32(i as i32));
    }
    assert_eq!(rows[499]["n_squared"], Value::Int64(499 * 499));
}

