//! A fixed multi-method protocol exercising every dispatch path described
//! by the core crate: a unary method, a producer, two exchange methods
//! (one with a fixed per-round shape, one that accumulates state across
//! rounds), and a producer that fails partway through its output to
//! exercise mid-stream error propagation.
//!
//! Kept as a library so both server binaries (`tablerpc-pipe-server`,
//! `tablerpc-http-server`) and `tests/roundtrip.rs` build the identical
//! [`Protocol`] rather than drifting copies.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use tablerpc_core::registry::{
    ExchangeMethod, HandlerContext, Method, OutputCollector, ProducerMethod, Protocol, Row,
    StreamHandler, UnaryHandler, UnaryMethod,
};
use tablerpc_core::{DataKind, Field, RpcError, Schema};
use tablerpc_core::Result;

fn f64_field(name: &str) -> Field {
    Field::new(name, DataKind::Float64, false)
}

fn i32_field(name: &str) -> Field {
    Field::new(name, DataKind::Int32, false)
}

fn i64_field(name: &str) -> Field {
    Field::new(name, DataKind::Int64, false)
}

fn get_f64(row: &Row, key: &str) -> Result<f64> {
    match row.get(key) {
        Some(tablerpc_core::Value::Float64(v)) => Ok(*v),
        Some(tablerpc_core::Value::Int64(v)) => Ok(*v as f64),
        Some(other) => Err(RpcError::contract(format!("field {key:?} has unexpected value {other:?}"))),
        None => Err(RpcError::contract(format!("missing required field {key:?}"))),
    }
}

fn get_i32(row: &Row, key: &str) -> Result<i32> {
    match row.get(key) {
        Some(tablerpc_core::Value::Int32(v)) => Ok(*v),
        Some(tablerpc_core::Value::Int64(v)) => Ok(*v as i32),
        Some(other) => Err(RpcError::contract(format!("field {key:?} has unexpected value {other:?}"))),
        None => Err(RpcError::contract(format!("missing required field {key:?}"))),
    }
}

/// `add(a: f64, b: f64) -> f64` (spec §8 scenario 1).
struct Add;

#[async_trait]
impl UnaryHandler for Add {
    async fn call(&self, params: Row, _ctx: &mut HandlerContext) -> Result<Row> {
        let a = get_f64(&params, "a")?;
        let b = get_f64(&params, "b")?;
        let mut out = Row::new();
        out.insert("result".to_string(), tablerpc_core::Value::Float64(a + b));
        Ok(out)
    }
}

/// `count(limit: i32, batch_size: i32) -> (n: i32, n_squared: i64)` (spec §8
/// scenario 2). `batch_size` is accepted for describe-level fidelity with
/// the source system's batching knob; this handler emits one row per tick
/// regardless, since the producer dispatcher already ticks the client at
/// whatever cadence it likes.
struct Count;

#[async_trait]
impl StreamHandler for Count {
    async fn init(&self, params: Row, _ctx: &mut HandlerContext) -> Result<serde_json::Value> {
        let limit = get_i32(&params, "limit")?;
        Ok(json!({ "next": 0, "limit": limit }))
    }

    async fn step(
        &self,
        state: serde_json::Value,
        _input: Option<Row>,
        out: &mut OutputCollector,
    ) -> Result<serde_json::Value> {
        let next = state["next"].as_i64().unwrap_or(0);
        let limit = state["limit"].as_i64().unwrap_or(0);
        if next >= limit {
            out.finish()?;
            return Ok(state);
        }
        let mut row = Row::new();
        row.insert("n".to_string(), tablerpc_core::Value::Int32(next as i32));
        row.insert("n_squared".to_string(), tablerpc_core::Value::Int64(next * next));
        out.emit(row)?;
        Ok(json!({ "next": next + 1, "limit": limit }))
    }
}

/// `scale(factor: f64)` with input `{value: f64}`, output `{value: f64}`
/// (spec §8 scenario 3).
struct Scale;

#[async_trait]
impl StreamHandler for Scale {
    async fn init(&self, params: Row, _ctx: &mut HandlerContext) -> Result<serde_json::Value> {
        let factor = get_f64(&params, "factor")?;
        Ok(json!({ "factor": factor }))
    }

    async fn step(
        &self,
        state: serde_json::Value,
        input: Option<Row>,
        out: &mut OutputCollector,
    ) -> Result<serde_json::Value> {
        let row = input.ok_or_else(|| RpcError::contract("scale round carries no input row"))?;
        let value = get_f64(&row, "value")?;
        let factor = state["factor"].as_f64().unwrap_or(1.0);
        let mut result = Row::new();
        result.insert("value".to_string(), tablerpc_core::Value::Float64(value * factor));
        out.emit(result)?;
        Ok(state)
    }
}

/// `accumulate()` with input `{value: f64}`, output `{running_sum: f64,
/// exchange_count: i64}` (spec §8 scenario 4).
struct Accumulate;

#[async_trait]
impl StreamHandler for Accumulate {
    async fn init(&self, _params: Row, _ctx: &mut HandlerContext) -> Result<serde_json::Value> {
        Ok(json!({ "running_sum": 0.0, "exchange_count": 0 }))
    }

    async fn step(
        &self,
        state: serde_json::Value,
        input: Option<Row>,
        out: &mut OutputCollector,
    ) -> Result<serde_json::Value> {
        let row = input.ok_or_else(|| RpcError::contract("accumulate round carries no input row"))?;
        let value = get_f64(&row, "value")?;
        let running_sum = state["running_sum"].as_f64().unwrap_or(0.0) + value;
        let exchange_count = state["exchange_count"].as_i64().unwrap_or(0) + 1;
        let mut result = Row::new();
        result.insert("running_sum".to_string(), tablerpc_core::Value::Float64(running_sum));
        result.insert("exchange_count".to_string(), tablerpc_core::Value::Int64(exchange_count));
        out.emit(result)?;
        Ok(json!({ "running_sum": running_sum, "exchange_count": exchange_count }))
    }
}

/// `produce_error_mid_stream(emit_before_error: i32)` (spec §8 scenario 5):
/// emits `emit_before_error` rows of `{n: i32}` then fails.
struct ProduceErrorMidStream;

#[async_trait]
impl StreamHandler for ProduceErrorMidStream {
    async fn init(&self, params: Row, _ctx: &mut HandlerContext) -> Result<serde_json::Value> {
        let emit_before_error = get_i32(&params, "emit_before_error")?;
        Ok(json!({ "next": 0, "emit_before_error": emit_before_error }))
    }

    async fn step(
        &self,
        state: serde_json::Value,
        _input: Option<Row>,
        out: &mut OutputCollector,
    ) -> Result<serde_json::Value> {
        let next = state["next"].as_i64().unwrap_or(0);
        let emit_before_error = state["emit_before_error"].as_i64().unwrap_or(0);
        if next >= emit_before_error {
            return Err(RpcError::handler(
                "ConformanceError",
                format!("intentional error after {emit_before_error} batches"),
            ));
        }
        let mut row = Row::new();
        row.insert("n".to_string(), tablerpc_core::Value::Int32(next as i32));
        out.emit(row)?;
        Ok(json!({ "next": next + 1, "emit_before_error": emit_before_error }))
    }
}

/// Build the conformance protocol: one unary method, one producer, two
/// exchange methods, and one producer that errors mid-stream. Registered
/// in a fresh `Protocol` each call so `tests/roundtrip.rs` and both server
/// binaries always serve an identical method table.
pub fn build_protocol() -> Protocol {
    let mut protocol = Protocol::new("tablerpc-conformance");

    protocol.register(
        "add",
        Method::Unary(UnaryMethod {
            params_schema: Schema::new(vec![f64_field("a"), f64_field("b")]),
            result_schema: Schema::new(vec![f64_field("result")]),
            has_return: true,
            doc: Some("Add two floats.".to_string()),
            param_types_json: None,
            param_defaults_json: None,
            handler: Arc::new(Add),
        }),
    );

    protocol.register(
        "count",
        Method::Producer(ProducerMethod {
            params_schema: Schema::new(vec![i32_field("limit"), i32_field("batch_size")]),
            result_schema: Schema::new(vec![i32_field("n"), i64_field("n_squared")]),
            header_schema: None,
            doc: Some("Emit n and n*n for n in 0..limit.".to_string()),
            param_types_json: None,
            param_defaults_json: None,
            handler: Arc::new(Count),
        }),
    );

    protocol.register(
        "scale",
        Method::Exchange(ExchangeMethod {
            params_schema: Schema::new(vec![f64_field("factor")]),
            input_schema: Schema::new(vec![f64_field("value")]),
            result_schema: Schema::new(vec![f64_field("value")]),
            header_schema: None,
            doc: Some("Multiply each submitted value by factor.".to_string()),
            param_types_json: None,
            param_defaults_json: None,
            handler: Arc::new(Scale),
        }),
    );

    protocol.register(
        "accumulate",
        Method::Exchange(ExchangeMethod {
            params_schema: Schema::empty(),
            input_schema: Schema::new(vec![f64_field("value")]),
            result_schema: Schema::new(vec![f64_field("running_sum"), i64_field("exchange_count")]),
            header_schema: None,
            doc: Some("Running sum and round count across exchange rounds.".to_string()),
            param_types_json: None,
            param_defaults_json: None,
            handler: Arc::new(Accumulate),
        }),
    );

    protocol.register(
        "produce_error_mid_stream",
        Method::Producer(ProducerMethod {
            params_schema: Schema::new(vec![i32_field("emit_before_error")]),
            result_schema: Schema::new(vec![i32_field("n")]),
            header_schema: None,
            doc: Some("Emit emit_before_error rows then fail.".to_string()),
            param_types_json: None,
            param_defaults_json: None,
            handler: Arc::new(ProduceErrorMidStream),
        }),
    );

    protocol
}
