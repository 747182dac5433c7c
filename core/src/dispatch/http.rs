//! Stream dispatch over the HTTP transport (spec §4.6). Stateless between
//! calls: every round trip carries whatever state it needs in the request
//! body and in a signed continuation token, rather than on a live
//! connection the way the pipe transport's dispatcher does.

use std::collections::BTreeMap;

use super::{batch_to_row, row_to_values};
use crate::codec::{build_error_batch_shaped, build_log_batch, build_result_batch, parse_request_header};
use crate::constants::{DESCRIBE_METHOD_NAME, KEY_REQUEST_ID, KEY_SERVER_ID, KEY_STREAM_STATE};
use crate::error::{Result, RpcError};
use crate::ipc::{Batch, Schema};
use crate::registry::{resolve_overrides, HandlerContext, LogEntry, Method, OutputCollector, Protocol, StreamHandler};
use crate::token::TokenCodec;

/// Tunables for the HTTP producer loop (spec §4.6).
pub struct HttpDispatchConfig {
    /// Soft cap, in bytes, on the total size of data batches a single
    /// `init`/`exchange` round accumulates before yielding a continuation
    /// token instead of running the producer to completion.
    pub byte_budget: usize,
}

impl Default for HttpDispatchConfig {
    fn default() -> Self {
        HttpDispatchConfig { byte_budget: 4 * 1024 * 1024 }
    }
}

/// Handle `{prefix}/{method}/init`. `route_method` is the method name taken
/// from the URL; the request batch's own `method` metadata must agree with
/// it (spec's general wire contract that every request batch carries
/// `method` metadata, unchanged by which transport carries it).
#[tracing::instrument(skip(protocol, tokens, config, request_bytes), fields(method = %route_method))]
pub async fn dispatch_init(
    protocol: &Protocol,
    server_id: &str,
    tokens: &TokenCodec,
    config: &HttpDispatchConfig,
    route_method: &str,
    request_bytes: &[u8],
) -> Result<Vec<u8>> {
    let (_schema, mut batches) = crate::ipc::read_stream(request_bytes)?;
    let request_batch = batches
        .pop()
        .ok_or_else(|| RpcError::protocol("init request stream carries no batch"))?;

    let header = parse_request_header(&request_batch)?;
    let request_id = header.request_id.clone();

    if header.method == DESCRIBE_METHOD_NAME {
        let describe = protocol.describe_batch(server_id)?;
        let schema = describe.schema().clone();
        return crate::ipc::write_stream(&schema, &[describe]);
    }
    if header.method != route_method {
        return Err(RpcError::protocol(format!(
            "request batch method {:?} does not match route {:?}",
            header.method, route_method
        )));
    }

    let method = match protocol.get(&header.method) {
        Some(m @ (Method::Producer(_) | Method::Exchange(_))) => m,
        Some(_) => return err_stream(&Schema::empty(), "method is not stream-shaped", server_id, request_id.as_deref()),
        None => {
            let available = protocol.method_names().join(", ");
            return err_stream(
                &Schema::empty(),
                &format!("unknown method {:?}; available methods: {available}", header.method),
                server_id,
                request_id.as_deref(),
            );
        }
    };

    let params_schema = method.params_schema();
    let params = batch_to_row(&request_batch, &params_schema)?;
    let handler = method
        .stream_handler()
        .expect("producer/exchange methods carry a stream handler")
        .clone();
    let header_schema = method.header_schema().cloned();

    let mut ctx = HandlerContext::new();
    let init_result = handler.init(params.clone(), &mut ctx).await;
    let mut pending_logs = ctx.take_logs();

    let state = match init_result {
        Ok(s) => s,
        Err(err) => {
            let shape = header_schema.clone().unwrap_or_else(Schema::empty);
            return batches_to_stream(&shape, std::mem::take(&mut pending_logs), Some(err), None, server_id, request_id.as_deref());
        }
    };

    let (result_schema, is_producer) =
        resolve_overrides(&state, method.result_schema(), method.is_producer_shaped())?;

    let mut header_bytes: Option<Vec<u8>> = None;
    if let Some(hschema) = &header_schema {
        let mut hctx = HandlerContext::new();
        match handler.header_init(&params, &state, &mut hctx).await {
            Ok(row) => {
                let mut logs = std::mem::take(&mut pending_logs);
                logs.extend(hctx.take_logs());
                let values = row_to_values(hschema, &row)?;
                let batch = build_result_batch(hschema, &[values], server_id, request_id.as_deref())?;
                header_bytes = Some(batches_to_stream(hschema, logs, None, Some(batch), server_id, request_id.as_deref())?);
            }
            Err(err) => {
                let mut logs = std::mem::take(&mut pending_logs);
                logs.extend(hctx.take_logs());
                return batches_to_stream(hschema, logs, Some(err), None, server_id, request_id.as_deref());
            }
        }
    }

    let data_bytes = if is_producer {
        run_producer_loop(
            handler.as_ref(),
            state,
            &result_schema,
            None,
            tokens,
            config.byte_budget,
            server_id,
            request_id.as_deref(),
            pending_logs,
        )
        .await?
    } else {
        let round_input_schema = method.round_input_schema();
        let token = tokens.pack(&state, Some(&result_schema), Some(&round_input_schema))?;
        let mut metadata = BTreeMap::new();
        metadata.insert(KEY_SERVER_ID.to_string(), server_id.to_string());
        metadata.insert(KEY_STREAM_STATE.to_string(), token);
        if let Some(id) = &request_id {
            metadata.insert(KEY_REQUEST_ID.to_string(), id.clone());
        }
        let token_batch = Batch::empty(&result_schema, metadata)?;
        batches_to_stream(&result_schema, pending_logs, None, Some(token_batch), server_id, request_id.as_deref())?
    };

    Ok(match header_bytes {
        Some(mut h) => {
            h.extend_from_slice(&data_bytes);
            h
        }
        None => data_bytes,
    })
}

/// Handle `{prefix}/{method}/exchange`.
#[tracing::instrument(skip(protocol, tokens, config, request_bytes), fields(method = %route_method))]
pub async fn dispatch_exchange(
    protocol: &Protocol,
    server_id: &str,
    tokens: &TokenCodec,
    config: &HttpDispatchConfig,
    route_method: &str,
    request_bytes: &[u8],
) -> Result<Vec<u8>> {
    let (_schema, mut batches) = crate::ipc::read_stream(request_bytes)?;
    let request_batch = batches
        .pop()
        .ok_or_else(|| RpcError::protocol("exchange request stream carries no batch"))?;

    let header = parse_request_header(&request_batch)?;
    let request_id = header.request_id.clone();
    if header.method != route_method {
        return Err(RpcError::protocol(format!(
            "request batch method {:?} does not match route {:?}",
            header.method, route_method
        )));
    }

    let method = match protocol.get(&header.method) {
        Some(m @ (Method::Producer(_) | Method::Exchange(_))) => m,
        _ => {
            return Err(RpcError::protocol(format!(
                "unknown or non-stream method {:?}",
                header.method
            )))
        }
    };

    let token = request_batch
        .metadata_get(crate::constants::KEY_STREAM_STATE)
        .ok_or_else(|| RpcError::protocol("exchange request missing stream_state"))?;
    let unpacked = tokens.unpack(token)?;

    let registered_result_schema = method.result_schema().clone();
    let result_schema = unpacked.output_schema.clone().unwrap_or(registered_result_schema);
    let (result_schema, is_producer) =
        resolve_overrides(&unpacked.state, &result_schema, method.is_producer_shaped())?;

    let handler = method
        .stream_handler()
        .expect("producer/exchange methods carry a stream handler")
        .clone();

    if is_producer {
        let data_bytes = run_producer_loop(
            handler.as_ref(),
            unpacked.state,
            &result_schema,
            None,
            tokens,
            config.byte_budget,
            server_id,
            request_id.as_deref(),
            Vec::new(),
        )
        .await?;
        return Ok(data_bytes);
    }

    let input_schema = unpacked.input_schema.clone().unwrap_or_else(|| method.round_input_schema());
    let input_row = batch_to_row(&request_batch, &input_schema)?;

    let mut out = OutputCollector::new(false);
    let step_result = handler.step(unpacked.state, Some(input_row), &mut out).await;
    match step_result {
        Ok(next_state) => {
            let (logs, row) = out.into_parts();
            let new_token = tokens.pack(&next_state, Some(&result_schema), Some(&input_schema))?;
            let mut out_batches = Vec::new();
            for log in &logs {
                out_batches.push(build_log_batch(&log.level, &log.message, log.extra.as_ref(), server_id, request_id.as_deref())?);
            }
            match row {
                Some(row) => {
                    let values = row_to_values(&result_schema, &row)?;
                    let batch = build_result_batch(&result_schema, &[values], server_id, request_id.as_deref())?
                        .with_metadata(KEY_STREAM_STATE, new_token);
                    out_batches.push(batch);
                }
                None => {
                    let mut metadata = BTreeMap::new();
                    metadata.insert(KEY_SERVER_ID.to_string(), server_id.to_string());
                    metadata.insert(KEY_STREAM_STATE.to_string(), new_token);
                    if let Some(id) = &request_id {
                        metadata.insert(KEY_REQUEST_ID.to_string(), id.clone());
                    }
                    out_batches.push(Batch::empty(&result_schema, metadata)?);
                }
            }
            crate::ipc::write_stream(&result_schema, &out_batches)
        }
        Err(err) => {
            let error_batch = build_error_batch_shaped(&result_schema, &err, server_id, request_id.as_deref())?;
            crate::ipc::write_stream(&result_schema, &[error_batch])
        }
    }
}

async fn run_producer_loop(
    handler: &dyn StreamHandler,
    mut state: serde_json::Value,
    result_schema: &Schema,
    _input_schema: Option<&Schema>,
    tokens: &TokenCodec,
    byte_budget: usize,
    server_id: &str,
    request_id: Option<&str>,
    initial_logs: Vec<LogEntry>,
) -> Result<Vec<u8>> {
    let mut out_batches = Vec::new();
    for log in &initial_logs {
        out_batches.push(build_log_batch(&log.level, &log.message, log.extra.as_ref(), server_id, request_id)?);
    }

    let mut bytes_used = 0usize;
    loop {
        let mut out = OutputCollector::new(true);
        let step_result = handler.step(state.clone(), None, &mut out).await;
        match step_result {
            Ok(next_state) => {
                state = next_state;
                let finished = out.is_finished();
                let (logs, row) = out.into_parts();
                for log in &logs {
                    out_batches.push(build_log_batch(&log.level, &log.message, log.extra.as_ref(), server_id, request_id)?);
                }
                if let Some(row) = row {
                    let values = row_to_values(result_schema, &row)?;
                    let batch = build_result_batch(result_schema, &[values], server_id, request_id)?;
                    bytes_used += batch.approx_wire_len()?;
                    out_batches.push(batch);
                }
                if finished {
                    break;
                }
                if bytes_used > byte_budget {
                    let continuation = tokens.pack(&state, Some(result_schema), None)?;
                    let mut metadata = BTreeMap::new();
                    metadata.insert(KEY_SERVER_ID.to_string(), server_id.to_string());
                    metadata.insert(KEY_STREAM_STATE.to_string(), continuation);
                    if let Some(id) = request_id {
                        metadata.insert(KEY_REQUEST_ID.to_string(), id.to_string());
                    }
                    out_batches.push(Batch::empty(result_schema, metadata)?);
                    break;
                }
            }
            Err(err) => {
                out_batches.push(build_error_batch_shaped(result_schema, &err, server_id, request_id)?);
                break;
            }
        }
    }

    crate::ipc::write_stream(result_schema, &out_batches)
}

fn batches_to_stream(
    schema: &Schema,
    logs: Vec<LogEntry>,
    err: Option<RpcError>,
    trailing: Option<Batch>,
    server_id: &str,
    request_id: Option<&str>,
) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    for log in &logs {
        out.push(build_log_batch(&log.level, &log.message, log.extra.as_ref(), server_id, request_id)?);
    }
    if let Some(err) = err {
        out.push(build_error_batch_shaped(schema, &err, server_id, request_id)?);
    }
    if let Some(batch) = trailing {
        out.push(batch);
    }
    crate::ipc::write_stream(schema, &out)
}

fn err_stream(schema: &Schema, message: &str, server_id: &str, request_id: Option<&str>) -> Result<Vec<u8>> {
    let err = RpcError::protocol(message);
    batches_to_stream(schema, Vec::new(), Some(err), None, server_id, request_id)
}
