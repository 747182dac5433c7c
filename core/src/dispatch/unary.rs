//! Unary dispatch (spec §4.4): one request stream in, one response stream out.

use super::{batch_to_row, row_to_values};
use crate::codec::{build_error_batch_shaped, build_log_batch, build_result_batch, parse_request_header};
use crate::constants::DESCRIBE_METHOD_NAME;
use crate::error::{Result, RpcError};
use crate::ipc::Schema;
use crate::registry::{HandlerContext, Method, Protocol};

/// Run one unary call end to end and return the bytes of the response IPC
/// stream. Never returns `Err` for a handler failure — those become an
/// error batch on the wire; it only returns `Err` for a genuine transport
/// fault the caller must treat as unrecoverable.
#[tracing::instrument(skip(protocol, request_bytes), fields(method = tracing::field::Empty))]
pub async fn dispatch_unary(
    protocol: &Protocol,
    server_id: &str,
    request_bytes: &[u8],
) -> Result<Vec<u8>> {
    let (_schema, mut batches) = crate::ipc::read_stream(request_bytes)?;
    let request_batch = batches
        .pop()
        .ok_or_else(|| RpcError::protocol("unary request stream carries no batch"))?;

    let header = parse_request_header(&request_batch)?;
    let request_id = header.request_id.as_deref();
    tracing::Span::current().record("method", tracing::field::display(&header.method));

    if header.method == DESCRIBE_METHOD_NAME {
        let describe = protocol.describe_batch(server_id)?;
        let schema = describe.schema().clone();
        return crate::ipc::write_stream(&schema, &[describe]);
    }

    let method = match protocol.get(&header.method) {
        Some(m) => m,
        None => {
            let available = protocol.method_names().join(", ");
            let err = RpcError::protocol(format!(
                "unknown method {:?}; available methods: {available}",
                header.method
            ));
            let error_batch = build_error_batch_shaped(&Schema::empty(), &err, server_id, request_id)?;
            return crate::ipc::write_stream(&Schema::empty(), &[error_batch]);
        }
    };

    let unary = match method {
        Method::Unary(u) => u,
        _ => {
            let err = RpcError::protocol(format!("method {:?} is not unary", header.method));
            let error_batch = build_error_batch_shaped(method.result_schema(), &err, server_id, request_id)?;
            return crate::ipc::write_stream(method.result_schema(), &[error_batch]);
        }
    };

    let params = batch_to_row(&request_batch, &unary.params_schema)?;
    let mut ctx = HandlerContext::new();
    let result = unary.handler.call(params, &mut ctx).await;
    let logs = ctx.take_logs();
    let result_schema = unary.result_schema.clone();

    let mut out_batches = Vec::with_capacity(logs.len() + 1);
    for log in &logs {
        out_batches.push(build_log_batch(
            &log.level,
            &log.message,
            log.extra.as_ref(),
            server_id,
            request_id,
        )?);
    }

    match result {
        Ok(row) => {
            let rows = if unary.has_return {
                vec![row_to_values(&result_schema, &row)?]
            } else {
                vec![]
            };
            out_batches.push(build_result_batch(&result_schema, &rows, server_id, request_id)?);
        }
        Err(err) => {
            tracing::warn!(error = %err, "unary handler returned an error");
            out_batches.push(build_error_batch_shaped(&result_schema, &err, server_id, request_id)?);
        }
    }

    crate::ipc::write_stream(&result_schema, &out_batches)
}
