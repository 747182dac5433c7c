//! Stream dispatch over the pipe transport (spec §4.5): one request/init
//! batch, an optional header stream, then a lockstep data loop running two
//! contiguous IPC streams (client input, server output) to completion.
//!
//! Takes the connection's read half and write half as two separate
//! generics rather than one duplex type: the data loop holds both an open
//! `FrameReader` and an open `FrameWriter` at once, and Rust's borrow
//! checker (rightly) won't let two things borrow the same `&mut T`
//! simultaneously. Splitting at the call site (`tokio::io::split`, or a
//! process child's stdout/stdin pair) sidesteps that without unsafe code.

use tokio::io::{AsyncRead, AsyncWrite};

use super::{batch_to_row, row_to_values};
use crate::codec::{build_error_batch_shaped, build_log_batch, build_result_batch, parse_request_header};
use crate::error::{Result, RpcError};
use crate::ipc::{FrameReader, FrameWriter, Schema, Value};
use crate::registry::{resolve_overrides, HandlerContext, LogEntry, Method, OutputCollector, Protocol};

/// Run one producer/exchange invocation to completion, positioned at the
/// start of that invocation's request stream. Returns once the session's
/// output stream has been closed.
///
/// I/O errors propagate as `Err` and are fatal to the pipe server loop
/// (spec §7: "a TransportError terminates the loop"); handler and protocol
/// errors are caught here and written onto the wire instead.
#[tracing::instrument(skip(protocol, reader, writer))]
pub async fn dispatch_stream<R, W>(
    protocol: &Protocol,
    server_id: &str,
    reader: &mut R,
    writer: &mut W,
) -> Result<()>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let mut request_reader = FrameReader::open(&mut *reader).await?;
    let request_batch = request_reader
        .next_batch()
        .await?
        .ok_or_else(|| RpcError::protocol("stream request carries no batch"))?;
    request_reader.drain().await?;
    drop(request_reader);

    let header = parse_request_header(&request_batch)?;
    let request_id = header.request_id.clone();

    let method = match protocol.get(&header.method) {
        Some(m @ (Method::Producer(_) | Method::Exchange(_))) => m,
        Some(_) => {
            let err = RpcError::protocol(format!("method {:?} is not stream-shaped", header.method));
            write_error_stream(writer, &Schema::empty(), &err, server_id, request_id.as_deref()).await?;
            drain_client_input(reader).await;
            return Ok(());
        }
        None => {
            let available = protocol.method_names().join(", ");
            let err = RpcError::protocol(format!(
                "unknown method {:?}; available methods: {available}",
                header.method
            ));
            write_error_stream(writer, &Schema::empty(), &err, server_id, request_id.as_deref()).await?;
            drain_client_input(reader).await;
            return Ok(());
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

    let mut state = match init_result {
        Ok(s) => s,
        Err(err) => {
            let shape = header_schema.clone().unwrap_or_else(Schema::empty);
            write_error_stream_with_logs(
                writer,
                &shape,
                &err,
                server_id,
                request_id.as_deref(),
                &pending_logs,
            )
            .await?;
            drain_client_input(reader).await;
            return Ok(());
        }
    };

    let (result_schema, is_producer) =
        resolve_overrides(&state, method.result_schema(), method.is_producer_shaped())?;

    if let Some(hschema) = &header_schema {
        let mut hctx = HandlerContext::new();
        match handler.header_init(&params, &state, &mut hctx).await {
            Ok(row) => {
                let mut logs = std::mem::take(&mut pending_logs);
                logs.extend(hctx.take_logs());
                let values = row_to_values(hschema, &row)?;
                write_header_stream(writer, hschema, &logs, &values, server_id, request_id.as_deref()).await?;
            }
            Err(err) => {
                let mut logs = std::mem::take(&mut pending_logs);
                logs.extend(hctx.take_logs());
                write_error_stream_with_logs(
                    writer,
                    hschema,
                    &err,
                    server_id,
                    request_id.as_deref(),
                    &logs,
                )
                .await?;
                drain_client_input(reader).await;
                return Ok(());
            }
        }
    } else if !pending_logs.is_empty() {
        // No header schema to ride along on: init's own logs still need
        // somewhere to go before the data loop starts, so they get a
        // minimal log-only stream of their own (empty schema).
        write_header_stream(writer, &Schema::empty(), &pending_logs, &[], server_id, request_id.as_deref())
            .await?;
    }

    let input_schema = if is_producer {
        Schema::empty()
    } else {
        match method {
            Method::Exchange(m) => m.input_schema.clone(),
            _ => params_schema.clone(),
        }
    };
    let mut input_reader = FrameReader::open(&mut *reader).await?;
    if input_reader.schema() != &input_schema {
        return Err(RpcError::protocol(
            "client input stream schema does not match the method's declared input schema",
        ));
    }
    let mut output_writer = FrameWriter::open(&mut *writer, &result_schema).await?;

    // For a producer, each iteration of this loop answers exactly one
    // zero-row tick the client wrote (spec: "the client drives it with
    // zero-row ticks"); an exchange round likewise answers one input row.
    // `ended_by_finish` distinguishes the two ways the loop can end: the
    // handler asserting `finish` (more ticks may already be in flight and
    // need draining) versus the client simply closing its input stream
    // (already at end, nothing left to read).
    let mut ended_by_finish = false;
    loop {
        let input_batch = input_reader.next_batch().await?;
        let input_row = match &input_batch {
            None => break,
            Some(b) => {
                if is_producer {
                    None
                } else {
                    Some(batch_to_row(b, &input_schema)?)
                }
            }
        };

        let mut out = OutputCollector::new(is_producer);
        let step_result = handler.step(state.clone(), input_row, &mut out).await;
        match step_result {
            Ok(next_state) => {
                state = next_state;
                let finished = out.is_finished();
                let (logs, row) = out.into_parts();
                for log in &logs {
                    let batch = build_log_batch(
                        &log.level,
                        &log.message,
                        log.extra.as_ref(),
                        server_id,
                        request_id.as_deref(),
                    )?;
                    output_writer.write_batch(&batch).await?;
                }
                if let Some(row) = row {
                    let values = row_to_values(&result_schema, &row)?;
                    let batch =
                        build_result_batch(&result_schema, &[values], server_id, request_id.as_deref())?;
                    output_writer.write_batch(&batch).await?;
                }
                if finished {
                    ended_by_finish = true;
                    break;
                }
            }
            Err(err) => {
                tracing::warn!(method = %header.method, error = %err, "stream handler returned an error");
                let error_batch =
                    build_error_batch_shaped(&result_schema, &err, server_id, request_id.as_deref())?;
                output_writer.write_batch(&error_batch).await?;
                output_writer.finish().await?;
                // Broken-pipe during drain is swallowed; any other I/O
                // fault re-raises to the server loop (spec §4.5).
                match input_reader.drain().await {
                    Ok(()) => {}
                    Err(RpcError::Transport(_)) => {}
                    Err(other) => return Err(other),
                }
                return Ok(());
            }
        }
    }

    // The client can't yet know this was the final tick (its response
    // arrives before it asks again), so it always sends one more tick
    // before observing end-of-output. Finish our output first so that
    // extra tick gets answered with end-of-stream rather than a hang, then
    // drain whatever the client still has in flight (spec: "producer
    // drain: after a producer signals finish early, the pipe server reads
    // and discards every remaining input tick before servicing the next
    // request"). When the loop ended because the client closed its own
    // input instead, that stream is already exhausted and reading it again
    // would block forever, so skip the drain.
    output_writer.finish().await?;
    if ended_by_finish {
        input_reader.drain().await?;
    }
    Ok(())
}

async fn write_error_stream<W>(
    writer: &mut W,
    schema: &Schema,
    err: &RpcError,
    server_id: &str,
    request_id: Option<&str>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_error_stream_with_logs(writer, schema, err, server_id, request_id, &[]).await
}

async fn write_error_stream_with_logs<W>(
    writer: &mut W,
    schema: &Schema,
    err: &RpcError,
    server_id: &str,
    request_id: Option<&str>,
    logs: &[LogEntry],
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut frame_writer = FrameWriter::open(&mut *writer, schema).await?;
    for log in logs {
        let batch = build_log_batch(&log.level, &log.message, log.extra.as_ref(), server_id, request_id)?;
        frame_writer.write_batch(&batch).await?;
    }
    let error_batch = build_error_batch_shaped(schema, err, server_id, request_id)?;
    frame_writer.write_batch(&error_batch).await?;
    frame_writer.finish().await?;
    Ok(())
}

async fn write_header_stream<W>(
    writer: &mut W,
    schema: &Schema,
    logs: &[LogEntry],
    row_values: &[Value],
    server_id: &str,
    request_id: Option<&str>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut frame_writer = FrameWriter::open(&mut *writer, schema).await?;
    for log in logs {
        let batch = build_log_batch(&log.level, &log.message, log.extra.as_ref(), server_id, request_id)?;
        frame_writer.write_batch(&batch).await?;
    }
    if !schema.is_empty() || !row_values.is_empty() {
        let batch = build_result_batch(schema, &[row_values.to_vec()], server_id, request_id)?;
        frame_writer.write_batch(&batch).await?;
    }
    frame_writer.finish().await?;
    Ok(())
}

/// Best-effort drain used after a prologue failure: the client will still
/// open its data-loop input stream expecting a reply, so read and discard
/// it to keep the two halves of the pipe aligned for the next request
/// (spec §4.5's "drain discipline"). I/O failures here are swallowed: the
/// session is already over.
async fn drain_client_input<R>(reader: &mut R)
where
    R: AsyncRead + Unpin,
{
    if let Ok(mut frame_reader) = FrameReader::open(&mut *reader).await {
        let _ = frame_reader.drain().await;
    }
}
