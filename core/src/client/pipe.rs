//! Pipe client (spec §4.5, §4.7): one request/response round trip for
//! unary calls, and an owned, long-lived session for producer/exchange
//! calls that walks the same three-stream prologue-then-data-loop shape
//! [`crate::dispatch::pipe`] implements server-side.
//!
//! Callers are expected to have already split their duplex connection into
//! independent read/write halves (e.g. `tokio::io::split`), same as the
//! server side.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::Mutex;

use crate::codec::{build_request_batch, dispatch_log_or_error};
use crate::constants::DESCRIBE_METHOD_NAME;
use crate::dispatch::{batch_to_row, row_to_values};
use crate::error::{Result, RpcError};
use crate::ipc::{Batch, FrameReader, FrameWriter, Schema, Value};
use crate::registry::Row;

/// One request/response round trip for a unary method.
pub async fn call_unary<R, W>(
    mut reader: R,
    mut writer: W,
    method: &str,
    params_schema: &Schema,
    result_schema: &Schema,
    params: Row,
    request_id: Option<&str>,
) -> Result<Row>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let values = row_to_values(params_schema, &params)?;
    let request = build_request_batch(params_schema, Some(values), method, request_id)?;
    send_single_batch(&mut writer, params_schema, &request).await?;

    let mut resp_reader = FrameReader::open(&mut reader).await?;
    read_single_result(&mut resp_reader, result_schema).await
}

/// Ask the server for its method table (spec §4.3).
pub async fn describe<R, W>(mut reader: R, mut writer: W) -> Result<Batch>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let request = build_request_batch(&Schema::empty(), None, DESCRIBE_METHOD_NAME, None)?;
    send_single_batch(&mut writer, &Schema::empty(), &request).await?;

    let mut resp_reader = FrameReader::open(&mut reader).await?;
    let batch = resp_reader
        .next_batch()
        .await?
        .ok_or_else(|| RpcError::protocol("describe response carries no batch"))?;
    resp_reader.drain().await?;
    Ok(batch)
}

async fn send_single_batch<W>(writer: &mut W, schema: &Schema, batch: &Batch) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut frame_writer = FrameWriter::open(&mut *writer, schema).await?;
    frame_writer.write_batch(batch).await?;
    frame_writer.finish().await?;
    Ok(())
}

async fn read_single_result<R>(reader: &mut FrameReader<R>, result_schema: &Schema) -> Result<Row>
where
    R: AsyncRead + Unpin,
{
    let mut row = None;
    while let Some(batch) = reader.next_batch().await? {
        if let Some(data) = dispatch_log_or_error(&batch, |_level, _message, _extra| {})? {
            row = Some(batch_to_row(data, result_schema)?);
        }
    }
    row.ok_or_else(|| RpcError::protocol("unary response stream carried no result batch"))
}

/// An open producer invocation. The server never knows in advance how many
/// rows it'll produce, so the client drives it one zero-row tick batch per
/// `next()` call (spec: "the client drives it with zero-row ticks") and
/// reads back whatever that tick produced. Since the response to a tick
/// arrives before the client can ask for another, discovering the end of
/// the stream always costs one extra round trip: the tick that finally
/// gets back end-of-stream instead of a row.
pub struct ProducerSession<R, W> {
    reader: FrameReader<R>,
    /// `None` once the session has finished — either `next()` observed
    /// end-of-stream, or the caller closed early via `into_parts()`.
    writer: Option<FrameWriter<W>>,
    /// The input side's raw half, recovered once `writer` above is
    /// finished. Kept so `into_parts()` can still hand it back even after
    /// `next()` already finished the writer internally.
    spent_writer: Option<W>,
    result_schema: Schema,
}

impl<R: AsyncRead + Unpin, W: AsyncWrite + Unpin> ProducerSession<R, W> {
    pub async fn next(&mut self) -> Result<Option<Row>> {
        let writer = match &mut self.writer {
            Some(w) => w,
            None => return Ok(None),
        };
        let tick = Batch::empty(&Schema::empty(), Default::default())?;
        writer.write_batch(&tick).await?;

        loop {
            let batch = match self.reader.next_batch().await? {
                None => {
                    let w = self.writer.take().expect("checked Some above");
                    self.spent_writer = Some(w.finish().await?);
                    return Ok(None);
                }
                Some(b) => b,
            };
            if let Some(data) = dispatch_log_or_error(&batch, |_l, _m, _e| {})? {
                return Ok(Some(batch_to_row(data, &self.result_schema)?));
            }
        }
    }

    /// Close the session, whether it ran to natural completion or is being
    /// cancelled while rows are still available. Finishing the writer
    /// before draining tells the server there are no more ticks coming, so
    /// its own early-termination drain can return instead of blocking on a
    /// tick that will never arrive (spec: "producer drain").
    pub async fn into_parts(mut self) -> Result<(R, W)> {
        if let Some(w) = self.writer.take() {
            self.spent_writer = Some(w.finish().await?);
            while self.reader.next_batch().await?.is_some() {}
        }
        Ok((
            self.reader.into_inner(),
            self.spent_writer.expect("writer is always finished by this point"),
        ))
    }
}

/// An open exchange invocation: one input row in, at most one output row
/// back, lockstep, for as many rounds as the caller likes.
pub struct ExchangeSession<R, W> {
    reader: FrameReader<R>,
    writer: FrameWriter<W>,
    input_schema: Schema,
    result_schema: Schema,
}

impl<R: AsyncRead + Unpin, W: AsyncWrite + Unpin> ExchangeSession<R, W> {
    pub async fn send(&mut self, input: Row) -> Result<Option<Row>> {
        let values = row_to_values(&self.input_schema, &input)?;
        let batch = Batch::from_rows(&self.input_schema, &[values], Default::default())?;
        self.writer.write_batch(&batch).await?;

        loop {
            let batch = match self.reader.next_batch().await? {
                None => return Ok(None),
                Some(b) => b,
            };
            if let Some(data) = dispatch_log_or_error(&batch, |_l, _m, _e| {})? {
                return Ok(Some(batch_to_row(data, &self.result_schema)?));
            }
        }
    }

    pub async fn close(self) -> Result<()> {
        self.into_parts().await.map(|_| ())
    }

    /// Finish the input side, drain any remaining output, and hand back
    /// the raw read/write halves for reuse (spec §4.7's single-flight: the
    /// lock guarding this pipe is released only once both halves are back).
    pub async fn into_parts(mut self) -> Result<(R, W)> {
        let w = self.writer.finish().await?;
        self.reader.drain().await?;
        Ok((self.reader.into_inner(), w))
    }
}

/// Read an optional header batch and hand back both its row (if any) and
/// the now-open data-loop reader/writer halves for a producer or exchange
/// invocation (spec §4.5's common prologue).
/// Runs the common prologue shared by producer and exchange sessions (spec
/// §4.5): send the one-shot init request (shaped to `params_schema`), read
/// the optional header stream, then open the data loop's input writer
/// shaped to `round_input_schema` (always empty for a producer, the
/// method's declared per-round row shape for an exchange — distinct from
/// `params_schema`, spec §3).
async fn open_data_loop<R, W>(
    mut reader: R,
    mut writer: W,
    method: &str,
    params_schema: &Schema,
    params: Row,
    round_input_schema: &Schema,
    header_schema: Option<&Schema>,
    request_id: Option<&str>,
) -> Result<(Option<Row>, FrameReader<R>, FrameWriter<W>)>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let values = row_to_values(params_schema, &params)?;
    let request = build_request_batch(params_schema, Some(values), method, request_id)?;
    send_single_batch(&mut writer, params_schema, &request).await?;

    let mut header_row = None;
    if let Some(hschema) = header_schema {
        let mut header_reader = FrameReader::open(&mut reader).await?;
        let mut row = None;
        while let Some(batch) = header_reader.next_batch().await? {
            if let Some(data) = dispatch_log_or_error(&batch, |_l, _m, _e| {})? {
                row = Some(batch_to_row(data, hschema)?);
            }
        }
        header_row = row;
    }

    let input_writer = FrameWriter::open(writer, round_input_schema).await?;
    let output_reader = FrameReader::open(reader).await?;

    Ok((header_row, output_reader, input_writer))
}

/// Open a producer invocation. `params_schema`/`params` shape the one-shot
/// init request (e.g. `{limit, batch_size}`); the data-loop input side is
/// shaped empty (spec §4.5) and driven one zero-row tick per
/// [`ProducerSession::next`] call.
pub async fn open_producer<R, W>(
    reader: R,
    writer: W,
    method: &str,
    params_schema: &Schema,
    params: Row,
    result_schema: Schema,
    header_schema: Option<&Schema>,
    request_id: Option<&str>,
) -> Result<(Option<Row>, ProducerSession<R, W>)>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let (header_row, output_reader, input_writer) = open_data_loop(
        reader,
        writer,
        method,
        params_schema,
        params,
        &Schema::empty(),
        header_schema,
        request_id,
    )
    .await?;

    Ok((
        header_row,
        ProducerSession {
            reader: output_reader,
            writer: Some(input_writer),
            spent_writer: None,
            result_schema,
        },
    ))
}

/// Open an exchange invocation. `params_schema`/`params` shape the one-shot
/// init request (e.g. `{factor}`); `input_schema` shapes every round's data
/// row submitted via [`ExchangeSession::send`] (e.g. `{value}`).
pub async fn open_exchange<R, W>(
    reader: R,
    writer: W,
    method: &str,
    params_schema: &Schema,
    params: Row,
    input_schema: Schema,
    result_schema: Schema,
    header_schema: Option<&Schema>,
    request_id: Option<&str>,
) -> Result<(Option<Row>, ExchangeSession<R, W>)>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let (header_row, output_reader, input_writer) = open_data_loop(
        reader,
        writer,
        method,
        params_schema,
        params,
        &input_schema,
        header_schema,
        request_id,
    )
    .await?;

    Ok((
        header_row,
        ExchangeSession {
            reader: output_reader,
            writer: input_writer,
            input_schema,
            result_schema,
        },
    ))
}

/// Tunables for a [`PipeClient`] that don't belong to the per-call codec
/// layer itself (mirrors [`crate::server::pipe::PipeServerConfig`] on the
/// server side).
#[derive(Debug, Clone, Default)]
pub struct PipeClientConfig {
    /// When a call or stream site passes `request_id: None`, generate one
    /// with [`super::random_request_id`] instead of sending the request
    /// with no id (spec §4.1: "`request_id` is optional and purely
    /// diagnostic"; some deployments still want every request on the wire
    /// to carry one for log correlation even when the caller didn't think
    /// to supply it).
    pub auto_request_id: bool,
}

/// Owns one duplex pipe connection and enforces spec §4.7/§9's single-flight
/// rule: exactly one call or stream session is ever in flight on this pipe
/// at a time, since the wire carries one ordered request/response sequence
/// with no multiplexing (spec §1's Non-goals).
///
/// The read/write halves live in `slot` except while checked out by the one
/// in-flight call/session; `busy` is the actual single-flight lock, held
/// for the duration of that call/session and released on every exit path —
/// including a [`ExchangeSession`]/[`ProducerSession`] dropped without an
/// explicit `close()`, since `busy`'s guard is simply dropped along with it.
pub struct PipeClient<S> {
    slot: Arc<Mutex<Option<(ReadHalf<S>, WriteHalf<S>)>>>,
    busy: Arc<Mutex<()>>,
    auto_request_id: bool,
}

impl<S> PipeClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(stream: S) -> Self {
        Self::with_config(stream, PipeClientConfig::default())
    }

    pub fn with_config(stream: S, config: PipeClientConfig) -> Self {
        let (r, w) = tokio::io::split(stream);
        PipeClient {
            slot: Arc::new(Mutex::new(Some((r, w)))),
            busy: Arc::new(Mutex::new(())),
            auto_request_id: config.auto_request_id,
        }
    }

    /// Returns `request_id` unchanged, unless it's `None` and
    /// [`PipeClientConfig::auto_request_id`] asked for one to be minted.
    fn resolve_request_id(&self, request_id: Option<&str>) -> Option<String> {
        match request_id {
            Some(id) => Some(id.to_string()),
            None if self.auto_request_id => Some(super::random_request_id()),
            None => None,
        }
    }

    async fn checkout(&self) -> Result<(ReadHalf<S>, WriteHalf<S>)> {
        self.slot
            .lock()
            .await
            .take()
            .ok_or_else(|| RpcError::protocol("pipe client's halves are not checked in"))
    }

    async fn checkin(&self, halves: (ReadHalf<S>, WriteHalf<S>)) {
        *self.slot.lock().await = Some(halves);
    }

    /// Run one unary call, holding the single-flight lock for its duration.
    pub async fn call(
        &self,
        method: &str,
        params_schema: &Schema,
        result_schema: &Schema,
        params: Row,
        request_id: Option<&str>,
    ) -> Result<Row> {
        let request_id = self.resolve_request_id(request_id);
        let _busy = self.busy.lock().await;
        let (mut r, mut w) = self.checkout().await?;
        let result =
            call_unary(&mut r, &mut w, method, params_schema, result_schema, params, request_id.as_deref()).await;
        self.checkin((r, w)).await;
        result
    }

    /// Fetch the server's method table, holding the single-flight lock for
    /// its duration.
    pub async fn describe(&self) -> Result<Batch> {
        let _busy = self.busy.lock().await;
        let (mut r, mut w) = self.checkout().await?;
        let result = describe(&mut r, &mut w).await;
        self.checkin((r, w)).await;
        result
    }

    /// Open a producer session. The returned [`PipeProducerHandle`] holds
    /// the single-flight lock until it is closed (or dropped).
    pub async fn open_producer(
        &self,
        method: &str,
        params_schema: &Schema,
        params: Row,
        result_schema: Schema,
        header_schema: Option<&Schema>,
        request_id: Option<&str>,
    ) -> Result<(Option<Row>, PipeProducerHandle<S>)> {
        let request_id = self.resolve_request_id(request_id);
        let busy = self.busy.clone().lock_owned().await;
        let (r, w) = self.checkout().await?;
        let (header, session) = match open_producer(
            r,
            w,
            method,
            params_schema,
            params,
            result_schema,
            header_schema,
            request_id.as_deref(),
        )
        .await
        {
            Ok(ok) => ok,
            Err(err) => return Err(err),
        };
        Ok((
            header,
            PipeProducerHandle {
                session: Some(session),
                slot: self.slot.clone(),
                _busy: busy,
            },
        ))
    }

    /// Open an exchange session. The returned [`PipeExchangeHandle`] holds
    /// the single-flight lock until it is closed (or dropped).
    pub async fn open_exchange(
        &self,
        method: &str,
        params_schema: &Schema,
        params: Row,
        input_schema: Schema,
        result_schema: Schema,
        header_schema: Option<&Schema>,
        request_id: Option<&str>,
    ) -> Result<(Option<Row>, PipeExchangeHandle<S>)> {
        let request_id = self.resolve_request_id(request_id);
        let busy = self.busy.clone().lock_owned().await;
        let (r, w) = self.checkout().await?;
        let (header, session) = open_exchange(
            r,
            w,
            method,
            params_schema,
            params,
            input_schema,
            result_schema,
            header_schema,
            request_id.as_deref(),
        )
        .await?;
        Ok((
            header,
            PipeExchangeHandle {
                session: Some(session),
                slot: self.slot.clone(),
                _busy: busy,
            },
        ))
    }
}

/// A [`ProducerSession`] bound to a [`PipeClient`]'s single-flight lock.
/// Dropping or closing it returns the pipe's halves to the client so the
/// next call can check them out.
pub struct PipeProducerHandle<S> {
    session: Option<ProducerSession<ReadHalf<S>, WriteHalf<S>>>,
    slot: Arc<Mutex<Option<(ReadHalf<S>, WriteHalf<S>)>>>,
    _busy: tokio::sync::OwnedMutexGuard<()>,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> PipeProducerHandle<S> {
    pub async fn next(&mut self) -> Result<Option<Row>> {
        self.session
            .as_mut()
            .expect("session taken only by close()")
            .next()
            .await
    }

    /// Drain the remainder of the stream and release the single-flight
    /// lock (spec §4.7: "released on every exit path").
    pub async fn close(mut self) -> Result<()> {
        let session = self.session.take().expect("session taken only once");
        let (r, w) = session.into_parts().await?;
        *self.slot.lock().await = Some((r, w));
        Ok(())
    }
}

/// As [`PipeProducerHandle`], for an [`ExchangeSession`].
pub struct PipeExchangeHandle<S> {
    session: Option<ExchangeSession<ReadHalf<S>, WriteHalf<S>>>,
    slot: Arc<Mutex<Option<(ReadHalf<S>, WriteHalf<S>)>>>,
    _busy: tokio::sync::OwnedMutexGuard<()>,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> PipeExchangeHandle<S> {
    pub async fn send(&mut self, input: Row) -> Result<Option<Row>> {
        self.session
            .as_mut()
            .expect("session taken only by close()")
            .send(input)
            .await
    }

    pub async fn close(mut self) -> Result<()> {
        let session = self.session.take().expect("session taken only once");
        let (r, w) = session.into_parts().await?;
        *self.slot.lock().await = Some((r, w));
        Ok(())
    }
}

#[cfg(test)]
mod pipe_client_tests {
    use super::*;
    use crate::ipc::{DataKind, Field};
    use std::collections::BTreeMap as Map;

    fn schema() -> Schema {
        Schema::new(vec![Field::new("n", DataKind::Int64, false)])
    }

    #[tokio::test]
    async fn single_flight_serializes_two_concurrent_calls() {
        let (client_io, server_io) = tokio::io::duplex(8192);
        let s = schema();
        let s2 = s.clone();

        let server = tokio::spawn(async move {
            let (mut reader, mut writer) = tokio::io::split(server_io);
            for _ in 0..2 {
                let mut req_reader = crate::ipc::FrameReader::open(&mut reader).await.unwrap();
                let batch = req_reader.next_batch().await.unwrap().unwrap();
                req_reader.drain().await.unwrap();
                let mut row = Map::new();
                row.insert("n".to_string(), Value::Int64(
                    match batch.rows().unwrap()[0][0] {
                        Value::Int64(n) => n + 1,
                        _ => unreachable!(),
                    },
                ));
                let values = row_to_values(&s2, &row).unwrap();
                let result_batch = crate::codec::build_result_batch(&s2, &[values], "srv", None).unwrap();
                let mut fw = crate::ipc::FrameWriter::open(&mut writer, &s2).await.unwrap();
                fw.write_batch(&result_batch).await.unwrap();
                fw.finish().await.unwrap();
            }
        });

        let client = Arc::new(PipeClient::new(client_io));
        let c1 = client.clone();
        let c2 = client.clone();
        let s_a = s.clone();
        let s_b = s.clone();

        let t1 = tokio::spawn(async move {
            let mut row = Map::new();
            row.insert("n".to_string(), Value::Int64(1));
            c1.call("bump", &s_a, &s_a, row, None).await.unwrap()
        });
        let t2 = tokio::spawn(async move {
            let mut row = Map::new();
            row.insert("n".to_string(), Value::Int64(10));
            c2.call("bump", &s_b, &s_b, row, None).await.unwrap()
        });

        let (r1, r2) = tokio::join!(t1, t2);
        let r1 = r1.unwrap();
        let r2 = r2.unwrap();
        let mut got: Vec<i64> = vec![r1, r2]
            .into_iter()
            .map(|row| match row["n"] {
                Value::Int64(n) => n,
                _ => unreachable!(),
            })
            .collect();
        got.sort();
        assert_eq!(got, vec![2, 11]);
        server.await.unwrap();
    }
}
