//! Pipe server loop (spec §4.8, §5): a single ordered duplex byte channel
//! carrying one request at a time, single-flight, for as long as the peer
//! keeps writing requests.
//!
//! Each request begins with a request/init IPC stream whose lone batch
//! carries `method` metadata (spec §4.1). Unary methods answer with a
//! second, self-contained IPC stream; producer/exchange methods hand off to
//! [`crate::dispatch::pipe::dispatch_stream`] for the header stream plus
//! lockstep data loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::codec::parse_request_header;
use crate::dispatch;
use crate::error::{Result, RpcError};
use crate::ipc::FrameReader;
use crate::registry::{Method, Protocol};

/// Smallest backoff between write retries when the peer is applying
/// backpressure; doubles up to [`PipeServerConfig::max_write_backoff`]
/// (spec §4.8's "eager flush with bounded backoff").
const DEFAULT_MIN_WRITE_BACKOFF: Duration = Duration::from_millis(1);
const DEFAULT_MAX_WRITE_BACKOFF: Duration = Duration::from_millis(100);

/// Tunables for a pipe server that don't belong to the dispatch layer
/// itself (mirrors [`crate::server::http::HttpServerConfig`]'s role on the
/// HTTP side): identity and write backoff, the only two things a pipe
/// connection can configure beyond the protocol it serves.
#[derive(Debug, Clone)]
pub struct PipeServerConfig {
    /// Stamped on every response batch this connection produces.
    /// `None` generates a random one (spec §6's `server_id` metadata key).
    pub server_id: Option<String>,
    pub min_write_backoff: Duration,
    pub max_write_backoff: Duration,
}

impl Default for PipeServerConfig {
    fn default() -> Self {
        PipeServerConfig {
            server_id: None,
            min_write_backoff: DEFAULT_MIN_WRITE_BACKOFF,
            max_write_backoff: DEFAULT_MAX_WRITE_BACKOFF,
        }
    }
}

/// Drives one pipe connection to completion. `server_id` is stamped on
/// every response batch this connection produces.
pub struct PipeServer {
    protocol: Arc<Protocol>,
    server_id: String,
    min_write_backoff: Duration,
    max_write_backoff: Duration,
}

impl PipeServer {
    pub fn new(protocol: Arc<Protocol>) -> Self {
        Self::with_config(protocol, PipeServerConfig::default())
    }

    pub fn with_config(protocol: Arc<Protocol>, config: PipeServerConfig) -> Self {
        PipeServer {
            protocol,
            server_id: config.server_id.unwrap_or_else(super::random_server_id),
            min_write_backoff: config.min_write_backoff,
            max_write_backoff: config.max_write_backoff,
        }
    }

    pub fn with_server_id(mut self, server_id: impl Into<String>) -> Self {
        self.server_id = server_id.into();
        self
    }

    /// Serve requests from `reader`/`writer` until the peer closes its
    /// write half (clean EOF between requests) or a transport fault occurs.
    /// A transport fault is the only thing that ends the loop with `Err`
    /// (spec §5); handler and protocol errors are written to the wire by
    /// the dispatch functions and the loop continues.
    pub async fn serve<R, W>(&self, mut reader: R, mut writer: W) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        loop {
            let mut probe = [0u8; 1];
            let n = reader.read(&mut probe).await.map_err(RpcError::Transport)?;
            if n == 0 {
                return Ok(());
            }

            let mut chained = ChainedReader { first: Some(probe[0]), inner: &mut reader };
            self.serve_one(&mut chained, &mut writer).await?;
        }
    }

    #[tracing::instrument(skip(self, reader, writer))]
    async fn serve_one<R, W>(&self, reader: &mut R, writer: &mut W) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let mut request_reader = FrameReader::open(&mut *reader).await?;
        let request_batch = request_reader
            .next_batch()
            .await?
            .ok_or_else(|| RpcError::protocol("request stream carries no batch"))?;
        request_reader.drain().await?;
        let request_schema = request_reader.schema().clone();
        drop(request_reader);

        let header = parse_request_header(&request_batch)?;
        tracing::debug!(method = %header.method, "servicing pipe request");
        let is_describe = header.method == crate::constants::DESCRIBE_METHOD_NAME;
        let is_unary = is_describe
            || matches!(self.protocol.get(&header.method), Some(Method::Unary(_)))
            || self.protocol.get(&header.method).is_none();

        if is_unary {
            let request_bytes = crate::ipc::write_stream(&request_schema, std::slice::from_ref(&request_batch))?;
            let response_bytes = dispatch::unary::dispatch_unary(&self.protocol, &self.server_id, &request_bytes).await?;
            write_with_backoff(writer, &response_bytes, self.min_write_backoff, self.max_write_backoff).await?;
        } else {
            let request_bytes = crate::ipc::write_stream(&request_schema, std::slice::from_ref(&request_batch))?;
            let mut replay = ReplayThenLive { replay: Some(request_bytes), offset: 0, inner: &mut *reader };
            dispatch::pipe::dispatch_stream(&self.protocol, &self.server_id, &mut replay, writer).await?;
        }
        Ok(())
    }
}

async fn write_with_backoff<W: AsyncWrite + Unpin>(
    writer: &mut W,
    bytes: &[u8],
    min_backoff: Duration,
    max_backoff: Duration,
) -> Result<()> {
    let mut backoff = min_backoff;
    let mut remaining = bytes;
    while !remaining.is_empty() {
        match writer.write(remaining).await {
            Ok(0) => {
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(max_backoff);
            }
            Ok(n) => {
                remaining = &remaining[n..];
                backoff = min_backoff;
            }
            Err(e) => return Err(RpcError::Transport(e)),
        }
    }
    writer.flush().await.map_err(RpcError::Transport)?;
    Ok(())
}

/// Presents a single already-consumed probe byte followed by the rest of
/// an inner reader, so the loop in [`PipeServer::serve`] can peek for EOF
/// between requests without losing the byte it read to do so.
struct ChainedReader<'a, R> {
    first: Option<u8>,
    inner: &'a mut R,
}

impl<'a, R: AsyncRead + Unpin> AsyncRead for ChainedReader<'a, R> {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        if let Some(byte) = self.first.take() {
            buf.put_slice(&[byte]);
            return std::task::Poll::Ready(Ok(()));
        }
        std::pin::Pin::new(&mut *self.inner).poll_read(cx, buf)
    }
}

/// Replays previously-buffered request bytes before falling through to the
/// live connection. [`PipeServer::serve_one`] already consumed and decoded
/// the request/init stream once (to decide unary vs. stream shape), but
/// `dispatch_stream` expects to read that same stream itself, so its bytes
/// are fed back in ahead of whatever the client writes next.
struct ReplayThenLive<'a, R> {
    replay: Option<Vec<u8>>,
    offset: usize,
    inner: &'a mut R,
}

impl<'a, R: AsyncRead + Unpin> AsyncRead for ReplayThenLive<'a, R> {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        if let Some(bytes) = &self.replay {
            if self.offset < bytes.len() {
                let remaining = &bytes[self.offset..];
                let n = remaining.len().min(buf.remaining());
                buf.put_slice(&remaining[..n]);
                self.offset += n;
                return std::task::Poll::Ready(Ok(()));
            }
            self.replay = None;
        }
        std::pin::Pin::new(&mut *self.inner).poll_read(cx, buf)
    }
}
