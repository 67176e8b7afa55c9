//! Per-connection proxy pipeline
//!
//! A connection moves through four stages: the request head is accumulated
//! and parsed, a stored response is served if one exists, otherwise the
//! backend is resolved and bytes are relayed in both directions. While the
//! response streams back, a cacheable one is written to disk alongside.

use crate::cache::{CacheKey, CacheWriter, ResponseCache};
use crate::config::PortMapping;
use crate::error::{describe_io_error, ProxyError};
use crate::head::ParsedHead;
use crate::host::name_from_host;
use crate::worker::Worker;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Largest request head accumulated before the request is rejected
pub const MAX_HEAD_SIZE: usize = 8192;

/// Largest response head buffered for the cache decision
pub const MAX_RESPONSE_HEAD_SIZE: usize = 16 * 1024;

const READ_BUFFER_SIZE: usize = 16 * 1024;

/// The listener a connection arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenContext {
    pub mapping: PortMapping,
    pub https: bool,
}

impl ListenContext {
    fn proto(&self) -> &'static str {
        if self.https {
            "https"
        } else {
            "http"
        }
    }
}

/// Drive one accepted client connection to completion.
///
/// Failures are reported to the client where the protocol still allows it;
/// the client socket is always shut down on return.
pub async fn handle_connection<S>(mut client: S, peer: SocketAddr, listen: ListenContext, worker: Arc<Worker>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    if let Err(err) = serve(&mut client, peer, listen, &worker).await {
        match err.to_response() {
            Some(response) => {
                debug!(error = %err, "Closing connection with error response");
                if let Err(e) = client.write_all(&response).await {
                    debug!(error = %describe_io_error(&e), "Failed to send error response");
                }
            }
            None => debug!(error = %err, "Closing connection"),
        }
    }

    let _ = client.shutdown().await;
}

async fn serve<S>(client: &mut S, peer: SocketAddr, listen: ListenContext, worker: &Worker) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (mut head, bytes_read) = read_head(client, worker).await?;

    let method = head.method().filter(|m| !m.is_empty()).ok_or(ProxyError::BadRequest)?.to_string();
    let path = head.path().filter(|p| !p.is_empty()).ok_or(ProxyError::BadRequest)?.to_string();
    let host = head.host().ok_or(ProxyError::BadRequest)?;
    let name = name_from_host(host);
    if name.is_empty() {
        return Err(ProxyError::BadRequest);
    }

    let client_ip = peer.ip().to_string();
    head.append(&[("X-Forwarded-For", client_ip.as_str()), ("X-Forwarded-Proto", listen.proto())]);

    debug!(name = %name, method = %method, path = %path, "Request");

    let version = head.version().unwrap_or("").to_string();
    let key = CacheKey {
        name: &name,
        target_port: listen.mapping.target,
        version: &version,
        gzip: head.accepts_gzip(),
        path: &path,
    };

    let cache_path = match worker.cache() {
        Some(cache) if method == "GET" && key.is_storable() => Some(cache.path_for(&key)),
        _ => None,
    };

    if let (Some(cache), Some(cache_path)) = (worker.cache(), cache_path.as_ref()) {
        if let Ok(mut file) = cache.open(cache_path).await {
            debug!(name = %name, path = %cache_path.display(), "Serving from cache");
            let served = tokio::io::copy(&mut file, client).await;
            drop(file);
            let _ = client.shutdown().await;
            cache.evict_if_stale(cache_path).await;
            served?;
            return Ok(());
        }
    }

    let (address, port) = worker.resolve(&name, listen.mapping.target).await.map_err(|err| {
        warn!(name = %name, error = %err, "Backend lookup failed");
        err
    })?;

    let result = proxy(client, head, bytes_read, worker, &name, &address, port, cache_path).await;
    if let Err(err) = &result {
        if err.invalidates_route() && worker.routes().evict(&name) {
            debug!(name = %name, address = %address, "Evicted route after upstream failure");
        }
    }
    result
}

/// Accumulate bytes until a complete head has arrived.
///
/// Returns the head and the number of bytes read from the client so far.
async fn read_head<S>(client: &mut S, worker: &Worker) -> Result<(ParsedHead, u64), ProxyError>
where
    S: AsyncRead + Unpin,
{
    let timeout = worker.limits().header_timeout;
    let mut buf: Vec<u8> = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    loop {
        let n = match tokio::time::timeout(timeout, client.read(&mut chunk)).await {
            Ok(result) => result?,
            Err(_) => return Err(ProxyError::RequestTimeout),
        };
        if n == 0 {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some(head) = ParsedHead::parse(&buf) {
            return Ok((head, buf.len() as u64));
        }

        if buf.len() > MAX_HEAD_SIZE {
            return Err(classify_oversized_head(&buf));
        }
    }
}

/// A head that never terminated is "too large" when it looks like a real
/// request, and plainly bad otherwise.
fn classify_oversized_head(buf: &[u8]) -> ProxyError {
    let lower = buf.to_ascii_lowercase();
    if contains(&lower, b" http/") && contains(&lower, b"\r\nhost:") {
        ProxyError::HeaderTooLarge
    } else {
        ProxyError::BadRequest
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

fn body_too_large(bytes_read: u64, limit: u64) -> bool {
    bytes_read.saturating_sub(MAX_HEAD_SIZE as u64) > limit
}

#[allow(clippy::too_many_arguments)]
async fn proxy<S>(
    client: &mut S,
    head: ParsedHead,
    bytes_read: u64,
    worker: &Worker,
    name: &str,
    address: &str,
    port: u16,
    cache_path: Option<PathBuf>,
) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let limits = *worker.limits();
    let upstream_error = |source: io::Error| ProxyError::UpstreamConnection {
        name: name.to_string(),
        addr: address.to_string(),
        port,
        source,
    };

    if body_too_large(bytes_read, limits.client_max_body_size) {
        return Err(ProxyError::BodyTooLarge);
    }

    let mut upstream = match tokio::time::timeout(limits.connect_timeout, TcpStream::connect((address, port))).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            warn!(name, addr = %address, port, error = %describe_io_error(&e), "Failed to connect to backend");
            return Err(upstream_error(e));
        }
        Err(_) => {
            warn!(name, addr = %address, port, "Timed out connecting to backend");
            return Err(ProxyError::UpstreamConnectTimeout);
        }
    };
    let _ = upstream.set_nodelay(true);
    debug!(name, addr = %address, port, "Connected to backend");

    if let Err(e) = upstream.write_all(&head.to_bytes()).await {
        warn!(name, addr = %address, port, error = %describe_io_error(&e), "Failed to send request to backend");
        return Err(upstream_error(e));
    }

    let (mut client_rd, mut client_wr) = tokio::io::split(client);
    let (mut upstream_rd, mut upstream_wr) = upstream.split();

    let cache = worker.cache().zip(cache_path);
    let upload = pump_request(&mut client_rd, &mut upstream_wr, bytes_read, limits.client_max_body_size);
    let download = relay_response(&mut upstream_rd, &mut client_wr, cache, upstream_error);
    tokio::pin!(upload);
    tokio::pin!(download);

    let mut uploading = true;
    let result = loop {
        tokio::select! {
            result = &mut upload, if uploading => {
                match result {
                    Ok(()) => uploading = false,
                    Err(ProxyError::BodyTooLarge) => {
                        warn!(name, limit = limits.client_max_body_size, "Request body too large");
                        break Err(ProxyError::BodyTooLarge);
                    }
                    Err(e) => {
                        debug!(name, error = %e, "Request stream ended");
                        uploading = false;
                    }
                }
            }
            result = &mut download => break result,
        }
    };

    debug!(name, addr = %address, port, "Disconnected from backend");
    result
}

/// Copy the rest of the request from the client, enforcing the body limit
async fn pump_request<R, W>(client: &mut R, upstream: &mut W, mut bytes_read: u64, limit: u64) -> Result<(), ProxyError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let n = client.read(&mut buf).await?;
        if n == 0 {
            let _ = upstream.shutdown().await;
            return Ok(());
        }

        bytes_read += n as u64;
        if body_too_large(bytes_read, limit) {
            return Err(ProxyError::BodyTooLarge);
        }
        upstream.write_all(&buf[..n]).await?;
    }
}

/// Relay the response to the client, teeing it into the cache when allowed
async fn relay_response<R, W, F>(
    upstream: &mut R,
    client: &mut W,
    cache: Option<(&ResponseCache, PathBuf)>,
    upstream_error: F,
) -> Result<(), ProxyError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    F: Fn(io::Error) -> ProxyError,
{
    let mut writer: Option<CacheWriter> = None;
    let result = relay_chunks(upstream, client, cache, upstream_error, &mut writer).await;

    match (writer, &result) {
        (Some(writer), Ok(())) => {
            let path = writer.path().to_path_buf();
            if let Err(e) = writer.finish().await {
                warn!(path = %path.display(), error = %describe_io_error(&e), "Failed to write cache file");
            }
        }
        (Some(writer), Err(_)) => writer.abort().await,
        (None, _) => {}
    }
    result
}

async fn relay_chunks<R, W, F>(
    upstream: &mut R,
    client: &mut W,
    cache: Option<(&ResponseCache, PathBuf)>,
    upstream_error: F,
    writer: &mut Option<CacheWriter>,
) -> Result<(), ProxyError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    F: Fn(io::Error) -> ProxyError,
{
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let mut pending: Vec<u8> = Vec::new();
    let mut head_seen = false;
    let mut forwarded = false;

    loop {
        let n = match upstream.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if forwarded => {
                debug!(error = %describe_io_error(&e), "Upstream failed mid-response");
                return Err(e.into());
            }
            Err(e) => {
                warn!(error = %describe_io_error(&e), "Backend failed before responding");
                return Err(upstream_error(e));
            }
        };
        let chunk = &buf[..n];

        if head_seen {
            client.write_all(chunk).await?;
            forwarded = true;
            tee(writer, chunk).await;
            continue;
        }

        pending.extend_from_slice(chunk);
        if let Some(head) = ParsedHead::parse(&pending) {
            let (bytes, started) = rewrite_response(head, cache.as_ref()).await;
            *writer = started;
            client.write_all(&bytes).await?;
        } else if pending.len() > MAX_RESPONSE_HEAD_SIZE {
            debug!(bytes = pending.len(), "Response head too large, not caching");
            client.write_all(&pending).await?;
        } else {
            continue;
        }
        pending.clear();
        head_seen = true;
        forwarded = true;
    }

    if !pending.is_empty() {
        client.write_all(&pending).await?;
    }
    client.flush().await?;
    Ok(())
}

/// Rewrite a response head for the client and start a cache entry if the
/// response qualifies.
async fn rewrite_response(
    mut head: ParsedHead,
    cache: Option<&(&ResponseCache, PathBuf)>,
) -> (Vec<u8>, Option<CacheWriter>) {
    if let Some((cache, path)) = cache {
        let verdict = cache.policy().evaluate(&head);
        if verdict.is_cacheable() {
            head.append(&[("Cache-Control", cache.policy().cache_control().as_str())]);
            let bytes = head.to_bytes();
            let writer = match cache.begin_write(path, &bytes).await {
                Ok(writer) => writer,
                Err(e) => {
                    warn!(path = %path.display(), error = %describe_io_error(&e), "Failed to open cache file");
                    None
                }
            };
            return (bytes, writer);
        }
        debug!(reason = ?verdict, "Response not cacheable");
    }

    if let Some(cache_control) = head.header("cache-control").map(|v| v.joined()) {
        head.append(&[("Cache-Control", cache_control.as_str())]);
    }
    (head.to_bytes(), None)
}

async fn tee(writer: &mut Option<CacheWriter>, chunk: &[u8]) {
    let Some(active) = writer.as_mut() else {
        return;
    };

    match active.append(chunk).await {
        Ok(true) => return,
        Ok(false) => debug!(path = %active.path().display(), "Cache file too large, aborting"),
        Err(e) => {
            warn!(path = %active.path().display(), error = %describe_io_error(&e), "Failed to write cache file")
        }
    }

    if let Some(w) = writer.take() {
        w.abort().await;
    }
}
