//! HTTP CONNECT tunnel handler.

use std::{io, net::SocketAddr};

use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite},
    net::TcpStream,
};
use tracing::{debug, info};

use crate::{
    config::ProxyConfig,
    error::ProxyError,
    proxy::{
        protocol::{resolve_target, ProxyTarget},
        relay::relay_tunnel,
    },
    stream::PeekedStream,
    utils,
};

/// Header slots available to the request parser. More headers than this is
/// treated the same as an oversized request.
const MAX_HEADERS: usize = 64;

/// The parts of a request head the handler acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub method: String,
    /// Request-target, or the `Host` header for origin-form targets.
    pub authority: String,
}

/// Serves one CONNECT request read from `stream`.
///
/// On success the tunnel runs to completion before this returns. Failures
/// before the tunnel is up are answered with an HTTP error status and the
/// connection is closed; the error is returned for logging.
pub async fn handle_http_connect<S>(
    mut stream: PeekedStream<S>,
    peer: SocketAddr,
    config: &ProxyConfig,
) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (target, outbound) = match establish(&mut stream, config).await {
        Ok(established) => established,
        Err(err) => {
            if let Some((code, reason)) = err.http_status() {
                if let Err(e) =
                    utils::write_http_error(&mut stream, code, reason, err.http_body()).await
                {
                    debug!("failed to send {} to {}: {}", code, peer, e);
                }
            }
            return Err(err);
        }
    };

    utils::send_connect_established(&mut stream).await?;
    info!("Connection established to {} by {}", target, peer);

    let stats = relay_tunnel(stream, outbound, config.idle_timeout).await;
    info!(
        "Closed tunnel {} <-> {} (sent: {}, received: {})",
        peer, target, stats.client_to_target, stats.target_to_client
    );
    match stats.error {
        Some(ProxyError::IdleTimeout(idle)) => {
            debug!("tunnel {} <-> {} idle for {:?}", peer, target, idle);
            Ok(())
        }
        Some(err) => Err(err),
        None => Ok(()),
    }
}

async fn establish<S>(
    stream: &mut PeekedStream<S>,
    config: &ProxyConfig,
) -> Result<(ProxyTarget, TcpStream), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let head = read_request_head(stream, config).await?;
    let request = parse_request_head(&head, config.max_request_bytes)?;

    if request.method != "CONNECT" {
        return Err(ProxyError::UnsupportedMethod(request.method));
    }

    let target = resolve_target(&request.authority)?;
    let outbound = utils::dial(&target.to_string(), config.dial_timeout).await?;
    Ok((target, outbound))
}

/// Reads the request line and headers, up to and including the blank line.
///
/// Reading goes through the connection's single read-ahead buffer and stops
/// exactly at the end of the head, so bytes the client pipelined behind it
/// stay buffered for the tunnel.
async fn read_request_head<S>(
    stream: &mut PeekedStream<S>,
    config: &ProxyConfig,
) -> Result<Vec<u8>, ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let limit = config.max_request_bytes;
    let mut reader = (&mut *stream).take(limit as u64);
    let mut head = Vec::with_capacity(512);

    let read = async {
        loop {
            let start = head.len();
            let n = reader.read_until(b'\n', &mut head).await?;
            if n == 0 || !head.ends_with(b"\n") {
                return Err(io::Error::from(io::ErrorKind::UnexpectedEof));
            }
            let line = &head[start..];
            if line == b"\r\n" || line == b"\n" {
                if start == 0 {
                    // tolerate stray line breaks ahead of the request line
                    head.clear();
                    continue;
                }
                return Ok(());
            }
        }
    };

    let outcome = tokio::time::timeout(config.request_read_timeout, read).await;
    match outcome {
        Ok(Ok(())) => Ok(head),
        _ if reader.limit() == 0 => Err(ProxyError::RequestTooLarge(limit)),
        Ok(Err(e)) => Err(ProxyError::MalformedRequest(e.to_string())),
        Err(_) => Err(ProxyError::MalformedRequest(format!(
            "request not received within {:?}",
            config.request_read_timeout
        ))),
    }
}

/// Parses a complete request head.
pub fn parse_request_head(head: &[u8], limit: usize) -> Result<ConnectRequest, ProxyError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    match req.parse(head) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => {
            return Err(ProxyError::MalformedRequest("incomplete request head".into()))
        }
        Err(httparse::Error::TooManyHeaders) => return Err(ProxyError::RequestTooLarge(limit)),
        Err(e) => return Err(ProxyError::MalformedRequest(e.to_string())),
    }

    let method = req.method.unwrap_or_default().to_string();
    let path = req.path.unwrap_or_default();

    let authority = if path.starts_with('/') {
        let host = req
            .headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case("host"))
            .map(|h| h.value)
            .unwrap_or_default();
        std::str::from_utf8(host)
            .map_err(|_| ProxyError::MalformedRequest("Host header is not UTF-8".into()))?
            .to_string()
    } else {
        path.to_string()
    };

    Ok(ConnectRequest { method, authority })
}
