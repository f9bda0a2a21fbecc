use std::{io, time::Duration};

use byte_pool::BytePool;
use lazy_static::lazy_static;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::{
    error::ProxyError,
    stream::{is_idle_timeout, IdleTimeoutStream},
};

const RELAY_BUFFER_SIZE: usize = 16 * 1024;

lazy_static! {
    static ref BUFFER_POOL: BytePool::<Vec<u8>> = BytePool::<Vec<u8>>::new();
}

/// What a finished tunnel moved, and why it stopped.
#[derive(Debug, Default)]
pub struct TunnelStats {
    pub client_to_target: u64,
    pub target_to_client: u64,
    /// `None` when a peer closed normally. An idle teardown shows up as
    /// `ProxyError::IdleTimeout`.
    pub error: Option<ProxyError>,
}

struct HalfOutcome {
    bytes: u64,
    error: Option<io::Error>,
}

/// Relays bytes between `client` and `target` until either side closes, errors
/// or stays idle for `idle_timeout`.
///
/// Each direction runs in its own task. Whichever finishes first shuts down
/// the stream it was writing to and signals the other, so both halves always
/// end. Returns once both tasks are done.
pub async fn relay_tunnel<C, T>(client: C, target: T, idle_timeout: Duration) -> TunnelStats
where
    C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (client_read, client_write) = tokio::io::split(IdleTimeoutStream::new(client, idle_timeout));
    let (target_read, target_write) = tokio::io::split(IdleTimeoutStream::new(target, idle_timeout));
    let closed = CancellationToken::new();

    let upstream = tokio::spawn(relay_half(
        client_read,
        target_write,
        closed.clone(),
        "client->target",
    ));
    let downstream = tokio::spawn(relay_half(
        target_read,
        client_write,
        closed.clone(),
        "target->client",
    ));

    let (upstream, downstream) = tokio::join!(upstream, downstream);
    let upstream = upstream.unwrap_or_else(join_failed);
    let downstream = downstream.unwrap_or_else(join_failed);

    let error = [upstream.error, downstream.error]
        .into_iter()
        .flatten()
        .min_by_key(|e| !is_idle_timeout(e))
        .map(|e| {
            if is_idle_timeout(&e) {
                ProxyError::IdleTimeout(idle_timeout)
            } else {
                ProxyError::Io(e)
            }
        });

    TunnelStats {
        client_to_target: upstream.bytes,
        target_to_client: downstream.bytes,
        error,
    }
}

fn join_failed(err: tokio::task::JoinError) -> HalfOutcome {
    tracing::warn!("relay task failed: {}", err);
    HalfOutcome {
        bytes: 0,
        error: Some(io::Error::other(err.to_string())),
    }
}

async fn relay_half<R, W>(
    mut reader: R,
    mut writer: W,
    closed: CancellationToken,
    label: &'static str,
) -> HalfOutcome
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = BUFFER_POOL.alloc(RELAY_BUFFER_SIZE);
    buf.resize(RELAY_BUFFER_SIZE, 0);
    let mut total = 0u64;

    let result = tokio::select! {
        res = copy_until_eof(&mut reader, &mut writer, &mut buf[..], &mut total, label) => res,
        _ = closed.cancelled() => Ok(()),
    };

    // Shutting down the destination is what lets the peer on the other half
    // see the tunnel ending; the token covers peers that ignore it.
    let _ = writer.shutdown().await;
    closed.cancel();

    HalfOutcome {
        bytes: total,
        error: result.err(),
    }
}

async fn copy_until_eof<R, W>(
    reader: &mut R,
    writer: &mut W,
    buf: &mut [u8],
    total: &mut u64,
    label: &str,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let n = reader.read(buf).await?;
        if n == 0 {
            return Ok(());
        }
        tracing::trace!("{} - {} bytes", label, n);
        writer.write_all(&buf[..n]).await?;
        *total += n as u64;
    }
}
