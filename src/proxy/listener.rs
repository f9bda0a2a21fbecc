use crate::app_state::AppState;
use crate::error::ProxyError;
use crate::proxy::http::handle_http_connect;
use crate::proxy::protocol::{detect_protocol, ProxyProtocol};
use crate::proxy::socks5::Socks5Engine;
use crate::stream::PeekedStream;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

/// Source of inbound connections.
///
/// Access control happens before a connection reaches the proxy; anything a
/// listener yields is served.
pub trait Listener: Send {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn accept(&mut self) -> impl Future<Output = io::Result<(Self::Stream, SocketAddr)>> + Send;
}

impl Listener for TcpListener {
    type Stream = TcpStream;

    async fn accept(&mut self) -> io::Result<(TcpStream, SocketAddr)> {
        let (stream, addr) = TcpListener::accept(self).await?;
        let _ = stream.set_nodelay(true);
        Ok((stream, addr))
    }
}

/// Decides which accept errors are worth retrying.
///
/// Anything not listed is fatal and stops the accept loop.
#[derive(Debug, Clone)]
pub struct AcceptErrorPolicy {
    transient_kinds: Vec<io::ErrorKind>,
    transient_os_errors: Vec<i32>,
}

impl Default for AcceptErrorPolicy {
    fn default() -> Self {
        Self {
            transient_kinds: vec![
                io::ErrorKind::ConnectionAborted,
                io::ErrorKind::ConnectionReset,
                io::ErrorKind::Interrupted,
                io::ErrorKind::TimedOut,
                io::ErrorKind::WouldBlock,
            ],
            // out of descriptors or buffer space clears up as connections close
            #[cfg(unix)]
            transient_os_errors: vec![libc::EMFILE, libc::ENFILE, libc::ENOBUFS, libc::ENOMEM],
            #[cfg(not(unix))]
            transient_os_errors: Vec::new(),
        }
    }
}

impl AcceptErrorPolicy {
    pub fn with_transient_kind(mut self, kind: io::ErrorKind) -> Self {
        self.transient_kinds.push(kind);
        self
    }

    pub fn with_transient_os_error(mut self, code: i32) -> Self {
        self.transient_os_errors.push(code);
        self
    }

    pub fn is_transient(&self, err: &io::Error) -> bool {
        if let Some(code) = err.raw_os_error() {
            if self.transient_os_errors.contains(&code) {
                return true;
            }
        }
        self.transient_kinds.contains(&err.kind())
    }
}

/// Exponential delay between accept retries, owned by the accept loop.
#[derive(Debug, Clone)]
pub struct RetryBackoff {
    current: Duration,
    min: Duration,
    max: Duration,
}

impl RetryBackoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            current: Duration::ZERO,
            min,
            max,
        }
    }

    /// Delay before the next retry: `min` first, then doubling up to `max`.
    pub fn next_delay(&mut self) -> Duration {
        self.current = if self.current.is_zero() {
            self.min
        } else {
            self.current.saturating_mul(2).min(self.max)
        };
        self.current
    }

    pub fn reset(&mut self) {
        self.current = Duration::ZERO;
    }

    pub fn current(&self) -> Duration {
        self.current
    }
}

/// How the server stopped after a shutdown signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeOutcome {
    /// Every in-flight connection finished within the drain timeout.
    Drained,
    /// The drain timeout lapsed; these connections were left running.
    DrainTimedOut { remaining: usize },
}

pub struct ProxyServer<E> {
    state: AppState<E>,
    policy: AcceptErrorPolicy,
}

impl<E: Socks5Engine> ProxyServer<E> {
    pub fn new(state: AppState<E>) -> Self {
        Self {
            state,
            policy: AcceptErrorPolicy::default(),
        }
    }

    pub fn with_accept_policy(mut self, policy: AcceptErrorPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn state(&self) -> &AppState<E> {
        &self.state
    }

    /// Accepts connections until `shutdown` fires, then drains.
    ///
    /// Cancelling `shutdown` closes the listener: no further connection is
    /// accepted and the call waits, at most the drain timeout, for the
    /// connections already being served. A non-transient accept error stops
    /// the loop immediately with `ProxyError::FatalAccept`.
    pub async fn serve<L: Listener>(
        &self,
        mut listener: L,
        shutdown: CancellationToken,
    ) -> Result<ServeOutcome, ProxyError> {
        let config = &self.state.config;
        let mut backoff = RetryBackoff::new(config.accept_backoff_min, config.accept_backoff_max);

        loop {
            let accepted = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                res = listener.accept() => res,
            };

            match accepted {
                Ok((stream, client_addr)) => {
                    backoff.reset();
                    let guard = self.state.connections.track();
                    let state = self.state.clone();
                    tokio::spawn(async move {
                        let _guard = guard;
                        handle_client(stream, client_addr, state).await;
                    });
                }
                Err(e) if self.policy.is_transient(&e) => {
                    let delay = backoff.next_delay();
                    warn!("temporary accept error; retrying in {:?}: {}", delay, e);
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => {
                    error!("accept failed: {}", e);
                    return Err(ProxyError::FatalAccept(e));
                }
            }
        }

        drop(listener);
        Ok(self.drain().await)
    }

    async fn drain(&self) -> ServeOutcome {
        let connections = &self.state.connections;
        let drain_timeout = self.state.config.drain_timeout;
        debug!("listener closed; draining {} connections", connections.count());

        if connections.wait_idle_timeout(drain_timeout).await {
            info!("all connections closed");
            ServeOutcome::Drained
        } else {
            let remaining = connections.count();
            warn!(
                "graceful shutdown timeout reached after {:?} with {} connections still active",
                drain_timeout, remaining
            );
            ServeOutcome::DrainTimedOut { remaining }
        }
    }
}

async fn handle_client<S, E>(client_stream: S, client_addr: SocketAddr, state: AppState<E>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    E: Socks5Engine,
{
    let span = tracing::info_span!("conn", id = %Uuid::new_v4(), client = %client_addr);
    dispatch(client_stream, client_addr, &state)
        .instrument(span)
        .await;
}

/// Routes one connection by its first byte without consuming it.
///
/// Connections that send nothing within the peek deadline, or close first,
/// are dropped without a response.
pub async fn dispatch<S, E>(client_stream: S, client_addr: SocketAddr, state: &AppState<E>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    E: Socks5Engine,
{
    let mut stream = PeekedStream::new(client_stream);

    let first = match timeout(state.config.peek_timeout, stream.peek_byte()).await {
        Ok(Ok(Some(byte))) => byte,
        Ok(Ok(None)) => {
            debug!("{} closed before sending anything", client_addr);
            return;
        }
        Ok(Err(e)) => {
            debug!("peek failed for {}: {}", client_addr, e);
            return;
        }
        Err(_) => {
            debug!("no data from {} within {:?}", client_addr, state.config.peek_timeout);
            return;
        }
    };

    let protocol = detect_protocol(first);
    debug!("routing {} as {}", client_addr, protocol);

    match protocol {
        ProxyProtocol::Socks5 => {
            if let Err(e) = state.socks.serve(stream, client_addr).await {
                debug!("socks5 session for {} failed: {:#}", client_addr, e);
            }
        }
        ProxyProtocol::HttpConnect => {
            if let Err(e) = handle_http_connect(stream, client_addr, &state.config).await {
                debug!("http connect for {} failed: {}", client_addr, e);
            }
        }
    }
}
