use std::{io, time::Duration};

use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    net::TcpStream,
};

use crate::error::ProxyError;

/// Literal reply acknowledging a CONNECT tunnel. No headers, no body.
pub const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// Tells a CONNECT client that the tunnel is up; relayed bytes may follow.
pub async fn send_connect_established<W>(stream: &mut W) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    stream.write_all(CONNECT_ESTABLISHED).await?;
    stream.flush().await
}

/// Writes a complete, self-delimited HTTP/1.1 error response and announces
/// that the connection is about to close.
pub async fn write_http_error<W>(
    stream: &mut W,
    code: u16,
    reason: &str,
    body: &str,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let response = format!(
        "HTTP/1.1 {} {}\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {}",
        code,
        reason,
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await
}

/// Opens a TCP connection to `target` (`host:port`), giving up after `timeout`.
pub async fn dial(target: &str, timeout: Duration) -> Result<TcpStream, ProxyError> {
    match tokio::time::timeout(timeout, TcpStream::connect(target)).await {
        Ok(Ok(stream)) => {
            let _ = stream.set_nodelay(true);
            Ok(stream)
        }
        Ok(Err(e)) => Err(ProxyError::DialFailure(target.to_string(), e)),
        Err(_) => Err(ProxyError::DialFailure(
            target.to_string(),
            io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
        )),
    }
}
