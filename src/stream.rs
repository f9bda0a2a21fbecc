use std::{
    future::Future,
    io,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader, ReadBuf},
    time::{sleep_until, Instant, Sleep},
};

/// An accepted connection whose leading bytes may already have been inspected.
///
/// Reads are served from the read-ahead buffer first and then from the
/// underlying stream, so nothing peeked is lost or duplicated. Writes go
/// straight to the underlying stream.
pub struct PeekedStream<S> {
    inner: BufReader<S>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> PeekedStream<S> {
    pub fn new(stream: S) -> Self {
        Self {
            inner: BufReader::new(stream),
        }
    }

    /// Returns the next byte without consuming it, `None` on end of stream.
    pub async fn peek_byte(&mut self) -> io::Result<Option<u8>> {
        let buf = self.inner.fill_buf().await?;
        Ok(buf.first().copied())
    }

    /// Bytes read from the connection but not yet handed to a reader.
    pub fn buffered(&self) -> &[u8] {
        self.inner.buffer()
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for PeekedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncBufRead for PeekedStream<S> {
    fn poll_fill_buf(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<&[u8]>> {
        Pin::new(&mut self.get_mut().inner).poll_fill_buf(cx)
    }

    fn consume(self: Pin<&mut Self>, amt: usize) {
        Pin::new(&mut self.get_mut().inner).consume(amt)
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for PeekedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Fails pending reads and writes once the stream has seen no completed
/// operation for `timeout`.
///
/// Reads and writes share one deadline, each completed operation pushing it
/// forward. Separate timers are kept per direction so the stream can be split
/// between a reading task and a writing task without the two fighting over
/// a single waker.
pub struct IdleTimeoutStream<S> {
    inner: S,
    timeout: Duration,
    deadline: Instant,
    read_timer: Pin<Box<Sleep>>,
    write_timer: Pin<Box<Sleep>>,
}

impl<S> IdleTimeoutStream<S> {
    pub fn new(inner: S, timeout: Duration) -> Self {
        let deadline = deadline_after(timeout);
        Self {
            inner,
            timeout,
            deadline,
            read_timer: Box::pin(sleep_until(deadline)),
            write_timer: Box::pin(sleep_until(deadline)),
        }
    }

    fn touch(&mut self) {
        self.deadline = deadline_after(self.timeout);
    }

    fn idle_error(&self) -> io::Error {
        io::Error::new(io::ErrorKind::TimedOut, IdleElapsed(self.timeout))
    }
}

/// Payload of the error an [`IdleTimeoutStream`] raises, telling it apart from
/// timeouts reported by the OS.
#[derive(Debug, thiserror::Error)]
#[error("no traffic for {0:?}")]
struct IdleElapsed(Duration);

/// Whether an I/O error is the idle deadline of an [`IdleTimeoutStream`] lapsing.
pub fn is_idle_timeout(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::TimedOut
        && err.get_ref().is_some_and(|inner| inner.is::<IdleElapsed>())
}

// ~30 years, the same horizon tokio uses when a timeout overflows Instant
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout).unwrap_or_else(|| now + FAR_FUTURE)
}

fn poll_deadline(timer: &mut Pin<Box<Sleep>>, deadline: Instant, cx: &mut Context<'_>) -> Poll<()> {
    if timer.deadline() != deadline {
        timer.as_mut().reset(deadline);
    }
    timer.as_mut().poll(cx)
}

impl<S: AsyncRead + Unpin> AsyncRead for IdleTimeoutStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(res) => {
                this.touch();
                Poll::Ready(res)
            }
            Poll::Pending => match poll_deadline(&mut this.read_timer, this.deadline, cx) {
                Poll::Ready(()) => Poll::Ready(Err(this.idle_error())),
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for IdleTimeoutStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(res) => {
                this.touch();
                Poll::Ready(res)
            }
            Poll::Pending => match poll_deadline(&mut this.write_timer, this.deadline, cx) {
                Poll::Ready(()) => Poll::Ready(Err(this.idle_error())),
                Poll::Pending => Poll::Pending,
            },
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
