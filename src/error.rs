use std::io;
use thiserror::Error;

/// Errors produced while serving proxy connections.
///
/// Per-connection variants never leave the task handling that connection;
/// only `FatalAccept` and `Config` reach the caller of the server.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// CONNECT authority is empty, malformed or carries path-like characters
    #[error("invalid CONNECT target {0:?}: {1}")]
    InvalidTarget(String, &'static str),

    /// Request head exceeded the byte cap or the header table
    #[error("request head exceeds {0} bytes")]
    RequestTooLarge(usize),

    /// Request head could not be read or parsed
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    /// Anything other than CONNECT on the HTTP path
    #[error("method {0} not allowed, CONNECT required")]
    UnsupportedMethod(String),

    /// Target could not be reached within the dial timeout
    #[error("failed to dial {0}: {1}")]
    DialFailure(String, io::Error),

    /// No traffic on a tunnel for the configured idle duration
    #[error("tunnel idle for {0:?}")]
    IdleTimeout(std::time::Duration),

    /// Listener failed with an error the retry policy does not recover from
    #[error("accept failed: {0}")]
    FatalAccept(io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ProxyError {
    /// HTTP status line sent to a CONNECT client for this error, if any.
    pub fn http_status(&self) -> Option<(u16, &'static str)> {
        match self {
            ProxyError::RequestTooLarge(_) => Some((431, "Request Header Fields Too Large")),
            ProxyError::MalformedRequest(_) | ProxyError::InvalidTarget(..) => {
                Some((400, "Bad Request"))
            }
            ProxyError::UnsupportedMethod(_) => Some((405, "Method Not Allowed")),
            ProxyError::DialFailure(..) => Some((502, "Bad Gateway")),
            _ => None,
        }
    }

    /// Short plain-text body accompanying the status line.
    pub fn http_body(&self) -> &'static str {
        match self {
            ProxyError::RequestTooLarge(_) => "request too large\n",
            ProxyError::MalformedRequest(_) => "malformed request\n",
            ProxyError::InvalidTarget(..) => "invalid CONNECT host\n",
            ProxyError::UnsupportedMethod(_) => "CONNECT required\n",
            ProxyError::DialFailure(..) => "dial failed\n",
            _ => "",
        }
    }
}
