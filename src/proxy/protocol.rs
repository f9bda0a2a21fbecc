use std::fmt;

use crate::error::ProxyError;

/// SOCKS protocol version byte that opens every SOCKS5 greeting.
pub const SOCKS5_VERSION: u8 = 0x05;

/// Port assumed when a CONNECT authority carries none.
pub const DEFAULT_CONNECT_PORT: u16 = 443;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyProtocol {
    Socks5,
    HttpConnect,
}

impl fmt::Display for ProxyProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProxyProtocol::Socks5 => "socks5",
            ProxyProtocol::HttpConnect => "http",
        };
        write!(f, "{}", s)
    }
}

/// Picks the protocol from the first byte a client sent.
pub fn detect_protocol(first_byte: u8) -> ProxyProtocol {
    if first_byte == SOCKS5_VERSION {
        ProxyProtocol::Socks5
    } else {
        ProxyProtocol::HttpConnect
    }
}

/// A dialable destination. Displays as `host:port`, bracketing IPv6 hosts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyTarget {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for ProxyTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum SplitError {
    MissingPort,
    TooManyColons,
    Malformed(&'static str),
}

/// Splits `host:port`, accepting a bracketed host (`[::1]:443`).
fn split_host_port(hostport: &str) -> Result<(&str, &str), SplitError> {
    let colon = hostport.rfind(':').ok_or(SplitError::MissingPort)?;

    // `[` may not appear at or after `open`, `]` at or after `close`.
    let (host, open, close) = if hostport.starts_with('[') {
        let end = hostport
            .find(']')
            .ok_or(SplitError::Malformed("missing ']' in address"))?;
        match end + 1 {
            n if n == hostport.len() => return Err(SplitError::MissingPort),
            n if n == colon => {}
            n if hostport.as_bytes()[n] == b':' => return Err(SplitError::TooManyColons),
            _ => return Err(SplitError::MissingPort),
        }
        (&hostport[1..end], 1, end + 1)
    } else {
        let host = &hostport[..colon];
        if host.contains(':') {
            return Err(SplitError::TooManyColons);
        }
        (host, 0, 0)
    };

    if hostport[open..].contains('[') {
        return Err(SplitError::Malformed("unexpected '[' in address"));
    }
    if hostport[close..].contains(']') {
        return Err(SplitError::Malformed("unexpected ']' in address"));
    }

    Ok((host, &hostport[colon + 1..]))
}

/// Normalizes the authority of a CONNECT request into a dialable target.
///
/// `host:port` is returned as is; a missing port defaults to 443, and a bare
/// IPv6 literal such as `::1` is bracketed. Authorities containing spaces or
/// slashes are refused, since CONNECT never carries a path.
pub fn resolve_target(authority: &str) -> Result<ProxyTarget, ProxyError> {
    let invalid = |reason| ProxyError::InvalidTarget(authority.to_string(), reason);

    let hostport = authority.trim();
    if hostport.is_empty() {
        return Err(invalid("empty host"));
    }
    if hostport.contains([' ', '/', '\\']) {
        return Err(invalid("invalid host format"));
    }

    match split_host_port(hostport) {
        Ok((host, port)) => {
            if host.trim().is_empty() {
                return Err(invalid("empty host"));
            }
            Ok(ProxyTarget {
                host: host.to_string(),
                port: parse_port(port).ok_or_else(|| invalid("invalid port"))?,
            })
        }
        // CONNECT targets are host or host:port, so several colons without
        // brackets can only be an IPv6 literal lacking a port.
        Err(SplitError::TooManyColons) if !hostport.starts_with('[') => Ok(ProxyTarget {
            host: hostport.to_string(),
            port: DEFAULT_CONNECT_PORT,
        }),
        Err(SplitError::MissingPort) => {
            let host = match hostport.strip_prefix('[') {
                Some(bracketed) => bracketed
                    .strip_suffix(']')
                    .ok_or_else(|| invalid("missing port in address"))?,
                None => hostport,
            };
            if host.is_empty() {
                return Err(invalid("empty host"));
            }
            Ok(ProxyTarget {
                host: host.to_string(),
                port: DEFAULT_CONNECT_PORT,
            })
        }
        Err(SplitError::TooManyColons) => Err(invalid("too many colons in address")),
        Err(SplitError::Malformed(reason)) => Err(invalid(reason)),
    }
}

/// Base-10 port in 1..=65535. No sign, no whitespace.
fn parse_port(port: &str) -> Option<u16> {
    if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    port.parse::<u16>().ok().filter(|&p| p != 0)
}
