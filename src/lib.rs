//! Dual-protocol forward proxy: SOCKS5 and HTTP CONNECT on one listener.

pub mod app_state;
pub mod config;
pub mod connection;
pub mod error;
pub mod proxy;
pub mod stream;
pub mod utils;

pub use app_state::AppState;
pub use config::{ConfigFile, ProxyConfig};
pub use error::ProxyError;
pub use proxy::listener::{AcceptErrorPolicy, Listener, ProxyServer, ServeOutcome};
pub use proxy::socks5::{FastSocks5Engine, Socks5Engine};
