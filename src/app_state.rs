use crate::{
    config::ProxyConfig,
    connection::ActiveConnections,
    proxy::socks5::{FastSocks5Engine, Socks5Engine},
};
use std::sync::Arc;

/// State shared by the accept loop and every connection it spawns.
#[derive(Debug)]
pub struct AppState<E = FastSocks5Engine> {
    pub config: Arc<ProxyConfig>,
    pub connections: ActiveConnections,
    pub socks: Arc<E>,
}

impl<E: Socks5Engine> AppState<E> {
    pub fn new(config: ProxyConfig, socks: E) -> Self {
        Self {
            config: Arc::new(config),
            connections: ActiveConnections::new(),
            socks: Arc::new(socks),
        }
    }
}

impl AppState {
    /// State using the bundled SOCKS5 engine configured from `config`.
    pub fn with_default_engine(config: ProxyConfig) -> Self {
        let socks = FastSocks5Engine::new(&config);
        Self::new(config, socks)
    }
}

impl<E> Clone for AppState<E> {
    fn clone(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            connections: self.connections.clone(),
            socks: Arc::clone(&self.socks),
        }
    }
}
