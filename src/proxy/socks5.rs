use std::{future::Future, io, net::SocketAddr, time::Duration};

use anyhow::{anyhow, bail, Context};
use fast_socks5::{
    server::Socks5ServerProtocol, util::target_addr::TargetAddr, ReplyError, Socks5Command,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

use crate::{
    config::ProxyConfig, error::ProxyError, proxy::relay::relay_tunnel, stream::PeekedStream,
    utils,
};

/// Speaks SOCKS5 on a connection whose version byte has been peeked but not
/// consumed.
pub trait Socks5Engine: Send + Sync + 'static {
    fn serve<S>(
        &self,
        stream: PeekedStream<S>,
        peer: SocketAddr,
    ) -> impl Future<Output = anyhow::Result<()>> + Send
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static;
}

/// SOCKS5 engine backed by `fast-socks5`: no authentication, CONNECT only.
#[derive(Debug, Clone)]
pub struct FastSocks5Engine {
    handshake_timeout: Duration,
    dial_timeout: Duration,
    idle_timeout: Duration,
}

impl FastSocks5Engine {
    pub fn new(config: &ProxyConfig) -> Self {
        Self {
            handshake_timeout: config.request_read_timeout,
            dial_timeout: config.dial_timeout,
            idle_timeout: config.idle_timeout,
        }
    }
}

impl Socks5Engine for FastSocks5Engine {
    async fn serve<S>(&self, stream: PeekedStream<S>, peer: SocketAddr) -> anyhow::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let negotiate = async {
            let proto = Socks5ServerProtocol::accept_no_auth(stream)
                .await
                .map_err(|e| anyhow!("socks5 greeting: {}", e))?;
            proto
                .read_command()
                .await
                .map_err(|e| anyhow!("socks5 request: {}", e))
        };
        let (proto, command, target_addr) = tokio::time::timeout(self.handshake_timeout, negotiate)
            .await
            .map_err(|_| anyhow!("socks5 handshake not completed within {:?}", self.handshake_timeout))??;

        if !matches!(command, Socks5Command::TCPConnect) {
            let _ = proto.reply_error(&ReplyError::CommandNotSupported).await;
            bail!("unsupported socks5 command {:?}", command);
        }

        let target = match &target_addr {
            TargetAddr::Ip(addr) => addr.to_string(),
            TargetAddr::Domain(host, port) => format!("{}:{}", host, port),
        };

        let outbound = match utils::dial(&target, self.dial_timeout).await {
            Ok(outbound) => outbound,
            Err(err) => {
                let reply = match &err {
                    ProxyError::DialFailure(_, e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                        ReplyError::ConnectionRefused
                    }
                    _ => ReplyError::HostUnreachable,
                };
                let _ = proto.reply_error(&reply).await;
                return Err(err.into());
            }
        };

        let bound = outbound.local_addr().context("reading outbound local address")?;
        let inbound = proto
            .reply_success(bound)
            .await
            .map_err(|e| anyhow!("socks5 reply: {}", e))?;
        info!("Connection established to {} by {}", target, peer);

        let stats = relay_tunnel(inbound, outbound, self.idle_timeout).await;
        info!(
            "Closed tunnel {} <-> {} (sent: {}, received: {})",
            peer, target, stats.client_to_target, stats.target_to_client
        );
        match stats.error {
            Some(ProxyError::IdleTimeout(idle)) => {
                debug!("tunnel {} <-> {} idle for {:?}", peer, target, idle);
                Ok(())
            }
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::{
        io::{duplex, AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    #[tokio::test]
    async fn connect_through_engine_reaches_target() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            conn.write_all(b"banner").await.unwrap();
        });

        let (mut client, server) = duplex(4096);
        let engine = FastSocks5Engine::new(&ProxyConfig::default());
        let session = tokio::spawn(async move {
            let peer = "127.0.0.1:40000".parse().unwrap();
            engine.serve(PeekedStream::new(server), peer).await
        });

        // greeting: version 5, one method, no auth
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        assert_eq!(method, [0x05, 0x00]);

        let ip = match target.ip() {
            std::net::IpAddr::V4(ip) => ip.octets(),
            std::net::IpAddr::V6(_) => unreachable!("bound to 127.0.0.1"),
        };
        let mut request = vec![0x05, 0x01, 0x00, 0x01];
        request.extend_from_slice(&ip);
        request.extend_from_slice(&target.port().to_be_bytes());
        client.write_all(&request).await.unwrap();

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply[..2], &[0x05, 0x00]);

        let mut banner = [0u8; 6];
        client.read_exact(&mut banner).await.unwrap();
        assert_eq!(&banner, b"banner");

        drop(client);
        assert!(session.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn unsupported_command_is_refused() {
        let (mut client, server) = duplex(4096);
        let engine = FastSocks5Engine::new(&ProxyConfig::default());
        let session = tokio::spawn(async move {
            let peer = "127.0.0.1:40000".parse().unwrap();
            engine.serve(PeekedStream::new(server), peer).await
        });

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();

        // BIND to 127.0.0.1:80
        client
            .write_all(&[0x05, 0x02, 0x00, 0x01, 127, 0, 0, 1, 0, 80])
            .await
            .unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[0], 0x05);
        assert_ne!(reply[1], 0x00);
        assert!(session.await.unwrap().is_err());
    }
}
