use std::{net::SocketAddr, time::Duration};

use tailgate::{AppState, ProxyConfig, ProxyServer, ServeOutcome};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

struct RunningProxy {
    addr: SocketAddr,
    shutdown: CancellationToken,
    handle: JoinHandle<Result<ServeOutcome, tailgate::ProxyError>>,
}

async fn start_proxy(config: ProxyConfig) -> RunningProxy {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    let server = ProxyServer::new(AppState::with_default_engine(config));
    let handle = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { server.serve(listener, shutdown).await })
    };
    RunningProxy {
        addr,
        shutdown,
        handle,
    }
}

async fn start_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut conn, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let (mut rd, mut wr) = conn.split();
                let _ = tokio::io::copy(&mut rd, &mut wr).await;
            });
        }
    });
    addr
}

/// Reads until the end of the response head, leaving any tunnel bytes unread.
async fn read_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).await.unwrap();
        assert_ne!(n, 0, "connection closed inside response head");
        head.push(byte[0]);
    }
    String::from_utf8(head).unwrap()
}

async fn open_connect_tunnel(proxy: SocketAddr, target: SocketAddr) -> TcpStream {
    let mut client = TcpStream::connect(proxy).await.unwrap();
    let request = format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n\r\n", target, target);
    client.write_all(request.as_bytes()).await.unwrap();
    let head = read_head(&mut client).await;
    assert_eq!(head, "HTTP/1.1 200 Connection Established\r\n\r\n");
    client
}

#[tokio::test]
async fn http_connect_tunnels_to_target() {
    let echo = start_echo().await;
    let proxy = start_proxy(ProxyConfig::default()).await;

    let mut client = open_connect_tunnel(proxy.addr, echo).await;
    client.write_all(b"hello through connect").await.unwrap();
    let mut buf = [0u8; 21];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello through connect");

    drop(client);
    proxy.shutdown.cancel();
    assert_eq!(proxy.handle.await.unwrap().unwrap(), ServeOutcome::Drained);
}

#[tokio::test]
async fn non_connect_method_gets_405() {
    let proxy = start_proxy(ProxyConfig::default()).await;

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    client
        .write_all(b"GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    client.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 405 Method Not Allowed\r\n"));
    assert!(response.contains("Connection: close\r\n"));

    proxy.shutdown.cancel();
    proxy.handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn port_zero_gets_400() {
    let proxy = start_proxy(ProxyConfig::default()).await;

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    client
        .write_all(b"CONNECT 127.0.0.1:0 HTTP/1.1\r\nHost: 127.0.0.1:0\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    client.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));

    proxy.shutdown.cancel();
    proxy.handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn unreachable_target_gets_502() {
    let closed = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let proxy = start_proxy(ProxyConfig::default()).await;

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    let request = format!("CONNECT {} HTTP/1.1\r\n\r\n", closed);
    client.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    client.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 502 Bad Gateway\r\n"));

    proxy.shutdown.cancel();
    proxy.handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn socks5_connect_shares_the_port() {
    let echo = start_echo().await;
    let proxy = start_proxy(ProxyConfig::default()).await;

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut method = [0u8; 2];
    client.read_exact(&mut method).await.unwrap();
    assert_eq!(method, [0x05, 0x00]);

    // CONNECT by domain name to exercise resolution inside the engine
    let host = b"localhost";
    let mut request = vec![0x05, 0x01, 0x00, 0x03, host.len() as u8];
    request.extend_from_slice(host);
    request.extend_from_slice(&echo.port().to_be_bytes());
    client.write_all(&request).await.unwrap();

    let mut reply = [0u8; 4];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply[..2], &[0x05, 0x00]);
    let addr_len = match reply[3] {
        0x01 => 4,
        0x04 => 16,
        other => panic!("unexpected bound address type {}", other),
    };
    let mut bound = vec![0u8; addr_len + 2];
    client.read_exact(&mut bound).await.unwrap();

    client.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");

    drop(client);
    proxy.shutdown.cancel();
    proxy.handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn shutdown_stops_accepting_and_waits_for_tunnels() {
    let echo = start_echo().await;
    let proxy = start_proxy(ProxyConfig::default()).await;
    let mut client = open_connect_tunnel(proxy.addr, echo).await;

    proxy.shutdown.cancel();
    // give the accept loop a moment to close the listener
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(TcpStream::connect(proxy.addr).await.is_err());

    // the tunnel keeps working while the server drains
    client.write_all(b"still here").await.unwrap();
    let mut buf = [0u8; 10];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"still here");
    assert!(!proxy.handle.is_finished());

    drop(client);
    let outcome = tokio::time::timeout(Duration::from_secs(5), proxy.handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(outcome, ServeOutcome::Drained);
}

#[tokio::test]
async fn drain_timeout_leaves_stuck_tunnels_behind() {
    let echo = start_echo().await;
    let config = ProxyConfig {
        drain_timeout: Duration::from_millis(200),
        ..ProxyConfig::default()
    };
    let proxy = start_proxy(config).await;
    let _client = open_connect_tunnel(proxy.addr, echo).await;

    proxy.shutdown.cancel();
    let outcome = proxy.handle.await.unwrap().unwrap();
    assert_eq!(outcome, ServeOutcome::DrainTimedOut { remaining: 1 });
}
