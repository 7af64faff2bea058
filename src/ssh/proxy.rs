//! Proxy tunnel
//!
//! Opens a TCP stream to the SSH target through a SOCKS4, SOCKS5 or HTTP CONNECT
//! proxy. Every failure, including a proxy that cannot be reached at all, maps to
//! [`SshError::Proxy`].

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

use super::config::{ProxyConfig, ProxyKind};
use super::error::SshError;

/// Connect to `target_host:target_port` through `proxy`.
pub async fn connect_via_proxy(
    proxy: &ProxyConfig,
    target_host: &str,
    target_port: u16,
    connect_timeout: Duration,
) -> Result<TcpStream, SshError> {
    let proxy_addr = resolve_proxy(proxy).await?;
    info!(
        "Tunneling to {}:{} via {:?} proxy {}",
        target_host, target_port, proxy.kind, proxy_addr
    );

    let stream = match proxy.kind {
        ProxyKind::Socks4 => {
            connect_socks4(proxy_addr, proxy, target_host, target_port, connect_timeout).await?
        }
        ProxyKind::Socks5 => {
            connect_socks5(proxy_addr, proxy, target_host, target_port, connect_timeout).await?
        }
        ProxyKind::Http => {
            connect_http(proxy_addr, proxy, target_host, target_port, connect_timeout).await?
        }
    };

    debug!("Proxy tunnel to {}:{} established", target_host, target_port);
    Ok(stream)
}

async fn resolve_proxy(proxy: &ProxyConfig) -> Result<SocketAddr, SshError> {
    let addr = proxy.address();
    let mut resolved = tokio::net::lookup_host(addr.as_str())
        .await
        .map_err(|e| SshError::Proxy(format!("Failed to resolve proxy address {}: {}", addr, e)))?;
    let first = resolved.next();
    first.ok_or_else(|| SshError::Proxy(format!("No address found for proxy {}", addr)))
}

async fn connect_socks4(
    proxy_addr: SocketAddr,
    proxy: &ProxyConfig,
    target_host: &str,
    target_port: u16,
    connect_timeout: Duration,
) -> Result<TcpStream, SshError> {
    use tokio_socks::tcp::Socks4Stream;

    let target = (target_host, target_port);
    let result = match proxy.username.as_deref() {
        Some(user_id) => {
            timeout(
                connect_timeout,
                Socks4Stream::connect_with_userid(proxy_addr, target, user_id),
            )
            .await
        }
        None => timeout(connect_timeout, Socks4Stream::connect(proxy_addr, target)).await,
    };

    let stream = result
        .map_err(|_| SshError::Proxy("SOCKS4 proxy connection timeout".to_string()))?
        .map_err(|e| SshError::Proxy(format!("SOCKS4 proxy connection failed: {}", e)))?;
    Ok(stream.into_inner())
}

async fn connect_socks5(
    proxy_addr: SocketAddr,
    proxy: &ProxyConfig,
    target_host: &str,
    target_port: u16,
    connect_timeout: Duration,
) -> Result<TcpStream, SshError> {
    use tokio_socks::tcp::Socks5Stream;

    let target = (target_host, target_port);
    let stream = match (proxy.username.as_deref(), proxy.password.as_deref()) {
        (Some(username), Some(password)) => timeout(
            connect_timeout,
            Socks5Stream::connect_with_password(proxy_addr, target, username, password),
        )
        .await
        .map_err(|_| SshError::Proxy("SOCKS5 proxy connection timeout".to_string()))?
        .map_err(|e| {
            let message = e.to_string();
            if message.contains("auth") {
                SshError::Proxy(format!("SOCKS5 proxy authentication failed: {}", e))
            } else {
                SshError::Proxy(format!("SOCKS5 proxy connection failed: {}", e))
            }
        })?,
        _ => timeout(connect_timeout, Socks5Stream::connect(proxy_addr, target))
            .await
            .map_err(|_| SshError::Proxy("SOCKS5 proxy connection timeout".to_string()))?
            .map_err(|e| SshError::Proxy(format!("SOCKS5 proxy connection failed: {}", e)))?,
    };

    Ok(stream.into_inner())
}

async fn connect_http(
    proxy_addr: SocketAddr,
    proxy: &ProxyConfig,
    target_host: &str,
    target_port: u16,
    connect_timeout: Duration,
) -> Result<TcpStream, SshError> {
    use async_http_proxy::{http_connect_tokio, http_connect_tokio_with_basic_auth};

    let mut stream = timeout(connect_timeout, TcpStream::connect(proxy_addr))
        .await
        .map_err(|_| SshError::Proxy("HTTP proxy connection timeout".to_string()))?
        .map_err(|e| SshError::Proxy(format!("Failed to connect to HTTP proxy: {}", e)))?;

    let result = match (proxy.username.as_deref(), proxy.password.as_deref()) {
        (Some(username), Some(password)) => {
            timeout(
                connect_timeout,
                http_connect_tokio_with_basic_auth(
                    &mut stream,
                    target_host,
                    target_port,
                    username,
                    password,
                ),
            )
            .await
        }
        _ => {
            timeout(
                connect_timeout,
                http_connect_tokio(&mut stream, target_host, target_port),
            )
            .await
        }
    };

    result
        .map_err(|_| SshError::Proxy("HTTP CONNECT tunnel timeout".to_string()))?
        .map_err(|e| {
            let message = e.to_string();
            if message.contains("407") {
                SshError::Proxy("HTTP proxy authentication failed (407)".to_string())
            } else {
                SshError::Proxy(format!("HTTP CONNECT tunnel failed: {}", e))
            }
        })?;

    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const TIMEOUT: Duration = Duration::from_secs(5);

    async fn read_http_head(sock: &mut TcpStream) -> String {
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            sock.read_exact(&mut byte).await.unwrap();
            head.push(byte[0]);
        }
        String::from_utf8(head).unwrap()
    }

    async fn echo_once(sock: &mut TcpStream) {
        let mut buf = [0u8; 4];
        sock.read_exact(&mut buf).await.unwrap();
        sock.write_all(&buf).await.unwrap();
    }

    #[tokio::test]
    async fn test_resolve_proxy_literal_address() {
        let proxy = ProxyConfig::new(ProxyKind::Socks5, "127.0.0.1", 1080);
        let addr = resolve_proxy(&proxy).await.unwrap();
        assert_eq!(addr, "127.0.0.1:1080".parse::<SocketAddr>().unwrap());
    }

    #[tokio::test]
    async fn test_http_connect_tunnel() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let head = read_http_head(&mut sock).await;
            sock.write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                .await
                .unwrap();
            echo_once(&mut sock).await;
            head
        });

        let proxy = ProxyConfig::new(ProxyKind::Http, "127.0.0.1", port);
        let mut stream = connect_via_proxy(&proxy, "ssh.internal", 22, TIMEOUT)
            .await
            .unwrap();

        stream.write_all(b"ping").await.unwrap();
        let mut echoed = [0u8; 4];
        stream.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"ping");

        let head = server.await.unwrap();
        assert!(head.starts_with("CONNECT ssh.internal:22"), "{}", head);
    }

    #[tokio::test]
    async fn test_http_proxy_auth_required() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let _ = read_http_head(&mut sock).await;
            let _ = sock
                .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
                .await;
        });

        let proxy = ProxyConfig::new(ProxyKind::Http, "127.0.0.1", port);
        let err = connect_via_proxy(&proxy, "ssh.internal", 22, TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, SshError::Proxy(_)), "{:?}", err);
    }

    #[tokio::test]
    async fn test_socks5_tunnel() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();

            // Greeting: VER, NMETHODS, METHODS...
            let mut greeting = [0u8; 2];
            sock.read_exact(&mut greeting).await.unwrap();
            let mut methods = vec![0u8; greeting[1] as usize];
            sock.read_exact(&mut methods).await.unwrap();
            sock.write_all(&[0x05, 0x00]).await.unwrap();

            // Request: VER, CMD, RSV, ATYP, ADDR, PORT
            let mut request = [0u8; 4];
            sock.read_exact(&mut request).await.unwrap();
            assert_eq!(request[1], 0x01);
            let host = match request[3] {
                0x03 => {
                    let mut len = [0u8; 1];
                    sock.read_exact(&mut len).await.unwrap();
                    let mut name = vec![0u8; len[0] as usize];
                    sock.read_exact(&mut name).await.unwrap();
                    String::from_utf8(name).unwrap()
                }
                0x01 => {
                    let mut ip = [0u8; 4];
                    sock.read_exact(&mut ip).await.unwrap();
                    std::net::Ipv4Addr::from(ip).to_string()
                }
                other => panic!("unexpected address type {}", other),
            };
            let mut port_bytes = [0u8; 2];
            sock.read_exact(&mut port_bytes).await.unwrap();

            sock.write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
            echo_once(&mut sock).await;
            (host, u16::from_be_bytes(port_bytes))
        });

        let proxy = ProxyConfig::new(ProxyKind::Socks5, "127.0.0.1", port);
        let mut stream = connect_via_proxy(&proxy, "ssh.internal", 2222, TIMEOUT)
            .await
            .unwrap();

        stream.write_all(b"pong").await.unwrap();
        let mut echoed = [0u8; 4];
        stream.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"pong");

        let (host, target_port) = server.await.unwrap();
        assert_eq!(host, "ssh.internal");
        assert_eq!(target_port, 2222);
    }

    #[tokio::test]
    async fn test_unreachable_proxy_is_proxy_error() {
        // Reserve a port, then close it so nothing is listening
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        for kind in [ProxyKind::Socks4, ProxyKind::Socks5, ProxyKind::Http] {
            let proxy = ProxyConfig::new(kind, "127.0.0.1", port);
            let err = connect_via_proxy(&proxy, "ssh.internal", 22, TIMEOUT)
                .await
                .unwrap_err();
            assert!(matches!(err, SshError::Proxy(_)), "{:?}: {:?}", kind, err);
        }
    }
}
