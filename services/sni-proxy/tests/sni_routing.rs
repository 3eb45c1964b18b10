
use std::io;
use std::sync::atomic::Ordering;
use std::time::Duration;

use harness::{
    client_hello, eventually, tls_client_connect, ProxyHandle, RecordingBackend, TlsBackend,
};
use sni_proxy::{ListenerClosed, ProxyOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(3);

async fn say_hello(
    handle: &ProxyHandle,
    backend: &TlsBackend,
    server_name: &str,
) -> io::Result<Vec<u8>> {
    let mut tls = tls_client_connect(handle.listen_addr, server_name, &backend.cert_der).await?;
    tls.write_all(b"hello").await?;
    tls.flush().await?;

    let mut buf = vec![0u8; 64];
    let n = timeout(WAIT, tls.read(&mut buf))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "no response"))??;
    Ok(buf[..n].to_vec())
}

/// Read until the proxy closes the connection; a reset counts as closed.
async fn wait_closed(stream: &mut TcpStream) -> Vec<u8> {
    let mut buf = Vec::new();
    let _ = timeout(WAIT, stream.read_to_end(&mut buf))
        .await
        .expect("proxy did not close the connection");
    buf
}

#[tokio::test]
async fn test_routes_mapped_server_name() {
    let mapped = TlsBackend::spawn("svc.example", "mapped").await.unwrap();

    let handle = ProxyHandle::spawn(
        ProxyOptions::new()
            .route_on_sni(true)
            .service("svc.example", mapped.addr.to_string()),
    )
    .await
    .unwrap();

    let response = say_hello(&handle, &mapped, "svc.example").await.unwrap();
    assert_eq!(response, b"mapped");
    assert_eq!(mapped.received().await, vec![b"hello".to_vec()]);
    assert_eq!(mapped.connection_count(), 1);
    assert_eq!(handle.counter(|s| &s.sni_found), 1);

    assert!(ListenerClosed::is(&handle.shutdown().await.unwrap_err()));
}

#[tokio::test]
async fn test_unknown_server_name_uses_default() {
    let mapped = TlsBackend::spawn("svc.example", "mapped").await.unwrap();
    let fallback = TlsBackend::spawn("other.example", "default").await.unwrap();

    let handle = ProxyHandle::spawn(
        ProxyOptions::new()
            .route_on_sni(true)
            .service("svc.example", mapped.addr.to_string())
            .default_address(fallback.addr.to_string()),
    )
    .await
    .unwrap();

    let response = say_hello(&handle, &fallback, "other.example").await.unwrap();
    assert_eq!(response, b"default");
    assert_eq!(mapped.connection_count(), 0);
    assert_eq!(fallback.connection_count(), 1);

    let _ = handle.shutdown().await;
}

#[tokio::test]
async fn test_routing_disabled_always_uses_default() {
    let mapped = TlsBackend::spawn("svc.example", "mapped").await.unwrap();
    let fallback = TlsBackend::spawn("svc.example", "default").await.unwrap();

    let handle = ProxyHandle::spawn(
        ProxyOptions::new()
            .route_on_sni(false)
            .service("svc.example", mapped.addr.to_string())
            .default_address(fallback.addr.to_string()),
    )
    .await
    .unwrap();

    let response = say_hello(&handle, &fallback, "svc.example").await.unwrap();
    assert_eq!(response, b"default");
    assert_eq!(mapped.connection_count(), 0);

    let _ = handle.shutdown().await;
}

#[tokio::test]
async fn test_fips_mode_routes_tls13_client() {
    let backend = TlsBackend::spawn("svc.example", "fips").await.unwrap();

    let handle = ProxyHandle::spawn(
        ProxyOptions::new()
            .route_on_sni(true)
            .service("svc.example", backend.addr.to_string())
            .fips(true),
    )
    .await
    .unwrap();

    let response = say_hello(&handle, &backend, "svc.example").await.unwrap();
    assert_eq!(response, b"fips");

    let _ = handle.shutdown().await;
}

#[tokio::test]
async fn test_plaintext_closed_without_dial() {
    let backend = TlsBackend::spawn("svc.example", "marker").await.unwrap();

    let handle = ProxyHandle::spawn(ProxyOptions::new().default_address(backend.addr.to_string()))
        .await
        .unwrap();

    let mut plain = TcpStream::connect(handle.listen_addr).await.unwrap();
    plain
        .write_all(b"GET / HTTP/1.1\r\nHost: svc.example\r\n\r\n")
        .await
        .unwrap();
    let echoed = wait_closed(&mut plain).await;
    assert!(echoed.is_empty(), "proxy must not answer a non-TLS client");
    assert_eq!(backend.connection_count(), 0);
    assert!(eventually(WAIT, || handle.counter(|s| &s.sni_failed) == 1).await);

    // The proxy keeps serving after a bad client.
    let response = say_hello(&handle, &backend, "svc.example").await.unwrap();
    assert_eq!(response, b"marker");

    let _ = handle.shutdown().await;
}

#[tokio::test]
async fn test_handshake_prefix_replayed_verbatim() {
    let backend = RecordingBackend::spawn().await.unwrap();

    let handle = ProxyHandle::spawn(
        ProxyOptions::new()
            .route_on_sni(true)
            .service("svc.example", backend.addr.to_string()),
    )
    .await
    .unwrap();

    let hello = client_hello("svc.example");
    let mut client = TcpStream::connect(handle.listen_addr).await.unwrap();
    client.write_all(&hello).await.unwrap();
    assert!(eventually(WAIT, || backend.connection_count() == 1).await);

    client.write_all(b"trailing").await.unwrap();
    client.shutdown().await.unwrap();
    drop(client);

    let recorded = {
        let mut recorded = Vec::new();
        for _ in 0..300 {
            recorded = backend.completed().await;
            if !recorded.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        recorded
    };

    let mut expected = hello;
    expected.extend_from_slice(b"trailing");
    assert_eq!(recorded, vec![expected]);

    let _ = handle.shutdown().await;
}

#[tokio::test]
async fn test_concurrency_limit_bounds_accepts() {
    let backend = RecordingBackend::spawn().await.unwrap();

    let handle = ProxyHandle::spawn(
        ProxyOptions::new()
            .default_address(backend.addr.to_string())
            .max_connections(2),
    )
    .await
    .unwrap();

    let mut clients = Vec::new();
    for _ in 0..2 {
        let mut client = TcpStream::connect(handle.listen_addr).await.unwrap();
        client.write_all(&client_hello("svc.example")).await.unwrap();
        clients.push(client);
    }
    assert!(eventually(WAIT, || backend.connection_count() == 2).await);

    for _ in 0..2 {
        let mut client = TcpStream::connect(handle.listen_addr).await.unwrap();
        client.write_all(&client_hello("svc.example")).await.unwrap();
        clients.push(client);
    }

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(handle.counter(|s| &s.connections_accepted), 2);
    assert_eq!(backend.connection_count(), 2);

    // Closing one tunnel frees a token for exactly one waiting client.
    drop(clients.remove(0));
    assert!(eventually(WAIT, || handle.counter(|s| &s.connections_accepted) == 3).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(handle.counter(|s| &s.connections_accepted), 3);

    let _ = handle.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_closes_in_flight_connections() {
    let backend = TlsBackend::spawn("svc.example", "marker").await.unwrap();

    let handle = ProxyHandle::spawn(ProxyOptions::new().default_address(backend.addr.to_string()))
        .await
        .unwrap();

    let mut tls = tls_client_connect(handle.listen_addr, "svc.example", &backend.cert_der)
        .await
        .unwrap();
    tls.write_all(b"hello").await.unwrap();
    let mut buf = vec![0u8; 64];
    let n = timeout(WAIT, tls.read(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf[..n], b"marker");

    let proxy = handle.proxy.clone();
    let err = handle.shutdown().await.unwrap_err();
    assert!(ListenerClosed::is(&err));

    // The tunnel is gone: the client sees EOF or a reset, never more data.
    let after = timeout(WAIT, tls.read(&mut buf)).await.unwrap();
    assert!(!matches!(after, Ok(n) if n > 0));
    assert_eq!(proxy.stats().connections_active.load(Ordering::Relaxed), 0);
}

#[tokio::test]
async fn test_shutdown_closes_connection_awaiting_client_hello() {
    let backend = RecordingBackend::spawn().await.unwrap();

    let handle = ProxyHandle::spawn(
        ProxyOptions::new()
            .default_address(backend.addr.to_string())
            .handshake_timeout(None),
    )
    .await
    .unwrap();

    // Connected but silent: the proxy is stuck reading the ClientHello.
    let mut silent = TcpStream::connect(handle.listen_addr).await.unwrap();
    assert!(eventually(WAIT, || handle.counter(|s| &s.connections_active) == 1).await);

    let proxy = handle.proxy.clone();
    let err = handle.shutdown().await.unwrap_err();
    assert!(ListenerClosed::is(&err));

    let echoed = wait_closed(&mut silent).await;
    assert!(echoed.is_empty());
    assert_eq!(backend.connection_count(), 0);

    let stats = proxy.stats();
    assert_eq!(stats.shutdown_closed.load(Ordering::Relaxed), 1);
    assert_eq!(stats.sni_failed.load(Ordering::Relaxed), 0);
    assert_eq!(stats.connections_active.load(Ordering::Relaxed), 0);
}

#[tokio::test]
async fn test_dial_failure_closes_client() {
    // Reserve a port, then free it so nothing listens there.
    let reserved = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = reserved.local_addr().unwrap();
    drop(reserved);

    let handle = ProxyHandle::spawn(
        ProxyOptions::new()
            .default_address(dead_addr.to_string())
            .retry_attempts(1)
            .retry_interval(Duration::from_millis(20))
            .connect_timeout(Duration::from_millis(200)),
    )
    .await
    .unwrap();

    let mut client = TcpStream::connect(handle.listen_addr).await.unwrap();
    client.write_all(&client_hello("svc.example")).await.unwrap();
    let echoed = wait_closed(&mut client).await;
    assert!(echoed.is_empty());
    assert!(eventually(WAIT, || handle.counter(|s| &s.dial_failed) == 1).await);

    let _ = handle.shutdown().await;
}

#[tokio::test]
async fn test_dial_retries_until_backend_starts() {
    let reserved = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = reserved.local_addr().unwrap();
    drop(reserved);

    let handle = ProxyHandle::spawn(
        ProxyOptions::new()
            .default_address(addr.to_string())
            .retry_attempts(10)
            .retry_interval(Duration::from_millis(50))
            .connect_timeout(Duration::from_millis(200)),
    )
    .await
    .unwrap();

    let hello = client_hello("svc.example");
    let mut client = TcpStream::connect(handle.listen_addr).await.unwrap();
    client.write_all(&hello).await.unwrap();

    // The destination comes up while the proxy is still retrying.
    tokio::time::sleep(Duration::from_millis(120)).await;
    let late = TcpListener::bind(addr).await.unwrap();
    let (mut upstream, _) = timeout(WAIT, late.accept()).await.unwrap().unwrap();

    let mut buf = vec![0u8; hello.len()];
    timeout(WAIT, upstream.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(buf, hello);
    assert_eq!(handle.counter(|s| &s.dial_failed), 0);

    let _ = handle.shutdown().await;
}
