//! Integration tests for the connection pool.
//!
//! Each test drives a real client against a scripted origin server on a
//! loopback listener and observes dials through the server's accept
//! counter plus the client's pool metrics.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use courier_client::{
    CancellationToken, Client, ClientConfig, ConnectFuture, CourierError, Request,
};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::Notify;

use common::{ok_response, origin_uri, read_request_head};

// ============================================================================
// Reuse
// ============================================================================

#[tokio::test]
async fn test_sequential_requests_reuse_one_connection() {
    let origin = common::spawn_keepalive_origin().await;
    let config = ClientConfig {
        max_connections_per_server: Some(1),
        pooled_connection_idle_timeout: None,
        pooled_connection_lifetime: None,
        ..Default::default()
    };
    let client = Client::new(config).unwrap();

    for _ in 0..2 {
        let response = client.get(origin_uri(origin.addr, "/")).await.unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.bytes().await.unwrap().as_ref(), b"hello");
    }

    assert_eq!(origin.accepted.load(Ordering::SeqCst), 1);
    let metrics = client.metrics();
    assert_eq!(metrics.connections_opened, 1);
    assert_eq!(metrics.connections_reused, 1);
}

// ============================================================================
// Cap and waiters
// ============================================================================

#[tokio::test]
async fn test_cap_queues_waiter_and_hands_off() {
    // Delay the first response long enough for a second request to
    // queue behind the single-connection cap
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    {
        let accepted = Arc::clone(&accepted);
        let served = Arc::new(AtomicUsize::new(0));
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                accepted.fetch_add(1, Ordering::SeqCst);
                let served = Arc::clone(&served);
                tokio::spawn(async move {
                    loop {
                        let head = read_request_head(&mut stream).await;
                        if head.is_empty() {
                            break;
                        }
                        if served.fetch_add(1, Ordering::SeqCst) == 0 {
                            tokio::time::sleep(Duration::from_millis(300)).await;
                        }
                        if stream.write_all(ok_response("ok").as_bytes()).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
    }

    let config = ClientConfig {
        max_connections_per_server: Some(1),
        ..Default::default()
    };
    let client = Arc::new(Client::new(config).unwrap());

    let first = {
        let client = Arc::clone(&client);
        let uri = origin_uri(addr, "/");
        tokio::spawn(async move { client.get(uri).await.unwrap().bytes().await.unwrap() })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    let second = {
        let client = Arc::clone(&client);
        let uri = origin_uri(addr, "/");
        tokio::spawn(async move { client.get(uri).await.unwrap().bytes().await.unwrap() })
    };

    assert_eq!(first.await.unwrap().as_ref(), b"ok");
    assert_eq!(second.await.unwrap().as_ref(), b"ok");

    // One dial: the released connection was handed straight to the
    // queued waiter
    assert_eq!(accepted.load(Ordering::SeqCst), 1);
    let metrics = client.metrics();
    assert_eq!(metrics.connections_opened, 1);
    assert_eq!(metrics.pool_waits, 1);
    assert_eq!(metrics.handoffs, 1);
}

#[tokio::test]
async fn test_cancelled_waiter_does_not_consume_the_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    {
        let accepted = Arc::clone(&accepted);
        let served = Arc::new(AtomicUsize::new(0));
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                accepted.fetch_add(1, Ordering::SeqCst);
                let served = Arc::clone(&served);
                tokio::spawn(async move {
                    loop {
                        let head = read_request_head(&mut stream).await;
                        if head.is_empty() {
                            break;
                        }
                        if served.fetch_add(1, Ordering::SeqCst) == 0 {
                            tokio::time::sleep(Duration::from_millis(300)).await;
                        }
                        if stream.write_all(ok_response("ok").as_bytes()).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
    }

    let config = ClientConfig {
        max_connections_per_server: Some(1),
        ..Default::default()
    };
    let client = Arc::new(Client::new(config).unwrap());

    // A holds the only connection
    let first = {
        let client = Arc::clone(&client);
        let uri = origin_uri(addr, "/");
        tokio::spawn(async move { client.get(uri).await.unwrap().bytes().await.unwrap() })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    // B queues, then cancels
    let cancel = CancellationToken::new();
    let second = {
        let client = Arc::clone(&client);
        let uri = origin_uri(addr, "/");
        let cancel = cancel.clone();
        tokio::spawn(async move { client.send_with_cancel(Request::get(uri), &cancel).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();
    let err = second.await.unwrap().unwrap_err();
    assert!(matches!(err, CourierError::AcquireCancelled { .. }));

    // A finishes; its connection goes back to the pool rather than to
    // the dead waiter, and C picks it up without a dial
    assert_eq!(first.await.unwrap().as_ref(), b"ok");
    let third = client.get(origin_uri(addr, "/")).await.unwrap();
    assert_eq!(third.bytes().await.unwrap().as_ref(), b"ok");

    assert_eq!(accepted.load(Ordering::SeqCst), 1);
    assert_eq!(client.metrics().connections_opened, 1);
}

// ============================================================================
// Stale detection and expiry
// ============================================================================

#[tokio::test]
async fn test_stale_connection_detected_and_replaced() {
    // First connection: serve one request, close on signal. Later
    // connections: keep-alive.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let close_signal = Arc::new(Notify::new());
    {
        let accepted = Arc::clone(&accepted);
        let close_signal = Arc::clone(&close_signal);
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                let index = accepted.fetch_add(1, Ordering::SeqCst);
                if index == 0 {
                    let close_signal = Arc::clone(&close_signal);
                    tokio::spawn(async move {
                        let _ = read_request_head(&mut stream).await;
                        let _ = stream.write_all(ok_response("hello").as_bytes()).await;
                        close_signal.notified().await;
                        drop(stream);
                    });
                } else {
                    tokio::spawn(common::serve_keepalive(stream));
                }
            }
        });
    }

    let client = Client::new(ClientConfig::default()).unwrap();

    let response = client.get(origin_uri(addr, "/")).await.unwrap();
    assert_eq!(response.bytes().await.unwrap().as_ref(), b"hello");

    // The pooled connection goes stale: server closes it underneath us
    close_signal.notify_one();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The acquirer's probe sees the close, disposes, and dials fresh
    let response = client.get(origin_uri(addr, "/")).await.unwrap();
    assert_eq!(response.bytes().await.unwrap().as_ref(), b"hello");

    assert_eq!(accepted.load(Ordering::SeqCst), 2);
    let metrics = client.metrics();
    assert_eq!(metrics.connections_opened, 2);
    assert_eq!(metrics.stale_evictions, 1);
}

#[tokio::test]
async fn test_lifetime_expiry_forces_second_dial() {
    let origin = common::spawn_keepalive_origin().await;
    let config = ClientConfig {
        pooled_connection_lifetime: Some(Duration::from_millis(100)),
        ..Default::default()
    };
    let client = Client::new(config).unwrap();

    let response = client.get(origin_uri(origin.addr, "/")).await.unwrap();
    assert_eq!(response.status(), 200);
    let _ = response.bytes().await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;

    let response = client.get(origin_uri(origin.addr, "/")).await.unwrap();
    assert_eq!(response.status(), 200);
    let _ = response.bytes().await.unwrap();

    assert_eq!(origin.accepted.load(Ordering::SeqCst), 2);
    assert_eq!(client.metrics().connections_opened, 2);
}

#[tokio::test]
async fn test_zero_lifetime_never_pools() {
    let origin = common::spawn_keepalive_origin().await;
    let config = ClientConfig {
        pooled_connection_lifetime: Some(Duration::ZERO),
        ..Default::default()
    };
    let client = Client::new(config).unwrap();

    for _ in 0..2 {
        let response = client.get(origin_uri(origin.addr, "/")).await.unwrap();
        let _ = response.bytes().await.unwrap();
    }

    assert_eq!(origin.accepted.load(Ordering::SeqCst), 2);
    assert_eq!(client.metrics().connections_reused, 0);
}

// ============================================================================
// Body framings and connection teardown headers
// ============================================================================

#[tokio::test]
async fn test_chunked_body_decoded_and_connection_reused() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    {
        let accepted = Arc::clone(&accepted);
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                accepted.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    loop {
                        let head = read_request_head(&mut stream).await;
                        if head.is_empty() {
                            break;
                        }
                        let response = "HTTP/1.1 200 OK\r\n\
                                        Transfer-Encoding: chunked\r\n\
                                        \r\n\
                                        5\r\nHello\r\n7\r\n World!\r\n0\r\n\r\n";
                        if stream.write_all(response.as_bytes()).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
    }

    let client = Client::new(ClientConfig::default()).unwrap();
    for _ in 0..2 {
        let response = client.get(origin_uri(addr, "/")).await.unwrap();
        assert_eq!(response.bytes().await.unwrap().as_ref(), b"Hello World!");
    }

    // Chunked framing delimits the body, so the connection is reusable
    assert_eq!(accepted.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_connection_close_header_prevents_reuse() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    {
        let accepted = Arc::clone(&accepted);
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                accepted.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let _ = read_request_head(&mut stream).await;
                    let response =
                        "HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Length: 3\r\n\r\nbye";
                    let _ = stream.write_all(response.as_bytes()).await;
                });
            }
        });
    }

    let client = Client::new(ClientConfig::default()).unwrap();
    for _ in 0..2 {
        let response = client.get(origin_uri(addr, "/")).await.unwrap();
        assert_eq!(response.bytes().await.unwrap().as_ref(), b"bye");
    }

    assert_eq!(accepted.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_body_until_close_is_read_and_not_reused() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    {
        let accepted = Arc::clone(&accepted);
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                accepted.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let _ = read_request_head(&mut stream).await;
                    // No framing headers: the body runs to EOF
                    let _ = stream
                        .write_all(b"HTTP/1.1 200 OK\r\n\r\nstream until close")
                        .await;
                });
            }
        });
    }

    let client = Client::new(ClientConfig::default()).unwrap();
    for _ in 0..2 {
        let response = client.get(origin_uri(addr, "/")).await.unwrap();
        assert_eq!(
            response.bytes().await.unwrap().as_ref(),
            b"stream until close"
        );
    }

    assert_eq!(accepted.load(Ordering::SeqCst), 2);
}

// ============================================================================
// Connect timeout and connect callback
// ============================================================================

#[tokio::test]
async fn test_connect_timeout_surfaces_as_timeout() {
    let config = ClientConfig {
        connect_timeout: Some(Duration::from_millis(100)),
        connect_callback: Some(Arc::new(|_host: &str, _port: u16| -> ConnectFuture {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "never"))
            })
        })),
        ..Default::default()
    };
    let client = Client::new(config).unwrap();

    let err = client
        .get("http://10.255.255.1/".parse().unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, CourierError::ConnectTimeout { .. }));
}

#[tokio::test]
async fn test_connect_callback_replaces_the_dial() {
    let origin = common::spawn_keepalive_origin().await;
    let used = Arc::new(AtomicUsize::new(0));
    let used_in_callback = Arc::clone(&used);

    let config = ClientConfig {
        connect_callback: Some(Arc::new(move |host: &str, port: u16| -> ConnectFuture {
            used_in_callback.fetch_add(1, Ordering::SeqCst);
            let host = host.to_string();
            Box::pin(async move { tokio::net::TcpStream::connect((host, port)).await })
        })),
        ..Default::default()
    };
    let client = Client::new(config).unwrap();

    let response = client.get(origin_uri(origin.addr, "/")).await.unwrap();
    assert_eq!(response.bytes().await.unwrap().as_ref(), b"hello");
    assert_eq!(used.load(Ordering::SeqCst), 1);
}

// ============================================================================
// Teardown
// ============================================================================

#[tokio::test]
async fn test_disposed_client_rejects_requests() {
    let origin = common::spawn_keepalive_origin().await;
    let client = Client::new(ClientConfig::default()).unwrap();

    let response = client.get(origin_uri(origin.addr, "/")).await.unwrap();
    let _ = response.bytes().await.unwrap();

    client.dispose();
    let err = client.get(origin_uri(origin.addr, "/")).await.unwrap_err();
    assert!(matches!(err, CourierError::Disposed { .. }));
    assert_eq!(client.active_pools(), 0);
}
