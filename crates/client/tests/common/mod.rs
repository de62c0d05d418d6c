//! Shared fixtures for the integration tests: scripted origin servers
//! on loopback listeners.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Read one HTTP request head off the stream, returning it as a string.
/// Returns an empty string when the peer closed before a full head.
pub async fn read_request_head<S>(stream: &mut S) -> String
where
    S: AsyncReadExt + Unpin,
{
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    while !buf.ends_with(b"\r\n\r\n") {
        match stream.read(&mut byte).await {
            Ok(0) | Err(_) => return String::new(),
            Ok(_) => buf.push(byte[0]),
        }
    }
    String::from_utf8(buf).unwrap_or_default()
}

/// A plain 200 with a content-length body.
pub fn ok_response(body: &str) -> String {
    format!(
        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    )
}

pub fn origin_uri(addr: SocketAddr, path: &str) -> http::Uri {
    format!("http://{addr}{path}").parse().unwrap()
}

pub struct Origin {
    pub addr: SocketAddr,
    /// Connections accepted so far — the test's dial counter
    pub accepted: Arc<AtomicUsize>,
}

/// Origin that keeps every connection alive and answers each request
/// with `200` and the body `hello`.
pub async fn spawn_keepalive_origin() -> Origin {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&accepted);
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                loop {
                    let head = read_request_head(&mut stream).await;
                    if head.is_empty() {
                        break;
                    }
                    if stream
                        .write_all(ok_response("hello").as_bytes())
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            });
        }
    });
    Origin { addr, accepted }
}

/// Serve keep-alive requests on an already-accepted stream.
pub async fn serve_keepalive(mut stream: TcpStream) {
    loop {
        let head = read_request_head(&mut stream).await;
        if head.is_empty() {
            break;
        }
        if stream
            .write_all(ok_response("hello").as_bytes())
            .await
            .is_err()
        {
            break;
        }
    }
}
