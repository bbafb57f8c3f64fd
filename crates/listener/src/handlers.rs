//! Built-in connection handlers.

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use tracing::{debug, info};

use crate::coordinator::CertificateCoordinator;
use crate::server::ConnectionHandler;

/// Largest request head the status handler reads
const MAX_REQUEST_HEAD: usize = 8 * 1024;

/// Answers any HTTP/1.1 request with the coordinator's stats as JSON
#[derive(Debug, Clone)]
pub struct StatusHandler {
    coordinator: Arc<CertificateCoordinator>,
}

impl StatusHandler {
    pub fn new(coordinator: Arc<CertificateCoordinator>) -> Self {
        Self { coordinator }
    }

    fn response(&self, status: &str, body: &[u8]) -> Vec<u8> {
        let mut response = format!(
            "HTTP/1.1 {}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
            status,
            body.len()
        )
        .into_bytes();
        response.extend_from_slice(body);
        response
    }
}

#[async_trait]
impl ConnectionHandler for StatusHandler {
    async fn handle(&self, mut stream: TlsStream<TcpStream>, peer: SocketAddr) -> anyhow::Result<()> {
        let head = read_request_head(&mut stream).await?;

        let response = match head {
            Some(head) => {
                let request_line = head.lines().next().unwrap_or_default();
                debug!(peer = %peer, request = %request_line, "Status request");
                let body = serde_json::to_vec_pretty(&self.coordinator.stats())?;
                self.response("200 OK", &body)
            }
            None => self.response(
                "431 Request Header Fields Too Large",
                br#"{"error":"request head too large"}"#,
            ),
        };

        stream.write_all(&response).await?;
        stream.shutdown().await?;
        Ok(())
    }
}

/// Read until the blank line ending an HTTP request head.
///
/// Returns `None` when the head exceeds [`MAX_REQUEST_HEAD`].
async fn read_request_head<S>(stream: &mut S) -> anyhow::Result<Option<String>>
where
    S: tokio::io::AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    loop {
        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            return Ok(Some(String::from_utf8_lossy(&buf).into_owned()));
        }
        if buf.len() > MAX_REQUEST_HEAD {
            return Ok(None);
        }

        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            anyhow::bail!("connection closed before end of request head");
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Logs each connection's outcome and duration, then delegates
pub struct AccessLog<H> {
    inner: H,
}

impl<H: ConnectionHandler> AccessLog<H> {
    pub fn new(inner: H) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<H: ConnectionHandler> ConnectionHandler for AccessLog<H> {
    async fn handle(&self, stream: TlsStream<TcpStream>, peer: SocketAddr) -> anyhow::Result<()> {
        let server_name = stream.get_ref().1.server_name().map(str::to_string);
        let start = Instant::now();

        let result = self.inner.handle(stream, peer).await;

        info!(
            peer = %peer,
            server_name = ?server_name,
            duration_ms = start.elapsed().as_millis() as u64,
            ok = result.is_ok(),
            "Connection finished"
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_request_head() {
        let request = b"GET /status HTTP/1.1\r\nhost: localhost\r\n\r\n";
        let mut reader = &request[..];
        let head = read_request_head(&mut reader).await.unwrap().unwrap();
        assert!(head.starts_with("GET /status HTTP/1.1"));
    }

    #[tokio::test]
    async fn test_read_request_head_too_large() {
        let mut request = b"GET / HTTP/1.1\r\n".to_vec();
        request.extend(std::iter::repeat(b'a').take(MAX_REQUEST_HEAD + 10));
        let mut reader = &request[..];
        assert!(read_request_head(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_request_head_truncated() {
        let mut reader = &b"GET / HTTP/1.1\r\n"[..];
        assert!(read_request_head(&mut reader).await.is_err());
    }
}
