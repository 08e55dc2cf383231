//! HTTP CONNECT upgrade.
//!
//! The server answers a `CONNECT <path>` handshake with a fixed status
//! line, then the socket becomes a raw RPC stream served by the normal
//! per-connection loop. Anything other than CONNECT gets `405`. The
//! request head is read one byte at a time so no RPC bytes past the
//! blank line are ever buffered away from the codec.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};

use crate::client::Client;
use crate::error::{Result, RpcError};
use crate::server::Server;

/// Default HTTP path on which the RPC endpoint is mounted.
pub const DEFAULT_RPC_PATH: &str = "/_wirecall_";

/// Status confirming a successful CONNECT upgrade; the client verifies
/// it byte for byte.
pub(crate) const CONNECTED: &str = "200 Connected to wirecall RPC";

/// Upper bound on the handshake head; a peer speaking something other
/// than HTTP gets cut off rather than buffered indefinitely.
const MAX_HEAD_SIZE: usize = 8 * 1024;

impl Server {
    /// Serve RPC-over-HTTP-CONNECT on [`DEFAULT_RPC_PATH`].
    pub async fn serve_http(&self, listener: TcpListener) {
        self.serve_http_path(listener, DEFAULT_RPC_PATH).await
    }

    /// Serve RPC-over-HTTP-CONNECT on the given path. Each accepted
    /// connection is upgraded and served on its own task; returns when
    /// the listener fails.
    pub async fn serve_http_path(&self, listener: TcpListener, path: &str) {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let server = self.clone();
                    let path = path.to_string();
                    tokio::spawn(async move {
                        server.serve_http_conn(stream, &path).await;
                    });
                }
                Err(e) => {
                    tracing::error!(error = %e, "rpc: http accept");
                    return;
                }
            }
        }
    }

    async fn serve_http_conn(&self, mut stream: TcpStream, path: &str) {
        match upgrade(&mut stream, path).await {
            Ok(true) => self.serve_conn(stream).await,
            Ok(false) => {}
            Err(e) => tracing::debug!(error = %e, "rpc: http handshake"),
        }
    }
}

/// Answer one HTTP request head. `Ok(true)` means the upgrade succeeded
/// and the stream is now a raw RPC connection; `Ok(false)` means a
/// rejection response was written.
async fn upgrade<T: AsyncRead + AsyncWrite + Unpin>(stream: &mut T, path: &str) -> io::Result<bool> {
    let head = read_head(stream).await?;
    let request_line = head.lines().next().unwrap_or("");
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or("");
    let target = parts.next().unwrap_or("");

    if method != "CONNECT" {
        stream
            .write_all(
                b"HTTP/1.1 405 Method Not Allowed\r\n\
                  Content-Type: text/plain; charset=utf-8\r\n\
                  Connection: close\r\n\r\n405 must CONNECT\n",
            )
            .await?;
        return Ok(false);
    }
    if target != path {
        stream
            .write_all(
                b"HTTP/1.1 404 Not Found\r\n\
                  Content-Type: text/plain; charset=utf-8\r\n\
                  Connection: close\r\n\r\n404 no RPC endpoint at this path\n",
            )
            .await?;
        return Ok(false);
    }

    stream
        .write_all(format!("HTTP/1.0 {}\n\n", CONNECTED).as_bytes())
        .await?;
    Ok(true)
}

/// Client side of the CONNECT handshake.
async fn http_connect<T: AsyncRead + AsyncWrite + Unpin>(stream: &mut T, path: &str) -> Result<()> {
    stream
        .write_all(format!("CONNECT {} HTTP/1.0\n\n", path).as_bytes())
        .await?;
    let head = read_head(stream).await?;
    let status_line = head.lines().next().unwrap_or("").trim_end();
    let status = status_line
        .split_once(' ')
        .map(|(_, rest)| rest)
        .unwrap_or("");
    if status != CONNECTED {
        return Err(RpcError::Protocol(format!(
            "unexpected HTTP response: {}",
            status_line
        )));
    }
    Ok(())
}

/// Read up to and including the blank line terminating an HTTP head,
/// tolerating LF or CRLF line endings. Reads byte-wise so nothing past
/// the blank line is consumed.
async fn read_head<T: AsyncRead + Unpin>(stream: &mut T) -> io::Result<String> {
    let mut head = Vec::new();
    let mut saw_newline = false;
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed during HTTP handshake",
            ));
        }
        head.push(byte[0]);
        match byte[0] {
            b'\n' if saw_newline => break,
            b'\n' => saw_newline = true,
            b'\r' => {}
            _ => saw_newline = false,
        }
        if head.len() > MAX_HEAD_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "HTTP request head too large",
            ));
        }
    }
    Ok(String::from_utf8_lossy(&head).into_owned())
}

/// Connect to an RPC server listening on HTTP at [`DEFAULT_RPC_PATH`].
pub async fn dial_http<A: ToSocketAddrs>(addr: A) -> Result<Client> {
    dial_http_path(addr, DEFAULT_RPC_PATH).await
}

/// Connect to an RPC server listening on HTTP at the given path.
pub async fn dial_http_path<A: ToSocketAddrs>(addr: A, path: &str) -> Result<Client> {
    let mut stream = TcpStream::connect(addr).await?;
    http_connect(&mut stream, path).await?;
    Ok(Client::new(stream))
}
