//! Built-in length-prefixed stream codec.
//!
//! Every header and body travels as one *section*: a `u32` big-endian
//! byte length followed by that many MsgPack bytes. A frame is a header
//! section immediately followed by a body section:
//!
//! ```text
//! ┌──────────┬─────────────────┬──────────┬───────────────┐
//! │ Length   │ Header (MsgPack)│ Length   │ Body (MsgPack)│
//! │ 4 bytes  │ Length bytes    │ 4 bytes  │ Length bytes  │
//! └──────────┴─────────────────┴──────────┴───────────────┘
//! ```
//!
//! Reads go through a buffered read half behind an async lock; writes
//! through a buffered write half behind the per-connection write lock,
//! flushed once per complete frame so header and body hit the wire
//! atomically relative to concurrent handler tasks.
//!
//! A section whose length prefix exceeds the cap fails with
//! [`RpcError::Protocol`] before any payload byte is consumed. The
//! stream cannot be re-framed after that, so callers must tear the
//! connection down instead of answering and reading on.

use std::net::SocketAddr;

use bytes::Bytes;
use tokio::io::{
    split, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter, ReadHalf,
    WriteHalf,
};
use tokio::sync::Mutex;

use super::{decode_payload, encode_payload, BoxFuture, ClientCodec, Request, Response, ServerCodec};
use crate::error::{Result, RpcError};

/// Default maximum section size (1 GB). Larger length prefixes are
/// rejected as protocol errors before any allocation happens.
pub const DEFAULT_MAX_SECTION_SIZE: u32 = 1_073_741_824;

/// Scratch chunk size used when discarding a body.
const SKIP_CHUNK: usize = 8 * 1024;

/// Shared framing state: buffered halves of one bidirectional stream.
struct Framed<T> {
    reader: Mutex<BufReader<ReadHalf<T>>>,
    writer: Mutex<BufWriter<WriteHalf<T>>>,
    max_section: u32,
}

impl<T: AsyncRead + AsyncWrite> Framed<T> {
    fn new(stream: T) -> Self {
        let (r, w) = split(stream);
        Self {
            reader: Mutex::new(BufReader::new(r)),
            writer: Mutex::new(BufWriter::new(w)),
            max_section: DEFAULT_MAX_SECTION_SIZE,
        }
    }

    /// Read one section. `Ok(None)` if the stream ended cleanly on a
    /// section boundary.
    async fn read_section(&self) -> Result<Option<Bytes>> {
        let mut reader = self.reader.lock().await;
        let len = match read_len(&mut *reader, self.max_section).await? {
            Some(len) => len,
            None => return Ok(None),
        };
        let mut buf = vec![0u8; len as usize];
        reader.read_exact(&mut buf).await?;
        Ok(Some(Bytes::from(buf)))
    }

    /// Read one section that must be present (a body following a header).
    async fn read_body_section(&self) -> Result<Bytes> {
        match self.read_section().await? {
            Some(bytes) => Ok(bytes),
            None => Err(RpcError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "stream ended before frame body",
            ))),
        }
    }

    /// Consume and drop one section without materializing it.
    async fn skip_section(&self) -> Result<()> {
        let mut reader = self.reader.lock().await;
        let len = match read_len(&mut *reader, self.max_section).await? {
            Some(len) => len,
            None => {
                return Err(RpcError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "stream ended before frame body",
                )))
            }
        };
        let mut remaining = len as usize;
        let mut scratch = [0u8; SKIP_CHUNK];
        while remaining > 0 {
            let n = remaining.min(SKIP_CHUNK);
            reader.read_exact(&mut scratch[..n]).await?;
            remaining -= n;
        }
        Ok(())
    }

    /// Write one complete frame (header section + body section) and
    /// flush once.
    async fn write_frame(&self, header: &[u8], body: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        write_section(&mut *writer, header).await?;
        write_section(&mut *writer, body).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.flush().await?;
        writer.shutdown().await?;
        Ok(())
    }
}

/// Read a section length prefix. `Ok(None)` only when the stream ends
/// before the first length byte.
async fn read_len<R: tokio::io::AsyncRead + Unpin>(
    reader: &mut R,
    max_section: u32,
) -> Result<Option<u32>> {
    let mut buf = [0u8; 4];
    let mut filled = 0;
    while filled < 4 {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(RpcError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "truncated section length",
            )));
        }
        filled += n;
    }
    let len = u32::from_be_bytes(buf);
    if len > max_section {
        return Err(RpcError::Protocol(format!(
            "section size {} exceeds maximum {}",
            len, max_section
        )));
    }
    Ok(Some(len))
}

async fn write_section<W: tokio::io::AsyncWrite + Unpin>(
    writer: &mut W,
    bytes: &[u8],
) -> Result<()> {
    writer.write_all(&(bytes.len() as u32).to_be_bytes()).await?;
    writer.write_all(bytes).await?;
    Ok(())
}

/// Server side of the built-in stream codec.
pub struct StreamServerCodec<T> {
    framed: Framed<T>,
    source: Option<SocketAddr>,
}

impl<T: AsyncRead + AsyncWrite + Send> StreamServerCodec<T> {
    /// Wrap a bidirectional stream with no known peer address.
    pub fn new(stream: T) -> Self {
        Self {
            framed: Framed::new(stream),
            source: None,
        }
    }

    /// Wrap a bidirectional stream, recording the peer address handed to
    /// pre-body interceptors and handler contexts.
    pub fn with_source_addr(stream: T, source: SocketAddr) -> Self {
        Self {
            framed: Framed::new(stream),
            source: Some(source),
        }
    }
}

impl<T: AsyncRead + AsyncWrite + Send> ServerCodec for StreamServerCodec<T> {
    fn read_request_header(&self) -> BoxFuture<'_, Result<Option<Request>>> {
        Box::pin(async move {
            match self.framed.read_section().await? {
                Some(bytes) => Ok(Some(decode_payload(&bytes)?)),
                None => Ok(None),
            }
        })
    }

    fn read_request_body(&self) -> BoxFuture<'_, Result<Bytes>> {
        Box::pin(self.framed.read_body_section())
    }

    fn discard_request_body(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.framed.skip_section())
    }

    fn write_response(&self, resp: Response, body: Bytes) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let header = encode_payload(&resp)?;
            self.framed.write_frame(&header, &body).await
        })
    }

    fn source_addr(&self) -> Option<SocketAddr> {
        self.source
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.framed.shutdown())
    }
}

/// Client side of the built-in stream codec.
pub struct StreamClientCodec<T> {
    framed: Framed<T>,
}

impl<T: AsyncRead + AsyncWrite + Send> StreamClientCodec<T> {
    /// Wrap a bidirectional stream.
    pub fn new(stream: T) -> Self {
        Self {
            framed: Framed::new(stream),
        }
    }
}

impl<T: AsyncRead + AsyncWrite + Send> ClientCodec for StreamClientCodec<T> {
    fn write_request(&self, req: Request, body: Bytes) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let header = encode_payload(&req)?;
            self.framed.write_frame(&header, &body).await
        })
    }

    fn read_response_header(&self) -> BoxFuture<'_, Result<Option<Response>>> {
        Box::pin(async move {
            match self.framed.read_section().await? {
                Some(bytes) => Ok(Some(decode_payload(&bytes)?)),
                None => Ok(None),
            }
        })
    }

    fn read_response_body(&self) -> BoxFuture<'_, Result<Bytes>> {
        Box::pin(self.framed.read_body_section())
    }

    fn discard_response_body(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.framed.skip_section())
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.framed.shutdown())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_request_frame_roundtrip() {
        let (client_io, server_io) = duplex(4096);
        let client = StreamClientCodec::new(client_io);
        let server = StreamServerCodec::new(server_io);

        let req = Request {
            service_method: "Arith.Add".to_string(),
            seq: 3,
        };
        let body = encode_payload(&(7i32, 8i32)).unwrap();
        client
            .write_request(req.clone(), Bytes::from(body))
            .await
            .unwrap();

        let got = server.read_request_header().await.unwrap().unwrap();
        assert_eq!(got, req);

        let got_body = server.read_request_body().await.unwrap();
        let args: (i32, i32) = decode_payload(&got_body).unwrap();
        assert_eq!(args, (7, 8));
    }

    #[tokio::test]
    async fn test_response_frame_roundtrip() {
        let (client_io, server_io) = duplex(4096);
        let client = StreamClientCodec::new(client_io);
        let server = StreamServerCodec::new(server_io);

        let resp = Response {
            service_method: "Arith.Div".to_string(),
            seq: 4,
            error: "divide by zero".to_string(),
        };
        server
            .write_response(resp.clone(), Bytes::new())
            .await
            .unwrap();

        let got = client.read_response_header().await.unwrap().unwrap();
        assert_eq!(got, resp);
        client.discard_response_body().await.unwrap();
    }

    #[tokio::test]
    async fn test_clean_eof_is_none() {
        let (client_io, server_io) = duplex(4096);
        let server = StreamServerCodec::new(server_io);
        drop(client_io);

        let got = server.read_request_header().await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn test_discard_leaves_stream_aligned() {
        let (client_io, server_io) = duplex(64 * 1024);
        let client = StreamClientCodec::new(client_io);
        let server = StreamServerCodec::new(server_io);

        let first = Request {
            service_method: "Echo.Skip".to_string(),
            seq: 1,
        };
        let big_body = encode_payload(&vec![0u8; 20_000]).unwrap();
        client
            .write_request(first, Bytes::from(big_body))
            .await
            .unwrap();

        let second = Request {
            service_method: "Echo.Keep".to_string(),
            seq: 2,
        };
        let body = encode_payload(&"kept").unwrap();
        client
            .write_request(second.clone(), Bytes::from(body))
            .await
            .unwrap();

        server.read_request_header().await.unwrap().unwrap();
        server.discard_request_body().await.unwrap();

        let got = server.read_request_header().await.unwrap().unwrap();
        assert_eq!(got, second);
        let got_body = server.read_request_body().await.unwrap();
        let text: String = decode_payload(&got_body).unwrap();
        assert_eq!(text, "kept");
    }

    #[tokio::test]
    async fn test_oversized_section_rejected() {
        let (mut client_io, server_io) = duplex(4096);
        let server = StreamServerCodec::new(server_io);

        client_io.write_all(&u32::MAX.to_be_bytes()).await.unwrap();
        client_io.flush().await.unwrap();

        let err = server.read_request_header().await.unwrap_err();
        assert!(matches!(err, RpcError::Protocol(_)));
        assert!(err.to_string().contains("exceeds maximum"));
    }

    #[tokio::test]
    async fn test_oversized_body_section_rejected() {
        let (mut client_io, server_io) = duplex(4096);
        let server = StreamServerCodec::new(server_io);

        let header = encode_payload(&Request {
            service_method: "Arith.Add".to_string(),
            seq: 1,
        })
        .unwrap();
        client_io
            .write_all(&(header.len() as u32).to_be_bytes())
            .await
            .unwrap();
        client_io.write_all(&header).await.unwrap();
        client_io.write_all(&u32::MAX.to_be_bytes()).await.unwrap();
        client_io.flush().await.unwrap();

        server.read_request_header().await.unwrap().unwrap();
        let err = server.read_request_body().await.unwrap_err();
        assert!(matches!(err, RpcError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_truncated_length_is_unexpected_eof() {
        let (mut client_io, server_io) = duplex(4096);
        let server = StreamServerCodec::new(server_io);

        client_io.write_all(&[0u8, 0u8]).await.unwrap();
        client_io.flush().await.unwrap();
        drop(client_io);

        let err = server.read_request_header().await.unwrap_err();
        match err {
            RpcError::Io(e) => assert_eq!(e.kind(), std::io::ErrorKind::UnexpectedEof),
            other => panic!("expected Io error, got {other:?}"),
        }
    }
}
