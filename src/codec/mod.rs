//! Codec boundary between the dispatch core and bytes on the wire.
//!
//! A codec owns one side of a connection and exchanges request/response
//! *headers* plus opaque MsgPack *bodies* with the runtime:
//!
//! - [`ServerCodec`] - read requests, write responses
//! - [`ClientCodec`] - write requests, read responses
//! - [`encode_payload`] / [`decode_payload`] - typed value ↔ section
//!   payload conversion shared by headers, bodies, and interceptors
//! - [`StreamServerCodec`] / [`StreamClientCodec`] - the built-in
//!   length-prefixed stream implementation
//!
//! Codec traits are object-safe: methods take `&self` and return boxed
//! futures, so a codec can be shared between the read loop and handler
//! tasks writing responses. Implementations keep their read and write
//! state behind internal locks; `write_response` must emit header and
//! body atomically from the wire's perspective.
//!
//! A codec read error of kind [`RpcError::Protocol`] (e.g. an oversized
//! section) means the stream can no longer be framed; both the server
//! loop and the client input loop treat it as fatal for the connection.

mod stream;

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Result, RpcError};

pub use stream::{StreamClientCodec, StreamServerCodec, DEFAULT_MAX_SECTION_SIZE};

/// Boxed future type used by the object-safe codec and interceptor traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Encode a value into the self-describing MsgPack payload carried by a
/// frame section.
///
/// Structs are encoded as maps keyed by field name (not positional
/// arrays), so a peer or interceptor can decode a payload without
/// knowing the handler's types, and a mismatched argument surfaces as a
/// field-level decode error instead of silent positional
/// reinterpretation.
pub fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(rmp_serde::to_vec_named(value)?)
}

/// Decode a frame section payload back into a typed value.
pub fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(rmp_serde::from_slice(bytes)?)
}

/// Request header preceding each call body on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    /// Fully qualified "Service.Method" name; the service part may itself
    /// contain dots, so resolution splits on the last one.
    pub service_method: String,
    /// Client-assigned sequence number correlating the response.
    pub seq: u64,
}

/// Response header preceding each reply body on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    /// Echo of the request's service-method name.
    pub service_method: String,
    /// Echo of the request's sequence number.
    pub seq: u64,
    /// Error text; empty means success.
    pub error: String,
}

/// Server side of the codec boundary.
///
/// The read methods are only ever invoked by the single per-connection
/// read loop; `write_response` may be invoked concurrently from handler
/// tasks and must serialize frames internally.
pub trait ServerCodec: Send + Sync {
    /// Read the next request header. `Ok(None)` signals a clean end of
    /// stream; errors are treated as fatal for the connection.
    fn read_request_header(&self) -> BoxFuture<'_, Result<Option<Request>>>;

    /// Read the body of the request whose header was just returned.
    fn read_request_body(&self) -> BoxFuture<'_, Result<Bytes>>;

    /// Consume and drop the pending request body, leaving the stream
    /// positioned at the next header.
    fn discard_request_body(&self) -> BoxFuture<'_, Result<()>>;

    /// Write one complete response frame (header + body).
    fn write_response(&self, resp: Response, body: Bytes) -> BoxFuture<'_, Result<()>>;

    /// Transport source address of the peer, when known.
    fn source_addr(&self) -> Option<SocketAddr> {
        None
    }

    /// Close the underlying transport.
    fn close(&self) -> BoxFuture<'_, Result<()>>;
}

/// Client side of the codec boundary.
///
/// `write_request` is serialized by the client's send mutex; the read
/// methods are only invoked by the client's input loop.
pub trait ClientCodec: Send + Sync {
    /// Write one complete request frame (header + body).
    fn write_request(&self, req: Request, body: Bytes) -> BoxFuture<'_, Result<()>>;

    /// Read the next response header. `Ok(None)` signals a clean end of
    /// stream.
    fn read_response_header(&self) -> BoxFuture<'_, Result<Option<Response>>>;

    /// Read the body of the response whose header was just returned.
    fn read_response_body(&self) -> BoxFuture<'_, Result<Bytes>>;

    /// Consume and drop the pending response body.
    fn discard_response_body(&self) -> BoxFuture<'_, Result<()>>;

    /// Close the underlying transport.
    fn close(&self) -> BoxFuture<'_, Result<()>>;
}

/// True when a codec read error leaves the stream unframeable, so the
/// connection must be torn down rather than answered.
pub(crate) fn is_unrecoverable(err: &RpcError) -> bool {
    matches!(err, RpcError::Io(_) | RpcError::Protocol(_))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_header_roundtrip() {
        let req = Request {
            service_method: "Arith.Add".to_string(),
            seq: 7,
        };
        let bytes = encode_payload(&req).unwrap();
        let decoded: Request = decode_payload(&bytes).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn test_response_header_roundtrip() {
        let resp = Response {
            service_method: "Arith.Div".to_string(),
            seq: 9,
            error: "divide by zero".to_string(),
        };
        let bytes = encode_payload(&resp).unwrap();
        let decoded: Response = decode_payload(&bytes).unwrap();
        assert_eq!(decoded, resp);
    }

    #[test]
    fn test_headers_are_self_describing_maps() {
        // Map format (0x8X) lets a header or body be decoded without the
        // sender's type; positional arrays (0x9X) would not.
        let bytes = encode_payload(&Request::default()).unwrap();
        assert_eq!(
            bytes[0] & 0xF0,
            0x80,
            "Expected map format (0x8X), got {:02X}",
            bytes[0]
        );
    }

    #[test]
    fn test_mismatched_payload_fails_field_by_field() {
        // A Request payload does not decode as a Response: the missing
        // field is reported by name, which is what lets dispatch turn a
        // wrong argument type into a useful error.
        let bytes = encode_payload(&Request::default()).unwrap();
        let result: Result<Response> = decode_payload(&bytes);
        assert!(result.is_err());
    }

    #[test]
    fn test_garbage_payload_rejected() {
        let result: Result<Request> = decode_payload(b"not valid msgpack");
        assert!(result.is_err());
    }
}
