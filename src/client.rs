//! Client call engine: pending-call table, input loop, call lifecycle.
//!
//! A [`Client`] owns one connection. [`Client::call`] awaits the reply;
//! [`Client::go`] submits without waiting and hands back a
//! [`CallHandle`] whose completion channel receives the finished
//! [`Call`]. A spawned input loop matches response frames to pending
//! calls by sequence number; when it exits (EOF, decode failure, or
//! [`Client::close`]) every outstanding call is completed with the
//! shutdown error and later submissions fail fast.
//!
//! # Example
//!
//! ```ignore
//! use wirecall::dial;
//!
//! let client = dial("127.0.0.1:4321").await?;
//! let reply: Reply = client.call("Arith.Add", &Args { a: 7, b: 8 }).await?;
//! ```

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex as StdMutex};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, Mutex, Notify};

use crate::codec::{
    decode_payload, encode_payload, is_unrecoverable, ClientCodec, Request, StreamClientCodec,
};
use crate::error::{Result, RpcError};

/// Default capacity of the completion channel allocated by
/// [`Client::go`]. Large enough that callers who are slow to drain do
/// not cost deliveries; the input loop never blocks either way.
const DONE_CHANNEL_CAPACITY: usize = 10;

/// A finished (or failed) RPC invocation.
#[derive(Debug)]
pub struct Call {
    /// Fully qualified "Service.Method" name.
    pub service_method: String,
    /// Sequence number assigned at submission; 0 when the call failed
    /// before a sequence could be assigned.
    pub seq: u64,
    /// MsgPack-encoded argument as it was sent.
    pub args: Bytes,
    /// MsgPack-encoded reply; empty on error.
    pub reply: Bytes,
    /// Call outcome; `None` means success.
    pub error: Option<RpcError>,
}

impl Call {
    /// Decode the reply, or surface the call's error.
    pub fn result<R: DeserializeOwned>(self) -> Result<R> {
        match self.error {
            Some(e) => Err(e),
            None => decode_payload(&self.reply),
        }
    }
}

/// Handle for a call submitted with [`Client::go`].
pub struct CallHandle {
    service_method: String,
    seq: u64,
    done: mpsc::Receiver<Call>,
}

impl CallHandle {
    /// Sequence number assigned to the call (0 if submission failed
    /// before assignment).
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// The call's service-method name.
    pub fn service_method(&self) -> &str {
        &self.service_method
    }

    /// Wait for the call to complete.
    pub async fn wait(mut self) -> Call {
        match self.done.recv().await {
            Some(call) => call,
            None => Call {
                service_method: self.service_method,
                seq: self.seq,
                args: Bytes::new(),
                reply: Bytes::new(),
                error: Some(RpcError::Shutdown),
            },
        }
    }
}

struct Pending {
    service_method: String,
    args: Bytes,
    done: mpsc::Sender<Call>,
}

impl Pending {
    fn complete(self, seq: u64, result: std::result::Result<Bytes, RpcError>) {
        let call = match result {
            Ok(reply) => Call {
                service_method: self.service_method,
                seq,
                args: self.args,
                reply,
                error: None,
            },
            Err(e) => Call {
                service_method: self.service_method,
                seq,
                args: self.args,
                reply: Bytes::new(),
                error: Some(e),
            },
        };
        deliver(&self.done, call);
    }
}

/// Non-blocking completion delivery; the input loop must never stall on
/// a slow consumer.
fn deliver(done: &mpsc::Sender<Call>, call: Call) {
    match done.try_send(call) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(call)) => {
            tracing::debug!(
                service_method = %call.service_method,
                seq = call.seq,
                "rpc: discarding reply due to insufficient done channel capacity"
            );
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {}
    }
}

/// Why the input loop stopped; replayed as an error into every call
/// completed by the shutdown sweep.
enum ShutdownCause {
    Closed,
    Broken(io::ErrorKind, String),
}

impl ShutdownCause {
    fn to_error(&self) -> RpcError {
        match self {
            ShutdownCause::Closed => RpcError::Shutdown,
            ShutdownCause::Broken(kind, msg) => {
                RpcError::Io(io::Error::new(*kind, msg.clone()))
            }
        }
    }
}

struct ClientState {
    seq: u64,
    pending: HashMap<u64, Pending>,
    closing: bool,
    shutdown: bool,
}

struct ClientInner {
    codec: Arc<dyn ClientCodec>,
    /// Serializes sequence assignment and request writes, so requests
    /// hit the wire in sequence order.
    sending: Mutex<()>,
    state: StdMutex<ClientState>,
    /// Wakes the input loop out of a blocked read on user close.
    closed: Notify,
}

/// An RPC client bound to one connection.
///
/// Cheaply cloneable; clones share the connection and pending table.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Run the built-in stream codec over a connected byte stream.
    ///
    /// Must be called within a tokio runtime: the input loop is spawned
    /// immediately.
    pub fn new<T>(stream: T) -> Client
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::with_codec(StreamClientCodec::new(stream))
    }

    /// Run a custom codec.
    pub fn with_codec<C: ClientCodec + 'static>(codec: C) -> Client {
        let inner = Arc::new(ClientInner {
            codec: Arc::new(codec),
            sending: Mutex::new(()),
            state: StdMutex::new(ClientState {
                seq: 0,
                pending: HashMap::new(),
                closing: false,
                shutdown: false,
            }),
            closed: Notify::new(),
        });
        tokio::spawn(input_loop(inner.clone()));
        Client { inner }
    }

    /// Invoke a remote method and await its reply.
    ///
    /// Remote handler errors surface as [`RpcError::Server`] whose
    /// Display is the handler's error text verbatim.
    pub async fn call<A, R>(&self, service_method: &str, args: &A) -> Result<R>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        self.go(service_method, args).await.wait().await.result()
    }

    /// Submit a call without waiting. The returned handle's completion
    /// channel (capacity 10) receives the finished [`Call`].
    pub async fn go<A: Serialize>(&self, service_method: &str, args: &A) -> CallHandle {
        let (done, rx) = mpsc::channel(DONE_CHANNEL_CAPACITY);
        let seq = self.start_call(service_method, args, done).await;
        CallHandle {
            service_method: service_method.to_string(),
            seq,
            done: rx,
        }
    }

    /// Submit a call delivering its completion on a caller-supplied
    /// channel. Deliveries never block: when the channel is full the
    /// completion is dropped and logged, so size the channel for the
    /// calls in flight.
    pub async fn go_with<A: Serialize>(
        &self,
        service_method: &str,
        args: &A,
        done: mpsc::Sender<Call>,
    ) -> u64 {
        self.start_call(service_method, args, done).await
    }

    async fn start_call<A: Serialize>(
        &self,
        service_method: &str,
        args: &A,
        done: mpsc::Sender<Call>,
    ) -> u64 {
        let args = match encode_payload(args) {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) => {
                deliver(
                    &done,
                    Call {
                        service_method: service_method.to_string(),
                        seq: 0,
                        args: Bytes::new(),
                        reply: Bytes::new(),
                        error: Some(e),
                    },
                );
                return 0;
            }
        };
        self.send_call(service_method, args, done).await
    }

    async fn send_call(&self, service_method: &str, args: Bytes, done: mpsc::Sender<Call>) -> u64 {
        let inner = &self.inner;
        let guard = inner.sending.lock().await;
        let seq = {
            let mut state = inner.state.lock().unwrap();
            if state.shutdown || state.closing {
                drop(state);
                drop(guard);
                deliver(
                    &done,
                    Call {
                        service_method: service_method.to_string(),
                        seq: 0,
                        args,
                        reply: Bytes::new(),
                        error: Some(RpcError::Shutdown),
                    },
                );
                return 0;
            }
            state.seq += 1;
            let seq = state.seq;
            state.pending.insert(
                seq,
                Pending {
                    service_method: service_method.to_string(),
                    args: args.clone(),
                    done,
                },
            );
            seq
        };

        let req = Request {
            service_method: service_method.to_string(),
            seq,
        };
        if let Err(e) = inner.codec.write_request(req, args).await {
            // Release the send lock before completing the failed call.
            drop(guard);
            let pending = inner.state.lock().unwrap().pending.remove(&seq);
            if let Some(pending) = pending {
                pending.complete(seq, Err(e));
            }
        }
        seq
    }

    /// Close the connection. Outstanding calls complete with
    /// [`RpcError::Shutdown`]; so does every later submission. A second
    /// close returns `Shutdown` immediately.
    pub async fn close(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.closing {
                return Err(RpcError::Shutdown);
            }
            state.closing = true;
        }
        self.inner.closed.notify_one();
        self.inner.codec.close().await
    }
}

/// Connect to a wirecall server over TCP with the built-in stream codec.
pub async fn dial<A: ToSocketAddrs>(addr: A) -> Result<Client> {
    let stream = TcpStream::connect(addr).await?;
    Ok(Client::new(stream))
}

/// Read responses and complete pending calls until the connection dies,
/// then sweep the pending table.
async fn input_loop(inner: Arc<ClientInner>) {
    let failure: Option<RpcError> = loop {
        let header = tokio::select! {
            _ = inner.closed.notified() => break None,
            header = inner.codec.read_response_header() => header,
        };
        let resp = match header {
            Ok(Some(resp)) => resp,
            Ok(None) => break None,
            Err(e) => break Some(e),
        };
        let pending = inner.state.lock().unwrap().pending.remove(&resp.seq);
        match pending {
            None => {
                // Response for a sequence we no longer track (its request
                // failed partway); consume the body and move on.
                if let Err(e) = inner.codec.discard_response_body().await {
                    break Some(e);
                }
            }
            Some(pending) if !resp.error.is_empty() => {
                let discarded = inner.codec.discard_response_body().await;
                pending.complete(resp.seq, Err(RpcError::Server(resp.error)));
                if let Err(e) = discarded {
                    break Some(e);
                }
            }
            Some(pending) => match inner.codec.read_response_body().await {
                Ok(body) => pending.complete(resp.seq, Ok(body)),
                // An I/O failure or framing violation leaves the stream
                // unreadable; put the call back so the shutdown sweep
                // below completes it, and terminate.
                Err(e) if is_unrecoverable(&e) => {
                    inner.state.lock().unwrap().pending.insert(resp.seq, pending);
                    break Some(e);
                }
                // The body section was consumed but did not decode; only
                // this call is affected.
                Err(e) => pending.complete(resp.seq, Err(e)),
            },
        }
    };

    let _send = inner.sending.lock().await;
    let mut state = inner.state.lock().unwrap();
    state.shutdown = true;
    let cause = if state.closing {
        ShutdownCause::Closed
    } else {
        match failure {
            None => ShutdownCause::Broken(io::ErrorKind::UnexpectedEof, "unexpected EOF".to_string()),
            Some(RpcError::Io(e)) => ShutdownCause::Broken(e.kind(), e.to_string()),
            Some(e) => ShutdownCause::Broken(io::ErrorKind::InvalidData, e.to_string()),
        }
    };
    for (seq, pending) in state.pending.drain() {
        pending.complete(seq, Err(cause.to_error()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{BoxFuture, Response};
    use std::time::Duration;

    /// Codec whose writes always fail and whose reads never resolve.
    struct WriteFailCodec;

    impl ClientCodec for WriteFailCodec {
        fn write_request(&self, _req: Request, _body: Bytes) -> BoxFuture<'_, Result<()>> {
            Box::pin(async { Err(RpcError::Io(io::Error::other("fake write failure"))) })
        }

        fn read_response_header(&self) -> BoxFuture<'_, Result<Option<Response>>> {
            Box::pin(std::future::pending())
        }

        fn read_response_body(&self) -> BoxFuture<'_, Result<Bytes>> {
            Box::pin(std::future::pending())
        }

        fn discard_response_body(&self) -> BoxFuture<'_, Result<()>> {
            Box::pin(std::future::pending())
        }

        fn close(&self) -> BoxFuture<'_, Result<()>> {
            Box::pin(async { Ok(()) })
        }
    }

    #[derive(serde::Serialize)]
    struct Args {
        a: i32,
        b: i32,
    }

    #[tokio::test]
    async fn test_write_failure_completes_call_without_deadlock() {
        let client = Client::with_codec(WriteFailCodec);

        for _ in 0..2 {
            let result = tokio::time::timeout(
                Duration::from_secs(5),
                client.call::<_, i32>("Arith.Add", &Args { a: 7, b: 8 }),
            )
            .await
            .expect("call deadlocked");
            let err = result.unwrap_err();
            assert!(err.to_string().contains("fake write failure"));
        }
    }

    #[tokio::test]
    async fn test_write_failure_removes_pending_call() {
        let client = Client::with_codec(WriteFailCodec);
        let _ = client.call::<_, i32>("Arith.Add", &Args { a: 1, b: 2 }).await;
        assert!(client.inner.state.lock().unwrap().pending.is_empty());
    }

    #[tokio::test]
    async fn test_close_twice_returns_shutdown() {
        let client = Client::with_codec(WriteFailCodec);
        client.close().await.unwrap();
        let err = client.close().await.unwrap_err();
        assert!(matches!(err, RpcError::Shutdown));
    }

    #[tokio::test]
    async fn test_call_after_close_returns_shutdown() {
        let client = Client::with_codec(WriteFailCodec);
        client.close().await.unwrap();
        let err = client
            .call::<_, i32>("Arith.Add", &Args { a: 7, b: 8 })
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Shutdown));
    }

    #[tokio::test]
    async fn test_call_handle_reports_method_and_seq() {
        let client = Client::with_codec(WriteFailCodec);
        let handle = client.go("Arith.Add", &Args { a: 7, b: 8 }).await;
        assert_eq!(handle.service_method(), "Arith.Add");
        assert_eq!(handle.seq(), 1);
        let call = handle.wait().await;
        assert!(call.error.is_some());
    }
}
