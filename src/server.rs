//! Server dispatch: registration, per-connection serving, interceptors.
//!
//! A [`Server`] owns a registry of [`Service`]s and serves connections
//! over any [`ServerCodec`]. Each connection gets one read loop; each
//! request is executed on its own task, so replies from parallel
//! handlers may hit the wire out of request order. Frame emission is
//! serialized inside the codec.
//!
//! # Example
//!
//! ```ignore
//! use wirecall::{Server, Service};
//!
//! #[tokio::main]
//! async fn main() -> wirecall::Result<()> {
//!     let server = Server::new();
//!     server.register(
//!         Service::builder("Arith")
//!             .method("Add", |args: Args| async move {
//!                 Ok::<_, String>(Reply { c: args.a + args.b })
//!             })
//!             .build(),
//!     )?;
//!
//!     let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
//!     server.accept(listener).await;
//!     Ok(())
//! }
//! ```

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, LazyLock, OnceLock, RwLock};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;

use crate::codec::{
    decode_payload, encode_payload, is_unrecoverable, BoxFuture, Request, Response, ServerCodec,
    StreamServerCodec,
};
use crate::error::{Result, RpcError};
use crate::service::{BoundHandler, Context, Method, Service};

/// Authorization hook fired after the request header is read and the
/// method resolved, before the body is decoded. A non-Ok return
/// short-circuits dispatch; the error's Display text becomes the
/// response error.
pub type PreBodyInterceptor =
    Arc<dyn Fn(&str, Option<SocketAddr>) -> Result<()> + Send + Sync>;

/// Wrapper around each handler invocation.
///
/// The interceptor receives the call's MsgPack-encoded argument, a
/// mutable reference to the encoded reply, and the [`BoundHandler`]. It
/// decides whether to run the handler (at most once, enforced by move
/// semantics); skipping it completes the call with no error and the
/// zero reply. The reply can be observed and mutated both before and
/// after the invocation.
pub trait CallInterceptor: Send + Sync {
    /// Wrap one handler invocation.
    fn around<'a>(
        &'a self,
        service_method: &'a str,
        args: &'a [u8],
        reply: &'a mut Vec<u8>,
        handler: BoundHandler,
    ) -> BoxFuture<'a, ()>;
}

impl<I: CallInterceptor + ?Sized> CallInterceptor for Arc<I> {
    fn around<'a>(
        &'a self,
        service_method: &'a str,
        args: &'a [u8],
        reply: &'a mut Vec<u8>,
        handler: BoundHandler,
    ) -> BoxFuture<'a, ()> {
        (**self).around(service_method, args, reply, handler)
    }
}

struct ServerInner {
    services: RwLock<HashMap<String, Arc<Service>>>,
    pre_body: Option<PreBodyInterceptor>,
    call_interceptor: Option<Arc<dyn CallInterceptor>>,
}

/// An RPC server: a service registry plus connection serving.
///
/// Cheaply cloneable; clones share the registry and interceptors.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

/// Builder configuring a [`Server`]'s interceptors.
#[derive(Default)]
pub struct ServerBuilder {
    pre_body: Option<PreBodyInterceptor>,
    call_interceptor: Option<Arc<dyn CallInterceptor>>,
}

impl ServerBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the pre-body authorization hook.
    pub fn pre_body_interceptor<F>(mut self, interceptor: F) -> Self
    where
        F: Fn(&str, Option<SocketAddr>) -> Result<()> + Send + Sync + 'static,
    {
        self.pre_body = Some(Arc::new(interceptor));
        self
    }

    /// Install the around-call interceptor.
    pub fn call_interceptor<I: CallInterceptor + 'static>(mut self, interceptor: I) -> Self {
        self.call_interceptor = Some(Arc::new(interceptor));
        self
    }

    /// Build the server.
    pub fn build(self) -> Server {
        Server {
            inner: Arc::new(ServerInner {
                services: RwLock::new(HashMap::new()),
                pre_body: self.pre_body,
                call_interceptor: self.call_interceptor,
            }),
        }
    }
}

static DEFAULT_SERVER: LazyLock<Server> = LazyLock::new(Server::new);

/// The process-wide default server instance.
pub fn default_server() -> &'static Server {
    &DEFAULT_SERVER
}

impl Server {
    /// Create a server with no interceptors.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Create a builder for a server with interceptors.
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// Register a service under its builder-given name.
    ///
    /// # Errors
    ///
    /// Fails when the service has no methods or the name is taken.
    pub fn register(&self, service: Service) -> Result<()> {
        let name = service.name().to_string();
        self.register_with(name, service)
    }

    /// Register a service under an explicit name, which may contain
    /// dots (resolution splits the request's service-method string on
    /// its last dot).
    pub fn register_as(&self, name: &str, service: Service) -> Result<()> {
        self.register_with(name.to_string(), service)
    }

    fn register_with(&self, name: String, service: Service) -> Result<()> {
        if service.is_empty() {
            return Err(RpcError::Register(format!(
                "rpc.Register: service {} has no methods of suitable type",
                name
            )));
        }
        let mut services = self.inner.services.write().unwrap();
        if services.contains_key(&name) {
            return Err(RpcError::Register(format!(
                "rpc: service already defined: {}",
                name
            )));
        }
        services.insert(name, Arc::new(service));
        Ok(())
    }

    /// Resolve "Service.Method" to a bound method descriptor. The error
    /// string is what gets reported to the caller.
    fn resolve(&self, service_method: &str) -> std::result::Result<Method, String> {
        let (service_name, method_name) = match service_method.rsplit_once('.') {
            Some(parts) => parts,
            None => {
                return Err(format!(
                    "rpc: service/method request ill-formed: {}",
                    service_method
                ))
            }
        };
        let services = self.inner.services.read().unwrap();
        let service = services
            .get(service_name)
            .ok_or_else(|| format!("rpc: can't find service {}", service_method))?;
        let method = service
            .get(method_name)
            .ok_or_else(|| format!("rpc: can't find method {}", service_method))?;
        Ok(method.clone())
    }

    fn check_pre_body(
        &self,
        service_method: &str,
        source_addr: Option<SocketAddr>,
    ) -> std::result::Result<(), String> {
        if let Some(pre_body) = &self.inner.pre_body {
            if let Err(e) = pre_body(service_method, source_addr) {
                return Err(e.to_string());
            }
        }
        Ok(())
    }

    /// Run one resolved call: zero reply, interceptor wrap, handler.
    async fn execute(
        &self,
        method: &Method,
        service_method: &str,
        source_addr: Option<SocketAddr>,
        args: Bytes,
    ) -> (Vec<u8>, Option<String>) {
        let mut reply = method.zero_reply();
        let errslot = Arc::new(OnceLock::new());
        let ctx = Context::new(service_method, source_addr);
        let bound = method.bind(ctx, args.clone(), errslot.clone());
        match &self.inner.call_interceptor {
            Some(interceptor) => {
                interceptor
                    .around(service_method, &args, &mut reply, bound)
                    .await
            }
            None => {
                bound.call(&mut reply).await;
            }
        }
        let error = errslot.get().cloned();
        (reply, error)
    }

    /// Serve a TCP connection with the built-in stream codec until the
    /// peer disconnects.
    pub async fn serve_conn(&self, stream: TcpStream) {
        let codec = match stream.peer_addr() {
            Ok(addr) => StreamServerCodec::with_source_addr(stream, addr),
            Err(_) => StreamServerCodec::new(stream),
        };
        self.serve_codec(codec).await
    }

    /// Serve any bidirectional byte stream with the built-in stream
    /// codec (no source address).
    pub async fn serve_stream<T>(&self, stream: T)
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.serve_codec(StreamServerCodec::new(stream)).await
    }

    /// Serve one connection over a custom codec until end of stream.
    ///
    /// Each decoded request runs on its own task; all in-flight handlers
    /// are drained before the codec is closed.
    pub async fn serve_codec<C: ServerCodec + 'static>(&self, codec: C) {
        let codec: Arc<dyn ServerCodec> = Arc::new(codec);
        let mut handlers: JoinSet<()> = JoinSet::new();
        loop {
            while handlers.try_join_next().is_some() {}

            let req = match codec.read_request_header().await {
                Ok(Some(req)) => req,
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(error = %e, "rpc: server cannot decode request");
                    break;
                }
            };

            let method = match self.resolve(&req.service_method) {
                Ok(method) => method,
                Err(errmsg) => {
                    if respond_error(codec.as_ref(), req, errmsg).await.is_err() {
                        break;
                    }
                    continue;
                }
            };

            if let Err(errmsg) = self.check_pre_body(&req.service_method, codec.source_addr()) {
                if respond_error(codec.as_ref(), req, errmsg).await.is_err() {
                    break;
                }
                continue;
            }

            let body = match codec.read_request_body().await {
                Ok(body) => body,
                // I/O failures and framing violations leave nothing to
                // resync on; tear the connection down.
                Err(e) if is_unrecoverable(&e) => {
                    tracing::debug!(error = %e, "rpc: reading request body");
                    break;
                }
                Err(e) => {
                    let errmsg = format!("rpc: can't decode request body: {}", e);
                    if write_error_response(codec.as_ref(), req, errmsg)
                        .await
                        .is_err()
                    {
                        break;
                    }
                    continue;
                }
            };

            let server = self.clone();
            let codec = Arc::clone(&codec);
            handlers.spawn(async move {
                let source_addr = codec.source_addr();
                let (reply, error) = server
                    .execute(&method, &req.service_method, source_addr, body)
                    .await;
                let body = match &error {
                    None => Bytes::from(reply),
                    Some(_) => Bytes::new(),
                };
                let resp = Response {
                    service_method: req.service_method,
                    seq: req.seq,
                    error: error.unwrap_or_default(),
                };
                if let Err(e) = codec.write_response(resp, body).await {
                    tracing::error!(error = %e, "rpc: writing response");
                }
            });
        }
        while handlers.join_next().await.is_some() {}
        if let Err(e) = codec.close().await {
            tracing::debug!(error = %e, "rpc: closing codec");
        }
    }

    /// Read and serve exactly one request, awaiting the handler before
    /// returning. Useful for emulator codecs and manual serve loops; the
    /// concurrent path is [`serve_codec`](Server::serve_codec).
    ///
    /// # Errors
    ///
    /// A clean end of stream surfaces as an `UnexpectedEof` I/O error.
    pub async fn serve_request<C: ServerCodec>(&self, codec: &C) -> Result<()> {
        let req = match codec.read_request_header().await? {
            Some(req) => req,
            None => {
                return Err(RpcError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "end of stream",
                )))
            }
        };

        let method = match self.resolve(&req.service_method) {
            Ok(method) => method,
            Err(errmsg) => return respond_error(codec, req, errmsg).await,
        };

        if let Err(errmsg) = self.check_pre_body(&req.service_method, codec.source_addr()) {
            return respond_error(codec, req, errmsg).await;
        }

        let body = match codec.read_request_body().await {
            Ok(body) => body,
            Err(e) if is_unrecoverable(&e) => return Err(e),
            Err(e) => {
                let errmsg = format!("rpc: can't decode request body: {}", e);
                return write_error_response(codec, req, errmsg).await;
            }
        };

        let (reply, error) = self
            .execute(&method, &req.service_method, codec.source_addr(), body)
            .await;
        let body = match &error {
            None => Bytes::from(reply),
            Some(_) => Bytes::new(),
        };
        let resp = Response {
            service_method: req.service_method,
            seq: req.seq,
            error: error.unwrap_or_default(),
        };
        codec.write_response(resp, body).await
    }

    /// Invoke a registered method directly, bypassing codecs.
    ///
    /// The around-call interceptor runs as usual; the pre-body hook does
    /// not (there is no transport source to authorize). Handler errors
    /// come back as [`RpcError::Server`].
    pub async fn invoke_method<A, R>(
        &self,
        service_method: &str,
        args: &A,
        source_addr: Option<SocketAddr>,
    ) -> Result<R>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let method = self.resolve(service_method).map_err(RpcError::Server)?;
        let body = Bytes::from(encode_payload(args)?);
        let (reply, error) = self
            .execute(&method, service_method, source_addr, body)
            .await;
        match error {
            Some(msg) => Err(RpcError::Server(msg)),
            None => Ok(decode_payload(&reply)?),
        }
    }

    /// Accept connections and serve each on its own task. Returns when
    /// the listener fails.
    pub async fn accept(&self, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let server = self.clone();
                    tokio::spawn(async move {
                        server.serve_conn(stream).await;
                    });
                }
                Err(e) => {
                    tracing::error!(error = %e, "rpc: accept");
                    return;
                }
            }
        }
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

async fn write_error_response<C: ServerCodec + ?Sized>(
    codec: &C,
    req: Request,
    errmsg: String,
) -> Result<()> {
    let resp = Response {
        service_method: req.service_method,
        seq: req.seq,
        error: errmsg,
    };
    codec.write_response(resp, Bytes::new()).await
}

/// Discard the pending body, then report a dispatch error so the
/// connection stays usable for subsequent requests.
async fn respond_error<C: ServerCodec + ?Sized>(
    codec: &C,
    req: Request,
    errmsg: String,
) -> Result<()> {
    codec.discard_request_body().await?;
    write_error_response(codec, req, errmsg).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Serialize, Deserialize, Default, PartialEq, Debug)]
    struct Args {
        a: i32,
        b: i32,
    }

    #[derive(Serialize, Deserialize, Default, PartialEq, Debug)]
    struct Reply {
        c: i32,
    }

    fn arith() -> Service {
        Service::builder("Arith")
            .method("Add", |args: Args| async move {
                Ok::<_, String>(Reply { c: args.a + args.b })
            })
            .method("Error", |_args: Args| async move {
                Err::<Reply, _>("ERROR".to_string())
            })
            .build()
    }

    #[test]
    fn test_register_empty_service_rejected() {
        let server = Server::new();
        let err = server
            .register(Service::builder("Nothing").build())
            .unwrap_err();
        assert!(err.to_string().contains("has no methods of suitable type"));
    }

    #[test]
    fn test_register_duplicate_rejected() {
        let server = Server::new();
        server.register(arith()).unwrap();
        let err = server.register(arith()).unwrap_err();
        assert!(err.to_string().contains("service already defined"));
    }

    #[tokio::test]
    async fn test_invoke_method_direct() {
        let server = Server::new();
        server.register(arith()).unwrap();

        let reply: Reply = server
            .invoke_method("Arith.Add", &Args { a: 4, b: 5 }, None)
            .await
            .unwrap();
        assert_eq!(reply, Reply { c: 9 });
    }

    #[tokio::test]
    async fn test_invoke_method_handler_error() {
        let server = Server::new();
        server.register(arith()).unwrap();

        let err = server
            .invoke_method::<_, Reply>("Arith.Error", &Args { a: 1, b: 2 }, None)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "ERROR");
    }

    #[tokio::test]
    async fn test_unknown_service_and_method() {
        let server = Server::new();
        server.register(arith()).unwrap();

        let err = server
            .invoke_method::<_, Reply>("Nope.Add", &Args::default(), None)
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("rpc: can't find service"));

        let err = server
            .invoke_method::<_, Reply>("Arith.BadOperation", &Args::default(), None)
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("rpc: can't find method"));

        let err = server
            .invoke_method::<_, Reply>("nodot", &Args::default(), None)
            .await
            .unwrap_err();
        assert!(err
            .to_string()
            .contains("rpc: service/method request ill-formed"));
    }

    #[tokio::test]
    async fn test_dotted_service_name_resolves_on_last_dot() {
        let server = Server::new();
        server.register_as("net.rpc.Arith", arith()).unwrap();

        let reply: Reply = server
            .invoke_method("net.rpc.Arith.Add", &Args { a: 7, b: 8 }, None)
            .await
            .unwrap();
        assert_eq!(reply, Reply { c: 15 });
    }

    struct CountingInterceptor {
        count: AtomicU32,
    }

    impl CallInterceptor for CountingInterceptor {
        fn around<'a>(
            &'a self,
            _service_method: &'a str,
            _args: &'a [u8],
            reply: &'a mut Vec<u8>,
            handler: BoundHandler,
        ) -> BoxFuture<'a, ()> {
            Box::pin(async move {
                self.count.fetch_add(1, Ordering::SeqCst);
                handler.call(reply).await;
            })
        }
    }

    #[tokio::test]
    async fn test_invoke_method_runs_call_interceptor() {
        let interceptor = Arc::new(CountingInterceptor {
            count: AtomicU32::new(0),
        });
        let server = Server::builder()
            .call_interceptor(interceptor.clone())
            .build();
        server.register(arith()).unwrap();

        let reply: Reply = server
            .invoke_method("Arith.Add", &Args { a: 4, b: 5 }, None)
            .await
            .unwrap();
        assert_eq!(reply, Reply { c: 9 });
        assert_eq!(interceptor.count.load(Ordering::SeqCst), 1);

        let _ = server
            .invoke_method::<_, Reply>("Arith.Error", &Args::default(), None)
            .await
            .unwrap_err();
        assert_eq!(interceptor.count.load(Ordering::SeqCst), 2);
    }

    struct SkippingInterceptor;

    impl CallInterceptor for SkippingInterceptor {
        fn around<'a>(
            &'a self,
            _service_method: &'a str,
            _args: &'a [u8],
            _reply: &'a mut Vec<u8>,
            _handler: BoundHandler,
        ) -> BoxFuture<'a, ()> {
            Box::pin(async move {})
        }
    }

    #[tokio::test]
    async fn test_skipping_interceptor_yields_zero_reply() {
        let server = Server::builder().call_interceptor(SkippingInterceptor).build();
        server.register(arith()).unwrap();

        let reply: Reply = server
            .invoke_method("Arith.Add", &Args { a: 4, b: 5 }, None)
            .await
            .unwrap();
        assert_eq!(reply, Reply { c: 0 });
    }

    #[test]
    fn test_default_server_is_shared() {
        let a = default_server();
        let b = default_server();
        assert!(Arc::ptr_eq(&a.inner, &b.inner));
    }
}
