//! Services and method binding.
//!
//! A [`Service`] is a named collection of methods assembled with
//! [`ServiceBuilder`]. Registration erases each typed handler into a
//! uniform invoker that decodes the MsgPack argument, runs the handler,
//! and encodes the reply; dispatch then only does a name lookup and one
//! boxed call.
//!
//! # Example
//!
//! ```ignore
//! use wirecall::{Service, Context};
//!
//! let arith = Service::builder("Arith")
//!     .method("Add", |args: Args| async move {
//!         Ok::<_, String>(Reply { c: args.a + args.b })
//!     })
//!     .method_with_ctx("Mul", |ctx: Context, args: Args| async move {
//!         tracing::debug!(peer = ?ctx.source_addr(), "Mul");
//!         Ok::<_, String>(Reply { c: args.a * args.b })
//!     })
//!     .build();
//! ```

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::{decode_payload, encode_payload, BoxFuture};
use crate::error::RpcError;

/// Per-call context passed to handlers registered with
/// [`ServiceBuilder::method_with_ctx`].
#[derive(Debug, Clone)]
pub struct Context {
    service_method: String,
    source_addr: Option<SocketAddr>,
}

impl Context {
    pub(crate) fn new(service_method: &str, source_addr: Option<SocketAddr>) -> Self {
        Self {
            service_method: service_method.to_string(),
            source_addr,
        }
    }

    /// Fully qualified "Service.Method" name of the call being served.
    pub fn service_method(&self) -> &str {
        &self.service_method
    }

    /// Transport source address of the caller, when the codec knows it.
    pub fn source_addr(&self) -> Option<SocketAddr> {
        self.source_addr
    }
}

/// Erased invoker: decodes the argument, runs the handler, encodes the
/// reply. The Err text is what lands in the response's error field.
type MethodFn =
    Arc<dyn Fn(Context, Bytes) -> BoxFuture<'static, std::result::Result<Vec<u8>, String>> + Send + Sync>;

type ZeroReplyFn = Arc<dyn Fn() -> Vec<u8> + Send + Sync>;

/// Introspected metadata for one registered method.
#[derive(Clone)]
pub(crate) struct Method {
    invoke: MethodFn,
    zero_reply: ZeroReplyFn,
}

impl Method {
    /// Encoding of the reply type's default value. Container replies
    /// (maps, vectors) start as initialized empty collections, never nil,
    /// because callers decode the body in place.
    pub(crate) fn zero_reply(&self) -> Vec<u8> {
        (self.zero_reply)()
    }

    /// Bind this method to one call's context and argument bytes.
    pub(crate) fn bind(
        &self,
        ctx: Context,
        args: Bytes,
        errslot: Arc<OnceLock<String>>,
    ) -> BoundHandler {
        BoundHandler {
            invoke: self.invoke.clone(),
            ctx,
            args,
            errslot,
        }
    }
}

/// A single bound method invocation, handed to the call interceptor.
///
/// [`call`](BoundHandler::call) consumes the handler, so an interceptor
/// can run it at most once; not running it completes the call with no
/// error and the zero reply.
pub struct BoundHandler {
    invoke: MethodFn,
    ctx: Context,
    args: Bytes,
    errslot: Arc<OnceLock<String>>,
}

impl BoundHandler {
    /// Execute the underlying method, writing the encoded reply in place.
    ///
    /// Returns the handler's error text, if any, for the interceptor to
    /// observe; the dispatch core records it independently.
    pub async fn call(self, reply: &mut Vec<u8>) -> Option<String> {
        match (self.invoke)(self.ctx, self.args).await {
            Ok(encoded) => {
                *reply = encoded;
                None
            }
            Err(msg) => {
                let _ = self.errslot.set(msg.clone());
                Some(msg)
            }
        }
    }
}

/// A named collection of RPC methods derived from typed handlers.
pub struct Service {
    name: String,
    methods: HashMap<String, Method>,
}

impl Service {
    /// Start building a service under the given name. Names may contain
    /// dots; dispatch splits incoming service-method strings on the last
    /// one.
    pub fn builder(name: impl Into<String>) -> ServiceBuilder {
        ServiceBuilder::new(name)
    }

    /// The service name used for registration.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    pub(crate) fn get(&self, method: &str) -> Option<&Method> {
        self.methods.get(method)
    }
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.methods.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        f.debug_struct("Service")
            .field("name", &self.name)
            .field("methods", &names)
            .finish()
    }
}

/// Builder assembling a [`Service`] from typed handler functions.
pub struct ServiceBuilder {
    name: String,
    methods: HashMap<String, Method>,
}

impl ServiceBuilder {
    /// Create a new builder for a service with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: HashMap::new(),
        }
    }

    /// Register a method taking only the argument value.
    ///
    /// Registering a name twice replaces the earlier handler.
    pub fn method<A, R, E, F, Fut>(self, name: &str, handler: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Default + Send + 'static,
        E: fmt::Display + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, E>> + Send + 'static,
    {
        self.method_with_ctx(name, move |_ctx: Context, args: A| handler(args))
    }

    /// Register a method that also receives the per-call [`Context`].
    pub fn method_with_ctx<A, R, E, F, Fut>(mut self, name: &str, handler: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Default + Send + 'static,
        E: fmt::Display + Send + 'static,
        F: Fn(Context, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, E>> + Send + 'static,
    {
        let invoke: MethodFn = Arc::new(move |ctx: Context, body: Bytes| {
            let started = match decode_payload::<A>(&body) {
                Ok(args) => Ok(handler(ctx, args)),
                Err(e) => Err(argument_mismatch(&ctx.service_method, &e)),
            };
            let fut: BoxFuture<'static, std::result::Result<Vec<u8>, String>> =
                Box::pin(async move {
                    match started {
                        Ok(fut) => match fut.await {
                            Ok(reply) => encode_payload(&reply)
                                .map_err(|e| format!("rpc: can't encode reply: {}", e)),
                            Err(e) => Err(e.to_string()),
                        },
                        Err(msg) => Err(msg),
                    }
                });
            fut
        });
        let zero_reply: ZeroReplyFn =
            Arc::new(|| encode_payload(&R::default()).unwrap_or_default());

        self.methods
            .insert(name.to_string(), Method { invoke, zero_reply });
        self
    }

    /// Finish building the service.
    pub fn build(self) -> Service {
        Service {
            name: self.name,
            methods: self.methods,
        }
    }
}

fn argument_mismatch(service_method: &str, err: &RpcError) -> String {
    format!("rpc: argument type mismatch for {}: {}", service_method, err)
}
