//! # wirecall
//!
//! A general-purpose RPC runtime over bidirectional byte streams.
//!
//! A [`Server`] exposes the methods of registered [`Service`]s to remote
//! callers; the companion [`Client`] issues awaited and asynchronous
//! calls against it. Connections carry interleaved request/response
//! frames matched by sequence number, so many calls can be in flight at
//! once and replies may arrive out of request order.
//!
//! ## Architecture
//!
//! - **Registry**: typed handlers are erased at registration into bound
//!   invokers keyed by `Service.Method` name
//! - **Wire**: length-prefixed MessagePack frames (header + body) via
//!   the built-in stream codec; the whole codec boundary is pluggable
//! - **Hooks**: a pre-body authorization interceptor and an around-call
//!   interceptor wrap dispatch without touching the core
//! - **Transports**: raw TCP (or any byte stream) and an HTTP CONNECT
//!   upgrade sharing the same serve loop
//!
//! ## Example
//!
//! ```ignore
//! use serde::{Deserialize, Serialize};
//! use wirecall::{dial, Server, Service};
//!
//! #[derive(Serialize, Deserialize, Default)]
//! struct Args { a: i32, b: i32 }
//!
//! #[derive(Serialize, Deserialize, Default)]
//! struct Reply { c: i32 }
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
//!     let addr = listener.local_addr()?;
//!     tokio::spawn(async move { server.accept(listener).await });
//!
//!     let client = dial(addr).await?;
//!     let reply: Reply = client.call("Arith.Add", &Args { a: 7, b: 8 }).await?;
//!     assert_eq!(reply.c, 15);
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod error;

mod client;
mod http;
mod server;
mod service;

pub use client::{dial, Call, CallHandle, Client};
pub use codec::{
    decode_payload, encode_payload, BoxFuture, ClientCodec, Request, Response, ServerCodec,
    StreamClientCodec, StreamServerCodec,
};
pub use error::{Result, RpcError};
pub use http::{dial_http, dial_http_path, DEFAULT_RPC_PATH};
pub use server::{
    default_server, CallInterceptor, PreBodyInterceptor, Server, ServerBuilder,
};
pub use service::{BoundHandler, Context, Service, ServiceBuilder};
