//! Lightweight request/response and fire-and-forget messaging over TCP.
//!
//! This crate provides the runtime for connection-oriented client/server
//! applications: framing, tagged envelopes, per-connection sessions, RPC
//! correlation with timeouts, handler dispatch and message pooling.
//!
//! # Features
//!
//! - **Typed RPC**: requests are statically paired with their response type
//! - **Fire-and-forget**: any number of ordered subscribers per message type
//! - **Serialized dispatch**: all handler code runs on one task
//! - **Pooling**: decoded messages come from bounded per-type free-lists
//! - **Heartbeat**: liveness, round-trip time and clock offset
//!
//! # Example
//!
//! ```no_run
//! use async_trait::async_trait;
//! use parley_rpc::{
//!     ClientConfig, Client, Context, HandlerBinding, RpcConfig, RpcHeader, RpcMethod, Schema,
//!     Server, ServerConfig, Session, request, response,
//! };
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Default, Serialize, Deserialize)]
//! struct Echo {
//!     header: RpcHeader,
//!     text: String,
//! }
//!
//! #[derive(Debug, Default, Serialize, Deserialize)]
//! struct EchoReply {
//!     header: RpcHeader,
//!     text: String,
//! }
//!
//! request!(Echo => EchoReply, "Echo");
//! response!(EchoReply, "EchoReply");
//!
//! struct EchoHandler;
//!
//! #[async_trait]
//! impl RpcMethod<Echo, EchoReply> for EchoHandler {
//!     async fn call(
//!         &self,
//!         _: &Session,
//!         request: &Echo,
//!         response: &mut EchoReply,
//!     ) -> anyhow::Result<()> {
//!         response.text.clone_from(&request.text);
//!         Ok(())
//!     }
//! }
//!
//! async fn example() -> parley_rpc::Result<()> {
//!     let schema = Schema::builder()
//!         .request::<Echo>()
//!         .response::<EchoReply>()
//!         .build()?;
//!     let context = Context::new(schema, RpcConfig::default());
//!     context.bind(vec![HandlerBinding::rpc("echo", EchoHandler)]);
//!
//!     let server = Server::bind(context.clone(), ServerConfig::default()).await?;
//!     let client = Client::connect(context, server.local_addr(), ClientConfig::default()).await?;
//!
//!     let reply = client
//!         .call(Echo {
//!             text: "hello".to_string(),
//!             ..Echo::default()
//!         })
//!         .await?;
//!     assert_eq!(reply.text, "hello");
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod client;
pub mod config;
pub mod context;
pub mod correlation;
mod dispatch;
pub mod error;
pub mod heartbeat;
pub mod message;
pub mod pool;
pub mod protocol;
pub mod registry;
pub mod schema;
pub mod server;
pub mod session;

// Re-export commonly used types
pub use client::{Client, ClientConfig};
pub use config::RpcConfig;
pub use context::Context;
pub use error::{CodecError, Error, RegistrationError, Result, RpcError, TransportError};
pub use heartbeat::{Heartbeat, HeartbeatConfig, HeartbeatStats};
pub use message::{AnyMessage, Message, MessageKind, MessageTag, Ping, Request, Response, RpcHeader};
pub use pool::{IntoPooled, Pool, PoolConfig, PoolStats, Pooled};
pub use registry::{EventCallback, HandlerBinding, Registry, RpcMethod};
pub use schema::{Schema, SchemaBuilder, TypeInfo};
pub use server::{Server, ServerConfig, SessionEvent, SessionSet};
pub use session::{Session, SessionId, SessionState, Side};

// Re-export dependencies that are part of our public API
pub use async_trait::async_trait;
pub use bytes::Bytes;
