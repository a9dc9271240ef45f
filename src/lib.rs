//! # wiremux
//!
//! Event-driven TCP framing and multiplexing for length-prefixed RPC
//! messages.
//!
//! A server binds a [`TcpTransport`] to a service locator and consumes
//! requests; a client opens a [`Session`] to that locator and submits
//! concurrent RPCs over one connection. Every message on the wire is a
//! 12-byte header followed by the payload:
//!
//! ```text
//! ┌──────────────┬──────────────┬─────────────────┐
//! │ Nonce        │ Length       │ Payload         │
//! │ u64 LE       │ u32 LE       │ `len` bytes     │
//! └──────────────┴──────────────┴─────────────────┘
//! ```
//!
//! The nonce is assigned by the client and echoed by the server, so
//! responses can complete in any order while each one finds its caller.
//! Request bytes leave a session in submission order; reply bytes leave a
//! server connection in [`ServerRpc::send_reply`] order.
//!
//! All I/O is non-blocking. Each connection is owned by a single driver
//! task that checkpoints its progress in byte counters, so messages can
//! straddle any number of readiness events without copying or re-reading.
//! A connection failure is never repaired: the affected session reports
//! the error on every outstanding RPC and refuses new ones.
//!
//! ## Example
//!
//! ```ignore
//! use wiremux::{Buffer, ServiceLocator, TcpTransport};
//!
//! #[tokio::main]
//! async fn main() -> wiremux::Result<()> {
//!     let locator = ServiceLocator::parse("tcp:host=127.0.0.1,port=0")?;
//!     let server = TcpTransport::bind(&locator).await?;
//!
//!     let session = server.get_session(&ServiceLocator::parse(server.service_locator())?)?;
//!     let handle = session.call(Buffer::from_slice(b"ping"))?;
//!
//!     let rpc = server.server_recv().await?;
//!     let payload = rpc.request().to_bytes();
//!     rpc.send_reply(Buffer::from_bytes(payload));
//!
//!     let reply = handle.response().await?;
//!     assert_eq!(reply, b"ping"[..]);
//!     Ok(())
//! }
//! ```

pub mod buffer;
pub mod error;
pub mod locator;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod transport;

pub use buffer::Buffer;
pub use error::{Result, TransportError};
pub use locator::ServiceLocator;
pub use registry::TransportRegistry;
pub use server::ServerRpc;
pub use session::{RpcHandle, Session};
pub use transport::TcpTransport;
