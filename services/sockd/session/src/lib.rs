//! Accept loop, buffered session I/O and TLS handshake orchestration for sockd.
//!
//! This crate provides the transport substrate of the sockd service: a
//! connection acceptor, a per-connection session state machine with a
//! double-buffered send pipeline and an auto-growing receive buffer, and the
//! TLS handshake phase layered on top of the same buffer flow.
//!
//! ## Features
//!
//! - **Acceptor**: socket2-configured listener, one outstanding accept, session registry
//! - **Send pipeline**: main/flush buffer swap with optional backpressure limit
//! - **Receive pipeline**: buffer doubling up to an optional limit
//! - **TLS**: rustls handshake with optional client certificate verification
//! - **Hooks and observers**: session, server and subscriber notifications in a fixed order
//!
//! ## Example
//!
//! ```rust,no_run
//! use sockd_session::{ServerOptions, Session, SessionHandler, ServerHandler, TcpServer, Plain};
//! use std::sync::Arc;
//!
//! struct Echo;
//!
//! impl SessionHandler<Plain> for Echo {
//!     fn on_received(&self, session: &Arc<Session<Plain>>, data: &[u8]) {
//!         let _ = session.enqueue(data);
//!     }
//! }
//!
//! struct EchoServer;
//!
//! impl ServerHandler<Plain> for EchoServer {
//!     fn create_session_handler(&self) -> Arc<dyn SessionHandler<Plain>> {
//!         Arc::new(Echo)
//!     }
//! }
//!
//! # async fn example() -> anyhow::Result<()> {
//! let server = TcpServer::tcp("127.0.0.1:1111".parse()?, ServerOptions::default(), Arc::new(EchoServer));
//! server.start()?;
//! tokio::signal::ctrl_c().await?;
//! server.stop().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod buffer;
pub mod error;
pub mod fallback;
pub mod handler;
pub mod options;
pub mod server;
pub mod session;
pub mod transport;

// Re-export main types
pub use buffer::Buffer;
pub use error::{ErrorCode, ServerError, SessionError, TlsContextError, TransportError};
pub use handler::{ServerEvent, ServerHandler, ServerObserver, SessionHandler};
pub use options::{ServerOptions, SessionOptions};
pub use server::{Server, ServerStats, TcpServer, TlsServer};
pub use session::{Session, SessionId, SessionStats};
pub use transport::{Establish, Plain, Tls, TlsContext, TlsContextBuilder, Transport};
