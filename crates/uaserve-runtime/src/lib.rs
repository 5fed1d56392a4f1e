//! uaserve Runtime
//!
//! The server engine: lifecycle state machine, namespace registry,
//! timed-callback façade, listener fan-out, reverse-connect manager,
//! housekeeping and certificate rotation. The engine is synchronous and
//! single-threaded over the event loop configured in
//! [`uaserve_core::ServerConfig`]; `uaserve-eventloop` provides the default
//! tokio-backed implementation.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::atomic::AtomicBool;
//! use uaserve_core::ServerConfig;
//! use uaserve_eventloop::TokioEventLoop;
//! use uaserve_runtime::Server;
//!
//! # fn main() -> uaserve_core::UaResult<()> {
//! let event_loop = TokioEventLoop::new()?;
//! let mut config = ServerConfig::new(event_loop);
//! config.server_urls = vec!["opc.tcp://:4840".into()];
//!
//! let server = Server::new(config)?;
//! let running = AtomicBool::new(true);
//! server.run(&running)?;
//! # Ok(())
//! # }
//! ```
//!
//! The example requires the `uaserve-eventloop` crate; any other
//! [`uaserve_core::EventLoop`] implementation works the same way.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

mod callbacks;
mod connections;
mod lifecycle;
pub mod managers;
pub mod namespaces;
mod reverse;
mod server;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use connections::MAX_SERVER_CONNECTIONS;
pub use managers::{
    ChannelId, DiagnosticEvent, SecureChannel, SecureChannelManager, SecureChannelState,
    SecureChannelStatistics, Session, SessionManager, SessionStatistics,
};
pub use namespaces::{NamespaceTable, NS0_URI};
pub use reverse::{ReverseConnectHandle, ReverseConnectStateCallback};
pub use server::{Server, ServerLifecycle, ServerStatistics};
