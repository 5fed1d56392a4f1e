//! Lifecycle participants owned by the server
//!
//! Sessions and secure channels are handled by their own service
//! collaborators (the session service dispatcher and the secure-channel
//! handshake); the managers here own the registries, expiry and counters
//! those collaborators operate on.

pub mod channel;
pub mod session;

pub use channel::{
    ChannelId, SecureChannel, SecureChannelManager, SecureChannelState, SecureChannelStatistics,
};
pub use session::{DiagnosticEvent, Session, SessionManager, SessionStatistics};
