//! Error types for the uaserve server core
//!
//! This module contains the unified error type used throughout the server,
//! modeled on the OPC UA status-code namespace. Variants carry enough context
//! to be logged without a separate status-code-to-string table.

// ----------------------------------------------------------------------------
// Unified Error Type
// ----------------------------------------------------------------------------

/// Errors surfaced by the server core and its collaborators
#[derive(Debug, thiserror::Error)]
pub enum UaError {
    /// A required argument was missing or malformed (BadInvalidArgument)
    #[error("invalid argument: {reason}")]
    InvalidArgument { reason: String },

    /// An endpoint URL did not match `opc.tcp://[host][:port][/path]`
    #[error("invalid endpoint URL: {url}")]
    InvalidUrl { url: String },

    /// Lookup miss: namespace URI, reverse-connect handle, node id (BadNotFound)
    #[error("not found")]
    NotFound,

    /// No event source accepted the request, or an internal consistency
    /// check failed (BadInternalError)
    #[error("internal error: {reason}")]
    InternalError { reason: String },

    /// The operation is not allowed in the current lifecycle state
    #[error("invalid lifecycle state: {reason}")]
    InvalidState { reason: String },

    /// Construction-time configuration error; the server is not usable
    /// (no node store, no event loop)
    #[error("fatal configuration error: {reason}")]
    FatalInit { reason: String },

    /// The event loop rejected an operation
    #[error("event loop error: {reason}")]
    EventLoop { reason: String },

    /// Certificate checks failed (BadCertificateUriInvalid and friends)
    #[error("certificate error: {reason}")]
    Certificate { reason: String },

    /// Network I/O error from a connection manager
    #[error("network I/O error: {0}")]
    NetworkIo(#[from] std::io::Error),
}

impl UaError {
    /// Shorthand for an internal error with a static reason
    pub fn internal(reason: impl Into<String>) -> Self {
        Self::InternalError { reason: reason.into() }
    }

    /// Shorthand for an invalid-argument error
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument { reason: reason.into() }
    }
}

/// Result alias used throughout the workspace
pub type UaResult<T> = core::result::Result<T, UaError>;

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
