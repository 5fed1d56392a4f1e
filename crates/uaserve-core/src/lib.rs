//! uaserve Core
//!
//! Foundational types, traits and configuration for the uaserve OPC UA
//! server. This crate is the stable contract between the server runtime and
//! its collaborators; it contains no networking and no scheduling of its own.
//!
//! ## Architecture Overview
//!
//! uaserve splits into crates with one direction of dependency:
//!
//! - **uaserve-core** (this crate): status-kinded errors, core types, the
//!   endpoint URL grammar, connection parameter maps, the [`eventloop`]
//!   contracts, the [`nodestore`] collaborator trait, and [`config`].
//! - **uaserve-runtime**: the server aggregate — lifecycle state machine,
//!   namespace registry, reverse-connect manager, housekeeping, certificate
//!   rotation.
//! - **uaserve-eventloop**: the default tokio-backed event loop and TCP
//!   connection manager implementing the traits defined here.
//! - **uaserve-harness**: a deterministic simulation event loop for tests.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod config;
pub mod errors;
pub mod eventloop;
pub mod nodestore;
pub mod params;
pub mod subsystem;
pub mod types;
pub mod url;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use config::{
    ApplicationDescription, CertificateVerifier, EndpointDescription, SecurityPolicy,
    ServerConfig, ServerLimits, SECURITY_POLICY_NONE_URI,
};
pub use errors::{UaError, UaResult};
pub use eventloop::{
    CallbackId, ConnectionId, ConnectionManager, ConnectionState, CycleMissPolicy,
    DelayedCallback, EventLoop, EventLoopState, EventSourceState, NetworkCallback, TimedCallback,
};
pub use nodestore::{BrowseDirection, MapNodeStore, NodeStore, ReferenceDescription, Variant};
pub use params::{ParameterMap, ParameterValue, PARAM_ADDRESS, PARAM_LISTEN, PARAM_PORT};
pub use subsystem::Subsystem;
pub use types::{ByteString, NodeId, Timestamp};
pub use url::{parse_endpoint_url, EndpointUrl, DEFAULT_PORT};
