//! Server configuration
//!
//! Plain-data sections (application description, endpoints, limits) carry
//! serde derives; the capability slots (event loop, node store, certificate
//! verifier, subsystems) are runtime objects injected by the embedding
//! application. Configuration is immutable once moved into the server, with
//! two exceptions driven by the server itself: discovery URLs accumulated at
//! startup and certificates swapped by rotation.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{UaError, UaResult};
use crate::eventloop::EventLoop;
use crate::nodestore::{MapNodeStore, NodeStore};
use crate::subsystem::Subsystem;
use crate::types::ByteString;
use crate::url::parse_endpoint_url;

/// URI of the `None` security policy, which may legitimately carry no
/// certificate
pub const SECURITY_POLICY_NONE_URI: &str = "http://opcfoundation.org/UA/SecurityPolicy#None";

// ----------------------------------------------------------------------------
// Application Description
// ----------------------------------------------------------------------------

/// How the server announces itself to clients and discovery servers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationDescription {
    /// Globally unique application URI; also becomes namespace 1
    pub application_uri: String,
    /// Product URI
    pub product_uri: String,
    /// Human-readable name
    pub application_name: String,
    /// URLs clients can use to reach this server; extended at startup from
    /// the configured server URLs with non-empty hosts
    pub discovery_urls: Vec<String>,
}

impl Default for ApplicationDescription {
    fn default() -> Self {
        Self {
            application_uri: "urn:uaserve:server".into(),
            product_uri: "urn:uaserve".into(),
            application_name: "uaserve server".into(),
            discovery_urls: Vec::new(),
        }
    }
}

// ----------------------------------------------------------------------------
// Endpoints and Security Policies
// ----------------------------------------------------------------------------

/// A published endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointDescription {
    /// URL of the endpoint
    pub endpoint_url: String,
    /// URI of the security policy backing this endpoint
    pub security_policy_uri: String,
    /// Certificate presented on this endpoint
    pub server_certificate: ByteString,
    /// Application description snapshot, refreshed at startup
    pub server: ApplicationDescription,
}

impl EndpointDescription {
    /// Endpoint with the `None` security policy and no certificate
    pub fn insecure(endpoint_url: impl Into<String>) -> Self {
        Self {
            endpoint_url: endpoint_url.into(),
            security_policy_uri: SECURITY_POLICY_NONE_URI.into(),
            server_certificate: ByteString::empty(),
            server: ApplicationDescription::default(),
        }
    }
}

/// A configured security policy with its certificate and private key
///
/// The cryptographic machinery lives behind the secure-channel collaborator;
/// the server core only matches certificates and swaps them on rotation.
#[derive(Debug, Clone, PartialEq)]
pub struct SecurityPolicy {
    /// Policy URI, e.g. the `None` policy or `Basic256Sha256`
    pub policy_uri: String,
    /// Certificate currently bound to the policy
    pub local_certificate: ByteString,
    private_key: ByteString,
}

impl SecurityPolicy {
    /// Create a policy from its URI, certificate and private key
    pub fn new(
        policy_uri: impl Into<String>,
        local_certificate: ByteString,
        private_key: ByteString,
    ) -> Self {
        Self {
            policy_uri: policy_uri.into(),
            local_certificate,
            private_key,
        }
    }

    /// The `None` policy without key material
    pub fn none() -> Self {
        Self::new(SECURITY_POLICY_NONE_URI, ByteString::empty(), ByteString::empty())
    }

    /// Swap certificate and private key in place
    pub fn update_certificate_and_private_key(
        &mut self,
        certificate: ByteString,
        private_key: ByteString,
    ) {
        self.local_certificate = certificate;
        self.private_key = private_key;
    }

    /// The private key currently bound to the policy
    pub fn private_key(&self) -> &ByteString {
        &self.private_key
    }
}

/// Validates that certificates match the configured application URI
pub trait CertificateVerifier: Send {
    /// Check that `certificate` embeds `application_uri`
    fn verify_application_uri(&self, certificate: &ByteString, application_uri: &str) -> UaResult<()>;
}

// ----------------------------------------------------------------------------
// Limits
// ----------------------------------------------------------------------------

/// Resource limits and default lifetimes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerLimits {
    /// Maximum concurrently tracked sessions
    pub max_sessions: usize,
    /// Idle lifetime granted to new sessions
    pub session_timeout: Duration,
    /// Token lifetime granted to new secure channels
    pub secure_channel_lifetime: Duration,
}

impl Default for ServerLimits {
    fn default() -> Self {
        Self {
            max_sessions: 100,
            session_timeout: Duration::from_secs(60),
            secure_channel_lifetime: Duration::from_secs(600),
        }
    }
}

// ----------------------------------------------------------------------------
// Server Configuration
// ----------------------------------------------------------------------------

/// Complete configuration moved into the server at construction
pub struct ServerConfig {
    /// Application identity
    pub application: ApplicationDescription,
    /// Listen URLs; empty selects the default `opc.tcp://:4840`
    pub server_urls: Vec<String>,
    /// Published endpoints
    pub endpoints: Vec<EndpointDescription>,
    /// Configured security policies
    pub security_policies: Vec<SecurityPolicy>,
    /// Grace period granted to clients after a shutdown request
    pub shutdown_delay: Duration,
    /// Resource limits
    pub limits: ServerLimits,
    /// The event loop driving all server work; required
    pub event_loop: Option<Arc<dyn EventLoop>>,
    /// Whether the embedding application owns and drives the event loop;
    /// the server then never stops it
    pub external_event_loop: bool,
    /// Address-space collaborator; required
    pub node_store: Option<Box<dyn NodeStore>>,
    /// Optional certificate check run at startup
    pub certificate_verifier: Option<Box<dyn CertificateVerifier>>,
    /// Optional subsystem capabilities (discovery, PubSub, async manager)
    pub subsystems: Vec<Box<dyn Subsystem>>,
}

impl ServerConfig {
    /// Configuration with defaults around the given event loop
    pub fn new(event_loop: Arc<dyn EventLoop>) -> Self {
        Self {
            application: ApplicationDescription::default(),
            server_urls: Vec::new(),
            endpoints: vec![EndpointDescription::insecure("opc.tcp://:4840")],
            security_policies: vec![SecurityPolicy::none()],
            shutdown_delay: Duration::ZERO,
            limits: ServerLimits::default(),
            event_loop: Some(event_loop),
            external_event_loop: false,
            node_store: Some(Box::new(MapNodeStore::new())),
            certificate_verifier: None,
            subsystems: Vec::new(),
        }
    }

    /// Configuration for tests: distinct application URI, zero shutdown delay
    pub fn testing(event_loop: Arc<dyn EventLoop>) -> Self {
        let mut config = Self::new(event_loop);
        config.application.application_uri = "urn:uaserve:test".into();
        config
    }

    /// Validate internal consistency, returning the first problem found
    pub fn validate(&self) -> Result<(), String> {
        if self.event_loop.is_none() {
            return Err("no event loop configured".into());
        }
        if self.node_store.is_none() {
            return Err("no node store configured".into());
        }
        for url in &self.server_urls {
            parse_endpoint_url(url).map_err(|_| format!("unparsable server URL: {url}"))?;
        }
        for ed in &self.endpoints {
            if !self
                .security_policies
                .iter()
                .any(|sp| sp.policy_uri == ed.security_policy_uri)
            {
                return Err(format!(
                    "endpoint {} references unknown security policy {}",
                    ed.endpoint_url, ed.security_policy_uri
                ));
            }
        }
        Ok(())
    }

    /// Find a security policy by its URI
    pub fn security_policy_by_uri(&self, uri: &str) -> Option<&SecurityPolicy> {
        self.security_policies.iter().find(|sp| sp.policy_uri == uri)
    }

    /// Mutable lookup used by certificate rotation
    pub fn security_policy_by_uri_mut(&mut self, uri: &str) -> Option<&mut SecurityPolicy> {
        self.security_policies.iter_mut().find(|sp| sp.policy_uri == uri)
    }

    /// Take the event loop handle, failing when none is configured
    pub fn require_event_loop(&self) -> UaResult<Arc<dyn EventLoop>> {
        self.event_loop.clone().ok_or_else(|| UaError::FatalInit {
            reason: "no event loop configured".into(),
        })
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("application", &self.application)
            .field("server_urls", &self.server_urls)
            .field("endpoints", &self.endpoints.len())
            .field("security_policies", &self.security_policies.len())
            .field("shutdown_delay", &self.shutdown_delay)
            .field("limits", &self.limits)
            .field("external_event_loop", &self.external_event_loop)
            .field("subsystems", &self.subsystems.len())
            .finish_non_exhaustive()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limits_serde_round_trip() {
        let limits = ServerLimits::default();
        let json = serde_json::to_string(&limits).unwrap();
        let back: ServerLimits = serde_json::from_str(&json).unwrap();
        assert_eq!(limits, back);
    }

    #[test]
    fn test_security_policy_rotation() {
        let mut sp = SecurityPolicy::new("sp", ByteString::from("old-cert"), ByteString::from("old-key"));
        sp.update_certificate_and_private_key(ByteString::from("new-cert"), ByteString::from("new-key"));
        assert_eq!(sp.local_certificate, ByteString::from("new-cert"));
        assert_eq!(sp.private_key(), &ByteString::from("new-key"));
    }

    #[test]
    fn test_endpoint_defaults() {
        let ed = EndpointDescription::insecure("opc.tcp://:4840");
        assert_eq!(ed.security_policy_uri, SECURITY_POLICY_NONE_URI);
        assert!(ed.server_certificate.is_empty());
    }
}
