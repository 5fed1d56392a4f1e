//! The server aggregate
//!
//! [`Server`] is a cheap cloneable handle onto the single server state,
//! which lives behind the service lock. Every public entrypoint serializes
//! on that lock; callbacks registered with the event loop carry a weak
//! handle, upgrade it on entry and take the lock themselves. The only
//! places that block are [`crate::lifecycle`]'s event-loop pumps, which run
//! with the lock released.

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{error, info};

use uaserve_core::config::{SecurityPolicy, ServerConfig};
use uaserve_core::errors::{UaError, UaResult};
use uaserve_core::eventloop::{CallbackId, EventLoop};
use uaserve_core::nodestore::{
    BrowseDirection, NodeStore, Variant, NS0_ID_NAMESPACE_ARRAY,
};
use uaserve_core::subsystem::Subsystem;
use uaserve_core::types::{ByteString, NodeId, Timestamp};

use crate::connections::ServerConnectionSlots;
use crate::managers::{
    ChannelId, DiagnosticEvent, SecureChannelManager, SecureChannelStatistics, Session,
    SessionManager, SessionStatistics,
};
use crate::namespaces::NamespaceTable;
use crate::reverse::ReverseConnectRegistry;

// ----------------------------------------------------------------------------
// Lifecycle State
// ----------------------------------------------------------------------------

/// Lifecycle state of the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerLifecycle {
    /// Constructed but not yet started
    Fresh,
    /// Listeners open, housekeeping registered, event loop running
    Started,
    /// Shutdown requested; draining until the grace period elapses
    ShuttingDown,
    /// Shut down; restartable via startup
    Stopped,
}

// ----------------------------------------------------------------------------
// Statistics
// ----------------------------------------------------------------------------

/// Snapshot of the server's diagnostics counters
///
/// Assembled field by field under the service lock; concurrent mutation
/// between two snapshots can make them differ, but each snapshot is
/// internally consistent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStatistics {
    pub secure_channels: SecureChannelStatistics,
    pub sessions: SessionStatistics,
}

// ----------------------------------------------------------------------------
// Server State
// ----------------------------------------------------------------------------

/// All server state guarded by the service lock
pub(crate) struct ServerCore {
    pub(crate) config: ServerConfig,
    pub(crate) lifecycle: ServerLifecycle,
    /// Wall-clock start time; `None` exactly while Fresh or Stopped
    pub(crate) start_time: Option<Timestamp>,
    /// Wall-clock shutdown deadline; `None` while no shutdown is requested
    pub(crate) end_time: Option<Timestamp>,
    pub(crate) namespaces: NamespaceTable,
    pub(crate) sessions: SessionManager,
    pub(crate) channels: SecureChannelManager,
    pub(crate) reverse_connects: ReverseConnectRegistry,
    pub(crate) server_connections: ServerConnectionSlots,
    /// Cyclic housekeeping registration; 0 while not Started
    pub(crate) housekeeping_callback_id: CallbackId,
    pub(crate) admin_session: Session,
    pub(crate) node_store: Box<dyn NodeStore>,
    pub(crate) subsystems: Vec<Box<dyn Subsystem>>,
    pub(crate) rng: StdRng,
}

pub(crate) struct ServerInner {
    pub(crate) core: Mutex<ServerCore>,
    pub(crate) event_loop: Arc<dyn EventLoop>,
}

/// Handle onto a running server; clones share the same state
#[derive(Clone)]
pub struct Server {
    pub(crate) inner: Arc<ServerInner>,
}

/// Weak server handle carried by event-loop callbacks
///
/// Upgrading fails once the last strong handle is gone, so a callback that
/// outlives the server degrades to a no-op instead of touching freed state.
#[derive(Clone)]
pub(crate) struct WeakServer {
    inner: Weak<ServerInner>,
}

impl WeakServer {
    pub(crate) fn upgrade(&self) -> Option<Server> {
        self.inner.upgrade().map(|inner| Server { inner })
    }
}

// ----------------------------------------------------------------------------
// Construction
// ----------------------------------------------------------------------------

impl Server {
    /// Build a server, taking ownership of the configuration
    ///
    /// Fails fatally when no event loop or no node store is configured. The
    /// non-cryptographic RNG is seeded from the wall clock; session GUIDs
    /// come from it.
    pub fn new(mut config: ServerConfig) -> UaResult<Self> {
        config
            .validate()
            .map_err(|reason| UaError::FatalInit { reason })?;

        let event_loop = config.require_event_loop()?;
        let node_store = config.node_store.take().ok_or_else(|| UaError::FatalInit {
            reason: "no node store configured".into(),
        })?;
        let mut subsystems = std::mem::take(&mut config.subsystems);

        for subsystem in subsystems.iter_mut() {
            subsystem.init().map_err(|e| {
                error!(subsystem = subsystem.name(), error = %e, "subsystem initialization failed");
                e
            })?;
        }

        let rng = StdRng::seed_from_u64(event_loop.now().as_millis());
        let limits = config.limits.clone();

        let mut core = ServerCore {
            config,
            lifecycle: ServerLifecycle::Fresh,
            start_time: None,
            end_time: None,
            namespaces: NamespaceTable::new(),
            sessions: SessionManager::new(&limits),
            channels: SecureChannelManager::new(&limits),
            reverse_connects: ReverseConnectRegistry::default(),
            server_connections: ServerConnectionSlots::new(),
            housekeeping_callback_id: 0,
            admin_session: Session::admin(),
            node_store,
            subsystems,
            rng,
        };

        // Seed the namespace-array variable so the information model and the
        // registry agree from the first read on.
        let uris = core.namespaces.uris().to_vec();
        core.node_store
            .write_value(&NodeId::numeric(0, NS0_ID_NAMESPACE_ARRAY), Variant::StringArray(uris))?;

        info!(application_uri = %core.config.application.application_uri, "server created");

        Ok(Self {
            inner: Arc::new(ServerInner { core: Mutex::new(core), event_loop }),
        })
    }

    pub(crate) fn core(&self) -> MutexGuard<'_, ServerCore> {
        self.inner.core.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn downgrade(&self) -> WeakServer {
        WeakServer { inner: Arc::downgrade(&self.inner) }
    }

    pub(crate) fn event_loop(&self) -> &Arc<dyn EventLoop> {
        &self.inner.event_loop
    }
}

// ----------------------------------------------------------------------------
// Accessors
// ----------------------------------------------------------------------------

impl Server {
    /// Current lifecycle state
    pub fn lifecycle(&self) -> ServerLifecycle {
        self.core().lifecycle
    }

    /// Wall-clock start time; `None` unless the server is started
    pub fn start_time(&self) -> Option<Timestamp> {
        self.core().start_time
    }

    /// Read the configuration under the service lock
    pub fn with_config<R>(&self, f: impl FnOnce(&ServerConfig) -> R) -> R {
        f(&self.core().config)
    }

    /// The administrative sentinel session
    pub fn admin_session(&self) -> Session {
        self.core().admin_session.clone()
    }

    /// Snapshot of the diagnostics counters
    pub fn statistics(&self) -> ServerStatistics {
        let core = self.core();
        ServerStatistics {
            secure_channels: core.channels.statistics(),
            sessions: core.sessions.statistics(),
        }
    }
}

// ----------------------------------------------------------------------------
// Namespace Handling
// ----------------------------------------------------------------------------

impl Server {
    /// Add a namespace URI, returning its index
    ///
    /// Idempotent: re-adding a known URI returns the existing index.
    pub fn add_namespace(&self, uri: &str) -> u16 {
        let mut core = self.core();
        let app_uri = core.config.application.application_uri.clone();
        core.namespaces.setup_ns1(&app_uri);
        let index = core.namespaces.add(uri);

        // Announce the change, otherwise the array variable appears unchanged
        let uris = core.namespaces.uris().to_vec();
        let _ = core
            .node_store
            .write_value(&NodeId::numeric(0, NS0_ID_NAMESPACE_ARRAY), Variant::StringArray(uris));
        index
    }

    /// Find the index of a namespace URI
    pub fn get_namespace_by_name(&self, uri: &str) -> UaResult<u16> {
        let mut core = self.core();
        let app_uri = core.config.application.application_uri.clone();
        core.namespaces.setup_ns1(&app_uri);
        core.namespaces.get_by_name(uri)
    }

    /// Resolve a namespace index to its URI
    pub fn get_namespace_by_index(&self, index: u16) -> UaResult<String> {
        let mut core = self.core();
        let app_uri = core.config.application.application_uri.clone();
        core.namespaces.setup_ns1(&app_uri);
        core.namespaces.get_by_index(index).map(str::to_string)
    }
}

// ----------------------------------------------------------------------------
// Collaborator Entry Points
// ----------------------------------------------------------------------------

impl Server {
    /// Open a secure channel shell bound to a security policy
    ///
    /// Driven by the secure-channel handshake collaborator once a transport
    /// connection completes its open exchange.
    pub fn open_secure_channel(&self, security_policy_uri: &str) -> ChannelId {
        let mut core = self.core();
        let now = self.inner.event_loop.now_monotonic();
        core.channels.open_channel(security_policy_uri, now, None).channel_id
    }

    /// Create a session bound to a secure channel, returning its
    /// authentication token
    ///
    /// Driven by the session service dispatcher collaborator.
    pub fn create_session(&self, channel_id: Option<ChannelId>, name: &str) -> UaResult<NodeId> {
        let mut core = self.core();
        let now = self.inner.event_loop.now_monotonic();
        let core = &mut *core;
        let session = core.sessions.create_session(&mut core.rng, channel_id, name, now)?;
        Ok(session.authentication_token.clone())
    }

    /// Remove a session by its authentication token
    pub fn remove_session_by_token(&self, token: &NodeId, event: DiagnosticEvent) -> UaResult<()> {
        match self.core().sessions.remove_by_token(token, event) {
            Some(_) => Ok(()),
            None => Err(UaError::NotFound),
        }
    }
}

// ----------------------------------------------------------------------------
// Housekeeping
// ----------------------------------------------------------------------------

/// Interval of the housekeeping cyclic callback
pub(crate) const HOUSEKEEPING_INTERVAL: std::time::Duration = std::time::Duration::from_millis(1000);

impl Server {
    /// Regular housekeeping: expire timed-out sessions and channels, then
    /// give each subsystem its turn
    pub(crate) fn house_keeping(&self) {
        let now = self.inner.event_loop.now_monotonic();
        let mut core = self.core();
        core.sessions.cleanup(now);
        core.channels.cleanup_timed_out(now);
        for subsystem in core.subsystems.iter_mut() {
            subsystem.housekeeping(now);
        }
    }
}

// ----------------------------------------------------------------------------
// Certificate Rotation
// ----------------------------------------------------------------------------

impl Server {
    /// Rotate an endpoint certificate
    ///
    /// Sessions and channels bound to the old certificate are closed when the
    /// respective flag is set; every endpoint carrying the old certificate
    /// receives the new one, and its security policy swaps certificate and
    /// private key. The whole sweep runs under the service lock.
    pub fn update_certificate(
        &self,
        old_certificate: &ByteString,
        new_certificate: &ByteString,
        new_private_key: &ByteString,
        close_sessions: bool,
        close_secure_channels: bool,
    ) -> UaResult<()> {
        let mut core = self.core();

        if close_sessions {
            let doomed: Vec<NodeId> = core
                .sessions
                .sessions()
                .filter(|session| {
                    session
                        .channel_id
                        .and_then(|id| core.channels.get(id))
                        .and_then(|ch| core.config.security_policy_by_uri(&ch.security_policy_uri))
                        .map(|sp| sp.local_certificate == *old_certificate)
                        .unwrap_or(false)
                })
                .map(|session| session.authentication_token.clone())
                .collect();
            for token in doomed {
                core.sessions.remove_by_token(&token, DiagnosticEvent::Close);
            }
        }

        if close_secure_channels {
            let doomed: Vec<ChannelId> = core
                .channels
                .channels()
                .filter(|channel| {
                    core.config
                        .security_policy_by_uri(&channel.security_policy_uri)
                        .map(|sp| sp.local_certificate == *old_certificate)
                        .unwrap_or(false)
                })
                .map(|channel| channel.channel_id)
                .collect();
            for id in doomed {
                core.channels.shutdown_channel(id, DiagnosticEvent::Close);
            }
        }

        let mut touched_policies: Vec<String> = Vec::new();
        for endpoint in core.config.endpoints.iter_mut() {
            if endpoint.server_certificate == *old_certificate {
                endpoint.server_certificate = new_certificate.clone();
                touched_policies.push(endpoint.security_policy_uri.clone());
            }
        }
        for uri in touched_policies {
            let policy = core
                .config
                .security_policy_by_uri_mut(&uri)
                .ok_or_else(|| UaError::internal(format!("no security policy for URI {uri}")))?;
            policy.update_certificate_and_private_key(
                new_certificate.clone(),
                new_private_key.clone(),
            );
        }

        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Lookups
// ----------------------------------------------------------------------------

impl Server {
    /// Find a configured security policy by its URI
    pub fn security_policy_by_uri(&self, uri: &str) -> Option<SecurityPolicy> {
        self.core().config.security_policy_by_uri(uri).cloned()
    }

    /// Invoke `callback` for every local child of `parent`
    ///
    /// Browses in both directions; remote children are skipped. The first
    /// error returned by the callback short-circuits the iteration. The
    /// callback runs outside the service lock and receives
    /// `(child_id, is_inverse, reference_type_id)`.
    pub fn for_each_child_node<F>(&self, parent: &NodeId, mut callback: F) -> UaResult<()>
    where
        F: FnMut(&NodeId, bool, &NodeId) -> UaResult<()>,
    {
        let references = {
            let core = self.core();
            core.node_store.browse(parent, BrowseDirection::Both)?
        };
        for reference in &references {
            if !reference.is_local {
                continue;
            }
            callback(&reference.node_id, !reference.is_forward, &reference.reference_type_id)?;
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Teardown
// ----------------------------------------------------------------------------

impl Drop for ServerInner {
    /// Final teardown once the last handle is gone
    ///
    /// A still-started server is drained defensively: callbacks are
    /// deregistered, channels and sessions removed, subsystems cleared, and
    /// a server-owned event loop is stopped and pumped until it confirms.
    fn drop(&mut self) {
        let external = {
            let core = self.core.get_mut().unwrap_or_else(|e| e.into_inner());

            if core.housekeeping_callback_id != 0 {
                self.event_loop.remove_cyclic_callback(core.housekeeping_callback_id);
                core.housekeeping_callback_id = 0;
            }
            if core.reverse_connects.retry_callback_id != 0 {
                self.event_loop.remove_cyclic_callback(core.reverse_connects.retry_callback_id);
                core.reverse_connects.retry_callback_id = 0;
            }
            core.reverse_connects.clear();
            core.channels.close_all(DiagnosticEvent::Close);
            core.sessions.remove_all(DiagnosticEvent::Close);
            for slot in core.server_connections.active() {
                let _ = slot.manager.close_connection(slot.connection_id);
            }
            core.server_connections.clear();
            for subsystem in core.subsystems.iter_mut() {
                subsystem.clear();
            }
            core.config.external_event_loop
        };

        if !external {
            use uaserve_core::eventloop::EventLoopState;
            if self.event_loop.state() == EventLoopState::Started {
                self.event_loop.stop();
            }
            while self.event_loop.state() != EventLoopState::Stopped
                && self.event_loop.state() != EventLoopState::Fresh
            {
                if self.event_loop.run(std::time::Duration::from_millis(100)).is_err() {
                    break;
                }
            }
        }
    }
}
