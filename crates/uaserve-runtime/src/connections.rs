//! Listener fan-out and server connection slots
//!
//! For every configured server URL the server walks the event loop's
//! connection managers, picks those serving the URL's transport and opens a
//! listening connection on the first one that accepts. Listening connections
//! are tracked in a bounded slot table so shutdown can close them all.

use std::sync::Arc;

use tracing::warn;

use uaserve_core::errors::{UaError, UaResult};
use uaserve_core::eventloop::{
    ConnectionId, ConnectionManager, ConnectionState, NetworkCallback,
};
use uaserve_core::params::{ParameterMap, ParameterValue, PARAM_ADDRESS, PARAM_LISTEN, PARAM_PORT};
use uaserve_core::url::parse_endpoint_url;

use crate::managers::DiagnosticEvent;
use crate::server::Server;

/// Maximum number of tracked listening connections
pub const MAX_SERVER_CONNECTIONS: usize = 16;

/// Transport scheme served by `opc.tcp` URLs
pub(crate) const TCP_PROTOCOL: &str = "tcp";

// ----------------------------------------------------------------------------
// Server Connection Slots
// ----------------------------------------------------------------------------

/// One tracked listening connection
#[derive(Clone)]
pub(crate) struct ServerConnection {
    pub(crate) manager: Arc<dyn ConnectionManager>,
    pub(crate) connection_id: ConnectionId,
}

/// Bounded table of listening connections
pub(crate) struct ServerConnectionSlots {
    slots: Vec<Option<ServerConnection>>,
}

impl ServerConnectionSlots {
    pub(crate) fn new() -> Self {
        Self { slots: vec![None; MAX_SERVER_CONNECTIONS] }
    }

    /// Store a listening connection; fails when every slot is taken
    pub(crate) fn register(
        &mut self,
        manager: Arc<dyn ConnectionManager>,
        connection_id: ConnectionId,
    ) -> UaResult<()> {
        match self.slots.iter_mut().find(|s| s.is_none()) {
            Some(slot) => {
                *slot = Some(ServerConnection { manager, connection_id });
                Ok(())
            }
            None => Err(UaError::internal("server connection slots exhausted")),
        }
    }

    /// Release the slot holding `connection_id`
    pub(crate) fn unregister(&mut self, connection_id: ConnectionId) {
        for slot in self.slots.iter_mut() {
            if slot.as_ref().map(|s| s.connection_id) == Some(connection_id) {
                *slot = None;
            }
        }
    }

    /// All occupied slots
    pub(crate) fn active(&self) -> Vec<ServerConnection> {
        self.slots.iter().flatten().cloned().collect()
    }

    /// Number of occupied slots
    pub(crate) fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub(crate) fn clear(&mut self) {
        self.slots.iter_mut().for_each(|s| *s = None);
    }
}

// ----------------------------------------------------------------------------
// Listener Fan-Out
// ----------------------------------------------------------------------------

impl Server {
    /// Open a listening connection for one server URL
    ///
    /// The first connection manager serving the URL's transport that accepts
    /// the request wins; the acceptance may complete asynchronously, with
    /// results delivered through the network callback.
    pub(crate) fn create_server_connection(&self, server_url: &str) -> UaResult<()> {
        let endpoint = parse_endpoint_url(server_url)?;

        for manager in self.event_loop().connection_managers() {
            if manager.protocol() != TCP_PROTOCOL {
                continue;
            }

            let mut params = ParameterMap::new();
            params.insert(PARAM_PORT, ParameterValue::UInt16(endpoint.port));
            params.insert(PARAM_LISTEN, ParameterValue::Boolean(true));
            if !endpoint.host.is_empty() {
                params.insert(
                    PARAM_ADDRESS,
                    ParameterValue::StringArray(vec![endpoint.host.clone()]),
                );
            }

            let callback = self.server_network_callback(Arc::clone(&manager));
            if manager.open_connection(&params, callback).is_ok() {
                return Ok(());
            }
        }

        Err(UaError::internal("no connection manager accepted the listen request"))
    }

    /// Network callback shared by a listener and its accepted connections
    fn server_network_callback(&self, manager: Arc<dyn ConnectionManager>) -> NetworkCallback {
        let weak = self.downgrade();
        Arc::new(move |connection_id, state, params, _payload| {
            if let Some(server) = weak.upgrade() {
                server.handle_server_network_event(&manager, connection_id, state, params);
            }
        })
    }

    fn handle_server_network_event(
        &self,
        manager: &Arc<dyn ConnectionManager>,
        connection_id: ConnectionId,
        state: ConnectionState,
        params: &ParameterMap,
    ) {
        let mut core = self.core();
        let listening = params.get_bool(PARAM_LISTEN).unwrap_or(false);

        match (state, listening) {
            (ConnectionState::Established, true) => {
                if core
                    .server_connections
                    .register(Arc::clone(manager), connection_id)
                    .is_err()
                {
                    warn!(connection_id, "listen socket rejected, all server connection slots taken");
                    let _ = manager.close_connection(connection_id);
                }
            }
            (ConnectionState::Closed, true) => {
                core.server_connections.unregister(connection_id);
            }
            (ConnectionState::Established, false) => {
                // A client connection; the secure-channel handshake
                // collaborator takes over from the channel shell.
                let now = self.event_loop().now_monotonic();
                let policy = core
                    .config
                    .security_policies
                    .first()
                    .map(|sp| sp.policy_uri.clone())
                    .unwrap_or_default();
                core.channels.open_channel(policy, now, Some(connection_id));
            }
            (ConnectionState::Closed, false) => {
                core.channels.shutdown_by_connection(connection_id, DiagnosticEvent::Abort);
            }
            _ => {}
        }
    }
}
