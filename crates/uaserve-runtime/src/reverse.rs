//! Reverse-connect manager
//!
//! Reverse connect inverts the usual direction: the server dials clients
//! that sit behind NAT or firewalls. Each target is an owned entry in a map
//! keyed by a monotonically issued, never-reused handle. A 1 Hz cyclic
//! callback retries closed entries; state transitions are reported through a
//! per-entry callback holding nothing but the handle.
//!
//! Teardown is the delicate part: an entry with a live connection is not
//! dropped on removal but flagged for destruction, and its reclamation runs
//! as a delayed callback after the event loop's current iteration. Network
//! callbacks still in flight for that iteration find the entry flagged and
//! only advance it to the close-confirmed state.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use uaserve_core::errors::{UaError, UaResult};
use uaserve_core::eventloop::{
    CallbackId, ConnectionId, ConnectionManager, ConnectionState, DelayedCallback,
    EventSourceState, NetworkCallback,
};
use uaserve_core::params::{ParameterMap, ParameterValue, PARAM_ADDRESS, PARAM_PORT};
use uaserve_core::url::parse_endpoint_url;

use crate::connections::TCP_PROTOCOL;
use crate::managers::SecureChannelState;
use crate::server::{Server, ServerCore};

/// Handle identifying one reverse-connect target; never reused
pub type ReverseConnectHandle = u64;

/// Callback reporting reverse-connect state transitions
pub type ReverseConnectStateCallback =
    Box<dyn FnMut(ReverseConnectHandle, SecureChannelState) + Send>;

/// Interval of the retry cyclic callback
pub(crate) const REVERSE_CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(1000);

// ----------------------------------------------------------------------------
// Entries
// ----------------------------------------------------------------------------

/// One outbound connection target
pub(crate) struct ReverseConnect {
    pub(crate) handle: ReverseConnectHandle,
    pub(crate) hostname: String,
    pub(crate) port: u16,
    pub(crate) state: SecureChannelState,
    /// The currently open transport connection, if any
    pub(crate) connection: Option<(Arc<dyn ConnectionManager>, ConnectionId)>,
    pub(crate) state_callback: Option<ReverseConnectStateCallback>,
    /// Set when the entry awaits reclamation; retries skip it and network
    /// callbacks only advance it toward close confirmation
    pub(crate) destruction: bool,
}

impl ReverseConnect {
    /// Transition the entry, notifying the state callback on change
    pub(crate) fn set_state(&mut self, state: SecureChannelState) {
        if self.state == state {
            return;
        }
        self.state = state;
        if let Some(callback) = self.state_callback.as_mut() {
            callback(self.handle, state);
        }
    }
}

/// Owning registry of reverse-connect entries
#[derive(Default)]
pub(crate) struct ReverseConnectRegistry {
    entries: BTreeMap<ReverseConnectHandle, ReverseConnect>,
    last_handle: ReverseConnectHandle,
    /// Retry cyclic callback registration; 0 while no entry exists
    pub(crate) retry_callback_id: CallbackId,
}

impl ReverseConnectRegistry {
    pub(crate) fn next_handle(&mut self) -> ReverseConnectHandle {
        self.last_handle += 1;
        self.last_handle
    }

    pub(crate) fn insert(&mut self, entry: ReverseConnect) {
        self.entries.insert(entry.handle, entry);
    }

    pub(crate) fn get_mut(&mut self, handle: ReverseConnectHandle) -> Option<&mut ReverseConnect> {
        self.entries.get_mut(&handle)
    }

    pub(crate) fn remove(&mut self, handle: ReverseConnectHandle) -> Option<ReverseConnect> {
        self.entries.remove(&handle)
    }

    /// Handles in insertion order
    pub(crate) fn handles(&self) -> Vec<ReverseConnectHandle> {
        self.entries.keys().copied().collect()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Result of one connect attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AttemptOutcome {
    /// The transport accepted the request for asynchronous completion
    Started,
    /// The connection manager is not started yet; the retry tick will try
    /// again
    Deferred,
}

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

impl Server {
    /// Add a reverse-connect target and attempt an immediate connect
    ///
    /// A failed first attempt is not an error: the entry stays registered
    /// and the 1 Hz retry keeps trying until the target is removed.
    pub fn add_reverse_connect(
        &self,
        url: &str,
        state_callback: Option<ReverseConnectStateCallback>,
    ) -> UaResult<ReverseConnectHandle> {
        let endpoint = parse_endpoint_url(url).map_err(|e| {
            warn!(url, "reverse connect URL is invalid");
            e
        })?;

        let mut core = self.core();
        if core.reverse_connects.is_empty() {
            self.install_reverse_connect_retry(&mut core)?;
        }

        let handle = core.reverse_connects.next_handle();
        core.reverse_connects.insert(ReverseConnect {
            handle,
            hostname: endpoint.host,
            port: endpoint.port,
            state: SecureChannelState::Closed,
            connection: None,
            state_callback,
            destruction: false,
        });

        if let Err(e) = self.attempt_reverse_connect(&mut core, handle) {
            debug!(handle, error = %e, "initial reverse connect attempt failed, will retry");
        }
        Ok(handle)
    }

    /// Remove a reverse-connect target
    ///
    /// Without a live connection the entry is released synchronously, after a
    /// final transition to the closed state. With a live connection the entry
    /// is quarantined: transport close is requested and the memory is
    /// reclaimed by a delayed callback once the event loop finishes its
    /// current iteration, so no in-flight callback can observe a freed entry.
    pub fn remove_reverse_connect(&self, handle: ReverseConnectHandle) -> UaResult<()> {
        let mut core = self.core();
        let entry = core.reverse_connects.get_mut(handle).ok_or(UaError::NotFound)?;
        if entry.destruction {
            return Err(UaError::NotFound);
        }

        match entry.connection.clone() {
            Some((manager, connection_id)) => {
                entry.destruction = true;
                let weak = self.downgrade();
                self.event_loop().add_delayed_callback(DelayedCallback::new(move || {
                    if let Some(server) = weak.upgrade() {
                        server.reclaim_reverse_connect(handle);
                    }
                }));
                let _ = manager.close_connection(connection_id);
            }
            None => {
                if let Some(mut entry) = core.reverse_connects.remove(handle) {
                    entry.set_state(SecureChannelState::Closed);
                }
                if core.reverse_connects.is_empty() {
                    self.remove_reverse_connect_retry(&mut core);
                }
            }
        }
        Ok(())
    }

    /// Number of registered reverse-connect targets, including quarantined
    /// entries awaiting reclamation
    pub fn reverse_connect_count(&self) -> usize {
        self.core().reverse_connects.len()
    }
}

// ----------------------------------------------------------------------------
// Connect Attempts
// ----------------------------------------------------------------------------

impl Server {
    /// Try to open the transport connection for one entry
    pub(crate) fn attempt_reverse_connect(
        &self,
        core: &mut ServerCore,
        handle: ReverseConnectHandle,
    ) -> UaResult<AttemptOutcome> {
        let Some(manager) = self
            .event_loop()
            .connection_managers()
            .into_iter()
            .find(|cm| cm.protocol() == TCP_PROTOCOL)
        else {
            warn!("no tcp connection manager available for reverse connect");
            return Err(UaError::internal("no tcp connection manager available"));
        };

        let entry = core.reverse_connects.get_mut(handle).ok_or(UaError::NotFound)?;

        if manager.state() != EventSourceState::Started {
            return Ok(AttemptOutcome::Deferred);
        }

        let mut params = ParameterMap::new();
        params.insert(PARAM_ADDRESS, ParameterValue::String(entry.hostname.clone()));
        params.insert(PARAM_PORT, ParameterValue::UInt16(entry.port));

        let callback = self.reverse_connect_network_callback(Arc::clone(&manager), handle);
        let result = manager.open_connection(&params, callback);
        if let Err(ref e) = result {
            warn!(handle, error = %e, "failed to create connection for reverse connect");
            entry.connection = None;
        }

        // Both outcomes count as an attempt: the entry leaves the closed
        // state and the user callback observes the transition once.
        if entry.state != SecureChannelState::Connecting {
            entry.set_state(SecureChannelState::Connecting);
        }

        result.map(|_| AttemptOutcome::Started)
    }

    /// 1 Hz retry: re-attempt every closed, non-quarantined entry
    pub(crate) fn reverse_connect_retry_tick(&self) {
        let mut core = self.core();
        let due: Vec<ReverseConnectHandle> = core
            .reverse_connects
            .handles()
            .into_iter()
            .filter(|&h| {
                core.reverse_connects
                    .get_mut(h)
                    .map(|e| e.state == SecureChannelState::Closed && !e.destruction)
                    .unwrap_or(false)
            })
            .collect();
        for handle in due {
            let _ = self.attempt_reverse_connect(&mut core, handle);
        }
    }

    fn install_reverse_connect_retry(&self, core: &mut ServerCore) -> UaResult<()> {
        core.reverse_connects.retry_callback_id = self
            .add_repeated_callback_locked(REVERSE_CONNECT_RETRY_INTERVAL, |server| {
                server.reverse_connect_retry_tick()
            })?;
        Ok(())
    }

    pub(crate) fn remove_reverse_connect_retry(&self, core: &mut ServerCore) {
        if core.reverse_connects.retry_callback_id != 0 {
            self.remove_callback_locked(core.reverse_connects.retry_callback_id);
            core.reverse_connects.retry_callback_id = 0;
        }
    }
}

// ----------------------------------------------------------------------------
// Network Events
// ----------------------------------------------------------------------------

impl Server {
    fn reverse_connect_network_callback(
        &self,
        manager: Arc<dyn ConnectionManager>,
        handle: ReverseConnectHandle,
    ) -> NetworkCallback {
        let weak = self.downgrade();
        Arc::new(move |connection_id, state, _params, _payload| {
            if let Some(server) = weak.upgrade() {
                server.handle_reverse_connect_event(&manager, handle, connection_id, state);
            }
        })
    }

    fn handle_reverse_connect_event(
        &self,
        manager: &Arc<dyn ConnectionManager>,
        handle: ReverseConnectHandle,
        connection_id: ConnectionId,
        state: ConnectionState,
    ) {
        let mut core = self.core();
        let Some(entry) = core.reverse_connects.get_mut(handle) else {
            // Already reclaimed; the late event has nothing left to do.
            return;
        };

        match state {
            ConnectionState::Opening => {
                entry.connection = Some((Arc::clone(manager), connection_id));
                if entry.destruction {
                    let _ = manager.close_connection(connection_id);
                }
            }
            ConnectionState::Established => {
                if entry.destruction {
                    let _ = manager.close_connection(connection_id);
                    return;
                }
                entry.connection = Some((Arc::clone(manager), connection_id));
                entry.set_state(SecureChannelState::Connected);
            }
            ConnectionState::Closing => {}
            ConnectionState::Closed => {
                entry.connection = None;
                entry.set_state(SecureChannelState::Closed);
                // A quarantined entry is now close-confirmed; the delayed
                // callback scheduled by remove performs the reclamation.
            }
        }
    }

    /// Delayed-callback target releasing a quarantined entry
    pub(crate) fn reclaim_reverse_connect(&self, handle: ReverseConnectHandle) {
        let mut core = self.core();
        core.reverse_connects.remove(handle);
        if core.reverse_connects.is_empty() {
            self.remove_reverse_connect_retry(&mut core);
        }
    }
}
