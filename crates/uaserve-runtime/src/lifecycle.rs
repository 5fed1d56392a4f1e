//! Server lifecycle: startup, iterate, shutdown
//!
//! Startup spins up the event loop and the listen sockets and samples the
//! start time. Iterate pumps timed and network events with a bounded
//! timeout; an event-driven application can drive it from an external main
//! loop. Shutdown cancels the periodic work, tears down every connection and
//! drains the event loop to a stop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use uaserve_core::config::SECURITY_POLICY_NONE_URI;
use uaserve_core::errors::{UaError, UaResult};
use uaserve_core::eventloop::EventLoopState;
use uaserve_core::nodestore::{Variant, NS0_ID_SERVER_ARRAY, NS0_ID_SERVER_STATUS_STARTTIME};
use uaserve_core::types::NodeId;
use uaserve_core::url::parse_endpoint_url;

use crate::managers::DiagnosticEvent;
use crate::server::{Server, ServerCore, ServerLifecycle, HOUSEKEEPING_INTERVAL};

/// Max timeout in ms between main-loop iterations
const MAX_ITERATE_TIMEOUT_MS: u64 = 50;

/// Event-loop pump granularity while draining a shutdown
const SHUTDOWN_ITERATION_TIMEOUT: Duration = Duration::from_millis(100);

/// URL used when no server URL is configured
const DEFAULT_SERVER_URL: &str = "opc.tcp://:4840";

impl Server {
    // ------------------------------------------------------------------
    // Startup
    // ------------------------------------------------------------------

    /// Bring the server into the started state
    ///
    /// Registers housekeeping, starts the event loop if it is not running,
    /// opens the listen sockets, publishes the server array and start time,
    /// and derives discovery URLs from the configured server URLs. A second
    /// call on a started server is a no-op.
    pub fn run_startup(&self) -> UaResult<()> {
        let mut core = self.core();
        match core.lifecycle {
            ServerLifecycle::Started => return Ok(()),
            ServerLifecycle::ShuttingDown => {
                return Err(UaError::InvalidState {
                    reason: "cannot start a server that is shutting down".into(),
                })
            }
            ServerLifecycle::Fresh | ServerLifecycle::Stopped => {}
        }

        // Regular housekeeping with a 1s interval
        if core.housekeeping_callback_id == 0 {
            core.housekeeping_callback_id = self
                .add_repeated_callback_locked(HOUSEKEEPING_INTERVAL, |server| {
                    server.house_keeping()
                })?;
        }

        if self.event_loop().state() != EventLoopState::Started {
            self.event_loop().start()?;
        }

        // Open the server sockets
        let server_urls = if core.config.server_urls.is_empty() {
            warn!(
                "no server URL configured, using \"{}\" to configure the listen socket",
                DEFAULT_SERVER_URL
            );
            vec![DEFAULT_SERVER_URL.to_string()]
        } else {
            core.config.server_urls.clone()
        };
        let mut have_server_socket = false;
        for url in &server_urls {
            match self.create_server_connection(url) {
                Ok(()) => have_server_socket = true,
                Err(e) => warn!(%url, error = %e, "could not open a listen socket"),
            }
        }
        if !have_server_socket {
            // Not fatal: the server remains useful for reverse connections
            error!("the server has no listen socket");
        }

        let application_uri = core.config.application.application_uri.clone();
        core.namespaces.setup_ns1(&application_uri);

        // The server array carries the same application URI as ns1
        core.node_store.write_value(
            &NodeId::numeric(0, NS0_ID_SERVER_ARRAY),
            Variant::StringArray(vec![application_uri]),
        )?;

        if core.config.endpoints.is_empty() {
            warn!("there has to be at least one endpoint");
        }

        verify_server_application_uri(&core)?;

        // Sample the start time and publish it
        let start_time = self.event_loop().now();
        core.start_time = Some(start_time);
        core.node_store.write_value(
            &NodeId::numeric(0, NS0_ID_SERVER_STATUS_STARTTIME),
            Variant::DateTime(start_time),
        )?;

        // Advertise the server URLs for discovery, skipping those that
        // listen on all interfaces
        let discovered: Vec<String> = core
            .config
            .server_urls
            .iter()
            .filter(|url| {
                parse_endpoint_url(url).map(|ep| !ep.host.is_empty()).unwrap_or(false)
            })
            .filter(|url| !core.config.application.discovery_urls.contains(url))
            .cloned()
            .collect();
        core.config.application.discovery_urls.extend(discovered);

        // Refresh the application description published on each endpoint
        let application = core.config.application.clone();
        for endpoint in core.config.endpoints.iter_mut() {
            endpoint.server = application.clone();
        }

        core.lifecycle = ServerLifecycle::Started;
        info!(listeners = core.server_connections.len(), "server started");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Iterate
    // ------------------------------------------------------------------

    /// Run one main-loop iteration
    ///
    /// Polls the subsystems, pumps the event loop for at most 50 ms
    /// (`wait_internal = false` pumps without waiting) and returns the
    /// milliseconds until the next scheduled callback, clamped to the
    /// iteration maximum.
    pub fn run_iterate(&self, wait_internal: bool) -> u16 {
        {
            let mut core = self.core();
            for subsystem in core.subsystems.iter_mut() {
                subsystem.poll();
            }
        }

        let timeout = if wait_internal {
            Duration::from_millis(MAX_ITERATE_TIMEOUT_MS)
        } else {
            Duration::ZERO
        };
        if let Err(e) = self.event_loop().run(timeout) {
            debug!(error = %e, "event loop iteration failed");
        }

        let now = self.event_loop().now_monotonic();
        let until_next = self
            .event_loop()
            .next_cyclic_time()
            .map(|deadline| now.millis_until(deadline))
            .unwrap_or(MAX_ITERATE_TIMEOUT_MS);
        until_next.min(MAX_ITERATE_TIMEOUT_MS) as u16
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Request a shutdown, returning whether the server should stop now
    ///
    /// With a configured delay the first call arms the deadline and returns
    /// `false`; the main loop keeps iterating until
    /// [`Server::shutdown_deadline_reached`] reports the grace period over.
    pub fn request_shutdown(&self) -> bool {
        let mut core = self.core();
        if core.end_time.is_some() {
            return false;
        }
        if core.config.shutdown_delay.is_zero() {
            return true;
        }
        warn!(
            delay_ms = core.config.shutdown_delay.as_millis() as u64,
            "shutting down the server with a delay"
        );
        core.end_time = Some(self.event_loop().now().saturating_add(core.config.shutdown_delay));
        false
    }

    /// Whether a requested shutdown's grace period has elapsed
    pub fn shutdown_deadline_reached(&self) -> bool {
        let end_time = self.core().end_time;
        match end_time {
            Some(deadline) => self.event_loop().now() > deadline,
            None => false,
        }
    }

    /// Tear the started server down to the stopped state
    ///
    /// Cancels housekeeping, quarantines and closes every reverse connect,
    /// closes all secure channels and listen sockets, then drains the event
    /// loop: one zero-timeout pump when the embedding application owns the
    /// loop, otherwise stop-and-drain until the loop confirms.
    pub fn run_shutdown(&self) -> UaResult<()> {
        let external = {
            let mut core = self.core();
            core.lifecycle = ServerLifecycle::ShuttingDown;

            if core.housekeeping_callback_id != 0 {
                self.remove_callback_locked(core.housekeeping_callback_id);
                core.housekeeping_callback_id = 0;
            }

            // Mark all reverse connects as destroying
            for handle in core.reverse_connects.handles() {
                if let Some(entry) = core.reverse_connects.get_mut(handle) {
                    entry.destruction = true;
                    if let Some((manager, connection_id)) = entry.connection.clone() {
                        let _ = manager.close_connection(connection_id);
                    }
                    entry.set_state(crate::managers::SecureChannelState::Closed);
                }
            }

            core.channels.close_all(DiagnosticEvent::Close);

            for slot in core.server_connections.active() {
                let _ = slot.manager.close_connection(slot.connection_id);
            }

            core.config.external_event_loop
        };

        // Pump with the service lock released; close confirmations arrive
        // through the network callbacks.
        let event_loop = self.event_loop();
        if external {
            // One zero-timeout iteration closes the connections fully
            let _ = event_loop.run(Duration::ZERO);
        } else {
            if event_loop.state() == EventLoopState::Started {
                event_loop.stop();
            }
            while event_loop.state() != EventLoopState::Stopped
                && event_loop.state() != EventLoopState::Fresh
            {
                if event_loop.run(SHUTDOWN_ITERATION_TIMEOUT).is_err() {
                    break;
                }
            }
        }

        let mut core = self.core();
        for subsystem in core.subsystems.iter_mut() {
            subsystem.shutdown();
        }
        self.remove_reverse_connect_retry(&mut core);
        core.reverse_connects.clear();
        core.server_connections.clear();
        core.start_time = None;
        core.lifecycle = ServerLifecycle::Stopped;
        info!("server stopped");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Main Loop
    // ------------------------------------------------------------------

    /// Run the server until `running` turns false and any shutdown grace
    /// period has elapsed
    pub fn run(&self, running: &AtomicBool) -> UaResult<()> {
        self.run_startup()?;
        while !self.shutdown_deadline_reached() {
            self.run_iterate(true);
            if !running.load(Ordering::Acquire) && self.request_shutdown() {
                break;
            }
        }
        self.run_shutdown()
    }
}

/// Check that every certificate-bearing security policy matches the
/// application URI, when a verifier is configured
fn verify_server_application_uri(core: &ServerCore) -> UaResult<()> {
    let Some(verifier) = core.config.certificate_verifier.as_ref() else {
        return Ok(());
    };
    for policy in &core.config.security_policies {
        if policy.policy_uri == SECURITY_POLICY_NONE_URI && policy.local_certificate.is_empty() {
            continue;
        }
        verifier
            .verify_application_uri(
                &policy.local_certificate,
                &core.config.application.application_uri,
            )
            .map_err(|e| {
                error!(
                    policy = %policy.policy_uri,
                    "the configured application URI does not match the certificate"
                );
                e
            })?;
    }
    Ok(())
}
