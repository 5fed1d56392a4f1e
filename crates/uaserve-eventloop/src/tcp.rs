//! TCP connection manager
//!
//! Serves the `tcp` transport for both directions: listening sockets opened
//! by the server's listener fan-out and outbound connections opened by the
//! reverse-connect manager. Socket work runs in tasks on the event loop's
//! current-thread runtime; every observable result is queued as a network
//! event and delivered as a callback from inside [`EventLoop::run`], never
//! synchronously from `open_connection` or `close_connection`.
//!
//! [`EventLoop::run`]: uaserve_core::eventloop::EventLoop::run

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use uaserve_core::errors::{UaError, UaResult};
use uaserve_core::eventloop::{
    ConnectionId, ConnectionManager, ConnectionState, EventSourceState, NetworkCallback,
};
use uaserve_core::params::{ParameterMap, ParameterValue, PARAM_ADDRESS, PARAM_LISTEN, PARAM_PORT};

/// A queued connection event awaiting dispatch on the loop thread
pub(crate) struct NetEvent {
    pub(crate) callback: NetworkCallback,
    pub(crate) connection_id: ConnectionId,
    pub(crate) state: ConnectionState,
    pub(crate) params: ParameterMap,
    pub(crate) payload: Vec<u8>,
}

// ----------------------------------------------------------------------------
// Shared Connection Registry
// ----------------------------------------------------------------------------

struct ConnEntry {
    close_tx: watch::Sender<bool>,
}

struct TcpShared {
    next_id: AtomicU64,
    connections: Mutex<HashMap<ConnectionId, ConnEntry>>,
    net_tx: mpsc::UnboundedSender<NetEvent>,
}

impl TcpShared {
    fn allocate(&self) -> (ConnectionId, watch::Receiver<bool>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (close_tx, close_rx) = watch::channel(false);
        self.connections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, ConnEntry { close_tx });
        (id, close_rx)
    }

    fn release(&self, id: ConnectionId) {
        self.connections.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
    }

    fn emit(
        &self,
        callback: &NetworkCallback,
        connection_id: ConnectionId,
        state: ConnectionState,
        params: ParameterMap,
        payload: Vec<u8>,
    ) {
        let _ = self.net_tx.send(NetEvent {
            callback: Arc::clone(callback),
            connection_id,
            state,
            params,
            payload,
        });
    }
}

// ----------------------------------------------------------------------------
// TCP Connection Manager
// ----------------------------------------------------------------------------

/// Connection manager for the `tcp` transport
pub struct TcpConnectionManager {
    state: Mutex<EventSourceState>,
    shared: Arc<TcpShared>,
    handle: tokio::runtime::Handle,
}

impl TcpConnectionManager {
    pub(crate) fn new(
        net_tx: mpsc::UnboundedSender<NetEvent>,
        handle: tokio::runtime::Handle,
    ) -> Self {
        Self {
            state: Mutex::new(EventSourceState::Fresh),
            shared: Arc::new(TcpShared {
                next_id: AtomicU64::new(1),
                connections: Mutex::new(HashMap::new()),
                net_tx,
            }),
            handle,
        }
    }

    pub(crate) fn set_state(&self, state: EventSourceState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    /// Number of connections not yet fully closed
    pub(crate) fn connection_count(&self) -> usize {
        self.shared.connections.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Request a close of every tracked connection
    pub(crate) fn close_all(&self) {
        let connections = self.shared.connections.lock().unwrap_or_else(|e| e.into_inner());
        for entry in connections.values() {
            let _ = entry.close_tx.send(true);
        }
    }

    fn open_listener(&self, params: &ParameterMap, callback: NetworkCallback) -> UaResult<()> {
        let port = params
            .get_u16(PARAM_PORT)
            .ok_or_else(|| UaError::invalid_argument("listen request without a port"))?;
        let address = params.get_string(PARAM_ADDRESS).unwrap_or("0.0.0.0").to_string();

        let shared = Arc::clone(&self.shared);
        let (id, mut close_rx) = shared.allocate();
        self.handle.spawn(async move {
            let mut listen_params = ParameterMap::new();
            listen_params.insert(PARAM_LISTEN, ParameterValue::Boolean(true));
            listen_params.insert(PARAM_PORT, ParameterValue::UInt16(port));

            let listener = match TcpListener::bind((address.as_str(), port)).await {
                Ok(listener) => listener,
                Err(e) => {
                    warn!(%address, port, error = %e, "could not bind listen socket");
                    shared.release(id);
                    shared.emit(&callback, id, ConnectionState::Closed, listen_params, Vec::new());
                    return;
                }
            };
            debug!(%address, port, connection_id = id, "listen socket open");
            shared.emit(&callback, id, ConnectionState::Established, listen_params.clone(), Vec::new());

            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, peer)) => {
                                debug!(%peer, "accepted client connection");
                                let (child_id, child_close) = shared.allocate();
                                let child_shared = Arc::clone(&shared);
                                let child_callback = Arc::clone(&callback);
                                tokio::spawn(async move {
                                    child_shared.emit(
                                        &child_callback,
                                        child_id,
                                        ConnectionState::Established,
                                        ParameterMap::new(),
                                        Vec::new(),
                                    );
                                    run_connection(child_shared, child_id, stream, child_callback, child_close).await;
                                });
                            }
                            Err(e) => {
                                debug!(error = %e, "accept failed");
                            }
                        }
                    }
                    _ = close_rx.changed() => break,
                }
            }

            shared.release(id);
            shared.emit(&callback, id, ConnectionState::Closed, listen_params, Vec::new());
        });
        Ok(())
    }

    fn open_outbound(&self, params: &ParameterMap, callback: NetworkCallback) -> UaResult<()> {
        let port = params
            .get_u16(PARAM_PORT)
            .ok_or_else(|| UaError::invalid_argument("connect request without a port"))?;
        let address = params
            .get_string(PARAM_ADDRESS)
            .ok_or_else(|| UaError::invalid_argument("connect request without an address"))?
            .to_string();

        let shared = Arc::clone(&self.shared);
        let (id, mut close_rx) = shared.allocate();
        self.handle.spawn(async move {
            // Announce the pending connection so the opener learns its id
            shared.emit(&callback, id, ConnectionState::Opening, ParameterMap::new(), Vec::new());

            let stream = tokio::select! {
                connected = TcpStream::connect((address.as_str(), port)) => {
                    match connected {
                        Ok(stream) => Some(stream),
                        Err(e) => {
                            debug!(%address, port, error = %e, "outbound connection failed");
                            None
                        }
                    }
                }
                _ = close_rx.changed() => None,
            };

            match stream {
                Some(stream) => {
                    debug!(%address, port, connection_id = id, "outbound connection established");
                    shared.emit(&callback, id, ConnectionState::Established, ParameterMap::new(), Vec::new());
                    // run_connection emits the close
                    run_connection(shared, id, stream, callback, close_rx).await;
                }
                None => {
                    shared.release(id);
                    shared.emit(&callback, id, ConnectionState::Closed, ParameterMap::new(), Vec::new());
                }
            }
        });
        Ok(())
    }
}

/// Pump one established connection until EOF, error or a close request
async fn run_connection(
    shared: Arc<TcpShared>,
    id: ConnectionId,
    mut stream: TcpStream,
    callback: NetworkCallback,
    mut close_rx: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        tokio::select! {
            read = stream.read(&mut buf) => {
                match read {
                    Ok(0) => break,
                    Ok(n) => {
                        shared.emit(
                            &callback,
                            id,
                            ConnectionState::Established,
                            ParameterMap::new(),
                            buf[..n].to_vec(),
                        );
                    }
                    Err(e) => {
                        debug!(connection_id = id, error = %e, "connection read failed");
                        break;
                    }
                }
            }
            _ = close_rx.changed() => break,
        }
    }
    shared.release(id);
    shared.emit(&callback, id, ConnectionState::Closed, ParameterMap::new(), Vec::new());
}

impl ConnectionManager for TcpConnectionManager {
    fn protocol(&self) -> &str {
        "tcp"
    }

    fn state(&self) -> EventSourceState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn open_connection(&self, params: &ParameterMap, callback: NetworkCallback) -> UaResult<()> {
        if self.state() != EventSourceState::Started {
            return Err(UaError::InvalidState {
                reason: "connection manager is not started".into(),
            });
        }
        if params.get_bool(PARAM_LISTEN).unwrap_or(false) {
            self.open_listener(params, callback)
        } else {
            self.open_outbound(params, callback)
        }
    }

    fn close_connection(&self, id: ConnectionId) -> UaResult<()> {
        let connections = self.shared.connections.lock().unwrap_or_else(|e| e.into_inner());
        let entry = connections.get(&id).ok_or(UaError::NotFound)?;
        let _ = entry.close_tx.send(true);
        Ok(())
    }
}
