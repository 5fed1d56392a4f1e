//! Event loop and connection manager contracts
//!
//! The server is single-threaded and cooperative: one event loop drives all
//! timed, cyclic, delayed and network callbacks. This module defines the
//! contract the server consumes; concrete implementations live in sibling
//! crates (`uaserve-eventloop` for the tokio-backed default,
//! `uaserve-harness` for the deterministic simulation loop).
//!
//! ## Architecture
//!
//! Each event loop implementation:
//! - Executes every callback on the loop thread, in deadline order
//! - Serializes network callbacks with timed callbacks (same thread)
//! - Owns its own synchronization; the server never holds its service lock
//!   while blocking inside [`EventLoop::run`]
//! - Exposes its connection managers for enumeration, so the server can fan
//!   listeners out over every transport that matches a URL scheme

use std::sync::Arc;
use std::time::Duration;

use crate::errors::UaResult;
use crate::params::ParameterMap;
use crate::types::Timestamp;

// ----------------------------------------------------------------------------
// Callback Types
// ----------------------------------------------------------------------------

/// Identifier of a registered timed or cyclic callback
///
/// Unique for the lifetime of the event loop; 0 is never issued, so callers
/// can use it as a "no callback registered" sentinel.
pub type CallbackId = u64;

/// A timed or cyclic callback, executed on the event loop thread
pub type TimedCallback = Box<dyn FnMut() + Send>;

/// Callback executed once, after the event loop completes its current
/// iteration
///
/// Delayed callbacks own everything they capture. The server uses them to
/// reclaim reverse-connect entries only after any in-flight network callback
/// of the same iteration has finished.
pub struct DelayedCallback {
    callback: Box<dyn FnOnce() + Send>,
}

impl DelayedCallback {
    /// Wrap a closure for post-iteration execution
    pub fn new(callback: impl FnOnce() + Send + 'static) -> Self {
        Self { callback: Box::new(callback) }
    }

    /// Consume and run the callback
    pub fn invoke(self) {
        (self.callback)()
    }
}

impl core::fmt::Debug for DelayedCallback {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("DelayedCallback")
    }
}

/// Policy applied when a cyclic callback misses one or more cycles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CycleMissPolicy {
    /// Fire once with the current time and skip the backlog. Prefers
    /// liveness over catch-up; the server uses this for housekeeping and
    /// reverse-connect retries.
    #[default]
    FireWithCurrentTime,
    /// Keep the original base time, bursting through missed cycles
    FireWithBaseTime,
}

// ----------------------------------------------------------------------------
// Event Loop States
// ----------------------------------------------------------------------------

/// Lifecycle state of an event loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventLoopState {
    Fresh,
    Started,
    Stopping,
    Stopped,
}

/// Lifecycle state of an event source (e.g. a connection manager)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSourceState {
    Fresh,
    Started,
    Stopped,
}

// ----------------------------------------------------------------------------
// Connection Manager
// ----------------------------------------------------------------------------

/// Transport-assigned identifier of a single connection; 0 is never assigned
pub type ConnectionId = u64;

/// State of a single connection as reported through network callbacks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Opening,
    Established,
    Closing,
    Closed,
}

/// Callback invoked for every connection event and received payload
///
/// Invoked on the event loop thread. For listening sockets the parameter map
/// carries `listen=true`; child connections accepted on a listener inherit
/// the listener's callback with `listen` absent.
pub type NetworkCallback =
    Arc<dyn Fn(ConnectionId, ConnectionState, &ParameterMap, &[u8]) + Send + Sync>;

/// A connection-managing event source
///
/// `open_connection` never blocks: both listen and connect requests are
/// accepted for asynchronous completion, and all results arrive through the
/// registered [`NetworkCallback`] during a later [`EventLoop::run`]
/// iteration. `close_connection` likewise only requests the close; the
/// `Closed` state is confirmed through the callback.
pub trait ConnectionManager: Send + Sync {
    /// Transport scheme served by this manager, e.g. `"tcp"`
    fn protocol(&self) -> &str;

    /// Current event source state
    fn state(&self) -> EventSourceState;

    /// Open a listening or outbound connection described by `params`
    fn open_connection(&self, params: &ParameterMap, callback: NetworkCallback) -> UaResult<()>;

    /// Request an orderly close of a connection
    fn close_connection(&self, id: ConnectionId) -> UaResult<()>;
}

// ----------------------------------------------------------------------------
// Event Loop
// ----------------------------------------------------------------------------

/// Single-threaded scheduler for timed, cyclic, delayed and network callbacks
pub trait EventLoop: Send + Sync {
    /// Current lifecycle state
    fn state(&self) -> EventLoopState;

    /// Start the loop and its event sources
    fn start(&self) -> UaResult<()>;

    /// Request a stop; the loop drains to `Stopped` over subsequent
    /// [`EventLoop::run`] calls
    fn stop(&self);

    /// Process due callbacks and network events, waiting at most `timeout`
    fn run(&self, timeout: Duration) -> UaResult<()>;

    /// Wall clock in milliseconds since the Unix epoch
    fn now(&self) -> Timestamp;

    /// Monotonic clock in milliseconds since a loop-defined origin
    fn now_monotonic(&self) -> Timestamp;

    /// Monotonic deadline of the next registered timed or cyclic callback
    fn next_cyclic_time(&self) -> Option<Timestamp>;

    /// Register a one-shot callback at an absolute monotonic deadline
    fn add_timed_callback(
        &self,
        callback: TimedCallback,
        deadline: Timestamp,
    ) -> UaResult<CallbackId>;

    /// Register a repeating callback
    ///
    /// The first execution happens at `initial_deadline` when given,
    /// otherwise one `interval` from now.
    fn add_cyclic_callback(
        &self,
        callback: TimedCallback,
        interval: Duration,
        initial_deadline: Option<Timestamp>,
        miss_policy: CycleMissPolicy,
    ) -> UaResult<CallbackId>;

    /// Change the interval (and optionally re-base the deadline) of a cyclic
    /// callback
    fn modify_cyclic_callback(
        &self,
        id: CallbackId,
        interval: Duration,
        initial_deadline: Option<Timestamp>,
        miss_policy: CycleMissPolicy,
    ) -> UaResult<()>;

    /// Deregister a timed or cyclic callback; the id may be reused afterwards
    fn remove_cyclic_callback(&self, id: CallbackId);

    /// Schedule a callback to run after the current iteration completes
    fn add_delayed_callback(&self, callback: DelayedCallback);

    /// Enumerate the connection-managing event sources of this loop
    fn connection_managers(&self) -> Vec<Arc<dyn ConnectionManager>>;
}
