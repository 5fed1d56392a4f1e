//! uaserve Harness
//!
//! Shared test infrastructure: a deterministic [`SimEventLoop`] with a
//! manual clock and a scripted [`SimConnectionManager`]. Connection events
//! are queued by test hooks (or by the manager's auto-establish behavior)
//! and delivered on the next [`SimEventLoop::run`], mirroring the real
//! loop's promise that callbacks never fire synchronously from
//! `open_connection` or `close_connection`.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use uaserve_core::errors::{UaError, UaResult};
use uaserve_core::eventloop::{
    CallbackId, ConnectionId, ConnectionManager, ConnectionState, CycleMissPolicy,
    DelayedCallback, EventLoop, EventLoopState, EventSourceState, NetworkCallback, TimedCallback,
};
use uaserve_core::params::{ParameterMap, PARAM_LISTEN};
use uaserve_core::types::Timestamp;
use uaserve_eventloop::timer::TimerQueue;

/// Simulated wall-clock origin, an arbitrary fixed epoch offset
const SIM_WALL_ORIGIN_MS: u64 = 1_700_000_000_000;

// ----------------------------------------------------------------------------
// Scripted Connection Manager
// ----------------------------------------------------------------------------

/// One recorded `open_connection` request
#[derive(Clone)]
pub struct OpenRequest {
    pub connection_id: ConnectionId,
    pub params: ParameterMap,
    pub listening: bool,
}

struct SimEvent {
    callback: NetworkCallback,
    connection_id: ConnectionId,
    state: ConnectionState,
    params: ParameterMap,
}

struct SimConnection {
    callback: NetworkCallback,
    listening: bool,
}

#[derive(Default)]
struct SimCmInner {
    next_id: ConnectionId,
    connections: HashMap<ConnectionId, SimConnection>,
    pending: VecDeque<SimEvent>,
    open_log: Vec<OpenRequest>,
    fail_next_open: bool,
    auto_establish: bool,
}

/// Deterministic `tcp` connection manager driven by test hooks
pub struct SimConnectionManager {
    state: Mutex<EventSourceState>,
    inner: Mutex<SimCmInner>,
}

impl SimConnectionManager {
    fn new() -> Self {
        Self {
            state: Mutex::new(EventSourceState::Fresh),
            inner: Mutex::new(SimCmInner {
                next_id: 1,
                auto_establish: true,
                ..SimCmInner::default()
            }),
        }
    }

    fn inner(&self) -> MutexGuard<'_, SimCmInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Override the event source state reported to the server
    pub fn set_state(&self, state: EventSourceState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    /// Let the next `open_connection` fail synchronously
    pub fn fail_next_open(&self) {
        self.inner().fail_next_open = true;
    }

    /// Disable the default queueing of `Established` on every open
    pub fn set_auto_establish(&self, auto_establish: bool) {
        self.inner().auto_establish = auto_establish;
    }

    /// Queue an `Established` event for a pending connection
    pub fn establish(&self, connection_id: ConnectionId) {
        let mut inner = self.inner();
        if let Some(conn) = inner.connections.get(&connection_id) {
            let event = SimEvent {
                callback: Arc::clone(&conn.callback),
                connection_id,
                state: ConnectionState::Established,
                params: connection_params(conn),
            };
            inner.pending.push_back(event);
        }
    }

    /// Queue a remote-initiated close for a connection
    pub fn drop_connection(&self, connection_id: ConnectionId) {
        let mut inner = self.inner();
        if let Some(conn) = inner.connections.get(&connection_id) {
            let event = SimEvent {
                callback: Arc::clone(&conn.callback),
                connection_id,
                state: ConnectionState::Closed,
                params: connection_params(conn),
            };
            inner.pending.push_back(event);
        }
    }

    /// Every `open_connection` recorded so far
    pub fn open_requests(&self) -> Vec<OpenRequest> {
        self.inner().open_log.clone()
    }

    /// Number of connections not yet closed
    pub fn connection_count(&self) -> usize {
        self.inner().connections.len()
    }

    fn queue_close_all(&self) {
        let mut inner = self.inner();
        let ids: Vec<ConnectionId> = inner.connections.keys().copied().collect();
        for id in ids {
            if let Some(conn) = inner.connections.get(&id) {
                let event = SimEvent {
                    callback: Arc::clone(&conn.callback),
                    connection_id: id,
                    state: ConnectionState::Closed,
                    params: connection_params(conn),
                };
                inner.pending.push_back(event);
            }
        }
    }

    /// Take the queued events of this iteration, dropping closed connections
    fn drain_pending(&self) -> Vec<SimEvent> {
        let mut inner = self.inner();
        let events: Vec<SimEvent> = inner.pending.drain(..).collect();
        for event in &events {
            if event.state == ConnectionState::Closed {
                inner.connections.remove(&event.connection_id);
            }
        }
        events
    }

    fn has_pending(&self) -> bool {
        !self.inner().pending.is_empty()
    }
}

fn connection_params(conn: &SimConnection) -> ParameterMap {
    let mut params = ParameterMap::new();
    if conn.listening {
        params.insert(PARAM_LISTEN, uaserve_core::params::ParameterValue::Boolean(true));
    }
    params
}

impl ConnectionManager for SimConnectionManager {
    fn protocol(&self) -> &str {
        "tcp"
    }

    fn state(&self) -> EventSourceState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn open_connection(&self, params: &ParameterMap, callback: NetworkCallback) -> UaResult<()> {
        let mut inner = self.inner();
        if inner.fail_next_open {
            inner.fail_next_open = false;
            return Err(UaError::internal("simulated open failure"));
        }

        let listening = params.get_bool(PARAM_LISTEN).unwrap_or(false);
        let id = inner.next_id;
        inner.next_id += 1;

        inner.open_log.push(OpenRequest {
            connection_id: id,
            params: params.clone(),
            listening,
        });
        inner.connections.insert(
            id,
            SimConnection { callback: Arc::clone(&callback), listening },
        );

        let mut event_params = ParameterMap::new();
        if listening {
            event_params.insert(PARAM_LISTEN, uaserve_core::params::ParameterValue::Boolean(true));
        } else {
            // Outbound connects announce their id before completion
            inner.pending.push_back(SimEvent {
                callback: Arc::clone(&callback),
                connection_id: id,
                state: ConnectionState::Opening,
                params: event_params.clone(),
            });
        }
        if inner.auto_establish {
            inner.pending.push_back(SimEvent {
                callback,
                connection_id: id,
                state: ConnectionState::Established,
                params: event_params,
            });
        }
        Ok(())
    }

    fn close_connection(&self, id: ConnectionId) -> UaResult<()> {
        let mut inner = self.inner();
        let conn = inner.connections.get(&id).ok_or(UaError::NotFound)?;
        let event = SimEvent {
            callback: Arc::clone(&conn.callback),
            connection_id: id,
            state: ConnectionState::Closed,
            params: connection_params(conn),
        };
        inner.pending.push_back(event);
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Simulation Event Loop
// ----------------------------------------------------------------------------

struct SimClock {
    wall_ms: u64,
    mono_ms: u64,
}

/// Event loop under a manual clock
///
/// `run(timeout)` advances both clocks by exactly `timeout`, delivers the
/// connection events queued for this iteration, fires every due timer and
/// then the delayed callbacks. Tests can also move the clock without
/// processing via [`SimEventLoop::advance`].
pub struct SimEventLoop {
    state: Mutex<EventLoopState>,
    clock: Mutex<SimClock>,
    timers: Mutex<TimerQueue>,
    delayed: Mutex<Vec<DelayedCallback>>,
    cm: Arc<SimConnectionManager>,
}

impl SimEventLoop {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(EventLoopState::Fresh),
            clock: Mutex::new(SimClock { wall_ms: SIM_WALL_ORIGIN_MS, mono_ms: 0 }),
            timers: Mutex::new(TimerQueue::new()),
            delayed: Mutex::new(Vec::new()),
            cm: Arc::new(SimConnectionManager::new()),
        })
    }

    /// The simulated connection manager, for scripting and assertions
    pub fn connection_manager(&self) -> Arc<SimConnectionManager> {
        Arc::clone(&self.cm)
    }

    /// Move both clocks forward without running callbacks
    pub fn advance(&self, duration: Duration) {
        let mut clock = self.clock.lock().unwrap_or_else(|e| e.into_inner());
        clock.wall_ms += duration.as_millis() as u64;
        clock.mono_ms += duration.as_millis() as u64;
    }

    fn timers_lock(&self) -> MutexGuard<'_, TimerQueue> {
        self.timers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn state_lock(&self) -> MutexGuard<'_, EventLoopState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl EventLoop for SimEventLoop {
    fn state(&self) -> EventLoopState {
        *self.state_lock()
    }

    fn start(&self) -> UaResult<()> {
        let mut state = self.state_lock();
        match *state {
            EventLoopState::Fresh | EventLoopState::Stopped => {
                *state = EventLoopState::Started;
                self.cm.set_state(EventSourceState::Started);
                Ok(())
            }
            EventLoopState::Started => Ok(()),
            EventLoopState::Stopping => Err(UaError::InvalidState {
                reason: "event loop is stopping".into(),
            }),
        }
    }

    fn stop(&self) {
        let mut state = self.state_lock();
        if *state == EventLoopState::Started {
            *state = EventLoopState::Stopping;
            self.cm.set_state(EventSourceState::Stopped);
            self.cm.queue_close_all();
        }
    }

    fn run(&self, timeout: Duration) -> UaResult<()> {
        match self.state() {
            EventLoopState::Started | EventLoopState::Stopping => {}
            EventLoopState::Fresh | EventLoopState::Stopped => {
                return Err(UaError::InvalidState {
                    reason: "event loop is not running".into(),
                })
            }
        }

        self.advance(timeout);

        // Network callbacks queued for this iteration
        for event in self.cm.drain_pending() {
            (event.callback)(event.connection_id, event.state, &event.params, &[]);
        }

        // Timed and cyclic callbacks
        let now = self.now_monotonic();
        let due = self.timers_lock().take_due(now);
        for mut timer in due {
            (timer.callback)();
            self.timers_lock().restore(timer);
        }

        // Delayed callbacks close the iteration
        let delayed = std::mem::take(&mut *self.delayed.lock().unwrap_or_else(|e| e.into_inner()));
        for callback in delayed {
            callback.invoke();
        }

        if self.state() == EventLoopState::Stopping
            && self.cm.connection_count() == 0
            && !self.cm.has_pending()
        {
            *self.state_lock() = EventLoopState::Stopped;
        }

        Ok(())
    }

    fn now(&self) -> Timestamp {
        Timestamp::from_millis(self.clock.lock().unwrap_or_else(|e| e.into_inner()).wall_ms)
    }

    fn now_monotonic(&self) -> Timestamp {
        Timestamp::from_millis(self.clock.lock().unwrap_or_else(|e| e.into_inner()).mono_ms)
    }

    fn next_cyclic_time(&self) -> Option<Timestamp> {
        self.timers_lock().next_deadline()
    }

    fn add_timed_callback(
        &self,
        callback: TimedCallback,
        deadline: Timestamp,
    ) -> UaResult<CallbackId> {
        Ok(self.timers_lock().add_timed(callback, deadline))
    }

    fn add_cyclic_callback(
        &self,
        callback: TimedCallback,
        interval: Duration,
        initial_deadline: Option<Timestamp>,
        miss_policy: CycleMissPolicy,
    ) -> UaResult<CallbackId> {
        let now = self.now_monotonic();
        Ok(self
            .timers_lock()
            .add_cyclic(callback, interval, initial_deadline, miss_policy, now))
    }

    fn modify_cyclic_callback(
        &self,
        id: CallbackId,
        interval: Duration,
        initial_deadline: Option<Timestamp>,
        miss_policy: CycleMissPolicy,
    ) -> UaResult<()> {
        let now = self.now_monotonic();
        self.timers_lock()
            .modify_cyclic(id, interval, initial_deadline, miss_policy, now)
    }

    fn remove_cyclic_callback(&self, id: CallbackId) {
        self.timers_lock().remove(id);
    }

    fn add_delayed_callback(&self, callback: DelayedCallback) {
        self.delayed.lock().unwrap_or_else(|e| e.into_inner()).push(callback);
    }

    fn connection_managers(&self) -> Vec<Arc<dyn ConnectionManager>> {
        vec![Arc::clone(&self.cm) as Arc<dyn ConnectionManager>]
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_manual_clock_advances_with_run() {
        let el = SimEventLoop::new();
        el.start().unwrap();
        let wall_before = el.now();
        let mono_before = el.now_monotonic();

        el.run(Duration::from_millis(250)).unwrap();
        assert_eq!(el.now().as_millis() - wall_before.as_millis(), 250);
        assert_eq!(el.now_monotonic().as_millis() - mono_before.as_millis(), 250);
    }

    #[test]
    fn test_cyclic_callback_fires_on_schedule() {
        let el = SimEventLoop::new();
        el.start().unwrap();

        let fired = Arc::new(AtomicU32::new(0));
        let fired_in_cb = Arc::clone(&fired);
        el.add_cyclic_callback(
            Box::new(move || {
                fired_in_cb.fetch_add(1, Ordering::SeqCst);
            }),
            Duration::from_millis(100),
            None,
            CycleMissPolicy::FireWithCurrentTime,
        )
        .unwrap();

        el.run(Duration::from_millis(99)).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        el.run(Duration::from_millis(1)).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        el.run(Duration::from_millis(100)).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_open_connection_delivers_events_on_next_run() {
        let el = SimEventLoop::new();
        el.start().unwrap();
        let cm = el.connection_manager();

        let states = Arc::new(Mutex::new(Vec::new()));
        let states_in_cb = Arc::clone(&states);
        let callback: NetworkCallback = Arc::new(move |_id, state, _params, _payload| {
            states_in_cb.lock().unwrap().push(state);
        });

        cm.open_connection(&ParameterMap::new(), callback).unwrap();
        assert!(states.lock().unwrap().is_empty());

        el.run(Duration::ZERO).unwrap();
        assert_eq!(
            *states.lock().unwrap(),
            vec![ConnectionState::Opening, ConnectionState::Established]
        );
    }

    #[test]
    fn test_stop_drains_connections() {
        let el = SimEventLoop::new();
        el.start().unwrap();
        let cm = el.connection_manager();
        cm.open_connection(&ParameterMap::new(), Arc::new(|_, _, _, _| {})).unwrap();
        el.run(Duration::ZERO).unwrap();
        assert_eq!(cm.connection_count(), 1);

        el.stop();
        el.run(Duration::ZERO).unwrap();
        assert_eq!(cm.connection_count(), 0);
        assert_eq!(el.state(), EventLoopState::Stopped);
    }
}
