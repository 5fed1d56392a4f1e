//! Tokio-backed event loop
//!
//! A single-threaded scheduler over a tokio current-thread runtime. Socket
//! tasks only make progress while [`TokioEventLoop::run`] pumps the runtime,
//! so timed callbacks, network callbacks and delayed callbacks all execute
//! on the caller's thread, serialized with each other.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;

use uaserve_core::errors::{UaError, UaResult};
use uaserve_core::eventloop::{
    CallbackId, ConnectionManager, CycleMissPolicy, DelayedCallback, EventLoop, EventLoopState,
    EventSourceState, TimedCallback,
};
use uaserve_core::types::Timestamp;

use crate::tcp::{NetEvent, TcpConnectionManager};
use crate::timer::TimerQueue;

// ----------------------------------------------------------------------------
// Tokio Event Loop
// ----------------------------------------------------------------------------

/// The default event loop: timers, delayed callbacks and a TCP connection
/// manager over a current-thread tokio runtime
pub struct TokioEventLoop {
    state: Mutex<EventLoopState>,
    timers: Mutex<TimerQueue>,
    delayed: Mutex<Vec<DelayedCallback>>,
    net_rx: Mutex<mpsc::UnboundedReceiver<NetEvent>>,
    rt: tokio::runtime::Runtime,
    origin: Instant,
    tcp: Arc<TcpConnectionManager>,
}

impl TokioEventLoop {
    /// Build an event loop with its TCP connection manager
    pub fn new() -> UaResult<Arc<Self>> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let (net_tx, net_rx) = mpsc::unbounded_channel();
        let tcp = Arc::new(TcpConnectionManager::new(net_tx, rt.handle().clone()));
        Ok(Arc::new(Self {
            state: Mutex::new(EventLoopState::Fresh),
            timers: Mutex::new(TimerQueue::new()),
            delayed: Mutex::new(Vec::new()),
            net_rx: Mutex::new(net_rx),
            rt,
            origin: Instant::now(),
            tcp,
        }))
    }

    fn state_lock(&self) -> std::sync::MutexGuard<'_, EventLoopState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn timers_lock(&self) -> std::sync::MutexGuard<'_, TimerQueue> {
        self.timers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Wait for network events, at most until `wait` elapses
    fn collect_net_events(&self, wait: Duration) -> Vec<NetEvent> {
        let mut events = Vec::new();
        let mut rx = self.net_rx.lock().unwrap_or_else(|e| e.into_inner());
        self.rt.block_on(async {
            if wait.is_zero() {
                // Give the socket tasks a few scheduling slots, then drain
                for _ in 0..4 {
                    tokio::task::yield_now().await;
                }
            } else if let Ok(Some(event)) =
                tokio::time::timeout(wait, rx.recv()).await
            {
                events.push(event);
            }
            while let Ok(event) = rx.try_recv() {
                events.push(event);
            }
        });
        events
    }

    fn dispatch(&self, events: Vec<NetEvent>) {
        for event in events {
            (event.callback)(event.connection_id, event.state, &event.params, &event.payload);
        }
    }
}

impl EventLoop for TokioEventLoop {
    fn state(&self) -> EventLoopState {
        *self.state_lock()
    }

    fn start(&self) -> UaResult<()> {
        let mut state = self.state_lock();
        match *state {
            EventLoopState::Fresh | EventLoopState::Stopped => {
                *state = EventLoopState::Started;
                self.tcp.set_state(EventSourceState::Started);
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
            self.tcp.set_state(EventSourceState::Stopped);
            self.tcp.close_all();
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

        // Wait no longer than the next timer deadline
        let now = self.now_monotonic();
        let wait = match self.timers_lock().next_deadline() {
            Some(deadline) => {
                Duration::from_millis(now.millis_until(deadline)).min(timeout)
            }
            None => timeout,
        };

        let events = self.collect_net_events(wait);
        self.dispatch(events);

        // Timed and cyclic callbacks, invoked outside the queue lock
        let due = {
            let now = self.now_monotonic();
            self.timers_lock().take_due(now)
        };
        for mut timer in due {
            (timer.callback)();
            self.timers_lock().restore(timer);
        }

        // Delayed callbacks fire after everything else in the iteration
        let delayed = std::mem::take(&mut *self.delayed.lock().unwrap_or_else(|e| e.into_inner()));
        for callback in delayed {
            callback.invoke();
        }

        if self.state() == EventLoopState::Stopping {
            // Flush close confirmations still queued by released connections
            let events = self.collect_net_events(Duration::ZERO);
            self.dispatch(events);
            if self.tcp.connection_count() == 0 {
                *self.state_lock() = EventLoopState::Stopped;
            }
        }

        Ok(())
    }

    fn now(&self) -> Timestamp {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp::from_millis(since_epoch.as_millis() as u64)
    }

    fn now_monotonic(&self) -> Timestamp {
        Timestamp::from_millis(self.origin.elapsed().as_millis() as u64)
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
        vec![Arc::clone(&self.tcp) as Arc<dyn ConnectionManager>]
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
