//! Timed-callback façade
//!
//! Thin wrapper mapping server-scoped callbacks onto the event loop. The
//! registered closures receive a live [`Server`] handle; once the server is
//! gone they degrade to no-ops. Public entrypoints serialize on the service
//! lock; `_locked` variants exist for internal callers already inside it.

use std::time::Duration;

use uaserve_core::errors::UaResult;
use uaserve_core::eventloop::{CallbackId, CycleMissPolicy, TimedCallback};
use uaserve_core::types::Timestamp;

use crate::server::Server;

impl Server {
    /// Register a one-shot callback at an absolute monotonic deadline
    pub fn add_timed_callback<F>(&self, deadline: Timestamp, callback: F) -> UaResult<CallbackId>
    where
        F: FnMut(&Server) + Send + 'static,
    {
        let _core = self.core();
        self.event_loop()
            .add_timed_callback(self.wrap_callback(callback), deadline)
    }

    /// Register a repeating callback with a millisecond interval
    ///
    /// Missed cycles fire once with the current time instead of bursting
    /// through the backlog.
    pub fn add_repeated_callback<F>(&self, interval: Duration, callback: F) -> UaResult<CallbackId>
    where
        F: FnMut(&Server) + Send + 'static,
    {
        let _core = self.core();
        self.add_repeated_callback_locked(interval, callback)
    }

    pub(crate) fn add_repeated_callback_locked<F>(
        &self,
        interval: Duration,
        callback: F,
    ) -> UaResult<CallbackId>
    where
        F: FnMut(&Server) + Send + 'static,
    {
        self.event_loop().add_cyclic_callback(
            self.wrap_callback(callback),
            interval,
            None,
            CycleMissPolicy::FireWithCurrentTime,
        )
    }

    /// Change the interval of a repeated callback
    pub fn change_repeated_callback_interval(
        &self,
        callback_id: CallbackId,
        interval: Duration,
    ) -> UaResult<()> {
        let _core = self.core();
        self.event_loop().modify_cyclic_callback(
            callback_id,
            interval,
            None,
            CycleMissPolicy::FireWithCurrentTime,
        )
    }

    /// Deregister a timed or repeated callback
    pub fn remove_callback(&self, callback_id: CallbackId) {
        let _core = self.core();
        self.remove_callback_locked(callback_id);
    }

    pub(crate) fn remove_callback_locked(&self, callback_id: CallbackId) {
        self.event_loop().remove_cyclic_callback(callback_id);
    }

    /// Adapt a server-scoped closure to the event loop's callback type
    fn wrap_callback<F>(&self, mut callback: F) -> TimedCallback
    where
        F: FnMut(&Server) + Send + 'static,
    {
        let weak = self.downgrade();
        Box::new(move || {
            if let Some(server) = weak.upgrade() {
                callback(&server);
            }
        })
    }
}
