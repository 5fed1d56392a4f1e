//! Optional subsystem capabilities
//!
//! Discovery, PubSub and the async operation manager are optional in a
//! deployed server. Instead of compile-time gates, each optional subsystem is
//! a capability object registered in the configuration; a build without a
//! capability simply has nothing registered. The server drives every
//! registered capability through the same lifecycle hooks.

use crate::errors::UaResult;
use crate::types::Timestamp;

/// Lifecycle hooks for an optional server subsystem
///
/// All hooks run under the server's service lock and must return promptly.
/// The default implementations are no-ops, so a capability only implements
/// the hooks it needs.
pub trait Subsystem: Send {
    /// Short name used in log messages
    fn name(&self) -> &str;

    /// Called once during server startup, before listeners open
    fn init(&mut self) -> UaResult<()> {
        Ok(())
    }

    /// Called from every main-loop iteration
    fn poll(&mut self) {}

    /// Called from the 1 Hz housekeeping callback with the monotonic now
    fn housekeeping(&mut self, _now: Timestamp) {}

    /// Called during server shutdown, after listeners close
    fn shutdown(&mut self) {}

    /// Called during server teardown; must release every held resource
    fn clear(&mut self) {}
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
