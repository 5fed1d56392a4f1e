//! Secure channel registry
//!
//! Owns the secure channel table, expires channels against their token
//! lifetime and keeps the channel counters. The cryptographic handshake is a
//! collaborator; entries here track the state, the backing transport
//! connection and the security policy each channel is bound to.

use std::collections::HashMap;
use std::time::Duration;

use uaserve_core::config::ServerLimits;
use uaserve_core::eventloop::ConnectionId;
use uaserve_core::types::Timestamp;

use super::session::DiagnosticEvent;

/// Identifier of a secure channel; assigned from a counter starting at 1
pub type ChannelId = u32;

// ----------------------------------------------------------------------------
// Secure Channels
// ----------------------------------------------------------------------------

/// Connection state of a secure channel
///
/// Reverse-connect entries reuse these states for their own lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecureChannelState {
    Closed,
    Connecting,
    Connected,
}

/// One secure channel
#[derive(Debug, Clone)]
pub struct SecureChannel {
    pub channel_id: ChannelId,
    pub state: SecureChannelState,
    /// URI of the security policy negotiated for this channel
    pub security_policy_uri: String,
    /// Monotonic deadline of the current security token
    pub valid_till: Timestamp,
    /// Transport connection backing the channel
    pub connection_id: Option<ConnectionId>,
}

/// Secure channel diagnostics counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SecureChannelStatistics {
    pub current_channel_count: u64,
    pub cumulated_channel_count: u64,
    pub rejected_channel_count: u64,
    pub channel_timeout_count: u64,
    pub channel_abort_count: u64,
    pub channel_purge_count: u64,
}

// ----------------------------------------------------------------------------
// Secure Channel Manager
// ----------------------------------------------------------------------------

/// Owns every secure channel, keyed by channel id
#[derive(Debug)]
pub struct SecureChannelManager {
    channels: HashMap<ChannelId, SecureChannel>,
    next_channel_id: ChannelId,
    lifetime: Duration,
    statistics: SecureChannelStatistics,
}

impl SecureChannelManager {
    /// Create an empty registry with the configured token lifetime
    pub fn new(limits: &ServerLimits) -> Self {
        Self {
            channels: HashMap::new(),
            next_channel_id: 1,
            lifetime: limits.secure_channel_lifetime,
            statistics: SecureChannelStatistics::default(),
        }
    }

    /// Open a channel over `connection_id` with the given security policy
    pub fn open_channel(
        &mut self,
        security_policy_uri: impl Into<String>,
        now: Timestamp,
        connection_id: Option<ConnectionId>,
    ) -> &SecureChannel {
        let channel_id = self.next_channel_id;
        self.next_channel_id += 1;
        self.statistics.cumulated_channel_count += 1;

        let channel = SecureChannel {
            channel_id,
            state: SecureChannelState::Connected,
            security_policy_uri: security_policy_uri.into(),
            valid_till: now.saturating_add(self.lifetime),
            connection_id,
        };
        self.channels.entry(channel_id).or_insert(channel)
    }

    /// Look up a channel
    pub fn get(&self, channel_id: ChannelId) -> Option<&SecureChannel> {
        self.channels.get(&channel_id)
    }

    /// Shut a channel down, attributing the close to `event`
    pub fn shutdown_channel(
        &mut self,
        channel_id: ChannelId,
        event: DiagnosticEvent,
    ) -> Option<SecureChannel> {
        let removed = self.channels.remove(&channel_id);
        if removed.is_some() {
            match event {
                DiagnosticEvent::Timeout => self.statistics.channel_timeout_count += 1,
                DiagnosticEvent::Abort => self.statistics.channel_abort_count += 1,
                DiagnosticEvent::Purge => self.statistics.channel_purge_count += 1,
                DiagnosticEvent::Reject | DiagnosticEvent::SecurityReject => {
                    self.statistics.rejected_channel_count += 1
                }
                DiagnosticEvent::Close => {}
            }
        }
        removed
    }

    /// Shut down the channel backed by a transport connection
    pub fn shutdown_by_connection(
        &mut self,
        connection_id: ConnectionId,
        event: DiagnosticEvent,
    ) -> Option<SecureChannel> {
        let id = self
            .channels
            .values()
            .find(|c| c.connection_id == Some(connection_id))
            .map(|c| c.channel_id)?;
        self.shutdown_channel(id, event)
    }

    /// Expire every channel whose token lifetime has passed
    pub fn cleanup_timed_out(&mut self, now: Timestamp) {
        let expired: Vec<ChannelId> = self
            .channels
            .values()
            .filter(|c| c.valid_till <= now)
            .map(|c| c.channel_id)
            .collect();
        for id in expired {
            self.shutdown_channel(id, DiagnosticEvent::Timeout);
        }
    }

    /// Shut down every channel
    pub fn close_all(&mut self, event: DiagnosticEvent) {
        let ids: Vec<ChannelId> = self.channels.keys().copied().collect();
        for id in ids {
            self.shutdown_channel(id, event);
        }
    }

    /// All channels, in no particular order
    pub fn channels(&self) -> impl Iterator<Item = &SecureChannel> {
        self.channels.values()
    }

    /// Number of open channels
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// Whether no channel is open
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Diagnostics snapshot; the current count is derived from the registry
    pub fn statistics(&self) -> SecureChannelStatistics {
        SecureChannelStatistics {
            current_channel_count: self.channels.len() as u64,
            ..self.statistics
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> SecureChannelManager {
        SecureChannelManager::new(&ServerLimits::default())
    }

    #[test]
    fn test_channel_ids_start_at_one() {
        let mut mgr = manager();
        let now = Timestamp::from_millis(0);
        let first = mgr.open_channel("sp", now, Some(10)).channel_id;
        let second = mgr.open_channel("sp", now, Some(11)).channel_id;
        assert_eq!(first, 1);
        assert_eq!(second, 2);
        assert_eq!(mgr.statistics().cumulated_channel_count, 2);
    }

    #[test]
    fn test_cleanup_expires_overdue_tokens() {
        let limits = ServerLimits {
            secure_channel_lifetime: Duration::from_secs(10),
            ..ServerLimits::default()
        };
        let mut mgr = SecureChannelManager::new(&limits);
        let id = mgr.open_channel("sp", Timestamp::from_millis(0), None).channel_id;

        mgr.cleanup_timed_out(Timestamp::from_millis(5_000));
        assert!(mgr.get(id).is_some());

        mgr.cleanup_timed_out(Timestamp::from_millis(10_000));
        assert!(mgr.get(id).is_none());
        assert_eq!(mgr.statistics().channel_timeout_count, 1);
    }

    #[test]
    fn test_shutdown_by_connection() {
        let mut mgr = manager();
        let now = Timestamp::from_millis(0);
        mgr.open_channel("sp", now, Some(42));
        mgr.open_channel("sp", now, Some(43));

        let removed = mgr.shutdown_by_connection(42, DiagnosticEvent::Abort).unwrap();
        assert_eq!(removed.connection_id, Some(42));
        assert_eq!(mgr.len(), 1);
        assert_eq!(mgr.statistics().channel_abort_count, 1);
        assert!(mgr.shutdown_by_connection(42, DiagnosticEvent::Abort).is_none());
    }

    #[test]
    fn test_close_all() {
        let mut mgr = manager();
        let now = Timestamp::from_millis(0);
        mgr.open_channel("sp", now, None);
        mgr.open_channel("sp", now, None);
        mgr.close_all(DiagnosticEvent::Close);
        assert!(mgr.is_empty());
        assert_eq!(mgr.statistics().current_channel_count, 0);
    }
}
