//! Session registry
//!
//! Owns all authenticated sessions by their authentication token, expires
//! them against their `valid_till` deadline and keeps the diagnostics
//! counters reported through the statistics snapshot.

use std::collections::HashMap;
use std::time::Duration;

use rand::RngCore;
use uuid::Uuid;

use uaserve_core::config::ServerLimits;
use uaserve_core::errors::{UaError, UaResult};
use uaserve_core::types::{NodeId, Timestamp};

use super::channel::ChannelId;

// ----------------------------------------------------------------------------
// Sessions
// ----------------------------------------------------------------------------

/// Reason a session or channel was taken down, mirrored into diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticEvent {
    Close,
    Reject,
    SecurityReject,
    Timeout,
    Abort,
    Purge,
}

/// One authenticated conversation
#[derive(Debug, Clone)]
pub struct Session {
    /// GUID node id identifying the session
    pub session_id: NodeId,
    /// Token the client presents on each request; registry key
    pub authentication_token: NodeId,
    /// Human-readable session name
    pub name: String,
    /// Monotonic expiry deadline
    pub valid_till: Timestamp,
    /// Secure channel the session is bound to, if any
    pub channel_id: Option<ChannelId>,
}

impl Session {
    /// The administrative sentinel session: deterministic identity, never
    /// expires, used to drive internal calls without authentication
    pub fn admin() -> Self {
        Self {
            session_id: NodeId::guid(0, Uuid::from_fields(1, 0, 0, &[0u8; 8])),
            authentication_token: NodeId::numeric(0, 0),
            name: "Administrator".to_string(),
            valid_till: Timestamp::MAX,
            channel_id: None,
        }
    }
}

// ----------------------------------------------------------------------------
// Statistics
// ----------------------------------------------------------------------------

/// Session diagnostics counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStatistics {
    pub current_session_count: u64,
    pub cumulated_session_count: u64,
    pub security_rejected_session_count: u64,
    pub rejected_session_count: u64,
    pub session_timeout_count: u64,
    pub session_abort_count: u64,
}

// ----------------------------------------------------------------------------
// Session Manager
// ----------------------------------------------------------------------------

/// Owns every client session, keyed by authentication token
#[derive(Debug)]
pub struct SessionManager {
    sessions: HashMap<NodeId, Session>,
    next_token: u32,
    max_sessions: usize,
    session_timeout: Duration,
    statistics: SessionStatistics,
}

impl SessionManager {
    /// Create an empty registry with the configured limits
    pub fn new(limits: &ServerLimits) -> Self {
        Self {
            sessions: HashMap::new(),
            next_token: 1,
            max_sessions: limits.max_sessions,
            session_timeout: limits.session_timeout,
            statistics: SessionStatistics::default(),
        }
    }

    /// Create a session bound to `channel_id`
    ///
    /// The session id is a random GUID in the server's namespace; the
    /// authentication token is issued from a monotonic counter.
    pub fn create_session(
        &mut self,
        rng: &mut dyn RngCore,
        channel_id: Option<ChannelId>,
        name: impl Into<String>,
        now: Timestamp,
    ) -> UaResult<&Session> {
        if self.sessions.len() >= self.max_sessions {
            self.statistics.rejected_session_count += 1;
            return Err(UaError::internal("maximum session count reached"));
        }

        let mut guid = [0u8; 16];
        rng.fill_bytes(&mut guid);
        let token = NodeId::numeric(0, self.next_token);
        self.next_token += 1;

        let session = Session {
            session_id: NodeId::guid(1, Uuid::from_bytes(guid)),
            authentication_token: token.clone(),
            name: name.into(),
            valid_till: now.saturating_add(self.session_timeout),
            channel_id,
        };
        self.statistics.cumulated_session_count += 1;
        Ok(self.sessions.entry(token).or_insert(session))
    }

    /// Look up a session by its authentication token
    pub fn get_by_token(&self, token: &NodeId) -> Option<&Session> {
        self.sessions.get(token)
    }

    /// Extend a session's lifetime from `now`
    pub fn touch(&mut self, token: &NodeId, now: Timestamp) -> UaResult<()> {
        let session = self.sessions.get_mut(token).ok_or(UaError::NotFound)?;
        session.valid_till = now.saturating_add(self.session_timeout);
        Ok(())
    }

    /// Remove a session, attributing the removal to `event`
    pub fn remove_by_token(&mut self, token: &NodeId, event: DiagnosticEvent) -> Option<Session> {
        let removed = self.sessions.remove(token);
        if removed.is_some() {
            match event {
                DiagnosticEvent::Timeout => self.statistics.session_timeout_count += 1,
                DiagnosticEvent::Abort => self.statistics.session_abort_count += 1,
                DiagnosticEvent::Reject => self.statistics.rejected_session_count += 1,
                DiagnosticEvent::SecurityReject => {
                    self.statistics.security_rejected_session_count += 1
                }
                DiagnosticEvent::Close | DiagnosticEvent::Purge => {}
            }
        }
        removed
    }

    /// Expire every session whose deadline has passed
    pub fn cleanup(&mut self, now: Timestamp) {
        let expired: Vec<NodeId> = self
            .sessions
            .values()
            .filter(|s| s.valid_till <= now)
            .map(|s| s.authentication_token.clone())
            .collect();
        for token in expired {
            self.remove_by_token(&token, DiagnosticEvent::Timeout);
        }
    }

    /// Remove every session, attributing the removals to `event`
    pub fn remove_all(&mut self, event: DiagnosticEvent) {
        let tokens: Vec<NodeId> = self.sessions.keys().cloned().collect();
        for token in tokens {
            self.remove_by_token(&token, event);
        }
    }

    /// All sessions, in no particular order
    pub fn sessions(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    /// Number of live sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no session is registered
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Diagnostics snapshot; the current count is derived from the registry
    pub fn statistics(&self) -> SessionStatistics {
        SessionStatistics {
            current_session_count: self.sessions.len() as u64,
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
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn manager() -> (SessionManager, StdRng) {
        (SessionManager::new(&ServerLimits::default()), StdRng::seed_from_u64(7))
    }

    #[test]
    fn test_create_and_lookup() {
        let (mut mgr, mut rng) = manager();
        let now = Timestamp::from_millis(1_000);
        let token = mgr
            .create_session(&mut rng, Some(1), "client-a", now)
            .unwrap()
            .authentication_token
            .clone();

        assert_eq!(mgr.len(), 1);
        let session = mgr.get_by_token(&token).unwrap();
        assert_eq!(session.name, "client-a");
        assert_eq!(session.channel_id, Some(1));
        assert!(session.valid_till > now);
        assert_eq!(mgr.statistics().cumulated_session_count, 1);
    }

    #[test]
    fn test_cleanup_expires_only_overdue() {
        let (mut mgr, mut rng) = manager();
        let now = Timestamp::from_millis(1_000);
        let t1 = mgr.create_session(&mut rng, None, "a", now).unwrap().authentication_token.clone();
        let t2 = mgr.create_session(&mut rng, None, "b", now).unwrap().authentication_token.clone();
        mgr.touch(&t2, Timestamp::from_millis(100_000)).unwrap();

        mgr.cleanup(Timestamp::from_millis(90_000));
        assert!(mgr.get_by_token(&t1).is_none());
        assert!(mgr.get_by_token(&t2).is_some());
        assert_eq!(mgr.statistics().session_timeout_count, 1);
        assert_eq!(mgr.statistics().current_session_count, 1);
    }

    #[test]
    fn test_max_sessions_rejects() {
        let limits = ServerLimits { max_sessions: 1, ..ServerLimits::default() };
        let mut mgr = SessionManager::new(&limits);
        let mut rng = StdRng::seed_from_u64(7);
        let now = Timestamp::from_millis(0);

        mgr.create_session(&mut rng, None, "a", now).unwrap();
        assert!(mgr.create_session(&mut rng, None, "b", now).is_err());
        assert_eq!(mgr.statistics().rejected_session_count, 1);
    }

    #[test]
    fn test_admin_session_identity() {
        let admin = Session::admin();
        assert_eq!(admin.valid_till, Timestamp::MAX);
        assert_eq!(admin.session_id.to_string(), "ns=0;g=00000001-0000-0000-0000-000000000000");
    }
}
