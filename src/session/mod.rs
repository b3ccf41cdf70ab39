//! Session bookkeeping: which requests are in flight for a session, and
//! whether its streaming transport is still attached. The session
//! identifier is the only cross-component key — the registry holds no
//! pointers into the Container Pool or Network Manager (spec.md §9).

use crate::pool::SessionActivity;
use crate::protocol::RequestId;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

struct SessionState {
    stream_open: AtomicBool,
    in_flight: DashMap<RequestId, ()>,
}

impl SessionState {
    fn new() -> Self {
        Self {
            stream_open: AtomicBool::new(true),
            in_flight: DashMap::new(),
        }
    }
}

/// Per-process registry of live sessions, keyed by session id.
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<SessionState>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    fn state(&self, session_id: &str) -> Arc<SessionState> {
        self.sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(SessionState::new()))
            .clone()
    }

    pub fn mark_stream_open(&self, session_id: &str) {
        self.state(session_id)
            .stream_open
            .store(true, Ordering::SeqCst);
    }

    pub fn mark_stream_closed(&self, session_id: &str) {
        if let Some(state) = self.sessions.get(session_id) {
            state.stream_open.store(false, Ordering::SeqCst);
        }
    }

    pub fn track_request(&self, session_id: &str, request_id: RequestId) {
        self.state(session_id).in_flight.insert(request_id, ());
    }

    pub fn untrack_request(&self, session_id: &str, request_id: &RequestId) {
        if let Some(state) = self.sessions.get(session_id) {
            state.in_flight.remove(request_id);
        }
    }

    /// Requests currently in flight for `session_id`, used by
    /// `onDisconnect` to know which ones to `stop`.
    pub fn in_flight_requests(&self, session_id: &str) -> Vec<RequestId> {
        self.sessions
            .get(session_id)
            .map(|state| state.in_flight.iter().map(|e| *e.key()).collect())
            .unwrap_or_default()
    }

    /// Mark the session's stream closed and return its in-flight requests
    /// so the orchestrator can `stop` each one before the session's
    /// containers and network are torn down.
    pub fn disconnect(&self, session_id: &str) -> Vec<RequestId> {
        let requests = self.in_flight_requests(session_id);
        self.mark_stream_closed(session_id);
        requests
    }

    pub fn forget(&self, session_id: &str) {
        self.sessions.remove(session_id);
    }

    /// All session ids currently tracked, for shutdown draining (spec.md
    /// §9): every one of them needs its containers and network destroyed.
    pub fn all_session_ids(&self) -> Vec<String> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionActivity for SessionRegistry {
    fn has_open_stream(&self, session_id: &str) -> bool {
        self.sessions
            .get(session_id)
            .is_some_and(|state| state.stream_open.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn new_session_has_no_open_stream_until_marked() {
        let registry = SessionRegistry::new();
        assert!(!registry.has_open_stream("s1"));
        registry.mark_stream_open("s1");
        assert!(registry.has_open_stream("s1"));
    }

    #[test]
    fn disconnect_returns_in_flight_requests_and_closes_stream() {
        let registry = SessionRegistry::new();
        registry.mark_stream_open("s1");
        let r1 = Uuid::new_v4();
        let r2 = Uuid::new_v4();
        registry.track_request("s1", r1);
        registry.track_request("s1", r2);

        let mut in_flight = registry.disconnect("s1");
        in_flight.sort();
        let mut expected = vec![r1, r2];
        expected.sort();
        assert_eq!(in_flight, expected);
        assert!(!registry.has_open_stream("s1"));
    }

    #[test]
    fn untrack_removes_a_single_request() {
        let registry = SessionRegistry::new();
        let r1 = Uuid::new_v4();
        registry.track_request("s1", r1);
        registry.untrack_request("s1", &r1);
        assert!(registry.in_flight_requests("s1").is_empty());
    }
}
