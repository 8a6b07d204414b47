//! Session relay store.
//!
//! In-memory state behind the relay service: participant registries, frozen
//! committees, completion marks, per-recipient message queues, setup
//! messages and published keysign results. The store never reads message
//! bodies; everything it holds is ciphertext or plain party identifiers.
//! Expired state is dropped by a periodic cleanup sweep.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use thiserror::Error;
use tss_core::{PartyId, RelayMessage, SessionId, SignatureRecord};

/// Relay error types
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Session not found: {0}")]
    SessionNotFound(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, RelayError>;

/// Scope separating keysign traffic (one scope per in-flight message) from
/// keygen traffic (empty scope)
fn scope(message_id: Option<&str>) -> String {
    message_id.unwrap_or("").to_string()
}

#[derive(Debug, Clone)]
struct StoredMessage {
    message: RelayMessage,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct SessionRecord {
    parties: Vec<PartyId>,
    last_touched: DateTime<Utc>,
}

/// Shared relay state, cheap to clone across axum handlers
#[derive(Clone)]
pub struct RelayStore {
    sessions: Arc<DashMap<SessionId, SessionRecord>>,
    started: Arc<DashMap<SessionId, Vec<PartyId>>>,
    completed: Arc<DashMap<SessionId, Vec<PartyId>>>,
    /// Keyed by (session, recipient, scope); one copy per recipient
    messages: Arc<DashMap<(SessionId, PartyId, String), Vec<StoredMessage>>>,
    setup: Arc<DashMap<(SessionId, String), String>>,
    keysign_done: Arc<DashMap<(SessionId, String), SignatureRecord>>,
    ttl_seconds: i64,
}

impl RelayStore {
    pub fn new(ttl_seconds: i64) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            started: Arc::new(DashMap::new()),
            completed: Arc::new(DashMap::new()),
            messages: Arc::new(DashMap::new()),
            setup: Arc::new(DashMap::new()),
            keysign_done: Arc::new(DashMap::new()),
            ttl_seconds,
        }
    }

    /// Register parties in a session. Creates the session on first contact,
    /// appends unseen parties afterwards.
    pub fn register(&self, session_id: &str, parties: &[PartyId]) {
        let now = Utc::now();
        let mut record = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionRecord {
                parties: Vec::new(),
                last_touched: now,
            });
        record.last_touched = now;
        for party in parties {
            if !record.parties.contains(party) {
                record.parties.push(party.clone());
            }
        }
    }

    /// Registered parties, in registration order. Unknown sessions are an
    /// error so the HTTP surface can answer 404.
    pub fn participants(&self, session_id: &str) -> Result<Vec<PartyId>> {
        self.sessions
            .get(session_id)
            .map(|r| r.parties.clone())
            .ok_or_else(|| RelayError::SessionNotFound(session_id.to_string()))
    }

    /// Freeze the committee and mark the session started. First write wins;
    /// a second start is ignored so the committee cannot change.
    pub fn start(&self, session_id: &str, committee: Vec<PartyId>) {
        self.touch(session_id);
        self.started
            .entry(session_id.to_string())
            .or_insert(committee);
    }

    /// The frozen committee, or `None` while not started.
    pub fn started_committee(&self, session_id: &str) -> Option<Vec<PartyId>> {
        self.started.get(session_id).map(|c| c.clone())
    }

    /// Record a party's completion mark. Append-only and idempotent.
    pub fn complete(&self, session_id: &str, parties: &[PartyId]) {
        self.touch(session_id);
        let mut done = self
            .completed
            .entry(session_id.to_string())
            .or_default();
        for party in parties {
            if !done.contains(party) {
                done.push(party.clone());
            }
        }
    }

    pub fn completed(&self, session_id: &str) -> Vec<PartyId> {
        self.completed
            .get(session_id)
            .map(|d| d.clone())
            .unwrap_or_default()
    }

    /// Store one copy of the message for each recipient.
    pub fn post_message(&self, message_id: Option<&str>, message: &RelayMessage) {
        self.touch(&message.session_id);
        let expires_at = Utc::now() + Duration::seconds(self.ttl_seconds);
        let scope = scope(message_id);
        for recipient in &message.to {
            let key = (
                message.session_id.clone(),
                recipient.clone(),
                scope.clone(),
            );
            self.messages.entry(key).or_default().push(StoredMessage {
                message: message.clone(),
                expires_at,
            });
        }
    }

    /// Unexpired messages addressed to `party_id`, oldest first.
    pub fn fetch_messages(
        &self,
        session_id: &str,
        party_id: &str,
        message_id: Option<&str>,
    ) -> Vec<RelayMessage> {
        let now = Utc::now();
        let key = (
            session_id.to_string(),
            party_id.to_string(),
            scope(message_id),
        );
        self.messages
            .get(&key)
            .map(|queue| {
                queue
                    .iter()
                    .filter(|m| m.expires_at > now)
                    .map(|m| m.message.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Remove an applied message from one recipient's queue.
    pub fn delete_message(
        &self,
        session_id: &str,
        party_id: &str,
        hash: &str,
        message_id: Option<&str>,
    ) {
        let key = (
            session_id.to_string(),
            party_id.to_string(),
            scope(message_id),
        );
        if let Some(mut queue) = self.messages.get_mut(&key) {
            queue.retain(|m| m.message.hash != hash);
        }
    }

    pub fn put_setup_message(&self, session_id: &str, message_id: Option<&str>, body: String) {
        self.touch(session_id);
        self.setup
            .insert((session_id.to_string(), scope(message_id)), body);
    }

    pub fn setup_message(&self, session_id: &str, message_id: Option<&str>) -> Option<String> {
        self.setup
            .get(&(session_id.to_string(), scope(message_id)))
            .map(|b| b.clone())
    }

    /// Publish the signature produced for one keysign message. First write
    /// wins so every party reads the same record.
    pub fn put_keysign_complete(
        &self,
        session_id: &str,
        message_id: &str,
        signature: SignatureRecord,
    ) {
        self.touch(session_id);
        self.keysign_done
            .entry((session_id.to_string(), message_id.to_string()))
            .or_insert(signature);
    }

    pub fn keysign_complete(&self, session_id: &str, message_id: &str) -> Option<SignatureRecord> {
        self.keysign_done
            .get(&(session_id.to_string(), message_id.to_string()))
            .map(|s| s.clone())
    }

    /// Drop everything the relay holds for a session.
    pub fn delete_session(&self, session_id: &str) {
        self.sessions.remove(session_id);
        self.started.remove(session_id);
        self.completed.remove(session_id);
        self.messages.retain(|(sid, _, _), _| sid != session_id);
        self.setup.retain(|(sid, _), _| sid != session_id);
        self.keysign_done.retain(|(sid, _), _| sid != session_id);
    }

    /// Drop expired messages and sessions idle past the TTL.
    pub fn cleanup(&self) {
        let now = Utc::now();
        self.messages.retain(|_, queue| {
            queue.retain(|m| m.expires_at > now);
            !queue.is_empty()
        });
        let cutoff = now - Duration::seconds(self.ttl_seconds);
        let stale: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|entry| entry.last_touched < cutoff)
            .map(|entry| entry.key().clone())
            .collect();
        for session_id in stale {
            self.delete_session(&session_id);
        }
    }

    /// Number of live sessions, for the health endpoint.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn touch(&self, session_id: &str) {
        if let Some(mut record) = self.sessions.get_mut(session_id) {
            record.last_touched = Utc::now();
        }
    }
}

impl Default for RelayStore {
    fn default() -> Self {
        Self::new(300)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(session: &str, from: &str, to: &[&str], hash: &str) -> RelayMessage {
        RelayMessage {
            session_id: session.into(),
            from: from.into(),
            to: to.iter().map(|p| p.to_string()).collect(),
            body: "ciphertext".into(),
            hash: hash.into(),
            sequence_no: 1,
        }
    }

    #[test]
    fn registration_dedupes_and_preserves_order() {
        let store = RelayStore::default();
        store.register("s1", &["a".into()]);
        store.register("s1", &["b".into(), "a".into()]);
        assert_eq!(store.participants("s1").unwrap(), vec!["a", "b"]);
        assert!(matches!(
            store.participants("missing"),
            Err(RelayError::SessionNotFound(_))
        ));
    }

    #[test]
    fn start_is_first_write_wins() {
        let store = RelayStore::default();
        assert!(store.started_committee("s1").is_none());
        store.start("s1", vec!["a".into(), "b".into()]);
        store.start("s1", vec!["a".into(), "b".into(), "c".into()]);
        assert_eq!(store.started_committee("s1").unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn messages_are_stored_per_recipient() {
        let store = RelayStore::default();
        store.post_message(None, &message("s1", "a", &["b", "c"], "h1"));

        assert_eq!(store.fetch_messages("s1", "b", None).len(), 1);
        assert_eq!(store.fetch_messages("s1", "c", None).len(), 1);
        assert!(store.fetch_messages("s1", "a", None).is_empty());

        // deleting b's copy leaves c's intact
        store.delete_message("s1", "b", "h1", None);
        assert!(store.fetch_messages("s1", "b", None).is_empty());
        assert_eq!(store.fetch_messages("s1", "c", None).len(), 1);
    }

    #[test]
    fn message_scopes_are_isolated() {
        let store = RelayStore::default();
        store.post_message(None, &message("s1", "a", &["b"], "h1"));
        store.post_message(Some("mid-1"), &message("s1", "a", &["b"], "h2"));

        let keygen = store.fetch_messages("s1", "b", None);
        assert_eq!(keygen.len(), 1);
        assert_eq!(keygen[0].hash, "h1");
        let keysign = store.fetch_messages("s1", "b", Some("mid-1"));
        assert_eq!(keysign.len(), 1);
        assert_eq!(keysign[0].hash, "h2");
    }

    #[test]
    fn keysign_completion_is_first_write_wins() {
        let store = RelayStore::default();
        let sig = SignatureRecord {
            msg: "aa".into(),
            r: "11".into(),
            s: "22".into(),
            recovery_id: "00".into(),
            der_signature: "der".into(),
        };
        store.put_keysign_complete("s1", "mid-1", sig.clone());
        let mut other = sig.clone();
        other.r = "33".into();
        store.put_keysign_complete("s1", "mid-1", other);
        assert_eq!(store.keysign_complete("s1", "mid-1").unwrap(), sig);
    }

    #[test]
    fn delete_session_drops_all_state() {
        let store = RelayStore::default();
        store.register("s1", &["a".into()]);
        store.start("s1", vec!["a".into()]);
        store.complete("s1", &["a".into()]);
        store.post_message(None, &message("s1", "a", &["b"], "h1"));
        store.put_setup_message("s1", None, "setup".into());

        store.delete_session("s1");
        assert!(store.participants("s1").is_err());
        assert!(store.started_committee("s1").is_none());
        assert!(store.completed("s1").is_empty());
        assert!(store.fetch_messages("s1", "b", None).is_empty());
        assert!(store.setup_message("s1", None).is_none());
        assert_eq!(store.session_count(), 0);
    }

    #[test]
    fn cleanup_drops_expired_messages() {
        let store = RelayStore::new(-1); // everything is born expired
        store.register("s1", &["a".into()]);
        store.post_message(None, &message("s1", "a", &["b"], "h1"));
        assert!(store.fetch_messages("s1", "b", None).is_empty());

        store.cleanup();
        assert_eq!(store.session_count(), 0);
    }
}
