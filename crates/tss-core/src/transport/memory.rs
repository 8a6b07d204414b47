//! In-memory relay transport for local testing.
//!
//! Shared by cloning; all parties in a test hold the same instance and the
//! maps play the role of the relay server's stores.

use super::{async_trait, RelayTransport};
use crate::{PartyId, RelayMessage, Result, SignatureRecord};
use dashmap::DashMap;
use std::sync::Arc;

fn scope(message_id: Option<&str>) -> String {
    message_id.unwrap_or("").to_string()
}

/// In-memory relay state shared between simulated parties
#[derive(Clone, Default)]
pub struct MemoryTransport {
    /// session -> registered parties
    sessions: Arc<DashMap<String, Vec<PartyId>>>,
    /// session -> frozen committee
    started: Arc<DashMap<String, Vec<PartyId>>>,
    /// session -> completed parties
    completed: Arc<DashMap<String, Vec<PartyId>>>,
    /// (session, recipient, message-id scope) -> pending messages
    messages: Arc<DashMap<(String, String, String), Vec<RelayMessage>>>,
    /// (session, message-id scope) -> encrypted setup message
    setup: Arc<DashMap<(String, String), String>>,
    /// (session, message id) -> adopted signature
    keysign_done: Arc<DashMap<(String, String), SignatureRecord>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RelayTransport for MemoryTransport {
    async fn register_party(&self, session_id: &str, party_id: &str) -> Result<()> {
        let mut entry = self.sessions.entry(session_id.to_string()).or_default();
        if !entry.iter().any(|p| p == party_id) {
            entry.push(party_id.to_string());
        }
        Ok(())
    }

    async fn participants(&self, session_id: &str) -> Result<Vec<PartyId>> {
        Ok(self
            .sessions
            .get(session_id)
            .map(|e| e.clone())
            .unwrap_or_default())
    }

    async fn delete_session(&self, session_id: &str) -> Result<()> {
        self.sessions.remove(session_id);
        self.started.remove(session_id);
        self.completed.remove(session_id);
        self.messages.retain(|(sid, _, _), _| sid != session_id);
        self.setup.retain(|(sid, _), _| sid != session_id);
        self.keysign_done.retain(|(sid, _), _| sid != session_id);
        Ok(())
    }

    async fn start_session(&self, session_id: &str, committee: &[PartyId]) -> Result<()> {
        // first write wins, starting is monotonic
        self.started
            .entry(session_id.to_string())
            .or_insert_with(|| committee.to_vec());
        Ok(())
    }

    async fn started_committee(&self, session_id: &str) -> Result<Option<Vec<PartyId>>> {
        Ok(self.started.get(session_id).map(|e| e.clone()))
    }

    async fn mark_complete(&self, session_id: &str, party_id: &str) -> Result<()> {
        let mut entry = self.completed.entry(session_id.to_string()).or_default();
        if !entry.iter().any(|p| p == party_id) {
            entry.push(party_id.to_string());
        }
        Ok(())
    }

    async fn completed_parties(&self, session_id: &str) -> Result<Vec<PartyId>> {
        Ok(self
            .completed
            .get(session_id)
            .map(|e| e.clone())
            .unwrap_or_default())
    }

    async fn post_message(&self, message_id: Option<&str>, message: &RelayMessage) -> Result<()> {
        for recipient in &message.to {
            self.messages
                .entry((
                    message.session_id.clone(),
                    recipient.clone(),
                    scope(message_id),
                ))
                .or_default()
                .push(message.clone());
        }
        Ok(())
    }

    async fn fetch_messages(
        &self,
        session_id: &str,
        party_id: &str,
        message_id: Option<&str>,
    ) -> Result<Vec<RelayMessage>> {
        Ok(self
            .messages
            .get(&(
                session_id.to_string(),
                party_id.to_string(),
                scope(message_id),
            ))
            .map(|e| e.clone())
            .unwrap_or_default())
    }

    async fn delete_message(
        &self,
        session_id: &str,
        party_id: &str,
        hash: &str,
        message_id: Option<&str>,
    ) -> Result<()> {
        if let Some(mut entry) = self.messages.get_mut(&(
            session_id.to_string(),
            party_id.to_string(),
            scope(message_id),
        )) {
            entry.retain(|m| m.hash != hash);
        }
        Ok(())
    }

    async fn upload_setup_message(
        &self,
        session_id: &str,
        message_id: Option<&str>,
        body: &str,
    ) -> Result<()> {
        self.setup
            .insert((session_id.to_string(), scope(message_id)), body.to_string());
        Ok(())
    }

    async fn download_setup_message(
        &self,
        session_id: &str,
        message_id: Option<&str>,
    ) -> Result<Option<String>> {
        Ok(self
            .setup
            .get(&(session_id.to_string(), scope(message_id)))
            .map(|e| e.clone()))
    }

    async fn mark_keysign_complete(
        &self,
        session_id: &str,
        message_id: &str,
        signature: &SignatureRecord,
    ) -> Result<()> {
        self.keysign_done.insert(
            (session_id.to_string(), message_id.to_string()),
            signature.clone(),
        );
        Ok(())
    }

    async fn check_keysign_complete(
        &self,
        session_id: &str,
        message_id: &str,
    ) -> Result<Option<SignatureRecord>> {
        Ok(self
            .keysign_done
            .get(&(session_id.to_string(), message_id.to_string()))
            .map(|e| e.clone()))
    }
}
