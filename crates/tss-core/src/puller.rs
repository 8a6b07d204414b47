//! Encrypted message pump between the relay and a round driver.
//!
//! [`MessagePuller`] polls inbound ciphertext for the local party, de-dupes,
//! decrypts and feeds the active driver, then deletes applied messages from
//! the relay. [`MessageSender`] encrypts and posts the driver's outbound
//! envelopes. Both are scoped to one session and, for keysign, one message
//! id; `stop()` must run on every exit path so no stale poller leaks into
//! the next attempt.

use crate::driver::{OutboundEnvelope, RoundDriver};
use crate::encryption::SessionCipher;
use crate::transport::RelayTransport;
use crate::{message_hash, Error, PartyId, RelayMessage, Result, SessionId};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

fn dedupe_key(
    session_id: &str,
    party: &str,
    message_id: Option<&str>,
    hash: &str,
) -> String {
    match message_id {
        Some(mid) => format!("{session_id}-{party}-{mid}-{hash}"),
        None => format!("{session_id}-{party}-{hash}"),
    }
}

/// Polls inbound protocol messages and applies them to a driver
pub struct MessagePuller {
    transport: Arc<dyn RelayTransport>,
    cipher: Arc<SessionCipher>,
    session_id: SessionId,
    local_party: PartyId,
    /// Keysign scopes traffic to one in-flight message; keygen leaves this unset
    message_id: Option<String>,
    running: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl MessagePuller {
    pub fn new(
        transport: Arc<dyn RelayTransport>,
        cipher: Arc<SessionCipher>,
        session_id: SessionId,
        local_party: PartyId,
        message_id: Option<String>,
    ) -> Self {
        Self {
            transport,
            cipher,
            session_id,
            local_party,
            message_id,
            running: Arc::new(AtomicBool::new(false)),
            task: None,
        }
    }

    /// Spawn the polling loop feeding `driver`.
    pub fn start(&mut self, driver: Arc<dyn RoundDriver>, poll_interval: Duration) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let transport = Arc::clone(&self.transport);
        let cipher = Arc::clone(&self.cipher);
        let session_id = self.session_id.clone();
        let local_party = self.local_party.clone();
        let message_id = self.message_id.clone();
        let running = Arc::clone(&self.running);

        self.task = Some(tokio::spawn(async move {
            let mut applied: HashSet<String> = HashSet::new();
            while running.load(Ordering::SeqCst) {
                match transport
                    .fetch_messages(&session_id, &local_party, message_id.as_deref())
                    .await
                {
                    Ok(mut messages) => {
                        messages.sort_by_key(|m| m.sequence_no);
                        for msg in messages {
                            let key = dedupe_key(
                                &session_id,
                                &local_party,
                                message_id.as_deref(),
                                &msg.hash,
                            );
                            if applied.contains(&key) {
                                debug!(hash = %msg.hash, "message already applied");
                                continue;
                            }
                            match decode_body(&cipher, &msg.body) {
                                Ok(plaintext) => {
                                    if let Err(err) = driver.supply_inbound(&plaintext) {
                                        warn!(from = %msg.from, %err, "driver rejected message");
                                        continue;
                                    }
                                    applied.insert(key);
                                    // deletion is best-effort, duplicates are
                                    // filtered above anyway
                                    let transport = Arc::clone(&transport);
                                    let session_id = session_id.clone();
                                    let local_party = local_party.clone();
                                    let message_id = message_id.clone();
                                    let hash = msg.hash.clone();
                                    tokio::spawn(async move {
                                        if let Err(err) = transport
                                            .delete_message(
                                                &session_id,
                                                &local_party,
                                                &hash,
                                                message_id.as_deref(),
                                            )
                                            .await
                                        {
                                            debug!(%hash, %err, "message deletion failed");
                                        }
                                    });
                                }
                                Err(err) => {
                                    warn!(from = %msg.from, %err, "undecryptable message dropped");
                                }
                            }
                        }
                    }
                    Err(err) => {
                        debug!(%session_id, %err, "inbound poll failed");
                    }
                }
                tokio::time::sleep(poll_interval).await;
            }
        }));
    }

    /// Cancel the polling loop and forget the de-dupe cache. Required on
    /// every exit path, including retries.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for MessagePuller {
    fn drop(&mut self) {
        self.stop();
    }
}

fn decode_body(cipher: &SessionCipher, body: &str) -> Result<Vec<u8>> {
    // bodies travel as cipher(base64(raw)) so either side can log/compare
    // the base64 form without touching raw library bytes
    let b64 = cipher.decrypt(body)?;
    let b64 = String::from_utf8(b64)
        .map_err(|e| Error::Deserialization(format!("body is not utf-8 base64: {e}")))?;
    BASE64
        .decode(b64.trim())
        .map_err(|e| Error::Deserialization(format!("body base64: {e}")))
}

/// Encrypts and posts outbound envelopes for one session/message scope
pub struct MessageSender {
    transport: Arc<dyn RelayTransport>,
    cipher: Arc<SessionCipher>,
    session_id: SessionId,
    local_party: PartyId,
    message_id: Option<String>,
    counter: AtomicI64,
}

impl MessageSender {
    pub fn new(
        transport: Arc<dyn RelayTransport>,
        cipher: Arc<SessionCipher>,
        session_id: SessionId,
        local_party: PartyId,
        message_id: Option<String>,
    ) -> Self {
        Self {
            transport,
            cipher,
            session_id,
            local_party,
            message_id,
            counter: AtomicI64::new(1),
        }
    }

    /// Encrypt one envelope and post it, retrying transient relay errors.
    pub async fn send(&self, envelope: &OutboundEnvelope) -> Result<()> {
        let b64 = BASE64.encode(&envelope.body);
        let message = RelayMessage {
            session_id: self.session_id.clone(),
            from: self.local_party.clone(),
            to: envelope.receivers.clone(),
            body: self.cipher.encrypt(b64.as_bytes())?,
            hash: message_hash(&b64),
            sequence_no: self.counter.fetch_add(1, Ordering::SeqCst),
        };

        let mut last_err = None;
        for _ in 0..3 {
            match self
                .transport
                .post_message(self.message_id.as_deref(), &message)
                .await
            {
                Ok(()) => {
                    debug!(
                        hash = %message.hash,
                        to = ?message.to,
                        sequence_no = message.sequence_no,
                        "message posted"
                    );
                    return Ok(());
                }
                Err(err) => {
                    warn!(hash = %message.hash, %err, "message post failed");
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| Error::Relay("message post failed".into())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::RoundArtifact;
    use crate::encryption::{CipherSuite, EncryptionKey};
    use crate::transport::MemoryTransport;
    use std::sync::Mutex;

    struct RecordingDriver {
        inbound: Mutex<Vec<Vec<u8>>>,
    }

    impl RecordingDriver {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                inbound: Mutex::new(Vec::new()),
            })
        }
    }

    impl RoundDriver for RecordingDriver {
        fn supply_inbound(&self, body: &[u8]) -> Result<()> {
            self.inbound.lock().unwrap().push(body.to_vec());
            Ok(())
        }

        fn drain_outbound(&self) -> Result<Vec<OutboundEnvelope>> {
            Ok(Vec::new())
        }

        fn try_finish(&self) -> Result<Option<RoundArtifact>> {
            Ok(None)
        }
    }

    fn cipher() -> Arc<SessionCipher> {
        Arc::new(SessionCipher::new(&EncryptionKey::generate(), CipherSuite::AesGcm).unwrap())
    }

    #[tokio::test]
    async fn sender_to_puller_round_trip() {
        let relay = Arc::new(MemoryTransport::new());
        let cipher = cipher();

        let sender = MessageSender::new(
            relay.clone(),
            cipher.clone(),
            "s1".into(),
            "a".into(),
            None,
        );
        sender
            .send(&OutboundEnvelope {
                receivers: vec!["b".into()],
                body: b"round-1-payload".to_vec(),
            })
            .await
            .unwrap();

        let driver = RecordingDriver::new();
        let mut puller = MessagePuller::new(
            relay.clone(),
            cipher,
            "s1".into(),
            "b".into(),
            None,
        );
        puller.start(driver.clone(), Duration::from_millis(10));

        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if !driver.inbound.lock().unwrap().is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("message never delivered");
        puller.stop();

        let inbound = driver.inbound.lock().unwrap();
        assert_eq!(inbound.as_slice(), &[b"round-1-payload".to_vec()]);

        // applied message gets deleted from the relay
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(relay.fetch_messages("s1", "b", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn duplicate_deliveries_are_applied_once() {
        let relay = Arc::new(MemoryTransport::new());
        let cipher = cipher();
        let body_b64 = BASE64.encode(b"dup-payload");
        let msg = RelayMessage {
            session_id: "s1".into(),
            from: "a".into(),
            to: vec!["b".into()],
            body: cipher.encrypt(body_b64.as_bytes()).unwrap(),
            hash: message_hash(&body_b64),
            sequence_no: 1,
        };
        // at-least-once delivery: the same message is stored twice
        relay.post_message(None, &msg).await.unwrap();
        relay.post_message(None, &msg).await.unwrap();

        let driver = RecordingDriver::new();
        let mut puller = MessagePuller::new(
            relay.clone(),
            cipher,
            "s1".into(),
            "b".into(),
            None,
        );
        puller.start(driver.clone(), Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(100)).await;
        puller.stop();

        assert_eq!(driver.inbound.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn undecryptable_messages_are_skipped() {
        let relay = Arc::new(MemoryTransport::new());
        let msg = RelayMessage {
            session_id: "s1".into(),
            from: "a".into(),
            to: vec!["b".into()],
            body: "bm90LWEtY2lwaGVydGV4dA==".into(),
            hash: "garbled".into(),
            sequence_no: 1,
        };
        relay.post_message(None, &msg).await.unwrap();

        let driver = RecordingDriver::new();
        let mut puller = MessagePuller::new(
            relay.clone(),
            cipher(),
            "s1".into(),
            "b".into(),
            None,
        );
        puller.start(driver.clone(), Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(60)).await;
        puller.stop();

        assert!(driver.inbound.lock().unwrap().is_empty());
    }
}
