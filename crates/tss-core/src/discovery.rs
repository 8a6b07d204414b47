//! Participant discovery.
//!
//! Polls the relay's presence registry and publishes a monotonically growing
//! set of discovered peers over a watch channel. The local party is always a
//! member of its own discovered set. Registration failures are not fatal:
//! the loop re-registers whenever the relay does not yet list the local
//! party.

use crate::transport::RelayTransport;
use crate::{PartyId, SessionId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub struct ParticipantDiscovery {
    transport: Arc<dyn RelayTransport>,
    session_id: SessionId,
    local_party: PartyId,
    peers_tx: watch::Sender<Vec<PartyId>>,
    running: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl ParticipantDiscovery {
    pub fn new(
        transport: Arc<dyn RelayTransport>,
        session_id: SessionId,
        local_party: PartyId,
    ) -> Self {
        let (peers_tx, _) = watch::channel(vec![local_party.clone()]);
        Self {
            transport,
            session_id,
            local_party,
            peers_tx,
            running: Arc::new(AtomicBool::new(false)),
            task: None,
        }
    }

    /// Latest snapshot of discovered peers.
    pub fn peers(&self) -> Vec<PartyId> {
        self.peers_tx.borrow().clone()
    }

    /// Live view of the growing peer set.
    pub fn subscribe(&self) -> watch::Receiver<Vec<PartyId>> {
        self.peers_tx.subscribe()
    }

    /// Spawn the polling loop. A second call is a no-op until `stop`.
    pub fn start(&mut self, poll_interval: Duration) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let transport = Arc::clone(&self.transport);
        let session_id = self.session_id.clone();
        let local_party = self.local_party.clone();
        let peers_tx = self.peers_tx.clone();
        let running = Arc::clone(&self.running);

        self.task = Some(tokio::spawn(async move {
            while running.load(Ordering::SeqCst) {
                match transport.participants(&session_id).await {
                    Ok(found) => {
                        if !found.contains(&local_party) {
                            // presence registration is retried silently
                            if let Err(err) =
                                transport.register_party(&session_id, &local_party).await
                            {
                                warn!(%session_id, %err, "presence registration failed");
                            }
                        }
                        peers_tx.send_modify(|peers| {
                            for peer in found {
                                if !peers.contains(&peer) {
                                    debug!(%session_id, %peer, "discovered participant");
                                    peers.push(peer);
                                }
                            }
                        });
                    }
                    Err(err) => {
                        debug!(%session_id, %err, "participant poll failed");
                    }
                }
                tokio::time::sleep(poll_interval).await;
            }
        }));
    }

    /// Cancel the polling task.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    /// Reset the discovered set, re-register and resume polling on a new
    /// transport. Used when the session switches between the local mediator
    /// and the public relay.
    pub async fn restart(&mut self, transport: Arc<dyn RelayTransport>, poll_interval: Duration) {
        self.stop();
        self.transport = transport;
        self.peers_tx.send_replace(vec![self.local_party.clone()]);
        if let Err(err) = self
            .transport
            .register_party(&self.session_id, &self.local_party)
            .await
        {
            warn!(session_id = %self.session_id, %err, "re-registration failed, poll loop will retry");
        }
        self.start(poll_interval);
    }
}

impl Drop for ParticipantDiscovery {
    fn drop(&mut self) {
        self.stop();
    }
}
