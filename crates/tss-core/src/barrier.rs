//! Completion barrier.
//!
//! After its own rounds succeed, each party marks itself complete on the
//! relay and then polls until every committee member has done the same, or a
//! ceiling elapses. The barrier never fails an operation by itself: the
//! caller decides what a `false` outcome means.

use crate::transport::RelayTransport;
use crate::{Committee, PartyId, SessionId};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub struct CompletionBarrier {
    transport: Arc<dyn RelayTransport>,
    session_id: SessionId,
    local_party: PartyId,
    committee: Committee,
    poll_interval: Duration,
    timeout: Duration,
}

impl CompletionBarrier {
    pub fn new(
        transport: Arc<dyn RelayTransport>,
        session_id: SessionId,
        local_party: PartyId,
        committee: Committee,
        poll_interval: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            transport,
            session_id,
            local_party,
            committee,
            poll_interval,
            timeout,
        }
    }

    /// Announce local completion. Failures are logged, not propagated: the
    /// local rounds already succeeded and the poll loop tells us whether the
    /// committee converged.
    pub async fn mark_local_complete(&self) {
        if let Err(err) = self
            .transport
            .mark_complete(&self.session_id, &self.local_party)
            .await
        {
            warn!(session_id = %self.session_id, %err, "completion mark failed");
        }
    }

    /// Poll until every committee member reported completion. Returns `false`
    /// when the ceiling elapses first.
    pub async fn wait_for_all(&self) -> bool {
        let deadline = Instant::now() + self.timeout;
        loop {
            match self.transport.completed_parties(&self.session_id).await {
                Ok(done) => {
                    let missing = self.committee.missing_from(&done);
                    if missing.is_empty() {
                        info!(
                            session_id = %self.session_id,
                            parties = self.committee.len(),
                            "all committee members complete"
                        );
                        return true;
                    }
                    debug!(session_id = %self.session_id, ?missing, "waiting for completion");
                }
                Err(err) => {
                    debug!(session_id = %self.session_id, %err, "completion poll failed");
                }
            }
            if Instant::now() >= deadline {
                warn!(session_id = %self.session_id, "completion barrier timed out");
                return false;
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;

    fn committee() -> Committee {
        Committee::from_parties(["a", "b"].into_iter().map(String::from))
    }

    fn barrier(relay: Arc<MemoryTransport>, timeout: Duration) -> CompletionBarrier {
        CompletionBarrier::new(
            relay,
            "s1".into(),
            "a".into(),
            committee(),
            Duration::from_millis(10),
            timeout,
        )
    }

    #[tokio::test]
    async fn converges_once_all_parties_report() {
        let relay = Arc::new(MemoryTransport::new());
        let b = barrier(relay.clone(), Duration::from_secs(2));
        b.mark_local_complete().await;

        let peer = relay.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            peer.mark_complete("s1", "b").await.unwrap();
        });

        assert!(b.wait_for_all().await);
    }

    #[tokio::test]
    async fn times_out_when_a_party_never_reports() {
        let relay = Arc::new(MemoryTransport::new());
        let b = barrier(relay, Duration::from_millis(80));
        b.mark_local_complete().await;
        assert!(!b.wait_for_all().await);
    }
}
