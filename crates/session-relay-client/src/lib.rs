//! Session Relay Client
//!
//! HTTP implementation of the coordination transport, speaking the session
//! relay service's surface. One client is bound to one relay base URL and is
//! shared by every component of a session.

use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::debug;
use tss_core::transport::{async_trait, RelayTransport};
use tss_core::{Error, PartyId, RelayMessage, Result, SignatureRecord};

/// Header scoping keysign traffic to one in-flight message
const MESSAGE_ID_HEADER: &str = "message_id";

/// HTTP-based relay transport
pub struct RelayClient {
    client: Client,
    /// Relay base URL, no trailing slash
    url: String,
    /// Request timeout
    timeout: Duration,
}

impl RelayClient {
    pub fn new(url: &str) -> Self {
        Self {
            client: Client::new(),
            url: url.trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(30),
        }
    }

    /// Set request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.url, path)
    }

    async fn post_json<T: serde::Serialize + ?Sized>(
        &self,
        path: &str,
        message_id: Option<&str>,
        body: &T,
    ) -> Result<()> {
        let mut request = self
            .client
            .post(self.endpoint(path))
            .json(body)
            .timeout(self.timeout);
        if let Some(mid) = message_id {
            request = request.header(MESSAGE_ID_HEADER, mid);
        }
        let response = request
            .send()
            .await
            .map_err(|e| Error::Relay(e.to_string()))?;
        if !response.status().is_success() {
            return Err(Error::Relay(format!(
                "POST /{path} failed with status: {}",
                response.status()
            )));
        }
        Ok(())
    }

    /// GET that treats 404 as "nothing there yet".
    async fn get_optional(
        &self,
        path: &str,
        message_id: Option<&str>,
    ) -> Result<Option<reqwest::Response>> {
        let mut request = self.client.get(self.endpoint(path)).timeout(self.timeout);
        if let Some(mid) = message_id {
            request = request.header(MESSAGE_ID_HEADER, mid);
        }
        let response = request
            .send()
            .await
            .map_err(|e| Error::Relay(e.to_string()))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Error::Relay(format!(
                "GET /{path} failed with status: {}",
                response.status()
            )));
        }
        Ok(Some(response))
    }
}

#[async_trait]
impl RelayTransport for RelayClient {
    async fn register_party(&self, session_id: &str, party_id: &str) -> Result<()> {
        debug!(%session_id, %party_id, "registering party");
        self.post_json(session_id, None, &[party_id]).await
    }

    async fn participants(&self, session_id: &str) -> Result<Vec<PartyId>> {
        match self.get_optional(session_id, None).await? {
            Some(response) => response
                .json()
                .await
                .map_err(|e| Error::Deserialization(e.to_string())),
            // the relay has no record of the session yet
            None => Ok(Vec::new()),
        }
    }

    async fn delete_session(&self, session_id: &str) -> Result<()> {
        let response = self
            .client
            .delete(self.endpoint(session_id))
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| Error::Relay(e.to_string()))?;
        if !response.status().is_success() {
            return Err(Error::Relay(format!(
                "DELETE /{session_id} failed with status: {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn start_session(&self, session_id: &str, committee: &[PartyId]) -> Result<()> {
        self.post_json(&format!("start/{session_id}"), None, committee)
            .await
    }

    async fn started_committee(&self, session_id: &str) -> Result<Option<Vec<PartyId>>> {
        match self
            .get_optional(&format!("start/{session_id}"), None)
            .await?
        {
            Some(response) => response
                .json()
                .await
                .map(Some)
                .map_err(|e| Error::Deserialization(e.to_string())),
            None => Ok(None),
        }
    }

    async fn mark_complete(&self, session_id: &str, party_id: &str) -> Result<()> {
        self.post_json(&format!("complete/{session_id}"), None, &[party_id])
            .await
    }

    async fn completed_parties(&self, session_id: &str) -> Result<Vec<PartyId>> {
        match self
            .get_optional(&format!("complete/{session_id}"), None)
            .await?
        {
            Some(response) => response
                .json()
                .await
                .map_err(|e| Error::Deserialization(e.to_string())),
            None => Ok(Vec::new()),
        }
    }

    async fn post_message(&self, message_id: Option<&str>, message: &RelayMessage) -> Result<()> {
        self.post_json(
            &format!("message/{}", message.session_id),
            message_id,
            message,
        )
        .await
    }

    async fn fetch_messages(
        &self,
        session_id: &str,
        party_id: &str,
        message_id: Option<&str>,
    ) -> Result<Vec<RelayMessage>> {
        match self
            .get_optional(&format!("message/{session_id}/{party_id}"), message_id)
            .await?
        {
            Some(response) => response
                .json()
                .await
                .map_err(|e| Error::Deserialization(e.to_string())),
            None => Ok(Vec::new()),
        }
    }

    async fn delete_message(
        &self,
        session_id: &str,
        party_id: &str,
        hash: &str,
        message_id: Option<&str>,
    ) -> Result<()> {
        let mut request = self
            .client
            .delete(self.endpoint(&format!("message/{session_id}/{party_id}/{hash}")))
            .timeout(self.timeout);
        if let Some(mid) = message_id {
            request = request.header(MESSAGE_ID_HEADER, mid);
        }
        let response = request
            .send()
            .await
            .map_err(|e| Error::Relay(e.to_string()))?;
        if !response.status().is_success() {
            return Err(Error::Relay(format!(
                "DELETE message failed with status: {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn upload_setup_message(
        &self,
        session_id: &str,
        message_id: Option<&str>,
        body: &str,
    ) -> Result<()> {
        let mut request = self
            .client
            .post(self.endpoint(&format!("setup-message/{session_id}")))
            .body(body.to_string())
            .timeout(self.timeout);
        if let Some(mid) = message_id {
            request = request.header(MESSAGE_ID_HEADER, mid);
        }
        let response = request
            .send()
            .await
            .map_err(|e| Error::Relay(e.to_string()))?;
        if !response.status().is_success() {
            return Err(Error::Relay(format!(
                "setup upload failed with status: {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn download_setup_message(
        &self,
        session_id: &str,
        message_id: Option<&str>,
    ) -> Result<Option<String>> {
        match self
            .get_optional(&format!("setup-message/{session_id}"), message_id)
            .await?
        {
            Some(response) => response
                .text()
                .await
                .map(Some)
                .map_err(|e| Error::Relay(e.to_string())),
            None => Ok(None),
        }
    }

    async fn mark_keysign_complete(
        &self,
        session_id: &str,
        message_id: &str,
        signature: &SignatureRecord,
    ) -> Result<()> {
        self.post_json(
            &format!("complete/keysign/{session_id}"),
            Some(message_id),
            signature,
        )
        .await
    }

    async fn check_keysign_complete(
        &self,
        session_id: &str,
        message_id: &str,
    ) -> Result<Option<SignatureRecord>> {
        match self
            .get_optional(&format!("complete/keysign/{session_id}"), Some(message_id))
            .await?
        {
            Some(response) => response
                .json()
                .await
                .map(Some)
                .map_err(|e| Error::Deserialization(e.to_string())),
            None => Ok(None),
        }
    }
}
