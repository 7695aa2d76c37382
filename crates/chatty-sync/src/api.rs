//! REST collaborators: history fetch, poll delta, HTTP send fallback.
//!
//! The engine talks to these through the [`ConversationApi`] trait so
//! tests can drive it with fakes; [`HttpConversationApi`] is the real
//! implementation against the backend's message endpoints.

use async_trait::async_trait;
use log::debug;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use chatty_protocol::{CreateMessageRequest, Message};

use crate::error::SyncError;

/// Server calls the sync engine depends on.
#[async_trait]
pub trait ConversationApi: Send + Sync {
    /// Full conversation history between two users, in server order.
    async fn fetch_conversation(
        &self,
        user1: Uuid,
        user2: Uuid,
    ) -> Result<Vec<Message>, SyncError>;

    /// Messages newer than `since` (epoch millis). The server holds the
    /// request open, so the call must honor `cancel` for teardown.
    async fn poll_since(
        &self,
        user1: Uuid,
        user2: Uuid,
        since: i64,
        cancel: &CancellationToken,
    ) -> Result<Vec<Message>, SyncError>;

    /// Persist a message over plain HTTP. Returns the saved message with
    /// its authoritative id and timestamp.
    async fn send_message(
        &self,
        sender: Uuid,
        receiver: Uuid,
        text: &str,
    ) -> Result<Message, SyncError>;
}

/// [`ConversationApi`] against the real backend.
pub struct HttpConversationApi {
    client: reqwest::Client,
    base_url: String,
}

impl HttpConversationApi {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }
}

#[async_trait]
impl ConversationApi for HttpConversationApi {
    async fn fetch_conversation(
        &self,
        user1: Uuid,
        user2: Uuid,
    ) -> Result<Vec<Message>, SyncError> {
        debug!("Fetching conversation {user1} <-> {user2}");
        let response = self
            .client
            .get(self.url("messages/conversation"))
            .query(&[("user1", user1.to_string()), ("user2", user2.to_string())])
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    async fn poll_since(
        &self,
        user1: Uuid,
        user2: Uuid,
        since: i64,
        cancel: &CancellationToken,
    ) -> Result<Vec<Message>, SyncError> {
        debug!("Polling conversation {user1} <-> {user2} since {since}");
        let request = self
            .client
            .get(self.url("messages/poll"))
            .query(&[
                ("user1", user1.to_string()),
                ("user2", user2.to_string()),
                ("since", since.to_string()),
            ])
            .send();

        // The server holds this request for up to ~30s. Teardown aborts
        // it instead of waiting the hold out.
        tokio::select! {
            _ = cancel.cancelled() => Err(SyncError::Cancelled),
            result = request => {
                let response = result?.error_for_status()?;
                Ok(response.json().await?)
            }
        }
    }

    async fn send_message(
        &self,
        sender: Uuid,
        receiver: Uuid,
        text: &str,
    ) -> Result<Message, SyncError> {
        let body = CreateMessageRequest {
            sender,
            receiver,
            text: text.to_string(),
        };
        let response = self
            .client
            .post(self.url("messages"))
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_building() {
        let api = HttpConversationApi::new("http://localhost:8080/api");
        assert_eq!(
            api.url("messages/conversation"),
            "http://localhost:8080/api/messages/conversation"
        );

        let api = HttpConversationApi::new("http://localhost:8080/api/");
        assert_eq!(api.url("messages"), "http://localhost:8080/api/messages");
    }
}
