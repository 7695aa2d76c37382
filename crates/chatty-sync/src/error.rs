//! Sync errors.

use thiserror::Error;

/// Errors surfaced by the sync layers.
///
/// The recovery policy differs per variant: transport and fetch failures
/// are retried automatically (reconnect delay / poll backoff), send
/// rejections are terminal for the one message that triggered them, and
/// parse failures are logged and dropped before they ever reach a
/// timeline.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Connection or heartbeat failure on the websocket transport.
    #[error("transport error: {0}")]
    Transport(String),

    /// Error frame reported by the broker. The connection may still be
    /// usable.
    #[error("broker error: {0}")]
    Protocol(String),

    /// Malformed inbound payload.
    #[error("parse error: {0}")]
    Parse(String),

    /// Publish attempted without a live channel.
    #[error("send rejected: {0}")]
    SendRejected(String),

    /// History load or poll delta request failed.
    #[error("fetch failed: {0}")]
    Fetch(String),

    /// Request was deliberately aborted during teardown. Never retried
    /// and never surfaced as an error state.
    #[error("request cancelled")]
    Cancelled,
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        Self::Fetch(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SyncError::Transport("connection refused".into());
        assert_eq!(err.to_string(), "transport error: connection refused");

        let err = SyncError::SendRejected("channel not connected".into());
        assert_eq!(err.to_string(), "send rejected: channel not connected");
    }
}
