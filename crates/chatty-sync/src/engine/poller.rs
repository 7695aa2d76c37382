//! Long-poll fallback loop.
//!
//! Each loop belongs to one epoch. The epoch counter is the only
//! cancellation primitive: teardown bumps it and cancels the in-flight
//! request, and any iteration that resumes under a stale epoch stops
//! silently without touching state or re-arming.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use log::{debug, warn};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::api::ConversationApi;
use crate::engine::InternalEvent;
use crate::error::SyncError;

pub(crate) struct Poller {
    pub api: Arc<dyn ConversationApi>,
    pub user: Uuid,
    pub peer: Uuid,
    /// Epoch this loop was started under.
    pub epoch: u64,
    /// Live epoch counter owned by the engine.
    pub current_epoch: Arc<AtomicU64>,
    /// Aborts the in-flight delta request on teardown.
    pub cancel: CancellationToken,
    /// Fixed wait after a failed iteration.
    pub backoff: Duration,
    pub events: mpsc::Sender<InternalEvent>,
}

impl Poller {
    fn is_current(&self) -> bool {
        self.current_epoch.load(Ordering::SeqCst) == self.epoch
    }

    /// Run iterations until superseded. `cursor` is the `since` watermark:
    /// it advances to the newest `created_at` of each non-empty batch and
    /// is otherwise reused unchanged, including across failures.
    pub async fn run(self, mut cursor: i64) {
        debug!(
            "Poll loop epoch {} starting with cursor {cursor}",
            self.epoch
        );
        loop {
            if !self.is_current() {
                debug!("Poll loop epoch {} superseded", self.epoch);
                return;
            }

            match self
                .api
                .poll_since(self.user, self.peer, cursor, &self.cancel)
                .await
            {
                Ok(batch) => {
                    if !self.is_current() {
                        return;
                    }
                    if batch.is_empty() {
                        // The server held the request; re-arm right away
                        // with the same watermark.
                        continue;
                    }
                    cursor = batch
                        .iter()
                        .map(|m| m.created_at)
                        .max()
                        .unwrap_or(cursor);
                    let event = InternalEvent::Polled {
                        epoch: self.epoch,
                        messages: batch,
                    };
                    if self.events.send(event).await.is_err() {
                        return;
                    }
                }
                Err(SyncError::Cancelled) => return,
                Err(err) => {
                    if !self.is_current() {
                        return;
                    }
                    warn!(
                        "Poll iteration failed: {err}; retrying in {:?}",
                        self.backoff
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => return,
                        _ = tokio::time::sleep(self.backoff) => {}
                    }
                }
            }
        }
    }
}
