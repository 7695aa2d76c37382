//! Conversation sync engine.
//!
//! One engine instance owns one conversation: the timeline, the single
//! delivery channel (live push or long-poll fallback), and the epoch
//! counter that fences stale async completions. Callers get a cheap
//! handle with fire-and-forget commands and `watch`-based read models;
//! all state mutation happens on one task, so completions interleave but
//! never race.

mod poller;
pub mod timeline;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use log::{info, warn};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use chatty_protocol::Message;

use crate::api::{ConversationApi, HttpConversationApi};
use crate::channel::{ChannelEvent, ChannelFactory, LiveChannel, StompChannelFactory};
use crate::config::{DeliveryMode, SyncConfig};
use crate::error::SyncError;

use poller::Poller;
use timeline::{Timeline, TimelineEntry};

/// Buffer for internal completions (channel events, poll batches, send
/// results).
const INTERNAL_BUFFER_SIZE: usize = 256;

/// Buffer for channel events before the epoch tag is attached.
const CHANNEL_BUFFER_SIZE: usize = 64;

/// Connection state as exposed to callers. Owned exclusively by the
/// engine; read-only outside.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error(String),
}

/// The `(current_user, other_user)` pair scoping one conversation.
///
/// An engine is parameterized by its pair; switching conversations means
/// stopping this engine and starting a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConversationPair {
    pub current_user: Uuid,
    pub other_user: Uuid,
}

impl ConversationPair {
    pub fn new(current_user: Uuid, other_user: Uuid) -> Self {
        Self {
            current_user,
            other_user,
        }
    }
}

enum EngineCommand {
    Connect,
    Disconnect,
    Send(String),
}

/// Completions delivered back to the engine task, each tagged with the
/// epoch it belongs to. Stale tags are dropped without side effects.
pub(crate) enum InternalEvent {
    Channel {
        epoch: u64,
        event: ChannelEvent,
    },
    Polled {
        epoch: u64,
        messages: Vec<Message>,
    },
    SendResult {
        epoch: u64,
        temp_id: Uuid,
        result: Result<Message, SyncError>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Loading,
    Live,
    Polling,
}

/// Handle to a running sync engine.
///
/// Commands are fire-and-forget and processed in order; reads go through
/// `watch` channels so callers always see the latest snapshot.
pub struct SyncEngine {
    cmd_tx: mpsc::UnboundedSender<EngineCommand>,
    timeline_rx: watch::Receiver<Vec<TimelineEntry>>,
    state_rx: watch::Receiver<ConnectionState>,
    error_rx: watch::Receiver<Option<String>>,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl SyncEngine {
    /// Start an engine with the production collaborators: the REST client
    /// and the STOMP channel factory.
    pub fn start(config: SyncConfig, pair: ConversationPair) -> Self {
        let api = Arc::new(HttpConversationApi::new(config.api_base_url.clone()));
        let channels = Arc::new(StompChannelFactory::new(config.clone()));
        Self::with_collaborators(config, pair, api, channels)
    }

    /// Start an engine with injected collaborators. Tests drive the engine
    /// through this with fakes.
    pub fn with_collaborators(
        config: SyncConfig,
        pair: ConversationPair,
        api: Arc<dyn ConversationApi>,
        channels: Arc<dyn ChannelFactory>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (timeline_tx, timeline_rx) = watch::channel(Vec::new());
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (error_tx, error_rx) = watch::channel(None);
        let shutdown = CancellationToken::new();

        let task = EngineTask {
            config,
            pair,
            api,
            channels,
            timeline: Timeline::new(),
            timeline_tx,
            state_tx,
            error_tx,
            epoch: Arc::new(AtomicU64::new(0)),
            session_epoch: 0,
            phase: Phase::Idle,
            poll_cancel: None,
            channel: None,
            channel_connected: false,
        };
        let handle = tokio::spawn(task.run(cmd_rx, shutdown.clone()));

        Self {
            cmd_tx,
            timeline_rx,
            state_rx,
            error_rx,
            shutdown,
            task: Some(handle),
        }
    }

    /// Begin the startup sequence: history fetch, then live channel or
    /// poll loop depending on the configured delivery mode.
    pub fn connect(&self) {
        let _ = self.cmd_tx.send(EngineCommand::Connect);
    }

    /// Tear down delivery. The timeline is left as-is; the next
    /// `connect()` re-seeds it.
    pub fn disconnect(&self) {
        let _ = self.cmd_tx.send(EngineCommand::Disconnect);
    }

    /// Send a message. The timeline gains a pending entry before any
    /// network activity; failures mark that entry failed and are never
    /// retried implicitly.
    pub fn send(&self, text: impl Into<String>) {
        let _ = self.cmd_tx.send(EngineCommand::Send(text.into()));
    }

    /// Current timeline snapshot.
    pub fn timeline(&self) -> Vec<TimelineEntry> {
        self.timeline_rx.borrow().clone()
    }

    /// Watch the timeline for changes.
    pub fn watch_timeline(&self) -> watch::Receiver<Vec<TimelineEntry>> {
        self.timeline_rx.clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    pub fn watch_connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Most recent error string, if any. Updated continuously, not only
    /// on state transitions.
    pub fn last_error(&self) -> Option<String> {
        self.error_rx.borrow().clone()
    }

    /// Stop the engine: tear down delivery and wait for the task to
    /// finish. Dropping the handle tears down without waiting.
    pub async fn stop(mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

// ============================================================================
// Engine task
// ============================================================================

struct EngineTask {
    config: SyncConfig,
    pair: ConversationPair,
    api: Arc<dyn ConversationApi>,
    channels: Arc<dyn ChannelFactory>,

    timeline: Timeline,
    timeline_tx: watch::Sender<Vec<TimelineEntry>>,
    state_tx: watch::Sender<ConnectionState>,
    error_tx: watch::Sender<Option<String>>,

    /// Live epoch counter, shared with poll loops for the stale check.
    epoch: Arc<AtomicU64>,
    /// Epoch of the current delivery session.
    session_epoch: u64,

    phase: Phase,
    poll_cancel: Option<CancellationToken>,
    channel: Option<Arc<dyn LiveChannel>>,
    channel_connected: bool,
}

impl EngineTask {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<EngineCommand>,
        shutdown: CancellationToken,
    ) {
        let (internal_tx, mut internal_rx) = mpsc::channel(INTERNAL_BUFFER_SIZE);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    self.teardown().await;
                    self.set_state(ConnectionState::Disconnected);
                    return;
                }
                cmd = cmd_rx.recv() => match cmd {
                    Some(EngineCommand::Connect) => self.handle_connect(&internal_tx).await,
                    Some(EngineCommand::Disconnect) => {
                        self.teardown().await;
                        self.set_state(ConnectionState::Disconnected);
                    }
                    Some(EngineCommand::Send(text)) => self.handle_send(text, &internal_tx).await,
                    None => {
                        self.teardown().await;
                        return;
                    }
                },
                event = internal_rx.recv() => match event {
                    Some(event) => self.handle_internal(event),
                    // Senders never all drop while we hold internal_tx.
                    None => return,
                },
            }
        }
    }

    /// Startup sequence: tear down any previous session, fetch history,
    /// then arm the configured delivery strategy.
    async fn handle_connect(&mut self, internal_tx: &mpsc::Sender<InternalEvent>) {
        self.teardown().await;
        let epoch = self.bump_epoch();

        self.set_state(ConnectionState::Connecting);
        self.phase = Phase::Loading;

        let history = self
            .api
            .fetch_conversation(self.pair.current_user, self.pair.other_user)
            .await;
        let history = match history {
            Ok(history) => history,
            Err(err) => {
                // Initial load failure is a blocking error state; the
                // caller decides whether to retry.
                warn!("History fetch failed: {err}");
                self.set_error(err.to_string());
                self.set_state(ConnectionState::Error(err.to_string()));
                self.phase = Phase::Idle;
                return;
            }
        };
        self.timeline.replace_all(history);
        self.publish_timeline();
        self.set_error_clear();

        match self.config.delivery {
            DeliveryMode::Live => {
                info!(
                    "Starting live delivery for {} <-> {}",
                    self.pair.current_user, self.pair.other_user
                );
                let (tx, mut rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
                self.channel = Some(self.channels.open(self.pair.current_user, tx));
                self.phase = Phase::Live;

                // Tag channel events with this session's epoch so events
                // from a superseded channel are fenced out.
                let internal = internal_tx.clone();
                tokio::spawn(async move {
                    while let Some(event) = rx.recv().await {
                        let tagged = InternalEvent::Channel { epoch, event };
                        if internal.send(tagged).await.is_err() {
                            return;
                        }
                    }
                });
            }
            DeliveryMode::Polling => {
                let cursor = self.timeline.last_created_at().unwrap_or_else(now_ms);
                info!(
                    "Starting poll loop for {} <-> {} at cursor {cursor}",
                    self.pair.current_user, self.pair.other_user
                );
                let cancel = CancellationToken::new();
                self.poll_cancel = Some(cancel.clone());
                let poller = Poller {
                    api: self.api.clone(),
                    user: self.pair.current_user,
                    peer: self.pair.other_user,
                    epoch,
                    current_epoch: self.epoch.clone(),
                    cancel,
                    backoff: self.config.poll_backoff,
                    events: internal_tx.clone(),
                };
                tokio::spawn(poller.run(cursor));
                self.phase = Phase::Polling;
                self.set_state(ConnectionState::Connected);
            }
        }
    }

    /// Optimistic send. The pending entry is installed before any
    /// suspension point.
    async fn handle_send(&mut self, text: String, internal_tx: &mpsc::Sender<InternalEvent>) {
        let provisional = Message::provisional(
            self.pair.current_user,
            self.pair.other_user,
            text.clone(),
            now_ms(),
        );
        let temp_id = provisional.id;
        self.timeline.push_pending(provisional);
        self.publish_timeline();

        match self.phase {
            Phase::Live => {
                let channel = match (&self.channel, self.channel_connected) {
                    (Some(channel), true) => channel.clone(),
                    // Dead channel: fail the entry right here, no network.
                    _ => {
                        self.fail_send(temp_id, "channel not connected");
                        return;
                    }
                };
                let accepted = channel
                    .publish(self.pair.current_user, self.pair.other_user, &text)
                    .await;
                if !accepted {
                    self.fail_send(temp_id, "transport rejected the frame");
                }
                // Accepted frames stay pending until the echo reconciles
                // them.
            }
            Phase::Polling => {
                // HTTP fallback; the POST response is the echo.
                let api = self.api.clone();
                let pair = self.pair;
                let epoch = self.session_epoch;
                let internal = internal_tx.clone();
                tokio::spawn(async move {
                    let result = api
                        .send_message(pair.current_user, pair.other_user, &text)
                        .await;
                    let _ = internal
                        .send(InternalEvent::SendResult {
                            epoch,
                            temp_id,
                            result,
                        })
                        .await;
                });
            }
            Phase::Idle | Phase::Loading => {
                self.fail_send(temp_id, "not connected");
            }
        }
    }

    fn handle_internal(&mut self, event: InternalEvent) {
        match event {
            InternalEvent::Channel { epoch, event } if epoch == self.session_epoch => {
                self.handle_channel_event(event);
            }
            InternalEvent::Polled { epoch, messages } if epoch == self.session_epoch => {
                // A batch may add nothing and still reconcile a pending
                // entry, so publish unconditionally.
                self.timeline.merge(messages);
                self.publish_timeline();
            }
            InternalEvent::SendResult {
                epoch,
                temp_id,
                result,
            } if epoch == self.session_epoch => match result {
                Ok(echo) => {
                    self.timeline.merge(vec![echo]);
                    self.publish_timeline();
                }
                Err(err) => self.fail_send(temp_id, &err.to_string()),
            },
            // Stale epoch: a superseded channel, poll loop or send
            // resolved late. Dropped without touching state.
            _ => {}
        }
    }

    fn handle_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Connected => {
                self.channel_connected = true;
                self.set_error_clear();
                self.set_state(ConnectionState::Connected);
            }
            ChannelEvent::Disconnected => {
                // The transport reconnects underneath; surface the gap.
                self.channel_connected = false;
                self.set_state(ConnectionState::Connecting);
            }
            ChannelEvent::Messages(batch) => {
                self.timeline.merge(batch);
                self.publish_timeline();
            }
            ChannelEvent::Error(reason) => {
                warn!("Channel error: {reason}");
                self.set_error(reason.clone());
                // An error on a live subscription is informational; only
                // a channel that is actually down becomes an error state.
                if !self.channel_connected {
                    self.set_state(ConnectionState::Error(reason));
                }
            }
        }
    }

    /// Mark a provisional entry failed. Terminal for that message: a
    /// resend synthesizes a new entry.
    fn fail_send(&mut self, temp_id: Uuid, reason: &str) {
        warn!("Send failed: {reason}");
        self.set_error(format!("send rejected: {reason}"));
        if self.timeline.mark_failed(temp_id) {
            self.publish_timeline();
        }
    }

    /// Invalidate the running session: bump the epoch, abort the poll
    /// loop, drop the channel. The timeline is intentionally untouched.
    async fn teardown(&mut self) {
        self.bump_epoch();
        if let Some(cancel) = self.poll_cancel.take() {
            cancel.cancel();
        }
        if let Some(channel) = self.channel.take() {
            channel.disconnect().await;
        }
        self.channel_connected = false;
        self.phase = Phase::Idle;
    }

    fn bump_epoch(&mut self) -> u64 {
        self.session_epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.session_epoch
    }

    fn publish_timeline(&self) {
        let _ = self.timeline_tx.send(self.timeline.snapshot());
    }

    fn set_state(&self, state: ConnectionState) {
        let _ = self.state_tx.send(state);
    }

    fn set_error(&self, reason: String) {
        let _ = self.error_tx.send(Some(reason));
    }

    fn set_error_clear(&self) {
        let _ = self.error_tx.send(None);
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
