//! Subscription channel client.
//!
//! Layers STOMP on top of the transport: `CONNECT` on socket
//! establishment, a single `SUBSCRIBE` to the per-user inbox once the
//! broker confirms the session, `SEND` for publishes, and normalization
//! of inbound `MESSAGE` frames into message batches. The reaction logic
//! is a pure state machine ([`ChannelState`]) so it can be tested without
//! a socket; [`StompChannel`] wires it to a real [`Transport`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::sync::mpsc;
use uuid::Uuid;

use chatty_protocol::stomp::{self, Command, Frame};
use chatty_protocol::{SendMessageBody, inbox_destination, send_destination};

use crate::config::SyncConfig;
use crate::transport::{Transport, TransportConfig, TransportEvent};

/// Subscription id for the single inbox subscription.
const SUBSCRIPTION_ID: &str = "sub-0";

/// Events surfaced to the sync engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Broker session established and inbox subscribed.
    Connected,
    /// Channel lost; the transport keeps reconnecting underneath.
    Disconnected,
    /// A batch of messages pushed to the inbox.
    Messages(Vec<chatty_protocol::Message>),
    /// Broker or transport error. Does not necessarily mean the channel
    /// is down.
    Error(String),
}

/// Live delivery channel as the engine sees it.
///
/// [`StompChannel`] is the production implementation; tests substitute
/// fakes.
#[async_trait]
pub trait LiveChannel: Send + Sync {
    /// Publish one message. Returns whether the underlying transport
    /// accepted the frame; delivery confirmation arrives later as a
    /// pushed echo.
    async fn publish(&self, sender: Uuid, receiver: Uuid, text: &str) -> bool;

    /// Unsubscribe and deactivate the transport. Idempotent.
    async fn disconnect(&self);
}

/// Creates live channels. Injected into the engine so tests can supply
/// fakes.
pub trait ChannelFactory: Send + Sync {
    fn open(&self, user: Uuid, events: mpsc::Sender<ChannelEvent>) -> Arc<dyn LiveChannel>;
}

// ============================================================================
// Protocol state machine
// ============================================================================

/// What the channel wants done in response to a transport event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelAction {
    /// Send a raw frame over the transport.
    SendFrame(String),
    /// Surface an event to the engine.
    Emit(ChannelEvent),
}

/// Pure STOMP session logic: one inbox subscription per instance, frames
/// in, actions out.
pub struct ChannelState {
    user: Uuid,
    host: String,
    heartbeat_ms: u64,
    subscribed: bool,
}

impl ChannelState {
    pub fn new(user: Uuid, host: String, heartbeat_ms: u64) -> Self {
        Self {
            user,
            host,
            heartbeat_ms,
            subscribed: false,
        }
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscribed
    }

    /// React to one transport event. One event can produce 0..N actions.
    pub fn on_transport_event(&mut self, event: TransportEvent) -> Vec<ChannelAction> {
        match event {
            TransportEvent::Connected => {
                let connect =
                    Frame::connect(&self.host, self.heartbeat_ms, self.heartbeat_ms).encode();
                vec![ChannelAction::SendFrame(connect)]
            }
            TransportEvent::Disconnected => {
                self.subscribed = false;
                vec![ChannelAction::Emit(ChannelEvent::Disconnected)]
            }
            TransportEvent::Error(reason) => {
                vec![ChannelAction::Emit(ChannelEvent::Error(reason))]
            }
            TransportEvent::Frame(raw) => self.on_frame(&raw),
        }
    }

    fn on_frame(&mut self, raw: &str) -> Vec<ChannelAction> {
        if stomp::is_heartbeat(raw) {
            return Vec::new();
        }

        let frame = match Frame::parse(raw) {
            Ok(frame) => frame,
            Err(err) => {
                warn!("Dropping unparseable frame: {err}");
                return Vec::new();
            }
        };

        match frame.command {
            Command::Connected => {
                if let Some((sx, sy)) = frame.heart_beat() {
                    debug!("Broker heart-beat negotiated as {sx},{sy}");
                }
                // Subscribe only now: the broker ignores SUBSCRIBE frames
                // sent before the session handshake completes.
                let destination = inbox_destination(self.user);
                info!("Broker session up, subscribing to {destination}");
                self.subscribed = true;
                vec![
                    ChannelAction::SendFrame(
                        Frame::subscribe(SUBSCRIPTION_ID, &destination).encode(),
                    ),
                    ChannelAction::Emit(ChannelEvent::Connected),
                ]
            }
            Command::Message => match chatty_protocol::message::parse_message_payload(&frame.body)
            {
                Ok(batch) => {
                    debug!("Inbox push with {} message(s)", batch.len());
                    vec![ChannelAction::Emit(ChannelEvent::Messages(batch))]
                }
                Err(err) => {
                    // Dropped, never propagated to the timeline.
                    warn!("Dropping inbox frame with malformed body: {err}");
                    Vec::new()
                }
            },
            Command::Error => {
                let reason = frame
                    .get("message")
                    .map(str::to_string)
                    .unwrap_or_else(|| frame.body.clone());
                vec![ChannelAction::Emit(ChannelEvent::Error(reason))]
            }
            Command::Receipt => Vec::new(),
            other => {
                debug!("Ignoring unexpected {} frame", other.as_str());
                Vec::new()
            }
        }
    }

    /// Frames needed for a graceful teardown.
    pub fn disconnect_frames(&mut self) -> Vec<String> {
        let mut frames = Vec::new();
        if self.subscribed {
            frames.push(Frame::unsubscribe(SUBSCRIPTION_ID).encode());
            self.subscribed = false;
        }
        frames.push(Frame::disconnect().encode());
        frames
    }
}

// ============================================================================
// Production channel
// ============================================================================

/// [`LiveChannel`] over a real websocket transport.
pub struct StompChannel {
    transport: Transport,
    state: Arc<tokio::sync::Mutex<ChannelState>>,
    connected: Arc<AtomicBool>,
}

impl StompChannel {
    /// Open the channel: spawn the transport toward the broker endpoint
    /// and a task that drives [`ChannelState`] with its events.
    pub fn open(
        config: &SyncConfig,
        user: Uuid,
        events: mpsc::Sender<ChannelEvent>,
    ) -> Arc<Self> {
        let broker = config.broker_url();
        let host = host_of(&broker);
        let (transport, mut transport_rx) = Transport::spawn(TransportConfig {
            url: broker,
            reconnect_delay: config.reconnect_delay,
            heartbeat_interval: config.heartbeat_interval,
        });

        let state = Arc::new(tokio::sync::Mutex::new(ChannelState::new(
            user,
            host,
            config.heartbeat_interval.as_millis() as u64,
        )));
        let connected = Arc::new(AtomicBool::new(false));
        let channel = Arc::new(Self {
            transport: transport.clone(),
            state: state.clone(),
            connected: connected.clone(),
        });

        tokio::spawn(async move {
            while let Some(event) = transport_rx.recv().await {
                let actions = {
                    let mut state = state.lock().await;
                    let actions = state.on_transport_event(event);
                    connected.store(state.is_subscribed(), Ordering::Relaxed);
                    actions
                };
                for action in actions {
                    match action {
                        ChannelAction::SendFrame(frame) => {
                            transport.send(frame).await;
                        }
                        ChannelAction::Emit(channel_event) => {
                            if events.send(channel_event).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        });

        channel
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl LiveChannel for StompChannel {
    async fn publish(&self, sender: Uuid, receiver: Uuid, text: &str) -> bool {
        if !self.is_connected() {
            return false;
        }
        let body = SendMessageBody {
            sender,
            receiver,
            message_text: text.to_string(),
        };
        let json = match serde_json::to_string(&body) {
            Ok(json) => json,
            Err(err) => {
                warn!("Failed to serialize send body: {err}");
                return false;
            }
        };
        let frame = Frame::send(&send_destination(sender, receiver), json).encode();
        self.transport.send(frame).await
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::Relaxed);
        // Best effort: the frames only go out if the socket is still up.
        let frames = self.state.lock().await.disconnect_frames();
        for frame in frames {
            self.transport.send(frame).await;
        }
        self.transport.close().await;
    }
}

/// Default factory producing [`StompChannel`]s.
pub struct StompChannelFactory {
    config: SyncConfig,
}

impl StompChannelFactory {
    pub fn new(config: SyncConfig) -> Self {
        Self { config }
    }
}

impl ChannelFactory for StompChannelFactory {
    fn open(&self, user: Uuid, events: mpsc::Sender<ChannelEvent>) -> Arc<dyn LiveChannel> {
        StompChannel::open(&self.config, user, events)
    }
}

/// Host portion of a ws URL, for the STOMP `host` header.
fn host_of(url: &str) -> String {
    let rest = url
        .strip_prefix("wss://")
        .or_else(|| url.strip_prefix("ws://"))
        .unwrap_or(url);
    let host_port = rest.split('/').next().unwrap_or(rest);

    // IPv6 literals carry the port outside the brackets.
    if let Some(inner) = host_port.strip_prefix('[') {
        return inner
            .split_once(']')
            .map(|(host, _)| host.to_string())
            .unwrap_or_else(|| inner.to_string());
    }

    host_port
        .split(':')
        .next()
        .unwrap_or(host_port)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> Uuid {
        "11111111-1111-1111-1111-111111111111".parse().unwrap()
    }

    fn state() -> ChannelState {
        ChannelState::new(user(), "localhost".into(), 4000)
    }

    fn message_json(id: &str, created_at: i64) -> String {
        format!(
            r#"{{"id":"{id}","sender":"11111111-1111-1111-1111-111111111111","receiver":"22222222-2222-2222-2222-222222222222","text":"hi","createdAt":{created_at}}}"#
        )
    }

    #[test]
    fn test_connect_then_subscribe_order() {
        let mut state = state();

        // Socket up: CONNECT goes out, but no subscription yet.
        let actions = state.on_transport_event(TransportEvent::Connected);
        assert_eq!(actions.len(), 1);
        assert!(matches!(
            &actions[0],
            ChannelAction::SendFrame(f) if f.starts_with("CONNECT\n")
        ));
        assert!(!state.is_subscribed());

        // Broker confirms: SUBSCRIBE to the inbox, then surface Connected.
        let connected = "CONNECTED\nversion:1.2\nheart-beat:4000,4000\n\n\0";
        let actions = state.on_transport_event(TransportEvent::Frame(connected.into()));
        assert_eq!(actions.len(), 2);
        match &actions[0] {
            ChannelAction::SendFrame(f) => {
                assert!(f.starts_with("SUBSCRIBE\n"));
                assert!(f.contains("destination:/queue/messages/11111111-1111-1111-1111-111111111111"));
            }
            other => panic!("expected SUBSCRIBE, got {other:?}"),
        }
        assert_eq!(actions[1], ChannelAction::Emit(ChannelEvent::Connected));
        assert!(state.is_subscribed());
    }

    #[test]
    fn test_message_frame_normalizes_array_and_single() {
        let mut state = state();

        let raw = format!(
            "MESSAGE\ndestination:/queue/messages/x\n\n[{}]\0",
            message_json("33333333-3333-3333-3333-333333333333", 100)
        );
        let actions = state.on_transport_event(TransportEvent::Frame(raw));
        assert!(matches!(
            &actions[0],
            ChannelAction::Emit(ChannelEvent::Messages(batch)) if batch.len() == 1
        ));

        let raw = format!(
            "MESSAGE\ndestination:/queue/messages/x\n\n{}\0",
            message_json("33333333-3333-3333-3333-333333333333", 100)
        );
        let actions = state.on_transport_event(TransportEvent::Frame(raw));
        assert!(matches!(
            &actions[0],
            ChannelAction::Emit(ChannelEvent::Messages(batch)) if batch.len() == 1
        ));
    }

    #[test]
    fn test_malformed_body_dropped_silently() {
        let mut state = state();
        let raw = "MESSAGE\ndestination:/queue/messages/x\n\nnot json\0".to_string();
        let actions = state.on_transport_event(TransportEvent::Frame(raw));
        assert!(actions.is_empty());

        // The channel keeps working afterwards.
        let raw = format!(
            "MESSAGE\ndestination:/queue/messages/x\n\n[{}]\0",
            message_json("33333333-3333-3333-3333-333333333333", 100)
        );
        let actions = state.on_transport_event(TransportEvent::Frame(raw));
        assert_eq!(actions.len(), 1);
    }

    #[test]
    fn test_error_frame_surfaced() {
        let mut state = state();
        let raw = "ERROR\nmessage:bad destination\n\n\0".to_string();
        let actions = state.on_transport_event(TransportEvent::Frame(raw));
        assert_eq!(
            actions,
            vec![ChannelAction::Emit(ChannelEvent::Error(
                "bad destination".into()
            ))]
        );
        // An error frame alone does not drop the subscription.
    }

    #[test]
    fn test_heartbeat_ignored() {
        let mut state = state();
        assert!(state.on_transport_event(TransportEvent::Frame("\n".into())).is_empty());
    }

    #[test]
    fn test_disconnect_unsubscribes_once() {
        let mut state = state();
        state.on_transport_event(TransportEvent::Frame(
            "CONNECTED\nversion:1.2\n\n\0".into(),
        ));
        assert!(state.is_subscribed());

        let frames = state.disconnect_frames();
        assert_eq!(frames.len(), 2);
        assert!(frames[0].starts_with("UNSUBSCRIBE\n"));
        assert!(frames[1].starts_with("DISCONNECT\n"));

        // Idempotent: a second teardown has no subscription left.
        let frames = state.disconnect_frames();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].starts_with("DISCONNECT\n"));
    }

    #[test]
    fn test_transport_drop_clears_subscription() {
        let mut state = state();
        state.on_transport_event(TransportEvent::Frame(
            "CONNECTED\nversion:1.2\n\n\0".into(),
        ));
        let actions = state.on_transport_event(TransportEvent::Disconnected);
        assert_eq!(actions, vec![ChannelAction::Emit(ChannelEvent::Disconnected)]);
        assert!(!state.is_subscribed());
    }

    #[test]
    fn test_host_of() {
        assert_eq!(host_of("ws://localhost:8080/ws"), "localhost");
        assert_eq!(host_of("wss://chat.example.com/ws"), "chat.example.com");
        assert_eq!(host_of("ws://[::1]:8080/ws"), "::1");
        assert_eq!(host_of("ws://[2001:db8::7]/ws"), "2001:db8::7");
    }
}
