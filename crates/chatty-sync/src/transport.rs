//! WebSocket transport adapter.
//!
//! Owns the raw connection to the broker endpoint and nothing else: it
//! reconnects with a fixed delay, exchanges heartbeats to detect silent
//! failures, and reports everything that happens over a typed event
//! channel. Frame semantics live one layer up in the channel client.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

/// Size of the outbound command buffer.
const COMMAND_BUFFER_SIZE: usize = 64;

/// Size of the inbound event buffer.
const EVENT_BUFFER_SIZE: usize = 256;

/// A silent connection is declared dead after this many missed outgoing
/// heartbeat intervals without any inbound traffic.
const HEARTBEAT_GRACE: u32 = 3;

/// Events reported by the transport to the layer above.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Socket established.
    Connected,
    /// Socket lost or closed. A reconnect attempt follows unless the
    /// transport was deliberately closed.
    Disconnected,
    /// Inbound text frame.
    Frame(String),
    /// Connection attempt or established connection failed, with a
    /// human-readable reason.
    Error(String),
}

/// Transport configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// `ws://` or `wss://` broker endpoint.
    pub url: String,
    /// Fixed delay between reconnect attempts.
    pub reconnect_delay: Duration,
    /// Outgoing heartbeat interval.
    pub heartbeat_interval: Duration,
}

enum TransportCommand {
    Send(String),
    Close,
}

/// Handle to a running transport task. Cheap to clone.
#[derive(Clone)]
pub struct Transport {
    cmd_tx: mpsc::Sender<TransportCommand>,
    connected: Arc<AtomicBool>,
}

impl Transport {
    /// Spawn the transport task. Events arrive on the returned receiver
    /// until the transport is closed.
    pub fn spawn(config: TransportConfig) -> (Self, mpsc::Receiver<TransportEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER_SIZE);
        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER_SIZE);
        let connected = Arc::new(AtomicBool::new(false));

        let task = TransportTask {
            config,
            cmd_rx,
            event_tx,
            connected: connected.clone(),
        };
        tokio::spawn(task.run());

        (Self { cmd_tx, connected }, event_rx)
    }

    /// Whether the socket is currently established.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Queue a text frame for sending. Returns whether the transport
    /// accepted the attempt; actual delivery is asynchronous.
    pub async fn send(&self, frame: String) -> bool {
        if !self.is_connected() {
            return false;
        }
        self.cmd_tx.send(TransportCommand::Send(frame)).await.is_ok()
    }

    /// Close the connection and stop reconnecting. Idempotent.
    pub async fn close(&self) {
        let _ = self.cmd_tx.send(TransportCommand::Close).await;
    }
}

enum SessionEnd {
    /// Closed on command; do not reconnect.
    Closed,
    /// Connection dropped; reconnect after the delay.
    Dropped,
}

struct TransportTask {
    config: TransportConfig,
    cmd_rx: mpsc::Receiver<TransportCommand>,
    event_tx: mpsc::Sender<TransportEvent>,
    connected: Arc<AtomicBool>,
}

impl TransportTask {
    async fn run(self) {
        let Self {
            config,
            mut cmd_rx,
            event_tx,
            connected,
        } = self;

        loop {
            match connect_async(&config.url).await {
                Ok((socket, _)) => {
                    info!("Transport connected to {}", config.url);
                    connected.store(true, Ordering::Relaxed);
                    emit(&event_tx, TransportEvent::Connected).await;

                    let end = run_session(&config, &mut cmd_rx, &event_tx, socket).await;

                    connected.store(false, Ordering::Relaxed);
                    emit(&event_tx, TransportEvent::Disconnected).await;

                    if matches!(end, SessionEnd::Closed) {
                        return;
                    }
                }
                Err(err) => {
                    warn!("Transport connect to {} failed: {}", config.url, err);
                    emit(
                        &event_tx,
                        TransportEvent::Error(format!("connect to {} failed: {err}", config.url)),
                    )
                    .await;
                }
            }

            if !wait_reconnect(config.reconnect_delay, &mut cmd_rx).await {
                return;
            }
        }
    }
}

/// Sleep out the reconnect delay, still honoring `Close`. Returns false
/// when the transport should stop.
async fn wait_reconnect(delay: Duration, cmd_rx: &mut mpsc::Receiver<TransportCommand>) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            cmd = cmd_rx.recv() => match cmd {
                Some(TransportCommand::Close) | None => return false,
                // Sends while disconnected are dropped.
                Some(TransportCommand::Send(_)) => {}
            },
        }
    }
}

async fn run_session(
    config: &TransportConfig,
    cmd_rx: &mut mpsc::Receiver<TransportCommand>,
    event_tx: &mpsc::Sender<TransportEvent>,
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
) -> SessionEnd {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut heartbeat = tokio::time::interval(config.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_inbound = Instant::now();

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(TransportCommand::Send(frame)) => {
                    if let Err(err) = ws_tx.send(WsMessage::Text(frame.into())).await {
                        emit(event_tx, TransportEvent::Error(format!("send failed: {err}"))).await;
                        return SessionEnd::Dropped;
                    }
                }
                Some(TransportCommand::Close) | None => {
                    let _ = ws_tx.send(WsMessage::Close(None)).await;
                    return SessionEnd::Closed;
                }
            },
            msg = ws_rx.next() => match msg {
                Some(Ok(WsMessage::Text(text))) => {
                    last_inbound = Instant::now();
                    emit(event_tx, TransportEvent::Frame(text.to_string())).await;
                }
                Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Binary(_))) => {
                    last_inbound = Instant::now();
                }
                Some(Ok(WsMessage::Close(_))) | None => {
                    debug!("Transport socket closed by peer");
                    return SessionEnd::Dropped;
                }
                Some(Ok(WsMessage::Frame(_))) => {}
                Some(Err(err)) => {
                    emit(event_tx, TransportEvent::Error(format!("socket error: {err}"))).await;
                    return SessionEnd::Dropped;
                }
            },
            _ = heartbeat.tick() => {
                let silence = last_inbound.elapsed();
                if silence > config.heartbeat_interval * HEARTBEAT_GRACE {
                    emit(event_tx, TransportEvent::Error(format!(
                        "heartbeat timeout after {silence:?}"
                    ))).await;
                    return SessionEnd::Dropped;
                }
                if ws_tx
                    .send(WsMessage::Text(chatty_protocol::HEARTBEAT.into()))
                    .await
                    .is_err()
                {
                    return SessionEnd::Dropped;
                }
            }
        }
    }
}

async fn emit(event_tx: &mpsc::Sender<TransportEvent>, event: TransportEvent) {
    if event_tx.send(event).await.is_err() {
        debug!("Transport event receiver dropped");
    }
}
