//! Realtime conversation sync for the Chatty messaging backend.
//!
//! Three layers, leaf-first:
//!
//! - [`transport`] owns the websocket connection: reconnect with a fixed
//!   delay, heartbeats, typed events upward.
//! - [`channel`] layers STOMP on top: per-user inbox subscription,
//!   publish, frame normalization, error surfacing.
//! - [`engine`] merges the initial history fetch, pushed frames,
//!   optimistic local sends and the long-poll fallback into one ordered,
//!   deduplicated timeline, fenced by an epoch counter.
//!
//! ```no_run
//! use chatty_sync::{ConversationPair, SyncConfig, SyncEngine};
//! # fn pair() -> ConversationPair { unimplemented!() }
//!
//! let engine = SyncEngine::start(SyncConfig::default(), pair());
//! engine.connect();
//! engine.send("hello");
//! let timeline = engine.timeline();
//! ```

pub mod api;
pub mod channel;
pub mod config;
pub mod engine;
pub mod error;
pub mod transport;

pub use api::{ConversationApi, HttpConversationApi};
pub use chatty_protocol::Message;
pub use channel::{ChannelEvent, ChannelFactory, LiveChannel, StompChannel};
pub use config::{DeliveryMode, SyncConfig};
pub use engine::timeline::{Timeline, TimelineEntry};
pub use engine::{ConnectionState, ConversationPair, SyncEngine};
pub use error::SyncError;
