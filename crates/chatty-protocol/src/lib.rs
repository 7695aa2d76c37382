//! Canonical wire types for the Chatty messaging backend.
//!
//! Everything that crosses the wire lives here: the persisted message
//! model, the outbound send DTO, the destination naming conventions, the
//! broker URL derivation, and the STOMP 1.2 frame codec the subscription
//! channel rides on.

pub mod destinations;
pub mod message;
pub mod stomp;

pub use destinations::{broker_url, inbox_destination, send_destination};
pub use message::{CreateMessageRequest, Message, SendMessageBody};
pub use stomp::{Frame, FrameError, HEARTBEAT};
