//! A WebSocket chat relay with rooms and an optional generative-AI participant.
//!
//! The server side is [`web`] (HTTP front door and socket upgrade) on top of
//! [`relay`] (per-event operations), [`hub`] (connections and rooms) and
//! [`sessions`] (one conversation worker per connection). The client side is
//! [`client`] plus the call-mode state machine in [`voice`].

pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod generation;
pub mod hub;
pub mod protocol;
pub mod providers;
pub mod relay;
pub mod sessions;
pub mod voice;
pub mod web;

pub use config::Settings;
pub use error::{Fallback, GenerationError, RelayError};
pub use generation::{Conversation, GeminiBackend, GenerationBackend};
pub use protocol::{BroadcastPolicy, ChatMessage, ClientEvent, SendMessage, ServerEvent};
pub use relay::RelayState;
