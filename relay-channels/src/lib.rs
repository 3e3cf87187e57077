//! Channel adapters for relay.
//!
//! Adapters are pure I/O: they convert platform messages to/from relay
//! `InboundMessage` / `OutboundMessage` and never touch conversation state.

mod telegram;
mod traits;
mod types;
mod webchat;
mod whatsapp;

pub use telegram::TelegramAdapter;
pub use traits::ChannelAdapter;
pub use types::{
    ChannelKind, InboundMessage, MessageId, OutboundMessage, SenderId, ThreadHandle,
};
pub use webchat::WebChatAdapter;
pub use whatsapp::WhatsAppCloudAdapter;
