//! Messages module for Murmur Server
//!
//! The libsql-backed conversation and message repository. It is the relay's
//! persistence collaborator (it implements [`murmur_relay::MessageStore`]) and
//! also serves the conversation and history routes.

mod repository;
mod types;

pub use repository::MessageRepository;
pub use types::{Conversation, HistoryEntry};
