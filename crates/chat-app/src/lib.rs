//! Streaming chat client: message history, the send/stream controller and
//! the settings that wire them to a transport and a storage backend.

pub mod app;
pub mod chat;
pub mod settings;

pub use app::{AppError, AppResult, ChatApp};
