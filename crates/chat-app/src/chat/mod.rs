pub mod controller;
pub mod message;
pub mod store;

pub use controller::{ChatController, ChatError, ChatResult, WAITING_PLACEHOLDER};
pub use message::{MessageClock, MessageEntry, MessageId, MessageText};
pub use store::{DEFAULT_STORAGE_KEY, MessageCodec, MessageStore, PersistedMessage};
