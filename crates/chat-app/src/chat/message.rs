use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use trickle_reactive::LiveText;

/// Message key, the creation timestamp in unix milliseconds as a string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn from_timestamp(timestamp: u64) -> Self {
        Self(timestamp.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for MessageId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Issues strictly increasing timestamps, and ids derived from them.
///
/// Two messages created within the same millisecond get consecutive
/// timestamps instead of colliding.
#[derive(Debug, Default)]
pub struct MessageClock {
    last: AtomicU64,
}

impl MessageClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> (MessageId, u64) {
        let now = unix_millis();
        let mut last = self.last.load(Ordering::Relaxed);
        loop {
            let candidate = now.max(last.saturating_add(1));
            match self.last.compare_exchange_weak(
                last,
                candidate,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return (MessageId::from_timestamp(candidate), candidate),
                Err(actual) => last = actual,
            }
        }
    }

    /// Ensures later ids sort after `timestamp`.
    pub fn observe(&self, timestamp: u64) {
        self.last.fetch_max(timestamp, Ordering::AcqRel);
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}

#[derive(Debug, Clone)]
pub enum MessageText {
    Final(String),
    /// Still streaming.
    Live(LiveText),
}

impl MessageText {
    pub fn current(&self) -> String {
        match self {
            Self::Final(text) => text.clone(),
            Self::Live(live_text) => live_text.get(),
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, Self::Live(_))
    }

    pub fn live(&self) -> Option<&LiveText> {
        match self {
            Self::Live(live_text) => Some(live_text),
            Self::Final(_) => None,
        }
    }

    /// Closes a live text and freezes its current value. Returns `false` when
    /// the text was already final.
    pub fn finalize(&mut self) -> bool {
        let Self::Live(live_text) = self else {
            return false;
        };
        live_text.close();
        let text = live_text.get();
        *self = Self::Final(text);
        true
    }
}

impl PartialEq for MessageText {
    fn eq(&self, other: &Self) -> bool {
        self.is_live() == other.is_live() && self.current() == other.current()
    }
}

impl From<String> for MessageText {
    fn from(text: String) -> Self {
        Self::Final(text)
    }
}

impl From<LiveText> for MessageText {
    fn from(live_text: LiveText) -> Self {
        Self::Live(live_text)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MessageEntry {
    pub id: MessageId,
    pub is_sender: bool,
    pub text: MessageText,
    /// Set only when sending or streaming failed.
    pub error: Option<String>,
    pub timestamp: u64,
}

impl MessageEntry {
    pub fn sender(id: MessageId, timestamp: u64, text: impl Into<String>) -> Self {
        Self {
            id,
            is_sender: true,
            text: MessageText::Final(text.into()),
            error: None,
            timestamp,
        }
    }

    pub fn receiver(id: MessageId, timestamp: u64, text: impl Into<MessageText>) -> Self {
        Self {
            id,
            is_sender: false,
            text: text.into(),
            error: None,
            timestamp,
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.text.live().is_some_and(|live_text| !live_text.is_closed())
    }

    /// The text when there is any, the error otherwise.
    pub fn display_text(&self) -> String {
        let text = self.text.current();
        if text.is_empty() {
            self.error.clone().unwrap_or_default()
        } else {
            text
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn clock_never_repeats_within_a_millisecond() {
        let clock = MessageClock::new();
        let issued = (0..100).map(|_| clock.next()).collect::<Vec<_>>();
        for pair in issued.windows(2) {
            assert!(pair[1].1 > pair[0].1);
            assert_ne!(pair[1].0, pair[0].0);
        }
        let (id, timestamp) = &issued[0];
        assert_eq!(id.as_str(), timestamp.to_string());
    }

    #[test]
    fn clock_observes_restored_timestamps() {
        let clock = MessageClock::new();
        let far_future = unix_millis() + 60_000;
        clock.observe(far_future);
        assert_eq!(clock.next().1, far_future + 1);
    }

    #[test]
    fn finalize_freezes_live_text_once() {
        let live_text = LiveText::new("partial".to_string());
        let mut text = MessageText::Live(live_text.clone());

        assert!(text.finalize());
        assert!(live_text.is_closed());
        assert_eq!(text, MessageText::Final("partial".to_string()));
        assert!(!text.finalize());
    }

    #[test]
    fn display_falls_back_to_error_only_when_text_is_empty() {
        let mut entry = MessageEntry::receiver(MessageId::from("1"), 1, String::new());
        entry.error = Some("boom".to_string());
        assert_eq!(entry.display_text(), "boom");

        let mut sender = MessageEntry::sender(MessageId::from("2"), 2, "hi");
        sender.error = Some("boom".to_string());
        assert_eq!(sender.display_text(), "hi");
    }
}
