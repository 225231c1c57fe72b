use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use trickle_reactive::error::{DecodeSnafu, EncodeSnafu};
use trickle_reactive::{
    CodecResult, ReactiveStore, Snapshot, StoreCodec, StoreOptions, StoreResult, Subscription,
};
use trickle_storage::KeyValueStore;

use super::message::{MessageClock, MessageEntry, MessageId, MessageText};

pub const DEFAULT_STORAGE_KEY: &str = "llm-messages";

/// Stored shape of a message. Live text is flattened to its current value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedMessage {
    pub id: MessageId,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_sender: bool,
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: u64,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl From<&MessageEntry> for PersistedMessage {
    fn from(entry: &MessageEntry) -> Self {
        Self {
            id: entry.id.clone(),
            is_sender: entry.is_sender,
            text: entry.text.current(),
            error: entry.error.clone(),
            timestamp: entry.timestamp,
        }
    }
}

impl From<PersistedMessage> for MessageEntry {
    fn from(message: PersistedMessage) -> Self {
        Self {
            id: message.id,
            is_sender: message.is_sender,
            text: MessageText::Final(message.text),
            error: message.error,
            timestamp: message.timestamp,
        }
    }
}

/// JSON array of `[id, message]` pairs.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageCodec;

impl StoreCodec<MessageId, MessageEntry> for MessageCodec {
    fn encode(&self, entries: &IndexMap<MessageId, MessageEntry>) -> CodecResult<String> {
        let pairs = entries
            .iter()
            .map(|(id, entry)| (id, PersistedMessage::from(entry)))
            .collect::<Vec<_>>();
        serde_json::to_string(&pairs).context(EncodeSnafu {
            stage: "message-codec-encode",
        })
    }

    fn decode(&self, raw: &str) -> CodecResult<IndexMap<MessageId, MessageEntry>> {
        let pairs: Vec<(MessageId, PersistedMessage)> =
            serde_json::from_str(raw).context(DecodeSnafu {
                stage: "message-codec-decode",
            })?;
        Ok(pairs
            .into_iter()
            .map(|(id, message)| (id, MessageEntry::from(message)))
            .collect())
    }
}

/// Ordered chat history. Every change emits a fresh snapshot.
pub struct MessageStore {
    entries: ReactiveStore<MessageId, MessageEntry>,
    clock: MessageClock,
}

impl Default for MessageStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl MessageStore {
    pub fn in_memory() -> Self {
        Self {
            entries: ReactiveStore::new(IndexMap::new()),
            clock: MessageClock::new(),
        }
    }

    /// Restores history saved under `storage_key` and keeps saving every change.
    pub fn persistent(backend: Arc<dyn KeyValueStore>, storage_key: impl Into<String>) -> Self {
        let options = StoreOptions::new(storage_key, backend, MessageCodec).with_auto_save(true);
        let entries = ReactiveStore::with_options(IndexMap::new(), options);
        let clock = MessageClock::new();
        if let Some(latest) = entries.snapshot().values().map(|entry| entry.timestamp).max() {
            clock.observe(latest);
        }
        tracing::debug!(restored = entries.len(), "message store ready");
        Self { entries, clock }
    }

    pub fn clock(&self) -> &MessageClock {
        &self.clock
    }

    /// Inserts or replaces the entry under its id.
    pub fn save(&self, entry: MessageEntry) {
        self.entries.set(entry.id.clone(), entry);
    }

    pub fn delete(&self, id: &MessageId) -> Option<MessageEntry> {
        let removed = self.entries.delete(id);
        if removed.is_none() {
            tracing::debug!(message_id = %id, "delete of unknown message");
        }
        removed
    }

    pub fn get(&self, id: &MessageId) -> Option<MessageEntry> {
        self.entries.get(id)
    }

    pub fn update(&self, id: &MessageId, edit: impl FnOnce(&mut MessageEntry)) -> bool {
        self.entries.update_entry(id, edit)
    }

    pub fn attach_error(&self, id: &MessageId, error: impl Into<String>) -> bool {
        let error = error.into();
        self.update(id, |entry| entry.error = Some(error))
    }

    /// Freezes a streaming entry's text. Returns `false` for unknown or
    /// already final entries.
    pub fn finalize(&self, id: &MessageId) -> bool {
        if !self.get(id).is_some_and(|entry| entry.text.is_live()) {
            return false;
        }
        self.update(id, |entry| {
            entry.text.finalize();
        })
    }

    /// Re-emits the current history, which also saves it.
    pub fn refresh(&self) {
        self.entries.touch();
    }

    pub fn persist(&self) -> StoreResult<()> {
        self.entries.save_to_storage()
    }

    pub fn subscribe<F>(&self, observer: F) -> Subscription
    where
        F: Fn(&Snapshot<MessageId, MessageEntry>) + Send + Sync + 'static,
    {
        self.entries.subscribe(observer)
    }

    pub fn snapshot(&self) -> Snapshot<MessageId, MessageEntry> {
        self.entries.snapshot()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use trickle_reactive::LiveText;
    use trickle_storage::MemoryKvStore;

    use super::*;

    fn sent(store: &MessageStore, text: &str) -> MessageEntry {
        let (id, timestamp) = store.clock().next();
        let entry = MessageEntry::sender(id, timestamp, text);
        store.save(entry.clone());
        entry
    }

    fn stored(backend: &MemoryKvStore) -> Vec<(MessageId, PersistedMessage)> {
        let raw = backend.get(DEFAULT_STORAGE_KEY).unwrap().unwrap();
        serde_json::from_str(&raw).unwrap()
    }

    #[test]
    fn persisted_shape_omits_defaults() {
        let sender = PersistedMessage {
            id: MessageId::from("1700000000000"),
            is_sender: true,
            text: "hi".to_string(),
            error: None,
            timestamp: 1_700_000_000_000,
        };
        assert_eq!(
            serde_json::to_string(&sender).unwrap(),
            r#"{"id":"1700000000000","isSender":true,"text":"hi","timestamp":1700000000000}"#
        );

        let receiver = PersistedMessage {
            is_sender: false,
            error: Some("boom".to_string()),
            ..sender
        };
        assert_eq!(
            serde_json::to_string(&receiver).unwrap(),
            r#"{"id":"1700000000000","text":"hi","error":"boom","timestamp":1700000000000}"#
        );
    }

    #[test]
    fn restores_saved_history() {
        let backend = Arc::new(MemoryKvStore::new());
        let store = MessageStore::persistent(backend.clone(), DEFAULT_STORAGE_KEY);
        let first = sent(&store, "hello");
        let second = sent(&store, "again");
        store.attach_error(&second.id, "Failed to send message!");

        let restored = MessageStore::persistent(backend, DEFAULT_STORAGE_KEY);
        let entries = restored.snapshot();
        assert_eq!(entries.keys().collect::<Vec<_>>(), vec![&first.id, &second.id]);
        assert_eq!(restored.get(&first.id), Some(first));
        assert_eq!(
            restored.get(&second.id).and_then(|entry| entry.error),
            Some("Failed to send message!".to_string())
        );
        assert!(restored.clock().next().1 > second.timestamp);
    }

    #[test]
    fn live_text_is_flattened_when_saved() {
        let backend = Arc::new(MemoryKvStore::new());
        let store = MessageStore::persistent(backend.clone(), DEFAULT_STORAGE_KEY);
        let live_text = LiveText::new("Waiting".to_string());
        let (id, timestamp) = store.clock().next();
        store.save(MessageEntry::receiver(id.clone(), timestamp, live_text.clone()));

        live_text.set("streamed so far".to_string());
        store.persist().unwrap();
        assert_eq!(stored(&backend)[0].1.text, "streamed so far");

        assert!(store.finalize(&id));
        assert!(live_text.is_closed());
        assert!(!store.finalize(&id));
        assert_eq!(
            store.get(&id).map(|entry| entry.text),
            Some(MessageText::Final("streamed so far".to_string()))
        );
    }

    #[test]
    fn deleted_messages_leave_emissions_and_storage() {
        let backend = Arc::new(MemoryKvStore::new());
        let store = MessageStore::persistent(backend.clone(), DEFAULT_STORAGE_KEY);
        let keep = sent(&store, "keep");
        let dropped = sent(&store, "drop");
        let emitted = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&emitted);
        let _subscription = store.subscribe(move |entries| sink.lock().push(entries.len()));

        assert_eq!(store.delete(&dropped.id).map(|entry| entry.id), Some(dropped.id));
        assert_eq!(*emitted.lock(), vec![2, 1]);
        assert_eq!(
            stored(&backend)
                .into_iter()
                .map(|(id, _)| id)
                .collect::<Vec<_>>(),
            vec![keep.id]
        );
    }

    #[test]
    fn corrupt_storage_starts_empty() {
        let backend = Arc::new(MemoryKvStore::new().with_entry(DEFAULT_STORAGE_KEY, "{not json"));
        let store = MessageStore::persistent(backend, DEFAULT_STORAGE_KEY);
        assert!(store.is_empty());
    }

    #[test]
    fn attach_error_ignores_missing_entries() {
        let store = MessageStore::in_memory();
        assert!(!store.attach_error(&MessageId::from("404"), "lost"));
        assert!(store.is_empty());
    }

    fn arb_message() -> impl Strategy<Value = PersistedMessage> {
        (
            any::<u64>(),
            any::<bool>(),
            any::<String>(),
            proptest::option::of(any::<String>()),
        )
            .prop_map(|(timestamp, is_sender, text, error)| PersistedMessage {
                id: MessageId::from_timestamp(timestamp),
                is_sender,
                text,
                error,
                timestamp,
            })
    }

    proptest! {
        #[test]
        fn codec_round_trips_any_history(
            messages in prop::collection::vec(arb_message(), 0..16)
        ) {
            let history = messages
                .into_iter()
                .map(|message| (message.id.clone(), MessageEntry::from(message)))
                .collect::<IndexMap<_, _>>();

            let encoded = MessageCodec.encode(&history).unwrap();
            let decoded = MessageCodec.decode(&encoded).unwrap();
            prop_assert_eq!(decoded, history);
        }

        #[test]
        fn restored_store_matches_saved_store(
            messages in prop::collection::vec(arb_message(), 0..8)
        ) {
            let backend = Arc::new(MemoryKvStore::new());
            let store = MessageStore::persistent(backend.clone(), DEFAULT_STORAGE_KEY);
            for message in messages {
                store.save(MessageEntry::from(message));
            }

            let restored = MessageStore::persistent(backend, DEFAULT_STORAGE_KEY);
            prop_assert_eq!(restored.snapshot(), store.snapshot());
        }
    }
}
