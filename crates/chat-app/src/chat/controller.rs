use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use snafu::{Snafu, ensure};
use trickle_llm::{
    DEFAULT_STREAM_DURATION_SECS, DispatchHooks, RequestDispatcher, StreamPump, StreamQuery,
    TransportError, TransportResponse,
};
use trickle_reactive::{LiveText, ObservableValue, Snapshot};

use super::message::{MessageEntry, MessageId, MessageText};
use super::store::MessageStore;

/// Shown in a response entry until the first chunk arrives.
pub const WAITING_PLACEHOLDER: &str = "Waiting for response...";

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ChatError {
    #[snafu(display("cannot send an empty message"))]
    EmptyQuery { stage: &'static str },
    #[snafu(display("a message is already being sent"))]
    Busy { stage: &'static str },
}

pub type ChatResult<T> = Result<T, ChatError>;

/// Runs the send/stream cycle for one conversation.
///
/// Cheap to clone; clones drive the same store and dispatcher.
#[derive(Clone)]
pub struct ChatController {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<MessageStore>,
    dispatcher: RequestDispatcher,
    busy: ObservableValue<bool>,
    stream_duration: f64,
}

impl ChatController {
    pub fn new(store: Arc<MessageStore>, dispatcher: RequestDispatcher) -> Self {
        Self::with_stream_duration(store, dispatcher, DEFAULT_STREAM_DURATION_SECS)
    }

    pub fn with_stream_duration(
        store: Arc<MessageStore>,
        dispatcher: RequestDispatcher,
        stream_duration: f64,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                dispatcher,
                busy: ObservableValue::new(false),
                stream_duration,
            }),
        }
    }

    pub fn store(&self) -> &Arc<MessageStore> {
        &self.inner.store
    }

    pub fn messages(&self) -> Snapshot<MessageId, MessageEntry> {
        self.inner.store.snapshot()
    }

    /// `true` from submit until the response finished streaming or failed.
    pub fn busy(&self) -> ObservableValue<bool> {
        self.inner.busy.clone()
    }

    pub fn delete(&self, id: &MessageId) -> Option<MessageEntry> {
        self.inner.store.delete(id)
    }

    /// Records `query` as a sent message and starts sending it in the
    /// background. Must be called from within a tokio runtime.
    pub fn submit(&self, query: &str) -> ChatResult<MessageId> {
        let query = query.trim();
        ensure!(
            !query.is_empty(),
            EmptyQuerySnafu {
                stage: "chat-submit",
            }
        );
        let claimed = self
            .inner
            .busy
            .update(|busy| !std::mem::replace(busy, true))
            .unwrap_or(false);
        ensure!(
            claimed,
            BusySnafu {
                stage: "chat-submit",
            }
        );

        let store = &self.inner.store;
        let (sender_id, timestamp) = store.clock().next();
        store.save(MessageEntry::sender(sender_id.clone(), timestamp, query));
        tracing::debug!(message_id = %sender_id, "message submitted");

        let request = StreamQuery::new(query).with_duration(self.inner.stream_duration);
        let inner = Arc::clone(&self.inner);
        let id = sender_id.clone();
        tokio::spawn(async move { inner.exchange(id, request).await });
        Ok(sender_id)
    }

    /// Resolves once no message is being sent or streamed.
    pub async fn wait_idle(&self) {
        self.inner.busy.wait_for(|busy| !busy).await;
    }
}

impl Inner {
    async fn exchange(self: Arc<Self>, sender_id: MessageId, request: StreamQuery) {
        let on_response = {
            let inner = Arc::clone(&self);
            move |response: TransportResponse| inner.start_stream(response)
        };
        let on_error = {
            let store = Arc::clone(&self.store);
            let sender_id = sender_id.clone();
            move |error: &TransportError, _query: &StreamQuery| {
                let text = format!("Failed to send message!\nError: {error}");
                if !store.attach_error(&sender_id, text) {
                    tracing::warn!(
                        message_id = %sender_id,
                        "sent message was deleted before its error arrived"
                    );
                }
            }
        };
        let hooks = DispatchHooks::new()
            .on_response(on_response)
            .on_error(on_error);

        match self.dispatcher.dispatch(request, hooks).await {
            Ok(()) => return,
            Err(error) if error.is_superseded() => {
                tracing::debug!(message_id = %sender_id, "send superseded");
            }
            Err(error) => {
                tracing::debug!(message_id = %sender_id, error = %error, "send failed");
            }
        }
        self.busy.set(false);
    }

    fn start_stream(self: Arc<Self>, response: TransportResponse) {
        let (id, timestamp) = self.store.clock().next();
        let live_text = LiveText::new(WAITING_PLACEHOLDER.to_string());
        self.store.save(MessageEntry::receiver(
            id.clone(),
            timestamp,
            live_text.clone(),
        ));
        tracing::debug!(message_id = %id, status = response.status, "streaming response");

        let streamed = Arc::new(AtomicBool::new(false));
        let pump = StreamPump::new(live_text)
            .on_update({
                let streamed = Arc::clone(&streamed);
                move |_: &LiveText| streamed.store(true, Ordering::Relaxed)
            })
            .on_done(move |_, error| {
                match error {
                    None => {
                        self.store.finalize(&id);
                    }
                    Some(error) => {
                        let streamed = streamed.load(Ordering::Relaxed);
                        let message = format!("Failed to receive response!\nError: {error}");
                        self.store.update(&id, |entry| {
                            entry.text.finalize();
                            if !streamed {
                                entry.text = MessageText::Final(String::new());
                            }
                            entry.error = Some(message);
                        });
                    }
                }
                self.busy.set(false);
            });

        tokio::spawn(async move {
            if let Err(error) = pump.pump_response(response).await {
                tracing::warn!(error = %error, "response stream ended with an error");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;
    use trickle_llm::{
        BoxFuture, DispatcherConfig, SimulatedTransport, StreamTransport, TransportResult,
    };
    use trickle_storage::{KeyValueStore, MemoryKvStore};

    use super::*;
    use crate::chat::store::DEFAULT_STORAGE_KEY;

    struct RefusingTransport;

    impl StreamTransport for RefusingTransport {
        fn name(&self) -> &str {
            "refusing"
        }

        fn send<'a>(
            &'a self,
            _query: &'a StreamQuery,
        ) -> BoxFuture<'a, TransportResult<TransportResponse>> {
            Box::pin(async {
                Err(TransportError::Unavailable {
                    stage: "refusing-send",
                    message: "connection refused".to_string(),
                })
            })
        }
    }

    struct BodylessTransport;

    impl StreamTransport for BodylessTransport {
        fn name(&self) -> &str {
            "bodyless"
        }

        fn send<'a>(
            &'a self,
            _query: &'a StreamQuery,
        ) -> BoxFuture<'a, TransportResult<TransportResponse>> {
            Box::pin(async { Ok(TransportResponse::new(200, None)) })
        }
    }

    fn instant_config() -> DispatcherConfig {
        DispatcherConfig {
            debounce: Duration::ZERO,
            max_retries: 1,
            retry_delay: Duration::from_millis(10),
            jitter: false,
            ..DispatcherConfig::default()
        }
    }

    fn controller(
        transport: impl StreamTransport + 'static,
        store: Arc<MessageStore>,
    ) -> ChatController {
        let dispatcher = RequestDispatcher::new(Arc::new(transport), instant_config());
        ChatController::with_stream_duration(store, dispatcher, 0.0)
    }

    #[tokio::test]
    async fn streams_reply_into_a_new_entry() {
        let store = Arc::new(MessageStore::in_memory());
        let chat = controller(SimulatedTransport::new("hey there", "lorem"), store);

        let sender_id = chat.submit("  hello  ").unwrap();
        assert!(chat.busy().get());
        chat.wait_idle().await;

        let messages = chat.messages();
        let entries = messages.values().collect::<Vec<_>>();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].id, sender_id);
        assert_eq!(entries[0].text, MessageText::Final("hello".to_string()));
        assert!(entries[0].is_sender);
        assert!(!entries[1].is_sender);
        assert_eq!(entries[1].text, MessageText::Final("hey there".to_string()));
        assert_eq!(entries[1].error, None);
        assert!(!chat.busy().get());
    }

    #[tokio::test]
    async fn rejects_blank_and_concurrent_submissions() {
        let chat = controller(
            SimulatedTransport::default(),
            Arc::new(MessageStore::in_memory()),
        );

        assert!(matches!(chat.submit("   "), Err(ChatError::EmptyQuery { .. })));
        assert!(chat.messages().is_empty());

        chat.submit("first").unwrap();
        assert!(matches!(chat.submit("second"), Err(ChatError::Busy { .. })));
        chat.wait_idle().await;
        assert_eq!(chat.messages().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn send_failure_is_attached_to_the_sent_message() {
        let chat = controller(RefusingTransport, Arc::new(MessageStore::in_memory()));

        let sender_id = chat.submit("hello").unwrap();
        chat.wait_idle().await;

        let messages = chat.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(
            messages[&sender_id].error.as_deref(),
            Some("Failed to send message!\nError: connection refused")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn deleted_sender_does_not_block_failure_handling() {
        let chat = controller(RefusingTransport, Arc::new(MessageStore::in_memory()));

        let sender_id = chat.submit("hello").unwrap();
        chat.delete(&sender_id);
        chat.wait_idle().await;

        assert!(chat.messages().is_empty());
    }

    #[tokio::test]
    async fn empty_body_marks_the_reply_as_failed() {
        let chat = controller(BodylessTransport, Arc::new(MessageStore::in_memory()));

        chat.submit("hello").unwrap();
        chat.wait_idle().await;

        let messages = chat.messages();
        let reply = messages.values().nth(1).unwrap();
        assert_eq!(reply.text, MessageText::Final(String::new()));
        assert_eq!(
            reply.display_text(),
            "Failed to receive response!\nError: Empty response body received"
        );
    }

    #[tokio::test]
    async fn finished_exchange_is_persisted() {
        let backend = Arc::new(MemoryKvStore::new());
        let store = Arc::new(MessageStore::persistent(backend.clone(), DEFAULT_STORAGE_KEY));
        let chat = controller(SimulatedTransport::new("hi back", "lorem"), store);

        chat.submit("hi").unwrap();
        chat.wait_idle().await;

        let raw = backend.get(DEFAULT_STORAGE_KEY).unwrap().unwrap();
        assert!(raw.contains(r#""text":"hi back""#), "{raw}");
        assert!(!raw.contains(WAITING_PLACEHOLDER), "{raw}");

        let restored = MessageStore::persistent(backend, DEFAULT_STORAGE_KEY);
        assert_eq!(restored.snapshot(), chat.messages());
    }
}
