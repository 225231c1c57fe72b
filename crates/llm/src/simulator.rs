use std::time::Duration;

use bytes::Bytes;
use futures::{StreamExt, stream};

use crate::transport::{
    BoxFuture, ByteStream, StreamQuery, StreamTransport, TransportError, TransportResponse,
    TransportResult,
};

pub const GREETING_TEXT: &str = "Hello there! I am a simulated assistant streaming this reply \
one word at a time. Ask me anything and I will answer with some placeholder text.";

pub const LOREM_IPSUM_TEXT: &str = "Lorem ipsum dolor sit amet, consectetur adipiscing elit, \
sed do eiusmod tempor incididunt ut labore et dolore magna aliqua. Ut enim ad minim veniam, \
quis nostrud exercitation ullamco laboris nisi ut aliquip ex ea commodo consequat. Duis aute \
irure dolor in reprehenderit in voluptate velit esse cillum dolore eu fugiat nulla pariatur.";

/// In-process stand-in for the streaming endpoint.
///
/// Greets when the query mentions "hi" or "hello", otherwise answers with
/// lorem ipsum, spreading the words evenly over the requested duration.
#[derive(Debug, Clone)]
pub struct SimulatedTransport {
    greeting: String,
    fallback: String,
}

impl Default for SimulatedTransport {
    fn default() -> Self {
        Self::new(GREETING_TEXT, LOREM_IPSUM_TEXT)
    }
}

impl SimulatedTransport {
    pub fn new(greeting: impl Into<String>, fallback: impl Into<String>) -> Self {
        Self {
            greeting: greeting.into(),
            fallback: fallback.into(),
        }
    }

    pub fn reply_for(&self, query: &str) -> &str {
        let query = query.to_lowercase();
        if query.contains("hi") || query.contains("hello") {
            &self.greeting
        } else {
            &self.fallback
        }
    }

    fn stream_words(&self, query: &StreamQuery) -> ByteStream {
        let chunks = self
            .reply_for(&query.query)
            .split_whitespace()
            .enumerate()
            .map(|(index, word)| {
                if index == 0 {
                    Bytes::from(word.to_string())
                } else {
                    Bytes::from(format!(" {word}"))
                }
            })
            .collect::<Vec<_>>();
        let delay = word_delay(query.duration, chunks.len());

        Box::pin(
            stream::iter(chunks.into_iter().enumerate()).then(move |(index, chunk)| async move {
                if index > 0 && !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Ok::<_, TransportError>(chunk)
            }),
        )
    }
}

fn word_delay(duration_secs: f64, words: usize) -> Duration {
    if words == 0 || !duration_secs.is_finite() || duration_secs <= 0.0 {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(duration_secs / words as f64)
}

impl StreamTransport for SimulatedTransport {
    fn name(&self) -> &str {
        "simulated"
    }

    fn send<'a>(
        &'a self,
        query: &'a StreamQuery,
    ) -> BoxFuture<'a, TransportResult<TransportResponse>> {
        Box::pin(async move {
            tracing::debug!(query = %query.query, duration = query.duration, "simulating stream");
            Ok(TransportResponse::new(200, Some(self.stream_words(query))))
        })
    }
}
