use futures::StreamExt;
use snafu::Snafu;
use trickle_reactive::LiveText;

use crate::decoder::Utf8StreamDecoder;
use crate::transport::{ByteStream, TransportError, TransportResponse};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum PumpError {
    #[snafu(display("Empty response body received"))]
    EmptyBody { stage: &'static str },
    #[snafu(display("failed to read streamed response on `{stage}`: {source}"))]
    Read {
        stage: &'static str,
        source: TransportError,
    },
}

pub type PumpResult<T> = Result<T, PumpError>;

type UpdateHook = Box<dyn FnMut(&LiveText) + Send>;
type DoneHook = Box<dyn FnOnce(&LiveText, Option<&PumpError>) + Send>;

/// Where streamed text is published.
pub enum PumpTarget {
    Ready(LiveText),
    /// Built lazily, once the pump starts.
    Factory(Box<dyn FnOnce() -> LiveText + Send>),
}

impl PumpTarget {
    fn resolve(self) -> LiveText {
        match self {
            Self::Ready(live_text) => live_text,
            Self::Factory(factory) => factory(),
        }
    }
}

impl From<LiveText> for PumpTarget {
    fn from(live_text: LiveText) -> Self {
        Self::Ready(live_text)
    }
}

/// Copies a chunked byte body into a [`LiveText`], one cumulative value per
/// decoded chunk, and closes the target when the body ends or fails.
pub struct StreamPump {
    target: PumpTarget,
    on_update: Option<UpdateHook>,
    on_done: Option<DoneHook>,
}

impl StreamPump {
    pub fn new(target: impl Into<PumpTarget>) -> Self {
        Self {
            target: target.into(),
            on_update: None,
            on_done: None,
        }
    }

    pub fn with_factory(factory: impl FnOnce() -> LiveText + Send + 'static) -> Self {
        Self::new(PumpTarget::Factory(Box::new(factory)))
    }

    /// Called after every published value.
    pub fn on_update(mut self, hook: impl FnMut(&LiveText) + Send + 'static) -> Self {
        self.on_update = Some(Box::new(hook));
        self
    }

    /// Called exactly once when pumping ends, with the error if it failed.
    pub fn on_done(
        mut self,
        hook: impl FnOnce(&LiveText, Option<&PumpError>) + Send + 'static,
    ) -> Self {
        self.on_done = Some(Box::new(hook));
        self
    }

    pub async fn pump_response(self, response: TransportResponse) -> PumpResult<String> {
        self.run(response.body).await
    }

    /// Drains `body` and returns the full decoded text.
    ///
    /// Publishes the accumulated text after every chunk that decodes to
    /// something. A chunk holding only part of a character publishes nothing
    /// and does not call `on_update`.
    pub async fn run(self, body: Option<ByteStream>) -> PumpResult<String> {
        let Self {
            target,
            mut on_update,
            on_done,
        } = self;
        let target = target.resolve();

        let Some(mut body) = body else {
            let error = PumpError::EmptyBody {
                stage: "pump-check-body",
            };
            tracing::warn!(error = %error, "response had no readable body");
            target.close();
            if let Some(on_done) = on_done {
                on_done(&target, Some(&error));
            }
            return Err(error);
        };

        let mut decoder = Utf8StreamDecoder::new();
        let mut accumulated = String::new();
        let mut chunks = 0_usize;
        while let Some(next) = body.next().await {
            let chunk = match next {
                Ok(chunk) => chunk,
                Err(source) => {
                    let error = PumpError::Read {
                        stage: "pump-read-chunk",
                        source,
                    };
                    tracing::warn!(chunks, error = %error, "stream read failed");
                    if let Some(on_done) = on_done {
                        on_done(&target, Some(&error));
                    }
                    target.close();
                    return Err(error);
                }
            };

            chunks += 1;
            let text = decoder.decode(&chunk);
            if !text.is_empty() {
                accumulated.push_str(&text);
                publish(&target, &accumulated, &mut on_update);
            }
        }

        let tail = decoder.finish();
        if !tail.is_empty() {
            accumulated.push_str(&tail);
            publish(&target, &accumulated, &mut on_update);
        }

        tracing::debug!(chunks, chars = accumulated.chars().count(), "stream finished");
        target.close();
        if let Some(on_done) = on_done {
            on_done(&target, None);
        }
        Ok(accumulated)
    }
}

fn publish(target: &LiveText, accumulated: &str, on_update: &mut Option<UpdateHook>) {
    target.set(accumulated.to_string());
    if let Some(on_update) = on_update.as_mut() {
        on_update(target);
    }
}
