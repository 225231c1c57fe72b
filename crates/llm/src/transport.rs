use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use futures::Stream;
use serde::{Deserialize, Serialize};
use snafu::Snafu;

/// Default value for [`StreamQuery::duration`], in seconds.
pub const DEFAULT_STREAM_DURATION_SECS: f64 = 5.0;

/// JSON payload posted to the streaming endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamQuery {
    pub query: String,
    /// How long the backend should take to stream its answer, in seconds.
    pub duration: f64,
}

impl StreamQuery {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            duration: DEFAULT_STREAM_DURATION_SECS,
        }
    }

    pub fn with_duration(mut self, duration: f64) -> Self {
        self.duration = duration;
        self
    }
}

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type ByteStream = Pin<Box<dyn Stream<Item = TransportResult<Bytes>> + Send + 'static>>;
pub type TransportResult<T> = Result<T, TransportError>;

pub struct TransportResponse {
    pub status: u16,
    /// `None` when the response carries no readable body at all.
    pub body: Option<ByteStream>,
}

impl TransportResponse {
    pub fn new(status: u16, body: Option<ByteStream>) -> Self {
        Self { status, body }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

impl std::fmt::Debug for TransportResponse {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("TransportResponse")
            .field("status", &self.status)
            .field("has_body", &self.body.is_some())
            .finish()
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum TransportError {
    #[snafu(display("failed to build http client on `{stage}`: {source}"))]
    BuildClient {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("network request failed on `{stage}`: {source}"))]
    Network {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("server responded with status {status}{}", status_body_suffix(body)))]
    HttpStatus {
        stage: &'static str,
        status: u16,
        body: String,
    },
    #[snafu(display("failed to read response body on `{stage}`: {source}"))]
    ReadBody {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("{message}"))]
    Unavailable {
        stage: &'static str,
        message: String,
    },
}

fn status_body_suffix(body: &str) -> String {
    let body = body.trim();
    if body.is_empty() {
        String::new()
    } else {
        format!(": {body}")
    }
}

/// Sends one query and hands back the response with its body still unread.
pub trait StreamTransport: Send + Sync {
    fn name(&self) -> &str;
    fn send<'a>(&'a self, query: &'a StreamQuery)
    -> BoxFuture<'a, TransportResult<TransportResponse>>;
}
