use futures::StreamExt;
use snafu::ResultExt;

use crate::transport::{
    BoxFuture, BuildClientSnafu, ByteStream, HttpStatusSnafu, NetworkSnafu, ReadBodySnafu,
    StreamQuery, StreamTransport, TransportResponse, TransportResult,
};

pub const STREAM_PATH: &str = "/stream";

/// Posts queries as JSON to `{api_base_url}/stream` and exposes the chunked
/// response body as it arrives.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpTransport {
    pub fn new(api_base_url: &str) -> TransportResult<Self> {
        let client = reqwest::Client::builder()
            .build()
            .context(BuildClientSnafu {
                stage: "http-transport-new",
            })?;
        Ok(Self::with_client(client, api_base_url))
    }

    pub fn with_client(client: reqwest::Client, api_base_url: &str) -> Self {
        Self {
            client,
            endpoint: stream_endpoint(api_base_url),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

fn stream_endpoint(api_base_url: &str) -> String {
    format!("{}{STREAM_PATH}", api_base_url.trim().trim_end_matches('/'))
}

impl StreamTransport for HttpTransport {
    fn name(&self) -> &str {
        "http"
    }

    fn send<'a>(
        &'a self,
        query: &'a StreamQuery,
    ) -> BoxFuture<'a, TransportResult<TransportResponse>> {
        Box::pin(async move {
            let response = self
                .client
                .post(&self.endpoint)
                .json(query)
                .send()
                .await
                .context(NetworkSnafu { stage: "http-send" })?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return HttpStatusSnafu {
                    stage: "http-check-status",
                    status: status.as_u16(),
                    body,
                }
                .fail();
            }

            let body = if response.content_length() == Some(0) {
                None
            } else {
                let chunks = response.bytes_stream().map(|chunk| {
                    chunk.context(ReadBodySnafu {
                        stage: "http-read-chunk",
                    })
                });
                Some(Box::pin(chunks) as ByteStream)
            };

            tracing::debug!(
                endpoint = %self.endpoint,
                status = status.as_u16(),
                has_body = body.is_some(),
                "stream response received"
            );
            Ok(TransportResponse::new(status.as_u16(), body))
        })
    }
}
