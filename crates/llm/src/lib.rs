//! Network side of trickle: transports that return a streamed body, a
//! dispatcher that debounces and retries them, and a pump that turns the
//! streamed bytes into live text.

mod decoder;
mod dispatcher;
mod http;
mod pump;
mod simulator;
mod transport;

pub use decoder::Utf8StreamDecoder;
pub use dispatcher::{
    Backoff, DEFAULT_DEBOUNCE, DEFAULT_JITTER_MAX, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_DELAY,
    DispatchError, DispatchHooks, DispatchPhase, DispatchResult, DispatcherConfig,
    RequestDispatcher,
};
pub use http::{HttpTransport, STREAM_PATH};
pub use pump::{PumpError, PumpResult, PumpTarget, StreamPump};
pub use simulator::{GREETING_TEXT, LOREM_IPSUM_TEXT, SimulatedTransport};
pub use transport::{
    BoxFuture, ByteStream, DEFAULT_STREAM_DURATION_SECS, StreamQuery, StreamTransport,
    TransportError, TransportResponse, TransportResult,
};
