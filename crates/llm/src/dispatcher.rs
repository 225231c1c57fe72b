use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use snafu::{Snafu, ensure};
use tokio::sync::oneshot;
use trickle_reactive::ObservableValue;

use crate::transport::{
    HttpStatusSnafu, StreamQuery, StreamTransport, TransportError, TransportResponse,
    TransportResult,
};

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(300);
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(300);
pub const DEFAULT_JITTER_MAX: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Backoff {
    Fixed,
    #[default]
    Exponential,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DispatcherConfig {
    /// Quiet period a call waits for before it fires. Zero disables debouncing.
    pub debounce: Duration,
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub backoff: Backoff,
    pub jitter: bool,
    pub jitter_max: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            debounce: DEFAULT_DEBOUNCE,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
            backoff: Backoff::Exponential,
            jitter: true,
            jitter_max: DEFAULT_JITTER_MAX,
        }
    }
}

impl DispatcherConfig {
    /// Delay before retry number `retry` (zero-based), without jitter.
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.retry_delay,
            Backoff::Exponential => self
                .retry_delay
                .saturating_mul(2_u32.saturating_pow(retry)),
        }
    }

    fn jitter_sample(&self) -> Duration {
        if !self.jitter || self.jitter_max.is_zero() {
            return Duration::ZERO;
        }
        let max_ms = u64::try_from(self.jitter_max.as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(rand::rng().random_range(0..=max_ms))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchPhase {
    Idle,
    Debouncing,
    InFlight { attempt: u32 },
    Retrying { attempt: u32, delay: Duration },
    Succeeded,
    Failed,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum DispatchError {
    #[snafu(display("request was superseded by a newer call"))]
    Superseded { stage: &'static str },
    #[snafu(display("request failed after {attempts} attempt(s): {source}"))]
    Failed {
        stage: &'static str,
        attempts: u32,
        source: TransportError,
    },
}

impl DispatchError {
    pub fn is_superseded(&self) -> bool {
        matches!(self, Self::Superseded { .. })
    }
}

pub type DispatchResult<T> = Result<T, DispatchError>;

type ResponseHook = Box<dyn FnOnce(TransportResponse) + Send>;
type ErrorHook = Box<dyn FnOnce(&TransportError, &StreamQuery) + Send>;

/// Interceptors for one dispatched call.
#[derive(Default)]
pub struct DispatchHooks {
    on_response: Option<ResponseHook>,
    on_error: Option<ErrorHook>,
}

impl DispatchHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receives the successful response with its body unread.
    pub fn on_response(mut self, hook: impl FnOnce(TransportResponse) + Send + 'static) -> Self {
        self.on_response = Some(Box::new(hook));
        self
    }

    /// Runs once, after the last retry has failed.
    pub fn on_error(
        mut self,
        hook: impl FnOnce(&TransportError, &StreamQuery) + Send + 'static,
    ) -> Self {
        self.on_error = Some(Box::new(hook));
        self
    }
}

impl std::fmt::Debug for DispatchHooks {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("DispatchHooks")
            .field("on_response", &self.on_response.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// Debounced, retrying sender in front of a [`StreamTransport`].
///
/// Only the most recent call inside the debounce window reaches the
/// transport; the calls it replaced resolve with
/// [`DispatchError::Superseded`] and never run their hooks.
pub struct RequestDispatcher {
    transport: Arc<dyn StreamTransport>,
    config: DispatcherConfig,
    pending: Mutex<Option<oneshot::Sender<()>>>,
    phase: ObservableValue<DispatchPhase>,
}

impl RequestDispatcher {
    pub fn new(transport: Arc<dyn StreamTransport>, config: DispatcherConfig) -> Self {
        Self {
            transport,
            config,
            pending: Mutex::new(None),
            phase: ObservableValue::new(DispatchPhase::Idle),
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn transport(&self) -> &Arc<dyn StreamTransport> {
        &self.transport
    }

    /// Phase of the most recent call.
    pub fn phase(&self) -> ObservableValue<DispatchPhase> {
        self.phase.clone()
    }

    pub async fn dispatch(&self, query: StreamQuery, hooks: DispatchHooks) -> DispatchResult<()> {
        self.debounce().await?;

        let DispatchHooks {
            on_response,
            on_error,
        } = hooks;
        let mut retry = 0_u32;
        loop {
            let attempt = retry + 1;
            self.phase.set(DispatchPhase::InFlight { attempt });
            match self.attempt(&query).await {
                Ok(response) => {
                    tracing::debug!(
                        transport = self.transport.name(),
                        attempt,
                        status = response.status,
                        "request succeeded"
                    );
                    self.phase.set(DispatchPhase::Succeeded);
                    if let Some(on_response) = on_response {
                        on_response(response);
                    }
                    return Ok(());
                }
                Err(error) if retry < self.config.max_retries => {
                    let delay = self.config.backoff_delay(retry) + self.config.jitter_sample();
                    tracing::warn!(
                        transport = self.transport.name(),
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %error,
                        "request failed; retrying"
                    );
                    self.phase.set(DispatchPhase::Retrying { attempt, delay });
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
                Err(error) => {
                    tracing::error!(
                        transport = self.transport.name(),
                        attempts = attempt,
                        error = %error,
                        "request failed; giving up"
                    );
                    self.phase.set(DispatchPhase::Failed);
                    if let Some(on_error) = on_error {
                        on_error(&error, &query);
                    }
                    return Err(DispatchError::Failed {
                        stage: "dispatch-retry-exhausted",
                        attempts: attempt,
                        source: error,
                    });
                }
            }
        }
    }

    async fn debounce(&self) -> DispatchResult<()> {
        if self.config.debounce.is_zero() {
            return Ok(());
        }

        let (cancel_tx, cancel_rx) = oneshot::channel();
        if let Some(previous) = self.pending.lock().replace(cancel_tx) {
            let _ = previous.send(());
        }
        self.phase.set(DispatchPhase::Debouncing);

        tokio::select! {
            biased;
            _ = cancel_rx => {
                tracing::debug!("debounced call superseded");
                SupersededSnafu { stage: "dispatch-debounce" }.fail()
            }
            () = tokio::time::sleep(self.config.debounce) => Ok(()),
        }
    }

    async fn attempt(&self, query: &StreamQuery) -> TransportResult<TransportResponse> {
        let response = self.transport.send(query).await?;
        ensure!(
            response.is_success(),
            HttpStatusSnafu {
                stage: "dispatch-check-status",
                status: response.status,
                body: String::new(),
            }
        );
        Ok(response)
    }
}
