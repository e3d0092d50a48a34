use std::future::Future;
use std::time::Duration;

use reqwest::StatusCode;
use tokio::time::sleep;
use tracing::{error, warn};

use crate::core::model::ByteRange;

/// Delay before retrying an attempt that timed out. Timeouts never use up
/// the `max_tries` budget.
pub const TIMEOUT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Linear backoff step: the `i`-th retry waits `i * BACKOFF_STEP`.
pub const BACKOFF_STEP: Duration = Duration::from_millis(500);

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("http status error: {0}")]
    Status(StatusCode),

    #[error("server returned {0} for a range request (should be 206)")]
    NotPartial(StatusCode),

    #[error("range not supported by server")]
    RangeNotSupported,

    #[error("upstream did not report a usable content length")]
    MissingLength,

    #[error("upstream sent more than the {expected} bytes of piece {range}")]
    Overrun { range: ByteRange, expected: u64 },

    #[error("upstream closed piece {range} after {received} of {expected} bytes")]
    ShortBody { range: ByteRange, received: u64, expected: u64 },

    #[error("invalid upstream request: {0}")]
    InvalidRequest(String),

    #[error("request timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retrying cannot help (4xx, or the resource is unusable for ranges).
    Fatal,
    /// Counted against `max_tries`.
    Transient,
    /// Retried forever at a fixed delay.
    Timeout,
}

impl FetchError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Status(s) if s.is_client_error() => ErrorClass::Fatal,
            Self::RangeNotSupported | Self::MissingLength | Self::InvalidRequest(_) => ErrorClass::Fatal,
            Self::Timeout => ErrorClass::Timeout,
            _ => ErrorClass::Transient,
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            return Self::Timeout;
        }
        match e.status() {
            Some(s) => Self::Status(s),
            None => Self::Transport(e.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_tries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_tries: 10 }
    }
}

impl RetryPolicy {
    pub fn new(max_tries: u32) -> Self {
        Self { max_tries }
    }

    /// Fresh per-operation state. Not shared between operations.
    pub fn start(&self, op: &'static str) -> RetryState {
        RetryState { op, max_tries: self.max_tries, attempt: 0 }
    }

    /// Runs `operation` until it succeeds or its error is not worth retrying.
    pub async fn run<T, F, Fut>(&self, op: &'static str, mut operation: F) -> Result<T, FetchError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let mut state = self.start(op);
        loop {
            match operation().await {
                Ok(v) => return Ok(v),
                Err(e) => state.backoff(e).await?,
            }
        }
    }
}

/// Retry bookkeeping for one logical operation.
///
/// Callers that need to keep borrowed state across attempts (piece fetches
/// writing into their window) drive the loop themselves with
/// [`RetryState::backoff`].
#[derive(Debug)]
pub struct RetryState {
    op: &'static str,
    max_tries: u32,
    attempt: u32,
}

impl RetryState {
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Sleeps before the next attempt, or hands the error back when the
    /// operation should give up.
    pub async fn backoff(&mut self, err: FetchError) -> Result<(), FetchError> {
        match err.class() {
            ErrorClass::Fatal => {
                warn!(op = self.op, error = %err, "failed, not retrying");
                Err(err)
            }
            ErrorClass::Timeout => {
                warn!(op = self.op, "timeout, retry in 1 second");
                sleep(TIMEOUT_RETRY_DELAY).await;
                Ok(())
            }
            ErrorClass::Transient => {
                self.attempt += 1;
                if self.attempt > self.max_tries {
                    error!(op = self.op, tries = self.max_tries, error = %err, "failed after all tries");
                    return Err(err);
                }
                let delay = BACKOFF_STEP * self.attempt;
                warn!(
                    op = self.op,
                    error = %err,
                    attempt = self.attempt,
                    max_tries = self.max_tries,
                    "failed, retry in {:.1} seconds",
                    delay.as_secs_f64()
                );
                sleep(delay).await;
                Ok(())
            }
        }
    }
}
