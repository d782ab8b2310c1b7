// Copyright 2024 Mason project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::future::Future;
use std::time::Duration;

use lazy_static::lazy_static;
use log::{debug, log, Level};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tonic::{Code, Status};

pub const DEFAULT_INITIAL_BACKOFF_SECONDS: u32 = 1;
pub const DEFAULT_MAX_BACKOFF_SECONDS: u32 = 60;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 1;

lazy_static! {
    // One process-wide generator: jitter quality matters more than contention on a value that
    // is read once per failed attempt.
    static ref JITTER_RNG: Mutex<StdRng> = Mutex::new(StdRng::from_entropy());
}

///
/// Parameters for retrying calls against a remote endpoint: exponential backoff with jitter and
/// a bounded number of attempts.
///
#[derive(Clone, Copy, Debug)]
pub struct RetryConfig {
    initial_backoff_seconds: u32,
    max_backoff_seconds: u32,
    max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> RetryConfig {
        RetryConfig {
            initial_backoff_seconds: DEFAULT_INITIAL_BACKOFF_SECONDS,
            max_backoff_seconds: DEFAULT_MAX_BACKOFF_SECONDS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl RetryConfig {
    pub fn new(
        initial_backoff_seconds: Option<u32>,
        max_backoff_seconds: Option<u32>,
        max_attempts: Option<u32>,
    ) -> Result<RetryConfig, String> {
        if let Some(seconds) = initial_backoff_seconds {
            if seconds < 1 {
                return Err(format!(
                    "Invalid initial amount of seconds provided: {seconds}. Value must be strictly greater than 0."
                ));
            }
        }
        if let Some(seconds) = max_backoff_seconds {
            if seconds < 1 {
                return Err(format!(
                    "Invalid max backoff provided: {seconds}. Value must be strictly greater than 0."
                ));
            }
        }
        if let Some(attempts) = max_attempts {
            if attempts < 1 {
                return Err(format!(
                    "Invalid max number of attempts provided: {attempts}. Value must be strictly greater than 0."
                ));
            }
        }
        Ok(RetryConfig {
            initial_backoff_seconds: initial_backoff_seconds
                .unwrap_or(DEFAULT_INITIAL_BACKOFF_SECONDS),
            max_backoff_seconds: max_backoff_seconds.unwrap_or(DEFAULT_MAX_BACKOFF_SECONDS),
            max_attempts: max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS),
        })
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// The deterministic part of the sleep before attempt `attempt + 1`: the initial backoff
    /// doubled once per completed attempt, saturating at the configured maximum.
    pub fn backoff_seconds(&self, attempt: u32) -> u32 {
        let mut backoff = self.initial_backoff_seconds;
        // On the first attempt the backoff is not doubled; a loop avoids overflow for large
        // attempt counts.
        for _ in 1..attempt {
            backoff <<= 1;
            if backoff >= self.max_backoff_seconds {
                return self.max_backoff_seconds;
            }
        }
        backoff.min(self.max_backoff_seconds)
    }

    ///
    /// The waiting time before attempt `attempt + 1`. The backoff is exponentially increased
    /// per attempt until it exceeds the maximum; a jitter of up to three times the backoff is
    /// added to spread the load on the reachable resources.
    ///
    pub fn sleep_time(&self, attempt: u32) -> Duration {
        let backoff = self.backoff_seconds(attempt);
        let jitter = JITTER_RNG.lock().gen_range(0..=3 * u64::from(backoff));
        Duration::from_secs(u64::from(backoff) + jitter)
    }
}

/// The outcome of a single attempt of a retried call.
pub enum CallOutcome<T> {
    Ok(T),
    /// The call failed in a way that a later attempt may not: retry.
    Transient(String),
    /// The call failed definitively: do not retry.
    Fatal(String),
}

///
/// Retry `f` according to `config`. The final error is logged at `fatal_log_level`; transient
/// failures are logged at debug as they are retried.
///
pub async fn retry_call<T, F, Fut>(
    config: RetryConfig,
    fatal_log_level: Level,
    description: &str,
    f: F,
) -> Result<T, String>
where
    F: Fn(u32) -> Fut,
    Fut: Future<Output = CallOutcome<T>>,
{
    let attempts = config.max_attempts();
    let mut last_error = "retry bound of zero attempts".to_string();
    for attempt in 1..=attempts {
        match f(attempt).await {
            CallOutcome::Ok(value) => return Ok(value),
            CallOutcome::Fatal(error) => {
                log!(fatal_log_level, "{description}: {error}");
                return Err(error);
            }
            CallOutcome::Transient(error) => {
                if attempt < attempts {
                    let sleep_for = config.sleep_time(attempt);
                    debug!(
                        "{description}: attempt {attempt}/{attempts} failed: {error}: retrying in {} seconds.",
                        sleep_for.as_secs()
                    );
                    tokio::time::sleep(sleep_for).await;
                } else {
                    log!(fatal_log_level, "{description}: after {attempt} attempts: {error}");
                }
                last_error = error;
            }
        }
    }
    Err(last_error)
}

/// Transient failures of non-action calls: the peer was unreachable or the call ran into its
/// deadline. Every other status is fatal immediately.
pub fn status_is_retryable(status: &Status) -> bool {
    matches!(status.code(), Code::Unavailable | Code::DeadlineExceeded)
}

///
/// Retry a gRPC call according to `config`. Retries exactly when the status code is
/// `UNAVAILABLE` or `DEADLINE_EXCEEDED`; any other status is returned to the caller
/// immediately.
///
pub async fn retry_call_grpc<T, F, Fut>(
    config: RetryConfig,
    description: &str,
    f: F,
) -> Result<T, Status>
where
    F: Fn(u32) -> Fut,
    Fut: Future<Output = Result<T, Status>>,
{
    let attempts = config.max_attempts();
    let mut last_status = Status::unknown("retry bound of zero attempts");
    for attempt in 1..=attempts {
        match f(attempt).await {
            Ok(value) => return Ok(value),
            Err(status) if !status_is_retryable(&status) => return Err(status),
            Err(status) => {
                if attempt < attempts {
                    let sleep_for = config.sleep_time(attempt);
                    debug!(
                        "{description}: attempt {attempt}/{attempts} failed: {:?}: {}: retrying in {} seconds.",
                        status.code(),
                        status.message(),
                        sleep_for.as_secs()
                    );
                    tokio::time::sleep(sleep_for).await;
                } else {
                    // The caller inspects the final status and reports it; emitting at debug
                    // avoids duplicating similar errors.
                    debug!(
                        "{description}: after {attempt} attempts: {:?}: {}",
                        status.code(),
                        status.message()
                    );
                }
                last_status = status;
            }
        }
    }
    Err(last_status)
}
