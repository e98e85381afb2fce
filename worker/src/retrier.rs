use std::{future::Future, io, time::Duration};

use rand::Rng;
use serde::Deserialize;
use tokio_retry::RetryIf;
use tonic::Code;
use tracing::debug;

/// Exponential backoff with jitter.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryPolicy {
    #[serde(deserialize_with = "millis::deserialize")]
    pub base_delay: Duration,
    #[serde(deserialize_with = "millis::deserialize")]
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Fraction of each delay that is randomized, in `[0, 1]`.
    pub jitter: f64,
    /// Attempts including the first one.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: 0.1,
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// The delays between attempts.
    pub fn backoff(&self) -> Backoff {
        Backoff {
            next: self.base_delay,
            max_delay: self.max_delay,
            multiplier: self.multiplier.max(1.0),
            jitter: self.jitter.clamp(0.0, 1.0),
            remaining: self.max_attempts.saturating_sub(1),
        }
    }

    /// Runs `action` until it succeeds, fails with an error that isn't
    /// retriable, or runs out of attempts.
    pub async fn retry<T, A, F>(&self, action: A) -> io::Result<T>
    where
        A: FnMut() -> F,
        F: Future<Output = io::Result<T>>,
    {
        RetryIf::spawn(self.backoff(), action, |e: &io::Error| {
            let retriable = is_retriable(e);
            debug!(err = %e, retriable, "attempt failed");
            retriable
        })
        .await
    }
}

#[derive(Debug)]
pub struct Backoff {
    next: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter: f64,
    remaining: u32,
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        let delay = self.next.min(self.max_delay);
        self.next = self.next.mul_f64(self.multiplier).min(self.max_delay);

        if self.jitter == 0.0 {
            return Some(delay);
        }
        let factor = rand::thread_rng().gen_range(1.0 - self.jitter..=1.0 + self.jitter);
        Some(delay.mul_f64(factor))
    }
}

/// Whether a failed peer write may succeed when attempted again.
pub fn is_retriable(err: &io::Error) -> bool {
    if let Some(status) = err.get_ref().and_then(|e| e.downcast_ref::<tonic::Status>()) {
        return matches!(
            status.code(),
            Code::Unknown
                | Code::DeadlineExceeded
                | Code::ResourceExhausted
                | Code::Aborted
                | Code::Internal
                | Code::Unavailable
        );
    }

    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::TimedOut
    )
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
