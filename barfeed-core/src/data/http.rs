//! Blocking HTTP access with bounded rate-limit backoff.
//!
//! Providers answer HTTP 429 when hammered. Instead of sleeping forever,
//! `HttpFetcher` retries a bounded number of times with exponential backoff,
//! checks the caller's cancel token before each attempt and while sleeping,
//! and gives up with `RateLimitExceeded`.

use super::provider::{DataError, FetchContext};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// Cooperative cancellation signal shared between a caller and the pipeline.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Err(Cancelled) once the token has been triggered.
    pub fn check(&self) -> Result<(), DataError> {
        if self.is_cancelled() {
            Err(DataError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sleep for `duration`, waking early with Err(Cancelled) if cancelled.
    pub fn sleep(&self, duration: Duration) -> Result<(), DataError> {
        let deadline = Instant::now() + duration;
        loop {
            self.check()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            std::thread::sleep((deadline - now).min(SLEEP_SLICE));
        }
    }
}

/// Bounded exponential backoff for rate-limited requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt; total attempts = max_retries + 1.
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Relative jitter applied to each delay, 0.0 disables it.
    pub jitter: f64,
    pub timeout_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            jitter: 0.1,
            timeout_secs: 30,
        }
    }
}

impl RetryPolicy {
    /// Reject settings the backoff loop cannot honor.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_retries == 0 {
            return Err("max_retries must be at least 1".into());
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(format!("jitter {} must be within 0.0..=1.0", self.jitter));
        }
        if self.timeout_secs == 0 {
            return Err("timeout_secs must be at least 1".into());
        }
        Ok(())
    }

    /// Delay before retry number `attempt` (1-based).
    ///
    /// A server-provided `Retry-After` replaces the exponential step but is
    /// still capped at `max_delay_ms`.
    pub fn delay_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let max = Duration::from_millis(self.max_delay_ms);
        let exp = attempt.saturating_sub(1).min(20);
        let step = retry_after
            .unwrap_or_else(|| Duration::from_millis(self.base_delay_ms).saturating_mul(1u32 << exp));
        let step = step.min(max);
        if self.jitter > 0.0 {
            let jitter = self.jitter.min(1.0);
            let factor = 1.0 + rand::thread_rng().gen_range(-jitter..=jitter);
            step.mul_f64(factor.max(0.0)).min(max)
        } else {
            step
        }
    }
}

/// Shared blocking HTTP client used by every adapter.
pub struct HttpFetcher {
    client: reqwest::blocking::Client,
    policy: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(policy: RetryPolicy) -> Result<Self, DataError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(policy.timeout_secs))
            .user_agent("Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36")
            .build()
            .map_err(|e| DataError::NetworkFailure {
                url: String::new(),
                status: None,
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self { client, policy })
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// GET `url` and return the body as text.
    ///
    /// 429 responses are retried per the policy; any other non-success status
    /// or transport error fails immediately with `NetworkFailure`.
    pub fn get_text(&self, url: &str, ctx: FetchContext<'_>) -> Result<String, DataError> {
        let attempts = self.policy.max_retries + 1;

        for attempt in 0..attempts {
            ctx.cancel.check()?;

            let resp = self
                .client
                .get(url)
                .send()
                .map_err(|e| DataError::NetworkFailure {
                    url: url.to_string(),
                    status: None,
                    reason: e.to_string(),
                })?;
            let status = resp.status();

            if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                if attempt + 1 == attempts {
                    break;
                }
                let retry_after = resp
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.trim().parse::<u64>().ok())
                    .map(Duration::from_secs);
                let delay = self.policy.delay_for(attempt + 1, retry_after);
                ctx.events
                    .on_retry(ctx.pair, url, attempt + 1, delay, "HTTP 429 Too Many Requests");
                ctx.cancel.sleep(delay)?;
                continue;
            }

            if !status.is_success() {
                return Err(DataError::NetworkFailure {
                    url: url.to_string(),
                    status: Some(status.as_u16()),
                    reason: format!("HTTP {status}"),
                });
            }

            return resp.text().map_err(|e| DataError::NetworkFailure {
                url: url.to_string(),
                status: Some(status.as_u16()),
                reason: format!("failed to read body: {e}"),
            });
        }

        Err(DataError::RateLimitExceeded {
            url: url.to_string(),
            attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> RetryPolicy {
        RetryPolicy {
            max_retries: 4,
            base_delay_ms: 100,
            max_delay_ms: 500,
            jitter: 0.0,
            timeout_secs: 5,
        }
    }

    #[test]
    fn delay_doubles_per_attempt() {
        let p = no_jitter();
        assert_eq!(p.delay_for(1, None), Duration::from_millis(100));
        assert_eq!(p.delay_for(2, None), Duration::from_millis(200));
        assert_eq!(p.delay_for(3, None), Duration::from_millis(400));
    }

    #[test]
    fn delay_is_capped() {
        let p = no_jitter();
        assert_eq!(p.delay_for(4, None), Duration::from_millis(500));
        assert_eq!(p.delay_for(60, None), Duration::from_millis(500));
    }

    #[test]
    fn retry_after_overrides_but_stays_capped() {
        let p = no_jitter();
        assert_eq!(
            p.delay_for(1, Some(Duration::from_secs(120))),
            Duration::from_millis(500)
        );
        let p = RetryPolicy {
            max_delay_ms: 10_000,
            ..no_jitter()
        };
        assert_eq!(p.delay_for(1, Some(Duration::from_secs(3))), Duration::from_secs(3));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let p = RetryPolicy {
            jitter: 0.5,
            ..no_jitter()
        };
        for _ in 0..50 {
            let d = p.delay_for(1, None);
            assert!(d >= Duration::from_millis(50) && d <= Duration::from_millis(150));
        }
    }

    #[test]
    fn oversized_jitter_does_not_panic() {
        for jitter in [f64::INFINITY, f64::NAN, 1e12] {
            let p = RetryPolicy {
                jitter,
                ..no_jitter()
            };
            assert!(p.validate().is_err());
            assert!(p.delay_for(1, None) <= Duration::from_millis(p.max_delay_ms));
        }
    }

    #[test]
    fn cancelled_token_interrupts_sleep() {
        let token = CancelToken::new();
        token.cancel();
        let started = Instant::now();
        assert!(matches!(
            token.sleep(Duration::from_secs(10)),
            Err(DataError::Cancelled)
        ));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn token_clones_share_state() {
        let a = CancelToken::new();
        let b = a.clone();
        assert!(b.check().is_ok());
        a.cancel();
        assert!(b.is_cancelled());
    }
}
