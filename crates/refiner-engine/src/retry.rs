use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, thiserror::Error)]
pub enum OracleError {
    #[error("judge oracle unavailable after {attempts} attempt(s): {last_error}")]
    Unavailable { attempts: u32, last_error: String },

    #[error("judge call cancelled after {attempts} attempt(s)")]
    Cancelled { attempts: u32 },

    #[error("judge transcript could not be encoded: {0}")]
    Encoding(String),

    #[error("judge not configured: {0}")]
    NotConfigured(String),
}

/// Why a single attempt did not produce usable text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptError {
    Transport(String),
    Status { code: u16, body: String },
    MissingContent(String),
}

impl fmt::Display for AttemptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptError::Transport(detail) => write!(f, "transport failure: {detail}"),
            AttemptError::Status { code, body } => write!(f, "status {code}: {body}"),
            AttemptError::MissingContent(detail) => write!(f, "missing content: {detail}"),
        }
    }
}

/// Shared flag that stops a retry loop before its next attempt.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
    /// Growth factor applied per retry; 1.0 keeps the interval fixed.
    pub backoff_multiplier: f64,
    pub max_backoff: Duration,
    pub temperature_step: f64,
    pub temperature_cap: f64,
    pub min_chars: usize,
    pub deadline: Option<Duration>,
    pub cancel: Option<CancelToken>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            backoff: Duration::from_secs(10),
            backoff_multiplier: 1.0,
            max_backoff: Duration::from_secs(60),
            temperature_step: 0.2,
            temperature_cap: 1.0,
            min_chars: 2,
            deadline: None,
            cancel: None,
        }
    }
}

impl RetryPolicy {
    /// No sleeping between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            backoff: Duration::ZERO,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (1-based).
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let factor = self
            .backoff_multiplier
            .max(1.0)
            .powi(retry.saturating_sub(1) as i32);
        let delay = self.backoff.as_secs_f64() * factor;
        Duration::from_secs_f64(delay.min(self.max_backoff.as_secs_f64()).max(0.0))
    }

    pub fn escalate(&self, temperature: f64) -> f64 {
        (temperature + self.temperature_step).min(self.temperature_cap)
    }

    fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .map(CancelToken::is_cancelled)
            .unwrap_or(false)
    }
}

#[derive(Debug)]
pub struct RetryNotice<'a> {
    pub attempt: u32,
    pub max_attempts: u32,
    pub error: &'a AttemptError,
    pub next_temperature: f64,
    pub delay: Duration,
}

/// Runs `call` with the current temperature until it returns enough text or the policy gives up.
///
/// Transport failures and missing fields retry unchanged after the backoff.
/// Non-success statuses also escalate the temperature.
pub fn with_retry<F, N>(
    policy: &RetryPolicy,
    temperature: f64,
    mut call: F,
    mut on_retry: N,
) -> Result<String, OracleError>
where
    F: FnMut(f64) -> Result<String, AttemptError>,
    N: FnMut(&RetryNotice<'_>),
{
    let started = Instant::now();
    let max_attempts = policy.max_attempts.max(1);
    let mut temperature = temperature;
    let mut last_error = String::new();

    for attempt in 1..=max_attempts {
        if policy.is_cancelled() {
            return Err(OracleError::Cancelled {
                attempts: attempt - 1,
            });
        }

        let error = match call(temperature) {
            Ok(text) if text.chars().count() >= policy.min_chars => return Ok(text),
            Ok(text) => AttemptError::MissingContent(format!(
                "response has {} character(s)",
                text.chars().count()
            )),
            Err(err) => err,
        };
        if matches!(error, AttemptError::Status { .. }) {
            temperature = policy.escalate(temperature);
        }
        last_error = error.to_string();
        if attempt == max_attempts {
            break;
        }

        let delay = policy.backoff_for(attempt);
        if let Some(deadline) = policy.deadline {
            if started.elapsed() + delay > deadline {
                return Err(OracleError::Unavailable {
                    attempts: attempt,
                    last_error: format!("{last_error} (deadline {:.1}s reached)", deadline.as_secs_f64()),
                });
            }
        }
        on_retry(&RetryNotice {
            attempt,
            max_attempts,
            error: &error,
            next_temperature: temperature,
            delay,
        });
        if !delay.is_zero() {
            thread::sleep(delay);
        }
    }

    Err(OracleError::Unavailable {
        attempts: max_attempts,
        last_error,
    })
}
