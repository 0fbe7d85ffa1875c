//! Bounded retry timing for connect and reconnect attempts.
//!
//! With the default multiplier of 1.0 every retry waits the same fixed
//! interval. A multiplier above 1.0 turns this into exponential backoff:
//!
//! ```text
//! delay[n] = min(initial * multiplier^(n-1), max_delay)
//! ```
//!
//! The number of attempts is bounded by `max_attempts` (the `max_retries`
//! setting). Once exceeded, `next_sleep` returns an error and the caller is
//! expected to give up.
//!
//! # Examples
//!
//! ```ignore
//! use std::time::Duration;
//! use wxbee_mqtt::Backoff;
//!
//! let mut backoff = Backoff::fixed(Duration::from_secs(5));
//! backoff.set_max_attempts(2);
//!
//! assert_eq!(backoff.next_sleep().unwrap(), Duration::from_secs(5));
//! assert_eq!(backoff.next_sleep().unwrap(), Duration::from_secs(5));
//! assert!(backoff.next_sleep().is_err());
//! ```

use std::time::Duration;

use thiserror::Error;

/// Error type for backoff exhaustion.
#[derive(Debug, Error)]
pub enum BackoffError {
    /// Maximum retry attempts exceeded with the given limit.
    #[error("Maximum number of attempts exceeded: {0}")]
    MaxAttemptLimitError(u32),
}

/// Retry timing controller.
///
/// Each failed attempt calls `next_sleep()`, which returns the delay to wait
/// before trying again. `reset()` is called once a connection succeeds.
#[derive(Debug, Clone)]
pub struct Backoff {
    /// The delay before the first retry.
    initial_delay: Duration,

    /// The delay that the next call to `next_sleep` returns.
    current_delay: Duration,

    /// Maximum delay cap.
    max_delay: Duration,

    /// Multiplicative factor applied after each attempt (1.0 = fixed delay).
    multiplier: f64,

    /// Count of retries handed out since the last reset.
    attempt: u32,

    /// Optional hard limit on retry attempts. If None, uses calculated_max_attempts.
    max_attempts: Option<u32>,

    /// Attempts needed to reach `max_delay`, computed from the timing parameters.
    calculated_max_attempts: u32,
}

impl Backoff {
    /// Creates a new backoff controller with custom timing parameters.
    ///
    /// `calculated_max_attempts` falls back to 1 when the delay cannot grow
    /// (`initial >= max` or `multiplier <= 1.0`); use `set_max_attempts` to
    /// bound retries explicitly in that case.
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        let calculated_max_attempts = Self::calculate_max_attempts(initial, max, multiplier);
        Self {
            initial_delay: initial,
            current_delay: initial,
            max_delay: max.max(initial),
            multiplier,
            attempt: 0,
            max_attempts: None,
            calculated_max_attempts,
        }
    }

    /// Creates a backoff that always waits `delay` between attempts.
    pub fn fixed(delay: Duration) -> Self {
        Self::new(delay, delay, 1.0)
    }

    /// Calculates the number of attempts before hitting the delay cap.
    ///
    /// Solves `initial * multiplier^n = max` for n. Minimum of 1.
    fn calculate_max_attempts(initial: Duration, max: Duration, multiplier: f64) -> u32 {
        if initial >= max || multiplier <= 1.0 || initial.is_zero() {
            return 1;
        }

        let initial_secs = initial.as_secs_f64();
        let max_secs = max.as_secs_f64();

        let n = (max_secs / initial_secs).log(multiplier);
        n.floor() as u32 + 1
    }

    /// Sets an explicit maximum number of attempts (0 means fail immediately).
    pub fn set_max_attempts(&mut self, max: u32) {
        self.max_attempts = Some(max);
    }

    /// Resets the backoff timer to its initial state.
    pub fn reset(&mut self) {
        self.current_delay = self.initial_delay;
        self.attempt = 0;
    }

    /// Returns the next sleep duration and advances the backoff timer.
    ///
    /// # Returns
    /// - `Ok(Duration)`: The sleep duration before the next retry attempt
    /// - `Err(BackoffError)`: If maximum attempts has been exceeded
    pub fn next_sleep(&mut self) -> Result<Duration, BackoffError> {
        self.attempt += 1;
        let effective_max = self.max_attempts.unwrap_or(self.calculated_max_attempts);

        if self.attempt > effective_max {
            return Err(BackoffError::MaxAttemptLimitError(effective_max));
        }

        let sleep = self.current_delay;

        let next_delay_secs = self.current_delay.as_secs_f64() * self.multiplier;
        self.current_delay = Duration::from_secs_f64(next_delay_secs).min(self.max_delay);

        Ok(sleep)
    }

    /// Gets the configured maximum delay.
    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Gets the explicit maximum attempts limit, if set.
    pub fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }

    /// Gets the current attempt count.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Gets the calculated maximum attempts based on timing parameters.
    pub fn calculated_max_attempts(&self) -> u32 {
        self.calculated_max_attempts
    }

    /// Gets the delay that will be returned by the next sleep.
    pub fn current_delay(&self) -> Duration {
        self.current_delay
    }
}

impl Default for Backoff {
    /// Five seconds between attempts, five attempts.
    fn default() -> Self {
        let mut backoff = Self::fixed(Duration::from_secs(5));
        backoff.set_max_attempts(5);
        backoff
    }
}
