// conveyor-core/src/backoff.rs
use std::str::FromStr;
use std::time::Duration;

use rand::Rng;

use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStrategy {
    /// Retry disabled: the first connect failure is final.
    Stop,
    Exponential,
    Random,
    RandomExponential,
}

impl FromStr for BackoffStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, ConfigError> {
        match s {
            "stop" => Ok(BackoffStrategy::Stop),
            "exponential" => Ok(BackoffStrategy::Exponential),
            "random" => Ok(BackoffStrategy::Random),
            "random_exponential" => Ok(BackoffStrategy::RandomExponential),
            other => Err(ConfigError::InvalidOption {
                key: "backoff_type".into(),
                reason: format!("unknown strategy `{other}`"),
            }),
        }
    }
}

/// Pure retry-delay state. `advance` consumes the state and returns the delay
/// to wait plus the successor state; nothing here does I/O or keeps a counter
/// behind a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    strategy: BackoffStrategy,
    attempt: u32,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration, strategy: BackoffStrategy) -> Self {
        Self {
            min,
            max,
            strategy,
            attempt: 0,
        }
    }

    pub fn strategy(&self) -> BackoffStrategy {
        self.strategy
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// `None` means retry is disabled (`Stop`): the caller must treat the
    /// failed attempt as fatal instead of scheduling a timer.
    pub fn advance(self) -> Option<(Duration, Backoff)> {
        let delay = match self.strategy {
            BackoffStrategy::Stop => return None,
            BackoffStrategy::Exponential => self.exponential(),
            BackoffStrategy::Random => {
                let (lo, hi) = (as_millis(self.min), as_millis(self.max));
                Duration::from_millis(rand::rng().random_range(lo..=hi))
            }
            BackoffStrategy::RandomExponential => {
                // Uniform jitter in a half-width window around the exponential
                // value, clamped back into [min, max].
                let base = as_millis(self.exponential());
                let spread = base / 4;
                let jittered = rand::rng().random_range(base - spread..=base + spread);
                Duration::from_millis(jittered).clamp(self.min, self.max)
            }
        };
        Some((
            delay,
            Backoff {
                attempt: self.attempt.saturating_add(1),
                ..self
            },
        ))
    }

    /// State equivalent to a freshly constructed policy; applied on every
    /// successful connect.
    pub fn reset(self) -> Backoff {
        Backoff { attempt: 0, ..self }
    }

    fn exponential(&self) -> Duration {
        let factor = 1u32.checked_shl(self.attempt).unwrap_or(u32::MAX);
        self.min.checked_mul(factor).unwrap_or(self.max).min(self.max)
    }
}

fn as_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIN: Duration = Duration::from_millis(1000);
    const MAX: Duration = Duration::from_millis(30000);

    #[test]
    fn exponential_doubles_and_caps() {
        let mut backoff = Backoff::new(MIN, MAX, BackoffStrategy::Exponential);
        let mut delays = Vec::new();
        for _ in 0..7 {
            let (delay, next) = backoff.advance().unwrap();
            delays.push(delay.as_millis() as u64);
            backoff = next;
        }
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000, 30000, 30000]);
    }

    #[test]
    fn reset_restarts_the_sequence() {
        let backoff = Backoff::new(MIN, MAX, BackoffStrategy::Exponential);
        let (_, backoff) = backoff.advance().unwrap();
        let (_, backoff) = backoff.advance().unwrap();
        let (delay, _) = backoff.reset().advance().unwrap();
        assert_eq!(delay, MIN);
    }

    #[test]
    fn stop_disables_retry() {
        let backoff = Backoff::new(MIN, MAX, BackoffStrategy::Stop);
        assert!(backoff.advance().is_none());
    }

    #[test]
    fn random_stays_within_bounds_regardless_of_attempt() {
        let mut backoff = Backoff::new(MIN, MAX, BackoffStrategy::Random);
        for _ in 0..50 {
            let (delay, next) = backoff.advance().unwrap();
            assert!(delay >= MIN && delay <= MAX, "out of range: {delay:?}");
            backoff = next;
        }
    }

    #[test]
    fn random_exponential_jitters_around_the_exponential_value() {
        let backoff = Backoff::new(MIN, MAX, BackoffStrategy::RandomExponential);
        let (_, backoff) = backoff.advance().unwrap();
        let (delay, _) = backoff.advance().unwrap();
        // Second attempt: exponential value is 2000ms, window is +/-500ms.
        let ms = delay.as_millis() as u64;
        assert!((1500..=2500).contains(&ms), "out of window: {ms}");
    }

    #[test]
    fn random_exponential_never_exceeds_max() {
        let mut backoff = Backoff::new(MIN, MAX, BackoffStrategy::RandomExponential);
        for _ in 0..20 {
            let (delay, next) = backoff.advance().unwrap();
            assert!(delay <= MAX);
            assert!(delay >= MIN);
            backoff = next;
        }
    }

    #[test]
    fn strategy_names_parse() {
        assert_eq!(
            "random_exponential".parse::<BackoffStrategy>().unwrap(),
            BackoffStrategy::RandomExponential
        );
        assert!("fibonacci".parse::<BackoffStrategy>().is_err());
    }
}
