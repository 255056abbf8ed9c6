// conveyor-core/src/config.rs
use std::time::Duration;

use crate::ack::AckPolicy;
use crate::backoff::{Backoff, BackoffStrategy};
use crate::error::ConfigError;

/// Which end of the host pipeline's overflow buffer survives when it fills.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BufferKeep {
    First,
    #[default]
    Last,
}

/// Broker-agnostic consumer settings, shared by every client implementation.
///
/// `buffer_size`/`buffer_keep` size the host pipeline's own buffer; the
/// adapter never buffers locally. Flow control comes from the broker-side
/// prefetch limit, which is why disabling it (`prefetch_count: 0`) requires
/// an explicit buffer size.
#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    /// Empty string asks the broker to assign a name at declare time.
    pub queue: String,
    /// Maximum unacknowledged messages the broker will deliver before
    /// pausing. `0` disables server-side throttling.
    pub prefetch_count: u16,
    pub buffer_size: Option<usize>,
    pub buffer_keep: BufferKeep,
    pub backoff_min: Duration,
    pub backoff_max: Duration,
    pub backoff_strategy: BackoffStrategy,
    /// Delivery attributes to project into message metadata.
    pub metadata: Vec<String>,
    pub on_success: AckPolicy,
    pub on_failure: AckPolicy,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            queue: String::new(),
            prefetch_count: 50,
            buffer_size: None,
            buffer_keep: BufferKeep::default(),
            backoff_min: Duration::from_millis(1000),
            backoff_max: Duration::from_millis(30000),
            backoff_strategy: BackoffStrategy::RandomExponential,
            metadata: Vec::new(),
            on_success: AckPolicy::Ack,
            on_failure: AckPolicy::RejectAndRequeue,
        }
    }
}

impl ConsumerSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.prefetch_count == 0 && self.buffer_size.is_none() {
            return Err(ConfigError::MissingOption(
                "buffer_size is required when prefetch_count is 0".into(),
            ));
        }
        if self.backoff_min > self.backoff_max {
            return Err(ConfigError::InvalidOption {
                key: "backoff_min".into(),
                reason: "must not exceed backoff_max".into(),
            });
        }
        Ok(())
    }

    /// Fresh backoff state for these settings.
    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.backoff_min, self.backoff_max, self.backoff_strategy)
    }
}

impl AsRef<ConsumerSettings> for ConsumerSettings {
    fn as_ref(&self) -> &ConsumerSettings {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_prefetch_requires_a_buffer_size() {
        let settings = ConsumerSettings {
            prefetch_count: 0,
            ..Default::default()
        };
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::MissingOption(_))
        ));

        let settings = ConsumerSettings {
            prefetch_count: 0,
            buffer_size: Some(10_000),
            ..Default::default()
        };
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn inverted_backoff_bounds_are_rejected() {
        let settings = ConsumerSettings {
            backoff_min: Duration::from_secs(60),
            backoff_max: Duration::from_secs(1),
            ..Default::default()
        };
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::InvalidOption { .. })
        ));
    }

    #[test]
    fn defaults_validate() {
        assert!(ConsumerSettings::default().validate().is_ok());
    }
}
