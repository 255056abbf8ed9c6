// conveyor-rabbitmq/src/options.rs
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use lapin::options::QueueDeclareOptions;
use lapin::types::FieldTable;
use lapin::Channel;

use conveyor_core::{AckPolicy, BackoffStrategy, BufferKeep, ConfigError, ConsumerSettings};

/// Hook run right after the channel is opened, before declaration and
/// bindings. An error aborts the connect attempt exactly like a setup
/// failure.
pub type AfterConnectFn =
    Arc<dyn Fn(Channel) -> BoxFuture<'static, Result<(), lapin::Error>> + Send + Sync>;

/// Per-instance option patch, re-applied on every reconnect so parameters can
/// vary across attempts (e.g. rotate endpoints).
pub type MergeOptionsFn = Arc<dyn Fn(usize, &mut RabbitOptions) + Send + Sync>;

/// Declaration parameters for the consumed queue. Leaving `declare` unset on
/// [`RabbitOptions`] means no declaration is attempted.
#[derive(Debug, Clone, Default)]
pub struct QueueDeclare {
    pub options: QueueDeclareOptions,
    pub arguments: FieldTable,
}

/// One binding of the consumed queue to an exchange.
#[derive(Debug, Clone, Default)]
pub struct Binding {
    pub exchange: String,
    pub routing_key: String,
    pub arguments: FieldTable,
}

#[derive(Clone)]
pub struct RabbitOptions {
    pub uri: String,
    /// Empty string asks the broker for a generated queue name at declare
    /// time.
    pub queue: String,
    pub prefetch_count: u16,
    pub buffer_size: Option<usize>,
    pub buffer_keep: BufferKeep,
    pub backoff_min: Duration,
    pub backoff_max: Duration,
    pub backoff_strategy: BackoffStrategy,
    pub metadata: Vec<String>,
    pub on_success: AckPolicy,
    pub on_failure: AckPolicy,
    pub declare: Option<QueueDeclare>,
    pub bindings: Vec<Binding>,
    pub merge_options: Option<MergeOptionsFn>,
    pub after_connect: Option<AfterConnectFn>,
}

impl Default for RabbitOptions {
    fn default() -> Self {
        let defaults = ConsumerSettings::default();
        Self {
            uri: "amqp://127.0.0.1:5672/%2f".into(),
            queue: defaults.queue,
            prefetch_count: defaults.prefetch_count,
            buffer_size: defaults.buffer_size,
            buffer_keep: defaults.buffer_keep,
            backoff_min: defaults.backoff_min,
            backoff_max: defaults.backoff_max,
            backoff_strategy: defaults.backoff_strategy,
            metadata: defaults.metadata,
            on_success: defaults.on_success,
            on_failure: defaults.on_failure,
            declare: None,
            bindings: Vec::new(),
            merge_options: None,
            after_connect: None,
        }
    }
}

impl fmt::Debug for RabbitOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RabbitOptions")
            .field("uri", &self.uri)
            .field("queue", &self.queue)
            .field("prefetch_count", &self.prefetch_count)
            .field("buffer_size", &self.buffer_size)
            .field("buffer_keep", &self.buffer_keep)
            .field("backoff_strategy", &self.backoff_strategy)
            .field("metadata", &self.metadata)
            .field("on_success", &self.on_success)
            .field("on_failure", &self.on_failure)
            .field("declare", &self.declare)
            .field("bindings", &self.bindings)
            .finish_non_exhaustive()
    }
}

impl RabbitOptions {
    fn settings(&self) -> ConsumerSettings {
        ConsumerSettings {
            queue: self.queue.clone(),
            prefetch_count: self.prefetch_count,
            buffer_size: self.buffer_size,
            buffer_keep: self.buffer_keep,
            backoff_min: self.backoff_min,
            backoff_max: self.backoff_max,
            backoff_strategy: self.backoff_strategy,
            metadata: self.metadata.clone(),
            on_success: self.on_success,
            on_failure: self.on_failure,
        }
    }
}

/// Validated per-attempt configuration: the merged options plus the
/// broker-agnostic settings derived from them.
#[derive(Debug, Clone)]
pub struct RabbitConfig {
    options: RabbitOptions,
    settings: ConsumerSettings,
}

impl RabbitConfig {
    pub(crate) fn build(options: RabbitOptions) -> Result<Self, ConfigError> {
        let settings = options.settings();
        settings.validate()?;
        Ok(Self { options, settings })
    }

    pub fn options(&self) -> &RabbitOptions {
        &self.options
    }

    pub fn settings(&self) -> &ConsumerSettings {
        &self.settings
    }
}

impl AsRef<ConsumerSettings> for RabbitConfig {
    fn as_ref(&self) -> &ConsumerSettings {
        &self.settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_mirror_the_options() {
        let options = RabbitOptions {
            queue: "orders".into(),
            prefetch_count: 10,
            metadata: vec!["routing_key".into()],
            ..Default::default()
        };
        let config = RabbitConfig::build(options).unwrap();
        assert_eq!(config.settings().queue, "orders");
        assert_eq!(config.settings().prefetch_count, 10);
        assert_eq!(config.settings().metadata, vec!["routing_key".to_string()]);
    }

    #[test]
    fn zero_prefetch_without_buffer_size_fails_validation() {
        let options = RabbitOptions {
            prefetch_count: 0,
            ..Default::default()
        };
        assert!(RabbitConfig::build(options).is_err());

        let options = RabbitOptions {
            prefetch_count: 0,
            buffer_size: Some(10_000),
            ..Default::default()
        };
        assert!(RabbitConfig::build(options).is_ok());
    }
}
