// conveyor-core/src/client.rs
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use tokio::sync::oneshot;

use crate::config::ConsumerSettings;
use crate::error::{BrokerError, ConfigError, ConnectError};
use crate::types::Delivery;

/// Acknowledgment surface of a live channel.
///
/// Implementations must be safe under concurrent invocation: different
/// pipeline stages ack independently and in parallel, and the dispatcher does
/// not serialize calls. A call against a handle whose channel has been
/// superseded must fail (or be dropped) without touching the then-live
/// channel.
#[async_trait]
pub trait AckChannel: Send + Sync {
    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;
    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError>;
}

/// Fires once when the watched resource becomes unavailable, carrying the
/// close reason. Dropping the sender without firing means orderly teardown.
pub type CloseSignal = oneshot::Receiver<String>;

/// A freshly opened channel plus close notifications for it and its parent
/// connection.
pub struct ChannelSession<Ch> {
    pub channel: Ch,
    pub connection_closed: CloseSignal,
    pub channel_closed: CloseSignal,
}

/// An active subscription on a channel.
pub struct Subscription {
    pub consumer_tag: String,
    /// Ends (`None`) on broker-initiated cancel, e.g. the queue was deleted.
    /// An `Err` item means the channel failed mid-stream.
    pub deliveries: BoxStream<'static, Result<Delivery, BrokerError>>,
}

/// The wire-protocol client, supplied as a pluggable implementation. The core
/// never depends on a concrete broker client, so a test double can stand in.
#[async_trait]
pub trait BrokerClient: Send + Sync + 'static {
    /// Client-specific configuration. Rebuilt on every reconnect attempt so
    /// per-attempt hooks can vary parameters, e.g. rotate endpoints.
    type Config: AsRef<ConsumerSettings> + Clone + Send + Sync + 'static;

    /// Concrete channel handle. Cloning must yield a handle to the same
    /// underlying channel.
    type Channel: AckChannel + Clone + Send + Sync + 'static;

    /// Validates and normalizes connection options for producer `index`.
    async fn init(&self, index: usize) -> Result<Self::Config, ConfigError>;

    /// Opens connection + channel and runs the after-connect hook, queue
    /// declaration and bindings, in that order. A later step failing leaves
    /// earlier topology side effects in place; callers must not assume
    /// atomicity.
    async fn setup_channel(
        &self,
        config: &Self::Config,
    ) -> Result<ChannelSession<Self::Channel>, ConnectError>;

    async fn consume(
        &self,
        channel: &Self::Channel,
        config: &Self::Config,
    ) -> Result<Subscription, ConnectError>;

    /// Stops new deliveries for `consumer_tag` while leaving the channel
    /// open.
    async fn cancel(
        &self,
        channel: &Self::Channel,
        consumer_tag: &str,
    ) -> Result<String, BrokerError>;

    /// Best-effort close of the underlying connection.
    async fn close_connection(&self, channel: &Self::Channel);
}
