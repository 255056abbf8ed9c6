// conveyor-rabbitmq/src/client.rs
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::message::Delivery as LapinDelivery;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicQosOptions,
    BasicRejectOptions, QueueBindOptions,
};
use lapin::types::FieldTable;
use lapin::{Channel, ChannelState, Connection, ConnectionProperties};
use serde_json::json;
use tokio::sync::oneshot;
use tracing::warn;

use conveyor_core::{
    AckChannel, BrokerClient, BrokerError, ChannelSession, CloseSignal, ConfigError,
    ConnectError, Delivery, Metadata, Subscription,
};

use crate::options::{RabbitConfig, RabbitOptions};

/// Live channel handle. Clones point at the same lapin channel; once the
/// state machine discards a generation, calls against its handles fail at the
/// broker and are absorbed by the dispatcher.
#[derive(Clone)]
pub struct RabbitChannel {
    connection: Arc<Connection>,
    channel: Channel,
    queue: String,
}

#[async_trait]
impl AckChannel for RabbitChannel {
    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|e| BrokerError(e.to_string()))
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        self.channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await
            .map_err(|e| BrokerError(e.to_string()))
    }
}

/// lapin-backed implementation of the broker client contract.
pub struct RabbitClient {
    options: RabbitOptions,
}

impl RabbitClient {
    pub fn new(options: RabbitOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl BrokerClient for RabbitClient {
    type Config = RabbitConfig;
    type Channel = RabbitChannel;

    async fn init(&self, index: usize) -> Result<RabbitConfig, ConfigError> {
        let mut options = self.options.clone();
        if let Some(merge) = options.merge_options.clone() {
            merge(index, &mut options);
        }
        RabbitConfig::build(options)
    }

    async fn setup_channel(
        &self,
        config: &RabbitConfig,
    ) -> Result<ChannelSession<RabbitChannel>, ConnectError> {
        let options = config.options();
        let connection = Connection::connect(&options.uri, ConnectionProperties::default())
            .await
            .map_err(classify)?;
        let connection_closed = monitor_connection(&connection);

        let channel = connection.create_channel().await.map_err(classify)?;

        if let Some(hook) = &options.after_connect {
            hook(channel.clone()).await.map_err(classify)?;
        }

        let queue = match &options.declare {
            Some(declare) => {
                let reply = channel
                    .queue_declare(&options.queue, declare.options, declare.arguments.clone())
                    .await
                    .map_err(classify)?;
                reply.name().as_str().to_string()
            }
            None => options.queue.clone(),
        };

        for binding in &options.bindings {
            channel
                .queue_bind(
                    &queue,
                    &binding.exchange,
                    &binding.routing_key,
                    QueueBindOptions::default(),
                    binding.arguments.clone(),
                )
                .await
                .map_err(classify)?;
        }

        channel
            .basic_qos(options.prefetch_count, BasicQosOptions { global: false })
            .await
            .map_err(classify)?;

        let channel_closed = monitor_channel(&channel);
        Ok(ChannelSession {
            channel: RabbitChannel {
                connection: Arc::new(connection),
                channel,
                queue,
            },
            connection_closed,
            channel_closed,
        })
    }

    async fn consume(
        &self,
        channel: &RabbitChannel,
        _config: &RabbitConfig,
    ) -> Result<Subscription, ConnectError> {
        // Empty tag: the broker generates one.
        let consumer = channel
            .channel
            .basic_consume(
                &channel.queue,
                "",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(classify)?;
        let consumer_tag = consumer.tag().to_string();
        let deliveries = consumer
            .map(|item| {
                item.map(into_delivery)
                    .map_err(|e| BrokerError(e.to_string()))
            })
            .boxed();
        Ok(Subscription {
            consumer_tag,
            deliveries,
        })
    }

    async fn cancel(
        &self,
        channel: &RabbitChannel,
        consumer_tag: &str,
    ) -> Result<String, BrokerError> {
        channel
            .channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|e| BrokerError(e.to_string()))?;
        Ok(consumer_tag.to_string())
    }

    async fn close_connection(&self, channel: &RabbitChannel) {
        if let Err(e) = channel.connection.close(200, "consumer shutdown").await {
            warn!("connection close failed: {e}");
        }
    }
}

fn monitor_connection(connection: &Connection) -> CloseSignal {
    let (tx, rx) = oneshot::channel();
    let mut tx = Some(tx);
    connection.on_error(move |err| {
        if let Some(tx) = tx.take() {
            let _ = tx.send(err.to_string());
        }
    });
    rx
}

/// lapin has no channel-level error callback, so channel liveness is polled.
fn monitor_channel(channel: &Channel) -> CloseSignal {
    let (tx, rx) = oneshot::channel();
    let watched = channel.clone();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        loop {
            tick.tick().await;
            if tx.is_closed() {
                return;
            }
            if !matches!(watched.status().state(), ChannelState::Connected) {
                let _ = tx.send(format!("channel {} no longer connected", watched.id()));
                return;
            }
        }
    });
    rx
}

fn into_delivery(delivery: LapinDelivery) -> Delivery {
    let attributes = delivery_attributes(&delivery);
    Delivery {
        delivery_tag: delivery.delivery_tag,
        redelivered: delivery.redelivered,
        payload: delivery.data.clone(),
        attributes,
    }
}

fn delivery_attributes(delivery: &LapinDelivery) -> Metadata {
    let mut attributes = Metadata::new();
    attributes.insert("delivery_tag".into(), json!(delivery.delivery_tag));
    attributes.insert("redelivered".into(), json!(delivery.redelivered));
    attributes.insert("exchange".into(), json!(delivery.exchange.as_str()));
    attributes.insert("routing_key".into(), json!(delivery.routing_key.as_str()));

    let properties = &delivery.properties;
    if let Some(v) = properties.content_type() {
        attributes.insert("content_type".into(), json!(v.as_str()));
    }
    if let Some(v) = properties.content_encoding() {
        attributes.insert("content_encoding".into(), json!(v.as_str()));
    }
    if let Some(v) = properties.delivery_mode() {
        attributes.insert("delivery_mode".into(), json!(v));
    }
    if let Some(v) = properties.priority() {
        attributes.insert("priority".into(), json!(v));
    }
    if let Some(v) = properties.correlation_id() {
        attributes.insert("correlation_id".into(), json!(v.as_str()));
    }
    if let Some(v) = properties.reply_to() {
        attributes.insert("reply_to".into(), json!(v.as_str()));
    }
    if let Some(v) = properties.expiration() {
        attributes.insert("expiration".into(), json!(v.as_str()));
    }
    if let Some(v) = properties.message_id() {
        attributes.insert("message_id".into(), json!(v.as_str()));
    }
    if let Some(v) = properties.timestamp() {
        attributes.insert("timestamp".into(), json!(v));
    }
    if let Some(v) = properties.kind() {
        attributes.insert("type".into(), json!(v.as_str()));
    }
    if let Some(v) = properties.user_id() {
        attributes.insert("user_id".into(), json!(v.as_str()));
    }
    if let Some(v) = properties.app_id() {
        attributes.insert("app_id".into(), json!(v.as_str()));
    }
    if let Some(v) = properties.cluster_id() {
        attributes.insert("cluster_id".into(), json!(v.as_str()));
    }
    if let Some(headers) = properties.headers() {
        if let Ok(value) = serde_json::to_value(headers) {
            attributes.insert("headers".into(), value);
        }
    }
    attributes
}

/// Retryable: socket-level failures, handshake interruptions and the
/// access-refused/not-allowed/connection-forced reply family. Anything else
/// is escalated instead of retried.
fn classify(err: lapin::Error) -> ConnectError {
    match &err {
        lapin::Error::IOError(_)
        | lapin::Error::InvalidConnectionState(_)
        | lapin::Error::InvalidChannelState(_) => ConnectError::Retryable(err.to_string()),
        lapin::Error::ProtocolError(e) if matches!(e.get_id(), 320 | 403 | 530) => {
            ConnectError::Retryable(err.to_string())
        }
        _ => ConnectError::Fatal(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn io_errors_are_retryable() {
        let err = lapin::Error::IOError(Arc::new(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            "connection refused",
        )));
        assert!(classify(err).is_retryable());
    }

    #[test]
    fn closed_connection_state_is_retryable() {
        let err = lapin::Error::InvalidConnectionState(lapin::ConnectionState::Closed);
        assert!(classify(err).is_retryable());
    }

    #[test]
    fn unclassified_errors_are_fatal() {
        assert!(!classify(lapin::Error::ChannelsLimitReached).is_retryable());
    }

    #[tokio::test]
    async fn init_reapplies_the_merge_hook_per_attempt() {
        let options = RabbitOptions {
            queue: "orders".into(),
            merge_options: Some(Arc::new(|index, opts: &mut RabbitOptions| {
                opts.queue = format!("orders-{index}");
            })),
            ..Default::default()
        };
        let client = RabbitClient::new(options);
        let config = client.init(3).await.unwrap();
        assert_eq!(config.settings().queue, "orders-3");
    }

    #[tokio::test]
    async fn init_surfaces_invalid_merged_options() {
        let options = RabbitOptions {
            merge_options: Some(Arc::new(|_, opts: &mut RabbitOptions| {
                opts.prefetch_count = 0;
                opts.buffer_size = None;
            })),
            ..Default::default()
        };
        let client = RabbitClient::new(options);
        assert!(client.init(0).await.is_err());
    }
}
