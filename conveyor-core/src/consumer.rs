// conveyor-core/src/consumer.rs
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::ack::AckContext;
use crate::backoff::Backoff;
use crate::client::{AckChannel, BrokerClient, ChannelSession, CloseSignal, Subscription};
use crate::config::ConsumerSettings;
use crate::error::{BrokerError, ConfigError, ConnectError};
use crate::metadata;
use crate::sink::MessageSink;
use crate::types::{Delivery, Message};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Connecting,
    Consuming,
    Draining,
    Disconnected,
}

#[derive(Debug, Clone, Copy)]
enum Resource {
    Connection,
    Channel,
}

impl Resource {
    fn name(self) -> &'static str {
        match self {
            Resource::Connection => "connection",
            Resource::Channel => "channel",
        }
    }
}

enum Event<C: BrokerClient> {
    /// Outcome of the connect attempt started under `epoch`.
    Connected {
        epoch: u64,
        result: Result<(ChannelSession<C::Channel>, Subscription), ConnectError>,
    },
    /// Backoff timer fired.
    Retry,
    /// Health monitor reported the resource unavailable.
    HealthDown {
        epoch: u64,
        resource: Resource,
        reason: String,
    },
    Drain(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

/// Control handle for a running consumer. Acknowledgments do not go through
/// here — each [`Message`] carries its own ack context.
pub struct ConsumerHandle<C: BrokerClient> {
    tx: mpsc::Sender<Event<C>>,
    join: JoinHandle<()>,
}

impl<C: BrokerClient> ConsumerHandle<C> {
    /// Stops new deliveries while leaving the channel open for in-flight
    /// acknowledgments. No-op when disconnected. Returns as soon as the
    /// consumer stops accepting deliveries; it does not wait for pending
    /// acks, which complete asynchronously through the dispatcher.
    pub async fn drain(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Event::Drain(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Closes the underlying connection (best-effort) and terminates the
    /// owning task. Interrupts a pending reconnect timer: no reconnection
    /// happens after shutdown has been requested.
    pub async fn shutdown(self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Event::Shutdown(tx)).await.is_ok() {
            let _ = rx.await;
        }
        if let Err(e) = self.join.await {
            if !e.is_cancelled() {
                error!("consumer task panicked: {e}");
            }
        }
    }

    /// True once the owning task has terminated, whether by shutdown or by a
    /// fatal connect error.
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

/// Connection lifecycle state machine.
///
/// One tokio task owns the instance exclusively; delivery events, health
/// signals, timer firings and drain/shutdown requests all arrive through the
/// same serialized mailbox. Connect attempts run as separate tasks reporting
/// back through the mailbox, so the machine stays responsive to health
/// signals while a connection is being set up.
pub struct Consumer<C: BrokerClient> {
    client: Arc<C>,
    sink: Arc<dyn MessageSink>,
    index: usize,
    config: C::Config,
    state: State,
    /// Connect generation. Results and health signals stamped with an older
    /// epoch belong to a discarded channel and are ignored.
    epoch: u64,
    channel: Option<C::Channel>,
    consumer_tag: Option<String>,
    deliveries: Option<BoxStream<'static, Result<Delivery, BrokerError>>>,
    backoff: Backoff,
    connection_watch: Option<JoinHandle<()>>,
    channel_watch: Option<JoinHandle<()>>,
    retry_timer: Option<JoinHandle<()>>,
    tx: mpsc::Sender<Event<C>>,
    rx: mpsc::Receiver<Event<C>>,
}

impl<C: BrokerClient> Consumer<C> {
    /// Builds the configuration once via the client's `init`, validates it,
    /// and spawns the owning task, which enters `Connecting` immediately with
    /// that construction-time configuration.
    pub async fn start(
        client: Arc<C>,
        sink: Arc<dyn MessageSink>,
        index: usize,
    ) -> Result<ConsumerHandle<C>, ConfigError> {
        let config = client.init(index).await?;
        config.as_ref().validate()?;

        let (tx, rx) = mpsc::channel(32);
        let backoff = config.as_ref().backoff();
        let consumer = Consumer {
            client,
            sink,
            index,
            config,
            state: State::Connecting,
            epoch: 0,
            channel: None,
            consumer_tag: None,
            deliveries: None,
            backoff,
            connection_watch: None,
            channel_watch: None,
            retry_timer: None,
            tx: tx.clone(),
            rx,
        };
        let join = tokio::spawn(consumer.run());
        Ok(ConsumerHandle { tx, join })
    }

    async fn run(mut self) {
        self.spawn_connect_attempt();
        loop {
            tokio::select! {
                event = self.rx.recv() => {
                    let Some(event) = event else { break };
                    if !self.handle_event(event).await {
                        break;
                    }
                }
                item = next_delivery(&mut self.deliveries), if self.deliveries.is_some() => {
                    if !self.handle_delivery(item).await {
                        break;
                    }
                }
            }
        }
        self.teardown();
    }

    async fn handle_event(&mut self, event: Event<C>) -> bool {
        match event {
            Event::Connected { epoch, result } => self.handle_connected(epoch, result).await,
            Event::Retry => {
                self.retry_timer = None;
                self.reconnect(true).await
            }
            Event::HealthDown {
                epoch,
                resource,
                reason,
            } => self.handle_health_down(epoch, resource, reason).await,
            Event::Drain(reply) => {
                self.handle_drain().await;
                let _ = reply.send(());
                true
            }
            Event::Shutdown(reply) => {
                self.handle_shutdown().await;
                let _ = reply.send(());
                false
            }
        }
    }

    async fn handle_connected(
        &mut self,
        epoch: u64,
        result: Result<(ChannelSession<C::Channel>, Subscription), ConnectError>,
    ) -> bool {
        if epoch != self.epoch || self.state != State::Connecting {
            // Attempt superseded by a drain or shutdown in the meantime; do
            // not leak the connection it may have opened.
            if let Ok((session, _)) = result {
                self.client.close_connection(&session.channel).await;
            }
            return true;
        }
        match result {
            Ok((session, subscription)) => {
                info!(
                    "consuming queue={} consumer_tag={}",
                    self.config.as_ref().queue,
                    subscription.consumer_tag
                );
                self.register_watches(session.connection_closed, session.channel_closed);
                self.channel = Some(session.channel);
                self.consumer_tag = Some(subscription.consumer_tag);
                self.deliveries = Some(subscription.deliveries);
                self.backoff = self.config.as_ref().backoff();
                self.state = State::Consuming;
                true
            }
            Err(e) if e.is_retryable() => match self.backoff.advance() {
                Some((delay, next)) => {
                    warn!("connect failed, retrying in {delay:?}: {e}");
                    self.backoff = next;
                    self.schedule_retry(delay);
                    true
                }
                None => {
                    error!("connect failed and retry is disabled: {e}");
                    false
                }
            },
            Err(e) => {
                error!("connect failed with an unexpected error, giving up: {e}");
                false
            }
        }
    }

    async fn handle_health_down(&mut self, epoch: u64, resource: Resource, reason: String) -> bool {
        if epoch != self.epoch {
            return true;
        }
        match self.state {
            State::Consuming => {
                warn!("{} down: {reason}; reconnecting", resource.name());
                self.clear_stale();
                self.reconnect(true).await
            }
            State::Draining => {
                // Nothing left to resume; pending acks against the dead
                // channel will fail and be absorbed by the dispatcher.
                info!("{} down while draining: {reason}", resource.name());
                self.clear_stale();
                true
            }
            _ => true,
        }
    }

    async fn handle_drain(&mut self) {
        if self.state == State::Draining || self.state == State::Disconnected {
            return;
        }
        if let (Some(channel), Some(tag)) = (self.channel.clone(), self.consumer_tag.clone()) {
            if let Err(e) = self.client.cancel(&channel, &tag).await {
                // Best-effort: drain proceeds even if the broker refuses.
                warn!("cancel during drain failed: {e}");
            }
        }
        // The channel stays open for in-flight acknowledgments; only new
        // deliveries stop.
        self.deliveries = None;
        self.consumer_tag = None;
        self.state = State::Draining;
    }

    async fn handle_shutdown(&mut self) {
        if let Some(timer) = self.retry_timer.take() {
            timer.abort();
        }
        if let Some(watch) = self.connection_watch.take() {
            watch.abort();
        }
        if let Some(watch) = self.channel_watch.take() {
            watch.abort();
        }
        if let Some(channel) = self.channel.take() {
            self.client.close_connection(&channel).await;
        }
        self.consumer_tag = None;
        self.deliveries = None;
        self.state = State::Disconnected;
    }

    async fn handle_delivery(&mut self, item: Option<Result<Delivery, BrokerError>>) -> bool {
        match item {
            Some(Ok(delivery)) => {
                let Some(channel) = self.channel.clone() else {
                    return true;
                };
                let message = build_message(self.config.as_ref(), channel, delivery);
                self.sink.deliver(message).await;
                true
            }
            Some(Err(e)) => {
                warn!("delivery stream failed: {e}; reconnecting");
                self.clear_stale();
                self.reconnect(true).await
            }
            None => {
                // Broker-initiated cancel, e.g. the queue was deleted. Same
                // treatment as a lost connection.
                warn!("consumer cancelled by the broker; reconnecting");
                self.clear_stale();
                self.reconnect(true).await
            }
        }
    }

    /// Re-enters `Connecting`. With `reinit` the configuration is rebuilt via
    /// the client's `init`, so merge/after-connect hooks apply again;
    /// otherwise the existing configuration is reused as-is.
    async fn reconnect(&mut self, reinit: bool) -> bool {
        if reinit {
            match self.client.init(self.index).await {
                Ok(config) => match config.as_ref().validate() {
                    Ok(()) => self.config = config,
                    Err(e) => {
                        error!("rebuilt configuration is invalid: {e}");
                        return false;
                    }
                },
                Err(e) => {
                    error!("configuration rebuild failed: {e}");
                    return false;
                }
            }
        }
        self.spawn_connect_attempt();
        true
    }

    fn spawn_connect_attempt(&mut self) {
        self.state = State::Connecting;
        self.epoch += 1;
        let epoch = self.epoch;
        let client = Arc::clone(&self.client);
        let config = self.config.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = connect(client, config).await;
            let _ = tx.send(Event::Connected { epoch, result }).await;
        });
    }

    fn register_watches(&mut self, connection_closed: CloseSignal, channel_closed: CloseSignal) {
        self.connection_watch = Some(self.spawn_watch(Resource::Connection, connection_closed));
        self.channel_watch = Some(self.spawn_watch(Resource::Channel, channel_closed));
    }

    fn spawn_watch(&self, resource: Resource, signal: CloseSignal) -> JoinHandle<()> {
        let epoch = self.epoch;
        let tx = self.tx.clone();
        tokio::spawn(async move {
            // Err means the sender was dropped on orderly teardown.
            if let Ok(reason) = signal.await {
                let _ = tx
                    .send(Event::HealthDown {
                        epoch,
                        resource,
                        reason,
                    })
                    .await;
            }
        })
    }

    fn schedule_retry(&mut self, delay: Duration) {
        let tx = self.tx.clone();
        self.retry_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Event::Retry).await;
        }));
    }

    /// Discards the channel, consumer tag, delivery stream and monitors so
    /// nothing can be issued against the superseded channel from here.
    fn clear_stale(&mut self) {
        if let Some(watch) = self.connection_watch.take() {
            watch.abort();
        }
        if let Some(watch) = self.channel_watch.take() {
            watch.abort();
        }
        self.channel = None;
        self.consumer_tag = None;
        self.deliveries = None;
    }

    fn teardown(&mut self) {
        if let Some(timer) = self.retry_timer.take() {
            timer.abort();
        }
        if let Some(watch) = self.connection_watch.take() {
            watch.abort();
        }
        if let Some(watch) = self.channel_watch.take() {
            watch.abort();
        }
        self.state = State::Disconnected;
    }
}

async fn connect<C: BrokerClient>(
    client: Arc<C>,
    config: C::Config,
) -> Result<(ChannelSession<C::Channel>, Subscription), ConnectError> {
    let session = client.setup_channel(&config).await?;
    match client.consume(&session.channel, &config).await {
        Ok(subscription) => Ok((session, subscription)),
        Err(e) => {
            client.close_connection(&session.channel).await;
            Err(e)
        }
    }
}

async fn next_delivery(
    stream: &mut Option<BoxStream<'static, Result<Delivery, BrokerError>>>,
) -> Option<Result<Delivery, BrokerError>> {
    match stream {
        Some(deliveries) => deliveries.next().await,
        None => std::future::pending().await,
    }
}

fn build_message<Ch>(settings: &ConsumerSettings, channel: Ch, delivery: Delivery) -> Message
where
    Ch: AckChannel + 'static,
{
    let metadata = metadata::project(&delivery.attributes, &settings.metadata);
    let ack_context = AckContext::new(
        Arc::new(channel),
        delivery.delivery_tag,
        delivery.redelivered,
        settings.on_success,
        settings.on_failure,
    );
    Message {
        payload: delivery.payload,
        metadata,
        ack_context,
    }
}
