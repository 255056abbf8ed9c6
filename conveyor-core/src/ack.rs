// conveyor-core/src/ack.rs
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use tracing::warn;

use crate::client::AckChannel;
use crate::error::ConfigError;
use crate::types::Message;

/// What to tell the broker about a delivery once the pipeline is done with
/// it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckPolicy {
    Ack,
    Reject,
    RejectAndRequeue,
    /// Requeue only if the broker has not already redelivered the message,
    /// so a poison message cannot loop forever.
    RejectAndRequeueOnce,
}

impl FromStr for AckPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, ConfigError> {
        match s {
            "ack" => Ok(AckPolicy::Ack),
            "reject" => Ok(AckPolicy::Reject),
            "reject_and_requeue" => Ok(AckPolicy::RejectAndRequeue),
            "reject_and_requeue_once" => Ok(AckPolicy::RejectAndRequeueOnce),
            other => Err(ConfigError::InvalidOption {
                key: "ack policy".into(),
                reason: format!("unknown policy `{other}`"),
            }),
        }
    }
}

/// Acknowledgment context captured at delivery time: the then-live channel
/// handle, the delivery identity, and the effective policies.
///
/// Immutable value; per-message overrides go through [`AckContext::configure`]
/// which returns a new context, so concurrent ack calls never share mutable
/// state. The channel reference is only valid while that exact channel is
/// live — against a stale handle the broker call fails and the dispatcher
/// absorbs the failure.
#[derive(Clone)]
pub struct AckContext {
    channel: Arc<dyn AckChannel>,
    delivery_tag: u64,
    redelivered: bool,
    on_success: AckPolicy,
    on_failure: AckPolicy,
}

impl fmt::Debug for AckContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AckContext")
            .field("delivery_tag", &self.delivery_tag)
            .field("redelivered", &self.redelivered)
            .field("on_success", &self.on_success)
            .field("on_failure", &self.on_failure)
            .finish_non_exhaustive()
    }
}

impl AckContext {
    pub fn new(
        channel: Arc<dyn AckChannel>,
        delivery_tag: u64,
        redelivered: bool,
        on_success: AckPolicy,
        on_failure: AckPolicy,
    ) -> Self {
        Self {
            channel,
            delivery_tag,
            redelivered,
            on_success,
            on_failure,
        }
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    pub fn on_success(&self) -> AckPolicy {
        self.on_success
    }

    pub fn on_failure(&self) -> AckPolicy {
        self.on_failure
    }

    /// Returns a new context with the given policy overrides merged in,
    /// last-write-wins per key. Keys other than `on_success`/`on_failure`,
    /// and values outside the policy enumeration, fail with a `ConfigError`;
    /// the existing context is left untouched either way.
    pub fn configure<'a, I>(&self, options: I) -> Result<AckContext, ConfigError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut updated = self.clone();
        for (key, value) in options {
            match key {
                "on_success" => updated.on_success = value.parse()?,
                "on_failure" => updated.on_failure = value.parse()?,
                other => return Err(ConfigError::UnknownOption(other.into())),
            }
        }
        Ok(updated)
    }
}

/// Applies each message's effective policy, one broker call per message.
///
/// Best-effort from the pipeline's perspective: a failing call is logged and
/// never aborts the rest of the batch, and nothing propagates back to the
/// caller.
pub async fn ack(successful: Vec<Message>, failed: Vec<Message>) {
    for message in &successful {
        apply(&message.ack_context, message.ack_context.on_success()).await;
    }
    for message in &failed {
        apply(&message.ack_context, message.ack_context.on_failure()).await;
    }
}

async fn apply(ctx: &AckContext, policy: AckPolicy) {
    let result = match policy {
        AckPolicy::Ack => ctx.channel.ack(ctx.delivery_tag).await,
        AckPolicy::Reject => ctx.channel.reject(ctx.delivery_tag, false).await,
        AckPolicy::RejectAndRequeue => ctx.channel.reject(ctx.delivery_tag, true).await,
        AckPolicy::RejectAndRequeueOnce => {
            ctx.channel.reject(ctx.delivery_tag, !ctx.redelivered).await
        }
    };
    if let Err(e) = result {
        warn!(
            "ack dispatch failed: tag={} policy={:?}: {e}",
            ctx.delivery_tag, policy
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BrokerError;
    use crate::metadata::Metadata;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Ack(u64),
        Reject { tag: u64, requeue: bool },
    }

    #[derive(Default)]
    struct RecordingChannel {
        calls: Mutex<Vec<Call>>,
        fail_tags: Vec<u64>,
    }

    #[async_trait]
    impl AckChannel for RecordingChannel {
        async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
            if self.fail_tags.contains(&delivery_tag) {
                return Err(BrokerError("channel closed".into()));
            }
            self.calls.lock().unwrap().push(Call::Ack(delivery_tag));
            Ok(())
        }

        async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
            if self.fail_tags.contains(&delivery_tag) {
                return Err(BrokerError("channel closed".into()));
            }
            self.calls.lock().unwrap().push(Call::Reject {
                tag: delivery_tag,
                requeue,
            });
            Ok(())
        }
    }

    fn message(
        channel: &Arc<RecordingChannel>,
        tag: u64,
        redelivered: bool,
        on_success: AckPolicy,
        on_failure: AckPolicy,
    ) -> Message {
        Message {
            payload: Vec::new(),
            metadata: Metadata::new(),
            ack_context: AckContext::new(
                Arc::clone(channel) as Arc<dyn AckChannel>,
                tag,
                redelivered,
                on_success,
                on_failure,
            ),
        }
    }

    #[tokio::test]
    async fn requeue_once_honours_the_redelivered_flag() {
        let channel = Arc::new(RecordingChannel::default());
        let fresh = message(&channel, 1, false, AckPolicy::Ack, AckPolicy::RejectAndRequeueOnce);
        let stale = message(&channel, 2, true, AckPolicy::Ack, AckPolicy::RejectAndRequeueOnce);

        ack(vec![], vec![fresh, stale]).await;

        assert_eq!(
            *channel.calls.lock().unwrap(),
            vec![
                Call::Reject { tag: 1, requeue: true },
                Call::Reject { tag: 2, requeue: false },
            ]
        );
    }

    #[tokio::test]
    async fn requeue_is_unconditional_for_reject_and_requeue() {
        let channel = Arc::new(RecordingChannel::default());
        let redelivered = message(&channel, 7, true, AckPolicy::Ack, AckPolicy::RejectAndRequeue);

        ack(vec![], vec![redelivered]).await;

        assert_eq!(
            *channel.calls.lock().unwrap(),
            vec![Call::Reject { tag: 7, requeue: true }]
        );
    }

    #[tokio::test]
    async fn one_failing_call_does_not_abort_the_batch() {
        let channel = Arc::new(RecordingChannel {
            fail_tags: vec![1],
            ..Default::default()
        });
        let failing = message(&channel, 1, false, AckPolicy::Ack, AckPolicy::Reject);
        let fine = message(&channel, 2, false, AckPolicy::Ack, AckPolicy::Reject);

        ack(vec![failing, fine], vec![]).await;

        assert_eq!(*channel.calls.lock().unwrap(), vec![Call::Ack(2)]);
    }

    #[tokio::test]
    async fn configure_merges_overrides_last_write_wins() {
        let channel = Arc::new(RecordingChannel::default());
        let ctx = AckContext::new(
            Arc::clone(&channel) as Arc<dyn AckChannel>,
            1,
            false,
            AckPolicy::Ack,
            AckPolicy::RejectAndRequeue,
        );

        let updated = ctx
            .configure(vec![("on_failure", "reject"), ("on_failure", "ack")])
            .unwrap();
        assert_eq!(updated.on_failure(), AckPolicy::Ack);
        assert_eq!(updated.on_success(), AckPolicy::Ack);
    }

    #[tokio::test]
    async fn configure_rejects_unknown_keys_and_leaves_the_context_alone() {
        let channel = Arc::new(RecordingChannel::default());
        let ctx = AckContext::new(
            Arc::clone(&channel) as Arc<dyn AckChannel>,
            1,
            false,
            AckPolicy::Ack,
            AckPolicy::RejectAndRequeue,
        );

        let err = ctx.configure(vec![("on_timeout", "ack")]).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownOption(_)));
        assert_eq!(ctx.on_failure(), AckPolicy::RejectAndRequeue);

        let err = ctx.configure(vec![("on_failure", "explode")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidOption { .. }));
    }
}
