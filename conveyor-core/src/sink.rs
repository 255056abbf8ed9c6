// conveyor-core/src/sink.rs
use async_trait::async_trait;

use crate::types::Message;

/// Outbound edge into the host pipeline.
///
/// Messages are handed over the moment they arrive; the adapter applies no
/// flow control of its own. Throttling comes from the broker-side prefetch
/// limit, buffering from the pipeline's own buffer.
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn deliver(&self, message: Message);
}
