pub mod ack;
pub mod backoff;
pub mod client;
pub mod config;
pub mod consumer;
pub mod error;
pub mod metadata;
pub mod sink;
pub mod types;

pub use ack::{ack, AckContext, AckPolicy};
pub use backoff::{Backoff, BackoffStrategy};
pub use client::{AckChannel, BrokerClient, ChannelSession, CloseSignal, Subscription};
pub use config::{BufferKeep, ConsumerSettings};
pub use consumer::{Consumer, ConsumerHandle};
pub use error::{BrokerError, ConfigError, ConnectError};
pub use metadata::{project, Metadata};
pub use sink::MessageSink;
pub use types::{Delivery, Message};
