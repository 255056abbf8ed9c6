mod client;
mod options;

pub use client::{RabbitChannel, RabbitClient};
pub use options::{AfterConnectFn, Binding, MergeOptionsFn, QueueDeclare, RabbitConfig, RabbitOptions};
