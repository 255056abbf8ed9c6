// conveyor-core/src/types.rs
use crate::ack::AckContext;
use crate::metadata::Metadata;

/// A raw delivery event as surfaced by the broker client: the payload plus
/// every attribute the client knows how to expose.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_tag: u64,
    /// The broker has attempted to deliver this exact message before.
    pub redelivered: bool,
    pub payload: Vec<u8>,
    pub attributes: Metadata,
}

/// One pipeline message. Built once per delivery event; ownership passes to
/// the pipeline immediately and the adapter never touches it again.
#[derive(Debug)]
pub struct Message {
    pub payload: Vec<u8>,
    /// Projection of the delivery attributes through the configured
    /// allow-list.
    pub metadata: Metadata,
    pub ack_context: AckContext,
}
