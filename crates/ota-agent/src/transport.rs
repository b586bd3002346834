//! Transport abstraction between the controller and the platform link
//!
//! A transport never calls into the controller. It delivers everything it
//! receives as `TransportEvent`s on the channel handed to `connect`.

use async_trait::async_trait;
use ota_common::Result;
use tokio::sync::mpsc;

/// Id the transport assigns to a published message
pub type MessageId = u32;

/// Where a publish goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicKind {
    /// Device-to-platform event topic
    EventsUp,
}

/// Something the transport observed
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Subscription to the downlink topic is active
    SubscribeSuccess,
    /// The link dropped; publishes fail until the next `SubscribeSuccess`
    ConnectionLost,
    /// Raw downlink payload, decoded by the controller
    Message { topic: String, payload: Vec<u8> },
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Authenticate and start delivering events to `events`
    ///
    /// Fails with `Error::Auth` when the platform refuses the credentials.
    async fn connect(&self, events: mpsc::Sender<TransportEvent>) -> Result<()>;

    fn is_connected(&self) -> bool;

    /// Publish a payload, returning the transport's message id
    ///
    /// Fails with `Error::TransportUnavailable` when not connected.
    async fn publish(&self, topic: TopicKind, payload: Vec<u8>) -> Result<MessageId>;
}
