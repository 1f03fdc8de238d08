//! Room broker interface.
//!
//! Two interchangeable backends implement [`RoomBroker`]:
//! [`RoomRegistry`](super::registry::RoomRegistry) for a single process and
//! [`RedisBroker`](super::redis::RedisBroker) when several gateway processes
//! must share rooms. The backend is chosen once at startup.

use std::sync::Arc;

use async_trait::async_trait;

use crate::models::{RoomId, StoredMessage};

use super::registry::DeliveryHandle;
use super::session::ConnectionId;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("broker transport failed: {0}")]
    Transport(String),
    #[error("message encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// What the transport reported for one publish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReceipt {
    /// Local members handed the message (in-process backend) or gateway
    /// processes subscribed to the room (distributed backend).
    pub recipients: usize,
    /// Local members dropped because their queue was closed or full.
    pub evicted: usize,
}

#[async_trait]
pub trait RoomBroker: Send + Sync {
    /// Register a delivery target. Re-joining with the same connection id
    /// replaces the previous handle.
    fn join(&self, room: &RoomId, connection: ConnectionId, handle: DeliveryHandle);

    /// Remove a delivery target. Removing a non-member is a no-op.
    fn leave(&self, room: &RoomId, connection: &ConnectionId);

    /// Deliver `message` to every member of `room`, the sender included.
    /// One member's failure never prevents delivery to the others.
    async fn publish(
        &self,
        room: &RoomId,
        message: Arc<StoredMessage>,
    ) -> Result<PublishReceipt, BrokerError>;

    /// Members of `room` registered with this process.
    fn member_count(&self, room: &RoomId) -> usize;

    /// Rooms with at least one member in this process.
    fn room_count(&self) -> usize;
}
