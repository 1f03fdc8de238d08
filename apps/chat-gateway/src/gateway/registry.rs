//! In-process room membership and fan-out.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::models::{RoomId, StoredMessage};

use super::fanout::{BrokerError, PublishReceipt, RoomBroker};
use super::session::ConnectionId;

/// Receiving end of a connection's outbound queue. Yields `None` once the
/// registry has dropped the connection's handle.
pub type Outbox = mpsc::Receiver<Arc<StoredMessage>>;

/// Sending end of a connection's outbound queue, held only by the registry.
#[derive(Debug, Clone)]
pub struct DeliveryHandle {
    tx: mpsc::Sender<Arc<StoredMessage>>,
}

/// Create a bounded outbound queue for one connection.
pub fn delivery_channel(capacity: usize) -> (DeliveryHandle, Outbox) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (DeliveryHandle { tx }, rx)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeliveryFailure {
    Closed,
    Full,
}

impl DeliveryHandle {
    fn deliver(&self, message: Arc<StoredMessage>) -> Result<(), DeliveryFailure> {
        self.tx.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Closed(_) => DeliveryFailure::Closed,
            mpsc::error::TrySendError::Full(_) => DeliveryFailure::Full,
        })
    }
}

/// Room id to member handles, guarded per shard by `DashMap`.
///
/// Publishing snapshots the member list first, so a member joining during a
/// fan-out may or may not see that message, and a failing member is evicted
/// after the snapshot has been fully attempted.
pub struct RoomRegistry {
    rooms: DashMap<RoomId, HashMap<ConnectionId, DeliveryHandle>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self {
            rooms: DashMap::new(),
        }
    }

    fn snapshot(&self, room: &RoomId) -> Vec<(ConnectionId, DeliveryHandle)> {
        self.rooms
            .get(room)
            .map(|members| {
                members
                    .iter()
                    .map(|(id, handle)| (id.clone(), handle.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Hand `message` to every current member of `room`.
    ///
    /// Members whose queue is closed or full are removed from the room. The
    /// registry holds the only sender of each queue, so eviction ends the
    /// member's outbox and its connection task runs its own disconnect path.
    pub fn fan_out(&self, room: &RoomId, message: &Arc<StoredMessage>) -> PublishReceipt {
        let mut receipt = PublishReceipt::default();
        let mut failed = Vec::new();

        for (connection, handle) in self.snapshot(room) {
            match handle.deliver(message.clone()) {
                Ok(()) => receipt.recipients += 1,
                Err(reason) => {
                    tracing::warn!(
                        connection_id = %connection,
                        room_id = %room,
                        message_id = message.id,
                        ?reason,
                        "delivery failed; evicting member"
                    );
                    failed.push(connection);
                }
            }
        }

        for connection in &failed {
            self.leave(room, connection);
        }
        receipt.evicted = failed.len();
        receipt
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RoomBroker for RoomRegistry {
    fn join(&self, room: &RoomId, connection: ConnectionId, handle: DeliveryHandle) {
        self.rooms
            .entry(room.clone())
            .or_default()
            .insert(connection, handle);
    }

    fn leave(&self, room: &RoomId, connection: &ConnectionId) {
        if let Some(mut members) = self.rooms.get_mut(room) {
            members.remove(connection);
        }
        self.rooms.remove_if(room, |_, members| members.is_empty());
    }

    async fn publish(
        &self,
        room: &RoomId,
        message: Arc<StoredMessage>,
    ) -> Result<PublishReceipt, BrokerError> {
        Ok(self.fan_out(room, &message))
    }

    fn member_count(&self, room: &RoomId) -> usize {
        self.rooms.get(room).map_or(0, |members| members.len())
    }

    fn room_count(&self) -> usize {
        self.rooms.len()
    }
}
