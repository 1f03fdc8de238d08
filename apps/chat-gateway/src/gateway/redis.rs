//! Distributed room broker over Redis pub/sub.
//!
//! Membership stays in a process-local [`RoomRegistry`]. `publish` sends the
//! message to `<prefix><room_id>` and every gateway process (this one
//! included) receives it through a `PSUBSCRIBE <prefix>*` listener that fans
//! out to its own members. Redis pub/sub does not redeliver, so delivery is
//! at-most-once.
//!
//! [`RedisRoomLock`] serializes a room's append and publish across processes.
//! A lease expires after [`LOCK_TTL`] so a crashed holder cannot wedge a room.

use std::sync::Arc;
use std::time::Duration;

use chat_common::id::{prefix as id_prefix, prefixed_ulid};

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::{ConnectionManager, PubSub};
use redis::AsyncCommands;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::models::{RoomId, StoredMessage};

use super::fanout::{BrokerError, PublishReceipt, RoomBroker};
use super::ordering::{GateError, SharedRoomLock};
use super::registry::{DeliveryHandle, RoomRegistry};
use super::session::ConnectionId;

pub const DEFAULT_CHANNEL_PREFIX: &str = "chat:room:";

const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

/// Longest a room lease may be held before Redis expires it.
pub const LOCK_TTL: Duration = Duration::from_secs(5);
/// Longest a send waits for its room's lease.
pub const LOCK_WAIT: Duration = Duration::from_secs(10);
const LOCK_RETRY: Duration = Duration::from_millis(5);

/// Deletes the lease only if the caller still holds it.
const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#;

pub struct RedisBroker {
    local: Arc<RoomRegistry>,
    publisher: ConnectionManager,
    prefix: String,
    listener: JoinHandle<()>,
}

impl RedisBroker {
    /// Connect the publisher and the pattern subscription. Fails if Redis is
    /// unreachable at startup; later subscription losses are retried.
    pub async fn connect(redis_url: &str, prefix: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(redis_url)?;
        let publisher = ConnectionManager::new(client.clone()).await?;
        let pubsub = subscribe(&client, prefix).await?;

        let local = Arc::new(RoomRegistry::new());
        let listener = tokio::spawn(listen(
            client,
            prefix.to_string(),
            local.clone(),
            pubsub,
        ));

        tracing::info!(prefix, "redis room broker connected");

        Ok(Self {
            local,
            publisher,
            prefix: prefix.to_string(),
            listener,
        })
    }
}

impl RedisBroker {
    /// Room lock sharing this broker's connection and key prefix.
    pub fn room_lock(&self) -> RedisRoomLock {
        RedisRoomLock::new(self.publisher.clone(), &self.prefix)
    }
}

impl Drop for RedisBroker {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

async fn subscribe(client: &redis::Client, prefix: &str) -> Result<PubSub, redis::RedisError> {
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.psubscribe(format!("{prefix}*")).await?;
    Ok(pubsub)
}

async fn listen(client: redis::Client, prefix: String, local: Arc<RoomRegistry>, first: PubSub) {
    let mut pubsub = Some(first);
    loop {
        if let Some(active) = pubsub.take() {
            let mut messages = active.into_on_message();
            while let Some(msg) = messages.next().await {
                dispatch(&prefix, &local, msg.get_channel_name(), msg.get_payload_bytes());
            }
            tracing::warn!(prefix = %prefix, "redis subscription ended; resubscribing");
        }

        tokio::time::sleep(RESUBSCRIBE_DELAY).await;
        match subscribe(&client, &prefix).await {
            Ok(fresh) => {
                tracing::info!(prefix = %prefix, "redis subscription restored");
                pubsub = Some(fresh);
            }
            Err(err) => tracing::error!(?err, "redis resubscribe failed"),
        }
    }
}

fn dispatch(prefix: &str, local: &RoomRegistry, channel: &str, payload: &[u8]) {
    let Some(room) = room_from_channel(prefix, channel) else {
        return;
    };
    match serde_json::from_slice::<StoredMessage>(payload) {
        Ok(message) => {
            local.fan_out(&room, &Arc::new(message));
        }
        Err(err) => {
            tracing::warn!(channel, %err, "dropping undecodable room broadcast");
        }
    }
}

pub struct RedisRoomLock {
    conn: ConnectionManager,
    prefix: String,
    ttl: Duration,
    wait: Duration,
    release: redis::Script,
}

impl RedisRoomLock {
    pub fn new(conn: ConnectionManager, prefix: &str) -> Self {
        Self {
            conn,
            prefix: prefix.to_string(),
            ttl: LOCK_TTL,
            wait: LOCK_WAIT,
            release: redis::Script::new(RELEASE_SCRIPT),
        }
    }
}

fn lock_error(err: redis::RedisError) -> GateError {
    GateError(err.to_string())
}

#[async_trait]
impl SharedRoomLock for RedisRoomLock {
    async fn acquire(&self, room: &RoomId) -> Result<String, GateError> {
        let key = lock_key(&self.prefix, room);
        let token = prefixed_ulid(id_prefix::LEASE);
        let deadline = Instant::now() + self.wait;
        let mut conn = self.conn.clone();

        loop {
            // SET NX replies OK when taken, nil when someone else holds it.
            let reply: redis::Value = redis::cmd("SET")
                .arg(&key)
                .arg(&token)
                .arg("NX")
                .arg("PX")
                .arg(self.ttl.as_millis() as u64)
                .query_async(&mut conn)
                .await
                .map_err(lock_error)?;
            if !matches!(reply, redis::Value::Nil) {
                return Ok(token);
            }
            if Instant::now() >= deadline {
                tracing::warn!(room_id = %room, "timed out waiting for room lock");
                return Err(GateError(format!("timed out waiting for {key}")));
            }
            tokio::time::sleep(LOCK_RETRY).await;
        }
    }

    async fn release(&self, room: &RoomId, token: &str) -> Result<(), GateError> {
        let mut conn = self.conn.clone();
        let _deleted: i64 = self
            .release
            .key(lock_key(&self.prefix, room))
            .arg(token)
            .invoke_async(&mut conn)
            .await
            .map_err(lock_error)?;
        Ok(())
    }
}

/// Lock keys live beside the room's channel name. Keys and channels are
/// separate namespaces, so the pattern subscription never sees them.
fn lock_key(prefix: &str, room: &RoomId) -> String {
    format!("{prefix}{room}:lock")
}

fn channel_for(prefix: &str, room: &RoomId) -> String {
    format!("{prefix}{room}")
}

fn room_from_channel(prefix: &str, channel: &str) -> Option<RoomId> {
    channel
        .strip_prefix(prefix)
        .filter(|room| !room.is_empty())
        .map(RoomId::from)
}

#[async_trait]
impl RoomBroker for RedisBroker {
    fn join(&self, room: &RoomId, connection: ConnectionId, handle: DeliveryHandle) {
        self.local.join(room, connection, handle);
    }

    fn leave(&self, room: &RoomId, connection: &ConnectionId) {
        self.local.leave(room, connection);
    }

    async fn publish(
        &self,
        room: &RoomId,
        message: Arc<StoredMessage>,
    ) -> Result<PublishReceipt, BrokerError> {
        let payload = serde_json::to_string(&*message)?;
        let mut conn = self.publisher.clone();
        let subscribers: usize = conn
            .publish(channel_for(&self.prefix, room), payload)
            .await
            .map_err(|e| {
                tracing::error!(?e, room_id = %room, "redis publish failed");
                BrokerError::Transport(e.to_string())
            })?;

        Ok(PublishReceipt {
            recipients: subscribers,
            evicted: 0,
        })
    }

    fn member_count(&self, room: &RoomId) -> usize {
        self.local.member_count(room)
    }

    fn room_count(&self) -> usize {
        self.local.room_count()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::gateway::registry::delivery_channel;
    use crate::models::UserIdentity;

    #[test]
    fn channel_names_round_trip_room_ids() {
        let room = RoomId::from("42");
        let channel = channel_for(DEFAULT_CHANNEL_PREFIX, &room);
        assert_eq!(channel, "chat:room:42");
        assert_eq!(room_from_channel(DEFAULT_CHANNEL_PREFIX, &channel), Some(room));
    }

    #[test]
    fn lock_keys_are_per_room() {
        assert_eq!(
            lock_key(DEFAULT_CHANNEL_PREFIX, &RoomId::from("42")),
            "chat:room:42:lock"
        );
        assert_ne!(
            lock_key(DEFAULT_CHANNEL_PREFIX, &RoomId::from("4")),
            lock_key(DEFAULT_CHANNEL_PREFIX, &RoomId::from("42"))
        );
    }

    #[test]
    fn foreign_channels_are_ignored() {
        assert_eq!(room_from_channel(DEFAULT_CHANNEL_PREFIX, "other:42"), None);
        assert_eq!(room_from_channel(DEFAULT_CHANNEL_PREFIX, "chat:room:"), None);
    }

    #[tokio::test]
    async fn received_broadcast_reaches_local_members() {
        let local = RoomRegistry::new();
        let (handle, mut outbox) = delivery_channel(4);
        local.join(&RoomId::from("7"), ConnectionId::from("a"), handle);

        let message = StoredMessage {
            id: 11,
            room_id: RoomId::from("7"),
            sender: UserIdentity {
                id: 1,
                username: "alice".to_string(),
            },
            text: "hi".to_string(),
            created_at: Utc::now(),
        };
        let payload = serde_json::to_vec(&message).unwrap();

        dispatch(DEFAULT_CHANNEL_PREFIX, &local, "chat:room:7", &payload);
        dispatch(DEFAULT_CHANNEL_PREFIX, &local, "chat:room:7", b"not json");
        dispatch(DEFAULT_CHANNEL_PREFIX, &local, "chat:room:8", &payload);

        assert_eq!(*outbox.recv().await.unwrap(), message);
        assert!(outbox.try_recv().is_err());
    }
}
