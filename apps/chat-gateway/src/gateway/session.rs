//! Per-connection state machine.
//!
//! `Connecting -> Authenticating -> Joined -> Closing -> Closed`, with
//! `Authenticating -> Closed` on refusal. The transport loop in
//! [`server`](super::server) drives it; nothing here touches a socket.

use std::fmt;
use std::sync::Arc;

use crate::models::{RoomId, StoredMessage, UserIdentity};
use crate::store::StoreError;

use super::events::{self, Malformed};
use super::fanout::{BrokerError, RoomBroker};
use super::ordering::{GateError, RoomGates};
use super::registry::{delivery_channel, Outbox};
use super::Gateway;

/// Opaque id of one live transport session (`conn_` prefixed ULID).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn generate() -> Self {
        Self(chat_common::id::prefixed_ulid(
            chat_common::id::prefix::CONNECTION,
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Authenticating,
    Joined,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectCause {
    PeerClosed,
    TransportError,
    /// The broker dropped this connection's delivery handle.
    DeliveryFailed,
    IdleTimeout,
    ServerShutdown,
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("unauthenticated")]
    Unauthenticated,
    #[error("not authorized to join the room")]
    Unauthorized,
    #[error("malformed input: {0}")]
    MalformedInput(Malformed),
    #[error("persistence failure: {0}")]
    PersistenceFailure(#[from] StoreError),
    #[error("delivery failed: {0}")]
    DeliveryFailure(String),
    #[error("message persisted but not broadcast: {0}")]
    BroadcastFailure(#[from] BrokerError),
    #[error("room ordering unavailable: {0}")]
    OrderingUnavailable(#[from] GateError),
    #[error("operation not valid in state {0:?}")]
    InvalidState(ConnectionState),
}

/// Live membership of one connection in one room. Dropping it unregisters,
/// so cleanup also runs when the owning task unwinds.
struct Membership {
    broker: Arc<dyn RoomBroker>,
    gates: Arc<RoomGates>,
    room: RoomId,
    connection: ConnectionId,
}

impl Drop for Membership {
    fn drop(&mut self) {
        self.broker.leave(&self.room, &self.connection);
        if self.broker.member_count(&self.room) == 0 {
            self.gates.release_idle(&self.room);
        }
        tracing::debug!(
            connection_id = %self.connection,
            room_id = %self.room,
            "membership released"
        );
    }
}

pub struct Connection {
    id: ConnectionId,
    room: RoomId,
    user: Option<UserIdentity>,
    state: ConnectionState,
    membership: Option<Membership>,
}

impl Connection {
    pub fn new(room: RoomId) -> Self {
        Self {
            id: ConnectionId::generate(),
            room,
            user: None,
            state: ConnectionState::Connecting,
            membership: None,
        }
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn room(&self) -> &RoomId {
        &self.room
    }

    pub fn user(&self) -> Option<&UserIdentity> {
        self.user.as_ref()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Authenticate, authorize and join the room.
    ///
    /// Every failure leaves the connection `Closed` with no membership side
    /// effect. On success the returned outbox carries room broadcasts.
    pub async fn on_connect(
        &mut self,
        gateway: &Gateway,
        token: Option<&str>,
    ) -> Result<Outbox, GatewayError> {
        if self.state != ConnectionState::Connecting {
            return Err(GatewayError::InvalidState(self.state));
        }
        self.state = ConnectionState::Authenticating;

        match self.admit(gateway, token).await {
            Ok(outbox) => {
                self.state = ConnectionState::Joined;
                Ok(outbox)
            }
            Err(err) => {
                self.state = ConnectionState::Closed;
                Err(err)
            }
        }
    }

    async fn admit(
        &mut self,
        gateway: &Gateway,
        token: Option<&str>,
    ) -> Result<Outbox, GatewayError> {
        let token = token
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(GatewayError::Unauthenticated)?;

        let user = gateway
            .validator
            .validate(token)
            .await
            .map_err(|_| GatewayError::Unauthenticated)?;

        match gateway.rooms.may_join(&user, &self.room).await {
            Ok(true) => {}
            Ok(false) => return Err(GatewayError::Unauthorized),
            Err(err) => {
                tracing::warn!(
                    connection_id = %self.id,
                    room_id = %self.room,
                    %err,
                    "room authorization unavailable; refusing"
                );
                return Err(GatewayError::Unauthorized);
            }
        }

        let (handle, outbox) = delivery_channel(gateway.outbound_buffer);
        gateway.broker.join(&self.room, self.id.clone(), handle);
        self.membership = Some(Membership {
            broker: gateway.broker.clone(),
            gates: gateway.gates.clone(),
            room: self.room.clone(),
            connection: self.id.clone(),
        });
        self.user = Some(user);

        Ok(outbox)
    }

    /// Validate one inbound text frame without touching storage.
    ///
    /// Returns `None` for a frame type this server ignores. The returned send
    /// owns everything it needs, so the transport can keep draining its
    /// outbox while the send commits.
    pub fn accept(
        &self,
        gateway: &Gateway,
        raw: &str,
    ) -> Result<Option<PendingSend>, GatewayError> {
        if self.state != ConnectionState::Joined {
            return Err(GatewayError::InvalidState(self.state));
        }
        let Some(user) = self.user.as_ref() else {
            return Err(GatewayError::InvalidState(self.state));
        };

        match events::decode_inbound(raw) {
            Ok(Some(text)) => Ok(Some(PendingSend {
                gateway: gateway.clone(),
                room: self.room.clone(),
                sender: user.clone(),
                text,
            })),
            Ok(None) => Ok(None),
            Err(malformed) => Err(GatewayError::MalformedInput(malformed)),
        }
    }

    /// Handle one inbound text frame to completion.
    pub async fn on_message(
        &mut self,
        gateway: &Gateway,
        raw: &str,
    ) -> Result<Option<Arc<StoredMessage>>, GatewayError> {
        match self.accept(gateway, raw)? {
            Some(send) => send.commit().await.map(Some),
            None => Ok(None),
        }
    }

    /// Serialize a broadcast for this connection's socket.
    pub fn deliver(&self, message: &StoredMessage) -> Result<String, GatewayError> {
        if self.state != ConnectionState::Joined {
            return Err(GatewayError::InvalidState(self.state));
        }
        events::encode_outbound(message).map_err(|e| GatewayError::DeliveryFailure(e.to_string()))
    }

    /// Enter `Closing` and release the room membership. The transport may
    /// still send a close frame afterwards.
    pub fn begin_close(&mut self, cause: DisconnectCause) {
        match self.state {
            ConnectionState::Closing | ConnectionState::Closed => return,
            _ => {}
        }
        self.state = ConnectionState::Closing;
        if self.membership.take().is_some() {
            tracing::debug!(
                connection_id = %self.id,
                room_id = %self.room,
                ?cause,
                "connection closing"
            );
        }
    }

    /// Unregister (if still joined) and move to `Closed`. Idempotent.
    pub fn on_disconnect(&mut self, cause: DisconnectCause) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.begin_close(cause);
        self.state = ConnectionState::Closed;
    }
}

/// A validated chat message waiting for its room's turn.
pub struct PendingSend {
    gateway: Gateway,
    room: RoomId,
    sender: UserIdentity,
    text: String,
}

impl PendingSend {
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Append then publish while holding the room's ordering turn.
    pub async fn commit(self) -> Result<Arc<StoredMessage>, GatewayError> {
        let turn = self.gateway.gates.enter(&self.room).await?;
        let result = self.append_and_publish().await;
        turn.finish().await;
        result
    }

    async fn append_and_publish(&self) -> Result<Arc<StoredMessage>, GatewayError> {
        let stored = Arc::new(
            self.gateway
                .store
                .append(&self.room, &self.sender, &self.text)
                .await?,
        );
        self.gateway.broker.publish(&self.room, stored.clone()).await?;
        Ok(stored)
    }
}
