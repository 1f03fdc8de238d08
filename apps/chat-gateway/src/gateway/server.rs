//! WebSocket upgrade handler and per-connection event loop.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::http::Uri;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::future::{BoxFuture, OptionFuture};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{FutureExt, SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::watch;
use tokio::time::{self, Instant};

use crate::error::ApiError;
use crate::models::{RoomId, StoredMessage};
use crate::AppState;

use super::events::{
    CLOSE_GOING_AWAY, CLOSE_TRY_AGAIN_LATER, CLOSE_UNAUTHENTICATED, CLOSE_UNAUTHENTICATED_REASON,
};
use super::registry::Outbox;
use super::session::{Connection, DisconnectCause, GatewayError};
use super::supervisor::Supervisor;
use super::Gateway;

/// Upper bound on writing a close frame to a peer that may be gone.
const CLOSE_WRITE_TIMEOUT: Duration = Duration::from_secs(2);

type WsSink = SplitSink<WebSocket, Message>;
type WsStream = SplitStream<WebSocket>;
type InFlightSend = BoxFuture<'static, Result<Arc<StoredMessage>, GatewayError>>;

#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    pub token: Option<String>,
}

impl ConnectParams {
    /// Token from the query string. A query that does not parse (duplicate
    /// or undecodable `token`) counts as no token, so the peer still gets the
    /// unauthenticated close instead of an HTTP error.
    pub fn token_from(uri: &Uri) -> Option<String> {
        Query::<ConnectParams>::try_from_uri(uri)
            .ok()
            .and_then(|Query(params)| params.token)
    }
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/ws/chat/{room_id}", get(ws_upgrade))
        .route("/ws/chat/{room_id}/", get(ws_upgrade))
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    Path(room_id): Path<String>,
    uri: Uri,
    State(state): State<AppState>,
) -> Result<Response, ApiError> {
    let Some(permit) = state.supervisor.try_admit() else {
        tracing::warn!(
            active = state.supervisor.active(),
            "refusing connection: at capacity or shutting down"
        );
        return Err(ApiError::service_unavailable(
            "The chat gateway is not accepting connections",
        ));
    };

    let gateway = state.gateway.clone();
    let shutdown = state.supervisor.shutdown_signal();
    let ping_every = Duration::from_secs(state.config.ping_interval_secs.max(1));
    let room = RoomId::new(room_id);
    let token = ConnectParams::token_from(&uri);

    Ok(ws
        .on_upgrade(move |socket| {
            Supervisor::run(
                permit,
                handle_connection(socket, gateway, room, token, shutdown, ping_every),
            )
        })
        .into_response())
}

async fn handle_connection(
    socket: WebSocket,
    gateway: Gateway,
    room: RoomId,
    token: Option<String>,
    mut shutdown: watch::Receiver<bool>,
    ping_every: Duration,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut conn = Connection::new(room);

    let mut outbox = match conn.on_connect(&gateway, token.as_deref()).await {
        Ok(outbox) => outbox,
        Err(err) => {
            tracing::debug!(
                connection_id = %conn.id(),
                room_id = %conn.room(),
                %err,
                "handshake refused"
            );
            let _ = time::timeout(
                CLOSE_WRITE_TIMEOUT,
                send_close(&mut ws_tx, CLOSE_UNAUTHENTICATED, CLOSE_UNAUTHENTICATED_REASON),
            )
            .await;
            return;
        }
    };

    if let Some(user) = conn.user() {
        tracing::info!(
            connection_id = %conn.id(),
            room_id = %conn.room(),
            user_id = user.id,
            "connection joined room"
        );
    }

    let mut in_flight = None;
    let cause = run_connection(
        &mut conn,
        &gateway,
        &mut ws_tx,
        &mut ws_rx,
        &mut outbox,
        &mut in_flight,
        &mut shutdown,
        ping_every,
    )
    .await;

    conn.begin_close(cause);
    drop(outbox);

    // A send that already started keeps its append and publish together.
    if let Some(send) = in_flight.take() {
        log_commit(&conn, send.await);
    }

    if let Some((code, reason)) = close_frame_for(cause) {
        let _ = time::timeout(CLOSE_WRITE_TIMEOUT, send_close(&mut ws_tx, code, reason)).await;
    }
    conn.on_disconnect(cause);

    tracing::info!(
        connection_id = %conn.id(),
        room_id = %conn.room(),
        ?cause,
        "connection closed"
    );
}

/// Main connection loop: read client frames, forward room broadcasts, keep
/// the peer alive. Returns why the connection is ending.
///
/// At most one send is in flight. Reading pauses until it commits, which
/// keeps this connection's messages in arrival order, while room broadcasts
/// keep flowing to the socket.
#[allow(clippy::too_many_arguments)]
async fn run_connection(
    conn: &mut Connection,
    gateway: &Gateway,
    ws_tx: &mut WsSink,
    ws_rx: &mut WsStream,
    outbox: &mut Outbox,
    in_flight: &mut Option<InFlightSend>,
    shutdown: &mut watch::Receiver<bool>,
    ping_every: Duration,
) -> DisconnectCause {
    // Any frame from the peer counts as liveness.
    let idle_limit = ping_every * 2;
    let mut last_seen = Instant::now();
    let mut ping = time::interval(ping_every);
    ping.tick().await; // First tick fires immediately; skip it.

    loop {
        tokio::select! {
            frame = ws_rx.next(), if in_flight.is_none() => {
                match frame {
                    Some(Ok(msg)) => {
                        last_seen = Instant::now();
                        match msg {
                            Message::Text(text) => *in_flight = accept_text(conn, gateway, text.as_str()),
                            Message::Close(_) => return DisconnectCause::PeerClosed,
                            _ => continue,
                        }
                    }
                    Some(Err(e)) => {
                        tracing::debug!(?e, connection_id = %conn.id(), "ws read error");
                        return DisconnectCause::TransportError;
                    }
                    None => return DisconnectCause::PeerClosed,
                }
            }

            Some(result) = OptionFuture::from(in_flight.as_mut()), if in_flight.is_some() => {
                *in_flight = None;
                last_seen = Instant::now();
                log_commit(conn, result);
            }

            queued = outbox.recv() => {
                let Some(message) = queued else {
                    tracing::warn!(
                        connection_id = %conn.id(),
                        room_id = %conn.room(),
                        "dropped by room broker; closing slow connection"
                    );
                    return DisconnectCause::DeliveryFailed;
                };
                let frame = match conn.deliver(&message) {
                    Ok(frame) => frame,
                    Err(err) => {
                        tracing::warn!(connection_id = %conn.id(), %err, "outbound encode failed");
                        return DisconnectCause::DeliveryFailed;
                    }
                };
                if let Err(e) = ws_tx.send(Message::Text(frame.into())).await {
                    tracing::debug!(?e, connection_id = %conn.id(), "ws write error");
                    return DisconnectCause::TransportError;
                }
            }

            _ = ping.tick() => {
                // Inbound frames are not read while a send commits.
                if in_flight.is_none() && last_seen.elapsed() >= idle_limit {
                    tracing::debug!(connection_id = %conn.id(), "idle timeout; closing connection");
                    return DisconnectCause::IdleTimeout;
                }
                if ws_tx.send(Message::Ping(Bytes::new())).await.is_err() {
                    return DisconnectCause::TransportError;
                }
            }

            _ = shutdown_requested(shutdown) => return DisconnectCause::ServerShutdown,
        }
    }
}

/// Validate a text frame and start its send, or log why it was ignored.
fn accept_text(conn: &Connection, gateway: &Gateway, raw: &str) -> Option<InFlightSend> {
    match conn.accept(gateway, raw) {
        Ok(Some(send)) => Some(send.commit().boxed()),
        Ok(None) => {
            tracing::debug!(connection_id = %conn.id(), "ignoring frame of unknown type");
            None
        }
        Err(GatewayError::MalformedInput(reason)) => {
            tracing::debug!(connection_id = %conn.id(), %reason, "ignoring malformed frame");
            None
        }
        Err(err) => {
            tracing::warn!(connection_id = %conn.id(), %err, "frame rejected");
            None
        }
    }
}

fn log_commit(conn: &Connection, result: Result<Arc<StoredMessage>, GatewayError>) {
    match result {
        Ok(message) => {
            tracing::debug!(
                connection_id = %conn.id(),
                room_id = %conn.room(),
                message_id = message.id,
                "message published"
            );
        }
        Err(err @ GatewayError::PersistenceFailure(_)) => {
            tracing::error!(
                connection_id = %conn.id(),
                room_id = %conn.room(),
                %err,
                "message dropped"
            );
        }
        Err(err) => {
            tracing::warn!(
                connection_id = %conn.id(),
                room_id = %conn.room(),
                %err,
                "message not delivered"
            );
        }
    }
}

async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|down| *down).await;
}

/// Close frame for a server-side disconnect. Peer-initiated and transport
/// failures get none.
fn close_frame_for(cause: DisconnectCause) -> Option<(u16, &'static str)> {
    match cause {
        DisconnectCause::PeerClosed | DisconnectCause::TransportError => None,
        DisconnectCause::DeliveryFailed => Some((CLOSE_TRY_AGAIN_LATER, "slow consumer")),
        DisconnectCause::IdleTimeout => Some((CLOSE_GOING_AWAY, "idle timeout")),
        DisconnectCause::ServerShutdown => Some((CLOSE_GOING_AWAY, "server shutting down")),
    }
}

/// Send a WebSocket close frame with a code and reason.
async fn send_close(ws_tx: &mut WsSink, code: u16, reason: &str) -> Result<(), axum::Error> {
    let close_msg = Message::Close(Some(CloseFrame {
        code,
        reason: reason.to_string().into(),
    }));
    ws_tx.send(close_msg).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_side_closes_carry_a_code() {
        assert_eq!(
            close_frame_for(DisconnectCause::ServerShutdown).map(|(code, _)| code),
            Some(CLOSE_GOING_AWAY)
        );
        assert_eq!(
            close_frame_for(DisconnectCause::DeliveryFailed).map(|(code, _)| code),
            Some(CLOSE_TRY_AGAIN_LATER)
        );
        assert!(close_frame_for(DisconnectCause::PeerClosed).is_none());
        assert!(close_frame_for(DisconnectCause::TransportError).is_none());
    }

    #[test]
    fn unparseable_query_means_no_token() {
        let uri: Uri = "/ws/chat/7?token=abc".parse().unwrap();
        assert_eq!(ConnectParams::token_from(&uri).as_deref(), Some("abc"));

        for raw in ["/ws/chat/7", "/ws/chat/7?token=a&token=b"] {
            let uri: Uri = raw.parse().unwrap();
            assert_eq!(ConnectParams::token_from(&uri), None, "{raw}");
        }
    }
}
