//! Message store boundary: durable, per-room, append-only history.
//!
//! `append` must be durable before it returns and ids must grow with every
//! append to a room; the gateway's ordering guarantees depend on both.

pub mod memory;
pub mod postgres;

use std::fmt;

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};

use crate::models::{RoomId, StoredMessage, UserIdentity};

pub use memory::MemoryMessageStore;
pub use postgres::PgMessageStore;

/// Page size used when the deployment does not configure one.
pub const DEFAULT_PAGE_SIZE: usize = 50;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("room {0} does not exist")]
    UnknownRoom(RoomId),
    #[error("invalid pagination cursor")]
    InvalidCursor,
    #[error("message store unavailable: {0}")]
    Unavailable(String),
}

/// Opaque pagination position. Callers must not inspect or construct it.
#[derive(Clone, PartialEq, Eq)]
pub struct Cursor(String);

impl Cursor {
    /// Position strictly older than `message_id`.
    pub(crate) fn before(message_id: i64) -> Self {
        Self(URL_SAFE_NO_PAD.encode(message_id.to_be_bytes()))
    }

    pub(crate) fn message_id(&self) -> Result<i64, StoreError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(&self.0)
            .map_err(|_| StoreError::InvalidCursor)?;
        let arr: [u8; 8] = bytes.try_into().map_err(|_| StoreError::InvalidCursor)?;
        Ok(i64::from_be_bytes(arr))
    }

    /// Re-hydrate a cursor previously handed out by [`Cursor::as_str`].
    pub fn from_opaque(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Cursor").field(&self.0).finish()
    }
}

/// One page of history, newest first.
#[derive(Debug, Clone)]
pub struct Page {
    pub items: Vec<StoredMessage>,
    pub next_cursor: Option<Cursor>,
}

impl Page {
    /// Build a page from up to `limit + 1` rows ordered newest first.
    pub(crate) fn from_overfetch(mut rows: Vec<StoredMessage>, limit: usize) -> Self {
        let has_more = rows.len() > limit;
        rows.truncate(limit);
        let next_cursor = if has_more {
            rows.last().map(|m| Cursor::before(m.id))
        } else {
            None
        };
        Self {
            items: rows,
            next_cursor,
        }
    }
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a message. The store assigns `id` and `created_at`.
    async fn append(
        &self,
        room: &RoomId,
        sender: &UserIdentity,
        text: &str,
    ) -> Result<StoredMessage, StoreError>;

    /// Reverse-chronological history. `limit` is clamped to the store's
    /// configured page size.
    async fn page(
        &self,
        room: &RoomId,
        cursor: Option<&Cursor>,
        limit: usize,
    ) -> Result<Page, StoreError>;
}

pub(crate) fn clamp_limit(limit: usize, page_size: usize) -> usize {
    limit.clamp(1, page_size.max(1))
}
