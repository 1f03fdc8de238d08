//! Postgres-backed message store.

use async_trait::async_trait;
use chrono::Utc;
use diesel::prelude::*;
use diesel_async::RunQueryDsl;

use crate::db::pool::DbPool;
use crate::db::schema::{chat_messages, users};
use crate::models::message::{MessageRow, NewMessage};
use crate::models::user::UserRow;
use crate::models::{RoomId, StoredMessage, UserIdentity};

use super::{clamp_limit, Cursor, MessageStore, Page, StoreError};

#[derive(Clone)]
pub struct PgMessageStore {
    db: DbPool,
    page_size: usize,
}

impl PgMessageStore {
    pub fn new(db: DbPool, page_size: usize) -> Self {
        Self { db, page_size }
    }
}

fn unavailable(err: impl std::fmt::Debug) -> StoreError {
    StoreError::Unavailable(format!("{err:?}"))
}

fn channel_id(room: &RoomId) -> Result<i64, StoreError> {
    room.as_i64().ok_or_else(|| StoreError::UnknownRoom(room.clone()))
}

#[async_trait]
impl MessageStore for PgMessageStore {
    async fn append(
        &self,
        room: &RoomId,
        sender: &UserIdentity,
        text: &str,
    ) -> Result<StoredMessage, StoreError> {
        let channel_id = channel_id(room)?;
        let mut conn = self.db.get().await.map_err(unavailable)?;

        let row: MessageRow = diesel::insert_into(chat_messages::table)
            .values(NewMessage {
                channel_id,
                sender_id: sender.id,
                text,
                created_at: Utc::now(),
            })
            .returning(MessageRow::as_returning())
            .get_result(&mut conn)
            .await
            .map_err(|err| match err {
                diesel::result::Error::DatabaseError(
                    diesel::result::DatabaseErrorKind::ForeignKeyViolation,
                    _,
                ) => StoreError::UnknownRoom(room.clone()),
                other => unavailable(other),
            })?;

        Ok(StoredMessage {
            id: row.id,
            room_id: room.clone(),
            sender: sender.clone(),
            text: row.text,
            created_at: row.created_at,
        })
    }

    async fn page(
        &self,
        room: &RoomId,
        cursor: Option<&Cursor>,
        limit: usize,
    ) -> Result<Page, StoreError> {
        let channel_id = channel_id(room)?;
        let limit = clamp_limit(limit, self.page_size);
        let before = cursor.map(Cursor::message_id).transpose()?;

        let mut query = chat_messages::table
            .inner_join(users::table)
            .filter(chat_messages::channel_id.eq(channel_id))
            .order(chat_messages::id.desc())
            .limit(limit as i64 + 1)
            .select((MessageRow::as_select(), UserRow::as_select()))
            .into_boxed();

        if let Some(before) = before {
            query = query.filter(chat_messages::id.lt(before));
        }

        let mut conn = self.db.get().await.map_err(unavailable)?;
        let rows: Vec<(MessageRow, UserRow)> =
            query.load(&mut conn).await.map_err(unavailable)?;

        let items = rows
            .into_iter()
            .map(|(msg, user)| StoredMessage {
                id: msg.id,
                room_id: room.clone(),
                sender: user.into(),
                text: msg.text,
                created_at: msg.created_at,
            })
            .collect();

        Ok(Page::from_overfetch(items, limit))
    }
}
