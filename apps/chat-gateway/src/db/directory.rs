//! Postgres-backed room and user directory.

use async_trait::async_trait;
use diesel::prelude::*;
use diesel::result::OptionalExtension;
use diesel_async::RunQueryDsl;

use crate::db::pool::DbPool;
use crate::db::schema::{chat_channels, users};
use crate::directory::{DirectoryError, RoomDirectory, UserDirectory};
use crate::models::user::UserRow;
use crate::models::{RoomId, UserIdentity};

/// Any authenticated user may join any existing channel.
#[derive(Clone)]
pub struct PgDirectory {
    db: DbPool,
}

impl PgDirectory {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }
}

fn unavailable(err: impl std::fmt::Debug) -> DirectoryError {
    tracing::error!(?err, "directory query failed");
    DirectoryError::Unavailable(format!("{err:?}"))
}

#[async_trait]
impl RoomDirectory for PgDirectory {
    async fn may_join(&self, _user: &UserIdentity, room: &RoomId) -> Result<bool, DirectoryError> {
        let Some(channel_id) = room.as_i64() else {
            return Ok(false);
        };

        let mut conn = self.db.get().await.map_err(unavailable)?;
        let found: Option<i64> = chat_channels::table
            .find(channel_id)
            .select(chat_channels::id)
            .get_result(&mut conn)
            .await
            .optional()
            .map_err(unavailable)?;

        Ok(found.is_some())
    }
}

#[async_trait]
impl UserDirectory for PgDirectory {
    async fn find_user(&self, user_id: i64) -> Result<Option<UserIdentity>, DirectoryError> {
        let mut conn = self.db.get().await.map_err(unavailable)?;
        let row: Option<UserRow> = users::table
            .find(user_id)
            .select(UserRow::as_select())
            .get_result(&mut conn)
            .await
            .optional()
            .map_err(unavailable)?;

        Ok(row.map(UserIdentity::from))
    }
}
