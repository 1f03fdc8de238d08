//! Room authorization and user lookup boundaries.
//!
//! Rooms and users are owned by the surrounding application; the gateway only
//! asks whether a user may join a room and who a token's subject is.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::models::{RoomId, UserIdentity};

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("directory backend unavailable: {0}")]
    Unavailable(String),
}

/// Authorization check consulted before a connection is admitted to a room.
#[async_trait]
pub trait RoomDirectory: Send + Sync {
    async fn may_join(&self, user: &UserIdentity, room: &RoomId) -> Result<bool, DirectoryError>;
}

/// Resolves a token subject to a stable identity.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn find_user(&self, user_id: i64) -> Result<Option<UserIdentity>, DirectoryError>;
}

// ---------------------------------------------------------------------------
// In-memory implementation (tests / local development)
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Inner {
    users: HashMap<i64, UserIdentity>,
    rooms: HashSet<RoomId>,
    denied: HashSet<(i64, RoomId)>,
}

/// Any known user may join any known room unless explicitly denied.
#[derive(Default)]
pub struct MemoryDirectory {
    inner: RwLock<Inner>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_user(&self, id: i64, username: &str) -> UserIdentity {
        let user = UserIdentity {
            id,
            username: username.to_string(),
        };
        self.inner.write().users.insert(id, user.clone());
        user
    }

    pub fn add_room(&self, room: impl Into<RoomId>) {
        self.inner.write().rooms.insert(room.into());
    }

    pub fn deny(&self, user_id: i64, room: impl Into<RoomId>) {
        self.inner.write().denied.insert((user_id, room.into()));
    }
}

#[async_trait]
impl RoomDirectory for MemoryDirectory {
    async fn may_join(&self, user: &UserIdentity, room: &RoomId) -> Result<bool, DirectoryError> {
        let inner = self.inner.read();
        Ok(inner.rooms.contains(room) && !inner.denied.contains(&(user.id, room.clone())))
    }
}

#[async_trait]
impl UserDirectory for MemoryDirectory {
    async fn find_user(&self, user_id: i64) -> Result<Option<UserIdentity>, DirectoryError> {
        Ok(self.inner.read().users.get(&user_id).cloned())
    }
}
