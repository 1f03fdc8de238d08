use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chat_common::SnowflakeGenerator;
use chrono::Utc;
use parking_lot::Mutex;

use crate::models::{RoomId, StoredMessage, UserIdentity};

use super::{clamp_limit, Cursor, MessageStore, Page, StoreError, DEFAULT_PAGE_SIZE};

/// In-process message log. Every room is implicitly known.
pub struct MemoryMessageStore {
    rooms: Mutex<HashMap<RoomId, Vec<StoredMessage>>>,
    snowflake: SnowflakeGenerator,
    page_size: usize,
    appends: AtomicUsize,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::with_page_size(DEFAULT_PAGE_SIZE)
    }

    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
            snowflake: SnowflakeGenerator::new(0),
            page_size,
            appends: AtomicUsize::new(0),
        }
    }

    /// Number of successful appends across all rooms.
    pub fn append_count(&self) -> usize {
        self.appends.load(Ordering::SeqCst)
    }

    /// Full log of a room in append order.
    pub fn messages(&self, room: &RoomId) -> Vec<StoredMessage> {
        self.rooms.lock().get(room).cloned().unwrap_or_default()
    }
}

impl Default for MemoryMessageStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn append(
        &self,
        room: &RoomId,
        sender: &UserIdentity,
        text: &str,
    ) -> Result<StoredMessage, StoreError> {
        let mut rooms = self.rooms.lock();
        // Id generation happens under the lock so the log stays sorted by id.
        let message = StoredMessage {
            id: self.snowflake.generate(),
            room_id: room.clone(),
            sender: sender.clone(),
            text: text.to_string(),
            created_at: Utc::now(),
        };
        rooms.entry(room.clone()).or_default().push(message.clone());
        self.appends.fetch_add(1, Ordering::SeqCst);
        Ok(message)
    }

    async fn page(
        &self,
        room: &RoomId,
        cursor: Option<&Cursor>,
        limit: usize,
    ) -> Result<Page, StoreError> {
        let limit = clamp_limit(limit, self.page_size);
        let before = cursor.map(Cursor::message_id).transpose()?;

        let rooms = self.rooms.lock();
        let rows: Vec<StoredMessage> = rooms
            .get(room)
            .map(|log| {
                log.iter()
                    .rev()
                    .filter(|m| before.map_or(true, |b| m.id < b))
                    .take(limit + 1)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        Ok(Page::from_overfetch(rows, limit))
    }
}
