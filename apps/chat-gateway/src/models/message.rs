use chrono::{DateTime, SecondsFormat, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize, Serializer};

use crate::db::schema::chat_messages;

use super::{RoomId, UserIdentity};

/// A persisted chat message. `id` and `created_at` are only ever assigned by
/// a message store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: i64,
    pub room_id: RoomId,
    pub sender: UserIdentity,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

/// Outbound broadcast frame:
/// `{"id", "text", "sender": {"id", "username"}, "created_at"}`.
#[derive(Debug, Serialize)]
pub struct WireMessage<'a> {
    pub id: i64,
    pub text: &'a str,
    pub sender: &'a UserIdentity,
    #[serde(serialize_with = "iso8601")]
    pub created_at: &'a DateTime<Utc>,
}

impl StoredMessage {
    pub fn to_wire(&self) -> WireMessage<'_> {
        WireMessage {
            id: self.id,
            text: &self.text,
            sender: &self.sender,
            created_at: &self.created_at,
        }
    }
}

fn iso8601<S: Serializer>(ts: &&DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Micros, false))
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = chat_messages)]
pub struct MessageRow {
    pub id: i64,
    pub channel_id: i64,
    pub sender_id: i64,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = chat_messages)]
pub struct NewMessage<'a> {
    pub channel_id: i64,
    pub sender_id: i64,
    pub text: &'a str,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn wire_shape_matches_broadcast_format() {
        let msg = StoredMessage {
            id: 42,
            room_id: RoomId::from("7"),
            sender: UserIdentity {
                id: 1,
                username: "alice".to_string(),
            },
            text: "hi".to_string(),
            created_at: Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap(),
        };

        let value = serde_json::to_value(msg.to_wire()).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "id": 42,
                "text": "hi",
                "sender": { "id": 1, "username": "alice" },
                "created_at": "2025-03-01T12:00:00.000000+00:00",
            })
        );
    }
}
