//! Wire formats and close codes.

use serde::Deserialize;

use crate::models::StoredMessage;

// ---------------------------------------------------------------------------
// Close codes
// ---------------------------------------------------------------------------

/// Handshake refused: missing/invalid token or no access to the room.
/// Both cases share one code so clients cannot tell them apart.
pub const CLOSE_UNAUTHENTICATED: u16 = 4001;
pub const CLOSE_UNAUTHENTICATED_REASON: &str = "unauthenticated";

/// Server shutdown or idle peer (RFC 6455 "going away").
pub const CLOSE_GOING_AWAY: u16 = 1001;

/// The connection could not keep up with its room and was dropped.
pub const CLOSE_TRY_AGAIN_LATER: u16 = 1013;

/// Longest accepted message text, in characters, after trimming.
pub const MAX_MESSAGE_CHARS: usize = 4000;

// ---------------------------------------------------------------------------
// Client -> Server
// ---------------------------------------------------------------------------

/// Inbound envelope, dispatched on its `type` field.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum InboundFrame {
    #[serde(rename = "chat.message")]
    ChatMessage {
        #[serde(default)]
        text: Option<String>,
    },
    /// Any other `type`; ignored for forward compatibility.
    #[serde(other)]
    Unknown,
}

/// Why an inbound frame was dropped without effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Malformed {
    NotJson,
    BlankText,
    TooLong,
}

impl std::fmt::Display for Malformed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Malformed::NotJson => "frame is not a typed JSON object",
            Malformed::BlankText => "text is missing or blank",
            Malformed::TooLong => "text exceeds the length limit",
        })
    }
}

/// Decode a raw text frame.
///
/// `Ok(Some(text))` is a chat message with trimmed, non-empty text;
/// `Ok(None)` is a well-formed frame of a type this server does not handle.
pub fn decode_inbound(raw: &str) -> Result<Option<String>, Malformed> {
    let frame: InboundFrame = serde_json::from_str(raw).map_err(|_| Malformed::NotJson)?;

    match frame {
        InboundFrame::ChatMessage { text } => {
            let text = text.as_deref().map(str::trim).unwrap_or_default();
            if text.is_empty() {
                return Err(Malformed::BlankText);
            }
            if text.chars().count() > MAX_MESSAGE_CHARS {
                return Err(Malformed::TooLong);
            }
            Ok(Some(text.to_string()))
        }
        InboundFrame::Unknown => Ok(None),
    }
}

// ---------------------------------------------------------------------------
// Server -> Client
// ---------------------------------------------------------------------------

pub fn encode_outbound(message: &StoredMessage) -> Result<String, serde_json::Error> {
    serde_json::to_string(&message.to_wire())
}
