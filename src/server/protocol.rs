//! Wire protocol definitions
//!
//! Clients upgrade at `/ws/{room}?token=<jwt>`. After the upgrade every frame
//! in either direction is plain UTF-8 text: clients send raw chat lines, the
//! relay sends the three room event formats below. There is no envelope and no
//! in-band error frame.

use std::fmt;

use thiserror::Error;
use tokio_tungstenite::tungstenite::http::StatusCode;
use url::form_urlencoded;

use crate::auth::Identity;

/// Path prefix of the room endpoint
pub const ROOM_PATH_PREFIX: &str = "/ws/";

/// Query parameter carrying the bearer token
pub const TOKEN_PARAM: &str = "token";

// ============================================================================
// Error Types
// ============================================================================

/// Upgrade request targets the relay cannot serve
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("No room endpoint at {0}")]
    NotFound(String),

    #[error("Room name is not valid UTF-8 after decoding: {0}")]
    InvalidEncoding(String),

    #[error("Missing token query parameter")]
    MissingToken,
}

impl ProtocolError {
    /// HTTP status used to refuse the upgrade
    pub fn status(&self) -> StatusCode {
        match self {
            ProtocolError::NotFound(_) => StatusCode::NOT_FOUND,
            ProtocolError::InvalidEncoding(_) => StatusCode::BAD_REQUEST,
            // Same refusal as an invalid token
            ProtocolError::MissingToken => StatusCode::FORBIDDEN,
        }
    }
}

/// Result type for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;

// ============================================================================
// Upgrade Target
// ============================================================================

/// Room and credential named by an upgrade request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeTarget {
    /// Decoded room name
    pub room: String,
    /// Raw bearer token
    pub token: String,
}

impl UpgradeTarget {
    /// Parse the request path and query string
    ///
    /// The room is the single path segment after `/ws/`; a room name cannot
    /// contain an unescaped `/`.
    pub fn parse(path: &str, query: Option<&str>) -> ProtocolResult<Self> {
        let encoded_room = path
            .strip_prefix(ROOM_PATH_PREFIX)
            .filter(|rest| !rest.is_empty() && !rest.contains('/'))
            .ok_or_else(|| ProtocolError::NotFound(path.to_string()))?;

        let room = urlencoding::decode(encoded_room)
            .map_err(|_| ProtocolError::InvalidEncoding(encoded_room.to_string()))?
            .into_owned();

        let token = query
            .and_then(|q| {
                form_urlencoded::parse(q.as_bytes())
                    .find(|(key, _)| *key == TOKEN_PARAM)
                    .map(|(_, value)| value.into_owned())
            })
            .filter(|token| !token.is_empty())
            .ok_or(ProtocolError::MissingToken)?;

        Ok(Self { room, token })
    }
}

// ============================================================================
// Room Events
// ============================================================================

/// Text frames the relay sends to room members
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomEvent<'a> {
    /// A member entered the room (not sent to the member itself)
    Joined { identity: &'a Identity },
    /// A member sent a chat line
    Chat { identity: &'a Identity, text: &'a str },
    /// A member left the room
    Left { identity: &'a Identity },
}

impl<'a> RoomEvent<'a> {
    pub fn joined(identity: &'a Identity) -> Self {
        RoomEvent::Joined { identity }
    }

    pub fn chat(identity: &'a Identity, text: &'a str) -> Self {
        RoomEvent::Chat { identity, text }
    }

    pub fn left(identity: &'a Identity) -> Self {
        RoomEvent::Left { identity }
    }
}

impl fmt::Display for RoomEvent<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoomEvent::Joined { identity } => write!(f, "{} joined.", identity),
            RoomEvent::Chat { identity, text } => write!(f, "{}: {}", identity, text),
            RoomEvent::Left { identity } => write!(f, "{} left.", identity),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_room_and_token() {
        let target = UpgradeTarget::parse("/ws/general", Some("token=abc.def.ghi")).unwrap();
        assert_eq!(target.room, "general");
        assert_eq!(target.token, "abc.def.ghi");
    }

    #[test]
    fn test_parse_percent_encoded_room() {
        let target = UpgradeTarget::parse("/ws/caf%C3%A9%20talk", Some("token=t")).unwrap();
        assert_eq!(target.room, "café talk");
    }

    #[test]
    fn test_parse_token_among_other_params() {
        let target = UpgradeTarget::parse("/ws/general", Some("v=2&token=a%2Bb&x=1")).unwrap();
        assert_eq!(target.token, "a+b");
    }

    #[test]
    fn test_parse_wrong_path() {
        for path in ["/", "/ws", "/ws/", "/chat/general", "/ws/general/extra"] {
            let result = UpgradeTarget::parse(path, Some("token=t"));
            assert_eq!(
                result,
                Err(ProtocolError::NotFound(path.to_string())),
                "path {}",
                path
            );
        }
    }

    #[test]
    fn test_parse_invalid_utf8_room() {
        let result = UpgradeTarget::parse("/ws/%FF", Some("token=t"));
        assert!(matches!(result, Err(ProtocolError::InvalidEncoding(_))));
    }

    #[test]
    fn test_parse_missing_token() {
        assert_eq!(
            UpgradeTarget::parse("/ws/general", None),
            Err(ProtocolError::MissingToken)
        );
        assert_eq!(
            UpgradeTarget::parse("/ws/general", Some("other=1")),
            Err(ProtocolError::MissingToken)
        );
        assert_eq!(
            UpgradeTarget::parse("/ws/general", Some("token=")),
            Err(ProtocolError::MissingToken)
        );
    }

    #[test]
    fn test_error_status_codes() {
        assert_eq!(
            ProtocolError::NotFound("/".to_string()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(ProtocolError::MissingToken.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            ProtocolError::InvalidEncoding("%FF".to_string()).status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn test_room_event_text() {
        let alice = Identity::new("alice");
        assert_eq!(RoomEvent::joined(&alice).to_string(), "alice joined.");
        assert_eq!(RoomEvent::chat(&alice, "hi").to_string(), "alice: hi");
        assert_eq!(RoomEvent::left(&alice).to_string(), "alice left.");
    }

    #[test]
    fn test_chat_text_is_verbatim() {
        let alice = Identity::new("alice");
        let raw = "<b>bold</b>: \"quoted\"\nnext line";
        assert_eq!(
            RoomEvent::chat(&alice, raw).to_string(),
            format!("alice: {}", raw)
        );
    }
}
