//! Live-audience events as they arrive from the event source.

use crate::error::{PalError, PalResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use tokio::time::Instant;

/// One audience event. Immutable once validated; owned by whichever queue holds it.
///
/// Wire form (one JSON object per line):
/// `{"type":"comment","user_id":"u1","nickname":"Anna","text":"hallo"}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveEvent {
    pub user_id: String,
    #[serde(default)]
    pub nickname: String,
    #[serde(skip, default = "Instant::now")]
    pub received_at: Instant,
    #[serde(flatten)]
    pub kind: EventKind,
}

/// Closed set of event variants with their payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    Comment {
        text: String,
    },
    Gift {
        #[serde(default = "default_gift_name")]
        gift_name: String,
        #[serde(default = "one")]
        repeat_count: u32,
    },
    Follow,
    Share,
    Subscribe,
    Like {
        #[serde(default = "one")]
        count: u32,
    },
    Join,
    Disconnect,
}

fn default_gift_name() -> String {
    "Gift".to_string()
}

fn one() -> u32 {
    1
}

/// Event category; each non-comment category has its own dispatcher queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventCategory {
    Comment,
    Gift,
    Follow,
    Share,
    Subscribe,
    Like,
    Join,
    Disconnect,
}

impl EventCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventCategory::Comment => "comment",
            EventCategory::Gift => "gift",
            EventCategory::Follow => "follow",
            EventCategory::Share => "share",
            EventCategory::Subscribe => "subscribe",
            EventCategory::Like => "like",
            EventCategory::Join => "join",
            EventCategory::Disconnect => "disconnect",
        }
    }
}

impl fmt::Display for EventCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl LiveEvent {
    pub fn new(user_id: impl Into<String>, nickname: impl Into<String>, kind: EventKind) -> Self {
        Self {
            user_id: user_id.into(),
            nickname: nickname.into(),
            received_at: Instant::now(),
            kind,
        }
    }

    pub fn comment(user_id: &str, nickname: &str, text: &str) -> Self {
        Self::new(user_id, nickname, EventKind::Comment { text: text.to_string() })
    }

    pub fn gift(user_id: &str, nickname: &str, gift_name: &str, repeat_count: u32) -> Self {
        Self::new(
            user_id,
            nickname,
            EventKind::Gift {
                gift_name: gift_name.to_string(),
                repeat_count,
            },
        )
    }

    pub fn like(user_id: &str, nickname: &str, count: u32) -> Self {
        Self::new(user_id, nickname, EventKind::Like { count })
    }

    pub fn join(user_id: &str, nickname: &str) -> Self {
        Self::new(user_id, nickname, EventKind::Join)
    }

    pub fn follow(user_id: &str, nickname: &str) -> Self {
        Self::new(user_id, nickname, EventKind::Follow)
    }

    pub fn share(user_id: &str, nickname: &str) -> Self {
        Self::new(user_id, nickname, EventKind::Share)
    }

    pub fn subscribe(user_id: &str, nickname: &str) -> Self {
        Self::new(user_id, nickname, EventKind::Subscribe)
    }

    /// Parse one line of the JSON wire feed.
    pub fn from_json(line: &str) -> PalResult<Self> {
        Ok(serde_json::from_str(line)?)
    }

    /// Reject events without a user id; default a blank nickname to the user id.
    pub fn validate(mut self) -> PalResult<Self> {
        let uid = self.user_id.trim();
        if uid.is_empty() {
            return Err(PalError::InvalidEvent(format!("{} event without user id", self.category())));
        }
        self.user_id = uid.to_string();
        let nick = self.nickname.trim();
        self.nickname = if nick.is_empty() { self.user_id.clone() } else { nick.to_string() };
        Ok(self)
    }

    pub fn category(&self) -> EventCategory {
        match self.kind {
            EventKind::Comment { .. } => EventCategory::Comment,
            EventKind::Gift { .. } => EventCategory::Gift,
            EventKind::Follow => EventCategory::Follow,
            EventKind::Share => EventCategory::Share,
            EventKind::Subscribe => EventCategory::Subscribe,
            EventKind::Like { .. } => EventCategory::Like,
            EventKind::Join => EventCategory::Join,
            EventKind::Disconnect => EventCategory::Disconnect,
        }
    }

    /// Identity used for duplicate suppression. Likes and disconnects are never deduplicated.
    pub fn fingerprint(&self) -> Option<Fingerprint> {
        let category = self.category();
        let uid = self.user_id.as_str();
        match &self.kind {
            EventKind::Comment { text } => {
                let normalized = text.trim().to_lowercase();
                Some(Fingerprint::of(&[category.as_str(), uid, &normalized]))
            }
            EventKind::Gift {
                gift_name,
                repeat_count,
            } => Some(Fingerprint::of(&[
                category.as_str(),
                uid,
                gift_name,
                &repeat_count.to_string(),
            ])),
            EventKind::Follow | EventKind::Share | EventKind::Subscribe | EventKind::Join => {
                Some(Fingerprint::of(&[category.as_str(), uid]))
            }
            EventKind::Like { .. } | EventKind::Disconnect => None,
        }
    }
}

/// SHA-256 hex digest of an event's identity parts.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of(parts: &[&str]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(parts.join("|").as_bytes());
        Fingerprint(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_wire_comment() {
        let event = LiveEvent::from_json(r#"{"type":"comment","user_id":"u1","nickname":"Anna","text":"hallo"}"#)
            .expect("parse");
        assert_eq!(event.category(), EventCategory::Comment);
        assert_eq!(event.kind, EventKind::Comment { text: "hallo".into() });
    }

    #[test]
    fn parses_wire_gift_with_defaults() {
        let event = LiveEvent::from_json(r#"{"type":"gift","user_id":"u1"}"#).expect("parse");
        assert_eq!(
            event.kind,
            EventKind::Gift {
                gift_name: "Gift".into(),
                repeat_count: 1
            }
        );
        assert!(LiveEvent::from_json(r#"{"type":"wave","user_id":"u1"}"#).is_err());
    }

    #[test]
    fn validation_rejects_blank_uid_and_defaults_nick() {
        assert!(LiveEvent::follow("  ", "x").validate().is_err());
        let event = LiveEvent::follow(" u7 ", "").validate().expect("valid");
        assert_eq!(event.user_id, "u7");
        assert_eq!(event.nickname, "u7");
    }

    #[test]
    fn comment_fingerprint_normalizes_text() {
        let a = LiveEvent::comment("u1", "A", "  Hallo Welt ").fingerprint();
        let b = LiveEvent::comment("u1", "A", "hallo welt").fingerprint();
        let c = LiveEvent::comment("u2", "A", "hallo welt").fingerprint();
        assert_eq!(a, b);
        assert_ne!(b, c);
        assert_eq!(a.map(|f| f.as_str().len()), Some(64));
    }

    #[test]
    fn gift_fingerprint_includes_count() {
        let a = LiveEvent::gift("u1", "A", "Rose", 1).fingerprint();
        let b = LiveEvent::gift("u1", "A", "Rose", 5).fingerprint();
        assert_ne!(a, b);
    }

    #[test]
    fn likes_are_not_fingerprinted() {
        assert!(LiveEvent::like("u1", "A", 50).fingerprint().is_none());
        assert_ne!(
            LiveEvent::follow("u1", "A").fingerprint(),
            LiveEvent::share("u1", "A").fingerprint()
        );
    }
}
