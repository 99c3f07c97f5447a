//! Session presence table: who is in the room and when we last heard from them.

use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq)]
pub struct Viewer {
    pub user_id: String,
    pub nickname: String,
    pub joined_at: Instant,
    pub last_active: Instant,
    pub greeted: bool,
}

/// Presence for the current session. Entries are created on first sighting and never removed.
#[derive(Debug, Default)]
pub struct ViewerTable {
    viewers: DashMap<String, Viewer>,
}

impl ViewerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or refresh a viewer. A blank nickname keeps the stored one
    /// (or the user id for a new viewer).
    pub fn touch(&self, user_id: &str, nickname: &str) -> Viewer {
        let now = Instant::now();
        let nick = nickname.trim();
        let mut entry = self.viewers.entry(user_id.to_string()).or_insert_with(|| Viewer {
            user_id: user_id.to_string(),
            nickname: if nick.is_empty() { user_id.to_string() } else { nick.to_string() },
            joined_at: now,
            last_active: now,
            greeted: false,
        });
        if !nick.is_empty() {
            entry.nickname = nick.to_string();
        }
        entry.last_active = now;
        entry.clone()
    }

    pub fn get(&self, user_id: &str) -> Option<Viewer> {
        self.viewers.get(user_id).map(|v| v.clone())
    }

    /// Heard from within `ttl`.
    pub fn is_present(&self, user_id: &str, ttl: Duration) -> bool {
        self.viewers
            .get(user_id)
            .map(|v| Instant::now().duration_since(v.last_active) <= ttl)
            .unwrap_or(false)
    }

    /// Flag the viewer as greeted. Returns false for unknown viewers.
    pub fn mark_greeted(&self, user_id: &str) -> bool {
        match self.viewers.get_mut(user_id) {
            Some(mut viewer) => {
                viewer.greeted = true;
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.viewers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.viewers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn touch_creates_then_refreshes() {
        let table = ViewerTable::new();
        let first = table.touch("u1", "");
        assert_eq!(first.nickname, "u1");

        tokio::time::advance(Duration::from_secs(10)).await;
        let second = table.touch("u1", "Anna");
        assert_eq!(second.nickname, "Anna");
        assert_eq!(second.joined_at, first.joined_at);
        assert!(second.last_active > first.last_active);

        let third = table.touch("u1", "  ");
        assert_eq!(third.nickname, "Anna");
        assert_eq!(table.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn presence_follows_last_activity() {
        let table = ViewerTable::new();
        table.touch("u1", "Anna");
        tokio::time::advance(Duration::from_secs(45)).await;
        assert!(table.is_present("u1", Duration::from_secs(45)));
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(!table.is_present("u1", Duration::from_secs(45)));
        assert!(!table.is_present("ghost", Duration::from_secs(45)));
    }

    #[test]
    fn greeted_flag() {
        let table = ViewerTable::new();
        assert!(!table.mark_greeted("u1"));
        table.touch("u1", "Anna");
        assert!(table.mark_greeted("u1"));
        assert!(table.get("u1").map(|v| v.greeted).unwrap_or(false));
    }
}
