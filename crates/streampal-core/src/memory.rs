//! Durable per-viewer memory: counters, rolling comment history, greeting stamp
//! and free-form background facts, kept in one JSON file.
//!
//! The in-memory map is authoritative. Mutations only mark the store dirty; a
//! single writer task serializes a snapshot and rewrites the whole file off the
//! runtime (`<file>.tmp` then rename). Bursts of mutations coalesce into one write.
//! A failed write is logged and the store stays dirty, so the next mutation or
//! sweep retries it.

use crate::config::MemoryConfig;
use crate::error::{PalError, PalResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

const BACKGROUND_VALUE_CHARS: usize = 48;

/// Everything remembered about one viewer across sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserMemory {
    pub nickname: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    #[serde(default)]
    pub likes: u64,
    #[serde(default)]
    pub gifts: u64,
    #[serde(default)]
    pub follows: u64,
    #[serde(default)]
    pub subs: u64,
    #[serde(default)]
    pub shares: u64,
    #[serde(default)]
    pub joins: u64,
    #[serde(default)]
    pub history: VecDeque<String>,
    #[serde(default)]
    pub last_greet: Option<DateTime<Utc>>,
    #[serde(default)]
    pub background: BTreeMap<String, String>,
}

impl UserMemory {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            nickname: String::new(),
            first_seen: now,
            last_seen: now,
            likes: 0,
            gifts: 0,
            follows: 0,
            subs: 0,
            shares: 0,
            joins: 0,
            history: VecDeque::new(),
            last_greet: None,
            background: BTreeMap::new(),
        }
    }
}

/// Changes applied by one [`MemoryStore::remember`] call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryDelta {
    pub likes: u64,
    pub gifts: u64,
    pub follows: u64,
    pub subs: u64,
    pub shares: u64,
    pub joins: u64,
    pub comment: Option<String>,
    pub background: BTreeMap<String, String>,
}

impl MemoryDelta {
    pub fn comment(text: impl Into<String>) -> Self {
        Self {
            comment: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn gifts(count: u64) -> Self {
        Self {
            gifts: count,
            ..Default::default()
        }
    }

    pub fn likes(count: u64) -> Self {
        Self {
            likes: count,
            ..Default::default()
        }
    }

    pub fn follow() -> Self {
        Self {
            follows: 1,
            ..Default::default()
        }
    }

    pub fn subscribe() -> Self {
        Self {
            subs: 1,
            ..Default::default()
        }
    }

    pub fn share() -> Self {
        Self {
            shares: 1,
            ..Default::default()
        }
    }

    pub fn join() -> Self {
        Self {
            joins: 1,
            ..Default::default()
        }
    }

    pub fn with_fact(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.background.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct MemoryFile {
    created: DateTime<Utc>,
    #[serde(default)]
    users: BTreeMap<String, UserMemory>,
}

impl MemoryFile {
    fn empty() -> Self {
        Self {
            created: Utc::now(),
            users: BTreeMap::new(),
        }
    }
}

/// Shared handle on the durable viewer memory.
#[derive(Debug)]
pub struct MemoryStore {
    path: PathBuf,
    enabled: bool,
    per_user_history: usize,
    decay: chrono::Duration,
    sweep_interval: Duration,
    state: Mutex<MemoryFile>,
    dirty: AtomicBool,
    changed: Notify,
    // one file write at a time, shared with the blocking pool
    write_lock: Arc<Mutex<()>>,
}

impl MemoryStore {
    /// Load the memory file. Missing or unreadable files start empty; decayed records are dropped.
    pub fn open(config: &MemoryConfig) -> Self {
        let path = PathBuf::from(&config.file);
        let decay = chrono::Duration::days(i64::from(config.decay_days));
        let per_user_history = config.per_user_history.max(1);

        let mut file = if config.enabled {
            load_file(&path)
        } else {
            MemoryFile::empty()
        };
        let now = Utc::now();
        let before = file.users.len();
        file.users.retain(|_, user| now - user.last_seen <= decay);
        for user in file.users.values_mut() {
            while user.history.len() > per_user_history {
                user.history.pop_front();
            }
        }
        if before != file.users.len() {
            info!(dropped = before - file.users.len(), "🧹 Dropped decayed viewer records on load");
        }
        info!(users = file.users.len(), path = %path.display(), enabled = config.enabled, "🧠 Viewer memory ready");

        Self {
            path,
            enabled: config.enabled,
            per_user_history,
            decay,
            sweep_interval: Duration::from_secs(config.sweep_interval_secs.max(1)),
            state: Mutex::new(file),
            dirty: AtomicBool::new(false),
            changed: Notify::new(),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn lock(&self) -> MutexGuard<'_, MemoryFile> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
        self.changed.notify_one();
    }

    /// Apply counters, history and facts for one viewer, refresh last-seen and schedule a write.
    /// No-op while memory is disabled.
    pub fn remember(&self, user_id: &str, nickname: &str, delta: MemoryDelta) {
        if !self.enabled {
            return;
        }
        let now = Utc::now();
        let mut state = self.lock();
        let user = state
            .users
            .entry(user_id.to_string())
            .or_insert_with(|| UserMemory::new(now));
        user.last_seen = now;
        let nick = nickname.trim();
        if !nick.is_empty() {
            user.nickname = nick.to_string();
        }
        user.likes += delta.likes;
        user.gifts += delta.gifts;
        user.follows += delta.follows;
        user.subs += delta.subs;
        user.shares += delta.shares;
        user.joins += delta.joins;
        if let Some(comment) = delta.comment {
            user.history.push_back(comment);
            while user.history.len() > self.per_user_history {
                user.history.pop_front();
            }
        }
        user.background.extend(delta.background);
        drop(state);
        self.mark_dirty();
    }

    pub fn get(&self, user_id: &str) -> Option<UserMemory> {
        self.lock().users.get(user_id).cloned()
    }

    /// Rolling comment history, oldest first.
    pub fn history(&self, user_id: &str) -> Vec<String> {
        self.lock()
            .users
            .get(user_id)
            .map(|u| u.history.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Background facts as `k=v` pairs joined by `", "`; long values end in `…`.
    pub fn background_summary(&self, user_id: &str) -> String {
        let state = self.lock();
        let Some(user) = state.users.get(user_id) else {
            return String::new();
        };
        user.background
            .iter()
            .filter_map(|(k, v)| {
                let (k, v) = (k.trim(), v.trim());
                if k.is_empty() || v.is_empty() {
                    return None;
                }
                let mut value: String = v.chars().take(BACKGROUND_VALUE_CHARS).collect();
                if v.chars().count() > BACKGROUND_VALUE_CHARS {
                    value.push('…');
                }
                Some(format!("{}={}", k, value))
            })
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn last_greet(&self, user_id: &str) -> Option<DateTime<Utc>> {
        self.lock().users.get(user_id).and_then(|u| u.last_greet)
    }

    /// No greeting stamp within `window`.
    pub fn greeting_due(&self, user_id: &str, window: Duration) -> bool {
        match self.last_greet(user_id) {
            None => true,
            Some(at) => (Utc::now() - at).to_std().map(|age| age >= window).unwrap_or(false),
        }
    }

    /// Stamp the greeting cooldown. Kept in memory even when persistence is disabled.
    pub fn mark_greeted(&self, user_id: &str, at: DateTime<Utc>) {
        let mut state = self.lock();
        let user = state
            .users
            .entry(user_id.to_string())
            .or_insert_with(|| UserMemory::new(at));
        user.last_greet = Some(at);
        drop(state);
        if self.enabled {
            self.mark_dirty();
        }
    }

    /// Drop records not seen within the decay window and schedule a rewrite. Returns how many were dropped.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let mut state = self.lock();
        let before = state.users.len();
        let decay = self.decay;
        state.users.retain(|_, user| now - user.last_seen <= decay);
        let removed = before - state.users.len();
        let remaining = state.users.len();
        drop(state);
        if self.enabled {
            self.mark_dirty();
        }
        info!(removed, remaining, "🧹 Memory sweep");
        removed
    }

    /// Sweep on a fixed interval until the task is aborted.
    pub async fn run_sweeper(self: Arc<Self>) {
        let start = tokio::time::Instant::now() + self.sweep_interval;
        let mut ticker = tokio::time::interval_at(start, self.sweep_interval);
        loop {
            ticker.tick().await;
            self.sweep(Utc::now());
            if let Err(e) = self.flush().await {
                warn!(error = %e, path = %self.path.display(), "Memory write after sweep failed");
            }
        }
    }

    /// Write pending changes until the task is aborted.
    pub async fn run_writer(self: Arc<Self>) {
        loop {
            self.changed.notified().await;
            if let Err(e) = self.flush().await {
                warn!(error = %e, path = %self.path.display(), "Memory write failed; retrying on next change");
            }
        }
    }

    /// Whether changes are waiting to be written.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    /// Write the current state if anything changed since the last successful write.
    /// Returns whether a write happened. On failure the store stays dirty.
    pub async fn flush(&self) -> PalResult<bool> {
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return Ok(false);
        }
        let written = match self.snapshot() {
            Ok(body) => {
                let path = self.path.clone();
                let write_lock = Arc::clone(&self.write_lock);
                tokio::task::spawn_blocking(move || {
                    let _guard = write_lock.lock().unwrap_or_else(|e| e.into_inner());
                    write_atomic(&path, &body)
                })
                .await
                .map_err(|e| PalError::Io(std::io::Error::other(e)))
                .and_then(|result| result)
            }
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            self.dirty.store(true, Ordering::SeqCst);
            return Err(e);
        }
        debug!(path = %self.path.display(), "Memory written");
        Ok(true)
    }

    pub fn len(&self) -> usize {
        self.lock().users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write the full state now, whether or not anything changed.
    pub async fn persist(&self) -> PalResult<()> {
        self.dirty.store(true, Ordering::SeqCst);
        self.flush().await.map(|_| ())
    }

    fn snapshot(&self) -> PalResult<Vec<u8>> {
        let state = self.lock();
        Ok(serde_json::to_vec_pretty(&*state)?)
    }
}

fn load_file(path: &Path) -> MemoryFile {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "No memory file yet");
            return MemoryFile::empty();
        }
        Err(e) => {
            warn!(error = %e, path = %path.display(), "Memory file unreadable; starting empty");
            return MemoryFile::empty();
        }
    };
    match serde_json::from_str(&raw) {
        Ok(file) => file,
        Err(e) => {
            warn!(error = %e, path = %path.display(), "Memory file corrupt; starting empty");
            MemoryFile::empty()
        }
    }
}

fn write_atomic(path: &Path, body: &[u8]) -> PalResult<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&tmp, body)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
