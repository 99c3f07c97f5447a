//! Delayed join greetings.
//!
//! A join only counts once the viewer is still around `greet_after_seconds` later.
//! Confirmed names collect in a [`PendingJoinSet`]; the [`JoinAnnouncer`] welcomes
//! them in one batch when the room has been quiet long enough.

use crate::config::JoinRules;
use crate::delivery::OutputClock;
use crate::error::PalResult;
use crate::memory::MemoryStore;
use crate::narration;
use crate::outbox::OutboxBatcher;
use crate::viewers::ViewerTable;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use streampal_voice::{MicState, SpeechState};
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

const ANNOUNCE_TICK: Duration = Duration::from_secs(1);

/// Nicknames awaiting the batched welcome, in confirmation order.
#[derive(Debug, Default)]
pub struct PendingJoinSet {
    names: Mutex<Vec<String>>,
}

impl PendingJoinSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when the name is already pending.
    pub fn add(&self, nickname: &str) -> bool {
        let mut names = self.names.lock().unwrap_or_else(|e| e.into_inner());
        if names.iter().any(|n| n == nickname) {
            return false;
        }
        names.push(nickname.to_string());
        true
    }

    /// Remove and return up to `max` names, oldest first.
    pub fn take(&self, max: usize) -> Vec<String> {
        let mut names = self.names.lock().unwrap_or_else(|e| e.into_inner());
        let n = max.min(names.len());
        names.drain(..n).collect()
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.names.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn len(&self) -> usize {
        self.names.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Spawns one deferred presence check per joining viewer.
#[derive(Clone)]
pub struct JoinScheduler {
    rules: JoinRules,
    greeting_cooldown: Duration,
    viewers: Arc<ViewerTable>,
    memory: Arc<MemoryStore>,
    pending: Arc<PendingJoinSet>,
    scheduled: Arc<DashMap<String, ()>>,
    closed: Arc<watch::Sender<bool>>,
}

impl JoinScheduler {
    pub fn new(
        rules: JoinRules,
        greeting_cooldown: Duration,
        viewers: Arc<ViewerTable>,
        memory: Arc<MemoryStore>,
        pending: Arc<PendingJoinSet>,
    ) -> Self {
        let (closed, _rx) = watch::channel(false);
        Self {
            rules,
            greeting_cooldown,
            viewers,
            memory,
            pending,
            scheduled: Arc::new(DashMap::new()),
            closed: Arc::new(closed),
        }
    }

    /// Schedule the deferred check for `user_id`. No-op when disabled or already scheduled.
    pub fn schedule(&self, user_id: &str) -> bool {
        if !self.rules.enabled || *self.closed.borrow() {
            return false;
        }
        match self.scheduled.entry(user_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => return false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(());
            }
        }

        let scheduler = self.clone();
        let user_id = user_id.to_string();
        let delay = Duration::from_secs(self.rules.greet_after_seconds);
        let mut closed = self.closed.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    scheduler.confirm(&user_id);
                }
                _ = async { let _ = closed.wait_for(|c| *c).await; } => {}
            }
            scheduler.scheduled.remove(&user_id);
        });
        debug!(delay_secs = self.rules.greet_after_seconds, "Join check scheduled");
        true
    }

    pub fn is_scheduled(&self, user_id: &str) -> bool {
        self.scheduled.contains_key(user_id)
    }

    /// The deferred check: not yet greeted, greeting cooldown elapsed, still present.
    /// On success the viewer is marked greeted and queued for the welcome.
    pub fn confirm(&self, user_id: &str) -> bool {
        let Some(viewer) = self.viewers.get(user_id) else {
            return false;
        };
        if viewer.greeted {
            return false;
        }
        if !self.memory.greeting_due(user_id, self.greeting_cooldown) {
            return false;
        }
        let ttl = Duration::from_secs(self.rules.active_ttl_seconds);
        if !self.viewers.is_present(user_id, ttl) {
            debug!(user = %user_id, "Viewer left before greeting");
            return false;
        }
        self.viewers.mark_greeted(user_id);
        self.memory.mark_greeted(user_id, Utc::now());
        self.pending.add(&viewer.nickname);
        info!(nick = %viewer.nickname, "Greet queued (pending summary)");
        true
    }

    /// Cancel outstanding checks and refuse new ones.
    pub fn close(&self) {
        self.closed.send_replace(true);
    }
}

/// Flushes the pending set as one welcome line when the room is quiet.
pub struct JoinAnnouncer {
    rules: JoinRules,
    pending: Arc<PendingJoinSet>,
    outbox: Arc<OutboxBatcher>,
    speech: SpeechState,
    mic: MicState,
    clock: OutputClock,
    last_announce: Option<Instant>,
}

impl JoinAnnouncer {
    pub fn new(
        rules: JoinRules,
        pending: Arc<PendingJoinSet>,
        outbox: Arc<OutboxBatcher>,
        speech: SpeechState,
        mic: MicState,
        clock: OutputClock,
    ) -> Self {
        Self {
            rules,
            pending,
            outbox,
            speech,
            mic,
            clock,
            last_announce: None,
        }
    }

    /// One announcer step. Returns the welcome line when one was queued.
    pub fn tick(&mut self) -> PalResult<Option<String>> {
        if self.speech.is_speaking() || self.mic.is_active() || self.pending.is_empty() {
            return Ok(None);
        }
        if !self.clock.idle_for(Duration::from_secs(self.rules.min_idle_since_last_output_sec)) {
            return Ok(None);
        }
        let cooldown = Duration::from_secs(self.rules.greet_global_cooldown_sec);
        if let Some(last) = self.last_announce {
            if Instant::now().duration_since(last) < cooldown {
                return Ok(None);
            }
        }
        let names = self.pending.take(self.rules.max_names_per_announce.max(1));
        if names.is_empty() {
            return Ok(None);
        }
        let line = narration::newcomers(&names);
        self.outbox.add(&line)?;
        self.last_announce = Some(Instant::now());
        info!(count = names.len(), "👋 Welcome queued");
        Ok(Some(line))
    }

    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(ANNOUNCE_TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = self.tick() {
                info!(error = %e, "Join announcer stopped");
                return;
            }
        }
    }
}
