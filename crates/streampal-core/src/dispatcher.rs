//! Event batch dispatcher: non-comment events → memory updates and narration fragments.
//!
//! Each category has its own FIFO queue; the dispatcher polls them round-robin so a
//! flood of likes cannot starve gifts or follows. Ordering across categories is not kept.

use crate::config::PalConfig;
use crate::error::{PalError, PalResult};
use crate::events::{EventCategory, EventKind, LiveEvent};
use crate::joins::JoinScheduler;
use crate::memory::{MemoryDelta, MemoryStore};
use crate::narration;
use crate::outbox::OutboxBatcher;
use crate::viewers::ViewerTable;
use futures::future::select_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const POLL_WAIT: Duration = Duration::from_millis(200);

/// Dispatcher queues, in polling order.
const CATEGORIES: [EventCategory; 6] = [
    EventCategory::Gift,
    EventCategory::Join,
    EventCategory::Follow,
    EventCategory::Share,
    EventCategory::Subscribe,
    EventCategory::Like,
];

/// Producer side of the per-category queues.
#[derive(Debug, Clone)]
pub struct EventRouter {
    queues: Vec<(EventCategory, mpsc::UnboundedSender<LiveEvent>)>,
}

impl EventRouter {
    /// Push an event onto its category queue.
    pub fn route(&self, event: LiveEvent) -> PalResult<()> {
        let category = event.category();
        let Some((_, tx)) = self.queues.iter().find(|(c, _)| *c == category) else {
            return Err(PalError::InvalidEvent(format!("no dispatcher queue for {}", category)));
        };
        tx.send(event).map_err(|_| PalError::QueueClosed("dispatcher"))
    }
}

struct CategoryQueue {
    category: EventCategory,
    rx: mpsc::UnboundedReceiver<LiveEvent>,
    open: bool,
}

pub struct EventDispatcher {
    queues: Vec<CategoryQueue>,
    cursor: usize,
    like_threshold: u32,
    follow_cooldown: Duration,
    last_follow: Option<Instant>,
    viewers: Arc<ViewerTable>,
    memory: Arc<MemoryStore>,
    outbox: Arc<OutboxBatcher>,
    joins: JoinScheduler,
}

impl EventDispatcher {
    pub fn new(
        config: &PalConfig,
        viewers: Arc<ViewerTable>,
        memory: Arc<MemoryStore>,
        outbox: Arc<OutboxBatcher>,
        joins: JoinScheduler,
    ) -> (Self, EventRouter) {
        let mut senders = Vec::with_capacity(CATEGORIES.len());
        let mut queues = Vec::with_capacity(CATEGORIES.len());
        for category in CATEGORIES {
            let (tx, rx) = mpsc::unbounded_channel();
            senders.push((category, tx));
            queues.push(CategoryQueue {
                category,
                rx,
                open: true,
            });
        }
        let dispatcher = Self {
            queues,
            cursor: 0,
            like_threshold: config.events.like_threshold,
            follow_cooldown: Duration::from_secs(config.comment.global_cooldown),
            last_follow: None,
            viewers,
            memory,
            outbox,
            joins,
        };
        (dispatcher, EventRouter { queues: senders })
    }

    /// Take at most one ready event from each queue, starting after the queue served first last time.
    fn drain_round(&mut self) -> Vec<LiveEvent> {
        let n = self.queues.len();
        let mut batch = Vec::new();
        for offset in 0..n {
            let queue = &mut self.queues[(self.cursor + offset) % n];
            if !queue.open {
                continue;
            }
            match queue.rx.try_recv() {
                Ok(event) => batch.push(event),
                Err(mpsc::error::TryRecvError::Empty) => {}
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    debug!(category = %queue.category, "Dispatcher queue closed");
                    queue.open = false;
                }
            }
        }
        self.cursor = (self.cursor + 1) % n;
        batch
    }

    /// Next batch of events, waiting up to 200 ms per poll. `None` once every queue is closed.
    pub async fn next_batch(&mut self) -> Option<Vec<LiveEvent>> {
        loop {
            let batch = self.drain_round();
            if !batch.is_empty() {
                return Some(batch);
            }
            let waiting: Vec<_> = self
                .queues
                .iter_mut()
                .filter(|q| q.open)
                .map(|q| Box::pin(q.rx.recv()))
                .collect();
            if waiting.is_empty() {
                return None;
            }
            match tokio::time::timeout(POLL_WAIT, select_all(waiting)).await {
                Ok((Some(event), _, _)) => return Some(vec![event]),
                // a closed queue; the next round marks it
                Ok((None, _, _)) => continue,
                Err(_) => continue,
            }
        }
    }

    pub async fn run(mut self) {
        info!("🎁 Event dispatcher started");
        while let Some(batch) = self.next_batch().await {
            for event in batch {
                if let Err(e) = self.handle(event) {
                    warn!(error = %e, "Event dispatch failed");
                }
            }
        }
        info!("Event dispatcher stopped");
    }

    /// Apply one event. Returns the narration fragment, if any.
    pub fn handle(&mut self, event: LiveEvent) -> PalResult<Option<String>> {
        let uid = event.user_id.as_str();
        let viewer = self.viewers.touch(uid, &event.nickname);
        let nick = viewer.nickname.as_str();

        let fragment = match &event.kind {
            EventKind::Gift {
                gift_name,
                repeat_count,
            } => {
                let count = (*repeat_count).max(1);
                self.memory.remember(uid, nick, MemoryDelta::gifts(u64::from(count)));
                Some(narration::gift(nick, gift_name, count))
            }
            EventKind::Join => {
                self.memory.remember(uid, nick, MemoryDelta::join());
                self.joins.schedule(uid);
                None
            }
            EventKind::Follow => {
                self.memory.remember(uid, nick, MemoryDelta::follow());
                let now = Instant::now();
                let cooling = self
                    .last_follow
                    .map(|last| now.duration_since(last) < self.follow_cooldown)
                    .unwrap_or(false);
                if cooling {
                    debug!(nick, "Follow inside cooldown; not narrated");
                    None
                } else {
                    self.last_follow = Some(now);
                    Some(narration::followed(nick))
                }
            }
            EventKind::Share => {
                self.memory.remember(uid, nick, MemoryDelta::share());
                Some(narration::shared(nick))
            }
            EventKind::Subscribe => {
                self.memory.remember(uid, nick, MemoryDelta::subscribe());
                Some(narration::subscribed(nick))
            }
            EventKind::Like { count } => {
                if *count >= self.like_threshold {
                    self.memory.remember(uid, nick, MemoryDelta::likes(u64::from(*count)));
                    Some(narration::liked(nick, *count))
                } else {
                    None
                }
            }
            EventKind::Comment { .. } | EventKind::Disconnect => {
                debug!(category = %event.category(), "Not a dispatcher event");
                None
            }
        };

        if let Some(fragment) = &fragment {
            self.outbox.add(fragment)?;
        }
        Ok(fragment)
    }
}
