//! Ingest: validation, comment pre-filter, dedup and routing of raw events.

use crate::comments::CommentItem;
use crate::dedup::DedupStore;
use crate::dispatcher::EventRouter;
use crate::error::{PalError, PalResult};
use crate::events::{EventCategory, EventKind, LiveEvent};
use crate::memory::{MemoryDelta, MemoryStore};
use crate::relevance::RelevanceScorer;
use crate::viewers::ViewerTable;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Failed validation (no user id).
    Discarded,
    /// Comment too short or spam.
    Filtered,
    Duplicate,
    Routed(EventCategory),
    /// Disconnect notices are only logged.
    Logged,
}

/// Entry point for the live-event source.
pub struct Ingest {
    dedup: Arc<DedupStore>,
    viewers: Arc<ViewerTable>,
    memory: Arc<MemoryStore>,
    scorer: RelevanceScorer,
    min_length: usize,
    comments: mpsc::UnboundedSender<CommentItem>,
    router: EventRouter,
}

impl Ingest {
    pub fn new(
        dedup: Arc<DedupStore>,
        viewers: Arc<ViewerTable>,
        memory: Arc<MemoryStore>,
        scorer: RelevanceScorer,
        min_length: usize,
        comments: mpsc::UnboundedSender<CommentItem>,
        router: EventRouter,
    ) -> Self {
        Self {
            dedup,
            viewers,
            memory,
            scorer,
            min_length,
            comments,
            router,
        }
    }

    /// Accept one event from the source. Only a closed downstream queue is an error.
    pub fn accept(&self, event: LiveEvent) -> PalResult<IngestOutcome> {
        let event = match event.validate() {
            Ok(event) => event,
            Err(e) => {
                debug!(error = %e, "Event discarded");
                return Ok(IngestOutcome::Discarded);
            }
        };

        if let EventKind::Comment { text } = &event.kind {
            return self.accept_comment(&event, text);
        }
        if event.kind == EventKind::Disconnect {
            warn!(user = %event.user_id, "Event source reported disconnect");
            return Ok(IngestOutcome::Logged);
        }

        if let Some(fingerprint) = event.fingerprint() {
            if self.dedup.seen(&fingerprint) {
                debug!(category = %event.category(), user = %event.user_id, "Duplicate event");
                return Ok(IngestOutcome::Duplicate);
            }
        }
        let category = event.category();
        if category == EventCategory::Join {
            self.viewers.touch(&event.user_id, &event.nickname);
        }
        self.router.route(event)?;
        Ok(IngestOutcome::Routed(category))
    }

    fn accept_comment(&self, event: &LiveEvent, text: &str) -> PalResult<IngestOutcome> {
        let text = text.trim();
        let low = text.to_lowercase();
        if low.chars().count() < self.min_length || self.scorer.is_ignored(&low) {
            return Ok(IngestOutcome::Filtered);
        }
        if let Some(fingerprint) = event.fingerprint() {
            if self.dedup.seen(&fingerprint) {
                debug!(user = %event.user_id, "Duplicate comment");
                return Ok(IngestOutcome::Duplicate);
            }
        }
        self.viewers.touch(&event.user_id, &event.nickname);
        self.memory
            .remember(&event.user_id, &event.nickname, MemoryDelta::comment(text));
        info!(nick = %event.nickname, text, "Comment");
        self.comments
            .send(CommentItem {
                user_id: event.user_id.clone(),
                nickname: event.nickname.clone(),
                text: low,
            })
            .map_err(|_| PalError::QueueClosed("comments"))?;
        Ok(IngestOutcome::Routed(EventCategory::Comment))
    }
}

/// Newline-delimited JSON event source. Blank and malformed lines are skipped.
pub struct EventFeed<R> {
    reader: R,
    buf: Vec<u8>,
    line_no: u64,
}

impl<R: AsyncBufRead + Unpin> EventFeed<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Vec::new(),
            line_no: 0,
        }
    }

    /// Next well-formed event; `None` at end of input. Lines that are not UTF-8 or
    /// not valid events are skipped; only a read failure is an error.
    pub async fn next_event(&mut self) -> PalResult<Option<LiveEvent>> {
        loop {
            self.buf.clear();
            if self.reader.read_until(b'\n', &mut self.buf).await? == 0 {
                return Ok(None);
            }
            self.line_no += 1;
            let line = match std::str::from_utf8(&self.buf) {
                Ok(line) => line.trim(),
                Err(e) => {
                    warn!(line = self.line_no, error = %e, "Skipping event line that is not valid UTF-8");
                    continue;
                }
            };
            if line.is_empty() {
                continue;
            }
            match LiveEvent::from_json(line) {
                Ok(event) => return Ok(Some(event)),
                Err(e) => warn!(line = self.line_no, error = %e, "Skipping malformed event"),
            }
        }
    }

    /// Feed every event into `ingest` until end of input. Returns how many were routed.
    pub async fn pump(mut self, ingest: &Ingest) -> PalResult<u64> {
        let mut routed = 0;
        while let Some(event) = self.next_event().await? {
            if let IngestOutcome::Routed(_) = ingest.accept(event)? {
                routed += 1;
            }
        }
        info!(lines = self.line_no, routed, "Event feed finished");
        Ok(routed)
    }
}
