//! Outbox batcher: coalesces narration fragments into windowed, size-bounded messages.

use crate::config::OutboxConfig;
use crate::delivery::DeliveryQueue;
use crate::error::PalResult;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use streampal_voice::{MicState, SpeechState};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

const TICK: Duration = Duration::from_millis(250);

#[derive(Debug, Default)]
struct OutboxBuffer {
    items: Vec<String>,
    first_at: Option<Instant>,
}

impl OutboxBuffer {
    fn joined_chars(&self, separator: &str) -> usize {
        let text: usize = self.items.iter().map(|s| s.chars().count()).sum();
        text + separator.chars().count() * self.items.len().saturating_sub(1)
    }

    fn take(&mut self, separator: &str) -> Option<String> {
        if self.items.is_empty() {
            return None;
        }
        let message = self.items.join(separator);
        self.items.clear();
        self.first_at = None;
        Some(message)
    }
}

/// Buffers fragments and hands joined messages to the delivery queue.
///
/// Size-triggered flushes happen immediately in [`add`](Self::add); time-triggered
/// flushes happen in [`tick`](Self::tick) and only while neither the avatar nor the host is talking.
#[derive(Debug)]
pub struct OutboxBatcher {
    config: OutboxConfig,
    buffer: Mutex<OutboxBuffer>,
    delivery: DeliveryQueue,
    speech: SpeechState,
    mic: MicState,
}

impl OutboxBatcher {
    pub fn new(config: OutboxConfig, delivery: DeliveryQueue, speech: SpeechState, mic: MicState) -> Self {
        Self {
            config,
            buffer: Mutex::new(OutboxBuffer::default()),
            delivery,
            speech,
            mic,
        }
    }

    /// Append one fragment. Flushes at once when the joined text exceeds `max_chars`
    /// or the buffer holds `max_items` fragments.
    pub fn add(&self, fragment: &str) -> PalResult<()> {
        let fragment = fragment.trim();
        if fragment.is_empty() {
            return Ok(());
        }
        let mut buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
        buffer.items.push(fragment.to_string());
        buffer.first_at.get_or_insert_with(Instant::now);

        let over_chars = buffer.joined_chars(&self.config.separator) > self.config.max_chars;
        let full = buffer.items.len() >= self.config.max_items;
        if over_chars || full {
            return self.flush(&mut buffer);
        }
        debug!(fragment, "Batch add");
        Ok(())
    }

    /// One ticker step: flush when the oldest fragment has waited a full window.
    /// Returns whether a message was flushed.
    pub fn tick(&self) -> PalResult<bool> {
        if self.mic.is_active() || self.speech.is_speaking() {
            return Ok(false);
        }
        let mut buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
        let window = Duration::from_secs(self.config.window_seconds);
        let due = buffer
            .first_at
            .map(|first| Instant::now().duration_since(first) >= window)
            .unwrap_or(false);
        if !due {
            return Ok(false);
        }
        self.flush(&mut buffer)?;
        Ok(true)
    }

    fn flush(&self, buffer: &mut OutboxBuffer) -> PalResult<()> {
        if let Some(message) = buffer.take(&self.config.separator) {
            info!(message = %message, "Batch flush");
            self.delivery.enqueue(&message)?;
        }
        Ok(())
    }

    /// Fragments waiting for the next flush.
    pub fn pending(&self) -> Vec<String> {
        self.buffer.lock().unwrap_or_else(|e| e.into_inner()).items.clone()
    }

    /// Tick every 250 ms until the task is aborted. Stops early only if a flush
    /// cannot be handed to the delivery queue.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = self.tick() {
                info!(error = %e, "Outbox ticker stopped");
                return;
            }
        }
    }
}
