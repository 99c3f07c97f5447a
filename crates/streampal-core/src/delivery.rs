//! Delivery coordinator: the single consumer that hands narration to the avatar
//! sink, one message at a time, never while the avatar is speaking or the host
//! is talking.
//!
//! Per message: ensure connection (bounded retries) → wait speech idle → wait mic idle
//! → send → wait "started" → wait "ended" → post gap → stamp last output.

use crate::config::SpeechTiming;
use crate::error::{PalError, PalResult};
use crate::narration;
use std::sync::Arc;
use std::time::Duration;
use streampal_voice::{AvatarSink, MicState, SpeechState};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{error, info, warn};

const CONNECT_ATTEMPTS: usize = 6;
const CONNECT_RETRY: Duration = Duration::from_millis(500);
const UNREACHABLE_BACKOFF: Duration = Duration::from_millis(800);
const SEND_ERROR_BACKOFF: Duration = Duration::from_millis(500);
const INTER_MESSAGE_PAUSE: Duration = Duration::from_millis(20);

/// When the avatar last finished a delivery. Shared with the join announcer.
#[derive(Debug, Clone)]
pub struct OutputClock {
    tx: Arc<watch::Sender<Option<Instant>>>,
}

impl Default for OutputClock {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputClock {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    pub fn stamp(&self) {
        self.tx.send_replace(Some(Instant::now()));
    }

    pub fn last(&self) -> Option<Instant> {
        *self.tx.borrow()
    }

    /// Nothing was delivered within `quiet`. True before the first delivery.
    pub fn idle_for(&self, quiet: Duration) -> bool {
        match self.last() {
            None => true,
            Some(at) => Instant::now().duration_since(at) >= quiet,
        }
    }
}

/// Producer side of the delivery queue. Messages are trimmed and capped on entry.
#[derive(Debug, Clone)]
pub struct DeliveryQueue {
    tx: mpsc::UnboundedSender<String>,
    max_line_length: usize,
}

impl DeliveryQueue {
    pub fn channel(max_line_length: usize) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx, max_line_length }, rx)
    }

    /// Queue one message. Blank messages are dropped.
    pub fn enqueue(&self, text: &str) -> PalResult<()> {
        let line = narration::fit_line(text, self.max_line_length);
        if line.is_empty() {
            return Ok(());
        }
        info!(message = %line, "→ Avatar enqueue");
        self.tx
            .send(line)
            .map_err(|_| PalError::QueueClosed("delivery"))
    }

    fn requeue(&self, text: String) {
        if self.tx.send(text).is_err() {
            warn!("Delivery queue closed; dropping message");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Sent; the avatar spoke it or the start wait timed out.
    Delivered,
    /// Sink unreachable or send failed; the message went back to the tail of the queue.
    Requeued,
}

pub struct DeliveryCoordinator {
    sink: Arc<dyn AvatarSink>,
    speech: SpeechState,
    mic: MicState,
    clock: OutputClock,
    timing: SpeechTiming,
    queue: DeliveryQueue,
    rx: mpsc::UnboundedReceiver<String>,
}

impl DeliveryCoordinator {
    pub fn new(
        sink: Arc<dyn AvatarSink>,
        speech: SpeechState,
        mic: MicState,
        clock: OutputClock,
        timing: SpeechTiming,
        queue: DeliveryQueue,
        rx: mpsc::UnboundedReceiver<String>,
    ) -> Self {
        Self {
            sink,
            speech,
            mic,
            clock,
            timing,
            queue,
            rx,
        }
    }

    /// Consume the queue until the task is aborted. The coordinator keeps its own
    /// sender for requeues, so the queue never closes while it runs.
    pub async fn run(mut self) {
        info!("📣 Delivery coordinator started");
        while let Some(text) = self.rx.recv().await {
            self.deliver(text).await;
            tokio::time::sleep(INTER_MESSAGE_PAUSE).await;
        }
        info!("Delivery coordinator stopped");
    }

    async fn connect(&self) -> bool {
        for attempt in 1..=CONNECT_ATTEMPTS {
            match self.sink.ensure_connected().await {
                Ok(()) => return true,
                Err(e) => {
                    warn!(attempt, error = %e, "Avatar connection failed");
                    if attempt < CONNECT_ATTEMPTS {
                        tokio::time::sleep(CONNECT_RETRY).await;
                    }
                }
            }
        }
        false
    }

    /// Deliver one message; on failure it goes back to the queue.
    pub async fn deliver(&self, text: String) -> DeliveryOutcome {
        if !self.connect().await {
            warn!("Avatar unreachable; message rescheduled");
            tokio::time::sleep(UNREACHABLE_BACKOFF).await;
            self.queue.requeue(text);
            return DeliveryOutcome::Requeued;
        }

        self.speech.wait_idle().await;
        self.mic.wait_idle().await;

        if let Err(e) = self.sink.send(&text).await {
            error!(error = %e, "Avatar send failed; message rescheduled");
            tokio::time::sleep(SEND_ERROR_BACKOFF).await;
            self.queue.requeue(text);
            return DeliveryOutcome::Requeued;
        }
        info!(message = %text, "→ Avatar SEND");

        let start_timeout = Duration::from_millis(self.timing.wait_start_timeout_ms);
        if self.speech.wait_started(Some(start_timeout)).await {
            let max_speech = Duration::from_millis(self.timing.max_speech_ms);
            if !self.speech.wait_ended(Some(max_speech)).await {
                warn!("Avatar still speaking after {}ms; moving on", self.timing.max_speech_ms);
            }
        }
        tokio::time::sleep(Duration::from_millis(self.timing.post_gap_ms)).await;
        self.clock.stamp();
        DeliveryOutcome::Delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use streampal_voice::{VoiceError, VoiceResult};

    /// Fails the first `failing_connects` connection attempts, then records sends.
    struct FlakySink {
        failing_connects: AtomicUsize,
        sent: Mutex<Vec<String>>,
        fail_send: bool,
    }

    impl FlakySink {
        fn new(failing_connects: usize, fail_send: bool) -> Arc<Self> {
            Arc::new(Self {
                failing_connects: AtomicUsize::new(failing_connects),
                sent: Mutex::new(Vec::new()),
                fail_send,
            })
        }

        fn sent(&self) -> Vec<String> {
            self.sent.lock().expect("lock").clone()
        }
    }

    #[async_trait]
    impl AvatarSink for FlakySink {
        async fn ensure_connected(&self) -> VoiceResult<()> {
            let left = self.failing_connects.load(Ordering::SeqCst);
            if left > 0 {
                self.failing_connects.store(left - 1, Ordering::SeqCst);
                return Err(VoiceError::SinkConnect("refused".into()));
            }
            Ok(())
        }

        async fn send(&self, text: &str) -> VoiceResult<()> {
            if self.fail_send {
                return Err(VoiceError::SinkSend("broken pipe".into()));
            }
            self.sent.lock().expect("lock").push(text.to_string());
            Ok(())
        }
    }

    fn coordinator(sink: Arc<FlakySink>) -> (DeliveryCoordinator, DeliveryQueue, OutputClock) {
        let (queue, rx) = DeliveryQueue::channel(140);
        let clock = OutputClock::new();
        let coordinator = DeliveryCoordinator::new(
            sink,
            SpeechState::new(),
            MicState::new(),
            clock.clone(),
            SpeechTiming::default(),
            queue.clone(),
            rx,
        );
        (coordinator, queue, clock)
    }

    #[tokio::test(start_paused = true)]
    async fn delivers_after_start_timeout_and_stamps_clock() {
        let sink = FlakySink::new(0, false);
        let (coordinator, _queue, clock) = coordinator(sink.clone());
        assert!(clock.last().is_none());

        let start = Instant::now();
        let outcome = coordinator.deliver("hallo".into()).await;
        assert_eq!(outcome, DeliveryOutcome::Delivered);
        assert_eq!(sink.sent(), vec!["hallo".to_string()]);
        // no "started" signal: 1200 ms start wait + 250 ms post gap
        let elapsed = Instant::now().duration_since(start);
        assert!(elapsed >= Duration::from_millis(1450) && elapsed < Duration::from_millis(1500));
        assert!(clock.last().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn retries_connection_then_succeeds() {
        let sink = FlakySink::new(3, false);
        let (coordinator, _queue, _clock) = coordinator(sink.clone());
        assert_eq!(coordinator.deliver("x".into()).await, DeliveryOutcome::Delivered);
        assert_eq!(sink.sent().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_sink_requeues() {
        let sink = FlakySink::new(6, false);
        let (mut coordinator, _queue, _clock) = coordinator(sink.clone());
        let start = Instant::now();
        assert_eq!(coordinator.deliver("later".into()).await, DeliveryOutcome::Requeued);
        // 5 gaps of 500 ms between 6 attempts, then 800 ms backoff
        let elapsed = Instant::now().duration_since(start);
        assert!(elapsed >= Duration::from_millis(3300) && elapsed < Duration::from_millis(3400));
        assert_eq!(coordinator.rx.try_recv().ok().as_deref(), Some("later"));
        assert!(sink.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn send_error_requeues() {
        let sink = FlakySink::new(0, true);
        let (mut coordinator, _queue, clock) = coordinator(sink);
        assert_eq!(coordinator.deliver("oops".into()).await, DeliveryOutcome::Requeued);
        assert_eq!(coordinator.rx.try_recv().ok().as_deref(), Some("oops"));
        assert!(clock.last().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_speech_to_end_before_sending() {
        let sink = FlakySink::new(0, false);
        let (queue, rx) = DeliveryQueue::channel(140);
        let speech = SpeechState::new();
        speech.mark_started();
        let coordinator = DeliveryCoordinator::new(
            sink.clone(),
            speech.clone(),
            MicState::new(),
            OutputClock::new(),
            SpeechTiming::default(),
            queue,
            rx,
        );

        let handle = tokio::spawn(async move { coordinator.deliver("next".into()).await });
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(sink.sent().is_empty());

        speech.mark_ended();
        assert_eq!(handle.await.expect("join"), DeliveryOutcome::Delivered);
        assert_eq!(sink.sent(), vec!["next".to_string()]);
    }

    #[test]
    fn enqueue_caps_line_length() {
        let (queue, mut rx) = DeliveryQueue::channel(10);
        queue.enqueue("   ").expect("blank is fine");
        queue.enqueue("eine sehr lange zeile").expect("enqueue");
        assert_eq!(rx.try_recv().ok().as_deref(), Some("eine sehr…"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn output_clock_idle_window() {
        let clock = OutputClock::new();
        assert!(clock.idle_for(Duration::from_secs(25)));
        clock.stamp();
        assert!(!clock.idle_for(Duration::from_secs(25)));
        tokio::time::advance(Duration::from_secs(25)).await;
        assert!(clock.idle_for(Duration::from_secs(25)));
    }
}
