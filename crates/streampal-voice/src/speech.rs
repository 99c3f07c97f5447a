//! Avatar speech state: the only synchronization point between the delivery
//! coordinator and the avatar sink's asynchronous "started"/"ended" signals.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

/// Logical speech phase of the avatar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeechPhase {
    /// Nothing is being spoken (initial state).
    Idle,
    /// The avatar reported "speech started" and has not yet reported "speech ended".
    Speaking,
}

/// Shared, cloneable handle on the avatar's speech phase.
#[derive(Debug, Clone)]
pub struct SpeechState {
    tx: Arc<watch::Sender<SpeechPhase>>,
}

impl Default for SpeechState {
    fn default() -> Self {
        Self::new()
    }
}

impl SpeechState {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(SpeechPhase::Idle);
        Self { tx: Arc::new(tx) }
    }

    /// Idle -> Speaking.
    pub fn mark_started(&self) {
        if self.transition(SpeechPhase::Speaking) {
            info!("🗣️ Avatar reports speech started");
        }
    }

    /// Speaking -> Idle.
    pub fn mark_ended(&self) {
        if self.transition(SpeechPhase::Idle) {
            info!("🤫 Avatar reports speech ended");
        }
    }

    pub fn phase(&self) -> SpeechPhase {
        *self.tx.borrow()
    }

    pub fn is_speaking(&self) -> bool {
        self.phase() == SpeechPhase::Speaking
    }

    /// Suspend until the avatar is idle. Returns immediately if it already is.
    pub async fn wait_idle(&self) {
        self.wait_for(SpeechPhase::Idle, None).await;
    }

    /// Wait for "speech started". `None` waits indefinitely.
    /// Returns whether the avatar was speaking before the deadline.
    pub async fn wait_started(&self, timeout: Option<Duration>) -> bool {
        self.wait_for(SpeechPhase::Speaking, timeout).await
    }

    /// Wait for "speech ended". `None` waits indefinitely.
    pub async fn wait_ended(&self, timeout: Option<Duration>) -> bool {
        self.wait_for(SpeechPhase::Idle, timeout).await
    }

    fn transition(&self, next: SpeechPhase) -> bool {
        self.tx.send_if_modified(|phase| {
            if *phase == next {
                false
            } else {
                *phase = next;
                true
            }
        })
    }

    async fn wait_for(&self, target: SpeechPhase, timeout: Option<Duration>) -> bool {
        let mut rx = self.tx.subscribe();
        let reached = async move { rx.wait_for(|phase| *phase == target).await.is_ok() };
        match timeout {
            None => reached.await,
            Some(limit) => tokio::time::timeout(limit, reached).await.unwrap_or(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready, task};

    #[test]
    fn starts_idle() {
        let speech = SpeechState::new();
        assert_eq!(speech.phase(), SpeechPhase::Idle);
        assert!(!speech.is_speaking());
    }

    #[test]
    fn started_then_ended() {
        let speech = SpeechState::new();
        speech.mark_started();
        assert!(speech.is_speaking());
        speech.mark_ended();
        assert_eq!(speech.phase(), SpeechPhase::Idle);
    }

    #[test]
    fn wait_idle_suspends_while_speaking() {
        let speech = SpeechState::new();
        speech.mark_started();

        let mut wait = task::spawn(speech.wait_idle());
        assert_pending!(wait.poll());

        speech.mark_ended();
        assert!(wait.is_woken());
        assert_ready!(wait.poll());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_started_times_out() {
        let speech = SpeechState::new();
        assert!(!speech.wait_started(Some(Duration::from_millis(1200))).await);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_ended_sees_signal_from_other_task() {
        let speech = SpeechState::new();
        speech.mark_started();

        let signaller = speech.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            signaller.mark_ended();
        });

        assert!(speech.wait_ended(Some(Duration::from_secs(15))).await);
        assert!(!speech.is_speaking());
    }
}
