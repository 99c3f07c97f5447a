//! Microphone activity gate.
//!
//! Raw levels (RMS in `0.0..=1.0`) go through a debounced hysteresis filter:
//! the mic only turns Active after the level stays above the silence threshold
//! for `attack_ms` without interruption, and only falls back to Idle after
//! `release_ms` of uninterrupted silence. Short spikes and dropouts never flip it.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info};

/// Microphone gate configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MicConfig {
    /// When false, levels are ignored and the mic never reports Active.
    pub enabled: bool,
    /// Input device name or index. Empty selects the default device.
    pub device: String,
    /// Level at or above which a sample counts as activity (default 0.02).
    pub silence_threshold: f32,
    /// Continuous activity required before Active (default 120ms).
    pub attack_ms: u64,
    /// Continuous silence required before Idle (default 1200ms).
    pub release_ms: u64,
}

impl Default for MicConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            device: String::new(),
            silence_threshold: 0.02,
            attack_ms: 120,
            release_ms: 1200,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MicPhase {
    Idle,
    Active,
}

/// Debounced hysteresis filter turning a level stream into Idle/Active.
#[derive(Debug, Clone)]
pub struct MicHysteresis {
    threshold: f32,
    attack: Duration,
    release: Duration,
    above_since: Option<Instant>,
    below_since: Option<Instant>,
    phase: MicPhase,
}

impl MicHysteresis {
    pub fn new(config: &MicConfig) -> Self {
        Self {
            threshold: config.silence_threshold,
            attack: Duration::from_millis(config.attack_ms),
            release: Duration::from_millis(config.release_ms),
            above_since: None,
            below_since: None,
            phase: MicPhase::Idle,
        }
    }

    pub fn phase(&self) -> MicPhase {
        self.phase
    }

    /// Feed one sample taken at `now`. Returns the new phase when it flipped.
    pub fn observe(&mut self, level: f32, now: Instant) -> Option<MicPhase> {
        if level >= self.threshold {
            self.below_since = None;
            let since = *self.above_since.get_or_insert(now);
            if self.phase == MicPhase::Idle && now.duration_since(since) >= self.attack {
                self.phase = MicPhase::Active;
                return Some(MicPhase::Active);
            }
        } else {
            // a silent sample breaks the attack run
            self.above_since = None;
            let since = *self.below_since.get_or_insert(now);
            if self.phase == MicPhase::Active && now.duration_since(since) >= self.release {
                self.phase = MicPhase::Idle;
                return Some(MicPhase::Idle);
            }
        }
        None
    }
}

/// Shared, cloneable handle on the debounced mic phase.
#[derive(Debug, Clone)]
pub struct MicState {
    tx: Arc<watch::Sender<MicPhase>>,
}

impl Default for MicState {
    fn default() -> Self {
        Self::new()
    }
}

impl MicState {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(MicPhase::Idle);
        Self { tx: Arc::new(tx) }
    }

    pub fn mark_active(&self) {
        if self.transition(MicPhase::Active) {
            info!("🎙️ Mic active");
        }
    }

    pub fn mark_idle(&self) {
        if self.transition(MicPhase::Idle) {
            info!("🎙️ Mic idle");
        }
    }

    pub fn phase(&self) -> MicPhase {
        *self.tx.borrow()
    }

    pub fn is_active(&self) -> bool {
        self.phase() == MicPhase::Active
    }

    /// Suspend until the mic is idle.
    pub async fn wait_idle(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|phase| *phase == MicPhase::Idle).await;
    }

    fn transition(&self, next: MicPhase) -> bool {
        self.tx.send_if_modified(|phase| {
            if *phase == next {
                false
            } else {
                *phase = next;
                true
            }
        })
    }
}

/// Consumes mic levels and drives a [`MicState`] through the hysteresis filter.
pub struct MicMonitor {
    config: MicConfig,
    state: MicState,
}

impl MicMonitor {
    pub fn new(config: MicConfig, state: MicState) -> Self {
        Self { config, state }
    }

    /// Run until the level channel closes.
    pub async fn run(self, mut levels: mpsc::UnboundedReceiver<f32>) {
        if !self.config.enabled {
            info!("Mic gate disabled; draining levels");
            while levels.recv().await.is_some() {}
            return;
        }

        info!(
            threshold = self.config.silence_threshold,
            attack_ms = self.config.attack_ms,
            release_ms = self.config.release_ms,
            "Mic monitor started"
        );
        let mut filter = MicHysteresis::new(&self.config);
        while let Some(level) = levels.recv().await {
            match filter.observe(level, Instant::now()) {
                Some(MicPhase::Active) => self.state.mark_active(),
                Some(MicPhase::Idle) => self.state.mark_idle(),
                None => {}
            }
        }
        debug!("Mic level channel closed");
    }
}
