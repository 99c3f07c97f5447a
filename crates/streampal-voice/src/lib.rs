//! # streampal-voice - Speech and Microphone Gating
//!
//! This crate owns the two state machines that decide when the narrator may talk,
//! and the avatar sink that actually talks.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Output Gating                           │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐      │
//! │  │  Mic Levels  │→ │  Hysteresis  │→ │   MicState   │      │
//! │  │ (cpal / mpsc)│  │ attack/rel.  │  │ Idle/Active  │      │
//! │  └──────────────┘  └──────────────┘  └──────────────┘      │
//! │                                                              │
//! │  ┌──────────────┐   started/ended    ┌──────────────┐      │
//! │  │ Avatar Sink  │───────────────────→│ SpeechState  │      │
//! │  │ (websocket)  │                    │ Idle/Speaking│      │
//! │  └──────────────┘                    └──────────────┘      │
//! └─────────────────────────────────────────────────────────────┘
//! ```

#[cfg(feature = "capture")]
pub mod audio;
pub mod avatar;
pub mod error;
pub mod mic;
pub mod speech;

#[cfg(feature = "capture")]
pub use audio::LevelCapture;
pub use avatar::{parse_signal, AvatarSink, SpeechSignal, WsAvatarSink};
pub use error::{VoiceError, VoiceResult};
pub use mic::{MicConfig, MicHysteresis, MicMonitor, MicPhase, MicState};
pub use speech::{SpeechPhase, SpeechState};
