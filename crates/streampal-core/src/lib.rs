//! streampal-core: live-audience narrator core.
//!
//! Turns a stream of audience events into a throttled, deduplicated narration
//! stream for an avatar, gated by the avatar's speech state and the host's mic.
//!
//! ```text
//! events → Ingest (validate, dedup) ─┬→ CommentPipeline ──┐
//!                                    ├→ EventDispatcher ──┼→ OutboxBatcher → DeliveryCoordinator → AvatarSink
//!                                    └→ JoinScheduler → JoinAnnouncer ┘            ↑ SpeechState / MicState
//! ```

mod bucket;
mod comments;
mod config;
mod dedup;
mod delivery;
mod dispatcher;
mod error;
mod events;
mod generation;
mod ingest;
mod joins;
mod memory;
pub mod narration;
mod outbox;
mod relevance;
mod runtime;
mod viewers;

pub use bucket::TokenBucket;
pub use comments::{effective_reply_threshold, CommentItem, CommentOutcome, CommentPipeline};
pub use config::{
    AvatarConfig, CommentConfig, DedupeConfig, EventConfig, GenerationConfig, JoinRules, MemoryConfig,
    OutboxConfig, PalConfig, SpeechTiming, StyleConfig,
};
pub use dedup::DedupStore;
pub use delivery::{DeliveryCoordinator, DeliveryOutcome, DeliveryQueue, OutputClock};
pub use dispatcher::{EventDispatcher, EventRouter};
pub use error::{PalError, PalResult};
pub use events::{EventCategory, EventKind, Fingerprint, LiveEvent};
pub use generation::{
    generator_from_config, shorten_reply, GenerationError, GenerationRequest, OpenAiCompatGenerator, TextGenerator,
    UnavailableGenerator,
};
pub use ingest::{EventFeed, Ingest, IngestOutcome};
pub use joins::{JoinAnnouncer, JoinScheduler, PendingJoinSet};
pub use memory::{MemoryDelta, MemoryStore, UserMemory};
pub use outbox::OutboxBatcher;
pub use relevance::RelevanceScorer;
pub use runtime::Streampal;
pub use viewers::{Viewer, ViewerTable};

// Gating state lives in the voice crate; re-exported so callers need one import path.
pub use streampal_voice::{AvatarSink, MicConfig, MicMonitor, MicPhase, MicState, SpeechPhase, SpeechState};
