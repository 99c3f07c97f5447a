//! Narrator configuration.
//!
//! Precedence: environment (`STREAMPAL__SECTION__KEY`) > TOML file (`STREAMPAL_CONFIG`,
//! default `config/streampal.toml`, optional) > built-in defaults below.

use crate::error::PalResult;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use streampal_voice::MicConfig;

const DEFAULT_CONFIG_PATH: &str = "config/streampal.toml";

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// Full narrator configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PalConfig {
    pub avatar: AvatarConfig,
    pub generation: GenerationConfig,
    pub style: StyleConfig,
    pub comment: CommentConfig,
    pub events: EventConfig,
    pub memory: MemoryConfig,
    pub dedupe: DedupeConfig,
    pub microphone: MicConfig,
    pub join_rules: JoinRules,
    pub outbox: OutboxConfig,
    pub speech: SpeechTiming,
}

impl PalConfig {
    /// Load from `STREAMPAL_CONFIG` (or `config/streampal.toml`) plus environment.
    pub fn load() -> PalResult<Self> {
        let path = std::env::var("STREAMPAL_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from_path(Path::new(&path))
    }

    /// Load from an explicit file (skipped when missing) plus environment.
    pub fn load_from_path(path: &Path) -> PalResult<Self> {
        let builder = config::Config::builder().add_source(config::Config::try_from(&PalConfig::default())?);
        let builder = if path.exists() {
            builder.add_source(config::File::from(path))
        } else {
            builder
        };
        let built = builder
            .add_source(
                config::Environment::with_prefix("STREAMPAL")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(built.try_deserialize()?)
    }
}

/// Avatar controller endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AvatarConfig {
    pub host: String,
    pub port: u16,
    /// Upper bound for one websocket handshake.
    pub handshake_timeout_ms: u64,
}

impl Default for AvatarConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 9000,
            handshake_timeout_ms: 5000,
        }
    }
}

/// Text-generation collaborator (OpenAI-compatible chat completions).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Base URL without trailing slash.
    pub api_base: String,
    /// Falls back to `STREAMPAL_LLM_API_KEY`, then `OPENAI_API_KEY`.
    pub api_key: Option<String>,
    pub model: String,
    pub timeout_ms: u64,
    /// Replies longer than this are cut and closed with a period.
    pub max_reply_words: usize,
    pub system_prompt: String,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            timeout_ms: 10_000,
            max_reply_words: 18,
            system_prompt: "Neutraler Assistent: präzise, kurze Antworten (max 25 Wörter) basierend auf Chat-Kontext und Memory."
                .to_string(),
        }
    }
}

impl GenerationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Configured key, else `STREAMPAL_LLM_API_KEY`, else `OPENAI_API_KEY`. Blank counts as unset.
    pub fn resolved_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| std::env::var("STREAMPAL_LLM_API_KEY").ok())
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StyleConfig {
    /// Outgoing messages are cut to this many characters (with a trailing `…`).
    pub max_line_length: usize,
}

impl Default for StyleConfig {
    fn default() -> Self {
        Self { max_line_length: 140 }
    }
}

/// Comment handling: filters, vocabularies, cooldowns and reply threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommentConfig {
    pub enabled: bool,
    /// Seconds between any two replies; also spaces narrated follows.
    pub global_cooldown: u64,
    /// Seconds before the same viewer gets another reply.
    pub per_user_cooldown: u64,
    pub min_length: usize,
    pub max_replies_per_min: u32,
    pub reply_threshold: f64,
    pub respond_to_greetings: bool,
    /// Seconds before the same viewer is greeted again.
    pub greeting_cooldown: u64,
    pub respond_to_thanks: bool,
    pub ignore_if_startswith: Vec<String>,
    pub ignore_contains: Vec<String>,
    pub keywords_bonus: Vec<String>,
    pub greetings: Vec<String>,
    pub thanks: Vec<String>,
}

impl Default for CommentConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            global_cooldown: 6,
            per_user_cooldown: 15,
            min_length: 3,
            max_replies_per_min: 20,
            reply_threshold: 0.6,
            respond_to_greetings: true,
            greeting_cooldown: 360,
            respond_to_thanks: true,
            ignore_if_startswith: strings(&["!"]),
            ignore_contains: strings(&["http://", "https://", "discord.gg"]),
            keywords_bonus: strings(&[
                "warum", "wieso", "wie", "wann", "wo", "wer", "was", "welche", "welcher", "welches", "why", "how",
                "when", "where", "who", "what", "which", "how much", "how many",
            ]),
            greetings: strings(&[
                "hallo",
                "hi",
                "hey",
                "servus",
                "moin",
                "gruss",
                "grüß",
                "grüss",
                "guten morgen",
                "guten abend",
                "hello",
            ]),
            thanks: strings(&["danke", "thx", "thanks", "ty", "merci"]),
        }
    }
}

/// Non-comment event narration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventConfig {
    /// Like bursts below this count are not narrated or remembered.
    pub like_threshold: u32,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self { like_threshold: 20 }
    }
}

/// Durable per-viewer memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub enabled: bool,
    pub file: String,
    pub per_user_history: usize,
    pub decay_days: u32,
    pub sweep_interval_secs: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            file: "memory.json".to_string(),
            per_user_history: 100,
            decay_days: 90,
            sweep_interval_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupeConfig {
    pub ttl_secs: u64,
    pub capacity: usize,
}

impl Default for DedupeConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 600,
            capacity: 5000,
        }
    }
}

/// Delayed join greetings and the batched welcome announcement.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JoinRules {
    pub enabled: bool,
    pub greet_after_seconds: u64,
    pub active_ttl_seconds: u64,
    pub min_idle_since_last_output_sec: u64,
    pub greet_global_cooldown_sec: u64,
    pub max_names_per_announce: usize,
}

impl Default for JoinRules {
    fn default() -> Self {
        Self {
            enabled: true,
            greet_after_seconds: 30,
            active_ttl_seconds: 45,
            min_idle_since_last_output_sec: 25,
            greet_global_cooldown_sec: 180,
            max_names_per_announce: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    pub window_seconds: u64,
    pub max_items: usize,
    pub max_chars: usize,
    pub separator: String,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            window_seconds: 8,
            max_items: 8,
            max_chars: 320,
            separator: " • ".to_string(),
        }
    }
}

/// Timing of one delivery round-trip with the avatar.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeechTiming {
    pub wait_start_timeout_ms: u64,
    pub max_speech_ms: u64,
    pub post_gap_ms: u64,
}

impl Default for SpeechTiming {
    fn default() -> Self {
        Self {
            wait_start_timeout_ms: 1200,
            max_speech_ms: 15_000,
            post_gap_ms: 250,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_shipped_settings() {
        let cfg = PalConfig::default();
        assert_eq!(cfg.comment.reply_threshold, 0.6);
        assert_eq!(cfg.outbox.separator, " • ");
        assert_eq!(cfg.outbox.max_chars, 320);
        assert_eq!(cfg.dedupe.capacity, 5000);
        assert_eq!(cfg.join_rules.greet_after_seconds, 30);
        assert_eq!(cfg.microphone.attack_ms, 120);
        assert_eq!(cfg.speech.max_speech_ms, 15_000);
    }

    #[test]
    fn file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().expect("temp file");
        writeln!(
            file,
            "[comment]\nreply_threshold = 0.9\nmin_length = 5\n\n[outbox]\nseparator = \" | \"\n"
        )
        .expect("write");

        let cfg = PalConfig::load_from_path(file.path()).expect("load");
        assert_eq!(cfg.comment.reply_threshold, 0.9);
        assert_eq!(cfg.comment.min_length, 5);
        assert_eq!(cfg.outbox.separator, " | ");
        // untouched sections keep their defaults
        assert_eq!(cfg.comment.per_user_cooldown, 15);
        assert_eq!(cfg.avatar.port, 9000);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let cfg = PalConfig::load_from_path(Path::new("/nonexistent/streampal.toml")).expect("load");
        assert_eq!(cfg.memory.file, "memory.json");
        assert!(cfg.comment.greetings.iter().any(|g| g == "hallo"));
    }

    #[test]
    fn config_round_trips_through_toml() {
        let text = toml::to_string(&PalConfig::default()).expect("serialize");
        let back: PalConfig = toml::from_str(&text).expect("parse");
        assert_eq!(back.comment.keywords_bonus.len(), PalConfig::default().comment.keywords_bonus.len());
    }
}
