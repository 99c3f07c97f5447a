//! Streampal daemon
//!
//! Reads newline-delimited JSON audience events from stdin and narrates them through
//! the avatar websocket until CTRL-C.

use std::sync::Arc;
use std::time::Duration;
use streampal_core::{generator_from_config, EventFeed, PalConfig, Streampal};
use streampal_voice::{MicMonitor, MicState, SpeechState, WsAvatarSink};
use tokio::io::BufReader;
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[streampal] .env not loaded: {} (using system environment)", e);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = PalConfig::load()?;
    let speech = SpeechState::new();
    let mic = MicState::new();

    let sink = Arc::new(WsAvatarSink::for_host(
        &config.avatar.host,
        config.avatar.port,
        Duration::from_millis(config.avatar.handshake_timeout_ms),
        speech.clone(),
    ));
    tracing::info!(uri = sink.uri(), "Avatar sink configured");
    let generator = generator_from_config(&config.generation);

    let (level_tx, level_rx) = mpsc::unbounded_channel();
    tokio::spawn(MicMonitor::new(config.microphone.clone(), mic.clone()).run(level_rx));
    // cpal streams are not Send; the handle stays on this task.
    #[cfg(feature = "capture")]
    let _capture = if config.microphone.enabled {
        match streampal_voice::LevelCapture::new(&config.microphone.device).and_then(|c| c.start(level_tx)) {
            Ok(stream) => Some(stream),
            Err(e) => {
                tracing::warn!(error = %e, "Mic capture unavailable; mic gate stays idle");
                None
            }
        }
    } else {
        None
    };
    #[cfg(not(feature = "capture"))]
    drop(level_tx);

    let pal = Streampal::start(&config, sink, generator, speech, mic)?;
    let ingest = pal.ingest();
    let pump = EventFeed::new(BufReader::new(tokio::io::stdin())).pump(&ingest);
    tokio::pin!(pump);
    let mut feed_open = true;

    loop {
        tokio::select! {
            result = &mut pump, if feed_open => {
                feed_open = false;
                match result {
                    Ok(routed) => tracing::info!(routed, "stdin closed; still narrating until CTRL-C"),
                    Err(e) => tracing::warn!(error = %e, "event feed failed"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("CTRL-C received; shutting down");
                break;
            }
        }
    }

    pal.shutdown().await;
    Ok(())
}
