//! Wiring: builds every component from one [`PalConfig`] and spawns the worker tasks.
//!
//! Reconfiguration means shutting one runtime down and starting a fresh one; nothing
//! here is global.

use crate::comments::CommentPipeline;
use crate::config::PalConfig;
use crate::dedup::DedupStore;
use crate::delivery::{DeliveryCoordinator, DeliveryQueue, OutputClock};
use crate::dispatcher::EventDispatcher;
use crate::error::PalResult;
use crate::generation::TextGenerator;
use crate::ingest::Ingest;
use crate::joins::{JoinAnnouncer, JoinScheduler, PendingJoinSet};
use crate::memory::MemoryStore;
use crate::outbox::OutboxBatcher;
use crate::relevance::RelevanceScorer;
use crate::viewers::ViewerTable;
use std::sync::Arc;
use std::time::Duration;
use streampal_voice::{AvatarSink, MicState, SpeechState};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// A running narrator. Must be started inside a tokio runtime.
pub struct Streampal {
    ingest: Arc<Ingest>,
    viewers: Arc<ViewerTable>,
    memory: Arc<MemoryStore>,
    outbox: Arc<OutboxBatcher>,
    pending_joins: Arc<PendingJoinSet>,
    joins: JoinScheduler,
    speech: SpeechState,
    mic: MicState,
    clock: OutputClock,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl Streampal {
    /// Build all components and spawn the workers: delivery, outbox ticker, comment
    /// pipeline, dispatcher, join announcer, memory writer and memory sweep.
    pub fn start(
        config: &PalConfig,
        sink: Arc<dyn AvatarSink>,
        generator: Arc<dyn TextGenerator>,
        speech: SpeechState,
        mic: MicState,
    ) -> PalResult<Self> {
        let memory = Arc::new(MemoryStore::open(&config.memory));
        let viewers = Arc::new(ViewerTable::new());
        let dedup = Arc::new(DedupStore::new(
            Duration::from_secs(config.dedupe.ttl_secs),
            config.dedupe.capacity,
        ));
        let clock = OutputClock::new();

        let (delivery_queue, delivery_rx) = DeliveryQueue::channel(config.style.max_line_length);
        let outbox = Arc::new(OutboxBatcher::new(
            config.outbox.clone(),
            delivery_queue.clone(),
            speech.clone(),
            mic.clone(),
        ));
        let coordinator = DeliveryCoordinator::new(
            sink,
            speech.clone(),
            mic.clone(),
            clock.clone(),
            config.speech.clone(),
            delivery_queue,
            delivery_rx,
        );

        let pending_joins = Arc::new(PendingJoinSet::new());
        let joins = JoinScheduler::new(
            config.join_rules.clone(),
            Duration::from_secs(config.comment.greeting_cooldown),
            Arc::clone(&viewers),
            Arc::clone(&memory),
            Arc::clone(&pending_joins),
        );
        let announcer = JoinAnnouncer::new(
            config.join_rules.clone(),
            Arc::clone(&pending_joins),
            Arc::clone(&outbox),
            speech.clone(),
            mic.clone(),
            clock.clone(),
        );

        let (pipeline, comment_tx) = CommentPipeline::new(
            config.comment.clone(),
            config.generation.clone(),
            generator,
            Arc::clone(&viewers),
            Arc::clone(&memory),
            Arc::clone(&outbox),
        )?;
        let (dispatcher, router) = EventDispatcher::new(
            config,
            Arc::clone(&viewers),
            Arc::clone(&memory),
            Arc::clone(&outbox),
            joins.clone(),
        );

        let ingest = Arc::new(Ingest::new(
            dedup,
            Arc::clone(&viewers),
            Arc::clone(&memory),
            RelevanceScorer::new(&config.comment)?,
            config.comment.min_length,
            comment_tx,
            router,
        ));

        let mut tasks = vec![
            ("delivery", tokio::spawn(coordinator.run())),
            ("outbox", tokio::spawn(Arc::clone(&outbox).run())),
            ("comments", tokio::spawn(pipeline.run())),
            ("dispatcher", tokio::spawn(dispatcher.run())),
        ];
        if config.join_rules.enabled {
            tasks.push(("announcer", tokio::spawn(announcer.run())));
        }
        if config.memory.enabled {
            tasks.push(("memory-writer", tokio::spawn(Arc::clone(&memory).run_writer())));
            tasks.push(("memory-sweep", tokio::spawn(Arc::clone(&memory).run_sweeper())));
        }
        info!(workers = tasks.len(), "🚀 Narrator started");

        Ok(Self {
            ingest,
            viewers,
            memory,
            outbox,
            pending_joins,
            joins,
            speech,
            mic,
            clock,
            tasks,
        })
    }

    pub fn ingest(&self) -> Arc<Ingest> {
        Arc::clone(&self.ingest)
    }

    pub fn viewers(&self) -> &ViewerTable {
        &self.viewers
    }

    pub fn memory(&self) -> &MemoryStore {
        &self.memory
    }

    pub fn outbox(&self) -> &OutboxBatcher {
        &self.outbox
    }

    pub fn pending_joins(&self) -> &PendingJoinSet {
        &self.pending_joins
    }

    pub fn speech(&self) -> &SpeechState {
        &self.speech
    }

    pub fn mic(&self) -> &MicState {
        &self.mic
    }

    pub fn output_clock(&self) -> &OutputClock {
        &self.clock
    }

    /// Stop every worker and flush memory to disk. Undelivered messages are dropped.
    pub async fn shutdown(self) {
        self.joins.close();
        for (_, task) in &self.tasks {
            task.abort();
        }
        for (name, task) in self.tasks {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!(task = name, error = %e, "Worker ended abnormally");
                }
            }
        }
        if self.memory.is_enabled() {
            if let Err(e) = self.memory.persist().await {
                warn!(error = %e, "Final memory write failed");
            }
        }
        info!("Narrator stopped");
    }
}
