//! Comment pipeline: scored comments → cooldowns → generation → narration fragments.
//!
//! Single consumer of the comment queue. Cooldown state lives here and nowhere else.

use crate::bucket::TokenBucket;
use crate::config::{CommentConfig, GenerationConfig};
use crate::error::PalResult;
use crate::generation::{shorten_reply, GenerationError, GenerationRequest, TextGenerator};
use crate::memory::MemoryStore;
use crate::narration;
use crate::outbox::OutboxBatcher;
use crate::relevance::RelevanceScorer;
use crate::viewers::ViewerTable;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

const DEFER_YIELD: Duration = Duration::from_millis(50);
const MAX_REPLY_THRESHOLD: f64 = 0.8;
const FALLBACK_REPLY_THRESHOLD: f64 = 0.4;
const GREETING_MAX_WORDS: usize = 4;
const COOLDOWN_PRUNE_AT: usize = 1024;

/// One queued comment. `text` is already lowercased by ingest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommentItem {
    pub user_id: String,
    pub nickname: String,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommentOutcome {
    /// Too short or spam.
    Filtered,
    /// Viewer still in per-user cooldown; pushed back onto the queue.
    Deferred,
    Greeted,
    Thanked,
    Replied,
    /// Scored high enough but generation failed or timed out.
    Unanswered,
    Ignored,
}

/// Thresholds above 0.8 would silence nearly everything; fall back to 0.4.
pub fn effective_reply_threshold(configured: f64) -> f64 {
    if configured > MAX_REPLY_THRESHOLD {
        info!(
            configured,
            fallback = FALLBACK_REPLY_THRESHOLD,
            "reply_threshold too high; lowering"
        );
        FALLBACK_REPLY_THRESHOLD
    } else {
        configured
    }
}

pub struct CommentPipeline {
    config: CommentConfig,
    generation: GenerationConfig,
    reply_threshold: f64,
    scorer: RelevanceScorer,
    bucket: TokenBucket,
    generator: Arc<dyn TextGenerator>,
    viewers: Arc<ViewerTable>,
    memory: Arc<MemoryStore>,
    outbox: Arc<OutboxBatcher>,
    next_global: Option<Instant>,
    per_user_until: HashMap<String, Instant>,
    rx: mpsc::UnboundedReceiver<CommentItem>,
    requeue: mpsc::WeakUnboundedSender<CommentItem>,
}

impl CommentPipeline {
    /// Build the pipeline and the sender feeding its queue.
    pub fn new(
        config: CommentConfig,
        generation: GenerationConfig,
        generator: Arc<dyn TextGenerator>,
        viewers: Arc<ViewerTable>,
        memory: Arc<MemoryStore>,
        outbox: Arc<OutboxBatcher>,
    ) -> PalResult<(Self, mpsc::UnboundedSender<CommentItem>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let pipeline = Self {
            reply_threshold: effective_reply_threshold(config.reply_threshold),
            scorer: RelevanceScorer::new(&config)?,
            bucket: TokenBucket::per_minute(config.max_replies_per_min),
            config,
            generation,
            generator,
            viewers,
            memory,
            outbox,
            next_global: None,
            per_user_until: HashMap::new(),
            rx,
            requeue: tx.downgrade(),
        };
        Ok((pipeline, tx))
    }

    pub fn reply_threshold(&self) -> f64 {
        self.reply_threshold
    }

    /// Consume the comment queue until every sender is gone.
    pub async fn run(mut self) {
        if !self.config.enabled {
            info!("Comment replies disabled; draining queue");
            while self.rx.recv().await.is_some() {}
            return;
        }
        info!(threshold = self.reply_threshold, "💬 Comment pipeline started");
        while let Some(item) = self.rx.recv().await {
            match self.process(item).await {
                Ok(outcome) => debug!(?outcome, "Comment handled"),
                Err(e) => error!(error = %e, "Comment pipeline error"),
            }
        }
        info!("Comment pipeline stopped");
    }

    /// Handle one comment.
    pub async fn process(&mut self, item: CommentItem) -> PalResult<CommentOutcome> {
        self.viewers.touch(&item.user_id, &item.nickname);
        let text = item.text.as_str();
        if text.chars().count() < self.config.min_length || self.scorer.is_ignored(text) {
            return Ok(CommentOutcome::Filtered);
        }

        let now = Instant::now();
        if self
            .per_user_until
            .get(&item.user_id)
            .map(|until| now < *until)
            .unwrap_or(false)
        {
            tokio::time::sleep(DEFER_YIELD).await;
            match self.requeue.upgrade() {
                Some(tx) => {
                    let _ = tx.send(item);
                }
                None => debug!("Comment queue closed; dropping deferred comment"),
            }
            return Ok(CommentOutcome::Deferred);
        }

        let score = self.scorer.score(text);

        if self.config.respond_to_greetings
            && self.scorer.is_greeting(text)
            && !text.contains('?')
            && text.split_whitespace().count() <= GREETING_MAX_WORDS
            && self
                .memory
                .greeting_due(&item.user_id, Duration::from_secs(self.config.greeting_cooldown))
        {
            self.memory.mark_greeted(&item.user_id, Utc::now());
            self.bucket.acquire().await;
            self.wait_global_cooldown().await;
            self.outbox.add(&narration::greeting(&item.nickname))?;
            self.start_cooldowns(&item.user_id);
            return Ok(CommentOutcome::Greeted);
        }

        if self.config.respond_to_thanks && self.scorer.is_thanks(text) {
            self.bucket.acquire().await;
            self.wait_global_cooldown().await;
            self.outbox.add(&narration::thanks(&item.nickname))?;
            self.start_cooldowns(&item.user_id);
            return Ok(CommentOutcome::Thanked);
        }

        if score >= self.reply_threshold {
            self.bucket.acquire().await;
            self.wait_global_cooldown().await;
            return match self.generate_reply(&item).await {
                Ok(reply) => {
                    self.outbox.add(&narration::reply(&item.nickname, text, &reply))?;
                    self.start_cooldowns(&item.user_id);
                    Ok(CommentOutcome::Replied)
                }
                Err(e) => {
                    warn!(user = %item.user_id, error = %e, "No reply generated");
                    Ok(CommentOutcome::Unanswered)
                }
            };
        }

        Ok(CommentOutcome::Ignored)
    }

    fn prompt_for(&self, item: &CommentItem) -> GenerationRequest {
        let background = self.memory.background_summary(&item.user_id);
        let history = self.memory.history(&item.user_id).join("\n");
        GenerationRequest {
            system: self.generation.system_prompt.clone(),
            context: format!(
                "User: {}\nBackground: {}\nChat history:\n{}",
                item.nickname, background, history
            ),
            input: format!("Current comment: {}", item.text),
        }
    }

    async fn generate_reply(&self, item: &CommentItem) -> Result<String, GenerationError> {
        let request = self.prompt_for(item);
        let limit = self.generation.timeout();
        let reply = tokio::time::timeout(limit, self.generator.generate(&request))
            .await
            .map_err(|_| GenerationError::Timeout(limit.as_millis() as u64))??;
        Ok(shorten_reply(&reply, self.generation.max_reply_words))
    }

    async fn wait_global_cooldown(&self) {
        if let Some(next) = self.next_global {
            if Instant::now() < next {
                tokio::time::sleep_until(next).await;
            }
        }
    }

    fn start_cooldowns(&mut self, user_id: &str) {
        let now = Instant::now();
        self.next_global = Some(now + Duration::from_secs(self.config.global_cooldown));
        if self.per_user_until.len() >= COOLDOWN_PRUNE_AT {
            self.per_user_until.retain(|_, until| *until > now);
        }
        self.per_user_until.insert(
            user_id.to_string(),
            now + Duration::from_secs(self.config.per_user_cooldown),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MemoryConfig, OutboxConfig};
    use crate::delivery::DeliveryQueue;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use streampal_voice::{MicState, SpeechState};

    struct CannedGenerator {
        calls: AtomicUsize,
        requests: Mutex<Vec<GenerationRequest>>,
        delay: Duration,
    }

    #[async_trait]
    impl TextGenerator for CannedGenerator {
        async fn generate(&self, request: &GenerationRequest) -> Result<String, GenerationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.requests.lock().expect("lock").push(request.clone());
            tokio::time::sleep(self.delay).await;
            Ok("Weil es so ist.".to_string())
        }
    }

    struct Fixture {
        pipeline: CommentPipeline,
        generator: Arc<CannedGenerator>,
        outbox: Arc<OutboxBatcher>,
        _tx: mpsc::UnboundedSender<CommentItem>,
        _delivered: mpsc::UnboundedReceiver<String>,
        _dir: tempfile::TempDir,
    }

    fn fixture(config: CommentConfig, delay: Duration) -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let memory = Arc::new(MemoryStore::open(&MemoryConfig {
            file: dir.path().join("memory.json").to_string_lossy().into_owned(),
            ..Default::default()
        }));
        let (queue, delivered) = DeliveryQueue::channel(140);
        let outbox = Arc::new(OutboxBatcher::new(
            OutboxConfig::default(),
            queue,
            SpeechState::new(),
            MicState::new(),
        ));
        let generator = Arc::new(CannedGenerator {
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
            delay,
        });
        let (pipeline, tx) = CommentPipeline::new(
            config,
            GenerationConfig::default(),
            generator.clone(),
            Arc::new(ViewerTable::new()),
            memory,
            Arc::clone(&outbox),
        )
        .expect("pipeline");
        Fixture {
            pipeline,
            generator,
            outbox,
            _tx: tx,
            _delivered: delivered,
            _dir: dir,
        }
    }

    fn item(uid: &str, text: &str) -> CommentItem {
        CommentItem {
            user_id: uid.into(),
            nickname: format!("nick-{}", uid),
            text: text.into(),
        }
    }

    #[test]
    fn high_threshold_is_clamped() {
        assert_eq!(effective_reply_threshold(0.9), 0.4);
        assert_eq!(effective_reply_threshold(0.8), 0.8);
        assert_eq!(effective_reply_threshold(0.6), 0.6);
    }

    #[tokio::test(start_paused = true)]
    async fn pipeline_uses_clamped_threshold() {
        let config = CommentConfig {
            reply_threshold: 0.95,
            ..Default::default()
        };
        let f = fixture(config, Duration::ZERO);
        assert_eq!(f.pipeline.reply_threshold(), 0.4);
    }

    #[tokio::test(start_paused = true)]
    async fn greets_once_within_cooldown() {
        let mut f = fixture(CommentConfig::default(), Duration::ZERO);
        assert_eq!(
            f.pipeline.process(item("u1", "hallo")).await.expect("process"),
            CommentOutcome::Greeted
        );
        assert_eq!(f.outbox.pending(), vec!["nick-u1 sagt hallo".to_string()]);

        // past the per-user cooldown but inside the greeting cooldown
        tokio::time::advance(Duration::from_secs(20)).await;
        assert_eq!(
            f.pipeline.process(item("u1", "hallo")).await.expect("process"),
            CommentOutcome::Ignored
        );
        assert_eq!(f.outbox.pending().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn thanks_fast_path() {
        let mut f = fixture(CommentConfig::default(), Duration::ZERO);
        assert_eq!(
            f.pipeline.process(item("u1", "danke dir")).await.expect("process"),
            CommentOutcome::Thanked
        );
        assert_eq!(f.outbox.pending(), vec!["nick-u1 bedankt sich".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn filters_short_and_spam() {
        let mut f = fixture(CommentConfig::default(), Duration::ZERO);
        for text in ["hi", "!skip this", "see https://x.example"] {
            assert_eq!(
                f.pipeline.process(item("u1", text)).await.expect("process"),
                CommentOutcome::Filtered
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn question_generates_reply_with_context() {
        let mut f = fixture(CommentConfig::default(), Duration::ZERO);
        let outcome = f
            .pipeline
            .process(item("u1", "warum ist das so?"))
            .await
            .expect("process");
        assert_eq!(outcome, CommentOutcome::Replied);
        assert_eq!(f.generator.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            f.outbox.pending(),
            vec!["@nick-u1: warum ist das so? → Weil es so ist.".to_string()]
        );

        let requests = f.generator.requests.lock().expect("lock").clone();
        assert!(requests[0].context.starts_with("User: nick-u1\nBackground: \nChat history:\n"));
        assert_eq!(requests[0].input, "Current comment: warum ist das so?");
    }

    #[tokio::test(start_paused = true)]
    async fn per_user_cooldown_defers() {
        let mut f = fixture(CommentConfig::default(), Duration::ZERO);
        f.pipeline.process(item("u1", "warum ist das so?")).await.expect("first");
        let outcome = f
            .pipeline
            .process(item("u1", "und wieso das?"))
            .await
            .expect("second");
        assert_eq!(outcome, CommentOutcome::Deferred);
        let requeued = f.pipeline.rx.try_recv().expect("requeued");
        assert_eq!(requeued.text, "und wieso das?");
        assert_eq!(f.generator.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn global_cooldown_spaces_replies() {
        let mut f = fixture(CommentConfig::default(), Duration::ZERO);
        let start = Instant::now();
        f.pipeline.process(item("u1", "warum?")).await.expect("first");
        f.pipeline.process(item("u2", "wieso?")).await.expect("second");
        assert!(Instant::now().duration_since(start) >= Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_generation_leaves_comment_unanswered() {
        let mut f = fixture(CommentConfig::default(), Duration::from_secs(30));
        let outcome = f.pipeline.process(item("u1", "warum?")).await.expect("process");
        assert_eq!(outcome, CommentOutcome::Unanswered);
        assert!(f.outbox.pending().is_empty());

        // no cooldown was started, so the next comment is handled right away
        let outcome = f.pipeline.process(item("u1", "danke")).await.expect("process");
        assert_eq!(outcome, CommentOutcome::Thanked);
    }

    #[tokio::test(start_paused = true)]
    async fn low_score_is_ignored() {
        let mut f = fixture(CommentConfig::default(), Duration::ZERO);
        assert_eq!(
            f.pipeline.process(item("u1", "cool stream")).await.expect("process"),
            CommentOutcome::Ignored
        );
        assert_eq!(f.generator.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn clamped_threshold_lets_keyword_comment_reach_generation() {
        // keyword 0.35 + length 0.1
        let text = "wie geht es dir";
        let mut strict = fixture(CommentConfig::default(), Duration::ZERO);
        assert_eq!(
            strict.pipeline.process(item("u1", text)).await.expect("process"),
            CommentOutcome::Ignored
        );

        let config = CommentConfig {
            reply_threshold: 0.95,
            ..Default::default()
        };
        let mut f = fixture(config, Duration::ZERO);
        assert_eq!(
            f.pipeline.process(item("u1", text)).await.expect("process"),
            CommentOutcome::Replied
        );
        assert_eq!(f.generator.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn greeting_with_question_is_answered_not_greeted() {
        let mut f = fixture(CommentConfig::default(), Duration::ZERO);
        assert_eq!(
            f.pipeline.process(item("u1", "hallo, wie geht's?")).await.expect("process"),
            CommentOutcome::Replied
        );
        assert_eq!(f.generator.calls.load(Ordering::SeqCst), 1);
        assert!(!f.outbox.pending().iter().any(|m| m.contains("sagt hallo")));
    }

    #[tokio::test(start_paused = true)]
    async fn long_greeting_is_not_greeted() {
        let mut f = fixture(CommentConfig::default(), Duration::ZERO);
        assert_eq!(
            f.pipeline.process(item("u1", "hallo ihr lieben leute hier")).await.expect("process"),
            CommentOutcome::Ignored
        );
        assert!(f.outbox.pending().is_empty());

        // four words is still a greeting
        assert_eq!(
            f.pipeline.process(item("u2", "hallo ihr lieben leute")).await.expect("process"),
            CommentOutcome::Greeted
        );
        assert_eq!(f.outbox.pending(), vec!["nick-u2 sagt hallo".to_string()]);
    }
}
