//! [`MemoryEngine`]: the capture pipeline, recall engine and affect state
//! wired over one data directory.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info, warn};

use limbic_core::{
    AffectDelta, AffectDetector, AffectVector, Config, LexiconDetector, Message, RecallSession,
    TurnContext, TurnId, now_millis,
};
use limbic_store::{
    AffectState, AffectStateStore, AffectUpdate, DataLayout, FallbackLog, HealthReport,
    MemoryStore, RetryPolicy, WriteQueue, scope_for,
};

use crate::blocking::{lock, run_blocking};
use crate::capture::{CaptureOutcome, CapturePipeline};
use crate::embedding::{EmbeddingProvider, HttpEmbeddingProvider};
use crate::error::Result;
use crate::hooks::MemoryHooks;
use crate::metrics::{EngineMetrics, MetricsSnapshot};
use crate::recall::{RecallEngine, RecallOptions, RecallOutcome, SearchResults};

#[derive(Clone, Debug, Serialize)]
pub struct EngineHealth {
    #[serde(flatten)]
    pub store: HealthReport,
    pub fallback_pending: usize,
    pub writer_open: bool,
    pub embedding_model: Option<String>,
    pub metrics: MetricsSnapshot,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ReplayReport {
    pub replayed: usize,
    /// Entries whose turn was already in the store.
    pub already_stored: usize,
    /// Entries left in the log after this pass.
    pub remaining: usize,
}

pub struct MemoryEngine {
    config: Arc<Config>,
    writer: Arc<WriteQueue>,
    reader: Arc<Mutex<MemoryStore>>,
    affect: Arc<Mutex<AffectStateStore>>,
    fallback: Arc<FallbackLog>,
    detector: Arc<dyn AffectDetector>,
    metrics: Arc<EngineMetrics>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    capture: CapturePipeline,
    recall: RecallEngine,
}

impl MemoryEngine {
    /// Open (creating if needed) the stores under `layout`, bounded by the
    /// init timeout. An embedding endpoint in the config is attached.
    pub async fn open(layout: &DataLayout, config: Config) -> Result<Self> {
        let config = Arc::new(config);
        let limit = Duration::from_millis(config.storage.init_timeout_ms);

        let (store, reader, affect) = run_blocking(limit, "engine open", {
            let layout = layout.clone();
            let config = Arc::clone(&config);
            move || {
                layout.ensure()?;
                let busy = config.storage.busy_timeout_ms;
                let store = MemoryStore::open_with(&layout.memory_db(), busy)?;
                let reader = MemoryStore::open_reader(&layout.memory_db(), busy)?;
                let affect = AffectStateStore::open(&layout.affect_db(), &config.affect, busy)?
                    .with_retry(RetryPolicy::from(&config.storage.retry));
                Ok((store, reader, affect))
            }
        })
        .await?;

        let writer = Arc::new(WriteQueue::spawn(store, &config.storage)?);
        let metrics = Arc::new(EngineMetrics::new()?);
        let fallback = Arc::new(FallbackLog::new(layout.fallback_log()));
        let reader = Arc::new(Mutex::new(reader));
        let affect = Arc::new(Mutex::new(affect));

        let capture = CapturePipeline::new(
            Arc::clone(&config),
            Arc::clone(&writer),
            Arc::clone(&affect),
            Arc::clone(&fallback),
            Arc::clone(&metrics),
        );
        let recall = RecallEngine::new(Arc::clone(&config), Arc::clone(&reader), Arc::clone(&metrics));

        let mut engine = Self {
            config,
            writer,
            reader,
            affect,
            fallback,
            detector: Arc::new(LexiconDetector),
            metrics,
            embedder: None,
            capture,
            recall,
        };
        if let Some(provider) = HttpEmbeddingProvider::from_config(&engine.config.embedding)? {
            engine = engine.with_embedder(Arc::new(provider));
        }

        info!(
            data_dir = %layout.base().display(),
            embedding = ?engine.embedder.as_ref().map(|e| e.model()),
            "memory engine open"
        );
        Ok(engine)
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        self.capture.embedder = Some(Arc::clone(&embedder));
        self.recall.embedder = Some(Arc::clone(&embedder));
        self.embedder = Some(embedder);
        self
    }

    pub fn with_detector(mut self, detector: Arc<dyn AffectDetector>) -> Self {
        self.detector = detector;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn metrics(&self) -> &EngineMetrics {
        &self.metrics
    }

    pub fn new_session(&self, conversation_id: Option<String>) -> RecallSession {
        RecallSession::new(conversation_id, &self.config.recall)
    }

    fn scope(&self, ctx: &TurnContext) -> String {
        scope_for(self.config.affect.scope, ctx.conversation_id.as_deref())
    }

    fn affect_timeout(&self) -> Duration {
        Duration::from_millis(self.config.storage.write_timeout_ms)
    }

    // --- Capture ---

    pub async fn capture(&self, messages: &[Message], ctx: &TurnContext) -> CaptureOutcome {
        self.capture.capture(messages, ctx).await
    }

    // --- Recall ---

    /// Recall for an explicit query. Affect is read, not updated, but the
    /// bleed of surfaced memories is applied.
    pub async fn recall(
        &self,
        query: &str,
        ctx: &TurnContext,
        session: &mut RecallSession,
        opts: &RecallOptions,
    ) -> RecallOutcome {
        self.observe(session, ctx);
        let current = self.current_affect(ctx).await;
        self.recall_with(query, ctx, session, opts, &current).await
    }

    /// The full pre-response path: absorb the prompt's affect, recall
    /// against it and apply the bleed.
    pub async fn prepare_response(
        &self,
        prompt: &str,
        ctx: &TurnContext,
        session: &mut RecallSession,
        opts: &RecallOptions,
    ) -> RecallOutcome {
        self.observe(session, ctx);
        let current = self.absorb(prompt, ctx).await;
        self.recall_with(prompt, ctx, session, opts, &current).await
    }

    /// Stateless search with no session, budget or bleed.
    pub async fn search(&self, query: &str, opts: &RecallOptions) -> Result<SearchResults> {
        self.recall.search(query, opts, &HashSet::new()).await
    }

    fn observe(&self, session: &mut RecallSession, ctx: &TurnContext) {
        if session.observe_conversation(ctx.conversation_id.as_deref()) {
            debug!(conversation = ?ctx.conversation_id, "conversation changed, recall session reset");
        }
    }

    async fn recall_with(
        &self,
        query: &str,
        ctx: &TurnContext,
        session: &mut RecallSession,
        opts: &RecallOptions,
        current: &AffectVector,
    ) -> RecallOutcome {
        let outcome = self.recall.recall(session, query, opts, current).await;
        if !outcome.bleed.is_zero() {
            self.apply_bleed(ctx, outcome.bleed).await;
        }
        outcome
    }

    // --- Affect ---

    /// Affect with decay applied, or the baseline when the store is unreachable.
    async fn current_affect(&self, ctx: &TurnContext) -> AffectVector {
        match self.affect_state(ctx).await {
            Ok(state) => state.values,
            Err(e) => {
                warn!(identity = %ctx.identity, error = %e, "affect read failed, using baseline");
                self.metrics.error("affect");
                self.config.affect.baseline()
            }
        }
    }

    async fn absorb(&self, prompt: &str, ctx: &TurnContext) -> AffectVector {
        let detected = self.detector.detect(prompt);
        let store = Arc::clone(&self.affect);
        let identity = ctx.identity.clone();
        let scope = self.scope(ctx);

        let result = run_blocking(self.affect_timeout(), "affect update", move || {
            Ok(lock(&store)?.update(&identity, &scope, &detected, now_millis()))
        })
        .await;
        match result {
            Ok(update) => self.settle(ctx, update).values,
            Err(e) => {
                warn!(identity = %ctx.identity, error = %e, "affect update failed, using baseline");
                self.metrics.error("affect");
                self.config.affect.baseline()
            }
        }
    }

    async fn apply_bleed(&self, ctx: &TurnContext, delta: AffectDelta) {
        debug!(identity = %ctx.identity, magnitude = delta.magnitude(), "applying affect bleed");
        let store = Arc::clone(&self.affect);
        let identity = ctx.identity.clone();
        let scope = self.scope(ctx);

        let result = run_blocking(self.affect_timeout(), "affect bleed", move || {
            Ok(lock(&store)?.nudge(&identity, &scope, &delta, now_millis()))
        })
        .await;
        match result {
            Ok(update) => {
                self.settle(ctx, update);
            }
            Err(e) => {
                warn!(identity = %ctx.identity, error = %e, "affect bleed dropped");
                self.metrics.error("affect");
            }
        }
    }

    fn settle(&self, ctx: &TurnContext, update: AffectUpdate) -> AffectState {
        if !update.is_applied() {
            self.metrics.affect_stale();
            debug!(identity = %ctx.identity, "continuing with stale affect state");
        }
        update.into_state()
    }

    pub async fn affect_state(&self, ctx: &TurnContext) -> Result<AffectState> {
        let store = Arc::clone(&self.affect);
        let identity = ctx.identity.clone();
        let scope = self.scope(ctx);
        run_blocking(self.affect_timeout(), "affect read", move || {
            lock(&store)?.get(&identity, &scope, now_millis())
        })
        .await
    }

    pub async fn reset_affect(&self, ctx: &TurnContext) -> Result<AffectUpdate> {
        let store = Arc::clone(&self.affect);
        let identity = ctx.identity.clone();
        let scope = self.scope(ctx);
        run_blocking(self.affect_timeout(), "affect reset", move || {
            Ok(lock(&store)?.reset(&identity, &scope, now_millis()))
        })
        .await
    }

    // --- Maintenance ---

    pub async fn health(&self) -> Result<EngineHealth> {
        let reader = Arc::clone(&self.reader);
        let fallback = Arc::clone(&self.fallback);
        let limit = Duration::from_millis(self.config.storage.recall_timeout_ms);
        let (store, fallback_pending) = run_blocking(limit, "health", move || {
            let report = lock(&reader)?.health(now_millis())?;
            Ok((report, fallback.pending_count()?))
        })
        .await?;
        Ok(EngineHealth {
            store,
            fallback_pending,
            writer_open: !self.writer.is_closed(),
            embedding_model: self.embedder.as_ref().map(|e| e.model().to_string()),
            metrics: self.metrics.snapshot(),
        })
    }

    /// Move fallback-logged turns into the store. Entries that still fail
    /// stay in the log for the next pass.
    pub async fn replay_fallback(&self) -> Result<ReplayReport> {
        let limit = Duration::from_millis(self.config.storage.recall_timeout_ms);
        let log = Arc::clone(&self.fallback);
        let entries = run_blocking(limit, "fallback read", move || log.read_all()).await?;

        let mut report = ReplayReport::default();
        let mut done: HashSet<TurnId> = HashSet::new();
        for entry in entries {
            let turn_id = entry.record.turn_id.clone();
            let reader = Arc::clone(&self.reader);
            let probe = turn_id.clone();
            let exists = run_blocking(limit, "fallback probe", move || {
                lock(&reader)?.turn_exists(&probe)
            })
            .await?;
            if exists {
                report.already_stored += 1;
                done.insert(turn_id);
                continue;
            }
            match self.writer.write_turn(entry.record).await {
                Ok(_) => {
                    report.replayed += 1;
                    self.metrics.stored();
                    done.insert(turn_id);
                }
                Err(e) => {
                    warn!(turn_id = %turn_id, error = %e, "replay write failed, keeping entry");
                    self.metrics.error("replay");
                }
            }
        }

        let log = Arc::clone(&self.fallback);
        report.remaining = run_blocking(limit, "fallback rewrite", move || {
            log.retain(|e| !done.contains(&e.record.turn_id))
        })
        .await?;
        info!(
            replayed = report.replayed,
            already_stored = report.already_stored,
            remaining = report.remaining,
            "fallback replay finished"
        );
        Ok(report)
    }

    /// Drain the write queue and checkpoint. Later captures land in the
    /// fallback log.
    pub async fn shutdown(&self) -> Result<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

#[async_trait]
impl MemoryHooks for MemoryEngine {
    async fn on_turn_complete(&self, transcript: &[Message], ctx: &TurnContext) -> CaptureOutcome {
        self.capture(transcript, ctx).await
    }

    async fn before_response(
        &self,
        prompt: &str,
        ctx: &TurnContext,
        session: &mut RecallSession,
    ) -> Option<String> {
        self.prepare_response(prompt, ctx, session, &RecallOptions::default())
            .await
            .context
    }
}
