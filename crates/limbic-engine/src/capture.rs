//! Per-turn capture.
//!
//! extract layers → clean → filter → read affect → score → build record →
//! enqueue → (on failure) fallback log. Nothing here ever returns an error
//! to the host: every path ends in a [`CaptureOutcome`].

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, warn};

use limbic_core::{
    AffectVector, Config, InputCleaner, Message, NoveltyScorer, RejectReason, TurnContext, TurnId,
    TurnRecord, extract_layers, now_millis,
};
use limbic_store::{AffectStateStore, FallbackLog, WriteQueue, scope_for};

use crate::blocking::{lock, run_blocking};
use crate::embedding::{EmbeddingProvider, turn_text};
use crate::error::{EngineError, Result};
use crate::metrics::EngineMetrics;

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CaptureOutcome {
    Stored { turn_id: TurnId, score: f64 },
    /// Rejected by a noise filter or the novelty threshold. Nothing written.
    Filtered { reason: RejectReason, score: f64 },
    /// The transcript had no usable exchange.
    Skipped { reason: String },
    /// The store refused the turn; it was appended to the fallback log.
    Fallback { turn_id: TurnId, error: String },
    /// Neither the store nor the fallback log took the turn.
    Lost { turn_id: TurnId, error: String },
}

impl CaptureOutcome {
    pub fn is_stored(&self) -> bool {
        matches!(self, CaptureOutcome::Stored { .. })
    }

    pub fn turn_id(&self) -> Option<&TurnId> {
        match self {
            CaptureOutcome::Stored { turn_id, .. }
            | CaptureOutcome::Fallback { turn_id, .. }
            | CaptureOutcome::Lost { turn_id, .. } => Some(turn_id),
            _ => None,
        }
    }
}

pub struct CapturePipeline {
    config: Arc<Config>,
    cleaner: InputCleaner,
    scorer: NoveltyScorer,
    writer: Arc<WriteQueue>,
    affect: Arc<Mutex<AffectStateStore>>,
    fallback: Arc<FallbackLog>,
    metrics: Arc<EngineMetrics>,
    pub(crate) embedder: Option<Arc<dyn EmbeddingProvider>>,
}

impl CapturePipeline {
    pub fn new(
        config: Arc<Config>,
        writer: Arc<WriteQueue>,
        affect: Arc<Mutex<AffectStateStore>>,
        fallback: Arc<FallbackLog>,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            cleaner: InputCleaner::new(&config.capture),
            scorer: NoveltyScorer::new(&config.capture),
            config,
            writer,
            affect,
            fallback,
            metrics,
            embedder: None,
        }
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub async fn capture(&self, messages: &[Message], ctx: &TurnContext) -> CaptureOutcome {
        self.metrics.processed();

        let layers = match extract_layers(messages, &self.cleaner) {
            Ok(layers) => layers,
            Err(e) => {
                debug!(identity = %ctx.identity, reason = %e, "capture skipped");
                self.metrics.skipped();
                return CaptureOutcome::Skipped {
                    reason: e.to_string(),
                };
            }
        };

        if let Some(reason) =
            self.scorer
                .filter()
                .check(&layers.input, &layers.deliberation, &layers.output)
        {
            debug!(identity = %ctx.identity, %reason, "turn filtered");
            self.metrics.filtered(reason);
            return CaptureOutcome::Filtered { reason, score: 0.0 };
        }

        let affect = self.read_affect(ctx).await;
        let score = self.scorer.score(
            &layers.input,
            &layers.deliberation,
            &layers.output,
            affect.as_ref(),
        );
        let decision = self.scorer.decide(score);
        if !decision.accept {
            let reason = decision.reason.unwrap_or(RejectReason::BelowThreshold);
            debug!(identity = %ctx.identity, %reason, score, "turn below threshold");
            self.metrics.filtered(reason);
            return CaptureOutcome::Filtered { reason, score };
        }

        let record = TurnRecord::build(
            &layers,
            ctx,
            affect,
            score,
            &self.config.capture,
            now_millis(),
            &mut rand::rng(),
        );
        let turn_id = record.turn_id.clone();

        match self.writer.write_turn(record.clone()).await {
            Ok(_) => {
                debug!(turn_id = %turn_id, identity = %ctx.identity, score, "turn stored");
                self.metrics.stored();
                self.embed(&record).await;
                CaptureOutcome::Stored { turn_id, score }
            }
            Err(e) => {
                self.metrics.error("write");
                self.persist_fallback(record, e.to_string()).await
            }
        }
    }

    /// Current affect for binding to the turn. Read only; a failed read
    /// captures the turn without affect.
    async fn read_affect(&self, ctx: &TurnContext) -> Option<AffectVector> {
        let store = Arc::clone(&self.affect);
        let identity = ctx.identity.clone();
        let scope = scope_for(self.config.affect.scope, ctx.conversation_id.as_deref());
        let limit = Duration::from_millis(self.config.storage.write_timeout_ms);

        let result = run_blocking(limit, "affect read", move || {
            lock(&store)?.get(&identity, &scope, now_millis())
        })
        .await;
        match result {
            Ok(state) => Some(state.values),
            Err(e) => {
                warn!(identity = %ctx.identity, error = %e, "affect read failed, capturing without affect");
                self.metrics.error("affect");
                None
            }
        }
    }

    async fn persist_fallback(&self, record: TurnRecord, error: String) -> CaptureOutcome {
        let turn_id = record.turn_id.clone();
        let log = Arc::clone(&self.fallback);
        let message = error.clone();
        let limit = Duration::from_millis(self.config.storage.write_timeout_ms);

        let appended = run_blocking(limit, "fallback append", move || {
            log.append(&record, &message, now_millis())
        })
        .await;
        match appended {
            Ok(()) => {
                warn!(turn_id = %turn_id, error = %error, "turn write failed, routed to fallback log");
                self.metrics.fallback();
                CaptureOutcome::Fallback { turn_id, error }
            }
            Err(e) => {
                error!(turn_id = %turn_id, error = %error, fallback_error = %e, "turn lost");
                self.metrics.error("fallback");
                CaptureOutcome::Lost {
                    turn_id,
                    error: format!("{error}; fallback: {e}"),
                }
            }
        }
    }

    async fn embed(&self, record: &TurnRecord) {
        let Some(embedder) = &self.embedder else {
            return;
        };
        if let Err(e) = self.try_embed(embedder.as_ref(), record).await {
            warn!(turn_id = %record.turn_id, error = %e, "turn embedding skipped");
            self.metrics.error("embed");
        }
    }

    async fn try_embed(&self, embedder: &dyn EmbeddingProvider, record: &TurnRecord) -> Result<()> {
        let text = turn_text(record);
        if text.is_empty() {
            return Ok(());
        }
        let limit = Duration::from_millis(self.config.embedding.timeout_ms);
        let vector = tokio::time::timeout(limit, embedder.embed(&text))
            .await
            .map_err(|_| EngineError::Timeout("embedding"))??;
        self.writer
            .put_embedding(record.turn_id.clone(), embedder.model().to_string(), vector)
            .await?;
        Ok(())
    }
}
