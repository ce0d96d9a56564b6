//! Tiered recall against the store.
//!
//! Full-text entry points → bounded graph traversal → turn grouping and
//! ranking → optional embedding rerank → reconstruction of the winners.
//! [`RecallEngine::recall`] layers the per-conversation session on top:
//! budget, dedup, cache and the affect bleed of what was surfaced.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use limbic_core::recall::{
    blend_similarity, format_context, group_by_turn, recall_bleed, select_entry_points, traverse,
};
use limbic_core::{
    AffectDelta, AffectVector, Config, RecallFilters, RecallSession, RecalledTurn, SnippetCaps,
    TraversalLimits, TurnCandidate, TurnId, now_millis, query_terms,
};
use limbic_store::MemoryStore;

use crate::blocking::{lock, run_blocking};
use crate::embedding::{EmbeddingProvider, cosine};
use crate::error::{EngineError, Result};
use crate::metrics::{EngineMetrics, RecallResult};

/// Per-call overrides of the configured recall sizes.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecallOptions {
    pub max_results: Option<usize>,
    pub max_summaries: Option<usize>,
    pub traverse_depth: Option<usize>,
    pub filters: RecallFilters,
}

/// Ranked, reconstructed turns from one search.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct SearchResults {
    pub memories: Vec<RecalledTurn>,
    /// Nodes visited by the traversal.
    pub scanned: usize,
    /// Distinct turns that competed for a slot.
    pub candidate_count: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct RecallOutcome {
    /// Formatted block to prepend, `None` when nothing was surfaced.
    pub context: Option<String>,
    /// Turns included in `context`.
    pub memories: Vec<RecalledTurn>,
    pub scanned: usize,
    pub candidate_count: usize,
    pub tokens: usize,
    /// Affect nudge owed for what was surfaced. Not yet applied.
    pub bleed: AffectDelta,
    pub cached: bool,
}

pub struct RecallEngine {
    config: Arc<Config>,
    reader: Arc<Mutex<MemoryStore>>,
    metrics: Arc<EngineMetrics>,
    pub(crate) embedder: Option<Arc<dyn EmbeddingProvider>>,
}

impl RecallEngine {
    pub fn new(
        config: Arc<Config>,
        reader: Arc<Mutex<MemoryStore>>,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            config,
            reader,
            metrics,
            embedder: None,
        }
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.config.storage.recall_timeout_ms)
    }

    /// Session-free search. Turns in `exclude` never take a slot.
    pub async fn search(
        &self,
        query: &str,
        opts: &RecallOptions,
        exclude: &HashSet<TurnId>,
    ) -> Result<SearchResults> {
        let terms = query_terms(query);
        if terms.is_empty() {
            return Ok(SearchResults::default());
        }

        let cfg = &self.config.recall;
        let max_results = opts.max_results.unwrap_or(cfg.max_results);
        let max_summaries = opts.max_summaries.unwrap_or(cfg.max_summaries);
        let limits = TraversalLimits {
            depth: opts.traverse_depth.unwrap_or(cfg.traverse_depth),
            ..TraversalLimits::from(cfg)
        };
        let filters = opts
            .filters
            .clone()
            .within_days(cfg.time_window_days, now_millis());
        let per_term = cfg.candidates_per_term;
        let novelty_weight = cfg.novelty_weight;
        let exclude = exclude.clone();
        let reader = Arc::clone(&self.reader);

        let (mut candidates, scanned) = run_blocking(self.timeout(), "recall search", move || {
            let store = lock(&reader)?;
            let entries = store.entry_points(&terms, &filters, per_term)?;
            let seeds = select_entry_points(entries, max_summaries);
            let visited = traverse(&*store, &seeds, terms.len(), limits)?;
            let mut turns = group_by_turn(&visited, novelty_weight);
            turns.retain(|t| !exclude.contains(&t.turn_id));
            Ok((turns, visited.len()))
        })
        .await?;
        let candidate_count = candidates.len();

        if let Some(embedder) = &self.embedder {
            if let Err(e) = self.rerank(embedder.as_ref(), query, &mut candidates).await {
                warn!(error = %e, "embedding rerank skipped, using text ranking");
                self.metrics.error("embed");
            }
        }
        candidates.truncate(max_results);

        let scores: HashMap<TurnId, f64> = candidates
            .iter()
            .map(|c| (c.turn_id.clone(), c.score))
            .collect();
        let ids: Vec<TurnId> = candidates.into_iter().map(|c| c.turn_id).collect();
        let reader = Arc::clone(&self.reader);
        let mut memories = run_blocking(self.timeout(), "recall load", move || {
            lock(&reader)?.load_turns(&ids)
        })
        .await?;
        for m in &mut memories {
            m.score = scores.get(&m.turn_id).copied().unwrap_or_default();
        }

        Ok(SearchResults {
            memories,
            scanned,
            candidate_count,
        })
    }

    async fn rerank(
        &self,
        embedder: &dyn EmbeddingProvider,
        query: &str,
        candidates: &mut [TurnCandidate],
    ) -> Result<()> {
        if candidates.is_empty() {
            return Ok(());
        }
        let limit = Duration::from_millis(self.config.embedding.timeout_ms);
        let query_vec = tokio::time::timeout(limit, embedder.embed(query))
            .await
            .map_err(|_| EngineError::Timeout("query embedding"))??;

        let ids: Vec<TurnId> = candidates.iter().map(|c| c.turn_id.clone()).collect();
        let model = embedder.model().to_string();
        let reader = Arc::clone(&self.reader);
        let stored = run_blocking(self.timeout(), "embedding load", move || {
            lock(&reader)?.embeddings(&ids, &model)
        })
        .await?;

        let similarity: HashMap<TurnId, f64> = stored
            .iter()
            .map(|(id, v)| (id.clone(), cosine(&query_vec, v)))
            .collect();
        blend_similarity(candidates, &similarity, self.config.recall.embedding_weight);
        Ok(())
    }

    /// Session-aware recall. Never fails: storage errors and timeouts come
    /// back as an empty outcome.
    pub async fn recall(
        &self,
        session: &mut RecallSession,
        query: &str,
        opts: &RecallOptions,
        current: &AffectVector,
    ) -> RecallOutcome {
        if session.budget_exhausted() {
            debug!(conversation = ?session.conversation_id(), "recall budget exhausted");
            self.metrics.recall(RecallResult::BudgetExhausted);
            return RecallOutcome::default();
        }

        let now = now_millis();
        if let Some(hit) = session.cached(query, now) {
            self.metrics.recall(RecallResult::Cached);
            return RecallOutcome {
                tokens: hit.context.as_deref().map(limbic_core::estimate_tokens).unwrap_or(0),
                context: hit.context.clone(),
                bleed: hit.bleed,
                cached: true,
                ..RecallOutcome::default()
            };
        }

        let results = match self.search(query, opts, session.injected()).await {
            Ok(results) => results,
            Err(e) => {
                warn!(conversation = ?session.conversation_id(), error = %e, "recall failed");
                self.metrics.error("recall");
                self.metrics.recall(RecallResult::Failed);
                return RecallOutcome::default();
            }
        };

        let caps = SnippetCaps::from(&self.config.recall);
        let Some(formatted) = format_context(&results.memories, caps, session.remaining_tokens())
        else {
            self.metrics.recall(RecallResult::Empty);
            session.store_cache(query, None, AffectDelta::default(), now);
            return RecallOutcome {
                scanned: results.scanned,
                candidate_count: results.candidate_count,
                ..RecallOutcome::default()
            };
        };

        session.record_injection(&formatted.included, formatted.tokens);
        let included: HashSet<&TurnId> = formatted.included.iter().collect();
        let memories: Vec<RecalledTurn> = results
            .memories
            .into_iter()
            .filter(|m| included.contains(&m.turn_id))
            .collect();
        let affect = &self.config.affect;
        let bleed = recall_bleed(current, &memories, affect.bleed_factor, affect.max_bleed);
        session.store_cache(query, Some(formatted.text.clone()), bleed, now);

        debug!(
            conversation = ?session.conversation_id(),
            surfaced = memories.len(),
            tokens = formatted.tokens,
            "recall surfaced memories"
        );
        self.metrics.recall(RecallResult::Hit);
        RecallOutcome {
            context: Some(formatted.text),
            memories,
            scanned: results.scanned,
            candidate_count: results.candidate_count,
            tokens: formatted.tokens,
            bleed,
            cached: false,
        }
    }
}
