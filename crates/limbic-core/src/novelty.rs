//! Free-energy novelty scoring: decides whether a turn is worth keeping.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::affect::AffectVector;
use crate::config::CaptureConfig;
use crate::filter::{NoiseFilter, RejectReason};
use crate::tokenizer::summarize;

/// Starting point before any adjustment.
pub const BASE_SCORE: f64 = 0.5;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CaptureDecision {
    pub accept: bool,
    pub score: f64,
    pub reason: Option<RejectReason>,
}

impl CaptureDecision {
    fn rejected(reason: RejectReason, score: f64) -> Self {
        Self {
            accept: false,
            score,
            reason: Some(reason),
        }
    }
}

/// Pure and deterministic: identical inputs always give identical decisions.
#[derive(Debug, Clone)]
pub struct NoveltyScorer {
    filter: NoiseFilter,
    monotonous: Vec<Regex>,
    cfg: CaptureConfig,
}

impl NoveltyScorer {
    pub fn new(cfg: &CaptureConfig) -> Self {
        Self {
            filter: NoiseFilter::new(cfg),
            monotonous: cfg
                .monotonous_patterns
                .iter()
                .filter_map(|p| Regex::new(p).ok())
                .collect(),
            cfg: cfg.clone(),
        }
    }

    pub fn filter(&self) -> &NoiseFilter {
        &self.filter
    }

    /// Filters first, then the score gate.
    pub fn should_capture(
        &self,
        input: &str,
        deliberation: &str,
        output: &str,
        affect: Option<&AffectVector>,
    ) -> CaptureDecision {
        if let Some(reason) = self.filter.check(input, deliberation, output) {
            return CaptureDecision::rejected(reason, 0.0);
        }
        self.decide(self.score(input, deliberation, output, affect))
    }

    /// Threshold gate on an already computed score.
    pub fn decide(&self, score: f64) -> CaptureDecision {
        if score >= self.cfg.min_threshold {
            CaptureDecision {
                accept: true,
                score,
                reason: None,
            }
        } else {
            CaptureDecision::rejected(RejectReason::BelowThreshold, score)
        }
    }

    /// Novelty in [0, 1], ignoring the noise filters.
    pub fn score(
        &self,
        input: &str,
        deliberation: &str,
        output: &str,
        affect: Option<&AffectVector>,
    ) -> f64 {
        let cfg = &self.cfg;
        let (input, deliberation, output) = (input.trim(), deliberation.trim(), output.trim());
        let mut score = BASE_SCORE;

        if let Some(affect) = affect {
            score += cfg.affect_variance_weight * affect.spread();
        }

        if input.chars().count() < cfg.routine_input_chars
            && output.chars().count() < cfg.routine_output_chars
        {
            score -= cfg.routine_penalty;
        }

        if deliberation.chars().count() > cfg.thinking_chars {
            score += cfg.thinking_boost;
        }

        let summary = summarize(input, cfg.input_summary_chars);
        if self.monotonous.iter().any(|re| re.is_match(&summary)) {
            score -= cfg.monotonous_penalty;
        }

        score.clamp(0.0, 1.0)
    }
}
