//! Process-local counters for capture and recall outcomes.
//!
//! Each engine owns its own [`Registry`] so several engines (tests, multiple
//! data directories) never collide on metric names.

use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use serde::Serialize;

use limbic_core::RejectReason;

use crate::error::Result;

pub struct EngineMetrics {
    registry: Registry,
    processed: IntCounter,
    stored: IntCounter,
    filtered: IntCounterVec,
    skipped: IntCounter,
    errors: IntCounterVec,
    fallback: IntCounter,
    recalls: IntCounterVec,
    affect_stale: IntCounter,
}

/// Point-in-time copy of the counters, for health output.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub processed: u64,
    pub stored: u64,
    pub filtered: u64,
    pub skipped: u64,
    pub errored: u64,
    pub fallback: u64,
    pub recalls: u64,
    pub affect_stale: u64,
}

/// Operations whose soft failures are counted.
pub const ERROR_OPS: [&str; 6] = ["affect", "write", "fallback", "embed", "recall", "replay"];

/// Recall result classes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecallResult {
    Hit,
    Empty,
    Cached,
    BudgetExhausted,
    Failed,
}

impl RecallResult {
    pub const ALL: [RecallResult; 5] = [
        RecallResult::Hit,
        RecallResult::Empty,
        RecallResult::Cached,
        RecallResult::BudgetExhausted,
        RecallResult::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RecallResult::Hit => "hit",
            RecallResult::Empty => "empty",
            RecallResult::Cached => "cached",
            RecallResult::BudgetExhausted => "budget_exhausted",
            RecallResult::Failed => "failed",
        }
    }
}

impl EngineMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new_custom(Some("limbic".into()), None)?;

        let processed = IntCounter::new("turns_processed_total", "Turns handed to capture")?;
        let stored = IntCounter::new("turns_stored_total", "Turns committed to the store")?;
        let filtered = IntCounterVec::new(
            Opts::new("turns_filtered_total", "Turns rejected before storage"),
            &["reason"],
        )?;
        let skipped = IntCounter::new("turns_skipped_total", "Transcripts that failed validation")?;
        let errors = IntCounterVec::new(
            Opts::new("errors_total", "Soft failures by operation"),
            &["op"],
        )?;
        let fallback = IntCounter::new(
            "fallback_writes_total",
            "Turns routed to the fallback log",
        )?;
        let recalls = IntCounterVec::new(
            Opts::new("recalls_total", "Recall calls by result"),
            &["result"],
        )?;
        let affect_stale = IntCounter::new(
            "affect_stale_total",
            "Affect updates abandoned after conflict retries",
        )?;

        registry.register(Box::new(processed.clone()))?;
        registry.register(Box::new(stored.clone()))?;
        registry.register(Box::new(filtered.clone()))?;
        registry.register(Box::new(skipped.clone()))?;
        registry.register(Box::new(errors.clone()))?;
        registry.register(Box::new(fallback.clone()))?;
        registry.register(Box::new(recalls.clone()))?;
        registry.register(Box::new(affect_stale.clone()))?;

        // Touch every label so zero counts still render.
        for reason in RejectReason::ALL {
            filtered.with_label_values(&[reason.as_str()]);
        }
        for result in RecallResult::ALL {
            recalls.with_label_values(&[result.as_str()]);
        }
        for op in ERROR_OPS {
            errors.with_label_values(&[op]);
        }

        Ok(Self {
            registry,
            processed,
            stored,
            filtered,
            skipped,
            errors,
            fallback,
            recalls,
            affect_stale,
        })
    }

    pub fn processed(&self) {
        self.processed.inc();
    }

    pub fn stored(&self) {
        self.stored.inc();
    }

    pub fn filtered(&self, reason: RejectReason) {
        self.filtered.with_label_values(&[reason.as_str()]).inc();
    }

    pub fn skipped(&self) {
        self.skipped.inc();
    }

    /// `op` should be one of [`ERROR_OPS`]; others are counted but left out
    /// of the snapshot total.
    pub fn error(&self, op: &str) {
        self.errors.with_label_values(&[op]).inc();
    }

    pub fn fallback(&self) {
        self.fallback.inc();
    }

    pub fn recall(&self, result: RecallResult) {
        self.recalls.with_label_values(&[result.as_str()]).inc();
    }

    pub fn affect_stale(&self) {
        self.affect_stale.inc();
    }

    pub fn filtered_count(&self, reason: RejectReason) -> u64 {
        self.filtered.with_label_values(&[reason.as_str()]).get()
    }

    pub fn recall_count(&self, result: RecallResult) -> u64 {
        self.recalls.with_label_values(&[result.as_str()]).get()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            processed: self.processed.get(),
            stored: self.stored.get(),
            filtered: sum_labels(&self.filtered, RejectReason::ALL.map(RejectReason::as_str)),
            skipped: self.skipped.get(),
            errored: sum_labels(&self.errors, ERROR_OPS),
            fallback: self.fallback.get(),
            recalls: sum_labels(&self.recalls, RecallResult::ALL.map(RecallResult::as_str)),
            affect_stale: self.affect_stale.get(),
        }
    }

    /// Prometheus text exposition format.
    pub fn render(&self) -> Result<String> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        String::from_utf8(buf).map_err(|e| crate::error::EngineError::Metrics(e.to_string()))
    }
}

fn sum_labels<'a>(vec: &IntCounterVec, labels: impl IntoIterator<Item = &'a str>) -> u64 {
    labels
        .into_iter()
        .map(|label| vec.with_label_values(&[label]).get())
        .sum()
}
