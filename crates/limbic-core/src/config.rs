//! Typed configuration surface.
//!
//! Built once at startup and passed by reference. Every section is
//! `#[serde(default)]`, so a partial TOML file only overrides what it names.
//! [`Config::validated`] replaces out-of-range values with their defaults and
//! reports what it changed instead of failing.

use std::fmt;

use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::affect::{AFFECT_DIMS, AffectDynamics, AffectVector};
use crate::archetype::{archetype_baseline, archetype_names};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub affect: AffectConfig,
    pub recall: RecallConfig,
    pub storage: StorageConfig,
    pub embedding: EmbeddingConfig,
}

// ---------------------------------------------------------------------------
// Capture
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct CaptureConfig {
    /// Turns scoring below this are not persisted.
    pub min_threshold: f64,
    /// Multiplier on `max(affect) - min(affect)`.
    pub affect_variance_weight: f64,
    /// Subtracted when both input and output are short.
    pub routine_penalty: f64,
    /// Added when deliberation is long.
    pub thinking_boost: f64,
    /// Subtracted when the input summary matches `monotonous_patterns`.
    pub monotonous_penalty: f64,
    pub routine_input_chars: usize,
    pub routine_output_chars: usize,
    pub thinking_chars: usize,
    /// Input plus output shorter than this is rejected as a short exchange.
    pub min_combined_length: usize,
    /// Deliberation at least this long rescues a short exchange.
    pub substantial_deliberation: usize,
    pub max_text_chars: usize,
    pub input_summary_chars: usize,
    pub deliberation_summary_chars: usize,
    pub output_summary_chars: usize,
    pub filters: FilterToggles,
    /// Exact-match acknowledgment vocabulary (case-insensitive, trailing
    /// punctuation ignored).
    pub acknowledgments: Vec<String>,
    /// Regexes matched against the input summary for the novelty penalty.
    pub monotonous_patterns: Vec<String>,
    /// Structural signatures of restarts, status pings, metadata and tool output.
    pub system_noise_patterns: Vec<String>,
    /// Host-specific formatting removed from every layer before filtering.
    pub strip_patterns: Vec<String>,
    /// Regex whose first capture group names the input speaker.
    pub speaker_pattern: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct FilterToggles {
    pub empty: bool,
    pub system_noise: bool,
    pub short_exchange: bool,
    pub monotonous: bool,
}

impl Default for FilterToggles {
    fn default() -> Self {
        Self {
            empty: true,
            system_noise: true,
            short_exchange: true,
            monotonous: true,
        }
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

pub const DEFAULT_ACKNOWLEDGMENTS: &[&str] = &[
    "ok", "okay", "k", "yes", "yep", "yeah", "no", "nope", "sure", "thanks", "thank you", "thx",
    "got it", "cool", "nice", "great", "done", "ping", "pong", "heartbeat", "heartbeat_ok",
    "no_reply",
];

pub const DEFAULT_MONOTONOUS_PATTERNS: &[&str] = &[
    r"(?i)^(ok|okay|k|yes|yep|yeah|no|nope|sure|thanks|thank you|thx|got it|cool|nice|great|done)\b",
    r"(?i)^(continue|go on|next|keep going|proceed)\b",
    r"(?i)^(hi|hello|hey|good (morning|evening|night))\b",
];

pub const DEFAULT_SYSTEM_NOISE_PATTERNS: &[&str] = &[
    r"^\s*HEARTBEAT(_OK)?\s*$",
    r"^\s*NO_REPLY\s*$",
    r"(?i)^\s*\[?system(\s+message)?\]?\s*:",
    r"(?i)\b(gateway|service|agent)\s+(restart(ed|ing)?|reload(ed|ing)?)\b",
    r"(?i)^\s*status\s*:\s*(ok|online|offline|running|idle)\b",
    r"(?i)^\s*\[?message_id:\s*\S+\]?\s*$",
    r"(?i)^\s*<tool_(result|output|use)\b",
    r"(?i)^\s*exit code:?\s*-?\d+\s*$",
    r#"^\s*\{\s*"(type|tool_use_id|tool_call_id)"\s*:"#,
];

pub const DEFAULT_STRIP_PATTERNS: &[&str] = &[
    r"(?m)\s*\[message_id:\s*[^\]]*\]\s*$",
    r"(?m)^\[(?:Telegram|Discord|Signal|SMS|Slack|WhatsApp)\b[^\]]*\]\s*",
    r"(?m)^\[(?:Mon|Tue|Wed|Thu|Fri|Sat|Sun)?\s*\d{4}-\d{2}-\d{2}[ T]\d{2}:\d{2}[^\]]*\]\s*",
];

pub const DEFAULT_SPEAKER_PATTERN: &str =
    r"\[(?:Telegram|Discord|Signal|SMS|Slack|WhatsApp)\s+(.+?)\s+id:";

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            min_threshold: 0.2,
            affect_variance_weight: 0.3,
            routine_penalty: 0.2,
            thinking_boost: 0.15,
            monotonous_penalty: 0.3,
            routine_input_chars: 20,
            routine_output_chars: 50,
            thinking_chars: 100,
            min_combined_length: 30,
            substantial_deliberation: 100,
            max_text_chars: 3000,
            input_summary_chars: 300,
            deliberation_summary_chars: 120,
            output_summary_chars: 200,
            filters: FilterToggles::default(),
            acknowledgments: strings(DEFAULT_ACKNOWLEDGMENTS),
            monotonous_patterns: strings(DEFAULT_MONOTONOUS_PATTERNS),
            system_noise_patterns: strings(DEFAULT_SYSTEM_NOISE_PATTERNS),
            strip_patterns: strings(DEFAULT_STRIP_PATTERNS),
            speaker_pattern: Some(DEFAULT_SPEAKER_PATTERN.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Affect
// ---------------------------------------------------------------------------

/// Whether affect state is shared across conversations or kept per conversation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum AffectScopeMode {
    #[default]
    Shared,
    Conversation,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct AffectConfig {
    /// Named archetype baseline (guardian, explorer, sage, ...).
    pub archetype: Option<String>,
    /// Explicit baseline; wins over `archetype`.
    pub baseline: Option<[f64; AFFECT_DIMS]>,
    /// Per hour. 0.1 pulls roughly 10% of the way back each hour.
    pub decay_rate: f64,
    pub momentum: f64,
    pub blend_strength: f64,
    pub baseline_pull: f64,
    pub cross_affect: bool,
    pub bleed_factor: f64,
    /// Per-dimension cap on a single recall bleed.
    pub max_bleed: f64,
    pub scope: AffectScopeMode,
}

impl Default for AffectConfig {
    fn default() -> Self {
        Self {
            archetype: None,
            baseline: None,
            decay_rate: 0.1,
            momentum: 0.3,
            blend_strength: 0.8,
            baseline_pull: 0.02,
            cross_affect: false,
            bleed_factor: 0.1,
            max_bleed: 0.05,
            scope: AffectScopeMode::Shared,
        }
    }
}

impl AffectConfig {
    pub fn baseline(&self) -> AffectVector {
        if let Some(values) = self.baseline {
            return AffectVector::new(values);
        }
        self.archetype
            .as_deref()
            .and_then(archetype_baseline)
            .unwrap_or_default()
    }

    pub fn dynamics(&self) -> AffectDynamics {
        AffectDynamics {
            decay_rate: self.decay_rate,
            momentum: self.momentum,
            blend_strength: self.blend_strength,
            baseline_pull: self.baseline_pull,
            cross_affect: self.cross_affect,
        }
    }
}

// ---------------------------------------------------------------------------
// Recall
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct RecallConfig {
    pub max_results: usize,
    /// Entry points kept from the full-text tier.
    pub max_summaries: usize,
    pub traverse_depth: usize,
    /// Score multiplier per hop.
    pub hop_decay: f64,
    pub max_visited: usize,
    /// Estimated tokens of recalled context allowed per conversation.
    pub token_budget: usize,
    pub cache_cooldown_secs: u64,
    /// Entry points older than this are ignored. 0 disables the window.
    pub time_window_days: u64,
    /// Rows fetched per query term before ranking.
    pub candidates_per_term: usize,
    pub novelty_weight: f64,
    /// Share of the final score taken by embedding similarity when available.
    pub embedding_weight: f64,
    pub snippet_input_chars: usize,
    pub snippet_deliberation_chars: usize,
    pub snippet_output_chars: usize,
}

impl Default for RecallConfig {
    fn default() -> Self {
        Self {
            max_results: 5,
            max_summaries: 15,
            traverse_depth: 2,
            hop_decay: 0.7,
            max_visited: 500,
            token_budget: 3000,
            cache_cooldown_secs: 20,
            time_window_days: 90,
            candidates_per_term: 200,
            novelty_weight: 0.15,
            embedding_weight: 0.4,
            snippet_input_chars: 200,
            snippet_deliberation_chars: 120,
            snippet_output_chars: 200,
        }
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Fractional jitter applied to each delay, e.g. 0.25 = ±25%.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 50,
            max_delay_ms: 2000,
            multiplier: 2.0,
            jitter: 0.25,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct StorageConfig {
    pub busy_timeout_ms: u64,
    pub init_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub recall_timeout_ms: u64,
    pub queue_capacity: usize,
    pub retry: RetryConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5000,
            init_timeout_ms: 5000,
            write_timeout_ms: 10_000,
            recall_timeout_ms: 15_000,
            queue_capacity: 256,
            retry: RetryConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Embedding
// ---------------------------------------------------------------------------

/// Optional OpenAI-compatible embedding endpoint. Recall is text-only when
/// `url` is unset.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Full URL of the `/embeddings` endpoint.
    pub url: Option<String>,
    pub model: String,
    /// Environment variable holding a bearer token, if the endpoint needs one.
    pub api_key_env: Option<String>,
    pub timeout_ms: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            url: None,
            model: "text-embedding-3-small".into(),
            api_key_env: None,
            timeout_ms: 3000,
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// A value that was rejected and replaced with its default.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigWarning {
    pub field: String,
    pub message: String,
}

impl fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Upper bound on `storage.retry.max_attempts`.
pub const MAX_RETRY_ATTEMPTS: u32 = 10;
/// Upper bound on `recall.cache_cooldown_secs`, one day.
pub const MAX_CACHE_COOLDOWN_SECS: u64 = 86_400;

struct Checker {
    warnings: Vec<ConfigWarning>,
}

impl Checker {
    fn warn(&mut self, field: &str, message: String) {
        self.warnings.push(ConfigWarning {
            field: field.to_string(),
            message,
        });
    }

    fn range(&mut self, field: &str, value: &mut f64, default: f64, lo: f64, hi: f64) {
        if !(value.is_finite() && *value >= lo && *value <= hi) {
            self.warn(
                field,
                format!("{value} outside [{lo}, {hi}], using default {default}"),
            );
            *value = default;
        }
    }

    fn unit(&mut self, field: &str, value: &mut f64, default: f64) {
        self.range(field, value, default, 0.0, 1.0);
    }

    fn positive<T: PartialOrd + Default + Copy + fmt::Display>(
        &mut self,
        field: &str,
        value: &mut T,
        default: T,
    ) {
        if *value <= T::default() {
            self.warn(field, format!("must be positive, using default {default}"));
            *value = default;
        }
    }

    fn at_most<T: PartialOrd + Copy + fmt::Display>(
        &mut self,
        field: &str,
        value: &mut T,
        default: T,
        hi: T,
    ) {
        if *value > hi {
            self.warn(field, format!("{value} above {hi}, using default {default}"));
            *value = default;
        }
    }

    fn patterns(&mut self, field: &str, patterns: &mut Vec<String>) {
        let mut kept = Vec::with_capacity(patterns.len());
        for p in patterns.drain(..) {
            match Regex::new(&p) {
                Ok(_) => kept.push(p),
                Err(e) => self.warn(field, format!("dropping invalid pattern {p:?}: {e}")),
            }
        }
        *patterns = kept;
    }
}

impl Config {
    /// Replace every invalid value with its documented default.
    pub fn validated(mut self) -> (Config, Vec<ConfigWarning>) {
        let mut c = Checker {
            warnings: Vec::new(),
        };
        let d = Config::default();

        let cap = &mut self.capture;
        let dc = &d.capture;
        c.unit("capture.min_threshold", &mut cap.min_threshold, dc.min_threshold);
        c.unit(
            "capture.affect_variance_weight",
            &mut cap.affect_variance_weight,
            dc.affect_variance_weight,
        );
        c.unit("capture.routine_penalty", &mut cap.routine_penalty, dc.routine_penalty);
        c.unit("capture.thinking_boost", &mut cap.thinking_boost, dc.thinking_boost);
        c.unit(
            "capture.monotonous_penalty",
            &mut cap.monotonous_penalty,
            dc.monotonous_penalty,
        );
        c.positive("capture.max_text_chars", &mut cap.max_text_chars, dc.max_text_chars);
        c.positive(
            "capture.input_summary_chars",
            &mut cap.input_summary_chars,
            dc.input_summary_chars,
        );
        c.positive(
            "capture.deliberation_summary_chars",
            &mut cap.deliberation_summary_chars,
            dc.deliberation_summary_chars,
        );
        c.positive(
            "capture.output_summary_chars",
            &mut cap.output_summary_chars,
            dc.output_summary_chars,
        );
        c.patterns("capture.monotonous_patterns", &mut cap.monotonous_patterns);
        c.patterns("capture.system_noise_patterns", &mut cap.system_noise_patterns);
        c.patterns("capture.strip_patterns", &mut cap.strip_patterns);
        if let Some(p) = &cap.speaker_pattern {
            if let Err(e) = Regex::new(p) {
                c.warn(
                    "capture.speaker_pattern",
                    format!("invalid pattern {p:?}: {e}, using default"),
                );
                cap.speaker_pattern = dc.speaker_pattern.clone();
            }
        }

        let aff = &mut self.affect;
        let da = &d.affect;
        if let Some(name) = aff.archetype.clone() {
            if archetype_baseline(&name).is_none() {
                let known: Vec<_> = archetype_names().collect();
                c.warn(
                    "affect.archetype",
                    format!(
                        "unknown archetype {name:?}, expected one of {}; ignoring",
                        known.join(", ")
                    ),
                );
                aff.archetype = None;
            }
        }
        if let Some(values) = aff.baseline {
            if !values.iter().all(|v| v.is_finite() && (0.0..=1.0).contains(v)) {
                c.warn("affect.baseline", "components must lie in [0, 1], ignoring".into());
                aff.baseline = None;
            }
        }
        c.range("affect.decay_rate", &mut aff.decay_rate, da.decay_rate, 0.0, 100.0);
        // momentum of exactly 1 would freeze the state forever
        c.range("affect.momentum", &mut aff.momentum, da.momentum, 0.0, 0.999);
        c.unit("affect.blend_strength", &mut aff.blend_strength, da.blend_strength);
        c.unit("affect.baseline_pull", &mut aff.baseline_pull, da.baseline_pull);
        c.unit("affect.bleed_factor", &mut aff.bleed_factor, da.bleed_factor);
        c.unit("affect.max_bleed", &mut aff.max_bleed, da.max_bleed);
        if aff.max_bleed > da.max_bleed {
            c.warn(
                "affect.max_bleed",
                format!("{} above {}, capping", aff.max_bleed, da.max_bleed),
            );
            aff.max_bleed = da.max_bleed;
        }

        let rec = &mut self.recall;
        let dr = &d.recall;
        c.positive("recall.max_results", &mut rec.max_results, dr.max_results);
        c.positive("recall.max_summaries", &mut rec.max_summaries, dr.max_summaries);
        c.positive("recall.max_visited", &mut rec.max_visited, dr.max_visited);
        c.positive("recall.token_budget", &mut rec.token_budget, dr.token_budget);
        c.positive(
            "recall.candidates_per_term",
            &mut rec.candidates_per_term,
            dr.candidates_per_term,
        );
        c.at_most(
            "recall.cache_cooldown_secs",
            &mut rec.cache_cooldown_secs,
            dr.cache_cooldown_secs,
            MAX_CACHE_COOLDOWN_SECS,
        );
        c.unit("recall.hop_decay", &mut rec.hop_decay, dr.hop_decay);
        c.unit("recall.novelty_weight", &mut rec.novelty_weight, dr.novelty_weight);
        c.unit("recall.embedding_weight", &mut rec.embedding_weight, dr.embedding_weight);

        let st = &mut self.storage;
        let ds = &d.storage;
        c.positive("storage.busy_timeout_ms", &mut st.busy_timeout_ms, ds.busy_timeout_ms);
        c.positive("storage.init_timeout_ms", &mut st.init_timeout_ms, ds.init_timeout_ms);
        c.positive("storage.write_timeout_ms", &mut st.write_timeout_ms, ds.write_timeout_ms);
        c.positive(
            "storage.recall_timeout_ms",
            &mut st.recall_timeout_ms,
            ds.recall_timeout_ms,
        );
        c.positive("storage.queue_capacity", &mut st.queue_capacity, ds.queue_capacity);
        c.positive(
            "storage.retry.max_attempts",
            &mut st.retry.max_attempts,
            ds.retry.max_attempts,
        );
        c.at_most(
            "storage.retry.max_attempts",
            &mut st.retry.max_attempts,
            ds.retry.max_attempts,
            MAX_RETRY_ATTEMPTS,
        );
        c.range(
            "storage.retry.multiplier",
            &mut st.retry.multiplier,
            ds.retry.multiplier,
            1.0,
            10.0,
        );
        c.unit("storage.retry.jitter", &mut st.retry.jitter, ds.retry.jitter);
        if st.retry.max_delay_ms < st.retry.initial_delay_ms {
            c.warn(
                "storage.retry.max_delay_ms",
                "below initial_delay_ms, using defaults".into(),
            );
            st.retry.initial_delay_ms = ds.retry.initial_delay_ms;
            st.retry.max_delay_ms = ds.retry.max_delay_ms;
        }

        let emb = &mut self.embedding;
        c.positive("embedding.timeout_ms", &mut emb.timeout_ms, d.embedding.timeout_ms);
        if emb.url.as_deref().is_some_and(|u| u.trim().is_empty()) {
            emb.url = None;
        }

        (self, c.warnings)
    }
}
