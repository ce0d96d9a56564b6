//! Limbic: emotionally weighted conversational memory.
//!
//! Captures each turn as three linked layers (input, deliberation, output),
//! binds a seven-dimensional affect vector to it, gates persistence with a
//! novelty score, and ranks past turns for recall.
//!
//! Zero I/O: persistence lives in `limbic-store`, orchestration in
//! `limbic-engine`.

pub mod affect;
pub mod archetype;
pub mod config;
pub mod filter;
pub mod lexicon;
pub mod novelty;
pub mod recall;
pub mod session;
pub mod time;
pub mod tokenizer;
pub mod transcript;
pub mod turn;

pub use affect::{AFFECT_DIMS, Affect, AffectDelta, AffectDynamics, AffectVector, DEFAULT_BASELINE};
pub use archetype::archetype_baseline;
pub use config::{
    AffectConfig, AffectScopeMode, CaptureConfig, Config, ConfigWarning, EmbeddingConfig,
    RecallConfig, RetryConfig, StorageConfig,
};
pub use filter::{NoiseFilter, RejectReason};
pub use lexicon::{AffectDetector, DetectedAffect, LexiconDetector};
pub use novelty::{CaptureDecision, NoveltyScorer};
pub use recall::{
    EntryPoint, FormattedContext, GraphSource, NodeMeta, RecallFilters, RecalledTurn, SnippetCaps,
    TraversalLimits, TurnCandidate, Visited,
};
pub use session::{CachedRecall, RecallSession, SessionStats};
pub use time::{millis_to_iso8601, now_millis};
pub use tokenizer::{estimate_tokens, query_terms, summarize, tokenize};
pub use transcript::{
    ContentBlock, InputCleaner, Message, MessageContent, Role, TranscriptError, TurnLayers,
    extract_layers, parse_transcript,
};
pub use turn::{
    Layer, MemoryEdge, MemoryNode, MemoryTurn, NodeDraft, Relation, TURN_EDGES, TurnContext,
    TurnId, TurnRecord,
};
