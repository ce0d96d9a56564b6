use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::affect::AffectVector;
use crate::config::CaptureConfig;
use crate::tokenizer::{summarize, truncate_chars};
use crate::transcript::TurnLayers;

/// Speaker recorded on agent-authored layers.
pub const SELF_SPEAKER: &str = "self";

/// Role a node plays within its turn.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layer {
    Input,
    Deliberation,
    Output,
}

impl Layer {
    pub const ALL: [Layer; 3] = [Layer::Input, Layer::Deliberation, Layer::Output];

    pub fn as_str(self) -> &'static str {
        match self {
            Layer::Input => "input",
            Layer::Deliberation => "deliberation",
            Layer::Output => "output",
        }
    }

    /// Parse a stored layer name. Older stores called deliberation "contemplation".
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "input" => Some(Layer::Input),
            "deliberation" | "contemplation" => Some(Layer::Deliberation),
            "output" => Some(Layer::Output),
            _ => None,
        }
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fixed edge label between two layers of the same turn.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Relation {
    Triggered,
    Produced,
    RespondedTo,
}

impl Relation {
    pub fn as_str(self) -> &'static str {
        match self {
            Relation::Triggered => "triggered",
            Relation::Produced => "produced",
            Relation::RespondedTo => "responded_to",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "triggered" => Some(Relation::Triggered),
            "produced" => Some(Relation::Produced),
            "responded_to" => Some(Relation::RespondedTo),
            _ => None,
        }
    }
}

/// The three edges written with every turn: source layer, target layer, label.
pub const TURN_EDGES: [(Layer, Layer, Relation); 3] = [
    (Layer::Input, Layer::Deliberation, Relation::Triggered),
    (Layer::Deliberation, Layer::Output, Relation::Produced),
    (Layer::Output, Layer::Input, Relation::RespondedTo),
];

/// `turn_<unix-millis>_<8 hex>`. The random suffix keeps ids unique when
/// several turns land in the same millisecond.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TurnId(String);

impl TurnId {
    pub fn generate(now_ms: i64, rng: &mut impl Rng) -> Self {
        Self(format!("turn_{now_ms}_{:08x}", rng.random::<u32>()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Millisecond timestamp embedded in the id, if it has the usual shape.
    pub fn timestamp_ms(&self) -> Option<i64> {
        self.0.strip_prefix("turn_")?.split('_').next()?.parse().ok()
    }
}

impl From<String> for TurnId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for TurnId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for TurnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Who is talking and where, supplied by the host with every call.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnContext {
    pub identity: String,
    pub conversation_id: Option<String>,
    pub session_id: Option<String>,
}

impl TurnContext {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            ..Default::default()
        }
    }

    pub fn with_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }
}

/// One layer's content ready to be written.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeDraft {
    pub text: String,
    pub summary: String,
    pub speaker: String,
}

/// Everything needed to persist one accepted turn.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TurnRecord {
    pub turn_id: TurnId,
    pub timestamp_ms: i64,
    pub identity: String,
    pub conversation_id: Option<String>,
    pub session_id: Option<String>,
    pub affect: Option<AffectVector>,
    pub novelty_score: f64,
    pub input: NodeDraft,
    pub deliberation: NodeDraft,
    pub output: NodeDraft,
}

impl TurnRecord {
    /// Apply the text and summary caps and assign a fresh turn id.
    pub fn build(
        layers: &TurnLayers,
        ctx: &TurnContext,
        affect: Option<AffectVector>,
        novelty_score: f64,
        cfg: &CaptureConfig,
        now_ms: i64,
        rng: &mut impl Rng,
    ) -> Self {
        let draft = |text: &str, summary_cap: usize, speaker: &str| {
            let text = truncate_chars(text, cfg.max_text_chars).to_string();
            NodeDraft {
                summary: summarize(&text, summary_cap),
                text,
                speaker: speaker.to_string(),
            }
        };
        let input_speaker = layers
            .speaker
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or(&ctx.identity);

        Self {
            turn_id: TurnId::generate(now_ms, rng),
            timestamp_ms: now_ms,
            identity: ctx.identity.clone(),
            conversation_id: ctx.conversation_id.clone(),
            session_id: ctx.session_id.clone(),
            affect,
            novelty_score,
            input: draft(&layers.input, cfg.input_summary_chars, input_speaker),
            deliberation: draft(
                &layers.deliberation,
                cfg.deliberation_summary_chars,
                SELF_SPEAKER,
            ),
            output: draft(&layers.output, cfg.output_summary_chars, SELF_SPEAKER),
        }
    }

    pub fn layer(&self, layer: Layer) -> &NodeDraft {
        match layer {
            Layer::Input => &self.input,
            Layer::Deliberation => &self.deliberation,
            Layer::Output => &self.output,
        }
    }
}

/// A persisted node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MemoryNode {
    pub id: Uuid,
    pub timestamp_ms: i64,
    pub layer: Layer,
    pub text: String,
    pub summary: String,
    pub speaker: String,
    pub affect: Option<AffectVector>,
    pub turn_id: TurnId,
    pub conversation_id: Option<String>,
    pub session_id: Option<String>,
    pub novelty_score: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MemoryEdge {
    pub source: Uuid,
    pub target: Uuid,
    pub relation: Relation,
    pub weight: f64,
}

/// Grouping record of one turn's nodes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MemoryTurn {
    pub turn_id: TurnId,
    pub input_node: Uuid,
    pub deliberation_node: Option<Uuid>,
    pub output_node: Uuid,
    pub timestamp_ms: i64,
    pub affect: Option<AffectVector>,
}

impl MemoryTurn {
    /// Node id of `layer`, if the turn has one.
    pub fn node(&self, layer: Layer) -> Option<Uuid> {
        match layer {
            Layer::Input => Some(self.input_node),
            Layer::Deliberation => self.deliberation_node,
            Layer::Output => Some(self.output_node),
        }
    }

    /// The [`TURN_EDGES`] cycle over this turn's nodes. Edges touching a
    /// missing layer are skipped.
    pub fn edges(&self) -> Vec<MemoryEdge> {
        TURN_EDGES
            .iter()
            .filter_map(|&(from, to, relation)| {
                Some(MemoryEdge {
                    source: self.node(from)?,
                    target: self.node(to)?,
                    relation,
                    weight: 1.0,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::SmallRng;

    fn layers() -> TurnLayers {
        TurnLayers {
            input: "hello there, how are you doing today?".into(),
            deliberation: "x".repeat(500),
            output: "I am doing well, thanks for asking.".into(),
            speaker: Some("alice".into()),
        }
    }

    #[test]
    fn test_turn_id_shape() {
        let mut rng = SmallRng::seed_from_u64(7);
        let id = TurnId::generate(1_700_000_000_123, &mut rng);
        assert!(id.as_str().starts_with("turn_1700000000123_"));
        assert_eq!(id.as_str().len(), "turn_1700000000123_".len() + 8);
        assert_eq!(id.timestamp_ms(), Some(1_700_000_000_123));
    }

    #[test]
    fn test_turn_ids_unique_within_millisecond() {
        let mut rng = SmallRng::seed_from_u64(1);
        let ids: std::collections::HashSet<_> =
            (0..1000).map(|_| TurnId::generate(42, &mut rng)).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn test_layer_parse_legacy() {
        assert_eq!(Layer::parse("contemplation"), Some(Layer::Deliberation));
        assert_eq!(Layer::parse("output"), Some(Layer::Output));
        assert_eq!(Layer::parse("dream"), None);
    }

    #[test]
    fn test_turn_edges_form_cycle() {
        for (i, (_, to, _)) in TURN_EDGES.iter().enumerate() {
            assert_eq!(*to, TURN_EDGES[(i + 1) % 3].0);
        }
    }

    #[test]
    fn test_memory_turn_edges() {
        let mut turn = MemoryTurn {
            turn_id: TurnId::from("t1"),
            input_node: Uuid::from_u128(1),
            deliberation_node: Some(Uuid::from_u128(2)),
            output_node: Uuid::from_u128(3),
            timestamp_ms: 0,
            affect: None,
        };
        let edges = turn.edges();
        assert_eq!(edges.len(), 3);
        assert_eq!(edges[0].source, Uuid::from_u128(1));
        assert_eq!(edges[0].target, Uuid::from_u128(2));
        assert_eq!(edges[0].relation, Relation::Triggered);
        assert!(edges.iter().all(|e| e.weight == 1.0));

        turn.deliberation_node = None;
        let edges = turn.edges();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].relation, Relation::RespondedTo);
    }

    #[test]
    fn test_build_applies_caps_and_speakers() {
        let cfg = CaptureConfig {
            max_text_chars: 100,
            ..Default::default()
        };
        let ctx = TurnContext::new("agent").with_conversation("c1");
        let mut rng = SmallRng::seed_from_u64(3);
        let record = TurnRecord::build(&layers(), &ctx, None, 0.6, &cfg, 1000, &mut rng);

        assert_eq!(record.deliberation.text.chars().count(), 100);
        assert!(record.deliberation.summary.chars().count() <= cfg.deliberation_summary_chars);
        assert!(record.deliberation.summary.ends_with("..."));
        assert_eq!(record.input.speaker, "alice");
        assert_eq!(record.output.speaker, SELF_SPEAKER);
        assert_eq!(record.conversation_id.as_deref(), Some("c1"));
        assert_eq!(record.timestamp_ms, 1000);
    }

    #[test]
    fn test_build_defaults_speaker_to_identity() {
        let mut l = layers();
        l.speaker = None;
        let mut rng = SmallRng::seed_from_u64(3);
        let record = TurnRecord::build(
            &l,
            &TurnContext::new("agent"),
            None,
            0.5,
            &CaptureConfig::default(),
            1,
            &mut rng,
        );
        assert_eq!(record.input.speaker, "agent");
    }
}
