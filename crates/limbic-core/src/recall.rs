//! Storage-independent recall tiers: entry-point selection, bounded graph
//! traversal, turn grouping and ranking, and context formatting.
//!
//! The store supplies a [`GraphSource`]; everything here works on node
//! metadata and summaries, never on full text.

use std::cmp::Ordering;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::affect::{AffectDelta, AffectVector, bleed};
use crate::config::RecallConfig;
use crate::time::{MS_PER_DAY, millis_to_minute};
use crate::tokenizer::{estimate_tokens, summarize};
use crate::turn::{Layer, TurnId};

pub const RECALL_OPEN: &str = "<limbic-recall>";
pub const RECALL_CLOSE: &str = "</limbic-recall>";

/// Summary-level view of a node: enough to rank without loading text.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeMeta {
    pub id: Uuid,
    pub turn_id: TurnId,
    pub layer: Layer,
    pub timestamp_ms: i64,
    pub affect: Option<AffectVector>,
    pub novelty_score: f64,
}

/// Restrictions on which nodes may seed a recall.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecallFilters {
    pub conversation_id: Option<String>,
    pub speaker: Option<String>,
    /// Unix millis; older nodes are skipped.
    pub since_ms: Option<i64>,
}

impl RecallFilters {
    /// Tighten `since_ms` to the configured window ending at `now_ms`.
    pub fn within_days(mut self, days: u64, now_ms: i64) -> Self {
        if days == 0 {
            return self;
        }
        let span = i64::try_from(days).map_or(i64::MAX, |d| d.saturating_mul(MS_PER_DAY));
        let cutoff = now_ms.saturating_sub(span);
        self.since_ms = Some(self.since_ms.map_or(cutoff, |s| s.max(cutoff)));
        self
    }
}

/// A node that matched the query directly.
#[derive(Clone, Debug, PartialEq)]
pub struct EntryPoint {
    pub node: NodeMeta,
    /// Number of distinct query terms found in the node.
    pub matches: usize,
}

/// Edge expansion, one call per BFS layer.
pub trait GraphSource {
    type Error;

    /// Neighbours of every frontier node along edges in either direction,
    /// as `(frontier node, neighbour)`.
    fn expand(&self, frontier: &[Uuid]) -> Result<Vec<(Uuid, NodeMeta)>, Self::Error>;
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TraversalLimits {
    pub depth: usize,
    pub hop_decay: f64,
    pub max_visited: usize,
}

impl From<&RecallConfig> for TraversalLimits {
    fn from(cfg: &RecallConfig) -> Self {
        Self {
            depth: cfg.traverse_depth,
            hop_decay: cfg.hop_decay,
            max_visited: cfg.max_visited,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Visited {
    pub node: NodeMeta,
    pub score: f64,
    pub hops: usize,
}

/// Keep the `max` best entry points: most matched terms first, newest first
/// among ties.
pub fn select_entry_points(mut candidates: Vec<EntryPoint>, max: usize) -> Vec<EntryPoint> {
    candidates.sort_by(|a, b| {
        b.matches
            .cmp(&a.matches)
            .then(b.node.timestamp_ms.cmp(&a.node.timestamp_ms))
            .then(a.node.id.cmp(&b.node.id))
    });
    candidates.truncate(max);
    candidates
}

/// Breadth-first expansion from the entry points.
///
/// Seeds score `matches / term_count`; each hop multiplies by `hop_decay`.
/// A node keeps the best score it was reached with and is expanded once.
/// No more than `max_visited` nodes are ever admitted.
pub fn traverse<G: GraphSource>(
    graph: &G,
    seeds: &[EntryPoint],
    term_count: usize,
    limits: TraversalLimits,
) -> Result<Vec<Visited>, G::Error> {
    let terms = term_count.max(1) as f64;
    let mut visited: HashMap<Uuid, Visited> = HashMap::new();
    let mut frontier = Vec::new();

    for seed in seeds {
        if visited.len() >= limits.max_visited {
            break;
        }
        let score = (seed.matches as f64 / terms).min(1.0);
        if visited.contains_key(&seed.node.id) {
            continue;
        }
        visited.insert(
            seed.node.id,
            Visited {
                node: seed.node.clone(),
                score,
                hops: 0,
            },
        );
        frontier.push(seed.node.id);
    }

    for hop in 1..=limits.depth {
        if frontier.is_empty() || visited.len() >= limits.max_visited {
            break;
        }
        frontier.sort();
        let mut edges = graph.expand(&frontier)?;
        edges.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.id.cmp(&b.1.id)));

        let mut next = Vec::new();
        for (from, neighbour) in edges {
            let Some(parent) = visited.get(&from) else {
                continue;
            };
            let score = parent.score * limits.hop_decay;
            match visited.get_mut(&neighbour.id) {
                Some(existing) => {
                    if score > existing.score {
                        existing.score = score;
                    }
                }
                None => {
                    if visited.len() >= limits.max_visited {
                        continue;
                    }
                    next.push(neighbour.id);
                    visited.insert(
                        neighbour.id,
                        Visited {
                            node: neighbour,
                            score,
                            hops: hop,
                        },
                    );
                }
            }
        }
        frontier = next;
    }

    let mut out: Vec<Visited> = visited.into_values().collect();
    out.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then(a.node.id.cmp(&b.node.id))
    });
    Ok(out)
}

/// One turn competing for a recall slot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TurnCandidate {
    pub turn_id: TurnId,
    pub score: f64,
    pub timestamp_ms: i64,
    pub affect: Option<AffectVector>,
    pub novelty_score: f64,
    pub nodes: usize,
}

/// Collapse visited nodes onto their turns. A turn scores as its best node,
/// weighted by the novelty recorded at capture:
/// `best * (1 - w + w * novelty)`.
pub fn group_by_turn(visited: &[Visited], novelty_weight: f64) -> Vec<TurnCandidate> {
    let mut turns: HashMap<&TurnId, TurnCandidate> = HashMap::new();
    for v in visited {
        let entry = turns
            .entry(&v.node.turn_id)
            .or_insert_with(|| TurnCandidate {
                turn_id: v.node.turn_id.clone(),
                score: 0.0,
                timestamp_ms: v.node.timestamp_ms,
                affect: None,
                novelty_score: v.node.novelty_score,
                nodes: 0,
            });
        entry.score = entry.score.max(v.score);
        entry.timestamp_ms = entry.timestamp_ms.max(v.node.timestamp_ms);
        entry.novelty_score = entry.novelty_score.max(v.node.novelty_score);
        if entry.affect.is_none() {
            entry.affect = v.node.affect;
        }
        entry.nodes += 1;
    }

    let mut out: Vec<TurnCandidate> = turns
        .into_values()
        .map(|mut t| {
            t.score *= 1.0 - novelty_weight + novelty_weight * t.novelty_score.clamp(0.0, 1.0);
            t
        })
        .collect();
    rank_turns(&mut out);
    out
}

/// Score descending, then newest first.
pub fn rank_turns(turns: &mut [TurnCandidate]) {
    turns.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then(b.timestamp_ms.cmp(&a.timestamp_ms))
            .then(a.turn_id.cmp(&b.turn_id))
    });
}

/// Fold semantic similarity into candidates that have one:
/// `(1 - w) * score + w * similarity`. Others keep their text score.
pub fn blend_similarity(
    turns: &mut [TurnCandidate],
    similarity: &HashMap<TurnId, f64>,
    weight: f64,
) {
    for t in turns.iter_mut() {
        if let Some(sim) = similarity.get(&t.turn_id) {
            t.score = (1.0 - weight) * t.score + weight * sim.clamp(0.0, 1.0);
        }
    }
    rank_turns(turns);
}

/// A fully reconstructed turn, the only place full text is loaded.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecalledTurn {
    pub turn_id: TurnId,
    pub timestamp_ms: i64,
    pub speaker: String,
    pub input: String,
    pub deliberation: String,
    pub output: String,
    pub affect: Option<AffectVector>,
    pub novelty_score: f64,
    pub score: f64,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SnippetCaps {
    pub input: usize,
    pub deliberation: usize,
    pub output: usize,
}

impl From<&RecallConfig> for SnippetCaps {
    fn from(cfg: &RecallConfig) -> Self {
        Self {
            input: cfg.snippet_input_chars,
            deliberation: cfg.snippet_deliberation_chars,
            output: cfg.snippet_output_chars,
        }
    }
}

/// `[YYYY-MM-DD HH:MM] speaker: In: ... | Think: ... | Out: ...`
pub fn format_turn(turn: &RecalledTurn, caps: SnippetCaps) -> String {
    let mut line = format!(
        "[{}] {}: In: {}",
        millis_to_minute(turn.timestamp_ms),
        turn.speaker,
        summarize(&turn.input, caps.input)
    );
    if !turn.deliberation.trim().is_empty() {
        line.push_str(" | Think: ");
        line.push_str(&summarize(&turn.deliberation, caps.deliberation));
    }
    line.push_str(" | Out: ");
    line.push_str(&summarize(&turn.output, caps.output));
    line
}

#[derive(Clone, Debug, PartialEq)]
pub struct FormattedContext {
    pub text: String,
    pub tokens: usize,
    pub included: Vec<TurnId>,
}

/// Wrap the best turns in recall markers, dropping lower-ranked turns that
/// would overflow `token_limit`. `None` when not even one fits.
pub fn format_context(
    turns: &[RecalledTurn],
    caps: SnippetCaps,
    token_limit: usize,
) -> Option<FormattedContext> {
    let frame = estimate_tokens(RECALL_OPEN) + estimate_tokens(RECALL_CLOSE) + 1;
    let mut used = frame;
    let mut lines = Vec::new();
    let mut included = Vec::new();

    for turn in turns {
        let line = format_turn(turn, caps);
        let cost = estimate_tokens(&line) + 1;
        if used + cost > token_limit {
            continue;
        }
        used += cost;
        lines.push(line);
        included.push(turn.turn_id.clone());
    }

    if lines.is_empty() {
        return None;
    }
    let text = format!("{RECALL_OPEN}\n{}\n{RECALL_CLOSE}", lines.join("\n"));
    Some(FormattedContext {
        tokens: estimate_tokens(&text),
        text,
        included,
    })
}

/// Affect nudge caused by surfacing these turns.
pub fn recall_bleed(
    current: &AffectVector,
    turns: &[RecalledTurn],
    bleed_factor: f64,
    max_bleed: f64,
) -> AffectDelta {
    let recalled: Vec<AffectVector> = turns.iter().filter_map(|t| t.affect).collect();
    bleed(current, &recalled, bleed_factor, max_bleed)
}
