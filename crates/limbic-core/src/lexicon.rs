//! Affect detection collaborator and a keyword-lexicon implementation.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::affect::{AFFECT_DIMS, Affect, AffectVector};
use crate::tokenizer::tokenize;

/// Named affect weights plus an overall intensity.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectedAffect {
    pub weights: AffectVector,
    pub intensity: f64,
}

impl DetectedAffect {
    pub fn none() -> Self {
        Self {
            weights: AffectVector::zeros(),
            intensity: 0.0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.intensity <= 0.0
    }
}

/// Maps raw text to affect weights. Must be deterministic.
pub trait AffectDetector: Send + Sync {
    fn detect(&self, text: &str) -> DetectedAffect;
}

/// Per-match weight before clamping.
const WEIGHT_PER_HIT: f64 = 0.3;

const LEXICON: &[(Affect, &[&str])] = &[
    (
        Affect::Play,
        &[
            "happy", "fun", "joy", "laugh", "haha", "lol", "excited", "yay", "delighted",
            "amused", "hilarious",
        ],
    ),
    (
        Affect::Care,
        &[
            "love", "care", "thank", "thanks", "appreciate", "grateful", "kind", "help",
            "trust", "compassion",
        ],
    ),
    (
        Affect::Seeking,
        &[
            "curious", "wonder", "interesting", "learn", "explore", "fascinating", "hope",
            "discover", "idea",
        ],
    ),
    (
        Affect::Rage,
        &[
            "angry", "mad", "rage", "furious", "hate", "damn", "stupid", "annoyed", "frustrated",
            "frustrating",
        ],
    ),
    (
        Affect::Fear,
        &[
            "afraid", "scared", "worry", "worried", "anxious", "nervous", "fear", "terrified",
            "terrifies", "dread", "frightening",
        ],
    ),
    (
        Affect::Panic,
        &[
            "sad", "depressed", "lonely", "grief", "loss", "cry", "miss", "alone", "hopeless",
            "abandoned",
        ],
    ),
    (
        Affect::Lust,
        &["desire", "want", "crave", "passion", "attractive", "longing"],
    ),
];

/// Keyword matcher over whole tokens. Weight per affect is
/// `min(1, hits * 0.3)`; intensity is the strongest weight.
#[derive(Debug, Clone, Default)]
pub struct LexiconDetector;

impl AffectDetector for LexiconDetector {
    fn detect(&self, text: &str) -> DetectedAffect {
        let words: HashSet<String> = tokenize(text).into_iter().collect();
        if words.is_empty() {
            return DetectedAffect::none();
        }
        let mut values = [0.0; AFFECT_DIMS];
        for (affect, keywords) in LEXICON {
            let hits = keywords.iter().filter(|k| words.contains(**k)).count();
            values[affect.index()] = (hits as f64 * WEIGHT_PER_HIT).min(1.0);
        }
        let weights = AffectVector::new(values);
        DetectedAffect {
            intensity: weights.max(),
            weights,
        }
    }
}
