//! Seven-dimensional affect vector and its dynamics.
//!
//! Dimensions follow Panksepp's primary affect systems, in fixed order:
//! SEEKING, RAGE, FEAR, LUST, CARE, PANIC, PLAY. Every operation here keeps
//! each component inside [0, 1].

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

pub const AFFECT_DIMS: usize = 7;

/// Resting state used when no archetype or explicit baseline is configured.
pub const DEFAULT_BASELINE: [f64; AFFECT_DIMS] = [0.5, 0.1, 0.1, 0.1, 0.5, 0.1, 0.4];

/// Level at which an affect starts suppressing its opposites.
pub const INTERACTION_THRESHOLD: f64 = 0.5;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Affect {
    Seeking,
    Rage,
    Fear,
    Lust,
    Care,
    Panic,
    Play,
}

impl Affect {
    pub const ALL: [Affect; AFFECT_DIMS] = [
        Affect::Seeking,
        Affect::Rage,
        Affect::Fear,
        Affect::Lust,
        Affect::Care,
        Affect::Panic,
        Affect::Play,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Affect::Seeking => "SEEKING",
            Affect::Rage => "RAGE",
            Affect::Fear => "FEAR",
            Affect::Lust => "LUST",
            Affect::Care => "CARE",
            Affect::Panic => "PANIC",
            Affect::Play => "PLAY",
        }
    }

    /// Case-insensitive lookup by dimension name.
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim();
        Self::ALL
            .into_iter()
            .find(|a| a.name().eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for Affect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn unit(v: f64) -> f64 {
    if v.is_nan() { 0.0 } else { v.clamp(0.0, 1.0) }
}

/// A point in affect space. Construction always clamps to [0, 1].
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; AFFECT_DIMS]", into = "[f64; AFFECT_DIMS]")]
pub struct AffectVector([f64; AFFECT_DIMS]);

impl From<[f64; AFFECT_DIMS]> for AffectVector {
    fn from(values: [f64; AFFECT_DIMS]) -> Self {
        Self::new(values)
    }
}

impl From<AffectVector> for [f64; AFFECT_DIMS] {
    fn from(v: AffectVector) -> Self {
        v.0
    }
}

impl Default for AffectVector {
    fn default() -> Self {
        Self(DEFAULT_BASELINE)
    }
}

impl AffectVector {
    pub fn new(values: [f64; AFFECT_DIMS]) -> Self {
        Self(values.map(unit))
    }

    pub fn zeros() -> Self {
        Self([0.0; AFFECT_DIMS])
    }

    /// Build from `(name, weight)` pairs. Unknown names are ignored and
    /// missing dimensions are zero.
    pub fn from_named<S: AsRef<str>>(pairs: impl IntoIterator<Item = (S, f64)>) -> Self {
        let mut values = [0.0; AFFECT_DIMS];
        for (name, weight) in pairs {
            if let Some(affect) = Affect::from_name(name.as_ref()) {
                values[affect.index()] = weight;
            }
        }
        Self::new(values)
    }

    pub fn to_named(&self) -> BTreeMap<&'static str, f64> {
        Affect::ALL.iter().map(|a| (a.name(), self.get(*a))).collect()
    }

    pub fn values(&self) -> &[f64; AFFECT_DIMS] {
        &self.0
    }

    pub fn get(&self, affect: Affect) -> f64 {
        self.0[affect.index()]
    }

    pub fn set(&mut self, affect: Affect, value: f64) {
        self.0[affect.index()] = unit(value);
    }

    pub fn max(&self) -> f64 {
        self.0.iter().copied().fold(f64::MIN, f64::max)
    }

    pub fn min(&self) -> f64 {
        self.0.iter().copied().fold(f64::MAX, f64::min)
    }

    /// `max - min`: how far from flat the state is.
    pub fn spread(&self) -> f64 {
        self.max() - self.min()
    }

    /// Strongest dimension. Ties resolve to the earlier dimension.
    pub fn dominant(&self) -> (Affect, f64) {
        let mut best = (Affect::Seeking, self.0[0]);
        for affect in Affect::ALL.into_iter().skip(1) {
            let v = self.get(affect);
            if v > best.1 {
                best = (affect, v);
            }
        }
        best
    }

    /// Arithmetic mean of a set of vectors, `None` when empty.
    pub fn mean<'a>(vectors: impl IntoIterator<Item = &'a AffectVector>) -> Option<AffectVector> {
        let mut sum = [0.0; AFFECT_DIMS];
        let mut n = 0usize;
        for v in vectors {
            for (s, x) in sum.iter_mut().zip(v.0.iter()) {
                *s += x;
            }
            n += 1;
        }
        if n == 0 {
            return None;
        }
        Some(Self::new(sum.map(|s| s / n as f64)))
    }
}

/// A signed per-dimension adjustment, applied with clamping.
#[derive(Clone, Copy, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct AffectDelta(pub [f64; AFFECT_DIMS]);

impl AffectDelta {
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|d| *d == 0.0)
    }

    pub fn apply(&self, to: &AffectVector) -> AffectVector {
        let mut out = to.0;
        for (v, d) in out.iter_mut().zip(self.0.iter()) {
            *v += d;
        }
        AffectVector::new(out)
    }

    pub fn magnitude(&self) -> f64 {
        self.0.iter().map(|d| d.abs()).fold(0.0, f64::max)
    }
}

/// Parameters of the decay/blend model.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AffectDynamics {
    /// Exponential decay rate toward baseline, per hour.
    pub decay_rate: f64,
    /// Fraction of a shift that is resisted. 0 = fully responsive.
    pub momentum: f64,
    pub blend_strength: f64,
    /// Constant pull toward baseline applied after every blend.
    pub baseline_pull: f64,
    pub cross_affect: bool,
}

impl Default for AffectDynamics {
    fn default() -> Self {
        Self {
            decay_rate: 0.1,
            momentum: 0.3,
            blend_strength: 0.8,
            baseline_pull: 0.02,
            cross_affect: false,
        }
    }
}

/// Passive decay: `b + exp(-rate * h) * (v - b)` per dimension.
pub fn decay(
    current: &AffectVector,
    baseline: &AffectVector,
    decay_rate: f64,
    hours: f64,
) -> AffectVector {
    if hours <= 0.0 || decay_rate <= 0.0 {
        return *current;
    }
    let factor = (-decay_rate * hours).exp();
    let mut out = [0.0; AFFECT_DIMS];
    for (i, o) in out.iter_mut().enumerate() {
        let b = baseline.0[i];
        *o = b + factor * (current.0[i] - b);
    }
    AffectVector::new(out)
}

/// Blend newly detected weights into the current state.
///
/// `shift = blend * intensity * (input - current)`, moved by
/// `(1 - momentum) * shift`, then pulled toward baseline and clamped.
pub fn blend(
    current: &AffectVector,
    baseline: &AffectVector,
    detected: &AffectVector,
    intensity: f64,
    dynamics: &AffectDynamics,
) -> AffectVector {
    let intensity = unit(intensity);
    let mut out = [0.0; AFFECT_DIMS];
    for (i, o) in out.iter_mut().enumerate() {
        let cur = current.0[i];
        let shift = dynamics.blend_strength * intensity * (detected.0[i] - cur);
        let moved = cur + (1.0 - dynamics.momentum) * shift;
        *o = moved + dynamics.baseline_pull * (baseline.0[i] - moved);
    }
    let blended = AffectVector::new(out);
    if dynamics.cross_affect {
        cross_affect(&blended)
    } else {
        blended
    }
}

/// Suppression coefficients: (source, target, strength).
const INTERACTIONS: &[(Affect, Affect, f64)] = &[
    (Affect::Fear, Affect::Play, -0.25),
    (Affect::Fear, Affect::Seeking, -0.15),
    (Affect::Fear, Affect::Lust, -0.2),
    (Affect::Rage, Affect::Care, -0.3),
    (Affect::Rage, Affect::Fear, -0.2),
    (Affect::Rage, Affect::Play, -0.2),
    (Affect::Panic, Affect::Seeking, -0.2),
    (Affect::Panic, Affect::Play, -0.3),
    (Affect::Panic, Affect::Lust, -0.15),
    (Affect::Care, Affect::Rage, -0.3),
    (Affect::Care, Affect::Fear, -0.15),
    (Affect::Play, Affect::Panic, -0.2),
    (Affect::Play, Affect::Fear, -0.15),
    (Affect::Play, Affect::Rage, -0.15),
    (Affect::Seeking, Affect::Panic, -0.15),
    (Affect::Seeking, Affect::Fear, -0.1),
    (Affect::Lust, Affect::Rage, -0.15),
    (Affect::Lust, Affect::Fear, -0.1),
];

/// Strong affects damp their opposites. Deltas are computed from the input
/// vector and applied together so the result is order-independent.
pub fn cross_affect(v: &AffectVector) -> AffectVector {
    let mut delta = AffectDelta::default();
    for &(source, target, strength) in INTERACTIONS {
        let s = v.get(source);
        if s >= INTERACTION_THRESHOLD {
            delta.0[target.index()] += s * strength;
        }
    }
    delta.apply(v)
}

/// Resonance nudge from recalled memories: per dimension,
/// `clamp(factor * (mean(recalled) - current), ±max_bleed)`.
pub fn bleed(
    current: &AffectVector,
    recalled: &[AffectVector],
    bleed_factor: f64,
    max_bleed: f64,
) -> AffectDelta {
    let Some(mean) = AffectVector::mean(recalled) else {
        return AffectDelta::default();
    };
    let cap = max_bleed.abs();
    let mut delta = [0.0; AFFECT_DIMS];
    for (i, d) in delta.iter_mut().enumerate() {
        *d = (bleed_factor * (mean.0[i] - current.0[i])).clamp(-cap, cap);
    }
    AffectDelta(delta)
}
