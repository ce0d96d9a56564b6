//! Named personality baselines.

use crate::affect::{AFFECT_DIMS, AffectVector};

/// `(name, baseline)` in SEEKING, RAGE, FEAR, LUST, CARE, PANIC, PLAY order.
pub const ARCHETYPES: &[(&str, [f64; AFFECT_DIMS])] = &[
    ("guardian", [0.6, 0.05, 0.2, 0.05, 0.8, 0.15, 0.3]),
    ("explorer", [0.8, 0.05, 0.1, 0.1, 0.4, 0.05, 0.5]),
    ("trickster", [0.7, 0.1, 0.05, 0.1, 0.3, 0.05, 0.8]),
    ("stoic", [0.4, 0.05, 0.05, 0.05, 0.3, 0.05, 0.2]),
    ("empath", [0.5, 0.05, 0.15, 0.1, 0.9, 0.2, 0.4]),
    ("warrior", [0.7, 0.3, 0.1, 0.05, 0.4, 0.05, 0.3]),
    ("sage", [0.7, 0.05, 0.05, 0.05, 0.5, 0.05, 0.3]),
    ("nurturer", [0.4, 0.02, 0.1, 0.1, 0.9, 0.15, 0.5]),
    ("rebel", [0.8, 0.2, 0.05, 0.15, 0.2, 0.05, 0.6]),
    ("sentinel", [0.5, 0.1, 0.3, 0.05, 0.5, 0.25, 0.1]),
];

/// Case-insensitive archetype lookup.
pub fn archetype_baseline(name: &str) -> Option<AffectVector> {
    let name = name.trim();
    ARCHETYPES
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, values)| AffectVector::new(*values))
}

pub fn archetype_names() -> impl Iterator<Item = &'static str> {
    ARCHETYPES.iter().map(|(n, _)| *n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::affect::Affect;

    #[test]
    fn test_lookup_case_insensitive() {
        let g = archetype_baseline("Guardian").unwrap();
        assert_eq!(g.get(Affect::Care), 0.8);
        assert!(archetype_baseline("  sage ").is_some());
    }

    #[test]
    fn test_unknown_archetype() {
        assert!(archetype_baseline("wizard").is_none());
    }

    #[test]
    fn test_all_baselines_in_range() {
        for (name, values) in ARCHETYPES {
            assert!(
                values.iter().all(|v| (0.0..=1.0).contains(v)),
                "{name} out of range"
            );
        }
        assert_eq!(archetype_names().count(), 10);
    }
}
