//! Structural noise predicates applied before novelty scoring.

use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::{CaptureConfig, FilterToggles};

/// Why a turn was not captured.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    Empty,
    SystemNoise,
    ShortExchange,
    Monotonous,
    BelowThreshold,
}

impl RejectReason {
    pub const ALL: [RejectReason; 5] = [
        RejectReason::Empty,
        RejectReason::SystemNoise,
        RejectReason::ShortExchange,
        RejectReason::Monotonous,
        RejectReason::BelowThreshold,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RejectReason::Empty => "empty",
            RejectReason::SystemNoise => "system_noise",
            RejectReason::ShortExchange => "short_exchange",
            RejectReason::Monotonous => "monotonous",
            RejectReason::BelowThreshold => "below_threshold",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct NoiseFilter {
    toggles: FilterToggles,
    system_noise: Vec<Regex>,
    acknowledgments: Vec<String>,
    min_combined_length: usize,
    substantial_deliberation: usize,
}

impl NoiseFilter {
    pub fn new(cfg: &CaptureConfig) -> Self {
        Self {
            toggles: cfg.filters.clone(),
            system_noise: cfg
                .system_noise_patterns
                .iter()
                .filter_map(|p| Regex::new(p).ok())
                .collect(),
            acknowledgments: cfg
                .acknowledgments
                .iter()
                .map(|a| a.trim().to_lowercase())
                .collect(),
            min_combined_length: cfg.min_combined_length,
            substantial_deliberation: cfg.substantial_deliberation,
        }
    }

    /// First matching rejection, checked in order: empty, system noise,
    /// short exchange, monotonous acknowledgment.
    pub fn check(&self, input: &str, deliberation: &str, output: &str) -> Option<RejectReason> {
        let (input, deliberation, output) = (input.trim(), deliberation.trim(), output.trim());

        if self.toggles.empty && input.is_empty() && deliberation.is_empty() && output.is_empty() {
            return Some(RejectReason::Empty);
        }

        if self.toggles.system_noise
            && [input, deliberation, output]
                .iter()
                .any(|layer| self.is_system_noise(layer))
        {
            return Some(RejectReason::SystemNoise);
        }

        let substantial = deliberation.chars().count() >= self.substantial_deliberation;
        let combined = input.chars().count() + output.chars().count();

        if self.toggles.short_exchange && combined < self.min_combined_length && !substantial {
            return Some(RejectReason::ShortExchange);
        }

        if self.toggles.monotonous
            && !substantial
            && self.is_acknowledgment(input)
            && (self.is_acknowledgment(output)
                || output.chars().count() < self.min_combined_length)
        {
            return Some(RejectReason::Monotonous);
        }

        None
    }

    pub fn is_system_noise(&self, text: &str) -> bool {
        !text.is_empty() && self.system_noise.iter().any(|re| re.is_match(text))
    }

    /// Exact match against the acknowledgment vocabulary, ignoring case and
    /// trailing punctuation.
    pub fn is_acknowledgment(&self, text: &str) -> bool {
        let norm = text
            .trim()
            .trim_end_matches(|c: char| c.is_ascii_punctuation() && c != '_')
            .to_lowercase();
        !norm.is_empty() && self.acknowledgments.iter().any(|a| *a == norm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter() -> NoiseFilter {
        NoiseFilter::new(&CaptureConfig::default())
    }

    #[test]
    fn test_empty() {
        assert_eq!(filter().check("  ", "\n", ""), Some(RejectReason::Empty));
    }

    #[test]
    fn test_heartbeat_is_system_noise() {
        assert_eq!(
            filter().check("ok", "", "HEARTBEAT_OK"),
            Some(RejectReason::SystemNoise)
        );
        assert_eq!(
            filter().check("anything at all here", "", "NO_REPLY"),
            Some(RejectReason::SystemNoise)
        );
    }

    #[test]
    fn test_system_patterns() {
        let f = filter();
        assert!(f.is_system_noise("System: gateway restarted"));
        assert!(f.is_system_noise("The gateway restarted at 10:02"));
        assert!(f.is_system_noise("status: online"));
        assert!(f.is_system_noise("<tool_result>done</tool_result>"));
        assert!(f.is_system_noise(r#"{"type": "tool_result", "content": []}"#));
        assert!(f.is_system_noise("Exit code 0"));
        assert!(!f.is_system_noise("I restarted my life after the move"));
        assert!(!f.is_system_noise(""));
    }

    #[test]
    fn test_short_exchange() {
        assert_eq!(
            filter().check("hi there", "", "hello!"),
            Some(RejectReason::ShortExchange)
        );
    }

    #[test]
    fn test_short_exchange_rescued_by_deliberation() {
        let thinking = "a".repeat(150);
        assert_eq!(filter().check("why?", &thinking, "because."), None);
    }

    #[test]
    fn test_monotonous_ack() {
        assert_eq!(
            filter().check("thank you", "", "You're welcome, anytime!"),
            Some(RejectReason::Monotonous)
        );
    }

    #[test]
    fn test_ack_with_substantive_reply_passes() {
        assert_eq!(
            filter().check("thanks!", "", "Sure, done. Let me know if you need anything"),
            None
        );
    }

    #[test]
    fn test_ack_with_ack_reply_is_monotonous() {
        let f = NoiseFilter::new(&CaptureConfig {
            min_combined_length: 5,
            ..Default::default()
        });
        assert_eq!(f.check("yes", "", "great"), Some(RejectReason::Monotonous));
    }

    #[test]
    fn test_ack_vocab_normalization() {
        let f = filter();
        assert!(f.is_acknowledgment("OK!"));
        assert!(f.is_acknowledgment(" thank you. "));
        assert!(!f.is_acknowledgment("ok but what about the roof"));
    }

    #[test]
    fn test_substantive_exchange_passes() {
        assert_eq!(
            filter().check(
                "I've been thinking about quitting my job and it terrifies me",
                "",
                "That is a big decision. What is driving it?"
            ),
            None
        );
    }

    #[test]
    fn test_toggles_disable_checks() {
        let cfg = CaptureConfig {
            filters: FilterToggles {
                empty: true,
                system_noise: false,
                short_exchange: false,
                monotonous: false,
            },
            ..Default::default()
        };
        assert_eq!(NoiseFilter::new(&cfg).check("ok", "", "HEARTBEAT_OK"), None);
    }
}
