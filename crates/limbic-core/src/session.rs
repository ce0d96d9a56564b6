//! Per-conversation recall state, owned by the caller.
//!
//! Tracks which turns were already injected, how much of the token budget is
//! spent, and the last query's result for the cooldown cache. A change of
//! conversation id resets everything.

use std::collections::HashSet;

use serde::Serialize;

use crate::affect::AffectDelta;
use crate::config::RecallConfig;
use crate::tokenizer::tokenize;
use crate::turn::TurnId;

/// Result of the previous recall, replayed for repeated queries.
#[derive(Clone, Debug, PartialEq)]
pub struct CachedRecall {
    pub key: String,
    pub context: Option<String>,
    pub bleed: AffectDelta,
    pub at_ms: i64,
}

#[derive(Clone, Debug)]
pub struct RecallSession {
    conversation_id: Option<String>,
    injected: HashSet<TurnId>,
    tokens_used: usize,
    token_budget: usize,
    cooldown_ms: i64,
    cache: Option<CachedRecall>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub conversation_id: Option<String>,
    pub injected: usize,
    pub tokens_used: usize,
    pub token_budget: usize,
}

/// Normalized form used to compare queries for the cache.
pub fn cache_key(query: &str) -> String {
    tokenize(query).join(" ")
}

impl RecallSession {
    pub fn new(conversation_id: Option<String>, cfg: &RecallConfig) -> Self {
        Self {
            conversation_id,
            injected: HashSet::new(),
            tokens_used: 0,
            token_budget: cfg.token_budget,
            cooldown_ms: i64::try_from(cfg.cache_cooldown_secs.saturating_mul(1000))
                .unwrap_or(i64::MAX),
            cache: None,
        }
    }

    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation_id.as_deref()
    }

    pub fn reset(&mut self) {
        self.injected.clear();
        self.tokens_used = 0;
        self.cache = None;
    }

    /// Reset when the host moved to another conversation. Returns whether a
    /// reset happened.
    pub fn observe_conversation(&mut self, conversation_id: Option<&str>) -> bool {
        if self.conversation_id.as_deref() == conversation_id {
            return false;
        }
        self.conversation_id = conversation_id.map(str::to_string);
        self.reset();
        true
    }

    /// Turns already surfaced in this conversation.
    pub fn injected(&self) -> &HashSet<TurnId> {
        &self.injected
    }

    pub fn is_injected(&self, turn_id: &TurnId) -> bool {
        self.injected.contains(turn_id)
    }

    pub fn remaining_tokens(&self) -> usize {
        self.token_budget.saturating_sub(self.tokens_used)
    }

    pub fn budget_exhausted(&self) -> bool {
        self.remaining_tokens() == 0
    }

    pub fn record_injection(&mut self, turn_ids: &[TurnId], tokens: usize) {
        self.injected.extend(turn_ids.iter().cloned());
        self.tokens_used += tokens;
    }

    /// Cached result for `query` if it was asked within the cooldown.
    pub fn cached(&self, query: &str, now_ms: i64) -> Option<&CachedRecall> {
        let cache = self.cache.as_ref()?;
        let fresh = now_ms.saturating_sub(cache.at_ms) < self.cooldown_ms;
        (fresh && cache.key == cache_key(query)).then_some(cache)
    }

    pub fn store_cache(
        &mut self,
        query: &str,
        context: Option<String>,
        bleed: AffectDelta,
        now_ms: i64,
    ) {
        self.cache = Some(CachedRecall {
            key: cache_key(query),
            context,
            bleed,
            at_ms: now_ms,
        });
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            conversation_id: self.conversation_id.clone(),
            injected: self.injected.len(),
            tokens_used: self.tokens_used,
            token_budget: self.token_budget,
        }
    }
}
