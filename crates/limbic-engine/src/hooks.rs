//! The two lifecycle points a host calls into.

use async_trait::async_trait;

use limbic_core::{Message, RecallSession, TurnContext};

use crate::capture::CaptureOutcome;

/// Narrow interface a host runtime adapts its own lifecycle hooks to.
/// Neither method fails: problems surface as outcomes, logs and counters.
#[async_trait]
pub trait MemoryHooks: Send + Sync {
    /// Called once per completed turn with the transcript so far.
    async fn on_turn_complete(&self, transcript: &[Message], ctx: &TurnContext) -> CaptureOutcome;

    /// Called before the agent responds. Returns context to prepend, if any.
    /// May update affect state as a side effect.
    async fn before_response(
        &self,
        prompt: &str,
        ctx: &TurnContext,
        session: &mut RecallSession,
    ) -> Option<String>;
}
