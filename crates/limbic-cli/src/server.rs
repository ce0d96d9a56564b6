use std::collections::HashMap;
use std::sync::Arc;

use limbic_core::{RecallSession, TurnContext, parse_transcript};
use limbic_engine::{MemoryEngine, RecallOptions};
use limbic_store::AffectState;
use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::*;
use rmcp::{ErrorData as McpError, ServerHandler, tool, tool_handler, tool_router};
use schemars::JsonSchema;
use serde::Deserialize;
use tokio::sync::Mutex;

#[derive(Clone)]
pub struct LimbicServer {
    engine: Arc<MemoryEngine>,
    identity: String,
    /// Recall sessions keyed by conversation id ("" for none).
    sessions: Arc<Mutex<HashMap<String, RecallSession>>>,
    tool_router: ToolRouter<Self>,
}

impl LimbicServer {
    pub fn new(engine: MemoryEngine, identity: String) -> Self {
        Self {
            engine: Arc::new(engine),
            identity,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            tool_router: Self::tool_router(),
        }
    }

    /// Drain the write queue and checkpoint the WAL.
    pub async fn shutdown(&self) {
        match self.engine.shutdown().await {
            Ok(()) => tracing::info!("memory store closed"),
            Err(e) => tracing::warn!("memory store shutdown failed: {e}"),
        }
    }

    fn context(&self, identity: Option<String>, conversation_id: Option<String>) -> TurnContext {
        TurnContext {
            identity: identity.unwrap_or_else(|| self.identity.clone()),
            conversation_id,
            session_id: None,
        }
    }
}

/// Affect state with dimensions spelled out by name.
pub fn affect_json(state: &AffectState) -> serde_json::Value {
    let (dominant, intensity) = state.values.dominant();
    serde_json::json!({
        "identity": state.identity,
        "scope": state.scope,
        "values": state.values.to_named(),
        "baseline": state.baseline.to_named(),
        "dominant": { "affect": dominant.name(), "intensity": intensity },
        "updated_at_ms": state.updated_at_ms,
        "version": state.version,
    })
}

fn json_result(value: &serde_json::Value) -> CallToolResult {
    CallToolResult::success(vec![Content::text(
        serde_json::to_string_pretty(value).unwrap_or_default(),
    )])
}

fn internal(e: impl std::fmt::Display) -> McpError {
    McpError::internal_error(e.to_string(), None)
}

// --- Tool parameter types ---

#[derive(Debug, Deserialize, JsonSchema)]
struct CaptureRequest {
    /// Conversation messages, oldest first, each `{"role", "content"}`.
    /// Content is a string or an array of `text` / `thinking` blocks.
    /// The latest user → assistant exchange is captured.
    messages: Vec<serde_json::Value>,
    /// Conversation the exchange belongs to
    conversation_id: Option<String>,
    /// Agent identity; defaults to the server's
    identity: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct RecallRequest {
    /// The prompt or topic to recall memories for
    query: String,
    /// Conversation the recall is for. Dedup, cache and token budget are
    /// tracked per conversation.
    conversation_id: Option<String>,
    /// Agent identity; defaults to the server's
    identity: Option<String>,
    /// Maximum number of turns to surface
    max_results: Option<usize>,
    /// Let the query's emotional tone move the affect state first
    /// (default true). Set false for lookups that are not user prompts.
    absorb: Option<bool>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct AffectRequest {
    /// Conversation scope, when affect is tracked per conversation
    conversation_id: Option<String>,
    /// Agent identity; defaults to the server's
    identity: Option<String>,
    /// Reset to the configured baseline
    reset: Option<bool>,
}

#[tool_router]
impl LimbicServer {
    #[tool(
        description = "Capture the latest exchange of a conversation as a memory. Call once per completed turn with the transcript so far. Routine exchanges (greetings, heartbeats, acknowledgements) are filtered out automatically; the result says whether the turn was stored, filtered or skipped."
    )]
    async fn memory_capture(
        &self,
        Parameters(req): Parameters<CaptureRequest>,
    ) -> Result<CallToolResult, McpError> {
        let raw = serde_json::Value::Array(req.messages).to_string();
        let messages =
            parse_transcript(&raw).map_err(|e| McpError::invalid_params(e.to_string(), None))?;
        let ctx = self.context(req.identity, req.conversation_id);

        let outcome = self.engine.capture(&messages, &ctx).await;
        let value = serde_json::to_value(&outcome).map_err(internal)?;
        Ok(json_result(&value))
    }

    #[tool(
        description = "Recall memories relevant to a prompt before responding. Returns a context block to weave in silently, or null when nothing relevant was found. Memories already surfaced in this conversation are not repeated, and each conversation has a token budget."
    )]
    async fn memory_recall(
        &self,
        Parameters(req): Parameters<RecallRequest>,
    ) -> Result<CallToolResult, McpError> {
        let ctx = self.context(req.identity, req.conversation_id);
        let opts = RecallOptions {
            max_results: req.max_results,
            ..RecallOptions::default()
        };

        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .entry(ctx.conversation_id.clone().unwrap_or_default())
            .or_insert_with(|| self.engine.new_session(ctx.conversation_id.clone()));

        let outcome = if req.absorb.unwrap_or(true) {
            self.engine
                .prepare_response(&req.query, &ctx, session, &opts)
                .await
        } else {
            self.engine.recall(&req.query, &ctx, session, &opts).await
        };

        let mut value = serde_json::to_value(&outcome).map_err(internal)?;
        value["remaining_tokens"] = session.remaining_tokens().into();
        Ok(json_result(&value))
    }

    #[tool(
        description = "Memory store statistics: node, edge and turn counts, recent activity, pending fallback entries and pipeline counters. Call for diagnostics or when the user asks about memory."
    )]
    async fn memory_health(&self) -> Result<CallToolResult, McpError> {
        let health = self.engine.health().await.map_err(internal)?;
        let value = serde_json::to_value(&health).map_err(internal)?;
        Ok(json_result(&value))
    }

    #[tool(
        description = "Read the agent's current affect state (seven named dimensions in [0, 1] plus the baseline it decays toward). Pass reset=true to return to the baseline."
    )]
    async fn affect_state(
        &self,
        Parameters(req): Parameters<AffectRequest>,
    ) -> Result<CallToolResult, McpError> {
        let ctx = self.context(req.identity, req.conversation_id);
        let state = if req.reset.unwrap_or(false) {
            self.engine
                .reset_affect(&ctx)
                .await
                .map_err(internal)?
                .into_state()
        } else {
            self.engine.affect_state(&ctx).await.map_err(internal)?
        };
        Ok(json_result(&affect_json(&state)))
    }
}

#[tool_handler]
impl ServerHandler for LimbicServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(
                "You have persistent, emotionally weighted memory across conversations.\n\n\
                 LIFECYCLE:\n\
                 1. RECALL: Before responding to a user prompt, call memory_recall with the prompt \
                    and the conversation id. Use returned context silently; never announce \"I remember...\".\n\
                 2. CAPTURE: After each completed turn, call memory_capture with the transcript \
                    (at least the latest user message and your reply, including thinking blocks).\n\n\
                 PRINCIPLES:\n\
                 - Memory should be invisible to the user. Don't mention it unless asked.\n\
                 - A null context means nothing relevant was found. Carry on normally.\n\
                 - Filtered captures are expected for routine exchanges."
                    .into(),
            ),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}
