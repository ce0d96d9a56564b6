//! End-to-end behaviour of the engine over a temporary data directory.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tempfile::TempDir;

use limbic_core::recall::{RECALL_CLOSE, RECALL_OPEN};
use limbic_core::{
    Affect, AffectVector, CaptureConfig, Config, ContentBlock, Layer, Message, RejectReason,
    TurnContext, TurnLayers, TurnRecord, now_millis,
};
use limbic_core::{AffectDetector, DetectedAffect};
use limbic_engine::{
    CaptureOutcome, EmbeddingProvider, MemoryEngine, MemoryHooks, RecallOptions, RecallResult,
    Result,
};
use limbic_store::{AffectStateStore, DataLayout, FallbackLog, MemoryStore, StoreError};

struct Fixture {
    dir: TempDir,
    engine: MemoryEngine,
}

impl Fixture {
    async fn new() -> Self {
        Self::with_config(Config::default()).await
    }

    async fn with_config(config: Config) -> Self {
        let dir = TempDir::new().unwrap();
        let engine = MemoryEngine::open(&DataLayout::new(dir.path()), config)
            .await
            .unwrap();
        Self { dir, engine }
    }

    fn layout(&self) -> DataLayout {
        DataLayout::new(self.dir.path())
    }

    fn reader(&self) -> MemoryStore {
        MemoryStore::open_reader(&self.layout().memory_db(), 5000).unwrap()
    }
}

fn ctx() -> TurnContext {
    TurnContext::new("agent").with_conversation("conv-1")
}

fn exchange(input: &str, thinking: &str, output: &str) -> Vec<Message> {
    let mut blocks = Vec::new();
    if !thinking.is_empty() {
        blocks.push(ContentBlock::Thinking {
            thinking: thinking.into(),
        });
    }
    blocks.push(ContentBlock::Text {
        text: output.into(),
    });
    vec![Message::user(input), Message::assistant(blocks)]
}

async fn store_turn(engine: &MemoryEngine, input: &str, output: &str) -> limbic_core::TurnId {
    match engine.capture(&exchange(input, "", output), &ctx()).await {
        CaptureOutcome::Stored { turn_id, .. } => turn_id,
        other => panic!("expected stored turn, got {other:?}"),
    }
}

// --- Scenario A: structural noise never reaches storage ---

#[tokio::test]
async fn scenario_a_heartbeat_is_filtered() {
    let fx = Fixture::new().await;
    let outcome = fx
        .engine
        .on_turn_complete(&exchange("ok", "", "HEARTBEAT_OK"), &ctx())
        .await;
    assert!(!outcome.is_stored());
    assert!(matches!(
        outcome,
        CaptureOutcome::Filtered {
            reason: RejectReason::SystemNoise,
            ..
        }
    ));

    let health = fx.engine.health().await.unwrap();
    assert_eq!(health.store.node_count, 0);
    assert_eq!(health.store.turn_count, 0);
    assert_eq!(health.metrics.filtered, 1);
    assert_eq!(health.metrics.stored, 0);
}

// --- Scenario B: a substantive turn is scored and stored whole ---

#[tokio::test]
async fn scenario_b_emotional_turn_is_stored() {
    let fx = Fixture::new().await;

    // Seed the affect state the turn will be bound to.
    let config = Config::default();
    let affect_store =
        AffectStateStore::open(&fx.layout().affect_db(), &config.affect, 5000).unwrap();
    let fearful = AffectVector::from_named([
        ("seeking", 0.1),
        ("rage", 0.05),
        ("fear", 0.7),
        ("lust", 0.0),
        ("care", 0.1),
        ("panic", 0.4),
        ("play", 0.05),
    ]);
    assert!(
        affect_store
            .modify("agent", "shared", now_millis(), |_| fearful)
            .is_applied()
    );

    let input = "I've been thinking about quitting my job and it terrifies me";
    let thinking = "They are scared about a big career decision. Before offering advice I should \
        acknowledge the fear, ask what is driving the wish to leave, and separate the fear of \
        change from real financial risk. Practical next steps can come after that.";
    let output = "That sounds like a heavy decision to carry. It makes sense to feel scared. \
        Would it help to talk through what is pushing you to leave and what staying would cost?";
    assert!(thinking.chars().count() >= 200);
    assert!(output.chars().count() >= 100);

    let outcome = fx.engine.capture(&exchange(input, thinking, output), &ctx()).await;
    let CaptureOutcome::Stored { turn_id, score } = outcome else {
        panic!("expected stored turn, got {outcome:?}");
    };
    assert!(score >= 0.2);

    let reader = fx.reader();
    let turn = reader.get_turn(&turn_id).unwrap().unwrap();
    assert!(turn.deliberation_node.is_some());
    let affect = turn.affect.unwrap();
    assert!((affect.get(Affect::Fear) - 0.7).abs() < 0.01);

    let nodes = reader.nodes_for_turn(&turn_id).unwrap();
    assert_eq!(nodes.len(), 3);
    assert!(nodes.iter().all(|n| (n.novelty_score - score).abs() < 1e-9));
    let deliberation = nodes.iter().find(|n| n.layer == Layer::Deliberation).unwrap();
    assert_eq!(deliberation.text, thinking);

    let health = fx.engine.health().await.unwrap();
    assert_eq!(health.store.node_count, 3);
    assert_eq!(health.store.edge_count, 3);
    assert_eq!(health.store.turn_count, 1);
}

// --- Scenario C: recall ranks the relevant turns ---

#[tokio::test]
async fn scenario_c_recall_returns_relevant_turns() {
    let fx = Fixture::new().await;
    let strong = store_turn(
        &fx.engine,
        "Can you explain how quantum computing differs from classical computing?",
        "Quantum computing uses qubits that hold superpositions, so some problems need far fewer steps than on classical hardware.",
    )
    .await;
    let weaker = store_turn(
        &fx.engine,
        "Is quantum entanglement actually faster than light communication?",
        "No. Quantum entanglement correlates outcomes but cannot carry a message, so no signal travels faster than light.",
    )
    .await;
    for (input, output) in [
        (
            "What soil should I use for growing tomatoes on a balcony?",
            "A loose potting mix with compost drains well and keeps tomato roots healthy in containers.",
        ),
        (
            "How do I reset a forgotten router admin password?",
            "Hold the reset button for about ten seconds, then log in with the default credentials printed on the label.",
        ),
        (
            "Recommend a good novel for a long train journey please",
            "Try a long literary novel with short chapters so you can stop and start easily while travelling.",
        ),
    ] {
        store_turn(&fx.engine, input, output).await;
    }

    let results = fx
        .engine
        .search(
            "quantum computing",
            &RecallOptions {
                max_results: Some(2),
                ..RecallOptions::default()
            },
        )
        .await
        .unwrap();

    let ids: Vec<_> = results.memories.iter().map(|m| m.turn_id.clone()).collect();
    assert_eq!(ids.len(), 2);
    assert!(ids.contains(&strong));
    assert!(ids.contains(&weaker));
    assert!(results.memories[0].score >= results.memories[1].score);
    // Matching both terms outranks matching one.
    assert_eq!(ids[0], strong);
    assert!(results.candidate_count >= 2);
    assert!(results.scanned >= 2);
}

// --- Scenario D: concurrent affect writers never overwrite each other ---

#[tokio::test]
async fn scenario_d_stale_affect_write_is_detected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("affect.db");
    let cfg = Config::default().affect;
    let first = AffectStateStore::open(&path, &cfg, 5000).unwrap();
    let second = AffectStateStore::open(&path, &cfg, 5000).unwrap();
    let now = now_millis();

    // Both start from the same persisted version.
    assert!(first.modify("agent", "shared", now, |v| *v).is_applied());
    let stale = second.get("agent", "shared", now).unwrap();

    let mut raised = AffectVector::zeros();
    raised.set(Affect::Seeking, 0.9);
    let winner = first.modify("agent", "shared", now, |_| raised).into_state();

    let err = second
        .try_write(&stale, AffectVector::zeros(), now)
        .unwrap_err();
    assert!(matches!(err, StoreError::Conflict { .. }));

    // The retrying path re-reads and builds on the winner's value.
    let merged = second.modify("agent", "shared", now, |v| {
        let mut next = *v;
        next.set(Affect::Play, 0.8);
        next
    });
    assert!(merged.is_applied());
    let state = merged.into_state();
    assert_eq!(state.version, winner.version + 1);
    assert!((state.values.get(Affect::Seeking) - 0.9).abs() < 1e-9);
    assert!((state.values.get(Affect::Play) - 0.8).abs() < 1e-9);
}

// --- Scenario E: the per-conversation token budget caps injection ---

fn long_turn(topic: &str, n: usize) -> (String, String) {
    let input = format!(
        "Tell me more about {topic} number {n}: {}",
        "what makes it work, what usually goes wrong, and how to tell the difference early. ".repeat(4)
    );
    let output = format!(
        "Here is what matters for {topic} case {n}. {}",
        "Watch the fundamentals first, keep notes on what changed, and compare against a known good baseline. ".repeat(4)
    );
    (input, output)
}

#[tokio::test]
async fn scenario_e_budget_exhaustion_returns_empty() {
    let mut config = Config::default();
    config.recall.token_budget = 150;
    let fx = Fixture::with_config(config).await;

    for n in 0..4 {
        let (input, output) = long_turn("sourdough", n);
        store_turn(&fx.engine, &input, &output).await;
    }

    let mut session = fx.engine.new_session(Some("conv-1".into()));
    let first = fx
        .engine
        .recall("sourdough", &ctx(), &mut session, &RecallOptions::default())
        .await;
    let context = first.context.expect("first recall surfaces a memory");
    assert!(context.starts_with(RECALL_OPEN));
    assert!(context.ends_with(RECALL_CLOSE));
    assert_eq!(first.memories.len(), 1);
    assert!(session.stats().tokens_used > 0);

    // Matching, not yet injected memories still exist.
    let remaining = fx
        .engine
        .search("sourdough fundamentals", &RecallOptions::default())
        .await
        .unwrap();
    assert!(
        remaining
            .memories
            .iter()
            .any(|m| !session.is_injected(&m.turn_id))
    );

    let second = fx
        .engine
        .recall(
            "sourdough fundamentals",
            &ctx(),
            &mut session,
            &RecallOptions::default(),
        )
        .await;
    assert!(second.context.is_none());
    assert!(second.memories.is_empty());
}

// --- Session behaviour ---

#[tokio::test]
async fn test_recall_dedups_and_caches_within_conversation() {
    let fx = Fixture::new().await;
    let id = store_turn(
        &fx.engine,
        "How does a bloom filter avoid storing the actual keys?",
        "It sets a few bits per key from several hashes, so membership checks may give false positives but never false negatives.",
    )
    .await;

    let mut session = fx.engine.new_session(Some("conv-1".into()));
    let first = fx
        .engine
        .recall("bloom filter", &ctx(), &mut session, &RecallOptions::default())
        .await;
    assert_eq!(first.memories.len(), 1);
    assert_eq!(first.memories[0].turn_id, id);
    assert!(!first.cached);

    let again = fx
        .engine
        .recall("Bloom filter?", &ctx(), &mut session, &RecallOptions::default())
        .await;
    assert!(again.cached);
    assert_eq!(again.context, first.context);
    assert_eq!(fx.engine.metrics().recall_count(RecallResult::Cached), 1);

    // A different query over the same turn: already injected, so nothing new.
    let other = fx
        .engine
        .recall("bloom hashes", &ctx(), &mut session, &RecallOptions::default())
        .await;
    assert!(other.context.is_none());

    // A new conversation starts from a clean session.
    let elsewhere = TurnContext::new("agent").with_conversation("conv-2");
    let fresh = fx
        .engine
        .recall("bloom hashes", &elsewhere, &mut session, &RecallOptions::default())
        .await;
    assert_eq!(fresh.memories.len(), 1);
    assert_eq!(session.conversation_id(), Some("conv-2"));
}

#[tokio::test]
async fn test_before_response_absorbs_prompt_affect() {
    let fx = Fixture::new().await;
    store_turn(
        &fx.engine,
        "I keep worrying that the deploy tonight will break production",
        "That worry is reasonable. A staged rollout with a quick rollback plan keeps the blast radius small if anything breaks.",
    )
    .await;

    let before = fx.engine.affect_state(&ctx()).await.unwrap();
    let mut session = fx.engine.new_session(None);
    let context = fx
        .engine
        .before_response(
            "I'm scared and anxious about the deploy again",
            &ctx(),
            &mut session,
        )
        .await;
    assert!(context.is_some_and(|c| c.contains("deploy")));

    let after = fx.engine.affect_state(&ctx()).await.unwrap();
    assert!(after.values.get(Affect::Fear) > before.values.get(Affect::Fear));
    assert!(after.version > before.version);
    for v in after.values.values() {
        assert!((0.0..=1.0).contains(v));
    }
}

struct Playful;

impl AffectDetector for Playful {
    fn detect(&self, _text: &str) -> DetectedAffect {
        DetectedAffect {
            weights: AffectVector::from_named([("play", 1.0)]),
            intensity: 1.0,
        }
    }
}

#[tokio::test]
async fn test_custom_detector_drives_affect() {
    let fx = Fixture::new().await;
    let engine = fx.engine.with_detector(Arc::new(Playful));
    let before = engine.affect_state(&ctx()).await.unwrap();

    let mut session = engine.new_session(None);
    engine
        .before_response("what a lovely quiet afternoon", &ctx(), &mut session)
        .await;

    let after = engine.affect_state(&ctx()).await.unwrap();
    assert!(after.values.get(Affect::Play) > before.values.get(Affect::Play));
    assert!(after.values.get(Affect::Play) <= 1.0);
}

#[tokio::test]
async fn test_reset_affect_restores_baseline() {
    let fx = Fixture::new().await;
    let mut session = fx.engine.new_session(None);
    fx.engine
        .before_response("I am so angry and furious about this", &ctx(), &mut session)
        .await;
    let reset = fx.engine.reset_affect(&ctx()).await.unwrap();
    assert!(reset.is_applied());
    assert_eq!(reset.state().values, fx.engine.config().affect.baseline());
}

// --- Storage failure and recovery ---

#[tokio::test]
async fn test_shutdown_routes_captures_to_fallback_then_replays() {
    let fx = Fixture::new().await;
    fx.engine.shutdown().await.unwrap();

    let outcome = fx
        .engine
        .capture(
            &exchange(
                "What is the difference between a mutex and a semaphore?",
                "",
                "A mutex admits one holder at a time, while a semaphore admits up to a fixed count of holders.",
            ),
            &ctx(),
        )
        .await;
    let CaptureOutcome::Fallback { turn_id, .. } = outcome else {
        panic!("expected fallback, got {outcome:?}");
    };
    let health = fx.engine.health().await.unwrap();
    assert_eq!(health.fallback_pending, 1);
    assert!(!health.writer_open);

    // A fresh engine over the same directory drains the log.
    let engine = MemoryEngine::open(&fx.layout(), Config::default())
        .await
        .unwrap();
    let report = engine.replay_fallback().await.unwrap();
    assert_eq!(report.replayed, 1);
    assert_eq!(report.remaining, 0);
    assert!(fx.reader().turn_exists(&turn_id).unwrap());

    // Replaying again is a no-op.
    let again = engine.replay_fallback().await.unwrap();
    assert_eq!(again, Default::default());
}

#[tokio::test]
async fn test_replay_skips_turns_already_stored() {
    let fx = Fixture::new().await;
    let layers = TurnLayers {
        input: "Explain how a write-ahead log helps crash recovery".into(),
        deliberation: String::new(),
        output: "Changes are appended to the log before the main file, so replaying the log restores committed work.".into(),
        speaker: None,
    };
    let record = TurnRecord::build(
        &layers,
        &ctx(),
        None,
        0.6,
        &CaptureConfig::default(),
        now_millis(),
        &mut rand::rng(),
    );
    let log = FallbackLog::new(fx.layout().fallback_log());
    log.append(&record, "database is locked", now_millis()).unwrap();
    log.append(&record, "database is locked", now_millis()).unwrap();

    let report = fx.engine.replay_fallback().await.unwrap();
    assert_eq!(report.replayed, 1);
    assert_eq!(report.already_stored, 1);
    assert_eq!(report.remaining, 0);
    assert_eq!(fx.engine.health().await.unwrap().store.turn_count, 1);
}

#[tokio::test]
async fn test_every_stored_turn_has_three_nodes_and_edges() {
    let fx = Fixture::new().await;
    for n in 0..6 {
        store_turn(
            &fx.engine,
            &format!("Question {n}: how do I profile a slow database query properly?"),
            &format!("Answer {n}: run the query plan explainer, look for full scans, and add an index on the filtered columns."),
        )
        .await;
    }
    let health = fx.engine.health().await.unwrap();
    assert_eq!(health.store.turn_count, 6);
    assert_eq!(health.store.node_count, 18);
    assert_eq!(health.store.edge_count, 18);
    assert_eq!(health.store.layers.get("deliberation"), Some(&6));
}

// --- Embedding rerank ---

/// Two-dimensional embedding: how much the text talks about cats vs dogs.
struct PetEmbedder {
    calls: AtomicUsize,
}

#[async_trait]
impl EmbeddingProvider for PetEmbedder {
    fn model(&self) -> &str {
        "pets-2d"
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let text = text.to_lowercase();
        let cats = text.matches("cat").count() as f32;
        let dogs = text.matches("dog").count() as f32;
        Ok(vec![cats + 0.01, dogs + 0.01])
    }
}

#[tokio::test]
async fn test_embeddings_are_stored_and_blend_into_ranking() {
    let fx = Fixture::new().await;
    let embedder = Arc::new(PetEmbedder {
        calls: AtomicUsize::new(0),
    });
    let engine = MemoryEngine::open(&fx.layout(), Config::default())
        .await
        .unwrap()
        .with_embedder(embedder.clone());
    fx.engine.shutdown().await.unwrap();

    let dog = store_turn(
        &engine,
        "What pet training routine works for an energetic puppy dog?",
        "Short daily sessions with rewards work well for a young dog, plus long walks to burn energy.",
    )
    .await;
    let cat = store_turn(
        &engine,
        "What pet training routine works for a shy rescue cat?",
        "Let the cat approach on its own terms, reward calm behaviour, and keep sessions very short.",
    )
    .await;

    let health = engine.health().await.unwrap();
    assert_eq!(health.store.embedding_count, 2);
    assert_eq!(health.embedding_model.as_deref(), Some("pets-2d"));

    let results = engine
        .search("pet training routine for my cat", &RecallOptions::default())
        .await
        .unwrap();
    let ids: Vec<_> = results.memories.iter().map(|m| m.turn_id.clone()).collect();
    assert_eq!(ids.first(), Some(&cat));
    assert!(ids.contains(&dog));
    assert!(embedder.calls.load(Ordering::SeqCst) >= 3);
}
