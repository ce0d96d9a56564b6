//! Optional semantic rerank.
//!
//! An [`EmbeddingProvider`] turns text into a fixed-length vector. Capture
//! stores one vector per turn; recall blends cosine similarity against the
//! query vector into the text score. Every failure here degrades to
//! text-only ranking.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use limbic_core::{EmbeddingConfig, Layer, TurnRecord};

use crate::error::{EngineError, Result};

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Vectors from different models are never compared.
    fn model(&self) -> &str;

    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

/// OpenAI-compatible `/embeddings` client.
pub struct HttpEmbeddingProvider {
    url: String,
    model: String,
    api_key: Option<String>,
    http_client: reqwest::Client,
}

impl HttpEmbeddingProvider {
    pub fn new(
        url: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let http_client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            url: url.into(),
            model: model.into(),
            api_key,
            http_client,
        })
    }

    /// `None` when no endpoint is configured. The API key is read from the
    /// environment variable named in the config, if any.
    pub fn from_config(cfg: &EmbeddingConfig) -> Result<Option<Self>> {
        let Some(url) = cfg.url.as_deref() else {
            return Ok(None);
        };
        let api_key = cfg
            .api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|key| !key.is_empty());
        Self::new(
            url,
            cfg.model.clone(),
            api_key,
            Duration::from_millis(cfg.timeout_ms),
        )
        .map(Some)
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    fn model(&self) -> &str {
        &self.model
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let body = EmbeddingRequest {
            model: &self.model,
            input: text,
        };
        let mut http_req = self.http_client.post(&self.url).json(&body);
        if let Some(ref key) = self.api_key {
            http_req = http_req.bearer_auth(key);
        }

        let response = http_req.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(EngineError::Embedding(format!(
                "endpoint returned {status}: {body_text}"
            )));
        }
        let parsed: EmbeddingResponse = response.json().await?;
        first_vector(parsed)
    }
}

fn first_vector(response: EmbeddingResponse) -> Result<Vec<f32>> {
    let vector = response
        .data
        .into_iter()
        .next()
        .map(|d| d.embedding)
        .ok_or_else(|| EngineError::Embedding("no data in response".into()))?;
    if vector.is_empty() {
        return Err(EngineError::Embedding("empty vector".into()));
    }
    Ok(vector)
}

/// Text embedded for a stored turn: the three summaries, skipping empty ones.
pub fn turn_text(record: &TurnRecord) -> String {
    Layer::ALL
        .iter()
        .map(|l| record.layer(*l).summary.as_str())
        .filter(|s| !s.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Cosine similarity in [-1, 1]; 0.0 for mismatched lengths or zero vectors.
pub fn cosine(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut na = 0.0f64;
    let mut nb = 0.0f64;
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}
