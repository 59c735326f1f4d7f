//! Text embeddings for similarity ranking.
//!
//! The registry only needs [`EmbeddingProvider`]; [`HttpEmbeddingProvider`]
//! talks to a sentence-transformers style service exposing `POST /embed`
//! (`{"texts": [...]}` in, `{"embeddings": [[...]]}` out).

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::capabilities::{Capability, CapabilityBody};

/// Dimension of all-MiniLM-L6-v2, the default service model.
pub const DEFAULT_DIMENSION: usize = 384;

/// Maps text to fixed-length vectors.
///
/// Implementations must return an error, never panic, when the backing
/// service is unavailable; callers degrade to keyword matching.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, anyhow::Error>;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, anyhow::Error> {
        self.embed_batch(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("embedding service returned no vectors"))
    }

    fn dimension(&self) -> usize;
}

/// Cosine similarity in `[-1, 1]`. Mismatched lengths and zero vectors
/// score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let (mut dot, mut norm_a, mut norm_b) = (0.0f64, 0.0f64, 0.0f64);
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Text embedded for a capability at registration time.
///
/// Agents: `"{name}. {description}. Skills: {a, b}"`.
/// Skills and commands: `"{name} {description} {content or prompt}"`.
pub fn capability_embedding_text(cap: &Capability) -> String {
    match &cap.body {
        CapabilityBody::Agent { .. } => format!(
            "{}. {}. Skills: {}",
            cap.name,
            cap.description,
            cap.skills.join(", ")
        ),
        CapabilityBody::Skill { document, .. } => {
            format!("{} {} {}", cap.name, cap.description, document.content)
        }
        CapabilityBody::Command { template, .. } => {
            format!("{} {} {}", cap.name, cap.description, template.prompt)
        }
    }
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    texts: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

/// Client for an HTTP embedding service.
#[derive(Debug, Clone)]
pub struct HttpEmbeddingProvider {
    endpoint: String,
    client: reqwest::Client,
    dimension: usize,
}

impl HttpEmbeddingProvider {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, anyhow::Error> {
        if endpoint.trim().is_empty() {
            anyhow::bail!("embedding endpoint is required");
        }
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            endpoint: endpoint.trim().trim_end_matches('/').to_string(),
            client,
            dimension: DEFAULT_DIMENSION,
        })
    }

    pub fn with_dimension(mut self, dimension: usize) -> Self {
        self.dimension = dimension;
        self
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, anyhow::Error> {
        log::debug!("Embedding {} texts via {}", texts.len(), self.endpoint);

        let response = self
            .client
            .post(format!("{}/embed", self.endpoint))
            .json(&EmbedRequest { texts })
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("embedding request failed: {}", e))?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("embedding service returned status {}", status);
        }

        let body: EmbedResponse = response
            .json()
            .await
            .map_err(|e| anyhow::anyhow!("failed to decode embedding response: {}", e))?;

        if body.embeddings.len() != texts.len() {
            anyhow::bail!(
                "embedding service returned {} vectors for {} texts",
                body.embeddings.len(),
                texts.len()
            );
        }
        Ok(body.embeddings)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}
