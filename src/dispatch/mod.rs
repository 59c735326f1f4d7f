//! # Capability Dispatcher
//!
//! Resolves a free-text task or a skill list to a single registered
//! capability.
//!
//! ## Task resolution
//!
//! ```text
//! task ──expand──▶ semantic (embedding, threshold 0.25)
//!                    │ miss / provider down
//!                    ▼
//!                  keyword on the original text
//!                    │ miss
//!                    ▼
//!                  keyword per expanded token (len >= 3), first hit wins
//!                    │ miss
//!                    ▼
//!                  NotFound { active names }
//! ```
//!
//! ## Skill-set resolution
//!
//! cache → per-skill keyword → similarity (threshold 0.3) → generator.
//! Generation is guarded by a claim on the skill-set fingerprint; a caller
//! that loses the claim waits for the winner's result instead of generating
//! a duplicate.
//!
//! Provider failures never abort a request: they are logged and the next tier
//! runs. Store failures are returned as-is.

pub mod vocabulary;

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use vocabulary::{tokenize, Vocabulary};

use crate::cache::{fingerprint, normalize_skills, SkillRequestCache};
use crate::capabilities::{
    normalize_terms, Capability, CapabilityId, CapabilityKind, NewCapability, ScoredCapability,
};
use crate::config::DispatchConfig;
use crate::embeddings::{capability_embedding_text, EmbeddingProvider};
use crate::error::{RegistryError, Result};
use crate::generator::Generator;
use crate::store::{CapabilityFilter, CapabilityStore};

/// Tokens shorter than this are skipped by the per-token tier.
pub const MIN_TOKEN_LEN: usize = 3;

/// Which tier produced a task match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchTier {
    Semantic,
    Keyword,
    ExpandedKeyword,
}

/// A resolved task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskMatch {
    pub capability: Capability,
    pub tier: MatchTier,
    /// Similarity for semantic matches.
    pub score: Option<f64>,
    /// The expanded-text token that hit, for the per-token tier.
    pub token: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Found(TaskMatch),
    /// Nothing matched. `suggestions` lists every active capability of the
    /// requested kind.
    NotFound { suggestions: Vec<String> },
}

/// Where a skill-set result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkillSource {
    Cache,
    SkillMatch,
    Similar,
    Generated,
}

impl SkillSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cache => "cache",
            Self::SkillMatch => "skill_match",
            Self::Similar => "similar",
            Self::Generated => "generated",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SkillMatch {
    pub capability: Capability,
    pub source: SkillSource,
    pub similarity: Option<f64>,
    pub fingerprint: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SkillOutcome {
    Found(SkillMatch),
    NotFound { skills: Vec<String> },
}

/// Tiered matcher over a [`CapabilityStore`].
#[derive(Clone)]
pub struct CapabilityDispatcher {
    store: Arc<dyn CapabilityStore>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    generator: Option<Arc<dyn Generator>>,
    vocabulary: Arc<Vocabulary>,
    cache: SkillRequestCache,
    config: DispatchConfig,
}

impl CapabilityDispatcher {
    pub fn new(store: Arc<dyn CapabilityStore>, config: DispatchConfig) -> Self {
        Self {
            cache: SkillRequestCache::new(store.clone()),
            store,
            embedder: None,
            generator: None,
            vocabulary: Arc::new(Vocabulary::default()),
            config,
        }
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn with_generator(mut self, generator: Arc<dyn Generator>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn with_vocabulary(mut self, vocabulary: Arc<Vocabulary>) -> Self {
        self.vocabulary = vocabulary;
        self
    }

    pub fn vocabulary(&self) -> &Vocabulary {
        &self.vocabulary
    }

    pub fn has_embedder(&self) -> bool {
        self.embedder.is_some()
    }

    pub fn has_generator(&self) -> bool {
        self.generator.is_some()
    }

    /// Run a provider call under the dependency timeout.
    async fn bounded<T, F>(&self, what: &str, call: F) -> Option<T>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        match tokio::time::timeout(self.config.dependency_timeout, call).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(e)) => {
                log::warn!("{} failed: {}", what, e);
                None
            }
            Err(_) => {
                log::warn!(
                    "{} timed out after {:?}",
                    what,
                    self.config.dependency_timeout
                );
                None
            }
        }
    }

    /// Embed `text`, or `None` when no provider is configured or it fails.
    pub async fn embed(&self, text: &str) -> Option<Vec<f32>> {
        let embedder = self.embedder.as_ref()?;
        self.bounded("embedding", embedder.embed(text)).await
    }

    fn record_usage(&self, id: CapabilityId) {
        let store = self.store.clone();
        tokio::spawn(async move {
            if let Err(e) = store.increment_usage(id).await {
                log::warn!("Failed to increment usage for {}: {}", id, e);
            }
        });
    }

    async fn first_keyword_hit(&self, kind: CapabilityKind, query: &str) -> Result<Option<Capability>> {
        Ok(self.store.search_keyword(kind, query).await?.into_iter().next())
    }

    /// Resolve a task description to the best capability of `kind`.
    pub async fn resolve(&self, kind: CapabilityKind, task: &str) -> Result<TaskOutcome> {
        let task = task.trim();
        if task.is_empty() {
            return Err(RegistryError::Validation("task is required".into()));
        }
        let expanded = self.vocabulary.expand_task(task);
        log::debug!("Resolving {} for '{}' (expanded: '{}')", kind, task, expanded);

        let found = match self.semantic_match(kind, &expanded).await? {
            Some(hit) => Some(hit),
            None => self.keyword_match(kind, task, &expanded).await?,
        };

        match found {
            Some(found) => {
                log::info!(
                    "Resolved {} '{}' via {:?}",
                    kind,
                    found.capability.name,
                    found.tier
                );
                self.record_usage(found.capability.id);
                Ok(TaskOutcome::Found(found))
            }
            None => {
                let suggestions = self
                    .store
                    .list(&CapabilityFilter::active(kind))
                    .await?
                    .into_iter()
                    .map(|c| c.name)
                    .collect();
                Ok(TaskOutcome::NotFound { suggestions })
            }
        }
    }

    async fn semantic_match(&self, kind: CapabilityKind, expanded: &str) -> Result<Option<TaskMatch>> {
        let vector = match self.embed(expanded).await {
            Some(v) => v,
            None => return Ok(None),
        };
        let hits = self
            .store
            .search_similar(
                kind,
                &vector,
                self.config.similar_limit,
                self.config.task_threshold,
            )
            .await?;
        Ok(hits.into_iter().next().map(|hit| TaskMatch {
            capability: hit.capability,
            tier: MatchTier::Semantic,
            score: Some(hit.similarity),
            token: None,
        }))
    }

    async fn keyword_match(
        &self,
        kind: CapabilityKind,
        task: &str,
        expanded: &str,
    ) -> Result<Option<TaskMatch>> {
        if let Some(cap) = self.first_keyword_hit(kind, task).await? {
            return Ok(Some(TaskMatch {
                capability: cap,
                tier: MatchTier::Keyword,
                score: None,
                token: None,
            }));
        }

        let mut tried = HashSet::new();
        for token in tokenize(expanded).filter(|t| t.chars().count() >= MIN_TOKEN_LEN) {
            if !tried.insert(token.clone()) {
                continue;
            }
            if let Some(cap) = self.first_keyword_hit(kind, &token).await? {
                return Ok(Some(TaskMatch {
                    capability: cap,
                    tier: MatchTier::ExpandedKeyword,
                    score: None,
                    token: Some(token),
                }));
            }
        }
        Ok(None)
    }

    /// Resolve a skill list to an agent, optionally generating one.
    pub async fn resolve_by_skills(&self, skills: &[String], allow_create: bool) -> Result<SkillOutcome> {
        let requested = normalize_terms(skills);
        if requested.is_empty() {
            return Err(RegistryError::Validation("at least one skill is required".into()));
        }
        let normalized = normalize_skills(&requested);
        let fp = fingerprint(&normalized);
        let found = |capability: Capability, source: SkillSource, similarity: Option<f64>| {
            log::info!(
                "Skills [{}] resolved to '{}' via {}",
                requested.join(", "),
                capability.name,
                source.as_str()
            );
            SkillOutcome::Found(SkillMatch {
                capability,
                source,
                similarity,
                fingerprint: fp.clone(),
            })
        };

        if let Some(cap) = self.cache.lookup(&fp).await? {
            return Ok(found(cap, SkillSource::Cache, None));
        }

        for skill in &requested {
            if let Some(cap) = self.first_keyword_hit(CapabilityKind::Agent, skill).await? {
                self.cache.remember(&fp, &normalized, cap.id).await;
                return Ok(found(cap, SkillSource::SkillMatch, None));
            }
        }

        let text = format!("Agent with skills: {}", requested.join(", "));
        if let Some(vector) = self.embed(&text).await {
            let hit = self
                .store
                .search_similar(CapabilityKind::Agent, &vector, 1, self.config.skill_threshold)
                .await?
                .into_iter()
                .next();
            if let Some(hit) = hit {
                self.cache.remember(&fp, &normalized, hit.capability.id).await;
                return Ok(found(hit.capability, SkillSource::Similar, Some(hit.similarity)));
            }
        }

        let generator = match (&self.generator, allow_create) {
            (Some(generator), true) => generator.clone(),
            _ => {
                return Ok(SkillOutcome::NotFound {
                    skills: requested.clone(),
                })
            }
        };

        if !self.cache.claim(&fp, self.config.claim_wait).await? {
            log::info!("Generation for {} already in progress; waiting", fp);
            return Ok(match self.cache.wait_for(&fp, self.config.claim_wait).await? {
                Some(cap) => found(cap, SkillSource::Cache, None),
                None => SkillOutcome::NotFound { skills: requested.clone() },
            });
        }

        let generated = self.generate(generator.as_ref(), &fp, &requested, &normalized).await;
        self.cache.release(&fp).await;
        Ok(match generated? {
            Some(cap) => found(cap, SkillSource::Generated, None),
            None => SkillOutcome::NotFound { skills: requested.clone() },
        })
    }

    /// Generate, validate and persist an agent while holding the claim.
    async fn generate(
        &self,
        generator: &dyn Generator,
        fp: &str,
        requested: &[String],
        normalized: &[String],
    ) -> Result<Option<Capability>> {
        // another caller may have finished between our cache miss and the claim
        if let Some(cap) = self.cache.lookup(fp).await? {
            return Ok(Some(cap));
        }

        let draft = match self
            .bounded("generation", generator.generate_from_skills(requested))
            .await
        {
            Some(draft) => draft,
            None => return Ok(None),
        };
        if let Err(e) = draft.validate() {
            log::warn!("Rejected generated agent '{}': {}", draft.name, e);
            return Ok(None);
        }

        let cap = self.register(draft.into_new_capability(requested)).await?;
        self.cache.remember(fp, normalized, cap.id).await;
        Ok(Some(cap))
    }

    /// Persist a new capability, embedding it first when a provider is up.
    pub async fn register(&self, new: NewCapability) -> Result<Capability> {
        let mut cap = new.into_capability();
        if cap.embedding.is_none() {
            cap.embedding = self.embed(&capability_embedding_text(&cap)).await;
        }
        let cap = self.store.create(cap).await?;
        log::info!("Registered {} '{}' ({})", cap.kind(), cap.name, cap.id);
        Ok(cap)
    }

    /// Fetch by name and count the access.
    pub async fn get(&self, kind: CapabilityKind, name: &str) -> Result<Capability> {
        let cap = self
            .store
            .get(kind, name)
            .await?
            .ok_or_else(|| RegistryError::not_found(kind.as_str(), name))?;
        self.record_usage(cap.id);
        Ok(cap)
    }

    /// Keyword search. An empty result retries each word of at least three
    /// characters and merges the hits, keeping first occurrence.
    pub async fn search(&self, kind: CapabilityKind, query: &str) -> Result<Vec<Capability>> {
        let hits = self.store.search_keyword(kind, query).await?;
        if !hits.is_empty() {
            return Ok(hits);
        }

        let mut seen = HashSet::new();
        let mut merged = Vec::new();
        for word in tokenize(query).filter(|w| w.chars().count() >= MIN_TOKEN_LEN) {
            for cap in self.store.search_keyword(kind, &word).await? {
                if seen.insert(cap.id) {
                    merged.push(cap);
                }
            }
        }
        Ok(merged)
    }

    /// Similarity search over a description and optional skills.
    ///
    /// Fails with `Degraded` when no embedding is available; there is no
    /// lower tier for this query.
    pub async fn find_similar(
        &self,
        kind: CapabilityKind,
        description: &str,
        skills: &[String],
        limit: usize,
        threshold: f64,
    ) -> Result<Vec<ScoredCapability>> {
        if self.embedder.is_none() {
            return Err(RegistryError::Degraded(
                "similarity search requires an embedding provider".into(),
            ));
        }
        let mut text = description.trim().to_string();
        if !skills.is_empty() {
            text.push_str(". Skills: ");
            text.push_str(&skills.join(", "));
        }
        let vector = self
            .embed(&text)
            .await
            .ok_or_else(|| RegistryError::Degraded("embedding provider unavailable".into()))?;
        self.store.search_similar(kind, &vector, limit, threshold).await
    }
}
