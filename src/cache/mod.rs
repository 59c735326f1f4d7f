//! Skill request cache.
//!
//! Memoizes `skill set -> capability id` so repeated requests for the same
//! skills skip matching and generation. Keys are [`fingerprint`]s, which are
//! independent of order, case, surrounding whitespace and duplicates.
//!
//! Entries live in the [`CapabilityStore`]; this module only adds key
//! derivation, hit accounting and target re-validation.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::capabilities::{normalize_terms, Capability, CapabilityId};
use crate::error::Result;
use crate::store::CapabilityStore;

/// How often a waiting caller re-reads the cache.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// One cached mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fingerprint: String,
    /// Normalized skill set the fingerprint was derived from.
    pub skills: Vec<String>,
    pub capability_id: CapabilityId,
    /// Lookups served, including the one that created the entry.
    pub hit_count: u64,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
}

/// Trim, lower-case, drop empties, sort and de-duplicate.
pub fn normalize_skills<I, S>(skills: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut normalized = normalize_terms(skills);
    normalized.sort();
    normalized.dedup();
    normalized
}

/// Hex SHA-256 of the normalized skill set joined by commas.
pub fn fingerprint<I, S>(skills: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let normalized = normalize_skills(skills);
    let mut hasher = Sha256::new();
    hasher.update(normalized.join(",").as_bytes());
    hex::encode(hasher.finalize())
}

/// Store-backed cache front end used by the dispatcher.
#[derive(Clone)]
pub struct SkillRequestCache {
    store: Arc<dyn CapabilityStore>,
}

impl SkillRequestCache {
    pub fn new(store: Arc<dyn CapabilityStore>) -> Self {
        Self { store }
    }

    /// Resolve a fingerprint to a usable capability.
    ///
    /// A hit bumps the entry's hit count. An entry whose target no longer
    /// exists or is no longer active is reported as a miss.
    pub async fn lookup(&self, fingerprint: &str) -> Result<Option<Capability>> {
        let entry = match self.store.get_by_fingerprint(fingerprint).await? {
            Some(entry) => entry,
            None => return Ok(None),
        };

        match self.store.get_by_id(entry.capability_id).await? {
            Some(cap) if cap.is_active() => {
                if let Err(e) = self.store.record_cache_hit(fingerprint).await {
                    log::warn!("Failed to record cache hit for {}: {}", fingerprint, e);
                }
                Ok(Some(cap))
            }
            Some(cap) => {
                log::warn!(
                    "Cached target '{}' for {} is {}; treating as miss",
                    cap.name,
                    fingerprint,
                    cap.status()
                );
                Ok(None)
            }
            None => {
                log::warn!(
                    "Cached target {} for {} no longer exists; treating as miss",
                    entry.capability_id,
                    fingerprint
                );
                Ok(None)
            }
        }
    }

    /// Record a mapping. Failures are logged and swallowed.
    pub async fn remember(&self, fingerprint: &str, skills: &[String], capability_id: CapabilityId) {
        if let Err(e) = self
            .store
            .upsert_fingerprint(fingerprint, skills, capability_id)
            .await
        {
            log::warn!("Failed to cache skill request {}: {}", fingerprint, e);
        }
    }

    /// Take the generation claim for `fingerprint`.
    pub async fn claim(&self, fingerprint: &str, stale_after: Duration) -> Result<bool> {
        self.store.try_claim_fingerprint(fingerprint, stale_after).await
    }

    /// Drop the generation claim. Failures are logged and swallowed.
    pub async fn release(&self, fingerprint: &str) {
        if let Err(e) = self.store.release_fingerprint(fingerprint).await {
            log::warn!("Failed to release claim on {}: {}", fingerprint, e);
        }
    }

    /// Poll until another caller's mapping lands or `timeout` elapses.
    pub async fn wait_for(&self, fingerprint: &str, timeout: Duration) -> Result<Option<Capability>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(cap) = self.lookup(fingerprint).await? {
                return Ok(Some(cap));
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{
        AgentProfile, AgentStatus, CapabilityBody, CapabilityStatus, NewCapability,
    };
    use crate::store::MemoryStore;

    #[test]
    fn test_fingerprint_ignores_order_case_and_whitespace() {
        let a = fingerprint(["Docker", "kubectl"]);
        let b = fingerprint(["kubectl", "docker"]);
        let c = fingerprint([" Docker ", "KUBECTL"]);
        assert_eq!(a, b);
        assert_eq!(b, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_fingerprint_ignores_duplicates_and_empties() {
        assert_eq!(
            fingerprint(["rust", "RUST", "", "  "]),
            fingerprint(["rust"])
        );
        assert_ne!(fingerprint(["rust"]), fingerprint(["rust", "go"]));
    }

    #[test]
    fn test_normalize_skills() {
        assert_eq!(
            normalize_skills(["Go", " rust", "go", ""]),
            vec!["go".to_string(), "rust".to_string()]
        );
    }

    async fn store_with_agent() -> (Arc<MemoryStore>, Capability) {
        let store = Arc::new(MemoryStore::new());
        let cap = NewCapability::new(
            "k8s-operator",
            "Operates clusters",
            CapabilityBody::agent(AgentProfile {
                model: "sonnet".into(),
                prompt: "Operate".into(),
                tools: vec![],
            }),
        )
        .into_capability();
        let cap = store.create(cap).await.unwrap();
        (store, cap)
    }

    #[tokio::test]
    async fn test_hit_counts_every_lookup() {
        let (store, cap) = store_with_agent().await;
        let cache = SkillRequestCache::new(store.clone());
        let skills = normalize_skills(["kubectl", "docker"]);
        let fp = fingerprint(&skills);

        assert!(cache.lookup(&fp).await.unwrap().is_none());
        cache.remember(&fp, &skills, cap.id).await;
        assert_eq!(store.get_by_fingerprint(&fp).await.unwrap().unwrap().hit_count, 1);

        let hit = cache.lookup(&fp).await.unwrap().unwrap();
        assert_eq!(hit.id, cap.id);
        assert_eq!(store.get_by_fingerprint(&fp).await.unwrap().unwrap().hit_count, 2);
    }

    #[tokio::test]
    async fn test_inactive_target_is_a_miss() {
        let (store, cap) = store_with_agent().await;
        let cache = SkillRequestCache::new(store.clone());
        let skills = normalize_skills(["kubectl"]);
        let fp = fingerprint(&skills);
        cache.remember(&fp, &skills, cap.id).await;

        store
            .update_status(cap.id, CapabilityStatus::Agent(AgentStatus::Banned))
            .await
            .unwrap();
        assert!(cache.lookup(&fp).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claim_is_exclusive_until_released() {
        let (store, _) = store_with_agent().await;
        let cache = SkillRequestCache::new(store);
        let fp = fingerprint(["terraform"]);
        let stale = Duration::from_secs(60);

        assert!(cache.claim(&fp, stale).await.unwrap());
        assert!(!cache.claim(&fp, stale).await.unwrap());
        cache.release(&fp).await;
        assert!(cache.claim(&fp, stale).await.unwrap());
    }

    #[tokio::test]
    async fn test_wait_for_times_out() {
        let (store, _) = store_with_agent().await;
        let cache = SkillRequestCache::new(store);
        let found = cache
            .wait_for(&fingerprint(["nothing"]), Duration::from_millis(120))
            .await
            .unwrap();
        assert!(found.is_none());
    }
}
