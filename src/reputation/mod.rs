//! # Reputation
//!
//! [`score`] is the single scoring model. [`ReputationLedger`] drives it from
//! stored feedback: every submission folds the rating into the capability's
//! running mean and then recomputes the score from scratch.
//!
//! Governance adjustments do not go through [`score`]; they add a delta to
//! the stored value and re-clamp with [`clamp_score`].

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::capabilities::{Capability, CapabilityId, CapabilityKind, CapabilitySummary};
use crate::error::{RegistryError, Result};
use crate::store::{CapabilityFilter, CapabilityStore};

pub const MIN_SCORE: f64 = 0.0;
pub const MAX_SCORE: f64 = 100.0;

const BASE_SCORE: f64 = 50.0;
const RATING_WEIGHT: f64 = 10.0;
const SUCCESS_WEIGHT: f64 = 20.0;
const USAGE_MULTIPLIER: f64 = 5.0;

/// Compute a trust score in `[0, 100]`.
///
/// `50 + avg_rating * 10 (only with feedback) + success_rate * 20 + 5 * log10(usage)`,
/// where the usage term is zero for zero usage.
pub fn score(feedback_count: u64, avg_rating: f64, usage_count: u64, success_rate: f64) -> f64 {
    let mut s = BASE_SCORE;
    if feedback_count > 0 {
        s += avg_rating * RATING_WEIGHT;
    }
    s += success_rate * SUCCESS_WEIGHT;
    s += USAGE_MULTIPLIER * log10_or_zero(usage_count as f64);
    clamp_score(s)
}

/// Clamp into `[0, 100]`.
pub fn clamp_score(value: f64) -> f64 {
    value.clamp(MIN_SCORE, MAX_SCORE)
}

fn log10_or_zero(x: f64) -> f64 {
    if x <= 0.0 {
        0.0
    } else {
        x.log10()
    }
}

/// One feedback submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feedback {
    pub id: Uuid,
    pub capability_id: CapabilityId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// 1 to 5.
    pub rating: u8,
    pub task_success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback_text: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Client input for [`ReputationLedger::submit_feedback`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedbackInput {
    pub name: String,
    pub rating: u8,
    pub task_success: bool,
    pub task_type: Option<String>,
    pub feedback_text: Option<String>,
    pub session_id: Option<String>,
}

/// Aggregates over every feedback row of one capability.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeedbackStats {
    pub total: u64,
    pub successes: u64,
    pub rating_distribution: BTreeMap<u8, u64>,
    pub task_type_breakdown: BTreeMap<String, u64>,
}

impl FeedbackStats {
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.successes as f64 / self.total as f64
        }
    }

    /// Fold one row into the aggregates.
    pub fn add(&mut self, feedback: &Feedback) {
        self.total += 1;
        if feedback.task_success {
            self.successes += 1;
        }
        *self.rating_distribution.entry(feedback.rating).or_default() += 1;
        if let Some(task_type) = feedback.task_type.as_deref().filter(|t| !t.is_empty()) {
            *self
                .task_type_breakdown
                .entry(task_type.to_string())
                .or_default() += 1;
        }
    }
}

/// Detailed reputation view of one capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReputationReport {
    pub capability_id: CapabilityId,
    pub name: String,
    pub kind: CapabilityKind,
    pub reputation_score: f64,
    pub usage_count: u64,
    pub feedback_count: u64,
    pub avg_rating: f64,
    pub success_rate: f64,
    pub rating_distribution: BTreeMap<u8, u64>,
    pub task_type_breakdown: BTreeMap<String, u64>,
}

impl ReputationReport {
    fn new(cap: &Capability, stats: FeedbackStats) -> Self {
        Self {
            capability_id: cap.id,
            name: cap.name.clone(),
            kind: cap.kind(),
            reputation_score: cap.reputation_score,
            usage_count: cap.usage_count,
            feedback_count: cap.feedback_count,
            avg_rating: cap.avg_rating,
            success_rate: stats.success_rate(),
            rating_distribution: stats.rating_distribution,
            task_type_breakdown: stats.task_type_breakdown,
        }
    }
}

/// Feedback intake and reputation queries.
#[derive(Clone)]
pub struct ReputationLedger {
    store: Arc<dyn CapabilityStore>,
}

impl ReputationLedger {
    pub fn new(store: Arc<dyn CapabilityStore>) -> Self {
        Self { store }
    }

    /// Record feedback and recompute the score.
    ///
    /// The store folds the rating in and recomputes the score in one step, so
    /// concurrent submissions cannot leave a stale score behind. System
    /// capabilities keep their feedback history but their score is never
    /// recomputed.
    pub async fn submit_feedback(
        &self,
        kind: CapabilityKind,
        input: FeedbackInput,
    ) -> Result<ReputationReport> {
        if !(1..=5).contains(&input.rating) {
            return Err(RegistryError::Validation(format!(
                "rating must be between 1 and 5, got {}",
                input.rating
            )));
        }

        let cap = self
            .store
            .get(kind, &input.name)
            .await?
            .ok_or_else(|| RegistryError::not_found(kind.as_str(), &input.name))?;

        let feedback = Feedback {
            id: Uuid::new_v4(),
            capability_id: cap.id,
            session_id: input.session_id,
            rating: input.rating,
            task_success: input.task_success,
            task_type: input.task_type,
            feedback_text: input.feedback_text,
            created_at: Utc::now(),
        };
        let (updated, stats) = self.store.record_feedback(&feedback).await?;
        log::debug!(
            "{} '{}' reputation {:.1} -> {:.1}",
            kind,
            updated.name,
            cap.reputation_score,
            updated.reputation_score
        );

        Ok(ReputationReport::new(&updated, stats))
    }

    pub async fn get_reputation(&self, kind: CapabilityKind, name: &str) -> Result<ReputationReport> {
        let cap = self
            .store
            .get(kind, name)
            .await?
            .ok_or_else(|| RegistryError::not_found(kind.as_str(), name))?;
        let stats = self.store.feedback_stats(cap.id).await?;
        Ok(ReputationReport::new(&cap, stats))
    }

    /// Highest-ranked active capabilities, optionally restricted by tag.
    pub async fn top(
        &self,
        kind: CapabilityKind,
        limit: usize,
        tags: Vec<String>,
    ) -> Result<Vec<CapabilitySummary>> {
        let filter = CapabilityFilter::active(kind).with_tags(tags).with_limit(limit);
        let caps = self.store.list(&filter).await?;
        Ok(caps.iter().map(Capability::summary).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{AgentProfile, CapabilityBody, NewCapability};
    use crate::store::MemoryStore;

    #[test]
    fn test_neutral_score() {
        assert_eq!(score(0, 0.0, 0, 0.0), 50.0);
        // avg rating is ignored without feedback
        assert_eq!(score(0, 5.0, 0, 0.0), 50.0);
    }

    #[test]
    fn test_usage_bonus_is_logarithmic() {
        assert!((score(0, 0.0, 10, 0.0) - 55.0).abs() < 1e-9);
        assert!((score(0, 0.0, 100, 0.0) - 60.0).abs() < 1e-9);
        assert_eq!(score(0, 0.0, 1, 0.0), 50.0);
    }

    #[test]
    fn test_score_is_bounded() {
        for fc in [0u64, 1, 10, 1000] {
            for rating in [0.0, 1.0, 2.5, 5.0] {
                for usage in [0u64, 1, 9, 1_000_000] {
                    for sr in [0.0, 0.5, 1.0] {
                        let s = score(fc, rating, usage, sr);
                        assert!((MIN_SCORE..=MAX_SCORE).contains(&s), "{}", s);
                    }
                }
            }
        }
        assert_eq!(score(5, 5.0, 1000, 1.0), 100.0);
    }

    #[test]
    fn test_score_is_monotonic() {
        let mut prev = score(1, 0.0, 0, 0.0);
        for step in 1..=10 {
            let s = score(1, step as f64 * 0.5, 0, 0.0);
            assert!(s >= prev);
            prev = s;
        }

        let mut prev = score(1, 1.0, 0, 0.0);
        for step in 1..=10 {
            let s = score(1, 1.0, 0, step as f64 / 10.0);
            assert!(s >= prev);
            prev = s;
        }

        let mut prev = score(1, 1.0, 0, 0.5);
        for usage in [1u64, 2, 10, 50, 500, 10_000] {
            let s = score(1, 1.0, usage, 0.5);
            assert!(s >= prev);
            prev = s;
        }
    }

    #[test]
    fn test_clamp_score() {
        assert_eq!(clamp_score(-12.0), 0.0);
        assert_eq!(clamp_score(140.0), 100.0);
        assert_eq!(clamp_score(42.5), 42.5);
    }

    async fn ledger_with_agent(system: bool) -> (ReputationLedger, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let mut draft = NewCapability::new(
            "tester",
            "Writes tests",
            CapabilityBody::agent(AgentProfile {
                model: "sonnet".into(),
                prompt: "Write thorough tests".into(),
                tools: vec![],
            }),
        );
        draft.is_system = system;
        store.create(draft.into_capability()).await.unwrap();
        (ReputationLedger::new(store.clone()), store)
    }

    fn feedback(rating: u8, success: bool, task_type: &str) -> FeedbackInput {
        FeedbackInput {
            name: "tester".into(),
            rating,
            task_success: success,
            task_type: Some(task_type.into()),
            ..FeedbackInput::default()
        }
    }

    #[tokio::test]
    async fn test_submit_feedback_recomputes_score() {
        let (ledger, _) = ledger_with_agent(false).await;

        let report = ledger
            .submit_feedback(CapabilityKind::Agent, feedback(3, true, "unit"))
            .await
            .unwrap();
        assert_eq!(report.feedback_count, 1);
        assert_eq!(report.avg_rating, 3.0);
        assert_eq!(report.success_rate, 1.0);
        // 50 + 30 + 20
        assert_eq!(report.reputation_score, 100.0);

        let report = ledger
            .submit_feedback(CapabilityKind::Agent, feedback(1, false, "e2e"))
            .await
            .unwrap();
        assert_eq!(report.feedback_count, 2);
        assert_eq!(report.avg_rating, 2.0);
        assert_eq!(report.success_rate, 0.5);
        // 50 + 20 + 10
        assert_eq!(report.reputation_score, 80.0);
        assert_eq!(report.rating_distribution.get(&1), Some(&1));
        assert_eq!(report.task_type_breakdown.get("e2e"), Some(&1));
    }

    #[tokio::test]
    async fn test_rating_out_of_range_is_rejected() {
        let (ledger, _) = ledger_with_agent(false).await;
        let err = ledger
            .submit_feedback(CapabilityKind::Agent, feedback(6, true, "unit"))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Validation(_)));
        let err = ledger
            .submit_feedback(CapabilityKind::Agent, feedback(0, true, "unit"))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Validation(_)));
    }

    #[tokio::test]
    async fn test_system_score_is_not_recomputed() {
        let (ledger, store) = ledger_with_agent(true).await;
        let report = ledger
            .submit_feedback(CapabilityKind::Agent, feedback(5, true, "unit"))
            .await
            .unwrap();
        assert_eq!(report.reputation_score, 50.0);
        assert_eq!(report.feedback_count, 1);
        let stored = store.get(CapabilityKind::Agent, "tester").await.unwrap().unwrap();
        assert_eq!(stored.reputation_score, 50.0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_feedback_keeps_score_consistent() {
        let (ledger, store) = ledger_with_agent(false).await;
        let mut handles = Vec::new();
        for i in 0..24u8 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                ledger
                    .submit_feedback(CapabilityKind::Agent, feedback(1 + i % 2, i % 3 == 0, "unit"))
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let stored = store.get(CapabilityKind::Agent, "tester").await.unwrap().unwrap();
        let stats = store.feedback_stats(stored.id).await.unwrap();
        assert_eq!(stored.feedback_count, 24);
        assert_eq!(stats.total, 24);
        let expected = score(
            stored.feedback_count,
            stored.avg_rating,
            stored.usage_count,
            stats.success_rate(),
        );
        assert!((stored.reputation_score - expected).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_unknown_capability() {
        let (ledger, _) = ledger_with_agent(false).await;
        let err = ledger
            .get_reputation(CapabilityKind::Skill, "tester")
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::NotFound { .. }));
    }
}
