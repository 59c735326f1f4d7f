//! Durable capability storage.
//!
//! [`CapabilityStore`] is the only shared mutable resource in the system.
//! Implementations must be strongly consistent per row and provide the
//! narrow atomic operations the core relies on: counter increments, cache
//! upserts and the insert-if-absent fingerprint claim.
//!
//! Two backends ship with the crate:
//!
//! - [`MemoryStore`]: in-process, guarded by a single `RwLock`
//! - [`SqliteStore`]: rusqlite file database

pub mod memory;
pub mod sqlite;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::cache::CacheEntry;
use crate::capabilities::{Capability, CapabilityId, CapabilityKind, CapabilityStatus, ScoredCapability};
use crate::error::Result;
use crate::governance::{GovernanceAction, Report, ReportStatus, Resolution, StateChange};
use crate::reputation::{Feedback, FeedbackStats};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Listing filter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CapabilityFilter {
    pub kind: Option<CapabilityKind>,
    /// Exclude everything whose status is not `active`.
    pub active_only: bool,
    /// Keep capabilities with any matching tag, skill or category.
    pub tags: Vec<String>,
    pub limit: Option<usize>,
}

impl CapabilityFilter {
    pub fn active(kind: CapabilityKind) -> Self {
        Self {
            kind: Some(kind),
            active_only: true,
            ..Self::default()
        }
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, cap: &Capability) -> bool {
        self.kind.map_or(true, |k| cap.kind() == k)
            && (!self.active_only || cap.is_active())
            && (self.tags.is_empty() || cap.has_any_tag(&self.tags))
    }
}

/// Contract every storage backend fulfils.
///
/// Ordering guarantees:
/// - `list` and `search_keyword`: reputation descending, then usage
///   descending, then name ascending
/// - `search_similar`: similarity descending, then id ascending
/// - `list_pending_reports`: severity critical first, then oldest first
#[async_trait]
pub trait CapabilityStore: Send + Sync {
    // ---- capabilities ----

    async fn get(&self, kind: CapabilityKind, name: &str) -> Result<Option<Capability>>;

    async fn get_by_id(&self, id: CapabilityId) -> Result<Option<Capability>>;

    async fn list(&self, filter: &CapabilityFilter) -> Result<Vec<Capability>>;

    /// Active capabilities of `kind` matching `query` case-insensitively by
    /// substring of name, description, payload text or tag, or by exact skill.
    async fn search_keyword(&self, kind: CapabilityKind, query: &str) -> Result<Vec<Capability>>;

    /// Active capabilities of `kind` with an embedding whose cosine similarity
    /// to `vector` is at least `threshold`.
    async fn search_similar(
        &self,
        kind: CapabilityKind,
        vector: &[f32],
        limit: usize,
        threshold: f64,
    ) -> Result<Vec<ScoredCapability>>;

    /// Persist a new capability. Fails with `Conflict` when the name is taken
    /// within its kind.
    async fn create(&self, capability: Capability) -> Result<Capability>;

    async fn update_status(&self, id: CapabilityId, status: CapabilityStatus) -> Result<()>;

    async fn update_reputation(&self, id: CapabilityId, score: f64) -> Result<()>;

    async fn increment_usage(&self, id: CapabilityId) -> Result<()>;

    async fn count_by_status(&self, kind: CapabilityKind, status: CapabilityStatus) -> Result<u64>;

    // ---- feedback ----

    /// Store a feedback row, fold its rating into the capability's running
    /// mean and, unless the capability is a system one, recompute its
    /// reputation with [`reputation::score`](crate::reputation::score).
    ///
    /// All of it happens as one unit, so the stored score always agrees with
    /// the stored feedback aggregates. Returns the updated capability and its
    /// aggregates.
    async fn record_feedback(&self, feedback: &Feedback) -> Result<(Capability, FeedbackStats)>;

    async fn feedback_stats(&self, id: CapabilityId) -> Result<FeedbackStats>;

    // ---- reports ----

    async fn create_report(&self, report: &Report) -> Result<()>;

    async fn get_report(&self, id: Uuid) -> Result<Option<Report>>;

    /// Reports in `pending` or `reviewing` state.
    async fn list_pending_reports(&self) -> Result<Vec<Report>>;

    /// Pending reports against one capability.
    async fn count_pending_reports(&self, target_id: CapabilityId) -> Result<u64>;

    async fn count_reports(&self, status: ReportStatus) -> Result<u64>;

    async fn mark_report_reviewing(&self, id: Uuid, reviewer: &str) -> Result<()>;

    async fn resolve_report(
        &self,
        id: Uuid,
        resolution: Resolution,
        note: &str,
        resolver: &str,
    ) -> Result<()>;

    // ---- audit trail ----

    async fn record_governance_action(&self, action: &GovernanceAction) -> Result<()>;

    /// Append `action` and apply `change` to its target as one unit.
    ///
    /// The default writes the audit record first, so a failed mutation still
    /// leaves a trace. Backends with transactions override this.
    async fn apply_governance_action(
        &self,
        action: &GovernanceAction,
        change: StateChange,
    ) -> Result<()> {
        self.record_governance_action(action).await?;
        match change {
            StateChange::None => Ok(()),
            StateChange::Status(status) => self.update_status(action.target_id, status).await,
            StateChange::Reputation(score) => {
                self.update_reputation(action.target_id, score).await
            }
        }
    }

    /// Audit trail of one capability, oldest first.
    async fn list_actions(&self, target_id: CapabilityId) -> Result<Vec<GovernanceAction>>;

    async fn count_actions_since(&self, since: DateTime<Utc>) -> Result<u64>;

    // ---- skill request cache ----

    async fn get_by_fingerprint(&self, fingerprint: &str) -> Result<Option<CacheEntry>>;

    /// Bump `hit_count` and refresh `last_used`.
    async fn record_cache_hit(&self, fingerprint: &str) -> Result<()>;

    /// Map `fingerprint` to `capability_id`. New rows start with one hit;
    /// existing rows are repointed and their hit count incremented.
    async fn upsert_fingerprint(
        &self,
        fingerprint: &str,
        skills: &[String],
        capability_id: CapabilityId,
    ) -> Result<()>;

    /// Insert-if-absent claim guarding generation for a fingerprint.
    /// Returns `true` when this caller now owns the claim. A claim older than
    /// `stale_after` is taken over.
    async fn try_claim_fingerprint(&self, fingerprint: &str, stale_after: Duration) -> Result<bool>;

    async fn release_fingerprint(&self, fingerprint: &str) -> Result<()>;
}

/// Sort key shared by listings and keyword searches.
pub(crate) fn rank_by_reputation(caps: &mut [Capability]) {
    caps.sort_by(|a, b| {
        b.reputation_score
            .total_cmp(&a.reputation_score)
            .then(b.usage_count.cmp(&a.usage_count))
            .then_with(|| a.name.cmp(&b.name))
    });
}

/// Sort key for similarity hits.
pub(crate) fn rank_by_similarity(hits: &mut [ScoredCapability]) {
    hits.sort_by(|a, b| {
        b.similarity
            .total_cmp(&a.similarity)
            .then_with(|| a.capability.id.cmp(&b.capability.id))
    });
}
