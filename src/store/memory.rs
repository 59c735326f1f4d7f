//! In-process store.
//!
//! Every operation takes one lock on the shared state, so each call is
//! atomic and reads observe all earlier writes.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use super::{rank_by_reputation, rank_by_similarity, CapabilityFilter, CapabilityStore};
use crate::cache::CacheEntry;
use crate::capabilities::{
    Capability, CapabilityId, CapabilityKind, CapabilityStatus, ScoredCapability,
};
use crate::embeddings::cosine_similarity;
use crate::error::{RegistryError, Result};
use crate::governance::{GovernanceAction, Report, ReportStatus, Resolution, StateChange};
use crate::reputation::{score, Feedback, FeedbackStats};

#[derive(Default)]
struct State {
    capabilities: HashMap<CapabilityId, Capability>,
    names: HashMap<(CapabilityKind, String), CapabilityId>,
    feedback: Vec<Feedback>,
    reports: HashMap<Uuid, Report>,
    actions: Vec<GovernanceAction>,
    cache: HashMap<String, CacheEntry>,
    claims: HashMap<String, DateTime<Utc>>,
}

impl State {
    fn capability_mut(&mut self, id: CapabilityId) -> Result<&mut Capability> {
        self.capabilities
            .get_mut(&id)
            .ok_or_else(|| RegistryError::not_found("capability", id))
    }

    fn report_mut(&mut self, id: Uuid) -> Result<&mut Report> {
        self.reports
            .get_mut(&id)
            .ok_or_else(|| RegistryError::not_found("report", id))
    }
}

fn stats_of(feedback: &[Feedback], id: CapabilityId) -> FeedbackStats {
    let mut stats = FeedbackStats::default();
    for f in feedback.iter().filter(|f| f.capability_id == id) {
        stats.add(f);
    }
    stats
}

/// Store backed by process memory. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<State>,
    #[cfg(test)]
    fail_status_updates: std::sync::atomic::AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every status change fail with a persistence error.
    #[cfg(test)]
    pub(crate) fn fail_status_updates(&self, fail: bool) {
        self.fail_status_updates
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    #[cfg(test)]
    fn check_status_writable(&self) -> Result<()> {
        if self
            .fail_status_updates
            .load(std::sync::atomic::Ordering::SeqCst)
        {
            return Err(RegistryError::Persistence("status updates disabled".into()));
        }
        Ok(())
    }

    #[cfg(not(test))]
    fn check_status_writable(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl CapabilityStore for MemoryStore {
    async fn get(&self, kind: CapabilityKind, name: &str) -> Result<Option<Capability>> {
        let state = self.state.read();
        Ok(state
            .names
            .get(&(kind, name.to_string()))
            .and_then(|id| state.capabilities.get(id))
            .cloned())
    }

    async fn get_by_id(&self, id: CapabilityId) -> Result<Option<Capability>> {
        Ok(self.state.read().capabilities.get(&id).cloned())
    }

    async fn list(&self, filter: &CapabilityFilter) -> Result<Vec<Capability>> {
        let mut caps: Vec<Capability> = self
            .state
            .read()
            .capabilities
            .values()
            .filter(|c| filter.matches(c))
            .cloned()
            .collect();
        rank_by_reputation(&mut caps);
        if let Some(limit) = filter.limit {
            caps.truncate(limit);
        }
        Ok(caps)
    }

    async fn search_keyword(&self, kind: CapabilityKind, query: &str) -> Result<Vec<Capability>> {
        let mut caps: Vec<Capability> = self
            .state
            .read()
            .capabilities
            .values()
            .filter(|c| c.kind() == kind && c.is_active() && c.matches_keyword(query))
            .cloned()
            .collect();
        rank_by_reputation(&mut caps);
        Ok(caps)
    }

    async fn search_similar(
        &self,
        kind: CapabilityKind,
        vector: &[f32],
        limit: usize,
        threshold: f64,
    ) -> Result<Vec<ScoredCapability>> {
        let mut hits: Vec<ScoredCapability> = self
            .state
            .read()
            .capabilities
            .values()
            .filter(|c| c.kind() == kind && c.is_active())
            .filter_map(|c| {
                let similarity = cosine_similarity(c.embedding.as_deref()?, vector);
                (similarity >= threshold).then(|| ScoredCapability {
                    capability: c.clone(),
                    similarity,
                })
            })
            .collect();
        rank_by_similarity(&mut hits);
        hits.truncate(limit);
        Ok(hits)
    }

    async fn create(&self, capability: Capability) -> Result<Capability> {
        let mut state = self.state.write();
        let key = (capability.kind(), capability.name.clone());
        if state.names.contains_key(&key) {
            return Err(RegistryError::Conflict(format!(
                "{} '{}' already exists",
                capability.kind(),
                capability.name
            )));
        }
        state.names.insert(key, capability.id);
        state.capabilities.insert(capability.id, capability.clone());
        Ok(capability)
    }

    async fn update_status(&self, id: CapabilityId, status: CapabilityStatus) -> Result<()> {
        self.check_status_writable()?;
        let mut state = self.state.write();
        let cap = state.capability_mut(id)?;
        cap.body.set_status(status)?;
        cap.updated_at = Utc::now();
        Ok(())
    }

    async fn update_reputation(&self, id: CapabilityId, score: f64) -> Result<()> {
        let mut state = self.state.write();
        let cap = state.capability_mut(id)?;
        cap.reputation_score = score;
        cap.updated_at = Utc::now();
        Ok(())
    }

    async fn increment_usage(&self, id: CapabilityId) -> Result<()> {
        let mut state = self.state.write();
        let cap = state.capability_mut(id)?;
        cap.usage_count += 1;
        Ok(())
    }

    async fn count_by_status(&self, kind: CapabilityKind, status: CapabilityStatus) -> Result<u64> {
        Ok(self
            .state
            .read()
            .capabilities
            .values()
            .filter(|c| c.kind() == kind && c.status() == status)
            .count() as u64)
    }

    async fn record_feedback(&self, feedback: &Feedback) -> Result<(Capability, FeedbackStats)> {
        let mut state = self.state.write();
        let cap = state.capability_mut(feedback.capability_id)?;
        let total = cap.avg_rating * cap.feedback_count as f64 + feedback.rating as f64;
        cap.feedback_count += 1;
        cap.avg_rating = total / cap.feedback_count as f64;
        cap.updated_at = Utc::now();

        state.feedback.push(feedback.clone());
        let stats = stats_of(&state.feedback, feedback.capability_id);

        let cap = state.capability_mut(feedback.capability_id)?;
        if !cap.is_system {
            cap.reputation_score = score(
                cap.feedback_count,
                cap.avg_rating,
                cap.usage_count,
                stats.success_rate(),
            );
        }
        Ok((cap.clone(), stats))
    }

    async fn feedback_stats(&self, id: CapabilityId) -> Result<FeedbackStats> {
        Ok(stats_of(&self.state.read().feedback, id))
    }

    async fn create_report(&self, report: &Report) -> Result<()> {
        self.state.write().reports.insert(report.id, report.clone());
        Ok(())
    }

    async fn get_report(&self, id: Uuid) -> Result<Option<Report>> {
        Ok(self.state.read().reports.get(&id).cloned())
    }

    async fn list_pending_reports(&self) -> Result<Vec<Report>> {
        let mut reports: Vec<Report> = self
            .state
            .read()
            .reports
            .values()
            .filter(|r| matches!(r.status, ReportStatus::Pending | ReportStatus::Reviewing))
            .cloned()
            .collect();
        reports.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        Ok(reports)
    }

    async fn count_pending_reports(&self, target_id: CapabilityId) -> Result<u64> {
        Ok(self
            .state
            .read()
            .reports
            .values()
            .filter(|r| r.target_id == target_id && r.status == ReportStatus::Pending)
            .count() as u64)
    }

    async fn count_reports(&self, status: ReportStatus) -> Result<u64> {
        Ok(self
            .state
            .read()
            .reports
            .values()
            .filter(|r| r.status == status)
            .count() as u64)
    }

    async fn mark_report_reviewing(&self, id: Uuid, reviewer: &str) -> Result<()> {
        let mut state = self.state.write();
        let report = state.report_mut(id)?;
        report.status = ReportStatus::Reviewing;
        report.reviewed_by = Some(reviewer.to_string());
        Ok(())
    }

    async fn resolve_report(
        &self,
        id: Uuid,
        resolution: Resolution,
        note: &str,
        resolver: &str,
    ) -> Result<()> {
        let mut state = self.state.write();
        let report = state.report_mut(id)?;
        report.status = ReportStatus::Resolved;
        report.resolution = Some(resolution);
        report.resolution_note = Some(note.to_string());
        report.reviewed_by = Some(resolver.to_string());
        report.resolved_at = Some(Utc::now());
        Ok(())
    }

    async fn record_governance_action(&self, action: &GovernanceAction) -> Result<()> {
        self.state.write().actions.push(action.clone());
        Ok(())
    }

    async fn apply_governance_action(
        &self,
        action: &GovernanceAction,
        change: StateChange,
    ) -> Result<()> {
        if matches!(change, StateChange::Status(_)) {
            self.check_status_writable()?;
        }
        let mut state = self.state.write();
        let cap = state.capability_mut(action.target_id)?;
        match change {
            StateChange::None => {}
            StateChange::Status(status) => cap.body.set_status(status)?,
            StateChange::Reputation(score) => cap.reputation_score = score,
        }
        if change != StateChange::None {
            cap.updated_at = Utc::now();
        }
        state.actions.push(action.clone());
        Ok(())
    }

    async fn list_actions(&self, target_id: CapabilityId) -> Result<Vec<GovernanceAction>> {
        Ok(self
            .state
            .read()
            .actions
            .iter()
            .filter(|a| a.target_id == target_id)
            .cloned()
            .collect())
    }

    async fn count_actions_since(&self, since: DateTime<Utc>) -> Result<u64> {
        Ok(self
            .state
            .read()
            .actions
            .iter()
            .filter(|a| a.created_at >= since)
            .count() as u64)
    }

    async fn get_by_fingerprint(&self, fingerprint: &str) -> Result<Option<CacheEntry>> {
        Ok(self.state.read().cache.get(fingerprint).cloned())
    }

    async fn record_cache_hit(&self, fingerprint: &str) -> Result<()> {
        if let Some(entry) = self.state.write().cache.get_mut(fingerprint) {
            entry.hit_count += 1;
            entry.last_used = Utc::now();
        }
        Ok(())
    }

    async fn upsert_fingerprint(
        &self,
        fingerprint: &str,
        skills: &[String],
        capability_id: CapabilityId,
    ) -> Result<()> {
        let now = Utc::now();
        self.state
            .write()
            .cache
            .entry(fingerprint.to_string())
            .and_modify(|e| {
                e.capability_id = capability_id;
                e.hit_count += 1;
                e.last_used = now;
            })
            .or_insert_with(|| CacheEntry {
                fingerprint: fingerprint.to_string(),
                skills: skills.to_vec(),
                capability_id,
                hit_count: 1,
                created_at: now,
                last_used: now,
            });
        Ok(())
    }

    async fn try_claim_fingerprint(&self, fingerprint: &str, stale_after: Duration) -> Result<bool> {
        let now = Utc::now();
        let stale_after = chrono::Duration::from_std(stale_after)
            .map_err(|e| RegistryError::Validation(format!("invalid claim age: {}", e)))?;
        let mut state = self.state.write();
        match state.claims.get(fingerprint) {
            Some(claimed_at) if now - *claimed_at < stale_after => Ok(false),
            _ => {
                state.claims.insert(fingerprint.to_string(), now);
                Ok(true)
            }
        }
    }

    async fn release_fingerprint(&self, fingerprint: &str) -> Result<()> {
        self.state.write().claims.remove(fingerprint);
        Ok(())
    }
}
