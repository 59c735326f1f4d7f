//! # Governance
//!
//! Role-gated lifecycle control for agents.
//!
//! ```text
//!            quarantine (police, judge)
//!            or N pending reports
//!   Active ─────────────────────────▶ Quarantined
//!     ▲  │                               │
//!     │  │      unquarantine (judge)     │
//!     │  └──────────────┐  ◀─────────────┘
//!     │                 ▼
//!     │        ban (executioner)
//!     └──────────────▶ Banned (terminal)
//! ```
//!
//! Every transition appends a [`GovernanceAction`] carrying the previous
//! status and reputation, applied atomically with the change itself.
//! System capabilities are rejected at every entry point.

pub mod permissions;
pub mod types;

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

pub use permissions::Permissions;
pub use types::{
    GovernanceAction, GovernanceActionType, GovernanceRole, GovernanceStats, NewReport, Report,
    ReportStatus, ReportType, Resolution, Severity, StateChange,
};

use crate::capabilities::{AgentStatus, Capability, CapabilityId, CapabilityKind, CapabilityStatus, CapabilitySummary};
use crate::config::GovernanceConfig;
use crate::error::{RegistryError, Result};
use crate::reputation::clamp_score;
use crate::store::{CapabilityFilter, CapabilityStore};

const QUARANTINED: CapabilityStatus = CapabilityStatus::Agent(AgentStatus::Quarantined);
const BANNED: CapabilityStatus = CapabilityStatus::Agent(AgentStatus::Banned);
const ACTIVE: CapabilityStatus = CapabilityStatus::Agent(AgentStatus::Active);

/// Executes governance operations against a [`CapabilityStore`].
#[derive(Clone)]
pub struct GovernanceEngine {
    store: Arc<dyn CapabilityStore>,
    permissions: Permissions,
    config: GovernanceConfig,
}

impl GovernanceEngine {
    pub fn new(store: Arc<dyn CapabilityStore>, config: GovernanceConfig) -> Self {
        Self {
            store,
            permissions: Permissions::default(),
            config,
        }
    }

    pub fn with_permissions(mut self, permissions: Permissions) -> Self {
        self.permissions = permissions;
        self
    }

    pub fn permissions(&self) -> &Permissions {
        &self.permissions
    }

    pub fn config(&self) -> &GovernanceConfig {
        &self.config
    }

    fn ensure_enabled(&self) -> Result<()> {
        if self.config.enabled {
            Ok(())
        } else {
            Err(RegistryError::Forbidden("governance is disabled".into()))
        }
    }

    async fn load_agent(&self, id: CapabilityId) -> Result<Capability> {
        let cap = self
            .store
            .get_by_id(id)
            .await?
            .ok_or_else(|| RegistryError::not_found("agent", id))?;
        if cap.kind() != CapabilityKind::Agent {
            return Err(RegistryError::Validation(format!(
                "governance applies to agents only; '{}' is a {}",
                cap.name,
                cap.kind()
            )));
        }
        Ok(cap)
    }

    /// Resolve an agent by name for callers that address targets by name.
    pub async fn find_agent(&self, name: &str) -> Result<Capability> {
        self.store
            .get(CapabilityKind::Agent, name)
            .await?
            .ok_or_else(|| RegistryError::not_found("agent", name))
    }

    /// The shared prologue of every mutating action: switch, role gate,
    /// target lookup and system immunity, in that order.
    async fn authorize_on(
        &self,
        role: GovernanceRole,
        action: GovernanceActionType,
        target_id: CapabilityId,
    ) -> Result<Capability> {
        self.ensure_enabled()?;
        self.permissions.authorize(role, action)?;
        let cap = self.load_agent(target_id).await?;
        if cap.is_system {
            return Err(RegistryError::Forbidden(format!(
                "system agents are immune to {}",
                action
            )));
        }
        Ok(cap)
    }

    async fn apply(
        &self,
        cap: &Capability,
        action_type: GovernanceActionType,
        role: GovernanceRole,
        reason: &str,
        report_id: Option<Uuid>,
        change: StateChange,
    ) -> Result<GovernanceAction> {
        let action = GovernanceAction {
            id: Uuid::new_v4(),
            target_id: cap.id,
            target_name: cap.name.clone(),
            report_id,
            action_type,
            role,
            reason: reason.to_string(),
            previous_status: Some(cap.status()),
            previous_reputation: Some(cap.reputation_score),
            created_at: Utc::now(),
        };
        self.store.apply_governance_action(&action, change).await?;
        log::info!(
            "{} {} agent '{}' ({})",
            role,
            action_type,
            cap.name,
            reason
        );
        Ok(action)
    }

    /// File a report against an agent, then quarantine it automatically once
    /// its pending reports reach the configured threshold.
    ///
    /// The automatic quarantine is best-effort: if it fails, the report
    /// still stands.
    pub async fn create_report(&self, input: NewReport, reported_by: &str) -> Result<Report> {
        self.ensure_enabled()?;
        if input.description.trim().is_empty() {
            return Err(RegistryError::Validation("description is required".into()));
        }

        let cap = self.find_agent(&input.target_name).await?;
        if cap.is_system {
            return Err(RegistryError::Forbidden(
                "system agents cannot be reported".into(),
            ));
        }

        let report = Report {
            id: Uuid::new_v4(),
            target_id: cap.id,
            target_name: cap.name.clone(),
            reported_by: reported_by.to_string(),
            report_type: input.report_type,
            severity: input.severity,
            description: input.description,
            evidence: input.evidence,
            status: ReportStatus::Pending,
            reviewed_by: None,
            resolution: None,
            resolution_note: None,
            created_at: Utc::now(),
            resolved_at: None,
        };
        self.store.create_report(&report).await?;
        log::info!(
            "Report {} filed against '{}' ({}, {})",
            report.id,
            cap.name,
            report.report_type,
            report.severity
        );

        if cap.status() == ACTIVE {
            self.auto_quarantine(&cap, report.id).await;
        }
        Ok(report)
    }

    async fn auto_quarantine(&self, cap: &Capability, report_id: Uuid) {
        let pending = match self.store.count_pending_reports(cap.id).await {
            Ok(n) => n,
            Err(e) => {
                log::warn!("Failed to count reports for '{}': {}", cap.name, e);
                return;
            }
        };
        if pending < self.config.auto_quarantine_threshold {
            return;
        }

        let reason = format!("Auto-quarantine: {} pending reports", pending);
        if let Err(e) = self
            .quarantine(cap.id, GovernanceRole::Police, &reason, Some(report_id))
            .await
        {
            log::warn!("Auto-quarantine of '{}' failed: {}", cap.name, e);
        }
    }

    /// Move an agent out of the active pool. Rejected once banned.
    pub async fn quarantine(
        &self,
        target_id: CapabilityId,
        role: GovernanceRole,
        reason: &str,
        report_id: Option<Uuid>,
    ) -> Result<GovernanceAction> {
        let cap = self
            .authorize_on(role, GovernanceActionType::Quarantine, target_id)
            .await?;
        if cap.is_banned() {
            return Err(RegistryError::Forbidden(format!(
                "agent '{}' is already banned",
                cap.name
            )));
        }
        self.apply(
            &cap,
            GovernanceActionType::Quarantine,
            role,
            reason,
            report_id,
            StateChange::Status(QUARANTINED),
        )
        .await
    }

    /// Return a quarantined agent to the active pool.
    pub async fn unquarantine(
        &self,
        target_id: CapabilityId,
        role: GovernanceRole,
        reason: &str,
    ) -> Result<GovernanceAction> {
        let cap = self
            .authorize_on(role, GovernanceActionType::Unquarantine, target_id)
            .await?;
        if cap.status() != QUARANTINED {
            return Err(RegistryError::Validation(format!(
                "agent '{}' is not quarantined (status: {})",
                cap.name,
                cap.status()
            )));
        }
        self.apply(
            &cap,
            GovernanceActionType::Unquarantine,
            role,
            reason,
            None,
            StateChange::Status(ACTIVE),
        )
        .await
    }

    /// Add `delta` to the stored score and clamp into `[0, 100]`.
    ///
    /// Recorded as `promote` for a positive delta and `demote` otherwise.
    /// Banned agents may still be adjusted.
    pub async fn adjust_reputation(
        &self,
        target_id: CapabilityId,
        role: GovernanceRole,
        delta: f64,
        reason: &str,
    ) -> Result<GovernanceAction> {
        if !delta.is_finite() {
            return Err(RegistryError::Validation(format!(
                "reputation delta must be finite, got {}",
                delta
            )));
        }
        let action_type = if delta > 0.0 {
            GovernanceActionType::Promote
        } else {
            GovernanceActionType::Demote
        };
        let cap = self.authorize_on(role, action_type, target_id).await?;
        let new_score = clamp_score(cap.reputation_score + delta);
        self.apply(
            &cap,
            action_type,
            role,
            reason,
            None,
            StateChange::Reputation(new_score),
        )
        .await
    }

    /// Ban an agent permanently. Banning twice is allowed.
    pub async fn execute_ban(
        &self,
        target_id: CapabilityId,
        role: GovernanceRole,
        report_id: Option<Uuid>,
        reason: &str,
    ) -> Result<GovernanceAction> {
        let cap = self
            .authorize_on(role, GovernanceActionType::Ban, target_id)
            .await?;
        self.apply(
            &cap,
            GovernanceActionType::Ban,
            role,
            reason,
            report_id,
            StateChange::Status(BANNED),
        )
        .await
    }

    /// Record a warning. Status and reputation are left untouched.
    pub async fn warn(
        &self,
        target_id: CapabilityId,
        role: GovernanceRole,
        reason: &str,
        report_id: Option<Uuid>,
    ) -> Result<GovernanceAction> {
        let cap = self
            .authorize_on(role, GovernanceActionType::Warn, target_id)
            .await?;
        self.apply(
            &cap,
            GovernanceActionType::Warn,
            role,
            reason,
            report_id,
            StateChange::None,
        )
        .await
    }

    /// Mark a report as under review.
    pub async fn review_report(&self, report_id: Uuid, reviewer: &str) -> Result<()> {
        self.ensure_enabled()?;
        self.store.mark_report_reviewing(report_id, reviewer).await
    }

    /// Resolve a report. The target capability is not touched; callers apply
    /// any quarantine or ban the ruling calls for separately.
    pub async fn make_ruling(
        &self,
        report_id: Uuid,
        resolution: Resolution,
        note: &str,
        judge_id: &str,
    ) -> Result<()> {
        self.ensure_enabled()?;
        self.store
            .resolve_report(report_id, resolution, note, judge_id)
            .await?;
        log::info!("Report {} resolved as {} by {}", report_id, resolution, judge_id);
        Ok(())
    }

    pub async fn get_stats(&self) -> Result<GovernanceStats> {
        let now = Utc::now();
        Ok(GovernanceStats {
            pending_reports: self.store.count_reports(ReportStatus::Pending).await?,
            reviewing_reports: self.store.count_reports(ReportStatus::Reviewing).await?,
            quarantined_count: self
                .store
                .count_by_status(CapabilityKind::Agent, QUARANTINED)
                .await?,
            banned_count: self.store.count_by_status(CapabilityKind::Agent, BANNED).await?,
            actions_last_24h: self
                .store
                .count_actions_since(now - chrono::Duration::hours(24))
                .await?,
            actions_last_7d: self
                .store
                .count_actions_since(now - chrono::Duration::days(7))
                .await?,
        })
    }

    /// Open reports, most severe and then oldest first.
    pub async fn pending_reports(&self) -> Result<Vec<Report>> {
        self.store.list_pending_reports().await
    }

    /// Audit trail of one agent, oldest first.
    pub async fn actions_for(&self, target_id: CapabilityId) -> Result<Vec<GovernanceAction>> {
        self.store.list_actions(target_id).await
    }

    /// Active, non-system agents scoring below the review threshold.
    pub async fn review_candidates(&self) -> Result<Vec<CapabilitySummary>> {
        let threshold = self.config.reputation_review_threshold;
        let caps = self
            .store
            .list(&CapabilityFilter::active(CapabilityKind::Agent))
            .await?;
        let mut candidates: Vec<CapabilitySummary> = caps
            .iter()
            .filter(|c| !c.is_system && c.reputation_score < threshold)
            .map(Capability::summary)
            .collect();
        candidates.sort_by(|a, b| a.reputation_score.total_cmp(&b.reputation_score));
        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{AgentProfile, CapabilityBody, NewCapability, SkillDocument};
    use crate::store::MemoryStore;
    use serde_json::Value;

    async fn setup() -> (GovernanceEngine, Arc<MemoryStore>, Capability, Capability) {
        let store = Arc::new(MemoryStore::new());
        let body = || {
            CapabilityBody::agent(AgentProfile {
                model: "sonnet".into(),
                prompt: "Help".into(),
                tools: vec![],
            })
        };
        let normal = store
            .create(NewCapability::new("helper", "Helps", body()).into_capability())
            .await
            .unwrap();
        let system = store
            .create(NewCapability::new("core", "Core agent", body()).system().into_capability())
            .await
            .unwrap();
        let engine = GovernanceEngine::new(store.clone(), GovernanceConfig::default());
        (engine, store, normal, system)
    }

    fn report_on(name: &str) -> NewReport {
        NewReport {
            target_name: name.into(),
            report_type: ReportType::Harmful,
            severity: Severity::High,
            description: "produced harmful output".into(),
            evidence: Value::Null,
        }
    }

    async fn status_of(store: &MemoryStore, id: CapabilityId) -> CapabilityStatus {
        store.get_by_id(id).await.unwrap().unwrap().status()
    }

    #[tokio::test]
    async fn test_police_quarantine() {
        let (engine, store, normal, system) = setup().await;

        let action = engine
            .quarantine(normal.id, GovernanceRole::Police, "suspicious", None)
            .await
            .unwrap();
        assert_eq!(action.previous_status, Some(ACTIVE));
        assert_eq!(status_of(&store, normal.id).await, QUARANTINED);

        let err = engine
            .quarantine(system.id, GovernanceRole::Police, "suspicious", None)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Forbidden(_)));
        assert_eq!(status_of(&store, system.id).await, ACTIVE);
    }

    #[tokio::test]
    async fn test_role_gate_applies_to_every_action() {
        let (engine, _, normal, _) = setup().await;

        let err = engine
            .quarantine(normal.id, GovernanceRole::Executioner, "x", None)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Forbidden(_)));

        let err = engine
            .execute_ban(normal.id, GovernanceRole::Judge, None, "x")
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Forbidden(_)));

        let err = engine
            .adjust_reputation(normal.id, GovernanceRole::Police, 5.0, "x")
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Forbidden(_)));

        engine
            .quarantine(normal.id, GovernanceRole::Judge, "x", None)
            .await
            .unwrap();
        let err = engine
            .unquarantine(normal.id, GovernanceRole::Police, "x")
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_unquarantine_requires_quarantined() {
        let (engine, store, normal, _) = setup().await;
        let err = engine
            .unquarantine(normal.id, GovernanceRole::Judge, "release")
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Validation(_)));

        engine
            .quarantine(normal.id, GovernanceRole::Police, "hold", None)
            .await
            .unwrap();
        engine
            .unquarantine(normal.id, GovernanceRole::Judge, "release")
            .await
            .unwrap();
        assert_eq!(status_of(&store, normal.id).await, ACTIVE);
    }

    #[tokio::test]
    async fn test_ban_is_terminal() {
        let (engine, store, normal, _) = setup().await;
        engine
            .execute_ban(normal.id, GovernanceRole::Executioner, None, "malicious")
            .await
            .unwrap();
        assert_eq!(status_of(&store, normal.id).await, BANNED);

        let err = engine
            .quarantine(normal.id, GovernanceRole::Judge, "again", None)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Forbidden(_)));

        let err = engine
            .unquarantine(normal.id, GovernanceRole::Judge, "again")
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Validation(_)));

        // a second ban is accepted
        let action = engine
            .execute_ban(normal.id, GovernanceRole::Executioner, None, "twice")
            .await
            .unwrap();
        assert_eq!(action.previous_status, Some(BANNED));
    }

    #[tokio::test]
    async fn test_banned_agent_reputation_can_still_be_adjusted() {
        let (engine, store, normal, _) = setup().await;
        engine
            .execute_ban(normal.id, GovernanceRole::Executioner, None, "malicious")
            .await
            .unwrap();
        engine
            .adjust_reputation(normal.id, GovernanceRole::Judge, -20.0, "penalty")
            .await
            .unwrap();
        let cap = store.get_by_id(normal.id).await.unwrap().unwrap();
        assert_eq!(cap.reputation_score, 30.0);
        assert!(cap.is_banned());
    }

    #[tokio::test]
    async fn test_adjust_reputation_clamps_and_classifies() {
        let (engine, store, normal, system) = setup().await;

        let action = engine
            .adjust_reputation(normal.id, GovernanceRole::Judge, 80.0, "excellent")
            .await
            .unwrap();
        assert_eq!(action.action_type, GovernanceActionType::Promote);
        assert_eq!(action.previous_reputation, Some(50.0));
        assert_eq!(store.get_by_id(normal.id).await.unwrap().unwrap().reputation_score, 100.0);

        let action = engine
            .adjust_reputation(normal.id, GovernanceRole::Judge, -500.0, "terrible")
            .await
            .unwrap();
        assert_eq!(action.action_type, GovernanceActionType::Demote);
        assert_eq!(store.get_by_id(normal.id).await.unwrap().unwrap().reputation_score, 0.0);

        let action = engine
            .adjust_reputation(normal.id, GovernanceRole::Judge, 0.0, "noop")
            .await
            .unwrap();
        assert_eq!(action.action_type, GovernanceActionType::Demote);

        let err = engine
            .adjust_reputation(system.id, GovernanceRole::Judge, 10.0, "boost")
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Forbidden(_)));

        let err = engine
            .adjust_reputation(normal.id, GovernanceRole::Judge, f64::NAN, "bad")
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Validation(_)));
    }

    #[tokio::test]
    async fn test_auto_quarantine_at_threshold() {
        let (engine, store, normal, _) = setup().await;
        for _ in 0..2 {
            engine.create_report(report_on("helper"), "user").await.unwrap();
        }
        assert_eq!(status_of(&store, normal.id).await, ACTIVE);

        engine.create_report(report_on("helper"), "user").await.unwrap();
        assert_eq!(status_of(&store, normal.id).await, QUARANTINED);

        let trail = engine.actions_for(normal.id).await.unwrap();
        assert_eq!(trail.len(), 1);
        assert_eq!(trail[0].role, GovernanceRole::Police);
        assert!(trail[0].report_id.is_some());
    }

    #[tokio::test]
    async fn test_auto_quarantine_failure_does_not_fail_report() {
        let (engine, store, normal, _) = setup().await;
        store.fail_status_updates(true);
        for _ in 0..3 {
            engine.create_report(report_on("helper"), "user").await.unwrap();
        }
        assert_eq!(status_of(&store, normal.id).await, ACTIVE);
        assert_eq!(engine.pending_reports().await.unwrap().len(), 3);
        assert!(engine.actions_for(normal.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_report_validation() {
        let (engine, _, _, _) = setup().await;

        let err = engine.create_report(report_on("core"), "user").await.unwrap_err();
        assert!(matches!(err, RegistryError::Forbidden(_)));

        let err = engine.create_report(report_on("ghost"), "user").await.unwrap_err();
        assert!(matches!(err, RegistryError::NotFound { .. }));

        let mut blank = report_on("helper");
        blank.description = "  ".into();
        let err = engine.create_report(blank, "user").await.unwrap_err();
        assert!(matches!(err, RegistryError::Validation(_)));
    }

    #[tokio::test]
    async fn test_review_and_ruling_leave_target_alone() {
        let (engine, store, normal, _) = setup().await;
        let report = engine.create_report(report_on("helper"), "user").await.unwrap();

        engine.review_report(report.id, "judge-1").await.unwrap();
        engine
            .make_ruling(report.id, Resolution::Ban, "confirmed", "judge-1")
            .await
            .unwrap();

        let stored = store.get_report(report.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ReportStatus::Resolved);
        assert_eq!(stored.resolution, Some(Resolution::Ban));
        assert_eq!(status_of(&store, normal.id).await, ACTIVE);

        let err = engine
            .review_report(Uuid::new_v4(), "judge-1")
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_stats() {
        let (engine, _, normal, _) = setup().await;
        let report = engine.create_report(report_on("helper"), "user").await.unwrap();
        engine.create_report(report_on("helper"), "user").await.unwrap();
        engine.review_report(report.id, "judge-1").await.unwrap();
        engine
            .quarantine(normal.id, GovernanceRole::Police, "hold", None)
            .await
            .unwrap();
        engine
            .warn(normal.id, GovernanceRole::Judge, "behave", None)
            .await
            .unwrap();

        let stats = engine.get_stats().await.unwrap();
        assert_eq!(stats.pending_reports, 1);
        assert_eq!(stats.reviewing_reports, 1);
        assert_eq!(stats.quarantined_count, 1);
        assert_eq!(stats.banned_count, 0);
        assert_eq!(stats.actions_last_24h, 2);
        assert_eq!(stats.actions_last_7d, 2);
    }

    #[tokio::test]
    async fn test_disabled_governance() {
        let (_, store, normal, _) = setup().await;
        let engine = GovernanceEngine::new(
            store,
            GovernanceConfig {
                enabled: false,
                ..GovernanceConfig::default()
            },
        );
        let err = engine
            .quarantine(normal.id, GovernanceRole::Police, "x", None)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Forbidden: governance is disabled");
        assert!(engine.create_report(report_on("helper"), "u").await.is_err());
    }

    #[tokio::test]
    async fn test_governance_rejects_non_agents() {
        let (engine, store, _, _) = setup().await;
        let skill = store
            .create(
                NewCapability::new(
                    "kubectl",
                    "k8s",
                    CapabilityBody::skill(SkillDocument {
                        content: "kubectl".into(),
                        ..SkillDocument::default()
                    }),
                )
                .into_capability(),
            )
            .await
            .unwrap();
        let err = engine
            .quarantine(skill.id, GovernanceRole::Police, "x", None)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Validation(_)));
    }

    #[tokio::test]
    async fn test_review_candidates() {
        let (engine, store, normal, _) = setup().await;
        assert!(engine.review_candidates().await.unwrap().is_empty());
        store.update_reputation(normal.id, 4.0).await.unwrap();
        let candidates = engine.review_candidates().await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].name, "helper");
    }
}
