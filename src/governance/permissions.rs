//! Role-based authorization for governance actions.
//!
//! Maps roles → permitted actions. Every mutating governance operation asks
//! [`Permissions::authorize`] before touching the store; no operation carries
//! its own role check.

use std::collections::{HashMap, HashSet};

use super::types::{GovernanceActionType, GovernanceRole};
use crate::error::{RegistryError, Result};

/// Role → actions grant table.
#[derive(Debug, Clone, PartialEq)]
pub struct Permissions {
    grants: HashMap<GovernanceRole, HashSet<GovernanceActionType>>,
}

impl Default for Permissions {
    /// | Role | Allowed actions |
    /// |---|---|
    /// | Police | quarantine, warn |
    /// | Judge | quarantine, unquarantine, warn, promote, demote |
    /// | Executioner | ban |
    fn default() -> Self {
        use GovernanceActionType::*;

        let mut permissions = Self::empty();
        permissions.grant(GovernanceRole::Police, &[Quarantine, Warn]);
        permissions.grant(
            GovernanceRole::Judge,
            &[Quarantine, Unquarantine, Warn, Promote, Demote],
        );
        permissions.grant(GovernanceRole::Executioner, &[Ban]);
        permissions
    }
}

impl Permissions {
    /// A table that permits nothing.
    pub fn empty() -> Self {
        Self {
            grants: HashMap::new(),
        }
    }

    /// Grant actions to a role.
    pub fn grant(&mut self, role: GovernanceRole, actions: &[GovernanceActionType]) {
        self.grants
            .entry(role)
            .or_default()
            .extend(actions.iter().copied());
    }

    /// Revoke one action from a role.
    pub fn revoke(&mut self, role: GovernanceRole, action: GovernanceActionType) -> bool {
        self.grants
            .get_mut(&role)
            .map(|actions| actions.remove(&action))
            .unwrap_or(false)
    }

    pub fn can(&self, role: GovernanceRole, action: GovernanceActionType) -> bool {
        self.grants
            .get(&role)
            .map(|actions| actions.contains(&action))
            .unwrap_or(false)
    }

    /// Fail with `Forbidden` unless `role` may perform `action`.
    pub fn authorize(&self, role: GovernanceRole, action: GovernanceActionType) -> Result<()> {
        if self.can(role, action) {
            Ok(())
        } else {
            Err(RegistryError::Forbidden(format!(
                "{} cannot perform {} action",
                role, action
            )))
        }
    }

    /// Actions granted to `role`, in a stable order.
    pub fn allowed(&self, role: GovernanceRole) -> Vec<GovernanceActionType> {
        let mut actions: Vec<GovernanceActionType> = self
            .grants
            .get(&role)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        actions.sort_by_key(|a| a.as_str());
        actions
    }

    /// Roles that may perform `action`.
    pub fn roles_for(&self, action: GovernanceActionType) -> Vec<GovernanceRole> {
        let mut roles: Vec<GovernanceRole> = self
            .grants
            .iter()
            .filter(|(_, actions)| actions.contains(&action))
            .map(|(role, _)| *role)
            .collect();
        roles.sort_by_key(|r| r.as_str());
        roles
    }
}
