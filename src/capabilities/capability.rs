//! Capability definition: one tagged type for agents, skills and commands.
//!
//! Example (JSON as returned by `get_agent`):
//! ```json
//! {
//!   "id": "6f1c…",
//!   "name": "code-reviewer",
//!   "version": "1.0.0",
//!   "description": "Reviews code for quality issues",
//!   "skills": ["review", "rust"],
//!   "reputation_score": 50.0,
//!   "body": {
//!     "kind": "agent",
//!     "status": "active",
//!     "profile": { "model": "sonnet", "prompt": "You are…", "tools": ["Read"] }
//!   }
//! }
//! ```

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{RegistryError, Result};

/// Opaque unique capability identifier.
pub type CapabilityId = Uuid;

/// Reputation assigned on registration.
pub const INITIAL_REPUTATION: f64 = 50.0;

/// Version assigned when a registration omits one.
pub const DEFAULT_VERSION: &str = "1.0.0";

/// Agent model assigned when a registration omits one.
pub const DEFAULT_MODEL: &str = "sonnet";

/// Which family a capability belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityKind {
    Agent,
    Skill,
    Command,
}

impl CapabilityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Agent => "agent",
            Self::Skill => "skill",
            Self::Command => "command",
        }
    }
}

impl fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CapabilityKind {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "agent" => Ok(Self::Agent),
            "skill" => Ok(Self::Skill),
            "command" => Ok(Self::Command),
            other => Err(RegistryError::Validation(format!(
                "unknown capability kind: {}",
                other
            ))),
        }
    }
}

/// Agent trust state; the only status domain governance moves through.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    #[default]
    Active,
    Quarantined,
    Banned,
}

/// Status of skills and commands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentStatus {
    #[default]
    Active,
    Deprecated,
    Disabled,
}

/// Kind-aware status value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CapabilityStatus {
    Agent(AgentStatus),
    Content(ContentStatus),
}

impl CapabilityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Agent(AgentStatus::Active) | Self::Content(ContentStatus::Active) => "active",
            Self::Agent(AgentStatus::Quarantined) => "quarantined",
            Self::Agent(AgentStatus::Banned) => "banned",
            Self::Content(ContentStatus::Deprecated) => "deprecated",
            Self::Content(ContentStatus::Disabled) => "disabled",
        }
    }

    pub fn is_active(&self) -> bool {
        self.as_str() == "active"
    }

    /// Parse a stored status string within the domain of `kind`.
    pub fn parse(kind: CapabilityKind, s: &str) -> Result<Self> {
        let status = match (kind, s) {
            (CapabilityKind::Agent, "active") => Self::Agent(AgentStatus::Active),
            (CapabilityKind::Agent, "quarantined") => Self::Agent(AgentStatus::Quarantined),
            (CapabilityKind::Agent, "banned") => Self::Agent(AgentStatus::Banned),
            (CapabilityKind::Skill | CapabilityKind::Command, "active") => {
                Self::Content(ContentStatus::Active)
            }
            (CapabilityKind::Skill | CapabilityKind::Command, "deprecated") => {
                Self::Content(ContentStatus::Deprecated)
            }
            (CapabilityKind::Skill | CapabilityKind::Command, "disabled") => {
                Self::Content(ContentStatus::Disabled)
            }
            _ => {
                return Err(RegistryError::Validation(format!(
                    "invalid {} status: {}",
                    kind, s
                )))
            }
        };
        Ok(status)
    }
}

impl fmt::Display for CapabilityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operational payload of an agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentProfile {
    /// Model alias the agent runs on (sonnet, opus, haiku).
    pub model: String,
    /// System prompt defining the agent's behaviour.
    pub prompt: String,
    /// Tool identifiers the agent may use.
    #[serde(default)]
    pub tools: Vec<String>,
}

/// A worked example attached to a skill document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Example {
    pub title: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    pub code: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub language: String,
}

/// Packaged knowledge for a tool (kubectl, docker, curl, …).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SkillDocument {
    #[serde(default)]
    pub category: String,
    pub content: String,
    #[serde(default)]
    pub examples: Vec<Example>,
}

/// An expected argument of a slash command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandArgument {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

/// A reusable slash-command prompt template.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandTemplate {
    #[serde(default)]
    pub category: String,
    pub prompt: String,
    #[serde(default)]
    pub arguments: Vec<CommandArgument>,
}

/// Kind-specific status and payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum CapabilityBody {
    Agent {
        status: AgentStatus,
        profile: AgentProfile,
    },
    Skill {
        status: ContentStatus,
        document: SkillDocument,
    },
    Command {
        status: ContentStatus,
        template: CommandTemplate,
    },
}

impl CapabilityBody {
    pub fn agent(profile: AgentProfile) -> Self {
        Self::Agent {
            status: AgentStatus::Active,
            profile,
        }
    }

    pub fn skill(document: SkillDocument) -> Self {
        Self::Skill {
            status: ContentStatus::Active,
            document,
        }
    }

    pub fn command(template: CommandTemplate) -> Self {
        Self::Command {
            status: ContentStatus::Active,
            template,
        }
    }

    pub fn kind(&self) -> CapabilityKind {
        match self {
            Self::Agent { .. } => CapabilityKind::Agent,
            Self::Skill { .. } => CapabilityKind::Skill,
            Self::Command { .. } => CapabilityKind::Command,
        }
    }

    pub fn status(&self) -> CapabilityStatus {
        match self {
            Self::Agent { status, .. } => CapabilityStatus::Agent(*status),
            Self::Skill { status, .. } | Self::Command { status, .. } => {
                CapabilityStatus::Content(*status)
            }
        }
    }

    /// Back to `active` within the body's own status domain.
    pub fn reset_status(&mut self) {
        match self {
            Self::Agent { status, .. } => *status = AgentStatus::Active,
            Self::Skill { status, .. } | Self::Command { status, .. } => {
                *status = ContentStatus::Active
            }
        }
    }

    /// Replace the status, rejecting values from another kind's domain.
    pub fn set_status(&mut self, new: CapabilityStatus) -> Result<()> {
        match (self, new) {
            (Self::Agent { status, .. }, CapabilityStatus::Agent(s)) => *status = s,
            (Self::Skill { status, .. }, CapabilityStatus::Content(s))
            | (Self::Command { status, .. }, CapabilityStatus::Content(s)) => *status = s,
            (body, new) => {
                return Err(RegistryError::Validation(format!(
                    "status '{}' does not apply to {}",
                    new,
                    body.kind()
                )))
            }
        }
        Ok(())
    }

    /// Free-text payload searched by keyword lookups.
    pub fn text(&self) -> &str {
        match self {
            Self::Agent { profile, .. } => &profile.prompt,
            Self::Skill { document, .. } => &document.content,
            Self::Command { template, .. } => &template.prompt,
        }
    }

    /// Category, when the kind carries one.
    pub fn category(&self) -> Option<&str> {
        match self {
            Self::Agent { .. } => None,
            Self::Skill { document, .. } => Some(&document.category),
            Self::Command { template, .. } => Some(&template.category),
        }
    }
}

/// A registered capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capability {
    pub id: CapabilityId,
    /// Unique within its kind.
    pub name: String,
    pub version: String,
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Normalized (trimmed, lower-cased) skill identifiers.
    #[serde(default)]
    pub skills: Vec<String>,
    /// Always within `[0, 100]`.
    pub reputation_score: f64,
    pub usage_count: u64,
    pub feedback_count: u64,
    pub avg_rating: f64,
    #[serde(default, skip_serializing)]
    pub embedding: Option<Vec<f32>>,
    /// System capabilities are immune to governance.
    pub is_system: bool,
    pub is_generated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub body: CapabilityBody,
}

impl Capability {
    pub fn kind(&self) -> CapabilityKind {
        self.body.kind()
    }

    pub fn status(&self) -> CapabilityStatus {
        self.body.status()
    }

    pub fn is_active(&self) -> bool {
        self.status().is_active()
    }

    pub fn is_banned(&self) -> bool {
        matches!(
            self.body,
            CapabilityBody::Agent {
                status: AgentStatus::Banned,
                ..
            }
        )
    }

    /// Case-insensitive keyword match over name, description, payload text
    /// and tags (substring), or skills (exact).
    pub fn matches_keyword(&self, query: &str) -> bool {
        let q = query.trim().to_lowercase();
        if q.is_empty() {
            return false;
        }
        self.name.to_lowercase().contains(&q)
            || self.description.to_lowercase().contains(&q)
            || self.body.text().to_lowercase().contains(&q)
            || self.tags.iter().any(|t| t.to_lowercase().contains(&q))
            || self.skills.iter().any(|s| s.to_lowercase() == q)
    }

    /// True when any tag, skill or category equals one of `filters` (case-insensitive).
    pub fn has_any_tag(&self, filters: &[String]) -> bool {
        filters.iter().any(|f| {
            let f = f.to_lowercase();
            self.tags.iter().any(|t| t.to_lowercase() == f)
                || self.skills.iter().any(|s| *s == f)
                || self.body.category().map_or(false, |c| c.to_lowercase() == f)
        })
    }

    pub fn summary(&self) -> CapabilitySummary {
        CapabilitySummary {
            id: self.id,
            name: self.name.clone(),
            kind: self.kind(),
            version: self.version.clone(),
            description: self.description.clone(),
            skills: self.skills.clone(),
            tags: self.tags.clone(),
            reputation_score: self.reputation_score,
            avg_rating: self.avg_rating,
            usage_count: self.usage_count,
            status: self.status(),
        }
    }
}

/// Lightweight listing view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilitySummary {
    pub id: CapabilityId,
    pub name: String,
    pub kind: CapabilityKind,
    pub version: String,
    pub description: String,
    pub skills: Vec<String>,
    pub tags: Vec<String>,
    pub reputation_score: f64,
    pub avg_rating: f64,
    pub usage_count: u64,
    pub status: CapabilityStatus,
}

/// A similarity-search hit.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredCapability {
    pub capability: Capability,
    /// `1 - cosine distance`.
    pub similarity: f64,
}

/// Registration draft.
#[derive(Debug, Clone, PartialEq)]
pub struct NewCapability {
    pub name: String,
    pub version: String,
    pub description: String,
    pub tags: Vec<String>,
    pub skills: Vec<String>,
    pub embedding: Option<Vec<f32>>,
    pub is_system: bool,
    pub is_generated: bool,
    pub created_by: Option<String>,
    pub metadata: Value,
    pub body: CapabilityBody,
}

impl NewCapability {
    pub fn new(name: impl Into<String>, description: impl Into<String>, body: CapabilityBody) -> Self {
        Self {
            name: name.into(),
            version: DEFAULT_VERSION.to_string(),
            description: description.into(),
            tags: Vec::new(),
            skills: Vec::new(),
            embedding: None,
            is_system: false,
            is_generated: false,
            created_by: None,
            metadata: Value::Null,
            body,
        }
    }

    pub fn with_skills<I, S>(mut self, skills: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.skills = normalize_terms(skills);
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn system(mut self) -> Self {
        self.is_system = true;
        self
    }

    pub fn kind(&self) -> CapabilityKind {
        self.body.kind()
    }

    /// Materialize the draft with a fresh id, neutral reputation and
    /// zeroed counters. The body's status is reset to `active`.
    pub fn into_capability(self) -> Capability {
        let now = Utc::now();
        let mut body = self.body;
        body.reset_status();
        Capability {
            id: Uuid::new_v4(),
            name: self.name,
            version: self.version,
            description: self.description,
            tags: self.tags,
            skills: self.skills,
            reputation_score: INITIAL_REPUTATION,
            usage_count: 0,
            feedback_count: 0,
            avg_rating: 0.0,
            embedding: self.embedding,
            is_system: self.is_system,
            is_generated: self.is_generated,
            created_by: self.created_by,
            metadata: self.metadata,
            created_at: now,
            updated_at: now,
            body,
        }
    }
}

/// Trim and lower-case each term, dropping empties. Order is preserved.
pub fn normalize_terms<I, S>(terms: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    terms
        .into_iter()
        .map(|t| t.as_ref().trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}
