//! Client-facing named actions.
//!
//! Every operation a client can invoke is an action name plus a flat JSON
//! argument object. [`ActionRouter::invoke`] validates arguments against
//! [`Limits`] before any store access and returns a JSON result.
//!
//! List-valued arguments (`skills`, `tools`, `tags`) accept either a JSON
//! array of strings or a comma-separated string.

use std::str::FromStr;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::capabilities::{
    AgentProfile, Capability, CapabilityBody, CapabilityKind, CapabilitySummary, CommandArgument,
    CommandTemplate, Example, NewCapability, SkillDocument, DEFAULT_MODEL,
};
use crate::config::Limits;
use crate::dispatch::{CapabilityDispatcher, SkillOutcome, TaskOutcome};
use crate::error::{RegistryError, Result};
use crate::governance::{
    GovernanceActionType, GovernanceEngine, GovernanceRole, NewReport, ReportType, Resolution,
    Severity,
};
use crate::reputation::{FeedbackInput, ReputationLedger};
use crate::store::{CapabilityFilter, CapabilityStore};

/// Argument bag passed to every action.
pub type Args = Map<String, Value>;

pub const DEFAULT_LIST_LIMIT: usize = 100;
pub const DEFAULT_TOP_LIMIT: usize = 10;
pub const DEFAULT_SIMILAR_LIMIT: usize = 5;
pub const DEFAULT_SIMILAR_THRESHOLD: f64 = 0.15;
const MAX_RESULT_LIMIT: usize = 100;

/// Published description of one action.
#[derive(Debug, Clone, Serialize)]
pub struct ActionSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub required: &'static [&'static str],
    pub optional: &'static [&'static str],
}

const fn spec(
    name: &'static str,
    description: &'static str,
    required: &'static [&'static str],
    optional: &'static [&'static str],
) -> ActionSpec {
    ActionSpec {
        name,
        description,
        required,
        optional,
    }
}

pub const ACTIONS: &[ActionSpec] = &[
    spec("use_agent", "Find the best agent for a task", &["task"], &[]),
    spec("use_skill", "Find the best skill for a task", &["task"], &[]),
    spec("use_command", "Find the best command for a task", &["task"], &[]),
    spec(
        "request_agent_by_skills",
        "Resolve a skill list to an agent, optionally generating one",
        &["skills"],
        &["create_if_missing"],
    ),
    spec("list_agents", "List active agents", &[], &["tags", "category", "limit"]),
    spec("list_skills", "List active skills", &[], &["tags", "category", "limit"]),
    spec("list_commands", "List active commands", &[], &["tags", "category", "limit"]),
    spec("get_agent", "Get an agent by name", &["name"], &[]),
    spec("get_skill", "Get a skill by name", &["name"], &[]),
    spec("get_command", "Get a command by name", &["name"], &[]),
    spec("search_agents", "Keyword search over agents", &["query"], &[]),
    spec("search_skills", "Keyword search over skills", &["query"], &[]),
    spec("search_commands", "Keyword search over commands", &["query"], &[]),
    spec(
        "find_similar_agents",
        "Similarity search over agents",
        &[],
        &["description", "skills", "limit", "threshold"],
    ),
    spec(
        "find_similar_skills",
        "Similarity search over skills",
        &["description"],
        &["limit", "threshold"],
    ),
    spec(
        "find_similar_commands",
        "Similarity search over commands",
        &["description"],
        &["limit", "threshold"],
    ),
    spec(
        "register_agent",
        "Register a new agent",
        &["name", "description", "prompt"],
        &["model", "skills", "tools", "tags", "version"],
    ),
    spec(
        "register_skill",
        "Register a new skill document",
        &["name", "description", "content"],
        &["category", "examples", "tags", "version"],
    ),
    spec(
        "register_command",
        "Register a new command template",
        &["name", "description", "prompt"],
        &["category", "arguments", "tags", "version"],
    ),
    spec(
        "submit_feedback",
        "Rate a capability and update its reputation",
        &["name", "rating"],
        &["kind", "task_success", "task_type", "feedback_text", "session_id"],
    ),
    spec("get_reputation", "Reputation breakdown for a capability", &["name"], &["kind"]),
    spec("get_top", "Highest-ranked capabilities", &[], &["kind", "limit", "category"]),
    spec(
        "report_agent",
        "Report an agent for review",
        &["agent_name", "report_type", "severity", "description"],
        &["evidence", "reported_by"],
    ),
    spec("review_reports", "Open reports and low-reputation agents", &[], &[]),
    spec("review_report", "Mark a report as under review", &["report_id", "reviewer"], &[]),
    spec(
        "make_ruling",
        "Resolve a report",
        &["report_id", "resolution", "judge"],
        &["note"],
    ),
    spec(
        "governance_action",
        "Quarantine, unquarantine, ban, warn, promote, demote or adjust an agent",
        &["agent_name", "action", "reason"],
        &["role", "reputation_delta", "report_id"],
    ),
    spec("governance_history", "Audit trail of an agent", &["agent_name"], &[]),
    spec("governance_stats", "Governance counters", &[], &[]),
];

/// Routes named actions to the registry components.
#[derive(Clone)]
pub struct ActionRouter {
    store: Arc<dyn CapabilityStore>,
    dispatcher: CapabilityDispatcher,
    governance: GovernanceEngine,
    ledger: ReputationLedger,
    limits: Limits,
}

impl ActionRouter {
    pub fn new(
        store: Arc<dyn CapabilityStore>,
        dispatcher: CapabilityDispatcher,
        governance: GovernanceEngine,
        limits: Limits,
    ) -> Self {
        Self {
            ledger: ReputationLedger::new(store.clone()),
            store,
            dispatcher,
            governance,
            limits,
        }
    }

    pub fn list_actions(&self) -> &'static [ActionSpec] {
        ACTIONS
    }

    pub fn dispatcher(&self) -> &CapabilityDispatcher {
        &self.dispatcher
    }

    pub fn governance(&self) -> &GovernanceEngine {
        &self.governance
    }

    /// Run `name` with `args`.
    ///
    /// Unknown actions are a validation error.
    pub async fn invoke(&self, name: &str, args: &Args) -> Result<Value> {
        use CapabilityKind::{Agent, Command, Skill};

        log::debug!("Invoking action {}", name);
        match name {
            "use_agent" => self.use_capability(Agent, args).await,
            "use_skill" => self.use_capability(Skill, args).await,
            "use_command" => self.use_capability(Command, args).await,
            "request_agent_by_skills" => self.request_agent_by_skills(args).await,

            "list_agents" => self.list(Agent, args).await,
            "list_skills" => self.list(Skill, args).await,
            "list_commands" => self.list(Command, args).await,
            "get_agent" => self.get(Agent, args).await,
            "get_skill" => self.get(Skill, args).await,
            "get_command" => self.get(Command, args).await,
            "search_agents" => self.search(Agent, args).await,
            "search_skills" => self.search(Skill, args).await,
            "search_commands" => self.search(Command, args).await,
            "find_similar_agents" => self.find_similar(Agent, args).await,
            "find_similar_skills" => self.find_similar(Skill, args).await,
            "find_similar_commands" => self.find_similar(Command, args).await,

            "register_agent" => self.register_agent(args).await,
            "register_skill" => self.register_skill(args).await,
            "register_command" => self.register_command(args).await,

            "submit_feedback" => self.submit_feedback(args).await,
            "get_reputation" => self.get_reputation(args).await,
            "get_top" => self.get_top(args).await,

            "report_agent" => self.report_agent(args).await,
            "review_reports" => self.review_reports().await,
            "review_report" => self.review_report(args).await,
            "make_ruling" => self.make_ruling(args).await,
            "governance_action" => self.governance_action(args).await,
            "governance_history" => self.governance_history(args).await,
            "governance_stats" => to_value(self.governance.get_stats().await?),

            other => Err(RegistryError::Validation(format!(
                "unknown action: {}",
                other
            ))),
        }
    }

    // ---- dispatch ----

    async fn use_capability(&self, kind: CapabilityKind, args: &Args) -> Result<Value> {
        let task = required_str(args, "task", self.limits.max_task_len)?;
        match self.dispatcher.resolve(kind, task).await? {
            TaskOutcome::Found(found) => Ok(json!({
                "found": true,
                "match_method": found.tier,
                "score": found.score,
                "matched_token": found.token,
                kind.as_str(): capability_json(&found.capability)?,
            })),
            TaskOutcome::NotFound { suggestions } => Ok(json!({
                "found": false,
                "message": format!("No matching {} found for: {}", kind, task),
                "available": suggestions,
            })),
        }
    }

    async fn request_agent_by_skills(&self, args: &Args) -> Result<Value> {
        let skills = required_list(
            args,
            "skills",
            self.limits.max_skills,
            self.limits.max_name_len,
        )?;
        let create = optional_bool(args, "create_if_missing")?.unwrap_or(false);
        match self.dispatcher.resolve_by_skills(&skills, create).await? {
            SkillOutcome::Found(found) => Ok(json!({
                "found": true,
                "source": found.source,
                "similarity": found.similarity,
                "fingerprint": found.fingerprint,
                "agent": capability_json(&found.capability)?,
            })),
            SkillOutcome::NotFound { skills } => Ok(json!({
                "found": false,
                "skills": skills,
                "message": if create && !self.dispatcher.has_generator() {
                    "No matching agent found and generation is not configured"
                } else {
                    "No matching agent found"
                },
            })),
        }
    }

    // ---- lookup ----

    async fn list(&self, kind: CapabilityKind, args: &Args) -> Result<Value> {
        let mut tags = optional_list(
            args,
            "tags",
            self.limits.max_skills,
            self.limits.max_name_len,
        )?;
        if let Some(category) = optional_str(args, "category", self.limits.max_name_len)? {
            tags.push(category.to_string());
        }
        let limit = optional_limit(args, "limit", DEFAULT_LIST_LIMIT)?;
        let caps = self
            .store
            .list(&CapabilityFilter::active(kind).with_tags(tags).with_limit(limit))
            .await?;
        summaries(&caps)
    }

    async fn get(&self, kind: CapabilityKind, args: &Args) -> Result<Value> {
        let name = required_str(args, "name", self.limits.max_name_len)?;
        capability_json(&self.dispatcher.get(kind, name).await?)
    }

    async fn search(&self, kind: CapabilityKind, args: &Args) -> Result<Value> {
        let query = required_str(args, "query", self.limits.max_query_len)?;
        summaries(&self.dispatcher.search(kind, query).await?)
    }

    async fn find_similar(&self, kind: CapabilityKind, args: &Args) -> Result<Value> {
        let description =
            optional_str(args, "description", self.limits.max_description_len)?.unwrap_or("");
        let skills = optional_list(
            args,
            "skills",
            self.limits.max_skills,
            self.limits.max_name_len,
        )?;
        if description.trim().is_empty() && skills.is_empty() {
            return Err(RegistryError::Validation(
                "description or skills is required".into(),
            ));
        }
        let limit = optional_limit(args, "limit", DEFAULT_SIMILAR_LIMIT)?;
        let threshold = optional_f64(args, "threshold")?.unwrap_or(DEFAULT_SIMILAR_THRESHOLD);
        if !(0.0..=1.0).contains(&threshold) {
            return Err(RegistryError::Validation(
                "threshold must be between 0 and 1".into(),
            ));
        }

        let hits = self
            .dispatcher
            .find_similar(kind, description, &skills, limit, threshold)
            .await?;
        let results: Vec<Value> = hits
            .iter()
            .map(|hit| -> Result<Value> {
                Ok(json!({
                    "similarity": hit.similarity,
                    kind.as_str(): to_value(hit.capability.summary())?,
                }))
            })
            .collect::<Result<_>>()?;
        Ok(json!({ "count": results.len(), "results": results }))
    }

    // ---- registration ----

    fn registration_base(&self, args: &Args) -> Result<(String, String, Vec<String>, Option<String>)> {
        let name = required_str(args, "name", self.limits.max_name_len)?;
        let description = required_str(args, "description", self.limits.max_description_len)?;
        let tags = optional_list(
            args,
            "tags",
            self.limits.max_skills,
            self.limits.max_name_len,
        )?;
        let version = optional_str(args, "version", self.limits.max_name_len)?.map(str::to_string);
        Ok((name.to_string(), description.to_string(), tags, version))
    }

    async fn register(&self, mut new: NewCapability, version: Option<String>) -> Result<Value> {
        if let Some(version) = version {
            new.version = version;
        }
        new.created_by = Some("client".into());
        capability_json(&self.dispatcher.register(new).await?)
    }

    async fn register_agent(&self, args: &Args) -> Result<Value> {
        let (name, description, tags, version) = self.registration_base(args)?;
        let prompt = required_str(args, "prompt", crate::generator::MAX_PROMPT_LEN)?;
        let model = optional_str(args, "model", self.limits.max_name_len)?.unwrap_or(DEFAULT_MODEL);
        if !crate::generator::ALLOWED_MODELS.contains(&model) {
            return Err(RegistryError::Validation(format!("invalid model: {}", model)));
        }
        let tools = optional_list(
            args,
            "tools",
            self.limits.max_skills,
            self.limits.max_name_len,
        )?;
        let mut skills = optional_list(
            args,
            "skills",
            self.limits.max_skills,
            self.limits.max_name_len,
        )?;
        if skills.is_empty() {
            skills = tools.clone();
        }

        let body = CapabilityBody::agent(AgentProfile {
            model: model.to_string(),
            prompt: prompt.to_string(),
            tools,
        });
        let new = NewCapability::new(name, description, body)
            .with_skills(skills)
            .with_tags(tags);
        self.register(new, version).await
    }

    async fn register_skill(&self, args: &Args) -> Result<Value> {
        let (name, description, tags, version) = self.registration_base(args)?;
        let content = required_str(args, "content", crate::generator::MAX_PROMPT_LEN)?;
        let category = optional_str(args, "category", self.limits.max_name_len)?.unwrap_or("");
        let examples: Vec<Example> = optional_json(args, "examples")?.unwrap_or_default();

        let body = CapabilityBody::skill(SkillDocument {
            category: category.to_string(),
            content: content.to_string(),
            examples,
        });
        self.register(NewCapability::new(name, description, body).with_tags(tags), version)
            .await
    }

    async fn register_command(&self, args: &Args) -> Result<Value> {
        let (name, description, tags, version) = self.registration_base(args)?;
        let prompt = required_str(args, "prompt", crate::generator::MAX_PROMPT_LEN)?;
        let category = optional_str(args, "category", self.limits.max_name_len)?.unwrap_or("");
        let arguments: Vec<CommandArgument> = optional_json(args, "arguments")?.unwrap_or_default();

        let body = CapabilityBody::command(CommandTemplate {
            category: category.to_string(),
            prompt: prompt.to_string(),
            arguments,
        });
        self.register(NewCapability::new(name, description, body).with_tags(tags), version)
            .await
    }

    // ---- reputation ----

    async fn submit_feedback(&self, args: &Args) -> Result<Value> {
        let kind = optional_kind(args)?;
        let name = required_str(args, "name", self.limits.max_name_len)?;
        let rating = required_u64(args, "rating")?;
        if !(1..=5).contains(&rating) {
            return Err(RegistryError::Validation(format!(
                "rating must be between 1 and 5, got {}",
                rating
            )));
        }
        let input = FeedbackInput {
            name: name.to_string(),
            rating: rating as u8,
            task_success: optional_bool(args, "task_success")?.unwrap_or(false),
            task_type: optional_str(args, "task_type", self.limits.max_name_len)?
                .map(str::to_string),
            feedback_text: optional_str(args, "feedback_text", self.limits.max_description_len)?
                .map(str::to_string),
            session_id: optional_str(args, "session_id", self.limits.max_name_len)?
                .map(str::to_string),
        };
        to_value(self.ledger.submit_feedback(kind, input).await?)
    }

    async fn get_reputation(&self, args: &Args) -> Result<Value> {
        let kind = optional_kind(args)?;
        let name = required_str(args, "name", self.limits.max_name_len)?;
        to_value(self.ledger.get_reputation(kind, name).await?)
    }

    async fn get_top(&self, args: &Args) -> Result<Value> {
        let kind = optional_kind(args)?;
        let limit = optional_limit(args, "limit", DEFAULT_TOP_LIMIT)?;
        let tags = optional_str(args, "category", self.limits.max_name_len)?
            .map(|c| vec![c.to_string()])
            .unwrap_or_default();
        let top = self.ledger.top(kind, limit, tags).await?;
        Ok(json!({ "count": top.len(), "results": top }))
    }

    // ---- governance ----

    async fn report_agent(&self, args: &Args) -> Result<Value> {
        let target_name = required_str(args, "agent_name", self.limits.max_name_len)?;
        let report_type: ReportType = required_parse(args, "report_type")?;
        let severity: Severity = required_parse(args, "severity")?;
        let description = required_str(args, "description", self.limits.max_description_len)?;
        let reported_by =
            optional_str(args, "reported_by", self.limits.max_name_len)?.unwrap_or("anonymous");
        let evidence = args.get("evidence").cloned().unwrap_or(Value::Null);

        let report = self
            .governance
            .create_report(
                NewReport {
                    target_name: target_name.to_string(),
                    report_type,
                    severity,
                    description: description.to_string(),
                    evidence,
                },
                reported_by,
            )
            .await?;
        to_value(report)
    }

    async fn review_reports(&self) -> Result<Value> {
        let reports = self.governance.pending_reports().await?;
        let candidates = self.governance.review_candidates().await?;
        Ok(json!({
            "count": reports.len(),
            "pending_reports": reports,
            "low_reputation": candidates,
        }))
    }

    async fn review_report(&self, args: &Args) -> Result<Value> {
        let report_id = required_uuid(args, "report_id")?;
        let reviewer = required_str(args, "reviewer", self.limits.max_name_len)?;
        self.governance.review_report(report_id, reviewer).await?;
        Ok(json!({ "report_id": report_id, "status": "reviewing" }))
    }

    async fn make_ruling(&self, args: &Args) -> Result<Value> {
        let report_id = required_uuid(args, "report_id")?;
        let resolution: Resolution = required_parse(args, "resolution")?;
        let judge = required_str(args, "judge", self.limits.max_name_len)?;
        let note = optional_str(args, "note", self.limits.max_description_len)?.unwrap_or("");
        self.governance
            .make_ruling(report_id, resolution, note, judge)
            .await?;
        Ok(json!({
            "report_id": report_id,
            "status": "resolved",
            "resolution": resolution,
        }))
    }

    async fn governance_action(&self, args: &Args) -> Result<Value> {
        let target_name = required_str(args, "agent_name", self.limits.max_name_len)?;
        let action = required_str(args, "action", self.limits.max_name_len)?;
        let reason = required_str(args, "reason", self.limits.max_description_len)?;
        let role: Option<GovernanceRole> = optional_parse(args, "role")?;
        let delta = optional_f64(args, "reputation_delta")?;
        let report_id = optional_uuid(args, "report_id")?;

        let op = GovernanceOp::parse(action)?;
        let delta = op.delta(delta)?;
        let role = role.unwrap_or_else(|| op.default_role());

        let target = self.governance.find_agent(target_name).await?;
        let engine = &self.governance;
        let recorded = match op {
            GovernanceOp::Quarantine => engine.quarantine(target.id, role, reason, report_id).await?,
            GovernanceOp::Unquarantine => engine.unquarantine(target.id, role, reason).await?,
            GovernanceOp::Ban => engine.execute_ban(target.id, role, report_id, reason).await?,
            GovernanceOp::Warn => engine.warn(target.id, role, reason, report_id).await?,
            GovernanceOp::Promote | GovernanceOp::Demote | GovernanceOp::Adjust => {
                engine.adjust_reputation(target.id, role, delta, reason).await?
            }
        };
        Ok(json!({ "status": "action executed", "action": recorded }))
    }

    async fn governance_history(&self, args: &Args) -> Result<Value> {
        let target_name = required_str(args, "agent_name", self.limits.max_name_len)?;
        let target = self.governance.find_agent(target_name).await?;
        let actions = self.governance.actions_for(target.id).await?;
        Ok(json!({
            "agent": target.name,
            "status": target.status(),
            "reputation_score": target.reputation_score,
            "actions": actions,
        }))
    }
}

/// Client-facing governance verbs. `adjust_reputation` is a signed delta;
/// `promote` and `demote` take its magnitude.
#[derive(Debug, Clone, Copy, PartialEq)]
enum GovernanceOp {
    Quarantine,
    Unquarantine,
    Ban,
    Warn,
    Promote,
    Demote,
    Adjust,
}

impl GovernanceOp {
    fn parse(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "adjust_reputation" => Ok(Self::Adjust),
            other => match GovernanceActionType::from_str(other)? {
                GovernanceActionType::Quarantine => Ok(Self::Quarantine),
                GovernanceActionType::Unquarantine => Ok(Self::Unquarantine),
                GovernanceActionType::Ban => Ok(Self::Ban),
                GovernanceActionType::Warn => Ok(Self::Warn),
                GovernanceActionType::Promote => Ok(Self::Promote),
                GovernanceActionType::Demote => Ok(Self::Demote),
            },
        }
    }

    /// The role a caller acts as when none is declared.
    fn default_role(self) -> GovernanceRole {
        match self {
            Self::Quarantine | Self::Warn => GovernanceRole::Police,
            Self::Ban => GovernanceRole::Executioner,
            Self::Unquarantine | Self::Promote | Self::Demote | Self::Adjust => GovernanceRole::Judge,
        }
    }

    fn delta(self, given: Option<f64>) -> Result<f64> {
        let required = || {
            given.filter(|d| *d != 0.0).ok_or_else(|| {
                RegistryError::Validation("reputation_delta is required for this action".into())
            })
        };
        match self {
            Self::Promote => Ok(required()?.abs()),
            Self::Demote => Ok(-required()?.abs()),
            Self::Adjust => required(),
            _ => Ok(0.0),
        }
    }
}

// ---- argument helpers ----

fn to_value<T: Serialize>(value: T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

fn capability_json(cap: &Capability) -> Result<Value> {
    to_value(cap)
}

fn summaries(caps: &[Capability]) -> Result<Value> {
    let results: Vec<CapabilitySummary> = caps.iter().map(Capability::summary).collect();
    Ok(json!({ "count": results.len(), "results": results }))
}

fn check_len(key: &str, value: &str, max_len: usize) -> Result<()> {
    let len = value.chars().count();
    if len > max_len {
        return Err(RegistryError::Validation(format!(
            "{} too long ({} characters, max {})",
            key, len, max_len
        )));
    }
    Ok(())
}

fn optional_str<'a>(args: &'a Args, key: &str, max_len: usize) -> Result<Option<&'a str>> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => {
            check_len(key, s, max_len)?;
            Ok(Some(s.trim()))
        }
        Some(_) => Err(RegistryError::Validation(format!("{} must be a string", key))),
    }
}

fn required_str<'a>(args: &'a Args, key: &str, max_len: usize) -> Result<&'a str> {
    optional_str(args, key, max_len)?
        .ok_or_else(|| RegistryError::Validation(format!("{} is required", key)))
}

fn optional_list(
    args: &Args,
    key: &str,
    max_items: usize,
    max_item_len: usize,
) -> Result<Vec<String>> {
    let items: Vec<String> = match args.get(key) {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::String(s)) => s
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        Some(Value::Array(values)) => values
            .iter()
            .map(|v| {
                v.as_str()
                    .map(|s| s.trim().to_string())
                    .ok_or_else(|| RegistryError::Validation(format!("{} must contain strings", key)))
            })
            .filter(|r| r.as_ref().map_or(true, |s| !s.is_empty()))
            .collect::<Result<_>>()?,
        Some(_) => {
            return Err(RegistryError::Validation(format!(
                "{} must be a list or comma-separated string",
                key
            )))
        }
    };
    if items.len() > max_items {
        return Err(RegistryError::Validation(format!(
            "too many {} ({}, max {})",
            key,
            items.len(),
            max_items
        )));
    }
    for item in &items {
        check_len(&format!("{} entry", key), item, max_item_len)?;
    }
    Ok(items)
}

fn required_list(
    args: &Args,
    key: &str,
    max_items: usize,
    max_item_len: usize,
) -> Result<Vec<String>> {
    let items = optional_list(args, key, max_items, max_item_len)?;
    if items.is_empty() {
        return Err(RegistryError::Validation(format!("{} is required", key)));
    }
    Ok(items)
}

fn optional_bool(args: &Args, key: &str) -> Result<Option<bool>> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(Value::String(s)) => match s.trim().to_lowercase().as_str() {
            "true" | "yes" | "1" => Ok(Some(true)),
            "false" | "no" | "0" => Ok(Some(false)),
            _ => Err(RegistryError::Validation(format!("{} must be a boolean", key))),
        },
        Some(_) => Err(RegistryError::Validation(format!("{} must be a boolean", key))),
    }
}

fn optional_f64(args: &Args, key: &str) -> Result<Option<f64>> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_f64()
            .filter(|f| f.is_finite())
            .map(Some)
            .ok_or_else(|| RegistryError::Validation(format!("{} must be a number", key))),
        Some(Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|f| f.is_finite())
            .map(Some)
            .ok_or_else(|| RegistryError::Validation(format!("{} must be a number", key))),
        Some(_) => Err(RegistryError::Validation(format!("{} must be a number", key))),
    }
}

fn required_u64(args: &Args, key: &str) -> Result<u64> {
    let value = optional_f64(args, key)?
        .ok_or_else(|| RegistryError::Validation(format!("{} is required", key)))?;
    if value < 0.0 || value.fract() != 0.0 {
        return Err(RegistryError::Validation(format!(
            "{} must be a non-negative integer",
            key
        )));
    }
    Ok(value as u64)
}

fn optional_limit(args: &Args, key: &str, default: usize) -> Result<usize> {
    match optional_f64(args, key)? {
        None => Ok(default),
        Some(n) if n >= 1.0 && n.fract() == 0.0 => Ok((n as usize).min(MAX_RESULT_LIMIT)),
        Some(n) => Err(RegistryError::Validation(format!(
            "{} must be a positive integer, got {}",
            key, n
        ))),
    }
}

fn optional_parse<T>(args: &Args, key: &str) -> Result<Option<T>>
where
    T: FromStr<Err = RegistryError>,
{
    optional_str(args, key, 64)?.map(T::from_str).transpose()
}

fn required_parse<T>(args: &Args, key: &str) -> Result<T>
where
    T: FromStr<Err = RegistryError>,
{
    optional_parse(args, key)?
        .ok_or_else(|| RegistryError::Validation(format!("{} is required", key)))
}

fn optional_kind(args: &Args) -> Result<CapabilityKind> {
    Ok(optional_parse(args, "kind")?.unwrap_or(CapabilityKind::Agent))
}

fn optional_uuid(args: &Args, key: &str) -> Result<Option<Uuid>> {
    optional_str(args, key, 64)?
        .map(|s| {
            Uuid::parse_str(s)
                .map_err(|_| RegistryError::Validation(format!("{} must be a UUID", key)))
        })
        .transpose()
}

fn required_uuid(args: &Args, key: &str) -> Result<Uuid> {
    optional_uuid(args, key)?
        .ok_or_else(|| RegistryError::Validation(format!("{} is required", key)))
}

fn optional_json<T: serde::de::DeserializeOwned>(args: &Args, key: &str) -> Result<Option<T>> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => serde_json::from_value(value.clone())
            .map(Some)
            .map_err(|e| RegistryError::Validation(format!("invalid {}: {}", key, e))),
    }
}
