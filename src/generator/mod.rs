//! Capability generation from a skill list.
//!
//! The dispatcher calls a [`Generator`] only when nothing registered matches
//! a skill-set request and the caller allowed creation. Generator output is
//! untrusted: [`CapabilityDraft::validate`] must pass before the draft is
//! persisted.

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::capabilities::{AgentProfile, CapabilityBody, NewCapability, DEFAULT_MODEL, DEFAULT_VERSION};
use crate::error::{RegistryError, Result};

pub const ANTHROPIC_API_URL: &str = "https://api.anthropic.com";
pub const ANTHROPIC_VERSION: &str = "2023-06-01";
pub const DEFAULT_GENERATOR_MODEL: &str = "claude-sonnet-4-20250514";

pub const MAX_NAME_LEN: usize = 255;
pub const MAX_PROMPT_LEN: usize = 50_000;
pub const ALLOWED_MODELS: &[&str] = &["sonnet", "opus", "haiku"];
pub const ALLOWED_TOOLS: &[&str] = &[
    "Read",
    "Write",
    "Grep",
    "Glob",
    "Edit",
    "Bash",
    "WebFetch",
    "WebSearch",
];

/// Produces a new agent definition for a skill set.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate_from_skills(&self, skills: &[String]) -> anyhow::Result<CapabilityDraft>;
}

/// An agent definition as emitted by a generator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CapabilityDraft {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default)]
    pub prompt: String,
}

impl CapabilityDraft {
    /// Check required fields, lengths and whitelisted identifiers.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(RegistryError::Validation("generated name is required".into()));
        }
        if self.prompt.trim().is_empty() {
            return Err(RegistryError::Validation("generated prompt is required".into()));
        }
        if self.name.chars().count() > MAX_NAME_LEN {
            return Err(RegistryError::Validation(format!(
                "generated name too long (max {} characters)",
                MAX_NAME_LEN
            )));
        }
        if !kebab_case().is_match(self.name.trim()) {
            return Err(RegistryError::Validation(format!(
                "generated name must be lowercase kebab-case: {}",
                self.name
            )));
        }
        if self.prompt.chars().count() > MAX_PROMPT_LEN {
            return Err(RegistryError::Validation(format!(
                "generated prompt too long (max {} characters)",
                MAX_PROMPT_LEN
            )));
        }
        if !self.model.is_empty() && !ALLOWED_MODELS.contains(&self.model.as_str()) {
            return Err(RegistryError::Validation(format!(
                "invalid model: {}",
                self.model
            )));
        }
        if let Some(tool) = self
            .tools
            .iter()
            .find(|t| !ALLOWED_TOOLS.contains(&t.as_str()))
        {
            return Err(RegistryError::Validation(format!("invalid tool: {}", tool)));
        }
        Ok(())
    }

    /// Convert into a registration draft flagged as generated.
    ///
    /// `requested` overrides the draft's own skills so the stored agent
    /// carries exactly what was asked for.
    pub fn into_new_capability(self, requested: &[String]) -> NewCapability {
        let tags = metadata_tags(&self.metadata);
        let mut new = NewCapability::new(
            self.name.trim(),
            self.description,
            CapabilityBody::agent(AgentProfile {
                model: non_empty_or(self.model, DEFAULT_MODEL),
                prompt: self.prompt,
                tools: self.tools,
            }),
        )
        .with_skills(if requested.is_empty() {
            self.skills.as_slice()
        } else {
            requested
        })
        .with_tags(tags);
        new.version = non_empty_or(self.version, DEFAULT_VERSION);
        new.is_generated = true;
        new.created_by = Some("generator".into());
        new.metadata = self.metadata;
        new
    }
}

fn non_empty_or(value: String, default: &str) -> String {
    if value.trim().is_empty() {
        default.to_string()
    } else {
        value
    }
}

fn metadata_tags(metadata: &Value) -> Vec<String> {
    metadata
        .get("tags")
        .and_then(Value::as_array)
        .map(|tags| {
            tags.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn kebab_case() -> &'static Regex {
    static KEBAB: OnceLock<Regex> = OnceLock::new();
    KEBAB.get_or_init(|| Regex::new(r"^[a-z0-9]+(?:-[a-z0-9]+)*$").expect("valid name pattern"))
}

fn fenced_block(text: &str) -> Option<&str> {
    static FENCE: OnceLock<Regex> = OnceLock::new();
    FENCE
        .get_or_init(|| Regex::new(r"```(?:ya?ml)?[ \t]*\n([\s\S]*?)```").expect("valid fence pattern"))
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

/// Parse a YAML agent definition. When the text contains a fenced code
/// block, only the first block is parsed.
pub fn parse_draft(text: &str) -> Result<CapabilityDraft> {
    let body = fenced_block(text).unwrap_or(text).trim();

    let draft: CapabilityDraft = serde_yaml::from_str(body)
        .map_err(|e| RegistryError::Validation(format!("invalid generated YAML: {}", e)))?;
    if draft.name.trim().is_empty() {
        return Err(RegistryError::Validation("generated name is required".into()));
    }
    if draft.prompt.trim().is_empty() {
        return Err(RegistryError::Validation("generated prompt is required".into()));
    }
    Ok(draft)
}

/// Instruction sent to the model for a skill set.
pub fn generation_prompt(skills: &[String]) -> String {
    format!(
        r#"You are an expert at creating AI agent definitions. Create an agent with the following skills:

Skills required: {skills}

Generate a complete agent definition in YAML format with these exact fields:
- name: A descriptive, lowercase-kebab-case name (e.g., "react-typescript-expert")
- version: "1.0.0"
- description: Clear 1-2 sentence description of the agent's capabilities
- model: "sonnet" (use "opus" only if the skills require advanced reasoning)
- tools: Appropriate tools from this list: [{tools}]
- metadata: Include author as "generated" and a tags array matching the skills
- prompt: A detailed system prompt that defines the agent's expertise, lists core
  competencies, states working principles and sets appropriate boundaries

Only include tools that are relevant to the skills.
Respond ONLY with the YAML, no explanation or markdown code fences."#,
        skills = skills.join(", "),
        tools = ALLOWED_TOOLS.join(", "),
    )
}

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<RequestMessage>,
}

#[derive(Debug, Serialize)]
struct RequestMessage {
    role: &'static str,
    content: String,
}

/// [`Generator`] backed by the Anthropic Messages API.
#[derive(Debug, Clone)]
pub struct AnthropicGenerator {
    api_key: String,
    model: String,
    base_url: String,
    max_tokens: u32,
    max_retries: u32,
    client: reqwest::Client,
}

impl AnthropicGenerator {
    pub fn new(api_key: &str, model: &str, timeout: Duration) -> anyhow::Result<Self> {
        if api_key.trim().is_empty() {
            anyhow::bail!("Anthropic API key is required");
        }
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            api_key: api_key.trim().to_string(),
            model: non_empty_or(model.to_string(), DEFAULT_GENERATOR_MODEL),
            base_url: ANTHROPIC_API_URL.to_string(),
            max_tokens: 4096,
            max_retries: 2,
            client,
        })
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// POST a single-turn message and return the first text block.
    async fn complete(&self, prompt: String) -> anyhow::Result<String> {
        let endpoint = format!("{}/v1/messages", self.base_url);
        let body = MessagesRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            messages: vec![RequestMessage {
                role: "user",
                content: prompt,
            }],
        };

        let mut last_error: Option<anyhow::Error> = None;
        let mut retry_delay = Duration::from_secs(1);

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                log::warn!(
                    "Anthropic API retry attempt {} after {:?}",
                    attempt,
                    retry_delay
                );
                tokio::time::sleep(retry_delay).await;
                retry_delay *= 2;
            }

            let response = match self
                .client
                .post(&endpoint)
                .header("content-type", "application/json")
                .header("x-api-key", self.api_key.as_str())
                .header("anthropic-version", ANTHROPIC_VERSION)
                .json(&body)
                .send()
                .await
            {
                Ok(resp) => resp,
                Err(e) => {
                    last_error = Some(e.into());
                    continue;
                }
            };

            let status = response.status();

            if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                if let Some(retry_after) = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                {
                    retry_delay = Duration::from_secs(retry_after);
                }
                last_error = Some(anyhow::anyhow!("rate limited by Anthropic API (429)"));
                continue;
            }

            // overloaded
            if status.as_u16() == 529 || status.is_server_error() {
                last_error = Some(anyhow::anyhow!("Anthropic API server error: {}", status));
                continue;
            }

            let text = match response.text().await {
                Ok(text) => text,
                Err(e) => {
                    last_error = Some(e.into());
                    continue;
                }
            };

            if status.is_client_error() {
                anyhow::bail!("Anthropic API error ({}): {}", status, text);
            }

            let json: Value = serde_json::from_str(&text).map_err(|e| {
                anyhow::anyhow!(
                    "failed to parse Anthropic response: {} - body: {}",
                    e,
                    text.chars().take(500).collect::<String>()
                )
            })?;
            return first_text_block(&json);
        }

        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("Anthropic API call failed after all retries")))
    }
}

fn first_text_block(json: &Value) -> anyhow::Result<String> {
    if json.get("type").and_then(Value::as_str) == Some("error") {
        let msg = json
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(Value::as_str)
            .unwrap_or("unknown Anthropic API error");
        anyhow::bail!("Anthropic API error: {}", msg);
    }

    json.get("content")
        .and_then(Value::as_array)
        .and_then(|blocks| {
            blocks
                .iter()
                .find(|b| b.get("type").and_then(Value::as_str) == Some("text"))
        })
        .and_then(|b| b.get("text"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("empty response from Anthropic API"))
}

#[async_trait]
impl Generator for AnthropicGenerator {
    async fn generate_from_skills(&self, skills: &[String]) -> anyhow::Result<CapabilityDraft> {
        log::info!("Generating agent for skills: {}", skills.join(", "));
        let text = self.complete(generation_prompt(skills)).await?;
        let mut draft = parse_draft(&text)?;
        draft.skills = skills.to_vec();
        Ok(draft)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const YAML: &str = r#"```yaml
name: k8s-operator
description: Operates Kubernetes clusters
model: sonnet
tools:
  - Read
  - Bash
metadata:
  author: generated
  tags:
    - kubernetes
prompt: |
  You are an expert cluster operator.
```"#;

    #[test]
    fn test_parse_draft_strips_fences_and_defaults() {
        let draft = parse_draft(YAML).unwrap();
        assert_eq!(draft.name, "k8s-operator");
        assert_eq!(draft.tools, vec!["Read", "Bash"]);
        assert!(draft.prompt.starts_with("You are an expert"));
        assert!(draft.version.is_empty());
        draft.validate().unwrap();

        let new = draft.into_new_capability(&["Kubectl".to_string()]);
        assert!(new.is_generated);
        assert_eq!(new.version, "1.0.0");
        assert_eq!(new.skills, vec!["kubectl"]);
        assert_eq!(new.tags, vec!["kubernetes"]);
    }

    #[test]
    fn test_parse_draft_ignores_surrounding_prose() {
        let text = format!("Here is the agent:\n\n{}\n\nLet me know!", YAML);
        assert_eq!(parse_draft(&text).unwrap().name, "k8s-operator");
        // bare YAML without fences
        assert_eq!(parse_draft("name: a\nprompt: b\n").unwrap().name, "a");
    }

    #[test]
    fn test_parse_draft_requires_name_and_prompt() {
        assert!(parse_draft("name: x\n").is_err());
        assert!(parse_draft("prompt: do things\n").is_err());
        assert!(parse_draft(": : not yaml [").is_err());
    }

    #[test]
    fn test_validate_whitelists() {
        let base = CapabilityDraft {
            name: "agent".into(),
            prompt: "help".into(),
            ..CapabilityDraft::default()
        };
        base.validate().unwrap();

        let bad_model = CapabilityDraft {
            model: "gpt-4".into(),
            ..base.clone()
        };
        assert!(matches!(bad_model.validate(), Err(RegistryError::Validation(_))));

        let bad_tool = CapabilityDraft {
            tools: vec!["Read".into(), "rm".into()],
            ..base.clone()
        };
        assert_eq!(
            bad_tool.validate().unwrap_err().to_string(),
            "Validation error: invalid tool: rm"
        );

        let spaced = CapabilityDraft {
            name: "Rust Expert".into(),
            ..base.clone()
        };
        assert!(spaced.validate().is_err());

        let long_name = CapabilityDraft {
            name: "x".repeat(MAX_NAME_LEN + 1),
            ..base.clone()
        };
        assert!(long_name.validate().is_err());

        let long_prompt = CapabilityDraft {
            prompt: "x".repeat(MAX_PROMPT_LEN + 1),
            ..base
        };
        assert!(long_prompt.validate().is_err());
    }

    #[test]
    fn test_first_text_block() {
        let ok = json!({"content": [{"type": "text", "text": "name: a"}]});
        assert_eq!(first_text_block(&ok).unwrap(), "name: a");

        let err = json!({"type": "error", "error": {"message": "overloaded"}});
        assert!(first_text_block(&err).unwrap_err().to_string().contains("overloaded"));

        assert!(first_text_block(&json!({"content": []})).is_err());
    }

    #[test]
    fn test_generation_prompt_lists_skills() {
        let prompt = generation_prompt(&["docker".into(), "rust".into()]);
        assert!(prompt.contains("Skills required: docker, rust"));
        assert!(prompt.contains("WebSearch"));
    }

    #[test]
    fn test_anthropic_generator_requires_key() {
        assert!(AnthropicGenerator::new("", "", Duration::from_secs(1)).is_err());
        let g = AnthropicGenerator::new("sk-test", "", Duration::from_secs(1)).unwrap();
        assert_eq!(g.model, DEFAULT_GENERATOR_MODEL);
    }

    #[tokio::test]
    async fn test_unreachable_api_is_an_error() {
        let g = AnthropicGenerator::new("sk-test", "", Duration::from_millis(500))
            .unwrap()
            .with_base_url("http://127.0.0.1:9")
            .with_max_retries(0);
        assert!(g.generate_from_skills(&["rust".into()]).await.is_err());
    }
}
