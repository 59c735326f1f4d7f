//! Runtime configuration.
//!
//! [`Settings::from_env`] assembles everything the server binary needs from
//! environment variables. The library components take the narrower
//! [`DispatchConfig`], [`GovernanceConfig`] and [`Limits`] structs so they can
//! be constructed directly in tests.
//!
//! # Environment Variables
//!
//! - `AGENTMCP_PORT`: HTTP port (default: 8080)
//! - `AGENTMCP_STORE`: `sqlite` (default) or `memory`
//! - `AGENTMCP_DB_PATH`: SQLite file (default: `<data dir>/agentmcp.db`)
//! - `EMBEDDING_URL`: HTTP embedding service; unset disables semantic tiers
//! - `EMBEDDING_TIMEOUT_SECS`: default 30
//! - `ANTHROPIC_API_KEY`: unset disables generation
//! - `GENERATOR_MODEL`: default `claude-sonnet-4-20250514`
//! - `GENERATOR_TIMEOUT_SECS`: default 60
//! - `GOVERNANCE_ENABLED`: default true
//! - `AUTO_QUARANTINE_THRESHOLD`: default 3

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{RegistryError, Result};

/// Input size limits enforced before any store access.
#[derive(Debug, Clone, PartialEq)]
pub struct Limits {
    pub max_task_len: usize,
    pub max_query_len: usize,
    pub max_description_len: usize,
    pub max_name_len: usize,
    pub max_skills: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_task_len: 2000,
            max_query_len: 500,
            max_description_len: 5000,
            max_name_len: 100,
            max_skills: 20,
        }
    }
}

/// Thresholds and timeouts for the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchConfig {
    /// Minimum similarity for a semantic task match.
    pub task_threshold: f64,
    /// Minimum similarity for a skill-set similarity match.
    pub skill_threshold: f64,
    /// Candidates fetched from a similarity search.
    pub similar_limit: usize,
    /// Upper bound on any single embedding or generation call.
    pub dependency_timeout: Duration,
    /// How long a losing caller waits for a concurrent generation to land.
    pub claim_wait: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            task_threshold: 0.25,
            skill_threshold: 0.3,
            similar_limit: 3,
            dependency_timeout: Duration::from_secs(60),
            claim_wait: Duration::from_secs(90),
        }
    }
}

/// Governance engine switches.
#[derive(Debug, Clone, PartialEq)]
pub struct GovernanceConfig {
    pub enabled: bool,
    /// Pending reports that trigger an automatic quarantine.
    pub auto_quarantine_threshold: u64,
    /// Active agents scoring below this are listed as review candidates.
    pub reputation_review_threshold: f64,
}

impl Default for GovernanceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_quarantine_threshold: 3,
            reputation_review_threshold: 10.0,
        }
    }
}

/// Which [`CapabilityStore`](crate::store::CapabilityStore) backs the server.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreBackend {
    Memory,
    Sqlite(PathBuf),
}

/// Server-wide settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub port: u16,
    pub store: StoreBackend,
    pub embedding_url: Option<String>,
    pub embedding_timeout: Duration,
    pub anthropic_api_key: Option<String>,
    pub generator_model: String,
    pub generator_timeout: Duration,
    pub governance: GovernanceConfig,
    pub dispatch: DispatchConfig,
    pub limits: Limits,
}

impl Settings {
    /// Read settings from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Read settings through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let store = match get("AGENTMCP_STORE").as_deref() {
            Some("memory") => StoreBackend::Memory,
            Some("sqlite") | None => StoreBackend::Sqlite(
                get("AGENTMCP_DB_PATH")
                    .map(PathBuf::from)
                    .unwrap_or_else(default_db_path),
            ),
            Some(other) => {
                return Err(RegistryError::Validation(format!(
                    "AGENTMCP_STORE must be 'memory' or 'sqlite', got '{}'",
                    other
                )))
            }
        };

        let embedding_timeout = Duration::from_secs(parse_or(&get, "EMBEDDING_TIMEOUT_SECS", 30)?);
        let generator_timeout = Duration::from_secs(parse_or(&get, "GENERATOR_TIMEOUT_SECS", 60)?);

        let governance = GovernanceConfig {
            enabled: parse_or(&get, "GOVERNANCE_ENABLED", true)?,
            auto_quarantine_threshold: parse_or(&get, "AUTO_QUARANTINE_THRESHOLD", 3)?,
            ..GovernanceConfig::default()
        };

        let dispatch = DispatchConfig {
            dependency_timeout: embedding_timeout.max(generator_timeout),
            ..DispatchConfig::default()
        };

        Ok(Self {
            port: parse_or(&get, "AGENTMCP_PORT", 8080)?,
            store,
            embedding_url: get("EMBEDDING_URL"),
            embedding_timeout,
            anthropic_api_key: get("ANTHROPIC_API_KEY"),
            generator_model: get("GENERATOR_MODEL")
                .unwrap_or_else(|| "claude-sonnet-4-20250514".to_string()),
            generator_timeout,
            governance,
            dispatch,
            limits: Limits::default(),
        })
    }
}

fn parse_or<T, F>(get: &F, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw.trim().parse().map_err(|_| {
            RegistryError::Validation(format!("invalid value for {}: '{}'", key, raw))
        }),
        None => Ok(default),
    }
}

/// `<data dir>/agentmcp.db`, where the data dir follows platform convention.
fn default_db_path() -> PathBuf {
    let base = if cfg!(target_os = "macos") {
        env::var("HOME")
            .map(|h| PathBuf::from(h).join("Library").join("Application Support"))
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    } else if cfg!(target_os = "windows") {
        env::var("LOCALAPPDATA")
            .or_else(|_| env::var("APPDATA"))
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\tmp"))
    } else {
        env::var("HOME")
            .map(|h| PathBuf::from(h).join(".local").join("share"))
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    };
    base.join("agentmcp").join("agentmcp.db")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings(vars: &[(&str, &str)]) -> Result<Settings> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn test_defaults() {
        let s = settings(&[]).unwrap();
        assert_eq!(s.port, 8080);
        assert!(matches!(s.store, StoreBackend::Sqlite(_)));
        assert!(s.embedding_url.is_none());
        assert!(s.anthropic_api_key.is_none());
        assert!(s.governance.enabled);
        assert_eq!(s.governance.auto_quarantine_threshold, 3);
        assert_eq!(s.dispatch.task_threshold, 0.25);
        assert_eq!(s.dispatch.skill_threshold, 0.3);
        assert_eq!(s.limits.max_task_len, 2000);
    }

    #[test]
    fn test_overrides() {
        let s = settings(&[
            ("AGENTMCP_PORT", "9000"),
            ("AGENTMCP_STORE", "memory"),
            ("EMBEDDING_URL", "http://localhost:8001"),
            ("GOVERNANCE_ENABLED", "false"),
            ("AUTO_QUARANTINE_THRESHOLD", "5"),
        ])
        .unwrap();
        assert_eq!(s.port, 9000);
        assert_eq!(s.store, StoreBackend::Memory);
        assert_eq!(s.embedding_url.as_deref(), Some("http://localhost:8001"));
        assert!(!s.governance.enabled);
        assert_eq!(s.governance.auto_quarantine_threshold, 5);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(settings(&[("AGENTMCP_PORT", "eighty")]).is_err());
        assert!(settings(&[("AGENTMCP_STORE", "postgres")]).is_err());
    }

    #[test]
    fn test_blank_values_fall_back_to_defaults() {
        let s = settings(&[("ANTHROPIC_API_KEY", "  "), ("AGENTMCP_PORT", "")]).unwrap();
        assert!(s.anthropic_api_key.is_none());
        assert_eq!(s.port, 8080);
    }
}
