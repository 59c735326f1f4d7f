//! Task vocabulary expansion.
//!
//! A [`Vocabulary`] maps canonical keywords to synonyms and common typos.
//! Expansion widens keyword recall ("reviw my code" also searches "review")
//! without ever removing words from the task.

use std::collections::{BTreeMap, HashSet};

use crate::error::{RegistryError, Result};

/// Built-in keyword → alias table.
const DEFAULT_ALIASES: &[(&str, &[&str])] = &[
    ("review", &["code", "quality", "check", "audit", "inspect", "reviw", "reveiw"]),
    ("code", &["programming", "coding", "development", "software", "script"]),
    ("bug", &["fix", "debug", "error", "issue", "problem", "bugs", "fixing", "code-quality"]),
    ("refactor", &["clean", "improve", "restructure", "optimize"]),
    ("test", &["testing", "tests", "unittest", "unit", "qa", "quality"]),
    ("e2e", &["end-to-end", "integration", "functional"]),
    ("security", &["secure", "vulnerability", "vulnerabilities", "exploit", "attack", "pentest"]),
    ("audit", &["review", "check", "assess", "examine"]),
    ("docs", &["documentation", "document", "readme", "guide", "manual", "explain"]),
    ("write", &["create", "generate", "draft", "compose"]),
    ("data", &["dataset", "database", "analytics", "statistics", "metrics"]),
    ("analyze", &["analysis", "examine", "study", "investigate", "explore"]),
    ("charts", &["graphs", "visualization", "visualize", "plots", "dashboard", "report"]),
    ("architecture", &["design", "structure", "system", "scalable", "microservices"]),
    ("scale", &["scalability", "scaling", "performance", "optimize", "load"]),
    ("performance", &["optimize", "speed", "fast", "slow", "bottleneck", "efficient", "optimization"]),
    ("improve", &["better", "enhance", "upgrade", "fix", "refine", "polish", "quality"]),
    ("quality", &["better", "improve", "good", "clean", "nice", "readable"]),
    ("deploy", &["deployment", "release", "ship", "publish", "rollout"]),
    ("devops", &["ci", "cd", "pipeline", "cicd", "ci/cd", "infrastructure", "infra"]),
    ("docker", &["container", "containerize", "kubernetes", "k8s"]),
];

/// Punctuation stripped from token edges. `-` and `/` are kept so that
/// "end-to-end" and "ci/cd" survive as whole tokens.
const EDGE_PUNCTUATION: &[char] = &[',', '.', '!', '?', ';', ':', '(', ')', '"', '\'', '[', ']'];

/// Immutable alias table.
///
/// Keywords are held in a `BTreeMap`, so expansion always visits them in
/// lexicographic order and alias lists in their declared order.
#[derive(Debug, Clone, PartialEq)]
pub struct Vocabulary {
    aliases: BTreeMap<String, Vec<String>>,
}

impl Default for Vocabulary {
    fn default() -> Self {
        Self::new(
            DEFAULT_ALIASES
                .iter()
                .map(|(key, aliases)| (*key, aliases.iter().copied())),
        )
    }
}

impl Vocabulary {
    pub fn new<I, K, A, S>(table: I) -> Self
    where
        I: IntoIterator<Item = (K, A)>,
        K: AsRef<str>,
        A: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let aliases = table
            .into_iter()
            .map(|(key, aliases)| {
                let aliases: Vec<String> = aliases
                    .into_iter()
                    .map(|a| a.as_ref().trim().to_lowercase())
                    .filter(|a| !a.is_empty())
                    .collect();
                (key.as_ref().trim().to_lowercase(), aliases)
            })
            .filter(|(key, _)| !key.is_empty())
            .collect();
        Self { aliases }
    }

    /// Load a table from a JSON object of `keyword -> [alias, ...]`.
    pub fn from_json(json: &str) -> Result<Self> {
        let table: BTreeMap<String, Vec<String>> = serde_json::from_str(json)
            .map_err(|e| RegistryError::Validation(format!("invalid vocabulary: {}", e)))?;
        Ok(Self::new(table))
    }

    pub fn len(&self) -> usize {
        self.aliases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.aliases.is_empty()
    }

    pub fn aliases(&self, keyword: &str) -> Option<&[String]> {
        self.aliases.get(keyword).map(Vec::as_slice)
    }

    /// Append implied keywords and aliases to `text`.
    ///
    /// For each keyword: if one of its aliases is present and the keyword is
    /// not, the keyword is appended; then, if the keyword is present (given
    /// or just appended), every missing alias is appended. Matching is on
    /// whole tokens only.
    pub fn expand_task(&self, text: &str) -> String {
        let mut expanded = text.to_string();
        let mut words: HashSet<String> = tokenize(text).collect();

        for (keyword, aliases) in &self.aliases {
            if !words.contains(keyword) && aliases.iter().any(|a| words.contains(a)) {
                words.insert(keyword.clone());
                expanded.push(' ');
                expanded.push_str(keyword);
            }
            // a keyword implied by an alias pulls in its siblings as well
            if words.contains(keyword) {
                for alias in aliases {
                    if words.insert(alias.clone()) {
                        expanded.push(' ');
                        expanded.push_str(alias);
                    }
                }
            }
        }

        expanded
    }
}

/// Lower-cased whitespace tokens with edge punctuation removed.
pub fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split_whitespace()
        .map(|w| w.trim_matches(EDGE_PUNCTUATION).to_lowercase())
        .filter(|w| !w.is_empty())
}
