//! # agentmcp
//!
//! A registry of AI capabilities (agents, skills and slash commands) with
//! reputation scoring, role-gated governance and tiered task dispatch.
//!
//! Clients describe what they need in free text or as a skill list; the
//! [`CapabilityDispatcher`] resolves it through a fixed fallback order
//! (semantic similarity, keyword, vocabulary-expanded keyword, and for skill
//! lists a fingerprint cache and on-demand generation). Feedback feeds the
//! [`ReputationLedger`]; reports and sanctions flow through the
//! [`GovernanceEngine`], whose every mutation passes a single permission gate
//! and leaves an audit record.
//!
//! The [`ActionRouter`] exposes all of it as named actions over a flat JSON
//! argument bag, and [`server`] serves those actions over HTTP.

pub mod actions;
pub mod cache;
pub mod capabilities;
pub mod config;
pub mod dispatch;
pub mod embeddings;
pub mod error;
pub mod generator;
pub mod governance;
pub mod reputation;
pub mod server;
pub mod store;

pub use actions::ActionRouter;
pub use capabilities::{Capability, CapabilityKind, CapabilityStatus, NewCapability};
pub use dispatch::{CapabilityDispatcher, Vocabulary};
pub use error::{RegistryError, Result};
pub use governance::{GovernanceEngine, GovernanceRole};
pub use reputation::ReputationLedger;
pub use store::{CapabilityStore, MemoryStore, SqliteStore};

/// Library version
pub const VERSION: &str = "2.0.0";
