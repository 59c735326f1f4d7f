//! # Capabilities
//!
//! The registry's single entity type. Agents, skills and commands share
//! identity, discovery metadata, counters and reputation; they differ only in
//! their status domain and their operational payload, so both live in the
//! kind-tagged [`CapabilityBody`].
//!
//! ## Lifecycle
//!
//! 1. A [`NewCapability`] draft is registered: reputation starts at 50, status
//!    is `active`, usage and feedback counters are zero.
//! 2. Usage increments, feedback and governance actions mutate it.
//! 3. Nothing is ever deleted; status transitions remove a capability from
//!    the active pool.

pub mod capability;

pub use capability::{
    normalize_terms, AgentProfile, AgentStatus, Capability, CapabilityBody, CapabilityId,
    CapabilityKind, CapabilityStatus, CapabilitySummary, CommandArgument, CommandTemplate,
    ContentStatus, Example, NewCapability, ScoredCapability, SkillDocument, DEFAULT_MODEL,
    DEFAULT_VERSION, INITIAL_REPUTATION,
};
