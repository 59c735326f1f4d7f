//! HTTP server for the capability registry.
//!
//! Exposes every [`ActionRouter`](crate::actions::ActionRouter) action over
//! plain JSON.
//!
//! # Endpoints
//!
//! - `GET  /health`       : Liveness probe
//! - `GET  /actions`      : Action catalog
//! - `POST /actions/:name`: Invoke an action

pub mod routes;

pub use routes::{app_router, AppState};
