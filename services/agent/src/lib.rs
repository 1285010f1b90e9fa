//! Agent service library crate.
//!
//! # Purpose
//! Exposes the agent's subsystems (configuration, the four-stage pipeline,
//! the change signal) for use by the agent binary and integration tests.
//!
//! # Notes
//! The pipeline stages only meet through the store and the bounded queue;
//! none of them share mutable state directly.
pub mod config;
pub mod pipeline;
pub mod signal;
