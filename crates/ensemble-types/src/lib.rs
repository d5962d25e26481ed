//! Shared domain types for Ensemble.
//!
//! This crate contains the core domain types used across the workflow engine:
//! definitions, instances, step history, checkpoints, queued inputs, the
//! shared collaborative context, audit events, and their error types.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod workflow;
