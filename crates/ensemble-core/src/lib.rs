//! Workflow engine logic and repository trait definitions for Ensemble.
//!
//! This crate defines the storage port (`WorkflowStore`) that the
//! infrastructure layer implements, plus the engine components built on it.
//! It depends only on `ensemble-types` -- never on `ensemble-infra` or any
//! database/IO crate.

pub mod event;
pub mod repository;
pub mod workflow;
