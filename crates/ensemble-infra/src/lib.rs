//! Infrastructure layer for Ensemble.
//!
//! Contains the SQLite implementation of the `WorkflowStore` port defined in
//! `ensemble-core`, plus data-directory and `config.toml` resolution.

pub mod config;
pub mod sqlite;
