//! Rule evaluation core for the home-alarm automation backend.
//!
//! This crate provides:
//! - Condition-tree and action schemas with serde (de)serialization
//! - A pure condition evaluator plus an explain variant for simulation
//! - Save-time validation with path-addressed errors
//! - Entity-id extraction for the dispatcher's reverse index
//! - Gateway contracts and the THEN-action executor
//! - Repository traits with an in-memory implementation
//! - The two-pass rules engine (`run_rules`) and dry-run simulation

pub mod audit;
pub mod engine;
pub mod evaluator;
pub mod executor;
pub mod extractor;
pub mod gateways;
pub mod repository;
pub mod runtime;
pub mod schema;
pub mod validation;
