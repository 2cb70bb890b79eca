//! AI Agents: scheduled worker orchestrator.
//!
//! Runs a fixed roster of workers on daily, weekly and monthly cadences,
//! isolates their failures, persists every run and metric, and serves the
//! aggregate status to a polling dashboard.

pub mod api;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod scheduler;
pub mod status;
pub mod store;
pub mod worker;
