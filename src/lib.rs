//! Decision and workflow orchestration for compliance remediation.
//!
//! A detected violation is classified by the [`decision`] engine, turned into
//! a step graph by the [`builder`], and driven to completion by the
//! [`orchestrator`]: automated steps go through the lease-based [`queue`],
//! human steps become tasks in the [`human`] task manager.

pub mod builder;
pub mod config;
pub mod decision;
pub mod error;
pub mod executor;
pub mod human;
pub mod notify;
pub mod orchestrator;
pub mod queue;
pub mod runner;
pub mod signal;
pub mod workflow;

pub use config::RemediatorConfig;
pub use error::RemediatorError;
pub use orchestrator::Orchestrator;
