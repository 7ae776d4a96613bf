//! Follow-up engine
//!
//! - [`StepPlanner`] - pure decision of the next step
//! - [`StepExecutor`] - runs one step as an atomic unit
//! - [`FollowupService`] - start, halt and admin operations

mod executor;
mod planner;
mod service;

pub use executor::{ExecutorError, RunOutcome, StepExecutor};
pub use planner::{build_payload, DispatchIntent, StepPlan, StepPlanner, DEFAULT_STAFF_ROLE};
pub use service::{FollowupService, ServiceError, StartOutcome, StartResult};
