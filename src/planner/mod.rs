//! Planning and execution of deployment changes.
//!
//! This module orders a unit's graph, compares it with the recorded
//! snapshot, turns the differences into a deployment plan, and drives the
//! plan against a provider while persisting every step.

mod diff;
mod executor;
mod plan;
mod resolver;

pub use diff::{ChangeKind, ChangeReason, DiffEngine, DiffResult, FieldChange, NodeDiff};
pub use executor::{AppliedStep, ApplyReport, CancelToken, ExecutionDriver, ReplaceStrategy};
pub use plan::{ActionType, DeploymentPlan, PlannedStep};
pub use resolver::{PlanResolver, ProvisioningPlan};
