// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![deny(missing_docs)]                // All public items must be documented
#![deny(dead_code)]                   // Unused code is forbidden
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention

// Additional strictness - Leave nothing unchecked
#![deny(unused_imports)]              // Unused imports are forbidden
#![deny(unused_variables)]            // Unused variables are forbidden
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::missing_const_for_fn)] // Force const when possible
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::module_inception)]    // Module with same name as crate warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::shadow_unrelated)]    // Shadowing unrelated variables warning
#![warn(clippy::too_many_arguments)]  // Limit function arguments
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Stackplan
//!
//! A declarative resource-graph provisioning engine.
//!
//! ## Overview
//!
//! Stackplan reads a YAML description of one or more deployment units, each
//! a set of typed resources that reference each other's outputs, and drives
//! a provider until what exists matches what is declared:
//!
//! - Builds a dependency graph per unit and an ordering across units
//! - Resolves a deterministic provisioning order and its teardown inverse
//! - Diffs the declared graph against the last-applied state, propagating
//!   forced replacements to dependents
//! - Applies the plan with retries, bounded fan-out and cancellation,
//!   persisting state after every node with conditional writes
//!
//! ## Architecture
//!
//! 1. **Desired State**: Defined in `stackplan.yaml`
//! 2. **Recorded State**: One versioned snapshot per unit
//! 3. **Reconciler**: Plans each unit against its snapshot and applies it
//!
//! ## Modules
//!
//! - [`config`]: Configuration parsing and validation
//! - [`graph`]: Resource nodes, dependency graphs and deployment units
//! - [`planner`]: Ordering, diffing, plans and plan execution
//! - [`provider`]: Provider contract, retry policy and implementations
//! - [`state`]: State snapshots and storage backends (local, S3, memory)
//! - [`reconciler`]: Multi-unit plan, apply, destroy and drift checks
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! project:
//!   name: n8n
//!
//! units:
//!   - name: storage
//!     exports:
//!       file_system_id: fs.file_system_id
//!     resources:
//!       - id: fs
//!         kind: file-system
//!         removal_policy: retain
//!         attributes:
//!           encrypted: true
//!       - id: access_point
//!         kind: access-point
//!         attributes:
//!           file_system: { ref: fs.id }
//!           path: /n8n-data
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod config;
pub mod error;
pub mod graph;
pub mod planner;
pub mod provider;
pub mod reconciler;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigHasher, ConfigParser, ConfigValidator, StackConfig};
pub use error::{Result, StackplanError};
pub use graph::{DeploymentUnit, GraphBuilder, ResourceGraph, ResourceKind, ResourceNode};
pub use planner::{CancelToken, DeploymentPlan, DiffEngine, ExecutionDriver, PlanResolver};
pub use provider::{HttpProvider, LocalProvider, Provider, RetryPolicy};
pub use reconciler::{DriftReport, ReconciliationResult, Reconciler};
pub use state::{LocalStateStore, MemoryStateStore, S3StateStore, StateSnapshot, StateStore};
