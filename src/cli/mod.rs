//! Command-line interface for stackplan.
//!
//! This module provides the argument definitions and the formatting of
//! plans, reports and state for the terminal.

mod commands;
mod output;

pub use commands::{Cli, Commands, LogFormat, OutputFormat, StateCommands};
pub use output::OutputFormatter;
