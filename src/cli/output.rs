//! Rendering of plans, graphs, drift reports and state for the terminal.
//!
//! Every formatter returns a `String` in either coloured text tables or
//! pretty JSON, depending on `--output`.

use colored::Colorize;
use serde::Serialize;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::{StackConfig, ValidationResult};
use crate::graph::DeploymentUnit;
use crate::planner::{ActionType, DeploymentPlan, ProvisioningPlan};
use crate::reconciler::{DriftReport, ReconciliationResult, UnitPlan};
use crate::state::StateSnapshot;

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Plan step row for table display.
#[derive(Tabled)]
struct PlanStepRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Reason")]
    reason: String,
}

/// Detailed plan step row.
#[derive(Tabled)]
struct DetailedStepRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Physical ID")]
    physical_id: String,
    #[tabled(rename = "After")]
    after: String,
    #[tabled(rename = "Reason")]
    reason: String,
}

/// Recorded resource row.
#[derive(Tabled)]
struct ResourceRow {
    #[tabled(rename = "Resource")]
    id: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Physical ID")]
    physical_id: String,
    #[tabled(rename = "Policy")]
    policy: String,
    #[tabled(rename = "Applied")]
    applied_at: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Formats the plans of several units.
    #[must_use]
    pub fn format_plans(&self, plans: &[UnitPlan], detailed: bool) -> String {
        match self.format {
            OutputFormat::Json => {
                let json: Vec<PlanJson> = plans.iter().map(PlanJson::from).collect();
                to_json(&json)
            }
            OutputFormat::Text => {
                let mut output = String::new();
                for unit_plan in plans {
                    output.push_str(&Self::format_plan_text(unit_plan, detailed));
                }
                output
            }
        }
    }

    /// Formats one unit's plan as text.
    fn format_plan_text(unit_plan: &UnitPlan, detailed: bool) -> String {
        let plan = &unit_plan.plan;
        if plan.is_empty() {
            return format!(
                "{} {}: no changes required\n",
                "✓".green(),
                plan.unit.bold()
            );
        }

        let mut output = String::new();
        let _ = writeln!(
            output,
            "\n📋 Unit {} (state version {})",
            plan.unit.bold(),
            plan.base_version
        );
        if !unit_plan.inputs_resolved {
            let _ = writeln!(
                output,
                "   {} inputs not provisioned yet; input changes are re-checked on apply",
                "note:".dimmed()
            );
        }

        let table = if detailed {
            Table::new(plan.steps.iter().enumerate().map(|(i, step)| DetailedStepRow {
                index: i + 1,
                action: Self::format_action_type(step.action),
                resource: step.node_id.clone(),
                kind: step
                    .node
                    .as_ref()
                    .map(|n| n.kind.to_string())
                    .or_else(|| step.prior.as_ref().map(|p| p.kind.to_string()))
                    .unwrap_or_default(),
                physical_id: step
                    .prior
                    .as_ref()
                    .and_then(|p| p.physical_id())
                    .unwrap_or("-")
                    .to_string(),
                after: step
                    .dependencies
                    .iter()
                    .map(|d| (d + 1).to_string())
                    .collect::<Vec<_>>()
                    .join(","),
                reason: step.reason.clone(),
            }))
            .to_string()
        } else {
            Table::new(plan.steps.iter().enumerate().map(|(i, step)| PlanStepRow {
                index: i + 1,
                action: Self::format_action_type(step.action),
                resource: step.node_id.clone(),
                reason: Self::truncate(&step.reason, 50),
            }))
            .to_string()
        };
        output.push_str(&table);
        output.push('\n');

        let _ = writeln!(
            output,
            "\nPlan: {} to create, {} to update, {} to replace, {} to destroy",
            plan.count(ActionType::Create).to_string().green(),
            plan.count(ActionType::Update).to_string().yellow(),
            plan.count(ActionType::Replace).to_string().magenta(),
            plan.count(ActionType::Delete).to_string().red()
        );

        if !plan.passes_guardrails {
            let _ = writeln!(output, "\n{} Guardrail violations:", "⚠".yellow());
            for violation in &plan.guardrail_violations {
                let _ = writeln!(output, "   - {violation}");
            }
        }

        output
    }

    /// Formats the unit order and each unit's provisioning order.
    #[must_use]
    pub fn format_graph(&self, graphs: &[(&DeploymentUnit, ProvisioningPlan)]) -> String {
        match self.format {
            OutputFormat::Json => {
                let json: Vec<GraphJson> = graphs
                    .iter()
                    .map(|(unit, order)| GraphJson {
                        unit: unit.name.clone(),
                        upstream: unit.upstream_units().iter().map(ToString::to_string).collect(),
                        order: order.iter().map(ToString::to_string).collect(),
                    })
                    .collect();
                to_json(&json)
            }
            OutputFormat::Text => {
                let mut output = String::new();
                for (i, (unit, order)) in graphs.iter().enumerate() {
                    let _ = write!(output, "{}. {}", i + 1, unit.name.bold());
                    let upstream = unit.upstream_units();
                    if !upstream.is_empty() {
                        let _ = write!(output, " (after {})", upstream.join(", "));
                    }
                    output.push('\n');

                    for id in order.iter() {
                        let Some(node) = unit.graph.get(id) else {
                            continue;
                        };
                        let _ = write!(output, "   {id} [{}]", node.kind.to_string().cyan());
                        if !node.depends_on.is_empty() {
                            let deps: Vec<&str> = node.depends_on.iter().map(String::as_str).collect();
                            let _ = write!(output, " <- {}", deps.join(", ").dimmed());
                        }
                        output.push('\n');
                    }
                }
                output
            }
        }
    }

    /// Formats a validation result with a configuration summary.
    #[must_use]
    pub fn format_validation(
        &self,
        config: &StackConfig,
        result: &ValidationResult,
        show_warnings: bool,
    ) -> String {
        match self.format {
            OutputFormat::Json => to_json(&serde_json::json!({
                "valid": result.is_valid(),
                "project": config.qualified_name(),
                "units": config.unit_names(),
                "resources": config.total_resources(),
                "warnings": result.warnings,
            })),
            OutputFormat::Text => {
                let mut output = format!("{} Configuration is valid\n", "✓".green());
                if show_warnings && !result.warnings.is_empty() {
                    let _ = writeln!(output, "\n{} Warnings:", "⚠".yellow());
                    for warning in &result.warnings {
                        let _ = writeln!(output, "   - {warning}");
                    }
                }

                let _ = writeln!(output, "\nConfiguration summary:");
                let _ = writeln!(output, "   Project: {}", config.project.name);
                let _ = writeln!(output, "   Environment: {}", config.project.environment);
                let _ = writeln!(output, "   Units: {}", config.unit_names().join(", "));
                let _ = writeln!(output, "   Resources: {}", config.total_resources());
                output
            }
        }
    }

    /// Formats a drift report.
    #[must_use]
    pub fn format_drift(&self, report: &DriftReport) -> String {
        match self.format {
            OutputFormat::Json => to_json(report),
            OutputFormat::Text => {
                if report.is_converged() {
                    return format!(
                        "{} No drift detected - {} resources match recorded state.\n",
                        "✓".green(),
                        report.checked
                    );
                }

                let mut output = String::new();
                if report.has_drift {
                    let _ = writeln!(output, "{} Drift detected:\n", "⚠".yellow());
                    for resource in &report.drifted_resources {
                        let _ = writeln!(
                            output,
                            "   - {}.{}: {}",
                            resource.unit,
                            resource.node,
                            resource.status.to_string().red()
                        );
                    }
                    let _ = writeln!(
                        output,
                        "\n{}/{} resources have drifted.",
                        report.drifted_resources.len(),
                        report.checked
                    );
                }
                for unit in &report.pending_units {
                    let _ = writeln!(
                        output,
                        "{} Unit {unit} has configuration changes not applied yet.",
                        "⚠".yellow()
                    );
                }
                output
            }
        }
    }

    /// Formats a reconciliation result.
    #[must_use]
    pub fn format_reconciliation(&self, result: &ReconciliationResult) -> String {
        match self.format {
            OutputFormat::Json => to_json(result),
            OutputFormat::Text => {
                let status = if result.success {
                    format!("{} Reconciliation successful", "✓".green())
                } else {
                    format!("{} Reconciliation failed", "✗".red())
                };

                let mut output = format!("{status}\n\n");
                let _ = writeln!(output, "   Created: {}", result.created);
                let _ = writeln!(output, "   Updated: {}", result.updated);
                let _ = writeln!(output, "   Replaced: {}", result.replaced);
                let _ = writeln!(output, "   Deleted: {}", result.deleted);

                for unit in &result.units {
                    let _ = writeln!(
                        output,
                        "   {}: {} steps, state version {} ({} ms)",
                        unit.unit, unit.steps, unit.version, unit.elapsed_ms
                    );
                }
                output
            }
        }
    }

    /// Formats a unit's state snapshot.
    #[must_use]
    pub fn format_state(&self, snapshot: &StateSnapshot) -> String {
        match self.format {
            OutputFormat::Json => to_json(snapshot),
            OutputFormat::Text => {
                let mut output = String::new();

                let _ = writeln!(output, "\n💾 State: {}\n", snapshot.unit.bold());
                let _ = writeln!(output, "   Version: {}", snapshot.version);
                let _ = writeln!(output, "   Last updated: {}", snapshot.last_updated);
                if let Some(writer) = &snapshot.writer {
                    let _ = writeln!(output, "   Writer: {writer}");
                }

                if !snapshot.resources.is_empty() {
                    let rows = snapshot.resources.iter().map(|(id, r)| ResourceRow {
                        id: id.clone(),
                        kind: r.kind.to_string(),
                        physical_id: r.physical_id().unwrap_or("-").to_string(),
                        policy: r.removal_policy.to_string(),
                        applied_at: r.applied_at.format("%Y-%m-%d %H:%M").to_string(),
                    });
                    output.push('\n');
                    output.push_str(&Table::new(rows).to_string());
                    output.push('\n');
                }

                if !snapshot.exports.is_empty() {
                    let _ = writeln!(output, "\n   Exports:");
                    for (name, value) in &snapshot.exports {
                        let _ = writeln!(output, "     {name} = {value}");
                    }
                }

                if !snapshot.history.is_empty() {
                    let _ = writeln!(output, "\n   Recent history ({}):", snapshot.history.len());
                    for entry in snapshot.history.iter().rev().take(5) {
                        let status = if entry.success { "✓".green() } else { "✗".red() };
                        let _ = write!(
                            output,
                            "     {status} {} - {} {}",
                            entry.timestamp.format("%Y-%m-%d %H:%M"),
                            entry.operation,
                            entry.node
                        );
                        if let Some(error) = &entry.error {
                            let _ = write!(output, " ({error})");
                        }
                        output.push('\n');
                    }
                }

                output
            }
        }
    }

    /// Formats the list of units with stored state.
    #[must_use]
    pub fn format_units(&self, backend: &str, units: &[String]) -> String {
        match self.format {
            OutputFormat::Json => to_json(&serde_json::json!({
                "backend": backend,
                "units": units,
            })),
            OutputFormat::Text if units.is_empty() => format!("No state stored in {backend} backend.\n"),
            OutputFormat::Text => {
                let mut output = format!("Units with state ({backend} backend):\n");
                for unit in units {
                    let _ = writeln!(output, "   - {unit}");
                }
                output
            }
        }
    }

    /// Formats an action type with color.
    fn format_action_type(action_type: ActionType) -> String {
        match action_type {
            ActionType::Create => "+create".green().to_string(),
            ActionType::Update => "~update".yellow().to_string(),
            ActionType::Replace => "±replace".magenta().to_string(),
            ActionType::Delete => "-delete".red().to_string(),
        }
    }

    /// Truncates a string to a maximum number of characters.
    fn truncate(s: &str, max_len: usize) -> String {
        if s.chars().count() <= max_len {
            s.to_string()
        } else {
            let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
            format!("{kept}...")
        }
    }
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_default()
}

// JSON serialization helpers

#[derive(Serialize)]
struct PlanJson {
    unit: String,
    base_version: u64,
    inputs_resolved: bool,
    creates: usize,
    updates: usize,
    replaces: usize,
    deletes: usize,
    passes_guardrails: bool,
    guardrail_violations: Vec<String>,
    steps: Vec<StepJson>,
}

#[derive(Serialize)]
struct StepJson {
    action: String,
    resource: String,
    reason: String,
    depends_on: Vec<usize>,
}

#[derive(Serialize)]
struct GraphJson {
    unit: String,
    upstream: Vec<String>,
    order: Vec<String>,
}

impl From<&UnitPlan> for PlanJson {
    fn from(unit_plan: &UnitPlan) -> Self {
        let plan: &DeploymentPlan = &unit_plan.plan;
        Self {
            unit: plan.unit.clone(),
            base_version: plan.base_version,
            inputs_resolved: unit_plan.inputs_resolved,
            creates: plan.count(ActionType::Create),
            updates: plan.count(ActionType::Update),
            replaces: plan.count(ActionType::Replace),
            deletes: plan.count(ActionType::Delete),
            passes_guardrails: plan.passes_guardrails,
            guardrail_violations: plan.guardrail_violations.clone(),
            steps: plan
                .steps
                .iter()
                .map(|s| StepJson {
                    action: s.action.to_string(),
                    resource: s.node_id.clone(),
                    reason: s.reason.clone(),
                    depends_on: s.dependencies.clone(),
                })
                .collect(),
        }
    }
}
