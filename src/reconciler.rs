//! Multi-unit orchestration.
//!
//! The reconciler walks the deployment units of a configuration in
//! dependency order: it plans and applies each unit against its own state
//! snapshot, feeding upstream outputs into downstream inputs, tears units
//! down in the reverse order, and compares recorded outputs with what the
//! provider currently reports.

use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::StackConfig;
use crate::error::{ApplyError, ConfigError, Result, StackplanError};
use crate::graph::{DeploymentUnit, UnitGraph};
use crate::planner::{
    ActionType, ApplyReport, CancelToken, DeploymentPlan, DiffEngine, ExecutionDriver,
    PlanResolver,
};
use crate::provider::{Provider, ResourceRequest, RetryPolicy};
use crate::state::{StateSnapshot, StateStore};

/// Orchestrates planning, applying and destroying every unit of a stack.
pub struct Reconciler<'a> {
    /// Configuration.
    config: &'a StackConfig,
    /// Units built from the configuration, in dependency order.
    units: Vec<DeploymentUnit>,
    /// Provider used for drift checks.
    provider: Arc<dyn Provider>,
    /// State store.
    store: Arc<dyn StateStore>,
    /// Driver applying unit plans.
    driver: ExecutionDriver,
    /// Retry policy for drift checks.
    retry: RetryPolicy,
}

/// Plan of one unit.
#[derive(Debug, Clone)]
pub struct UnitPlan {
    /// The unit's deployment plan.
    pub plan: DeploymentPlan,
    /// Snapshot the plan was computed against.
    pub snapshot: StateSnapshot,
    /// Whether the unit's inputs could be resolved from upstream state.
    ///
    /// When false, input-driven changes are only detected at apply time.
    pub inputs_resolved: bool,
}

/// Result of applying or destroying a stack.
#[derive(Debug, Serialize)]
pub struct ReconciliationResult {
    /// Whether every unit was processed.
    pub success: bool,
    /// Number of resources created.
    pub created: usize,
    /// Number of resources updated.
    pub updated: usize,
    /// Number of resources replaced.
    pub replaced: usize,
    /// Number of resources deleted.
    pub deleted: usize,
    /// Units processed, in processing order.
    pub units: Vec<UnitSummary>,
}

/// Outcome of one unit in a reconciliation run.
#[derive(Debug, Serialize)]
pub struct UnitSummary {
    /// Unit name.
    pub unit: String,
    /// Number of steps applied.
    pub steps: usize,
    /// Snapshot version after the run.
    pub version: u64,
    /// Wall time in milliseconds.
    pub elapsed_ms: u128,
}

/// Report of drift detection.
#[derive(Debug, Serialize)]
pub struct DriftReport {
    /// Whether drift was detected.
    pub has_drift: bool,
    /// Resources that have drifted.
    pub drifted_resources: Vec<DriftedResource>,
    /// Units with configuration changes not applied yet.
    pub pending_units: Vec<String>,
    /// Number of recorded resources checked.
    pub checked: usize,
}

/// A recorded resource whose provider side differs from state.
#[derive(Debug, Clone, Serialize)]
pub struct DriftedResource {
    /// Unit name.
    pub unit: String,
    /// Node id.
    pub node: String,
    /// What differs.
    pub status: DriftStatus,
}

/// Kind of drift on one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "outputs")]
pub enum DriftStatus {
    /// The provider no longer knows the resource.
    Missing,
    /// The provider reports different outputs.
    Changed(Vec<String>),
}

impl<'a> Reconciler<'a> {
    /// Creates a reconciler, building and ordering every unit.
    ///
    /// # Errors
    ///
    /// Returns a graph error if a unit graph is invalid or the units depend
    /// on each other cyclically.
    pub fn new(
        config: &'a StackConfig,
        provider: Arc<dyn Provider>,
        store: Arc<dyn StateStore>,
    ) -> Result<Self> {
        let built = config.build_units()?;
        let units = UnitGraph::new(&built)?
            .ordered()?
            .into_iter()
            .cloned()
            .collect();

        let driver = ExecutionDriver::new(Arc::clone(&provider), Arc::clone(&store))
            .with_execution(&config.execution);

        Ok(Self {
            config,
            units,
            provider,
            store,
            driver,
            retry: config.execution.retry_policy(),
        })
    }

    /// Units in dependency order.
    #[must_use]
    pub fn units(&self) -> &[DeploymentUnit] {
        &self.units
    }

    /// Gets the state store.
    #[must_use]
    pub fn store(&self) -> &dyn StateStore {
        self.store.as_ref()
    }

    /// Plans every selected unit without touching the provider.
    ///
    /// # Errors
    ///
    /// Returns an error if a unit name is unknown, state cannot be loaded,
    /// or a plan cannot be resolved.
    pub async fn plan(&self, only: Option<&str>) -> Result<Vec<UnitPlan>> {
        let mut plans = Vec::new();
        for unit in self.selected(only)? {
            let snapshot = self.store.load(&unit.name).await?;
            let inputs = match self.resolve_inputs(unit).await {
                Ok(inputs) => Some(inputs),
                Err(err) => {
                    debug!("Inputs of {} not available yet: {err}", unit.name);
                    None
                }
            };

            let plan = self.plan_unit(unit, &snapshot, inputs.clone())?;
            plans.push(UnitPlan {
                plan,
                snapshot,
                inputs_resolved: inputs.is_some() || unit.inputs.is_empty(),
            });
        }
        Ok(plans)
    }

    /// Plans and applies every selected unit in dependency order.
    ///
    /// Each unit is re-planned right before it is applied so it sees the
    /// outputs its upstream units just produced.
    ///
    /// # Errors
    ///
    /// Returns the first unit's apply error; units already applied stay
    /// applied and recorded.
    pub async fn apply(&self, only: Option<&str>, cancel: &CancelToken) -> Result<ReconciliationResult> {
        info!(
            "Applying {} ({} units)",
            self.config.qualified_name(),
            self.units.len()
        );

        let mut reports = Vec::new();
        for unit in self.selected(only)? {
            if cancel.is_cancelled() {
                return Err(ApplyError::Cancelled {
                    last_applied: reports
                        .last()
                        .and_then(|r: &ApplyReport| r.applied.last())
                        .map(|s| s.node_id.clone()),
                }
                .into());
            }

            let mut snapshot = self.store.load(&unit.name).await?;
            let inputs = self.resolve_inputs(unit).await?;
            let plan = self.plan_unit(unit, &snapshot, Some(inputs.clone()))?;

            let report = self
                .driver
                .apply(&plan, &mut snapshot, &inputs, &unit.exports, cancel)
                .await?;
            reports.push(report);
        }

        Ok(ReconciliationResult::from_reports(&reports))
    }

    /// Deletes every resource of the selected units, downstream units first,
    /// then removes their state.
    ///
    /// # Errors
    ///
    /// Returns the first unit's error; units already destroyed stay removed.
    pub async fn destroy(&self, only: Option<&str>, cancel: &CancelToken) -> Result<ReconciliationResult> {
        let selected = self.selected(only)?;
        let mut reports = Vec::new();

        for unit in selected.into_iter().rev() {
            if only.is_some() {
                self.warn_live_consumers(&unit.name).await?;
            }

            let mut snapshot = self.store.load(&unit.name).await?;
            if snapshot.version == 0 {
                debug!("Unit {} has no state, nothing to destroy", unit.name);
                continue;
            }

            let plan = DeploymentPlan::teardown(&snapshot)?;
            info!("Destroying {} ({} resources)", unit.name, plan.step_count());

            let report = self
                .driver
                .apply(&plan, &mut snapshot, &BTreeMap::new(), &BTreeMap::new(), cancel)
                .await?;

            self.store.delete(&unit.name, snapshot.version).await?;
            info!("Removed state of {}", unit.name);
            reports.push(report);
        }

        Ok(ReconciliationResult::from_reports(&reports))
    }

    /// Compares every recorded resource with what the provider reports, and
    /// flags units whose configuration has unapplied changes.
    ///
    /// # Errors
    ///
    /// Returns an error if state cannot be loaded or a describe call fails
    /// after retries.
    pub async fn check_drift(&self) -> Result<DriftReport> {
        info!("Checking for drift in {}", self.config.qualified_name());

        let mut drifted_resources = Vec::new();
        let mut pending_units = Vec::new();
        let mut checked = 0;

        for unit in &self.units {
            let snapshot = self.store.load(&unit.name).await?;

            for (id, resource) in &snapshot.resources {
                let Some(physical_id) = resource.physical_id() else {
                    continue;
                };
                checked += 1;

                let request = ResourceRequest::new(
                    &unit.name,
                    id,
                    resource.kind.clone(),
                    resource.resolved.clone(),
                )
                .with_physical_id(physical_id);

                let described = self
                    .retry
                    .run(id, || self.provider.describe(&request))
                    .await?;

                let status = match described {
                    None => Some(DriftStatus::Missing),
                    Some(outputs) => {
                        let changed = changed_outputs(&resource.outputs, &outputs);
                        (!changed.is_empty()).then_some(DriftStatus::Changed(changed))
                    }
                };

                if let Some(status) = status {
                    warn!("Drift on {}.{id}: {status:?}", unit.name);
                    drifted_resources.push(DriftedResource {
                        unit: unit.name.clone(),
                        node: id.clone(),
                        status,
                    });
                }
            }

            let inputs = self.resolve_inputs(unit).await.ok();
            if self.plan_unit(unit, &snapshot, inputs)?.is_empty() {
                continue;
            }
            pending_units.push(unit.name.clone());
        }

        Ok(DriftReport {
            has_drift: !drifted_resources.is_empty(),
            drifted_resources,
            pending_units,
            checked,
        })
    }

    /// Units to operate on, in dependency order.
    fn selected(&self, only: Option<&str>) -> Result<Vec<&DeploymentUnit>> {
        match only {
            None => Ok(self.units.iter().collect()),
            Some(name) => self
                .units
                .iter()
                .find(|u| u.name == name)
                .map(|u| vec![u])
                .ok_or_else(|| {
                    StackplanError::Config(ConfigError::UnknownUnit {
                        name: name.to_string(),
                    })
                }),
        }
    }

    /// Resolves a unit's inputs from the exports of its upstream snapshots.
    async fn resolve_inputs(&self, unit: &DeploymentUnit) -> Result<BTreeMap<String, Value>> {
        let mut upstream: BTreeMap<&str, StateSnapshot> = BTreeMap::new();
        for name in unit.upstream_units() {
            upstream.insert(name, self.store.load(name).await?);
        }

        unit.resolve_inputs(|source| {
            upstream
                .get(source.unit.as_str())
                .and_then(|snapshot| snapshot.output(&source.node, &source.output))
                .cloned()
        })
    }

    fn plan_unit(
        &self,
        unit: &DeploymentUnit,
        snapshot: &StateSnapshot,
        inputs: Option<BTreeMap<String, Value>>,
    ) -> Result<DeploymentPlan> {
        let order = PlanResolver::new().resolve(&unit.graph)?;

        let engine = match inputs {
            Some(inputs) => DiffEngine::new().with_inputs(inputs),
            None => DiffEngine::new(),
        };
        let diff = engine.diff(&unit.graph, snapshot);

        debug!(
            "Diff of {}: {} creates, {} updates, {} replaces, {} deletes, {} unchanged",
            unit.name, diff.creates, diff.updates, diff.replaces, diff.deletes, diff.unchanged
        );

        DeploymentPlan::from_diff(
            &unit.graph,
            &order,
            &diff,
            snapshot,
            self.config.guardrails.as_ref(),
        )
    }

    /// Warns if a unit consuming `unit` still has provisioned resources.
    async fn warn_live_consumers(&self, unit: &str) -> Result<()> {
        for consumer in self
            .units
            .iter()
            .filter(|u| u.upstream_units().contains(&unit))
        {
            if !self.store.load(&consumer.name).await?.is_empty() {
                warn!(
                    "Unit {} still reads outputs of {unit} and has live resources",
                    consumer.name
                );
            }
        }
        Ok(())
    }
}

/// Names of outputs that differ between state and provider, sorted.
fn changed_outputs(recorded: &BTreeMap<String, Value>, observed: &BTreeMap<String, Value>) -> Vec<String> {
    recorded
        .keys()
        .chain(observed.keys())
        .filter(|key| recorded.get(*key) != observed.get(*key))
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

impl ReconciliationResult {
    fn from_reports(reports: &[ApplyReport]) -> Self {
        let total = |action| reports.iter().map(|r| r.count(action)).sum();

        Self {
            success: true,
            created: total(ActionType::Create),
            updated: total(ActionType::Update),
            replaced: total(ActionType::Replace),
            deleted: total(ActionType::Delete),
            units: reports
                .iter()
                .map(|r| UnitSummary {
                    unit: r.unit.clone(),
                    steps: r.applied.len(),
                    version: r.version,
                    elapsed_ms: r.elapsed.as_millis(),
                })
                .collect(),
        }
    }
}

impl DriftReport {
    /// Returns true if the state is converged (no drift, nothing pending).
    #[must_use]
    pub fn is_converged(&self) -> bool {
        !self.has_drift && self.pending_units.is_empty()
    }
}

impl std::fmt::Display for DriftStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Missing => write!(f, "missing at provider"),
            Self::Changed(outputs) => write!(f, "outputs changed: {}", outputs.join(", ")),
        }
    }
}

impl std::fmt::Display for DriftReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_converged() {
            return write!(f, "No drift detected - state is converged");
        }

        if self.has_drift {
            writeln!(f, "Drift detected:")?;
            for resource in &self.drifted_resources {
                writeln!(f, "  - {}.{}: {}", resource.unit, resource.node, resource.status)?;
            }
        }
        for unit in &self.pending_units {
            writeln!(f, "  - {unit}: configuration has unapplied changes")?;
        }
        Ok(())
    }
}

impl std::fmt::Display for ReconciliationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = if self.success { "successful" } else { "failed" };
        writeln!(f, "Reconciliation {status}:")?;
        writeln!(f, "  Created: {}", self.created)?;
        writeln!(f, "  Updated: {}", self.updated)?;
        writeln!(f, "  Replaced: {}", self.replaced)?;
        writeln!(f, "  Deleted: {}", self.deleted)?;

        for unit in &self.units {
            writeln!(
                f,
                "  {}: {} steps, state version {} ({} ms)",
                unit.unit, unit.steps, unit.version, unit.elapsed_ms
            )?;
        }

        Ok(())
    }
}
