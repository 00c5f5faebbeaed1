//! Execution driver for applying deployment plans.
//!
//! The driver walks a plan, issues provider operations for each step and
//! persists the unit's snapshot after every confirmed operation. Steps are
//! launched only once every step they depend on has completed; up to
//! `max_parallel` independent steps may be in flight at once. Provider calls
//! run as tasks in a [`JoinSet`], while the snapshot stays owned by the
//! driver and is updated one completion at a time.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::{self, JoinSet};
use tracing::{debug, error, info, warn};

use crate::config::ExecutionConfig;
use crate::error::{ApplyError, GraphError, ProviderError, Result, StackplanError, StateError};
use crate::graph::{OutputRef, Outputs, RemovalPolicy, ResourceNode};
use crate::provider::{Provider, ProviderResult, ResourceRequest, RetryPolicy, ensure_id};
use crate::state::{
    HistoryEntry, Operation, ResourceState, StateSnapshot, StateStore, writer_id,
};

use super::plan::{ActionType, DeploymentPlan, PlannedStep};

/// Order of the two provider calls making up a replacement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplaceStrategy {
    /// Delete the old resource, then create the new one.
    #[default]
    DeleteBeforeCreate,
    /// Create the new resource, then delete the old one.
    CreateBeforeDelete,
}

/// Cooperative cancellation flag shared between a driver and its caller.
///
/// Cancelling stops new operations from being issued; operations already
/// in flight run to completion and are persisted.
#[derive(Debug, Clone)]
pub struct CancelToken {
    sender: Arc<watch::Sender<bool>>,
}

/// Applies deployment plans against a provider and a state store.
pub struct ExecutionDriver {
    provider: Arc<dyn Provider>,
    store: Arc<dyn StateStore>,
    strategy: ReplaceStrategy,
    max_parallel: usize,
    retry: RetryPolicy,
}

/// Summary of a successful apply.
#[derive(Debug, Clone)]
pub struct ApplyReport {
    /// Unit the plan was applied to.
    pub unit: String,
    /// Completed steps, in completion order.
    pub applied: Vec<AppliedStep>,
    /// Snapshot version after the last write.
    pub version: u64,
    /// Wall time of the apply.
    pub elapsed: Duration,
}

/// A completed step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedStep {
    /// Node id.
    pub node_id: String,
    /// Action performed.
    pub action: ActionType,
}

/// One provider call, or state-only change, within a step.
#[derive(Debug, Clone)]
enum Op {
    Create,
    Update,
    Delete {
        physical_id: Option<String>,
        /// The record already describes a replacement and must stay.
        keep_record: bool,
    },
    Forget {
        keep_record: bool,
    },
}

/// Result of one finished op.
struct OpOutcome {
    step: usize,
    op: Op,
    resolved: BTreeMap<String, Value>,
    result: ProviderResult<Option<Outputs>>,
}

/// Why the driver stopped launching steps.
enum Halt {
    Cancelled,
    Failed { node: String, error: StackplanError },
    /// The snapshot could not be written; nothing further is recorded.
    Persist(StackplanError),
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    /// Creates a token that is not cancelled.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    /// Returns true once cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.sender.borrow()
    }
}

impl fmt::Debug for ExecutionDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionDriver")
            .field("store", &self.store.backend_type())
            .field("strategy", &self.strategy)
            .field("max_parallel", &self.max_parallel)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl ExecutionDriver {
    /// Creates a driver with sequential execution and the default retry policy.
    #[must_use]
    pub fn new(provider: Arc<dyn Provider>, store: Arc<dyn StateStore>) -> Self {
        Self {
            provider,
            store,
            strategy: ReplaceStrategy::default(),
            max_parallel: 1,
            retry: RetryPolicy::default(),
        }
    }

    /// Applies the execution settings from configuration.
    #[must_use]
    pub fn with_execution(self, execution: &ExecutionConfig) -> Self {
        self.with_strategy(execution.replace_strategy)
            .with_max_parallel(execution.max_parallel)
            .with_retry_policy(execution.retry_policy())
    }

    /// Sets the replacement strategy.
    #[must_use]
    pub const fn with_strategy(mut self, strategy: ReplaceStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Sets the fan-out limit; 0 is treated as 1.
    #[must_use]
    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel.max(1);
        self
    }

    /// Sets the retry policy for provider calls.
    #[must_use]
    pub const fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Applies `plan`, updating and persisting `snapshot` as steps complete.
    ///
    /// `inputs` are the resolved cross-unit inputs of the unit and `exports`
    /// its export declarations, refreshed into the snapshot on every write.
    ///
    /// # Errors
    ///
    /// - `GuardrailViolation` if the plan failed its guardrails
    /// - `ConcurrentModification` if the stored state moved since the plan
    ///   was made, or a write loses a race with another run
    /// - `PartialApply` if a step fails; the stored snapshot then holds
    ///   exactly the steps that succeeded
    /// - `Cancelled` if `cancel` fired
    pub async fn apply(
        &self,
        plan: &DeploymentPlan,
        snapshot: &mut StateSnapshot,
        inputs: &BTreeMap<String, Value>,
        exports: &BTreeMap<String, OutputRef>,
        cancel: &CancelToken,
    ) -> Result<ApplyReport> {
        let started = Instant::now();

        if !plan.passes_guardrails {
            error!("Plan for {} does not pass guardrails", plan.unit);
            return Err(ApplyError::GuardrailViolation {
                unit: plan.unit.clone(),
                violations: plan.guardrail_violations.clone(),
            }
            .into());
        }

        self.preflight(plan, snapshot).await?;

        let mut report = ApplyReport {
            unit: plan.unit.clone(),
            applied: Vec::with_capacity(plan.steps.len()),
            version: snapshot.version,
            elapsed: Duration::ZERO,
        };

        if plan.is_empty() {
            info!("No changes to apply for {}", plan.unit);
            return Ok(report);
        }

        info!(
            "Applying {} steps to {} (max_parallel: {})",
            plan.step_count(),
            plan.unit,
            self.max_parallel
        );

        let mut pending: Vec<usize> = (0..plan.steps.len()).collect();
        let mut completed: HashSet<usize> = HashSet::new();
        let mut queued: HashMap<usize, VecDeque<Op>> = HashMap::new();
        let mut tasks: JoinSet<OpOutcome> = JoinSet::new();
        let mut running: HashMap<task::Id, usize> = HashMap::new();
        let mut last_applied: Option<String> = None;
        let mut halt: Option<Halt> = None;

        loop {
            if halt.is_none() && cancel.is_cancelled() {
                warn!(
                    "Cancellation requested, waiting for {} in-flight operations",
                    tasks.len()
                );
                halt = Some(Halt::Cancelled);
            }

            while halt.is_none() && tasks.len() < self.max_parallel {
                let Some(pos) = pending.iter().position(|&i| {
                    plan.steps[i]
                        .dependencies
                        .iter()
                        .all(|d| completed.contains(d))
                }) else {
                    break;
                };
                let index = pending.remove(pos);
                let step = &plan.steps[index];

                let mut ops = self.ops_for(step, snapshot);
                let Some(op) = ops.pop_front() else {
                    completed.insert(index);
                    continue;
                };
                queued.insert(index, ops);

                info!("{}", step.description());
                match self.launch(&mut tasks, plan, index, op, snapshot, inputs) {
                    Ok(id) => {
                        running.insert(id, index);
                    }
                    Err(e) => {
                        error!("Cannot start {}: {e}", step.node_id);
                        halt = Some(Halt::Failed {
                            node: step.node_id.clone(),
                            error: e,
                        });
                    }
                }
            }

            let Some(joined) = tasks.join_next_with_id().await else {
                break;
            };
            let outcome = match joined {
                Ok((id, outcome)) => {
                    running.remove(&id);
                    outcome
                }
                Err(e) => {
                    let index = running.remove(&e.id());
                    let node = index.map_or_else(String::new, |i| plan.steps[i].node_id.clone());
                    let message = format!("Provider task for {node} failed: {e}");
                    error!("{message}");
                    if let Some(i) = index {
                        queued.remove(&i);
                    }
                    if matches!(halt, None | Some(Halt::Cancelled)) {
                        halt = Some(Halt::Failed {
                            node,
                            error: StackplanError::internal(message),
                        });
                    }
                    continue;
                }
            };
            let step = &plan.steps[outcome.step];

            let outputs = match outcome.result {
                Ok(outputs) => outputs,
                Err(e) => {
                    error!("{} failed: {e}", step.description());
                    snapshot.add_history(HistoryEntry::failed(
                        outcome.op.operation(),
                        &step.node_id,
                        &e.to_string(),
                    ));
                    queued.remove(&outcome.step);
                    if matches!(halt, None | Some(Halt::Cancelled)) {
                        halt = Some(Halt::Failed {
                            node: step.node_id.clone(),
                            error: e.into(),
                        });
                    }
                    continue;
                }
            };

            if matches!(halt, Some(Halt::Persist(_))) {
                warn!("Result of {} for {} was not recorded", outcome.op.operation(), step.node_id);
                continue;
            }

            Self::fold(snapshot, step, &outcome.op, outcome.resolved, outputs);
            snapshot.refresh_exports(exports);
            if let Err(e) = self.persist(snapshot).await {
                error!("Failed to record {}: {e}", step.node_id);
                halt = Some(Halt::Persist(e));
                continue;
            }

            let next = queued.get_mut(&outcome.step).and_then(VecDeque::pop_front);
            match next {
                Some(next) => {
                    match self.launch(&mut tasks, plan, outcome.step, next, snapshot, inputs) {
                        Ok(id) => {
                            running.insert(id, outcome.step);
                        }
                        Err(e) => {
                            error!("Cannot continue {}: {e}", step.node_id);
                            queued.remove(&outcome.step);
                            if matches!(halt, None | Some(Halt::Cancelled)) {
                                halt = Some(Halt::Failed {
                                    node: step.node_id.clone(),
                                    error: e,
                                });
                            }
                        }
                    }
                }
                None => {
                    queued.remove(&outcome.step);
                    completed.insert(outcome.step);
                    debug!("Step {} ({}) complete", outcome.step, step.node_id);
                    last_applied = Some(step.node_id.clone());
                    report.applied.push(AppliedStep {
                        node_id: step.node_id.clone(),
                        action: step.action,
                    });
                }
            }
        }

        report.version = snapshot.version;
        report.elapsed = started.elapsed();

        match halt {
            None => {
                info!(
                    "Applied {} steps to {} in {}ms",
                    report.applied.len(),
                    plan.unit,
                    report.elapsed.as_millis()
                );
                Ok(report)
            }
            Some(Halt::Persist(e)) => Err(e),
            Some(Halt::Cancelled) => {
                warn!("Apply of {} cancelled after {} steps", plan.unit, report.applied.len());
                Err(ApplyError::Cancelled { last_applied }.into())
            }
            Some(Halt::Failed { node, error }) => {
                if let Err(e) = self.persist(snapshot).await {
                    warn!("Failed to record failure history for {}: {e}", plan.unit);
                }
                Err(ApplyError::PartialApply {
                    last_applied,
                    failed: node,
                    source: Box::new(error),
                }
                .into())
            }
        }
    }

    /// Checks that neither the snapshot nor the store moved since planning.
    async fn preflight(&self, plan: &DeploymentPlan, snapshot: &StateSnapshot) -> Result<()> {
        if plan.base_version != snapshot.version {
            return Err(StateError::ConcurrentModification {
                unit: plan.unit.clone(),
                expected: plan.base_version,
                found: snapshot.version,
            }
            .into());
        }

        let stored = self.store.current_version(&plan.unit).await?;
        if stored != snapshot.version {
            warn!(
                "State of {} advanced to version {stored} since it was read at {}",
                plan.unit, snapshot.version
            );
            return Err(StateError::ConcurrentModification {
                unit: plan.unit.clone(),
                expected: snapshot.version,
                found: stored,
            }
            .into());
        }

        Ok(())
    }

    /// Expands a step into its ops.
    fn ops_for(&self, step: &PlannedStep, snapshot: &StateSnapshot) -> VecDeque<Op> {
        let recorded = snapshot.get(&step.node_id).or(step.prior.as_ref());
        let physical_id = recorded.and_then(|r| r.physical_id()).map(str::to_string);
        let retained = recorded.is_some_and(|r| r.removal_policy == RemovalPolicy::Retain);

        let remove = |keep_record: bool| {
            if retained {
                Op::Forget { keep_record }
            } else {
                Op::Delete {
                    physical_id: physical_id.clone(),
                    keep_record,
                }
            }
        };

        match (step.action, self.strategy) {
            (ActionType::Create, _) => VecDeque::from([Op::Create]),
            (ActionType::Update, _) => VecDeque::from([Op::Update]),
            (ActionType::Delete, _) => VecDeque::from([remove(false)]),
            (ActionType::Replace, ReplaceStrategy::DeleteBeforeCreate) => {
                VecDeque::from([remove(false), Op::Create])
            }
            (ActionType::Replace, ReplaceStrategy::CreateBeforeDelete) => {
                VecDeque::from([Op::Create, remove(true)])
            }
        }
    }

    /// Spawns the provider call for one op.
    fn launch(
        &self,
        tasks: &mut JoinSet<OpOutcome>,
        plan: &DeploymentPlan,
        index: usize,
        op: Op,
        snapshot: &StateSnapshot,
        inputs: &BTreeMap<String, Value>,
    ) -> Result<task::Id> {
        let step = &plan.steps[index];
        let kind = step
            .node
            .as_ref()
            .map(|n| n.kind.clone())
            .or_else(|| step.prior.as_ref().map(|p| p.kind.clone()))
            .ok_or_else(|| StackplanError::internal(format!("Step {} has no resource", step.node_id)))?;

        let (request, resolved) = match &op {
            Op::Create | Op::Update => {
                let node = step.node.as_ref().ok_or_else(|| {
                    StackplanError::internal(format!("Step {} has no desired node", step.node_id))
                })?;
                let resolved = resolve_attributes(&plan.unit, node, snapshot, inputs)?;
                let mut request =
                    ResourceRequest::new(&plan.unit, &step.node_id, kind, resolved.clone());
                if matches!(op, Op::Update) {
                    request.physical_id = snapshot
                        .get(&step.node_id)
                        .and_then(ResourceState::physical_id)
                        .map(str::to_string);
                }
                (request, resolved)
            }
            Op::Delete { physical_id, .. } => {
                let mut request =
                    ResourceRequest::new(&plan.unit, &step.node_id, kind, BTreeMap::new());
                request.physical_id.clone_from(physical_id);
                (request, BTreeMap::new())
            }
            Op::Forget { .. } => (
                ResourceRequest::new(&plan.unit, &step.node_id, kind, BTreeMap::new()),
                BTreeMap::new(),
            ),
        };

        let provider = Arc::clone(&self.provider);
        let retry = self.retry;

        let handle = tasks.spawn(async move {
            let node = request.node_id.clone();
            let result = match &op {
                Op::Create => retry
                    .run(&node, || provider.create(&request))
                    .await
                    .and_then(ensure_id)
                    .map(Some),
                Op::Update => retry
                    .run(&node, || provider.update(&request))
                    .await
                    .and_then(ensure_id)
                    .map(Some),
                Op::Delete { .. } => match retry.run(&node, || provider.delete(&request)).await {
                    Ok(()) => Ok(None),
                    Err(ProviderError::NotFound { kind, id }) => {
                        warn!("{kind} '{id}' for {node} was already gone");
                        Ok(None)
                    }
                    Err(e) => Err(e),
                },
                Op::Forget { .. } => Ok(None),
            };

            OpOutcome {
                step: index,
                op,
                resolved,
                result,
            }
        });

        Ok(handle.id())
    }

    /// Applies a confirmed op to the snapshot.
    fn fold(
        snapshot: &mut StateSnapshot,
        step: &PlannedStep,
        op: &Op,
        resolved: BTreeMap<String, Value>,
        outputs: Option<Outputs>,
    ) {
        match op {
            Op::Create | Op::Update => {
                if let (Some(node), Some(outputs)) = (&step.node, outputs) {
                    snapshot.record(
                        &step.node_id,
                        ResourceState {
                            kind: node.kind.clone(),
                            attributes: node.attributes.clone(),
                            resolved,
                            depends_on: node.depends_on.clone(),
                            outputs,
                            removal_policy: node.removal_policy,
                            attribute_hash: step.new_hash.clone().unwrap_or_default(),
                            applied_at: Utc::now(),
                        },
                    );
                }
            }
            Op::Delete { keep_record, .. } | Op::Forget { keep_record } => {
                if !keep_record {
                    snapshot.remove(&step.node_id);
                }
            }
        }

        snapshot.add_history(HistoryEntry::new(op.operation(), &step.node_id));
    }

    /// Writes the snapshot conditionally on its current version.
    async fn persist(&self, snapshot: &mut StateSnapshot) -> Result<()> {
        snapshot.writer = Some(writer_id());
        let version = self.store.save(snapshot, snapshot.version).await?;
        debug!("Saved state of {} at version {version}", snapshot.unit);
        snapshot.version = version;
        Ok(())
    }
}

/// Resolves every attribute of `node` against the live snapshot.
fn resolve_attributes(
    unit: &str,
    node: &ResourceNode,
    snapshot: &StateSnapshot,
    inputs: &BTreeMap<String, Value>,
) -> Result<BTreeMap<String, Value>> {
    let scope = snapshot.scope(inputs);
    node.attributes
        .iter()
        .map(|(name, value)| {
            value
                .resolve(&scope)
                .map(|v| (name.clone(), v))
                .map_err(|reference| {
                    GraphError::UnresolvedReference {
                        unit: unit.to_string(),
                        node: node.id.clone(),
                        reference,
                    }
                    .into()
                })
        })
        .collect()
}

impl Op {
    const fn operation(&self) -> Operation {
        match self {
            Self::Create => Operation::Create,
            Self::Update => Operation::Update,
            Self::Delete { .. } => Operation::Delete,
            Self::Forget { .. } => Operation::Forget,
        }
    }
}

impl ApplyReport {
    /// Number of completed steps with the given action.
    #[must_use]
    pub fn count(&self, action: ActionType) -> usize {
        self.applied.iter().filter(|s| s.action == action).count()
    }
}

impl fmt::Display for ReplaceStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DeleteBeforeCreate => write!(f, "delete_before_create"),
            Self::CreateBeforeDelete => write!(f, "create_before_delete"),
        }
    }
}
