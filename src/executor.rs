//! Executor - drives each step through its state machine
//!
//! The graph walker hands ready steps to a worker; the worker reconciles
//! the stack against the provider, emitting a StepEvent on every status
//! transition. A step that fails takes its descendants down as CANCELED;
//! independent subgraphs keep running.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tracing::{instrument, warn};

use crate::context::Context;
use crate::error::{Result, StratusError};
use crate::event::{EventBus, EventDetail, StepStatus};
use crate::graph::{self, StepOutcome};
use crate::lookup::{LookupRegistry, ResolveCtx, ResolveMode};
use crate::plan::{Action, Plan, Step};
use crate::provider::retry::RetryPolicy;
use crate::provider::{
    ChangeSetPlan, OperationKind, Provider, RemoteStatus, StackRequest, TemplateKind,
};
use crate::variables::{bind, bind_permissive, BoundVariables};

/// Outcome of a change-set review.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalDecision {
    Approve,
    Decline,
}

/// Decides whether a proposed change set may be applied.
#[async_trait]
pub trait ApprovalSource: Send + Sync {
    async fn review(&self, step_id: &str, plan: &ChangeSetPlan) -> Result<ApprovalDecision>;
}

/// Approves everything (the non-interactive default).
pub struct AutoApprove;

#[async_trait]
impl ApprovalSource for AutoApprove {
    async fn review(&self, _step_id: &str, _plan: &ChangeSetPlan) -> Result<ApprovalDecision> {
        Ok(ApprovalDecision::Approve)
    }
}

/// Declines everything (tests and --dry-run style flows).
pub struct DenyAll;

#[async_trait]
impl ApprovalSource for DenyAll {
    async fn review(&self, _step_id: &str, _plan: &ChangeSetPlan) -> Result<ApprovalDecision> {
        Ok(ApprovalDecision::Decline)
    }
}

/// Execution flags from the CLI.
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    /// 0 derives a bound from the machine
    pub concurrency: usize,
    pub interactive: bool,
    pub replacements_only: bool,
    pub recreate_failed: bool,
    /// Stacks to build even when locked
    pub force: Vec<String>,
    pub tail: bool,
    /// Target directory for the dump action
    pub dump_dir: Option<PathBuf>,
}

/// Final statuses after a run.
pub struct RunSummary {
    pub statuses: BTreeMap<String, (StepStatus, Option<String>)>,
}

impl RunSummary {
    pub fn status(&self, step_id: &str) -> Option<StepStatus> {
        self.statuses.get(step_id).map(|(s, _)| *s)
    }

    pub fn reason(&self, step_id: &str) -> Option<&str> {
        self.statuses.get(step_id).and_then(|(_, r)| r.as_deref())
    }

    pub fn failed(&self) -> Vec<&str> {
        self.statuses
            .iter()
            .filter(|(_, (s, _))| *s == StepStatus::Failed)
            .map(|(id, _)| id.as_str())
            .collect()
    }

    /// 0 when no step failed and none were canceled.
    pub fn exit_code(&self) -> i32 {
        let dirty = self.statuses.values().any(|(s, _)| {
            matches!(s, StepStatus::Failed | StepStatus::Canceled)
        });
        if dirty {
            1
        } else {
            0
        }
    }
}

#[derive(Clone)]
pub struct Executor {
    provider: Arc<dyn Provider>,
    lookups: Arc<LookupRegistry>,
    context: Arc<Context>,
    events: EventBus,
    approvals: Arc<dyn ApprovalSource>,
    retry: RetryPolicy,
    options: Arc<ExecOptions>,
}

/// Per-step bookkeeping shared with the event stream.
struct StepState {
    step: Arc<Step>,
    executor: Executor,
    statuses: Arc<DashMap<Arc<str>, (StepStatus, Option<String>)>>,
    current: StepStatus,
}

impl StepState {
    fn transition(&mut self, to: StepStatus, reason: Option<String>, detail: Option<EventDetail>) {
        self.statuses
            .insert(Arc::clone(&self.step.id), (to, reason.clone()));
        self.executor.events.transition(
            Arc::clone(&self.step.id),
            self.current,
            to,
            reason,
            detail,
        );
        self.current = to;
    }

    fn outcome(&self) -> StepOutcome {
        if self.current.satisfies_dependents() {
            StepOutcome::Ok
        } else {
            StepOutcome::Failed
        }
    }
}

impl Executor {
    pub fn new(
        provider: Arc<dyn Provider>,
        lookups: Arc<LookupRegistry>,
        context: Arc<Context>,
        events: EventBus,
        approvals: Arc<dyn ApprovalSource>,
        options: ExecOptions,
    ) -> Self {
        Self {
            provider,
            lookups,
            context,
            events,
            approvals,
            retry: RetryPolicy::default(),
            options: Arc::new(options),
        }
    }

    /// Swap the throttle-retry policy (tests use millisecond delays).
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Walk the plan. Always drains every step to a terminal status; the
    /// summary carries them all.
    #[instrument(skip_all, fields(steps = plan.len(), action = %plan.action))]
    pub async fn run(&self, plan: Plan) -> Result<RunSummary> {
        let concurrency = match self.options.concurrency {
            0 => default_concurrency(plan.len()),
            n => n,
        };

        let steps: Arc<FxHashMap<Arc<str>, Arc<Step>>> = Arc::new(
            plan.steps
                .into_iter()
                .map(|(id, step)| (id, Arc::new(step)))
                .collect(),
        );
        let statuses: Arc<DashMap<Arc<str>, (StepStatus, Option<String>)>> =
            Arc::new(DashMap::new());

        let worker_steps = Arc::clone(&steps);
        let worker_statuses = Arc::clone(&statuses);
        let executor = self.clone();

        let cancel_statuses = Arc::clone(&statuses);
        let cancel_events = self.events.clone();

        graph::walk(
            &plan.graph,
            concurrency,
            &self.context.cancel,
            move |id| {
                let step = Arc::clone(worker_steps.get(&id).expect("step for every vertex"));
                let mut state = StepState {
                    step,
                    executor: executor.clone(),
                    statuses: Arc::clone(&worker_statuses),
                    current: StepStatus::Pending,
                };
                async move {
                    let executor = state.executor.clone();
                    executor.run_step(&mut state).await;
                    state.outcome()
                }
            },
            move |id, reason| {
                cancel_statuses.insert(
                    Arc::clone(id),
                    (StepStatus::Canceled, Some(reason.to_string())),
                );
                cancel_events.transition(
                    Arc::clone(id),
                    StepStatus::Pending,
                    StepStatus::Canceled,
                    Some(reason.to_string()),
                    None,
                );
            },
        )
        .await;

        let summary = RunSummary {
            statuses: statuses
                .iter()
                .map(|e| (e.key().to_string(), e.value().clone()))
                .collect(),
        };

        if let Some(handle) = plan.persist {
            // Keep failed destroy targets in the stored graph so the next
            // run prunes them again.
            let mut snapshot = handle.snapshot.clone();
            for (id, (status, _)) in &summary.statuses {
                let destroyed = steps
                    .get(id.as_str())
                    .map(|s| s.action == Action::Destroy)
                    .unwrap_or(false);
                if destroyed && !matches!(status, StepStatus::Complete | StepStatus::Skipped) {
                    snapshot.nodes.entry(id.clone()).or_default();
                }
            }
            let save_result = handle.store.save(&snapshot, &handle.token).await;
            let release_result = handle.store.release(&handle.token).await;
            save_result?;
            release_result?;
        }

        Ok(summary)
    }

    async fn run_step(&self, state: &mut StepState) {
        let step = Arc::clone(&state.step);

        if let Some(reason) = &step.pre_failure {
            state.transition(StepStatus::Failed, Some(reason.clone()), None);
            return;
        }
        if self.context.cancel.is_cancelled() {
            state.transition(StepStatus::Canceled, Some("canceled".into()), None);
            return;
        }

        let result = match step.action {
            Action::CreateOrUpdate => self.reconcile(state).await,
            Action::Destroy => self.destroy(state).await,
            Action::Diff => self.diff(state).await,
            Action::Dump => self.dump(state).await,
        };

        if let Err(e) = result {
            match e {
                StratusError::Canceled => {
                    state.transition(StepStatus::Canceled, Some("canceled".into()), None)
                }
                other => state.transition(StepStatus::Failed, Some(other.to_string()), None),
            }
        }
    }

    // ── create_or_update ───────────────────────────────────────────

    async fn reconcile(&self, state: &mut StepState) -> Result<()> {
        let step = Arc::clone(&state.step);
        let stack = &step.stack;
        let forced = self
            .options
            .force
            .iter()
            .any(|f| f.as_str() == &*stack.logical_name);

        if stack.locked && !forced {
            // A locked stack still feeds its consumers
            self.adopt_outputs(&stack.fqn, &stack.logical_name).await;
            state.transition(StepStatus::Skipped, Some("locked".into()), None);
            return Ok(());
        }
        if stack.external {
            self.adopt_outputs(&stack.fqn, &stack.logical_name).await;
            state.transition(StepStatus::Skipped, Some("external".into()), None);
            return Ok(());
        }

        let request = self.build_request(&step).await?;
        let mut description = self.describe(&stack.fqn, stack.region.as_deref()).await?;

        // An operation already in flight either blocks us or fails us
        if !description.status.is_settled() {
            match stack.in_progress_behavior {
                crate::config::InProgressBehavior::Wait => {
                    state.transition(
                        StepStatus::Pending,
                        Some("waiting on in-progress stack".into()),
                        None,
                    );
                    description = self.poll_until_settled(&stack.fqn, stack.region.as_deref()).await?;
                }
                crate::config::InProgressBehavior::Error => {
                    return Err(StratusError::StackInProgress {
                        fqn: stack.fqn.clone(),
                    });
                }
            }
        }

        if !description.exists() {
            state.transition(StepStatus::Submitted, Some("creating new stack".into()), None);
            let handle = self
                .retry
                .execute(|| self.provider.create(&request))
                .await?;
            state.transition(StepStatus::InProgress, None, None);
            return self.finish_deploy(state, handle, OperationKind::Create, &request).await;
        }

        if description.status == RemoteStatus::RolledBack
            || description.status == RemoteStatus::Failed
        {
            if !self.options.recreate_failed {
                return Err(StratusError::StackRolledBack {
                    fqn: stack.fqn.clone(),
                    reason: description
                        .last_reason
                        .unwrap_or_else(|| "stack previously rolled back".into()),
                });
            }
            state.transition(
                StepStatus::Submitted,
                Some("destroying stack for re-creation".into()),
                None,
            );
            let destroy = self
                .retry
                .execute(|| self.provider.destroy(&stack.fqn, stack.region.as_deref()))
                .await?;
            self.wait(&destroy).await?;
            state.transition(StepStatus::Submitted, Some("creating new stack".into()), None);
            let handle = self
                .retry
                .execute(|| self.provider.create(&request))
                .await?;
            state.transition(StepStatus::InProgress, None, None);
            return self.finish_deploy(state, handle, OperationKind::Create, &request).await;
        }

        // Existing settled stack: no-change check, then update
        let unchanged = description.template_digest == Some(request.template_digest())
            && description.parameters == request.parameter_strings();
        if unchanged {
            self.publish(&stack.logical_name, description.outputs.clone());
            state.transition(StepStatus::Skipped, Some("nochange".into()), None);
            return Ok(());
        }

        if self.options.interactive || step.stack.protected {
            return self.update_via_change_set(state, &request).await;
        }

        match self.retry.execute(|| self.provider.update(&request)).await {
            Ok(handle) => {
                state.transition(
                    StepStatus::Submitted,
                    Some("updating existing stack".into()),
                    None,
                );
                state.transition(StepStatus::InProgress, None, None);
                self.finish_deploy(state, handle, OperationKind::Update, &request).await
            }
            Err(StratusError::NoUpdates { .. }) => {
                self.publish(&stack.logical_name, description.outputs);
                state.transition(StepStatus::Skipped, Some("nochange".into()), None);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Change-set flow: compute, review, apply or discard.
    async fn update_via_change_set(
        &self,
        state: &mut StepState,
        request: &StackRequest,
    ) -> Result<()> {
        let step = Arc::clone(&state.step);
        let change_set = self
            .retry
            .execute(|| self.provider.plan_change_set(request))
            .await?;

        if change_set.is_empty() {
            self.provider.delete_change_set(&change_set).await?;
            let description = self.describe(&request.fqn, request.region.as_deref()).await?;
            self.publish(&step.stack.logical_name, description.outputs);
            state.transition(StepStatus::Skipped, Some("nochange".into()), None);
            return Ok(());
        }

        let auto_approved =
            self.options.replacements_only && !change_set.has_replacements();

        if !auto_approved {
            let summary = format!(
                "{} additions, {} modifications, {} replacements",
                change_set.additions(),
                change_set.modifications(),
                change_set.replacements()
            );
            state.transition(
                StepStatus::AwaitingApproval,
                Some(summary),
                Some(EventDetail::ChangeSet(change_set.clone())),
            );

            let decision = tokio::select! {
                decision = self.approvals.review(&step.id, &change_set) => decision?,
                _ = self.context.cancel.cancelled() => {
                    let _ = self.provider.delete_change_set(&change_set).await;
                    return Err(StratusError::Canceled);
                }
            };
            if decision == ApprovalDecision::Decline {
                self.provider.delete_change_set(&change_set).await?;
                state.transition(StepStatus::Skipped, Some("canceled execution".into()), None);
                return Ok(());
            }
        }

        let handle = self
            .retry
            .execute(|| self.provider.apply_change_set(&change_set))
            .await?;
        state.transition(
            StepStatus::Submitted,
            Some("updating existing stack".into()),
            None,
        );
        state.transition(StepStatus::InProgress, None, None);
        self.finish_deploy(state, handle, OperationKind::Update, request).await
    }

    /// Wait out a deploy operation and settle the step. A wait that times
    /// out under --recreate-failed gets one destroy-then-create retry, the
    /// same remedy as a stack found already rolled back.
    async fn finish_deploy(
        &self,
        state: &mut StepState,
        handle: crate::provider::OperationHandle,
        kind: OperationKind,
        request: &StackRequest,
    ) -> Result<()> {
        match self.await_deploy(state, handle, kind).await {
            Err(StratusError::OperationTimedOut { .. }) if self.options.recreate_failed => {
                let step = Arc::clone(&state.step);
                let stack = &step.stack;
                state.transition(
                    StepStatus::Submitted,
                    Some("destroying stack for re-creation".into()),
                    None,
                );
                let destroy = self
                    .retry
                    .execute(|| self.provider.destroy(&stack.fqn, stack.region.as_deref()))
                    .await?;
                self.wait(&destroy).await?;
                state.transition(StepStatus::Submitted, Some("creating new stack".into()), None);
                let handle = self
                    .retry
                    .execute(|| self.provider.create(request))
                    .await?;
                state.transition(StepStatus::InProgress, None, None);
                // second timeout is final
                self.await_deploy(state, handle, OperationKind::Create).await
            }
            other => other,
        }
    }

    async fn await_deploy(
        &self,
        state: &mut StepState,
        handle: crate::provider::OperationHandle,
        kind: OperationKind,
    ) -> Result<()> {
        let step = Arc::clone(&state.step);
        let stack = &step.stack;

        let tail = self.spawn_tail(&stack.fqn, &step.id);
        let waited = self.wait(&handle).await;
        if let Some(tail) = tail {
            tail.cancel();
        }

        match waited? {
            RemoteStatus::Complete => {
                let description = self.describe(&stack.fqn, stack.region.as_deref()).await?;
                self.publish(&stack.logical_name, description.outputs.clone());
                state.transition(
                    StepStatus::Complete,
                    None,
                    Some(EventDetail::Outputs(
                        serde_json::to_value(&description.outputs).unwrap_or(Value::Null),
                    )),
                );
                Ok(())
            }
            RemoteStatus::RolledBack | RemoteStatus::Failed => {
                let reason = match kind {
                    OperationKind::Create => "rolled back new stack",
                    _ => "rolled back update",
                };
                state.transition(StepStatus::Failed, Some(reason.into()), None);
                Ok(())
            }
            other => {
                state.transition(
                    StepStatus::Failed,
                    Some(format!("unexpected terminal status {}", other)),
                    None,
                );
                Ok(())
            }
        }
    }

    // ── destroy ────────────────────────────────────────────────────

    async fn destroy(&self, state: &mut StepState) -> Result<()> {
        let step = Arc::clone(&state.step);
        let stack = &step.stack;

        let description = self.describe(&stack.fqn, stack.region.as_deref()).await?;
        if !description.exists() {
            state.transition(StepStatus::Skipped, Some("already destroyed".into()), None);
            return Ok(());
        }

        state.transition(
            StepStatus::Submitted,
            Some("submitted for destruction".into()),
            None,
        );
        let handle = match self
            .retry
            .execute(|| self.provider.destroy(&stack.fqn, stack.region.as_deref()))
            .await
        {
            Ok(handle) => handle,
            Err(StratusError::StackDeleted { .. }) => {
                state.transition(StepStatus::Skipped, Some("already destroyed".into()), None);
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        state.transition(StepStatus::InProgress, None, None);

        let tail = self.spawn_tail(&stack.fqn, &step.id);
        let waited = self.wait(&handle).await;
        if let Some(tail) = tail {
            tail.cancel();
        }

        match waited? {
            RemoteStatus::DeleteComplete | RemoteStatus::Complete => {
                state.transition(StepStatus::Complete, Some("stack destroyed".into()), None);
                Ok(())
            }
            other => {
                state.transition(
                    StepStatus::Failed,
                    Some(format!("destroy ended in {}", other)),
                    None,
                );
                Ok(())
            }
        }
    }

    // ── diff / dump ────────────────────────────────────────────────

    async fn diff(&self, state: &mut StepState) -> Result<()> {
        let step = Arc::clone(&state.step);
        let stack = &step.stack;

        if stack.blueprint.is_none() {
            let reason = if stack.locked { "locked" } else { "external" };
            self.adopt_outputs(&stack.fqn, &stack.logical_name).await;
            state.transition(StepStatus::Skipped, Some(reason.into()), None);
            return Ok(());
        }

        let request = self.build_request(&step).await?;
        let description = self.describe(&stack.fqn, stack.region.as_deref()).await?;

        if !description.exists() {
            let added: BTreeMap<&String, &String> = request
                .parameters
                .iter()
                .map(|(k, p)| (k, &p.value))
                .collect();
            state.transition(
                StepStatus::Complete,
                Some("new stack".into()),
                Some(EventDetail::ParameterDiff {
                    added: serde_json::to_value(&added)?,
                    changed: Value::Object(Default::default()),
                    removed: Value::Object(Default::default()),
                }),
            );
            return Ok(());
        }

        // Diff steps still feed their consumers' lookups
        self.publish(&stack.logical_name, description.outputs.clone());

        let new_params = request.parameter_strings();
        let mut added = serde_json::Map::new();
        let mut changed = serde_json::Map::new();
        let mut removed = serde_json::Map::new();
        for (key, value) in &new_params {
            match description.parameters.get(key) {
                None => {
                    added.insert(key.clone(), Value::String(value.clone()));
                }
                Some(old) if old != value => {
                    changed.insert(
                        key.clone(),
                        serde_json::json!({ "old": old, "new": value }),
                    );
                }
                Some(_) => {}
            }
        }
        for key in description.parameters.keys() {
            if !new_params.contains_key(key) {
                removed.insert(key.clone(), Value::Null);
            }
        }

        let template_changed =
            description.template_digest != Some(request.template_digest());
        let reason = if added.is_empty() && changed.is_empty() && removed.is_empty() && !template_changed
        {
            "nochange"
        } else if template_changed {
            "template and parameters differ"
        } else {
            "parameters differ"
        };

        state.transition(
            StepStatus::Complete,
            Some(reason.into()),
            Some(EventDetail::ParameterDiff {
                added: Value::Object(added),
                changed: Value::Object(changed),
                removed: Value::Object(removed),
            }),
        );
        Ok(())
    }

    async fn dump(&self, state: &mut StepState) -> Result<()> {
        let step = Arc::clone(&state.step);

        if step.stack.blueprint.is_none() {
            let reason = if step.stack.locked { "locked" } else { "external" };
            state.transition(StepStatus::Skipped, Some(reason.into()), None);
            return Ok(());
        }

        let request = self.build_request(&step).await?;

        let dir = self
            .options
            .dump_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("."));
        std::fs::create_dir_all(&dir)?;
        let extension = match request.template_kind {
            TemplateKind::Json => "json",
            TemplateKind::Yaml => "yaml",
        };
        let path = dir.join(format!("{}.{}", step.stack.logical_name, extension));
        std::fs::write(&path, &request.template_body)?;

        state.transition(
            StepStatus::Complete,
            Some(format!("wrote {}", path.display())),
            None,
        );
        Ok(())
    }

    // ── shared helpers ─────────────────────────────────────────────

    /// Resolve variables (execute mode), bind against the blueprint
    /// schema, and render the template into a provider request.
    async fn build_request(&self, step: &Step) -> Result<StackRequest> {
        let stack = &step.stack;
        let blueprint = stack
            .blueprint
            .as_ref()
            .ok_or_else(|| StratusError::BlueprintRender {
                name: stack.logical_name.to_string(),
                reason: "stack has no template source".into(),
            })?;

        let ctx = ResolveCtx::new(&self.context, Some(&self.provider), ResolveMode::Execute);
        let raw = Value::Object(
            stack
                .raw_variables
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        );
        let resolved = self.lookups.resolve_value(&raw, &ctx).await?;
        let resolved: BTreeMap<String, Value> = match resolved {
            Value::Object(map) => map.into_iter().collect(),
            _ => BTreeMap::new(),
        };

        let schema = blueprint.variable_schema();
        let bound: BoundVariables = if schema.is_empty() {
            bind_permissive(&resolved)
        } else {
            bind(&schema, &resolved, &stack.logical_name)?
        };

        let (body, kind) = blueprint.render(&self.context, &bound)?;

        Ok(StackRequest {
            fqn: stack.fqn.clone(),
            region: stack.region.clone(),
            profile: stack.profile.clone(),
            template_body: Arc::from(body.into_boxed_slice()),
            template_kind: kind,
            parameters: bound.parameters,
            tags: stack.tags.clone(),
            stack_policy: stack.stack_policy.clone(),
            service_role: stack.service_role.clone(),
            notification_arns: Vec::new(),
        })
    }

    async fn describe(
        &self,
        fqn: &str,
        region: Option<&str>,
    ) -> Result<crate::provider::StackDescription> {
        self.retry
            .execute(|| self.provider.describe(fqn, region))
            .await
    }

    async fn wait(&self, handle: &crate::provider::OperationHandle) -> Result<RemoteStatus> {
        self.retry
            .execute(|| {
                self.provider.wait(
                    handle,
                    self.context.poll_interval,
                    self.context.operation_timeout,
                    &self.context.cancel,
                )
            })
            .await
    }

    /// Poll a stack until its status settles (in_progress_behavior: wait).
    async fn poll_until_settled(
        &self,
        fqn: &str,
        region: Option<&str>,
    ) -> Result<crate::provider::StackDescription> {
        loop {
            if self.context.cancel.is_cancelled() {
                return Err(StratusError::Canceled);
            }
            let description = self.describe(fqn, region).await?;
            if description.status.is_settled() {
                return Ok(description);
            }
            tokio::time::sleep(self.context.poll_interval).await;
        }
    }

    /// Describe an unmanaged (locked/external) stack and publish whatever
    /// outputs it has; consumers read them like any other.
    async fn adopt_outputs(&self, fqn: &str, logical_name: &str) {
        match self.describe(fqn, None).await {
            Ok(description) if description.exists() => {
                self.publish(logical_name, description.outputs);
            }
            Ok(_) => {}
            Err(e) => warn!(%fqn, error = %e, "describe of unmanaged stack failed"),
        }
    }

    fn publish(&self, logical_name: &str, outputs: BTreeMap<String, String>) {
        self.context.publish_outputs(logical_name, outputs);
    }

    /// Forward provider event-log records while an operation runs.
    fn spawn_tail(&self, fqn: &str, step_id: &Arc<str>) -> Option<tokio_util::sync::CancellationToken> {
        if !self.options.tail {
            return None;
        }
        let token = tokio_util::sync::CancellationToken::new();
        let child = token.clone();
        let provider = Arc::clone(&self.provider);
        let events = self.events.clone();
        let fqn = fqn.to_string();
        let step_id = Arc::clone(step_id);
        let poll = self.context.poll_interval.max(Duration::from_millis(100));

        tokio::spawn(async move {
            let mut since = chrono::DateTime::<chrono::Utc>::MIN_UTC;
            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = tokio::time::sleep(poll) => {
                        let Ok(records) = provider.events_since(&fqn, since).await else {
                            continue;
                        };
                        for record in records {
                            since = since.max(record.timestamp);
                            events.transition(
                                Arc::clone(&step_id),
                                StepStatus::InProgress,
                                StepStatus::InProgress,
                                None,
                                Some(EventDetail::StackEvent(record)),
                            );
                        }
                    }
                }
            }
        });
        Some(token)
    }
}

fn default_concurrency(steps: usize) -> usize {
    let machine = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);
    steps.clamp(1, machine)
}
