//! In-memory provider adapter
//!
//! Backs the `memory` CLI provider and the test suite. Stacks live in a
//! DashMap; failure scripts, seeded lookup tables, and a recorded call log
//! let tests drive every branch of the executor state machine without a
//! control plane.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, StratusError};

use super::{
    AmiFilters, ChangeAction, ChangeSetPlan, OperationHandle, OperationKind, Provider,
    RemoteStatus, ResourceChange, StackDescription, StackEventRecord, StackRequest,
};

/// Scripted failure for one stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureScript {
    /// Create submits, then wait reports ROLLED_BACK
    RollbackOnCreate,
    /// Update submits, then wait reports ROLLED_BACK
    RollbackOnUpdate,
    /// wait never settles within its deadline
    TimeoutOnWait,
    /// only the first wait times out; later operations settle normally
    TimeoutOnce,
    /// Mutations are rejected outright
    DenyPermission,
    /// Template validation rejects the request
    FailValidation(String),
}

/// State of one simulated stack.
#[derive(Debug, Clone)]
pub struct MockStack {
    pub status: RemoteStatus,
    pub outputs: BTreeMap<String, String>,
    pub parameters: BTreeMap<String, String>,
    pub template_digest: Option<u64>,
    pub last_reason: Option<String>,
}

impl MockStack {
    pub fn complete(outputs: BTreeMap<String, String>) -> Self {
        Self {
            status: RemoteStatus::Complete,
            outputs,
            parameters: BTreeMap::new(),
            template_digest: None,
            last_reason: None,
        }
    }
}

#[derive(Debug, Clone)]
struct PendingOp {
    fqn: String,
    kind: OperationKind,
    /// Stack state to apply when the operation completes
    digest: Option<u64>,
    parameters: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
struct MockImage {
    id: String,
    name: String,
    owner: String,
    created: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    stacks: DashMap<String, MockStack>,
    scripts: DashMap<String, FailureScript>,
    /// Outputs published when a deploy of this fqn completes
    deploy_outputs: DashMap<String, BTreeMap<String, String>>,
    /// Remaining throttle responses per fqn
    throttles: DashMap<String, u32>,
    /// Scripted change-set contents per fqn
    change_sets: DashMap<String, Vec<ResourceChange>>,
    pending: DashMap<String, PendingOp>,
    parameters: DashMap<String, String>,
    secrets: DashMap<String, String>,
    items: DashMap<String, Value>,
    images: RwLock<Vec<MockImage>>,
    events: RwLock<Vec<StackEventRecord>>,
    calls: Mutex<Vec<String>>,
    latency: RwLock<Duration>,
}

/// Scriptable in-memory [`Provider`].
#[derive(Clone, Default)]
pub struct MockProvider {
    inner: Arc<Inner>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Seeding ────────────────────────────────────────────────────

    /// Seed a pre-existing COMPLETE stack with outputs.
    pub fn with_existing_stack(
        self,
        fqn: impl Into<String>,
        outputs: &[(&str, &str)],
    ) -> Self {
        let outputs = outputs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self.inner
            .stacks
            .insert(fqn.into(), MockStack::complete(outputs));
        self
    }

    pub fn seed_stack(&self, fqn: impl Into<String>, stack: MockStack) {
        self.inner.stacks.insert(fqn.into(), stack);
    }

    /// Outputs a deploy of `fqn` publishes on completion.
    pub fn publish_on_deploy(self, fqn: impl Into<String>, outputs: &[(&str, &str)]) -> Self {
        let outputs = outputs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self.inner.deploy_outputs.insert(fqn.into(), outputs);
        self
    }

    pub fn script(self, fqn: impl Into<String>, script: FailureScript) -> Self {
        self.inner.scripts.insert(fqn.into(), script);
        self
    }

    /// The next `times` mutating calls for `fqn` return Throttled.
    pub fn throttle(self, fqn: impl Into<String>, times: u32) -> Self {
        self.inner.throttles.insert(fqn.into(), times);
        self
    }

    /// Script the contents of the next change set for `fqn`.
    pub fn with_change_set(self, fqn: impl Into<String>, changes: Vec<ResourceChange>) -> Self {
        self.inner.change_sets.insert(fqn.into(), changes);
        self
    }

    pub fn seed_parameter(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.inner.parameters.insert(name.into(), value.into());
        self
    }

    pub fn seed_secret(self, ciphertext: impl Into<String>, plaintext: impl Into<String>) -> Self {
        self.inner.secrets.insert(ciphertext.into(), plaintext.into());
        self
    }

    /// Seed an item for `get_item`, addressed as table/key/value.
    pub fn seed_item(
        self,
        table: &str,
        key: &str,
        value: &str,
        item: Value,
    ) -> Self {
        self.inner
            .items
            .insert(format!("{}:{}={}", table, key, value), item);
        self
    }

    pub fn seed_image(
        self,
        id: &str,
        name: &str,
        owner: &str,
        created: DateTime<Utc>,
    ) -> Self {
        self.inner.images.write().push(MockImage {
            id: id.into(),
            name: name.into(),
            owner: owner.into(),
            created,
        });
        self
    }

    pub fn with_latency(self, latency: Duration) -> Self {
        *self.inner.latency.write() = latency;
        self
    }

    pub fn append_event(&self, record: StackEventRecord) {
        self.inner.events.write().push(record);
    }

    // ── Introspection ──────────────────────────────────────────────

    /// Operations invoked so far, e.g. `["describe ns-vpc", "create ns-vpc"]`.
    pub fn calls(&self) -> Vec<String> {
        self.inner.calls.lock().clone()
    }

    pub fn stack(&self, fqn: &str) -> Option<MockStack> {
        self.inner.stacks.get(fqn).map(|s| s.clone())
    }

    // ── Internals ──────────────────────────────────────────────────

    fn record(&self, call: impl Into<String>) {
        self.inner.calls.lock().push(call.into());
    }

    async fn simulate_latency(&self) {
        let latency = *self.inner.latency.read();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    /// Consume one throttle token for the fqn, if any remain.
    fn gate(&self, fqn: &str) -> Result<()> {
        if let Some(mut remaining) = self.inner.throttles.get_mut(fqn) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(StratusError::Throttled {
                    reason: format!("rate exceeded for {}", fqn),
                });
            }
        }
        Ok(())
    }

    fn check_script(&self, fqn: &str, kind: OperationKind) -> Result<()> {
        match self.inner.scripts.get(fqn).map(|s| s.clone()) {
            Some(FailureScript::DenyPermission) => Err(StratusError::PermissionDenied {
                reason: format!("not authorized to modify {}", fqn),
            }),
            Some(FailureScript::FailValidation(reason))
                if matches!(kind, OperationKind::Create | OperationKind::Update) =>
            {
                Err(StratusError::ProviderValidation {
                    fqn: fqn.into(),
                    reason,
                })
            }
            _ => Ok(()),
        }
    }

    fn submit(&self, request: &StackRequest, kind: OperationKind) -> OperationHandle {
        let handle = OperationHandle::new(&request.fqn, kind);
        self.inner
            .stacks
            .entry(request.fqn.clone())
            .and_modify(|s| s.status = RemoteStatus::InProgress)
            .or_insert_with(|| MockStack {
                status: RemoteStatus::InProgress,
                outputs: BTreeMap::new(),
                parameters: BTreeMap::new(),
                template_digest: None,
                last_reason: None,
            });
        self.inner.pending.insert(
            handle.token.clone(),
            PendingOp {
                fqn: request.fqn.clone(),
                kind,
                digest: Some(request.template_digest()),
                parameters: request.parameter_strings(),
            },
        );
        handle
    }
}

#[async_trait]
impl Provider for MockProvider {
    async fn describe(&self, fqn: &str, _region: Option<&str>) -> Result<StackDescription> {
        self.record(format!("describe {}", fqn));
        self.simulate_latency().await;
        self.gate(fqn)?;

        match self.inner.stacks.get(fqn) {
            Some(stack) => Ok(StackDescription {
                fqn: fqn.into(),
                status: stack.status,
                outputs: stack.outputs.clone(),
                parameters: stack.parameters.clone(),
                template_digest: stack.template_digest,
                last_reason: stack.last_reason.clone(),
            }),
            None => Ok(StackDescription::absent(fqn)),
        }
    }

    async fn create(&self, request: &StackRequest) -> Result<OperationHandle> {
        self.record(format!("create {}", request.fqn));
        self.simulate_latency().await;
        self.gate(&request.fqn)?;
        self.check_script(&request.fqn, OperationKind::Create)?;
        Ok(self.submit(request, OperationKind::Create))
    }

    async fn update(&self, request: &StackRequest) -> Result<OperationHandle> {
        self.record(format!("update {}", request.fqn));
        self.simulate_latency().await;
        self.gate(&request.fqn)?;
        self.check_script(&request.fqn, OperationKind::Update)?;

        if let Some(stack) = self.inner.stacks.get(&request.fqn) {
            let same_template = stack.template_digest == Some(request.template_digest());
            let same_params = stack.parameters == request.parameter_strings();
            if same_template && same_params {
                return Err(StratusError::NoUpdates {
                    fqn: request.fqn.clone(),
                });
            }
        }
        Ok(self.submit(request, OperationKind::Update))
    }

    async fn plan_change_set(&self, request: &StackRequest) -> Result<ChangeSetPlan> {
        self.record(format!("plan_change_set {}", request.fqn));
        self.simulate_latency().await;
        self.gate(&request.fqn)?;

        let changes = match self.inner.change_sets.get(&request.fqn) {
            Some(scripted) => scripted.clone(),
            None => vec![ResourceChange {
                action: if self.inner.stacks.contains_key(&request.fqn) {
                    ChangeAction::Modify
                } else {
                    ChangeAction::Add
                },
                logical_id: "Stack".into(),
                resource_type: "Mock::Stack".into(),
                replacement: false,
            }],
        };
        Ok(ChangeSetPlan {
            id: uuid::Uuid::new_v4().to_string(),
            fqn: request.fqn.clone(),
            changes,
        })
    }

    async fn apply_change_set(&self, plan: &ChangeSetPlan) -> Result<OperationHandle> {
        self.record(format!("apply_change_set {}", plan.fqn));
        self.simulate_latency().await;
        self.gate(&plan.fqn)?;

        let handle = OperationHandle::new(&plan.fqn, OperationKind::ApplyChangeSet);
        let existing = self.inner.stacks.get(&plan.fqn).map(|s| s.parameters.clone());
        self.inner
            .stacks
            .entry(plan.fqn.clone())
            .and_modify(|s| s.status = RemoteStatus::InProgress);
        self.inner.pending.insert(
            handle.token.clone(),
            PendingOp {
                fqn: plan.fqn.clone(),
                kind: OperationKind::ApplyChangeSet,
                digest: None,
                parameters: existing.unwrap_or_default(),
            },
        );
        Ok(handle)
    }

    async fn delete_change_set(&self, plan: &ChangeSetPlan) -> Result<()> {
        self.record(format!("delete_change_set {}", plan.fqn));
        Ok(())
    }

    async fn destroy(&self, fqn: &str, _region: Option<&str>) -> Result<OperationHandle> {
        self.record(format!("destroy {}", fqn));
        self.simulate_latency().await;
        self.gate(fqn)?;
        self.check_script(fqn, OperationKind::Destroy)?;

        if !self.inner.stacks.contains_key(fqn) {
            return Err(StratusError::StackDeleted { fqn: fqn.into() });
        }
        let handle = OperationHandle::new(fqn, OperationKind::Destroy);
        self.inner
            .stacks
            .entry(fqn.to_string())
            .and_modify(|s| s.status = RemoteStatus::DeleteInProgress);
        self.inner.pending.insert(
            handle.token.clone(),
            PendingOp {
                fqn: fqn.into(),
                kind: OperationKind::Destroy,
                digest: None,
                parameters: BTreeMap::new(),
            },
        );
        Ok(handle)
    }

    async fn wait(
        &self,
        handle: &OperationHandle,
        _poll_interval: Duration,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<RemoteStatus> {
        self.record(format!("wait {}", handle.fqn));
        self.simulate_latency().await;

        if cancel.is_cancelled() {
            return Err(StratusError::Canceled);
        }

        let pending = self
            .inner
            .pending
            .remove(&handle.token)
            .map(|(_, op)| op)
            .ok_or_else(|| StratusError::StoreFailed {
                reason: format!("unknown operation token for {}", handle.fqn),
            })?;

        let script = self.inner.scripts.get(&pending.fqn).map(|s| s.clone());
        if script == Some(FailureScript::TimeoutOnWait) {
            return Err(StratusError::OperationTimedOut {
                fqn: pending.fqn.clone(),
                seconds: deadline.as_secs(),
            });
        }
        if script == Some(FailureScript::TimeoutOnce) {
            self.inner.scripts.remove(&pending.fqn);
            return Err(StratusError::OperationTimedOut {
                fqn: pending.fqn.clone(),
                seconds: deadline.as_secs(),
            });
        }

        let rolled_back = matches!(
            (&script, pending.kind),
            (Some(FailureScript::RollbackOnCreate), OperationKind::Create)
                | (Some(FailureScript::RollbackOnUpdate), OperationKind::Update)
        );

        let status = match pending.kind {
            OperationKind::Destroy => {
                self.inner.stacks.entry(pending.fqn.clone()).and_modify(|s| {
                    s.status = RemoteStatus::DeleteComplete;
                    s.outputs.clear();
                });
                RemoteStatus::DeleteComplete
            }
            _ if rolled_back => {
                self.inner.stacks.entry(pending.fqn.clone()).and_modify(|s| {
                    s.status = RemoteStatus::RolledBack;
                    s.last_reason = Some("resource creation failed".into());
                });
                RemoteStatus::RolledBack
            }
            _ => {
                let outputs = self
                    .inner
                    .deploy_outputs
                    .get(&pending.fqn)
                    .map(|o| o.clone())
                    .unwrap_or_default();
                self.inner.stacks.entry(pending.fqn.clone()).and_modify(|s| {
                    s.status = RemoteStatus::Complete;
                    s.parameters = pending.parameters.clone();
                    if pending.digest.is_some() {
                        s.template_digest = pending.digest;
                    }
                    if !outputs.is_empty() {
                        s.outputs = outputs.clone();
                    }
                    s.last_reason = None;
                });
                RemoteStatus::Complete
            }
        };
        Ok(status)
    }

    async fn events_since(
        &self,
        fqn: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<StackEventRecord>> {
        Ok(self
            .inner
            .events
            .read()
            .iter()
            .filter(|e| e.fqn == fqn && e.timestamp > since)
            .cloned()
            .collect())
    }

    async fn decrypt(&self, ciphertext: &str, _region: Option<&str>) -> Result<String> {
        self.record(format!("decrypt {}", ciphertext));
        self.inner
            .secrets
            .get(ciphertext)
            .map(|s| s.clone())
            .ok_or_else(|| StratusError::PermissionDenied {
                reason: format!("cannot decrypt ciphertext '{}'", ciphertext),
            })
    }

    async fn get_parameter(&self, name: &str, _region: Option<&str>) -> Result<String> {
        self.record(format!("get_parameter {}", name));
        self.inner
            .parameters
            .get(name)
            .map(|s| s.clone())
            .ok_or_else(|| StratusError::LookupFailed {
                kind: "ssmstore".into(),
                arg: name.into(),
                reason: "parameter not found".into(),
            })
    }

    async fn get_item(
        &self,
        table: &str,
        key: &str,
        value: &str,
        _region: Option<&str>,
    ) -> Result<Value> {
        self.record(format!("get_item {}:{}={}", table, key, value));
        self.inner
            .items
            .get(&format!("{}:{}={}", table, key, value))
            .map(|v| v.clone())
            .ok_or_else(|| StratusError::LookupFailed {
                kind: "dynamodb".into(),
                arg: format!("{}@{}:{}", table, key, value),
                reason: "item not found".into(),
            })
    }

    async fn find_ami(&self, filters: &AmiFilters, _region: Option<&str>) -> Result<String> {
        self.record("find_ami".to_string());
        let name_re = match &filters.name_regex {
            Some(pattern) => Some(regex::Regex::new(pattern).map_err(|e| {
                StratusError::LookupFailed {
                    kind: "ami".into(),
                    arg: pattern.clone(),
                    reason: e.to_string(),
                }
            })?),
            None => None,
        };

        let images = self.inner.images.read();
        let mut candidates: Vec<&MockImage> = images
            .iter()
            .filter(|img| filters.owners.is_empty() || filters.owners.contains(&img.owner))
            .filter(|img| name_re.as_ref().is_none_or(|re| re.is_match(&img.name)))
            .collect();
        candidates.sort_by(|a, b| b.created.cmp(&a.created));

        candidates
            .first()
            .map(|img| img.id.clone())
            .ok_or_else(|| StratusError::LookupFailed {
                kind: "ami".into(),
                arg: format!("{:?}", filters),
                reason: "no matching image".into(),
            })
    }
}
