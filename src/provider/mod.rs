//! Provider capability - the contract for stack reconciliation
//!
//! The executor drives stacks through an adapter implementing [`Provider`].
//! Adapters wrap a concrete control plane; this crate ships an in-memory
//! adapter ([`mock::MockProvider`]) used by tests and the `memory` CLI
//! provider. Real cloud adapters register themselves in a
//! [`ProviderRegistry`] at startup.

pub mod mock;
pub mod retry;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, StratusError};

/// Status of a remote stack as reported by `describe` and `wait`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RemoteStatus {
    /// The stack does not exist yet
    New,
    InProgress,
    Complete,
    Failed,
    RolledBack,
    DeleteInProgress,
    DeleteComplete,
}

impl RemoteStatus {
    /// A settled status won't change again without a new operation.
    pub fn is_settled(self) -> bool {
        !matches!(self, Self::InProgress | Self::DeleteInProgress)
    }
}

impl std::fmt::Display for RemoteStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::New => "NEW",
            Self::InProgress => "IN_PROGRESS",
            Self::Complete => "COMPLETE",
            Self::Failed => "FAILED",
            Self::RolledBack => "ROLLED_BACK",
            Self::DeleteInProgress => "DELETE_IN_PROGRESS",
            Self::DeleteComplete => "DELETE_COMPLETE",
        };
        f.write_str(s)
    }
}

/// Result of describing a stack.
#[derive(Debug, Clone)]
pub struct StackDescription {
    pub fqn: String,
    /// `New` when the stack does not exist
    pub status: RemoteStatus,
    pub outputs: BTreeMap<String, String>,
    /// Parameters currently applied, for no-change detection
    pub parameters: BTreeMap<String, String>,
    /// xxh3 digest of the currently applied template body
    pub template_digest: Option<u64>,
    /// Last status reason reported by the control plane
    pub last_reason: Option<String>,
}

impl StackDescription {
    pub fn exists(&self) -> bool {
        !matches!(self.status, RemoteStatus::New | RemoteStatus::DeleteComplete)
    }

    pub fn absent(fqn: impl Into<String>) -> Self {
        Self {
            fqn: fqn.into(),
            status: RemoteStatus::New,
            outputs: BTreeMap::new(),
            parameters: BTreeMap::new(),
            template_digest: None,
            last_reason: None,
        }
    }
}

/// Template flavor produced by a blueprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemplateKind {
    Json,
    Yaml,
}

impl TemplateKind {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Yaml => "yaml",
        }
    }
}

/// A cloud-parameter value with its no_echo flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    pub value: String,
    #[serde(default)]
    pub no_echo: bool,
}

impl Parameter {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            no_echo: false,
        }
    }
}

/// Everything an adapter needs to submit a create/update.
#[derive(Debug, Clone)]
pub struct StackRequest {
    pub fqn: String,
    pub region: Option<String>,
    pub profile: Option<String>,
    pub template_body: Arc<[u8]>,
    pub template_kind: TemplateKind,
    pub parameters: BTreeMap<String, Parameter>,
    pub tags: BTreeMap<String, String>,
    pub stack_policy: Option<Arc<[u8]>>,
    pub service_role: Option<String>,
    pub notification_arns: Vec<String>,
}

impl StackRequest {
    /// xxh3 digest of the template body, for no-change detection.
    pub fn template_digest(&self) -> u64 {
        xxhash_rust::xxh3::xxh3_64(&self.template_body)
    }

    /// Parameters as plain strings (what the control plane compares).
    pub fn parameter_strings(&self) -> BTreeMap<String, String> {
        self.parameters
            .iter()
            .map(|(k, p)| (k.clone(), p.value.clone()))
            .collect()
    }
}

/// The kind of in-flight operation a handle refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Create,
    Update,
    Destroy,
    ApplyChangeSet,
}

/// Token for a submitted operation, consumed by `wait`.
#[derive(Debug, Clone)]
pub struct OperationHandle {
    pub fqn: String,
    pub kind: OperationKind,
    pub token: String,
}

impl OperationHandle {
    pub fn new(fqn: impl Into<String>, kind: OperationKind) -> Self {
        Self {
            fqn: fqn.into(),
            kind,
            token: uuid::Uuid::new_v4().to_string(),
        }
    }
}

/// What a change would do to one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeAction {
    Add,
    Modify,
    Remove,
}

/// One resource-level entry in a change set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceChange {
    pub action: ChangeAction,
    pub logical_id: String,
    pub resource_type: String,
    /// True when applying the change replaces the physical resource
    #[serde(default)]
    pub replacement: bool,
}

/// A computed change set awaiting apply or deletion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeSetPlan {
    pub id: String,
    pub fqn: String,
    pub changes: Vec<ResourceChange>,
}

impl ChangeSetPlan {
    pub fn additions(&self) -> usize {
        self.changes
            .iter()
            .filter(|c| c.action == ChangeAction::Add)
            .count()
    }

    pub fn modifications(&self) -> usize {
        self.changes
            .iter()
            .filter(|c| c.action == ChangeAction::Modify)
            .count()
    }

    pub fn replacements(&self) -> usize {
        self.changes.iter().filter(|c| c.replacement).count()
    }

    pub fn has_replacements(&self) -> bool {
        self.changes.iter().any(|c| c.replacement)
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

/// One provider event-log line, surfaced when tailing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackEventRecord {
    pub timestamp: DateTime<Utc>,
    pub fqn: String,
    pub logical_id: String,
    pub status: String,
    pub reason: Option<String>,
}

/// Filters for an image search (`ami` lookup).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AmiFilters {
    pub owners: Vec<String>,
    pub name_regex: Option<String>,
    pub extra: BTreeMap<String, String>,
}

/// Contract for stack reconciliation against a control plane.
///
/// All operations take the stack by fully-qualified name; region/profile
/// selection rides on the request or the adapter's own configuration.
/// Errors surface through the taxonomy on `StratusError`: `NoUpdates`,
/// `Throttled`, `StackRolledBack`, `StackDeleted`, `ProviderValidation`,
/// `OperationTimedOut`, `PermissionDenied`.
#[async_trait]
pub trait Provider: Send + Sync {
    async fn describe(&self, fqn: &str, region: Option<&str>) -> Result<StackDescription>;

    async fn create(&self, request: &StackRequest) -> Result<OperationHandle>;

    /// Returns `NoUpdates` when the control plane reports nothing to do.
    async fn update(&self, request: &StackRequest) -> Result<OperationHandle>;

    async fn plan_change_set(&self, request: &StackRequest) -> Result<ChangeSetPlan>;

    async fn apply_change_set(&self, plan: &ChangeSetPlan) -> Result<OperationHandle>;

    /// Discard an unapplied change set (decline or cancellation cleanup).
    async fn delete_change_set(&self, plan: &ChangeSetPlan) -> Result<()>;

    async fn destroy(&self, fqn: &str, region: Option<&str>) -> Result<OperationHandle>;

    /// Block until the operation settles, polling at `poll_interval`, up to
    /// `deadline`. Observes `cancel` between polls.
    async fn wait(
        &self,
        handle: &OperationHandle,
        poll_interval: Duration,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<RemoteStatus>;

    /// Event-log records newer than `since` (tailing).
    async fn events_since(
        &self,
        fqn: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<StackEventRecord>>;

    // ── Optional facilities ────────────────────────────────────────

    async fn decrypt(&self, _ciphertext: &str, _region: Option<&str>) -> Result<String> {
        Err(StratusError::UnsupportedFacility {
            facility: "decrypt".into(),
        })
    }

    async fn get_parameter(&self, _name: &str, _region: Option<&str>) -> Result<String> {
        Err(StratusError::UnsupportedFacility {
            facility: "parameter store".into(),
        })
    }

    async fn get_item(
        &self,
        _table: &str,
        _key: &str,
        _value: &str,
        _region: Option<&str>,
    ) -> Result<Value> {
        Err(StratusError::UnsupportedFacility {
            facility: "item store".into(),
        })
    }

    async fn find_ami(&self, _filters: &AmiFilters, _region: Option<&str>) -> Result<String> {
        Err(StratusError::UnsupportedFacility {
            facility: "image search".into(),
        })
    }
}

/// Named registry of provider adapters, resolved by the CLI.
#[derive(Default)]
pub struct ProviderRegistry {
    adapters: FxHashMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    /// Registry with the built-in `memory` adapter.
    pub fn builtin() -> Self {
        let mut registry = Self::default();
        registry.register("memory", Arc::new(mock::MockProvider::new()));
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, adapter: Arc<dyn Provider>) {
        self.adapters.insert(name.into(), adapter);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Provider>> {
        self.adapters
            .get(name)
            .cloned()
            .ok_or_else(|| StratusError::UnknownProvider { name: name.into() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_description_does_not_exist() {
        let desc = StackDescription::absent("ns-vpc");
        assert!(!desc.exists());
        assert_eq!(desc.status, RemoteStatus::New);
    }

    #[test]
    fn settled_statuses() {
        assert!(RemoteStatus::Complete.is_settled());
        assert!(RemoteStatus::RolledBack.is_settled());
        assert!(RemoteStatus::DeleteComplete.is_settled());
        assert!(!RemoteStatus::InProgress.is_settled());
        assert!(!RemoteStatus::DeleteInProgress.is_settled());
    }

    #[test]
    fn change_set_counts() {
        let plan = ChangeSetPlan {
            id: "cs-1".into(),
            fqn: "ns-app".into(),
            changes: vec![
                ResourceChange {
                    action: ChangeAction::Add,
                    logical_id: "Queue".into(),
                    resource_type: "AWS::SQS::Queue".into(),
                    replacement: false,
                },
                ResourceChange {
                    action: ChangeAction::Modify,
                    logical_id: "Role".into(),
                    resource_type: "AWS::IAM::Role".into(),
                    replacement: true,
                },
            ],
        };
        assert_eq!(plan.additions(), 1);
        assert_eq!(plan.modifications(), 1);
        assert_eq!(plan.replacements(), 1);
        assert!(plan.has_replacements());
        assert!(!plan.is_empty());
    }

    #[test]
    fn request_digest_tracks_body() {
        let mut request = StackRequest {
            fqn: "ns-vpc".into(),
            region: None,
            profile: None,
            template_body: Arc::from(b"{}".as_slice()),
            template_kind: TemplateKind::Json,
            parameters: BTreeMap::new(),
            tags: BTreeMap::new(),
            stack_policy: None,
            service_role: None,
            notification_arns: Vec::new(),
        };
        let a = request.template_digest();
        request.template_body = Arc::from(b"{\"Resources\":{}}".as_slice());
        assert_ne!(a, request.template_digest());
    }

    #[test]
    fn registry_resolves_builtin() {
        let registry = ProviderRegistry::builtin();
        assert!(registry.get("memory").is_ok());
        assert!(matches!(
            registry.get("nope"),
            Err(StratusError::UnknownProvider { .. })
        ));
    }
}
