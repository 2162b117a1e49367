//! Shared fixtures for integration tests
// Each test binary uses a different subset of the harness.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use stratus::blueprint::{BlueprintRegistry, StaticBlueprint};
use stratus::config::Config;
use stratus::context::Context;
use stratus::error::Result;
use stratus::event::{EventBus, StepEvent, StepStatus};
use stratus::executor::{ApprovalSource, AutoApprove, ExecOptions, Executor, RunSummary};
use stratus::lookup::LookupRegistry;
use stratus::plan::{Action, Plan, PlanOptions, Planner};
use stratus::provider::mock::MockProvider;
use stratus::provider::retry::{RetryConfig, RetryPolicy};
use stratus::provider::{Provider, TemplateKind};
use stratus::store::persist::PersistentGraphStore;

/// One assembled test environment around a scripted provider.
pub struct Harness {
    pub config: Config,
    pub context: Arc<Context>,
    pub mock: MockProvider,
    pub provider: Arc<dyn Provider>,
    pub lookups: Arc<LookupRegistry>,
    pub blueprints: BlueprintRegistry,
    pub events: EventBus,
    pub persist: Option<Arc<PersistentGraphStore>>,
}

impl Harness {
    pub fn new(config_text: &str, mock: MockProvider) -> Self {
        let config = Config::loads(config_text).expect("test config parses");
        let context = Arc::new(Context::new(
            config.namespace.clone(),
            config.namespace_delimiter.clone(),
        ));

        // Every blueprint name used in test configs resolves to a fixed
        // one-resource body so rendering never needs the filesystem.
        let mut blueprints = BlueprintRegistry::new();
        for stack in &config.stacks {
            if let Some(name) = &stack.blueprint {
                blueprints.register(
                    name.clone(),
                    Arc::new(StaticBlueprint::new(
                        name.clone(),
                        format!("{{\"Resources\": {{\"{}\": {{}}}}}}", stack.name),
                        TemplateKind::Json,
                    )),
                );
            }
        }

        Self {
            config,
            context,
            provider: Arc::new(mock.clone()),
            mock,
            lookups: Arc::new(LookupRegistry::builtin()),
            blueprints,
            events: EventBus::new(),
            persist: None,
        }
    }

    pub fn with_persist(mut self, persist: Arc<PersistentGraphStore>) -> Self {
        self.persist = Some(persist);
        self
    }

    pub async fn plan(&self, action: Action, options: PlanOptions) -> Result<Plan> {
        let planner = Planner {
            config: &self.config,
            context: &self.context,
            lookups: &self.lookups,
            blueprints: &self.blueprints,
            provider: Some(&self.provider),
            persist_store: self.persist.clone(),
        };
        planner.plan(action, &options).await
    }

    pub fn executor(&self, options: ExecOptions, approvals: Arc<dyn ApprovalSource>) -> Executor {
        Executor::new(
            Arc::clone(&self.provider),
            Arc::clone(&self.lookups),
            Arc::clone(&self.context),
            self.events.clone(),
            approvals,
            options,
        )
        .with_retry(RetryPolicy::new(
            RetryConfig::default()
                .with_initial_delay(std::time::Duration::from_millis(1))
                .with_jitter(0.0),
        ))
    }

    /// Plan and run one action with the given options.
    pub async fn run(&self, action: Action, options: ExecOptions) -> Result<RunSummary> {
        let plan = self.plan(action, PlanOptions::default()).await?;
        self.executor(options, Arc::new(AutoApprove)).run(plan).await
    }

    pub async fn build(&self) -> Result<RunSummary> {
        self.run(Action::CreateOrUpdate, ExecOptions::default()).await
    }

    /// Terminal event per step, in emission order.
    pub fn terminal_events(&self) -> Vec<StepEvent> {
        self.events
            .events()
            .into_iter()
            .filter(|e| e.to.is_terminal())
            .collect()
    }

    /// All (step, to-status, reason) triples, in emission order.
    pub fn transitions(&self) -> Vec<(String, StepStatus, Option<String>)> {
        self.events
            .events()
            .into_iter()
            .map(|e| (e.step_id.to_string(), e.to, e.reason))
            .collect()
    }
}

/// Parameters recorded by the mock for a deployed stack.
pub fn deployed_parameters(harness: &Harness, fqn: &str) -> BTreeMap<String, String> {
    harness
        .mock
        .stack(fqn)
        .map(|s| s.parameters)
        .unwrap_or_default()
}
