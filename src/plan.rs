//! Planner - from config to an executable DAG of steps
//!
//! One step per stack and action. Edges come from two places: explicit
//! `requires` entries, and output references discovered by running the
//! value resolver in plan mode over every variable. Destroy plans invert
//! the edges so dependents go first; build plans against a persistent
//! graph append destroy steps for stacks that vanished from the config.

use std::collections::BTreeMap;
use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value;
use tracing::debug;

use crate::blueprint::{Blueprint, BlueprintRegistry, RawTemplateBlueprint};
use crate::config::{Config, InProgressBehavior, StackDef};
use crate::context::Context;
use crate::error::{Result, StratusError};
use crate::graph::Graph;
use crate::lookup::{LookupRegistry, ResolveCtx, ResolveMode};
use crate::provider::Provider;
use crate::store::persist::{PersistedGraph, PersistentGraphStore};
use crate::store::LockToken;

/// What a plan does to each of its stacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    CreateOrUpdate,
    Destroy,
    Diff,
    Dump,
}

impl Action {
    pub fn mutates(self) -> bool {
        matches!(self, Self::CreateOrUpdate | Self::Destroy)
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::CreateOrUpdate => "build",
            Self::Destroy => "destroy",
            Self::Diff => "diff",
            Self::Dump => "dump",
        };
        f.write_str(s)
    }
}

/// A stack materialized for this run.
pub struct StackRuntime {
    pub logical_name: Arc<str>,
    pub fqn: String,
    pub region: Option<String>,
    pub profile: Option<String>,
    pub tags: BTreeMap<String, String>,
    /// Unresolved variable expressions, re-resolved at dispatch
    pub raw_variables: BTreeMap<String, Value>,
    pub blueprint: Option<Arc<dyn Blueprint>>,
    pub stack_policy: Option<Arc<[u8]>>,
    pub locked: bool,
    pub protected: bool,
    pub external: bool,
    pub in_progress_behavior: InProgressBehavior,
    pub service_role: Option<String>,
}

/// A plan node: one stack, one action.
pub struct Step {
    pub id: Arc<str>,
    pub action: Action,
    pub stack: Arc<StackRuntime>,
    /// Plan-time resolution failure; the executor fails the step with it
    pub pre_failure: Option<String>,
}

/// Persistent-graph bookkeeping carried through execution.
pub struct PersistHandle {
    pub store: Arc<PersistentGraphStore>,
    pub token: LockToken,
    /// What to store once the run finishes
    pub snapshot: PersistedGraph,
}

/// A validated DAG of steps for one invocation.
pub struct Plan {
    pub action: Action,
    pub graph: Graph,
    pub steps: FxHashMap<Arc<str>, Step>,
    pub persist: Option<PersistHandle>,
}

impl std::fmt::Debug for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plan")
            .field("action", &self.action)
            .field("steps", &self.steps.keys().collect::<Vec<_>>())
            .field("persist", &self.persist.is_some())
            .finish()
    }
}

impl Plan {
    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.get(id)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Execution-scoping flags from the CLI.
#[derive(Debug, Clone, Default)]
pub struct PlanOptions {
    /// Restrict to these stacks (plus their dependencies)
    pub stacks: Vec<String>,
    /// With `stacks`: run exactly the selection, no dependencies
    pub only: bool,
}

pub struct Planner<'a> {
    pub config: &'a Config,
    pub context: &'a Context,
    pub lookups: &'a LookupRegistry,
    pub blueprints: &'a BlueprintRegistry,
    pub provider: Option<&'a Arc<dyn Provider>>,
    pub persist_store: Option<Arc<PersistentGraphStore>>,
}

impl Planner<'_> {
    pub async fn plan(&self, action: Action, options: &PlanOptions) -> Result<Plan> {
        let enabled: Vec<&StackDef> =
            self.config.stacks.iter().filter(|s| s.enabled).collect();

        for name in &options.stacks {
            if !enabled.iter().any(|s| &s.name == name) {
                return Err(StratusError::UnknownSelection { name: name.clone() });
            }
        }

        // Materialize runtimes and discover edges over the full enabled set;
        // the --stacks filter applies afterwards so closure edges survive.
        let mut graph = Graph::new();
        for def in &enabled {
            graph.add(&def.name);
        }

        let mut steps: FxHashMap<Arc<str>, Step> = FxHashMap::default();
        let mut edges: Vec<(String, String)> = Vec::new();

        for def in &enabled {
            let id = graph.add(&def.name);
            let (runtime, deps, pre_failure) = self.materialize(def, Arc::clone(&id)).await?;

            for dep in def.requires.iter().cloned().chain(deps) {
                if !graph.contains(&dep) {
                    return Err(StratusError::UnknownRequires {
                        name: def.name.clone(),
                        dep,
                    });
                }
                edges.push((def.name.clone(), dep));
            }

            steps.insert(
                Arc::clone(&id),
                Step {
                    id,
                    action,
                    stack: Arc::new(runtime),
                    pre_failure,
                },
            );
        }

        for (from, to) in edges {
            graph.connect_idempotent(&from, &to)?;
        }

        graph.validate()?;

        // Persistent-graph handling wants the full graph, before filtering.
        let full_graph = graph.clone();

        if !options.stacks.is_empty() {
            let mut keep: FxHashSet<String> =
                options.stacks.iter().cloned().collect();
            if !options.only {
                for name in &options.stacks {
                    for dep in graph.transitive_deps(name) {
                        keep.insert(dep.to_string());
                    }
                }
            }
            graph = graph.filter(|n| keep.contains(n));
            steps.retain(|id, _| keep.contains(id.as_ref()));
        }

        let mut persist = None;
        match action {
            Action::CreateOrUpdate => {
                if let Some(store) = &self.persist_store {
                    let token = store.lock().await?;
                    let prior = match store.load().await {
                        Ok(prior) => prior,
                        Err(e) => {
                            // Never leave the lock behind on a bad object
                            let _ = store.release(&token).await;
                            return Err(e);
                        }
                    };
                    self.append_prune_steps(&prior, &full_graph, &mut graph, &mut steps)?;
                    persist = Some(PersistHandle {
                        store: Arc::clone(store),
                        token,
                        snapshot: PersistedGraph::from_graph(&full_graph),
                    });
                }
            }
            Action::Destroy => {
                graph = graph.inverted();
                if let Some(store) = &self.persist_store {
                    let token = store.lock().await?;
                    let prior = match store.load().await {
                        Ok(prior) => prior,
                        Err(e) => {
                            let _ = store.release(&token).await;
                            return Err(e);
                        }
                    };
                    // Stacks that only the prior graph remembers (disabled
                    // or removed from the config) still get torn down.
                    self.append_prune_steps(&prior, &full_graph, &mut graph, &mut steps)?;
                    persist = Some(PersistHandle {
                        store: Arc::clone(store),
                        token,
                        snapshot: PersistedGraph::default(),
                    });
                }
            }
            Action::Diff | Action::Dump => {}
        }

        if steps.is_empty() {
            if let Some(handle) = &persist {
                let _ = handle.store.release(&handle.token).await;
            }
            return Err(StratusError::EmptyPlan);
        }

        debug!(steps = steps.len(), %action, "plan built");
        Ok(Plan {
            action,
            graph,
            steps,
            persist,
        })
    }

    /// Build the runtime stack plus the output-derived dependency set.
    async fn materialize(
        &self,
        def: &StackDef,
        id: Arc<str>,
    ) -> Result<(StackRuntime, Vec<String>, Option<String>)> {
        let blueprint: Option<Arc<dyn Blueprint>> = if let Some(name) = &def.blueprint {
            Some(self.blueprints.get(name)?)
        } else {
            def.template_path.as_ref().map(|path| {
                Arc::new(RawTemplateBlueprint::new(def.name.clone(), path.clone()))
                    as Arc<dyn Blueprint>
            })
        };

        let fqn = match &def.fqn {
            Some(explicit) => explicit.clone(),
            None => match &blueprint {
                Some(bp) => bp.fqn(self.context, def.stack_name()),
                None => self.context.fqn(def.stack_name()),
            },
        };

        let mut tags = self.config.tags.clone();
        tags.extend(def.tags.clone());

        let stack_policy = match &def.stack_policy_path {
            Some(path) => {
                let full = self.context.config_dir.join(path);
                Some(Arc::from(std::fs::read(&full)?.into_boxed_slice()))
            }
            None => None,
        };

        // Plan-mode resolution: collect output references as edges; an
        // eager lookup failure pre-fails just this step.
        let ctx = ResolveCtx::new(self.context, self.provider, ResolveMode::Plan);
        let raw = Value::Object(
            def.variables
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        );
        let pre_failure = match self.lookups.resolve_value(&raw, &ctx).await {
            Ok(_) => None,
            Err(e) => Some(e.to_string()),
        };
        let deps: Vec<String> = ctx.deps().into_iter().collect();

        let runtime = StackRuntime {
            logical_name: id,
            fqn,
            region: def.region.clone(),
            profile: def.profile.clone(),
            tags,
            raw_variables: def.variables.clone(),
            blueprint,
            stack_policy,
            locked: def.locked,
            protected: def.protected,
            external: def.external,
            in_progress_behavior: def.in_progress_behavior,
            service_role: self.config.service_role.clone(),
        };
        Ok((runtime, deps, pre_failure))
    }

    /// Destroy steps for stacks present in the prior graph but gone from
    /// the config. Edges between removed nodes come from the prior graph,
    /// inverted, so dependents are destroyed before their dependencies.
    fn append_prune_steps(
        &self,
        prior: &PersistedGraph,
        full_graph: &Graph,
        graph: &mut Graph,
        steps: &mut FxHashMap<Arc<str>, Step>,
    ) -> Result<()> {
        let removed = prior.removed_nodes(full_graph);
        if removed.is_empty() {
            return Ok(());
        }

        for name in &removed {
            let id = graph.add(name);
            let runtime = StackRuntime {
                logical_name: Arc::clone(&id),
                fqn: self.context.fqn(name),
                region: None,
                profile: None,
                tags: self.config.tags.clone(),
                raw_variables: BTreeMap::new(),
                blueprint: None,
                stack_policy: None,
                locked: false,
                protected: false,
                external: false,
                in_progress_behavior: InProgressBehavior::default(),
                service_role: self.config.service_role.clone(),
            };
            steps.insert(
                Arc::clone(&id),
                Step {
                    id,
                    action: Action::Destroy,
                    stack: Arc::new(runtime),
                    pre_failure: None,
                },
            );
        }

        let removed_set: FxHashSet<&str> = removed.iter().map(String::as_str).collect();
        for (name, deps) in &prior.nodes {
            if !removed_set.contains(name.as_str()) {
                continue;
            }
            for dep in deps {
                if removed_set.contains(dep.as_str()) {
                    graph.connect_idempotent(dep, name)?;
                }
            }
        }
        Ok(())
    }
}
