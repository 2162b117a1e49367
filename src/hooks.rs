//! Hook runner - named actions around the executor
//!
//! Hooks run serially in declaration order, reordered only by their own
//! requires/required_by sub-graph. A required hook that fails aborts the
//! invocation before any step dispatches; an optional one logs and moves
//! on. Results land in context.hook_data under the hook's data_key, where
//! the hook_data lookup can see them.

use std::sync::Arc;

use async_trait::async_trait;
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::config::HookDef;
use crate::context::Context;
use crate::error::{Result, StratusError};
use crate::event::{EventBus, StepStatus};
use crate::lookup::{LookupRegistry, ResolveCtx, ResolveMode};
use crate::provider::Provider;

/// A named hook implementation.
#[async_trait]
pub trait HookHandler: Send + Sync {
    async fn run(&self, args: &Value, context: &Context) -> Result<Value>;
}

/// Capability table of hook handlers, keyed by path.
pub struct HookRegistry {
    handlers: FxHashMap<String, Arc<dyn HookHandler>>,
}

impl HookRegistry {
    pub fn empty() -> Self {
        Self {
            handlers: FxHashMap::default(),
        }
    }

    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register("shell", Arc::new(ShellHook));
        registry
    }

    pub fn register(&mut self, path: impl Into<String>, handler: Arc<dyn HookHandler>) {
        self.handlers.insert(path.into(), handler);
    }

    pub fn get(&self, path: &str) -> Result<&Arc<dyn HookHandler>> {
        self.handlers
            .get(path)
            .ok_or_else(|| StratusError::UnknownHook { path: path.into() })
    }
}

/// Runs a command through the shell. Args: `{command, env?}`. Returns
/// stdout parsed as JSON when possible, else as a string.
pub struct ShellHook;

#[async_trait]
impl HookHandler for ShellHook {
    async fn run(&self, args: &Value, _context: &Context) -> Result<Value> {
        let command = args
            .get("command")
            .and_then(Value::as_str)
            .ok_or_else(|| StratusError::HookFailed {
                name: "shell".into(),
                reason: "args.command is required".into(),
            })?;

        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c").arg(command);
        if let Some(env) = args.get("env").and_then(Value::as_object) {
            for (key, value) in env {
                if let Some(value) = value.as_str() {
                    cmd.env(key, value);
                }
            }
        }

        let output = cmd.output().await.map_err(|e| StratusError::HookFailed {
            name: "shell".into(),
            reason: e.to_string(),
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(StratusError::HookFailed {
                name: "shell".into(),
                reason: format!(
                    "exit {}: {}",
                    output.status.code().unwrap_or(-1),
                    stderr.trim()
                ),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(serde_json::from_str(&stdout).unwrap_or(Value::String(stdout)))
    }
}

/// How the runner treats hooks whose lookups cannot resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveFailurePolicy {
    /// Fail the hook (normal phases)
    Fail,
    /// Skip the hook (post_destroy: its inputs may be gone by design)
    Skip,
}

pub struct HookRunner<'a> {
    pub registry: &'a HookRegistry,
    pub lookups: &'a LookupRegistry,
    pub context: &'a Context,
    pub provider: Option<&'a Arc<dyn Provider>>,
    pub events: &'a EventBus,
}

impl HookRunner<'_> {
    /// Run one phase's hooks. Returns Err only when a required hook fails.
    pub async fn run_phase(
        &self,
        hooks: &[HookDef],
        phase: &str,
        on_resolve_failure: ResolveFailurePolicy,
    ) -> Result<()> {
        if hooks.is_empty() {
            return Ok(());
        }
        let order = ordered(hooks)?;

        for idx in order {
            let hook = &hooks[idx];
            let event_id: Arc<str> = Arc::from(format!("hook:{}:{}", phase, hook.display_name()));

            if !hook.enabled {
                self.emit(&event_id, StepStatus::Skipped, "disabled");
                continue;
            }

            let handler = self.registry.get(&hook.path)?;

            // Hook args may carry lookups of their own
            let ctx = ResolveCtx::new(self.context, self.provider, ResolveMode::Execute);
            let raw_args = json!(hook.args);
            let args = match self.lookups.resolve_value(&raw_args, &ctx).await {
                Ok(args) => args,
                Err(e) if on_resolve_failure == ResolveFailurePolicy::Skip => {
                    warn!(hook = hook.display_name(), error = %e, "skipping hook with unresolvable args");
                    self.emit(&event_id, StepStatus::Skipped, "inputs no longer resolvable");
                    continue;
                }
                Err(e) => {
                    return self.settle_failure(hook, &event_id, e);
                }
            };

            match handler.run(&args, self.context).await {
                Ok(value) => {
                    if let Some(key) = &hook.data_key {
                        self.context.set_hook_data(key.clone(), value);
                    }
                    info!(hook = hook.display_name(), phase, "hook completed");
                    self.emit(&event_id, StepStatus::Complete, "hook completed");
                }
                Err(e) => {
                    let result = self.settle_failure(hook, &event_id, e);
                    result?;
                }
            }
        }
        Ok(())
    }

    fn settle_failure(
        &self,
        hook: &HookDef,
        event_id: &Arc<str>,
        error: StratusError,
    ) -> Result<()> {
        if hook.required {
            self.emit(event_id, StepStatus::Failed, &error.to_string());
            Err(StratusError::HookFailed {
                name: hook.display_name().to_string(),
                reason: error.to_string(),
            })
        } else {
            warn!(hook = hook.display_name(), error = %error, "optional hook failed");
            self.emit(event_id, StepStatus::Failed, &error.to_string());
            Ok(())
        }
    }

    fn emit(&self, id: &Arc<str>, to: StepStatus, reason: &str) {
        self.events.transition(
            Arc::clone(id),
            StepStatus::Pending,
            to,
            Some(reason.to_string()),
            None,
        );
    }
}

/// Topological order over requires/required_by, stable by declaration
/// order. Hooks reference each other by display name.
fn ordered(hooks: &[HookDef]) -> Result<Vec<usize>> {
    let index: FxHashMap<&str, usize> = hooks
        .iter()
        .enumerate()
        .map(|(i, h)| (h.display_name(), i))
        .collect();

    // deps[i] = hooks that must run before i
    let mut deps: Vec<FxHashSet<usize>> = vec![FxHashSet::default(); hooks.len()];
    for (i, hook) in hooks.iter().enumerate() {
        for name in &hook.requires {
            let j = *index.get(name.as_str()).ok_or_else(|| {
                StratusError::UnknownRequires {
                    name: hook.display_name().to_string(),
                    dep: name.clone(),
                }
            })?;
            deps[i].insert(j);
        }
        for name in &hook.required_by {
            let j = *index.get(name.as_str()).ok_or_else(|| {
                StratusError::UnknownRequires {
                    name: hook.display_name().to_string(),
                    dep: name.clone(),
                }
            })?;
            deps[j].insert(i);
        }
    }

    let mut order = Vec::with_capacity(hooks.len());
    let mut done: FxHashSet<usize> = FxHashSet::default();
    while order.len() < hooks.len() {
        let before = order.len();
        for i in 0..hooks.len() {
            if !done.contains(&i) && deps[i].iter().all(|d| done.contains(d)) {
                order.push(i);
                done.insert(i);
            }
        }
        if order.len() == before {
            let stuck: Vec<String> = (0..hooks.len())
                .filter(|i| !done.contains(i))
                .map(|i| hooks[i].display_name().to_string())
                .collect();
            return Err(StratusError::CircularDependency {
                cycles: vec![stuck.join(" -> ")],
            });
        }
    }
    Ok(order)
}
