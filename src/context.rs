//! Execution context shared across steps
//!
//! Three pieces of cross-step state live here, each with a single writer
//! discipline: stack outputs (write-once, published when the producing step
//! completes), hook data (written only by the hook runner), and the
//! process-wide cancellation token. Everything else a step needs rides on
//! the step itself.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// Poll interval override, in seconds (0 is legal for tests).
pub const ENV_POLL_TIME: &str = "STRATUS_STACK_POLL_TIME";
/// Per-operation deadline override, in seconds.
pub const ENV_OPERATION_TIMEOUT: &str = "STRATUS_OPERATION_TIMEOUT";
/// Cache directory override.
pub const ENV_CACHE_DIR: &str = "STRATUS_CACHE_DIR";

const DEFAULT_POLL: Duration = Duration::from_secs(5);
const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(2 * 60 * 60);

/// Run-wide environment for planning and execution.
pub struct Context {
    pub namespace: String,
    pub delimiter: String,
    /// Stack outputs, keyed by logical name. Write-once per stack.
    outputs: DashMap<Arc<str>, Arc<BTreeMap<String, String>>>,
    /// Keyed result bag written by hooks, read by the hook_data lookup.
    hook_data: DashMap<String, Value>,
    pub cancel: CancellationToken,
    /// Directory of the config file; file:// lookups resolve against it.
    pub config_dir: PathBuf,
    pub poll_interval: Duration,
    pub operation_timeout: Duration,
}

impl Context {
    pub fn new(namespace: impl Into<String>, delimiter: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            delimiter: delimiter.into(),
            outputs: DashMap::new(),
            hook_data: DashMap::new(),
            cancel: CancellationToken::new(),
            config_dir: PathBuf::from("."),
            poll_interval: poll_interval_from_env(),
            operation_timeout: operation_timeout_from_env(),
        }
    }

    pub fn with_config_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.config_dir = dir.as_ref().to_path_buf();
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Fully-qualified cloud-side name for a stack_name.
    ///
    /// An empty namespace yields the bare stack_name (collisions are
    /// rejected at config validation).
    pub fn fqn(&self, stack_name: &str) -> String {
        if self.namespace.is_empty() {
            stack_name.to_string()
        } else {
            format!("{}{}{}", self.namespace, self.delimiter, stack_name)
        }
    }

    /// Publish a completed stack's outputs. First publish wins; the
    /// executor only calls this once, on the COMPLETE transition.
    pub fn publish_outputs(&self, logical_name: &str, outputs: BTreeMap<String, String>) {
        self.outputs
            .entry(Arc::from(logical_name))
            .or_insert_with(|| Arc::new(outputs));
    }

    /// All outputs of a stack, if published.
    pub fn outputs(&self, logical_name: &str) -> Option<Arc<BTreeMap<String, String>>> {
        self.outputs.get(logical_name).map(|o| Arc::clone(&o))
    }

    /// One output value of a stack, if published.
    pub fn output(&self, logical_name: &str, output_name: &str) -> Option<String> {
        self.outputs
            .get(logical_name)
            .and_then(|o| o.get(output_name).cloned())
    }

    pub fn set_hook_data(&self, key: impl Into<String>, value: Value) {
        self.hook_data.insert(key.into(), value);
    }

    /// Read hook data by dotted path: `key.nested.leaf`.
    pub fn hook_data(&self, path: &str) -> Option<Value> {
        let (key, rest) = match path.split_once('.') {
            Some((key, rest)) => (key, Some(rest)),
            None => (path, None),
        };
        let root = self.hook_data.get(key)?.clone();
        let Some(rest) = rest else {
            return Some(root);
        };
        let mut current = root;
        for segment in rest.split('.') {
            let next = match segment.parse::<usize>() {
                Ok(idx) => current.get(idx),
                Err(_) => current.get(segment),
            };
            current = next?.clone();
        }
        Some(current)
    }
}

fn duration_from_env(var: &str, default: Duration) -> Duration {
    match std::env::var(var) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Duration::from_secs)
            .unwrap_or(default),
        Err(_) => default,
    }
}

pub fn poll_interval_from_env() -> Duration {
    duration_from_env(ENV_POLL_TIME, DEFAULT_POLL)
}

pub fn operation_timeout_from_env() -> Duration {
    duration_from_env(ENV_OPERATION_TIMEOUT, DEFAULT_OPERATION_TIMEOUT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fqn_joins_namespace_and_name() {
        let ctx = Context::new("prod", "-");
        assert_eq!(ctx.fqn("vpc"), "prod-vpc");
    }

    #[test]
    fn fqn_with_empty_namespace_is_bare() {
        let ctx = Context::new("", "-");
        assert_eq!(ctx.fqn("vpc"), "vpc");
    }

    #[test]
    fn fqn_with_custom_delimiter() {
        let ctx = Context::new("prod", "");
        assert_eq!(ctx.fqn("vpc"), "prodvpc");
    }

    #[test]
    fn outputs_are_write_once() {
        let ctx = Context::new("ns", "-");
        let mut first = BTreeMap::new();
        first.insert("Id".to_string(), "vpc-1".to_string());
        ctx.publish_outputs("vpc", first);

        let mut second = BTreeMap::new();
        second.insert("Id".to_string(), "vpc-2".to_string());
        ctx.publish_outputs("vpc", second);

        assert_eq!(ctx.output("vpc", "Id").unwrap(), "vpc-1");
    }

    #[test]
    fn missing_output_is_none() {
        let ctx = Context::new("ns", "-");
        assert!(ctx.output("vpc", "Id").is_none());
        ctx.publish_outputs("vpc", BTreeMap::new());
        assert!(ctx.output("vpc", "Id").is_none());
        assert!(ctx.outputs("vpc").is_some());
    }

    #[test]
    fn hook_data_dotted_paths() {
        let ctx = Context::new("ns", "-");
        ctx.set_hook_data("build", json!({"image": {"tag": "v1.2"}, "ids": [7, 8]}));

        assert_eq!(ctx.hook_data("build.image.tag").unwrap(), json!("v1.2"));
        assert_eq!(ctx.hook_data("build.ids.1").unwrap(), json!(8));
        assert_eq!(ctx.hook_data("build").unwrap()["image"]["tag"], "v1.2");
        assert!(ctx.hook_data("build.missing").is_none());
        assert!(ctx.hook_data("nothing").is_none());
    }
}
