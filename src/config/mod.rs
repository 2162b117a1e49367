//! Config model - the declarative stack-set document
//!
//! Parsing is strict where mistakes are dangerous and lenient where they
//! are not: an unknown key inside a stack definition is a hard error, an
//! unknown key at the top level only warns (anchor-only YAML definitions
//! are common there).

pub mod env;

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::error::{Result, StratusError};

fn default_true() -> bool {
    true
}

fn default_delimiter() -> String {
    "-".to_string()
}

/// What to do when a stack already has an operation in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InProgressBehavior {
    /// Poll until the operation settles, then proceed
    Wait,
    /// Fail the step
    #[default]
    Error,
}

/// One stack declaration.
#[derive(Debug, Clone, Deserialize)]
pub struct StackDef {
    pub name: String,
    /// Cloud-side base name; defaults to `name`
    pub stack_name: Option<String>,
    /// Full override of the qualified name
    pub fqn: Option<String>,
    pub blueprint: Option<String>,
    pub template_path: Option<String>,
    #[serde(default)]
    pub variables: BTreeMap<String, Value>,
    #[serde(default)]
    pub requires: Vec<String>,
    #[serde(default)]
    pub locked: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub protected: bool,
    #[serde(default)]
    pub external: bool,
    pub region: Option<String>,
    pub profile: Option<String>,
    pub stack_policy_path: Option<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    pub description: Option<String>,
    #[serde(default)]
    pub in_progress_behavior: InProgressBehavior,
}

impl StackDef {
    pub fn stack_name(&self) -> &str {
        self.stack_name.as_deref().unwrap_or(&self.name)
    }
}

/// One hook declaration.
#[derive(Debug, Clone, Deserialize)]
pub struct HookDef {
    pub name: Option<String>,
    /// Handler path, resolved against the hook registry
    pub path: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub required: bool,
    #[serde(default)]
    pub args: BTreeMap<String, Value>,
    /// Where the hook's return value lands in context.hook_data
    pub data_key: Option<String>,
    #[serde(default)]
    pub requires: Vec<String>,
    #[serde(default)]
    pub required_by: Vec<String>,
}

impl HookDef {
    /// Display name: explicit name, else the handler path.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.path)
    }
}

/// Hooks grouped by phase.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Hooks {
    #[serde(default)]
    pub pre_build: Vec<HookDef>,
    #[serde(default)]
    pub post_build: Vec<HookDef>,
    #[serde(default)]
    pub pre_destroy: Vec<HookDef>,
    #[serde(default)]
    pub post_destroy: Vec<HookDef>,
}

/// The whole config document.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub namespace: String,
    #[serde(default = "default_delimiter")]
    pub namespace_delimiter: String,
    #[serde(default)]
    pub stacks: Vec<StackDef>,
    #[serde(default)]
    pub hooks: Hooks,
    #[serde(default)]
    pub mappings: BTreeMap<String, Value>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// Custom lookup registrations: type name -> handler path
    #[serde(default)]
    pub lookups: BTreeMap<String, String>,
    #[serde(default)]
    pub sys_path: Vec<String>,
    pub artifact_bucket: Option<String>,
    pub artifact_region: Option<String>,
    pub service_role: Option<String>,
    pub persistent_graph_key: Option<String>,
}

/// Keys [`Config`] understands at the top level.
const TOP_LEVEL_KEYS: &[&str] = &[
    "namespace",
    "namespace_delimiter",
    "stacks",
    "hooks",
    "mappings",
    "tags",
    "lookups",
    "sys_path",
    "artifact_bucket",
    "artifact_region",
    "service_role",
    "persistent_graph_key",
];

/// Keys [`StackDef`] understands.
const STACK_KEYS: &[&str] = &[
    "name",
    "stack_name",
    "fqn",
    "blueprint",
    "template_path",
    "variables",
    "requires",
    "locked",
    "enabled",
    "protected",
    "external",
    "region",
    "profile",
    "stack_policy_path",
    "tags",
    "description",
    "in_progress_behavior",
];

impl Config {
    /// Parse and validate a config document.
    pub fn loads(text: &str) -> Result<Config> {
        let raw: serde_yaml::Value =
            serde_yaml::from_str(text).map_err(|e| StratusError::ConfigParse {
                details: e.to_string(),
            })?;
        check_keys(&raw)?;

        let config: Config =
            serde_yaml::from_value(raw).map_err(|e| StratusError::ConfigParse {
                details: e.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let mut seen: BTreeMap<&str, ()> = BTreeMap::new();
        for stack in &self.stacks {
            if seen.insert(stack.name.as_str(), ()).is_some() {
                return Err(StratusError::DuplicateStack {
                    name: stack.name.clone(),
                });
            }
        }

        for stack in &self.stacks {
            let sources = stack.blueprint.is_some() as u8 + stack.template_path.is_some() as u8;
            let exempt = stack.locked || stack.external;
            if sources != 1 && !exempt {
                return Err(StratusError::StackSourceConflict {
                    name: stack.name.clone(),
                });
            }
            for dep in &stack.requires {
                if !self.stacks.iter().any(|s| &s.name == dep) {
                    return Err(StratusError::UnknownRequires {
                        name: stack.name.clone(),
                        dep: dep.clone(),
                    });
                }
            }
        }

        if self.namespace.is_empty() {
            let mut names: BTreeMap<&str, &str> = BTreeMap::new();
            for stack in &self.stacks {
                if let Some(other) = names.insert(stack.stack_name(), stack.name.as_str()) {
                    return Err(StratusError::FqnCollision {
                        a: other.to_string(),
                        b: stack.name.clone(),
                        stack_name: stack.stack_name().to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn stack(&self, name: &str) -> Option<&StackDef> {
        self.stacks.iter().find(|s| s.name == name)
    }
}

/// Warn on unknown top-level keys, reject unknown stack keys.
fn check_keys(raw: &serde_yaml::Value) -> Result<()> {
    let Some(mapping) = raw.as_mapping() else {
        return Err(StratusError::ConfigParse {
            details: "config root must be a mapping".into(),
        });
    };

    for key in mapping.keys() {
        if let Some(key) = key.as_str() {
            if !TOP_LEVEL_KEYS.contains(&key) {
                warn!(key, "ignoring unknown top-level config key");
            }
        }
    }

    if let Some(stacks) = mapping.get("stacks").and_then(|v| v.as_sequence()) {
        for stack in stacks {
            let Some(stack_map) = stack.as_mapping() else {
                continue;
            };
            let name = stack_map
                .get("name")
                .and_then(|v| v.as_str())
                .unwrap_or("<unnamed>");
            for key in stack_map.keys() {
                if let Some(key) = key.as_str() {
                    if !STACK_KEYS.contains(&key) {
                        return Err(StratusError::UnknownStackKey {
                            key: key.to_string(),
                            name: name.to_string(),
                        });
                    }
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
namespace: prod
stacks:
  - name: vpc
    template_path: templates/vpc.yaml
"#;

    #[test]
    fn minimal_config_parses() {
        let config = Config::loads(MINIMAL).unwrap();
        assert_eq!(config.namespace, "prod");
        assert_eq!(config.namespace_delimiter, "-");
        assert_eq!(config.stacks.len(), 1);
        let vpc = &config.stacks[0];
        assert!(vpc.enabled);
        assert!(!vpc.locked);
        assert_eq!(vpc.stack_name(), "vpc");
        assert_eq!(vpc.in_progress_behavior, InProgressBehavior::Error);
    }

    #[test]
    fn full_stack_def_parses() {
        let config = Config::loads(
            r#"
namespace: prod
namespace_delimiter: "."
tags:
  team: infra
stacks:
  - name: app
    stack_name: application
    blueprint: app.Blueprint
    variables:
      VpcId: "${output vpc::Id}"
    requires: [vpc]
    protected: true
    region: us-west-2
    tags:
      tier: web
    in_progress_behavior: wait
  - name: vpc
    template_path: t.yaml
"#,
        )
        .unwrap();
        let app = config.stack("app").unwrap();
        assert_eq!(app.stack_name(), "application");
        assert_eq!(app.requires, vec!["vpc"]);
        assert!(app.protected);
        assert_eq!(app.in_progress_behavior, InProgressBehavior::Wait);
        assert_eq!(config.namespace_delimiter, ".");
    }

    #[test]
    fn duplicate_stack_name_is_error() {
        let err = Config::loads(
            r#"
namespace: ns
stacks:
  - name: vpc
    template_path: a.yaml
  - name: vpc
    template_path: b.yaml
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("STRA-010"));
    }

    #[test]
    fn blueprint_and_template_path_conflict() {
        let err = Config::loads(
            r#"
namespace: ns
stacks:
  - name: vpc
    blueprint: x.Y
    template_path: a.yaml
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("STRA-011"));
    }

    #[test]
    fn no_source_required_when_locked_or_external() {
        let config = Config::loads(
            r#"
namespace: ns
stacks:
  - name: vpc
    locked: true
  - name: dns
    external: true
"#,
        )
        .unwrap();
        assert!(config.stack("vpc").unwrap().locked);
        assert!(config.stack("dns").unwrap().external);
    }

    #[test]
    fn missing_source_is_error() {
        let err = Config::loads(
            r#"
namespace: ns
stacks:
  - name: vpc
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("STRA-011"));
    }

    #[test]
    fn unknown_requires_is_error() {
        let err = Config::loads(
            r#"
namespace: ns
stacks:
  - name: app
    template_path: a.yaml
    requires: [ghost]
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("STRA-014"));
    }

    #[test]
    fn unknown_stack_key_is_error() {
        let err = Config::loads(
            r#"
namespace: ns
stacks:
  - name: vpc
    template_path: a.yaml
    template_pth: typo.yaml
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("STRA-013"));
        assert!(err.to_string().contains("template_pth"));
    }

    #[test]
    fn unknown_top_level_key_is_tolerated() {
        let config = Config::loads(
            r#"
namespace: ns
common_anchors:
  subnet: &subnet "10.0.0.0/24"
stacks:
  - name: vpc
    template_path: a.yaml
    variables:
      Cidr: *subnet
"#,
        )
        .unwrap();
        assert_eq!(
            config.stack("vpc").unwrap().variables["Cidr"],
            serde_json::json!("10.0.0.0/24")
        );
    }

    #[test]
    fn empty_namespace_with_colliding_stack_names() {
        let err = Config::loads(
            r#"
namespace: ""
stacks:
  - name: a
    stack_name: shared
    template_path: a.yaml
  - name: b
    stack_name: shared
    template_path: b.yaml
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("STRA-012"));
    }

    #[test]
    fn hooks_parse_by_phase() {
        let config = Config::loads(
            r#"
namespace: ns
hooks:
  pre_build:
    - path: shell
      args:
        command: "make lambda-package"
      data_key: package
  post_destroy:
    - path: shell
      required: false
      args:
        command: "echo done"
stacks:
  - name: vpc
    template_path: a.yaml
"#,
        )
        .unwrap();
        assert_eq!(config.hooks.pre_build.len(), 1);
        assert_eq!(config.hooks.pre_build[0].display_name(), "shell");
        assert!(config.hooks.pre_build[0].required);
        assert!(!config.hooks.post_destroy[0].required);
        assert_eq!(config.hooks.post_build.len(), 0);
    }

    #[test]
    fn persistent_graph_key_and_service_role() {
        let config = Config::loads(
            r#"
namespace: ns
persistent_graph_key: state/ns.json
service_role: arn:aws:iam::123:role/deployer
artifact_bucket: my-artifacts
stacks:
  - name: vpc
    template_path: a.yaml
"#,
        )
        .unwrap();
        assert_eq!(config.persistent_graph_key.as_deref(), Some("state/ns.json"));
        assert!(config.service_role.is_some());
        assert_eq!(config.artifact_bucket.as_deref(), Some("my-artifacts"));
    }
}
