//! Stratus error types with error codes
//!
//! Error code ranges:
//! - STRA-000-009: Config errors
//! - STRA-010-019: Stack definition errors
//! - STRA-020-029: Graph errors
//! - STRA-030-039: Lookup errors
//! - STRA-040-049: Variable binding errors
//! - STRA-050-059: Blueprint/template errors
//! - STRA-060-069: Planner errors
//! - STRA-070-079: Provider errors
//! - STRA-080-089: Executor errors
//! - STRA-090-099: Hook errors
//! - STRA-100-109: Persistent graph / store errors
//! - STRA-110-119: IO/serde passthrough

use miette::Diagnostic;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StratusError>;

/// Format a list of cycles for display
fn format_cycles(cycles: &[String]) -> String {
    if cycles.len() == 1 {
        return cycles[0].clone();
    }
    cycles
        .iter()
        .enumerate()
        .map(|(i, c)| format!("({}) {}", i + 1, c))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Trait for errors that provide fix suggestions
pub trait FixSuggestion {
    fn fix_suggestion(&self) -> Option<&str>;
}

/// All error variants are part of the public API.
///
/// Implements both `thiserror::Error` for std error compatibility
/// and `miette::Diagnostic` for fancy terminal error display.
#[derive(Error, Debug, Diagnostic)]
#[diagnostic(url(docsrs))]
pub enum StratusError {
    // ═══════════════════════════════════════════
    // CONFIG ERRORS (000-009)
    // ═══════════════════════════════════════════
    #[error("[STRA-001] Failed to parse config: {details}")]
    #[diagnostic(
        code(stratus::config_parse),
        help("Check YAML syntax: indentation and quoting")
    )]
    ConfigParse { details: String },

    #[error("[STRA-002] Config file not found: {path}")]
    #[diagnostic(code(stratus::config_not_found), help("Check the file path exists"))]
    ConfigNotFound { path: String },

    #[error("[STRA-003] Missing required config key: {key}")]
    MissingConfigKey { key: String },

    #[error("[STRA-004] Invalid environment file: {details}")]
    #[diagnostic(
        code(stratus::env_file),
        help("Use 'key: value' lines or a YAML mapping")
    )]
    EnvFileInvalid { details: String },

    #[error("[STRA-005] Undefined environment variable '{name}' referenced by the config")]
    #[diagnostic(
        code(stratus::undefined_env_ref),
        help("Define the variable in the environment file or with -e KEY=VALUE")
    )]
    UndefinedEnvRef { name: String },

    // ═══════════════════════════════════════════
    // STACK DEFINITION ERRORS (010-019)
    // ═══════════════════════════════════════════
    #[error("[STRA-010] Duplicate stack name '{name}'")]
    DuplicateStack { name: String },

    #[error("[STRA-011] Stack '{name}' needs exactly one of blueprint/template_path")]
    #[diagnostic(
        code(stratus::stack_source),
        help("Set blueprint OR template_path (locked/external stacks may omit both)")
    )]
    StackSourceConflict { name: String },

    #[error("[STRA-012] Stacks '{a}' and '{b}' share stack_name '{stack_name}' with an empty namespace")]
    FqnCollision {
        a: String,
        b: String,
        stack_name: String,
    },

    #[error("[STRA-013] Unknown key '{key}' in stack '{name}'")]
    UnknownStackKey { key: String, name: String },

    #[error("[STRA-014] Stack '{name}' requires unknown stack '{dep}'")]
    UnknownRequires { name: String, dep: String },

    // ═══════════════════════════════════════════
    // GRAPH ERRORS (020-029)
    // ═══════════════════════════════════════════
    #[error("[STRA-020] Circular dependency: {}", format_cycles(.cycles))]
    #[diagnostic(
        code(stratus::circular_dependency),
        help("Break the cycle by removing a requires entry or an output reference")
    )]
    CircularDependency { cycles: Vec<String> },

    #[error("[STRA-021] Duplicate edge {from} -> {to}")]
    DuplicateEdge { from: String, to: String },

    #[error("[STRA-022] Self edge on '{node}'")]
    SelfEdge { node: String },

    #[error("[STRA-023] Unknown graph node '{node}'")]
    UnknownNode { node: String },

    // ═══════════════════════════════════════════
    // LOOKUP ERRORS (030-039)
    // ═══════════════════════════════════════════
    #[error("[STRA-030] Unknown lookup type '{kind}'")]
    #[diagnostic(
        code(stratus::unknown_lookup),
        help("Register custom lookups under the top-level 'lookups' key")
    )]
    UnknownLookup { kind: String },

    #[error("[STRA-031] Malformed lookup expression '{expr}': {reason}")]
    MalformedLookup { expr: String, reason: String },

    #[error("[STRA-032] Output '{output}' of stack '{stack}' is not available")]
    UnresolvedOutput { stack: String, output: String },

    #[error("[STRA-033] Lookup '{kind} {arg}' failed: {reason}")]
    LookupFailed {
        kind: String,
        arg: String,
        reason: String,
    },

    #[error("[STRA-034] Environment variable '{name}' is not set")]
    MissingEnvVar { name: String },

    #[error("[STRA-035] Unknown file codec '{codec}'")]
    #[diagnostic(
        code(stratus::unknown_codec),
        help("Use plain, base64, json, yaml, or a parameterized variant")
    )]
    UnknownCodec { codec: String },

    // ═══════════════════════════════════════════
    // VARIABLE BINDING ERRORS (040-049)
    // ═══════════════════════════════════════════
    #[error("[STRA-040] Missing variable '{name}' for stack '{stack}'")]
    MissingVariable { name: String, stack: String },

    #[error("[STRA-041] Variable '{name}' failed validation: {reason}")]
    VariableValidation { name: String, reason: String },

    #[error("[STRA-042] Unknown variable '{name}' supplied to stack '{stack}'")]
    #[diagnostic(
        code(stratus::unknown_variable),
        help("The blueprint does not declare this variable; remove it or fix the name")
    )]
    UnknownVariable { name: String, stack: String },

    #[error("[STRA-043] Variable '{name}' type mismatch: expected {expected}, got {actual}")]
    VariableType {
        name: String,
        expected: String,
        actual: String,
    },

    // ═══════════════════════════════════════════
    // BLUEPRINT / TEMPLATE ERRORS (050-059)
    // ═══════════════════════════════════════════
    #[error("[STRA-050] Blueprint '{name}' failed to render: {reason}")]
    BlueprintRender { name: String, reason: String },

    #[error("[STRA-051] Template not found: {path}")]
    TemplateNotFound { path: String },

    #[error("[STRA-052] Unresolved template placeholder '{placeholder}' in {path}")]
    TemplatePlaceholder { placeholder: String, path: String },

    // ═══════════════════════════════════════════
    // PLANNER ERRORS (060-069)
    // ═══════════════════════════════════════════
    #[error("[STRA-060] No stacks selected (check --stacks and enabled flags)")]
    EmptyPlan,

    #[error("[STRA-061] --stacks selects unknown stack '{name}'")]
    UnknownSelection { name: String },

    // ═══════════════════════════════════════════
    // PROVIDER ERRORS (070-079)
    // ═══════════════════════════════════════════
    #[error("[STRA-070] No updates to perform on stack '{fqn}'")]
    NoUpdates { fqn: String },

    #[error("[STRA-071] Throttled by the control plane: {reason}")]
    Throttled { reason: String },

    #[error("[STRA-072] Stack '{fqn}' rolled back: {reason}")]
    StackRolledBack { fqn: String, reason: String },

    #[error("[STRA-073] Stack '{fqn}' does not exist")]
    StackDeleted { fqn: String },

    #[error("[STRA-074] Template validation failed for '{fqn}': {reason}")]
    ProviderValidation { fqn: String, reason: String },

    #[error("[STRA-075] Operation on stack '{fqn}' timed out after {seconds}s")]
    OperationTimedOut { fqn: String, seconds: u64 },

    #[error("[STRA-076] Permission denied: {reason}")]
    PermissionDenied { reason: String },

    #[error("[STRA-077] Provider '{name}' is not registered")]
    #[diagnostic(
        code(stratus::unknown_provider),
        help("Built-in adapters: memory. External adapters register at startup.")
    )]
    UnknownProvider { name: String },

    #[error("[STRA-078] Provider does not support {facility}")]
    UnsupportedFacility { facility: String },

    // ═══════════════════════════════════════════
    // EXECUTOR ERRORS (080-089)
    // ═══════════════════════════════════════════
    #[error("[STRA-080] Step '{step_id}' failed: {reason}")]
    StepFailed { step_id: String, reason: String },

    #[error("[STRA-081] Run canceled")]
    Canceled,

    #[error("[STRA-082] Stack '{fqn}' has an operation in progress")]
    #[diagnostic(
        code(stratus::stack_in_progress),
        help("Set in_progress_behavior: wait to block until it settles")
    )]
    StackInProgress { fqn: String },

    #[error("[STRA-083] Retries exhausted after {attempts} attempts: {last_error}")]
    RetryExhausted { attempts: u32, last_error: String },

    // ═══════════════════════════════════════════
    // HOOK ERRORS (090-099)
    // ═══════════════════════════════════════════
    #[error("[STRA-090] Required hook '{name}' failed: {reason}")]
    HookFailed { name: String, reason: String },

    #[error("[STRA-091] Unknown hook handler '{path}'")]
    UnknownHook { path: String },

    // ═══════════════════════════════════════════
    // PERSISTENT GRAPH / STORE ERRORS (100-109)
    // ═══════════════════════════════════════════
    #[error("[STRA-100] Persistent graph lock for '{key}' is held by another run")]
    GraphLockHeld { key: String },

    #[error("[STRA-101] Persistent graph object at '{key}' is invalid: {reason}")]
    GraphObjectInvalid { key: String, reason: String },

    #[error("[STRA-102] Store operation failed: {reason}")]
    StoreFailed { reason: String },

    #[error("[STRA-103] Stale lock token for '{key}'")]
    StaleLockToken { key: String },

    // ═══════════════════════════════════════════
    // IO / SERDE PASSTHROUGH (110-119)
    // ═══════════════════════════════════════════
    #[error("[STRA-110] IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("[STRA-111] JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("[STRA-112] YAML parse error: {0}")]
    #[diagnostic(
        code(stratus::yaml_parse),
        help("Check YAML syntax: indentation must be consistent, strings with special chars need quoting")
    )]
    Yaml(#[from] serde_yaml::Error),
}

impl StratusError {
    /// Get the error code (e.g., "STRA-020")
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConfigParse { .. } => "STRA-001",
            Self::ConfigNotFound { .. } => "STRA-002",
            Self::MissingConfigKey { .. } => "STRA-003",
            Self::EnvFileInvalid { .. } => "STRA-004",
            Self::UndefinedEnvRef { .. } => "STRA-005",
            Self::DuplicateStack { .. } => "STRA-010",
            Self::StackSourceConflict { .. } => "STRA-011",
            Self::FqnCollision { .. } => "STRA-012",
            Self::UnknownStackKey { .. } => "STRA-013",
            Self::UnknownRequires { .. } => "STRA-014",
            Self::CircularDependency { .. } => "STRA-020",
            Self::DuplicateEdge { .. } => "STRA-021",
            Self::SelfEdge { .. } => "STRA-022",
            Self::UnknownNode { .. } => "STRA-023",
            Self::UnknownLookup { .. } => "STRA-030",
            Self::MalformedLookup { .. } => "STRA-031",
            Self::UnresolvedOutput { .. } => "STRA-032",
            Self::LookupFailed { .. } => "STRA-033",
            Self::MissingEnvVar { .. } => "STRA-034",
            Self::UnknownCodec { .. } => "STRA-035",
            Self::MissingVariable { .. } => "STRA-040",
            Self::VariableValidation { .. } => "STRA-041",
            Self::UnknownVariable { .. } => "STRA-042",
            Self::VariableType { .. } => "STRA-043",
            Self::BlueprintRender { .. } => "STRA-050",
            Self::TemplateNotFound { .. } => "STRA-051",
            Self::TemplatePlaceholder { .. } => "STRA-052",
            Self::EmptyPlan => "STRA-060",
            Self::UnknownSelection { .. } => "STRA-061",
            Self::NoUpdates { .. } => "STRA-070",
            Self::Throttled { .. } => "STRA-071",
            Self::StackRolledBack { .. } => "STRA-072",
            Self::StackDeleted { .. } => "STRA-073",
            Self::ProviderValidation { .. } => "STRA-074",
            Self::OperationTimedOut { .. } => "STRA-075",
            Self::PermissionDenied { .. } => "STRA-076",
            Self::UnknownProvider { .. } => "STRA-077",
            Self::UnsupportedFacility { .. } => "STRA-078",
            Self::StepFailed { .. } => "STRA-080",
            Self::Canceled => "STRA-081",
            Self::StackInProgress { .. } => "STRA-082",
            Self::RetryExhausted { .. } => "STRA-083",
            Self::HookFailed { .. } => "STRA-090",
            Self::UnknownHook { .. } => "STRA-091",
            Self::GraphLockHeld { .. } => "STRA-100",
            Self::GraphObjectInvalid { .. } => "STRA-101",
            Self::StoreFailed { .. } => "STRA-102",
            Self::StaleLockToken { .. } => "STRA-103",
            Self::Io(_) => "STRA-110",
            Self::Json(_) => "STRA-111",
            Self::Yaml(_) => "STRA-112",
        }
    }

    /// Check if error is recoverable (can be retried)
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Throttled { .. })
    }

    /// Config-shaped errors exit with code 2 at the CLI boundary
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::ConfigParse { .. }
                | Self::ConfigNotFound { .. }
                | Self::MissingConfigKey { .. }
                | Self::EnvFileInvalid { .. }
                | Self::UndefinedEnvRef { .. }
                | Self::DuplicateStack { .. }
                | Self::StackSourceConflict { .. }
                | Self::FqnCollision { .. }
                | Self::UnknownStackKey { .. }
                | Self::UnknownRequires { .. }
                | Self::CircularDependency { .. }
                | Self::UnknownSelection { .. }
                | Self::Yaml(_)
        )
    }
}

impl FixSuggestion for StratusError {
    fn fix_suggestion(&self) -> Option<&str> {
        match self {
            StratusError::ConfigParse { .. } | StratusError::Yaml(_) => {
                Some("Check YAML syntax: indentation and quoting")
            }
            StratusError::ConfigNotFound { .. } => Some("Check the file path exists"),
            StratusError::EnvFileInvalid { .. } => {
                Some("Use 'key: value' lines or a YAML mapping")
            }
            StratusError::UndefinedEnvRef { .. } => {
                Some("Define the variable in the environment file or with -e KEY=VALUE")
            }
            StratusError::DuplicateStack { .. } => Some("Stack names must be unique"),
            StratusError::StackSourceConflict { .. } => {
                Some("Set blueprint OR template_path, not both")
            }
            StratusError::FqnCollision { .. } => {
                Some("Set a namespace, or give the stacks distinct stack_name values")
            }
            StratusError::UnknownRequires { .. } => {
                Some("requires entries must name stacks defined in the config")
            }
            StratusError::CircularDependency { .. } => {
                Some("Break the cycle by removing a requires entry or an output reference")
            }
            StratusError::UnknownLookup { .. } => {
                Some("Register custom lookups under the top-level 'lookups' key")
            }
            StratusError::UnresolvedOutput { .. } => {
                Some("The producing stack must deploy successfully before this one")
            }
            StratusError::MissingEnvVar { .. } => Some("Export the variable before running"),
            StratusError::UnknownCodec { .. } => {
                Some("Use plain, base64, json, yaml, or a parameterized variant")
            }
            StratusError::MissingVariable { .. } => {
                Some("Supply the variable in the stack's variables mapping")
            }
            StratusError::UnknownVariable { .. } => {
                Some("The blueprint does not declare this variable")
            }
            StratusError::TemplateNotFound { .. } => {
                Some("template_path is resolved relative to the config file")
            }
            StratusError::UnknownSelection { .. } => {
                Some("--stacks takes logical names from the config")
            }
            StratusError::Throttled { .. } => {
                Some("The control plane is rate limiting; the run retries automatically")
            }
            StratusError::StackInProgress { .. } => {
                Some("Set in_progress_behavior: wait to block until it settles")
            }
            StratusError::PermissionDenied { .. } => {
                Some("Check the active profile's permissions and the service_role")
            }
            StratusError::UnknownProvider { .. } => {
                Some("Built-in adapters: memory. External adapters register at startup.")
            }
            StratusError::GraphLockHeld { .. } => {
                Some("Another run holds the lock; wait for it or for the TTL to expire")
            }
            StratusError::UnknownHook { .. } => {
                Some("Hook paths must match a registered handler (e.g. shell)")
            }
            StratusError::Io(_) => Some("Check file path and permissions"),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_extraction() {
        let err = StratusError::Throttled {
            reason: "rate exceeded".to_string(),
        };
        assert_eq!(err.code(), "STRA-071");
    }

    #[test]
    fn error_display_includes_code() {
        let err = StratusError::StepFailed {
            step_id: "vpc".to_string(),
            reason: "rolled back".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("[STRA-080]"));
        assert!(msg.contains("vpc"));
    }

    #[test]
    fn only_throttle_is_recoverable() {
        assert!(StratusError::Throttled {
            reason: "x".into()
        }
        .is_recoverable());
        assert!(!StratusError::ProviderValidation {
            fqn: "x".into(),
            reason: "y".into()
        }
        .is_recoverable());
        assert!(!StratusError::PermissionDenied { reason: "y".into() }.is_recoverable());
    }

    #[test]
    fn config_errors_classified() {
        assert!(StratusError::DuplicateStack { name: "a".into() }.is_config_error());
        assert!(StratusError::CircularDependency {
            cycles: vec!["a -> b -> a".into()]
        }
        .is_config_error());
        assert!(!StratusError::StepFailed {
            step_id: "a".into(),
            reason: "b".into()
        }
        .is_config_error());
    }

    #[test]
    fn cycles_formatted_with_indexes() {
        let err = StratusError::CircularDependency {
            cycles: vec!["a -> b -> a".into(), "c -> c".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("(1) a -> b -> a"));
        assert!(msg.contains("(2) c -> c"));
    }
}
