//! Value resolution - `${type arg}` expressions
//!
//! A raw config value (scalar, list, or map) is resolved into a concrete
//! value by dispatching each `${type arg}` expression to a named handler.
//! Expressions nest: the outer lookup sees the inner's resolved text. A
//! value that is exactly one expression keeps the handler's native payload;
//! anything mixed with literal text string-interpolates.
//!
//! Resolution runs in two modes. In plan mode an `output` reference is not
//! resolved - the producing stack is recorded as a dependency and the
//! planner turns it into a graph edge. In execute mode the same reference
//! reads the outputs published by the completed producer.

pub mod handlers;

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value;

use crate::context::Context;
use crate::error::{Result, StratusError};
use crate::provider::Provider;

/// Lookup type names: `[A-Za-z_][A-Za-z0-9_-]*`
fn is_type_token(token: &str) -> bool {
    let mut chars = token.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// One parsed piece of a string value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Literal(String),
    Expression { kind: String, arg: String },
}

/// Split a raw string into literal and expression segments.
///
/// The expression body runs to the matching close brace (brace-balanced,
/// so nested `${...}` survive into `arg`). A body with no leading type
/// token is the legacy output form: `${vpc::Id}` == `${output vpc::Id}`.
pub fn parse_segments(input: &str) -> Result<Vec<Segment>> {
    let bytes = input.as_bytes();
    let mut segments = Vec::new();
    let mut literal_start = 0;
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'$' && i + 1 < bytes.len() && bytes[i + 1] == b'{' {
            let mut depth = 1;
            let body_start = i + 2;
            let mut j = body_start;
            while j < bytes.len() && depth > 0 {
                match bytes[j] {
                    b'{' => depth += 1,
                    b'}' => depth -= 1,
                    _ => {}
                }
                j += 1;
            }
            if depth != 0 {
                return Err(StratusError::MalformedLookup {
                    expr: input[i..].to_string(),
                    reason: "unbalanced braces".into(),
                });
            }
            if literal_start < i {
                segments.push(Segment::Literal(input[literal_start..i].to_string()));
            }
            let body = input[body_start..j - 1].trim();
            if body.is_empty() {
                return Err(StratusError::MalformedLookup {
                    expr: input[i..j].to_string(),
                    reason: "empty expression".into(),
                });
            }
            let (kind, arg) = match body.split_once(char::is_whitespace) {
                Some((head, rest)) if is_type_token(head) => {
                    (head.to_string(), rest.trim_start().to_string())
                }
                // No type token: the whole body is an output reference
                _ => ("output".to_string(), body.to_string()),
            };
            segments.push(Segment::Expression { kind, arg });
            literal_start = j;
            i = j;
        } else {
            i += 1;
        }
    }
    if literal_start < input.len() {
        segments.push(Segment::Literal(input[literal_start..].to_string()));
    }
    Ok(segments)
}

/// Resolution phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveMode {
    /// Record output references as dependencies; defer lookups that need them
    Plan,
    /// Read published outputs; every failure is a step failure
    Execute,
}

/// Everything a handler may consult.
pub struct ResolveCtx<'a> {
    pub context: &'a Context,
    pub provider: Option<&'a Arc<dyn Provider>>,
    pub mode: ResolveMode,
    /// Producers discovered through output references (plan mode)
    deps: Mutex<FxHashSet<String>>,
}

impl<'a> ResolveCtx<'a> {
    pub fn new(
        context: &'a Context,
        provider: Option<&'a Arc<dyn Provider>>,
        mode: ResolveMode,
    ) -> Self {
        Self {
            context,
            provider,
            mode,
            deps: Mutex::new(FxHashSet::default()),
        }
    }

    pub fn record_dep(&self, producer: impl Into<String>) {
        self.deps.lock().insert(producer.into());
    }

    pub fn deps(&self) -> FxHashSet<String> {
        self.deps.lock().clone()
    }

    fn dep_count(&self) -> usize {
        self.deps.lock().len()
    }

    pub fn provider(&self) -> Result<&'a Arc<dyn Provider>> {
        self.provider.ok_or_else(|| StratusError::UnsupportedFacility {
            facility: "provider-backed lookup".into(),
        })
    }
}

/// A named lookup handler.
#[async_trait]
pub trait LookupHandler: Send + Sync {
    async fn resolve(&self, arg: &str, ctx: &ResolveCtx<'_>) -> Result<Value>;
}

/// Capability table of lookup handlers, keyed by type name.
pub struct LookupRegistry {
    handlers: FxHashMap<String, Arc<dyn LookupHandler>>,
}

impl LookupRegistry {
    pub fn empty() -> Self {
        Self {
            handlers: FxHashMap::default(),
        }
    }

    /// Registry with every built-in handler.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        handlers::register_builtins(&mut registry);
        registry
    }

    pub fn register(&mut self, kind: impl Into<String>, handler: Arc<dyn LookupHandler>) {
        self.handlers.insert(kind.into(), handler);
    }

    pub fn get(&self, kind: &str) -> Result<&Arc<dyn LookupHandler>> {
        self.handlers
            .get(kind)
            .ok_or_else(|| StratusError::UnknownLookup { kind: kind.into() })
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.handlers.contains_key(kind)
    }

    // ── Resolution ─────────────────────────────────────────────────

    /// Resolve a raw value tree (scalars, lists, maps - recursively).
    pub async fn resolve_value(&self, value: &Value, ctx: &ResolveCtx<'_>) -> Result<Value> {
        match value {
            Value::String(s) => self.resolve_string(s, ctx).await,
            Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(Box::pin(self.resolve_value(item, ctx)).await?);
                }
                Ok(Value::Array(out))
            }
            Value::Object(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k.clone(), Box::pin(self.resolve_value(v, ctx)).await?);
                }
                Ok(Value::Object(out))
            }
            other => Ok(other.clone()),
        }
    }

    /// Resolve a string value. A single whole-string expression keeps the
    /// handler's native payload; otherwise every payload is coerced to a
    /// string and concatenated with the literals.
    pub async fn resolve_string(&self, input: &str, ctx: &ResolveCtx<'_>) -> Result<Value> {
        let segments = parse_segments(input)?;
        if !segments
            .iter()
            .any(|s| matches!(s, Segment::Expression { .. }))
        {
            return Ok(Value::String(input.to_string()));
        }

        if let [Segment::Expression { kind, arg }] = segments.as_slice() {
            return self.resolve_expression(kind, arg, ctx).await;
        }

        let mut out = String::with_capacity(input.len());
        for segment in &segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Expression { kind, arg } => {
                    let payload = self.resolve_expression(kind, arg, ctx).await?;
                    out.push_str(&coerce_to_string(&payload));
                }
            }
        }
        Ok(Value::String(out))
    }

    /// Resolve one expression: nested expressions in the arg first, then
    /// the handler. In plan mode a handler whose arg needed a not-yet-built
    /// output is deferred (the dependency is already recorded).
    async fn resolve_expression(
        &self,
        kind: &str,
        arg: &str,
        ctx: &ResolveCtx<'_>,
    ) -> Result<Value> {
        let deps_before = ctx.dep_count();
        let arg = if arg.contains("${") {
            match Box::pin(self.resolve_string(arg, ctx)).await? {
                Value::String(s) => s,
                other => coerce_to_string(&other),
            }
        } else {
            arg.to_string()
        };

        if ctx.mode == ResolveMode::Plan && ctx.dep_count() > deps_before {
            // The inner reference is not built yet; this lookup runs at
            // execution time with the real value.
            return Ok(Value::Null);
        }

        self.get(kind)?.resolve(&arg, ctx).await
    }
}

/// String form of a payload for interpolation.
pub fn coerce_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expr(kind: &str, arg: &str) -> Segment {
        Segment::Expression {
            kind: kind.into(),
            arg: arg.into(),
        }
    }

    // ═══════════════════════════════════════════════════════════════
    // PARSER
    // ═══════════════════════════════════════════════════════════════

    #[test]
    fn plain_string_is_one_literal() {
        let segments = parse_segments("no lookups here").unwrap();
        assert_eq!(segments, vec![Segment::Literal("no lookups here".into())]);
    }

    #[test]
    fn single_expression() {
        let segments = parse_segments("${output vpc::Id}").unwrap();
        assert_eq!(segments, vec![expr("output", "vpc::Id")]);
    }

    #[test]
    fn legacy_form_defaults_to_output() {
        let segments = parse_segments("${vpc::Id}").unwrap();
        assert_eq!(segments, vec![expr("output", "vpc::Id")]);
    }

    #[test]
    fn mixed_literals_and_expressions() {
        let segments = parse_segments("prefix-${envvar STAGE}-suffix").unwrap();
        assert_eq!(
            segments,
            vec![
                Segment::Literal("prefix-".into()),
                expr("envvar", "STAGE"),
                Segment::Literal("-suffix".into()),
            ]
        );
    }

    #[test]
    fn nested_braces_stay_in_arg() {
        let segments = parse_segments("${default ${envvar STAGE}::dev}").unwrap();
        assert_eq!(segments, vec![expr("default", "${envvar STAGE}::dev")]);
    }

    #[test]
    fn unbalanced_braces_error() {
        let err = parse_segments("${output vpc::Id").unwrap_err();
        assert!(err.to_string().contains("STRA-031"));
    }

    #[test]
    fn empty_expression_errors() {
        assert!(parse_segments("${}").is_err());
        assert!(parse_segments("${   }").is_err());
    }

    #[test]
    fn type_token_charset() {
        assert!(is_type_token("output"));
        assert!(is_type_token("hook_data"));
        assert!(is_type_token("json-parameterized"));
        assert!(is_type_token("_x"));
        assert!(!is_type_token("9lives"));
        assert!(!is_type_token("a:b"));
        assert!(!is_type_token(""));
    }

    #[test]
    fn type_token_wins_when_body_has_whitespace() {
        let segments = parse_segments("${split ,::a,b}").unwrap();
        assert_eq!(segments, vec![expr("split", ",::a,b")]);
    }

    // ═══════════════════════════════════════════════════════════════
    // STRING COERCION
    // ═══════════════════════════════════════════════════════════════

    #[test]
    fn coercion_forms() {
        assert_eq!(coerce_to_string(&Value::String("x".into())), "x");
        assert_eq!(coerce_to_string(&Value::Bool(true)), "true");
        assert_eq!(coerce_to_string(&serde_json::json!(7)), "7");
        assert_eq!(coerce_to_string(&Value::Null), "");
        assert_eq!(coerce_to_string(&serde_json::json!(["a"])), "[\"a\"]");
    }

    // ═══════════════════════════════════════════════════════════════
    // REGISTRY DISPATCH (mode behavior is covered in handlers tests)
    // ═══════════════════════════════════════════════════════════════

    #[tokio::test]
    async fn unknown_lookup_type_errors() {
        let registry = LookupRegistry::builtin();
        let context = Context::new("ns", "-");
        let ctx = ResolveCtx::new(&context, None, ResolveMode::Execute);
        let err = registry
            .resolve_string("${bogus thing}", &ctx)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("STRA-030"));
    }

    #[tokio::test]
    async fn plan_mode_records_dep_and_defers() {
        let registry = LookupRegistry::builtin();
        let context = Context::new("ns", "-");
        let ctx = ResolveCtx::new(&context, None, ResolveMode::Plan);

        let value = registry
            .resolve_string("${output vpc::Id}", &ctx)
            .await
            .unwrap();
        assert_eq!(value, Value::Null);
        assert!(ctx.deps().contains("vpc"));
    }

    #[tokio::test]
    async fn plan_mode_defers_outer_lookup_over_output() {
        let registry = LookupRegistry::builtin();
        let context = Context::new("ns", "-");
        let ctx = ResolveCtx::new(&context, None, ResolveMode::Plan);

        // split would fail on a Null payload; deferral must skip it
        let value = registry
            .resolve_string("${split ,::${output vpc::Subnets}}", &ctx)
            .await
            .unwrap();
        assert_eq!(value, Value::Null);
        assert!(ctx.deps().contains("vpc"));
    }

    #[tokio::test]
    async fn execute_mode_reads_published_outputs() {
        let registry = LookupRegistry::builtin();
        let context = Context::new("ns", "-");
        let mut outputs = std::collections::BTreeMap::new();
        outputs.insert("Id".to_string(), "vpc-1".to_string());
        context.publish_outputs("vpc", outputs);

        let ctx = ResolveCtx::new(&context, None, ResolveMode::Execute);
        let value = registry
            .resolve_string("${output vpc::Id}", &ctx)
            .await
            .unwrap();
        assert_eq!(value, Value::String("vpc-1".into()));
    }

    #[tokio::test]
    async fn interpolation_concatenates() {
        let registry = LookupRegistry::builtin();
        let context = Context::new("ns", "-");
        let mut outputs = std::collections::BTreeMap::new();
        outputs.insert("Id".to_string(), "vpc-1".to_string());
        context.publish_outputs("vpc", outputs);

        let ctx = ResolveCtx::new(&context, None, ResolveMode::Execute);
        let value = registry
            .resolve_string("id=${output vpc::Id}!", &ctx)
            .await
            .unwrap();
        assert_eq!(value, Value::String("id=vpc-1!".into()));
    }

    #[tokio::test]
    async fn list_and_map_values_recurse() {
        let registry = LookupRegistry::builtin();
        let context = Context::new("ns", "-");
        let mut outputs = std::collections::BTreeMap::new();
        outputs.insert("Id".to_string(), "vpc-1".to_string());
        context.publish_outputs("vpc", outputs);

        let ctx = ResolveCtx::new(&context, None, ResolveMode::Execute);
        let raw = serde_json::json!({
            "ids": ["${output vpc::Id}", "static"],
            "nested": {"vpc": "${output vpc::Id}"}
        });
        let resolved = registry.resolve_value(&raw, &ctx).await.unwrap();
        assert_eq!(resolved["ids"][0], "vpc-1");
        assert_eq!(resolved["ids"][1], "static");
        assert_eq!(resolved["nested"]["vpc"], "vpc-1");
    }
}
