//! Blueprint capability - template producers
//!
//! A blueprint turns bound variables into a template body. The interesting
//! implementations live outside this crate (loaded by name into a
//! [`BlueprintRegistry`] at startup); in-tree there are two: raw
//! `template_path` files and programmatic static bodies for tests and
//! embedded tooling.

use std::path::PathBuf;
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::context::Context;
use crate::error::{Result, StratusError};
use crate::provider::TemplateKind;
use crate::variables::{BoundVariables, VariableSchema};

/// A template producer.
pub trait Blueprint: Send + Sync {
    fn name(&self) -> &str;

    /// Variables this blueprint declares. Empty means permissive binding:
    /// every supplied value passes through as a string cloud parameter.
    fn variable_schema(&self) -> VariableSchema;

    /// Produce the template body and its flavor.
    fn render(&self, context: &Context, vars: &BoundVariables) -> Result<(Vec<u8>, TemplateKind)>;

    /// Cloud-side name for a stack built from this blueprint.
    fn fqn(&self, context: &Context, stack_name: &str) -> String {
        context.fqn(stack_name)
    }
}

/// A raw template file referenced by `template_path`.
///
/// `{{ name }}` occurrences of bound variables are substituted into the
/// body; unknown placeholders pass through untouched (templates may carry
/// their own moustache-style syntax for other tools).
pub struct RawTemplateBlueprint {
    name: String,
    path: PathBuf,
    kind: TemplateKind,
}

impl RawTemplateBlueprint {
    /// `path` is resolved relative to the config directory at render time.
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let kind = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => TemplateKind::Json,
            _ => TemplateKind::Yaml,
        };
        Self {
            name: name.into(),
            path,
            kind,
        }
    }
}

impl Blueprint for RawTemplateBlueprint {
    fn name(&self) -> &str {
        &self.name
    }

    fn variable_schema(&self) -> VariableSchema {
        VariableSchema::new()
    }

    fn render(&self, context: &Context, vars: &BoundVariables) -> Result<(Vec<u8>, TemplateKind)> {
        let full = if self.path.is_absolute() {
            self.path.clone()
        } else {
            context.config_dir.join(&self.path)
        };
        let body = std::fs::read_to_string(&full).map_err(|_| StratusError::TemplateNotFound {
            path: full.display().to_string(),
        })?;
        Ok((substitute(&body, vars).into_bytes(), self.kind))
    }
}

/// Substitute `{{ name }}` for every bound variable.
fn substitute(body: &str, vars: &BoundVariables) -> String {
    let mut out = body.to_string();
    for (name, value) in &vars.native {
        let needle_spaced = format!("{{{{ {} }}}}", name);
        let needle_tight = format!("{{{{{}}}}}", name);
        let replacement = crate::lookup::coerce_to_string(value);
        out = out.replace(&needle_spaced, &replacement);
        out = out.replace(&needle_tight, &replacement);
    }
    for (name, parameter) in &vars.parameters {
        let needle_spaced = format!("{{{{ {} }}}}", name);
        let needle_tight = format!("{{{{{}}}}}", name);
        out = out.replace(&needle_spaced, &parameter.value);
        out = out.replace(&needle_tight, &parameter.value);
    }
    out
}

/// A fixed-body blueprint with an explicit schema. The test suite and
/// embedded tools build stacks from these.
pub struct StaticBlueprint {
    name: String,
    body: Vec<u8>,
    kind: TemplateKind,
    schema: VariableSchema,
}

impl StaticBlueprint {
    pub fn new(name: impl Into<String>, body: impl Into<Vec<u8>>, kind: TemplateKind) -> Self {
        Self {
            name: name.into(),
            body: body.into(),
            kind,
            schema: VariableSchema::new(),
        }
    }

    pub fn with_schema(mut self, schema: VariableSchema) -> Self {
        self.schema = schema;
        self
    }
}

impl Blueprint for StaticBlueprint {
    fn name(&self) -> &str {
        &self.name
    }

    fn variable_schema(&self) -> VariableSchema {
        self.schema.clone()
    }

    fn render(&self, _context: &Context, _vars: &BoundVariables) -> Result<(Vec<u8>, TemplateKind)> {
        Ok((self.body.clone(), self.kind))
    }
}

/// Named blueprint table. The config's blueprint strings resolve here; an
/// external loader fills the registry before planning.
#[derive(Default)]
pub struct BlueprintRegistry {
    blueprints: FxHashMap<String, Arc<dyn Blueprint>>,
}

impl BlueprintRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, blueprint: Arc<dyn Blueprint>) {
        self.blueprints.insert(name.into(), blueprint);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Blueprint>> {
        self.blueprints
            .get(name)
            .cloned()
            .ok_or_else(|| StratusError::BlueprintRender {
                name: name.into(),
                reason: "blueprint is not registered".into(),
            })
    }
}
