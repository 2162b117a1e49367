//! Variable binding - schema validation and parameter partitioning
//!
//! A blueprint declares its variables; the binder matches resolved config
//! values against that schema, applies defaults and constraints, and splits
//! the result into native variables (fed back into blueprint logic, fully
//! typed) and cloud parameters (forwarded to the control plane as strings,
//! with no_echo carried through).
//!
//! Coercion rules for cloud parameters: booleans become "true"/"false",
//! lists join with "," (comma-delimited list semantics), numbers and maps
//! take their canonical string forms.

use std::collections::BTreeMap;
use std::sync::Arc;

use regex::Regex;
use serde_json::Value;

use crate::error::{Result, StratusError};
use crate::provider::Parameter;

/// Declared type of a variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarKind {
    Str,
    Number,
    Bool,
    List,
    Map,
    /// Accepts anything (raw pass-through blueprints)
    Any,
}

impl VarKind {
    fn name(self) -> &'static str {
        match self {
            Self::Str => "string",
            Self::Number => "number",
            Self::Bool => "bool",
            Self::List => "list",
            Self::Map => "map",
            Self::Any => "any",
        }
    }
}

/// Custom validation callback.
pub type Validator = Arc<dyn Fn(&Value) -> std::result::Result<(), String> + Send + Sync>;

/// One declared variable.
#[derive(Clone, Default)]
pub struct VariableDef {
    pub kind: Option<VarKind>,
    pub default: Option<Value>,
    pub description: Option<String>,
    pub allowed_values: Option<Vec<Value>>,
    pub allowed_pattern: Option<String>,
    pub min_length: Option<usize>,
    pub max_length: Option<usize>,
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
    pub no_echo: bool,
    /// Forwarded to the control plane as a template parameter
    pub cloud_parameter: bool,
    pub validator: Option<Validator>,
}

impl std::fmt::Debug for VariableDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VariableDef")
            .field("kind", &self.kind)
            .field("default", &self.default)
            .field("cloud_parameter", &self.cloud_parameter)
            .field("no_echo", &self.no_echo)
            .finish_non_exhaustive()
    }
}

impl VariableDef {
    pub fn typed(kind: VarKind) -> Self {
        Self {
            kind: Some(kind),
            ..Self::default()
        }
    }

    pub fn parameter(kind: VarKind) -> Self {
        Self {
            kind: Some(kind),
            cloud_parameter: true,
            ..Self::default()
        }
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    pub fn with_allowed_values(mut self, values: Vec<Value>) -> Self {
        self.allowed_values = Some(values);
        self
    }

    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.allowed_pattern = Some(pattern.into());
        self
    }

    pub fn no_echo(mut self) -> Self {
        self.no_echo = true;
        self
    }

    pub fn with_validator(mut self, validator: Validator) -> Self {
        self.validator = Some(validator);
        self
    }
}

/// Blueprint-declared variable schema, name -> definition.
pub type VariableSchema = BTreeMap<String, VariableDef>;

/// Outcome of a bind: native values keep their types, cloud parameters are
/// string-coerced and carry no_echo.
#[derive(Debug, Clone, Default)]
pub struct BoundVariables {
    pub native: BTreeMap<String, Value>,
    pub parameters: BTreeMap<String, Parameter>,
}

impl BoundVariables {
    /// Value of a variable regardless of family (native first).
    pub fn get(&self, name: &str) -> Option<Value> {
        self.native.get(name).cloned().or_else(|| {
            self.parameters
                .get(name)
                .map(|p| Value::String(p.value.clone()))
        })
    }
}

/// Bind resolved values against a schema. Unknown inputs are rejected.
pub fn bind(
    schema: &VariableSchema,
    inputs: &BTreeMap<String, Value>,
    stack: &str,
) -> Result<BoundVariables> {
    for name in inputs.keys() {
        if !schema.contains_key(name) {
            return Err(StratusError::UnknownVariable {
                name: name.clone(),
                stack: stack.into(),
            });
        }
    }

    let mut bound = BoundVariables::default();
    for (name, def) in schema {
        let value = match inputs.get(name).or(def.default.as_ref()) {
            Some(v) => v.clone(),
            None => {
                return Err(StratusError::MissingVariable {
                    name: name.clone(),
                    stack: stack.into(),
                })
            }
        };

        let value = coerce(name, def, value)?;
        validate(name, def, &value)?;

        if def.cloud_parameter {
            bound.parameters.insert(
                name.clone(),
                Parameter {
                    value: parameter_string(&value),
                    no_echo: def.no_echo,
                },
            );
        } else {
            bound.native.insert(name.clone(), value);
        }
    }
    Ok(bound)
}

/// Permissive bind for raw templates: no declared schema, every supplied
/// value becomes a string cloud parameter.
pub fn bind_permissive(inputs: &BTreeMap<String, Value>) -> BoundVariables {
    let mut bound = BoundVariables::default();
    for (name, value) in inputs {
        bound.parameters.insert(
            name.clone(),
            Parameter {
                value: parameter_string(value),
                no_echo: false,
            },
        );
    }
    bound
}

fn type_error(name: &str, def: &VariableDef, value: &Value) -> StratusError {
    let actual = match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "map",
    };
    StratusError::VariableType {
        name: name.into(),
        expected: def.kind.unwrap_or(VarKind::Any).name().into(),
        actual: actual.into(),
    }
}

fn coerce(name: &str, def: &VariableDef, value: Value) -> Result<Value> {
    let Some(kind) = def.kind else {
        return Ok(value);
    };
    match (kind, value) {
        (VarKind::Any, v) => Ok(v),
        (VarKind::Str, Value::String(s)) => Ok(Value::String(s)),
        (VarKind::Str, Value::Number(n)) => Ok(Value::String(n.to_string())),
        (VarKind::Str, Value::Bool(b)) => Ok(Value::String(b.to_string())),
        (VarKind::Number, v @ Value::Number(_)) => Ok(v),
        (VarKind::Number, Value::String(s)) => s
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| type_error(name, def, &Value::String(s))),
        (VarKind::Bool, v @ Value::Bool(_)) => Ok(v),
        (VarKind::Bool, Value::String(s)) => match s.as_str() {
            "true" | "True" => Ok(Value::Bool(true)),
            "false" | "False" => Ok(Value::Bool(false)),
            _ => Err(type_error(name, def, &Value::String(s))),
        },
        (VarKind::List, v @ Value::Array(_)) => Ok(v),
        (VarKind::Map, v @ Value::Object(_)) => Ok(v),
        (_, v) => Err(type_error(name, def, &v)),
    }
}

fn validate(name: &str, def: &VariableDef, value: &Value) -> Result<()> {
    let fail = |reason: String| StratusError::VariableValidation {
        name: name.into(),
        reason,
    };

    if let Some(allowed) = &def.allowed_values {
        if !allowed.contains(value) {
            return Err(fail(format!(
                "value {} is not one of the allowed values",
                value
            )));
        }
    }

    if let Value::String(s) = value {
        if let Some(pattern) = &def.allowed_pattern {
            let re = Regex::new(pattern)
                .map_err(|e| fail(format!("bad allowed_pattern: {}", e)))?;
            if !re.is_match(s) {
                return Err(fail(format!("'{}' does not match {}", s, pattern)));
            }
        }
        if let Some(min) = def.min_length {
            if s.len() < min {
                return Err(fail(format!("length {} is below minimum {}", s.len(), min)));
            }
        }
        if let Some(max) = def.max_length {
            if s.len() > max {
                return Err(fail(format!("length {} exceeds maximum {}", s.len(), max)));
            }
        }
    }

    if let Value::Number(n) = value {
        let n = n.as_f64().unwrap_or(f64::NAN);
        if let Some(min) = def.min_value {
            if n < min {
                return Err(fail(format!("{} is below minimum {}", n, min)));
            }
        }
        if let Some(max) = def.max_value {
            if n > max {
                return Err(fail(format!("{} exceeds maximum {}", n, max)));
            }
        }
    }

    if let Some(validator) = &def.validator {
        validator(value).map_err(fail)?;
    }

    Ok(())
}

/// Canonical string form forwarded to the control plane.
fn parameter_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(items) => items
            .iter()
            .map(parameter_string)
            .collect::<Vec<_>>()
            .join(","),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn inputs(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn binds_supplied_and_default_values() {
        let mut schema = VariableSchema::new();
        schema.insert("Size".into(), VariableDef::typed(VarKind::Number));
        schema.insert(
            "Stage".into(),
            VariableDef::typed(VarKind::Str).with_default(json!("dev")),
        );

        let bound = bind(&schema, &inputs(&[("Size", json!(3))]), "app").unwrap();
        assert_eq!(bound.native["Size"], json!(3));
        assert_eq!(bound.native["Stage"], json!("dev"));
    }

    #[test]
    fn missing_variable_errors() {
        let mut schema = VariableSchema::new();
        schema.insert("Required".into(), VariableDef::typed(VarKind::Str));
        let err = bind(&schema, &inputs(&[]), "app").unwrap_err();
        assert!(err.to_string().contains("STRA-040"));
    }

    #[test]
    fn unknown_input_errors() {
        let schema = VariableSchema::new();
        let err = bind(&schema, &inputs(&[("Ghost", json!(1))]), "app").unwrap_err();
        assert!(err.to_string().contains("STRA-042"));
    }

    #[test]
    fn bool_cloud_parameter_coerces_to_lowercase_words() {
        let mut schema = VariableSchema::new();
        schema.insert("UseNat".into(), VariableDef::parameter(VarKind::Bool));

        let bound = bind(&schema, &inputs(&[("UseNat", json!(true))]), "vpc").unwrap();
        assert_eq!(bound.parameters["UseNat"].value, "true");

        let bound = bind(&schema, &inputs(&[("UseNat", json!(false))]), "vpc").unwrap();
        assert_eq!(bound.parameters["UseNat"].value, "false");
    }

    #[test]
    fn native_bool_keeps_type() {
        let mut schema = VariableSchema::new();
        schema.insert("Flag".into(), VariableDef::typed(VarKind::Bool));
        let bound = bind(&schema, &inputs(&[("Flag", json!(true))]), "app").unwrap();
        assert_eq!(bound.native["Flag"], json!(true));
    }

    #[test]
    fn list_cloud_parameter_joins_with_comma() {
        let mut schema = VariableSchema::new();
        schema.insert("Subnets".into(), VariableDef::parameter(VarKind::List));
        let bound = bind(
            &schema,
            &inputs(&[("Subnets", json!(["sn-1", "sn-2"]))]),
            "app",
        )
        .unwrap();
        assert_eq!(bound.parameters["Subnets"].value, "sn-1,sn-2");
    }

    #[test]
    fn no_echo_carries_through() {
        let mut schema = VariableSchema::new();
        schema.insert(
            "DbPassword".into(),
            VariableDef::parameter(VarKind::Str).no_echo(),
        );
        let bound = bind(
            &schema,
            &inputs(&[("DbPassword", json!("hunter2"))]),
            "db",
        )
        .unwrap();
        assert!(bound.parameters["DbPassword"].no_echo);
    }

    #[test]
    fn allowed_values_enforced() {
        let mut schema = VariableSchema::new();
        schema.insert(
            "Stage".into(),
            VariableDef::typed(VarKind::Str)
                .with_allowed_values(vec![json!("dev"), json!("prod")]),
        );
        assert!(bind(&schema, &inputs(&[("Stage", json!("prod"))]), "a").is_ok());
        let err = bind(&schema, &inputs(&[("Stage", json!("qa"))]), "a").unwrap_err();
        assert!(err.to_string().contains("STRA-041"));
    }

    #[test]
    fn pattern_and_length_constraints() {
        let mut schema = VariableSchema::new();
        let mut def = VariableDef::typed(VarKind::Str).with_pattern("^[a-z]+$");
        def.min_length = Some(2);
        def.max_length = Some(4);
        schema.insert("Name".into(), def);

        assert!(bind(&schema, &inputs(&[("Name", json!("abc"))]), "a").is_ok());
        assert!(bind(&schema, &inputs(&[("Name", json!("ABC"))]), "a").is_err());
        assert!(bind(&schema, &inputs(&[("Name", json!("a"))]), "a").is_err());
        assert!(bind(&schema, &inputs(&[("Name", json!("abcde"))]), "a").is_err());
    }

    #[test]
    fn numeric_bounds() {
        let mut schema = VariableSchema::new();
        let mut def = VariableDef::typed(VarKind::Number);
        def.min_value = Some(1.0);
        def.max_value = Some(10.0);
        schema.insert("Count".into(), def);

        assert!(bind(&schema, &inputs(&[("Count", json!(5))]), "a").is_ok());
        assert!(bind(&schema, &inputs(&[("Count", json!(0))]), "a").is_err());
        assert!(bind(&schema, &inputs(&[("Count", json!(11))]), "a").is_err());
    }

    #[test]
    fn custom_validator_runs() {
        let mut schema = VariableSchema::new();
        schema.insert(
            "Cidr".into(),
            VariableDef::typed(VarKind::Str).with_validator(Arc::new(|v| {
                match v.as_str() {
                    Some(s) if s.contains('/') => Ok(()),
                    _ => Err("not CIDR notation".into()),
                }
            })),
        );
        assert!(bind(&schema, &inputs(&[("Cidr", json!("10.0.0.0/16"))]), "a").is_ok());
        let err = bind(&schema, &inputs(&[("Cidr", json!("10.0.0.0"))]), "a").unwrap_err();
        assert!(err.to_string().contains("not CIDR notation"));
    }

    #[test]
    fn type_mismatch_errors() {
        let mut schema = VariableSchema::new();
        schema.insert("Subnets".into(), VariableDef::typed(VarKind::List));
        let err = bind(&schema, &inputs(&[("Subnets", json!("sn-1"))]), "a").unwrap_err();
        assert!(err.to_string().contains("STRA-043"));
    }

    #[test]
    fn numeric_string_coerces_for_number_kind() {
        let mut schema = VariableSchema::new();
        schema.insert("Count".into(), VariableDef::typed(VarKind::Number));
        let bound = bind(&schema, &inputs(&[("Count", json!("3"))]), "a").unwrap();
        assert_eq!(bound.native["Count"], json!(3.0));
    }

    #[test]
    fn permissive_bind_makes_string_parameters() {
        let bound = bind_permissive(&inputs(&[
            ("A", json!("x")),
            ("B", json!(true)),
            ("C", json!(["p", "q"])),
        ]));
        assert_eq!(bound.parameters["A"].value, "x");
        assert_eq!(bound.parameters["B"].value, "true");
        assert_eq!(bound.parameters["C"].value, "p,q");
        assert!(bound.native.is_empty());
    }
}
