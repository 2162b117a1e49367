//! Environment files and `${name}` pre-parse substitution
//!
//! Environment values substitute into the raw config text before YAML
//! parsing. Only bare `${name}` references are touched; lookup expressions
//! (`${output vpc::Id}`, `${vpc::Id}`) contain whitespace or `::` and pass
//! through untouched.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::error::{Result, StratusError};

/// Bare `${name}` - a simple identifier, nothing else.
static ENV_REF_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{(\w+)\}").unwrap());

/// Parse an environment file: a YAML mapping, or the legacy newline
/// `key: value` list (which YAML happens to cover for scalar values).
pub fn parse_env_file(content: &str) -> Result<BTreeMap<String, Value>> {
    match serde_yaml::from_str::<BTreeMap<String, serde_yaml::Value>>(content) {
        Ok(map) => map
            .into_iter()
            .map(|(k, v)| {
                serde_json::to_value(v)
                    .map(|v| (k, v))
                    .map_err(StratusError::Json)
            })
            .collect(),
        Err(_) => parse_legacy(content),
    }
}

fn parse_legacy(content: &str) -> Result<BTreeMap<String, Value>> {
    let mut out = BTreeMap::new();
    for (idx, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (key, value) = line.split_once(':').ok_or_else(|| {
            StratusError::EnvFileInvalid {
                details: format!("line {} is not 'key: value'", idx + 1),
            }
        })?;
        out.insert(
            key.trim().to_string(),
            Value::String(value.trim().to_string()),
        );
    }
    Ok(out)
}

/// Substitute `${name}` references in the raw config text.
///
/// A scalar value drops in anywhere. A non-scalar value is only accepted
/// when the reference is the entire value of a `key: ${name}` line; it is
/// then inlined as flow-style YAML.
pub fn substitute(config_text: &str, env: &BTreeMap<String, Value>) -> Result<String> {
    let mut out = String::with_capacity(config_text.len());

    for line in config_text.split_inclusive('\n') {
        let mut rebuilt = String::with_capacity(line.len());
        let mut last = 0;
        for cap in ENV_REF_RE.captures_iter(line) {
            let matched = cap.get(0).expect("capture 0 always present");
            let name = &cap[1];
            let value = env
                .get(name)
                .ok_or_else(|| StratusError::UndefinedEnvRef { name: name.into() })?;

            rebuilt.push_str(&line[last..matched.start()]);
            match value {
                Value::String(s) => rebuilt.push_str(s),
                Value::Bool(b) => rebuilt.push_str(&b.to_string()),
                Value::Number(n) => rebuilt.push_str(&n.to_string()),
                Value::Null => {}
                composite => {
                    if whole_value(line, matched.start(), matched.end()) {
                        rebuilt.push_str(&serde_json::to_string(composite)?);
                    } else {
                        return Err(StratusError::EnvFileInvalid {
                            details: format!(
                                "variable '{}' is not a scalar and '${{{}}}' is not the whole value",
                                name, name
                            ),
                        });
                    }
                }
            }
            last = matched.end();
        }
        rebuilt.push_str(&line[last..]);
        out.push_str(&rebuilt);
    }
    Ok(out)
}

/// Is `${name}` the entire value on its line (after `key:` or a list dash)?
fn whole_value(line: &str, start: usize, end: usize) -> bool {
    let before = &line[..start];
    let after = line[end..].trim_end();
    let prefix_ok = before.trim_end().ends_with(':') || before.trim_end().ends_with('-');
    prefix_ok && after.is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_yaml_mapping() {
        let env = parse_env_file("region: us-east-1\ncount: 3\nsubnets:\n  - a\n  - b\n").unwrap();
        assert_eq!(env["region"], "us-east-1");
        assert_eq!(env["count"], json!(3));
        assert_eq!(env["subnets"], json!(["a", "b"]));
    }

    #[test]
    fn parses_legacy_lines() {
        let env = parse_env_file("# comment\nregion: us-east-1\n\nstage: prod\n").unwrap();
        assert_eq!(env["region"], "us-east-1");
        assert_eq!(env["stage"], "prod");
    }

    #[test]
    fn scalar_substitution_inline() {
        let mut env = BTreeMap::new();
        env.insert("stage".to_string(), json!("prod"));
        let out = substitute("namespace: app-${stage}\n", &env).unwrap();
        assert_eq!(out, "namespace: app-prod\n");
    }

    #[test]
    fn undefined_reference_errors() {
        let env = BTreeMap::new();
        let err = substitute("namespace: ${missing}\n", &env).unwrap_err();
        assert!(err.to_string().contains("STRA-005"));
    }

    #[test]
    fn lookup_expressions_pass_through() {
        let env = BTreeMap::new();
        let text = "variables:\n  VpcId: ${output vpc::Id}\n  Legacy: ${vpc::Id}\n";
        let out = substitute(text, &env).unwrap();
        assert_eq!(out, text);
    }

    #[test]
    fn composite_allowed_as_whole_value() {
        let mut env = BTreeMap::new();
        env.insert("subnets".to_string(), json!(["a", "b"]));
        let out = substitute("  Subnets: ${subnets}\n", &env).unwrap();
        assert_eq!(out, "  Subnets: [\"a\",\"b\"]\n");
    }

    #[test]
    fn composite_rejected_mid_string() {
        let mut env = BTreeMap::new();
        env.insert("subnets".to_string(), json!(["a", "b"]));
        let err = substitute("  Name: prefix-${subnets}\n", &env).unwrap_err();
        assert!(err.to_string().contains("STRA-004"));
    }

    #[test]
    fn multiple_refs_on_one_line() {
        let mut env = BTreeMap::new();
        env.insert("a".to_string(), json!("1"));
        env.insert("b".to_string(), json!("2"));
        let out = substitute("x: ${a}-${b}\n", &env).unwrap();
        assert_eq!(out, "x: 1-2\n");
    }
}
