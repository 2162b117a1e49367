//! Built-in lookup handlers
//!
//! Each handler owns one `${type ...}` syntax. Provider-backed handlers
//! (kms, ssmstore, dynamodb, ami, xref, rxref) go through the facilities on
//! the Provider capability and fail cleanly when the adapter lacks them.

use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use base64::Engine;
use regex::Regex;
use serde_json::{json, Value};

use crate::error::{Result, StratusError};
use crate::provider::AmiFilters;

use super::{LookupHandler, LookupRegistry, ResolveCtx, ResolveMode};

/// Region prefix as used by `[region@]...` args.
static REGION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z]{2}(-[a-z]+)+-\d+$").unwrap());

/// `{{ name }}` placeholders inside parameterized file bodies.
static PARAM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([A-Za-z0-9_:-]+)\s*\}\}").unwrap());

pub fn register_builtins(registry: &mut LookupRegistry) {
    registry.register("output", Arc::new(OutputLookup));
    registry.register("rxref", Arc::new(RxrefLookup));
    registry.register("xref", Arc::new(XrefLookup));
    registry.register("envvar", Arc::new(EnvvarLookup));
    registry.register("file", Arc::new(FileLookup));
    registry.register("kms", Arc::new(KmsLookup));
    registry.register("ssmstore", Arc::new(SsmStoreLookup));
    registry.register("dynamodb", Arc::new(DynamoDbLookup));
    registry.register("ami", Arc::new(AmiLookup));
    registry.register("hook_data", Arc::new(HookDataLookup));
    registry.register("default", Arc::new(DefaultLookup));
    registry.register("split", Arc::new(SplitLookup));
}

fn split_double_colon<'a>(arg: &'a str, kind: &str) -> Result<(&'a str, &'a str)> {
    arg.split_once("::")
        .ok_or_else(|| StratusError::MalformedLookup {
            expr: format!("${{{} {}}}", kind, arg),
            reason: "expected '<left>::<right>'".into(),
        })
}

/// Peel an optional `region@` prefix.
fn split_region(arg: &str) -> (Option<&str>, &str) {
    match arg.split_once('@') {
        Some((left, rest)) if REGION_RE.is_match(left) => (Some(left), rest),
        _ => (None, arg),
    }
}

/// Read a `file://` source relative to the config directory, or return the
/// input untouched.
fn read_file_source(source: &str, ctx: &ResolveCtx<'_>) -> Result<String> {
    match source.strip_prefix("file://") {
        Some(path) => {
            let full = ctx.context.config_dir.join(path);
            std::fs::read_to_string(&full).map_err(|e| StratusError::LookupFailed {
                kind: "file".into(),
                arg: full.display().to_string(),
                reason: e.to_string(),
            })
        }
        None => Ok(source.to_string()),
    }
}

// ═══════════════════════════════════════════════════════════════
// output / rxref / xref
// ═══════════════════════════════════════════════════════════════

/// `${output logical_name::output_name}` - reads a managed stack's outputs.
struct OutputLookup;

#[async_trait]
impl LookupHandler for OutputLookup {
    async fn resolve(&self, arg: &str, ctx: &ResolveCtx<'_>) -> Result<Value> {
        let (stack, output) = split_double_colon(arg, "output")?;
        match ctx.mode {
            ResolveMode::Plan => {
                ctx.record_dep(stack);
                Ok(Value::Null)
            }
            ResolveMode::Execute => ctx
                .context
                .output(stack, output)
                .map(Value::String)
                .ok_or_else(|| StratusError::UnresolvedOutput {
                    stack: stack.into(),
                    output: output.into(),
                }),
        }
    }
}

/// `${rxref stack_name::output_name}` - like xref, but the stack name is
/// namespace-qualified first. No dependency edge is created.
struct RxrefLookup;

#[async_trait]
impl LookupHandler for RxrefLookup {
    async fn resolve(&self, arg: &str, ctx: &ResolveCtx<'_>) -> Result<Value> {
        let (stack, output) = split_double_colon(arg, "rxref")?;
        let fqn = ctx.context.fqn(stack);
        describe_output(&fqn, output, "rxref", ctx).await
    }
}

/// `${xref fqn::output_name}` - reads a live stack by fully-qualified name.
struct XrefLookup;

#[async_trait]
impl LookupHandler for XrefLookup {
    async fn resolve(&self, arg: &str, ctx: &ResolveCtx<'_>) -> Result<Value> {
        let (fqn, output) = split_double_colon(arg, "xref")?;
        describe_output(fqn, output, "xref", ctx).await
    }
}

async fn describe_output(
    fqn: &str,
    output: &str,
    kind: &str,
    ctx: &ResolveCtx<'_>,
) -> Result<Value> {
    let description = ctx.provider()?.describe(fqn, None).await?;
    description
        .outputs
        .get(output)
        .map(|v| Value::String(v.clone()))
        .ok_or_else(|| StratusError::LookupFailed {
            kind: kind.into(),
            arg: format!("{}::{}", fqn, output),
            reason: format!("stack '{}' has no output '{}'", fqn, output),
        })
}

// ═══════════════════════════════════════════════════════════════
// envvar / default / split / hook_data
// ═══════════════════════════════════════════════════════════════

/// `${envvar NAME}` - a process environment variable. `file://path` reads
/// the variable *name* from a file.
struct EnvvarLookup;

#[async_trait]
impl LookupHandler for EnvvarLookup {
    async fn resolve(&self, arg: &str, ctx: &ResolveCtx<'_>) -> Result<Value> {
        let name = read_file_source(arg, ctx)?;
        let name = name.trim();
        std::env::var(name)
            .map(Value::String)
            .map_err(|_| StratusError::MissingEnvVar { name: name.into() })
    }
}

/// `${default NAME::fallback}` - an environment variable if set, else the
/// literal fallback.
struct DefaultLookup;

#[async_trait]
impl LookupHandler for DefaultLookup {
    async fn resolve(&self, arg: &str, _ctx: &ResolveCtx<'_>) -> Result<Value> {
        let (name, fallback) = split_double_colon(arg, "default")?;
        match std::env::var(name) {
            Ok(value) if !value.is_empty() => Ok(Value::String(value)),
            _ => Ok(Value::String(fallback.to_string())),
        }
    }
}

/// `${split delimiter::string}` - a list.
struct SplitLookup;

#[async_trait]
impl LookupHandler for SplitLookup {
    async fn resolve(&self, arg: &str, _ctx: &ResolveCtx<'_>) -> Result<Value> {
        let (delimiter, input) = split_double_colon(arg, "split")?;
        let items: Vec<Value> = input
            .split(delimiter)
            .map(|s| Value::String(s.to_string()))
            .collect();
        Ok(Value::Array(items))
    }
}

/// `${hook_data key::path.to.leaf}` - reads the keyed hook result bag.
struct HookDataLookup;

#[async_trait]
impl LookupHandler for HookDataLookup {
    async fn resolve(&self, arg: &str, ctx: &ResolveCtx<'_>) -> Result<Value> {
        let path = match arg.split_once("::") {
            Some((key, rest)) => format!("{}.{}", key, rest),
            None => arg.to_string(),
        };
        ctx.context
            .hook_data(&path)
            .ok_or_else(|| StratusError::LookupFailed {
                kind: "hook_data".into(),
                arg: arg.into(),
                reason: "no hook wrote this key".into(),
            })
    }
}

// ═══════════════════════════════════════════════════════════════
// file
// ═══════════════════════════════════════════════════════════════

/// `${file codec:source}` - file or inline content through a codec.
struct FileLookup;

#[async_trait]
impl LookupHandler for FileLookup {
    async fn resolve(&self, arg: &str, ctx: &ResolveCtx<'_>) -> Result<Value> {
        let (codec, source) = arg.split_once(':').ok_or_else(|| {
            StratusError::MalformedLookup {
                expr: format!("${{file {}}}", arg),
                reason: "expected 'codec:source'".into(),
            }
        })?;
        let content = read_file_source(source, ctx)?;

        match codec {
            "plain" => Ok(Value::String(content)),
            "base64" => Ok(Value::String(
                base64::engine::general_purpose::STANDARD.encode(content.as_bytes()),
            )),
            "parameterized" => Ok(parameterize(&content)),
            "parameterized-b64" => Ok(json!({ "Fn::Base64": parameterize(&content) })),
            "json" => serde_json::from_str(&content).map_err(StratusError::Json),
            "json-parameterized" => {
                let parsed: Value = serde_json::from_str(&content)?;
                Ok(parameterize_tree(parsed))
            }
            "yaml" => serde_yaml::from_str(&content).map_err(StratusError::Yaml),
            "yaml-parameterized" => {
                let parsed: Value = serde_yaml::from_str(&content)?;
                Ok(parameterize_tree(parsed))
            }
            other => Err(StratusError::UnknownCodec {
                codec: other.into(),
            }),
        }
    }
}

/// Turn `{{ name }}` placeholders into a provider-intrinsic join.
fn parameterize(content: &str) -> Value {
    let mut parts: Vec<Value> = Vec::new();
    let mut last = 0;
    for cap in PARAM_RE.captures_iter(content) {
        let matched = cap.get(0).expect("capture 0 always present");
        if matched.start() > last {
            parts.push(json!(&content[last..matched.start()]));
        }
        parts.push(json!({ "Ref": &cap[1] }));
        last = matched.end();
    }
    if last < content.len() {
        parts.push(json!(&content[last..]));
    }
    json!({ "Fn::Join": ["", parts] })
}

/// Parameterize every string leaf containing a placeholder.
fn parameterize_tree(value: Value) -> Value {
    match value {
        Value::String(s) if PARAM_RE.is_match(&s) => parameterize(&s),
        Value::Array(items) => Value::Array(items.into_iter().map(parameterize_tree).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, parameterize_tree(v)))
                .collect(),
        ),
        other => other,
    }
}

// ═══════════════════════════════════════════════════════════════
// kms / ssmstore
// ═══════════════════════════════════════════════════════════════

/// `${kms [region@]ciphertext}` - decrypts via the provider's crypto
/// facility; the ciphertext may be `file://path`.
struct KmsLookup;

#[async_trait]
impl LookupHandler for KmsLookup {
    async fn resolve(&self, arg: &str, ctx: &ResolveCtx<'_>) -> Result<Value> {
        let (region, rest) = split_region(arg);
        let ciphertext = read_file_source(rest, ctx)?;
        let plaintext = ctx
            .provider()?
            .decrypt(ciphertext.trim(), region)
            .await?;
        Ok(Value::String(plaintext))
    }
}

/// `${ssmstore [region@]name}` - a named secret parameter.
struct SsmStoreLookup;

#[async_trait]
impl LookupHandler for SsmStoreLookup {
    async fn resolve(&self, arg: &str, ctx: &ResolveCtx<'_>) -> Result<Value> {
        let (region, name) = split_region(arg);
        let value = ctx.provider()?.get_parameter(name, region).await?;
        Ok(Value::String(value))
    }
}

// ═══════════════════════════════════════════════════════════════
// dynamodb
// ═══════════════════════════════════════════════════════════════

/// `${dynamodb [region:]table@pk:value.attr[T]...}` - reads one attribute
/// path out of a stored item. The terminal `[T]` selects coercion:
/// S string, N number, M map, L list, B binary (kept base64).
struct DynamoDbLookup;

#[async_trait]
impl LookupHandler for DynamoDbLookup {
    async fn resolve(&self, arg: &str, ctx: &ResolveCtx<'_>) -> Result<Value> {
        let malformed = |reason: &str| StratusError::MalformedLookup {
            expr: format!("${{dynamodb {}}}", arg),
            reason: reason.into(),
        };

        let (left, right) = arg.split_once('@').ok_or_else(|| {
            malformed("expected '[region:]table@partition_key:value.attr...'")
        })?;
        let (region, table) = match left.split_once(':') {
            Some((region, table)) if REGION_RE.is_match(region) => (Some(region), table),
            Some(_) => return Err(malformed("bad region prefix")),
            None => (None, left),
        };

        let (key, remainder) = right
            .split_once(':')
            .ok_or_else(|| malformed("expected 'partition_key:value'"))?;
        let mut path = remainder.split('.');
        let key_value = path.next().filter(|v| !v.is_empty()).ok_or_else(|| {
            malformed("expected a key value before the attribute path")
        })?;

        let item = ctx
            .provider()?
            .get_item(table, key, key_value, region)
            .await?;

        let mut current = item;
        let mut terminal_type: Option<char> = None;
        for raw_segment in path {
            let (segment, attr_type) = split_attr_type(raw_segment);
            terminal_type = attr_type;
            let next = match segment.parse::<usize>() {
                Ok(idx) => current.get(idx).cloned(),
                Err(_) => current.get(segment).cloned(),
            };
            current = next.ok_or_else(|| StratusError::LookupFailed {
                kind: "dynamodb".into(),
                arg: arg.into(),
                reason: format!("attribute '{}' not found", segment),
            })?;
        }

        coerce_attr(current, terminal_type, arg)
    }
}

/// "size[N]" -> ("size", Some('N'))
fn split_attr_type(segment: &str) -> (&str, Option<char>) {
    if let Some(open) = segment.find('[') {
        if segment.ends_with(']') && segment.len() == open + 3 {
            let t = segment.as_bytes()[open + 1] as char;
            return (&segment[..open], Some(t));
        }
    }
    (segment, None)
}

fn coerce_attr(value: Value, attr_type: Option<char>, arg: &str) -> Result<Value> {
    let fail = |reason: String| StratusError::LookupFailed {
        kind: "dynamodb".into(),
        arg: arg.into(),
        reason,
    };
    match attr_type {
        None | Some('S') | Some('B') => Ok(value),
        Some('N') => match &value {
            Value::Number(_) => Ok(value),
            Value::String(s) => s
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| fail(format!("'{}' is not a number", s))),
            other => Err(fail(format!("cannot coerce {} to number", other))),
        },
        Some('M') => match value {
            Value::Object(_) => Ok(value),
            other => Err(fail(format!("expected a map, got {}", other))),
        },
        Some('L') => match value {
            Value::Array(_) => Ok(value),
            other => Err(fail(format!("expected a list, got {}", other))),
        },
        Some(t) => Err(fail(format!("unknown attribute type '{}'", t))),
    }
}

// ═══════════════════════════════════════════════════════════════
// ami
// ═══════════════════════════════════════════════════════════════

/// `${ami owners:a,b name_regex:... key:value...}` - the most recent image
/// matching the filters.
struct AmiLookup;

#[async_trait]
impl LookupHandler for AmiLookup {
    async fn resolve(&self, arg: &str, ctx: &ResolveCtx<'_>) -> Result<Value> {
        let (region, rest) = split_region(arg);
        let mut filters = AmiFilters::default();

        for pair in rest.split_whitespace() {
            let (key, value) = pair.split_once(':').ok_or_else(|| {
                StratusError::MalformedLookup {
                    expr: format!("${{ami {}}}", arg),
                    reason: format!("filter '{}' is not key:value", pair),
                }
            })?;
            match key {
                "owners" => {
                    filters.owners = value.split(',').map(str::to_string).collect();
                }
                "name_regex" => filters.name_regex = Some(value.to_string()),
                other => {
                    filters.extra.insert(other.to_string(), value.to_string());
                }
            }
        }

        let image_id = ctx.provider()?.find_ami(&filters, region).await?;
        Ok(Value::String(image_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::provider::mock::MockProvider;
    use crate::provider::Provider;
    use std::io::Write;

    fn registry() -> LookupRegistry {
        LookupRegistry::builtin()
    }

    async fn resolve_with(
        input: &str,
        context: &Context,
        provider: Option<&Arc<dyn Provider>>,
    ) -> Result<Value> {
        let ctx = ResolveCtx::new(context, provider, ResolveMode::Execute);
        registry().resolve_string(input, &ctx).await
    }

    async fn resolve(input: &str, context: &Context) -> Result<Value> {
        resolve_with(input, context, None).await
    }

    // ═══════════════════════════════════════════════════════════════
    // envvar / default / split / hook_data
    // ═══════════════════════════════════════════════════════════════

    #[tokio::test]
    async fn envvar_reads_process_env() {
        std::env::set_var("STRATUS_TEST_ENVVAR", "from-env");
        let context = Context::new("ns", "-");
        let value = resolve("${envvar STRATUS_TEST_ENVVAR}", &context).await.unwrap();
        assert_eq!(value, "from-env");
    }

    #[tokio::test]
    async fn envvar_missing_errors() {
        let context = Context::new("ns", "-");
        let err = resolve("${envvar STRATUS_TEST_ABSENT_VAR}", &context)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("STRA-034"));
    }

    #[tokio::test]
    async fn envvar_name_from_file() {
        std::env::set_var("STRATUS_TEST_INDIRECT", "indirect-value");
        let dir = tempfile::tempdir().unwrap();
        let mut f = std::fs::File::create(dir.path().join("varname")).unwrap();
        writeln!(f, "STRATUS_TEST_INDIRECT").unwrap();

        let context = Context::new("ns", "-").with_config_dir(dir.path());
        let value = resolve("${envvar file://varname}", &context).await.unwrap();
        assert_eq!(value, "indirect-value");
    }

    #[tokio::test]
    async fn default_falls_back() {
        let context = Context::new("ns", "-");
        let value = resolve("${default STRATUS_TEST_UNSET::fallback}", &context)
            .await
            .unwrap();
        assert_eq!(value, "fallback");

        std::env::set_var("STRATUS_TEST_SET", "real");
        let value = resolve("${default STRATUS_TEST_SET::fallback}", &context)
            .await
            .unwrap();
        assert_eq!(value, "real");
    }

    #[tokio::test]
    async fn split_returns_list() {
        let context = Context::new("ns", "-");
        let value = resolve("${split ,::a,b,c}", &context).await.unwrap();
        assert_eq!(value, json!(["a", "b", "c"]));
    }

    #[tokio::test]
    async fn hook_data_reads_bag() {
        let context = Context::new("ns", "-");
        context.set_hook_data("build", json!({"image": {"tag": "v3"}}));
        let value = resolve("${hook_data build::image.tag}", &context)
            .await
            .unwrap();
        assert_eq!(value, "v3");
    }

    // ═══════════════════════════════════════════════════════════════
    // file codecs
    // ═══════════════════════════════════════════════════════════════

    #[tokio::test]
    async fn file_plain_and_base64() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("data.txt"), "hello").unwrap();
        let context = Context::new("ns", "-").with_config_dir(dir.path());

        let plain = resolve("${file plain:file://data.txt}", &context).await.unwrap();
        assert_eq!(plain, "hello");

        let b64 = resolve("${file base64:file://data.txt}", &context).await.unwrap();
        assert_eq!(b64, "aGVsbG8=");
    }

    #[tokio::test]
    async fn file_json_and_yaml() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("c.json"), r#"{"a": 1}"#).unwrap();
        std::fs::write(dir.path().join("c.yaml"), "a: 1\n").unwrap();
        let context = Context::new("ns", "-").with_config_dir(dir.path());

        assert_eq!(
            resolve("${file json:file://c.json}", &context).await.unwrap(),
            json!({"a": 1})
        );
        assert_eq!(
            resolve("${file yaml:file://c.yaml}", &context).await.unwrap(),
            json!({"a": 1})
        );
    }

    #[tokio::test]
    async fn file_parameterized_builds_join() {
        let context = Context::new("ns", "-");
        let value = resolve("${file parameterized:echo {{Stage}} done}", &context)
            .await
            .unwrap();
        assert_eq!(
            value,
            json!({"Fn::Join": ["", ["echo ", {"Ref": "Stage"}, " done"]]})
        );
    }

    #[tokio::test]
    async fn file_parameterized_b64_wraps() {
        let context = Context::new("ns", "-");
        let value = resolve("${file parameterized-b64:hi {{X}}}", &context)
            .await
            .unwrap();
        assert!(value.get("Fn::Base64").is_some());
    }

    #[tokio::test]
    async fn file_json_parameterized_rewrites_leaves() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("u.json"),
            r#"{"script": "run {{Env}}", "static": "x"}"#,
        )
        .unwrap();
        let context = Context::new("ns", "-").with_config_dir(dir.path());
        let value = resolve("${file json-parameterized:file://u.json}", &context)
            .await
            .unwrap();
        assert!(value["script"].get("Fn::Join").is_some());
        assert_eq!(value["static"], "x");
    }

    #[tokio::test]
    async fn unknown_codec_errors() {
        let context = Context::new("ns", "-");
        let err = resolve("${file rot13:abc}", &context).await.unwrap_err();
        assert!(err.to_string().contains("STRA-035"));
    }

    // ═══════════════════════════════════════════════════════════════
    // provider-backed handlers
    // ═══════════════════════════════════════════════════════════════

    fn mock_provider() -> Arc<dyn Provider> {
        Arc::new(
            MockProvider::new()
                .with_existing_stack("prod-shared", &[("BucketName", "shared-assets")])
                .with_existing_stack("legacy-dns", &[("ZoneId", "Z123")])
                .seed_parameter("/app/password", "hunter2")
                .seed_secret("ciphertextblob", "decrypted")
                .seed_item("config", "env", "prod", json!({"size": "4", "tags": ["a"]}))
                .seed_image("ami-123", "base-2024", "self", "2024-06-01T00:00:00Z".parse().unwrap()),
        )
    }

    #[tokio::test]
    async fn rxref_qualifies_with_namespace() {
        let context = Context::new("prod", "-");
        let provider = mock_provider();
        let value = resolve_with("${rxref shared::BucketName}", &context, Some(&provider))
            .await
            .unwrap();
        assert_eq!(value, "shared-assets");
    }

    #[tokio::test]
    async fn xref_uses_raw_fqn() {
        let context = Context::new("prod", "-");
        let provider = mock_provider();
        let value = resolve_with("${xref legacy-dns::ZoneId}", &context, Some(&provider))
            .await
            .unwrap();
        assert_eq!(value, "Z123");
    }

    #[tokio::test]
    async fn xref_missing_output_errors() {
        let context = Context::new("prod", "-");
        let provider = mock_provider();
        let err = resolve_with("${xref legacy-dns::Nope}", &context, Some(&provider))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("STRA-033"));
    }

    #[tokio::test]
    async fn ssmstore_reads_parameter() {
        let context = Context::new("ns", "-");
        let provider = mock_provider();
        let value = resolve_with("${ssmstore /app/password}", &context, Some(&provider))
            .await
            .unwrap();
        assert_eq!(value, "hunter2");
    }

    #[tokio::test]
    async fn ssmstore_with_region_prefix() {
        let context = Context::new("ns", "-");
        let provider = mock_provider();
        let value = resolve_with(
            "${ssmstore us-east-1@/app/password}",
            &context,
            Some(&provider),
        )
        .await
        .unwrap();
        assert_eq!(value, "hunter2");
    }

    #[tokio::test]
    async fn kms_decrypts() {
        let context = Context::new("ns", "-");
        let provider = mock_provider();
        let value = resolve_with("${kms ciphertextblob}", &context, Some(&provider))
            .await
            .unwrap();
        assert_eq!(value, "decrypted");
    }

    #[tokio::test]
    async fn kms_ciphertext_from_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("secret.enc"), "ciphertextblob\n").unwrap();
        let context = Context::new("ns", "-").with_config_dir(dir.path());
        let provider = mock_provider();
        let value = resolve_with("${kms file://secret.enc}", &context, Some(&provider))
            .await
            .unwrap();
        assert_eq!(value, "decrypted");
    }

    #[tokio::test]
    async fn dynamodb_navigates_and_coerces() {
        let context = Context::new("ns", "-");
        let provider = mock_provider();

        let value = resolve_with(
            "${dynamodb config@env:prod.size[N]}",
            &context,
            Some(&provider),
        )
        .await
        .unwrap();
        assert_eq!(value, json!(4.0));

        let value = resolve_with(
            "${dynamodb us-east-1:config@env:prod.tags[L]}",
            &context,
            Some(&provider),
        )
        .await
        .unwrap();
        assert_eq!(value, json!(["a"]));
    }

    #[tokio::test]
    async fn dynamodb_missing_attribute_errors() {
        let context = Context::new("ns", "-");
        let provider = mock_provider();
        let err = resolve_with(
            "${dynamodb config@env:prod.absent[S]}",
            &context,
            Some(&provider),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("STRA-033"));
    }

    #[tokio::test]
    async fn ami_parses_filters() {
        let context = Context::new("ns", "-");
        let provider = mock_provider();
        let value = resolve_with(
            "${ami owners:self name_regex:base-.*}",
            &context,
            Some(&provider),
        )
        .await
        .unwrap();
        assert_eq!(value, "ami-123");
    }

    #[tokio::test]
    async fn provider_backed_lookup_without_provider_fails() {
        let context = Context::new("ns", "-");
        let err = resolve("${ssmstore /app/password}", &context).await.unwrap_err();
        assert!(err.to_string().contains("STRA-078"));
    }

    #[test]
    fn attr_type_splitting() {
        assert_eq!(split_attr_type("size[N]"), ("size", Some('N')));
        assert_eq!(split_attr_type("plain"), ("plain", None));
        assert_eq!(split_attr_type("odd[NN]"), ("odd[NN]", None));
    }

    #[test]
    fn region_detection() {
        assert_eq!(split_region("us-east-1@name"), (Some("us-east-1"), "name"));
        assert_eq!(split_region("ap-southeast-2@x"), (Some("ap-southeast-2"), "x"));
        assert_eq!(split_region("name@with-at"), (None, "name@with-at"));
        assert_eq!(split_region("plain"), (None, "plain"));
    }
}
