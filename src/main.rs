//! stratus CLI - plan and reconcile stack sets

use std::collections::BTreeMap;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use stratus::blueprint::BlueprintRegistry;
use stratus::config::{env as config_env, Config};
use stratus::context::Context;
use stratus::error::{FixSuggestion, Result, StratusError};
use stratus::event::{EventBus, StepStatus};
use stratus::executor::{
    ApprovalDecision, ApprovalSource, AutoApprove, ExecOptions, Executor, RunSummary,
};
use stratus::hooks::{HookRegistry, HookRunner, ResolveFailurePolicy};
use stratus::lookup::LookupRegistry;
use stratus::plan::{Action, Plan, PlanOptions, Planner};
use stratus::provider::{ChangeSetPlan, Provider, ProviderRegistry};
use stratus::store::persist::PersistentGraphStore;
use stratus::store::FileStore;

#[derive(Parser)]
#[command(name = "stratus")]
#[command(about = "DAG orchestrator for interdependent cloud stacks")]
#[command(version)]
struct Cli {
    /// -v for debug, -vv for trace
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

/// Flags shared by every subcommand that loads a config.
#[derive(Args, Clone)]
struct CommonArgs {
    /// Path to the config file
    config: PathBuf,

    /// Optional environment file substituted into the config
    env_file: Option<PathBuf>,

    /// Extra environment values, KEY=VALUE (repeatable)
    #[arg(short = 'e', long = "env", value_parser = parse_key_val)]
    env: Vec<(String, String)>,

    /// Default region for stacks that don't set one
    #[arg(short, long)]
    region: Option<String>,

    /// Default credentials profile
    #[arg(short, long)]
    profile: Option<String>,

    /// Provider adapter name
    #[arg(long, default_value = "memory")]
    provider: String,

    /// Limit to these stacks plus their dependencies (repeatable)
    #[arg(long = "stacks")]
    stacks: Vec<String>,

    /// With --stacks: run exactly the selection
    #[arg(long)]
    only: bool,

    /// Build these stacks even when locked (repeatable)
    #[arg(long = "force")]
    force: Vec<String>,

    /// Worker bound (0 derives from the machine)
    #[arg(short = 'j', long = "jobs", default_value_t = 0)]
    jobs: usize,

    /// Stream provider event-log lines while operations run
    #[arg(short, long)]
    tail: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or update every stack in the config
    Build {
        #[command(flatten)]
        common: CommonArgs,

        /// Review change sets before applying them
        #[arg(short, long)]
        interactive: bool,

        /// Auto-approve change sets without replacements
        #[arg(long)]
        replacements_only: bool,

        /// Destroy and re-create stacks stuck in a rolled-back state
        #[arg(long)]
        recreate_failed: bool,
    },

    /// Destroy stacks, dependents first
    Destroy {
        #[command(flatten)]
        common: CommonArgs,
    },

    /// Show template and parameter differences without mutating anything
    Diff {
        #[command(flatten)]
        common: CommonArgs,
    },

    /// Describe deployed stacks and print their outputs
    Info {
        #[command(flatten)]
        common: CommonArgs,
    },

    /// Print the dependency graph
    Graph {
        #[command(flatten)]
        common: CommonArgs,

        /// Output format: dot or json
        #[arg(long, default_value = "dot")]
        format: String,

        /// Collapse edges implied by longer paths
        #[arg(long)]
        reduce: bool,
    },

    /// Write rendered templates to a directory
    Dump {
        #[command(flatten)]
        common: CommonArgs,

        /// Target directory
        #[arg(short, long, default_value = ".")]
        output: PathBuf,
    },
}

fn parse_key_val(s: &str) -> std::result::Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("'{}' is not KEY=VALUE", s))
}

/// Terminal change-set review.
struct TerminalApproval;

#[async_trait::async_trait]
impl ApprovalSource for TerminalApproval {
    async fn review(&self, step_id: &str, plan: &ChangeSetPlan) -> Result<ApprovalDecision> {
        println!("\n{} proposed changes for {}:", "?".yellow().bold(), step_id.bold());
        for change in &plan.changes {
            let marker = if change.replacement {
                "replace".red().to_string()
            } else {
                format!("{:?}", change.action).to_lowercase()
            };
            println!("  [{}] {} ({})", marker, change.logical_id, change.resource_type);
        }
        print!("Apply? [y/N] ");
        std::io::stdout().flush().ok();

        let line = tokio::task::spawn_blocking(|| {
            let mut line = String::new();
            std::io::stdin().read_line(&mut line).map(|_| line)
        })
        .await
        .map_err(|e| StratusError::StepFailed {
            step_id: step_id.to_string(),
            reason: e.to_string(),
        })??;

        if line.trim().eq_ignore_ascii_case("y") {
            Ok(ApprovalDecision::Approve)
        } else {
            Ok(ApprovalDecision::Decline)
        }
    }
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => tracing::Level::INFO,
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()),
        )
        .init();

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        eprintln!("\n{} canceling, letting in-flight operations settle...", "!".yellow());
        signal_cancel.cancel();
    });

    let code = match run(cli.command, cancel.clone()).await {
        Ok(code) => {
            if cancel.is_cancelled() {
                130
            } else {
                code
            }
        }
        Err(e) => {
            eprintln!("{} {}", "Error:".red().bold(), e);
            if let Some(suggestion) = e.fix_suggestion() {
                eprintln!("  {} {}", "Fix:".yellow(), suggestion);
            }
            if e.is_config_error() {
                2
            } else {
                1
            }
        }
    };
    std::process::exit(code);
}

/// Everything a subcommand needs, loaded once.
struct Loaded {
    config: Config,
    context: Arc<Context>,
    provider: Arc<dyn Provider>,
    lookups: Arc<LookupRegistry>,
    blueprints: BlueprintRegistry,
    hooks: HookRegistry,
    events: EventBus,
    persist: Option<Arc<PersistentGraphStore>>,
    options: PlanOptions,
    exec: ExecOptions,
}

async fn load(common: &CommonArgs, cancel: CancellationToken) -> Result<Loaded> {
    let config_text =
        std::fs::read_to_string(&common.config).map_err(|_| StratusError::ConfigNotFound {
            path: common.config.display().to_string(),
        })?;

    let mut env = match &common.env_file {
        Some(path) => config_env::parse_env_file(&std::fs::read_to_string(path)?)?,
        None => BTreeMap::new(),
    };
    for (key, value) in &common.env {
        env.insert(key.clone(), serde_json::Value::String(value.clone()));
    }

    let substituted = config_env::substitute(&config_text, &env)?;
    let mut config = Config::loads(&substituted)?;

    if let Ok(namespace) = std::env::var("STRATUS_NAMESPACE") {
        config.namespace = namespace;
    }
    for stack in &mut config.stacks {
        if stack.region.is_none() {
            stack.region = common.region.clone();
        }
        if stack.profile.is_none() {
            stack.profile = common.profile.clone();
        }
    }

    for (name, path) in &config.lookups {
        // Custom handlers are registered by an external loader; a config
        // that names one without a loader present should say so early.
        warn!(lookup = name, handler = path, "custom lookup declared but no loader is installed");
    }

    let config_dir = common
        .config
        .parent()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    let context = Arc::new(
        Context::new(config.namespace.clone(), config.namespace_delimiter.clone())
            .with_config_dir(config_dir)
            .with_cancel(cancel),
    );

    let registry = ProviderRegistry::builtin();
    let provider = registry.get(&common.provider)?;

    let persist = config.persistent_graph_key.as_ref().map(|key| {
        let store = Arc::new(FileStore::default_location());
        Arc::new(PersistentGraphStore::new(store.clone(), store, key.clone()))
    });

    Ok(Loaded {
        config,
        context,
        provider,
        lookups: Arc::new(LookupRegistry::builtin()),
        blueprints: BlueprintRegistry::new(),
        hooks: HookRegistry::builtin(),
        events: EventBus::new(),
        persist,
        options: PlanOptions {
            stacks: common.stacks.clone(),
            only: common.only,
        },
        exec: ExecOptions {
            concurrency: common.jobs,
            force: common.force.clone(),
            tail: common.tail,
            ..ExecOptions::default()
        },
    })
}

impl Loaded {
    async fn plan(&self, action: Action) -> Result<Plan> {
        let planner = Planner {
            config: &self.config,
            context: &self.context,
            lookups: &self.lookups,
            blueprints: &self.blueprints,
            provider: Some(&self.provider),
            persist_store: self.persist.clone(),
        };
        planner.plan(action, &self.options).await
    }

    fn executor(&self, approvals: Arc<dyn ApprovalSource>) -> Executor {
        Executor::new(
            Arc::clone(&self.provider),
            Arc::clone(&self.lookups),
            Arc::clone(&self.context),
            self.events.clone(),
            approvals,
            self.exec.clone(),
        )
    }

    fn hook_runner(&self) -> HookRunner<'_> {
        HookRunner {
            registry: &self.hooks,
            lookups: &self.lookups,
            context: &self.context,
            provider: Some(&self.provider),
            events: &self.events,
        }
    }

    /// Print live step transitions until the run finishes.
    fn spawn_reporter(&self) -> tokio::task::JoinHandle<()> {
        let mut rx = self.events.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                let status = match event.to {
                    StepStatus::Complete => event.to.to_string().green(),
                    StepStatus::Skipped => event.to.to_string().cyan(),
                    StepStatus::Failed => event.to.to_string().red(),
                    StepStatus::Canceled => event.to.to_string().yellow(),
                    other => other.to_string().normal(),
                };
                match &event.reason {
                    Some(reason) => {
                        println!("  {} {} {}", event.step_id, status, format!("({})", reason).dimmed())
                    }
                    None => println!("  {} {}", event.step_id, status),
                }
            }
        })
    }
}

fn print_summary(summary: &RunSummary) {
    let failed = summary.failed();
    if failed.is_empty() {
        println!("\n{} done", "✓".green());
    } else {
        println!("\n{} {} step(s) failed: {}", "✗".red(), failed.len(), failed.join(", "));
    }
}

async fn run(command: Commands, cancel: CancellationToken) -> Result<i32> {
    match command {
        Commands::Build {
            common,
            interactive,
            replacements_only,
            recreate_failed,
        } => {
            let mut loaded = load(&common, cancel).await?;
            loaded.exec.interactive = interactive;
            loaded.exec.replacements_only = replacements_only;
            loaded.exec.recreate_failed = recreate_failed;

            loaded
                .hook_runner()
                .run_phase(
                    &loaded.config.hooks.pre_build.clone(),
                    "pre_build",
                    ResolveFailurePolicy::Fail,
                )
                .await?;

            let plan = loaded.plan(Action::CreateOrUpdate).await?;
            println!(
                "{} building {} stack(s) in namespace {}\n",
                "→".cyan(),
                plan.len(),
                loaded.config.namespace.bold()
            );

            let approvals: Arc<dyn ApprovalSource> = if interactive {
                Arc::new(TerminalApproval)
            } else {
                Arc::new(AutoApprove)
            };
            let reporter = loaded.spawn_reporter();
            let summary = loaded.executor(approvals).run(plan).await?;
            reporter.abort();

            loaded
                .hook_runner()
                .run_phase(
                    &loaded.config.hooks.post_build.clone(),
                    "post_build",
                    ResolveFailurePolicy::Fail,
                )
                .await?;

            print_summary(&summary);
            Ok(summary.exit_code())
        }

        Commands::Destroy { common } => {
            let loaded = load(&common, cancel).await?;

            loaded
                .hook_runner()
                .run_phase(
                    &loaded.config.hooks.pre_destroy.clone(),
                    "pre_destroy",
                    ResolveFailurePolicy::Fail,
                )
                .await?;

            let plan = loaded.plan(Action::Destroy).await?;
            println!(
                "{} destroying {} stack(s) in namespace {}\n",
                "→".cyan(),
                plan.len(),
                loaded.config.namespace.bold()
            );

            let reporter = loaded.spawn_reporter();
            let summary = loaded.executor(Arc::new(AutoApprove)).run(plan).await?;
            reporter.abort();

            loaded
                .hook_runner()
                .run_phase(
                    &loaded.config.hooks.post_destroy.clone(),
                    "post_destroy",
                    ResolveFailurePolicy::Skip,
                )
                .await?;

            print_summary(&summary);
            Ok(summary.exit_code())
        }

        Commands::Diff { common } => {
            let loaded = load(&common, cancel).await?;
            let plan = loaded.plan(Action::Diff).await?;
            let reporter = loaded.spawn_reporter();
            let summary = loaded.executor(Arc::new(AutoApprove)).run(plan).await?;
            reporter.abort();

            for event in loaded.events.events() {
                if let Some(stratus::event::EventDetail::ParameterDiff {
                    added,
                    changed,
                    removed,
                }) = event.detail
                {
                    println!("\n{}:", event.step_id.bold());
                    for (key, value) in added.as_object().into_iter().flatten() {
                        println!("  {} {} = {}", "+".green(), key, value);
                    }
                    for (key, value) in changed.as_object().into_iter().flatten() {
                        println!(
                            "  {} {}: {} -> {}",
                            "~".yellow(),
                            key,
                            value["old"],
                            value["new"]
                        );
                    }
                    for (key, _) in removed.as_object().into_iter().flatten() {
                        println!("  {} {}", "-".red(), key);
                    }
                }
            }
            Ok(summary.exit_code())
        }

        Commands::Info { common } => {
            let loaded = load(&common, cancel).await?;
            let mut report = serde_json::Map::new();
            for stack in loaded.config.stacks.iter().filter(|s| s.enabled) {
                let fqn = stack
                    .fqn
                    .clone()
                    .unwrap_or_else(|| loaded.context.fqn(stack.stack_name()));
                let description = loaded.provider.describe(&fqn, stack.region.as_deref()).await?;
                report.insert(
                    stack.name.clone(),
                    serde_json::json!({
                        "fqn": fqn,
                        "status": description.status.to_string(),
                        "outputs": description.outputs,
                    }),
                );
            }
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(0)
        }

        Commands::Graph {
            common,
            format,
            reduce,
        } => {
            let loaded = load(&common, cancel).await?;
            // Diff planning builds the same graph without locks or mutation
            let plan = loaded.plan(Action::Diff).await?;
            let graph = if reduce {
                plan.graph.transitive_reduction()
            } else {
                plan.graph
            };
            match format.as_str() {
                "json" => println!("{}", serde_json::to_string_pretty(&graph.to_json())?),
                _ => print!("{}", graph.dot()),
            }
            Ok(0)
        }

        Commands::Dump { common, output } => {
            let mut loaded = load(&common, cancel).await?;
            loaded.exec.dump_dir = Some(output);
            let plan = loaded.plan(Action::Dump).await?;
            let reporter = loaded.spawn_reporter();
            let summary = loaded.executor(Arc::new(AutoApprove)).run(plan).await?;
            reporter.abort();
            print_summary(&summary);
            Ok(summary.exit_code())
        }
    }
}
