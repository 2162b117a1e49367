//! stratus - DAG orchestrator for interdependent cloud stacks
//!
//! A declarative config lists stacks and how they depend on each other;
//! the planner turns it into a validated DAG of steps, the executor walks
//! that DAG with bounded parallelism, and each step reconciles its stack
//! against a [`provider::Provider`] capability. Value resolution
//! (`${type arg}` lookups) feeds variables from stack outputs, the
//! environment, files, and provider facilities.

pub mod blueprint;
pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod executor;
pub mod graph;
pub mod hooks;
pub mod lookup;
pub mod plan;
pub mod provider;
pub mod store;
pub mod variables;

pub use blueprint::{Blueprint, BlueprintRegistry, RawTemplateBlueprint, StaticBlueprint};
pub use config::Config;
pub use context::Context;
pub use error::{FixSuggestion, Result, StratusError};
pub use event::{EventBus, EventEmitter, StepEvent, StepStatus};
pub use executor::{ApprovalDecision, ApprovalSource, AutoApprove, DenyAll, ExecOptions, Executor, RunSummary};
pub use graph::Graph;
pub use lookup::LookupRegistry;
pub use plan::{Action, Plan, PlanOptions, Planner, Step};
pub use provider::{Provider, ProviderRegistry};
