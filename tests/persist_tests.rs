//! Persistent-graph reconciliation scenarios

mod common;

use std::sync::Arc;

use common::Harness;
use pretty_assertions::assert_eq;
use stratus::event::StepStatus;
use stratus::executor::ExecOptions;
use stratus::plan::Action;
use stratus::provider::mock::MockProvider;
use stratus::store::persist::{PersistedGraph, PersistentGraphStore};
use stratus::store::{MemoryStore, ObjectStore};

const KEY: &str = "state/ns.json";

const CONFIG: &str = r#"
namespace: ns
persistent_graph_key: state/ns.json
stacks:
  - name: vpc
    blueprint: vpc.Blueprint
  - name: bastion
    blueprint: bastion.Blueprint
    requires: [vpc]
"#;

fn persist_on(memory: &Arc<MemoryStore>) -> Arc<PersistentGraphStore> {
    Arc::new(PersistentGraphStore::new(
        Arc::clone(memory) as Arc<dyn stratus::store::ObjectStore>,
        Arc::clone(memory) as Arc<dyn stratus::store::LockStore>,
        KEY,
    ))
}

async fn seed_prior(memory: &Arc<MemoryStore>, body: &str) {
    memory
        .put(KEY, body.as_bytes(), "application/json")
        .await
        .unwrap();
}

// ═══════════════════════════════════════════════════════════════
// prune removed stacks
// ═══════════════════════════════════════════════════════════════

#[tokio::test]
async fn removed_stack_is_destroyed_and_graph_rewritten() {
    let memory = Arc::new(MemoryStore::new());
    seed_prior(
        &memory,
        r#"{"version":1,"nodes":{"vpc":[],"bastion":["vpc"],"other":[]}}"#,
    )
    .await;

    let harness = Harness::new(
        CONFIG,
        MockProvider::new().with_existing_stack("ns-other", &[]),
    )
    .with_persist(persist_on(&memory));

    let summary = harness.build().await.unwrap();
    assert_eq!(summary.exit_code(), 0);
    assert_eq!(summary.status("other"), Some(StepStatus::Complete));
    assert_eq!(summary.reason("other"), Some("stack destroyed"));

    // destroy went through the submit path
    let other_events: Vec<_> = harness
        .events
        .for_step("other")
        .into_iter()
        .map(|e| (e.to, e.reason))
        .collect();
    assert_eq!(
        other_events[0],
        (
            StepStatus::Submitted,
            Some("submitted for destruction".to_string())
        )
    );

    // the stored object no longer mentions the pruned stack
    let stored: PersistedGraph = serde_json::from_slice(&memory.raw(KEY).unwrap()).unwrap();
    assert!(stored.nodes.contains_key("vpc"));
    assert!(stored.nodes.contains_key("bastion"));
    assert!(!stored.nodes.contains_key("other"));
    assert_eq!(stored.nodes["bastion"], vec!["vpc"]);

    // and the lock was released
    assert!(!memory.is_locked(KEY));
}

// ═══════════════════════════════════════════════════════════════
// unchanged config re-run
// ═══════════════════════════════════════════════════════════════

#[tokio::test]
async fn rerun_with_unchanged_config_is_all_nochange() {
    let memory = Arc::new(MemoryStore::new());

    let first = Harness::new(CONFIG, MockProvider::new()).with_persist(persist_on(&memory));
    assert_eq!(first.build().await.unwrap().exit_code(), 0);

    let second =
        Harness::new(CONFIG, first.mock.clone()).with_persist(persist_on(&memory));
    let summary = second.build().await.unwrap();

    assert_eq!(summary.exit_code(), 0);
    for step in ["vpc", "bastion"] {
        assert_eq!(summary.status(step), Some(StepStatus::Skipped), "step {}", step);
        assert_eq!(summary.reason(step), Some("nochange"), "step {}", step);
    }
    // no destroy steps appeared
    assert!(!second.mock.calls().iter().any(|c| c.starts_with("destroy")));
    assert!(!memory.is_locked(KEY));
}

#[tokio::test]
async fn concurrent_build_is_locked_out() {
    let memory = Arc::new(MemoryStore::new());
    let harness = Harness::new(CONFIG, MockProvider::new()).with_persist(persist_on(&memory));

    let held = persist_on(&memory).lock().await.unwrap();
    let err = harness
        .plan(Action::CreateOrUpdate, Default::default())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("STRA-100"));

    // after release the plan goes through
    persist_on(&memory).release(&held).await.unwrap();
    assert!(harness
        .plan(Action::CreateOrUpdate, Default::default())
        .await
        .is_ok());
}

#[tokio::test]
async fn failed_prune_keeps_node_in_stored_graph() {
    let memory = Arc::new(MemoryStore::new());
    seed_prior(&memory, r#"{"version":1,"nodes":{"vpc":[],"doomed":[]}}"#).await;

    // doomed exists but its destroy times out
    let harness = Harness::new(
        CONFIG,
        MockProvider::new()
            .with_existing_stack("ns-doomed", &[])
            .script(
                "ns-doomed",
                stratus::provider::mock::FailureScript::TimeoutOnWait,
            ),
    )
    .with_persist(persist_on(&memory));

    let summary = harness.build().await.unwrap();
    assert_eq!(summary.status("doomed"), Some(StepStatus::Failed));
    assert_eq!(summary.exit_code(), 1);

    // the node survives for the next run to prune again
    let stored: PersistedGraph = serde_json::from_slice(&memory.raw(KEY).unwrap()).unwrap();
    assert!(stored.nodes.contains_key("doomed"));
    assert!(!memory.is_locked(KEY));
}

#[tokio::test]
async fn destroy_run_empties_the_stored_graph() {
    let memory = Arc::new(MemoryStore::new());
    seed_prior(
        &memory,
        r#"{"version":1,"nodes":{"vpc":[],"bastion":["vpc"]}}"#,
    )
    .await;

    let harness = Harness::new(
        CONFIG,
        MockProvider::new()
            .with_existing_stack("ns-vpc", &[])
            .with_existing_stack("ns-bastion", &[]),
    )
    .with_persist(persist_on(&memory));

    let summary = harness
        .run(Action::Destroy, ExecOptions::default())
        .await
        .unwrap();
    assert_eq!(summary.exit_code(), 0);

    let stored: PersistedGraph = serde_json::from_slice(&memory.raw(KEY).unwrap()).unwrap();
    assert!(stored.nodes.is_empty());
    assert!(!memory.is_locked(KEY));
}
