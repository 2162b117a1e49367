//! Bounded-parallel graph walker
//!
//! Dispatch loop: compute the ready set (all dependencies terminated
//! successfully), spawn workers into a JoinSet up to the concurrency bound,
//! collect one completion, repeat. A vertex whose dependency terminated
//! unsuccessfully is never dispatched; it is reported through `on_cancel`
//! and treated as failed for its own dependents.
//!
//! Guarantees:
//! 1. a vertex runs only after all its dependencies terminated;
//! 2. at most `concurrency` workers run at once;
//! 3. `concurrency == 1` yields serial execution in insertion order
//!    (stable tie-breaking between ready vertices);
//! 4. on cancellation, undispatched vertices are reported canceled and
//!    running workers are left to observe the token and drain.

use std::future::Future;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::Graph;

/// What a worker reports for a vertex it ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Dependents may run (covers completed and skipped work).
    Ok,
    /// Dependents must not run.
    Failed,
}

/// Aggregate result of a walk.
#[derive(Debug, Default)]
pub struct WalkReport {
    /// Vertices whose worker reported Failed
    pub failed: Vec<Arc<str>>,
    /// Vertices never dispatched (failed dependency or cancellation)
    pub canceled: Vec<Arc<str>>,
}

impl WalkReport {
    /// True when every vertex ran and reported Ok.
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.canceled.is_empty()
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum NodeState {
    NotStarted,
    Running,
    Done(bool),
}

/// Reason string attached to vertices canceled because a dependency failed.
pub const DEP_FAILED: &str = "dependency has failed";
/// Reason string attached to vertices canceled by the run token.
pub const RUN_CANCELED: &str = "canceled";

/// Walk the graph, invoking `worker` once per vertex.
///
/// `on_cancel(vertex, reason)` fires for every vertex that will never be
/// dispatched, exactly once per vertex.
pub async fn walk<W, Fut, C>(
    graph: &Graph,
    concurrency: usize,
    cancel: &CancellationToken,
    worker: W,
    on_cancel: C,
) -> WalkReport
where
    W: Fn(Arc<str>) -> Fut,
    Fut: Future<Output = StepOutcome> + Send + 'static,
    C: Fn(&Arc<str>, &str),
{
    let concurrency = concurrency.max(1);
    let mut states: FxHashMap<Arc<str>, NodeState> = graph
        .nodes()
        .iter()
        .map(|id| (Arc::clone(id), NodeState::NotStarted))
        .collect();
    let mut report = WalkReport::default();
    let mut join_set: JoinSet<(Arc<str>, StepOutcome)> = JoinSet::new();
    let mut running = 0usize;

    loop {
        if cancel.is_cancelled() {
            // Everything not yet dispatched ends canceled; running workers
            // observe the token themselves and drain below.
            for id in graph.nodes() {
                if states[id] == NodeState::NotStarted {
                    states.insert(Arc::clone(id), NodeState::Done(false));
                    on_cancel(id, RUN_CANCELED);
                    report.canceled.push(Arc::clone(id));
                }
            }
        } else {
            // Cascade failures first so a whole failed subtree settles in
            // one pass instead of one vertex per join.
            loop {
                let mut changed = false;
                for id in graph.nodes() {
                    if states[id] != NodeState::NotStarted {
                        continue;
                    }
                    let doomed = graph
                        .dependencies(id)
                        .iter()
                        .any(|d| states[d] == NodeState::Done(false));
                    if doomed {
                        states.insert(Arc::clone(id), NodeState::Done(false));
                        on_cancel(id, DEP_FAILED);
                        report.canceled.push(Arc::clone(id));
                        changed = true;
                    }
                }
                if !changed {
                    break;
                }
            }

            // Dispatch ready vertices in insertion order up to the bound
            for id in graph.nodes() {
                if running >= concurrency {
                    break;
                }
                if states[id] != NodeState::NotStarted {
                    continue;
                }
                let ready = graph
                    .dependencies(id)
                    .iter()
                    .all(|d| states[d] == NodeState::Done(true));
                if !ready {
                    continue;
                }
                debug!(vertex = %id, "dispatching");
                states.insert(Arc::clone(id), NodeState::Running);
                running += 1;
                let id_for_task = Arc::clone(id);
                let fut = worker(Arc::clone(id));
                join_set.spawn(async move { (id_for_task, fut.await) });
            }
        }

        if running == 0 {
            break;
        }

        // No timeout here: cancellation reaches workers through the token,
        // and each worker is responsible for returning promptly after it.
        if let Some(joined) = join_set.join_next().await {
            running -= 1;
            match joined {
                Ok((id, outcome)) => {
                    debug!(vertex = %id, ?outcome, "terminated");
                    if outcome == StepOutcome::Failed {
                        report.failed.push(Arc::clone(&id));
                    }
                    states.insert(id, NodeState::Done(outcome == StepOutcome::Ok));
                }
                Err(join_err) => {
                    // A panicked worker fails its vertex; identity is lost
                    // with the panic, so resync from the state table.
                    debug!(error = %join_err, "worker panicked");
                    for id in graph.nodes() {
                        if states[id] == NodeState::Running {
                            states.insert(Arc::clone(id), NodeState::Done(false));
                            report.failed.push(Arc::clone(id));
                            break;
                        }
                    }
                }
            }
        }
    }

    report
}
