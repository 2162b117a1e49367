//! Persistent graph - the stored DAG from a prior run
//!
//! One JSON object per namespace, `{"version": 1, "nodes": {name: [deps]}}`,
//! kept under `persistent_graph_key`. The planner diffs it against the
//! current plan to derive implicit destructions; every mutation happens
//! under the lock and writes the whole object back.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StratusError};
use crate::graph::Graph;

use super::{LockStore, LockToken, ObjectStore};

pub const GRAPH_VERSION: u32 = 1;
pub const CONTENT_TYPE: &str = "application/json";

/// Default lock TTL; a crashed run frees the graph after this long.
pub const LOCK_TTL: Duration = Duration::from_secs(60 * 60);

/// The stored adjacency map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedGraph {
    pub version: u32,
    pub nodes: BTreeMap<String, Vec<String>>,
}

impl Default for PersistedGraph {
    fn default() -> Self {
        Self {
            version: GRAPH_VERSION,
            nodes: BTreeMap::new(),
        }
    }
}

impl PersistedGraph {
    /// Snapshot of a plan graph.
    pub fn from_graph(graph: &Graph) -> Self {
        let mut nodes = BTreeMap::new();
        for node in graph.nodes() {
            let deps = graph
                .dependencies(node)
                .iter()
                .map(|d| d.to_string())
                .collect();
            nodes.insert(node.to_string(), deps);
        }
        Self {
            version: GRAPH_VERSION,
            nodes,
        }
    }

    /// Rebuild an in-memory graph (edges to unknown nodes are dropped; a
    /// hand-edited object should not wedge every future run).
    pub fn to_graph(&self) -> Graph {
        let mut graph = Graph::new();
        for name in self.nodes.keys() {
            graph.add(name);
        }
        for (name, deps) in &self.nodes {
            for dep in deps {
                if graph.contains(dep) {
                    let _ = graph.connect_idempotent(name, dep);
                }
            }
        }
        graph
    }

    /// Names present here but absent from the current plan, in stored order.
    pub fn removed_nodes(&self, current: &Graph) -> Vec<String> {
        self.nodes
            .keys()
            .filter(|name| !current.contains(name))
            .cloned()
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// The persistent graph's home: object + lock under one key.
pub struct PersistentGraphStore {
    objects: Arc<dyn ObjectStore>,
    locks: Arc<dyn LockStore>,
    key: String,
}

impl PersistentGraphStore {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        locks: Arc<dyn LockStore>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            objects,
            locks,
            key: key.into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Load the stored graph; absence is an empty graph.
    pub async fn load(&self) -> Result<PersistedGraph> {
        match self.objects.get(&self.key).await? {
            Some(body) => {
                let graph: PersistedGraph =
                    serde_json::from_slice(&body).map_err(|e| StratusError::GraphObjectInvalid {
                        key: self.key.clone(),
                        reason: e.to_string(),
                    })?;
                if graph.version != GRAPH_VERSION {
                    return Err(StratusError::GraphObjectInvalid {
                        key: self.key.clone(),
                        reason: format!("unsupported version {}", graph.version),
                    });
                }
                Ok(graph)
            }
            None => Ok(PersistedGraph::default()),
        }
    }

    pub async fn lock(&self) -> Result<LockToken> {
        self.locks.acquire(&self.key, LOCK_TTL).await
    }

    /// Write a new version. Ownership is re-proven through renew first so a
    /// lapsed lock cannot silently clobber another run's write.
    pub async fn save(&self, graph: &PersistedGraph, token: &LockToken) -> Result<()> {
        self.locks.renew(token).await?;
        let body = serde_json::to_vec(graph)?;
        self.objects.put(&self.key, &body, CONTENT_TYPE).await?;
        Ok(())
    }

    pub async fn release(&self, token: &LockToken) -> Result<()> {
        self.locks.release(token).await
    }
}
