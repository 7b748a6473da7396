//! Runs a global request across the cluster.
//!
//! The coordinator picks the nodes the request's `dc` filter selects, uploads the
//! cluster topology once, then hands a node-scoped copy of the request to every
//! selected node at the same time. Each node gets the same deadline; a node that
//! misses it is reported as timed out while finished nodes keep their results.

mod dispatch;

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio::time::Instant;
use uuid::Uuid;

use crate::errors::{BackupError, NodeFailure, Result};
use crate::manifest::topology_key;
use crate::request::{OperationRequest, Validated, parse_dc_filter};
use crate::retry::{RetrySpec, retry};
use crate::storage::{StorageClient, StorageError, StorageLocation};

pub use dispatch::{CommandDispatcher, NodeDispatcher};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterNode {
    pub node_id: String,
    pub datacenter: String,
    /// Host the dispatch command reaches the node on; the node id when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

/// Node and datacenter layout of a cluster, stored next to a global backup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterTopology {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<String>,
    pub nodes: Vec<ClusterNode>,
}

impl ClusterTopology {
    pub fn datacenters(&self) -> BTreeSet<&str> {
        self.nodes.iter().map(|n| n.datacenter.as_str()).collect()
    }

    /// Nodes in the given datacenters, or every node when `datacenters` is empty.
    pub fn select(&self, datacenters: &BTreeSet<String>) -> Vec<ClusterNode> {
        self.nodes
            .iter()
            .filter(|n| datacenters.is_empty() || datacenters.contains(&n.datacenter))
            .cloned()
            .collect()
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = BTreeSet::new();
        for node in &self.nodes {
            if node.node_id.trim().is_empty() || node.datacenter.trim().is_empty() {
                return Err(BackupError::Topology(
                    "every node needs a nodeId and a datacenter".to_string(),
                ));
            }
            if !seen.insert(node.node_id.as_str()) {
                return Err(BackupError::Topology(format!(
                    "node '{}' is listed more than once",
                    node.node_id
                )));
            }
        }
        Ok(())
    }
}

/// Writes the topology document for `snapshot_tag` under the location's cluster.
pub async fn upload_topology(
    storage: &dyn StorageClient,
    location: &StorageLocation,
    snapshot_tag: &str,
    topology: &ClusterTopology,
    retry_spec: &RetrySpec,
) -> Result<()> {
    let key = topology_key(&location.cluster_id, snapshot_tag);
    let body = serde_json::to_vec_pretty(topology)?;
    retry(retry_spec, &key, StorageError::is_transient, || {
        storage.write(location, &key, body.clone())
    })
    .await?;
    tracing::info!(key = %key, nodes = topology.nodes.len(), "Cluster topology uploaded");
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeStatus {
    Succeeded,
    Failed(String),
    TimedOut,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeStatus::Succeeded => f.write_str("succeeded"),
            NodeStatus::Failed(reason) => write!(f, "failed: {reason}"),
            NodeStatus::TimedOut => f.write_str("timed out"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeOutcome {
    pub node_id: String,
    pub datacenter: String,
    pub status: NodeStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationResult {
    pub operation_id: Uuid,
    pub nodes: Vec<NodeOutcome>,
}

pub struct Coordinator {
    dispatcher: Arc<dyn NodeDispatcher>,
    storage: Arc<dyn StorageClient>,
    topology: ClusterTopology,
}

impl Coordinator {
    pub fn new(
        dispatcher: Arc<dyn NodeDispatcher>,
        storage: Arc<dyn StorageClient>,
        topology: ClusterTopology,
    ) -> Self {
        Coordinator {
            dispatcher,
            storage,
            topology,
        }
    }

    pub async fn execute(&self, request: &Validated<OperationRequest>) -> Result<OperationResult> {
        let context = request.context();
        self.run(request).await.map_err(|e| e.in_context(&context))
    }

    async fn run(&self, request: &Validated<OperationRequest>) -> Result<OperationResult> {
        if !request.is_global() {
            return Err(BackupError::InvalidRequest(
                "only global requests are coordinated across the cluster".to_string(),
            ));
        }
        self.topology.validate()?;

        let datacenters = parse_dc_filter(request.dc());
        let targets = self.topology.select(&datacenters);
        if targets.is_empty() {
            return Err(BackupError::InvalidRequest(format!(
                "no cluster nodes in datacenters [{}], topology has [{}]",
                datacenters.into_iter().collect::<Vec<_>>().join(", "),
                self.topology.datacenters().into_iter().collect::<Vec<_>>().join(", ")
            )));
        }

        let operation_id = Uuid::new_v4();
        tracing::info!(
            %operation_id,
            operation = request.kind(),
            snapshot_tag = %request.snapshot_tag(),
            nodes = targets.len(),
            timeout_hours = request.timeout_hours(),
            "Coordinating global request"
        );

        let base = request.base();
        if base.skip_bucket_verification {
            tracing::debug!(location = %base.storage_location, "Skipping bucket verification");
        } else {
            // Before anything is written, so a bucket the request may create exists.
            base.storage_location
                .validate_exists(self.storage.as_ref(), request.creates_missing_bucket())
                .await?;
        }

        // Once for the whole cluster; a failure here stops everything.
        if request.uploads_topology() {
            upload_topology(
                self.storage.as_ref(),
                &request.base().storage_location,
                request.snapshot_tag(),
                &self.topology,
                &request.base().retry,
            )
            .await?;
        }

        let deadline = Instant::now() + Duration::from_secs(request.timeout_hours() * 3600);
        let mut tasks = JoinSet::new();
        let mut task_nodes = HashMap::new();
        for node in &targets {
            let scoped = request.for_node(&node.datacenter, &node.node_id);
            let dispatcher = Arc::clone(&self.dispatcher);
            let target = node.clone();
            let handle = tasks.spawn(async move {
                match tokio::time::timeout_at(deadline, dispatcher.dispatch(&target, &scoped)).await {
                    Ok(Ok(())) => NodeStatus::Succeeded,
                    Ok(Err(e)) => NodeStatus::Failed(e.to_string()),
                    Err(_) => NodeStatus::TimedOut,
                }
            });
            task_nodes.insert(handle.id(), node);
        }

        let mut statuses = HashMap::new();
        while let Some(joined) = tasks.join_next_with_id().await {
            let (id, status) = match joined {
                Ok((id, status)) => (id, status),
                Err(e) => (e.id(), NodeStatus::Failed(format!("dispatch task failed: {e}"))),
            };
            if let Some(node) = task_nodes.get(&id) {
                tracing::info!(%operation_id, node = %node.node_id, status = %status, "Node finished");
                statuses.insert(node.node_id.clone(), status);
            }
        }

        let nodes: Vec<NodeOutcome> = targets
            .into_iter()
            .map(|node| NodeOutcome {
                status: statuses
                    .remove(&node.node_id)
                    .unwrap_or_else(|| NodeStatus::Failed("no result".to_string())),
                node_id: node.node_id,
                datacenter: node.datacenter,
            })
            .collect();

        let failed: Vec<NodeFailure> = nodes
            .iter()
            .filter(|n| n.status != NodeStatus::Succeeded)
            .map(|n| NodeFailure {
                node: n.node_id.clone(),
                reason: n.status.to_string(),
            })
            .collect();
        if !failed.is_empty() {
            return Err(BackupError::PartialFailure { failed });
        }

        tracing::info!(%operation_id, nodes = nodes.len(), "Global request completed on every node");
        Ok(OperationResult {
            operation_id,
            nodes,
        })
    }
}
