use std::fmt;

use thiserror::Error;

use crate::storage::{StorageError, StorageLocation};

/// Identifies the operation a failure belongs to, so a failure on one node can be
/// matched up with the rest of a multi-node run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationContext {
    pub snapshot_tag: String,
    pub cluster: String,
    pub datacenter: String,
    pub node: Option<String>,
    pub location: String,
}

impl OperationContext {
    pub fn new(snapshot_tag: &str, location: &StorageLocation) -> Self {
        OperationContext {
            snapshot_tag: snapshot_tag.to_string(),
            cluster: location.cluster_id.clone(),
            datacenter: location.datacenter.clone(),
            node: location.node_id.clone(),
            location: location.to_string(),
        }
    }
}

impl fmt::Display for OperationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "snapshot '{}', cluster '{}', dc '{}', node '{}', location {}",
            self.snapshot_tag,
            self.cluster,
            self.datacenter,
            self.node.as_deref().unwrap_or("-"),
            self.location
        )
    }
}

/// A node that did not complete its part of a coordinated operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeFailure {
    pub node: String,
    pub reason: String,
}

impl fmt::Display for NodeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.node, self.reason)
    }
}

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Invalid storage location '{descriptor}': {reason}")]
    InvalidLocation { descriptor: String, reason: String },

    #[error("Storage location {location} is unreachable: {reason}")]
    LocationUnreachable { location: String, reason: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Raised when no restoration strategy matches a request. Validation is meant to
    /// rule this out, so seeing it means a bug, not bad input.
    #[error("Unable to resolve a restoration strategy: {0}")]
    UnresolvableStrategy(String),

    #[error("Backup '{snapshot_tag}' is incomplete, missing from storage: {}", missing.join(", "))]
    IncompleteBackup {
        snapshot_tag: String,
        missing: Vec<String>,
    },

    #[error("Coordinated operation failed on nodes: {}", format_failures(failed))]
    PartialFailure { failed: Vec<NodeFailure> },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("SSTable import failed: {0}")]
    Import(String),

    #[error("Database command failed: {0}")]
    Database(String),

    #[error("Cluster topology error: {0}")]
    Topology(String),

    #[error("Dispatch to node '{node}' failed: {reason}")]
    Dispatch { node: String, reason: String },

    #[error("Operation timed out: {0}")]
    TimedOut(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serde JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{context}: {source}")]
    Operation {
        context: OperationContext,
        #[source]
        source: Box<BackupError>,
    },
}

fn format_failures(failed: &[NodeFailure]) -> String {
    failed
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl BackupError {
    pub fn in_context(self, context: &OperationContext) -> Self {
        match self {
            // Already tagged further down the stack.
            BackupError::Operation { .. } => self,
            other => BackupError::Operation {
                context: context.clone(),
                source: Box::new(other),
            },
        }
    }

    /// The underlying error with any operation context stripped.
    pub fn root(&self) -> &BackupError {
        match self {
            BackupError::Operation { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn failed_nodes(&self) -> Vec<&str> {
        match self.root() {
            BackupError::PartialFailure { failed } => {
                failed.iter().map(|f| f.node.as_str()).collect()
            }
            _ => Vec::new(),
        }
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
