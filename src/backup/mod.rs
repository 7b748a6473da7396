mod logic;

use std::time::Duration;

use crate::cassandra::CassandraNode;
use crate::coordinator::ClusterTopology;
use crate::errors::{BackupError, OperationContext, Result};
use crate::request::{BackupOperationRequest, Validated};
use crate::storage::StorageClient;

pub use logic::BackupSummary;

/// Public entry point for a single-node backup.
///
/// Runs under the request's `duration` limit when one is set. Every failure is
/// tagged with the request's snapshot tag and location.
pub async fn run_backup_flow(
    request: &mut Validated<BackupOperationRequest>,
    storage: &dyn StorageClient,
    node: &dyn CassandraNode,
    topology: Option<&ClusterTopology>,
) -> Result<BackupSummary> {
    let context = OperationContext::new(&request.snapshot_tag, &request.base.storage_location);
    tracing::info!(context = %context, "Starting backup");

    let outcome = match request.base.duration {
        Some(seconds) => tokio::time::timeout(
            Duration::from_secs(seconds),
            logic::perform_backup(request, storage, node, topology),
        )
        .await
        .unwrap_or_else(|_| {
            Err(BackupError::TimedOut(format!(
                "backup did not finish within {seconds}s"
            )))
        }),
        None => logic::perform_backup(request, storage, node, topology).await,
    };

    outcome.map_err(|e| e.in_context(&context))
}
