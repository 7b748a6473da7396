mod logic;
pub mod resolver;

use std::time::Duration;

use crate::cassandra::CassandraNode;
use crate::errors::{BackupError, OperationContext, Result};
use crate::request::{RestoreOperationRequest, Validated};
use crate::storage::StorageClient;

pub use logic::RestoreSummary;
pub use resolver::{DataAcquisition, RestorationStrategy, resolve};

/// Public entry point for a single-node restore.
pub async fn run_restore_flow(
    request: &Validated<RestoreOperationRequest>,
    storage: &dyn StorageClient,
    node: &dyn CassandraNode,
) -> Result<RestoreSummary> {
    let context = OperationContext::new(&request.snapshot_tag, &request.base.storage_location);
    tracing::info!(context = %context, "Starting restore");

    let restore = logic::perform_restore(request, storage, node);
    let outcome = match request.base.duration {
        Some(seconds) => tokio::time::timeout(Duration::from_secs(seconds), restore)
            .await
            .unwrap_or_else(|_| {
                Err(BackupError::TimedOut(format!(
                    "restore did not finish within {seconds}s"
                )))
            }),
        None => restore.await,
    };

    outcome.map_err(|e| e.in_context(&context))
}
