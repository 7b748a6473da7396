//! Picks how a restore request gets its data onto the node.
//!
//! [`resolve`] is a pure function of the request: nothing is probed, so the same
//! request always yields the same strategy.

use std::fmt;

use crate::errors::BackupError;
use crate::request::{RestorationMode, RestoreOperationRequest};

/// How backup files reach the target node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataAcquisition {
    /// Link the files already on this node's filesystem. No bytes move.
    Hardlink,
    /// Byte-copy from a filesystem location shared with the source node.
    Copy,
    /// Download from object storage.
    Download,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestorationStrategy {
    /// Same node, filesystem storage.
    Hardlink,
    /// Different node, filesystem storage reachable from the target.
    Copy,
    /// Object storage: verify the inventory, download, then import.
    DownloadAndImport,
    /// Overlay files into the live data directory; the caller restarts the node.
    InPlace { acquisition: DataAcquisition },
}

impl RestorationStrategy {
    pub fn acquisition(&self) -> DataAcquisition {
        match self {
            RestorationStrategy::Hardlink => DataAcquisition::Hardlink,
            RestorationStrategy::Copy => DataAcquisition::Copy,
            RestorationStrategy::DownloadAndImport => DataAcquisition::Download,
            RestorationStrategy::InPlace { acquisition } => *acquisition,
        }
    }

    /// Whether the placed files are handed to the node's import.
    pub fn imports(&self) -> bool {
        !matches!(self, RestorationStrategy::InPlace { .. })
    }
}

impl fmt::Display for RestorationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestorationStrategy::Hardlink => f.write_str("hardlink"),
            RestorationStrategy::Copy => f.write_str("copy"),
            RestorationStrategy::DownloadAndImport => f.write_str("download-and-import"),
            RestorationStrategy::InPlace { acquisition } => write!(f, "in-place ({acquisition:?})"),
        }
    }
}

pub fn resolve(request: &RestoreOperationRequest) -> Result<RestorationStrategy, BackupError> {
    if request.global_request {
        return Err(BackupError::UnresolvableStrategy(
            "a global restore must be split per node before a strategy is chosen".to_string(),
        ));
    }
    let (Some(source), Some(target)) = (request.source_node_id(), request.target_node_id()) else {
        return Err(BackupError::UnresolvableStrategy(format!(
            "storage location {} names no source node",
            request.base.storage_location
        )));
    };

    let acquisition = match (request.base.storage_location.is_filesystem(), source == target) {
        (true, true) => DataAcquisition::Hardlink,
        (true, false) => DataAcquisition::Copy,
        (false, _) => DataAcquisition::Download,
    };

    Ok(match (request.restoration_mode, acquisition) {
        (RestorationMode::InPlace, acquisition) => RestorationStrategy::InPlace { acquisition },
        (RestorationMode::Import, DataAcquisition::Hardlink) => RestorationStrategy::Hardlink,
        (RestorationMode::Import, DataAcquisition::Copy) => RestorationStrategy::Copy,
        (RestorationMode::Import, DataAcquisition::Download) => RestorationStrategy::DownloadAndImport,
    })
}
