// cassandratool/src/config/mod.rs
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::coordinator::ClusterTopology;
use crate::request::{BackupOperationRequest, OperationRequest, RestoreOperationRequest};
use crate::storage::StorageProvider;

// Structs for deserializing config.json
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonS3StorageConfig {
    pub region: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub endpoint_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawJsonConfig {
    pub storage_providers: Option<Vec<String>>,
    pub s3_storage: Option<JsonS3StorageConfig>,
    pub cluster_topology_file: Option<PathBuf>,
    pub dispatch_command: Option<Vec<String>>,
    pub nodetool_path: Option<PathBuf>,
    pub cqlsh_path: Option<PathBuf>,
}

/// Connection settings shared by every S3-compatible provider. Unset fields fall
/// back to the AWS SDK's own environment and profile resolution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct S3Settings {
    pub region: Option<String>,
    pub endpoint_url: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub supported_providers: BTreeSet<String>,
    pub s3: S3Settings,
    pub cluster_topology_file: Option<PathBuf>,
    pub dispatch_command: Option<Vec<String>>,
    pub nodetool_path: Option<PathBuf>,
    pub cqlsh_path: Option<PathBuf>,
}

/// Providers this build has a storage client for.
pub fn default_supported_providers() -> BTreeSet<String> {
    StorageProvider::ALL
        .into_iter()
        .filter(|p| p.is_filesystem() || p.is_s3_compatible())
        .map(|p| p.token().to_string())
        .collect()
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value.clone().filter(|s| !s.trim().is_empty())
}

impl AppConfig {
    pub fn load_from_json(config_path: &Path) -> Result<Self> {
        let config_content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file at {}", config_path.display()))?;
        let raw_json_config: RawJsonConfig = serde_json::from_str(&config_content)
            .with_context(|| {
                format!(
                    "Failed to parse JSON from config file at {}",
                    config_path.display()
                )
            })?;
        Self::from_raw(raw_json_config)
    }

    pub fn from_raw(raw: RawJsonConfig) -> Result<Self> {
        let supported_providers = match &raw.storage_providers {
            Some(tokens) => {
                let buildable = default_supported_providers();
                let mut providers = BTreeSet::new();
                for token in tokens {
                    let token = token.trim().to_lowercase();
                    if StorageProvider::from_token(&token).is_none() {
                        anyhow::bail!("Unknown storage provider '{}' in storage_providers", token);
                    }
                    if !buildable.contains(&token) {
                        anyhow::bail!(
                            "Storage provider '{}' is listed in storage_providers but has no client in this build",
                            token
                        );
                    }
                    providers.insert(token);
                }
                providers
            }
            None => default_supported_providers(),
        };

        let s3 = raw
            .s3_storage
            .as_ref()
            .map(|s3_raw| {
                let settings = S3Settings {
                    region: non_empty(&s3_raw.region),
                    endpoint_url: non_empty(&s3_raw.endpoint_url),
                    access_key_id: non_empty(&s3_raw.access_key_id),
                    secret_access_key: non_empty(&s3_raw.secret_access_key),
                };
                if settings.access_key_id.is_some() != settings.secret_access_key.is_some() {
                    // Only one half of a static credential pair; the SDK chain takes over.
                    tracing::warn!(
                        "s3_storage has only one of access_key_id/secret_access_key; falling back to the default AWS credential chain"
                    );
                }
                settings
            })
            .unwrap_or_default();

        if let Some(command) = &raw.dispatch_command {
            if command.is_empty() || command[0].trim().is_empty() {
                anyhow::bail!("dispatch_command must name a program to run");
            }
        }

        Ok(AppConfig {
            supported_providers,
            s3,
            cluster_topology_file: raw.cluster_topology_file,
            dispatch_command: raw.dispatch_command,
            nodetool_path: raw.nodetool_path,
            cqlsh_path: raw.cqlsh_path,
        })
    }

    pub fn load_topology(&self) -> Result<ClusterTopology> {
        let path = self
            .cluster_topology_file
            .as_ref()
            .context("cluster_topology_file must be set in config.json for global requests")?;
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read cluster topology at {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse cluster topology at {}", path.display()))
    }
}

pub fn load_backup_request_from_json(request_path: &Path) -> Result<BackupOperationRequest> {
    let content = fs::read_to_string(request_path)
        .with_context(|| format!("Failed to read backup request at {}", request_path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse backup request at {}", request_path.display()))
}

pub fn load_restore_request_from_json(request_path: &Path) -> Result<RestoreOperationRequest> {
    let content = fs::read_to_string(request_path)
        .with_context(|| format!("Failed to read restore request at {}", request_path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse restore request at {}", request_path.display()))
}

/// Loads whichever request type `operation` names.
pub fn load_request_from_json(operation: &str, request_path: &Path) -> Result<OperationRequest> {
    match operation {
        "backup" => Ok(OperationRequest::Backup(load_backup_request_from_json(request_path)?)),
        "restore" => Ok(OperationRequest::Restore(load_restore_request_from_json(request_path)?)),
        other => Err(anyhow::anyhow!("Unknown operation '{}'", other)),
    }
}

/// Parses a request sent inline, as the coordinator does over stdin.
pub fn parse_request(operation: &str, content: &str) -> Result<OperationRequest> {
    match operation {
        "backup" => Ok(OperationRequest::Backup(
            serde_json::from_str(content).context("Failed to parse backup request")?,
        )),
        "restore" => Ok(OperationRequest::Restore(
            serde_json::from_str(content).context("Failed to parse restore request")?,
        )),
        other => Err(anyhow::anyhow!("Unknown operation '{}'", other)),
    }
}
