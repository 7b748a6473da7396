//! Operation requests and their validation.
//!
//! Requests are plain data: they deserialize from the JSON form the CLI and the
//! coordinator exchange, and carry no behaviour beyond accessors. Validation
//! (`validate` on each request type) fills defaults, rejects inconsistent
//! combinations, and hands back a [`Validated`] wrapper that the executors require.

pub mod backup;
pub mod entities;
pub mod restore;

use std::collections::BTreeSet;
use std::ops::Deref;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::{BackupError, OperationContext};
use crate::retry::RetrySpec;
use crate::storage::StorageLocation;

pub use backup::BackupOperationRequest;
pub use entities::{DatabaseEntities, Entity, TableSelection};
pub use restore::{RestorationMode, RestoreOperationRequest};

pub const DEFAULT_CASSANDRA_DIRECTORY: &str = "/var/lib/cassandra";
pub const DEFAULT_TIMEOUT_HOURS: i64 = 5;
pub const DEFAULT_CONCURRENT_CONNECTIONS: u32 = 10;

/// Tells validation whether the process runs inside the managed orchestration
/// environment, and where its credentials secret lives.
pub trait SecretResolver: Send + Sync {
    fn is_managed_environment(&self) -> bool;
    fn resolve_secret_name(&self) -> Option<String>;
    fn resolve_namespace(&self) -> Option<String>;
}

const SERVICE_ACCOUNT_NAMESPACE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

/// Reads the Kubernetes environment from process environment variables and the
/// mounted service account.
#[derive(Debug, Clone, Default)]
pub struct EnvironmentSecretResolver;

impl SecretResolver for EnvironmentSecretResolver {
    fn is_managed_environment(&self) -> bool {
        std::env::var_os("KUBERNETES_SERVICE_HOST").is_some()
            || std::env::var("CASSANDRATOOL_K8S_CLIENT")
                .map(|v| v.eq_ignore_ascii_case("true"))
                .unwrap_or(false)
    }

    fn resolve_secret_name(&self) -> Option<String> {
        std::env::var("CASSANDRATOOL_K8S_SECRET_NAME")
            .ok()
            .filter(|s| !s.trim().is_empty())
    }

    fn resolve_namespace(&self) -> Option<String> {
        std::env::var("POD_NAMESPACE")
            .ok()
            .or_else(|| std::fs::read_to_string(SERVICE_ACCOUNT_NAMESPACE).ok())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }
}

/// What validation checks a request against.
pub struct ValidationEnvironment<'a> {
    pub supported_providers: &'a BTreeSet<String>,
    pub secrets: &'a dyn SecretResolver,
}

/// A request that passed validation. Only this module can build one.
#[derive(Debug, Clone)]
pub struct Validated<T>(T);

impl<T> Validated<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> Deref for Validated<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

/// A validated request, split by kind for the node-level executors.
#[derive(Debug, Clone)]
pub enum ValidatedOperation {
    Backup(Validated<BackupOperationRequest>),
    Restore(Validated<RestoreOperationRequest>),
}

impl Validated<OperationRequest> {
    pub fn split(self) -> ValidatedOperation {
        match self.0 {
            OperationRequest::Backup(r) => ValidatedOperation::Backup(Validated(r)),
            OperationRequest::Restore(r) => ValidatedOperation::Restore(Validated(r)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxySettings {
    #[serde(default)]
    pub proxy_type: Option<String>,
    pub proxy_host: Option<String>,
    pub proxy_port: Option<u16>,
    pub proxy_user_name: Option<String>,
    pub proxy_password: Option<String>,
    pub proxy_protocol: Option<String>,
}

impl ProxySettings {
    fn validate(&self) -> Result<(), BackupError> {
        if self.proxy_host.is_some() != self.proxy_port.is_some() {
            return Err(BackupError::InvalidRequest(
                "proxySettings needs both proxyHost and proxyPort".to_string(),
            ));
        }
        if self.proxy_user_name.is_some() != self.proxy_password.is_some() {
            return Err(BackupError::InvalidRequest(
                "proxySettings needs both proxyUserName and proxyPassword".to_string(),
            ));
        }
        if let Some(protocol) = &self.proxy_protocol {
            if !matches!(protocol.to_ascii_lowercase().as_str(), "http" | "https") {
                return Err(BackupError::InvalidRequest(format!(
                    "proxySettings.proxyProtocol must be http or https, got '{protocol}'"
                )));
            }
        }
        // The storage clients connect directly; accepting a proxy would silently bypass it.
        if let (Some(host), Some(port)) = (&self.proxy_host, self.proxy_port) {
            return Err(BackupError::InvalidRequest(format!(
                "proxySettings name proxy {host}:{port}, but storage traffic cannot be routed through a proxy"
            )));
        }
        Ok(())
    }
}

fn default_concurrent_connections() -> u32 {
    DEFAULT_CONCURRENT_CONNECTIONS
}

/// Fields shared by backup and restore requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BaseOperationRequest {
    pub storage_location: StorageLocation,
    /// Upper bound, in seconds, for the node-level run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    /// Bytes per second, advisory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bandwidth: Option<u64>,
    #[serde(default = "default_concurrent_connections")]
    pub concurrent_connections: u32,
    #[serde(default)]
    pub cassandra_directory: Option<PathBuf>,
    #[serde(default)]
    pub k8s_namespace: Option<String>,
    #[serde(default)]
    pub k8s_secret_name: Option<String>,
    #[serde(default)]
    pub insecure: bool,
    #[serde(default)]
    pub create_missing_bucket: bool,
    #[serde(default)]
    pub skip_bucket_verification: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_settings: Option<ProxySettings>,
    #[serde(default)]
    pub retry: RetrySpec,
    #[serde(default)]
    pub skip_refreshing: bool,
}

impl BaseOperationRequest {
    pub fn new(storage_location: StorageLocation) -> Self {
        BaseOperationRequest {
            storage_location,
            duration: None,
            bandwidth: None,
            concurrent_connections: DEFAULT_CONCURRENT_CONNECTIONS,
            cassandra_directory: None,
            k8s_namespace: None,
            k8s_secret_name: None,
            insecure: false,
            create_missing_bucket: false,
            skip_bucket_verification: false,
            proxy_settings: None,
            retry: RetrySpec::default(),
            skip_refreshing: false,
        }
    }

    pub fn resolve_kubernetes_secret_name(&self, secrets: &dyn SecretResolver) -> Option<String> {
        self.k8s_secret_name
            .clone()
            .filter(|s| !s.trim().is_empty())
            .or_else(|| secrets.resolve_secret_name())
    }

    pub fn resolve_kubernetes_namespace(&self, secrets: &dyn SecretResolver) -> Option<String> {
        self.k8s_namespace
            .clone()
            .filter(|s| !s.trim().is_empty())
            .or_else(|| secrets.resolve_namespace())
    }

    /// Validated Cassandra directory; only meaningful after validation.
    pub fn cassandra_directory(&self) -> &Path {
        self.cassandra_directory
            .as_deref()
            .unwrap_or(Path::new(DEFAULT_CASSANDRA_DIRECTORY))
    }

    pub(crate) fn validate(&mut self, env: &ValidationEnvironment<'_>) -> Result<(), BackupError> {
        let provider = self.storage_location.provider.token();
        if !env.supported_providers.contains(provider) {
            return Err(BackupError::InvalidRequest(format!(
                "storage provider '{provider}' is not supported, expected one of: {}",
                env.supported_providers
                    .iter()
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(", ")
            )));
        }

        if self.concurrent_connections < 1 {
            return Err(BackupError::InvalidRequest(
                "concurrentConnections must be at least 1".to_string(),
            ));
        }
        if self.duration == Some(0) {
            return Err(BackupError::InvalidRequest(
                "duration must be positive when set".to_string(),
            ));
        }

        self.retry.validate()?;
        if let Some(proxy) = &self.proxy_settings {
            proxy.validate()?;
        }

        let directory = resolve_cassandra_directory(self.cassandra_directory.take(), |dir| dir.exists())?;
        self.cassandra_directory = Some(directory);

        if env.secrets.is_managed_environment() {
            if self.resolve_kubernetes_secret_name(env.secrets).is_none() {
                return Err(BackupError::InvalidRequest(
                    "running in Kubernetes or as a Kubernetes client but the secret name for backups cannot be resolved"
                        .to_string(),
                ));
            }
            if self.resolve_kubernetes_namespace(env.secrets).is_none() {
                return Err(BackupError::InvalidRequest(
                    "running in Kubernetes or as a Kubernetes client but the namespace for backups cannot be resolved"
                        .to_string(),
                ));
            }
        }

        Ok(())
    }
}

/// An unset or root directory falls back to the default install path, which must
/// then exist like any other.
pub(crate) fn resolve_cassandra_directory(
    requested: Option<PathBuf>,
    exists: impl Fn(&Path) -> bool,
) -> Result<PathBuf, BackupError> {
    let directory = match requested {
        Some(dir) if !is_filesystem_root(&dir) => dir,
        _ => PathBuf::from(DEFAULT_CASSANDRA_DIRECTORY),
    };
    if !exists(&directory) {
        return Err(BackupError::InvalidRequest(format!(
            "cassandraDirectory {} does not exist",
            directory.display()
        )));
    }
    Ok(directory)
}

fn is_filesystem_root(path: &Path) -> bool {
    path.has_root() && path.components().all(|c| matches!(c, Component::RootDir | Component::Prefix(_)))
}

fn validate_snapshot_tag(tag: &str) -> Result<(), BackupError> {
    if tag.trim().is_empty() {
        return Err(BackupError::InvalidRequest("snapshotTag must not be empty".to_string()));
    }
    if tag.contains('/') || tag.contains(char::is_whitespace) {
        return Err(BackupError::InvalidRequest(format!(
            "snapshotTag '{tag}' must not contain '/' or whitespace"
        )));
    }
    Ok(())
}

/// Datacenters named by a comma-separated `dc` filter; empty means all.
pub fn parse_dc_filter(dc: Option<&str>) -> BTreeSet<String> {
    dc.map(|dc| {
        dc.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    })
    .unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationRequest {
    Backup(BackupOperationRequest),
    Restore(RestoreOperationRequest),
}

impl OperationRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            OperationRequest::Backup(_) => "backup",
            OperationRequest::Restore(_) => "restore",
        }
    }

    pub fn base(&self) -> &BaseOperationRequest {
        match self {
            OperationRequest::Backup(r) => &r.base,
            OperationRequest::Restore(r) => &r.base,
        }
    }

    pub fn snapshot_tag(&self) -> &str {
        match self {
            OperationRequest::Backup(r) => &r.snapshot_tag,
            OperationRequest::Restore(r) => &r.snapshot_tag,
        }
    }

    pub fn is_global(&self) -> bool {
        match self {
            OperationRequest::Backup(r) => r.global_request,
            OperationRequest::Restore(r) => r.global_request,
        }
    }

    pub fn dc(&self) -> Option<&str> {
        match self {
            OperationRequest::Backup(r) => r.dc.as_deref(),
            OperationRequest::Restore(r) => r.dc.as_deref(),
        }
    }

    /// Effective coordination timeout in hours.
    pub fn timeout_hours(&self) -> u64 {
        let raw = match self {
            OperationRequest::Backup(r) => r.timeout,
            OperationRequest::Restore(r) => r.timeout,
        };
        effective_timeout(raw) as u64
    }

    /// Whether a missing bucket may be created. Restores only ever read from it.
    pub fn creates_missing_bucket(&self) -> bool {
        match self {
            OperationRequest::Backup(r) => r.base.create_missing_bucket,
            OperationRequest::Restore(_) => false,
        }
    }

    pub fn uploads_topology(&self) -> bool {
        match self {
            OperationRequest::Backup(r) => r.upload_cluster_topology,
            OperationRequest::Restore(_) => false,
        }
    }

    /// The single-node request a coordinator sends to one cluster member.
    pub fn for_node(&self, datacenter: &str, node_id: &str) -> OperationRequest {
        let mut scoped = self.clone();
        match &mut scoped {
            OperationRequest::Backup(r) => {
                r.base.storage_location = r.base.storage_location.for_node(datacenter, node_id);
                r.global_request = false;
                // The coordinator uploads the topology once for the whole cluster.
                r.upload_cluster_topology = false;
            }
            OperationRequest::Restore(r) => {
                r.base.storage_location = r.base.storage_location.for_node(datacenter, node_id);
                r.global_request = false;
                r.target_node_id = None;
            }
        }
        scoped
    }

    pub fn context(&self) -> OperationContext {
        OperationContext::new(self.snapshot_tag(), &self.base().storage_location)
    }

    pub fn validate(self, env: &ValidationEnvironment<'_>) -> Result<Validated<OperationRequest>, BackupError> {
        let context = self.context();
        let validated = match self {
            OperationRequest::Backup(r) => OperationRequest::Backup(r.validate(env)?.into_inner()),
            OperationRequest::Restore(r) => OperationRequest::Restore(r.validate(env)?.into_inner()),
        };
        tracing::debug!(context = %context, "Request validated");
        Ok(Validated(validated))
    }

    pub fn to_json(&self) -> Result<String, BackupError> {
        Ok(match self {
            OperationRequest::Backup(r) => serde_json::to_string(r)?,
            OperationRequest::Restore(r) => serde_json::to_string(r)?,
        })
    }
}

pub(crate) fn effective_timeout(raw: i64) -> i64 {
    if raw < 1 { DEFAULT_TIMEOUT_HOURS } else { raw }
}

fn default_timeout() -> i64 {
    DEFAULT_TIMEOUT_HOURS
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Secret resolver with fixed answers.
    pub(crate) struct StaticSecrets {
        pub(crate) managed: bool,
        pub(crate) secret: Option<String>,
        pub(crate) namespace: Option<String>,
    }

    impl StaticSecrets {
        pub(crate) fn unmanaged() -> Self {
            StaticSecrets {
                managed: false,
                secret: None,
                namespace: None,
            }
        }
    }

    impl SecretResolver for StaticSecrets {
        fn is_managed_environment(&self) -> bool {
            self.managed
        }

        fn resolve_secret_name(&self) -> Option<String> {
            self.secret.clone()
        }

        fn resolve_namespace(&self) -> Option<String> {
            self.namespace.clone()
        }
    }

    pub(crate) fn all_providers() -> BTreeSet<String> {
        crate::config::default_supported_providers()
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    fn base(dir: &Path) -> BaseOperationRequest {
        let mut base = BaseOperationRequest::new(StorageLocation::parse("s3://b/prod/dc1/n1").unwrap());
        base.cassandra_directory = Some(dir.to_path_buf());
        base
    }

    #[test]
    fn rejects_unsupported_provider() {
        let dir = tempfile::tempdir().unwrap();
        let mut request = base(dir.path());
        request.storage_location = StorageLocation::parse("gcp://b/prod/dc1/n1").unwrap();
        let providers = all_providers();
        let secrets = StaticSecrets::unmanaged();
        let env = ValidationEnvironment {
            supported_providers: &providers,
            secrets: &secrets,
        };
        let err = request.validate(&env).unwrap_err();
        assert!(err.to_string().contains("gcp"));
    }

    #[test]
    fn managed_environment_requires_secret_and_namespace() {
        let dir = tempfile::tempdir().unwrap();
        let providers = all_providers();

        let missing_namespace = StaticSecrets {
            managed: true,
            secret: Some("backup-secrets".to_string()),
            namespace: None,
        };
        let env = ValidationEnvironment {
            supported_providers: &providers,
            secrets: &missing_namespace,
        };
        let err = base(dir.path()).validate(&env).unwrap_err();
        assert!(err.to_string().contains("namespace"));

        // Values on the request win over the environment.
        let mut request = base(dir.path());
        request.k8s_namespace = Some("cassandra".to_string());
        request.validate(&env).unwrap();

        let nothing = StaticSecrets {
            managed: true,
            secret: None,
            namespace: Some("cassandra".to_string()),
        };
        let env = ValidationEnvironment {
            supported_providers: &providers,
            secrets: &nothing,
        };
        let err = base(dir.path()).validate(&env).unwrap_err();
        assert!(err.to_string().contains("secret name"));
    }

    #[test]
    fn proxy_settings_need_host_and_port() {
        let dir = tempfile::tempdir().unwrap();
        let mut request = base(dir.path());
        request.proxy_settings = Some(ProxySettings {
            proxy_type: None,
            proxy_host: Some("proxy".to_string()),
            proxy_port: None,
            proxy_user_name: None,
            proxy_password: None,
            proxy_protocol: None,
        });
        let providers = all_providers();
        let secrets = StaticSecrets::unmanaged();
        let env = ValidationEnvironment {
            supported_providers: &providers,
            secrets: &secrets,
        };
        assert!(matches!(request.validate(&env), Err(BackupError::InvalidRequest(_))));
    }

    #[test]
    fn complete_proxy_settings_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let mut request = base(dir.path());
        request.proxy_settings = Some(ProxySettings {
            proxy_type: Some("HTTP".to_string()),
            proxy_host: Some("proxy.internal".to_string()),
            proxy_port: Some(3128),
            proxy_user_name: None,
            proxy_password: None,
            proxy_protocol: Some("http".to_string()),
        });
        let providers = all_providers();
        let secrets = StaticSecrets::unmanaged();
        let env = ValidationEnvironment {
            supported_providers: &providers,
            secrets: &secrets,
        };
        let err = request.validate(&env).unwrap_err();
        assert!(matches!(err, BackupError::InvalidRequest(_)));
        assert!(err.to_string().contains("proxy.internal:3128"));

        // Settings that name no proxy change nothing.
        let mut request = base(dir.path());
        request.proxy_settings = Some(ProxySettings {
            proxy_type: None,
            proxy_host: None,
            proxy_port: None,
            proxy_user_name: None,
            proxy_password: None,
            proxy_protocol: None,
        });
        request.validate(&env).unwrap();
    }

    #[test]
    fn unset_cassandra_directory_falls_back_to_default() {
        let default = Path::new(DEFAULT_CASSANDRA_DIRECTORY);
        let resolved = resolve_cassandra_directory(None, |dir| dir == default).unwrap();
        assert_eq!(resolved, default);

        let err = resolve_cassandra_directory(None, |_| false).unwrap_err();
        assert!(matches!(err, BackupError::InvalidRequest(_)));
        assert!(err.to_string().contains(DEFAULT_CASSANDRA_DIRECTORY));
    }

    #[test]
    fn root_cassandra_directory_is_replaced_not_accepted() {
        let default = Path::new(DEFAULT_CASSANDRA_DIRECTORY);
        let resolved = resolve_cassandra_directory(Some("/".into()), |dir| dir == default).unwrap();
        assert_eq!(resolved, default);

        let err = resolve_cassandra_directory(Some("/".into()), |dir| dir == Path::new("/")).unwrap_err();
        assert!(err.to_string().contains(DEFAULT_CASSANDRA_DIRECTORY));
    }

    #[test]
    fn filesystem_root_detection() {
        assert!(is_filesystem_root(Path::new("/")));
        assert!(!is_filesystem_root(Path::new("/var/lib/cassandra")));
        assert!(!is_filesystem_root(Path::new("relative")));
    }

    #[test]
    fn timeout_below_one_is_coerced() {
        assert_eq!(effective_timeout(0), 5);
        assert_eq!(effective_timeout(-3), 5);
        assert_eq!(effective_timeout(1), 1);
        assert_eq!(effective_timeout(12), 12);
    }

    #[test]
    fn dc_filter_parsing() {
        assert!(parse_dc_filter(None).is_empty());
        assert!(parse_dc_filter(Some(" , ")).is_empty());
        let dcs = parse_dc_filter(Some("dc1, dc2"));
        assert_eq!(dcs.into_iter().collect::<Vec<_>>(), vec!["dc1", "dc2"]);
    }
}
