use std::sync::Arc;

use super::{LocalStorageClient, S3StorageClient, StorageClient, StorageError, StorageLocation, StorageResult};
use crate::config::S3Settings;

/// Builds the storage client serving a location's provider.
pub async fn create_client(
    location: &StorageLocation,
    s3_settings: &S3Settings,
    insecure: bool,
) -> StorageResult<Arc<dyn StorageClient>> {
    let provider = location.provider;

    if provider.is_filesystem() {
        return Ok(Arc::new(LocalStorageClient::new()));
    }

    if provider.is_s3_compatible() {
        let client = S3StorageClient::new(s3_settings, insecure).await?;
        return Ok(Arc::new(client));
    }

    Err(StorageError::Config(format!(
        "storage provider '{provider}' has no client in this build"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn providers_without_a_client_are_refused() {
        let location = StorageLocation::parse("azure://b/prod/dc1/n1").unwrap();
        let err = create_client(&location, &S3Settings::default(), false)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, StorageError::Config(_)));
    }

    #[tokio::test]
    async fn filesystem_locations_get_the_local_client() {
        let location = StorageLocation::parse("file:///backups/b/prod/dc1/n1").unwrap();
        assert!(create_client(&location, &S3Settings::default(), false).await.is_ok());
    }
}
