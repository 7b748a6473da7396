// S3-compatible object storage (AWS, MinIO, Ceph RGW, Oracle's S3 compatibility API).
use std::path::Path;

use async_trait::async_trait;
use aws_sdk_s3 as s3;
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use s3::config::Region;
use s3::primitives::ByteStream;
use s3::types::{BucketLocationConstraint, CreateBucketConfiguration, MetadataDirective};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use url::Url;

use super::{RemoteObject, StorageClient, StorageError, StorageLocation, StorageResult};
use crate::config::S3Settings;

#[derive(Clone)]
pub struct S3StorageClient {
    client: s3::Client,
    endpoint_url: Option<String>,
    region: Option<String>,
}

impl S3StorageClient {
    /// Builds a client from explicit settings, falling back to the default AWS
    /// credential chain when no static keys are configured.
    pub async fn new(settings: &S3Settings, insecure: bool) -> StorageResult<Self> {
        if let Some(endpoint) = &settings.endpoint_url {
            check_endpoint(endpoint, insecure)?;
        }

        let mut loader = aws_config::defaults(s3::config::BehaviorVersion::latest());
        if let Some(region) = &settings.region {
            loader = loader.region(Region::new(region.clone()));
        }
        if let Some(endpoint) = &settings.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        if let (Some(key_id), Some(secret)) = (&settings.access_key_id, &settings.secret_access_key) {
            loader = loader.credentials_provider(s3::config::Credentials::new(
                key_id, secret, None, None, "Static",
            ));
        }
        let sdk_config = loader.load().await;
        let region = sdk_config.region().map(|r| r.to_string());

        // Custom endpoints (MinIO, Ceph) generally only serve path-style requests.
        let s3_config = s3::config::Builder::from(&sdk_config)
            .force_path_style(settings.endpoint_url.is_some())
            .build();

        Ok(S3StorageClient {
            client: s3::Client::from_conf(s3_config),
            endpoint_url: settings.endpoint_url.clone(),
            region,
        })
    }
}

/// Outside us-east-1, AWS rejects bucket creation without a matching location
/// constraint.
fn bucket_configuration(region: Option<&str>) -> Option<CreateBucketConfiguration> {
    match region {
        None | Some("us-east-1") => None,
        Some(region) => Some(
            CreateBucketConfiguration::builder()
                .location_constraint(BucketLocationConstraint::from(region))
                .build(),
        ),
    }
}

fn check_endpoint(endpoint: &str, insecure: bool) -> StorageResult<()> {
    let parsed = Url::parse(endpoint)
        .map_err(|e| StorageError::Config(format!("invalid endpoint_url {endpoint}: {e}")))?;
    if parsed.host_str().is_none() {
        return Err(StorageError::Config(format!("endpoint_url {endpoint} has no host")));
    }
    match parsed.scheme() {
        "https" => Ok(()),
        "http" if insecure => Ok(()),
        "http" => Err(StorageError::Config(format!(
            "endpoint {endpoint} is plain http; set 'insecure' on the request to allow it"
        ))),
        other => Err(StorageError::Config(format!(
            "endpoint {endpoint} uses unsupported scheme '{other}'"
        ))),
    }
}

fn map_sdk_error<E, R>(error: SdkError<E, R>, key: &str) -> StorageError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug,
{
    match &error {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            StorageError::Transient(format!("{key}: {error}"))
        }
        SdkError::ServiceError(service) => {
            let err = service.err();
            match err.code() {
                Some("NoSuchKey") | Some("NoSuchBucket") | Some("NotFound") => {
                    StorageError::NotFound(key.to_string())
                }
                Some("AccessDenied") | Some("Forbidden") => {
                    StorageError::PermissionDenied(key.to_string())
                }
                Some("SlowDown") | Some("InternalError") | Some("ServiceUnavailable")
                | Some("RequestTimeout") => StorageError::Transient(format!("{key}: {err}")),
                _ => StorageError::Backend(format!("{key}: {err}")),
            }
        }
        _ => StorageError::Backend(format!("{key}: {error}")),
    }
}

#[async_trait]
impl StorageClient for S3StorageClient {
    async fn list(&self, location: &StorageLocation, prefix: &str) -> StorageResult<Vec<RemoteObject>> {
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&location.bucket)
            .prefix(prefix)
            .into_paginator()
            .send();

        let mut objects = Vec::new();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| map_sdk_error(e, prefix))?;
            for object in page.contents() {
                if let Some(key) = object.key() {
                    objects.push(RemoteObject {
                        key: key.to_string(),
                        size: object.size().unwrap_or_default().max(0) as u64,
                    });
                }
            }
        }

        tracing::debug!(bucket = %location.bucket, prefix = %prefix, count = objects.len(), "Listed objects");
        Ok(objects)
    }

    async fn get(&self, location: &StorageLocation, key: &str, destination: &Path) -> StorageResult<u64> {
        if let Some(parent_dir) = destination.parent() {
            tokio::fs::create_dir_all(parent_dir).await?;
        }

        let mut object = self
            .client
            .get_object()
            .bucket(&location.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, key))?;

        let mut output_file = File::create(destination).await?;
        let mut total_bytes_downloaded = 0u64;
        while let Some(bytes_chunk) = object
            .body
            .try_next()
            .await
            .map_err(|e| StorageError::Transient(format!("{key}: {e}")))?
        {
            output_file.write_all(&bytes_chunk).await?;
            total_bytes_downloaded += bytes_chunk.len() as u64;
        }
        output_file.flush().await?;

        tracing::debug!(
            bucket = %location.bucket,
            key = %key,
            size_bytes = total_bytes_downloaded,
            "Downloaded object"
        );
        Ok(total_bytes_downloaded)
    }

    async fn put(&self, location: &StorageLocation, key: &str, source: &Path) -> StorageResult<()> {
        let body = ByteStream::from_path(source)
            .await
            .map_err(|e| StorageError::Backend(format!("{}: {e}", source.display())))?;

        self.client
            .put_object()
            .bucket(&location.bucket)
            .key(key)
            .body(body)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, key))?;

        tracing::debug!(bucket = %location.bucket, key = %key, "Uploaded object");
        Ok(())
    }

    async fn read(&self, location: &StorageLocation, key: &str) -> StorageResult<Vec<u8>> {
        let object = self
            .client
            .get_object()
            .bucket(&location.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, key))?;
        let bytes = object
            .body
            .collect()
            .await
            .map_err(|e| StorageError::Transient(format!("{key}: {e}")))?;
        Ok(bytes.into_bytes().to_vec())
    }

    async fn write(&self, location: &StorageLocation, key: &str, data: Vec<u8>) -> StorageResult<()> {
        self.client
            .put_object()
            .bucket(&location.bucket)
            .key(key)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| map_sdk_error(e, key))?;
        Ok(())
    }

    async fn refresh(&self, location: &StorageLocation, key: &str) -> StorageResult<()> {
        // A copy onto itself only succeeds when something changes; replacing the
        // metadata is enough and resets the last-modified time.
        self.client
            .copy_object()
            .bucket(&location.bucket)
            .key(key)
            .copy_source(format!("{}/{}", location.bucket, key))
            .metadata_directive(MetadataDirective::Replace)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, key))?;
        tracing::debug!(bucket = %location.bucket, key = %key, "Refreshed object");
        Ok(())
    }

    async fn exists(&self, location: &StorageLocation) -> StorageResult<bool> {
        match self.client.head_bucket().bucket(&location.bucket).send().await {
            Ok(_) => Ok(true),
            Err(SdkError::ServiceError(service)) if service.err().is_not_found() => Ok(false),
            Err(e) => Err(map_sdk_error(e, &location.bucket)),
        }
    }

    async fn create_if_missing(&self, location: &StorageLocation) -> StorageResult<()> {
        if self.exists(location).await? {
            return Ok(());
        }
        tracing::info!(
            bucket = %location.bucket,
            endpoint = self.endpoint_url.as_deref().unwrap_or("aws"),
            "Creating bucket"
        );
        let request = self
            .client
            .create_bucket()
            .bucket(&location.bucket)
            .set_create_bucket_configuration(bucket_configuration(self.region.as_deref()));
        match request.send().await {
            Ok(_) => Ok(()),
            Err(SdkError::ServiceError(service))
                if service.err().is_bucket_already_owned_by_you() =>
            {
                Ok(())
            }
            Err(e) => Err(map_sdk_error(e, &location.bucket)),
        }
    }
}
