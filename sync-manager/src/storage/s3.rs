//! S3-compatible object store client.
//!
//! Targets providers such as OVH that expose an S3 API on a custom endpoint,
//! so the endpoint, region name and static credentials all come from the
//! storage location rather than the ambient AWS configuration.

use std::path::Path;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Credentials;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use tokio::io::AsyncWriteExt;
use tracing::info;

use super::{ObjectStore, StorageLocation, StoreFailure};

pub struct S3ObjectStore {
    client: Client,
    bucket: String,
    endpoint: String,
}

impl S3ObjectStore {
    /// Build a client bound to the bucket of `location`
    pub async fn connect(location: &StorageLocation) -> Self {
        let credentials = Credentials::new(
            location.access_key.clone(),
            location.secret_key.clone(),
            None,
            None,
            "sync-manager",
        );

        let shared = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(location.region_name.clone()))
            .endpoint_url(&location.endpoint)
            .credentials_provider(credentials)
            .load()
            .await;

        let s3_config = aws_sdk_s3::config::Builder::from(&shared)
            .force_path_style(location.force_path_style)
            .build();

        info!(
            region = %location.region,
            bucket = %location.bucket_name,
            endpoint = %location.endpoint,
            "S3 client initialized"
        );

        Self {
            client: Client::from_conf(s3_config),
            bucket: location.bucket_name.clone(),
            endpoint: location.endpoint.clone(),
        }
    }
}

fn backend<E: std::error::Error>(error: E) -> StoreFailure {
    StoreFailure::Backend(DisplayErrorContext(&error).to_string())
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    fn describe(&self) -> String {
        format!("s3://{} ({})", self.bucket, self.endpoint)
    }

    async fn put(&self, key: &str, local: &Path) -> Result<(), StoreFailure> {
        let body = ByteStream::from_path(local).await.map_err(backend)?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .send()
            .await
            .map_err(backend)?;

        Ok(())
    }

    async fn get(&self, key: &str, local: &Path) -> Result<(), StoreFailure> {
        let output = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(output) => output,
            Err(e) => {
                if e.as_service_error().map(|s| s.is_no_such_key()).unwrap_or(false) {
                    return Err(StoreFailure::NotFound);
                }
                return Err(backend(e));
            }
        };

        let mut body = output.body.into_async_read();
        let mut file = tokio::fs::File::create(local).await?;
        tokio::io::copy(&mut body, &mut file).await?;
        file.flush().await?;

        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreFailure> {
        let mut keys = Vec::new();
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .into_paginator()
            .send();

        while let Some(page) = pages.next().await {
            let page = page.map_err(backend)?;
            for object in page.contents() {
                if let Some(key) = object.key() {
                    keys.push(key.to_string());
                }
            }
        }

        Ok(keys)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreFailure> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(backend)?;

        Ok(())
    }
}
