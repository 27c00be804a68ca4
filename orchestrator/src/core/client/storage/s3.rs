use crate::core::client::storage::{ByteRange, ObjectMetadata, StorageClient, StorageError};
use crate::types::params::StorageArgs;
use async_trait::async_trait;
use aws_config::{Region, SdkConfig};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

#[derive(Clone, Debug)]
pub struct AWSS3 {
    pub(crate) client: Arc<Client>,
    bucket_name: Option<String>,
    region: Option<String>,
}

impl AWSS3 {
    /// Creates a new instance of AWSS3 with the provided AWS configuration and optional arguments.
    /// # Arguments
    /// * `aws_config` - The AWS configuration.
    /// * `args` - The storage arguments with bucket_identifier (name or ARN) and an optional endpoint.
    ///
    /// # Returns
    /// * `Self` - The new instance of AWSS3.
    pub fn new(aws_config: &SdkConfig, args: Option<&StorageArgs>) -> Self {
        let (bucket_name, region) = if let Some(args) = args {
            // Parse the bucket identifier to handle both ARN and name
            let (name, region) = Self::parse_bucket_identifier(&args.bucket_identifier);
            (Some(name), region)
        } else {
            (None, None)
        };

        let mut s3_config_builder = aws_sdk_s3::config::Builder::from(aws_config);

        // Set region from ARN if available and different from config
        if let Some(region) = &region {
            s3_config_builder = s3_config_builder.region(Region::new(region.clone()));
        }

        // MinIO and other S3 compatible stores
        if let Some(endpoint) = args.and_then(|args| args.endpoint_url.as_ref()) {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint.as_str());
        }

        s3_config_builder = s3_config_builder.use_arn_region(true).force_path_style(true);

        let client = Client::from_conf(s3_config_builder.build());

        Self { client: Arc::new(client), bucket_name, region }
    }

    /// Parse a bucket identifier (name or ARN) into bucket name and optional region
    fn parse_bucket_identifier(identifier: &str) -> (String, Option<String>) {
        if identifier.starts_with("arn:aws:s3:") {
            let parts: Vec<&str> = identifier.split(':').collect();

            if parts.len() >= 6 {
                let region = if !parts[3].is_empty() { Some(parts[3].to_string()) } else { None };

                // Format: arn:aws:s3:region:account-id:bucket/bucket-name
                let bucket_name = match parts[5].split_once('/') {
                    Some(("bucket", name)) if !name.is_empty() => name.to_string(),
                    // Format: arn:aws:s3:::bucket-name
                    _ => parts[5].to_string(),
                };

                return (bucket_name, region);
            }
        }

        (identifier.to_string(), None)
    }

    pub(crate) fn bucket_name(&self) -> Result<String, StorageError> {
        self.bucket_name.clone().ok_or_else(|| StorageError::InvalidBucketName("Bucket name is not set".to_string()))
    }

    /// Returns the region extracted from ARN, if available
    pub fn region(&self) -> Option<String> {
        self.region.clone()
    }

    async fn put_object(
        &self,
        data: Bytes,
        key: &str,
        metadata: Option<HashMap<String, String>>,
    ) -> Result<(), StorageError> {
        let size = data.len();
        self.client
            .put_object()
            .bucket(self.bucket_name()?)
            .key(key)
            .body(ByteStream::from(data))
            .set_metadata(metadata)
            .send()
            .await?;

        debug!(key = %key, size = size, "Put object");
        Ok(())
    }
}

#[async_trait]
impl StorageClient for AWSS3 {
    /// Get the data from the bucket with the specified key.
    async fn get_data(&self, key: &str) -> Result<Bytes, StorageError> {
        let output = match self.client.get_object().bucket(self.bucket_name()?).key(key).send().await {
            Ok(output) => output,
            Err(err) if err.as_service_error().is_some_and(|e| e.is_no_such_key()) => {
                return Err(StorageError::NotFound(key.to_string()));
            }
            Err(err) => return Err(err.into()),
        };

        let data = output.body.collect().await.map_err(|e| StorageError::ObjectStreamError(e.to_string()))?;
        let data = data.into_bytes();
        debug!(key = %key, size = data.len(), "Got object");

        Ok(data)
    }

    /// Get a single byte range of an object. Issues exactly one ranged GET.
    async fn get_range(&self, key: &str, range: ByteRange) -> Result<Bytes, StorageError> {
        let request = self.client.get_object().bucket(self.bucket_name()?).key(key).range(range.header());
        let output = match request.send().await {
            Ok(output) => output,
            Err(err) if err.as_service_error().is_some_and(|e| e.is_no_such_key()) => {
                return Err(StorageError::NotFound(key.to_string()));
            }
            Err(err) => return Err(err.into()),
        };

        let data = output.body.collect().await.map_err(|e| StorageError::ObjectStreamError(e.to_string()))?;
        let data = data.into_bytes();

        if data.len() as u64 != range.size() {
            return Err(StorageError::ShortRead {
                key: key.to_string(),
                range: range.header(),
                expected: range.size(),
                received: data.len() as u64,
            });
        }

        debug!(key = %key, range = %range, "Got object range");
        Ok(data)
    }

    async fn put_data(&self, data: Bytes, key: &str) -> Result<(), StorageError> {
        self.put_object(data, key, None).await
    }

    async fn put_data_with_metadata(
        &self,
        data: Bytes,
        key: &str,
        metadata: HashMap<String, String>,
    ) -> Result<(), StorageError> {
        self.put_object(data, key, Some(metadata)).await
    }

    async fn head(&self, key: &str) -> Result<Option<ObjectMetadata>, StorageError> {
        let output = match self.client.head_object().bucket(self.bucket_name()?).key(key).send().await {
            Ok(output) => output,
            Err(err) if err.as_service_error().is_some_and(|e| e.is_not_found()) => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let last_modified =
            output.last_modified().and_then(|time| chrono::DateTime::from_timestamp(time.secs(), time.subsec_nanos()));

        Ok(Some(ObjectMetadata {
            key: key.to_string(),
            size: output.content_length().unwrap_or_default().max(0) as u64,
            last_modified,
            etag: output.e_tag().map(str::to_string),
            metadata: output.metadata().cloned().unwrap_or_default(),
        }))
    }

    async fn get_metadata(&self, key: &str) -> Result<HashMap<String, String>, StorageError> {
        self.head(key).await?.map(|object| object.metadata).ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn delete_data(&self, key: &str) -> Result<(), StorageError> {
        Ok(self.client.delete_object().bucket(self.bucket_name()?).key(key).send().await.map(|_| ())?)
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let bucket = self.bucket_name()?;
        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let output = self
                .client
                .list_objects_v2()
                .bucket(&bucket)
                .prefix(prefix)
                .set_continuation_token(continuation_token.take())
                .send()
                .await?;

            for object in output.contents() {
                if let Some(key) = object.key() {
                    let relative = key.strip_prefix(prefix).unwrap_or(key).trim_start_matches('/');
                    keys.push(relative.to_string());
                }
            }

            match output.next_continuation_token() {
                Some(token) if output.is_truncated().unwrap_or(false) => continuation_token = Some(token.to_string()),
                _ => break,
            }
        }

        Ok(keys)
    }

    async fn health_check(&self) -> Result<(), StorageError> {
        self.client.head_bucket().bucket(self.bucket_name()?).send().await?;
        Ok(())
    }
}
