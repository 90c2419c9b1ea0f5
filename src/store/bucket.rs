//! S3 bucket backend.
//!
//! The SDK-backed implementation is compiled with the `s3` feature. Without
//! it, [`BucketStore::connect`] fails with a configuration message so the
//! rest of the pipeline still builds without the AWS dependency tree.

use super::{BackendKind, ObjectStore, StoreError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// S3 bucket settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketConfig {
    /// Bucket name
    pub bucket: String,
    /// AWS region
    pub region: String,
    /// Custom endpoint (MinIO, LocalStack); forces path-style addressing
    pub endpoint: Option<String>,
    /// Named profile from the shared AWS config
    pub profile: Option<String>,
}

impl BucketConfig {
    #[must_use]
    pub fn new(bucket: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            region: region.into(),
            endpoint: None,
            profile: None,
        }
    }

    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    #[must_use]
    pub fn with_profile(mut self, profile: impl Into<String>) -> Self {
        self.profile = Some(profile.into());
        self
    }

    /// `us-east-1` buckets must be created without a location constraint
    pub fn needs_location_constraint(&self) -> bool {
        self.region != "us-east-1"
    }
}

/// Object store over one S3 bucket
pub struct BucketStore {
    config: BucketConfig,
    #[cfg(feature = "s3")]
    client: aws_sdk_s3::Client,
}

impl std::fmt::Debug for BucketStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketStore")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl BucketStore {
    pub fn config(&self) -> &BucketConfig {
        &self.config
    }
}

#[cfg(not(feature = "s3"))]
impl BucketStore {
    /// Always fails: the crate was built without the `s3` feature
    pub async fn connect(config: BucketConfig) -> Result<Self, StoreError> {
        Err(StoreError::unavailable(
            "connect",
            format!("s3://{}", config.bucket),
            "bucket backend requires the 's3' feature. Rebuild with: cargo build --features s3",
        ))
    }
}

#[cfg(not(feature = "s3"))]
#[async_trait]
impl ObjectStore for BucketStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Bucket
    }

    fn identifier(&self) -> &str {
        &self.config.bucket
    }

    async fn exists(&self) -> Result<bool, StoreError> {
        Err(StoreError::unavailable("exists", &self.config.bucket, "s3 feature disabled"))
    }

    async fn provision(&self) -> Result<(), StoreError> {
        Err(StoreError::unavailable("provision", &self.config.bucket, "s3 feature disabled"))
    }

    async fn put(&self, key: &str, _bytes: Vec<u8>) -> Result<(), StoreError> {
        Err(StoreError::unavailable("put", self.location(key), "s3 feature disabled"))
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        Err(StoreError::unavailable("get", self.location(key), "s3 feature disabled"))
    }
}

// -----------------------------------------------------------------------------
// S3 with AWS SDK feature enabled
// -----------------------------------------------------------------------------

#[cfg(feature = "s3")]
mod s3_impl {
    use super::*;
    use aws_config::{BehaviorVersion, Region};
    use aws_sdk_s3::primitives::ByteStream;
    use aws_sdk_s3::types::{BucketLocationConstraint, CreateBucketConfiguration};
    use tracing::{debug, info};

    impl BucketStore {
        /// Build an SDK client from the default credential chain
        pub async fn connect(config: BucketConfig) -> Result<Self, StoreError> {
            let mut loader = aws_config::defaults(BehaviorVersion::latest())
                .region(Region::new(config.region.clone()));
            if let Some(profile) = &config.profile {
                loader = loader.profile_name(profile);
            }
            let shared = loader.load().await;

            let mut builder = aws_sdk_s3::config::Builder::from(&shared);
            if let Some(endpoint) = &config.endpoint {
                builder = builder.endpoint_url(endpoint).force_path_style(true);
            }
            let client = aws_sdk_s3::Client::from_conf(builder.build());
            info!("Connected to s3://{} ({})", config.bucket, config.region);
            Ok(Self { config, client })
        }
    }

    #[async_trait]
    impl ObjectStore for BucketStore {
        fn kind(&self) -> BackendKind {
            BackendKind::Bucket
        }

        fn identifier(&self) -> &str {
            &self.config.bucket
        }

        async fn exists(&self) -> Result<bool, StoreError> {
            match self
                .client
                .head_bucket()
                .bucket(&self.config.bucket)
                .send()
                .await
            {
                Ok(_) => Ok(true),
                Err(err) => match err.as_service_error() {
                    Some(e) if e.is_not_found() => Ok(false),
                    _ => Err(StoreError::unavailable(
                        "exists",
                        &self.config.bucket,
                        aws_sdk_s3::error::DisplayErrorContext(&err),
                    )),
                },
            }
        }

        async fn provision(&self) -> Result<(), StoreError> {
            let mut request = self.client.create_bucket().bucket(&self.config.bucket);
            if self.config.needs_location_constraint() {
                request = request.create_bucket_configuration(
                    CreateBucketConfiguration::builder()
                        .location_constraint(BucketLocationConstraint::from(
                            self.config.region.as_str(),
                        ))
                        .build(),
                );
            }
            match request.send().await {
                Ok(_) => {
                    debug!("bucket {} created", self.config.bucket);
                    Ok(())
                }
                Err(err) => match err.as_service_error() {
                    Some(e) if e.is_bucket_already_owned_by_you() => Ok(()),
                    _ => Err(StoreError::unavailable(
                        "provision",
                        &self.config.bucket,
                        aws_sdk_s3::error::DisplayErrorContext(&err),
                    )),
                },
            }
        }

        async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
            self.client
                .put_object()
                .bucket(&self.config.bucket)
                .key(key)
                .body(ByteStream::from(bytes))
                .send()
                .await
                .map(|_| ())
                .map_err(|err| {
                    StoreError::unavailable(
                        "put",
                        self.location(key),
                        aws_sdk_s3::error::DisplayErrorContext(&err),
                    )
                })
        }

        async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
            let output = match self
                .client
                .get_object()
                .bucket(&self.config.bucket)
                .key(key)
                .send()
                .await
            {
                Ok(output) => output,
                Err(err) => {
                    return match err.as_service_error() {
                        Some(e) if e.is_no_such_key() => {
                            Err(StoreError::ObjectNotFound(self.location(key)))
                        }
                        _ => Err(StoreError::unavailable(
                            "get",
                            self.location(key),
                            aws_sdk_s3::error::DisplayErrorContext(&err),
                        )),
                    }
                }
            };
            let data = output
                .body
                .collect()
                .await
                .map_err(|e| StoreError::unavailable("get", self.location(key), e))?;
            Ok(data.into_bytes().to_vec())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_constraint_rule() {
        assert!(!BucketConfig::new("b", "us-east-1").needs_location_constraint());
        assert!(BucketConfig::new("b", "eu-north-1").needs_location_constraint());
    }

    #[cfg(not(feature = "s3"))]
    #[tokio::test]
    async fn test_connect_without_feature_is_unavailable() {
        let err = BucketStore::connect(BucketConfig::new("igz-training", "eu-north-1"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("'s3' feature"));
    }
}
