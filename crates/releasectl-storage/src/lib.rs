//! Pluggable object-storage backends for release state and the release lock.
//!
//! The `StorageBackend` trait is the seam the state store and lock crates
//! build on: both treat state documents and lock objects as named blobs
//! under a common bucket/prefix, so a single backend (file, for tests and
//! single-host setups; S3, for the shared/team case) serves both.

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use releasectl_retry::{RetryStrategyConfig, calculate_delay};
use releasectl_types::ErrorClass;
use serde::{Deserialize, Serialize};

/// Classify a local I/O failure for retry purposes. Most `io::Error` kinds
/// here are permanent (missing file, permission denied, disk full); only
/// the handful that indicate the call was interrupted or a network-backed
/// mount stalled are worth retrying.
fn classify_io_error(err: &anyhow::Error) -> ErrorClass {
    use std::io::ErrorKind;
    match err.downcast_ref::<std::io::Error>().map(|e| e.kind()) {
        Some(
            ErrorKind::Interrupted
            | ErrorKind::WouldBlock
            | ErrorKind::TimedOut
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::ConnectionRefused,
        ) => ErrorClass::Transient,
        _ => ErrorClass::Permanent,
    }
}

/// Retry `attempt` on a transient I/O failure per `classify`, backing off
/// by `retry`. Shared by every [`StorageBackend`] implementation below.
async fn with_retry<T, F, Fut>(
    retry: &RetryStrategyConfig,
    classify: impl Fn(&anyhow::Error) -> ErrorClass,
    mut attempt: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt_no = 1;
    loop {
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(e) if classify(&e) == ErrorClass::Transient && attempt_no < retry.max_attempts => {
                let delay = calculate_delay(retry, attempt_no);
                tokio::time::sleep(delay).await;
                attempt_no += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Which concrete backend a [`StorageBackend`] is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StorageType {
    /// Local filesystem storage.
    #[default]
    File,
    /// Amazon S3 (or an S3-compatible endpoint).
    S3,
}

impl std::fmt::Display for StorageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageType::File => write!(f, "file"),
            StorageType::S3 => write!(f, "s3"),
        }
    }
}

/// Common async interface for all storage backends.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn read(&self, path: &str) -> Result<Vec<u8>>;
    async fn write(&self, path: &str, data: &[u8]) -> Result<()>;
    async fn delete(&self, path: &str) -> Result<()>;
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Write `data` to `path` only if no object currently exists there.
    /// Used by the release lock for conditional-create semantics.
    /// Returns `false` without writing if the object already exists.
    async fn write_if_absent(&self, path: &str, data: &[u8]) -> Result<bool> {
        if self.exists(path).await? {
            return Ok(false);
        }
        self.write(path, data).await?;
        Ok(true)
    }

    fn storage_type(&self) -> StorageType;
    fn bucket(&self) -> &str;
    fn base_path(&self) -> &str;
}

/// Configuration for a cloud storage backend.
#[derive(Debug, Clone)]
pub struct CloudStorageConfig {
    pub storage_type: StorageType,
    pub bucket: String,
    /// Region for S3.
    pub region: Option<String>,
    pub base_path: String,
    /// Custom endpoint, for S3-compatible services (MinIO, R2, ...).
    pub endpoint: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub session_token: Option<String>,
}

impl Default for CloudStorageConfig {
    fn default() -> Self {
        Self {
            storage_type: StorageType::File,
            bucket: String::new(),
            region: None,
            base_path: String::new(),
            endpoint: None,
            access_key_id: None,
            secret_access_key: None,
            session_token: None,
        }
    }
}

impl CloudStorageConfig {
    pub fn new(storage_type: StorageType, bucket: impl Into<String>) -> Self {
        Self {
            storage_type,
            bucket: bucket.into(),
            ..Default::default()
        }
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_base_path(mut self, path: impl Into<String>) -> Self {
        self.base_path = path.into();
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_credentials(
        mut self,
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
    ) -> Self {
        self.access_key_id = Some(access_key_id.into());
        self.secret_access_key = Some(secret_access_key.into());
        self
    }
}

/// Filesystem-based storage backend; the default for local/dev/test use.
pub struct FileStorage {
    base_path: PathBuf,
    retry: RetryStrategyConfig,
}

impl FileStorage {
    pub fn new(base_path: PathBuf) -> Self {
        Self {
            base_path,
            retry: RetryStrategyConfig::default(),
        }
    }

    pub fn with_retry(base_path: PathBuf, retry: RetryStrategyConfig) -> Self {
        Self { base_path, retry }
    }
}

#[async_trait]
impl StorageBackend for FileStorage {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let full_path = self.base_path.join(path);
        with_retry(&self.retry, classify_io_error, || async {
            tokio::fs::read(&full_path)
                .await
                .with_context(|| format!("failed to read file {}", full_path.display()))
        })
        .await
    }

    async fn write(&self, path: &str, data: &[u8]) -> Result<()> {
        let full_path = self.base_path.join(path);
        if let Some(parent) = full_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create directory {}", parent.display()))?;
        }
        with_retry(&self.retry, classify_io_error, || async {
            tokio::fs::write(&full_path, data)
                .await
                .with_context(|| format!("failed to write file {}", full_path.display()))
        })
        .await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let full_path = self.base_path.join(path);
        with_retry(&self.retry, classify_io_error, || async {
            if tokio::fs::try_exists(&full_path).await.unwrap_or(false) {
                tokio::fs::remove_file(&full_path)
                    .await
                    .with_context(|| format!("failed to delete file {}", full_path.display()))?;
            }
            Ok(())
        })
        .await
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.base_path.join(path))
            .await
            .unwrap_or(false))
    }

    fn storage_type(&self) -> StorageType {
        StorageType::File
    }

    fn bucket(&self) -> &str {
        "local"
    }

    fn base_path(&self) -> &str {
        self.base_path.to_str().unwrap_or("")
    }
}

#[cfg(feature = "s3")]
pub mod s3 {
    //! AWS S3 storage backend, built on the async AWS SDK directly (no
    //! blocking bridge needed now that every caller is already async).

    use super::{CloudStorageConfig, Result, StorageBackend, StorageType};
    use anyhow::Context;
    use async_trait::async_trait;
    use aws_sdk_s3::error::ProvideErrorMetadata;
    use releasectl_retry::{RetryStrategyConfig, calculate_delay};
    use releasectl_types::ErrorClass;

    /// Classify an S3 failure: timeouts and dispatch failures are always
    /// worth retrying; beyond that, fall back to the handful of AWS error
    /// codes that mean "the service is overloaded, try again" rather than
    /// "this request is wrong."
    fn classify_s3_error<E: ProvideErrorMetadata, R>(
        err: &aws_sdk_s3::error::SdkError<E, R>,
    ) -> ErrorClass {
        match err {
            aws_sdk_s3::error::SdkError::TimeoutError(_)
            | aws_sdk_s3::error::SdkError::DispatchFailure(_) => ErrorClass::Transient,
            _ => match err.code() {
                Some(
                    "RequestTimeout" | "Throttling" | "ThrottlingException" | "SlowDown"
                    | "InternalError" | "ServiceUnavailable" | "RequestTimeTooSkewed",
                ) => ErrorClass::Transient,
                _ => ErrorClass::Permanent,
            },
        }
    }

    /// Retry an S3 SDK call on a transient [`ErrorClass`], backing off per
    /// `retry`. Classifies on the raw `SdkError` before it is ever turned
    /// into an `anyhow::Error`, since the error code lives on the SDK type.
    async fn with_retry<T, E, R, F, Fut>(retry: &RetryStrategyConfig, mut attempt: F) -> Result<T, aws_sdk_s3::error::SdkError<E, R>>
    where
        E: ProvideErrorMetadata,
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, aws_sdk_s3::error::SdkError<E, R>>>,
    {
        let mut attempt_no = 1;
        loop {
            match attempt().await {
                Ok(value) => return Ok(value),
                Err(e) if classify_s3_error(&e) == ErrorClass::Transient && attempt_no < retry.max_attempts => {
                    let delay = calculate_delay(retry, attempt_no);
                    tokio::time::sleep(delay).await;
                    attempt_no += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub struct S3Storage {
        client: aws_sdk_s3::Client,
        bucket: String,
        base_path: String,
        retry: RetryStrategyConfig,
    }

    impl S3Storage {
        pub async fn new(config: &CloudStorageConfig) -> Result<Self> {
            let region = config
                .region
                .clone()
                .unwrap_or_else(|| "us-east-1".to_string());

            let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
                .region(aws_sdk_s3::config::Region::new(region));

            if let (Some(access_key), Some(secret_key)) = (
                config.access_key_id.as_ref(),
                config.secret_access_key.as_ref(),
            ) {
                let credentials = aws_sdk_s3::config::Credentials::new(
                    access_key.clone(),
                    secret_key.clone(),
                    config.session_token.clone(),
                    None,
                    "releasectl",
                );
                loader = loader.credentials_provider(credentials);
            }

            let sdk_config = loader.load().await;
            let mut s3_builder = aws_sdk_s3::config::Builder::from(&sdk_config);
            if let Some(endpoint) = &config.endpoint {
                s3_builder = s3_builder.endpoint_url(endpoint.clone());
            }

            Ok(Self {
                client: aws_sdk_s3::Client::from_conf(s3_builder.build()),
                bucket: config.bucket.clone(),
                base_path: config.base_path.clone(),
                retry: RetryStrategyConfig::default(),
            })
        }

        pub fn with_retry(mut self, retry: RetryStrategyConfig) -> Self {
            self.retry = retry;
            self
        }

        fn full_key(&self, path: &str) -> String {
            if self.base_path.is_empty() {
                path.to_string()
            } else {
                format!("{}/{}", self.base_path.trim_end_matches('/'), path)
            }
        }
    }

    #[async_trait]
    impl StorageBackend for S3Storage {
        async fn read(&self, path: &str) -> Result<Vec<u8>> {
            let key = self.full_key(path);
            let output = with_retry(&self.retry, || {
                self.client.get_object().bucket(&self.bucket).key(&key).send()
            })
            .await
            .with_context(|| format!("failed to read s3://{}/{}", self.bucket, key))?;
            let bytes = output
                .body
                .collect()
                .await
                .context("failed to read S3 object body")?
                .to_vec();
            Ok(bytes)
        }

        async fn write(&self, path: &str, data: &[u8]) -> Result<()> {
            let key = self.full_key(path);
            with_retry(&self.retry, || {
                self.client
                    .put_object()
                    .bucket(&self.bucket)
                    .key(&key)
                    .body(aws_sdk_s3::primitives::ByteStream::from(data.to_vec()))
                    .send()
            })
            .await
            .with_context(|| format!("failed to write s3://{}/{}", self.bucket, key))?;
            Ok(())
        }

        async fn delete(&self, path: &str) -> Result<()> {
            let key = self.full_key(path);
            with_retry(&self.retry, || {
                self.client.delete_object().bucket(&self.bucket).key(&key).send()
            })
            .await
            .with_context(|| format!("failed to delete s3://{}/{}", self.bucket, key))?;
            Ok(())
        }

        async fn exists(&self, path: &str) -> Result<bool> {
            let key = self.full_key(path);
            match with_retry(&self.retry, || {
                self.client.head_object().bucket(&self.bucket).key(&key).send()
            })
            .await
            {
                Ok(_) => Ok(true),
                Err(e) => {
                    if e.as_service_error()
                        .map(|s| s.is_not_found())
                        .unwrap_or(false)
                    {
                        Ok(false)
                    } else {
                        Err(anyhow::anyhow!("failed to check s3 object existence: {e}"))
                    }
                }
            }
        }

        /// S3 `PutObject` has no built-in conditional-create without
        /// versioning/object-lock configured on the bucket, so this takes a
        /// check-then-write approach. A narrow TOCTOU window exists between
        /// the `head_object` and `put_object` calls; the release lock layer
        /// treats this as best-effort and relies on holder-id comparison on
        /// release to detect a lost race, not on this call being atomic.
        async fn write_if_absent(&self, path: &str, data: &[u8]) -> Result<bool> {
            if self.exists(path).await? {
                return Ok(false);
            }
            self.write(path, data).await?;
            Ok(true)
        }

        fn storage_type(&self) -> StorageType {
            StorageType::S3
        }

        fn bucket(&self) -> &str {
            &self.bucket
        }

        fn base_path(&self) -> &str {
            &self.base_path
        }
    }
}

/// Build a storage backend from configuration.
pub async fn build_storage_backend(
    config: &CloudStorageConfig,
) -> Result<Box<dyn StorageBackend>> {
    match config.storage_type {
        StorageType::File => Ok(Box::new(FileStorage::new(PathBuf::from(
            config.base_path.clone(),
        )))),
        #[cfg(feature = "s3")]
        StorageType::S3 => Ok(Box::new(s3::S3Storage::new(config).await?)),
        #[cfg(not(feature = "s3"))]
        StorageType::S3 => anyhow::bail!("S3 storage requires the 's3' feature flag"),
    }
}

/// Read storage configuration from `RELEASECTL_STORAGE_*` environment
/// variables. Returns `None` if `RELEASECTL_STORAGE_TYPE` is unset.
pub fn config_from_env() -> Option<CloudStorageConfig> {
    use std::env;

    let storage_type = match env::var("RELEASECTL_STORAGE_TYPE").ok()?.as_str() {
        "file" => StorageType::File,
        "s3" => StorageType::S3,
        _ => return None,
    };

    let bucket = env::var("RELEASECTL_STORAGE_BUCKET").ok()?;
    let mut config = CloudStorageConfig::new(storage_type, bucket);

    if let Ok(region) = env::var("RELEASECTL_STORAGE_REGION") {
        config.region = Some(region);
    }
    if let Ok(base_path) = env::var("RELEASECTL_STORAGE_BASE_PATH") {
        config.base_path = base_path;
    }
    if let Ok(endpoint) = env::var("RELEASECTL_STORAGE_ENDPOINT") {
        config.endpoint = Some(endpoint);
    }
    if let Ok(access_key_id) = env::var("RELEASECTL_STORAGE_ACCESS_KEY_ID") {
        config.access_key_id = Some(access_key_id);
    }
    if let Ok(secret_access_key) = env::var("RELEASECTL_STORAGE_SECRET_ACCESS_KEY") {
        config.secret_access_key = Some(secret_access_key);
    }
    if let Ok(session_token) = env::var("RELEASECTL_STORAGE_SESSION_TOKEN") {
        config.session_token = Some(session_token);
    }

    Some(config)
}
