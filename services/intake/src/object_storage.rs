use crate::config::StorageConfig;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Builder as S3ConfigBuilder, Credentials};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::Client as S3Client;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Content type uploads are presigned for
const UPLOAD_CONTENT_TYPE: &str = "image/jpeg";

/// Object storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Storage configuration error: {0}")]
    Config(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// A presigned upload URL and where the object will be readable afterwards
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresignedUpload {
    /// Presigned URL the device PUTs the image to
    pub upload_url: String,
    /// Stable public URL of the object once uploaded
    pub public_url: String,
    /// Lifetime of the upload URL in seconds
    pub expires_in: i64,
}

/// Object storage port used by the intake flow
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Presign a PUT for `key`, valid for `ttl`
    async fn presign_upload(&self, key: &str, ttl: Duration) -> StorageResult<PresignedUpload>;

    /// Public retrieval URL for `key`
    fn public_url(&self, key: &str) -> String;

    /// Remove an object
    async fn delete_object(&self, key: &str) -> StorageResult<()>;
}

/// Supported storage providers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageProvider {
    /// Cloudflare R2
    R2,
    /// Amazon S3 (or any S3-compatible endpoint)
    S3,
    /// Google Cloud Storage through its XML interoperability API
    Gcs,
}

impl StorageProvider {
    /// Resolve a configured provider name, falling back to R2 for unknown values
    pub fn resolve(name: &str) -> Self {
        match name.parse() {
            Ok(provider) => provider,
            Err(_) => {
                warn!(
                    provider = %name,
                    fallback = %StorageProvider::R2,
                    "Unknown storage provider, using default"
                );
                StorageProvider::R2
            }
        }
    }
}

impl FromStr for StorageProvider {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "r2" => Ok(StorageProvider::R2),
            "s3" => Ok(StorageProvider::S3),
            "gcs" => Ok(StorageProvider::Gcs),
            other => Err(StorageError::Config(format!(
                "unknown storage provider '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for StorageProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StorageProvider::R2 => "r2",
            StorageProvider::S3 => "s3",
            StorageProvider::Gcs => "gcs",
        };
        f.write_str(name)
    }
}

/// Connection settings derived for a provider
#[derive(Debug, Clone, PartialEq, Eq)]
struct ProviderSettings {
    endpoint_url: Option<String>,
    region: String,
    public_base_url: String,
    force_path_style: bool,
}

impl ProviderSettings {
    fn resolve(provider: StorageProvider, config: &StorageConfig) -> StorageResult<Self> {
        let configured_public = non_empty(&config.public_url).map(trim_slash);

        match provider {
            StorageProvider::R2 => {
                let endpoint_url = match config.endpoint_url.as_deref().and_then(non_empty) {
                    Some(url) => url.to_string(),
                    None if !config.account_id.is_empty() => {
                        format!("https://{}.r2.cloudflarestorage.com", config.account_id)
                    }
                    None => {
                        return Err(StorageError::Config(
                            "R2 requires storage.account_id or storage.endpoint_url".to_string(),
                        ))
                    }
                };
                let public_base_url = configured_public.ok_or_else(|| {
                    StorageError::Config("R2 requires storage.public_url".to_string())
                })?;

                Ok(Self {
                    endpoint_url: Some(endpoint_url),
                    region: "auto".to_string(),
                    public_base_url,
                    force_path_style: config.force_path_style,
                })
            }
            StorageProvider::S3 => {
                // S3 has no "auto" region
                let region = if config.region.is_empty() || config.region == "auto" {
                    "us-east-1".to_string()
                } else {
                    config.region.clone()
                };
                let public_base_url = configured_public.unwrap_or_else(|| {
                    format!("https://{}.s3.{}.amazonaws.com", config.bucket, region)
                });

                Ok(Self {
                    endpoint_url: config
                        .endpoint_url
                        .as_deref()
                        .and_then(non_empty)
                        .map(String::from),
                    region,
                    public_base_url,
                    force_path_style: config.force_path_style,
                })
            }
            StorageProvider::Gcs => {
                let endpoint_url = config
                    .endpoint_url
                    .as_deref()
                    .and_then(non_empty)
                    .unwrap_or("https://storage.googleapis.com")
                    .to_string();
                let public_base_url = configured_public
                    .unwrap_or_else(|| format!("https://storage.googleapis.com/{}", config.bucket));

                Ok(Self {
                    endpoint_url: Some(endpoint_url),
                    region: "auto".to_string(),
                    public_base_url,
                    force_path_style: true,
                })
            }
        }
    }
}

fn non_empty(value: &str) -> Option<&str> {
    let value = value.trim();
    (!value.is_empty()).then_some(value)
}

fn trim_slash(value: &str) -> String {
    value.trim_end_matches('/').to_string()
}

/// Presigning client for S3-compatible backends
pub struct S3CompatibleStorage {
    client: S3Client,
    bucket: String,
    public_base_url: String,
    provider: StorageProvider,
}

impl S3CompatibleStorage {
    /// Create a storage client for the given provider
    pub async fn new(provider: StorageProvider, config: &StorageConfig) -> StorageResult<Self> {
        let settings = ProviderSettings::resolve(provider, config)?;

        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(settings.region.clone()));

        if !config.access_key_id.is_empty() && !config.secret_access_key.is_empty() {
            loader = loader.credentials_provider(Credentials::new(
                config.access_key_id.clone(),
                config.secret_access_key.clone(),
                None,
                None,
                "intake-static",
            ));
        }

        let aws_config = loader.load().await;
        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        if let Some(ref endpoint_url) = settings.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        if settings.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            provider = %provider,
            bucket = %config.bucket,
            region = %settings.region,
            "Object storage initialized"
        );

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
            public_base_url: settings.public_base_url,
            provider,
        })
    }

    /// The provider this client talks to
    pub fn provider(&self) -> StorageProvider {
        self.provider
    }
}

#[async_trait]
impl ObjectStorage for S3CompatibleStorage {
    #[instrument(skip(self), fields(provider = %self.provider))]
    async fn presign_upload(&self, key: &str, ttl: Duration) -> StorageResult<PresignedUpload> {
        let presigning_config = PresigningConfig::expires_in(ttl)
            .map_err(|e| StorageError::Config(format!("invalid presigning config: {}", e)))?;

        let presigned = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(UPLOAD_CONTENT_TYPE)
            .presigned(presigning_config)
            .await
            .map_err(|e| {
                StorageError::Unavailable(format!(
                    "failed to presign upload: {}",
                    DisplayErrorContext(&e)
                ))
            })?;

        debug!(key = %key, "Presigned upload URL generated");

        Ok(PresignedUpload {
            upload_url: presigned.uri().to_string(),
            public_url: self.public_url(key),
            expires_in: ttl.as_secs() as i64,
        })
    }

    fn public_url(&self, key: &str) -> String {
        format!("{}/{}", self.public_base_url, key)
    }

    #[instrument(skip(self), fields(provider = %self.provider))]
    async fn delete_object(&self, key: &str) -> StorageResult<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                StorageError::Unavailable(format!(
                    "failed to delete object: {}",
                    DisplayErrorContext(&e)
                ))
            })?;

        debug!(key = %key, "Object deleted");
        Ok(())
    }
}

/// Create the storage backend selected by configuration
pub async fn create_storage(config: &StorageConfig) -> StorageResult<Arc<dyn ObjectStorage>> {
    let provider = StorageProvider::resolve(&config.provider);
    let storage = S3CompatibleStorage::new(provider, config).await?;
    Ok(Arc::new(storage))
}

/// Bytes kept as-is in key path components. Everything else, `%` included,
/// is percent-encoded so distinct device IDs never share a prefix.
const KEY_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Object key for an uploaded trash image.
/// Format: trash/{device_id}/{unix_millis}.jpg
pub fn upload_object_key(device_id: &str, unix_millis: i64) -> String {
    format!(
        "trash/{}/{}.jpg",
        encode_path_component(device_id),
        unix_millis
    )
}

/// Percent-encode a path component. `.` and `..` are encoded whole so the
/// component cannot step out of its prefix.
fn encode_path_component(component: &str) -> String {
    match component {
        "." => "%2E".to_string(),
        ".." => "%2E%2E".to_string(),
        _ => utf8_percent_encode(component, KEY_COMPONENT).to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage_config(provider: &str) -> StorageConfig {
        StorageConfig {
            provider: provider.to_string(),
            bucket: "smart-picker-bucket".to_string(),
            public_url: String::new(),
            account_id: "acc123".to_string(),
            access_key_id: "key".to_string(),
            secret_access_key: "secret".to_string(),
            region: "auto".to_string(),
            endpoint_url: None,
            force_path_style: false,
            upload_url_ttl_secs: 900,
        }
    }

    #[test]
    fn test_upload_object_key() {
        assert_eq!(
            upload_object_key("dev-1", 1_700_000_000_123),
            "trash/dev-1/1700000000123.jpg"
        );
    }

    #[test]
    fn test_encode_path_component() {
        assert_eq!(encode_path_component("picker_01"), "picker_01");
        assert_eq!(encode_path_component("dev.1"), "dev.1");
        assert_eq!(encode_path_component("../etc"), "..%2Fetc");
        assert_eq!(encode_path_component(".."), "%2E%2E");
        assert_eq!(encode_path_component("."), "%2E");
        assert_eq!(encode_path_component("dev 1/a"), "dev%201%2Fa");
        assert_eq!(encode_path_component("a%2F"), "a%252F");
    }

    #[test]
    fn test_distinct_devices_get_distinct_keys() {
        let t = 1_700_000_000_000;
        let dotted = upload_object_key("dev.1", t);
        assert_eq!(dotted, "trash/dev.1/1700000000000.jpg");
        assert_ne!(dotted, upload_object_key("dev_1", t));
        assert_ne!(upload_object_key("..", t), upload_object_key("%2E%2E", t));
        assert_ne!(upload_object_key("a/b", t), upload_object_key("a%2Fb", t));
        assert_eq!(upload_object_key("../x", t).matches('/').count(), 2);
    }

    #[test]
    fn test_provider_parsing() {
        assert_eq!("r2".parse::<StorageProvider>().unwrap(), StorageProvider::R2);
        assert_eq!("S3".parse::<StorageProvider>().unwrap(), StorageProvider::S3);
        assert_eq!(" gcs ".parse::<StorageProvider>().unwrap(), StorageProvider::Gcs);
        assert!("azure".parse::<StorageProvider>().is_err());
    }

    #[test]
    fn test_unknown_provider_falls_back_to_r2() {
        assert_eq!(StorageProvider::resolve("azure"), StorageProvider::R2);
        assert_eq!(StorageProvider::resolve("gcs"), StorageProvider::Gcs);
    }

    #[test]
    fn test_r2_settings() {
        let mut config = storage_config("r2");
        config.public_url = "https://pub-123.r2.dev/".to_string();

        let settings = ProviderSettings::resolve(StorageProvider::R2, &config).unwrap();
        assert_eq!(
            settings.endpoint_url.as_deref(),
            Some("https://acc123.r2.cloudflarestorage.com")
        );
        assert_eq!(settings.region, "auto");
        assert_eq!(settings.public_base_url, "https://pub-123.r2.dev");
    }

    #[test]
    fn test_r2_requires_public_url() {
        let config = storage_config("r2");
        assert!(matches!(
            ProviderSettings::resolve(StorageProvider::R2, &config),
            Err(StorageError::Config(_))
        ));
    }

    #[test]
    fn test_s3_settings_default_public_url() {
        let mut config = storage_config("s3");
        config.region = "eu-west-1".to_string();

        let settings = ProviderSettings::resolve(StorageProvider::S3, &config).unwrap();
        assert_eq!(settings.endpoint_url, None);
        assert_eq!(
            settings.public_base_url,
            "https://smart-picker-bucket.s3.eu-west-1.amazonaws.com"
        );

        config.region = "auto".to_string();
        let settings = ProviderSettings::resolve(StorageProvider::S3, &config).unwrap();
        assert_eq!(settings.region, "us-east-1");
    }

    #[test]
    fn test_gcs_settings() {
        let config = storage_config("gcs");
        let settings = ProviderSettings::resolve(StorageProvider::Gcs, &config).unwrap();
        assert_eq!(
            settings.endpoint_url.as_deref(),
            Some("https://storage.googleapis.com")
        );
        assert_eq!(
            settings.public_base_url,
            "https://storage.googleapis.com/smart-picker-bucket"
        );
        assert!(settings.force_path_style);
    }

    #[tokio::test]
    async fn test_presign_upload_is_offline() {
        let mut config = storage_config("r2");
        config.public_url = "https://pub-123.r2.dev".to_string();

        let storage = S3CompatibleStorage::new(StorageProvider::R2, &config)
            .await
            .unwrap();
        let key = upload_object_key("dev-1", 1_700_000_000_000);
        let presigned = storage
            .presign_upload(&key, Duration::from_secs(900))
            .await
            .unwrap();

        assert!(presigned.upload_url.starts_with("https://"));
        assert!(presigned.upload_url.contains("trash/dev-1/1700000000000.jpg"));
        assert!(presigned.upload_url.contains("X-Amz-Expires=900"));
        assert_eq!(
            presigned.public_url,
            "https://pub-123.r2.dev/trash/dev-1/1700000000000.jpg"
        );
        assert_eq!(presigned.expires_in, 900);
    }
}
