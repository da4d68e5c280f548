//! Object store configuration for S3, local filesystem and in-memory access.

use crate::config::StoreConfig;
use anyhow::{Context, Result};
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::{ClientOptions, ObjectStore, RetryConfig};
use std::sync::Arc;
use std::time::Duration;

/// Parse an S3 URI into bucket and key components.
///
/// Accepts URIs in the format `s3://bucket/key/path`.
///
/// # Errors
/// Returns an error if the URI is malformed (missing scheme, bucket, or key).
pub fn parse_s3_uri(uri: &str) -> Result<(&str, &str)> {
    let without_scheme = uri
        .strip_prefix("s3://")
        .with_context(|| format!("Invalid S3 URI: expected 's3://' prefix in '{}'", uri))?;

    without_scheme
        .split_once('/')
        .with_context(|| format!("Invalid S3 URI: expected 's3://bucket/key' format in '{}'", uri))
}

/// Turn a configured dataset location into a key inside the store.
///
/// Plain keys pass through. S3 URIs must name the configured bucket and are
/// reduced to their key.
pub fn object_key(location: &str, store: &StoreConfig) -> Result<String> {
    if !location.starts_with("s3://") {
        return Ok(location.trim_start_matches('/').to_string());
    }

    let (bucket, key) = parse_s3_uri(location)?;
    match store.bucket.as_deref() {
        Some(configured) if configured == bucket => Ok(key.to_string()),
        Some(configured) => anyhow::bail!(
            "Location '{}' is in bucket '{}' but the store uses '{}'",
            location,
            bucket,
            configured
        ),
        None => anyhow::bail!("Location '{}' is an S3 URI but the store is not S3", location),
    }
}

fn create_client_options() -> ClientOptions {
    ClientOptions::new()
        .with_connect_timeout(Duration::from_secs(5))
        .with_timeout(Duration::from_secs(60))
        .with_pool_idle_timeout(Duration::from_secs(90))
        .with_pool_max_idle_per_host(64)
}

/// Retry configuration for transient store failures.
fn create_retry_config() -> RetryConfig {
    RetryConfig {
        max_retries: 5,
        // Initial backoff (doubles each retry)
        backoff: object_store::BackoffConfig {
            init_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            base: 2.0,
        },
        retry_timeout: Duration::from_secs(120),
    }
}

/// Create an S3 client for the configured bucket.
///
/// Credentials and region are loaded from the environment unless the
/// config overrides them. Anonymous stores skip request signing.
fn create_s3_store(bucket: &str, config: &StoreConfig) -> Result<Arc<dyn ObjectStore>> {
    tracing::info!("Creating S3 client for bucket: {}", bucket);

    let mut builder = AmazonS3Builder::from_env()
        .with_bucket_name(bucket)
        .with_client_options(create_client_options())
        .with_retry(create_retry_config());

    if let Some(region) = &config.region {
        builder = builder.with_region(region);
    }
    if let Some(endpoint) = &config.endpoint_url {
        builder = builder
            .with_endpoint(endpoint)
            .with_allow_http(endpoint.starts_with("http://"))
            .with_virtual_hosted_style_request(false);
    }
    if config.anonymous {
        builder = builder.with_skip_signature(true);
    }

    Ok(Arc::new(builder.build()?))
}

/// Create the object store backing every dataset of the pipeline.
pub fn create_object_store(config: &StoreConfig) -> Result<Arc<dyn ObjectStore>> {
    match (&config.local_path, &config.bucket, config.memory) {
        (Some(local_path), None, false) => {
            let path = std::path::Path::new(local_path);
            if !path.exists() {
                std::fs::create_dir_all(path)?;
            }
            tracing::info!("Creating LocalFileSystem store at: {}", path.display());
            Ok(Arc::new(LocalFileSystem::new_with_prefix(path)?))
        }
        (None, Some(bucket), false) => create_s3_store(bucket, config),
        (None, None, true) => {
            tracing::info!("Creating in-memory store");
            Ok(Arc::new(InMemory::new()))
        }
        _ => anyhow::bail!("Invalid config: exactly one store backend must be selected"),
    }
}
