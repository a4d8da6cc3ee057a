//! HTTP storage gateway backend.
//!
//! Buckets live at `/v1/buckets/{bucket}` and objects at
//! `/v1/buckets/{bucket}/objects/{key}`. Requests carry the serialized API key
//! as a bearer token; the gateway enforces its caveats.

use super::{Bucket, ByteStream, Project, StorageNetwork, StorageResult};
use crate::access::ApiKey;
use crate::utils::errors::StorageError;
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{Response, StatusCode, Url};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const USER_AGENT: &str = concat!("panel-uplink/", env!("CARGO_PKG_VERSION"));

#[derive(Clone)]
pub struct HttpGateway {
    http: reqwest::Client,
}

impl HttpGateway {
    /// `connect_timeout` bounds connection setup only; uploads may run long.
    pub fn new(connect_timeout: Duration) -> StorageResult<Self> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| StorageError::Backend(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { http })
    }
}

/// Base URL of a satellite address. Bare `host:port` means HTTPS.
pub fn gateway_url(satellite: &str) -> StorageResult<Url> {
    let raw = if satellite.contains("://") {
        satellite.to_string()
    } else {
        format!("https://{}/", satellite)
    };
    Url::parse(&raw).map_err(|e| StorageError::Backend(format!("invalid satellite address {}: {}", satellite, e)))
}

fn endpoint<'a>(base: &Url, segments: impl IntoIterator<Item = &'a str>) -> StorageResult<Url> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| StorageError::Backend(format!("satellite URL cannot be a base: {}", base)))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

fn bucket_url(base: &Url, bucket: &str) -> StorageResult<Url> {
    endpoint(base, ["v1", "buckets", bucket])
}

fn object_url(base: &Url, bucket: &str, key: &str) -> StorageResult<Url> {
    endpoint(
        base,
        ["v1", "buckets", bucket, "objects"].into_iter().chain(key.split('/')),
    )
}

fn transport(err: reqwest::Error) -> StorageError {
    StorageError::Backend(err.to_string())
}

/// Map a non-success status to a storage error.
async fn check(response: Response, what: &str) -> StorageResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(match status {
        StatusCode::NOT_FOUND => StorageError::BucketNotFound(what.to_string()),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            StorageError::PermissionDenied(format!("{}: {}", what, body))
        }
        _ => StorageError::Backend(format!("{} returned {}: {}", what, status, body)),
    })
}

#[async_trait]
impl StorageNetwork for HttpGateway {
    async fn open_project(&self, satellite: &str, api_key: &ApiKey) -> StorageResult<Box<dyn Project>> {
        Ok(Box::new(GatewayProject {
            http: self.http.clone(),
            base: gateway_url(satellite)?,
            token: api_key.serialize(),
        }))
    }
}

struct GatewayProject {
    http: reqwest::Client,
    base: Url,
    token: String,
}

#[async_trait]
impl Project for GatewayProject {
    async fn open_bucket(&self, name: &str) -> StorageResult<Box<dyn Bucket>> {
        let response = self
            .http
            .head(bucket_url(&self.base, name)?)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(transport)?;
        check(response, name).await?;

        Ok(Box::new(GatewayBucket {
            http: self.http.clone(),
            base: self.base.clone(),
            token: self.token.clone(),
            name: name.to_string(),
        }))
    }

    async fn create_bucket(&self, name: &str) -> StorageResult<()> {
        let response = self
            .http
            .put(bucket_url(&self.base, name)?)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(transport)?;
        if response.status() == StatusCode::CONFLICT {
            debug!("Bucket {} already exists", name);
            return Ok(());
        }
        check(response, name).await?;
        Ok(())
    }
}

struct GatewayBucket {
    http: reqwest::Client,
    base: Url,
    token: String,
    name: String,
}

#[async_trait]
impl Bucket for GatewayBucket {
    fn name(&self) -> &str {
        &self.name
    }

    async fn upload_object(&self, key: &str, data: ByteStream) -> StorageResult<u64> {
        let sent = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&sent);
        let counted = data.inspect(move |chunk| {
            if let Ok(chunk) = chunk {
                counter.fetch_add(chunk.len() as u64, Ordering::Relaxed);
            }
        });

        let response = self
            .http
            .put(object_url(&self.base, &self.name, key)?)
            .bearer_auth(&self.token)
            .body(reqwest::Body::wrap_stream(counted))
            .send()
            .await
            .map_err(|e| StorageError::Upload(e.to_string()))?;

        match check(response, &self.name).await {
            Ok(_) => Ok(sent.load(Ordering::Relaxed)),
            Err(StorageError::Backend(message)) => Err(StorageError::Upload(message)),
            // The bucket vanished after it was opened.
            Err(StorageError::BucketNotFound(name)) => Err(StorageError::Upload(format!(
                "bucket {} disappeared during upload",
                name
            ))),
            Err(e) => Err(e),
        }
    }

    async fn download_object(&self, key: &str) -> StorageResult<Vec<u8>> {
        let response = self
            .http
            .get(object_url(&self.base, &self.name, key)?)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(transport)?;
        let response = check(response, &self.name).await?;
        Ok(response.bytes().await.map_err(transport)?.to_vec())
    }
}
