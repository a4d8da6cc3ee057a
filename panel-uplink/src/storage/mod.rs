//! Object storage network abstraction.
//!
//! The upload pipeline only sees these traits. `memory` backs tests and local
//! dry runs; `gateway` speaks HTTP to a storage gateway.

pub mod encrypt;
pub mod gateway;
pub mod memory;
pub mod upload;

pub use gateway::HttpGateway;
pub use memory::MemoryNetwork;
pub use upload::{normalize_path, ObjectUploadPipeline, UploadReport, UploadTarget};

use crate::access::ApiKey;
use crate::utils::errors::StorageError;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::Stream;
use std::io;
use std::pin::Pin;

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Object payload as handed to a bucket.
pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send + Sync>>;

/// Entry point to a storage network.
#[async_trait]
pub trait StorageNetwork: Send + Sync {
    /// Open a project session on `satellite` authorized by `api_key`.
    async fn open_project(&self, satellite: &str, api_key: &ApiKey) -> StorageResult<Box<dyn Project>>;
}

/// An authorized session. Dropping it closes the session.
#[async_trait]
pub trait Project: Send + Sync {
    async fn open_bucket(&self, name: &str) -> StorageResult<Box<dyn Bucket>>;

    /// Create `name`. Creating an existing bucket is not an error.
    async fn create_bucket(&self, name: &str) -> StorageResult<()>;
}

/// An open bucket handle. Dropping it releases the handle.
#[async_trait]
pub trait Bucket: Send + Sync {
    fn name(&self) -> &str;

    /// Store `data` under `key`, returning the number of bytes stored.
    async fn upload_object(&self, key: &str, data: ByteStream) -> StorageResult<u64>;

    /// Fetch the stored bytes of `key`.
    async fn download_object(&self, key: &str) -> StorageResult<Vec<u8>>;
}
