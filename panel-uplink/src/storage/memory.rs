//! In-process storage network.
//!
//! Issues and verifies API keys with its own secret and enforces caveats the
//! way a satellite would. Open project and bucket handles are counted so
//! callers can check that every handle was released.

use super::{Bucket, ByteStream, Project, StorageNetwork, StorageResult};
use crate::access::{Action, ApiKey};
use crate::utils::errors::StorageError;
use aes_gcm::aead::{rand_core::RngCore, OsRng};
use async_trait::async_trait;
use futures_util::StreamExt;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

type Objects = BTreeMap<String, Vec<u8>>;

#[derive(Default)]
struct Counters {
    open_projects: AtomicUsize,
    open_buckets: AtomicUsize,
    buckets_created: AtomicUsize,
}

struct Shared {
    satellite: String,
    secret: Vec<u8>,
    buckets: Mutex<BTreeMap<String, Objects>>,
    counters: Counters,
}

impl Shared {
    fn buckets(&self) -> MutexGuard<'_, BTreeMap<String, Objects>> {
        // A panic while holding the lock leaves the map consistent.
        self.buckets.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Clone)]
pub struct MemoryNetwork {
    shared: Arc<Shared>,
}

impl MemoryNetwork {
    pub fn new(satellite: impl Into<String>) -> Self {
        let mut secret = vec![0u8; 32];
        OsRng.fill_bytes(&mut secret);
        Self {
            shared: Arc::new(Shared {
                satellite: satellite.into(),
                secret,
                buckets: Mutex::new(BTreeMap::new()),
                counters: Counters::default(),
            }),
        }
    }

    pub fn satellite(&self) -> &str {
        &self.shared.satellite
    }

    /// Issue a fresh root key for this network.
    pub fn issue_api_key(&self) -> ApiKey {
        let mut head = vec![0u8; 16];
        OsRng.fill_bytes(&mut head);
        ApiKey::issue(&self.shared.secret, head)
    }

    /// Stored (encrypted) bytes of an object.
    pub fn object(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.shared.buckets().get(bucket)?.get(key).cloned()
    }

    pub fn bucket_names(&self) -> Vec<String> {
        self.shared.buckets().keys().cloned().collect()
    }

    pub fn open_projects(&self) -> usize {
        self.shared.counters.open_projects.load(Ordering::SeqCst)
    }

    pub fn open_buckets(&self) -> usize {
        self.shared.counters.open_buckets.load(Ordering::SeqCst)
    }

    pub fn buckets_created(&self) -> usize {
        self.shared.counters.buckets_created.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StorageNetwork for MemoryNetwork {
    async fn open_project(&self, satellite: &str, api_key: &ApiKey) -> StorageResult<Box<dyn Project>> {
        if satellite != self.shared.satellite {
            return Err(StorageError::Backend(format!("unknown satellite {}", satellite)));
        }
        if !api_key.verify(&self.shared.secret) {
            return Err(StorageError::PermissionDenied("API key was not issued by this satellite".into()));
        }
        self.shared.counters.open_projects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryProject {
            shared: Arc::clone(&self.shared),
            api_key: api_key.clone(),
        }))
    }
}

struct MemoryProject {
    shared: Arc<Shared>,
    api_key: ApiKey,
}

impl Drop for MemoryProject {
    fn drop(&mut self) {
        self.shared.counters.open_projects.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Project for MemoryProject {
    async fn open_bucket(&self, name: &str) -> StorageResult<Box<dyn Bucket>> {
        if !self.api_key.allows(Action::List, name, None) {
            return Err(StorageError::PermissionDenied(format!("bucket {}", name)));
        }
        if !self.shared.buckets().contains_key(name) {
            return Err(StorageError::BucketNotFound(name.to_string()));
        }
        self.shared.counters.open_buckets.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryBucket {
            shared: Arc::clone(&self.shared),
            api_key: self.api_key.clone(),
            name: name.to_string(),
        }))
    }

    async fn create_bucket(&self, name: &str) -> StorageResult<()> {
        // Restricted keys may not create buckets, matching real satellites.
        if self.api_key.is_restricted() {
            return Err(StorageError::PermissionDenied(format!("create bucket {}", name)));
        }
        let mut buckets = self.shared.buckets();
        if !buckets.contains_key(name) {
            buckets.insert(name.to_string(), Objects::new());
            self.shared.counters.buckets_created.fetch_add(1, Ordering::SeqCst);
            debug!("Created bucket {}", name);
        }
        Ok(())
    }
}

struct MemoryBucket {
    shared: Arc<Shared>,
    api_key: ApiKey,
    name: String,
}

impl Drop for MemoryBucket {
    fn drop(&mut self) {
        self.shared.counters.open_buckets.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Bucket for MemoryBucket {
    fn name(&self) -> &str {
        &self.name
    }

    async fn upload_object(&self, key: &str, mut data: ByteStream) -> StorageResult<u64> {
        if !self.api_key.allows(Action::Write, &self.name, Some(key)) {
            return Err(StorageError::PermissionDenied(format!("write {}/{}", self.name, key)));
        }
        let exists = self
            .shared
            .buckets()
            .get(&self.name)
            .map(|objects| objects.contains_key(key))
            .unwrap_or(false);
        if exists && !self.api_key.allows(Action::Delete, &self.name, Some(key)) {
            return Err(StorageError::PermissionDenied(format!(
                "overwrite {}/{} requires delete permission",
                self.name, key
            )));
        }

        let mut stored = Vec::new();
        while let Some(chunk) = data.next().await {
            let chunk = chunk.map_err(|e| StorageError::Upload(e.to_string()))?;
            stored.extend_from_slice(&chunk);
        }
        let size = stored.len() as u64;

        let mut buckets = self.shared.buckets();
        let objects = buckets
            .get_mut(&self.name)
            .ok_or_else(|| {
                StorageError::Upload(format!("bucket {} disappeared during upload", self.name))
            })?;
        objects.insert(key.to_string(), stored);
        Ok(size)
    }

    async fn download_object(&self, key: &str) -> StorageResult<Vec<u8>> {
        if !self.api_key.allows(Action::Read, &self.name, Some(key)) {
            return Err(StorageError::PermissionDenied(format!("read {}/{}", self.name, key)));
        }
        self.shared
            .buckets()
            .get(&self.name)
            .and_then(|objects| objects.get(key).cloned())
            .ok_or_else(|| StorageError::Backend(format!("object not found: {}/{}", self.name, key)))
    }
}
