//! Streams an archive into a bucket object.

use super::encrypt::{encrypt_stream, SEGMENT_SIZE};
use super::{Bucket, Project, StorageNetwork};
use crate::access::encryption::Key;
use crate::access::AccessScope;
use crate::transfer::progress_stream::ProgressStream;
use crate::transfer::ArchiveHandle;
use crate::utils::errors::{Result, StorageError, UplinkError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Append a single trailing separator. A path with nothing but separators
/// becomes empty so the object lands at the bucket root.
pub fn normalize_path(upload_path: &str) -> String {
    let trimmed = upload_path.trim_end_matches('/');
    if trimmed.is_empty() {
        return String::new();
    }
    format!("{}/", trimmed)
}

/// Where an archive goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTarget {
    pub bucket: String,
    pub object_key: String,
}

impl UploadTarget {
    pub fn new(bucket: &str, upload_path: &str, file_name: &str) -> Result<Self> {
        if bucket.trim().is_empty() {
            return Err(UplinkError::Validation("bucketName is required".into()));
        }
        if file_name.is_empty() {
            return Err(UplinkError::Validation("archive has no file name".into()));
        }
        Ok(Self {
            bucket: bucket.to_string(),
            object_key: format!("{}{}", normalize_path(upload_path), file_name),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReport {
    pub bucket: String,
    pub object_key: String,
    pub bytes: u64,
}

/// Open `name`, creating it once if it does not exist yet.
pub async fn ensure_bucket(project: &dyn Project, name: &str) -> Result<Box<dyn Bucket>> {
    match project.open_bucket(name).await {
        Ok(bucket) => Ok(bucket),
        Err(StorageError::BucketNotFound(_)) => {
            info!("Bucket {} does not exist, creating it", name);
            project.create_bucket(name).await?;
            Ok(project.open_bucket(name).await?)
        }
        Err(e) => Err(e.into()),
    }
}

/// Stream `archive` into `object_key`, encrypted with `key`. Returns the
/// number of plaintext bytes read from the archive.
///
/// The archive reader is consumed by the upload stream, so it is closed when
/// this future completes or is dropped.
pub async fn upload(
    bucket: &dyn Bucket,
    object_key: &str,
    archive: ArchiveHandle,
    key: &Key,
) -> Result<u64> {
    let ArchiveHandle {
        file_name,
        reader,
        size,
    } = archive;

    let transferred = Arc::new(AtomicU64::new(0));
    let plain = ProgressStream::new(
        ReaderStream::with_capacity(reader, SEGMENT_SIZE),
        file_name,
        size,
        Arc::clone(&transferred),
    );
    let sealed = encrypt_stream(Box::pin(plain), key);

    let stored = bucket.upload_object(object_key, sealed).await?;
    let bytes = transferred.load(Ordering::Relaxed);
    info!(
        "Uploaded {} bytes ({} stored) to {}/{}",
        bytes,
        stored,
        bucket.name(),
        object_key
    );
    Ok(bytes)
}

pub struct ObjectUploadPipeline<'a> {
    network: &'a dyn StorageNetwork,
}

impl<'a> ObjectUploadPipeline<'a> {
    pub fn new(network: &'a dyn StorageNetwork) -> Self {
        Self { network }
    }

    /// Open a session with `scope`, ensure the bucket and upload. Every handle
    /// (archive, bucket, project) is released on return, including on error
    /// and cancellation.
    pub async fn run(
        &self,
        scope: &AccessScope,
        target: &UploadTarget,
        archive: ArchiveHandle,
        cancel: &CancellationToken,
    ) -> Result<UploadReport> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!("Upload of {} cancelled", target.object_key);
                Err(UplinkError::Cancelled)
            }
            result = self.run_inner(scope, target, archive) => result,
        }
    }

    async fn run_inner(
        &self,
        scope: &AccessScope,
        target: &UploadTarget,
        archive: ArchiveHandle,
    ) -> Result<UploadReport> {
        let key = scope.encryption().object_key(&target.bucket, &target.object_key)?;

        info!("Opening project on {}", scope.satellite());
        let project = self
            .network
            .open_project(scope.satellite(), scope.api_key())
            .await?;

        let bucket = ensure_bucket(project.as_ref(), &target.bucket).await?;
        info!("Uploading {} to {}/{}", archive.file_name, target.bucket, target.object_key);
        let bytes = upload(bucket.as_ref(), &target.object_key, archive, &key).await?;

        Ok(UploadReport {
            bucket: target.bucket.clone(),
            object_key: target.object_key.clone(),
            bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::encryption::KEY_LEN;
    use crate::access::{ApiKey, EncryptionAccess};
    use crate::storage::encrypt::decrypt_object;
    use crate::storage::MemoryNetwork;
    use std::pin::Pin;
    use std::sync::atomic::AtomicBool;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncRead, ReadBuf};

    const SATELLITE: &str = "sat.example.io:7777";

    /// Reader that records when it is dropped, optionally never finishing.
    struct TrackedReader {
        data: std::io::Cursor<Vec<u8>>,
        stall: bool,
        dropped: Arc<AtomicBool>,
    }

    impl AsyncRead for TrackedReader {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            if self.stall {
                return Poll::Pending;
            }
            Pin::new(&mut self.data).poll_read(cx, buf)
        }
    }

    impl Drop for TrackedReader {
        fn drop(&mut self) {
            self.dropped.store(true, Ordering::SeqCst);
        }
    }

    fn tracked(payload: &[u8], stall: bool) -> (ArchiveHandle, Arc<AtomicBool>) {
        let dropped = Arc::new(AtomicBool::new(false));
        let reader = TrackedReader {
            data: std::io::Cursor::new(payload.to_vec()),
            stall,
            dropped: Arc::clone(&dropped),
        };
        (ArchiveHandle::new("backup.tar.gz", Box::new(reader)), dropped)
    }

    fn scope(api_key: ApiKey) -> AccessScope {
        AccessScope::Full {
            satellite: SATELLITE.into(),
            api_key,
            encryption: EncryptionAccess::from_root_key([5u8; KEY_LEN]),
        }
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("a/b"), "a/b/");
        assert_eq!(normalize_path("a/b/"), "a/b/");
        assert_eq!(normalize_path("a/b//"), "a/b/");
        assert_eq!(normalize_path(""), "");
        assert_eq!(normalize_path("/"), "");
        assert_eq!(normalize_path("//"), "");
    }

    #[test]
    fn test_upload_target() {
        let target = UploadTarget::new("backups", "2024", "backup-3.tar.gz").unwrap();
        assert_eq!(target.object_key, "2024/backup-3.tar.gz");
        assert!(matches!(
            UploadTarget::new("", "2024", "x"),
            Err(UplinkError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_creates_missing_bucket_once() {
        let network = MemoryNetwork::new(SATELLITE);
        let scope = scope(network.issue_api_key());
        let pipeline = ObjectUploadPipeline::new(&network);
        let target = UploadTarget::new("backups", "2024/", "backup.tar.gz").unwrap();
        let cancel = CancellationToken::new();

        let (first, first_dropped) = tracked(b"first", false);
        let report = pipeline.run(&scope, &target, first, &cancel).await.unwrap();
        assert_eq!(report.bytes, 5);
        assert!(first_dropped.load(Ordering::SeqCst));

        let target = UploadTarget::new("backups", "2024/", "second.tar.gz").unwrap();
        let (second, _) = tracked(b"second", false);
        pipeline.run(&scope, &target, second, &cancel).await.unwrap();

        assert_eq!(network.buckets_created(), 1);
        assert_eq!(network.open_projects(), 0);
        assert_eq!(network.open_buckets(), 0);

        let key = scope
            .encryption()
            .object_key("backups", "2024/second.tar.gz")
            .unwrap();
        let stored = network.object("backups", "2024/second.tar.gz").unwrap();
        assert_eq!(decrypt_object(&key, &stored).unwrap(), b"second");
    }

    #[tokio::test]
    async fn test_failed_upload_releases_everything() {
        let network = MemoryNetwork::new(SATELLITE);
        let root = network.issue_api_key();
        {
            let project = network.open_project(SATELLITE, &root).await.unwrap();
            project.create_bucket("backups").await.unwrap();
        }
        let readonly = root
            .restrict(crate::access::Caveat {
                disallow_writes: true,
                ..Default::default()
            })
            .unwrap();
        let scope = AccessScope::Restricted {
            satellite: SATELLITE.into(),
            api_key: readonly,
            encryption: EncryptionAccess::from_root_key([5u8; KEY_LEN]),
            caveat: Default::default(),
            restriction: crate::access::PathRestriction::new("backups", ""),
        };
        let target = UploadTarget::new("backups", "", "backup.tar.gz").unwrap();
        let (archive, dropped) = tracked(b"data", false);

        let err = ObjectUploadPipeline::new(&network)
            .run(&scope, &target, archive, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, UplinkError::Storage(StorageError::PermissionDenied(_))));
        assert!(dropped.load(Ordering::SeqCst));
        assert_eq!(network.open_projects(), 0);
        assert_eq!(network.open_buckets(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_upload_releases_archive() {
        let network = MemoryNetwork::new(SATELLITE);
        let scope = scope(network.issue_api_key());
        let target = UploadTarget::new("backups", "", "backup.tar.gz").unwrap();
        let (archive, dropped) = tracked(b"never read", true);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = ObjectUploadPipeline::new(&network)
            .run(&scope, &target, archive, &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, UplinkError::Cancelled));
        assert!(dropped.load(Ordering::SeqCst));
        assert_eq!(network.open_projects(), 0);
        assert_eq!(network.open_buckets(), 0);
    }
}
