//! The two invocation modes: upload a literal sample payload, or trigger a
//! panel backup, wait for it and upload the archive.

use crate::access::{AccessMode, AccessScopeBuilder, ResolvedAccess};
use crate::config::{PollConfig, StorageConfig};
use crate::panel::BackupSource;
use crate::poller::BackupCompletionPoller;
use crate::storage::{ObjectUploadPipeline, StorageNetwork, UploadReport, UploadTarget};
use crate::transfer::ArchiveHandle;
use crate::utils::errors::{Result, UplinkError};
use tokio_util::sync::CancellationToken;
use tracing::info;

pub const SAMPLE_PAYLOAD: &[u8] = b"test";
pub const SAMPLE_FILE_NAME: &str = "test.txt";

#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    /// Scope token to hand out, when one was derived.
    pub token: Option<String>,
    pub restricted_token: bool,
    pub report: UploadReport,
}

pub struct Pipeline<'a> {
    network: &'a dyn StorageNetwork,
    scopes: AccessScopeBuilder,
    cancel: CancellationToken,
}

impl<'a> Pipeline<'a> {
    pub fn new(network: &'a dyn StorageNetwork, cancel: CancellationToken) -> Self {
        Self {
            network,
            scopes: AccessScopeBuilder::new(),
            cancel,
        }
    }

    pub fn with_scope_builder(mut self, scopes: AccessScopeBuilder) -> Self {
        self.scopes = scopes;
        self
    }

    /// Upload [`SAMPLE_PAYLOAD`] as [`SAMPLE_FILE_NAME`].
    pub async fn upload_sample(&self, storage: &StorageConfig, mode: AccessMode) -> Result<PipelineOutcome> {
        let access = self.prepare(storage, mode)?;
        let archive = ArchiveHandle::from_bytes(SAMPLE_FILE_NAME, SAMPLE_PAYLOAD.to_vec());
        self.upload(storage, access, archive).await
    }

    /// Trigger a backup on `source`, wait for it and upload the archive.
    pub async fn run_store<S: BackupSource + ?Sized>(
        &self,
        source: &S,
        poll: &PollConfig,
        storage: &StorageConfig,
        mode: AccessMode,
    ) -> Result<PipelineOutcome> {
        // Reject bad storage settings before the panel starts a backup.
        let access = self.prepare(storage, mode)?;

        let archive = BackupCompletionPoller::new(source, poll, self.cancel.clone())
            .run()
            .await?;
        self.upload(storage, access, archive).await
    }

    fn prepare(&self, storage: &StorageConfig, mode: AccessMode) -> Result<ResolvedAccess> {
        if storage.bucket.trim().is_empty() {
            return Err(UplinkError::Validation("bucketName is required".into()));
        }
        self.scopes.resolve(storage, mode)
    }

    async fn upload(
        &self,
        storage: &StorageConfig,
        access: ResolvedAccess,
        archive: ArchiveHandle,
    ) -> Result<PipelineOutcome> {
        let target = UploadTarget::new(&storage.bucket, &storage.upload_path, &archive.file_name)?;
        let report = ObjectUploadPipeline::new(self.network)
            .run(&access.upload_scope, &target, archive, &self.cancel)
            .await?;
        info!("Stored {}/{}", report.bucket, report.object_key);

        Ok(PipelineOutcome {
            token: access.token,
            restricted_token: access.restricted_token,
            report,
        })
    }
}
