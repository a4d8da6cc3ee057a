//! Backup completion poller.
//!
//! The panel offers no notification when a backup finishes, so completion is
//! detected by listing backups until a record newer than the pre-trigger
//! baseline reports `complete`. The loop is bounded by an absolute deadline and
//! observes a cancellation token at every wait.

use crate::config::PollConfig;
use crate::panel::{BackupRecord, BackupSource, TriggerAck};
use crate::transfer::ArchiveHandle;
use crate::utils::errors::{Result, UplinkError};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollState {
    Idle,
    Triggered { baseline: usize },
    Polling { baseline: usize, attempts: u32 },
    Completed(BackupRecord),
    TimedOut,
    Failed(String),
}

impl PollState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PollState::Completed(_) | PollState::TimedOut | PollState::Failed(_)
        )
    }
}

/// The newest record, if the listing grew past `baseline` and that record is
/// complete. Records present at baseline time are never considered.
pub fn completed_since(records: &[BackupRecord], baseline: usize) -> Option<&BackupRecord> {
    if records.len() <= baseline {
        return None;
    }
    records.last().filter(|record| record.status.is_complete())
}

pub struct BackupCompletionPoller<'a, S: BackupSource + ?Sized> {
    source: &'a S,
    interval: Duration,
    max_wait: Duration,
    max_transient_failures: u32,
    cancel: CancellationToken,
    state: PollState,
}

impl<'a, S: BackupSource + ?Sized> BackupCompletionPoller<'a, S> {
    pub fn new(source: &'a S, config: &PollConfig, cancel: CancellationToken) -> Self {
        Self {
            source,
            interval: config.interval(),
            max_wait: config.max_wait(),
            max_transient_failures: config.max_transient_failures,
            cancel,
            state: PollState::Idle,
        }
    }

    pub fn state(&self) -> &PollState {
        &self.state
    }

    /// Trigger a backup, wait for it, and open the produced archive.
    pub async fn run(&mut self) -> Result<ArchiveHandle> {
        let record = self.wait_for_completion().await?;
        match self.source.open_archive(&record.file_name).await {
            Ok(handle) => Ok(handle),
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Trigger a backup and wait until it completes.
    pub async fn wait_for_completion(&mut self) -> Result<BackupRecord> {
        if self.cancel.is_cancelled() {
            return Err(self.cancelled());
        }
        let deadline = Instant::now() + self.max_wait;

        // The baseline must be taken before triggering, or the new record
        // could already be part of it.
        let baseline = match self.source.list_backups().await {
            Ok(records) => records.len(),
            Err(e) => return Err(self.fail(e)),
        };
        info!("Found {} existing backups", baseline);

        match self.source.trigger_backup().await {
            Ok(TriggerAck::Accepted { pid }) => {
                info!("Full backup started (pid {})", pid.as_deref().unwrap_or("unknown"));
            }
            Ok(TriggerAck::AlreadyRunning) => {
                warn!("A backup was already running; waiting for the next new record");
            }
            Err(e) => return Err(self.fail(e)),
        }
        self.transition(PollState::Triggered { baseline });

        let mut attempts = 0u32;
        let mut transient_failures = 0u32;
        self.transition(PollState::Polling { baseline, attempts });

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(self.cancelled()),
                _ = tokio::time::sleep_until(deadline) => return Err(self.timed_out()),
                _ = tokio::time::sleep(self.interval) => {}
            }

            let listing = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(self.cancelled()),
                _ = tokio::time::sleep_until(deadline) => return Err(self.timed_out()),
                listing = self.source.list_backups() => listing,
            };

            attempts += 1;
            self.transition(PollState::Polling { baseline, attempts });

            match listing {
                Ok(records) => {
                    transient_failures = 0;
                    if let Some(record) = completed_since(&records, baseline) {
                        info!("Completed full backup: {}", record.file_name);
                        let record = record.clone();
                        self.transition(PollState::Completed(record.clone()));
                        return Ok(record);
                    }
                    match records.last() {
                        Some(newest) if records.len() > baseline => {
                            debug!("Backup {} is {:?}", newest.file_name, newest.status);
                        }
                        _ => debug!("No new backup yet ({} records)", records.len()),
                    }
                }
                Err(e) if e.is_transient() && transient_failures < self.max_transient_failures => {
                    transient_failures += 1;
                    warn!(
                        "Listing backups failed ({}/{}): {}",
                        transient_failures, self.max_transient_failures, e
                    );
                }
                Err(e) => return Err(self.fail(e)),
            }
        }
    }

    fn transition(&mut self, next: PollState) {
        debug!("Poller state: {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    fn fail(&mut self, err: UplinkError) -> UplinkError {
        self.transition(PollState::Failed(err.to_string()));
        err
    }

    fn cancelled(&mut self) -> UplinkError {
        info!("Backup polling cancelled");
        self.fail(UplinkError::Cancelled)
    }

    fn timed_out(&mut self) -> UplinkError {
        warn!("No completed backup within {:?}", self.max_wait);
        self.transition(PollState::TimedOut);
        UplinkError::TimedOut(self.max_wait)
    }
}
