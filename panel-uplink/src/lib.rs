//! Panel Uplink Library
//!
//! Triggers a full account backup on a hosting panel, waits for it to finish
//! and streams the archive into an encrypted object-storage bucket.

pub mod access;
pub mod config;
pub mod panel;
pub mod pipeline;
pub mod poller;
pub mod shutdown;
pub mod storage;
pub mod transfer;
pub mod utils;

// Re-export commonly used types
pub use access::{AccessMode, AccessScope, AccessScopeBuilder};
pub use config::{PanelConfig, PollConfig, StorageConfig};
pub use panel::{BackupSource, PanelClient};
pub use pipeline::{Pipeline, PipelineOutcome};
pub use poller::{BackupCompletionPoller, PollState};
pub use utils::errors::{Result, StorageError, UplinkError};
