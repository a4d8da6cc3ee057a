//! Panel API wire types and the backup records derived from them.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

/// Backup job status as reported by the panel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupStatus {
    InProgress,
    Complete,
    Other(String),
}

impl BackupStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "complete" => BackupStatus::Complete,
            "inprogress" | "in_progress" => BackupStatus::InProgress,
            other => BackupStatus::Other(other.to_string()),
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, BackupStatus::Complete)
    }
}

/// One entry of the account's backup listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupRecord {
    pub file_name: String,
    pub status: BackupStatus,
    pub created_at: Option<DateTime<Utc>>,
    /// Position in the listing; the newest record has the highest index.
    pub sequence_index: usize,
}

/// Panel answer to a backup trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerAck {
    Accepted { pid: Option<String> },
    AlreadyRunning,
}

/// Envelope of every API2 response.
#[derive(Debug, Deserialize)]
pub struct Api2Response {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub cpanelresult: Option<ListFullBackupsResult>,
}

/// `cpanelresult` of `Backups::listfullbackups`.
#[derive(Debug, Default, Deserialize)]
pub struct ListFullBackupsResult {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub event: Option<Api2Event>,
    #[serde(default)]
    pub data: Vec<FullBackupEntry>,
}

#[derive(Debug, Default, Deserialize)]
pub struct Api2Event {
    #[serde(default)]
    pub result: i64,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FullBackupEntry {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub localtime: Option<String>,
    #[serde(default)]
    pub file: String,
    #[serde(default)]
    pub time: Option<i64>,
}

/// Response of UAPI `Backup::fullbackup_to_homedir`.
#[derive(Debug, Deserialize)]
pub struct FullBackupToHomeDirResponse {
    #[serde(default)]
    pub status: i64,
    #[serde(default)]
    pub errors: Option<Vec<String>>,
    #[serde(default)]
    pub messages: Option<Vec<String>>,
    #[serde(default)]
    pub data: Option<FullBackupToHomeDirData>,
}

#[derive(Debug, Deserialize)]
pub struct FullBackupToHomeDirData {
    #[serde(default)]
    pub pid: Option<Value>,
}

fn non_empty(message: &Option<String>) -> Option<&str> {
    message.as_deref().map(str::trim).filter(|m| !m.is_empty())
}

impl Api2Response {
    /// Unwrap the listing, surfacing API-level errors as messages.
    pub fn into_records(self) -> Result<Vec<BackupRecord>, String> {
        if let Some(error) = non_empty(&self.error) {
            return Err(error.to_string());
        }
        let result = self
            .cpanelresult
            .ok_or_else(|| "response has no cpanelresult".to_string())?;
        if let Some(error) = non_empty(&result.error) {
            return Err(error.to_string());
        }
        if let Some(event) = &result.event {
            if event.result == 0 {
                return Err(non_empty(&event.reason)
                    .unwrap_or("listfullbackups reported failure")
                    .to_string());
            }
        }

        Ok(result
            .data
            .into_iter()
            .enumerate()
            .map(|(sequence_index, entry)| BackupRecord {
                status: BackupStatus::parse(&entry.status),
                created_at: entry.time.and_then(|t| DateTime::from_timestamp(t, 0)),
                file_name: entry.file,
                sequence_index,
            })
            .collect())
    }
}

impl FullBackupToHomeDirResponse {
    pub fn into_ack(self) -> Result<TriggerAck, String> {
        if self.status == 1 {
            let pid = self.data.and_then(|d| d.pid).map(|pid| match pid {
                Value::String(s) => s,
                other => other.to_string(),
            });
            return Ok(TriggerAck::Accepted { pid });
        }

        let errors = self.errors.unwrap_or_default().join("; ");
        let lowered = errors.to_ascii_lowercase();
        if lowered.contains("already") && (lowered.contains("progress") || lowered.contains("running")) {
            return Ok(TriggerAck::AlreadyRunning);
        }
        if errors.is_empty() {
            Err("fullbackup_to_homedir reported failure".to_string())
        } else {
            Err(errors)
        }
    }
}
