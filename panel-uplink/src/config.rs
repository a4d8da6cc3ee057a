//! Configuration for the panel account, the storage network and the poller.
//!
//! Files are JSON by default, using the key names of the connector's
//! historical `cpanel_property.json` / `storj_config.json` files. Files with a
//! `.toml` extension are parsed as TOML with the same keys.

use crate::access::{Caveat, PathRestriction};
use crate::utils::errors::{Result, UplinkError};
use serde::de::{DeserializeOwned, Deserializer};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Default location of the panel account configuration.
pub const DEFAULT_PANEL_CONFIG: &str = "./config/cpanel_property.json";

/// Default location of the storage configuration.
pub const DEFAULT_STORAGE_CONFIG: &str = "./config/storj_config.json";

/// Setting this variable to `1` turns on verbose panel request logging.
pub const DEBUG_RESPONSES_ENV: &str = "DEBUG_CPANEL_RESPONSES";

#[derive(Clone, Serialize, Deserialize)]
pub struct PanelConfig {
    /// Panel host name, without scheme or port
    #[serde(rename = "hostname")]
    pub host: String,

    pub username: String,

    pub password: String,

    /// Panel API port (cPanel serves the user API on 2083)
    #[serde(default = "default_panel_port")]
    pub port: u16,

    /// Skip TLS certificate verification. Lab endpoints only.
    #[serde(default)]
    pub insecure: bool,

    /// Responses at or above this many bytes are rejected
    #[serde(default = "default_response_limit", rename = "responseLimit")]
    pub response_limit: usize,

    /// Parent directory of the account home directories
    #[serde(default = "default_home_root", rename = "homeRoot")]
    pub home_root: PathBuf,

    /// Log every panel request and response body at debug level
    #[serde(default, rename = "debugResponses")]
    pub debug_responses: bool,

    /// Per-request timeout in seconds
    #[serde(default = "default_timeout_secs", rename = "timeoutSecs")]
    pub timeout_secs: u64,

    #[serde(default)]
    pub poll: PollConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollConfig {
    /// Seconds between two backup listings
    #[serde(default = "default_poll_interval_secs", rename = "intervalSecs")]
    pub interval_secs: u64,

    /// Give up when no completed backup appeared within this many seconds
    #[serde(default = "default_max_wait_secs", rename = "maxWaitSecs")]
    pub max_wait_secs: u64,

    /// Consecutive transport failures tolerated while polling
    #[serde(default = "default_max_transient_failures", rename = "maxTransientFailures")]
    pub max_transient_failures: u32,
}

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default, rename = "apikey")]
    pub api_key: String,

    #[serde(default, rename = "satelliteURL")]
    pub satellite: String,

    #[serde(default, rename = "bucketName")]
    pub bucket: String,

    #[serde(default, rename = "uploadPath")]
    pub upload_path: String,

    #[serde(default, rename = "encryptionpassphrase")]
    pub passphrase: String,

    #[serde(default, rename = "serializedScope")]
    pub serialized_scope: String,

    #[serde(default, rename = "disallowReads", deserialize_with = "deserialize_flag")]
    pub disallow_reads: bool,

    #[serde(default, rename = "disallowWrites", deserialize_with = "deserialize_flag")]
    pub disallow_writes: bool,

    #[serde(default, rename = "disallowDeletes", deserialize_with = "deserialize_flag")]
    pub disallow_deletes: bool,
}

// Default values
fn default_panel_port() -> u16 {
    2083
}

fn default_response_limit() -> usize {
    20 * 1024 * 1024 + 1337
}

fn default_home_root() -> PathBuf {
    PathBuf::from("/home")
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_poll_interval_secs() -> u64 {
    10
}

fn default_max_wait_secs() -> u64 {
    3600
}

fn default_max_transient_failures() -> u32 {
    3
}

impl Default for PollConfig {
    fn default() -> Self {
        PollConfig {
            interval_secs: default_poll_interval_secs(),
            max_wait_secs: default_max_wait_secs(),
            max_transient_failures: default_max_transient_failures(),
        }
    }
}

impl PollConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_secs)
    }
}

impl PanelConfig {
    /// Load the panel configuration and apply the debug environment toggle.
    pub fn from_file(path: &Path) -> Result<Self> {
        let mut config: PanelConfig = load_file(path)?;
        config.apply_debug_env(std::env::var(DEBUG_RESPONSES_ENV).ok().as_deref());
        Ok(config)
    }

    /// Enable response logging when the toggle value is exactly `1`.
    pub fn apply_debug_env(&mut self, value: Option<&str>) {
        if value == Some("1") {
            self.debug_responses = true;
        }
    }

    /// Log the loaded configuration without secrets.
    pub fn log_summary(&self, source: &Path) {
        info!("Read panel configuration from {}", source.display());
        info!("Host name: {}:{}", self.host, self.port);
        info!("User name: {}", self.username);
    }
}

impl fmt::Debug for PanelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PanelConfig")
            .field("host", &self.host)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("port", &self.port)
            .field("insecure", &self.insecure)
            .field("response_limit", &self.response_limit)
            .field("home_root", &self.home_root)
            .field("debug_responses", &self.debug_responses)
            .field("timeout_secs", &self.timeout_secs)
            .field("poll", &self.poll)
            .finish()
    }
}

impl StorageConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        load_file(path)
    }

    /// Operation restrictions requested for the restricted token.
    pub fn caveat(&self) -> Caveat {
        Caveat {
            disallow_reads: self.disallow_reads,
            disallow_writes: self.disallow_writes,
            disallow_deletes: self.disallow_deletes,
            allowed_paths: Vec::new(),
        }
    }

    /// Bucket/prefix subtree the restricted token is narrowed to.
    pub fn path_restriction(&self) -> PathRestriction {
        PathRestriction::new(&self.bucket, &self.upload_path)
    }

    /// Log the loaded configuration without secrets.
    pub fn log_summary(&self, source: &Path) {
        info!("Read storage configuration from {}", source.display());
        info!("Satellite: {}", self.satellite);
        info!("Bucket: {}", self.bucket);
        info!("Upload path: {}", self.upload_path);
        info!(
            "Serialized scope: {}",
            if self.serialized_scope.is_empty() { "absent" } else { "present" }
        );
    }
}

impl fmt::Debug for StorageConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageConfig")
            .field("api_key", &"<redacted>")
            .field("satellite", &self.satellite)
            .field("bucket", &self.bucket)
            .field("upload_path", &self.upload_path)
            .field("passphrase", &"<redacted>")
            .field("serialized_scope", &"<redacted>")
            .field("disallow_reads", &self.disallow_reads)
            .field("disallow_writes", &self.disallow_writes)
            .field("disallow_deletes", &self.disallow_deletes)
            .finish()
    }
}

/// Read a JSON (or `.toml`) configuration file.
fn load_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| UplinkError::Config(format!("{}: {}", path.display(), e)))?;

    let is_toml = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);

    if is_toml {
        toml::from_str(&content).map_err(|e| UplinkError::Config(format!("{}: {}", path.display(), e)))
    } else {
        serde_json::from_str(&content)
            .map_err(|e| UplinkError::Config(format!("{}: {}", path.display(), e)))
    }
}

/// Parse a boolean flag the way the historical config files spell them.
pub fn parse_flag(value: &str) -> std::result::Result<bool, String> {
    match value.trim().to_ascii_lowercase().as_str() {
        "" | "0" | "f" | "false" => Ok(false),
        "1" | "t" | "true" => Ok(true),
        other => Err(format!("invalid boolean flag: {:?}", other)),
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum FlagRepr {
    Bool(bool),
    Text(String),
}

fn deserialize_flag<'de, D>(deserializer: D) -> std::result::Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    match FlagRepr::deserialize(deserializer)? {
        FlagRepr::Bool(value) => Ok(value),
        FlagRepr::Text(text) => parse_flag(&text).map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(suffix: &str, content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_panel_config_defaults() {
        let file = write_config(
            ".json",
            r#"{"hostname": "panel.example.com", "username": "alice", "password": "s3cret"}"#,
        );
        let config = PanelConfig::from_file(file.path()).unwrap();

        assert_eq!(config.host, "panel.example.com");
        assert_eq!(config.port, 2083);
        assert!(!config.insecure);
        assert_eq!(config.response_limit, 20 * 1024 * 1024 + 1337);
        assert_eq!(config.home_root, PathBuf::from("/home"));
        assert_eq!(config.poll.interval(), Duration::from_secs(10));
        assert_eq!(config.poll.max_wait(), Duration::from_secs(3600));
    }

    #[test]
    fn test_panel_debug_redacts_password() {
        let file = write_config(
            ".json",
            r#"{"hostname": "h", "username": "alice", "password": "hunter2"}"#,
        );
        let config = PanelConfig::from_file(file.path()).unwrap();
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn test_debug_env_toggle() {
        let file = write_config(".json", r#"{"hostname": "h", "username": "u", "password": "p"}"#);
        let mut config: PanelConfig = load_file(file.path()).unwrap();

        config.apply_debug_env(Some("0"));
        assert!(!config.debug_responses);
        config.apply_debug_env(None);
        assert!(!config.debug_responses);
        config.apply_debug_env(Some("1"));
        assert!(config.debug_responses);
    }

    #[test]
    fn test_storage_config_string_flags() {
        let file = write_config(
            ".json",
            r#"{
                "apikey": "key",
                "satelliteURL": "us1.example.io:7777",
                "bucketName": "backups",
                "uploadPath": "2024/",
                "encryptionpassphrase": "pass",
                "serializedScope": "",
                "disallowReads": "true",
                "disallowWrites": "",
                "disallowDeletes": true
            }"#,
        );
        let config = StorageConfig::from_file(file.path()).unwrap();

        assert!(config.disallow_reads);
        assert!(!config.disallow_writes);
        assert!(config.disallow_deletes);

        let restriction = config.path_restriction();
        assert_eq!(restriction.bucket, "backups");
        assert_eq!(restriction.path_prefix, "2024/");
        assert!(config.caveat().allowed_paths.is_empty());
    }

    #[test]
    fn test_storage_config_rejects_bad_flag() {
        let file = write_config(".json", r#"{"disallowReads": "maybe"}"#);
        let err = StorageConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, UplinkError::Config(_)));
    }

    #[test]
    fn test_storage_config_from_toml() {
        let file = write_config(
            ".toml",
            "apikey = \"k\"\nsatelliteURL = \"sat\"\nbucketName = \"b\"\nuploadPath = \"p\"\ndisallowDeletes = \"1\"\n",
        );
        let config = StorageConfig::from_file(file.path()).unwrap();
        assert_eq!(config.bucket, "b");
        assert!(config.disallow_deletes);
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let err = StorageConfig::from_file(Path::new("/nonexistent/storj_config.json")).unwrap_err();
        assert!(matches!(err, UplinkError::Config(_)));
    }

    #[test]
    fn test_parse_flag() {
        assert_eq!(parse_flag("TRUE"), Ok(true));
        assert_eq!(parse_flag(" t "), Ok(true));
        assert_eq!(parse_flag("False"), Ok(false));
        assert_eq!(parse_flag(""), Ok(false));
        assert!(parse_flag("yes").is_err());
    }
}
