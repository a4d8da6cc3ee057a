//! Hosting-panel account client.
//!
//! Talks to the panel's JSON APIs over HTTPS with basic auth: lists the
//! account's full backups (API2 `Backups::listfullbackups`), triggers a new one
//! (UAPI `Backup::fullbackup_to_homedir`) and opens finished archives from the
//! account's home directory.

pub mod types;

pub use types::{BackupRecord, BackupStatus, TriggerAck};

use crate::config::PanelConfig;
use crate::transfer::ArchiveHandle;
use crate::utils::errors::{Result, UplinkError};
use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};
use types::{Api2Response, FullBackupToHomeDirResponse};

const USER_AGENT: &str = concat!("panel-uplink/", env!("CARGO_PKG_VERSION"));

/// Source of backup archives, as seen by the completion poller.
#[async_trait]
pub trait BackupSource: Send + Sync {
    /// Current backup listing, oldest first.
    async fn list_backups(&self) -> Result<Vec<BackupRecord>>;

    /// Ask the panel to start a new full backup. Does not wait for it.
    async fn trigger_backup(&self) -> Result<TriggerAck>;

    /// Open the archive produced by a completed backup.
    async fn open_archive(&self, file_name: &str) -> Result<ArchiveHandle>;
}

/// Panel login. Immutable for the lifetime of a client.
#[derive(Clone)]
pub struct AccountCredential {
    pub host: String,
    pub username: String,
    secret: String,
}

impl AccountCredential {
    pub fn new(host: impl Into<String>, username: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            username: username.into(),
            secret: secret.into(),
        }
    }
}

impl From<&PanelConfig> for AccountCredential {
    fn from(config: &PanelConfig) -> Self {
        Self::new(&config.host, &config.username, &config.password)
    }
}

impl fmt::Debug for AccountCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountCredential")
            .field("host", &self.host)
            .field("username", &self.username)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Panel API flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiVersion {
    Uapi,
    Api2,
}

/// One panel API call.
#[derive(Debug, Clone, Copy)]
pub struct ApiRequest<'a> {
    pub version: ApiVersion,
    pub module: &'a str,
    pub function: &'a str,
    pub args: &'a [(&'a str, &'a str)],
}

pub struct PanelClient {
    http: reqwest::Client,
    base_url: Url,
    credential: AccountCredential,
    home_root: PathBuf,
    response_limit: usize,
    debug_responses: bool,
}

impl PanelClient {
    /// Client for `https://{host}:{port}/`.
    pub fn new(config: &PanelConfig) -> Result<Self> {
        let base_url = format!("https://{}:{}/", config.host, config.port);
        Self::with_base_url(config, &base_url)
    }

    /// Client against an explicit base URL.
    pub fn with_base_url(config: &PanelConfig, base_url: &str) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| UplinkError::Config(format!("invalid panel URL {}: {}", base_url, e)))?;

        if config.insecure {
            warn!(
                "TLS certificate verification is DISABLED for {}; use only against lab endpoints",
                config.host
            );
        }
        if config.debug_responses {
            warn!("Panel response logging is enabled; request URLs and bodies may expose credentials");
        }

        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .danger_accept_invalid_certs(config.insecure)
            .timeout(Duration::from_secs(config.timeout_secs))
            .pool_max_idle_per_host(0)
            .build()
            .map_err(|e| UplinkError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url,
            credential: AccountCredential::from(config),
            home_root: config.home_root.clone(),
            response_limit: config.response_limit,
            debug_responses: config.debug_responses,
        })
    }

    pub fn credential(&self) -> &AccountCredential {
        &self.credential
    }

    /// Build the URL of an API call.
    pub fn request_url(&self, request: &ApiRequest<'_>) -> Result<Url> {
        let path = match request.version {
            ApiVersion::Uapi => format!("execute/{}/{}", request.module, request.function),
            ApiVersion::Api2 => "json-api/cpanel".to_string(),
        };
        let mut url = self
            .base_url
            .join(&path)
            .map_err(|e| UplinkError::Config(format!("invalid panel API path: {}", e)))?;

        {
            let mut query = url.query_pairs_mut();
            for (key, value) in request.args {
                query.append_pair(key, value);
            }
            if request.version == ApiVersion::Api2 {
                query
                    .append_pair("cpanel_jsonapi_user", &self.credential.username)
                    .append_pair("cpanel_jsonapi_apiversion", "2")
                    .append_pair("cpanel_jsonapi_module", request.module)
                    .append_pair("cpanel_jsonapi_func", request.function);
            }
        }
        Ok(url)
    }

    /// Perform an API call and decode its JSON body.
    pub async fn call<T: DeserializeOwned>(&self, request: &ApiRequest<'_>) -> Result<T> {
        let url = self.request_url(request)?;

        let response = self
            .http
            .get(url.clone())
            .basic_auth(&self.credential.username, Some(&self.credential.secret))
            .send()
            .await?;

        let status = response.status();
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(UplinkError::Auth(format!(
                    "panel rejected credentials for {}: {}",
                    self.credential.username, status
                )));
            }
            s if s.is_server_error() => {
                return Err(UplinkError::Transport(format!("panel returned {}", s)));
            }
            s if !s.is_success() => {
                return Err(UplinkError::Protocol(format!("panel returned {}", s)));
            }
            _ => {}
        }

        let body = self.read_capped(response).await?;

        if self.debug_responses {
            debug!("Panel request: {}", url);
            debug!("Panel status: {}", status);
            debug!("Panel function: {}::{}", request.module, request.function);
            debug!("Panel body: {}", String::from_utf8_lossy(&body));
        }

        serde_json::from_slice(&body).map_err(|e| {
            UplinkError::Protocol(format!(
                "malformed {}::{} response: {}",
                request.module, request.function, e
            ))
        })
    }

    /// Read a response body, refusing anything at or above the size ceiling.
    async fn read_capped(&self, mut response: reqwest::Response) -> Result<Vec<u8>> {
        let limit = self.response_limit;
        if let Some(length) = response.content_length() {
            if length >= limit as u64 {
                return Err(UplinkError::Protocol(format!(
                    "API response maximum size exceeded ({} >= {} bytes)",
                    length, limit
                )));
            }
        }

        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            if body.len() + chunk.len() >= limit {
                return Err(UplinkError::Protocol(format!(
                    "API response maximum size exceeded (limit {} bytes)",
                    limit
                )));
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }

    /// Location of a backup archive in the account's home directory.
    pub fn archive_path(&self, file_name: &str) -> Result<PathBuf> {
        let name = Path::new(file_name);
        let is_plain_name = !file_name.is_empty()
            && name.file_name().map(|n| n == name.as_os_str()).unwrap_or(false);
        if !is_plain_name {
            return Err(UplinkError::Protocol(format!(
                "panel reported an unsafe backup file name: {:?}",
                file_name
            )));
        }
        Ok(self
            .home_root
            .join(&self.credential.username)
            .join(file_name))
    }
}

#[async_trait]
impl BackupSource for PanelClient {
    async fn list_backups(&self) -> Result<Vec<BackupRecord>> {
        let response: Api2Response = self
            .call(&ApiRequest {
                version: ApiVersion::Api2,
                module: "Backups",
                function: "listfullbackups",
                args: &[],
            })
            .await?;
        response.into_records().map_err(UplinkError::Protocol)
    }

    async fn trigger_backup(&self) -> Result<TriggerAck> {
        info!("Creating full backup...");
        let response: FullBackupToHomeDirResponse = self
            .call(&ApiRequest {
                version: ApiVersion::Uapi,
                module: "Backup",
                function: "fullbackup_to_homedir",
                args: &[("email", "")],
            })
            .await?;
        response.into_ack().map_err(UplinkError::Protocol)
    }

    async fn open_archive(&self, file_name: &str) -> Result<ArchiveHandle> {
        let path = self.archive_path(file_name)?;
        let file = tokio::fs::File::open(&path).await?;
        let size = file.metadata().await?.len();
        info!("Opened backup archive {}", path.display());
        Ok(ArchiveHandle::new(file_name, Box::new(file)).with_size(size))
    }
}
