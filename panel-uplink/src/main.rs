//! Panel Uplink - Main entry point

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use panel_uplink::config::{DEFAULT_PANEL_CONFIG, DEFAULT_STORAGE_CONFIG};
use panel_uplink::storage::HttpGateway;
use panel_uplink::{shutdown, utils, AccessMode, PanelClient, PanelConfig, Pipeline, PipelineOutcome, StorageConfig};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload a small sample object to check the storage settings
    #[command(alias = "t")]
    Test {
        #[command(flatten)]
        access: AccessArgs,
    },

    /// Create a full panel backup and upload it
    #[command(alias = "s")]
    Store {
        /// Panel account configuration
        #[arg(long, value_name = "FILE", default_value = DEFAULT_PANEL_CONFIG)]
        panel: PathBuf,

        #[command(flatten)]
        access: AccessArgs,
    },
}

#[derive(Args, Debug)]
struct AccessArgs {
    /// Storage configuration
    #[arg(long, value_name = "FILE", default_value = DEFAULT_STORAGE_CONFIG)]
    storage: PathBuf,

    /// Derive scopes from the raw API key and passphrase
    #[arg(long)]
    key: bool,

    /// Also produce a restricted scope token (requires --key)
    #[arg(long)]
    restrict: bool,
}

impl AccessArgs {
    fn mode(&self) -> AccessMode {
        if self.key {
            AccessMode::RawKey {
                restrict: self.restrict,
            }
        } else {
            if self.restrict {
                warn!("--restrict has no effect without --key");
            }
            AccessMode::SerializedScope
        }
    }

    fn load_storage(&self) -> Result<StorageConfig> {
        let storage = StorageConfig::from_file(&self.storage)
            .with_context(|| format!("loading {}", self.storage.display()))?;
        storage.log_summary(&self.storage);
        Ok(storage)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    utils::logger::init(&cli.log_level)?;

    info!("Starting panel-uplink v{}", env!("CARGO_PKG_VERSION"));

    let cancel = shutdown::install();
    let network = HttpGateway::new(Duration::from_secs(30))?;
    let pipeline = Pipeline::new(&network, cancel);

    let result = match &cli.command {
        Command::Test { access } => {
            let storage = access.load_storage()?;
            pipeline.upload_sample(&storage, access.mode()).await
        }
        Command::Store { panel, access } => {
            let panel_config = PanelConfig::from_file(panel)
                .with_context(|| format!("loading {}", panel.display()))?;
            panel_config.log_summary(panel);
            let storage = access.load_storage()?;

            let client = PanelClient::new(&panel_config)?;
            pipeline
                .run_store(&client, &panel_config.poll, &storage, access.mode())
                .await
        }
    };

    match result {
        Ok(outcome) => {
            report(&outcome);
            Ok(())
        }
        Err(e) => {
            error!("Failed ({}): {}", e.kind(), e);
            Err(e.into())
        }
    }
}

fn report(outcome: &PipelineOutcome) {
    info!(
        "Uploaded {} bytes to {}/{}",
        outcome.report.bytes, outcome.report.bucket, outcome.report.object_key
    );
    if let Some(token) = &outcome.token {
        if outcome.restricted_token {
            println!("Restricted Serialized Scope Key: {}", token);
        } else {
            println!("Serialized Scope Key: {}", token);
        }
    }
}
