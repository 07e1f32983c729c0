//! arcgis-sync CLI
//!
//! # Commands
//!
//! - `schema` - Print the configuration schema, or with `--output` the
//!   remote layer's property schema
//! - `pull` - Read the incoming layer and write it as a GeoJSON collection
//! - `push` - Apply a batch of change records to the outgoing layers

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

use arcgis_sync::auth::{
    ArcgisTokenIssuer, AuthCache, CredentialStore, FileCredentialStore, MemoryCredentialStore,
};
use arcgis_sync::config::LayerConfig;
use arcgis_sync::geometry::WebMercator;
use arcgis_sync::host::{HostEvent, HostResponse, JsonSink, SyncHost};
use arcgis_sync::remote::{ArcgisReader, ArcgisWriter};
use arcgis_sync::sync::{PullPipeline, PushPipeline};

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Sync features between a feature store and an ArcGIS feature server.
#[derive(Parser)]
#[command(name = "arcgis-sync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Layer configuration file (TOML)
    #[arg(global = true, short, long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the configuration schema
    Schema {
        /// Print the remote layer's property schema instead
        #[arg(long)]
        output: bool,
    },

    /// Read the incoming layer and emit a feature collection
    Pull {
        /// Write the collection to this file instead of stdout
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Apply a batch of change records to the outgoing layers
    Push {
        /// JSON array of GeoJSON features, or a FeatureCollection
        #[arg(short, long)]
        batch: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Commands::Schema { output: false } = cli.command {
        print_json(&arcgis_sync::config::input_schema())?;
        return Ok(());
    }

    let Some(config_path) = cli.config.as_deref() else {
        bail!("--config is required for this command");
    };
    let mut layer = LayerConfig::load(config_path)
        .with_context(|| format!("Failed to load layer config from {config_path}"))?;
    layer.apply_env();

    let (event, sink) = match cli.command {
        Commands::Schema { .. } => (HostEvent::SchemaOutput, JsonSink::stdout()),
        Commands::Pull { out } => (
            HostEvent::Pull,
            out.map(JsonSink::file).unwrap_or_else(JsonSink::stdout),
        ),
        Commands::Push { batch } => (
            HostEvent::Push {
                batch: read_batch(&batch).await?,
            },
            JsonSink::stdout(),
        ),
    };

    let host = build_host(layer, sink)?;
    match host.handle(event).await? {
        HostResponse::Schema(schema) => print_json(&schema)?,
        HostResponse::Submitted(count) => {
            tracing::info!(count, "Pull complete");
        }
        HostResponse::Acknowledged(ok) => print_json(&serde_json::json!({ "ok": ok }))?,
    }
    Ok(())
}

fn build_host(layer: LayerConfig, sink: JsonSink) -> Result<SyncHost> {
    let http = reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .context("Failed to build HTTP client")?;

    let state_path = layer
        .credential_path()
        .context("Failed to resolve credential state path")?;
    let store: Arc<dyn CredentialStore> = match state_path {
        Some(path) => {
            tracing::debug!(path = %path.display(), "Using credential file");
            Arc::new(FileCredentialStore::new(path))
        }
        None => {
            tracing::warn!("No data directory available, credentials will not persist");
            Arc::new(MemoryCredentialStore::new())
        }
    };
    let auth = Arc::new(AuthCache::new(
        Arc::new(ArcgisTokenIssuer::new(http.clone())),
        store,
    ));

    let layer = Arc::new(layer);
    let pull = PullPipeline::new(
        layer.clone(),
        auth.clone(),
        Arc::new(ArcgisReader::new(http.clone())),
    );
    let push = PushPipeline::new(
        layer,
        auth,
        Arc::new(ArcgisWriter::new(http)),
        Arc::new(WebMercator),
    );
    Ok(SyncHost::new(pull, push, Arc::new(sink)))
}

async fn read_batch(path: &Path) -> Result<Vec<Value>> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read batch {}", path.display()))?;
    let value: Value = serde_json::from_str(&raw).context("Batch is not valid JSON")?;
    match value {
        Value::Array(records) => Ok(records),
        Value::Object(mut obj) => match obj.remove("features") {
            Some(Value::Array(records)) => Ok(records),
            _ => bail!("Batch object must carry a `features` array"),
        },
        _ => bail!("Batch must be a JSON array or a FeatureCollection"),
    }
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
