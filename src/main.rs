//! Streams Metadata CLI
//!
//! Entry point for the `streams-metadata` command-line tool.

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use streams_metadata::catalog::DEFAULT_STREAM;
use streams_metadata::{
    find_catalog, CatalogError, CatalogRecord, CloudSpec, FileStore, Pipeline, PipelineRequest,
    SourceSet, SourcesFile,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "streams-metadata")]
#[command(about = "Find and publish simplestreams image metadata", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate image metadata and merge it into a metadata directory
    GenerateImage {
        /// Series the image is for (e.g. trusty)
        #[arg(long, short = 's')]
        series: String,

        /// Image architecture
        #[arg(long, short = 'a', default_value = "amd64")]
        arch: String,

        /// Image id
        #[arg(long, short = 'i')]
        image_id: String,

        /// Cloud region (requires --endpoint)
        #[arg(long, short = 'r')]
        region: Option<String>,

        /// Cloud endpoint (requires --region)
        #[arg(long, short = 'u')]
        endpoint: Option<String>,

        /// Image stream
        #[arg(long, default_value = DEFAULT_STREAM)]
        stream: String,

        /// Image virtualisation type
        #[arg(long)]
        virt_type: Option<String>,

        /// Image root storage type
        #[arg(long)]
        storage: Option<String>,

        /// Directory to write metadata into
        #[arg(long, short = 'd', default_value = ".")]
        dir: PathBuf,

        /// File holding a base64 Ed25519 signing key; also writes .sjson files
        #[arg(long)]
        signing_key: Option<PathBuf>,

        /// Sources file naming extra existing metadata to merge under the new record
        #[arg(long)]
        sources: Option<PathBuf>,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Find image metadata for a series from the configured sources
    Find {
        /// Series to look up
        #[arg(long, short = 's')]
        series: String,

        /// Cloud region (requires --endpoint)
        #[arg(long, short = 'r')]
        region: Option<String>,

        /// Cloud endpoint (requires --region)
        #[arg(long, short = 'u')]
        endpoint: Option<String>,

        /// Path to sources file (default: ~/.config/streams-metadata/sources.toml)
        #[arg(long, short = 'c')]
        sources: Option<PathBuf>,
    },

    /// Generate an Ed25519 signing key pair
    Keygen,
}

fn main() {
    let cli = Cli::parse();
    initialize_tracing();

    let result = match cli.command {
        Commands::GenerateImage {
            series,
            arch,
            image_id,
            region,
            endpoint,
            stream,
            virt_type,
            storage,
            dir,
            signing_key,
            sources,
            json,
        } => {
            let record = CatalogRecord::new(image_id, arch)
                .with_stream(stream)
                .with_virt_type(virt_type.unwrap_or_default())
                .with_storage_type(storage.unwrap_or_default());
            run_generate_image(
                &series,
                record,
                region,
                endpoint,
                &dir,
                signing_key.as_deref(),
                sources.as_deref(),
                json,
            )
        }
        Commands::Find {
            series,
            region,
            endpoint,
            sources,
        } => run_find(&series, region, endpoint, sources.as_deref()),
        Commands::Keygen => run_keygen(),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(e.exit_code());
    }
}

/// Log to stderr, filtered by RUST_LOG (default: info)
fn initialize_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn cloud_spec(region: Option<String>, endpoint: Option<String>) -> Result<CloudSpec, CatalogError> {
    Ok(CloudSpec::new(region.unwrap_or_default(), endpoint.unwrap_or_default())?)
}

fn load_sources(path: Option<&Path>) -> Result<SourcesFile, CatalogError> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => SourcesFile::default_path()?,
    };
    Ok(SourcesFile::load(&path)?)
}

fn invalid_key(path: &Path, reason: impl std::fmt::Display) -> CatalogError {
    CatalogError::Configuration(format!("signing key {}: {}", path.display(), reason))
}

fn load_signing_key(path: &Path) -> Result<streams_sign::SigningKey, CatalogError> {
    let encoded = std::fs::read_to_string(path).map_err(|e| invalid_key(path, e))?;
    streams_sign::decode_signing_key(&encoded).map_err(|e| invalid_key(path, e))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, CatalogError> {
    serde_json::to_string_pretty(value).map_err(|e| CatalogError::Write(e.to_string()))
}

#[allow(clippy::too_many_arguments)]
fn run_generate_image(
    series: &str,
    record: CatalogRecord,
    region: Option<String>,
    endpoint: Option<String>,
    dir: &Path,
    signing_key: Option<&Path>,
    sources: Option<&Path>,
    json: bool,
) -> Result<(), CatalogError> {
    let cloud = cloud_spec(region, endpoint)?;

    let extra = match sources {
        Some(path) => load_sources(Some(path))?.build(&cloud)?,
        None => SourceSet::new(),
    };

    let store = Arc::new(FileStore::new(dir)?);
    let cancel = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&cancel);
    if let Err(e) = ctrlc::set_handler(move || {
        eprintln!("\nReceived interrupt signal, cancelling before the next stage...");
        handler_flag.store(true, Ordering::SeqCst);
    }) {
        tracing::warn!(error = %e, "cannot install interrupt handler");
    }

    let mut pipeline = Pipeline::new(store).with_cancel_flag(cancel);
    if let Some(path) = signing_key {
        pipeline = pipeline.with_signing_key(load_signing_key(path)?);
    }

    let request = PipelineRequest::new(series, cloud, vec![record]).with_sources(extra);
    let outcome = pipeline.run(request)?;

    if json {
        println!("{}", to_json(&outcome)?);
    } else {
        println!("image metadata files have been written to: {}", outcome.destination);
        println!(
            "{} record(s): {} added, {} replaced, {} preserved",
            outcome.records_written, outcome.added, outcome.replaced, outcome.preserved
        );
    }
    Ok(())
}

fn run_find(
    series: &str,
    region: Option<String>,
    endpoint: Option<String>,
    sources: Option<&Path>,
) -> Result<(), CatalogError> {
    let cloud = cloud_spec(region, endpoint)?;
    let set = load_sources(sources)?.build(&cloud)?;
    let outcome = find_catalog(&set, &cloud, series)?;

    for attempt in &outcome.skipped {
        eprintln!("skipped {}", attempt);
    }
    eprintln!("found in {} ({})", outcome.source, outcome.index_url);

    let records: Vec<_> = outcome.catalog.series_records(series).collect();
    println!("{}", to_json(&records)?);
    Ok(())
}

fn run_keygen() -> Result<(), CatalogError> {
    let key = streams_sign::generate_keypair();
    let verifying = key.verifying_key();
    let output = serde_json::json!({
        "signing_key": streams_sign::encode_signing_key(&key),
        "public_key": streams_sign::encode_verifying_key(&verifying),
        "fingerprint": streams_sign::compute_key_fingerprint(&verifying),
    });
    println!("{}", to_json(&output)?);
    Ok(())
}
