//! facecluster - run one incremental clustering pass over a detections file.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use facetag_facecluster::{
    AnalyzerConfig, Cluster, Detection, FaceClusterAnalyzer, MemoryStore, RunStatus,
};
use serde::{Deserialize, Serialize};
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// Cluster a user's face detections, keeping existing cluster ids stable.
#[derive(Parser, Debug)]
#[command(name = "facecluster")]
#[command(about = "Run one incremental face clustering pass over a JSON detections file")]
struct Args {
    /// Detections JSON: an array of detections, or {"detections": [...], "clusters": [...]}
    #[arg(short, long)]
    input: PathBuf,

    /// User whose detections are clustered (default: the only user in the input)
    #[arg(short, long)]
    user: Option<String>,

    /// Analyzer config YAML
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Max new detections per run (overrides config)
    #[arg(long)]
    batch_size: Option<usize>,

    /// Sampling seed (overrides config)
    #[arg(long)]
    seed: Option<u64>,

    /// Write the updated detections and clusters here instead of stdout
    #[arg(short = 'o', long)]
    output: Option<PathBuf>,

    /// Verbose output
    #[arg(short = 'v', long)]
    verbose: bool,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Input {
    Detections(Vec<Detection>),
    Snapshot(Snapshot),
}

/// Store contents, as read from `--input` and written to `--output`.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    detections: Vec<Detection>,
    #[serde(default)]
    clusters: Vec<Cluster>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let (status, snapshot) = execute(&args)?;
    print_summary(&status);

    let json = serde_json::to_string_pretty(&snapshot)?;
    match &args.output {
        Some(path) => fs::write(path, json).with_context(|| format!("write {}", path.display()))?,
        None => println!("{json}"),
    }
    Ok(())
}

/// Loads the store, runs one pass and returns the status with the updated
/// store contents.
fn execute(args: &Args) -> Result<(RunStatus, Snapshot)> {
    let config = load_config(args)?;
    let snapshot = load_input(&args.input)?;
    let user = match &args.user {
        Some(user) => user.clone(),
        None => only_user(&snapshot.detections)?,
    };
    debug!(
        "loaded {} detections and {} clusters from {}",
        snapshot.detections.len(),
        snapshot.clusters.len(),
        args.input.display()
    );

    let store = Arc::new(MemoryStore::from_parts(snapshot.detections, snapshot.clusters));
    let analyzer = FaceClusterAnalyzer::new(config, store.clone()).context("invalid config")?;
    let status = analyzer
        .run(&user)
        .with_context(|| format!("clustering user {user}"))?;

    let snapshot = Snapshot {
        detections: store.detections()?,
        clusters: store.clusters()?,
    };
    Ok((status, snapshot))
}

fn load_config(args: &Args) -> Result<AnalyzerConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let data = fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
            serde_yaml::from_str(&data).with_context(|| format!("parse config {}", path.display()))?
        }
        None => AnalyzerConfig::default(),
    };
    if let Some(batch_size) = args.batch_size {
        config.batch_size = batch_size;
    }
    if args.seed.is_some() {
        config.seed = args.seed;
    }
    Ok(config)
}

fn load_input(path: &Path) -> Result<Snapshot> {
    let data = fs::read_to_string(path).with_context(|| format!("read input {}", path.display()))?;
    let input: Input = serde_json::from_str(&data).with_context(|| format!("parse input {}", path.display()))?;
    Ok(match input {
        Input::Detections(detections) => Snapshot {
            detections,
            clusters: Vec::new(),
        },
        Input::Snapshot(snapshot) => snapshot,
    })
}

fn only_user(detections: &[Detection]) -> Result<String> {
    let mut users: Vec<&str> = detections.iter().map(|d| d.user_id.as_str()).collect();
    users.sort_unstable();
    users.dedup();
    match users.as_slice() {
        [user] => Ok(user.to_string()),
        [] => bail!("input has no detections; pass --user"),
        _ => bail!("input has {} users; pass --user", users.len()),
    }
}

fn print_summary(status: &RunStatus) {
    if let Some(reason) = &status.aborted {
        eprintln!("user {}: skipped: {}", status.user_id, reason);
        return;
    }
    eprintln!("user {}:", status.user_id);
    eprintln!("  points:    {} ({} anchors)", status.dataset_size, status.anchors);
    eprintln!("  clusters:  {} found, {} new, {} ambiguous", status.clusters_found, status.created_clusters, status.ambiguous_clusters);
    eprintln!("  assigned:  {}", status.assigned);
    eprintln!("  rejected:  {}", status.rejected);
}
