//! Standalone fingerprint status collector.
//!
//! Reads statuses as JSON lines (one object per line) from a file or stdin,
//! records them and exposes them the way an embedding scheduler plugin would:
//! over HTTP on `PFP_STATUS_PORT` and as periodic dumps into
//! `PFP_STATUS_DUMP`. Non-loopback HTTP callers are authenticated against the
//! Kubernetes API server unless `--no-auth` is given.

mod input;

use std::fs::File;
use std::io::{self, BufReader};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;
use pfpstatus::{KubeAuthority, KubeAuthorityConfig, Params, TokenBearerAuth};
use tracing_subscriber::EnvFilter;

/// pfpstatus-collector: record and serve fingerprint statuses.
#[derive(Parser, Debug)]
#[command(name = "pfpstatus-collector", version, about)]
struct Cli {
    /// File of JSON-line statuses, or `-` for stdin.
    #[arg(long, default_value = "-")]
    input: String,

    /// Maximum number of distinct nodes tracked.
    #[arg(long)]
    max_nodes: Option<usize>,

    /// Statuses kept per node.
    #[arg(long)]
    node_capacity: Option<usize>,

    /// Approximate byte budget per node (0 = unlimited).
    #[arg(long)]
    max_size_per_node: Option<usize>,

    /// Drop statuses whose fingerprints repeat the last recorded ones.
    #[arg(long)]
    coalesce: bool,

    /// API server URL used to review tokens (default: in-cluster config).
    #[arg(long)]
    api_server: Option<String>,

    /// File holding the bearer token presented to the API server.
    #[arg(long)]
    token_file: Option<PathBuf>,

    /// PEM bundle trusted for the API server.
    #[arg(long)]
    ca_file: Option<PathBuf>,

    /// Timeout of each review request, in milliseconds.
    #[arg(long, default_value = "5000")]
    auth_timeout_ms: u64,

    /// Serve every caller without authentication.
    #[arg(long)]
    no_auth: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        tracing::error!("collector failed: {e}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let mut params = Params::from_env();
    apply_flags(&mut params, &cli);

    if params.http.enabled && !cli.no_auth {
        let authority = KubeAuthority::new(authority_config(&cli)?)?;
        params
            .http
            .middlewares
            .push(TokenBearerAuth::new(Arc::new(authority)).middleware());
    }

    let Some(collector) = pfpstatus::setup(params)? else {
        tracing::info!("set PFP_STATUS_PORT or PFP_STATUS_DUMP to enable a backend");
        return Ok(());
    };
    if let Some(addr) = collector.http_addr() {
        tracing::info!(%addr, "serving pfpstatus");
    }

    let sender = collector.sender();
    let source = cli.input.clone();
    let reader = thread::Builder::new()
        .name("pfpstatus-input".to_string())
        .spawn(move || -> io::Result<input::ForwardStats> {
            if source == "-" {
                Ok(input::forward(io::stdin().lock(), &sender))
            } else {
                let file = File::open(&source)?;
                Ok(input::forward(BufReader::new(file), &sender))
            }
        })?;

    match reader.join() {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => {
            collector.shutdown();
            return Err(format!("cannot read {}: {e}", cli.input).into());
        }
        Err(_) => tracing::error!("input reader panicked"),
    }

    // keep serving what was collected
    let stats = collector.wait();
    tracing::info!(accepted = stats.accepted, dropped = stats.dropped, "collector exited");
    Ok(())
}

/// Overrides the recorder bounds with the command line flags.
fn apply_flags(params: &mut Params, cli: &Cli) {
    let mut recorder = params.recorder;
    if let Some(max_nodes) = cli.max_nodes {
        recorder = recorder.with_max_nodes(max_nodes);
    }
    if let Some(capacity) = cli.node_capacity {
        recorder = recorder.with_node_capacity(capacity);
    }
    if let Some(max_size) = cli.max_size_per_node {
        recorder = recorder.with_max_size_per_node(max_size);
    }
    if cli.coalesce {
        recorder = recorder.with_coalescing(true);
    }
    params.recorder = recorder;
}

/// Builds the API server settings from the flags, or from the pod environment.
fn authority_config(cli: &Cli) -> pfpstatus::Result<KubeAuthorityConfig> {
    let mut config = match &cli.api_server {
        Some(url) => KubeAuthorityConfig::new(url.clone()),
        None => KubeAuthorityConfig::in_cluster()?,
    };
    if let Some(path) = &cli.token_file {
        config = config.with_token_file(path)?;
    }
    if let Some(path) = &cli.ca_file {
        config = config.with_ca_file(path)?;
    }
    Ok(config.with_timeout(Duration::from_millis(cli.auth_timeout_ms)))
}
