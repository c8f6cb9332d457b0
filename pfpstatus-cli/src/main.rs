//! CLI for pfpstatus.
//!
//! Queries the HTTP endpoints of a running collector, or inspects the files a
//! collector dumped to disk.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use pfpstatus::RecordedStatus;
use pfpstatus::dump::DUMP_EXTENSION;
use pfpstatus::http::STATUS_PATH;

/// Default collector address.
const DEFAULT_URL: &str = "http://127.0.0.1:33445";

/// pfpstatus: inspect fingerprint status history.
#[derive(Parser)]
#[command(name = "pfpstatus", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Show how many nodes a collector tracks.
    Nodes {
        /// Base URL of the collector.
        #[arg(long, default_value = DEFAULT_URL)]
        url: String,

        /// Bearer token, needed when not calling from loopback.
        #[arg(long)]
        token: Option<String>,
    },

    /// Show the recorded statuses of one node.
    Node {
        /// Node name.
        name: String,

        /// Base URL of the collector.
        #[arg(long, default_value = DEFAULT_URL)]
        url: String,

        /// Bearer token, needed when not calling from loopback.
        #[arg(long)]
        token: Option<String>,

        /// Output format.
        #[arg(long, default_value = "json")]
        format: OutputFormat,
    },

    /// Summarize a dump directory.
    Inspect {
        /// Directory holding one `<node>.json` file per node.
        dump_dir: PathBuf,
    },
}

/// Output format for node statuses.
#[derive(Clone, ValueEnum)]
enum OutputFormat {
    /// Comma-separated values.
    Csv,
    /// JSON array of objects.
    Json,
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Nodes { url, token } => cmd_nodes(&url, token.as_deref()),
        Commands::Node {
            name,
            url,
            token,
            format,
        } => cmd_node(&url, token.as_deref(), &name, &format),
        Commands::Inspect { dump_dir } => cmd_inspect(&dump_dir),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

/// GETs `path` from the collector and returns the body of a 200 answer.
fn fetch(base: &str, path: &str, token: Option<&str>) -> Result<String, Box<dyn std::error::Error>> {
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()?;
    let url = format!("{}{path}", base.trim_end_matches('/'));
    let mut request = client.get(&url);
    if let Some(token) = token {
        request = request.bearer_auth(token);
    }

    let resp = request.send()?;
    let status = resp.status();
    let body = resp.text()?;
    if !status.is_success() {
        return Err(format!("{url}: {status}: {}", body.trim()).into());
    }
    Ok(body)
}

/// Implements `pfpstatus nodes`.
fn cmd_nodes(url: &str, token: Option<&str>) -> Result<(), Box<dyn std::error::Error>> {
    let body = fetch(url, STATUS_PATH, token)?;
    let summary: serde_json::Value = serde_json::from_str(&body)?;
    let nodes = summary
        .get("nodes")
        .and_then(serde_json::Value::as_u64)
        .ok_or("malformed summary")?;
    println!("Nodes: {nodes}");
    Ok(())
}

/// Implements `pfpstatus node <name>`.
fn cmd_node(
    url: &str,
    token: Option<&str>,
    name: &str,
    format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let body = fetch(url, &format!("{STATUS_PATH}/{name}"), token)?;
    let entries: Vec<RecordedStatus> = serde_json::from_str(&body)?;

    match format {
        OutputFormat::Csv => print!("{}", render_csv(name, &entries)),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&entries)?),
    }
    Ok(())
}

/// Renders `entries` as CSV, one row per recorded status.
fn render_csv(node: &str, entries: &[RecordedStatus]) -> String {
    let mut out = format!("# node={node}, records={}\n", entries.len());
    out.push_str("record_time_ns,fingerprint_expected,fingerprint_computed,pods,consistent\n");
    for entry in entries {
        let status = &entry.status;
        out.push_str(&format!(
            "{},{},{},{},{}\n",
            entry.record_time,
            status.fingerprint_expected,
            status.fingerprint_computed,
            status.pods.len(),
            status.is_consistent(),
        ));
    }
    out
}

/// One dumped node file.
struct DumpedNode {
    name: String,
    entries: Vec<RecordedStatus>,
}

/// Reads every node file of `dir`, sorted by node name.
fn read_dump(dir: &Path) -> Result<Vec<DumpedNode>, Box<dyn std::error::Error>> {
    if !dir.is_dir() {
        return Err(format!("No dump directory at '{}'", dir.display()).into());
    }

    let mut nodes = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some(DUMP_EXTENSION) {
            continue;
        }
        let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if name.starts_with('.') {
            continue;
        }
        let data = std::fs::read(&path)?;
        let entries: Vec<RecordedStatus> = serde_json::from_slice(&data)
            .map_err(|e| format!("{}: {e}", path.display()))?;
        nodes.push(DumpedNode {
            name: name.to_string(),
            entries,
        });
    }
    nodes.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(nodes)
}

/// Implements `pfpstatus inspect <dump_dir>`.
fn cmd_inspect(dir: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let nodes = read_dump(dir)?;

    println!("Dump: {}", dir.display());
    println!("Nodes: {}", nodes.len());
    println!();

    for node in &nodes {
        let Some(last) = node.entries.last() else {
            println!("  - {} (records=0)", node.name);
            continue;
        };
        let state = if last.status.is_consistent() {
            "consistent"
        } else {
            "MISMATCH"
        };
        println!(
            "  - {} (records={}, last={}, {state}: expected={} computed={})",
            node.name,
            node.entries.len(),
            last.record_time,
            last.status.fingerprint_expected,
            last.status.fingerprint_computed,
        );
    }

    Ok(())
}
