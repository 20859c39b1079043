//! Apiprobe CLI - Main Entry Point
//!
//! Discovers suite manifests, runs them sequentially, prints one
//! OK/FAIL line per suite, and optionally writes a report file.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use serde::Deserialize;
use tracing::debug;

use apiprobe_common::template::OAuthClient;
use apiprobe_common::{lenient, DiskFs, Report};
use apiprobe_runner::{discover_manifests, emit, run_suite, RunConfig};

/// Apiprobe - declarative integration tests for HTTP APIs
#[derive(Parser)]
#[command(name = "apiprobe")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file with defaults and OAuth client credentials
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Server URL tests run against (overrides manifest http_server)
    #[arg(long = "server")]
    server: Option<String>,

    /// Rewrite the host of URLs built by templates
    #[arg(long = "replace-host")]
    replace_host: Option<String>,

    /// Root directory to scan for manifests (repeatable)
    #[arg(short = 'd', long = "dir")]
    dirs: Vec<PathBuf>,

    /// Single manifest to run (repeatable)
    #[arg(short = 's', long = "manifest")]
    manifests: Vec<PathBuf>,

    /// Log requests and responses
    #[arg(short = 'n', long = "log-network")]
    log_network: bool,

    /// Stream hierarchical logs while running
    #[arg(short = 'v', long = "log-verbose")]
    log_verbose: bool,

    /// Log the datastore content after each request
    #[arg(long = "log-datastore")]
    log_datastore: bool,

    /// Timestamp report log lines
    #[arg(short = 't', long = "log-timestamp")]
    log_timestamp: bool,

    /// Write the report to this file
    #[arg(long = "report-file")]
    report_file: Option<PathBuf>,

    /// Report format: junit, json or json-stats
    #[arg(long = "report-format", default_value = "json")]
    report_format: String,

    /// Truncate logged request bodies to N bytes (0 = full)
    #[arg(long = "limit-request", default_value_t = 0)]
    limit_request: usize,

    /// Truncate logged response bodies to N bytes (0 = full)
    #[arg(long = "limit-response", default_value_t = 0)]
    limit_response: usize,

    /// Log each request as a runnable curl command
    #[arg(long = "curl-bash")]
    curl_bash: bool,

    /// Stop after the first failed suite
    #[arg(long = "stop-on-fail")]
    stop_on_fail: bool,
}

/// Defaults loaded from the `-c` config file; CLI flags win.
#[derive(Debug, Clone, Deserialize, Default)]
struct ConfigFile {
    #[serde(default)]
    server: Option<String>,
    #[serde(default)]
    replace_host: Option<String>,
    #[serde(default)]
    oauth_client: HashMap<String, OAuthClient>,
    #[serde(default)]
    log_network: Option<bool>,
    #[serde(default)]
    log_verbose: Option<bool>,
    #[serde(default)]
    limit_request: Option<usize>,
    #[serde(default)]
    limit_response: Option<usize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.log_verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let file_config = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .map_err(|e| anyhow::anyhow!("reading config '{}': {}", path.display(), e))?;
            lenient::parse::<ConfigFile>(&text)
                .map_err(|e| anyhow::anyhow!("parsing config '{}': {}", path.display(), e))?
        }
        None => ConfigFile::default(),
    };

    let config = RunConfig {
        server_url: cli.server.clone().or(file_config.server),
        replace_host: cli.replace_host.clone().or(file_config.replace_host),
        oauth_clients: file_config.oauth_client,
        log_network: cli.log_network || file_config.log_network.unwrap_or(false),
        log_verbose: cli.log_verbose || file_config.log_verbose.unwrap_or(false),
        log_datastore: cli.log_datastore,
        limit_request: match cli.limit_request {
            0 => file_config.limit_request.unwrap_or(0),
            n => n,
        },
        limit_response: match cli.limit_response {
            0 => file_config.limit_response.unwrap_or(0),
            n => n,
        },
        curl_bash: cli.curl_bash,
    };

    let mut manifests = cli.manifests.clone();
    for dir in &cli.dirs {
        manifests.extend(discover_manifests(dir));
    }
    if manifests.is_empty() {
        anyhow::bail!("no manifests found; pass -s FILE or -d DIR");
    }
    debug!(count = manifests.len(), "manifests to run");

    let report = Report::new(!cli.log_timestamp);
    let fs = Arc::new(DiskFs);
    let root = report.root();

    for manifest in &manifests {
        let start = Instant::now();
        let result = run_suite(manifest, fs.clone(), &config, &root).await;
        let elapsed = start.elapsed().as_secs_f64();
        let (success, error) = match result {
            Ok(outcome) => (outcome.success, None),
            Err(e) => (false, Some(e)),
        };
        println!(
            "{} '{}' ({:.3}s)",
            if success { "OK" } else { "FAIL" },
            manifest.display(),
            elapsed
        );
        if let Some(e) = error {
            report.set_failure(&e.to_string());
            eprintln!("  {}", e);
        }
        if !success && cli.stop_on_fail {
            break;
        }
    }

    if cli.log_verbose {
        print_logs(&report.aggregate(), 0);
    }

    let emitter = emit::for_format(&cli.report_format)?;
    let document = report.get_test_result(emitter.as_ref())?;
    match &cli.report_file {
        Some(path) => std::fs::write(path, &document)
            .map_err(|e| anyhow::anyhow!("writing report '{}': {}", path.display(), e))?,
        None if cli.log_verbose => println!("{}", document),
        None => {}
    }

    if report.did_fail() {
        std::process::exit(1);
    }
    Ok(())
}

fn print_logs(result: &apiprobe_common::ReportResult, depth: usize) {
    let indent = "  ".repeat(depth);
    if !result.name.is_empty() {
        eprintln!("{}{}", indent, result.name);
    }
    for line in &result.log {
        eprintln!("{}  {}", indent, line);
    }
    for sub in &result.sub_tests {
        print_logs(sub, depth + 1);
    }
}
