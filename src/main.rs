use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use host_recon_rs::config::{default_config_dir, ReconConfig};
use host_recon_rs::logs::RunPaths;
use host_recon_rs::ports::normalize_ports;
use host_recon_rs::scheduler::{default_output_dir, Engine, EngineSettings, HostTarget};
use host_recon_rs::types::{CommandStatus, RunSummary};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PortScanType {
    Default,
    Quick,
    Udp,
}

impl PortScanType {
    fn as_str(self) -> &'static str {
        match self {
            PortScanType::Default => "default",
            PortScanType::Quick => "quick",
            PortScanType::Udp => "udp",
        }
    }
}

/// host-recon-rs: runs configured port scans against one host, then fans out into service-specific follow-up scans.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "host-recon-rs",
    version,
    about = "Runs configured port scans against one host, then fans out into service-specific follow-up scans.",
    long_about = None
)]
struct Cli {
    /// Address of the host to enumerate.
    #[arg(short = 'i', long = "address")]
    address: String,

    /// Output directory (default: ./results/<address>).
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Directory holding port-scans.toml, service-scans.toml and universal-patterns.toml
    /// (default: ~/.config/host-recon).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Group of primary port scans to run.
    #[arg(long = "port-scan-type", value_enum, default_value_t = PortScanType::Default)]
    port_scan_type: PortScanType,

    /// Extra arguments substituted for {nmap_extra}.
    #[arg(long = "nmap-extra", default_value = "-Pn", allow_hyphen_values = true)]
    nmap_extra: String,

    /// Ports substituted for {ports}, e.g. 22,80,8000-8100.
    #[arg(short, long, default_value = "80", allow_hyphen_values = true)]
    ports: String,

    /// Max concurrently running commands.
    #[arg(long, default_value_t = 8)]
    concurrency: usize,

    /// Per-command timeout in seconds.
    #[arg(long = "timeout-secs", default_value_t = 3600)]
    timeout_secs: u64,

    /// Do not prefix commands with sudo.
    #[arg(long = "no-sudo", default_value_t = false)]
    no_sudo: bool,

    /// Keep (and still parse) the output file of a command that exited non-zero.
    #[arg(long = "keep-failed-output", default_value_t = false)]
    keep_failed_output: bool,

    /// Exit non-zero if any command failed.
    #[arg(long, default_value_t = false)]
    strict: bool,

    /// Increase log verbosity (-v debug, -vv trace). RUST_LOG overrides.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    let ports = normalize_ports(&cli.ports)?;
    let config_dir = match cli.config.clone() {
        Some(dir) => dir,
        None => default_config_dir().context("cannot determine home directory; pass --config")?,
    };
    let config = ReconConfig::load(&config_dir, cli.port_scan_type.as_str())
        .with_context(|| format!("failed to load configuration from {}", config_dir.display()))?;

    let output = cli
        .output
        .clone()
        .unwrap_or_else(|| default_output_dir(&cli.address));

    println!("host-recon-rs configuration:");
    println!("  address      : {}", cli.address);
    println!("  output       : {}", output.display());
    println!("  config       : {}", config_dir.display());
    println!("  scan type    : {}", cli.port_scan_type.as_str());
    println!("  ports        : {}", ports);
    println!("  nmap_extra   : {}", cli.nmap_extra);
    println!("  concurrency  : {}", cli.concurrency);
    println!("  timeout_secs : {}", cli.timeout_secs);

    let paths = RunPaths::new(output);
    paths
        .create()
        .await
        .with_context(|| format!("failed to create {}", paths.root.display()))?;

    let settings = EngineSettings {
        concurrency: cli.concurrency,
        command_timeout: Duration::from_secs(cli.timeout_secs),
        privilege_prefix: (!cli.no_sudo).then(|| "sudo".to_string()),
        invalidate_failed_output: !cli.keep_failed_output,
    };
    let target = HostTarget {
        address: cli.address.clone(),
        nmap_extra: cli.nmap_extra.clone(),
        ports,
    };

    let engine = Engine::new(target, paths.clone(), config, settings);

    // First Ctrl-C cancels the run, a second one exits immediately.
    let cancel = engine.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling running commands");
            cancel.cancel();
        }
        if tokio::signal::ctrl_c().await.is_ok() {
            std::process::exit(130);
        }
    });

    let summary = engine.enumerate().await?;

    print_summary_table(&summary);
    let json_path = paths.summary_json();
    if let Err(e) = write_summary_json(&json_path, &summary) {
        eprintln!("Failed to write JSON to {}: {}", json_path.display(), e);
    } else {
        info!(path = %json_path.display(), "wrote run summary");
    }

    if cli.strict && summary.failures() > 0 {
        bail!("{} command(s) failed", summary.failures());
    }
    Ok(())
}

fn status_label(status: &CommandStatus) -> String {
    match status {
        CommandStatus::Completed => "completed".into(),
        CommandStatus::Skipped => "skipped".into(),
        CommandStatus::Duplicate => "duplicate".into(),
        CommandStatus::Failed { exit_code: Some(c) } => format!("failed ({c})"),
        CommandStatus::Failed { exit_code: None } => "failed (signal)".into(),
        CommandStatus::TimedOut => "timed out".into(),
        CommandStatus::Cancelled => "cancelled".into(),
        CommandStatus::Error { .. } => "error".into(),
    }
}

fn print_summary_table(summary: &RunSummary) {
    let rows: Vec<_> = summary
        .commands
        .iter()
        .filter(|c| !matches!(c.status, CommandStatus::Duplicate))
        .collect();

    let unit_w = 4usize;
    let mut tier_w = "tier".len();
    let mut scan_w = "scan".len();
    let mut status_w = "status".len();
    for r in &rows {
        tier_w = tier_w.max(format!("{:?}", r.tier).len());
        scan_w = scan_w.max(r.scan.chars().count().min(40));
        status_w = status_w.max(status_label(&r.status).len());
    }

    println!(
        "\nServices: {}  commands run: {}  failures: {}",
        summary.services.len(),
        summary.executed(),
        summary.failures()
    );
    for s in &summary.services {
        println!("  {s}");
    }
    println!(
        "\n{:>unit_w$}  {:<tier_w$}  {:<scan_w$}  {:<status_w$}",
        "unit", "tier", "scan", "status",
    );
    println!(
        "{:->unit_w$}  {:-<tier_w$}  {:-<scan_w$}  {:-<status_w$}",
        "", "", "", "",
    );
    for r in rows {
        let scan: String = r.scan.chars().take(40).collect();
        println!(
            "{:>unit_w$}  {:<tier_w$}  {:<scan_w$}  {:<status_w$}",
            r.unit,
            format!("{:?}", r.tier),
            scan,
            status_label(&r.status),
        );
    }
}

fn write_summary_json(path: &Path, summary: &RunSummary) -> anyhow::Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, summary)?;
    Ok(())
}
