//! `sweep`: delete every AWS resource listed in a resource document.
//!
//! ```sh
//! sweep resources.toml --dry-run
//! sweep resources.toml --resource-types ec2 sg --profile staging
//! RUST_LOG=debug sweep resources.toml --force
//! ```
//!
//! Without `--force` or `--dry-run` the operator has to type the
//! confirmation phrase before anything is deleted.

use std::{collections::BTreeSet, path::PathBuf};

use anyhow::Context;
use clap::Parser;
use sweep::{
    CancellationToken, Config, Engine, Invoke, ResourceDocument, ResourceKind, RunOptions,
    RunReport,
};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

const CONFIRMATION: &str = "DELETE-ALL-RESOURCES";

#[derive(Debug, Parser)]
#[command(name = "sweep", version, about = "Delete the AWS resources listed in a resource document")]
struct Cli {
    /// Resource document written by an account scan.
    #[arg(required_unless_present = "list_types")]
    document: Option<PathBuf>,

    /// AWS profile used for every call.
    #[arg(long)]
    profile: Option<String>,

    /// Show what would be deleted without deleting anything.
    #[arg(long)]
    dry_run: bool,

    /// Only delete these resource types (see --list-types).
    #[arg(long, num_args = 1..)]
    resource_types: Vec<ResourceKind>,

    /// Only delete instances recorded in one of these states at scan time.
    #[arg(long, num_args = 1..)]
    states: Vec<String>,

    /// Do not ask for confirmation.
    #[arg(long, short)]
    force: bool,

    /// Print the document's summary and exit.
    #[arg(long)]
    summary_only: bool,

    /// Print the resource types in deletion order and exit.
    #[arg(long)]
    list_types: bool,

    /// TOML configuration file.
    #[arg(long, env = "SWEEP_CONFIG")]
    config: Option<PathBuf>,

    /// The AWS command line tool.
    #[arg(long, env = "SWEEP_AWS_BIN")]
    aws_bin: Option<String>,

    /// Seconds before a single AWS call is killed.
    #[arg(long, env = "SWEEP_CALL_TIMEOUT_SECS")]
    call_timeout_secs: Option<u64>,

    /// Regions of one resource type deleted at the same time.
    #[arg(long, env = "SWEEP_REGION_CONCURRENCY")]
    region_concurrency: Option<usize>,

    /// Write the final report to this file as JSON.
    #[arg(long)]
    report_json: Option<PathBuf>,
}

impl Cli {
    /// The configuration file (if any) with command line overrides applied.
    fn load_config(&self) -> Result<Config, sweep::Error> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };
        if let Some(aws_bin) = &self.aws_bin {
            config.aws_bin = aws_bin.clone();
        }
        if let Some(secs) = self.call_timeout_secs {
            config.call_timeout_secs = secs;
        }
        if let Some(n) = self.region_concurrency {
            config.region_concurrency = n;
        }
        if !self.states.is_empty() {
            config.instance_states = self.states.clone();
        }
        config.validate()?;
        Ok(config)
    }

    fn only(&self) -> Option<BTreeSet<ResourceKind>> {
        if self.resource_types.is_empty() {
            None
        } else {
            Some(self.resource_types.iter().copied().collect())
        }
    }
}

/// Only the exact phrase confirms. The line ending is not part of it.
fn confirmed(input: &str) -> bool {
    input.trim_end_matches(['\r', '\n']) == CONFIRMATION
}

/// Reads one line of `input`. An interrupt while waiting counts as a refusal.
async fn ask_for_confirmation(
    mut input: impl AsyncBufRead + Unpin,
    shutdown: &CancellationToken,
) -> anyhow::Result<bool> {
    println!();
    println!("This cannot be undone. Type {CONFIRMATION} to continue:");
    let mut line = String::new();
    tokio::select! {
        read = input.read_line(&mut line) => {
            read.context("could not read the confirmation")?;
            Ok(confirmed(&line))
        }
        _ = shutdown.cancelled() => Ok(false),
    }
}

fn list_types() {
    println!("Resource types, in deletion order:");
    for kind in ResourceKind::DELETION_ORDER {
        let scope = if kind.is_global() { "global" } else { "regional" };
        println!("  {:<7} {kind} ({scope})", kind.tag());
    }
}

/// Load the document named on the command line and delete what it lists
/// with `engine`, asking on `input` unless `--force` or `--dry-run` is set.
///
/// Returns `None` when nothing was run.
async fn run<P: Invoke + 'static>(
    cli: &Cli,
    config: &Config,
    engine: &Engine<P>,
    input: impl AsyncBufRead + Unpin,
    shutdown: CancellationToken,
) -> anyhow::Result<Option<RunReport>> {
    let Some(path) = &cli.document else {
        anyhow::bail!("a resource document is required");
    };
    let mut doc = ResourceDocument::load(path).map_err(sweep::Error::from)?;
    let skipped = doc.retain_instance_states(&config.instance_states());
    if !skipped.is_empty() {
        log::info!(
            "{} instance(s) skipped, not in state {}",
            skipped.len(),
            config.instance_states.join("/")
        );
    }
    println!("{}", doc.describe());
    if cli.summary_only {
        return Ok(None);
    }

    let only = cli.only();
    let total = doc.total_ids(only.as_ref());
    if total == 0 {
        println!("Nothing to delete.");
        return Ok(None);
    }

    println!();
    if cli.dry_run {
        println!("DRY-RUN: {total} resource(s) would be deleted.");
    } else {
        println!("{total} resource(s) will be deleted.");
        if !cli.force && !ask_for_confirmation(input, &shutdown).await? {
            println!("Aborted, nothing was deleted.");
            return Ok(None);
        }
    }

    let options = RunOptions {
        dry_run: cli.dry_run,
        only,
        shutdown,
    };
    let report = engine.run(&doc, &options).await;

    println!();
    println!("{report}");

    if let Some(path) = &cli.report_json {
        let json = report.to_json().context("could not serialize the report")?;
        std::fs::write(path, json)
            .with_context(|| format!("could not write the report to {path:?}"))?;
        log::info!("report written to {path:?}");
    }
    Ok(Some(report))
}

/// The first interrupt asks the run to stop, the second exits at once.
fn handle_interrupts(shutdown: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        log::warn!("interrupt received, finishing the calls in flight (interrupt again to exit)");
        shutdown.cancel();
        if tokio::signal::ctrl_c().await.is_ok() {
            log::error!("interrupted again, exiting without waiting");
            std::process::exit(130);
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    if cli.list_types {
        list_types();
        return Ok(());
    }

    let config = cli.load_config()?;
    let shutdown = CancellationToken::new();
    handle_interrupts(shutdown.clone());

    let engine = Engine::aws(&config, cli.profile.clone());
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    run(&cli, &config, &engine, stdin, shutdown).await?;
    Ok(())
}
