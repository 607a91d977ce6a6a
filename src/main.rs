use anyhow::{Context, Result};
use clap::Parser;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use fanout::config::{self, ModeKind, RunConfig, RunOptions};
use fanout::dispatch::Dispatcher;
use fanout::inventory::{self, Inventory, Target};
use fanout::report::{OutputMode, Reporter};
use fanout::ssh::SshConnector;

/// Run a command or copy a file tree on every host of an inventory, in parallel.
#[derive(Parser, Debug)]
#[command(name = "fanout")]
#[command(about = "Fan-out remote command execution and file copy over SSH", long_about = None)]
struct Cli {
    /// Inventory file (YAML, or legacy `[group]` hosts file)
    #[arg(short = 'i', default_value = config::DEFAULT_INVENTORY)]
    inventory: PathBuf,

    /// Maximum number of hosts processed at once
    #[arg(short = 'f', default_value_t = config::DEFAULT_FORKS)]
    forks: usize,

    /// Execution mode
    #[arg(short = 'm', value_enum, default_value_t = ModeKind::Exec)]
    mode: ModeKind,

    /// Local source path (copy mode, repeatable; pairs with -dst in order)
    #[arg(long = "src")]
    src: Vec<PathBuf>,

    /// Remote destination path (copy mode, repeatable)
    #[arg(long = "dst")]
    dst: Vec<String>,

    /// Copy pair as local:remote (copy mode, repeatable)
    #[arg(long = "copy", value_name = "LOCAL:REMOTE")]
    copy: Vec<String>,

    /// Command to run (exec mode)
    #[arg(short = 'a', default_value = config::DEFAULT_COMMAND)]
    command: String,

    /// Output mode
    #[arg(short = 'o', value_enum, default_value_t = OutputMode::Status)]
    output: OutputMode,

    /// Per-host timeout, e.g. 30s, 1m30s, 500ms
    #[arg(short = 't', default_value = config::DEFAULT_TIMEOUT, value_parser = config::parse_duration)]
    timeout: std::time::Duration,

    /// Only hosts whose address contains this string, or whose group is named by it
    #[arg(short = 'l')]
    limit: Option<String>,

    /// Print the resolved hosts and exit
    #[arg(long)]
    list_hosts: bool,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

fn print_error_chain(err: &anyhow::Error) {
    eprintln!("Error: {err}");

    let mut n = 0;
    let mut cur = err.source();
    while let Some(cause) = cur {
        eprintln!("  {n}: {cause}");
        n += 1;
        cur = cause.source();
    }
}

fn main() {
    if let Err(err) = real_main() {
        print_error_chain(&err);
        std::process::exit(1);
    }
}

fn real_main() -> Result<()> {
    let cli = Cli::parse_from(config::normalize_args(std::env::args_os()));

    // Logs go to stderr so stdout carries only progress and results.
    let default_level = if cli.debug { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .without_time()
        .init();

    let config = RunConfig::from_options(RunOptions {
        forks: cli.forks,
        timeout: cli.timeout,
        mode: cli.mode,
        command: cli.command,
        src: cli.src,
        dst: cli.dst,
        copy: cli.copy,
        output: cli.output,
        filter: cli.limit,
    })
    .context("invalid run configuration")?;

    let inv = Inventory::load_from_file(&cli.inventory)
        .with_context(|| format!("failed to load inventory: {}", cli.inventory.display()))?;
    let targets = inventory::resolve(&inv, config.filter.as_deref())
        .with_context(|| format!("failed to resolve inventory: {}", cli.inventory.display()))?;

    let stdout = io::stdout();
    let mut out = stdout.lock();

    if cli.list_hosts {
        print_hosts(&mut out, &targets)?;
        return Ok(());
    }

    let mut reporter = Reporter::new(out, config.output);
    reporter.header(&config.mode, targets.len())?;

    let dispatcher = Dispatcher::new(Arc::new(SshConnector), &config);
    let summary = dispatcher.run(&targets, &mut reporter)?;
    reporter.summary(&summary)?;
    Ok(())
}

fn print_hosts(out: &mut impl Write, targets: &[Target]) -> Result<()> {
    for t in targets {
        writeln!(out, "{} {} user={}", t.group, t.endpoint(), t.user)?;
    }
    writeln!(out, "目标主机数: {}", targets.len())?;
    Ok(())
}
