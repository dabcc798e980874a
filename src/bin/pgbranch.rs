//! # pgbranch CLI - branch your database like code
//!
//! Command-line interface for the pgbranch library.
//!
//! ## Usage
//! ```bash
//! # Snapshot the primary data volume
//! pgbranch snapshot create base -m "before migration"
//!
//! # Branch from it with a running instance on port 6001
//! pgbranch branch create feature --port 6001 --snapshot base
//!
//! # Inspect and tear down
//! pgbranch branch list
//! pgbranch branch stop feature
//! pgbranch branch delete feature
//!
//! # System overview
//! pgbranch status
//! ```

use clap::{Parser, Subcommand};
use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use humantime::format_duration;
use pgbranch::{
    BranchInfo, BranchManager, Config, DatasetBackend, DockerRuntime, InstanceRuntime,
    PortProbe, PostgresRuntime, RuntimeKind, SnapshotInfo, SnapshotManager, StatusAggregator,
    SystemReport, TcpProbe, ZfsBackend,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// pgbranch - git-like branching for PostgreSQL data directories
#[derive(Parser)]
#[command(name = "pgbranch")]
#[command(version)]
#[command(about = "Branch, snapshot, and run PostgreSQL data directories on copy-on-write storage")]
#[command(long_about = None)]
struct Cli {
    /// Path to a configuration file (defaults to pgbranch.json if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit machine-readable JSON instead of tables
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage snapshots of the primary data volume
    #[command(subcommand, alias = "snap")]
    Snapshot(SnapshotCmd),

    /// Manage branches and their instances
    #[command(subcommand, alias = "br")]
    Branch(BranchCmd),

    /// Show a system-wide status report
    Status,
}

#[derive(Subcommand)]
enum SnapshotCmd {
    /// Create a snapshot
    Create {
        /// Snapshot name
        name: String,

        /// Description message
        #[arg(short, long)]
        message: Option<String>,
    },

    /// Delete a snapshot
    Delete {
        /// Snapshot name (bare or fully qualified)
        name: String,

        /// Delete even if clones depend on it
        #[arg(long)]
        force: bool,
    },

    /// List snapshots
    #[command(alias = "ls")]
    List,

    /// Show snapshot details
    Info {
        /// Snapshot name (bare or fully qualified)
        name: String,
    },
}

#[derive(Subcommand)]
enum BranchCmd {
    /// Create a branch and start its instance
    Create {
        /// Branch name
        name: String,

        /// Port for the instance (allocated from the range when omitted)
        #[arg(short, long)]
        port: Option<u16>,

        /// Source snapshot (latest snapshot of the primary volume when omitted)
        #[arg(short, long)]
        snapshot: Option<String>,

        /// Informational parent-branch label
        #[arg(long)]
        parent: Option<String>,
    },

    /// Delete a branch and its subtree
    Delete {
        /// Branch name
        name: String,

        /// Delete even if child clones exist
        #[arg(long)]
        force: bool,
    },

    /// List branches
    #[command(alias = "ls")]
    List,

    /// Show branch details
    Info {
        /// Branch name
        name: String,
    },

    /// Start a branch's instance
    Start {
        /// Branch name
        name: String,

        /// Port for the instance (allocated from the range when omitted)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Stop a branch's instance
    Stop {
        /// Branch name
        name: String,
    },

    /// Snapshot a branch's current state
    Snapshot {
        /// Branch name
        branch: String,

        /// Snapshot name
        name: String,

        /// Description message
        #[arg(short, long)]
        message: Option<String>,
    },
}

fn main() {
    let cli = Cli::parse();

    // Set up logging
    if cli.verbose {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(std::io::stderr)
            .init();
    }

    // Disable colors if needed
    if std::env::var("NO_COLOR").is_ok() {
        colored::control::set_override(false);
    }

    // Run command
    if let Err(e) = run(cli) {
        eprintln!("{}: {}", "Error".red().bold(), e);
        std::process::exit(1);
    }
}

/// Main command runner
fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load(cli.config.as_deref())?;
    let backend: Arc<dyn DatasetBackend> = Arc::new(ZfsBackend::new());
    let probe: Arc<dyn PortProbe> = Arc::new(TcpProbe);
    let runtime: Arc<dyn InstanceRuntime> = match config.runtime {
        RuntimeKind::Docker => Arc::new(DockerRuntime::new(&config)),
        RuntimeKind::Postgres => Arc::new(PostgresRuntime::new(&config)),
    };

    match cli.command {
        Commands::Snapshot(cmd) => {
            let snapshots = SnapshotManager::new(config, backend);
            run_snapshot(cmd, &snapshots, cli.json)
        }
        Commands::Branch(cmd) => {
            let branches = BranchManager::new(config, backend, probe, runtime);
            run_branch(cmd, &branches, cli.json)
        }
        Commands::Status => {
            let aggregator = StatusAggregator::new(config, backend, probe, runtime);
            let report = aggregator.report()?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_status(&report);
            }
            Ok(())
        }
    }
}

fn run_snapshot(
    cmd: SnapshotCmd,
    snapshots: &SnapshotManager,
    json: bool,
) -> anyhow::Result<()> {
    match cmd {
        SnapshotCmd::Create { name, message } => {
            let info = snapshots.create(&name, message.as_deref())?;
            println!("{} Created snapshot {}", "✓".green().bold(), info.path.bold());
            Ok(())
        }
        SnapshotCmd::Delete { name, force } => {
            snapshots.delete(&name, force)?;
            println!("{} Deleted snapshot {}", "✓".green().bold(), name.bold());
            Ok(())
        }
        SnapshotCmd::List => {
            let list = snapshots.list()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&list)?);
                return Ok(());
            }
            if list.is_empty() {
                println!("No snapshots");
                return Ok(());
            }
            println!(
                "{:<40} {:<22} {:>10}  {}",
                "PATH".bold(),
                "CREATED".bold(),
                "USED".bold(),
                "MESSAGE".bold()
            );
            for snap in &list {
                println!(
                    "{:<40} {:<22} {:>10}  {}",
                    snap.path,
                    snap.created.format("%Y-%m-%d %H:%M:%S"),
                    format_bytes(snap.metrics.used),
                    snap.message
                );
            }
            Ok(())
        }
        SnapshotCmd::Info { name } => {
            let info = snapshots.info(&name)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&info)?);
                return Ok(());
            }
            print_snapshot(&info);
            Ok(())
        }
    }
}

fn run_branch(cmd: BranchCmd, branches: &BranchManager, json: bool) -> anyhow::Result<()> {
    match cmd {
        BranchCmd::Create {
            name,
            port,
            snapshot,
            parent,
        } => {
            let started = Instant::now();
            let pb = spinner(format!("Creating branch {}...", name));
            let result = branches.create(&name, port, snapshot.as_deref(), parent.as_deref());
            pb.finish_and_clear();
            let info = result?;
            println!(
                "{} Created branch {} from {} in {}",
                "✓".green().bold(),
                info.name.bold(),
                info.origin,
                format_duration(Duration::from_secs(started.elapsed().as_secs()))
            );
            if let Some(port) = info.port {
                println!("  instance {} on port {}", "running".green(), port.to_string().bold());
            }
            Ok(())
        }
        BranchCmd::Delete { name, force } => {
            branches.delete(&name, force)?;
            println!("{} Deleted branch {}", "✓".green().bold(), name.bold());
            Ok(())
        }
        BranchCmd::List => {
            let list = branches.list()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&list)?);
                return Ok(());
            }
            if list.is_empty() {
                println!("No branches");
                return Ok(());
            }
            println!(
                "{:<24} {:>6} {:<9} {:<38} {:>10}",
                "NAME".bold(),
                "PORT".bold(),
                "STATUS".bold(),
                "ORIGIN".bold(),
                "USED".bold()
            );
            for branch in &list {
                println!(
                    "{:<24} {:>6} {:<9} {:<38} {:>10}",
                    branch.name,
                    branch.port.map_or_else(|| "-".to_string(), |p| p.to_string()),
                    colorize_status(branch),
                    branch.origin,
                    format_bytes(branch.metrics.used)
                );
            }
            Ok(())
        }
        BranchCmd::Info { name } => {
            let info = branches.info(&name)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&info)?);
                return Ok(());
            }
            print_branch(&info);
            Ok(())
        }
        BranchCmd::Start { name, port } => {
            let pb = spinner(format!("Starting instance for {}...", name));
            let result = branches.start_instance(&name, port);
            pb.finish_and_clear();
            let (port, id) = result?;
            println!(
                "{} Instance {} running on port {}",
                "✓".green().bold(),
                id,
                port.to_string().bold()
            );
            Ok(())
        }
        BranchCmd::Stop { name } => {
            branches.stop_instance(&name)?;
            println!("{} Stopped instance of branch {}", "✓".green().bold(), name.bold());
            Ok(())
        }
        BranchCmd::Snapshot {
            branch,
            name,
            message,
        } => {
            let path = branches.snapshot_from(&branch, &name, message.as_deref())?;
            println!("{} Created snapshot {}", "✓".green().bold(), path.bold());
            Ok(())
        }
    }
}

fn print_snapshot(info: &SnapshotInfo) {
    println!("{}", info.path.bold());
    println!("  name:       {}", info.name);
    println!("  created:    {}", info.created.format("%Y-%m-%d %H:%M:%S UTC"));
    if !info.message.is_empty() {
        println!("  message:    {}", info.message);
    }
    println!("  used:       {}", format_bytes(info.metrics.used));
    println!("  referenced: {}", format_bytes(info.metrics.referenced));
    if info.clones.is_empty() {
        println!("  clones:     none");
    } else {
        println!("  clones:");
        for clone in &info.clones {
            println!("    {}", clone);
        }
    }
}

fn print_branch(info: &BranchInfo) {
    println!("{}", info.name.bold());
    println!("  path:       {}", info.path);
    println!("  origin:     {}", info.origin);
    if !info.parent.is_empty() {
        println!("  parent:     {}", info.parent);
    }
    println!("  created:    {}", info.created.format("%Y-%m-%d %H:%M:%S UTC"));
    println!("  status:     {}", colorize_status(info));
    match info.port {
        Some(port) => println!("  port:       {}", port),
        None => println!("  port:       -"),
    }
    if let Some(id) = &info.instance_id {
        println!("  instance:   {}", id);
    }
    println!("  used:       {}", format_bytes(info.metrics.used));
    if info.clones.is_empty() {
        println!("  clones:     none");
    } else {
        println!("  clones:");
        for clone in &info.clones {
            println!("    {}", clone);
        }
    }
}

fn print_status(report: &SystemReport) {
    let health = if report.pool.health == "ONLINE" {
        report.pool.health.green()
    } else {
        report.pool.health.yellow()
    };
    println!("{}", "Pool".bold());
    println!(
        "  {} ({}) used {} / available {}",
        report.pool.name,
        health,
        format_bytes(report.pool.metrics.used),
        format_bytes(report.pool.metrics.available)
    );

    println!("{}", "Runtime".bold());
    println!("  {}", report.runtime_version);
    println!(
        "  primary instance: {}",
        match report.primary_status {
            pgbranch::InstanceStatus::Running => "running".green(),
            pgbranch::InstanceStatus::Stopped => "stopped".red(),
            pgbranch::InstanceStatus::Unknown => "unknown".yellow(),
        }
    );

    println!("{}", "Snapshots".bold());
    println!(
        "  {} total, {}",
        report.snapshots.len(),
        format_bytes(report.snapshot_total_bytes)
    );

    println!("{}", "Branches".bold());
    if report.branches.is_empty() {
        println!("  none");
    } else {
        for branch in &report.branches {
            println!(
                "  {:<24} {:>6} {}",
                branch.name,
                branch.port.map_or_else(|| "-".to_string(), |p| p.to_string()),
                colorize_status(branch)
            );
        }
    }

    println!("{}", "Host".bold());
    println!(
        "  {} ({}/{})",
        report.host.hostname, report.host.os, report.host.arch
    );

    if report.healthy {
        println!("\n{}", "✓ System healthy".green().bold());
    } else {
        println!("\n{}", "⚠ System degraded".yellow().bold());
    }
}

fn colorize_status(branch: &BranchInfo) -> ColoredString {
    match branch.status {
        pgbranch::InstanceStatus::Running => "running".green(),
        pgbranch::InstanceStatus::Stopped => "stopped".red(),
        pgbranch::InstanceStatus::Unknown => "unknown".yellow(),
    }
}

fn spinner(message: String) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::default_spinner());
    pb.set_message(message);
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[unit])
    } else {
        format!("{:.2} {}", size, UNITS[unit])
    }
}
