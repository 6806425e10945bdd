//! fieldpack
//!
//! Packages a GIS project for offline field work and synchronizes the
//! returned package back into the project's sources.
//!
//! Usage:
//!   fieldpack package project.toml out/field --archive
//!   fieldpack sync project.toml out/field
//!   fieldpack resolve project.toml out/field --decide 3=keep-local
//!
//! Layer-level problems are reported in the outcome table; the exit code
//! is non-zero only when the project or package itself is unusable.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use fieldpack_cli::{conflict_table, export_table, open_package, parse_assignment, parse_decision, sync_table};
use fieldpack_export::{ExportConfig, Packager};
use fieldpack_model::Project;
use fieldpack_sync::{CONFLICTS_FILE, ConflictPolicy, ConflictReport, SyncConfig, Synchronizer};
use fieldpack_types::{CancelToken, LayerId};
use std::path::{Path, PathBuf};
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "fieldpack")]
#[command(about = "Offline packaging and synchronization of GIS projects")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Enable verbose debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Package a project for offline use
    Package {
        /// Project description file
        project: PathBuf,
        /// Package directory to create
        out: PathBuf,
        /// Export configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Only package these layers
        #[arg(long = "include", value_name = "LAYER")]
        include: Vec<String>,
        /// Leave these layers out
        #[arg(long = "exclude", value_name = "LAYER")]
        exclude: Vec<String>,
        /// Enable offline editing for a layer
        #[arg(long = "editable", value_name = "LAYER")]
        editable: Vec<String>,
        /// Disable offline editing for a layer
        #[arg(long = "read-only", value_name = "LAYER")]
        read_only: Vec<String>,
        /// Also write a zip archive next to the package
        #[arg(long)]
        archive: bool,
        /// Package title (defaults to the project title)
        #[arg(long)]
        title: Option<String>,
    },
    /// Synchronize a returned package into the project's sources
    Sync {
        project: PathBuf,
        /// Package directory or zip archive
        package: PathBuf,
        /// Sync configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// How to settle conflicting edits
        #[arg(long, value_enum)]
        policy: Option<Policy>,
    },
    /// List or decide conflicts and apply the decisions
    Resolve {
        project: PathBuf,
        package: PathBuf,
        /// Decide one conflict, e.g. `3=keep-local` or `4=value:oak`
        #[arg(long = "decide", value_name = "ID=DECISION")]
        decide: Vec<String>,
        /// Decide every remaining conflict the same way
        #[arg(long, value_name = "DECISION")]
        all: Option<String>,
        /// Only print the conflict report
        #[arg(long)]
        list: bool,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Policy {
    Manual,
    PreferLocal,
    PreferRemote,
}

impl From<Policy> for ConflictPolicy {
    fn from(policy: Policy) -> Self {
        match policy {
            Policy::Manual => Self::Manual,
            Policy::PreferLocal => Self::PreferLocal,
            Policy::PreferRemote => Self::PreferRemote,
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    let log_level = if args.verbose { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .init();

    match args.command {
        Command::Package {
            project,
            out,
            config,
            include,
            exclude,
            editable,
            read_only,
            archive,
            title,
        } => {
            let project = load_project(&project)?;
            let mut config = config.as_deref().map(ExportConfig::load_from).unwrap_or_default();
            config.include.extend(include.into_iter().map(LayerId::from));
            config.exclude.extend(exclude.into_iter().map(LayerId::from));
            for id in editable {
                config.offline.insert(LayerId::from(id), true);
            }
            for id in read_only {
                config.offline.insert(LayerId::from(id), false);
            }
            config.archive |= archive;
            if title.is_some() {
                config.title = title;
            }

            let summary = Packager::new(config)
                .package(&project, &out, &CancelToken::new())
                .with_context(|| format!("packaging into {} failed", out.display()))?;
            print!("{}", export_table(&summary));
        }
        Command::Sync {
            project,
            package,
            config,
            policy,
        } => {
            let project = load_project(&project)?;
            let package = open_package(&package)?;
            let mut config = config.as_deref().map(SyncConfig::load_from).unwrap_or_default();
            if let Some(policy) = policy {
                config.policy = policy.into();
            }
            let summary = Synchronizer::new(config)
                .sync(&package, &project, &CancelToken::new())
                .context("synchronization failed")?;
            print!("{}", sync_table(&summary));
        }
        Command::Resolve {
            project,
            package,
            decide,
            all,
            list,
        } => {
            let package = open_package(&package)?;
            let report_path = package.root().join(CONFLICTS_FILE);
            let mut report = ConflictReport::load(&report_path)
                .with_context(|| format!("no conflict report at {}", report_path.display()))?;
            if list {
                print!("{}", conflict_table(&report));
                return Ok(());
            }
            for assignment in &decide {
                let (id, decision) = parse_assignment(assignment)?;
                report.decide(id, decision)?;
            }
            if let Some(all) = all {
                let decided = report.decide_all(&parse_decision(&all)?);
                info!("Decided {} remaining conflicts", decided);
            }
            let project = load_project(&project)?;
            let summary = Synchronizer::new(SyncConfig::default())
                .apply_resolutions(&package, &project, report)
                .context("applying resolutions failed")?;
            print!("{}", sync_table(&summary));
        }
    }
    Ok(())
}

fn load_project(path: &Path) -> Result<Project> {
    Project::load(path).with_context(|| format!("failed to load project {}", path.display()))
}
