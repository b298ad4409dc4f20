//! paradb CLI - clustering of scored paragliding flights
//!
//! Usage: paradb-cli [OPTIONS] <COMMAND>
//!
//! Exit status: 0 when the command changed something (or found the store
//! consistent), 1 when there was nothing to do, 2 on error.

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use paradb_lib::classify::{self, ClusterParams, RunStats};
use paradb_lib::db::{ClusterId, ClusterKind, Database};
use paradb_lib::settings::{self, Settings};
use paradb_lib::{elog, import, log, logging, Error, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

// ============================================================================
// Main CLI Structure
// ============================================================================

#[derive(Parser)]
#[command(name = "paradb-cli")]
#[command(version, about = "Launch and route clustering for scored flights", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Database path (default: PARADB_DB, then settings, then data dir)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Settings file (default: settings.json in the config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output as JSON for scripting
    #[arg(long, global = true)]
    json: bool,

    /// Suppress progress output
    #[arg(long, short, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Converge launch or route clusters
    Classify {
        /// launch or route
        kind: String,
        /// Only propagate from this cluster; no new clusters are seeded
        id: Option<String>,
    },
    /// Load scored flights from a JSON file
    Import {
        file: PathBuf,
    },
    /// List clusters, largest first
    Clusters {
        /// launch or route
        kind: String,
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Verify every assignment still matches its cluster
    Check {
        /// launch or route
        kind: String,
    },
    /// Flight and cluster counts
    Stats,
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Whether a command did anything; maps to exit status 0 or 1
#[derive(Debug, PartialEq)]
enum Outcome {
    Done,
    NothingToDo,
}

impl Outcome {
    fn from_progress(progress: bool) -> Self {
        if progress {
            Outcome::Done
        } else {
            Outcome::NothingToDo
        }
    }
}

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> ExitCode {
    // Ignore SIGPIPE so `paradb-cli clusters route | head` exits quietly
    #[cfg(unix)]
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }

    // println! panics on a closed pipe even with SIGPIPE ignored
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        if info.to_string().contains("Broken pipe") {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    match run_cli(cli) {
        Ok(Outcome::Done) => ExitCode::SUCCESS,
        Ok(Outcome::NothingToDo) => ExitCode::from(1),
        Err(e) => {
            elog!("Error: {}", e);
            ExitCode::from(2)
        }
    }
}

fn run_cli(cli: Cli) -> Result<Outcome> {
    // Handle completions first (no DB or logging needed)
    if let Commands::Completions { shell } = &cli.command {
        generate(*shell, &mut Cli::command(), "paradb-cli", &mut std::io::stdout());
        return Ok(Outcome::Done);
    }

    let config_path = cli.config.clone().unwrap_or_else(settings::default_path);
    let settings = Settings::load(&config_path);

    logging::set_quiet(cli.quiet);
    if let Some(log_path) = logging::init_logging(&settings.log_dir()) {
        if !cli.quiet {
            eprintln!("Logging to: {}", log_path.display());
        }
    }

    let db_path = settings.resolve_db_path(cli.db.as_deref());
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let db = Database::new(&db_path)?;
    log!("[Cli] Using database {}", db_path.display());

    let params = settings.cluster_params();
    match cli.command {
        Commands::Classify { kind, id } => handle_classify(&db, &kind, id.as_deref(), params, cli.json),
        Commands::Import { file } => handle_import(&db, &file, cli.json),
        Commands::Clusters { kind, limit } => handle_clusters(&db, &kind, limit, cli.json),
        Commands::Check { kind } => handle_check(&db, &kind, &params, cli.json),
        Commands::Stats => handle_stats(&db, cli.json),
        Commands::Completions { .. } => unreachable!(),
    }
}

fn parse_kind(kind: &str) -> Result<ClusterKind> {
    kind.parse().map_err(Error::InvalidKind)
}

fn parse_cluster_id(id: &str) -> Result<ClusterId> {
    id.parse().map_err(|_| Error::InvalidClusterId(id.to_string()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// ============================================================================
// Command Handlers
// ============================================================================

fn handle_classify(
    db: &Database,
    kind: &str,
    id: Option<&str>,
    params: ClusterParams,
    json: bool,
) -> Result<Outcome> {
    let kind = parse_kind(kind)?;
    let single = id.map(parse_cluster_id).transpose()?;
    let stats: RunStats = classify::classify(db, kind, single, params)?;

    if json {
        print_json(&stats)?;
    } else {
        println!(
            "{}: {} flights reclassified, {} created, {} commits, {} rollbacks, {} rounds",
            kind, stats.reclassified, stats.created, stats.committed, stats.rolled_back, stats.rounds
        );
        if stats.truncated > 0 {
            println!("  {} propagations stopped at the round limit", stats.truncated);
        }
    }
    Ok(Outcome::from_progress(stats.made_progress()))
}

fn handle_import(db: &Database, file: &Path, json: bool) -> Result<Outcome> {
    let result = import::import_flights_file(db, file)?;
    if json {
        print_json(&result)?;
    } else {
        println!("Imported {} flights ({} duplicates skipped)", result.imported, result.duplicates);
    }
    Ok(Outcome::from_progress(result.imported > 0))
}

fn handle_clusters(db: &Database, kind: &str, limit: usize, json: bool) -> Result<Outcome> {
    let kind = parse_kind(kind)?;
    let clusters = db.list_clusters(kind, limit)?;

    if json {
        print_json(&clusters)?;
        return Ok(Outcome::Done);
    }
    if clusters.is_empty() {
        println!("No {} clusters", kind);
        return Ok(Outcome::Done);
    }
    for c in &clusters {
        let centroid = c
            .centroid
            .iter()
            .map(|p| format!("{:.4},{:.4}", p.lat, p.lng))
            .collect::<Vec<_>>()
            .join(" ");
        println!(
            "{:>6}  {:>4} flights  avg {:>6.1} km  best {:>6.1}  {}",
            c.id.0, c.flights, c.avg_distance, c.max_score, centroid
        );
    }
    Ok(Outcome::Done)
}

fn handle_check(db: &Database, kind: &str, params: &ClusterParams, json: bool) -> Result<Outcome> {
    let kind = parse_kind(kind)?;
    let report = classify::check(db, kind, params)?;

    if json {
        print_json(&report)?;
    } else {
        println!(
            "{}: {} clusters, {} unassigned flights",
            kind, report.clusters, report.unassigned
        );
        for id in &report.empty_clusters {
            println!("  empty cluster {}", id);
        }
        for m in &report.mismatches {
            println!(
                "  flight {} in {} is {:.2} km out (radius {:.2} km)",
                m.flight_id, m.cluster_id, m.worst_km, m.radius_km
            );
        }
        if report.is_consistent() {
            println!("  consistent");
        }
    }
    Ok(Outcome::from_progress(report.is_consistent()))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct KindStats {
    kind: ClusterKind,
    clusters: i64,
    unassigned: i64,
}

#[derive(Serialize)]
struct StoreStats {
    flights: i64,
    kinds: Vec<KindStats>,
}

fn handle_stats(db: &Database, json: bool) -> Result<Outcome> {
    let mut kinds = Vec::new();
    for kind in ClusterKind::ALL {
        kinds.push(KindStats {
            kind,
            clusters: db.count_clusters(kind)?,
            unassigned: db.count_unassigned(kind)?,
        });
    }
    let stats = StoreStats { flights: db.count_flights()?, kinds };

    if json {
        print_json(&stats)?;
    } else {
        println!("Flights: {}", stats.flights);
        for k in &stats.kinds {
            println!("  {:<7} {} clusters, {} unassigned", k.kind, k.clusters, k.unassigned);
        }
    }
    Ok(Outcome::Done)
}
