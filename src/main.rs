//! Request Profiler CLI
//!
//! Inspects, exports and maintains a relational profile database written
//! by an embedded profiler.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use env_logger::Env;
use request_profiler::utils::config::ProfilerConfig;
use std::path::PathBuf;

mod commands;

use commands::{
    display_schema, display_version, inspect, maintain, open_engine, validate_profile_file,
};

/// rprof - inspect request profiles
#[derive(Parser, Debug)]
#[command(name = "rprof")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,

    /// Profile database (overrides the config file)
    #[arg(long, global = true, env = "RPROF_DB")]
    db: Option<PathBuf>,

    /// Profiler configuration file (TOML)
    #[arg(short, long, global = true, env = "RPROF_CONFIG")]
    config: Option<PathBuf>,

    /// Print JSON instead of tables
    #[arg(long, global = true)]
    json: bool,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Available commands
#[derive(Subcommand, Debug)]
enum Commands {
    /// Summary statistics and latest profiles
    Stats,

    /// List profiles, newest first
    List {
        #[arg(short, long, default_value = "1")]
        page: usize,

        #[arg(long, default_value = "50")]
        per_page: usize,
    },

    /// Show one profile
    Show {
        /// Request id
        id: String,
    },

    /// Per-endpoint aggregates
    Endpoints,

    /// Slowest recent queries
    SlowQueries {
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Query counts by statement type
    Queries {
        /// Number of recent profiles to scan
        #[arg(short, long, default_value = "200")]
        window: usize,
    },

    /// Hotspots across recent profiles
    Hotspots {
        /// Number of recent profiles to scan
        #[arg(short, long, default_value = "500")]
        window: usize,
    },

    /// Time series over the trailing window
    Series {
        /// Window length in minutes
        #[arg(short, long, default_value = "60")]
        minutes: i64,

        /// Bucket width in seconds
        #[arg(short, long, default_value = "300")]
        interval: i64,
    },

    /// Hourly trends over the trailing days
    Trends {
        #[arg(short, long, default_value = "1")]
        days: i64,
    },

    /// Delete profiles past retention
    Purge,

    /// Export recent profiles to JSON
    Export {
        #[arg(short, long, default_value = "profiles.json")]
        output: PathBuf,

        #[arg(short, long, default_value = "1000")]
        limit: usize,
    },

    /// Import a JSON export
    Import {
        /// Export file
        file: PathBuf,
    },

    /// Render a profile as an SVG flamegraph
    Flamegraph {
        /// Request id
        id: String,

        #[arg(short, long, default_value = "flamegraph.svg")]
        output: PathBuf,

        /// Print text summary to stdout
        #[arg(long)]
        summary: bool,
    },

    /// Validate a profile JSON file
    Validate {
        /// Path to profile JSON file
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Display schema information
    Schema {
        /// Show full schema details
        #[arg(long)]
        show: bool,
    },

    /// Display version information
    Version,
}

fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Setup logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level)).init();

    // Commands that do not touch the database
    match &cli.command {
        Commands::Validate { file } => return validate_profile_file(file),
        Commands::Schema { show } => {
            display_schema(*show);
            return Ok(());
        }
        Commands::Version => {
            display_version();
            return Ok(());
        }
        _ => {}
    }

    let config = match &cli.config {
        Some(path) => ProfilerConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => ProfilerConfig::default(),
    };
    let db_path = cli.db.clone().unwrap_or_else(|| config.database_path.clone());
    let engine = open_engine(&db_path, config.retention_days)?;
    let json = cli.json;

    match cli.command {
        Commands::Stats => inspect::show_stats(&engine, json)?,
        Commands::List { page, per_page } => {
            inspect::list_profiles(&engine, page, per_page, json)?
        }
        Commands::Show { id } => inspect::show_profile(&engine, &id, json)?,
        Commands::Endpoints => inspect::show_endpoints(&engine, json)?,
        Commands::SlowQueries { limit } => inspect::show_slow_queries(&engine, limit, json)?,
        Commands::Queries { window } => inspect::show_query_types(&engine, window, json)?,
        Commands::Hotspots { window } => inspect::show_hotspots(&engine, window, json)?,
        Commands::Series { minutes, interval } => {
            inspect::show_series(&engine, minutes, interval, json)?
        }
        Commands::Trends { days } => inspect::show_trends(&engine, days, json)?,
        Commands::Purge => maintain::purge(&engine)?,
        Commands::Export { output, limit } => maintain::export(&engine, &output, limit)?,
        Commands::Import { file } => maintain::import(&engine, &file)?,
        Commands::Flamegraph {
            id,
            output,
            summary,
        } => maintain::flamegraph(&engine, &id, &output, summary)?,
        Commands::Validate { .. } | Commands::Schema { .. } | Commands::Version => {}
    }

    Ok(())
}
