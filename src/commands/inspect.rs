//! Read-only commands over a profile database.
//!
//! Every command prints either a human-readable table or, with `--json`,
//! the underlying structure as pretty JSON.

use anyhow::{Context, Result};
use chrono::{Duration, TimeZone, Utc};
use log::debug;
use request_profiler::query::QueryEngine;
use request_profiler::storage::{SqliteStore, TimeBucket};
use request_profiler::utils::clock::system_clock;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

/// Open the relational store at `db_path` and wrap it in a query engine
///
/// Unlike the embedded profiler, the CLI reports an unusable database
/// instead of silently degrading.
pub fn open_engine(db_path: &Path, retention_days: i64) -> Result<QueryEngine> {
    debug!("Opening profile database {}", db_path.display());
    let retention = Duration::try_days(retention_days)
        .with_context(|| format!("Retention of {} days is out of range", retention_days))?;
    let store = SqliteStore::open(db_path, retention, system_clock())
        .with_context(|| format!("Failed to open profile database {}", db_path.display()))?;
    Ok(QueryEngine::new(Arc::new(store)))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("Failed to serialize output")?
    );
    Ok(())
}

fn format_time(epoch_seconds: f64) -> String {
    Utc.timestamp_opt(epoch_seconds.floor() as i64, 0)
        .single()
        .map(|at| at.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| format!("{:.0}", epoch_seconds))
}

/// `stats`: summary statistics and the latest profiles
pub fn show_stats(engine: &QueryEngine, json: bool) -> Result<()> {
    let stats = engine.summary_stats();
    if json {
        return print_json(&stats);
    }

    println!("Profiles:          {}", stats.total_count);
    println!("Avg duration:      {:.2} ms", stats.avg_duration);
    println!("Avg queries:       {:.1}", stats.avg_query_count);
    println!("Avg query time:    {:.2} ms", stats.avg_query_time);
    println!();
    println!("Breakdown (avg):");
    println!("  Database         {:.2} ms", stats.avg_db_time);
    println!("  View             {:.2} ms", stats.avg_view_time);
    println!("  Controller       {:.2} ms", stats.avg_controller_time);
    println!("  Application      {:.2} ms", stats.avg_ruby_time);

    if !stats.latest.is_empty() {
        println!();
        println!("Latest:");
        for profile in &stats.latest {
            println!(
                "  {}  {:>3}  {:>9.2} ms  {} {}",
                format_time(profile.started_at),
                profile.status,
                profile.duration,
                profile.method,
                profile.path
            );
        }
    }
    Ok(())
}

/// `list`: one page of profiles, newest first
pub fn list_profiles(engine: &QueryEngine, page: usize, per_page: usize, json: bool) -> Result<()> {
    let listing = engine.list_profiles(page, per_page);
    if json {
        return print_json(&listing);
    }

    println!(
        "Page {}/{} ({} profiles)",
        listing.page,
        listing.total_pages.max(1),
        listing.total_count
    );
    for profile in &listing.profiles {
        println!(
            "  {}  {}  {:>3}  {:>9.2} ms  {:>3} queries  {}",
            profile.request_id,
            format_time(profile.started_at),
            profile.status,
            profile.duration,
            profile.query_count,
            profile.endpoint_name
        );
    }
    Ok(())
}

/// `show`: one profile in full
pub fn show_profile(engine: &QueryEngine, request_id: &str, json: bool) -> Result<()> {
    let profile = engine
        .get_profile(request_id)
        .with_context(|| format!("Profile {} not found", request_id))?;
    if json {
        return print_json(&profile);
    }

    println!("{} {} -> {}", profile.method, profile.url, profile.status);
    println!("  Request:   {}", profile.request_id);
    println!("  Endpoint:  {}", profile.endpoint_name);
    println!("  Started:   {}", format_time(profile.started_at));
    println!("  Duration:  {:.2} ms", profile.duration);
    println!(
        "  Queries:   {} ({:.2} ms)",
        profile.query_count, profile.total_query_time
    );
    println!();
    println!("Segments:");
    for segment in &profile.segments {
        println!(
            "  {:<18} {:>9.2} ms  {:>5.1}%",
            segment.name, segment.duration, segment.percentage
        );
    }

    let hotspots = &profile.additional_data.hotspots;
    if !hotspots.methods.is_empty() {
        println!();
        println!("Top methods (self time):");
        for entry in hotspots.methods.iter().take(10) {
            println!(
                "  {:<50} {:>9.2} ms  x{}",
                entry.name, entry.value, entry.data.count
            );
        }
    }
    Ok(())
}

/// `endpoints`: per-endpoint aggregates, slowest first
pub fn show_endpoints(engine: &QueryEngine, json: bool) -> Result<()> {
    let endpoints = engine.aggregate_endpoints();
    if json {
        return print_json(&endpoints);
    }

    println!(
        "  {:<40} {:>7} {:>10} {:>10} {:>6} {:>6} {:>6} {:>6}",
        "Endpoint", "Count", "Avg ms", "Max ms", "DB%", "View%", "Ctrl%", "App%"
    );
    for stat in &endpoints {
        println!(
            "  {:<40} {:>7} {:>10.2} {:>10.2} {:>6.1} {:>6.1} {:>6.1} {:>6.1}",
            stat.endpoint_name,
            stat.request_count,
            stat.avg_duration,
            stat.max_duration,
            stat.db_percentage,
            stat.view_percentage,
            stat.controller_percentage,
            stat.ruby_percentage
        );
    }
    Ok(())
}

/// `slow-queries`: slowest recent queries
pub fn show_slow_queries(engine: &QueryEngine, limit: usize, json: bool) -> Result<()> {
    let queries = engine.slowest_queries(limit);
    if json {
        return print_json(&queries);
    }

    for query in &queries {
        let sql: String = query.sql.chars().take(80).collect();
        println!(
            "  {:>9.2} ms  {:<30}  {}",
            query.duration, query.endpoint_name, sql
        );
    }
    Ok(())
}

/// `queries`: statement class distribution
pub fn show_query_types(engine: &QueryEngine, window: usize, json: bool) -> Result<()> {
    let distribution = engine.query_type_distribution(window);
    if json {
        return print_json(&distribution);
    }

    let total: u64 = distribution.values().sum();
    for (kind, count) in &distribution {
        println!(
            "  {:<7} {:>7}  {:>5.1}%",
            kind,
            count,
            *count as f64 * 100.0 / total.max(1) as f64
        );
    }
    Ok(())
}

/// `hotspots`: rolled-up hotspots across recent profiles
pub fn show_hotspots(engine: &QueryEngine, window: usize, json: bool) -> Result<()> {
    let hotspots = engine.hotspots(window);
    if json {
        return print_json(&hotspots);
    }

    let sections = [
        ("Controllers", &hotspots.controllers),
        ("Methods (self time)", &hotspots.methods),
        ("Models", &hotspots.models),
        ("Views", &hotspots.views),
    ];
    for (title, entries) in sections {
        println!("{}:", title);
        if entries.is_empty() {
            println!("  (none)");
        }
        for entry in entries {
            println!(
                "  {:<50} {:>10.2} ms  x{}",
                entry.name, entry.value, entry.data.count
            );
        }
        println!();
    }
    Ok(())
}

fn print_buckets(buckets: &[TimeBucket], json: bool) -> Result<()> {
    if json {
        return print_json(&buckets);
    }
    for bucket in buckets {
        println!(
            "  {}  {:>6} req  {:>9.2} ms avg  {:>6.1} queries avg",
            format_time(bucket.timestamp as f64),
            bucket.count,
            bucket.avg_duration,
            bucket.avg_query_count
        );
    }
    Ok(())
}

/// `series`: zero-filled buckets over the trailing window
pub fn show_series(engine: &QueryEngine, minutes: i64, interval_seconds: i64, json: bool) -> Result<()> {
    anyhow::ensure!(interval_seconds > 0, "Interval must be positive");
    anyhow::ensure!(minutes > 0, "Minutes must be positive");
    let end = engine.store().now();
    let start = Duration::try_minutes(minutes)
        .and_then(|window| end.checked_sub_signed(window))
        .with_context(|| format!("A {} minute window is out of range", minutes))?;
    let interval = Duration::try_seconds(interval_seconds)
        .with_context(|| format!("Interval of {}s is out of range", interval_seconds))?;
    let buckets = engine.time_series(start, end, interval);
    print_buckets(&buckets, json)
}

/// `trends`: hourly buckets over the trailing days
pub fn show_trends(engine: &QueryEngine, days: i64, json: bool) -> Result<()> {
    anyhow::ensure!(days > 0, "Days must be positive");
    print_buckets(&engine.trends(days), json)
}
