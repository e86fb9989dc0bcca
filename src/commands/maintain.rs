//! Commands that change or export the profile database.

use anyhow::{Context, Result};
use log::info;
use request_profiler::flamegraph::{generate_text_summary, profile_stacks, render_svg};
use request_profiler::output::{read_export, write_export, write_svg, ProfileExport};
use request_profiler::query::QueryEngine;
use std::path::Path;

/// `purge`: delete profiles past retention
pub fn purge(engine: &QueryEngine) -> Result<()> {
    let removed = engine.store().purge();
    println!("Purged {} profiles", removed);
    Ok(())
}

/// `export`: write the newest `limit` profiles to a JSON file
pub fn export(engine: &QueryEngine, output: &Path, limit: usize) -> Result<()> {
    let profiles = engine.store().list(limit, 0);
    let export = ProfileExport::new(profiles, engine.store().now());
    write_export(&export, output)
        .with_context(|| format!("Failed to write export {}", output.display()))?;
    println!("Exported {} profiles to {}", export.profiles.len(), output.display());
    Ok(())
}

/// `import`: load a JSON export into the database
pub fn import(engine: &QueryEngine, input: &Path) -> Result<()> {
    let export =
        read_export(input).with_context(|| format!("Failed to read export {}", input.display()))?;
    for profile in &export.profiles {
        engine.store().put(profile);
    }
    info!("Imported {} profiles", export.profiles.len());
    println!("Imported {} profiles from {}", export.profiles.len(), input.display());
    Ok(())
}

/// `flamegraph`: render one profile's call tree
pub fn flamegraph(
    engine: &QueryEngine,
    request_id: &str,
    output: &Path,
    summary: bool,
) -> Result<()> {
    let profile = engine
        .get_profile(request_id)
        .with_context(|| format!("Profile {} not found", request_id))?;

    let svg = render_svg(&profile).context("Failed to generate flamegraph")?;
    write_svg(&svg, output).context("Failed to write flamegraph")?;
    println!("Flamegraph written to {}", output.display());

    if summary {
        println!();
        println!("{}", generate_text_summary(&profile_stacks(&profile), 15));
    }
    Ok(())
}
