use anyhow::Result;
use request_profiler::output::read_profile;
use request_profiler::utils::config::SCHEMA_VERSION;
use std::path::Path;

/// Validate a profile JSON file
pub fn validate_profile_file(file_path: &Path) -> Result<()> {
    println!("Validating profile: {}", file_path.display());

    let profile = read_profile(file_path)?;

    println!("✓ Valid profile JSON");
    println!("  Request:   {}", profile.request_id);
    println!("  Endpoint:  {}", profile.endpoint_name);
    println!("  Status:    {}", profile.status);
    println!("  Duration:  {:.2} ms", profile.duration);
    println!("  Queries:   {}", profile.query_count);
    println!("  Events:    {}", profile.additional_data.events.len());

    Ok(())
}

/// Display schema information
pub fn display_schema(show_details: bool) {
    println!("Request Profiler Profile Schema");
    println!("Current Version: {}", SCHEMA_VERSION);
    println!();

    if show_details {
        println!("Schema Structure:");
        println!("  request_id: string        - Unique request identifier");
        println!("  url, method, path: string - Request line");
        println!("  controller, action: string? - Routing result");
        println!("  endpoint_name: string     - Aggregation key");
        println!("  status: number            - Response status (<100 = not listed)");
        println!("  started_at: number        - Epoch seconds");
        println!("  duration: number          - Total ms");
        println!("  db_time, view_time, controller_time, ruby_time: number - Breakdown ms");
        println!("  query_count, total_query_time: number");
        println!("  queries: array            - sql, name, duration, started_at");
        println!("  segments: array           - name, duration, percentage, category");
        println!("  additional_data: object");
        println!("    events: array           - Tagged query/method_call/render events");
        println!("    method_profiles: array  - Per-method totals");
        println!("    call_graph: object      - caller -> {{callee: count}}");
        println!("    hotspots: object        - controllers, methods, models, views");
    } else {
        println!("Use --show for detailed schema information");
    }
}

/// Display version information
pub fn display_version() {
    println!("Request Profiler v{}", env!("CARGO_PKG_VERSION"));
    println!("Profile Schema: v{}", SCHEMA_VERSION);
    println!();
    println!("Embedded request profiling with hotspot aggregation and profile storage.");
}
