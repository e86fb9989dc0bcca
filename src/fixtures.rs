//! Profile builders shared by unit tests.

use crate::aggregator::assembler::{AssemblyInput, ProfileAssembler};
use crate::aggregator::hotspots::HotspotAccumulator;
use crate::model::event::{Event, Query};
use crate::model::schema::{Profile, RequestMetadata};

/// A profile for `GET /users` routed to `UsersController#index`
pub fn profile(request_id: &str, started_at: f64, duration: f64, status: u16) -> Profile {
    ProfileAssembler::new().assemble(AssemblyInput {
        request_id: request_id.to_string(),
        metadata: RequestMetadata::new("GET", "/users").with_controller("UsersController", "index"),
        status,
        started_at,
        duration,
        db_time: 0.0,
        view_time: 0.0,
        controller_time: 0.0,
        events: Vec::new(),
        hotspots: HotspotAccumulator::new(),
    })
}

/// A profile for an arbitrary endpoint carrying the given queries
pub fn profile_with_queries(
    request_id: &str,
    endpoint: &str,
    started_at: f64,
    duration: f64,
    queries: &[(&str, f64)],
) -> Profile {
    let events = queries
        .iter()
        .map(|(sql, duration)| {
            Event::Query(Query {
                sql: sql.to_string(),
                name: None,
                duration: *duration,
                started_at,
                backtrace: None,
            })
        })
        .collect();
    let db_time = queries.iter().map(|(_, d)| d).sum();
    let metadata = RequestMetadata {
        endpoint_name: Some(endpoint.to_string()),
        ..RequestMetadata::new("GET", format!("/{}", endpoint))
    };

    ProfileAssembler::new().assemble(AssemblyInput {
        request_id: request_id.to_string(),
        metadata,
        status: 200,
        started_at,
        duration,
        db_time,
        view_time: 0.0,
        controller_time: 0.0,
        events,
        hotspots: HotspotAccumulator::new(),
    })
}
