//! Event collection for sampled units of work.
//!
//! This module provides:
//! - The sampling decision taken before any session exists
//! - The thread-local registry of the active session
//! - The `Session` accumulator the instrumentation layer writes into

pub mod context;
pub mod sampler;
pub mod session;

// Re-export main types
pub use sampler::{generate_request_id, Sampler};
pub use session::{MethodGuard, ScopeToken, Session, SessionOptions, SessionState};
