//! Sampling decision made before a session exists.

use crate::utils::config::ProfilerConfig;
use log::debug;
use rand::Rng;

/// Decides whether a unit of work gets profiled
#[derive(Debug, Clone)]
pub struct Sampler {
    enabled: bool,
    sample_rate: f64,
    mount_path: Option<String>,
    ignored_prefixes: Vec<String>,
}

impl Sampler {
    pub fn from_config(config: &ProfilerConfig) -> Self {
        Self {
            enabled: config.enabled,
            sample_rate: config.sample_rate,
            mount_path: config.mount_path.clone(),
            ignored_prefixes: config.ignored_path_prefixes.clone(),
        }
    }

    /// Paths that are never profiled: the dashboard itself and static assets
    pub fn is_ignored(&self, path: &str) -> bool {
        if let Some(mount) = &self.mount_path {
            if !mount.is_empty() && path.starts_with(mount.as_str()) {
                return true;
            }
        }
        self.ignored_prefixes
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
    }

    /// Sampling check using the thread-local RNG
    pub fn should_profile(&self, path: &str) -> bool {
        self.should_profile_with(path, &mut rand::thread_rng())
    }

    /// Sampling check with a caller-provided RNG
    pub fn should_profile_with<R: Rng + ?Sized>(&self, path: &str, rng: &mut R) -> bool {
        if !self.enabled || self.is_ignored(path) {
            return false;
        }
        if self.sample_rate >= 1.0 {
            return true;
        }
        let sampled = rng.gen::<f64>() < self.sample_rate;
        if !sampled {
            debug!("[profiler] Sampling skipped {}", path);
        }
        sampled
    }
}

/// Fresh request id for hosts that do not supply their own
pub fn generate_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
