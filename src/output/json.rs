//! JSON profile export and import.
//!
//! Single profiles are written as the bare document; bulk exports wrap a
//! profile list with the schema version and export time so they can be
//! re-imported into either store.

use crate::model::schema::Profile;
use crate::utils::config::SCHEMA_VERSION;
use crate::utils::error::OutputError;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

/// A bulk export of profiles
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileExport {
    pub schema_version: String,
    pub exported_at: DateTime<Utc>,
    pub profiles: Vec<Profile>,
}

impl ProfileExport {
    pub fn new(profiles: Vec<Profile>, exported_at: DateTime<Utc>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            exported_at,
            profiles,
        }
    }
}

/// Write a profile to a JSON file
///
/// **Public** - main entry point for JSON output
///
/// # Arguments
/// * `profile` - Profile to write
/// * `output_path` - Path to output JSON file
///
/// # Errors
/// * `OutputError::WriteFailed` - I/O error during write
/// * `OutputError::SerializationFailed` - JSON serialization error
/// * `OutputError::InvalidPath` - Path cannot be created or is invalid
pub fn write_profile(profile: &Profile, output_path: impl AsRef<Path>) -> Result<(), OutputError> {
    let output_path = output_path.as_ref();
    info!("Writing profile {} to: {}", profile.request_id, output_path.display());
    write_json(profile, output_path)
}

/// Write a bulk export to a JSON file
pub fn write_export(export: &ProfileExport, output_path: impl AsRef<Path>) -> Result<(), OutputError> {
    let output_path = output_path.as_ref();
    info!(
        "Exporting {} profiles to: {}",
        export.profiles.len(),
        output_path.display()
    );
    write_json(export, output_path)
}

fn write_json<T: Serialize>(value: &T, output_path: &Path) -> Result<(), OutputError> {
    validate_output_path(output_path)?;
    create_parent_dirs(output_path)?;

    let file = File::create(output_path).map_err(OutputError::WriteFailed)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, value).map_err(OutputError::SerializationFailed)?;
    writer.flush().map_err(OutputError::WriteFailed)?;

    info!(
        "Written successfully ({} bytes)",
        calculate_file_size(output_path)
    );
    Ok(())
}

/// Serialize a profile to a pretty JSON string
pub fn profile_to_string(profile: &Profile) -> Result<String, OutputError> {
    serde_json::to_string_pretty(profile).map_err(OutputError::SerializationFailed)
}

/// Read a profile from a JSON file
///
/// # Errors
/// * `OutputError::WriteFailed` - File read error (reusing WriteFailed for I/O)
/// * `OutputError::SerializationFailed` - JSON parse error
pub fn read_profile(input_path: impl AsRef<Path>) -> Result<Profile, OutputError> {
    let input_path = input_path.as_ref();
    debug!("Reading profile from: {}", input_path.display());

    let file = File::open(input_path).map_err(OutputError::WriteFailed)?;
    let profile: Profile =
        serde_json::from_reader(BufReader::new(file)).map_err(OutputError::SerializationFailed)?;

    debug!("Profile loaded: {} ({})", profile.request_id, profile.endpoint_name);
    Ok(profile)
}

/// Read a bulk export
pub fn read_export(input_path: impl AsRef<Path>) -> Result<ProfileExport, OutputError> {
    let input_path = input_path.as_ref();
    debug!("Reading export from: {}", input_path.display());

    let file = File::open(input_path).map_err(OutputError::WriteFailed)?;
    let export: ProfileExport =
        serde_json::from_reader(BufReader::new(file)).map_err(OutputError::SerializationFailed)?;

    if export.schema_version != SCHEMA_VERSION {
        warn!(
            "Export schema {} differs from current {}",
            export.schema_version, SCHEMA_VERSION
        );
    }
    Ok(export)
}

/// Create parent directories if needed
pub(crate) fn create_parent_dirs(path: &Path) -> Result<(), OutputError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            debug!("Creating parent directories: {}", parent.display());
            std::fs::create_dir_all(parent).map_err(|e| {
                OutputError::InvalidPath(format!("Cannot create directory {}: {}", parent.display(), e))
            })?;
        }
    }
    Ok(())
}

/// Validate that output path is writable
///
/// **Private** - internal validation
fn validate_output_path(path: &Path) -> Result<(), OutputError> {
    if path.as_os_str().is_empty() {
        return Err(OutputError::InvalidPath("Path is empty".to_string()));
    }
    if path.is_dir() {
        return Err(OutputError::InvalidPath(format!(
            "Path is a directory: {}",
            path.display()
        )));
    }
    Ok(())
}

fn calculate_file_size(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use tempfile::NamedTempFile;

    #[test]
    fn test_write_and_read_profile() {
        let profile = fixtures::profile_with_queries("r1", "users", 1_700_000_000.5, 42.0, &[("SELECT 1", 2.0)]);
        let temp_file = NamedTempFile::new().unwrap();

        write_profile(&profile, temp_file.path()).unwrap();
        let loaded = read_profile(temp_file.path()).unwrap();

        assert_eq!(loaded, profile);
    }

    #[test]
    fn test_export_round_trip() {
        let exported_at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let export = ProfileExport::new(
            vec![
                fixtures::profile("a", 1.0, 5.0, 200),
                fixtures::profile("b", 2.0, 6.0, 500),
            ],
            exported_at,
        );
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("nested/export.json");

        write_export(&export, &path).unwrap();
        assert_eq!(read_export(&path).unwrap(), export);
    }

    #[test]
    fn test_validate_output_path() {
        assert!(validate_output_path(Path::new("")).is_err());
        let temp_dir = tempfile::tempdir().unwrap();
        assert!(validate_output_path(temp_dir.path()).is_err());
    }

    #[test]
    fn test_read_garbage_fails() {
        let mut temp_file = NamedTempFile::new().unwrap();
        write!(temp_file, "not json").unwrap();
        assert!(matches!(
            read_profile(temp_file.path()),
            Err(OutputError::SerializationFailed(_))
        ));
    }
}
