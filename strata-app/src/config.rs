//! Session configuration, read from JSON.

use crate::error::AppError;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use strata_capture::{DEFAULT_CAPTURE_HZ, MeasureConfig, SimulatedCameraConfig};
use strata_mapping::{FilterIntensity, MeshFileFormat, ReconstructionConfig, SimulatedMapperConfig};

/// Timing of the scripted session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptConfig {
    /// Seconds spent scanning before filtering.
    pub scan_secs: f32,
    /// Seconds between two depth probes.
    pub probe_interval_secs: f32,
    /// Hard limit on the whole session.
    pub max_secs: f32,
    pub filter_intensity: FilterIntensity,
}

impl Default for ScriptConfig {
    fn default() -> Self {
        Self {
            scan_secs: 3.0,
            probe_interval_secs: 1.0,
            max_secs: 30.0,
            filter_intensity: FilterIntensity::Medium,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub log_level: String,
    /// Rate of the application tick.
    pub app_hz: f32,
    pub capture_hz: f32,
    /// Retrieve resolution; zero means native.
    pub retrieve_resolution: [u32; 2],
    pub async_textures: bool,
    pub camera: SimulatedCameraConfig,
    pub measure: MeasureConfig,
    pub reconstruction: ReconstructionConfig,
    pub mapper: SimulatedMapperConfig,
    pub cubemap_face_size: u32,
    pub script: ScriptConfig,
    pub save_path: PathBuf,
    pub save_format: MeshFileFormat,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            app_hz: 60.0,
            capture_hz: DEFAULT_CAPTURE_HZ,
            retrieve_resolution: [0, 0],
            async_textures: true,
            camera: SimulatedCameraConfig::default(),
            measure: MeasureConfig::default().with_normals(true),
            reconstruction: ReconstructionConfig::default(),
            mapper: SimulatedMapperConfig::default(),
            cubemap_face_size: 64,
            script: ScriptConfig::default(),
            save_path: PathBuf::from("strata_mesh.obj"),
            save_format: MeshFileFormat::Obj,
        }
    }
}

impl AppConfig {
    /// Read a config file. Missing fields keep their defaults.
    pub fn load(path: &Path) -> Result<Self, AppError> {
        let file = File::open(path).map_err(|source| AppError::Config {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_partial_config_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "app_hz": 30.0, "camera": {{ "frame_rate": 15.0 }}, "script": {{ "scan_secs": 1.5 }} }}"#
        )
        .unwrap();

        let config = AppConfig::load(file.path()).unwrap();
        assert_eq!(config.app_hz, 30.0);
        assert_eq!(config.camera.frame_rate, 15.0);
        assert_eq!(config.camera.resolution, glam::UVec2::new(64, 48));
        assert_eq!(config.script.scan_secs, 1.5);
        assert_eq!(config.script.max_secs, 30.0);
        assert!(config.measure.depth);
        assert_eq!(config.reconstruction.frequency, 15.0);
    }

    #[test]
    fn test_missing_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = AppConfig::load(&dir.path().join("missing.json")).unwrap_err();
        assert!(matches!(err, AppError::Config { .. }));
    }

    #[test]
    fn test_invalid_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        assert!(matches!(
            AppConfig::load(file.path()),
            Err(AppError::Parse(_))
        ));
    }
}
