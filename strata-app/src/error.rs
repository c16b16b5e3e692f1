use std::path::PathBuf;
use strata_capture::CaptureError;
use strata_mapping::{CubemapError, MappingError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Failed to read config {}: {source}", .path.display())]
    Config {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Mapping(#[from] MappingError),

    #[error(transparent)]
    Cubemap(#[from] CubemapError),
}
