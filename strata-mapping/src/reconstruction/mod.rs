//! Background mesh reconstruction.
//!
//! A [`ReconstructionWorker`] thread executes one unit of the requested
//! step per cycle. The application steers it through a
//! [`ReconstructionManager`], which owns the worker and turns the worker's
//! published results into [`MappingEvent`]s on the application's own tick.

mod manager;
mod worker;

pub use manager::ReconstructionManager;
pub use worker::ReconstructionWorker;

use crate::mesh::TexturingMode;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Stage of the reconstruction pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReconstructionStep {
    #[default]
    None,
    /// Continuous: keeps retrieving mesh updates.
    Scan,
    Filter,
    Texture,
    Load,
    Save,
}

impl ReconstructionStep {
    /// Steps that run once per request and then fall back to `None`.
    pub fn is_single_shot(self) -> bool {
        matches!(
            self,
            ReconstructionStep::Filter
                | ReconstructionStep::Texture
                | ReconstructionStep::Load
                | ReconstructionStep::Save
        )
    }
}

/// Notification produced by [`ReconstructionManager::tick`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingEvent {
    MeshUpdated,
    MeshFiltered,
    MeshTextured(TexturingMode),
    Saved,
    Loaded,
    StepFailed(ReconstructionStep),
}

impl MappingEvent {
    fn completed(step: ReconstructionStep, texturing: TexturingMode) -> Option<Self> {
        match step {
            ReconstructionStep::None => None,
            ReconstructionStep::Scan => Some(MappingEvent::MeshUpdated),
            ReconstructionStep::Filter => Some(MappingEvent::MeshFiltered),
            ReconstructionStep::Texture => Some(MappingEvent::MeshTextured(texturing)),
            ReconstructionStep::Load => Some(MappingEvent::Loaded),
            ReconstructionStep::Save => Some(MappingEvent::Saved),
        }
    }
}

/// Reconstruction timing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconstructionConfig {
    /// Worker cycle rate in Hz.
    pub frequency: f32,
    /// Wait before filtering so the engine can release its buffers.
    #[serde(with = "millis")]
    pub filter_settle: Duration,
    /// Minimum time between two completion polls in `tick`.
    #[serde(with = "millis")]
    pub poll_interval: Duration,
}

impl Default for ReconstructionConfig {
    fn default() -> Self {
        Self {
            frequency: 15.0,
            filter_settle: Duration::from_millis(500),
            poll_interval: Duration::from_millis(200),
        }
    }
}

impl ReconstructionConfig {
    pub fn with_frequency(mut self, frequency_hz: f32) -> Self {
        self.frequency = frequency_hz;
        self
    }

    pub fn with_filter_settle(mut self, settle: Duration) -> Self {
        self.filter_settle = settle;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_shot_steps() {
        assert!(!ReconstructionStep::None.is_single_shot());
        assert!(!ReconstructionStep::Scan.is_single_shot());
        assert!(ReconstructionStep::Filter.is_single_shot());
        assert!(ReconstructionStep::Save.is_single_shot());
    }

    #[test]
    fn test_config_durations_in_millis() {
        let config: ReconstructionConfig =
            serde_json::from_str(r#"{ "filter_settle": 50 }"#).unwrap();
        assert_eq!(config.filter_settle, Duration::from_millis(50));
        assert_eq!(config.frequency, 15.0);

        let json = serde_json::to_value(config).unwrap();
        assert_eq!(json["poll_interval"], 200);
    }
}
