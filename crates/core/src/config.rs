use ambi_peaks::ExtractMode;
use ambi_transport::BackendMode;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Backend given to every newly loaded track.
    pub backend: BackendMode,
    /// Loop crossfade in seconds for newly loaded tracks.
    pub crossfade: f64,
    pub scheduling: SchedulingConfig,
    pub peaks: PeaksConfig,
    pub max_voices: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backend: BackendMode::default(),
            crossfade: 0.05,
            scheduling: SchedulingConfig::default(),
            peaks: PeaksConfig::default(),
            max_voices: ambi_engine::DEFAULT_MAX_VOICES,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        let s = &self.scheduling;
        let positive = |v: f64| v.is_finite() && v > 0.0;
        if !(s.safety_lead.is_finite() && s.safety_lead >= 0.0) {
            return Err(EngineError::InvalidConfig("safety_lead must be finite and >= 0"));
        }
        if !positive(s.schedule_ahead) {
            return Err(EngineError::InvalidConfig("schedule_ahead must be finite and > 0"));
        }
        if !positive(s.crossfade_epsilon) {
            return Err(EngineError::InvalidConfig("crossfade_epsilon must be finite and > 0"));
        }
        if self.peaks.bins == 0 {
            return Err(EngineError::InvalidConfig("peaks.bins must be at least 1"));
        }
        if self.max_voices == 0 {
            return Err(EngineError::InvalidConfig("max_voices must be at least 1"));
        }
        Ok(())
    }
}

/// Timing of the loop schedule, all in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulingConfig {
    /// Gap between "now" and the first scheduled start, so nothing is
    /// scheduled in the past.
    pub safety_lead: f64,
    /// How far ahead of a head's start its voice is handed to the output.
    pub schedule_ahead: f64,
    /// Margin kept between the crossfade and half the loop length.
    pub crossfade_epsilon: f64,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            safety_lead: 0.05,
            schedule_ahead: 0.1,
            crossfade_epsilon: 0.005,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeaksConfig {
    pub mode: ExtractMode,
    pub bins: usize,
    pub chunk_size: usize,
}

impl Default for PeaksConfig {
    fn default() -> Self {
        Self {
            mode: ExtractMode::Parallel,
            bins: 1024,
            chunk_size: ambi_peaks::DEFAULT_CHUNK_SIZE,
        }
    }
}
