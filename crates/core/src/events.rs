use ambi_peaks::ExtractionError;
use ambi_transport::{PeakSummary, TrackId};

/// Track lifecycle notifications for whatever renders the engine's state.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    TrackReady { id: TrackId },
    TrackStarted { id: TrackId },
    TrackPaused { id: TrackId },
    TrackStopped { id: TrackId },
    LoadFailed { id: TrackId, error: String },
    /// A playing track could not be rescheduled and has stopped.
    PlaybackFailed { id: TrackId, error: String },
    TrackUnloaded { id: TrackId },
    PeaksProgress { id: TrackId, fraction: f32 },
    PeaksReady { id: TrackId, summary: PeakSummary },
    PeaksFailed { id: TrackId, error: ExtractionError },
}

impl EngineEvent {
    pub fn track(&self) -> &TrackId {
        match self {
            EngineEvent::TrackReady { id }
            | EngineEvent::TrackStarted { id }
            | EngineEvent::TrackPaused { id }
            | EngineEvent::TrackStopped { id }
            | EngineEvent::LoadFailed { id, .. }
            | EngineEvent::PlaybackFailed { id, .. }
            | EngineEvent::TrackUnloaded { id }
            | EngineEvent::PeaksProgress { id, .. }
            | EngineEvent::PeaksReady { id, .. }
            | EngineEvent::PeaksFailed { id, .. } => id,
        }
    }
}
