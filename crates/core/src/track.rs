use std::path::PathBuf;

use ambi_engine::BusId;
use ambi_peaks::PeakTask;
use ambi_transport::{AudioArc, BackendMode, LoopRegion, PeakSummary, TrackId};

use crate::backend::PlaybackBackend;

/// Where a track's audio comes from.
#[derive(Debug, Clone)]
pub enum TrackSource {
    File(PathBuf),
    /// Encoded audio in memory; `extension` is a prober hint such as `"wav"`.
    Bytes {
        data: Vec<u8>,
        extension: Option<String>,
    },
    /// Audio that is already decoded.
    Decoded(AudioArc),
}

impl From<PathBuf> for TrackSource {
    fn from(path: PathBuf) -> Self {
        TrackSource::File(path)
    }
}

impl From<AudioArc> for TrackSource {
    fn from(audio: AudioArc) -> Self {
        TrackSource::Decoded(audio)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackState {
    Loading,
    /// Ready, positioned at the loop start.
    Stopped,
    Playing,
    Paused,
}

impl TrackState {
    pub fn is_playing(&self) -> bool {
        matches!(self, TrackState::Playing)
    }
}

pub(crate) struct Player {
    pub(crate) audio: AudioArc,
    pub(crate) backend: Box<dyn PlaybackBackend>,
}

pub struct Track {
    pub(crate) id: TrackId,
    pub(crate) bus: BusId,
    pub(crate) state: TrackState,
    pub(crate) gain: f32,
    /// As requested; clamped only inside the scheduling math.
    pub(crate) crossfade: f64,
    pub(crate) mode: BackendMode,
    pub(crate) region: Option<LoopRegion>,
    pub(crate) pending_start: bool,
    pub(crate) generation: u64,
    pub(crate) player: Option<Player>,
    pub(crate) peaks: Option<PeakSummary>,
    pub(crate) peak_task: Option<PeakTask>,
}

impl Track {
    pub(crate) fn loading(id: TrackId, bus: BusId, mode: BackendMode, crossfade: f64) -> Self {
        Self {
            id,
            bus,
            state: TrackState::Loading,
            gain: 1.0,
            crossfade,
            mode,
            region: None,
            pending_start: false,
            generation: 0,
            player: None,
            peaks: None,
            peak_task: None,
        }
    }

    pub fn id(&self) -> &TrackId {
        &self.id
    }

    pub fn state(&self) -> TrackState {
        self.state
    }

    pub fn is_playing(&self) -> bool {
        self.state.is_playing()
    }

    pub fn is_ready(&self) -> bool {
        self.player.is_some()
    }

    pub fn gain(&self) -> f32 {
        self.gain
    }

    pub fn crossfade(&self) -> f64 {
        self.crossfade
    }

    pub fn mode(&self) -> BackendMode {
        self.mode
    }

    /// `None` until the audio is loaded.
    pub fn loop_region(&self) -> Option<LoopRegion> {
        self.region
    }

    /// Whether the track starts by itself once loading finishes.
    pub fn start_pending(&self) -> bool {
        self.pending_start
    }

    pub fn duration(&self) -> Option<f64> {
        self.player.as_ref().map(|p| p.audio.duration_secs())
    }

    pub fn audio(&self) -> Option<&AudioArc> {
        self.player.as_ref().map(|p| &p.audio)
    }

    pub fn peaks(&self) -> Option<&PeakSummary> {
        self.peaks.as_ref()
    }
}

impl std::fmt::Debug for Track {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Track")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("gain", &self.gain)
            .field("crossfade", &self.crossfade)
            .field("mode", &self.mode)
            .field("region", &self.region)
            .field("pending_start", &self.pending_start)
            .finish()
    }
}
