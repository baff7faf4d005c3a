use ambi_decode::DecodeError;
use ambi_engine::OutputError;
use ambi_transport::TrackId;

use crate::crossfade::Head;

/// A track's audio could not be made playable. The track is removed from the
/// registry.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("resampling failed: {0}")]
    Resample(String),

    #[error("decoded audio is empty")]
    Empty,

    #[error("loader thread unavailable")]
    LoaderUnavailable,
}

/// The output refused a voice. Logged by the backend and absorbed; the next
/// reschedule point tries again.
#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("head {head} failed to start: {source}")]
    Head {
        head: Head,
        #[source]
        source: OutputError,
    },

    #[error("loop voice failed to start: {0}")]
    Voice(#[from] OutputError),
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("unknown track '{0}'")]
    UnknownTrack(TrackId),

    #[error("track '{0}' is still loading")]
    NotReady(TrackId),

    #[error("invalid loop region [{start}, {end:?})")]
    InvalidLoopRegion { start: f64, end: Option<f64> },

    #[error("track limit reached ({0} tracks)")]
    TooManyTracks(usize),

    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("failed to load track: {0}")]
    Load(#[from] LoadError),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),
}
