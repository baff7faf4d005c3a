//! Audio output layer: the clock every schedule is measured against, and the
//! voice mixer that turns scheduled playback requests into samples.

mod device;
pub mod fade;
mod mixer;

use ambi_transport::{AudioArc, LoopRegion};

pub use device::DeviceOutput;
pub use mixer::{MixerCommand, MixerStatus, Voice, VoiceMixer};

/// Default number of simultaneously scheduled voices.
pub const DEFAULT_MAX_VOICES: usize = 256;

/// Bus slots in a mixer; valid bus ids are `0..MAX_BUSES`.
pub const MAX_BUSES: usize = 256;

/// Identifies one scheduled playback on an output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VoiceId(pub u64);

/// A gain stage voices are summed through; one per track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BusId(pub u32);

/// Monotonic time reference tied to the playback device, in seconds.
pub trait AudioClock {
    fn now(&self) -> f64;
}

/// What a voice does once it starts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Playback {
    /// Play `duration` seconds from the request offset, shaped by an
    /// equal-power fade in and fade out.
    Once {
        duration: f64,
        fade_in: f64,
        fade_out: f64,
    },
    /// Loop `region` forever, crossfading the last `overlap` seconds of each
    /// pass into the first `overlap` seconds of the next.
    Looped {
        region: LoopRegion,
        overlap: f64,
        fade_in: f64,
    },
}

/// A request to start `audio` at absolute clock time `at`.
#[derive(Debug, Clone)]
pub struct PlaybackRequest {
    pub audio: AudioArc,
    pub bus: BusId,
    /// Absolute clock time in seconds.
    pub at: f64,
    /// Position in the source buffer, in seconds, where playback begins.
    pub offset: f64,
    pub playback: Playback,
}

#[derive(Debug, thiserror::Error)]
pub enum OutputError {
    #[error("voice limit reached ({0} voices)")]
    VoiceLimit(usize),

    #[error("command queue is full")]
    QueueFull,

    #[error("invalid playback request: {0}")]
    InvalidRequest(&'static str),
}

/// Host clock plus output: the `now / schedulePlayback / cancel` surface
/// the playback backends drive.
pub trait AudioOutput: AudioClock {
    fn sample_rate(&self) -> u32;

    /// Schedule a voice. The returned id stays valid for `cancel` even after
    /// the voice has finished.
    fn schedule(&mut self, request: PlaybackRequest) -> Result<VoiceId, OutputError>;

    /// Stop a voice now, or drop it if it has not started yet.
    fn cancel(&mut self, voice: VoiceId);

    fn set_bus_gain(&mut self, bus: BusId, gain: f32);

    fn set_master_gain(&mut self, gain: f32);

    /// Housekeeping from the control thread (status draining, deferred frees).
    fn maintain(&mut self) {}
}

impl PlaybackRequest {
    /// Reject requests no output can honour.
    pub fn validate(&self) -> Result<(), OutputError> {
        if !self.at.is_finite() || !self.offset.is_finite() || self.offset < 0.0 {
            return Err(OutputError::InvalidRequest("non-finite or negative time"));
        }
        if self.audio.is_empty() {
            return Err(OutputError::InvalidRequest("empty buffer"));
        }
        match self.playback {
            Playback::Once { duration, .. } if !(duration.is_finite() && duration > 0.0) => {
                Err(OutputError::InvalidRequest("duration must be positive"))
            }
            _ => Ok(()),
        }
    }
}
