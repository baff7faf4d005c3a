//! Per-track loop playback strategies.

mod dual;
mod single;

use ambi_engine::{AudioOutput, BusId, VoiceId};
use ambi_transport::{AudioArc, BackendMode, LoopRegion, TrackId};

pub use dual::DualBufferCrossfade;
pub use single::SingleBufferLoop;

use crate::config::SchedulingConfig;
use crate::crossfade::Head;
use crate::error::ScheduleError;
use crate::timers::{TimerId, TimerQueue};

/// What an armed timer belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerTarget {
    pub track: TrackId,
    pub head: Head,
}

/// Where `start` picks up in the loop region.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StartFrom {
    LoopStart,
    /// The position `pause` kept, or the loop start after `stop`.
    Resume,
    /// An absolute buffer position in seconds; outside the region means loop start.
    Position(f64),
}

/// Everything a backend may touch while handling one call.
pub struct BackendContext<'a> {
    pub output: &'a mut dyn AudioOutput,
    pub timers: &'a mut TimerQueue<TimerTarget>,
    pub track: &'a TrackId,
    pub bus: BusId,
    pub audio: &'a AudioArc,
    pub timing: &'a SchedulingConfig,
}

impl BackendContext<'_> {
    pub fn now(&self) -> f64 {
        self.output.now()
    }

    /// Arm a timer that calls back `on_timer(head)` on this track at `at`.
    pub fn arm(&mut self, at: f64, head: Head) -> TimerId {
        let target = TimerTarget {
            track: self.track.clone(),
            head,
        };
        self.timers.schedule(at, target)
    }

    pub fn disarm(&mut self, timer: TimerId) {
        self.timers.cancel(timer);
    }

    pub fn cancel_voices(&mut self, voices: &mut Vec<VoiceId>) {
        for voice in voices.drain(..) {
            self.output.cancel(voice);
        }
    }
}

pub trait PlaybackBackend: Send {
    fn mode(&self) -> BackendMode;

    fn start(&mut self, ctx: &mut BackendContext, from: StartFrom) -> Result<(), ScheduleError>;

    /// Silence the track, keeping its loop position for `StartFrom::Resume`.
    fn pause(&mut self, ctx: &mut BackendContext);

    /// Silence the track and rewind to the loop start.
    fn stop(&mut self, ctx: &mut BackendContext);

    fn set_gain(&mut self, ctx: &mut BackendContext, gain: f32) {
        ctx.output.set_bus_gain(ctx.bus, gain);
    }

    /// Change the requested crossfade. An active backend restarts from its
    /// current position. If the restart fails the backend is left idle.
    fn set_crossfade(
        &mut self,
        ctx: &mut BackendContext,
        seconds: f64,
    ) -> Result<(), ScheduleError>;

    /// Change the loop region. An active backend restarts from its current
    /// position, or the new loop start if that position falls outside. If
    /// the restart fails the backend is left idle.
    fn set_loop_region(
        &mut self,
        ctx: &mut BackendContext,
        region: LoopRegion,
    ) -> Result<(), ScheduleError>;

    fn on_timer(&mut self, _ctx: &mut BackendContext, _head: Head) {}

    /// Loop position in buffer seconds.
    fn position(&self, now: f64) -> f64;

    fn is_active(&self) -> bool;
}

/// Build the backend for `mode`. The only place the mode is inspected.
pub fn create_backend(
    mode: BackendMode,
    region: LoopRegion,
    crossfade: f64,
) -> Box<dyn PlaybackBackend> {
    match mode {
        BackendMode::SingleBufferLoop => Box::new(SingleBufferLoop::new(region, crossfade)),
        BackendMode::DualBufferCrossfade => Box::new(DualBufferCrossfade::new(region, crossfade)),
    }
}

/// Resolve a start request against `region`, given the position a previous
/// pause kept.
pub(crate) fn resolve_start(from: StartFrom, region: &LoopRegion, kept: f64) -> f64 {
    let position = match from {
        StartFrom::LoopStart => region.start(),
        StartFrom::Resume => kept,
        StartFrom::Position(secs) => secs,
    };
    if region.contains(position) {
        position
    } else {
        region.start()
    }
}

/// Requested crossfade as stored: non-finite or negative reads as none.
pub(crate) fn sanitize_crossfade(seconds: f64) -> f64 {
    if seconds.is_finite() { seconds.max(0.0) } else { 0.0 }
}
