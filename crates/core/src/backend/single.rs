use ambi_engine::{Playback, PlaybackRequest, VoiceId};
use ambi_transport::{BackendMode, LoopRegion};

use super::{BackendContext, PlaybackBackend, StartFrom, resolve_start, sanitize_crossfade};
use crate::crossfade::CrossfadePlan;
use crate::error::ScheduleError;

/// One looped voice whose tail overlaps its own head by the crossfade.
pub struct SingleBufferLoop {
    region: LoopRegion,
    crossfade: f64,
    voice: Option<VoiceId>,
    /// Overlap the running voice was started with.
    overlap: f64,
    started_at: f64,
    /// Loop phase at `started_at`, seconds past the loop start.
    phase0: f64,
    kept: f64,
}

impl SingleBufferLoop {
    pub fn new(region: LoopRegion, crossfade: f64) -> Self {
        Self {
            region,
            crossfade: sanitize_crossfade(crossfade),
            voice: None,
            overlap: 0.0,
            started_at: 0.0,
            phase0: 0.0,
            kept: region.start(),
        }
    }

    fn cycle(&self) -> f64 {
        self.region.duration() - self.overlap
    }

    fn halt(&mut self, ctx: &mut BackendContext) {
        if let Some(voice) = self.voice.take() {
            ctx.output.cancel(voice);
        }
    }

    fn restart(
        &mut self,
        ctx: &mut BackendContext,
        change: impl FnOnce(&mut Self),
    ) -> Result<(), ScheduleError> {
        if self.voice.is_none() {
            change(self);
            self.kept = resolve_start(StartFrom::Resume, &self.region, self.kept);
            return Ok(());
        }
        let position = self.position(ctx.now());
        self.halt(ctx);
        change(self);
        self.start(ctx, StartFrom::Position(position))
    }
}

impl PlaybackBackend for SingleBufferLoop {
    fn mode(&self) -> BackendMode {
        BackendMode::SingleBufferLoop
    }

    fn start(&mut self, ctx: &mut BackendContext, from: StartFrom) -> Result<(), ScheduleError> {
        self.halt(ctx);

        let position = resolve_start(from, &self.region, self.kept);
        let plan = CrossfadePlan::new(self.region, self.crossfade, ctx.timing.crossfade_epsilon);
        self.overlap = plan.effective_crossfade();
        self.phase0 = (position - self.region.start()).rem_euclid(self.cycle());

        let at = ctx.now() + ctx.timing.safety_lead;
        let request = PlaybackRequest {
            audio: ctx.audio.clone(),
            bus: ctx.bus,
            at,
            offset: self.region.start() + self.phase0,
            playback: Playback::Looped {
                region: self.region,
                overlap: self.overlap,
                fade_in: self.overlap,
            },
        };

        match ctx.output.schedule(request) {
            Ok(voice) => {
                log::debug!(
                    "track {}: loop voice at {:.3}s from {:.3}s, overlap {:.3}s",
                    ctx.track,
                    at,
                    self.region.start() + self.phase0,
                    self.overlap
                );
                self.voice = Some(voice);
                self.started_at = at;
                Ok(())
            }
            Err(source) => {
                let err = ScheduleError::Voice(source);
                log::warn!("track {}: {}", ctx.track, err);
                Err(err)
            }
        }
    }

    fn pause(&mut self, ctx: &mut BackendContext) {
        if self.voice.is_some() {
            self.kept = self.position(ctx.now());
        }
        self.halt(ctx);
    }

    fn stop(&mut self, ctx: &mut BackendContext) {
        self.halt(ctx);
        self.kept = self.region.start();
    }

    fn set_crossfade(
        &mut self,
        ctx: &mut BackendContext,
        seconds: f64,
    ) -> Result<(), ScheduleError> {
        let seconds = sanitize_crossfade(seconds);
        self.restart(ctx, |this| this.crossfade = seconds)
    }

    fn set_loop_region(
        &mut self,
        ctx: &mut BackendContext,
        region: LoopRegion,
    ) -> Result<(), ScheduleError> {
        self.restart(ctx, |this| this.region = region)
    }

    fn position(&self, now: f64) -> f64 {
        if self.voice.is_none() {
            return self.kept;
        }
        let elapsed = now.max(self.started_at) - self.started_at;
        self.region.start() + (self.phase0 + elapsed).rem_euclid(self.cycle())
    }

    fn is_active(&self) -> bool {
        self.voice.is_some()
    }
}
