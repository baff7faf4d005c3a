use ambi_transport::{BackendMode, LoopRegion};

use super::{BackendContext, PlaybackBackend, StartFrom, resolve_start, sanitize_crossfade};
use crate::crossfade::{CrossfadePlan, CrossfadeScheduler, Head, SchedulerState};
use crate::error::ScheduleError;

/// Two alternating heads driven by a [`CrossfadeScheduler`].
pub struct DualBufferCrossfade {
    region: LoopRegion,
    crossfade: f64,
    scheduler: CrossfadeScheduler,
    kept: f64,
}

impl DualBufferCrossfade {
    pub fn new(region: LoopRegion, crossfade: f64) -> Self {
        Self {
            region,
            crossfade: sanitize_crossfade(crossfade),
            scheduler: CrossfadeScheduler::new(),
            kept: region.start(),
        }
    }

    pub fn scheduler(&self) -> &CrossfadeScheduler {
        &self.scheduler
    }

    fn restart(
        &mut self,
        ctx: &mut BackendContext,
        change: impl FnOnce(&mut Self),
    ) -> Result<(), ScheduleError> {
        if !self.is_active() {
            change(self);
            self.kept = resolve_start(StartFrom::Resume, &self.region, self.kept);
            return Ok(());
        }
        let position = self.position(ctx.now());
        self.scheduler.cancel(ctx);
        change(self);
        self.start(ctx, StartFrom::Position(position))
    }
}

impl PlaybackBackend for DualBufferCrossfade {
    fn mode(&self) -> BackendMode {
        BackendMode::DualBufferCrossfade
    }

    fn start(&mut self, ctx: &mut BackendContext, from: StartFrom) -> Result<(), ScheduleError> {
        let position = resolve_start(from, &self.region, self.kept);
        let plan = CrossfadePlan::new(self.region, self.crossfade, ctx.timing.crossfade_epsilon);
        self.scheduler.start(ctx, plan, position)
    }

    fn pause(&mut self, ctx: &mut BackendContext) {
        if self.is_active() {
            self.kept = self.position(ctx.now());
        }
        self.scheduler.cancel(ctx);
    }

    fn stop(&mut self, ctx: &mut BackendContext) {
        self.scheduler.cancel(ctx);
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

    fn on_timer(&mut self, ctx: &mut BackendContext, head: Head) {
        self.scheduler.on_timer(ctx, head);
    }

    fn position(&self, now: f64) -> f64 {
        self.scheduler.position(now).unwrap_or(self.kept)
    }

    fn is_active(&self) -> bool {
        self.scheduler.state() != SchedulerState::Idle
    }
}
