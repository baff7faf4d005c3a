//! Two-head loop scheduling.
//!
//! Heads A and B play the same loop region alternately. Cycle `k` of the
//! loop starts at `anchor + k * (L - c')` and belongs to head A when `k` is
//! even, head B when odd, so each head restarts every `2 * (L - c')` and the
//! last `c'` seconds of one cycle overlap the first `c'` of the next.

use std::fmt;

use ambi_engine::{Playback, PlaybackRequest, VoiceId};
use ambi_transport::LoopRegion;

use crate::backend::BackendContext;
use crate::error::ScheduleError;
use crate::timers::TimerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Head {
    A,
    B,
}

impl Head {
    fn of_cycle(cycle: u64) -> Self {
        if cycle % 2 == 0 { Head::A } else { Head::B }
    }

    fn index(self) -> usize {
        match self {
            Head::A => 0,
            Head::B => 1,
        }
    }
}

impl fmt::Display for Head {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Head::A => f.write_str("A"),
            Head::B => f.write_str("B"),
        }
    }
}

/// The timing of one loop region at one crossfade.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CrossfadePlan {
    region: LoopRegion,
    crossfade: f64,
    period: f64,
}

impl CrossfadePlan {
    /// Clamp `requested` to `L/2 - epsilon` (never below 0) and derive the
    /// per-head period.
    ///
    /// ```
    /// use ambi_core::CrossfadePlan;
    /// use ambi_transport::LoopRegion;
    ///
    /// let region = LoopRegion::new(0.0, 2.0).unwrap();
    /// let plan = CrossfadePlan::new(region, 5.0, 0.005);
    /// assert!((plan.effective_crossfade() - 0.995).abs() < 1e-9);
    /// assert!((plan.period() - 2.01).abs() < 1e-9);
    /// ```
    pub fn new(region: LoopRegion, requested: f64, epsilon: f64) -> Self {
        let duration = region.duration();
        let requested = if requested.is_finite() { requested.max(0.0) } else { 0.0 };
        let crossfade = requested.min(duration / 2.0 - epsilon).max(0.0);
        let period = duration.max(2.0 * (duration - crossfade));
        Self {
            region,
            crossfade,
            period,
        }
    }

    pub fn region(&self) -> LoopRegion {
        self.region
    }

    pub fn loop_duration(&self) -> f64 {
        self.region.duration()
    }

    pub fn effective_crossfade(&self) -> f64 {
        self.crossfade
    }

    /// Interval between successive starts of the same head.
    pub fn period(&self) -> f64 {
        self.period
    }

    /// Delay from a head A start to the following head B start, `L - c'`.
    pub fn b_offset(&self) -> f64 {
        self.loop_duration() - self.crossfade
    }

    pub fn is_hard_cut(&self) -> bool {
        self.crossfade <= 0.0
    }

    /// Start of loop cycle `cycle`, counting both heads.
    pub fn cycle_start(&self, anchor: f64, cycle: u64) -> f64 {
        anchor + cycle as f64 * self.b_offset()
    }

    /// The `n`th start of `head`.
    pub fn head_start(&self, anchor: f64, head: Head, n: u64) -> f64 {
        let offset = match head {
            Head::A => 0.0,
            Head::B => self.b_offset(),
        };
        anchor + offset + n as f64 * self.period
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    /// Running; the head whose start is issued next.
    Scheduled(Head),
}

#[derive(Debug, Default)]
struct HeadChain {
    timer: Option<TimerId>,
    next_cycle: u64,
    /// The last voices this head issued; older ones have finished.
    voices: Vec<VoiceId>,
}

#[derive(Debug, Default)]
pub struct CrossfadeScheduler {
    plan: Option<CrossfadePlan>,
    anchor: f64,
    t0: f64,
    heads: [HeadChain; 2],
}

impl CrossfadeScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> SchedulerState {
        if self.plan.is_none() {
            return SchedulerState::Idle;
        }
        let next = self.heads[0].next_cycle.min(self.heads[1].next_cycle);
        SchedulerState::Scheduled(Head::of_cycle(next))
    }

    pub fn plan(&self) -> Option<&CrossfadePlan> {
        self.plan.as_ref()
    }

    /// Clock time loop cycle 0 starts at, while running.
    pub fn anchor(&self) -> Option<f64> {
        self.plan.map(|_| self.anchor)
    }

    /// Start both heads so that the loop is heard from `position` (buffer
    /// seconds) at `now + safety_lead`. Anything already scheduled is
    /// cancelled first.
    pub fn start(
        &mut self,
        ctx: &mut BackendContext,
        plan: CrossfadePlan,
        position: f64,
    ) -> Result<(), ScheduleError> {
        self.cancel(ctx);

        let t0 = ctx.now() + ctx.timing.safety_lead;
        let phase = (position - plan.region().start()).rem_euclid(plan.b_offset());
        self.anchor = t0 - phase;
        self.t0 = t0;
        self.plan = Some(plan);
        self.heads[0].next_cycle = 0;
        self.heads[1].next_cycle = 1;

        log::debug!(
            "track {}: dual schedule at {:.3}s, crossfade {:.3}s, period {:.3}s",
            ctx.track,
            t0,
            plan.effective_crossfade(),
            plan.period()
        );

        let a = self.issue(ctx, Head::A);
        let b = self.issue(ctx, Head::B);
        match (a, b) {
            (Err(err), Err(_)) => {
                self.cancel(ctx);
                Err(err)
            }
            _ => Ok(()),
        }
    }

    /// A head's timer fired: hand its next cycle to the output and re-arm.
    pub fn on_timer(&mut self, ctx: &mut BackendContext, head: Head) {
        if self.plan.is_none() {
            return;
        }
        self.heads[head.index()].timer = None;
        // failures are logged in issue and retried next cycle
        let _ = self.issue(ctx, head);
    }

    /// Cancel both chains and silence every voice they issued.
    pub fn cancel(&mut self, ctx: &mut BackendContext) {
        for chain in &mut self.heads {
            if let Some(timer) = chain.timer.take() {
                ctx.disarm(timer);
            }
            ctx.cancel_voices(&mut chain.voices);
            chain.next_cycle = 0;
        }
        self.plan = None;
    }

    /// Loop position heard at `now`, in buffer seconds.
    pub fn position(&self, now: f64) -> Option<f64> {
        let plan = self.plan?;
        let elapsed = now.max(self.t0) - self.anchor;
        Some(plan.region().start() + elapsed.rem_euclid(plan.b_offset()))
    }

    fn issue(&mut self, ctx: &mut BackendContext, head: Head) -> Result<(), ScheduleError> {
        let Some(plan) = self.plan else {
            return Ok(());
        };
        let (anchor, t0) = (self.anchor, self.t0);
        let now = ctx.now();
        let duration = plan.loop_duration();
        let chain = &mut self.heads[head.index()];

        let mut cycle = chain.next_cycle;
        while plan.cycle_start(anchor, cycle) + duration <= now {
            cycle += 2;
        }
        if cycle != chain.next_cycle {
            log::debug!(
                "track {}: head {} skipped {} stale cycle(s)",
                ctx.track,
                head,
                (cycle - chain.next_cycle) / 2
            );
        }

        // only the first cycle of a resumed schedule can begin before t0
        let nominal = plan.cycle_start(anchor, cycle);
        let lag = (t0 - nominal).max(0.0);
        let crossfade = plan.effective_crossfade();
        let request = PlaybackRequest {
            audio: ctx.audio.clone(),
            bus: ctx.bus,
            at: nominal + lag,
            offset: plan.region().start() + lag,
            playback: Playback::Once {
                duration: duration - lag,
                fade_in: crossfade,
                fade_out: crossfade,
            },
        };
        let result = ctx.output.schedule(request);

        chain.next_cycle = cycle + 2;
        let next = plan.cycle_start(anchor, cycle + 2);
        let fire_at = (next - ctx.timing.schedule_ahead).max(plan.cycle_start(anchor, cycle + 1));
        chain.timer = Some(ctx.arm(fire_at, head));

        match result {
            Ok(voice) => {
                chain.voices.push(voice);
                if chain.voices.len() > 2 {
                    chain.voices.remove(0);
                }
                Ok(())
            }
            Err(source) => {
                let err = ScheduleError::Head { head, source };
                log::warn!("track {}: {}", ctx.track, err);
                Err(err)
            }
        }
    }
}
