use std::collections::BTreeMap;

use ambi_engine::{AudioOutput, BusId, MAX_BUSES};
use ambi_peaks::{CancelToken, ExtractOptions, PeakExtractor, PeakInput, PeakPoll};
use ambi_transport::{AudioArc, LoopRegion, TrackId, clamp_gain};

use crate::backend::{
    BackendContext, PlaybackBackend, StartFrom, TimerTarget, create_backend, sanitize_crossfade,
};
use crate::config::EngineConfig;
use crate::error::{EngineError, LoadError, ScheduleError};
use crate::events::EngineEvent;
use crate::loader::{self, LoadRequest, Loader};
use crate::timers::TimerQueue;
use crate::track::{Player, Track, TrackSource, TrackState};

/// Which tracks a crossfade change applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrossfadeTarget {
    /// Every track, and the default for tracks loaded later.
    All,
    Track(TrackId),
}

/// Owns the track registry and drives every track's backend against one
/// audio output.
///
/// The engine is single-threaded: call [`Engine::poll`] regularly (every
/// 10-20 ms) from the owning thread to integrate background loads, advance
/// peak extraction and fire loop timers.
pub struct Engine<O: AudioOutput> {
    output: O,
    config: EngineConfig,
    tracks: BTreeMap<TrackId, Track>,
    timers: TimerQueue<TimerTarget>,
    loader: Option<Loader>,
    extractor: PeakExtractor,
    master: f32,
    crossfade: f64,
    next_bus: u32,
    /// Buses of torn-down tracks, handed out again before new ones.
    free_buses: Vec<BusId>,
    next_track: u64,
    next_generation: u64,
    events: Vec<EngineEvent>,
}

impl<O: AudioOutput> Engine<O> {
    pub fn new(mut output: O, config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        output.set_master_gain(1.0);

        log::info!(
            "engine ready: {} Hz, {:?} backend, {:.3}s crossfade",
            output.sample_rate(),
            config.backend,
            config.crossfade
        );

        Ok(Self {
            extractor: PeakExtractor::new(config.peaks.mode),
            crossfade: sanitize_crossfade(config.crossfade),
            output,
            config,
            tracks: BTreeMap::new(),
            timers: TimerQueue::new(),
            loader: None,
            master: 1.0,
            next_bus: 0,
            free_buses: Vec::new(),
            next_track: 0,
            next_generation: 0,
            events: Vec::new(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn output(&self) -> &O {
        &self.output
    }

    pub fn output_mut(&mut self) -> &mut O {
        &mut self.output
    }

    pub fn now(&self) -> f64 {
        self.output.now()
    }

    pub fn master_volume(&self) -> f32 {
        self.master
    }

    /// Crossfade given to newly loaded tracks.
    pub fn default_crossfade(&self) -> f64 {
        self.crossfade
    }

    // ── loading ─────────────────────────────────────────────────────────

    /// Decode and install a track on the calling thread. Loading into an
    /// existing id replaces that track once the new audio is ready.
    pub fn load_track(
        &mut self,
        source: TrackSource,
        id: Option<TrackId>,
    ) -> Result<TrackId, EngineError> {
        let id = self.allocate_id(id);
        match loader::prepare(source, self.output.sample_rate()) {
            Ok(audio) => {
                self.register(id.clone())?;
                self.install(&id, audio);
                Ok(id)
            }
            Err(err) => {
                log::warn!("track {id}: load failed: {err}");
                self.events.push(EngineEvent::LoadFailed {
                    id,
                    error: err.to_string(),
                });
                Err(err.into())
            }
        }
    }

    /// Queue a track for loading on the loader thread. The track is visible
    /// in the `Loading` state until `poll` picks up the result.
    pub fn begin_load(
        &mut self,
        source: TrackSource,
        id: Option<TrackId>,
    ) -> Result<TrackId, EngineError> {
        if self.loader.is_none() {
            self.loader = Some(Loader::spawn(self.output.sample_rate())?);
        }
        let id = self.allocate_id(id);
        let generation = self.register(id.clone())?;

        let request = LoadRequest {
            id: id.clone(),
            generation,
            source,
        };
        let sent = self.loader.as_ref().map(|loader| loader.request(request));
        if !matches!(sent, Some(Ok(()))) {
            if let Some(track) = self.tracks.remove(&id) {
                self.teardown(track);
            }
            self.loader = None;
            return Err(LoadError::LoaderUnavailable.into());
        }

        log::debug!("track {id}: queued for loading");
        Ok(id)
    }

    /// Queue several tracks at once.
    pub fn load_tracks(
        &mut self,
        sources: impl IntoIterator<Item = (TrackSource, Option<TrackId>)>,
    ) -> Result<Vec<TrackId>, EngineError> {
        sources
            .into_iter()
            .map(|(source, id)| self.begin_load(source, id))
            .collect()
    }

    pub fn unload_track(&mut self, id: &TrackId) -> Result<(), EngineError> {
        let track = self
            .tracks
            .remove(id)
            .ok_or_else(|| EngineError::UnknownTrack(id.clone()))?;
        self.teardown(track);
        self.events.push(EngineEvent::TrackUnloaded { id: id.clone() });
        Ok(())
    }

    // ── transport ───────────────────────────────────────────────────────

    /// Start a track from its loop start (`reset`) or where it was paused.
    /// A track that is still loading starts as soon as it is ready.
    pub fn start_track(&mut self, id: &TrackId, reset: bool) -> Result<(), EngineError> {
        let Some(track) = self.tracks.get_mut(id) else {
            log::warn!("start: unknown track {id}");
            return Err(EngineError::UnknownTrack(id.clone()));
        };
        match track.state {
            TrackState::Loading => {
                track.pending_start = true;
                log::debug!("track {id}: start pending until loaded");
                return Ok(());
            }
            TrackState::Playing if !reset => return Ok(()),
            _ => {}
        }
        let from = if reset {
            StartFrom::LoopStart
        } else {
            StartFrom::Resume
        };
        self.start_from(id, from)
    }

    /// Start a track at an absolute buffer position in seconds. Positions
    /// outside the loop region start at the loop start.
    pub fn start_track_at(&mut self, id: &TrackId, seconds: f64) -> Result<(), EngineError> {
        let track = self.track_entry(id)?;
        if !track.is_ready() {
            return Err(EngineError::NotReady(id.clone()));
        }
        self.start_from(id, StartFrom::Position(seconds))
    }

    pub fn pause_track(&mut self, id: &TrackId) -> Result<(), EngineError> {
        let track = self.track_entry(id)?;
        track.pending_start = false;
        if !track.state.is_playing() {
            return Ok(());
        }
        self.drive(id, |backend, ctx| backend.pause(ctx));
        self.set_state(id, TrackState::Paused);
        self.events.push(EngineEvent::TrackPaused { id: id.clone() });
        Ok(())
    }

    pub fn stop_track(&mut self, id: &TrackId) -> Result<(), EngineError> {
        let track = self.track_entry(id)?;
        track.pending_start = false;
        if !matches!(track.state, TrackState::Playing | TrackState::Paused) {
            return Ok(());
        }
        self.drive(id, |backend, ctx| backend.stop(ctx));
        self.set_state(id, TrackState::Stopped);
        self.events.push(EngineEvent::TrackStopped { id: id.clone() });
        Ok(())
    }

    /// Start every ready track; tracks still loading start once ready.
    pub fn play_all(&mut self, reset: bool) {
        for id in self.track_ids() {
            if let Err(err) = self.start_track(&id, reset) {
                log::warn!("track {id}: {err}");
            }
        }
    }

    /// Pause every track and cancel every pending start.
    pub fn pause_all(&mut self) {
        for id in self.track_ids() {
            let _ = self.pause_track(&id);
        }
    }

    pub fn stop_all(&mut self) {
        for id in self.track_ids() {
            let _ = self.stop_track(&id);
        }
    }

    // ── parameters ──────────────────────────────────────────────────────

    pub fn set_master_volume(&mut self, volume: f32) {
        self.master = clamp_gain(volume);
        self.output.set_master_gain(self.master);
    }

    pub fn set_track_volume(&mut self, id: &TrackId, volume: f32) -> Result<(), EngineError> {
        let gain = clamp_gain(volume);
        let track = self.track_entry(id)?;
        track.gain = gain;
        let bus = track.bus;
        if self.drive(id, |backend, ctx| backend.set_gain(ctx, gain)).is_none() {
            self.output.set_bus_gain(bus, gain);
        }
        Ok(())
    }

    /// Set the requested crossfade in seconds. Negative or non-finite values
    /// mean no crossfade. A playing track that cannot be rescheduled stops
    /// and reports `PlaybackFailed`.
    pub fn set_loop_crossfade(
        &mut self,
        target: CrossfadeTarget,
        seconds: f64,
    ) -> Result<(), EngineError> {
        let seconds = sanitize_crossfade(seconds);
        let ids = match target {
            CrossfadeTarget::All => {
                self.crossfade = seconds;
                self.track_ids()
            }
            CrossfadeTarget::Track(id) => {
                self.track_entry(&id)?;
                vec![id]
            }
        };

        for id in ids {
            if let Some(track) = self.tracks.get_mut(&id) {
                track.crossfade = seconds;
            }
            let restarted = self.drive(&id, |backend, ctx| backend.set_crossfade(ctx, seconds));
            if let Some(Err(err)) = restarted {
                self.playback_failed(&id, &err);
            }
        }
        Ok(())
    }

    /// Set the loop region, clamped to the track's duration. `end` defaults
    /// to the end of the buffer. A region that is empty after clamping is
    /// rejected and the previous region kept.
    pub fn set_loop_region(
        &mut self,
        id: &TrackId,
        start: f64,
        end: Option<f64>,
    ) -> Result<(), EngineError> {
        let track = self.track_entry(id)?;
        let duration = track
            .duration()
            .ok_or_else(|| EngineError::NotReady(id.clone()))?;
        let region = LoopRegion::clamped(duration, start, end)
            .ok_or(EngineError::InvalidLoopRegion { start, end })?;

        track.region = Some(region);
        let restarted = self.drive(id, |backend, ctx| backend.set_loop_region(ctx, region));
        if let Some(Err(err)) = restarted {
            self.playback_failed(id, &err);
        }
        log::debug!(
            "track {id}: loop region [{:.3}, {:.3})",
            region.start(),
            region.end()
        );
        Ok(())
    }

    // ── queries ─────────────────────────────────────────────────────────

    /// Loop position in buffer seconds.
    pub fn track_position(&self, id: &TrackId) -> Option<f64> {
        let player = self.tracks.get(id)?.player.as_ref()?;
        Some(player.backend.position(self.output.now()))
    }

    /// Loop position as a fraction of the loop region.
    pub fn track_progress(&self, id: &TrackId) -> Option<f64> {
        let region = self.tracks.get(id)?.region?;
        let position = self.track_position(id)?;
        Some(((position - region.start()) / region.duration()).clamp(0.0, 1.0))
    }

    pub fn track(&self, id: &TrackId) -> Option<&Track> {
        self.tracks.get(id)
    }

    pub fn tracks(&self) -> impl Iterator<Item = &Track> {
        self.tracks.values()
    }

    pub fn is_playing(&self, id: &TrackId) -> bool {
        self.tracks.get(id).is_some_and(Track::is_playing)
    }

    // ── polling ─────────────────────────────────────────────────────────

    /// One step of the scheduling thread. Returns the events raised since the
    /// previous poll, including those raised by transport calls.
    pub fn poll(&mut self) -> Vec<EngineEvent> {
        self.output.maintain();
        self.integrate_loads();
        self.advance_peaks();
        self.fire_timers();
        std::mem::take(&mut self.events)
    }

    fn integrate_loads(&mut self) {
        let mut outcomes = Vec::new();
        let mut lost = false;
        if let Some(loader) = &self.loader {
            loop {
                match loader.try_recv() {
                    Ok(Some(outcome)) => outcomes.push(outcome),
                    Ok(None) => break,
                    Err(_) => {
                        lost = true;
                        break;
                    }
                }
            }
        }

        for outcome in outcomes {
            let current = self.tracks.get(&outcome.id).map(|t| t.generation);
            if current != Some(outcome.generation) {
                log::debug!("track {}: dropping superseded load", outcome.id);
                continue;
            }
            match outcome.result {
                Ok(audio) => self.install(&outcome.id, audio),
                Err(err) => self.load_failed(&outcome.id, &err),
            }
        }

        if lost {
            // the next begin_load spawns a fresh loader
            self.loader = None;
            let stranded = self
                .tracks
                .values()
                .filter(|t| t.state == TrackState::Loading)
                .map(|t| t.id.clone())
                .collect::<Vec<_>>();
            for id in stranded {
                self.load_failed(&id, &LoadError::LoaderUnavailable);
            }
        }
    }

    /// Drop a track whose audio never became playable.
    fn load_failed(&mut self, id: &TrackId, err: &LoadError) {
        log::warn!("track {id}: load failed: {err}");
        if let Some(track) = self.tracks.remove(id) {
            self.teardown(track);
        }
        self.events.push(EngineEvent::LoadFailed {
            id: id.clone(),
            error: err.to_string(),
        });
    }

    fn advance_peaks(&mut self) {
        for track in self.tracks.values_mut() {
            let Some(task) = track.peak_task.as_mut() else {
                continue;
            };
            let id = track.id.clone();
            match task.poll() {
                PeakPoll::Pending => {}
                PeakPoll::Progress(fraction) => {
                    self.events.push(EngineEvent::PeaksProgress { id, fraction });
                }
                PeakPoll::Done(summary) => {
                    track.peak_task = None;
                    track.peaks = Some(summary.clone());
                    self.events.push(EngineEvent::PeaksReady { id, summary });
                }
                PeakPoll::Failed(error) => {
                    log::warn!("track {id}: peak extraction failed: {error}");
                    track.peak_task = None;
                    self.events.push(EngineEvent::PeaksFailed { id, error });
                }
            }
        }
    }

    fn fire_timers(&mut self) {
        let now = self.output.now();
        while let Some((_, target)) = self.timers.pop_due(now) {
            let head = target.head;
            self.drive(&target.track, |backend, ctx| backend.on_timer(ctx, head));
        }
    }

    // ── internals ───────────────────────────────────────────────────────

    fn track_ids(&self) -> Vec<TrackId> {
        self.tracks.keys().cloned().collect()
    }

    fn track_entry(&mut self, id: &TrackId) -> Result<&mut Track, EngineError> {
        self.tracks
            .get_mut(id)
            .ok_or_else(|| EngineError::UnknownTrack(id.clone()))
    }

    fn set_state(&mut self, id: &TrackId, state: TrackState) {
        if let Some(track) = self.tracks.get_mut(id) {
            track.state = state;
        }
    }

    fn allocate_id(&mut self, id: Option<TrackId>) -> TrackId {
        if let Some(id) = id {
            return id;
        }
        loop {
            let id = TrackId(format!("track-{}", self.next_track));
            self.next_track += 1;
            if !self.tracks.contains_key(&id) {
                return id;
            }
        }
    }

    /// Add a `Loading` track under `id`, replacing any existing one.
    fn register(&mut self, id: TrackId) -> Result<u64, EngineError> {
        if let Some(old) = self.tracks.remove(&id) {
            log::debug!("track {id}: replacing");
            self.teardown(old);
        }

        let bus = self.allocate_bus()?;
        let generation = self.next_generation;
        self.next_generation += 1;

        let mut track = Track::loading(id.clone(), bus, self.config.backend, self.crossfade);
        track.generation = generation;
        self.output.set_bus_gain(bus, track.gain);
        self.tracks.insert(id, track);
        Ok(generation)
    }

    fn allocate_bus(&mut self) -> Result<BusId, EngineError> {
        if let Some(bus) = self.free_buses.pop() {
            return Ok(bus);
        }
        if self.next_bus as usize >= MAX_BUSES {
            return Err(EngineError::TooManyTracks(MAX_BUSES));
        }
        let bus = BusId(self.next_bus);
        self.next_bus += 1;
        Ok(bus)
    }

    fn install(&mut self, id: &TrackId, audio: AudioArc) {
        let Some(track) = self.tracks.get_mut(id) else {
            return;
        };
        let Some(region) = LoopRegion::full(audio.duration_secs()) else {
            self.load_failed(id, &LoadError::Empty);
            return;
        };

        let backend = create_backend(track.mode, region, track.crossfade);
        let input = PeakInput::from_audio(&audio, self.config.peaks.bins);
        let options = ExtractOptions {
            chunk_size: self.config.peaks.chunk_size,
            cancel: CancelToken::new(),
        };
        track.peak_task = Some(self.extractor.spawn(input, options));

        log::info!(
            "track {id}: ready, {:.2}s at {} Hz, {} channel(s)",
            audio.duration_secs(),
            audio.sample_rate(),
            audio.channels()
        );

        track.region = Some(region);
        track.state = TrackState::Stopped;
        track.player = Some(Player { audio, backend });
        let pending = std::mem::take(&mut track.pending_start);

        self.events.push(EngineEvent::TrackReady { id: id.clone() });
        if pending {
            if let Err(err) = self.start_track(id, true) {
                log::warn!("track {id}: pending start failed: {err}");
            }
        }
    }

    fn start_from(&mut self, id: &TrackId, from: StartFrom) -> Result<(), EngineError> {
        let was_playing = self.is_playing(id);
        let result = self
            .drive(id, |backend, ctx| backend.start(ctx, from))
            .ok_or_else(|| EngineError::NotReady(id.clone()))?;
        if let Err(err) = result {
            // a restart already silenced the old schedule
            if was_playing {
                self.playback_failed(id, &err);
            }
            return Err(err.into());
        }

        self.set_state(id, TrackState::Playing);
        self.events.push(EngineEvent::TrackStarted { id: id.clone() });
        log::info!("track {id}: playing");
        Ok(())
    }

    /// A playing track's backend could not reschedule and is idle. Nothing
    /// would retry it, so the track is stopped.
    fn playback_failed(&mut self, id: &TrackId, err: &ScheduleError) {
        log::warn!("track {id}: playback failed, stopping: {err}");
        self.drive(id, |backend, ctx| backend.stop(ctx));
        self.set_state(id, TrackState::Stopped);
        self.events.push(EngineEvent::PlaybackFailed {
            id: id.clone(),
            error: err.to_string(),
        });
        self.events.push(EngineEvent::TrackStopped { id: id.clone() });
    }

    /// Run `f` against a loaded track's backend. `None` if the track is
    /// unknown or still loading.
    fn drive<R>(
        &mut self,
        id: &TrackId,
        f: impl FnOnce(&mut dyn PlaybackBackend, &mut BackendContext) -> R,
    ) -> Option<R> {
        let track = self.tracks.get_mut(id)?;
        let player = track.player.as_mut()?;
        let mut ctx = BackendContext {
            output: &mut self.output,
            timers: &mut self.timers,
            track: &track.id,
            bus: track.bus,
            audio: &player.audio,
            timing: &self.config.scheduling,
        };
        Some(f(player.backend.as_mut(), &mut ctx))
    }

    /// Silence a track that has left the registry and drop its work.
    fn teardown(&mut self, mut track: Track) {
        if let Some(player) = track.player.as_mut() {
            let mut ctx = BackendContext {
                output: &mut self.output,
                timers: &mut self.timers,
                track: &track.id,
                bus: track.bus,
                audio: &player.audio,
                timing: &self.config.scheduling,
            };
            player.backend.stop(&mut ctx);
        }
        if let Some(task) = track.peak_task.take() {
            task.cancel();
        }
        self.free_buses.push(track.bus);
        log::debug!("track {}: torn down", track.id);
    }
}

impl<O: AudioOutput> Drop for Engine<O> {
    fn drop(&mut self) {
        let tracks = std::mem::take(&mut self.tracks);
        for (_, track) in tracks {
            self.teardown(track);
        }
        self.output.maintain();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PeaksConfig;
    use ambi_engine::{AudioClock, MAX_BUSES, OutputError, PlaybackRequest, VoiceId};
    use ambi_peaks::ExtractMode;
    use ambi_render::OfflineOutput;
    use ambi_transport::BackendMode;
    use std::io::Cursor;
    use std::time::Duration;

    const RATE: u32 = 1000;

    fn config(backend: BackendMode) -> EngineConfig {
        EngineConfig {
            backend,
            peaks: PeaksConfig {
                mode: ExtractMode::Cooperative,
                bins: 8,
                chunk_size: 250,
            },
            ..Default::default()
        }
    }

    fn engine(backend: BackendMode) -> Engine<OfflineOutput> {
        Engine::new(OfflineOutput::new(RATE, 1), config(backend)).unwrap()
    }

    fn tone(seconds: f64) -> AudioArc {
        let frames = (seconds * RATE as f64) as usize;
        AudioArc::new(
            (0..frames).map(|i| (i as f32 * 0.05).sin() * 0.5).collect(),
            RATE,
            1,
        )
    }

    fn wav_bytes(frames: usize) -> Vec<u8> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: RATE,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for i in 0..frames {
                writer.write_sample((i as f32 * 0.05).sin() * 0.5).unwrap();
            }
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }

    fn load(engine: &mut Engine<OfflineOutput>, name: &str, seconds: f64) -> TrackId {
        engine
            .load_track(TrackSource::Decoded(tone(seconds)), Some(TrackId::from(name)))
            .unwrap()
    }

    /// Render and poll in 10 ms steps, as a host loop would.
    fn run(engine: &mut Engine<OfflineOutput>, seconds: f64) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        for _ in 0..(seconds / 0.01).round() as usize {
            engine.output_mut().advance(0.01);
            events.extend(engine.poll());
        }
        events
    }

    fn poll_until<O: AudioOutput>(
        engine: &mut Engine<O>,
        done: impl Fn(&EngineEvent) -> bool,
    ) -> Vec<EngineEvent> {
        let mut seen = Vec::new();
        for _ in 0..5000 {
            let events = engine.poll();
            let hit = events.iter().any(&done);
            seen.extend(events);
            if hit {
                return seen;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        panic!("event never arrived, saw {seen:?}");
    }

    #[test]
    fn test_load_track_is_ready_and_stopped() {
        let mut engine = engine(BackendMode::SingleBufferLoop);
        let id = load(&mut engine, "pad", 2.0);

        let track = engine.track(&id).unwrap();
        assert_eq!(track.state(), TrackState::Stopped);
        assert_eq!(track.loop_region(), LoopRegion::new(0.0, 2.0));
        assert_eq!(track.crossfade(), 0.05);
        assert_eq!(engine.poll()[0], EngineEvent::TrackReady { id });
    }

    #[test]
    fn test_generated_ids() {
        let mut engine = engine(BackendMode::SingleBufferLoop);

        let first = engine.load_track(tone(0.5).into(), None).unwrap();
        let second = engine.load_track(tone(0.5).into(), None).unwrap();

        assert_eq!(first, TrackId::from("track-0"));
        assert_eq!(second, TrackId::from("track-1"));
    }

    #[test]
    fn test_transport_transitions() {
        let mut engine = engine(BackendMode::SingleBufferLoop);
        let id = load(&mut engine, "pad", 2.0);
        engine.poll();

        engine.start_track(&id, true).unwrap();
        assert!(engine.is_playing(&id));
        run(&mut engine, 0.5);

        engine.pause_track(&id).unwrap();
        assert_eq!(engine.track(&id).unwrap().state(), TrackState::Paused);
        let paused_at = engine.track_position(&id).unwrap();
        assert!((paused_at - 0.45).abs() < 1e-9);

        engine.start_track(&id, false).unwrap();
        let resumed = engine.output().history().last().unwrap();
        assert!((resumed.offset - paused_at).abs() < 1e-9);

        engine.stop_track(&id).unwrap();
        assert_eq!(engine.track(&id).unwrap().state(), TrackState::Stopped);
        assert_eq!(engine.track_position(&id), Some(0.0));

        let lifecycle = engine
            .poll()
            .into_iter()
            .filter(|e| !matches!(e, EngineEvent::PeaksProgress { .. } | EngineEvent::PeaksReady { .. }))
            .collect::<Vec<_>>();
        assert_eq!(
            lifecycle,
            vec![
                EngineEvent::TrackPaused { id: id.clone() },
                EngineEvent::TrackStarted { id: id.clone() },
                EngineEvent::TrackStopped { id },
            ]
        );
    }

    #[test]
    fn test_unknown_track() {
        let mut engine = engine(BackendMode::SingleBufferLoop);
        let ghost = TrackId::from("ghost");

        assert!(matches!(
            engine.start_track(&ghost, true),
            Err(EngineError::UnknownTrack(_))
        ));
        assert!(matches!(
            engine.set_track_volume(&ghost, 0.5),
            Err(EngineError::UnknownTrack(_))
        ));
        engine.play_all(true);
    }

    #[test]
    fn test_stop_all_then_play_all_leaves_no_residue() {
        let mut engine = engine(BackendMode::DualBufferCrossfade);
        let a = load(&mut engine, "a", 1.0);
        let b = load(&mut engine, "b", 1.0);

        engine.play_all(true);
        run(&mut engine, 1.3);

        engine.stop_all();
        let stopped_at = engine.now();
        let before = engine.output().history().len();
        engine.play_all(true);
        run(&mut engine, 0.02);

        for voice in &engine.output().history()[..before] {
            let ended = voice.natural_end().is_some_and(|end| end <= stopped_at);
            assert!(ended || voice.cancelled_at.is_some());
        }
        let fresh = &engine.output().history()[before..];
        assert_eq!(fresh.len(), 4);
        assert!(fresh.iter().all(|v| v.at >= stopped_at));
        assert!(fresh.iter().filter(|v| v.offset == 0.0).count() >= 2);
        // only the four fresh voices remain in the mixer
        assert_eq!(engine.output().active_voices(), 4);
        assert!(engine.is_playing(&a) && engine.is_playing(&b));
    }

    #[test]
    fn test_failed_load_never_plays() {
        let mut engine = engine(BackendMode::DualBufferCrossfade);
        let id = engine
            .begin_load(
                TrackSource::Bytes {
                    data: b"definitely not audio".to_vec(),
                    extension: None,
                },
                Some(TrackId::from("broken")),
            )
            .unwrap();
        assert_eq!(engine.track(&id).unwrap().state(), TrackState::Loading);

        engine.play_all(true);
        let events = poll_until(&mut engine, |e| matches!(e, EngineEvent::LoadFailed { .. }));
        engine.play_all(true);

        assert!(events.iter().all(|e| !matches!(e, EngineEvent::TrackStarted { .. })));
        assert!(!engine.is_playing(&id));
        assert!(engine.track(&id).is_none());
        assert!(engine.output().history().is_empty());
    }

    #[test]
    fn test_blocking_load_failure_leaves_registry_alone() {
        let mut engine = engine(BackendMode::SingleBufferLoop);
        let result = engine.load_track(
            TrackSource::Bytes {
                data: vec![0; 64],
                extension: Some("wav".into()),
            },
            Some(TrackId::from("x")),
        );

        assert!(matches!(result, Err(EngineError::Load(_))));
        assert_eq!(engine.tracks().count(), 0);
    }

    #[test]
    fn test_pending_start_begins_when_ready() {
        let mut engine = engine(BackendMode::SingleBufferLoop);
        let id = engine
            .begin_load(TrackSource::Bytes { data: wav_bytes(1000), extension: Some("wav".into()) }, None)
            .unwrap();

        engine.play_all(true);
        assert!(engine.track(&id).unwrap().start_pending());

        let events = poll_until(&mut engine, |e| matches!(e, EngineEvent::TrackReady { .. }));
        assert!(events.contains(&EngineEvent::TrackStarted { id: id.clone() }));
        assert!(engine.is_playing(&id));
        assert!(!engine.track(&id).unwrap().start_pending());
    }

    #[test]
    fn test_pause_all_clears_pending_start() {
        let mut engine = engine(BackendMode::SingleBufferLoop);
        let id = engine
            .begin_load(TrackSource::Bytes { data: wav_bytes(1000), extension: Some("wav".into()) }, None)
            .unwrap();

        engine.play_all(true);
        engine.pause_all();
        poll_until(&mut engine, |e| matches!(e, EngineEvent::TrackReady { .. }));

        assert!(!engine.is_playing(&id));
        assert_eq!(engine.track(&id).unwrap().state(), TrackState::Stopped);
        assert!(engine.output().history().is_empty());
    }

    #[test]
    fn test_load_tracks_batch() {
        let mut engine = engine(BackendMode::SingleBufferLoop);
        let ids = engine
            .load_tracks(vec![
                (TrackSource::Bytes { data: wav_bytes(500), extension: None }, None),
                (TrackSource::Decoded(tone(0.5)), Some(TrackId::from("named"))),
            ])
            .unwrap();

        assert_eq!(ids.len(), 2);
        assert_eq!(ids[1], TrackId::from("named"));
        // one loader thread, so results arrive in request order
        poll_until(&mut engine, |e| {
            *e == EngineEvent::TrackReady {
                id: TrackId::from("named"),
            }
        });
        assert!(ids.iter().all(|id| engine.track(id).is_some_and(Track::is_ready)));
    }

    #[test]
    fn test_dead_loader_fails_stranded_tracks() {
        let mut engine = engine(BackendMode::SingleBufferLoop);
        engine.loader = Some(Loader::crashing());
        let id = engine
            .begin_load(TrackSource::Decoded(tone(0.5)), Some(TrackId::from("pad")))
            .unwrap();
        engine.play_all(true);

        let events = poll_until(&mut engine, |e| matches!(e, EngineEvent::LoadFailed { .. }));

        assert!(engine.track(&id).is_none());
        assert!(engine.loader.is_none());
        assert!(events.iter().all(|e| !matches!(e, EngineEvent::TrackStarted { .. })));

        // the next load brings up a fresh loader thread
        let again = engine.begin_load(TrackSource::Decoded(tone(0.5)), None).unwrap();
        poll_until(&mut engine, |e| matches!(e, EngineEvent::TrackReady { .. }));
        assert!(engine.track(&again).is_some_and(Track::is_ready));
    }

    #[test]
    fn test_buses_are_recycled() {
        let mut engine = engine(BackendMode::SingleBufferLoop);
        let first = load(&mut engine, "a", 0.2);
        let bus = engine.tracks[&first].bus;
        engine.unload_track(&first).unwrap();

        for _ in 0..MAX_BUSES + 10 {
            let id = load(&mut engine, "b", 0.2);
            assert_eq!(engine.tracks[&id].bus, bus);
        }
        assert_eq!(engine.next_bus, 1);

        engine.next_bus = MAX_BUSES as u32;
        assert!(matches!(
            engine.load_track(tone(0.2).into(), None),
            Err(EngineError::TooManyTracks(_))
        ));
    }

    #[test]
    fn test_volume_setters_clamp() {
        let mut engine = engine(BackendMode::SingleBufferLoop);
        let id = load(&mut engine, "pad", 1.0);
        let bus = engine.tracks[&id].bus;

        engine.set_master_volume(1.7);
        assert_eq!(engine.master_volume(), 1.0);
        assert_eq!(engine.output().master_gain(), 1.0);

        engine.set_master_volume(f32::NAN);
        assert_eq!(engine.master_volume(), 0.0);

        engine.set_track_volume(&id, -0.3).unwrap();
        assert_eq!(engine.track(&id).unwrap().gain(), 0.0);
        assert_eq!(engine.output().bus_gain(bus), 0.0);

        engine.set_track_volume(&id, 0.4).unwrap();
        assert_eq!(engine.output().bus_gain(bus), 0.4);
    }

    #[test]
    fn test_crossfade_for_all_tracks() {
        let mut engine = engine(BackendMode::DualBufferCrossfade);
        let a = load(&mut engine, "a", 1.0);
        let b = load(&mut engine, "b", 1.0);

        engine.set_loop_crossfade(CrossfadeTarget::All, 0.2).unwrap();
        assert_eq!(engine.track(&a).unwrap().crossfade(), 0.2);
        assert_eq!(engine.track(&b).unwrap().crossfade(), 0.2);
        assert_eq!(engine.default_crossfade(), 0.2);

        engine.set_loop_crossfade(CrossfadeTarget::Track(a.clone()), -4.0).unwrap();
        assert_eq!(engine.track(&a).unwrap().crossfade(), 0.0);
        assert_eq!(engine.track(&b).unwrap().crossfade(), 0.2);

        let c = load(&mut engine, "c", 1.0);
        assert_eq!(engine.track(&c).unwrap().crossfade(), 0.2);
    }

    #[test]
    fn test_oversized_crossfade_is_clamped_in_schedule() {
        let mut engine = engine(BackendMode::DualBufferCrossfade);
        let id = load(&mut engine, "a", 1.0);
        engine.set_loop_crossfade(CrossfadeTarget::Track(id.clone()), 30.0).unwrap();

        engine.start_track(&id, true).unwrap();
        run(&mut engine, 3.0);

        let history = engine.output().history();
        assert!(history.len() >= 5);
        for voice in history {
            match voice.playback {
                ambi_engine::Playback::Once { fade_in, .. } => assert!(fade_in <= 0.5),
                _ => panic!("dual backend issued a looped voice"),
            }
        }
    }

    #[test]
    fn test_loop_region_is_clamped() {
        let mut engine = engine(BackendMode::SingleBufferLoop);
        let id = load(&mut engine, "pad", 2.0);

        engine.set_loop_region(&id, 0.5, Some(9.0)).unwrap();
        assert_eq!(engine.track(&id).unwrap().loop_region(), LoopRegion::new(0.5, 2.0));

        engine.set_loop_region(&id, 1.0, None).unwrap();
        assert_eq!(engine.track(&id).unwrap().loop_region(), LoopRegion::new(1.0, 2.0));

        let result = engine.set_loop_region(&id, 1.5, Some(1.0));
        assert!(matches!(result, Err(EngineError::InvalidLoopRegion { .. })));
        assert_eq!(engine.track(&id).unwrap().loop_region(), LoopRegion::new(1.0, 2.0));
    }

    #[test]
    fn test_track_progress() {
        let mut engine = engine(BackendMode::SingleBufferLoop);
        let id = load(&mut engine, "pad", 2.0);
        engine.set_loop_crossfade(CrossfadeTarget::All, 0.0).unwrap();

        assert_eq!(engine.track_progress(&id), Some(0.0));
        engine.start_track(&id, true).unwrap();
        run(&mut engine, 1.05);

        let progress = engine.track_progress(&id).unwrap();
        assert!((progress - 0.5).abs() < 1e-6, "progress {progress}");
    }

    #[test]
    fn test_tracks_are_independent() {
        let mut engine = engine(BackendMode::DualBufferCrossfade);
        let a = load(&mut engine, "a", 1.0);
        let b = load(&mut engine, "b", 1.0);
        engine.play_all(true);
        run(&mut engine, 0.5);

        engine.stop_track(&a).unwrap();
        run(&mut engine, 3.0);

        assert!(!engine.is_playing(&a));
        assert!(engine.is_playing(&b));
        let bus_b = engine.tracks[&b].bus;
        let late = engine
            .output()
            .history()
            .iter()
            .filter(|v| v.at > 1.0)
            .collect::<Vec<_>>();
        assert!(!late.is_empty());
        assert!(late.iter().all(|v| v.bus == bus_b));
    }

    #[test]
    fn test_unload_cancels_schedule() {
        let mut engine = engine(BackendMode::DualBufferCrossfade);
        let id = load(&mut engine, "a", 1.0);
        engine.start_track(&id, true).unwrap();
        run(&mut engine, 0.3);

        engine.unload_track(&id).unwrap();
        assert!(engine.poll().contains(&EngineEvent::TrackUnloaded { id: id.clone() }));
        let issued = engine.output().history().len();
        let events = run(&mut engine, 3.0);

        assert!(engine.timers.is_empty());
        assert_eq!(engine.output().history().len(), issued);
        assert_eq!(engine.output().active_voices(), 0);
        assert!(events.iter().all(|e| e.track() != &id));
    }

    #[test]
    fn test_peaks_arrive_through_poll() {
        let mut engine = engine(BackendMode::SingleBufferLoop);
        let id = load(&mut engine, "pad", 1.0);

        let events = run(&mut engine, 0.1);

        let progress = events
            .iter()
            .filter(|e| matches!(e, EngineEvent::PeaksProgress { .. }))
            .count();
        assert!(progress >= 1);
        assert!(events.iter().any(|e| matches!(e, EngineEvent::PeaksReady { .. })));
        assert_eq!(engine.track(&id).unwrap().peaks().map(|p| p.len()), Some(8));
    }

    /// Refuses every voice while `failing` is set.
    struct FlakyOutput {
        inner: OfflineOutput,
        failing: bool,
    }

    impl AudioClock for FlakyOutput {
        fn now(&self) -> f64 {
            self.inner.now()
        }
    }

    impl AudioOutput for FlakyOutput {
        fn sample_rate(&self) -> u32 {
            self.inner.sample_rate()
        }

        fn schedule(&mut self, request: PlaybackRequest) -> Result<VoiceId, OutputError> {
            if self.failing {
                return Err(OutputError::QueueFull);
            }
            self.inner.schedule(request)
        }

        fn cancel(&mut self, voice: VoiceId) {
            self.inner.cancel(voice)
        }

        fn set_bus_gain(&mut self, bus: BusId, gain: f32) {
            self.inner.set_bus_gain(bus, gain)
        }

        fn set_master_gain(&mut self, gain: f32) {
            self.inner.set_master_gain(gain)
        }
    }

    fn flaky_run(engine: &mut Engine<FlakyOutput>, seconds: f64) {
        for _ in 0..(seconds / 0.01).round() as usize {
            engine.output_mut().inner.advance(0.01);
            engine.poll();
        }
    }

    #[test]
    fn test_head_failures_are_absorbed() {
        let output = FlakyOutput {
            inner: OfflineOutput::new(RATE, 1),
            failing: false,
        };
        let mut engine = Engine::new(output, config(BackendMode::DualBufferCrossfade)).unwrap();
        let id = engine.load_track(tone(1.0).into(), None).unwrap();
        engine.start_track(&id, true).unwrap();
        flaky_run(&mut engine, 0.3);

        engine.output_mut().failing = true;
        flaky_run(&mut engine, 2.0);
        assert!(engine.is_playing(&id));
        let during = engine.output().inner.history().len();
        assert_eq!(during, 2);

        engine.output_mut().failing = false;
        flaky_run(&mut engine, 2.0);
        assert!(engine.is_playing(&id));
        assert!(engine.output().inner.history().len() > during);
    }

    #[test]
    fn test_start_failure_keeps_prior_state() {
        let output = FlakyOutput {
            inner: OfflineOutput::new(RATE, 1),
            failing: true,
        };
        let mut engine = Engine::new(output, config(BackendMode::DualBufferCrossfade)).unwrap();
        let id = engine.load_track(tone(1.0).into(), None).unwrap();

        let result = engine.start_track(&id, true);

        assert!(matches!(result, Err(EngineError::Schedule(_))));
        assert_eq!(engine.track(&id).unwrap().state(), TrackState::Stopped);
        assert!(engine.timers.is_empty());
    }

    #[test]
    fn test_failed_restart_stops_playing_track() {
        for backend in [BackendMode::SingleBufferLoop, BackendMode::DualBufferCrossfade] {
            let output = FlakyOutput {
                inner: OfflineOutput::new(RATE, 1),
                failing: false,
            };
            let mut engine = Engine::new(output, config(backend)).unwrap();
            let id = engine.load_track(tone(1.0).into(), None).unwrap();
            engine.start_track(&id, true).unwrap();
            flaky_run(&mut engine, 0.3);

            engine.output_mut().failing = true;
            engine
                .set_loop_crossfade(CrossfadeTarget::Track(id.clone()), 0.2)
                .unwrap();

            assert_eq!(engine.track(&id).unwrap().state(), TrackState::Stopped);
            assert!(engine.timers.is_empty());
            let events = engine.poll();
            assert!(events.iter().any(|e| matches!(e, EngineEvent::PlaybackFailed { .. })));
            assert!(events.contains(&EngineEvent::TrackStopped { id: id.clone() }));

            // a later start works once the output recovers
            engine.output_mut().failing = false;
            engine.start_track(&id, false).unwrap();
            assert!(engine.is_playing(&id));
        }
    }

    #[test]
    fn test_failed_reset_stops_playing_track() {
        let output = FlakyOutput {
            inner: OfflineOutput::new(RATE, 1),
            failing: false,
        };
        let mut engine = Engine::new(output, config(BackendMode::SingleBufferLoop)).unwrap();
        let id = engine.load_track(tone(1.0).into(), None).unwrap();
        engine.start_track(&id, true).unwrap();
        flaky_run(&mut engine, 0.3);

        engine.output_mut().failing = true;
        let result = engine.start_track(&id, true);

        assert!(matches!(result, Err(EngineError::Schedule(_))));
        assert!(!engine.is_playing(&id));
        assert!(engine.poll().contains(&EngineEvent::TrackStopped { id: id.clone() }));
        engine.output_mut().inner.advance(0.05);
        assert_eq!(engine.output().inner.active_voices(), 0);
    }

    #[test]
    fn test_drop_silences_output() {
        let mut engine = engine(BackendMode::SingleBufferLoop);
        let id = load(&mut engine, "pad", 1.0);
        engine.start_track(&id, true).unwrap();
        run(&mut engine, 0.2);
        assert_eq!(engine.output().active_voices(), 1);

        // teardown runs for every track, as Drop does
        let tracks = std::mem::take(&mut engine.tracks);
        for (_, track) in tracks {
            engine.teardown(track);
        }
        engine.output_mut().advance(0.01);
        assert_eq!(engine.output().active_voices(), 0);
    }
}
