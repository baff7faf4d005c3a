//! Offline output: the same voice mixer the device uses, driven by a clock
//! that only moves when told to.

use std::path::Path;

use ambi_engine::{
    AudioClock, AudioOutput, BusId, DEFAULT_MAX_VOICES, MixerCommand, MixerStatus, OutputError,
    Playback, PlaybackRequest, Voice, VoiceId, VoiceMixer,
};
use ambi_transport::AudioArc;
use basedrop::{Collector, Shared};

const BLOCK_FRAMES: usize = 1024;

/// A voice as it was scheduled, kept for inspection after the fact.
#[derive(Debug, Clone)]
pub struct ScheduledVoice {
    pub id: VoiceId,
    pub bus: BusId,
    pub at: f64,
    pub offset: f64,
    pub playback: Playback,
    /// Clock time the voice was cancelled, if it was.
    pub cancelled_at: Option<f64>,
}

impl ScheduledVoice {
    /// Clock time the voice stops on its own, `None` for loops.
    pub fn natural_end(&self) -> Option<f64> {
        match self.playback {
            Playback::Once { duration, .. } => Some(self.at + duration),
            Playback::Looped { .. } => None,
        }
    }
}

pub struct OfflineOutput {
    mixer: VoiceMixer,
    collector: Collector,
    max_voices: usize,
    next_voice: u64,
    rendered: Vec<f32>,
    history: Vec<ScheduledVoice>,
    block: Vec<f32>,
}

impl OfflineOutput {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self::with_max_voices(sample_rate, channels, DEFAULT_MAX_VOICES)
    }

    pub fn with_max_voices(sample_rate: u32, channels: u16, max_voices: usize) -> Self {
        let channels = channels.max(1) as usize;
        Self {
            mixer: VoiceMixer::new(sample_rate, channels, max_voices),
            collector: Collector::new(),
            max_voices,
            next_voice: 0,
            rendered: Vec::new(),
            history: Vec::new(),
            block: vec![0.0; BLOCK_FRAMES * channels],
        }
    }

    pub fn channels(&self) -> u16 {
        self.mixer.channels() as u16
    }

    /// Render `secs` of audio, moving the clock forward by the same amount.
    pub fn advance(&mut self, secs: f64) {
        let frames = (secs.max(0.0) * self.mixer.sample_rate() as f64).round() as u64;
        self.advance_frames(frames);
    }

    pub fn advance_frames(&mut self, frames: u64) {
        let channels = self.mixer.channels();
        let mut remaining = frames as usize;
        while remaining > 0 {
            let n = remaining.min(BLOCK_FRAMES);
            let block = &mut self.block[..n * channels];
            self.mixer.render(block, |_| {});
            self.rendered.extend_from_slice(block);
            remaining -= n;
        }
    }

    /// Everything rendered so far, interleaved.
    pub fn rendered(&self) -> &[f32] {
        &self.rendered
    }

    pub fn to_audio(&self) -> AudioArc {
        AudioArc::new(
            self.rendered.clone(),
            self.mixer.sample_rate(),
            self.mixer.channels() as u16,
        )
    }

    /// Every voice ever scheduled, in scheduling order.
    pub fn history(&self) -> &[ScheduledVoice] {
        &self.history
    }

    pub fn active_voices(&self) -> usize {
        self.mixer.active_voices()
    }

    pub fn master_gain(&self) -> f32 {
        self.mixer.master_gain()
    }

    pub fn bus_gain(&self, bus: BusId) -> f32 {
        self.mixer.bus_gain(bus)
    }
}

impl AudioClock for OfflineOutput {
    fn now(&self) -> f64 {
        self.mixer.frame() as f64 / self.mixer.sample_rate() as f64
    }
}

impl AudioOutput for OfflineOutput {
    fn sample_rate(&self) -> u32 {
        self.mixer.sample_rate()
    }

    fn schedule(&mut self, request: PlaybackRequest) -> Result<VoiceId, OutputError> {
        request.validate()?;

        let id = VoiceId(self.next_voice);
        self.next_voice += 1;

        let audio = Shared::new(&self.collector.handle(), request.audio.clone());
        let voice = Voice::new(id, &request, self.mixer.sample_rate(), audio);
        if let Some(MixerStatus::Rejected(_)) = self.mixer.handle(MixerCommand::Start(voice)) {
            return Err(OutputError::VoiceLimit(self.max_voices));
        }

        self.history.push(ScheduledVoice {
            id,
            bus: request.bus,
            at: request.at,
            offset: request.offset,
            playback: request.playback,
            cancelled_at: None,
        });
        Ok(id)
    }

    fn cancel(&mut self, voice: VoiceId) {
        let now = self.now();
        if let Some(entry) = self.history.iter_mut().rev().find(|v| v.id == voice) {
            entry.cancelled_at.get_or_insert(now);
        }
        self.mixer.handle(MixerCommand::Stop(voice));
    }

    fn set_bus_gain(&mut self, bus: BusId, gain: f32) {
        self.mixer.handle(MixerCommand::BusGain(bus, gain));
    }

    fn set_master_gain(&mut self, gain: f32) {
        self.mixer.handle(MixerCommand::MasterGain(gain));
    }

    fn maintain(&mut self) {
        self.collector.collect();
    }
}

pub fn write_wav(buffer: &AudioArc, path: &Path) -> anyhow::Result<()> {
    let spec = hound::WavSpec {
        channels: buffer.channels(),
        sample_rate: buffer.sample_rate(),
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };

    let mut writer = hound::WavWriter::create(path, spec)?;

    for &sample in buffer.samples() {
        writer.write_sample(sample)?;
    }

    writer.finalize()?;
    Ok(())
}
