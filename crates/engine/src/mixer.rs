use ambi_transport::AudioArc;
use basedrop::Shared;

use crate::fade::{envelope, fade_in, fade_out};
use crate::{BusId, MAX_BUSES, Playback, PlaybackRequest, VoiceId};

/// Release applied when a sounding voice is cancelled, in seconds.
const RELEASE_SECS: f64 = 0.005;

pub enum MixerCommand {
    Start(Voice),
    Stop(VoiceId),
    BusGain(BusId, f32),
    MasterGain(f32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MixerStatus {
    Finished(VoiceId),
    Rejected(VoiceId),
}

enum VoiceKind {
    Once {
        cursor: f64, // source frames
        elapsed: u64,
        length: u64,
        fade_in: u64,
        fade_out: u64,
    },
    Looped {
        loop_start: f64, // source frames
        period: f64,     // loop length minus overlap, source frames
        overlap: f64,
        phase: f64,
        wrapped: bool,
        elapsed: u64,
        fade_in: u64,
    },
}

struct Release {
    remaining: u32,
    total: u32,
}

/// A scheduled playback as the mixer sees it: absolute start frame,
/// source cursor and envelope state.
pub struct Voice {
    id: VoiceId,
    bus: BusId,
    audio: Shared<AudioArc>,
    start_frame: u64,
    /// Source frames advanced per output frame.
    step: f64,
    kind: VoiceKind,
    release: Option<Release>,
}

impl Voice {
    /// Convert a request measured in seconds into output frames at
    /// `sample_rate` and source frames at the buffer's own rate.
    pub fn new(
        id: VoiceId,
        request: &PlaybackRequest,
        sample_rate: u32,
        audio: Shared<AudioArc>,
    ) -> Self {
        let out_rate = sample_rate as f64;
        let src_rate = audio.sample_rate() as f64;
        let to_out = |secs: f64| (secs.max(0.0) * out_rate).round() as u64;

        let kind = match request.playback {
            Playback::Once {
                duration,
                fade_in,
                fade_out,
            } => VoiceKind::Once {
                cursor: request.offset * src_rate,
                elapsed: 0,
                length: to_out(duration),
                fade_in: to_out(fade_in),
                fade_out: to_out(fade_out),
            },
            Playback::Looped {
                region,
                overlap,
                fade_in,
            } => {
                let loop_start = region.start() * src_rate;
                let loop_len = (region.duration() * src_rate).max(1.0);
                let overlap = (overlap.max(0.0) * src_rate).min(loop_len / 2.0);
                let period = (loop_len - overlap).max(1.0);
                let phase = request.offset * src_rate - loop_start;
                let phase = if phase >= 0.0 && phase < period { phase } else { 0.0 };
                VoiceKind::Looped {
                    loop_start,
                    period,
                    overlap,
                    phase,
                    wrapped: false,
                    elapsed: 0,
                    fade_in: to_out(fade_in),
                }
            }
        };

        Self {
            id,
            bus: request.bus,
            audio,
            start_frame: to_out(request.at),
            step: src_rate / out_rate,
            kind,
            release: None,
        }
    }

    pub fn id(&self) -> VoiceId {
        self.id
    }

    pub fn start_frame(&self) -> u64 {
        self.start_frame
    }

    /// Jump `frames` output frames ahead, used when a voice arrives after its
    /// start frame so it stays aligned with its schedule.
    fn skip(&mut self, frames: u64) {
        let advance = frames as f64 * self.step;
        match &mut self.kind {
            VoiceKind::Once {
                cursor, elapsed, ..
            } => {
                *cursor += advance;
                *elapsed += frames;
            }
            VoiceKind::Looped {
                period,
                phase,
                wrapped,
                elapsed,
                ..
            } => {
                let total = *phase + advance;
                if total >= *period {
                    *wrapped = true;
                }
                *phase = total % *period;
                *elapsed += frames;
            }
        }
    }

    /// Add one output frame into `frame`. Returns `false` once the voice is done.
    fn mix_frame(&mut self, frame: &mut [f32], gain: f32) -> bool {
        let release = match &mut self.release {
            Some(release) => {
                if release.remaining == 0 {
                    return false;
                }
                let t = 1.0 - release.remaining as f32 / release.total as f32;
                release.remaining -= 1;
                fade_out(t)
            }
            None => 1.0,
        };
        let audio = &*self.audio;

        match &mut self.kind {
            VoiceKind::Once {
                cursor,
                elapsed,
                length,
                fade_in,
                fade_out,
            } => {
                if *elapsed >= *length {
                    return false;
                }
                let g = envelope(*elapsed, *length, *fade_in, *fade_out) * gain * release;
                let index = *cursor as usize;
                for (ch, out) in frame.iter_mut().enumerate() {
                    *out += audio.sample_at(index, ch) * g;
                }
                *cursor += self.step;
                *elapsed += 1;
                true
            }
            VoiceKind::Looped {
                loop_start,
                period,
                overlap,
                phase,
                wrapped,
                elapsed,
                fade_in: fade_in_frames,
            } => {
                let mut g = gain * release;
                if *elapsed < *fade_in_frames {
                    g *= fade_in(*elapsed as f32 / *fade_in_frames as f32);
                }

                if *wrapped && *overlap > 0.0 && *phase < *overlap {
                    // tail of the previous pass into the head of this one
                    let t = (*phase / *overlap) as f32;
                    let (g_in, g_out) = (fade_in(t) * g, fade_out(t) * g);
                    let head = (*loop_start + *phase) as usize;
                    let tail = (*loop_start + *period + *phase) as usize;
                    for (ch, out) in frame.iter_mut().enumerate() {
                        *out += audio.sample_at(tail, ch) * g_out + audio.sample_at(head, ch) * g_in;
                    }
                } else {
                    let index = (*loop_start + *phase) as usize;
                    for (ch, out) in frame.iter_mut().enumerate() {
                        *out += audio.sample_at(index, ch) * g;
                    }
                }

                *phase += self.step;
                if *phase >= *period {
                    *phase -= *period;
                    *wrapped = true;
                }
                *elapsed += 1;
                true
            }
        }
    }
}

/// Sums scheduled voices into interleaved output, one frame at a time.
///
/// The mixer owns the frame counter the audio clock is derived from: frame
/// `n` is rendered at clock time `n / sample_rate`.
pub struct VoiceMixer {
    sample_rate: u32,
    channels: usize,
    frame: u64,
    voices: Vec<Voice>,
    max_voices: usize,
    /// Gain per bus, indexed by bus id. Sized once so the audio thread never
    /// allocates.
    buses: Vec<f32>,
    master: f32,
    release_frames: u32,
}

impl VoiceMixer {
    pub fn new(sample_rate: u32, channels: usize, max_voices: usize) -> Self {
        Self {
            sample_rate,
            channels: channels.max(1),
            frame: 0,
            voices: Vec::with_capacity(max_voices),
            max_voices,
            buses: vec![1.0; MAX_BUSES],
            master: 1.0,
            release_frames: ((sample_rate as f64 * RELEASE_SECS) as u32).max(1),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Frames rendered so far.
    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn active_voices(&self) -> usize {
        self.voices.len()
    }

    pub fn master_gain(&self) -> f32 {
        self.master
    }

    pub fn bus_gain(&self, bus: BusId) -> f32 {
        self.buses.get(bus.0 as usize).copied().unwrap_or(1.0)
    }

    pub fn handle(&mut self, command: MixerCommand) -> Option<MixerStatus> {
        match command {
            MixerCommand::Start(mut voice) => {
                if self.voices.len() >= self.max_voices {
                    return Some(MixerStatus::Rejected(voice.id));
                }
                if voice.start_frame < self.frame {
                    voice.skip(self.frame - voice.start_frame);
                }
                self.voices.push(voice);
                None
            }
            MixerCommand::Stop(id) => {
                let index = self.voices.iter().position(|v| v.id == id)?;
                if self.voices[index].start_frame > self.frame {
                    self.voices.swap_remove(index);
                    return Some(MixerStatus::Finished(id));
                }
                let voice = &mut self.voices[index];
                if voice.release.is_none() {
                    voice.release = Some(Release {
                        remaining: self.release_frames,
                        total: self.release_frames,
                    });
                }
                None
            }
            MixerCommand::BusGain(bus, gain) => {
                // out-of-range buses are dropped by the sender
                if let Some(slot) = self.buses.get_mut(bus.0 as usize) {
                    *slot = gain;
                }
                None
            }
            MixerCommand::MasterGain(gain) => {
                self.master = gain;
                None
            }
        }
    }

    /// Render interleaved frames into `out`, reporting voices that finish.
    pub fn render(&mut self, out: &mut [f32], mut on_status: impl FnMut(MixerStatus)) {
        for frame in out.chunks_mut(self.channels) {
            frame.fill(0.0);

            let mut i = 0;
            while i < self.voices.len() {
                let voice = &mut self.voices[i];
                if voice.start_frame > self.frame {
                    i += 1;
                    continue;
                }
                let gain = self
                    .buses
                    .get(voice.bus.0 as usize)
                    .copied()
                    .unwrap_or(1.0)
                    * self.master;

                if voice.mix_frame(frame, gain) {
                    i += 1;
                } else {
                    let finished = self.voices.swap_remove(i);
                    on_status(MixerStatus::Finished(finished.id));
                }
            }

            self.frame += 1;
        }
    }
}
